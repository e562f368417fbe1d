//! PHY sequencing.
//!
//! The power-state walk in [`DptxSession::phy_configure_link`] is mandated
//! by the PHY: ref-clock power-down, PHY-clock power-down, rate/lane
//! programming, then power-on, with a busy-clear wait after every power
//! state write. Do not reorder it.

use crate::hal::{DptxHal, SocOps};
use crate::link::{LaneCount, LinkRate, TrainingPattern};
use crate::regs::*;
use crate::session::DptxSession;
use crate::{Error, Result};

const PHY_BUSY_POLL_TRIES: u32 = 500;
const PHY_BUSY_POLL_INTERVAL_US: u32 = 10;

impl<H: DptxHal, S: SocOps> DptxSession<H, S> {
    fn phy_wait_busy_clear(&mut self) -> Result<()> {
        for _ in 0..PHY_BUSY_POLL_TRIES {
            self.check_plugged()?;
            if self.hal.read_reg(REG_PHYIF_CTRL) & PHYIF_BUSY == 0 {
                return Ok(());
            }
            self.hal.delay_us(PHY_BUSY_POLL_INTERVAL_US);
        }
        Err(Error::HardwareTimeout("PHY busy bit stuck"))
    }

    fn phy_set_power_state(&mut self, state: u32) -> Result<()> {
        let mut ctrl = self.hal.read_reg(REG_PHYIF_CTRL);
        ctrl = (ctrl & !PHYIF_PWRDOWN_MASK) | (state << PHYIF_PWRDOWN_SHIFT);
        self.hal.write_reg(REG_PHYIF_CTRL, ctrl);
        self.phy_wait_busy_clear()
    }

    /// Full lane/rate reconfiguration with the required power sequence.
    pub(crate) fn phy_configure_link(&mut self, rate: LinkRate, lanes: LaneCount) -> Result<()> {
        self.phy_set_power_state(PHY_POWER_DOWN_REF_CLOCK)?;
        self.phy_set_power_state(PHY_POWER_DOWN_PHY_CLOCK)?;

        let mut ctrl = self.hal.read_reg(REG_PHYIF_CTRL);
        ctrl &= !(PHYIF_LANES_MASK | PHYIF_RATE_MASK);
        ctrl |= lanes.phy_sel() << PHYIF_LANES_SHIFT;
        ctrl |= rate.phy_sel() << PHYIF_RATE_SHIFT;
        self.hal.write_reg(REG_PHYIF_CTRL, ctrl);

        self.phy_set_power_state(PHY_POWER_ON)
    }

    pub(crate) fn phy_set_training_pattern(&mut self, pattern: Option<TrainingPattern>) {
        let sel = pattern.map_or(0, TrainingPattern::phy_sel);
        self.hal.write_reg(REG_PHY_TPS_SEL, sel);
    }

    /// Pushes the current per-lane swing/pre-emphasis into the PHY.
    pub(crate) fn phy_write_lane_drive(&mut self) {
        for lane in 0..usize::from(self.link.lanes.count()) {
            let value = u32::from(self.link.voltage_swing[lane]) << LANE_DRIVE_VSWING_SHIFT
                | u32::from(self.link.pre_emphasis[lane]) << LANE_DRIVE_PREEMPH_SHIFT;
            self.hal.write_reg(phy_lane_drive(lane), value);
        }
    }

    /// Enables or disables the transmitters of the active lanes. Disabling
    /// always covers all four lanes so teardown never leaves a stray lane
    /// driving the wire.
    pub(crate) fn phy_set_transmitters(&mut self, enable: bool) {
        let mut ctrl = self.hal.read_reg(REG_PHYIF_CTRL);
        ctrl &= !PHYIF_XMIT_EN_MASK;
        if enable {
            let lane_bits = (1u32 << self.link.lanes.count()) - 1;
            ctrl |= lane_bits << PHYIF_XMIT_EN_SHIFT;
        }
        self.hal.write_reg(REG_PHYIF_CTRL, ctrl);
    }
}
