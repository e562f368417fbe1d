//! Link training state machine.
//!
//! Training is a driving loop over an explicit [`LinkState`]: bring-up
//! programs the PHY and the sink's link-configuration registers, clock
//! recovery runs TPS1 with swing/pre-emphasis adjustment, channel
//! equalization runs the best training pattern both ends support. A failed
//! phase consults the fallback policy and re-enters bring-up with a reduced
//! (rate, lane) combination; the walk is strictly decreasing in
//! (lane count, rate) lexicographic order, so it terminates after at most
//! the 12 combinations the lattice holds.

use tracing::{debug, warn};

use crate::dpcd::*;
use crate::hal::{DptxHal, SocOps};
use crate::regs::{CCTRL_CORE_EN, CCTRL_ENHANCED_FRAMING_EN, CCTRL_SSC_EN, REG_CCTRL, REG_SOFT_RESET, SOFT_RESET_CORE};
use crate::session::DptxSession;
use crate::{Error, Result};

pub const MAX_VOLTAGE_SWING: u8 = 3;
pub const MAX_PRE_EMPHASIS: u8 = 3;

/// Delay between TPS1 status polls during clock recovery.
const CR_POLL_DELAY_US: u32 = 100;
/// Adjust-and-repoll budget for each phase.
const CR_ADJUST_TRIES: u32 = 5;
const EQ_ADJUST_TRIES: u32 = 5;

/// Main link rates, in DPCD LINK_BW_SET encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkRate {
    /// 1.62 Gbps per lane.
    Rbr,
    /// 2.7 Gbps per lane.
    Hbr,
    /// 5.4 Gbps per lane.
    Hbr2,
    /// 8.1 Gbps per lane.
    Hbr3,
}

impl LinkRate {
    pub fn bw_code(self) -> u8 {
        match self {
            LinkRate::Rbr => 0x06,
            LinkRate::Hbr => 0x0A,
            LinkRate::Hbr2 => 0x14,
            LinkRate::Hbr3 => 0x1E,
        }
    }

    /// Highest standard rate not above the sink's advertised MAX_LINK_RATE.
    /// Intermediate (eDP) codes floor to the nearest mainline rate.
    pub fn from_bw_code_floor(code: u8) -> LinkRate {
        match code {
            c if c >= 0x1E => LinkRate::Hbr3,
            c if c >= 0x14 => LinkRate::Hbr2,
            c if c >= 0x0A => LinkRate::Hbr,
            _ => LinkRate::Rbr,
        }
    }

    /// PHY rate-select field value.
    pub(crate) fn phy_sel(self) -> u32 {
        match self {
            LinkRate::Rbr => 0,
            LinkRate::Hbr => 1,
            LinkRate::Hbr2 => 2,
            LinkRate::Hbr3 => 3,
        }
    }

    /// Payload-bandwidth divisor contribution per lane (64ths of the link
    /// symbol budget; see the payload manager).
    pub fn slot_factor(self) -> u32 {
        match self {
            LinkRate::Rbr => 3,
            LinkRate::Hbr => 5,
            LinkRate::Hbr2 => 10,
            LinkRate::Hbr3 => 15,
        }
    }

    pub fn reduce(self) -> Option<LinkRate> {
        match self {
            LinkRate::Hbr3 => Some(LinkRate::Hbr2),
            LinkRate::Hbr2 => Some(LinkRate::Hbr),
            LinkRate::Hbr => Some(LinkRate::Rbr),
            LinkRate::Rbr => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LaneCount {
    One,
    Two,
    Four,
}

impl LaneCount {
    pub fn count(self) -> u8 {
        match self {
            LaneCount::One => 1,
            LaneCount::Two => 2,
            LaneCount::Four => 4,
        }
    }

    pub fn from_count_floor(count: u8) -> LaneCount {
        match count {
            c if c >= 4 => LaneCount::Four,
            c if c >= 2 => LaneCount::Two,
            _ => LaneCount::One,
        }
    }

    /// PHY lane-select field value (log2 of the lane count).
    pub(crate) fn phy_sel(self) -> u32 {
        match self {
            LaneCount::One => 0,
            LaneCount::Two => 1,
            LaneCount::Four => 2,
        }
    }

    pub fn reduce(self) -> Option<LaneCount> {
        match self {
            LaneCount::Four => Some(LaneCount::Two),
            LaneCount::Two => Some(LaneCount::One),
            LaneCount::One => None,
        }
    }
}

/// Negotiated link parameters. Owned by the training machine; mutated only
/// while training runs, read-only to everyone else once `Trained`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub rate: LinkRate,
    pub lanes: LaneCount,
    pub voltage_swing: [u8; 4],
    pub pre_emphasis: [u8; 4],
}

impl LinkConfig {
    pub(crate) fn new(rate: LinkRate, lanes: LaneCount) -> Self {
        Self {
            rate,
            lanes,
            voltage_swing: [0; 4],
            pre_emphasis: [0; 4],
        }
    }

    fn all_lanes_at_max_swing(&self) -> bool {
        self.voltage_swing[..usize::from(self.lanes.count())]
            .iter()
            .all(|&v| v >= MAX_VOLTAGE_SWING)
    }
}

/// Training patterns in capability-precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrainingPattern {
    Tps1,
    Tps2,
    Tps3,
    Tps4,
}

impl TrainingPattern {
    /// PHY pattern-select value.
    pub(crate) fn phy_sel(self) -> u32 {
        match self {
            TrainingPattern::Tps1 => 1,
            TrainingPattern::Tps2 => 2,
            TrainingPattern::Tps3 => 3,
            TrainingPattern::Tps4 => 4,
        }
    }

    /// DPCD TRAINING_PATTERN_SET byte. TPS1..3 also disable scrambling;
    /// TPS4 runs with scrambling on.
    pub(crate) fn sink_pattern(self) -> u8 {
        match self {
            TrainingPattern::Tps1 => 0x21,
            TrainingPattern::Tps2 => 0x22,
            TrainingPattern::Tps3 => 0x23,
            TrainingPattern::Tps4 => 0x07,
        }
    }
}

/// Observable link state. `Failed` is terminal until the next hot-plug or
/// explicit re-train.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    BringUp,
    ClockRecovery,
    ChannelEqualization,
    Trained,
    Failed,
}

enum EqOutcome {
    Done,
    EqFailed,
    /// Clock recovery regressed while equalizing; counts as a CR failure.
    CrLost,
}

/// Fallback after a clock-recovery failure: rate down first; at RBR, drop a
/// lane step and restart from the source's maximum rate.
pub(crate) fn fallback_after_clock_recovery(
    rate: LinkRate,
    lanes: LaneCount,
    source_max_rate: LinkRate,
) -> Option<(LinkRate, LaneCount)> {
    if let Some(reduced) = rate.reduce() {
        return Some((reduced, lanes));
    }
    lanes.reduce().map(|reduced| (source_max_rate, reduced))
}

/// Fallback after a channel-equalization failure: lanes down first; with a
/// single lane left, step the rate down instead (the lane count stays at
/// one so the walk keeps shrinking).
pub(crate) fn fallback_after_channel_eq(
    rate: LinkRate,
    lanes: LaneCount,
) -> Option<(LinkRate, LaneCount)> {
    if let Some(reduced) = lanes.reduce() {
        return Some((rate, reduced));
    }
    rate.reduce().map(|reduced| (reduced, LaneCount::One))
}

impl<H: DptxHal, S: SocOps> DptxSession<H, S> {
    /// Runs the full training loop to a terminal state. On success the
    /// negotiated configuration is in `self.link` and the state is
    /// `Trained`; on failure the caller handles transmitter teardown.
    pub(crate) fn perform_training(&mut self) -> Result<LinkConfig> {
        let caps = self
            .caps
            .ok_or(Error::InvalidParameter("sink capabilities not read"))?;
        // The rate a lane-count fallback restarts from: the source's
        // maximum, clamped to what the sink advertises.
        let source_max_rate = self.config.max_rate.min(caps.max_rate);
        let mut rate = source_max_rate;
        let mut lanes = self.config.max_lanes.min(caps.max_lanes);

        self.state = LinkState::BringUp;
        loop {
            match self.state {
                LinkState::BringUp => {
                    debug!(?rate, ?lanes, "link bring-up");
                    self.training_bring_up(rate, lanes)?;
                    self.state = LinkState::ClockRecovery;
                }
                LinkState::ClockRecovery => {
                    if self.clock_recovery_phase()? {
                        self.state = LinkState::ChannelEqualization;
                    } else {
                        match fallback_after_clock_recovery(rate, lanes, source_max_rate) {
                            Some((r, l)) => {
                                debug!(?r, ?l, "clock recovery failed, falling back");
                                rate = r;
                                lanes = l;
                                self.state = LinkState::BringUp;
                            }
                            None => {
                                self.state = LinkState::Failed;
                                return Err(Error::LinkTrainingExhausted);
                            }
                        }
                    }
                }
                LinkState::ChannelEqualization => {
                    let next = match self.channel_eq_phase()? {
                        EqOutcome::Done => {
                            self.state = LinkState::Trained;
                            continue;
                        }
                        EqOutcome::EqFailed => fallback_after_channel_eq(rate, lanes),
                        EqOutcome::CrLost => {
                            fallback_after_clock_recovery(rate, lanes, source_max_rate)
                        }
                    };
                    match next {
                        Some((r, l)) => {
                            debug!(?r, ?l, "channel equalization failed, falling back");
                            rate = r;
                            lanes = l;
                            self.state = LinkState::BringUp;
                        }
                        None => {
                            self.state = LinkState::Failed;
                            return Err(Error::LinkTrainingExhausted);
                        }
                    }
                }
                LinkState::Trained => {
                    self.finish_training()?;
                    return Ok(self.link);
                }
                LinkState::Idle | LinkState::Failed => {
                    return Err(Error::InvalidParameter("training loop in terminal state"));
                }
            }
        }
    }

    /// Programs PHY and sink for a fresh attempt at (rate, lanes).
    fn training_bring_up(&mut self, rate: LinkRate, lanes: LaneCount) -> Result<()> {
        let caps = self
            .caps
            .ok_or(Error::InvalidParameter("sink capabilities not read"))?;

        // The SoC register bank is rate-specific; reprogram and reinitialize
        // the controller core only when the rate actually changes.
        if self.active_rate != Some(rate) {
            self.soc.reprogram_for_rate(rate)?;
            self.core_reinit();
            self.active_rate = Some(rate);
        }

        self.link = LinkConfig::new(rate, lanes);
        if cfg!(feature = "fast-link-training") {
            // Board-characterized starting levels; skips most of the ramp.
            self.link.voltage_swing = [2, 2, 2, 2];
            self.link.pre_emphasis = [1, 1, 1, 1];
        }

        self.phy_configure_link(rate, lanes)?;
        self.phy_write_lane_drive();
        self.phy_set_training_pattern(None);

        let enhanced = caps.enhanced_framing;
        let ssc = self.config.ssc_enable && caps.ssc_supported;
        let mut cctrl = self.hal.read_reg(REG_CCTRL);
        cctrl &= !(CCTRL_ENHANCED_FRAMING_EN | CCTRL_SSC_EN);
        if enhanced {
            cctrl |= CCTRL_ENHANCED_FRAMING_EN;
        }
        if ssc {
            cctrl |= CCTRL_SSC_EN;
        }
        self.hal.write_reg(REG_CCTRL, cctrl);

        self.dpcd_write_u8(DPCD_LINK_BW_SET, rate.bw_code())?;
        let mut lane_set = lanes.count();
        if enhanced {
            lane_set |= LANE_COUNT_ENHANCED_FRAME_EN;
        }
        self.dpcd_write_u8(DPCD_LANE_COUNT_SET, lane_set)?;
        self.dpcd_write_u8(DPCD_DOWNSPREAD_CTRL, if ssc { DOWNSPREAD_SPREAD_AMP } else { 0 })?;
        self.dpcd_write_u8(DPCD_MAIN_LINK_CHANNEL_CODING_SET, CHANNEL_CODING_8B10B)?;
        self.dpcd_write_u8(DPCD_TRAINING_PATTERN_SET, 0)?;
        Ok(())
    }

    /// Cycles the controller core after an SoC rate reprogram.
    fn core_reinit(&mut self) {
        let prev = self.hal.read_reg(REG_SOFT_RESET);
        self.hal.write_reg(REG_SOFT_RESET, prev | SOFT_RESET_CORE);
        self.hal.delay_us(10);
        self.hal.write_reg(REG_SOFT_RESET, prev & !SOFT_RESET_CORE);
        let cctrl = self.hal.read_reg(REG_CCTRL);
        self.hal.write_reg(REG_CCTRL, cctrl | CCTRL_CORE_EN);
    }

    /// TPS1 clock recovery. `Ok(true)` when every active lane locks.
    fn clock_recovery_phase(&mut self) -> Result<bool> {
        self.phy_set_training_pattern(Some(TrainingPattern::Tps1));
        self.dpcd_write_u8(DPCD_TRAINING_PATTERN_SET, TrainingPattern::Tps1.sink_pattern())?;
        self.write_training_lane_set()?;

        for iteration in 0..=CR_ADJUST_TRIES {
            self.hal.delay_us(CR_POLL_DELAY_US);
            let status = self.read_training_status()?;
            if status.clock_recovery_done(self.link.lanes) {
                return Ok(true);
            }
            if iteration == CR_ADJUST_TRIES {
                break;
            }
            if self.link.all_lanes_at_max_swing() {
                debug!("all lanes at maximum voltage swing without clock recovery");
                break;
            }
            self.apply_adjust_requests(&status)?;
        }
        Ok(false)
    }

    /// Channel equalization on the strongest pattern both ends support.
    fn channel_eq_phase(&mut self) -> Result<EqOutcome> {
        let caps = self
            .caps
            .ok_or(Error::InvalidParameter("sink capabilities not read"))?;
        let pattern = select_eq_pattern(self.link.rate, caps.tps3_supported, caps.tps4_supported);
        self.phy_set_training_pattern(Some(pattern));
        self.dpcd_write_u8(DPCD_TRAINING_PATTERN_SET, pattern.sink_pattern())?;

        let wait_us = eq_wait_us(caps.training_aux_rd_interval);
        for _ in 0..EQ_ADJUST_TRIES {
            self.hal.delay_us(wait_us);
            let status = self.read_training_status()?;
            if !status.clock_recovery_done(self.link.lanes) {
                return Ok(EqOutcome::CrLost);
            }
            if status.channel_eq_done(self.link.lanes) {
                return Ok(EqOutcome::Done);
            }
            self.apply_adjust_requests(&status)?;
        }
        Ok(EqOutcome::EqFailed)
    }

    /// Reprograms PHY drive and the sink's training-lane-set registers from
    /// the sink's adjust requests, tracking the saturation marker bits.
    fn apply_adjust_requests(&mut self, status: &TrainingStatus) -> Result<()> {
        for lane in 0..usize::from(self.link.lanes.count()) {
            self.link.voltage_swing[lane] = status.requested_swing(lane).min(MAX_VOLTAGE_SWING);
            self.link.pre_emphasis[lane] =
                status.requested_pre_emphasis(lane).min(MAX_PRE_EMPHASIS);
        }
        self.phy_write_lane_drive();
        self.write_training_lane_set()
    }

    /// Writes TRAINING_LANEx_SET for every active lane, including the
    /// max-swing/max-pre-emphasis reached markers.
    fn write_training_lane_set(&mut self) -> Result<()> {
        let mut lane_set = [0u8; 4];
        let active = usize::from(self.link.lanes.count());
        for (lane, out) in lane_set.iter_mut().enumerate().take(active) {
            let swing = self.link.voltage_swing[lane];
            let pre = self.link.pre_emphasis[lane];
            let mut value = (swing & 0x3) | ((pre & 0x3) << 3);
            if swing >= MAX_VOLTAGE_SWING {
                value |= TRAINING_LANE_MAX_SWING_REACHED;
            }
            if pre >= MAX_PRE_EMPHASIS {
                value |= TRAINING_LANE_MAX_PRE_EMPHASIS_REACHED;
            }
            *out = value;
        }
        self.dpcd_write_range(DPCD_TRAINING_LANE0_SET, &lane_set[..active])
    }

    /// Success epilogue: patterns off, transmitters on, sink count read.
    fn finish_training(&mut self) -> Result<()> {
        self.dpcd_write_u8(DPCD_TRAINING_PATTERN_SET, 0)?;
        self.phy_set_training_pattern(None);
        self.phy_set_transmitters(true);
        match self.dpcd_read_u8(DPCD_SINK_COUNT) {
            Ok(count) => debug!(sink_count = count & 0x3f, link = ?self.link, "link trained"),
            Err(err) => warn!(%err, "trained, but sink count read failed"),
        }
        Ok(())
    }

    /// Re-reads CR/EQ/align bits without touching any configuration.
    pub fn get_training_status(&mut self) -> Result<TrainingStatus> {
        self.read_training_status()
    }
}

fn select_eq_pattern(rate: LinkRate, tps3: bool, tps4: bool) -> TrainingPattern {
    if rate == LinkRate::Hbr3 && tps4 {
        TrainingPattern::Tps4
    } else if tps3 {
        TrainingPattern::Tps3
    } else {
        TrainingPattern::Tps2
    }
}

/// TRAINING_AUX_RD_INTERVAL encoding: 0 means 400 us, otherwise 4 ms per
/// step, capped at 16 ms.
fn eq_wait_us(interval_code: u8) -> u32 {
    match interval_code & 0x7f {
        0 => 400,
        code => u32::from(code.min(4)) * 4000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_key(rate: LinkRate, lanes: LaneCount) -> (u8, u8) {
        (lanes.count(), rate.bw_code())
    }

    #[test]
    fn cr_fallback_walks_the_whole_lattice_once() {
        let mut rate = LinkRate::Hbr3;
        let mut lanes = LaneCount::Four;
        let mut seen = vec![(rate, lanes)];
        while let Some((r, l)) = fallback_after_clock_recovery(rate, lanes, LinkRate::Hbr3) {
            assert!(
                lex_key(r, l) < lex_key(rate, lanes),
                "fallback must shrink (lanes, rate) lexicographically"
            );
            assert!(!seen.contains(&(r, l)), "combination revisited");
            seen.push((r, l));
            rate = r;
            lanes = l;
        }
        assert_eq!(seen.len(), 12);
        assert_eq!((rate, lanes), (LinkRate::Rbr, LaneCount::One));
    }

    #[test]
    fn eq_fallback_prefers_lane_reduction() {
        assert_eq!(
            fallback_after_channel_eq(LinkRate::Hbr2, LaneCount::Four),
            Some((LinkRate::Hbr2, LaneCount::Two))
        );
        assert_eq!(
            fallback_after_channel_eq(LinkRate::Hbr2, LaneCount::One),
            Some((LinkRate::Hbr, LaneCount::One))
        );
        assert_eq!(fallback_after_channel_eq(LinkRate::Rbr, LaneCount::One), None);
    }

    #[test]
    fn any_mixed_fallback_sequence_terminates_within_the_lattice() {
        // Alternate CR and EQ failures from the top of the lattice; every
        // step must still shrink lexicographically.
        let mut rate = LinkRate::Hbr3;
        let mut lanes = LaneCount::Four;
        let mut transitions = 0;
        let mut use_cr = true;
        loop {
            let next = if use_cr {
                fallback_after_clock_recovery(rate, lanes, LinkRate::Hbr3)
            } else {
                fallback_after_channel_eq(rate, lanes)
            };
            use_cr = !use_cr;
            match next {
                Some((r, l)) => {
                    assert!(lex_key(r, l) < lex_key(rate, lanes));
                    rate = r;
                    lanes = l;
                    transitions += 1;
                    assert!(transitions <= 12, "lattice walk did not terminate");
                }
                None => break,
            }
        }
    }

    #[test]
    fn eq_pattern_precedence() {
        assert_eq!(
            select_eq_pattern(LinkRate::Hbr3, true, true),
            TrainingPattern::Tps4
        );
        assert_eq!(
            select_eq_pattern(LinkRate::Hbr2, true, true),
            TrainingPattern::Tps3
        );
        assert_eq!(
            select_eq_pattern(LinkRate::Hbr3, false, false),
            TrainingPattern::Tps2
        );
        assert_eq!(
            select_eq_pattern(LinkRate::Rbr, false, true),
            TrainingPattern::Tps2
        );
    }

    #[test]
    fn eq_wait_interval_is_capped() {
        assert_eq!(eq_wait_us(0), 400);
        assert_eq!(eq_wait_us(1), 4000);
        assert_eq!(eq_wait_us(4), 16000);
        assert_eq!(eq_wait_us(9), 16000);
    }

    #[test]
    fn rate_codes_floor_to_mainline_rates() {
        assert_eq!(LinkRate::from_bw_code_floor(0x1E), LinkRate::Hbr3);
        assert_eq!(LinkRate::from_bw_code_floor(0x19), LinkRate::Hbr2);
        assert_eq!(LinkRate::from_bw_code_floor(0x0A), LinkRate::Hbr);
        assert_eq!(LinkRate::from_bw_code_floor(0x00), LinkRate::Rbr);
    }
}
