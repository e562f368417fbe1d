//! The driver session: single owner of the AUX bus, link state machine and
//! topology manager.
//!
//! One `DptxSession` exists per physical link. The embedding driver is
//! expected to serialize access (typically a mutex held by the threaded
//! hot-plug worker); the session itself enforces the training-in-progress
//! token so a re-entrant bring-up attempt fails fast with `Busy` instead of
//! interleaving AUX traffic. Cancellation is data, not control flow: the
//! IRQ layer flips the [`PlugLatch`] and every poll loop notices on its
//! next iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::dpcd::{
    SinkCapabilities, DPCD_DEVICE_SERVICE_IRQ_VECTOR, DPCD_MSTM_CTRL, DPCD_SET_POWER,
    IRQ_VECTOR_DOWN_REP_MSG_RDY, MSTM_CTRL_MST_EN, MSTM_CTRL_UP_REQ_EN, SET_POWER_D0,
};
use crate::hal::{DptxHal, LinkEvents, PlugLatch, SocOps};
use crate::link::{LaneCount, LinkConfig, LinkRate, LinkState};
use crate::regs::{CCTRL_MST_EN, REG_CCTRL};
use crate::topology::{PayloadAllocation, StreamIndex, StreamSinkPort, MAX_STREAMS};
use crate::{Error, Result};

/// Source-side link policy, fixed at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DptxConfig {
    pub max_rate: LinkRate,
    pub max_lanes: LaneCount,
    pub ssc_enable: bool,
    pub mst_enable: bool,
    /// LINK_ADDRESS recursion bound below the root branch. The shipping
    /// hardware never fans out deeper than 2; keep that default for
    /// compatibility unless the topology is known.
    pub max_branch_depth: u8,
}

impl Default for DptxConfig {
    fn default() -> Self {
        Self {
            max_rate: LinkRate::Hbr3,
            max_lanes: LaneCount::Four,
            ssc_enable: true,
            mst_enable: true,
            max_branch_depth: 2,
        }
    }
}

pub struct DptxSession<H: DptxHal, S: SocOps> {
    pub(crate) hal: H,
    pub(crate) soc: S,
    pub(crate) config: DptxConfig,
    pub(crate) plug: Arc<PlugLatch>,
    pub(crate) state: LinkState,
    pub(crate) caps: Option<SinkCapabilities>,
    pub(crate) link: LinkConfig,
    /// Rate the SoC register bank is currently programmed for.
    pub(crate) active_rate: Option<LinkRate>,
    pub(crate) mst_active: bool,
    pub(crate) sinks: [Option<StreamSinkPort>; MAX_STREAMS],
    pub(crate) payloads: [Option<PayloadAllocation>; MAX_STREAMS],
    pub(crate) seqno: u8,
    training_active: AtomicBool,
    events: Option<Box<dyn LinkEvents>>,
}

impl<H: DptxHal, S: SocOps> DptxSession<H, S> {
    pub fn new(hal: H, soc: S, config: DptxConfig) -> Result<Self> {
        if usize::from(config.max_branch_depth) > dptx_sideband::MAX_RAD_HOPS {
            return Err(Error::InvalidParameter("sub-branch depth exceeds RAD capacity"));
        }
        Ok(Self {
            hal,
            soc,
            config,
            plug: Arc::new(PlugLatch::default()),
            state: LinkState::Idle,
            caps: None,
            link: LinkConfig::new(config.max_rate, config.max_lanes),
            active_rate: None,
            mst_active: false,
            sinks: [None; MAX_STREAMS],
            payloads: [None; MAX_STREAMS],
            seqno: 0,
            training_active: AtomicBool::new(false),
            events: None,
        })
    }

    /// Handle for the IRQ layer; cheap to clone, safe to poke from
    /// interrupt context.
    pub fn plug_latch(&self) -> Arc<PlugLatch> {
        Arc::clone(&self.plug)
    }

    pub fn set_link_events(&mut self, events: Box<dyn LinkEvents>) {
        self.events = Some(events);
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_trained(&self) -> bool {
        self.state == LinkState::Trained
    }

    pub fn current_link_config(&self) -> Option<LinkConfig> {
        self.is_trained().then_some(self.link)
    }

    pub fn sink_capabilities(&self) -> Option<&SinkCapabilities> {
        self.caps.as_ref()
    }

    /// Discovered stream sinks in stream-index order.
    pub fn stream_sink_ports(&self) -> Vec<(StreamIndex, StreamSinkPort)> {
        self.sinks
            .iter()
            .enumerate()
            .filter_map(|(i, sink)| {
                let index = StreamIndex::new(i as u8)?;
                let port = (*sink)?;
                Some((index, port))
            })
            .collect()
    }

    pub fn payload_allocation(&self) -> [Option<PayloadAllocation>; MAX_STREAMS] {
        self.payloads
    }

    pub(crate) fn check_plugged(&self) -> Result<()> {
        if self.plug.is_plugged() {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    /// Hot-plug entry point from the threaded interrupt worker.
    pub fn on_hotplug(&mut self, plugged: bool) -> Result<()> {
        self.plug.set_plugged(plugged);
        if plugged {
            debug!("sink plugged, starting bring-up");
            self.bring_up()
        } else {
            debug!("sink unplugged");
            self.teardown();
            Ok(())
        }
    }

    /// Short-pulse HPD: the sink asked to be re-polled. Re-reads the IRQ
    /// vector and link status; retrains when CR or EQ was lost.
    pub fn on_sink_irq(&mut self) -> Result<()> {
        self.plug.take_sink_irq();
        self.check_plugged()?;
        let vector = self.dpcd_read_u8(DPCD_DEVICE_SERVICE_IRQ_VECTOR)?;
        // Acknowledge everything except DOWN_REP_MSG_RDY, which belongs to
        // the sideband reassembly loop.
        let ack = vector & !IRQ_VECTOR_DOWN_REP_MSG_RDY;
        if ack != 0 {
            self.dpcd_write_u8(DPCD_DEVICE_SERVICE_IRQ_VECTOR, ack)?;
        }
        if self.is_trained() {
            let status = self.get_training_status()?;
            if !status.clock_recovery_done(self.link.lanes)
                || !status.channel_eq_done(self.link.lanes)
            {
                warn!("link degraded after sink IRQ, retraining");
                return self.bring_up();
            }
        }
        Ok(())
    }

    /// Full bring-up: sink power, capability snapshot, link training, and
    /// (for MST-capable sinks) topology discovery. Payload allocation is a
    /// separate step ([`Self::configure_topology`]) once the video side
    /// knows its stream timings.
    pub fn bring_up(&mut self) -> Result<()> {
        if self.training_active.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        let result = self.bring_up_inner();
        self.training_active.store(false, Ordering::SeqCst);
        if let Err(err) = &result {
            warn!(%err, "link bring-up failed");
            self.fail_link();
        }
        result
    }

    fn bring_up_inner(&mut self) -> Result<()> {
        self.check_plugged()?;
        self.caps = None;
        self.mst_active = false;
        self.sinks = [None; MAX_STREAMS];
        self.payloads = [None; MAX_STREAMS];

        // Wake the sink before reading anything else.
        self.dpcd_write_u8(DPCD_SET_POWER, SET_POWER_D0)?;
        let caps = self.read_sink_capabilities()?;
        debug!(?caps, "sink capabilities");
        self.caps = Some(caps);

        let want_mst = self.config.mst_enable && caps.mst_capable;
        self.set_mst_enables(want_mst)?;

        self.perform_training()?;

        if want_mst {
            match self.discover_topology() {
                Ok(()) => self.mst_active = true,
                Err(Error::BusTimeout) => {
                    // The sink claims MST but its sideband path never
                    // answered; run it as a single-stream link instead of
                    // failing the whole bring-up.
                    warn!("sideband unresponsive, falling back to single-stream");
                    self.set_mst_enables(false)?;
                }
                Err(err) => return Err(err),
            }
        }

        let config = self.link;
        if let Some(events) = self.events.as_mut() {
            events.link_trained(config);
        }
        Ok(())
    }

    fn set_mst_enables(&mut self, enable: bool) -> Result<()> {
        let cctrl = self.hal.read_reg(REG_CCTRL);
        if enable {
            self.hal.write_reg(REG_CCTRL, cctrl | CCTRL_MST_EN);
            self.dpcd_write_u8(DPCD_MSTM_CTRL, MSTM_CTRL_MST_EN | MSTM_CTRL_UP_REQ_EN)
        } else {
            self.hal.write_reg(REG_CCTRL, cctrl & !CCTRL_MST_EN);
            self.dpcd_write_u8(DPCD_MSTM_CTRL, 0)
        }
    }

    /// Unplug teardown: transmitters off, state back to `Idle`, all
    /// per-sink state dropped. Always leaves drive registers and DPCD
    /// lane-set values consistent (both are rewritten on the next
    /// bring-up before anything transmits).
    fn teardown(&mut self) {
        self.phy_set_transmitters(false);
        self.state = LinkState::Idle;
        self.caps = None;
        self.active_rate = None;
        self.mst_active = false;
        self.sinks = [None; MAX_STREAMS];
        self.payloads = [None; MAX_STREAMS];
        if let Some(events) = self.events.as_mut() {
            events.link_lost();
        }
    }

    /// Bring-up failure: transmitters off, `Failed` recorded. Retriable by
    /// the next hot-plug or an explicit `bring_up` call.
    fn fail_link(&mut self) {
        self.phy_set_transmitters(false);
        self.state = LinkState::Failed;
        self.mst_active = false;
        self.payloads = [None; MAX_STREAMS];
    }
}
