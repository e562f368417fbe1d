//! Sink register space: named DPCD accessors over the AUX bus.
//!
//! Addresses are the standard DisplayPort 1.4 DPCD map and must stay
//! verbatim; real sinks decode them. Semantic wrappers live here too: the
//! capability snapshot taken at bring-up and the per-poll training status
//! decode.

use crate::aux_ch::AUX_MAX_TRANSFER;
use crate::hal::{DptxHal, SocOps};
use crate::link::{LaneCount, LinkRate};
use crate::session::DptxSession;
use crate::Result;

// Receiver capability field.
pub const DPCD_DPCD_REV: u32 = 0x000;
pub const DPCD_MAX_LINK_RATE: u32 = 0x001;
pub const DPCD_MAX_LANE_COUNT: u32 = 0x002;
pub const DPCD_MAX_DOWNSPREAD: u32 = 0x003;
pub const DPCD_TRAINING_AUX_RD_INTERVAL: u32 = 0x00E;
pub const DPCD_MSTM_CAP: u32 = 0x021;

pub const MAX_LANE_COUNT_MASK: u8 = 0x1F;
pub const MAX_LANE_COUNT_TPS3_SUPPORTED: u8 = 1 << 6;
pub const MAX_LANE_COUNT_ENHANCED_FRAME_CAP: u8 = 1 << 7;
pub const MAX_DOWNSPREAD_0_5_PCT: u8 = 1 << 0;
pub const MAX_DOWNSPREAD_TPS4_SUPPORTED: u8 = 1 << 7;
pub const TRAINING_AUX_RD_INTERVAL_MASK: u8 = 0x7F;
pub const EXTENDED_RECEIVER_CAP_PRESENT: u8 = 1 << 7;
pub const MSTM_CAP_MST: u8 = 1 << 0;

// Link configuration field.
pub const DPCD_LINK_BW_SET: u32 = 0x100;
pub const DPCD_LANE_COUNT_SET: u32 = 0x101;
pub const DPCD_TRAINING_PATTERN_SET: u32 = 0x102;
pub const DPCD_TRAINING_LANE0_SET: u32 = 0x103;
pub const DPCD_DOWNSPREAD_CTRL: u32 = 0x107;
pub const DPCD_MAIN_LINK_CHANNEL_CODING_SET: u32 = 0x108;
pub const DPCD_MSTM_CTRL: u32 = 0x111;

pub const LANE_COUNT_ENHANCED_FRAME_EN: u8 = 1 << 7;
pub const DOWNSPREAD_SPREAD_AMP: u8 = 1 << 4;
pub const CHANNEL_CODING_8B10B: u8 = 1 << 0;
pub const MSTM_CTRL_MST_EN: u8 = 1 << 0;
pub const MSTM_CTRL_UP_REQ_EN: u8 = 1 << 1;

pub const TRAINING_LANE_MAX_SWING_REACHED: u8 = 1 << 2;
pub const TRAINING_LANE_MAX_PRE_EMPHASIS_REACHED: u8 = 1 << 5;

// Payload table programming.
pub const DPCD_PAYLOAD_ALLOCATE_SET: u32 = 0x1C0;
pub const DPCD_PAYLOAD_ALLOCATE_START_TIME_SLOT: u32 = 0x1C1;
pub const DPCD_PAYLOAD_ALLOCATE_TIME_SLOT_COUNT: u32 = 0x1C2;

// Link/sink status field.
pub const DPCD_SINK_COUNT: u32 = 0x200;
pub const DPCD_DEVICE_SERVICE_IRQ_VECTOR: u32 = 0x201;
pub const DPCD_LANE0_1_STATUS: u32 = 0x202;
pub const DPCD_PAYLOAD_TABLE_UPDATE_STATUS: u32 = 0x2C0;

pub const IRQ_VECTOR_DOWN_REP_MSG_RDY: u8 = 1 << 4;
pub const PAYLOAD_TABLE_UPDATED: u8 = 1 << 0;
pub const PAYLOAD_ACT_HANDLED: u8 = 1 << 1;

pub const LANE_STATUS_CR_DONE: u8 = 1 << 0;
pub const LANE_STATUS_EQ_DONE: u8 = 1 << 1;
pub const LANE_STATUS_SYMBOL_LOCKED: u8 = 1 << 2;
pub const INTERLANE_ALIGN_DONE: u8 = 1 << 0;

// Sink power.
pub const DPCD_SET_POWER: u32 = 0x600;
pub const SET_POWER_D0: u8 = 0x1;
pub const SET_POWER_D3: u8 = 0x2;

// Sideband message windows and the ESI field.
pub const DPCD_DOWN_REQ_BASE: u32 = 0x1000;
pub const DPCD_DOWN_REP_BASE: u32 = 0x1400;
pub const DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0: u32 = 0x2003;
pub const DPCD_EXTENDED_CAP_BASE: u32 = 0x2200;

/// Immutable capability snapshot, read once at bring-up and rebuilt only on
/// hot-plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkCapabilities {
    pub dpcd_rev: u8,
    pub max_rate: LinkRate,
    pub max_lanes: LaneCount,
    pub enhanced_framing: bool,
    pub tps3_supported: bool,
    pub tps4_supported: bool,
    pub ssc_supported: bool,
    pub mst_capable: bool,
    pub training_aux_rd_interval: u8,
    /// Snapshot came from the extended field at 0x2200.
    pub extended: bool,
}

impl SinkCapabilities {
    fn parse(raw: &[u8; 16], mst_capable: bool, extended: bool) -> Self {
        Self {
            dpcd_rev: raw[0],
            max_rate: LinkRate::from_bw_code_floor(raw[1]),
            max_lanes: LaneCount::from_count_floor(raw[2] & MAX_LANE_COUNT_MASK),
            enhanced_framing: raw[2] & MAX_LANE_COUNT_ENHANCED_FRAME_CAP != 0,
            tps3_supported: raw[2] & MAX_LANE_COUNT_TPS3_SUPPORTED != 0,
            tps4_supported: raw[3] & MAX_DOWNSPREAD_TPS4_SUPPORTED != 0,
            ssc_supported: raw[3] & MAX_DOWNSPREAD_0_5_PCT != 0,
            mst_capable,
            training_aux_rd_interval: raw[0x0E] & TRAINING_AUX_RD_INTERVAL_MASK,
            extended,
        }
    }
}

/// One poll of the six link-status bytes at 0x202..=0x207. Scratch state:
/// overwritten on every poll, never stored across training attempts.
#[derive(Debug, Clone, Copy)]
pub struct TrainingStatus {
    raw: [u8; 6],
}

impl TrainingStatus {
    pub(crate) fn from_raw(raw: [u8; 6]) -> Self {
        Self { raw }
    }

    fn lane_status(&self, lane: usize) -> u8 {
        let byte = self.raw[lane / 2];
        if lane % 2 == 0 {
            byte & 0xf
        } else {
            byte >> 4
        }
    }

    pub fn cr_done(&self, lane: usize) -> bool {
        self.lane_status(lane) & LANE_STATUS_CR_DONE != 0
    }

    pub fn eq_done(&self, lane: usize) -> bool {
        self.lane_status(lane) & LANE_STATUS_EQ_DONE != 0
    }

    pub fn symbol_locked(&self, lane: usize) -> bool {
        self.lane_status(lane) & LANE_STATUS_SYMBOL_LOCKED != 0
    }

    pub fn interlane_align_done(&self) -> bool {
        self.raw[2] & INTERLANE_ALIGN_DONE != 0
    }

    pub fn clock_recovery_done(&self, lanes: LaneCount) -> bool {
        (0..usize::from(lanes.count())).all(|lane| self.cr_done(lane))
    }

    pub fn channel_eq_done(&self, lanes: LaneCount) -> bool {
        self.interlane_align_done()
            && (0..usize::from(lanes.count()))
                .all(|lane| self.eq_done(lane) && self.symbol_locked(lane))
    }

    /// Sink-requested voltage swing for `lane`, from the adjust-request
    /// bytes.
    pub(crate) fn requested_swing(&self, lane: usize) -> u8 {
        let byte = self.raw[4 + lane / 2];
        (byte >> (4 * (lane % 2))) & 0x3
    }

    pub(crate) fn requested_pre_emphasis(&self, lane: usize) -> u8 {
        let byte = self.raw[4 + lane / 2];
        (byte >> (4 * (lane % 2) + 2)) & 0x3
    }
}

impl<H: DptxHal, S: SocOps> DptxSession<H, S> {
    pub fn dpcd_read_u8(&mut self, addr: u32) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.aux_native_read(addr, &mut byte)?;
        Ok(byte[0])
    }

    pub fn dpcd_write_u8(&mut self, addr: u32, value: u8) -> Result<()> {
        self.aux_native_write(addr, &[value])?;
        Ok(())
    }

    /// Reads an arbitrary-length DPCD range in ≤16-byte transactions,
    /// failing fast on the first error.
    pub fn dpcd_read_range(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = (buf.len() - done).min(AUX_MAX_TRANSFER);
            let n = self.aux_native_read(addr + done as u32, &mut buf[done..done + chunk])?;
            done += n;
        }
        Ok(())
    }

    pub fn dpcd_write_range(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = (buf.len() - done).min(AUX_MAX_TRANSFER);
            let n = self.aux_native_write(addr + done as u32, &buf[done..done + chunk])?;
            done += n;
        }
        Ok(())
    }

    /// Takes the capability snapshot, preferring the extended receiver
    /// capability field when the sink advertises one.
    pub(crate) fn read_sink_capabilities(&mut self) -> Result<SinkCapabilities> {
        let mut raw = [0u8; 16];
        self.dpcd_read_range(DPCD_DPCD_REV, &mut raw)?;
        let extended = raw[0x0E] & EXTENDED_RECEIVER_CAP_PRESENT != 0;
        if extended {
            self.dpcd_read_range(DPCD_EXTENDED_CAP_BASE, &mut raw)?;
        }
        // MST capability arrived with DPCD 1.2.
        let mst_capable =
            raw[0] >= 0x12 && self.dpcd_read_u8(DPCD_MSTM_CAP)? & MSTM_CAP_MST != 0;
        Ok(SinkCapabilities::parse(&raw, mst_capable, extended))
    }

    pub(crate) fn read_training_status(&mut self) -> Result<TrainingStatus> {
        let mut raw = [0u8; 6];
        self.dpcd_read_range(DPCD_LANE0_1_STATUS, &mut raw)?;
        Ok(TrainingStatus::from_raw(raw))
    }
}
