//! DPTX controller register bank.
//!
//! Offsets are controller-local (added to the block base by the HAL). The
//! AUX request/reply command encodings in the low nibbles are the on-wire
//! DisplayPort AUX values; everything else is the controller's own layout.

pub const REG_CCTRL: u32 = 0x0040;
pub const CCTRL_CORE_EN: u32 = 1 << 0;
pub const CCTRL_ENHANCED_FRAMING_EN: u32 = 1 << 1;
pub const CCTRL_SSC_EN: u32 = 1 << 4;
pub const CCTRL_MST_EN: u32 = 1 << 8;

pub const REG_SOFT_RESET: u32 = 0x0044;
pub const SOFT_RESET_CORE: u32 = 1 << 0;
pub const SOFT_RESET_PHY: u32 = 1 << 1;
pub const SOFT_RESET_AUX: u32 = 1 << 2;

// PHY interface.
pub const REG_PHYIF_CTRL: u32 = 0x0A00;
pub const PHYIF_LANES_SHIFT: u32 = 0; // log2(lane count), 2 bits
pub const PHYIF_LANES_MASK: u32 = 0x3;
pub const PHYIF_RATE_SHIFT: u32 = 4; // 2 bits, see LinkRate::phy_sel
pub const PHYIF_RATE_MASK: u32 = 0x3 << PHYIF_RATE_SHIFT;
pub const PHYIF_PWRDOWN_SHIFT: u32 = 8; // 2-bit PHY power state
pub const PHYIF_PWRDOWN_MASK: u32 = 0x3 << PHYIF_PWRDOWN_SHIFT;
pub const PHYIF_BUSY: u32 = 1 << 12;
pub const PHYIF_XMIT_EN_SHIFT: u32 = 16; // per-lane transmitter enable
pub const PHYIF_XMIT_EN_MASK: u32 = 0xF << PHYIF_XMIT_EN_SHIFT;

// PHY power state field values.
pub const PHY_POWER_ON: u32 = 0x0;
pub const PHY_POWER_DOWN_PHY_CLOCK: u32 = 0x2;
pub const PHY_POWER_DOWN_REF_CLOCK: u32 = 0x3;

/// Training pattern select: 0 = none, 1..=4 = TPS1..TPS4.
pub const REG_PHY_TPS_SEL: u32 = 0x0A04;

const REG_PHY_LANE_DRIVE_BASE: u32 = 0x0A10;
pub const LANE_DRIVE_VSWING_SHIFT: u32 = 0; // 2 bits
pub const LANE_DRIVE_PREEMPH_SHIFT: u32 = 4; // 2 bits

pub fn phy_lane_drive(lane: usize) -> u32 {
    REG_PHY_LANE_DRIVE_BASE + 4 * lane as u32
}

// AUX engine.
pub const REG_AUX_CMD: u32 = 0x0B00;
pub const AUX_CMD_TYPE_SHIFT: u32 = 28; // AUX request command nibble
pub const AUX_CMD_ADDR_SHIFT: u32 = 8; // 20-bit AUX address
pub const AUX_CMD_ADDR_MASK: u32 = 0xF_FFFF << AUX_CMD_ADDR_SHIFT;
pub const AUX_CMD_ADDR_ONLY: u32 = 1 << 4;
pub const AUX_CMD_LEN_SHIFT: u32 = 0; // transfer length - 1, 4 bits
pub const AUX_CMD_LEN_MASK: u32 = 0xF;

// AUX request command nibbles (wire encoding).
pub const AUX_CMD_I2C_WRITE: u32 = 0x0;
pub const AUX_CMD_I2C_READ: u32 = 0x1;
pub const AUX_CMD_I2C_WRITE_MOT: u32 = 0x4;
pub const AUX_CMD_I2C_READ_MOT: u32 = 0x5;
pub const AUX_CMD_NATIVE_WRITE: u32 = 0x8;
pub const AUX_CMD_NATIVE_READ: u32 = 0x9;

pub const REG_AUX_STS: u32 = 0x0B04;
pub const AUX_STS_REPLY_RECEIVED: u32 = 1 << 31; // write-1-to-clear
pub const AUX_STS_ACTIVE: u32 = 1 << 30;
pub const AUX_STS_BYTES_READ_SHIFT: u32 = 12; // 5 bits
pub const AUX_STS_BYTES_READ_MASK: u32 = 0x1F << AUX_STS_BYTES_READ_SHIFT;
pub const AUX_STS_STATUS_MASK: u32 = 0xF;

// AUX reply status field values (the sink's reply command nibble).
pub const AUX_REPLY_ACK: u32 = 0x0;
pub const AUX_REPLY_NACK: u32 = 0x1;
pub const AUX_REPLY_DEFER: u32 = 0x2;
pub const AUX_REPLY_I2C_NACK: u32 = 0x4;
pub const AUX_REPLY_I2C_DEFER: u32 = 0x8;

const REG_AUX_DATA_BASE: u32 = 0x0B10; // 4 words, 16 data bytes

pub fn aux_data(word: usize) -> u32 {
    REG_AUX_DATA_BASE + 4 * word as u32
}

// MST payload machinery.
pub const REG_MST_CTRL: u32 = 0x0500;
pub const MST_CTRL_ACT_TRIGGER: u32 = 1 << 0; // self-clearing

/// Local VC payload table: 64 time slots, 4 bits of VCPI per slot, packed
/// eight slots to a register.
pub const MST_VCP_TABLE_REGS: usize = 8;
const REG_MST_VCP_TABLE_BASE: u32 = 0x0510;

pub fn mst_vcp_table(word: usize) -> u32 {
    REG_MST_VCP_TABLE_BASE + 4 * word as u32
}
