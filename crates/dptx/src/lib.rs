#![forbid(unsafe_code)]

//! DisplayPort 1.4 transmitter (DPTX) link-establishment engine.
//!
//! This crate drives a register-mapped DPTX controller from hot-plug to a
//! trained link, in both single-stream and multi-stream topologies:
//!
//! - `aux_ch`: the retry-bounded AUX transaction bus (native DPCD and
//!   I2C-over-AUX).
//! - `dpcd`: the standard sink register map, the capability snapshot and
//!   the training-status decode.
//! - `edid`: EDID retrieval with header/checksum validation.
//! - `link` + `phy`: the clock-recovery/channel-equalization state machine
//!   and its rate/lane fallback lattice, plus the PHY power sequencing it
//!   depends on.
//! - `topology`: MST sideband transport (over `dptx-sideband`), branch
//!   discovery and VC payload/ACT management.
//! - `session`: the owning context object with the hot-plug/IRQ entry
//!   points and the read-only queries the video/audio/HDCP layers consume.
//!
//! Hardware access goes through [`DptxHal`]; the SoC clock collaborator
//! through [`SocOps`]. Nothing in here installs a tracing subscriber or
//! spawns threads: all waits are bounded blocking polls, and unplug
//! cancellation is delivered through the shared [`PlugLatch`].

mod aux_ch;
pub mod dpcd;
mod edid;
mod error;
mod hal;
mod link;
mod phy;
pub mod regs;
mod session;
mod topology;

pub use dpcd::{SinkCapabilities, TrainingStatus};
pub use edid::EDID_BLOCK_SIZE;
pub use error::{Error, Result};
pub use hal::{DptxHal, LinkEvents, PlugLatch, SocOps};
pub use link::{LaneCount, LinkConfig, LinkRate, LinkState, MAX_PRE_EMPHASIS, MAX_VOLTAGE_SWING};
pub use session::{DptxConfig, DptxSession};
pub use topology::{
    payload_bandwidth_number, time_slot_count, PayloadAllocation, StreamConfig, StreamIndex,
    StreamSinkPort, MAX_STREAMS,
};
