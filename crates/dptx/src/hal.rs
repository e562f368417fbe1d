//! Seams between the protocol engine and its surroundings.
//!
//! `DptxHal` is the register-and-delay surface of the controller block;
//! `SocOps` is the SoC clock/PLL collaborator that must be reprogrammed when
//! the negotiated link rate changes; `LinkEvents` is how the video/DRM side
//! hears about link state. All AUX waits are blocking bounded delays, so the
//! HAL's `delay_us` is expected to busy-wait or sleep as the platform sees
//! fit.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::link::{LinkConfig, LinkRate};
use crate::Result;

/// Register access to the DPTX controller block plus bounded delays.
pub trait DptxHal {
    fn read_reg(&mut self, offset: u32) -> u32;
    fn write_reg(&mut self, offset: u32, value: u32);
    fn delay_us(&mut self, us: u32);

    fn delay_ms(&mut self, ms: u32) {
        self.delay_us(ms.saturating_mul(1000));
    }
}

/// SoC-side collaborator: clock tree / register bank reprogramming for a new
/// link rate. Synchronous and fallible.
pub trait SocOps {
    fn reprogram_for_rate(&mut self, rate: LinkRate) -> Result<()>;
}

/// Notifications toward the video/DRM collaborator.
pub trait LinkEvents {
    fn link_trained(&mut self, config: LinkConfig);
    fn link_lost(&mut self);
}

/// Shared plug/IRQ state, settable from interrupt context.
///
/// There is no cancellation token: the hot-plug handler flips `plugged` and
/// every bounded poll loop re-checks it between iterations, so an in-flight
/// training or ACT wait unwinds with [`crate::Error::Disconnected`] instead
/// of burning its full multi-second budget against an absent sink.
#[derive(Debug, Default)]
pub struct PlugLatch {
    plugged: AtomicBool,
    sink_irq: AtomicBool,
}

impl PlugLatch {
    pub fn set_plugged(&self, plugged: bool) {
        self.plugged.store(plugged, Ordering::SeqCst);
    }

    pub fn is_plugged(&self) -> bool {
        self.plugged.load(Ordering::SeqCst)
    }

    /// Records a short-pulse HPD IRQ (sink-initiated re-poll request).
    pub fn signal_sink_irq(&self) {
        self.sink_irq.store(true, Ordering::SeqCst);
    }

    pub fn take_sink_irq(&self) -> bool {
        self.sink_irq.swap(false, Ordering::SeqCst)
    }
}
