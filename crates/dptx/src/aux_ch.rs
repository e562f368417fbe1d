//! AUX-channel transaction bus.
//!
//! One transaction moves up to 16 bytes through the command/status/data
//! register interface: build the command word, clear the reply latch, load
//! the data words (writes), issue, then poll for the reply within a fixed
//! budget. Retry handling lives entirely in this layer:
//!
//! - DEFER (native or I2C) waits 1 ms and reissues; the sink asked for time.
//! - ACK with zero bytes read on a read is answered with an AUX soft reset
//!   and a reissue. This is an observed sink quirk rather than anything the
//!   standard mandates, but the recovery path has to stay (see the notes in
//!   DESIGN.md).
//! - NACK is final. Retrying a firm I2C refusal would violate the bus
//!   semantics, so it surfaces immediately as [`Error::NotAcknowledged`].
//! - Any unrecognized reply status is treated as a protocol error: soft
//!   reset, reissue.
//!
//! A transaction that exhausts its reply poll produces [`Error::BusTimeout`].
//! Callers must not assume engine state survives a failed transaction; the
//! soft reset path may have cycled the AUX block under them.

use tracing::warn;

use crate::hal::{DptxHal, SocOps};
use crate::regs::*;
use crate::session::DptxSession;
use crate::{Error, Result};

/// Hard cap of one AUX transaction on the wire.
pub(crate) const AUX_MAX_TRANSFER: usize = 16;

/// Reply poll budget: ~50 polls at 100 us is 5 ms per issued request.
const AUX_REPLY_POLL_TRIES: u32 = 50;
const AUX_REPLY_POLL_INTERVAL_US: u32 = 100;

/// Outer reissue budget shared by the DEFER and soft-reset recovery paths.
const AUX_RETRIES: u32 = 200;
const AUX_DEFER_DELAY_US: u32 = 1000;

impl<H: DptxHal, S: SocOps> DptxSession<H, S> {
    pub(crate) fn aux_native_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize> {
        let cmd = aux_cmd(AUX_CMD_NATIVE_READ, addr, buf.len(), false)?;
        self.aux_run(cmd, None, Some(buf))
    }

    pub(crate) fn aux_native_write(&mut self, addr: u32, buf: &[u8]) -> Result<usize> {
        let cmd = aux_cmd(AUX_CMD_NATIVE_WRITE, addr, buf.len(), false)?;
        self.aux_run(cmd, Some(buf), None)
    }

    pub(crate) fn aux_i2c_read(&mut self, dev: u32, buf: &mut [u8], mot: bool) -> Result<usize> {
        let nibble = if mot { AUX_CMD_I2C_READ_MOT } else { AUX_CMD_I2C_READ };
        let cmd = aux_cmd(nibble, dev, buf.len(), false)?;
        self.aux_run(cmd, None, Some(buf))
    }

    pub(crate) fn aux_i2c_write(&mut self, dev: u32, buf: &[u8], mot: bool) -> Result<usize> {
        let nibble = if mot { AUX_CMD_I2C_WRITE_MOT } else { AUX_CMD_I2C_WRITE };
        let cmd = aux_cmd(nibble, dev, buf.len(), false)?;
        self.aux_run(cmd, Some(buf), None)
    }

    /// Address-only I2C transaction; with `mot` clear this puts a STOP on the
    /// bus, ending the current I2C transfer.
    pub(crate) fn aux_i2c_address_only(&mut self, dev: u32, mot: bool) -> Result<()> {
        let nibble = if mot { AUX_CMD_I2C_WRITE_MOT } else { AUX_CMD_I2C_WRITE };
        let cmd = aux_cmd(nibble, dev, 1, true)?;
        self.aux_run(cmd, None, None)?;
        Ok(())
    }

    /// Issues one AUX request and runs the reply/retry state described in the
    /// module docs. Returns the number of bytes moved.
    fn aux_run(
        &mut self,
        cmd: u32,
        write_data: Option<&[u8]>,
        mut read_into: Option<&mut [u8]>,
    ) -> Result<usize> {
        let transfer_len = if cmd & AUX_CMD_ADDR_ONLY != 0 {
            0
        } else {
            ((cmd & AUX_CMD_LEN_MASK) as usize) + 1
        };

        for _ in 0..AUX_RETRIES {
            self.check_plugged()?;

            // Clear a stale reply latch from the previous transaction.
            self.hal.write_reg(REG_AUX_STS, AUX_STS_REPLY_RECEIVED);
            if let Some(data) = write_data {
                let words = pack_aux_data(data);
                for (i, word) in words.iter().enumerate() {
                    self.hal.write_reg(aux_data(i), *word);
                }
            }
            self.hal.write_reg(REG_AUX_CMD, cmd);

            let mut reply = None;
            for _ in 0..AUX_REPLY_POLL_TRIES {
                self.hal.delay_us(AUX_REPLY_POLL_INTERVAL_US);
                let sts = self.hal.read_reg(REG_AUX_STS);
                if sts & AUX_STS_REPLY_RECEIVED != 0 && sts & AUX_STS_ACTIVE == 0 {
                    reply = Some(sts);
                    break;
                }
            }
            let Some(sts) = reply else {
                return Err(Error::BusTimeout);
            };

            match sts & AUX_STS_STATUS_MASK {
                AUX_REPLY_ACK => match read_into.as_deref_mut() {
                    None => return Ok(transfer_len),
                    Some(buf) => {
                        let n = ((sts & AUX_STS_BYTES_READ_MASK) >> AUX_STS_BYTES_READ_SHIFT)
                            as usize;
                        if n == 0 {
                            // ACK with nothing read: reset the engine and go
                            // again rather than reporting an empty transfer.
                            warn!("AUX ACK with 0 bytes read, soft-resetting AUX");
                            self.aux_soft_reset();
                            continue;
                        }
                        let n = n.min(buf.len());
                        let mut words = [0u32; 4];
                        for (i, word) in words.iter_mut().enumerate() {
                            *word = self.hal.read_reg(aux_data(i));
                        }
                        unpack_aux_data(&words, &mut buf[..n]);
                        return Ok(n);
                    }
                },
                AUX_REPLY_NACK | AUX_REPLY_I2C_NACK => return Err(Error::NotAcknowledged),
                AUX_REPLY_DEFER | AUX_REPLY_I2C_DEFER => {
                    self.hal.delay_us(AUX_DEFER_DELAY_US);
                }
                status => {
                    warn!(status, "unexpected AUX reply status, soft-resetting AUX");
                    self.aux_soft_reset();
                }
            }
        }
        Err(Error::BusTimeout)
    }

    pub(crate) fn aux_soft_reset(&mut self) {
        let prev = self.hal.read_reg(REG_SOFT_RESET);
        self.hal.write_reg(REG_SOFT_RESET, prev | SOFT_RESET_AUX);
        self.hal.delay_us(10);
        self.hal.write_reg(REG_SOFT_RESET, prev & !SOFT_RESET_AUX);
    }
}

/// Builds an AUX command word: request nibble, 20-bit address, length-1
/// field, optional address-only flag.
fn aux_cmd(nibble: u32, addr: u32, len: usize, address_only: bool) -> Result<u32> {
    if len == 0 || len > AUX_MAX_TRANSFER {
        return Err(Error::InvalidParameter("AUX transfer length must be 1..=16"));
    }
    if addr & !0xF_FFFF != 0 {
        return Err(Error::InvalidParameter("AUX address exceeds 20 bits"));
    }
    let mut cmd = (nibble << AUX_CMD_TYPE_SHIFT)
        | ((addr << AUX_CMD_ADDR_SHIFT) & AUX_CMD_ADDR_MASK)
        | (((len - 1) as u32) << AUX_CMD_LEN_SHIFT);
    if address_only {
        cmd |= AUX_CMD_ADDR_ONLY;
    }
    Ok(cmd)
}

/// Packs up to 16 bytes into the 4 little-endian AUX data words.
pub(crate) fn pack_aux_data(buf: &[u8]) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (i, &b) in buf.iter().enumerate() {
        words[i / 4] |= u32::from(b) << (8 * (i % 4));
    }
    words
}

/// Inverse of [`pack_aux_data`] for the first `buf.len()` bytes.
pub(crate) fn unpack_aux_data(words: &[u32; 4], buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (words[i / 4] >> (8 * (i % 4))) as u8;
    }
}
