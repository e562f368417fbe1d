//! EDID retrieval over I2C-over-AUX.
//!
//! A display may legitimately carry no EDID, so everything that only means
//! "no usable EDID" (NACKed I2C address, bad header magic, bad block
//! checksum) comes back as `Ok(None)` rather than an error; bus-level
//! failures still propagate.

use tracing::warn;

use crate::aux_ch::AUX_MAX_TRANSFER;
use crate::hal::{DptxHal, SocOps};
use crate::session::DptxSession;
use crate::{Error, Result};

pub const EDID_BLOCK_SIZE: usize = 128;
const EDID_I2C_ADDR: u32 = 0x50;
const EDID_SEGMENT_ADDR: u32 = 0x30;
const EDID_HEADER: [u8; 8] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
const MAX_EXTENSION_BLOCKS: usize = 3;

impl<H: DptxHal, S: SocOps> DptxSession<H, S> {
    /// Reads the sink's EDID: the base block plus up to three extension
    /// blocks, each verified against the 256-sum checksum.
    pub fn read_edid(&mut self) -> Result<Option<Vec<u8>>> {
        let mut base = [0u8; EDID_BLOCK_SIZE];
        match self.read_edid_block(0, &mut base) {
            Ok(()) => {}
            Err(Error::NotAcknowledged) => return Ok(None),
            Err(err) => return Err(err),
        }
        if base[..8] != EDID_HEADER {
            warn!("EDID header magic mismatch, treating as no EDID");
            return Ok(None);
        }
        if !block_checksum_ok(&base) {
            warn!("EDID base block failed checksum, treating as no EDID");
            return Ok(None);
        }

        let mut edid = base.to_vec();
        let extensions = usize::from(base[126]).min(MAX_EXTENSION_BLOCKS);
        for block in 1..=extensions {
            let mut ext = [0u8; EDID_BLOCK_SIZE];
            if let Err(err) = self.read_edid_block(block, &mut ext) {
                warn!(block, %err, "EDID extension read failed, keeping earlier blocks");
                break;
            }
            if !block_checksum_ok(&ext) {
                warn!(block, "EDID extension block failed checksum, dropping it");
                break;
            }
            edid.extend_from_slice(&ext);
        }
        Ok(Some(edid))
    }

    /// One 128-byte block using segment (0x30) + offset (0x50) addressing,
    /// read in 16-byte middle-of-transaction chunks and finished with an
    /// address-only STOP.
    fn read_edid_block(&mut self, block: usize, out: &mut [u8; EDID_BLOCK_SIZE]) -> Result<()> {
        let segment = (block / 2) as u8;
        let offset = ((block % 2) * EDID_BLOCK_SIZE) as u8;
        if segment != 0 {
            self.aux_i2c_write(EDID_SEGMENT_ADDR, &[segment], true)?;
        }
        self.aux_i2c_write(EDID_I2C_ADDR, &[offset], true)?;
        let mut done = 0;
        while done < out.len() {
            let chunk = (out.len() - done).min(AUX_MAX_TRANSFER);
            let n = self.aux_i2c_read(EDID_I2C_ADDR, &mut out[done..done + chunk], true)?;
            done += n;
        }
        self.aux_i2c_address_only(EDID_I2C_ADDR, false)
    }
}

fn block_checksum_ok(block: &[u8]) -> bool {
    block.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
}
