use crate::crc::header_crc4;
use crate::{DecodeError, EncodeError, MAX_BODY_LEN};

/// Deepest relative-address path a header can carry (15 link-count hops pack
/// into 7 RAD bytes; real product topologies stop far short of this).
pub const MAX_RAD_HOPS: usize = 14;

/// Worst-case encoded header size: LCT/LCR byte + 7 RAD bytes + 2 framing
/// bytes.
pub const MAX_HEADER_LEN: usize = 10;

/// Nibble path from the source to a branch device.
///
/// An empty path addresses the directly attached device (link count 1). Each
/// hop is the output port number, 0..=15, taken at the previous branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelativeAddress {
    hops: [u8; MAX_RAD_HOPS],
    len: u8,
}

impl RelativeAddress {
    /// Path to the directly attached device.
    pub const fn root() -> Self {
        Self {
            hops: [0; MAX_RAD_HOPS],
            len: 0,
        }
    }

    /// Extends the path by one hop through `port`. Returns `None` when the
    /// path is already at maximum depth.
    pub fn child(&self, port: u8) -> Option<Self> {
        if usize::from(self.len) == MAX_RAD_HOPS {
            return None;
        }
        let mut next = *self;
        next.hops[usize::from(next.len)] = port & 0xf;
        next.len += 1;
        Some(next)
    }

    pub fn hop_count(&self) -> usize {
        usize::from(self.len)
    }

    pub fn hops(&self) -> &[u8] {
        &self.hops[..usize::from(self.len)]
    }

    /// Link count total for a message routed along this path: the directly
    /// attached device is 1 link away.
    pub fn link_count_total(&self) -> u8 {
        self.len + 1
    }
}

/// Decoded sideband message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidebandMsgHeader {
    pub link_count_total: u8,
    pub link_count_remaining: u8,
    pub rad: RelativeAddress,
    pub broadcast: bool,
    pub path_message: bool,
    /// Body bytes in this chunk, including the trailing body CRC byte.
    pub body_length: u8,
    pub start_of_transaction: bool,
    pub end_of_transaction: bool,
    pub sequence_number: u8,
}

impl SidebandMsgHeader {
    /// Header for a unicast request routed along `rad`, carrying a
    /// single-chunk body of `body_length` bytes (CRC included).
    pub fn unicast(rad: RelativeAddress, body_length: u8, seqno: u8) -> Self {
        Self {
            link_count_total: rad.link_count_total(),
            link_count_remaining: rad.hop_count() as u8,
            rad,
            broadcast: false,
            path_message: false,
            body_length,
            start_of_transaction: true,
            end_of_transaction: true,
            sequence_number: seqno & 1,
        }
    }

    /// Header for a broadcast path message (e.g. CLEAR_PAYLOAD_ID_TABLE).
    pub fn broadcast(body_length: u8, seqno: u8) -> Self {
        Self {
            link_count_total: 1,
            link_count_remaining: 6,
            rad: RelativeAddress::root(),
            broadcast: true,
            path_message: true,
            body_length,
            start_of_transaction: true,
            end_of_transaction: true,
            sequence_number: seqno & 1,
        }
    }

    /// Encoded size in bytes: one LCT/LCR byte, `lct / 2` RAD bytes, two
    /// framing bytes.
    pub fn encoded_len(&self) -> usize {
        1 + usize::from(self.link_count_total / 2) + 2
    }

    /// Packs the header into `out`, computing the 4-bit CRC over every header
    /// nibble except the last and OR-ing it into the low nibble of the final
    /// byte. Returns the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        if usize::from(self.body_length) > MAX_BODY_LEN {
            return Err(EncodeError::BodyTooLong {
                len: usize::from(self.body_length),
                max: MAX_BODY_LEN,
            });
        }
        let len = self.encoded_len();
        if out.len() < len {
            return Err(EncodeError::OutputTooSmall {
                needed: len,
                actual: out.len(),
            });
        }

        let mut idx = 0;
        out[idx] = (self.link_count_total & 0xf) << 4 | (self.link_count_remaining & 0xf);
        idx += 1;
        for i in 0..usize::from(self.link_count_total / 2) {
            let hi = self.rad.hops.get(i * 2).copied().unwrap_or(0);
            let lo = self.rad.hops.get(i * 2 + 1).copied().unwrap_or(0);
            out[idx] = hi << 4 | lo;
            idx += 1;
        }
        out[idx] = (u8::from(self.broadcast) << 7)
            | (u8::from(self.path_message) << 6)
            | (self.body_length & 0x3f);
        idx += 1;
        out[idx] = (u8::from(self.start_of_transaction) << 7)
            | (u8::from(self.end_of_transaction) << 6)
            | ((self.sequence_number & 1) << 4);
        let crc = header_crc4(out, idx * 2 + 1);
        out[idx] |= crc;
        Ok(idx + 1)
    }

    /// Unpacks a header from the front of `buf`, verifying the CRC nibble.
    /// Returns the header and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buf.len() < 3 {
            return Err(DecodeError::TooShort {
                needed: 3,
                actual: buf.len(),
            });
        }
        let link_count_total = buf[0] >> 4;
        let link_count_remaining = buf[0] & 0xf;
        let rad_bytes = usize::from(link_count_total / 2);
        let len = 1 + rad_bytes + 2;
        if buf.len() < len {
            return Err(DecodeError::TooShort {
                needed: len,
                actual: buf.len(),
            });
        }

        let expected = header_crc4(buf, (len - 1) * 2 + 1);
        let actual = buf[len - 1] & 0xf;
        if expected != actual {
            return Err(DecodeError::HeaderCrc { expected, actual });
        }

        let mut rad = RelativeAddress::root();
        for i in 0..rad_bytes {
            let byte = buf[1 + i];
            for nibble in [byte >> 4, byte & 0xf] {
                if rad.hop_count() < usize::from(link_count_total.saturating_sub(1)) {
                    rad = rad.child(nibble).ok_or(DecodeError::Malformed("RAD too deep"))?;
                }
            }
        }

        let flags = buf[1 + rad_bytes];
        let tail = buf[len - 1];
        let hdr = Self {
            link_count_total,
            link_count_remaining,
            rad,
            broadcast: flags & 0x80 != 0,
            path_message: flags & 0x40 != 0,
            body_length: flags & 0x3f,
            start_of_transaction: tail & 0x80 != 0,
            end_of_transaction: tail & 0x40 != 0,
            sequence_number: (tail >> 4) & 1,
        };
        Ok((hdr, len))
    }
}
