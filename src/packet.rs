//! Datapath wire header.
//!
//! Every packet opens with a fixed 16-byte header that makes it
//! self-describing: the receiver locates the owning session slot from
//! `(dest_session_num, req_num)` alone and places the payload by packet
//! number, so no per-packet state travels out of band.
//!
//! On-wire packing (all multi-byte fields little-endian):
//!
//! ```text
//! byte 0        request type
//! bytes 1-3     message size, 24 bits
//! bytes 4-5     destination session number
//! bytes 6-7     packet number (low 14 bits) | packet kind (top 2 bits)
//! bytes 8-13    request number, 44 bits
//! byte 14       zero
//! byte 15       magic
//! ```
//!
//! In memory the header is a plain struct of decoded fields;
//! [`PktHdr::to_bytes`] and [`PktHdr::from_bytes`] are the only code
//! that knows the packing above.

use crate::error::{Error, Result};

/// Encoded header size in bytes.
pub const PKT_HDR_SIZE: usize = 16;

/// Trailing magic byte of every valid header.
pub const PKT_MAGIC: u8 = 0xEC;

/// Largest encodable message payload (24-bit size field).
pub const MAX_MSG_SIZE: usize = (1 << 24) - 1;

/// Largest encodable request number (44-bit field).
pub const MAX_REQ_NUM: u64 = (1 << 44) - 1;

/// Largest encodable packet number (14-bit field).
pub const MAX_PKT_NUM: u16 = (1 << 14) - 1;

/// Packet kind, two bits on the wire. Every two-bit value is a kind, so
/// decoding cannot fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// Request data.
    Req = 0,
    /// Request-for-response: asks the server for one more response
    /// packet, named by `pkt_num`. Header only.
    Rfr = 1,
    /// Response data.
    Resp = 2,
    /// Explicit credit return, used when no response data exists to
    /// carry the credit implicitly. Header only.
    ExplicitCr = 3,
}

impl PktType {
    #[inline]
    fn from_wire(bits: u16) -> Self {
        match bits & 0x3 {
            0 => PktType::Req,
            1 => PktType::Rfr,
            2 => PktType::Resp,
            _ => PktType::ExplicitCr,
        }
    }
}

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktHdr {
    req_type: u8,
    msg_size: u32,
    dest_session_num: u16,
    pkt_type: PktType,
    pkt_num: u16,
    req_num: u64,
}

impl PktHdr {
    pub fn new(
        req_type: u8,
        msg_size: usize,
        dest_session_num: u16,
        pkt_type: PktType,
        pkt_num: u16,
        req_num: u64,
    ) -> Self {
        debug_assert!(msg_size <= MAX_MSG_SIZE);
        debug_assert!(pkt_num <= MAX_PKT_NUM);
        debug_assert!(req_num <= MAX_REQ_NUM);
        Self {
            req_type,
            msg_size: msg_size as u32,
            dest_session_num,
            pkt_type,
            pkt_num,
            req_num,
        }
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// Total message payload size in bytes.
    #[inline]
    pub fn msg_size(&self) -> usize {
        self.msg_size as usize
    }

    #[inline]
    pub fn dest_session_num(&self) -> u16 {
        self.dest_session_num
    }

    #[inline]
    pub fn pkt_type(&self) -> PktType {
        self.pkt_type
    }

    /// Packet index within the message, or the requested response packet
    /// index for RFR.
    #[inline]
    pub fn pkt_num(&self) -> u16 {
        self.pkt_num
    }

    #[inline]
    pub fn req_num(&self) -> u64 {
        self.req_num
    }

    /// Encode into the 16-byte wire image.
    pub fn to_bytes(&self) -> [u8; PKT_HDR_SIZE] {
        let mut w = [0u8; PKT_HDR_SIZE];
        w[0] = self.req_type;
        w[1..4].copy_from_slice(&self.msg_size.to_le_bytes()[..3]);
        w[4..6].copy_from_slice(&self.dest_session_num.to_le_bytes());
        let num_kind = (self.pkt_num & MAX_PKT_NUM) | ((self.pkt_type as u16) << 14);
        w[6..8].copy_from_slice(&num_kind.to_le_bytes());
        w[8..14].copy_from_slice(&(self.req_num & MAX_REQ_NUM).to_le_bytes()[..6]);
        w[15] = PKT_MAGIC;
        w
    }

    fn unpack(w: &[u8; PKT_HDR_SIZE]) -> Self {
        let num_kind = u16::from_le_bytes([w[6], w[7]]);
        Self {
            req_type: w[0],
            msg_size: u32::from_le_bytes([w[1], w[2], w[3], 0]),
            dest_session_num: u16::from_le_bytes([w[4], w[5]]),
            pkt_type: PktType::from_wire(num_kind >> 14),
            pkt_num: num_kind & MAX_PKT_NUM,
            req_num: u64::from_le_bytes([w[8], w[9], w[10], w[11], w[12], w[13] & 0x0F, 0, 0]),
        }
    }

    /// Parse and validate a header from the front of a received packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PKT_HDR_SIZE {
            return Err(Error::BufferTooSmall {
                required: PKT_HDR_SIZE,
                available: bytes.len(),
            });
        }
        let w: &[u8; PKT_HDR_SIZE] = bytes[..PKT_HDR_SIZE].try_into().unwrap();
        if w[PKT_HDR_SIZE - 1] != PKT_MAGIC {
            return Err(Error::InvalidMagic {
                expected: PKT_MAGIC,
                got: w[PKT_HDR_SIZE - 1],
            });
        }
        Ok(Self::unpack(w))
    }

    /// Encode straight into a message buffer's header slot.
    ///
    /// # Safety
    /// `dst` must be writable for `PKT_HDR_SIZE` bytes.
    #[inline]
    pub unsafe fn write_to(&self, dst: *mut u8) {
        let w = self.to_bytes();
        unsafe { std::ptr::copy_nonoverlapping(w.as_ptr(), dst, PKT_HDR_SIZE) }
    }

    /// Decode from a header slot the engine stamped earlier. Skips magic
    /// validation; untrusted input goes through [`PktHdr::from_bytes`].
    ///
    /// # Safety
    /// `src` must be readable for `PKT_HDR_SIZE` bytes.
    #[inline]
    pub unsafe fn read_from(src: *const u8) -> Self {
        let mut w = [0u8; PKT_HDR_SIZE];
        unsafe { std::ptr::copy_nonoverlapping(src, w.as_mut_ptr(), PKT_HDR_SIZE) };
        Self::unpack(&w)
    }
}

/// Number of packets carrying `data_size` payload bytes at the given
/// MTU. Division-free when the message fits one packet; a zero-byte
/// message still occupies one.
#[inline]
pub fn data_size_to_num_pkts(data_size: usize, mtu: usize) -> u16 {
    let per_pkt = mtu - PKT_HDR_SIZE;
    if data_size <= per_pkt {
        return 1;
    }
    data_size.div_ceil(per_pkt) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golden_wire_image() {
        let hdr = PktHdr::new(0x2C, 0x0A0B0C, 0xD00D, PktType::Rfr, 517, 0x0BAD_CAFE_F00D);
        let w = hdr.to_bytes();
        // num_kind: pkt_num 517 = 0x205, kind Rfr (1) in the top two
        // bits, so 0x4205 little-endian.
        let expected: [u8; PKT_HDR_SIZE] = [
            0x2C, // req_type
            0x0C, 0x0B, 0x0A, // msg_size
            0x0D, 0xD0, // dest_session_num
            0x05, 0x42, // pkt_num | kind
            0x0D, 0xF0, 0xFE, 0xCA, 0xAD, 0x0B, // req_num
            0x00, PKT_MAGIC,
        ];
        assert_eq!(w, expected);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let hdr = PktHdr::new(
            0xA7,
            MAX_MSG_SIZE,
            1,
            PktType::ExplicitCr,
            MAX_PKT_NUM,
            MAX_REQ_NUM,
        );
        let back = PktHdr::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(hdr, back);
        assert_eq!(back.req_type(), 0xA7);
        assert_eq!(back.msg_size(), MAX_MSG_SIZE);
        assert_eq!(back.dest_session_num(), 1);
        assert_eq!(back.pkt_type(), PktType::ExplicitCr);
        assert_eq!(back.pkt_num(), MAX_PKT_NUM);
        assert_eq!(back.req_num(), MAX_REQ_NUM);
    }

    #[test]
    fn test_every_kind_survives_the_wire() {
        for (kind, bits) in [
            (PktType::Req, 0u16),
            (PktType::Rfr, 1),
            (PktType::Resp, 2),
            (PktType::ExplicitCr, 3),
        ] {
            let hdr = PktHdr::new(0, 9, 2, kind, 4, 31);
            let w = hdr.to_bytes();
            assert_eq!(u16::from_le_bytes([w[6], w[7]]) >> 14, bits);
            assert_eq!(PktHdr::from_bytes(&w).unwrap().pkt_type(), kind);
        }
    }

    #[test]
    fn test_header_slot_roundtrip() {
        let hdr = PktHdr::new(3, 800_000, 77, PktType::Resp, 196, 0x51_F0CC);
        let mut slot = [0u8; PKT_HDR_SIZE];
        let back = unsafe {
            hdr.write_to(slot.as_mut_ptr());
            PktHdr::read_from(slot.as_ptr())
        };
        assert_eq!(hdr, back);
    }

    #[test]
    fn test_short_and_corrupt_headers_rejected() {
        let hdr = PktHdr::new(0, 0, 0, PktType::Req, 0, 0);
        let w = hdr.to_bytes();

        assert!(PktHdr::from_bytes(&w[..PKT_HDR_SIZE - 1]).is_err());
        assert!(PktHdr::from_bytes(&[]).is_err());

        let mut corrupt = w;
        corrupt[PKT_HDR_SIZE - 1] ^= 0xFF;
        assert!(PktHdr::from_bytes(&corrupt).is_err());
    }

    #[test]
    fn test_pkt_count_boundaries() {
        let mtu = 1024;
        let per_pkt = mtu - PKT_HDR_SIZE; // 1008

        assert_eq!(data_size_to_num_pkts(0, mtu), 1);
        assert_eq!(data_size_to_num_pkts(per_pkt, mtu), 1);
        assert_eq!(data_size_to_num_pkts(per_pkt + 1, mtu), 2);
        assert_eq!(data_size_to_num_pkts(7 * per_pkt, mtu), 7);
        assert_eq!(data_size_to_num_pkts(7 * per_pkt + 1, mtu), 8);
    }
}
