//! Message buffers and the pinned-memory allocator.
//!
//! A [`MsgBuffer`] holds one multi-packet message: a contiguous payload
//! region plus one 16-byte header slot per packet. Packet 0's header is
//! immediately before the payload, so a single-packet message is one
//! contiguous wire image; headers for packets 1..n live in a trailer
//! region after the payload:
//!
//! ```text
//! [hdr 0][payload ........][hdr 1][hdr 2]...[hdr n-1]
//! ```
//!
//! Buffers are page-aligned and registered with the transport at
//! allocation, so the NIC can DMA from them directly. A buffer is owned
//! exclusively by the session slot that is transmitting or assembling it.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::packet::{self, PktHdr, MAX_MSG_SIZE, PKT_HDR_SIZE};
use crate::transport::{MemRegFns, MemRegInfo};

/// Alignment for message buffer regions.
pub const BUFFER_ALIGN: usize = 4096;

/// A registered, multi-packet message buffer.
pub struct MsgBuffer {
    ptr: NonNull<u8>,
    /// Total allocated bytes: header slots + payload region.
    capacity: usize,
    max_data_size: usize,
    data_size: usize,
    max_num_pkts: u16,
    num_pkts: u16,
    data_per_pkt: usize,
    reg: MemRegInfo,
    dereg: MemRegFns,
}

impl MsgBuffer {
    fn layout_bytes(max_data_size: usize, max_num_pkts: u16) -> usize {
        max_data_size + PKT_HDR_SIZE * max_num_pkts as usize
    }

    /// Allocate and register a buffer able to hold `max_data_size` payload
    /// bytes at the given MTU. The buffer starts sized to its maximum.
    pub(crate) fn alloc(max_data_size: usize, mtu: usize, reg_fns: &MemRegFns) -> Result<Self> {
        if max_data_size > MAX_MSG_SIZE {
            return Err(Error::MsgTooLarge {
                size: max_data_size,
                max: MAX_MSG_SIZE,
            });
        }

        let max_num_pkts = packet::data_size_to_num_pkts(max_data_size, mtu);
        let capacity = Self::layout_bytes(max_data_size, max_num_pkts);

        let ptr = unsafe {
            let mut raw: *mut libc::c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut raw, BUFFER_ALIGN, capacity);
            if ret != 0 {
                return Err(Error::BufferExhausted);
            }
            std::ptr::write_bytes(raw as *mut u8, 0, capacity);
            NonNull::new_unchecked(raw as *mut u8)
        };

        let reg = (reg_fns.reg)(ptr.as_ptr(), capacity);

        Ok(Self {
            ptr,
            capacity,
            max_data_size,
            data_size: max_data_size,
            max_num_pkts,
            num_pkts: max_num_pkts,
            data_per_pkt: mtu - PKT_HDR_SIZE,
            reg,
            dereg: reg_fns.clone(),
        })
    }

    /// Shrink (or re-grow, up to the allocated maximum) the message size.
    pub fn resize(&mut self, new_data_size: usize) -> Result<()> {
        if new_data_size > self.max_data_size {
            return Err(Error::MsgTooLarge {
                size: new_data_size,
                max: self.max_data_size,
            });
        }
        self.data_size = new_data_size;
        self.num_pkts = packet::data_size_to_num_pkts(new_data_size, self.data_per_pkt + PKT_HDR_SIZE);
        Ok(())
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    #[inline]
    pub fn num_pkts(&self) -> u16 {
        self.num_pkts
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.reg.lkey
    }

    /// Payload region of the current message.
    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(PKT_HDR_SIZE), self.data_size) }
    }

    /// Mutable payload region of the current message.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(PKT_HDR_SIZE), self.data_size)
        }
    }

    /// Fill from a byte slice, resizing to fit.
    pub fn copy_from(&mut self, src: &[u8]) -> Result<()> {
        self.resize(src.len())?;
        self.data_mut().copy_from_slice(src);
        Ok(())
    }

    fn hdr_slot_ptr(&self, pkt_idx: u16) -> *mut u8 {
        debug_assert!(pkt_idx < self.max_num_pkts);
        let off = if pkt_idx == 0 {
            0
        } else {
            PKT_HDR_SIZE + self.max_data_size + (pkt_idx as usize - 1) * PKT_HDR_SIZE
        };
        unsafe { self.ptr.as_ptr().add(off) }
    }

    /// Read the stamped header for packet `pkt_idx`.
    #[inline]
    pub fn pkt_hdr(&self, pkt_idx: u16) -> PktHdr {
        unsafe { PktHdr::read_from(self.hdr_slot_ptr(pkt_idx)) }
    }

    /// Stamp the header for packet `pkt_idx`.
    #[inline]
    pub fn set_pkt_hdr(&mut self, pkt_idx: u16, hdr: &PktHdr) {
        unsafe { hdr.write_to(self.hdr_slot_ptr(pkt_idx)) }
    }

    /// Payload offset of packet `pkt_idx` within the data region.
    #[inline]
    pub fn pkt_data_offset(&self, pkt_idx: u16) -> usize {
        pkt_idx as usize * self.data_per_pkt
    }

    /// Payload bytes carried by packet `pkt_idx` at the current size.
    #[inline]
    pub fn pkt_data_bytes(&self, pkt_idx: u16) -> usize {
        let off = self.pkt_data_offset(pkt_idx);
        self.data_size.saturating_sub(off).min(self.data_per_pkt)
    }

    /// Raw pointer to packet `pkt_idx`'s payload, for TX descriptors.
    #[inline]
    pub fn pkt_data_ptr(&self, pkt_idx: u16) -> *const u8 {
        unsafe {
            self.ptr
                .as_ptr()
                .add(PKT_HDR_SIZE + self.pkt_data_offset(pkt_idx))
        }
    }
}

impl Drop for MsgBuffer {
    fn drop(&mut self) {
        (self.dereg.dereg)(self.reg);
        unsafe {
            libc::free(self.ptr.as_ptr() as *mut libc::c_void);
        }
    }
}

// The buffer owns its region exclusively; registration handles are plain
// data. Background workers receive buffers by move and hand them back
// through the reply queue.
unsafe impl Send for MsgBuffer {}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("data_size", &self.data_size)
            .field("max_data_size", &self.max_data_size)
            .field("num_pkts", &self.num_pkts)
            .finish()
    }
}

/// Allocator for pinned, registered message buffers.
///
/// Deployment backs this with hugepage slabs; each allocation here is one
/// page-aligned region registered through the transport's callbacks, and
/// deregistered when the buffer drops.
pub struct HugeAlloc {
    reg_fns: MemRegFns,
    mtu: usize,
    bytes_allocated: usize,
}

impl HugeAlloc {
    pub fn new(mtu: usize, reg_fns: MemRegFns) -> Self {
        Self {
            reg_fns,
            mtu,
            bytes_allocated: 0,
        }
    }

    /// Allocate a registered buffer for up to `max_data_size` payload
    /// bytes.
    pub fn alloc_msg_buffer(&mut self, max_data_size: usize) -> Result<MsgBuffer> {
        let buf = MsgBuffer::alloc(max_data_size, self.mtu, &self.reg_fns)?;
        self.bytes_allocated += buf.capacity;
        Ok(buf)
    }

    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_alloc() -> HugeAlloc {
        HugeAlloc::new(4096, MemRegFns::noop())
    }

    #[test]
    fn test_single_pkt_buffer() {
        let mut alloc = test_alloc();
        let mut buf = alloc.alloc_msg_buffer(100).unwrap();
        assert_eq!(buf.num_pkts(), 1);
        assert_eq!(buf.data_size(), 100);

        buf.data_mut().copy_from_slice(&[7u8; 100]);
        assert_eq!(buf.data(), &[7u8; 100][..]);
    }

    #[test]
    fn test_multi_pkt_layout() {
        let mtu = 4096usize;
        let dpp = mtu - PKT_HDR_SIZE;
        let mut alloc = HugeAlloc::new(mtu, MemRegFns::noop());
        let buf = alloc.alloc_msg_buffer(dpp * 2 + 10).unwrap();
        assert_eq!(buf.num_pkts(), 3);
        assert_eq!(buf.pkt_data_bytes(0), dpp);
        assert_eq!(buf.pkt_data_bytes(1), dpp);
        assert_eq!(buf.pkt_data_bytes(2), 10);
        assert_eq!(buf.pkt_data_offset(2), dpp * 2);
    }

    #[test]
    fn test_hdr_slots_roundtrip() {
        let mtu = 4096usize;
        let dpp = mtu - PKT_HDR_SIZE;
        let mut alloc = HugeAlloc::new(mtu, MemRegFns::noop());
        let mut buf = alloc.alloc_msg_buffer(dpp * 3).unwrap();

        use crate::packet::PktType;
        for i in 0..3u16 {
            let hdr = PktHdr::new(9, dpp * 3, 4, PktType::Req, i, 1234);
            buf.set_pkt_hdr(i, &hdr);
        }
        for i in 0..3u16 {
            let hdr = buf.pkt_hdr(i);
            assert_eq!(hdr.pkt_num(), i);
            assert_eq!(hdr.req_num(), 1234);
        }
        // Header slots must not clobber payload.
        assert!(buf.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_resize() {
        let mut alloc = test_alloc();
        let mut buf = alloc.alloc_msg_buffer(10000).unwrap();
        assert_eq!(buf.num_pkts(), 3);

        buf.resize(100).unwrap();
        assert_eq!(buf.num_pkts(), 1);
        assert_eq!(buf.data_size(), 100);

        buf.resize(10000).unwrap();
        assert_eq!(buf.num_pkts(), 3);

        assert!(buf.resize(10001).is_err());
    }

    #[test]
    fn test_oversize_rejected() {
        let mut alloc = test_alloc();
        assert!(alloc.alloc_msg_buffer(MAX_MSG_SIZE + 1).is_err());
    }
}
