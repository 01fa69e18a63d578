//! Per-endpoint transfer state.
//!
//! One record per (endpoint, direction) tracks the in-flight transfer: a
//! cursor over the caller-owned buffer, the requested length and the
//! negotiated max packet size. The driver never owns the memory; it only
//! advances the cursor as packets move, and every slice it hands out is
//! checked against the buffer bound first.

use core::ptr;
use core::slice;

use crate::UsbDirection;

pub fn dir_index(dir: UsbDirection) -> usize {
    (dir == UsbDirection::In) as usize
}

/// Hardware packets needed for a transfer of `total_bytes`.
///
/// A zero-length transfer still takes one (zero-length) packet; an exact
/// multiple of the packet size takes `total / max` packets with no extra
/// terminator, and anything else ends in one short packet.
pub fn packet_count(total_bytes: u16, max_size: u16) -> u16 {
    let mut packets = total_bytes / max_size;
    if total_bytes % max_size != 0 || total_bytes == 0 {
        packets += 1;
    }
    packets
}

pub struct XferCtl {
    buffer: *mut u8,
    total_len: u16,
    offset: u16,
    max_size: u16,
}

impl XferCtl {
    pub const fn new() -> Self {
        XferCtl {
            buffer: ptr::null_mut(),
            total_len: 0,
            offset: 0,
            max_size: 0,
        }
    }

    /// Forget any in-flight transfer but keep the negotiated packet size.
    pub fn reset(&mut self) {
        self.buffer = ptr::null_mut();
        self.total_len = 0;
        self.offset = 0;
    }

    pub fn set_max_size(&mut self, max_size: u16) {
        self.max_size = max_size;
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    /// Record a new transfer over `buffer[..total_len]`.
    ///
    /// Caller guarantees the buffer stays valid until the transfer completes
    /// and that no previous transfer is still in flight on this endpoint and
    /// direction.
    pub fn begin(&mut self, buffer: *mut u8, total_len: u16) {
        self.buffer = buffer;
        self.total_len = total_len;
        self.offset = 0;
    }

    pub fn total_len(&self) -> u16 {
        self.total_len
    }

    pub fn remaining(&self) -> u16 {
        self.total_len - self.offset
    }

    /// The host ended the transfer early; the bytes moved so far are all
    /// there will be.
    pub fn trim_to_received(&mut self) {
        self.total_len = self.offset;
    }

    /// Next `len` bytes to receive into, advancing the cursor. `len` must
    /// not exceed `remaining()`.
    pub fn next_out_chunk(&mut self, len: u16) -> &mut [u8] {
        assert!(len <= self.remaining());
        if len == 0 {
            return &mut [];
        }
        let chunk = unsafe { slice::from_raw_parts_mut(self.buffer.add(self.offset as usize), len as usize) };
        self.offset += len;
        chunk
    }

    /// Next `len` bytes to transmit, advancing the cursor. `len` must not
    /// exceed `remaining()`.
    pub fn next_in_chunk(&mut self, len: u16) -> &[u8] {
        assert!(len <= self.remaining());
        if len == 0 {
            return &[];
        }
        let chunk = unsafe { slice::from_raw_parts(self.buffer.add(self.offset as usize), len as usize) };
        self.offset += len;
        chunk
    }
}

/// Bytes of a control transfer not yet scheduled as a hardware packet, one
/// counter per direction. EP0 can only take one packet per schedule, so a
/// logical control transfer drains this counter one packet at a time.
pub struct Ep0Pending {
    pending: [u16; 2],
}

impl Ep0Pending {
    pub const fn new() -> Self {
        Ep0Pending { pending: [0; 2] }
    }

    pub fn load(&mut self, dir: UsbDirection, total_len: u16) {
        self.pending[dir_index(dir)] = total_len;
    }

    /// Bytes for the next single-packet schedule, bounded by `max_size`;
    /// decrements the counter by the same amount.
    pub fn take_chunk(&mut self, dir: UsbDirection, max_size: u16) -> u16 {
        let pending = &mut self.pending[dir_index(dir)];
        let chunk = (*pending).min(max_size);
        *pending -= chunk;
        chunk
    }

    pub fn remaining(&self, dir: UsbDirection) -> u16 {
        self.pending[dir_index(dir)]
    }

    pub fn clear(&mut self, dir: UsbDirection) {
        self.pending[dir_index(dir)] = 0;
    }

    pub fn clear_all(&mut self) {
        self.pending = [0; 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_count_law() {
        // ceil(len / max), except a zero-length transfer is one ZLP.
        assert_eq!(packet_count(0, 64), 1);
        assert_eq!(packet_count(1, 64), 1);
        assert_eq!(packet_count(64, 64), 1);
        assert_eq!(packet_count(65, 64), 2);
        assert_eq!(packet_count(128, 64), 2);
        assert_eq!(packet_count(150, 64), 3);
        assert_eq!(packet_count(512, 512), 1);
        assert_eq!(packet_count(1023, 1023), 1);
    }

    #[test]
    fn cursor_advances_and_trims() {
        let mut buf = [0u8; 100];
        let mut xfer = XferCtl::new();
        xfer.set_max_size(64);
        xfer.begin(buf.as_mut_ptr(), 100);

        assert_eq!(xfer.next_out_chunk(64).len(), 64);
        assert_eq!(xfer.remaining(), 36);

        // 30-byte short packet ends the transfer at 94 bytes.
        assert_eq!(xfer.next_out_chunk(30).len(), 30);
        xfer.trim_to_received();
        assert_eq!(xfer.total_len(), 94);
        assert_eq!(xfer.remaining(), 0);
    }

    #[test]
    fn in_chunks_walk_the_buffer() {
        let mut buf: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut xfer = XferCtl::new();
        xfer.begin(buf.as_mut_ptr(), 10);

        assert_eq!(xfer.next_in_chunk(4), &[0, 1, 2, 3]);
        assert_eq!(xfer.next_in_chunk(4), &[4, 5, 6, 7]);
        assert_eq!(xfer.next_in_chunk(2), &[8, 9]);
        assert_eq!(xfer.remaining(), 0);
    }

    #[test]
    #[should_panic]
    fn chunk_past_the_bound_panics() {
        let mut buf = [0u8; 8];
        let mut xfer = XferCtl::new();
        xfer.begin(buf.as_mut_ptr(), 8);
        xfer.next_out_chunk(9);
    }

    #[test]
    fn ep0_pending_drains_in_max_size_chunks() {
        let mut ep0 = Ep0Pending::new();
        ep0.load(UsbDirection::In, 150);

        // Strictly decreasing, ceil(150/64) = 3 schedules.
        assert_eq!(ep0.take_chunk(UsbDirection::In, 64), 64);
        assert_eq!(ep0.remaining(UsbDirection::In), 86);
        assert_eq!(ep0.take_chunk(UsbDirection::In, 64), 64);
        assert_eq!(ep0.remaining(UsbDirection::In), 22);
        assert_eq!(ep0.take_chunk(UsbDirection::In, 64), 22);
        assert_eq!(ep0.remaining(UsbDirection::In), 0);
    }

    #[test]
    fn ep0_zero_length_takes_one_empty_chunk() {
        let mut ep0 = Ep0Pending::new();
        ep0.load(UsbDirection::Out, 0);
        assert_eq!(ep0.take_chunk(UsbDirection::Out, 64), 0);
        assert_eq!(ep0.remaining(UsbDirection::Out), 0);
    }

    #[test]
    fn directions_are_independent() {
        let mut ep0 = Ep0Pending::new();
        ep0.load(UsbDirection::In, 64);
        ep0.load(UsbDirection::Out, 8);
        assert_eq!(ep0.take_chunk(UsbDirection::In, 64), 64);
        assert_eq!(ep0.remaining(UsbDirection::Out), 8);
    }
}
