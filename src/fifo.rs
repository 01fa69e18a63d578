//! Packet I/O engine.
//!
//! The core exposes each FIFO as a single word-wide port: every read pops one
//! 32-bit word from the shared receive FIFO, every write pushes one word into
//! the selected transmit FIFO. These routines move exactly one hardware
//! packet per call and never cross a packet boundary; a 1-3 byte tail still
//! costs one full word (zero-padded on the way out, high bytes dropped on the
//! way in).

use core::convert::TryInto;

use vcell::VolatileCell;

/// Word-wide FIFO port. The only implementation that touches hardware is
/// [`FifoWindow`]; tests substitute a queue.
pub trait WordPort {
    fn pop(&mut self) -> u32;
    fn push(&mut self, word: u32);
}

/// One endpoint's FIFO access window in the core's address space.
pub struct FifoWindow {
    ptr: *const VolatileCell<u32>,
}

impl FifoWindow {
    /// # Safety
    ///
    /// `ptr` must be a live FIFO window of an enabled DWC OTG core.
    pub unsafe fn new(ptr: *const VolatileCell<u32>) -> Self {
        FifoWindow { ptr }
    }
}

impl WordPort for FifoWindow {
    fn pop(&mut self) -> u32 {
        unsafe { (*self.ptr).get() }
    }

    fn push(&mut self, word: u32) {
        unsafe { (*self.ptr).set(word) }
    }
}

/// Read one received packet of `dst.len()` bytes from the receive FIFO.
pub fn read_packet(port: &mut impl WordPort, dst: &mut [u8]) {
    let mut chunks = dst.chunks_exact_mut(4);
    for chunk in &mut chunks {
        chunk.copy_from_slice(&port.pop().to_le_bytes());
    }

    let tail = chunks.into_remainder();
    if !tail.is_empty() {
        let word = port.pop().to_le_bytes();
        let len = tail.len();
        tail.copy_from_slice(&word[..len]);
    }
}

/// Push one whole packet into a transmit FIFO.
pub fn write_packet(port: &mut impl WordPort, src: &[u8]) {
    let mut chunks = src.chunks_exact(4);
    for chunk in &mut chunks {
        port.push(u32::from_le_bytes(chunk.try_into().unwrap()));
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut word = [0u8; 4];
        word[..tail.len()].copy_from_slice(tail);
        port.push(u32::from_le_bytes(word));
    }
}

/// Words a packet of `bytes` occupies in FIFO RAM.
pub fn words_for(bytes: u16) -> u16 {
    (bytes + 3) / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Deque;

    struct QueuePort(Deque<u32, 64>);

    impl QueuePort {
        fn new() -> Self {
            QueuePort(Deque::new())
        }
    }

    impl WordPort for QueuePort {
        fn pop(&mut self) -> u32 {
            self.0.pop_front().expect("FIFO underrun")
        }

        fn push(&mut self, word: u32) {
            self.0.push_back(word).expect("FIFO overrun");
        }
    }

    fn roundtrip(len: usize) {
        let src: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
        let mut port = QueuePort::new();
        write_packet(&mut port, &src);
        assert_eq!(port.0.len(), (len + 3) / 4);

        let mut dst = vec![0u8; len];
        read_packet(&mut port, &mut dst);
        assert_eq!(src, dst);
        assert!(port.0.is_empty());
    }

    #[test]
    fn roundtrip_word_multiples() {
        for len in [0, 4, 8, 64] {
            roundtrip(len);
        }
    }

    #[test]
    fn roundtrip_unaligned_lengths() {
        for len in [1, 2, 3, 5, 7, 30, 63] {
            roundtrip(len);
        }
    }

    #[test]
    fn write_is_little_endian_and_zero_padded() {
        let mut port = QueuePort::new();
        write_packet(&mut port, &[0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(port.pop(), 0x4433_2211);
        assert_eq!(port.pop(), 0x0000_0055);
    }

    #[test]
    fn read_partial_word_keeps_low_bytes() {
        let mut port = QueuePort::new();
        port.push(0xDDCC_BBAA);
        let mut dst = [0u8; 2];
        read_packet(&mut port, &mut dst);
        assert_eq!(dst, [0xAA, 0xBB]);
    }

    #[test]
    fn words_for_rounds_up() {
        assert_eq!(words_for(0), 0);
        assert_eq!(words_for(1), 1);
        assert_eq!(words_for(4), 1);
        assert_eq!(words_for(5), 2);
        assert_eq!(words_for(64), 16);
        assert_eq!(words_for(1023), 256);
    }
}
