//! FIFO RAM allocator.
//!
//! The core has one small dedicated RAM, counted in 32-bit words, that must
//! be partitioned into a single shared receive FIFO (always the lowest
//! addresses) and one transmit FIFO per active IN endpoint above it:
//!
//! ```text
//! --------------- FIFO_DEPTH_WORDS
//! | IN FIFO n   |
//! ---------------
//! |    ...      |
//! ---------------
//! | IN FIFO 0   |
//! --------------- GRXFSIZ
//! | OUT FIFO    |
//! | ( shared )  |
//! --------------- 0
//! ```
//!
//! Two layouts exist. The bring-up layout runs on every bus reset, knows
//! nothing about the upcoming configuration and reserves a worst case for
//! EP0 only; it cannot fail. The configuration-time layout reads the actual
//! endpoint descriptors for a tighter fit and is allowed to decline when the
//! descriptors demand more RAM than the silicon has.

use usb_device::endpoint::EndpointType;

use crate::fifo::words_for;
use crate::{Error, UsbDirection, MAX_ENDPOINTS};

const DESC_TYPE_ENDPOINT: u8 = 5;
const ENDPOINT_DESC_LEN: usize = 7;

/// Words of the shared receive FIFO reserved ahead of any OUT data: SETUP
/// packet staging (up to three packets), status words, global NAK status.
const RX_FIXED_OVERHEAD: u16 = 15;

/// Bring-up receive FIFO size in words: 10 for buffered SETUP packets, 2 for
/// the control OUT status words, the EP0 packet itself, plus the 1 + 6 slack
/// the original hardware validation settled on for 8..=64 byte EP0 sizes.
pub fn bringup_rx_words(ep0_size: u16) -> u16 {
    10 + 2 + ep0_size / 4 + 1 + 6
}

/// Largest packet size each endpoint uses in a configuration, across all
/// alternate settings, and which transfer types it is used with.
#[derive(Debug)]
pub struct EndpointReport {
    size: [[u16; 2]; MAX_ENDPOINTS],
    /// Bit per `EndpointType` discriminant.
    type_mask: [[u8; 2]; MAX_ENDPOINTS],
}

impl EndpointReport {
    /// Walk a raw configuration descriptor and collect every endpoint
    /// descriptor in it. EP0 is seeded as a control endpoint of `ep0_size`;
    /// it never appears in descriptors.
    pub fn from_config_descriptor(
        desc: &[u8],
        ep_count: usize,
        ep0_size: u16,
    ) -> Result<Self, Error> {
        let mut report = EndpointReport {
            size: [[0; 2]; MAX_ENDPOINTS],
            type_mask: [[0; 2]; MAX_ENDPOINTS],
        };
        report.size[0] = [ep0_size; 2];
        let control_bit = 1 << EndpointType::Control as u8;
        report.type_mask[0] = [control_bit; 2];

        let mut pos = 0;
        while pos < desc.len() {
            let len = desc[pos] as usize;
            if len == 0 || pos + len > desc.len() {
                return Err(Error::InvalidDescriptor);
            }

            if desc[pos + 1] == DESC_TYPE_ENDPOINT {
                if len < ENDPOINT_DESC_LEN {
                    return Err(Error::InvalidDescriptor);
                }
                let addr = desc[pos + 2];
                let epnum = (addr & 0xF) as usize;
                let dir = if addr & 0x80 != 0 { 1 } else { 0 };
                let xfer_type = desc[pos + 3] & 0x3;
                let max_size =
                    u16::from_le_bytes([desc[pos + 4], desc[pos + 5]]) & 0x7FF;

                if epnum >= ep_count {
                    return Err(Error::InvalidDescriptor);
                }

                report.size[epnum][dir] = report.size[epnum][dir].max(max_size);
                report.type_mask[epnum][dir] |= 1 << xfer_type;
            }

            pos += len;
        }

        Ok(report)
    }

    pub fn size(&self, epnum: usize, dir: UsbDirection) -> u16 {
        self.size[epnum][(dir == UsbDirection::In) as usize]
    }

    pub fn uses_type(&self, epnum: usize, dir: UsbDirection, ty: EndpointType) -> bool {
        let di = (dir == UsbDirection::In) as usize;
        self.type_mask[epnum][di] & (1 << ty as u8) != 0
    }

    fn used(&self, epnum: usize, dir: UsbDirection) -> bool {
        self.type_mask[epnum][(dir == UsbDirection::In) as usize] != 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TxAlloc {
    pub offset: u16,
    pub words: u16,
}

/// A complete FIFO partition, computed before any register is touched so a
/// declined allocation leaves the hardware untouched.
#[derive(Debug)]
pub struct FifoLayout {
    pub rx_words: u16,
    /// Per IN endpoint; `words == 0` means the endpoint has no FIFO.
    pub tx: [TxAlloc; MAX_ENDPOINTS],
}

impl FifoLayout {
    /// Descriptor-driven layout.
    ///
    /// Receive FIFO: fixed overhead + the two largest OUT packet sizes
    /// (word-rounded) + 2 words per active OUT endpoint + 2. Each IN
    /// endpoint gets its word-rounded packet size; bulk and control IN
    /// endpoints additionally split the spare words equally. Isochronous
    /// endpoints move exactly one packet per frame and interrupt endpoints
    /// are bandwidth-capped, so buffering beyond one packet buys neither
    /// anything.
    pub fn for_report(
        report: &EndpointReport,
        ep_count: usize,
        fifo_depth_words: u16,
    ) -> Result<FifoLayout, Error> {
        // Two largest OUT endpoint sizes and the active OUT count.
        let mut largest = [0u16; 2];
        let mut out_eps = 0u16;
        for epnum in 0..ep_count {
            if report.used(epnum, UsbDirection::Out) {
                out_eps += 1;
            }
            let size = report.size(epnum, UsbDirection::Out);
            if size > largest[0] {
                largest[1] = largest[0];
                largest[0] = size;
            } else if size > largest[1] {
                largest[1] = size;
            }
        }

        let rx_words = RX_FIXED_OVERHEAD
            + 2 * out_eps
            + words_for(largest[0])
            + words_for(largest[1])
            + 2;

        let ep0_words = report.size(0, UsbDirection::In) / 4;
        let mut allocated = rx_words + ep0_words;
        if allocated > fifo_depth_words {
            return Err(Error::WouldOverflowFifo);
        }

        // Demand of the remaining IN endpoints, and how many of them are
        // bulk/control (the ones that profit from spare space).
        let mut in_words_total = 0u16;
        let mut bulk_control = 0u16;
        for epnum in 1..ep_count {
            in_words_total += words_for(report.size(epnum, UsbDirection::In));
            if report.uses_type(epnum, UsbDirection::In, EndpointType::Bulk)
                || report.uses_type(epnum, UsbDirection::In, EndpointType::Control)
            {
                bulk_control += 1;
            }
        }

        let fifo_remaining = fifo_depth_words - allocated;
        if in_words_total > fifo_remaining {
            return Err(Error::WouldOverflowFifo);
        }

        let extra = if bulk_control > 0 {
            (fifo_remaining - in_words_total) / bulk_control
        } else {
            0
        };

        let mut tx = [TxAlloc::default(); MAX_ENDPOINTS];
        tx[0] = TxAlloc {
            offset: rx_words,
            words: ep0_words,
        };

        for epnum in 1..ep_count {
            let size = report.size(epnum, UsbDirection::In);
            if size == 0 {
                continue;
            }
            let mut words = words_for(size);
            if report.uses_type(epnum, UsbDirection::In, EndpointType::Bulk)
                || report.uses_type(epnum, UsbDirection::In, EndpointType::Control)
            {
                words += extra;
            }
            tx[epnum] = TxAlloc {
                offset: allocated,
                words,
            };
            allocated += words;
        }

        Ok(FifoLayout { rx_words, tx })
    }

    pub fn total_words(&self) -> u16 {
        self.rx_words + self.tx.iter().map(|t| t.words).sum::<u16>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_desc(addr: u8, attributes: u8, max_size: u16) -> [u8; 7] {
        let mps = max_size.to_le_bytes();
        [7, DESC_TYPE_ENDPOINT, addr, attributes, mps[0], mps[1], 1]
    }

    fn config_with(endpoints: &[[u8; 7]]) -> Vec<u8> {
        let total = 9 + 9 + 7 * endpoints.len();
        let mut desc = vec![9, 2, total as u8, (total >> 8) as u8, 1, 1, 0, 0x80, 50];
        desc.extend_from_slice(&[9, 4, 0, 0, endpoints.len() as u8, 0xFF, 0, 0, 0]);
        for ep in endpoints {
            desc.extend_from_slice(ep);
        }
        desc
    }

    fn layout_for(endpoints: &[[u8; 7]], depth: u16) -> Result<FifoLayout, Error> {
        let desc = config_with(endpoints);
        let report = EndpointReport::from_config_descriptor(&desc, 4, 64).unwrap();
        FifoLayout::for_report(&report, 4, depth)
    }

    fn assert_partition_valid(layout: &FifoLayout, depth: u16) {
        // RX occupies the bottom; TX FIFOs stack above without overlap.
        let mut regions = vec![(0u16, layout.rx_words)];
        for tx in layout.tx.iter().filter(|t| t.words > 0) {
            regions.push((tx.offset, tx.words));
        }
        regions.sort();
        let mut prev_end = 0;
        for (offset, words) in regions {
            assert!(offset >= prev_end, "overlapping FIFO regions");
            prev_end = offset + words;
        }
        assert!(prev_end <= depth);
    }

    #[test]
    fn report_takes_max_across_alternate_settings() {
        let desc = config_with(&[
            endpoint_desc(0x81, 2, 64),
            endpoint_desc(0x81, 2, 32),
            endpoint_desc(0x01, 2, 16),
        ]);
        let report = EndpointReport::from_config_descriptor(&desc, 4, 64).unwrap();
        assert_eq!(report.size(1, UsbDirection::In), 64);
        assert_eq!(report.size(1, UsbDirection::Out), 16);
        assert!(report.uses_type(1, UsbDirection::In, EndpointType::Bulk));
        assert!(!report.uses_type(1, UsbDirection::In, EndpointType::Interrupt));
    }

    #[test]
    fn report_rejects_truncated_descriptor() {
        let mut desc = config_with(&[endpoint_desc(0x81, 2, 64)]);
        desc.truncate(desc.len() - 2);
        assert_eq!(
            EndpointReport::from_config_descriptor(&desc, 4, 64).unwrap_err(),
            Error::InvalidDescriptor
        );
    }

    #[test]
    fn report_rejects_endpoint_out_of_range() {
        let desc = config_with(&[endpoint_desc(0x85, 2, 64)]);
        assert_eq!(
            EndpointReport::from_config_descriptor(&desc, 4, 64).unwrap_err(),
            Error::InvalidDescriptor
        );
    }

    #[test]
    fn rx_fifo_sizing_formula() {
        // EP0 (64B, always counted) and one 64-byte bulk OUT: two active OUT
        // endpoints, the two largest sizes are both 64 bytes.
        let layout = layout_for(&[endpoint_desc(0x01, 2, 64)], 320).unwrap();
        assert_eq!(layout.rx_words, 15 + 2 * 2 + 16 + 16 + 2);
        assert_eq!(layout.tx[0].offset, layout.rx_words);
        assert_eq!(layout.tx[0].words, 16);
    }

    #[test]
    fn partition_is_disjoint_and_bounded() {
        let layout = layout_for(
            &[
                endpoint_desc(0x81, 2, 64),
                endpoint_desc(0x01, 2, 64),
                endpoint_desc(0x82, 3, 16),
                endpoint_desc(0x83, 1, 128),
            ],
            320,
        )
        .unwrap();
        assert_partition_valid(&layout, 320);
        assert!(layout.total_words() <= 320);
    }

    #[test]
    fn bulk_gets_spare_words_interrupt_and_iso_do_not() {
        let layout = layout_for(
            &[
                endpoint_desc(0x81, 2, 64),
                endpoint_desc(0x82, 3, 64),
                endpoint_desc(0x83, 1, 64),
            ],
            320,
        )
        .unwrap();
        // All three demand 16 words; only the bulk endpoint is topped up.
        assert!(layout.tx[1].words > 16);
        assert_eq!(layout.tx[2].words, 16);
        assert_eq!(layout.tx[3].words, 16);
        assert_partition_valid(&layout, 320);
    }

    #[test]
    fn spare_words_split_equally_among_bulk_endpoints() {
        let layout = layout_for(
            &[endpoint_desc(0x81, 2, 64), endpoint_desc(0x82, 2, 64)],
            320,
        )
        .unwrap();
        assert_eq!(layout.tx[1].words, layout.tx[2].words);
        assert_partition_valid(&layout, 320);
    }

    #[test]
    fn overflow_is_declined() {
        let result = layout_for(
            &[
                endpoint_desc(0x81, 1, 1023),
                endpoint_desc(0x82, 1, 1023),
            ],
            320,
        );
        assert_eq!(result.unwrap_err(), Error::WouldOverflowFifo);
    }

    #[test]
    fn bringup_layout_matches_expected_words() {
        assert_eq!(bringup_rx_words(64), 10 + 2 + 16 + 1 + 6);
        assert_eq!(bringup_rx_words(8), 10 + 2 + 2 + 1 + 6);
    }
}
