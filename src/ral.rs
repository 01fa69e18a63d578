//! Register layout of the DWC OTG core.
//!
//! Stands in for the vendor CMSIS header: `#[repr(C)]` blocks of volatile
//! cells plus the handful of bit constants the device-mode driver needs.
//! Offsets follow the core's fixed map: global block at +0x000, device block
//! at +0x800, IN/OUT endpoint blocks at +0x900/+0xB00 (0x20 bytes apiece),
//! power/clock gating at +0xE00 and one 4 KiB FIFO window per endpoint from
//! +0x1000.

// The map is carried whole; not every register or bit has a consumer.
#![allow(dead_code)]

use vcell::VolatileCell;

pub const DEVICE_OFFSET: usize = 0x800;
pub const IN_EP_OFFSET: usize = 0x900;
pub const OUT_EP_OFFSET: usize = 0xB00;
pub const PCGCCTL_OFFSET: usize = 0xE00;
pub const FIFO_OFFSET: usize = 0x1000;
pub const FIFO_STRIDE: usize = 0x1000;
pub const EP_STRIDE: usize = 0x20;

/// Read-modify-write helper for a whole register.
pub fn modify(reg: &VolatileCell<u32>, f: impl FnOnce(u32) -> u32) {
    reg.set(f(reg.get()));
}

#[repr(C)]
pub struct Global {
    pub gotgctl: VolatileCell<u32>,
    pub gotgint: VolatileCell<u32>,
    pub gahbcfg: VolatileCell<u32>,
    pub gusbcfg: VolatileCell<u32>,
    pub grstctl: VolatileCell<u32>,
    pub gintsts: VolatileCell<u32>,
    pub gintmsk: VolatileCell<u32>,
    pub grxstsr: VolatileCell<u32>,
    pub grxstsp: VolatileCell<u32>,
    pub grxfsiz: VolatileCell<u32>,
    /// EP0 transmit FIFO size (DIEPTXF0, aliases HNPTXFSIZ in host mode).
    pub dieptxf0: VolatileCell<u32>,
    pub gnptxsts: VolatileCell<u32>,
    _reserved0: [u32; 2],
    pub gccfg: VolatileCell<u32>,
    pub cid: VolatileCell<u32>,
    _reserved1: [u32; 48],
    pub hptxfsiz: VolatileCell<u32>,
    /// Transmit FIFO sizes for IN endpoints 1.. (DIEPTXF1 at index 0).
    pub dieptxf: [VolatileCell<u32>; 15],
}

#[repr(C)]
pub struct Device {
    pub dcfg: VolatileCell<u32>,
    pub dctl: VolatileCell<u32>,
    pub dsts: VolatileCell<u32>,
    _reserved0: u32,
    pub diepmsk: VolatileCell<u32>,
    pub doepmsk: VolatileCell<u32>,
    pub daint: VolatileCell<u32>,
    pub daintmsk: VolatileCell<u32>,
    _reserved1: [u32; 2],
    pub dvbusdis: VolatileCell<u32>,
    pub dvbuspulse: VolatileCell<u32>,
    pub dthrctl: VolatileCell<u32>,
    pub diepempmsk: VolatileCell<u32>,
}

#[repr(C)]
pub struct InEndpoint {
    pub diepctl: VolatileCell<u32>,
    _reserved0: u32,
    pub diepint: VolatileCell<u32>,
    _reserved1: u32,
    pub dieptsiz: VolatileCell<u32>,
    pub diepdma: VolatileCell<u32>,
    pub dtxfsts: VolatileCell<u32>,
    _reserved2: u32,
}

#[repr(C)]
pub struct OutEndpoint {
    pub doepctl: VolatileCell<u32>,
    _reserved0: u32,
    pub doepint: VolatileCell<u32>,
    _reserved1: u32,
    pub doeptsiz: VolatileCell<u32>,
    pub doepdma: VolatileCell<u32>,
    _reserved2: [u32; 2],
}

pub mod gotgint {
    /// Session end detected.
    pub const SEDET: u32 = 1 << 2;
}

pub mod gahbcfg {
    /// Global interrupt enable.
    pub const GINT: u32 = 1 << 0;
}

pub mod gusbcfg {
    /// Select the internal full-speed transceiver.
    pub const PHYSEL: u32 = 1 << 6;
    pub const TRDT_POS: u32 = 10;
    pub const TRDT_MASK: u32 = 0xF << TRDT_POS;
}

pub mod grstctl {
    pub const CSRST: u32 = 1 << 0;
    pub const RXFFLSH: u32 = 1 << 4;
    pub const TXFFLSH: u32 = 1 << 5;
    pub const TXFNUM_POS: u32 = 6;
    pub const TXFNUM_MASK: u32 = 0x1F << TXFNUM_POS;
    /// AHB master idle.
    pub const AHBIDL: u32 = 1 << 31;
}

pub mod gintsts {
    pub const MMIS: u32 = 1 << 1;
    pub const OTGINT: u32 = 1 << 2;
    pub const RXFLVL: u32 = 1 << 4;
    /// Global OUT NAK effective.
    pub const BOUTNAKEFF: u32 = 1 << 7;
    pub const USBSUSP: u32 = 1 << 11;
    pub const USBRST: u32 = 1 << 12;
    pub const ENUMDNE: u32 = 1 << 13;
    pub const IEPINT: u32 = 1 << 18;
    pub const OEPINT: u32 = 1 << 19;
    pub const WKUINT: u32 = 1 << 31;
}

pub mod grxstsp {
    pub const EPNUM_MASK: u32 = 0xF;
    pub const BCNT_POS: u32 = 4;
    pub const BCNT_MASK: u32 = 0x7FF << BCNT_POS;
    pub const PKTSTS_POS: u32 = 17;
    pub const PKTSTS_MASK: u32 = 0xF << PKTSTS_POS;

    pub const PKTSTS_GLOBAL_OUT_NAK: u32 = 0x1;
    pub const PKTSTS_OUT_DATA: u32 = 0x2;
    pub const PKTSTS_OUT_DONE: u32 = 0x3;
    pub const PKTSTS_SETUP_DONE: u32 = 0x4;
    pub const PKTSTS_SETUP_DATA: u32 = 0x6;
}

pub mod gccfg {
    /// Transceiver power up.
    pub const PWRDWN: u32 = 1 << 16;
}

pub mod dcfg {
    pub const DSPD_MASK: u32 = 0x3;
    pub const DSPD_HIGH: u32 = 0x0;
    pub const DSPD_FULL_USE_HS: u32 = 0x1;
    pub const DSPD_FULL: u32 = 0x3;
    /// Send STALL for a non-zero-length status OUT packet.
    pub const NZLSOHSK: u32 = 1 << 2;
    pub const DAD_POS: u32 = 4;
    pub const DAD_MASK: u32 = 0x7F << DAD_POS;
}

pub mod dctl {
    /// Soft disconnect.
    pub const SDIS: u32 = 1 << 1;
    pub const SGONAK: u32 = 1 << 9;
    pub const CGONAK: u32 = 1 << 10;
}

pub mod dsts {
    pub const ENUMSPD_POS: u32 = 1;
    pub const ENUMSPD_MASK: u32 = 0x3 << ENUMSPD_POS;
    pub const ENUMSPD_HIGH: u32 = 0x0;
    /// Least significant bit of the frame number, for iso even/odd parity.
    pub const FNSOF_ODD: u32 = 1 << 8;
}

pub mod diepmsk {
    pub const XFRCM: u32 = 1 << 0;
    pub const TOM: u32 = 1 << 3;
}

pub mod doepmsk {
    pub const XFRCM: u32 = 1 << 0;
    pub const STUPM: u32 = 1 << 3;
}

pub mod daint {
    pub const IEPINT_POS: u32 = 0;
    pub const OEPINT_POS: u32 = 16;
}

pub mod depctl {
    pub const MPSIZ_MASK: u32 = 0x7FF;
    /// EP0 encodes its size in two bits: 64/32/16/8 bytes for 0..=3.
    pub const MPSIZ0_MASK: u32 = 0x3;
    pub const USBAEP: u32 = 1 << 15;
    pub const EPTYP_POS: u32 = 18;
    pub const EPTYP_MASK: u32 = 0x3 << EPTYP_POS;
    pub const STALL: u32 = 1 << 21;
    pub const TXFNUM_POS: u32 = 22;
    pub const CNAK: u32 = 1 << 26;
    pub const SNAK: u32 = 1 << 27;
    /// Set DATA0 PID / even frame.
    pub const SD0PID_SEVNFRM: u32 = 1 << 28;
    pub const SODDFRM: u32 = 1 << 29;
    pub const EPDIS: u32 = 1 << 30;
    pub const EPENA: u32 = 1 << 31;
}

pub mod diepint {
    pub const XFRC: u32 = 1 << 0;
    pub const EPDISD: u32 = 1 << 1;
    /// IN endpoint NAK effective.
    pub const INEPNE: u32 = 1 << 6;
    pub const TXFE: u32 = 1 << 7;
}

pub mod doepint {
    pub const XFRC: u32 = 1 << 0;
    pub const EPDISD: u32 = 1 << 1;
    /// Setup phase done.
    pub const STUP: u32 = 1 << 3;
}

pub mod deptsiz {
    pub const XFRSIZ_MASK: u32 = 0x7FFFF;
    pub const PKTCNT_POS: u32 = 19;
    pub const PKTCNT_MASK: u32 = 0x3FF << PKTCNT_POS;
    pub const STUPCNT_POS: u32 = 29;
}

pub mod dtxfsts {
    /// Available TX FIFO space in words.
    pub const INEPTFSAV_MASK: u32 = 0xFFFF;
}

pub mod txfsiz {
    pub const DEPTH_POS: u32 = 16;
    pub const OFFSET_MASK: u32 = 0xFFFF;
}
