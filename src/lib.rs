//! Device-mode driver for Synopsys DWC USB OTG peripheral cores.
//!
//! This is the controller-driver layer found on STM32F1/F2/F4/F7/H7/L4 and
//! other MCUs with the DWC_otg IP: it enumerates the core as a USB device,
//! schedules transfers onto the shared packet FIFO RAM and harvests them back
//! under interrupt control. Descriptor handling, class logic and control
//! request semantics belong to the device stack layered above; this crate only
//! moves raw bytes per endpoint.
//!
//! The driver is generic over [`UsbPeripheral`], which a HAL implements for a
//! concrete OTG_FS/OTG_HS instance: register base address, endpoint count,
//! FIFO depth, clock bring-up and the device interrupt line.
//!
//! Completion is asynchronous: calls like [`Usbd::ep_transfer`] return after
//! programming registers, and the surrounding stack receives
//! [`UsbEventHandler`] callbacks from [`Usbd::interrupt_handler`].

#![cfg_attr(not(test), no_std)]

pub use usb_device::endpoint::{EndpointAddress, EndpointType};
pub use usb_device::UsbDirection;

mod alloc;
mod device;
mod fifo;
mod ral;
mod transfer;

pub use device::Usbd;

/// Largest endpoint count among supported DWC OTG variants (H7 class cores).
pub const MAX_ENDPOINTS: usize = 9;

/// Link speed negotiated during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    Full,
    High,
}

/// Bus-level signalling forwarded to the device stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusSignal {
    Suspend,
    Resume,
    Unplugged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A configuration's endpoints demand more FIFO RAM than the core has.
    /// The caller may keep the coarser bring-up layout or reject the
    /// configuration.
    WouldOverflowFifo,
    /// Malformed configuration descriptor passed to
    /// [`Usbd::configure_fifos`].
    InvalidDescriptor,
    /// A bounded wait on a hardware acknowledgement expired.
    Timeout,
}

/// Events delivered from interrupt context to the device stack.
///
/// All callbacks run inside [`Usbd::interrupt_handler`]; keep them short.
pub trait UsbEventHandler {
    /// Bus reset finished and the link speed is known.
    fn bus_reset(&mut self, speed: Speed);

    fn bus_signal(&mut self, signal: BusSignal);

    /// A SETUP packet arrived on endpoint 0. Only the last of up to three
    /// back-to-back SETUP packets is delivered.
    fn setup_received(&mut self, setup: [u8; 8]);

    /// A scheduled transfer finished; `len` is the actual byte count, which
    /// is smaller than requested when the host ended an OUT transfer with a
    /// short packet.
    fn transfer_complete(&mut self, ep_addr: EndpointAddress, len: u16);
}

/// One DWC OTG core instance as seen by this driver.
///
/// A HAL implements this for each physical port, handing the driver the
/// register block and the few board facts it cannot discover itself. Clock
/// and PHY bring-up beyond the core's own registers (RCC enables, ULPI pin
/// muxing, external HS PHY PLLs) stays on the HAL side.
///
/// # Safety
///
/// `regs` must return the base address of a DWC OTG register block that the
/// implementor exclusively owns, valid for the lifetime of the value, and the
/// `ENDPOINT_COUNT`/`FIFO_DEPTH_WORDS` constants must match the silicon.
pub unsafe trait UsbPeripheral: Send {
    /// Bi-directional endpoints implemented by the core, including EP0.
    const ENDPOINT_COUNT: usize;

    /// Total dedicated FIFO RAM, in 32-bit words.
    const FIFO_DEPTH_WORDS: u16;

    /// Whether the port can run high speed (ULPI/UTMI PHY attached).
    const HIGH_SPEED: bool;

    /// Control endpoint max packet size; must be 8, 16, 32 or 64.
    const ENDPOINT0_SIZE: u16 = 64;

    /// Base address of the core register block.
    fn regs(&self) -> *const ();

    /// Enable clocks/power for the core.
    fn enable(&mut self);

    /// Unmask the port's interrupt line at the interrupt controller.
    fn interrupt_enable(&mut self);

    /// Mask the port's interrupt line at the interrupt controller.
    fn interrupt_disable(&mut self);

    /// AHB clock feeding the core, used to pick the USB turnaround time.
    fn ahb_frequency_hz(&self) -> u32;
}
