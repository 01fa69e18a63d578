//! Device controller core: endpoint operations, transfer scheduling and the
//! interrupt dispatcher.
//!
//! All calls here run in two contexts. Endpoint open/close/transfer/stall and
//! the connection management run synchronously in task context;
//! [`Usbd::interrupt_handler`] runs in interrupt context and drives transfers
//! forward, reporting progress through [`UsbEventHandler`]. No locks are
//! involved: the only concurrency discipline is the hardware's own
//! interrupt-source masking (the receive FIFO drain masks RXFLVL for its
//! duration), and the caller keeps task-context calls from racing the
//! handler.

use core::ptr;

use vcell::VolatileCell;

use crate::alloc::{bringup_rx_words, EndpointReport, FifoLayout};
use crate::fifo::{self, words_for, FifoWindow, WordPort};
use crate::ral::{
    self, daint, dcfg, dctl, depctl, deptsiz, diepint, diepmsk, doepint, doepmsk, dsts, dtxfsts,
    gahbcfg, gccfg, gintsts, gotgint, grstctl, grxstsp, gusbcfg, modify, txfsiz,
};
use crate::transfer::{dir_index, packet_count, Ep0Pending, XferCtl};
use crate::{
    BusSignal, EndpointAddress, EndpointType, Error, Speed, UsbDirection, UsbEventHandler,
    UsbPeripheral, MAX_ENDPOINTS,
};

/// Upper bound for polled waits on hardware acknowledgements. These waits are
/// bounded by USB signalling times, not by data size; expiry means the core
/// is wedged and the caller gets `Error::Timeout` instead of a hung loop.
const SPIN_LIMIT: u32 = 100_000;

fn spin_while(mut busy: impl FnMut() -> bool) -> Result<(), Error> {
    for _ in 0..SPIN_LIMIT {
        if !busy() {
            return Ok(());
        }
    }
    #[cfg(feature = "defmt")]
    defmt::warn!("usb: wait for core acknowledgement timed out");
    Err(Error::Timeout)
}

/// Turnaround time (GUSBCFG.TRDT) for the negotiated speed and AHB clock.
pub(crate) fn turnaround_time(speed: Speed, ahb_hz: u32) -> u8 {
    if speed == Speed::High {
        return 0x9;
    }
    match ahb_hz {
        hz if hz >= 32_000_000 => 0x6,
        hz if hz >= 27_500_000 => 0x7,
        hz if hz >= 24_000_000 => 0x8,
        hz if hz >= 21_800_000 => 0x9,
        hz if hz >= 20_000_000 => 0xA,
        hz if hz >= 18_500_000 => 0xB,
        hz if hz >= 17_200_000 => 0xC,
        hz if hz >= 16_000_000 => 0xD,
        hz if hz >= 15_000_000 => 0xE,
        _ => 0xF,
    }
}

/// EP0's two-bit MPSIZ encoding.
fn ep0_mps_bits(size: u16) -> u32 {
    match size {
        64 => 0b00,
        32 => 0b01,
        16 => 0b10,
        _ => 0b11,
    }
}

/// Resolved views into the core's register blocks.
///
/// The `'static` lifetimes are justified by the `UsbPeripheral` safety
/// contract: the block is exclusively owned hardware memory that never moves.
#[derive(Clone, Copy)]
struct Regs {
    base: *const u8,
}

impl Regs {
    fn global(&self) -> &'static ral::Global {
        unsafe { &*(self.base as *const ral::Global) }
    }

    fn device(&self) -> &'static ral::Device {
        unsafe { &*(self.base.add(ral::DEVICE_OFFSET) as *const ral::Device) }
    }

    fn in_ep(&self, epnum: usize) -> &'static ral::InEndpoint {
        unsafe {
            &*(self.base.add(ral::IN_EP_OFFSET + epnum * ral::EP_STRIDE) as *const ral::InEndpoint)
        }
    }

    fn out_ep(&self, epnum: usize) -> &'static ral::OutEndpoint {
        unsafe {
            &*(self.base.add(ral::OUT_EP_OFFSET + epnum * ral::EP_STRIDE)
                as *const ral::OutEndpoint)
        }
    }

    fn pcgcctl(&self) -> &'static VolatileCell<u32> {
        unsafe { &*(self.base.add(ral::PCGCCTL_OFFSET) as *const VolatileCell<u32>) }
    }

    fn fifo(&self, num: usize) -> FifoWindow {
        unsafe {
            FifoWindow::new(
                self.base.add(ral::FIFO_OFFSET + num * ral::FIFO_STRIDE)
                    as *const VolatileCell<u32>,
            )
        }
    }
}

/// Device-mode driver for one DWC OTG port.
///
/// One value per physical port; it owns all transfer state, so handing it
/// (for example through an RTIC resource) to both task code and the interrupt
/// handler keeps the single-writer discipline explicit.
pub struct Usbd<P: UsbPeripheral> {
    periph: P,
    /// One in-flight transfer per (endpoint, direction).
    xfer: [[XferCtl; 2]; MAX_ENDPOINTS],
    ep0_pending: Ep0Pending,
    /// Staging for the most recent SETUP packet. The core can receive up to
    /// three back to back; only the last one is valid.
    setup_packet: [u32; 2],
    /// Bytes of each IN endpoint's scheduled transfer not yet pushed into
    /// its FIFO. For EP0 this covers only the currently scheduled packet,
    /// never the whole control transfer.
    in_scheduled: [u16; MAX_ENDPOINTS],
    allocated_fifo_words: u16,
}

// The raw pointers inside `xfer` refer to caller buffers whose validity is
// part of the `ep_transfer` contract; nothing in here is tied to a thread.
unsafe impl<P: UsbPeripheral> Send for Usbd<P> {}

impl<P: UsbPeripheral> Usbd<P> {
    pub fn new(periph: P) -> Usbd<P> {
        assert!(P::ENDPOINT_COUNT >= 1 && P::ENDPOINT_COUNT <= MAX_ENDPOINTS);
        assert!(matches!(P::ENDPOINT0_SIZE, 8 | 16 | 32 | 64));
        // The bring-up layout has no failure path, so it must always fit.
        assert!(bringup_rx_words(P::ENDPOINT0_SIZE) + P::ENDPOINT0_SIZE / 4 <= P::FIFO_DEPTH_WORDS);

        const IDLE: [XferCtl; 2] = [XferCtl::new(), XferCtl::new()];
        Usbd {
            periph,
            xfer: [IDLE; MAX_ENDPOINTS],
            ep0_pending: Ep0Pending::new(),
            setup_packet: [0; 2],
            in_scheduled: [0; MAX_ENDPOINTS],
            allocated_fifo_words: 0,
        }
    }

    fn regs(&self) -> Regs {
        Regs {
            base: self.periph.regs() as *const u8,
        }
    }

    /// Bring the core up in device mode and connect to the bus.
    ///
    /// The peripheral clock must be running (`UsbPeripheral::enable` is
    /// called first). Returns `Error::Timeout` if the core never reports its
    /// soft reset done.
    pub fn init(&mut self) -> Result<(), Error> {
        self.periph.enable();
        let regs = self.regs();
        let global = regs.global();

        if !P::HIGH_SPEED {
            // Internal full-speed transceiver.
            modify(&global.gusbcfg, |w| w | gusbcfg::PHYSEL);
        }

        // Soft reset after PHY selection: wait for AHB idle, reset, wait out.
        spin_while(|| global.grstctl.get() & grstctl::AHBIDL == 0)?;
        modify(&global.grstctl, |w| w | grstctl::CSRST);
        spin_while(|| global.grstctl.get() & grstctl::CSRST != 0)?;

        // Restart the PHY clock.
        regs.pcgcctl().set(0);

        // Drop anything pending from before the reset.
        global.gintsts.set(global.gintsts.get());
        modify(&global.gintmsk, |w| w | gintsts::OTGINT | gintsts::MMIS);

        let device = regs.device();

        // A non-zero-length status OUT packet from a misbehaving host gets a
        // STALL and is discarded.
        modify(&device.dcfg, |w| w | dcfg::NZLSOHSK);

        let dspd = if P::HIGH_SPEED {
            dcfg::DSPD_HIGH
        } else {
            dcfg::DSPD_FULL
        };
        modify(&device.dcfg, |w| (w & !dcfg::DSPD_MASK) | dspd);

        if !P::HIGH_SPEED {
            modify(&global.gccfg, |w| w | gccfg::PWRDWN);
        }

        modify(&global.gintmsk, |w| {
            w | gintsts::USBRST
                | gintsts::ENUMDNE
                | gintsts::USBSUSP
                | gintsts::WKUINT
                | gintsts::RXFLVL
        });
        modify(&global.gahbcfg, |w| w | gahbcfg::GINT);

        self.connect();
        Ok(())
    }

    /// Attach to the bus (clear soft disconnect).
    pub fn connect(&mut self) {
        modify(&self.regs().device().dctl, |w| w & !dctl::SDIS);
    }

    /// Signal a disconnect to the host.
    pub fn disconnect(&mut self) {
        modify(&self.regs().device().dctl, |w| w | dctl::SDIS);
    }

    /// Program the device address assigned by the host and queue the
    /// zero-length status packet acknowledging it.
    pub fn set_address(&mut self, address: u8) {
        let device = self.regs().device();
        modify(&device.dcfg, |w| {
            (w & !dcfg::DAD_MASK) | ((address as u32) << dcfg::DAD_POS)
        });

        // Null pointer is fine for a zero-length transfer; the cursor never
        // dereferences it.
        unsafe {
            self.ep_transfer(
                EndpointAddress::from_parts(0, UsbDirection::In),
                ptr::null_mut(),
                0,
            );
        }
    }

    /// Remote wakeup signalling is not wired up on this core.
    pub fn remote_wakeup(&mut self) {}

    pub fn interrupt_enable(&mut self) {
        self.periph.interrupt_enable();
    }

    pub fn interrupt_disable(&mut self) {
        self.periph.interrupt_disable();
    }

    fn negotiated_speed(&self) -> Speed {
        let enum_spd =
            (self.regs().device().dsts.get() & dsts::ENUMSPD_MASK) >> dsts::ENUMSPD_POS;
        if enum_spd == dsts::ENUMSPD_HIGH {
            Speed::High
        } else {
            Speed::Full
        }
    }

    /// Activate an endpoint with the given type and max packet size.
    ///
    /// Panics if the endpoint index or packet size is outside what the core
    /// and the protocol allow for the negotiated speed; both are
    /// configuration mistakes in the surrounding stack.
    pub fn ep_open(&mut self, ep_addr: EndpointAddress, ep_type: EndpointType, max_size: u16) {
        let epnum = ep_addr.index();
        let dir = ep_addr.direction();
        assert!(epnum < P::ENDPOINT_COUNT, "endpoint index out of range");

        let ceiling = match (ep_type, self.negotiated_speed()) {
            (EndpointType::Isochronous, Speed::High) => 1024,
            (EndpointType::Isochronous, Speed::Full) => 1023,
            (_, Speed::High) => 512,
            (_, Speed::Full) => 64,
        };
        assert!(max_size <= ceiling, "max packet size exceeds protocol ceiling");

        self.xfer[epnum][dir_index(dir)].set_max_size(max_size);

        let regs = self.regs();
        let device = regs.device();
        if dir == UsbDirection::Out {
            modify(&regs.out_ep(epnum).doepctl, |w| {
                w | depctl::USBAEP | ((ep_type as u32) << depctl::EPTYP_POS) | max_size as u32
            });
            modify(&device.daintmsk, |w| {
                w | 1 << (daint::OEPINT_POS + epnum as u32)
            });
        } else {
            // The transmit FIFO was laid out at bus reset or configuration
            // time; IN endpoint n always owns FIFO n.
            modify(&regs.in_ep(epnum).diepctl, |w| {
                w | depctl::USBAEP
                    | ((epnum as u32) << depctl::TXFNUM_POS)
                    | ((ep_type as u32) << depctl::EPTYP_POS)
                    | if ep_type != EndpointType::Isochronous {
                        depctl::SD0PID_SEVNFRM
                    } else {
                        0
                    }
                    | max_size as u32
            });
            modify(&device.daintmsk, |w| {
                w | 1 << (daint::IEPINT_POS + epnum as u32)
            });
        }
    }

    /// Deactivate an endpoint and mask its completion interrupt. FIFO words
    /// stay assigned until the next full reallocation.
    pub fn ep_close(&mut self, ep_addr: EndpointAddress) {
        let epnum = ep_addr.index();
        let regs = self.regs();
        let device = regs.device();

        if ep_addr.direction() == UsbDirection::In {
            modify(&device.daintmsk, |w| {
                w & !(1 << (daint::IEPINT_POS + epnum as u32))
            });
            modify(&regs.in_ep(epnum).diepctl, |w| w & !depctl::USBAEP);
        } else {
            modify(&device.daintmsk, |w| {
                w & !(1 << (daint::OEPINT_POS + epnum as u32))
            });
            modify(&regs.out_ep(epnum).doepctl, |w| w & !depctl::USBAEP);
        }
    }

    /// Schedule a transfer of `total_bytes` over the caller's buffer.
    ///
    /// Returns once the endpoint is armed; completion arrives later as a
    /// [`UsbEventHandler::transfer_complete`] event.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads (IN) or writes (OUT) of
    /// `total_bytes` bytes until the completion event for this endpoint and
    /// direction fires, and no other transfer may be in flight on it.
    pub unsafe fn ep_transfer(
        &mut self,
        ep_addr: EndpointAddress,
        buffer: *mut u8,
        total_bytes: u16,
    ) {
        let epnum = ep_addr.index();
        let dir = ep_addr.direction();
        assert!(epnum < P::ENDPOINT_COUNT, "endpoint index out of range");

        self.xfer[epnum][dir_index(dir)].begin(buffer, total_bytes);

        // EP0 is limited to one packet per schedule; park the rest in the
        // pending counter and let transfer-complete interrupts feed it.
        if epnum == 0 {
            self.ep0_pending.load(dir, total_bytes);
            self.schedule_packets(0, dir, 1, 0);
            return;
        }

        let max_size = self.xfer[epnum][dir_index(dir)].max_size();
        let packets = packet_count(total_bytes, max_size);
        self.schedule_packets(epnum, dir, packets, total_bytes);
    }

    /// Program packet/byte counts and arm the endpoint. For EP0 the byte
    /// count is taken from the pending counter instead of `total_bytes`.
    fn schedule_packets(
        &mut self,
        epnum: usize,
        dir: UsbDirection,
        num_packets: u16,
        mut total_bytes: u16,
    ) {
        if epnum == 0 {
            let max_size = self.xfer[0][dir_index(dir)].max_size();
            total_bytes = self.ep0_pending.take_chunk(dir, max_size);
        }

        let regs = self.regs();
        if dir == UsbDirection::In {
            self.in_scheduled[epnum] = total_bytes;
            let ep = regs.in_ep(epnum);
            ep.dieptsiz.set(
                ((num_packets as u32) << deptsiz::PKTCNT_POS)
                    | (total_bytes as u32 & deptsiz::XFRSIZ_MASK),
            );
            modify(&ep.diepctl, |w| w | depctl::EPENA | depctl::CNAK);

            // Isochronous endpoints transmit in the next frame; pick the
            // matching even/odd parity now.
            let ep_type = (ep.diepctl.get() & depctl::EPTYP_MASK) >> depctl::EPTYP_POS;
            if ep_type == EndpointType::Isochronous as u32 {
                let odd_frame_now = regs.device().dsts.get() & dsts::FNSOF_ODD != 0;
                modify(&ep.diepctl, |w| {
                    w | if odd_frame_now {
                        depctl::SD0PID_SEVNFRM
                    } else {
                        depctl::SODDFRM
                    }
                });
            }

            // Data is fed from the FIFO-empty interrupt; nothing to feed for
            // a zero-length packet.
            if total_bytes != 0 {
                modify(&regs.device().diepempmsk, |w| w | 1 << epnum);
            }
        } else {
            let ep = regs.out_ep(epnum);
            modify(&ep.doeptsiz, |w| {
                (w & !(deptsiz::PKTCNT_MASK | deptsiz::XFRSIZ_MASK))
                    | ((num_packets as u32) << deptsiz::PKTCNT_POS)
                    | total_bytes as u32
            });
            modify(&ep.doepctl, |w| w | depctl::EPENA | depctl::CNAK);
        }
    }

    /// Mark an endpoint STALLed.
    ///
    /// An endpoint with a packet in flight is first forced to NAK and
    /// disabled so no stale data is left in the shared FIFO; the waits on the
    /// core's acknowledgements are bounded and report `Error::Timeout`.
    pub fn ep_stall(&mut self, ep_addr: EndpointAddress) -> Result<(), Error> {
        let epnum = ep_addr.index();
        let regs = self.regs();
        let global = regs.global();

        if ep_addr.direction() == UsbDirection::In {
            let ep = regs.in_ep(epnum);

            if epnum == 0 || ep.diepctl.get() & depctl::EPENA == 0 {
                modify(&ep.diepctl, |w| w | depctl::SNAK | depctl::STALL);
            } else {
                // Stop transmitting, then disable once the NAK is effective.
                modify(&ep.diepctl, |w| w | depctl::SNAK);
                spin_while(|| ep.diepint.get() & diepint::INEPNE == 0)?;

                modify(&ep.diepctl, |w| w | depctl::STALL | depctl::EPDIS);
                spin_while(|| ep.diepint.get() & diepint::EPDISD == 0)?;
                ep.diepint.set(diepint::EPDISD);
            }

            // Flush this endpoint's transmit FIFO and give the core a few
            // PHY clocks to settle.
            modify(&global.grstctl, |w| {
                (w & !grstctl::TXFNUM_MASK)
                    | ((epnum as u32) << grstctl::TXFNUM_POS)
                    | grstctl::TXFFLSH
            });
            spin_while(|| global.grstctl.get() & grstctl::TXFFLSH != 0)?;
            cortex_m::asm::delay(60);
        } else {
            let ep = regs.out_ep(epnum);

            if epnum == 0 || ep.doepctl.get() & depctl::EPENA == 0 {
                modify(&ep.doepctl, |w| w | depctl::STALL);
            } else {
                // Disabling an active OUT endpoint requires global OUT NAK.
                modify(&regs.device().dctl, |w| w | dctl::SGONAK);
                spin_while(|| global.gintsts.get() & gintsts::BOUTNAKEFF == 0)?;

                modify(&ep.doepctl, |w| w | depctl::STALL | depctl::EPDIS);
                spin_while(|| ep.doepint.get() & doepint::EPDISD == 0)?;
                ep.doepint.set(doepint::EPDISD);

                // Let the other OUT endpoints keep receiving.
                modify(&regs.device().dctl, |w| w | dctl::CGONAK);
            }
        }

        Ok(())
    }

    /// Clear a STALL condition. Bulk and interrupt endpoints also restart at
    /// DATA0 as the protocol requires. A no-op on an endpoint that is not
    /// stalled.
    pub fn ep_clear_stall(&mut self, ep_addr: EndpointAddress) {
        let epnum = ep_addr.index();
        let regs = self.regs();

        if ep_addr.direction() == UsbDirection::In {
            let ep = regs.in_ep(epnum);
            if ep.diepctl.get() & depctl::STALL == 0 {
                return;
            }
            modify(&ep.diepctl, |w| w & !depctl::STALL);

            let ep_type = (ep.diepctl.get() & depctl::EPTYP_MASK) >> depctl::EPTYP_POS;
            if ep_type == EndpointType::Bulk as u32 || ep_type == EndpointType::Interrupt as u32 {
                modify(&ep.diepctl, |w| w | depctl::SD0PID_SEVNFRM);
            }
        } else {
            let ep = regs.out_ep(epnum);
            if ep.doepctl.get() & depctl::STALL == 0 {
                return;
            }
            modify(&ep.doepctl, |w| w & !depctl::STALL);

            let ep_type = (ep.doepctl.get() & depctl::EPTYP_MASK) >> depctl::EPTYP_POS;
            if ep_type == EndpointType::Bulk as u32 || ep_type == EndpointType::Interrupt as u32 {
                modify(&ep.doepctl, |w| w | depctl::SD0PID_SEVNFRM);
            }
        }
    }

    /// Replace the bring-up FIFO layout with one sized from the selected
    /// configuration's endpoint descriptors.
    ///
    /// The partition is computed up front; if the descriptors demand more
    /// FIFO RAM than the core has, `Error::WouldOverflowFifo` comes back and
    /// no register is written, leaving the bring-up layout in place. The
    /// affected endpoints must be quiescent (NAK'd, no transfer in flight)
    /// while the partition moves; the caller ensures this.
    pub fn configure_fifos(&mut self, config_descriptor: &[u8]) -> Result<(), Error> {
        let report = EndpointReport::from_config_descriptor(
            config_descriptor,
            P::ENDPOINT_COUNT,
            P::ENDPOINT0_SIZE,
        )?;
        let layout = FifoLayout::for_report(&report, P::ENDPOINT_COUNT, P::FIFO_DEPTH_WORDS)?;

        let regs = self.regs();
        let global = regs.global();
        let device = regs.device();

        // Hold EP0 OUT NAK'd and park the endpoint interrupt sources while
        // the partition moves under the hardware.
        modify(&regs.out_ep(0).doepctl, |w| w | depctl::SNAK);
        modify(&device.daintmsk, |w| {
            w & !((1 << daint::OEPINT_POS) | (1 << daint::IEPINT_POS))
        });
        modify(&device.doepmsk, |w| w & !(doepmsk::STUPM | doepmsk::XFRCM));
        modify(&device.diepmsk, |w| w & !(diepmsk::TOM | diepmsk::XFRCM));

        global.grxfsiz.set(layout.rx_words as u32);
        global.dieptxf0.set(
            ((layout.tx[0].words as u32) << txfsiz::DEPTH_POS) | layout.tx[0].offset as u32,
        );
        for epnum in 1..P::ENDPOINT_COUNT {
            let tx = layout.tx[epnum];
            if tx.words > 0 {
                global.dieptxf[epnum - 1]
                    .set(((tx.words as u32) << txfsiz::DEPTH_POS) | tx.offset as u32);
            }
        }
        self.allocated_fifo_words = layout.total_words();

        modify(&device.daintmsk, |w| {
            w | (1 << daint::OEPINT_POS) | (1 << daint::IEPINT_POS)
        });
        modify(&device.doepmsk, |w| w | doepmsk::STUPM | doepmsk::XFRCM);
        modify(&device.diepmsk, |w| w | diepmsk::TOM | diepmsk::XFRCM);
        modify(&regs.out_ep(0).doepctl, |w| w | depctl::CNAK);

        Ok(())
    }

    /// Demultiplex and handle everything the core has flagged. Call from the
    /// port's interrupt service routine.
    pub fn interrupt_handler<H: UsbEventHandler>(&mut self, events: &mut H) {
        let regs = self.regs();
        let global = regs.global();
        let int_status = global.gintsts.get();

        // Start of bus reset: back to the bring-up state.
        if int_status & gintsts::USBRST != 0 {
            global.gintsts.set(gintsts::USBRST);
            self.bus_reset();
        }

        // End of reset; the link speed is known now.
        if int_status & gintsts::ENUMDNE != 0 {
            global.gintsts.set(gintsts::ENUMDNE);

            let speed = self.negotiated_speed();
            let trdt = turnaround_time(speed, self.periph.ahb_frequency_hz());
            modify(&global.gusbcfg, |w| {
                (w & !gusbcfg::TRDT_MASK) | ((trdt as u32) << gusbcfg::TRDT_POS)
            });
            self.set_ep0_max_packet_size();

            events.bus_reset(speed);
        }

        if int_status & gintsts::USBSUSP != 0 {
            global.gintsts.set(gintsts::USBSUSP);
            events.bus_signal(BusSignal::Suspend);
        }

        if int_status & gintsts::WKUINT != 0 {
            global.gintsts.set(gintsts::WKUINT);
            events.bus_signal(BusSignal::Resume);
        }

        if int_status & gintsts::OTGINT != 0 {
            let otg_status = global.gotgint.get();
            if otg_status & gotgint::SEDET != 0 {
                events.bus_signal(BusSignal::Unplugged);
            }
            global.gotgint.set(otg_status);
        }

        if int_status & gintsts::RXFLVL != 0 {
            // Mask only this source while draining so other bus events stay
            // responsive.
            modify(&global.gintmsk, |w| w & !gintsts::RXFLVL);
            loop {
                self.handle_rx_status();
                if global.gintsts.get() & gintsts::RXFLVL == 0 {
                    break;
                }
            }
            modify(&global.gintmsk, |w| w | gintsts::RXFLVL);
        }

        if int_status & gintsts::OEPINT != 0 {
            self.handle_out_eps(events);
        }

        if int_status & gintsts::IEPINT != 0 {
            self.handle_in_eps(events);
        }
    }

    /// Bus reset: every transfer dies, every OUT endpoint NAKs, and the FIFO
    /// RAM goes back to the conservative bring-up partition.
    fn bus_reset(&mut self) {
        for per_ep in self.xfer.iter_mut() {
            for xfer in per_ep.iter_mut() {
                xfer.reset();
            }
        }
        self.ep0_pending.clear_all();
        self.in_scheduled = [0; MAX_ENDPOINTS];

        let regs = self.regs();
        let device = regs.device();

        for epnum in 0..P::ENDPOINT_COUNT {
            modify(&regs.out_ep(epnum).doepctl, |w| w | depctl::SNAK);
        }

        modify(&device.daintmsk, |w| {
            w | (1 << daint::OEPINT_POS) | (1 << daint::IEPINT_POS)
        });
        modify(&device.doepmsk, |w| w | doepmsk::STUPM | doepmsk::XFRCM);
        modify(&device.diepmsk, |w| w | diepmsk::TOM | diepmsk::XFRCM);

        let global = regs.global();
        let rx_words = bringup_rx_words(P::ENDPOINT0_SIZE);
        let ep0_words = P::ENDPOINT0_SIZE / 4;
        global.grxfsiz.set(rx_words as u32);
        global
            .dieptxf0
            .set(((ep0_words as u32) << txfsiz::DEPTH_POS) | rx_words as u32);
        self.allocated_fifo_words = rx_words + ep0_words;

        // Accept up to three back-to-back SETUP packets.
        modify(&regs.out_ep(0).doeptsiz, |w| w | 3 << deptsiz::STUPCNT_POS);

        modify(&global.gintmsk, |w| w | gintsts::OEPINT | gintsts::IEPINT);
    }

    /// EP0's packet size is fixed by the enumerated speed (and the
    /// configured size, at full speed); both directions share DIEPCTL0.
    fn set_ep0_max_packet_size(&mut self) {
        let regs = self.regs();
        let enum_spd = (regs.device().dsts.get() & dsts::ENUMSPD_MASK) >> dsts::ENUMSPD_POS;

        let (bits, size) = match enum_spd {
            dsts::ENUMSPD_HIGH => (0b00, 64),
            0x3 => (ep0_mps_bits(P::ENDPOINT0_SIZE), P::ENDPOINT0_SIZE),
            // Low speed: always 8 bytes.
            _ => (0b11, 8),
        };

        modify(&regs.in_ep(0).diepctl, |w| (w & !depctl::MPSIZ0_MASK) | bits);
        self.xfer[0][0].set_max_size(size);
        self.xfer[0][1].set_max_size(size);
    }

    /// Pop and handle one status word from the shared receive FIFO.
    fn handle_rx_status(&mut self) {
        let regs = self.regs();
        let status = regs.global().grxstsp.get();

        let pktsts = (status & grxstsp::PKTSTS_MASK) >> grxstsp::PKTSTS_POS;
        let epnum = (status & grxstsp::EPNUM_MASK) as usize;
        let byte_count = ((status & grxstsp::BCNT_MASK) >> grxstsp::BCNT_POS) as u16;
        assert!(
            epnum < P::ENDPOINT_COUNT,
            "receive status endpoint out of range"
        );

        match pktsts {
            grxstsp::PKTSTS_GLOBAL_OUT_NAK | grxstsp::PKTSTS_OUT_DONE => {}

            grxstsp::PKTSTS_OUT_DATA => {
                let xfer = &mut self.xfer[epnum][dir_index(UsbDirection::Out)];
                let len = byte_count.min(xfer.remaining());

                let mut port = regs.fifo(0);
                fifo::read_packet(&mut port, xfer.next_out_chunk(len));
                // A packet beyond the scheduled remainder never reaches the
                // caller's buffer, but its words must still leave the FIFO.
                for _ in words_for(len)..words_for(byte_count) {
                    port.pop();
                }

                if byte_count < xfer.max_size() {
                    // Short packet ends the transfer; what arrived is all
                    // there is.
                    xfer.trim_to_received();
                    if epnum == 0 {
                        self.ep0_pending.clear(UsbDirection::Out);
                    }
                }
            }

            grxstsp::PKTSTS_SETUP_DONE => {
                // Re-arm for the next burst of up to three SETUP packets.
                modify(&regs.out_ep(epnum).doeptsiz, |w| {
                    w | 3 << deptsiz::STUPCNT_POS
                });
            }

            grxstsp::PKTSTS_SETUP_DATA => {
                // Back-to-back SETUPs overwrite each other; the last one
                // standing is the valid one.
                let mut port = regs.fifo(0);
                self.setup_packet[0] = port.pop();
                self.setup_packet[1] = port.pop();
            }

            _ => panic!("unrecognized receive status {}", pktsts),
        }
    }

    fn setup_bytes(&self) -> [u8; 8] {
        let mut setup = [0u8; 8];
        setup[..4].copy_from_slice(&self.setup_packet[0].to_le_bytes());
        setup[4..].copy_from_slice(&self.setup_packet[1].to_le_bytes());
        setup
    }

    fn handle_out_eps<H: UsbEventHandler>(&mut self, events: &mut H) {
        let regs = self.regs();
        for epnum in 0..P::ENDPOINT_COUNT {
            if regs.device().daint.get() & (1 << (daint::OEPINT_POS + epnum as u32)) == 0 {
                continue;
            }
            let ep = regs.out_ep(epnum);

            // Setup phase done: hand the staged packet up.
            if ep.doepint.get() & doepint::STUP != 0 {
                ep.doepint.set(doepint::STUP);
                events.setup_received(self.setup_bytes());
            }

            if ep.doepint.get() & doepint::XFRC != 0 {
                ep.doepint.set(doepint::XFRC);

                if epnum == 0 && self.ep0_pending.remaining(UsbDirection::Out) > 0 {
                    // More control data to come; schedule the next packet.
                    self.schedule_packets(0, UsbDirection::Out, 1, 0);
                } else {
                    events.transfer_complete(
                        EndpointAddress::from_parts(epnum, UsbDirection::Out),
                        self.xfer[epnum][dir_index(UsbDirection::Out)].total_len(),
                    );
                }
            }
        }
    }

    fn handle_in_eps<H: UsbEventHandler>(&mut self, events: &mut H) {
        let regs = self.regs();
        for epnum in 0..P::ENDPOINT_COUNT {
            if regs.device().daint.get() & (1 << (daint::IEPINT_POS + epnum as u32)) == 0 {
                continue;
            }
            let ep = regs.in_ep(epnum);

            if ep.diepint.get() & diepint::XFRC != 0 {
                ep.diepint.set(diepint::XFRC);

                if epnum == 0 && self.ep0_pending.remaining(UsbDirection::In) > 0 {
                    self.schedule_packets(0, UsbDirection::In, 1, 0);
                } else {
                    events.transfer_complete(
                        EndpointAddress::from_parts(epnum, UsbDirection::In),
                        self.xfer[epnum][dir_index(UsbDirection::In)].total_len(),
                    );
                }
            }

            // TXFE is read-only and only meaningful while this endpoint's
            // FIFO-empty source is enabled.
            if ep.diepint.get() & diepint::TXFE != 0
                && regs.device().diepempmsk.get() & (1 << epnum) != 0
            {
                let xfer = &mut self.xfer[epnum][dir_index(UsbDirection::In)];
                let budget = &mut self.in_scheduled[epnum];

                // Only whole packets may enter the FIFO, and only bytes of
                // the scheduled transfer. EP0's next packet is not pushed
                // until its transfer-complete interrupt reschedules it.
                while *budget > 0 {
                    let len = (*budget).min(xfer.max_size());
                    let avail_words = ep.dtxfsts.get() & dtxfsts::INEPTFSAV_MASK;
                    if len as u32 > avail_words * 4 {
                        break;
                    }

                    let mut port = regs.fifo(epnum);
                    fifo::write_packet(&mut port, xfer.next_in_chunk(len));
                    *budget -= len;
                }

                if *budget == 0 {
                    modify(&regs.device().diepempmsk, |w| w & !(1 << epnum));
                }
            }
        }
    }
}
