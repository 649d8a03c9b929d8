//! Boot-time choice between the application and the bootloader.
//!
//! The choice is made once per reset. [`PinArbiter`] samples a strap
//! input; [`HandshakeArbiter`] is for RS-485 wiring without a spare input
//! and waits a bounded window for the host to send [`Command::Nop`].

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::InputPin;
use embedded_hal::watchdog::Watchdog;

use crate::device::dispatcher::Dispatcher;
use crate::device::link::{respond, Link};
use crate::device::nvm::NvmController;
use crate::device::system::{start_application, SystemControl};
use crate::protocol::{Command, STATUS_OK};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Entry {
    Application,
    Bootloader,
}

/// Stays in the bootloader while a strap input is asserted
pub struct PinArbiter<P> {
    pin: P,
    active_low: bool,
}

impl<P: InputPin> PinArbiter<P> {
    pub fn new(pin: P, active_low: bool) -> Self {
        Self { pin, active_low }
    }

    pub fn decide(&mut self) -> Result<Entry, P::Error> {
        let asserted = if self.active_low {
            self.pin.is_low()?
        } else {
            self.pin.is_high()?
        };

        Ok(if asserted {
            Entry::Bootloader
        } else {
            Entry::Application
        })
    }

    pub fn free(self) -> P {
        self.pin
    }
}

/// Free-running timer bounding the handshake window
pub trait BootTimer {
    fn start(&mut self);

    /// Milliseconds since [`BootTimer::start`]
    fn elapsed_ms(&mut self) -> u32;

    fn stop(&mut self);
}

/// Stays in the bootloader if a NOP arrives within the window
pub struct HandshakeArbiter<T> {
    timer: T,
    window_ms: u32,
}

impl<T: BootTimer> HandshakeArbiter<T> {
    pub fn new(timer: T, window_ms: u32) -> Self {
        Self { timer, window_ms }
    }

    /// Samples the link without blocking until a NOP arrives or the window
    /// closes. A NOP is acknowledged with a single OK.
    pub fn decide<L: Link>(&mut self, link: &mut L) -> Result<Entry, L::Error> {
        self.timer.start();

        loop {
            match link.read() {
                Ok(b) if b == Command::Nop.opcode() => {
                    self.timer.stop();
                    debug!("Host present");

                    respond(link, &[&[STATUS_OK]])?;
                    return Ok(Entry::Bootloader);
                }
                Ok(b) => trace!("Ignoring {:#04x} during handshake", b),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => trace!("Link error during handshake: {:?}", e),
            }

            if self.timer.elapsed_ms() >= self.window_ms {
                self.timer.stop();
                debug!("Handshake window closed");
                return Ok(Entry::Application);
            }
        }
    }

    pub fn free(self) -> T {
        self.timer
    }
}

/// Acts on an entry decision: either never returns from the command loop
/// or never returns from the application
pub fn boot<L, C, S, W, D>(entry: Entry, mut dispatcher: Dispatcher<L, C, S, W, D>) -> !
where
    L: Link,
    C: NvmController,
    S: SystemControl,
    W: Watchdog,
    D: DelayMs<u16>,
{
    match entry {
        Entry::Bootloader => dispatcher.run(),
        Entry::Application => {
            let address = dispatcher.nvm().geometry().application_entry();
            start_application(dispatcher.system_mut(), address)
        }
    }
}
