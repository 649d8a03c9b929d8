//! Byte link between the bootloader and the host.
//!
//! Replies are always sent inside a [`Link::drive`] / [`Link::listen`]
//! bracket. On a point to point UART the bracket only waits for the last
//! byte to leave; on a shared RS-485 bus it turns the transceiver around.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial;

/// Bytes the RS-485 transceiver may echo into its own receiver while
/// switching back to listening
pub const ECHO_BYTES: usize = 2;

pub trait Link {
    type Error: Debug;

    /// Non-blocking read of one received byte
    fn read(&mut self) -> nb::Result<u8, Self::Error>;

    fn write(&mut self, byte: u8) -> nb::Result<(), Self::Error>;

    /// Takes the line ahead of a reply
    fn drive(&mut self) -> Result<(), Self::Error>;

    /// Waits for the reply to leave the wire and goes back to listening
    fn listen(&mut self) -> Result<(), Self::Error>;
}

/// Reads `buf.len()` bytes. Returns `false` once the line stays quiet for
/// `spin_limit` polls in a row, leaving the rest of `buf` untouched.
pub fn receive<L: Link>(link: &mut L, buf: &mut [u8], spin_limit: u32) -> Result<bool, L::Error> {
    for b in buf.iter_mut() {
        let mut spins = 0;

        *b = loop {
            match link.read() {
                Ok(v) => break v,
                Err(nb::Error::WouldBlock) => {
                    spins += 1;
                    if spins >= spin_limit {
                        return Ok(false);
                    }
                }
                Err(nb::Error::Other(e)) => return Err(e),
            }
        };
    }

    Ok(true)
}

/// Sends `parts` back to back as one reply
pub fn respond<L: Link>(link: &mut L, parts: &[&[u8]]) -> Result<(), L::Error> {
    link.drive()?;

    let sent = parts
        .iter()
        .flat_map(|p| p.iter())
        .try_for_each(|&b| block!(link.write(b)));

    // Listen again even when the reply failed
    let released = link.listen();

    sent.and(released)
}

/// Full-duplex UART
pub struct Uart<S> {
    serial: S,
}

impl<S> Uart<S> {
    pub fn new(serial: S) -> Self {
        Self { serial }
    }

    pub fn free(self) -> S {
        self.serial
    }
}

impl<S, E> Link for Uart<S>
where
    S: serial::Read<u8, Error = E> + serial::Write<u8, Error = E>,
    E: Debug,
{
    type Error = E;

    fn read(&mut self) -> nb::Result<u8, E> {
        self.serial.read()
    }

    fn write(&mut self, byte: u8) -> nb::Result<(), E> {
        self.serial.write(byte)
    }

    fn drive(&mut self) -> Result<(), E> {
        Ok(())
    }

    fn listen(&mut self) -> Result<(), E> {
        block!(self.serial.flush())
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Rs485Error<SerialError, PinError> {
    Serial(SerialError),
    Pin(PinError),
}

/// Half-duplex RS-485 transceiver with separate driver enable (DE, active
/// high) and receiver enable (/RE, active low) lines
pub struct Rs485<S, DE, RE, D> {
    serial: S,
    driver_enable: DE,
    receiver_enable: RE,
    delay: D,
    settle_us: u16,
}

impl<S, DE, RE, D, SE, PE> Rs485<S, DE, RE, D>
where
    S: serial::Read<u8, Error = SE> + serial::Write<u8, Error = SE>,
    DE: OutputPin<Error = PE>,
    RE: OutputPin<Error = PE>,
    D: DelayUs<u16>,
{
    /// Creates the link and puts the transceiver in receive mode
    pub fn new(
        serial: S,
        driver_enable: DE,
        receiver_enable: RE,
        delay: D,
        settle_us: u16,
    ) -> Result<Self, Rs485Error<SE, PE>> {
        let mut s = Self {
            serial,
            driver_enable,
            receiver_enable,
            delay,
            settle_us,
        };

        s.driver_enable.set_low().map_err(Rs485Error::Pin)?;
        s.receiver_enable.set_low().map_err(Rs485Error::Pin)?;

        Ok(s)
    }

    pub fn free(self) -> (S, DE, RE, D) {
        (self.serial, self.driver_enable, self.receiver_enable, self.delay)
    }
}

impl<S, DE, RE, D, SE, PE> Link for Rs485<S, DE, RE, D>
where
    S: serial::Read<u8, Error = SE> + serial::Write<u8, Error = SE>,
    DE: OutputPin<Error = PE>,
    RE: OutputPin<Error = PE>,
    D: DelayUs<u16>,
    SE: Debug,
    PE: Debug,
{
    type Error = Rs485Error<SE, PE>;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.serial.read().map_err(|e| e.map(Rs485Error::Serial))
    }

    fn write(&mut self, byte: u8) -> nb::Result<(), Self::Error> {
        self.serial.write(byte).map_err(|e| e.map(Rs485Error::Serial))
    }

    fn drive(&mut self) -> Result<(), Self::Error> {
        self.receiver_enable.set_high().map_err(Rs485Error::Pin)?;
        self.driver_enable.set_high().map_err(Rs485Error::Pin)?;
        self.delay.delay_us(self.settle_us);
        Ok(())
    }

    fn listen(&mut self) -> Result<(), Self::Error> {
        block!(self.serial.flush()).map_err(Rs485Error::Serial)?;
        self.delay.delay_us(self.settle_us);

        self.driver_enable.set_low().map_err(Rs485Error::Pin)?;
        self.receiver_enable.set_low().map_err(Rs485Error::Pin)?;

        // Drop whatever the transceiver echoed during the turnaround
        for _ in 0..ECHO_BYTES {
            match self.serial.read() {
                Ok(b) => trace!("Discarding echo {:#04x}", b),
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(Rs485Error::Serial(e)),
            }
        }

        Ok(())
    }
}
