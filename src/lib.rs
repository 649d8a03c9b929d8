//! XMEGA serial bootloader.
//!
//! The crate holds both ends of a minimal page-oriented update protocol:
//! the bootloader command loop in [`device`], and the host side [`Updater`]
//! that finds the bootloader, erases the application section and writes
//! a firmware image page by page.

use core::convert::TryFrom;
use core::fmt::Debug;
use core::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod crc;
pub mod device;
pub mod geometry;
pub mod image;
pub mod protocol;

use geometry::MemorySizes;
use image::Image;
use protocol::{indexed, Command, FUSE_COUNT, MCU_ID_LEN, MEMORY_SIZES_LEN, STATUS_OK};

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    /// Status byte other than OK
    #[error("bad response {0:#04x}")]
    Fail(u8),

    #[error("no response from bootloader")]
    ResponseTimeout,

    #[error("cancelled")]
    Cancelled,

    #[error("malformed response")]
    InvalidResponse,

    #[error("image page size {image} does not match device page size {device}")]
    PageSize { image: usize, device: usize },

    #[error("image needs {pages} pages, application section has {available}")]
    ImageTooLarge { pages: usize, available: u32 },

    #[error("page {0} differs from the image")]
    VerifyMismatch(usize),

    #[error("application CRC {device:#010x} does not match image CRC {image:#010x}")]
    CrcMismatch { device: u32, image: u32 },
}

impl<SerialError: Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Pulse DTR and RTS to reset the device before looking for the bootloader
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses, 0 polls every millisecond
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period between NOPs while looking for the bootloader
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub rendezvous_interval_ms: u32,

    /// Give up looking for the bootloader after this long, 0 waits until cancelled or stopped
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub rendezvous_timeout_ms: u32,

    /// Period to wait for the device to come out of reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reset: false,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            rendezvous_interval_ms: 10,
            rendezvous_timeout_ms: 0,
            init_delay_ms: 100,
        }
    }
}

pub struct Updater<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Updater<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new updater instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Reset the device using the DTR and RTS lines
    pub fn reset_target(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;

        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Sends NOPs until the bootloader acknowledges one.
    ///
    /// Only `cancel` or the optional rendezvous timeout end the search, the
    /// bootloader may sit behind a reset the operator has yet to trigger.
    /// Without a `cancel` flag the search runs until the timeout or until
    /// the process is stopped.
    pub fn wait_for_bootloader(&mut self, cancel: Option<&AtomicBool>) -> Result<(), Error<E>> {
        if self.options.reset {
            self.reset_target()?;
        }

        info!("Waiting for bootloader");

        let interval = self.options.rendezvous_interval_ms.max(1);
        let mut waited = 0u32;

        loop {
            if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
                info!("Cancelled");
                return Err(Error::Cancelled);
            }

            self.discard_input()?;
            self.send(&[Command::Nop.opcode()])?;

            match self.poll(interval)? {
                Some(STATUS_OK) => break,
                Some(v) => trace!("Ignoring {:#04x} while waiting for bootloader", v),
                None => (),
            }

            waited = waited.saturating_add(interval);
            let timeout = self.options.rendezvous_timeout_ms;
            if timeout != 0 && waited >= timeout {
                error!("Bootloader not found");
                return Err(Error::ResponseTimeout);
            }
        }

        debug!("Received bootloader ack");

        // Acks for NOPs still in flight
        self.delay.delay_ms(interval);
        self.discard_input()?;

        Ok(())
    }

    pub fn erase_application(&mut self) -> Result<(), Error<E>> {
        self.command(&[Command::EraseApplication.opcode()])
    }

    /// Writes one application page
    pub fn write_page(&mut self, index: u16, data: &[u8]) -> Result<(), Error<E>> {
        self.write_indexed(Command::WritePage, index, data)
    }

    pub fn read_page(&mut self, index: u16) -> Result<Vec<u8>, Error<E>> {
        self.command(&indexed(Command::ReadPage, index))?;
        self.read_sized()
    }

    /// Application and boot section CRCs
    pub fn flash_crcs(&mut self) -> Result<(u32, u32), Error<E>> {
        self.command(&[Command::ReadFlashCrcs.opcode()])?;

        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;

        let app = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let boot = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);
        Ok((app, boot))
    }

    pub fn mcu_ids(&mut self) -> Result<[u8; MCU_ID_LEN], Error<E>> {
        self.command(&[Command::ReadMcuIds.opcode()])?;

        let d = self.read_sized()?;
        let mut id = [0u8; MCU_ID_LEN];
        if d.len() != id.len() {
            return Err(Error::InvalidResponse);
        }
        id.copy_from_slice(&d);
        Ok(id)
    }

    pub fn serial_number(&mut self) -> Result<Vec<u8>, Error<E>> {
        self.command(&[Command::ReadSerial.opcode()])?;
        self.read_sized()
    }

    pub fn bootloader_version(&mut self) -> Result<u8, Error<E>> {
        self.command(&[Command::ReadBootloaderVersion.opcode()])?;
        self.read_byte()
    }

    pub fn fuses(&mut self) -> Result<[u8; FUSE_COUNT], Error<E>> {
        self.command(&[Command::ReadFuses.opcode()])?;

        let mut f = [0u8; FUSE_COUNT];
        self.read_exact(&mut f)?;
        Ok(f)
    }

    pub fn read_eeprom_page(&mut self, index: u16) -> Result<Vec<u8>, Error<E>> {
        self.command(&indexed(Command::ReadEeprom, index))?;
        self.read_sized()
    }

    pub fn write_eeprom_page(&mut self, index: u16, data: &[u8]) -> Result<(), Error<E>> {
        self.write_indexed(Command::WriteEeprom, index, data)
    }

    pub fn erase_user_signature_row(&mut self) -> Result<(), Error<E>> {
        self.command(&[Command::EraseUserSignatureRow.opcode()])
    }

    pub fn read_user_signature_row(&mut self) -> Result<Vec<u8>, Error<E>> {
        self.command(&[Command::ReadUserSignatureRow.opcode()])?;
        self.read_sized()
    }

    /// Writes the user signature row, `row` must be exactly one row long
    pub fn write_user_signature_row(&mut self, row: &[u8]) -> Result<(), Error<E>> {
        self.discard_input()?;
        self.send(&[Command::WriteUserSignatureRow.opcode()])?;
        self.send(row)?;
        self.expect_ok()
    }

    pub fn memory_sizes(&mut self) -> Result<MemorySizes, Error<E>> {
        self.command(&[Command::ReadMemorySizes.opcode()])?;

        let mut b = [0u8; MEMORY_SIZES_LEN];
        self.read_exact(&mut b)?;
        MemorySizes::from_wire(&b).ok_or(Error::InvalidResponse)
    }

    /// Resets the device, which then leaves the bootloader
    pub fn reset_device(&mut self) -> Result<(), Error<E>> {
        self.command(&[Command::ResetMcu.opcode()])
    }

    /// Replaces the application: erase, write every image page, reset.
    ///
    /// `progress` is called with the page about to be written and the page
    /// count. The first failure aborts the update and leaves the device
    /// partly written.
    pub fn update<F>(&mut self, image: &Image, progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize, usize),
    {
        self.program(image, progress)?;
        self.reset_device()
    }

    /// Erases the application section and writes every image page, leaving
    /// the device in the bootloader
    pub fn program<F>(&mut self, image: &Image, mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize, usize),
    {
        let count = image.page_count();

        // Every index must fit the wire before anything is erased
        page_index(count.saturating_sub(1), count)?;

        info!("Writing {} pages", count);

        debug!("Erasing application section");
        self.erase_application()?;

        for (index, page) in image.pages().enumerate() {
            progress(index, count);
            self.write_page(page_index(index, count)?, page).map_err(|e| {
                error!("Page {} failed: {}", index, e);
                e
            })?;
        }
        progress(count, count);

        Ok(())
    }

    /// Reads back every image page and compares it
    pub fn verify(&mut self, image: &Image) -> Result<(), Error<E>> {
        let count = image.page_count();
        for (index, page) in image.pages().enumerate() {
            let d = self.read_page(page_index(index, count)?)?;
            if d != page {
                error!("Page {} differs", index);
                return Err(Error::VerifyMismatch(index));
            }
        }
        Ok(())
    }

    /// Compares the application section CRC against the image
    pub fn verify_crc(&mut self, image: &Image, sizes: &MemorySizes) -> Result<(), Error<E>> {
        let expected = image
            .section_crc(sizes.application as usize)
            .ok_or(Error::ImageTooLarge {
                pages: image.page_count(),
                available: sizes.application_pages(),
            })?;

        let (device, _) = self.flash_crcs()?;
        if device != expected {
            return Err(Error::CrcMismatch { device, image: expected });
        }
        Ok(())
    }

    /// Checks an image fits the application section of the device
    pub fn check_image(&self, image: &Image, sizes: &MemorySizes) -> Result<(), Error<E>> {
        if image.page_size() != sizes.application_page as usize {
            return Err(Error::PageSize {
                image: image.page_size(),
                device: sizes.application_page as usize,
            });
        }
        if image.page_count() > sizes.application_pages() as usize {
            return Err(Error::ImageTooLarge {
                pages: image.page_count(),
                available: sizes.application_pages(),
            });
        }
        Ok(())
    }

    /// Two-phase write: the index is acknowledged before the payload is sent
    fn write_indexed(&mut self, command: Command, index: u16, data: &[u8]) -> Result<(), Error<E>> {
        self.command(&indexed(command, index))?;
        self.send(data)?;
        self.expect_ok()
    }

    /// Sends a command and requires an OK status
    fn command(&mut self, frame: &[u8]) -> Result<(), Error<E>> {
        self.discard_input()?;
        self.send(frame)?;
        self.expect_ok()
    }

    fn expect_ok(&mut self) -> Result<(), Error<E>> {
        match self.read_byte()? {
            STATUS_OK => Ok(()),
            v => {
                debug!("Received bad response {:#04x}", v);
                Err(Error::Fail(v))
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for &b in data {
            block!(self.port.write(b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    /// Drops anything already received
    fn discard_input(&mut self) -> Result<(), Error<E>> {
        loop {
            match self.port.read() {
                Ok(v) => trace!("Discarding {:#04x}", v),
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
    }

    /// Length-prefixed body of a read reply
    fn read_sized(&mut self) -> Result<Vec<u8>, Error<E>> {
        let mut len = [0u8; 2];
        self.read_exact(&mut len)?;

        let mut d = vec![0u8; u16::from_le_bytes(len) as usize];
        self.read_exact(&mut d)?;
        Ok(d)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error<E>> {
        for b in buf.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        match self.poll(self.options.response_timeout_ms)? {
            Some(v) => Ok(v),
            None => {
                error!("Receive timeout");
                Err(Error::ResponseTimeout)
            }
        }
    }

    /// Polls for one byte for up to `timeout_ms`
    fn poll(&mut self, timeout_ms: u32) -> Result<Option<u8>, Error<E>> {
        // At least 1 ms per poll so `t` counts time actually waited
        let step = self.options.poll_delay_ms.max(1);
        let mut t = 0u32;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(Some(v)),
            };

            if t >= timeout_ms {
                return Ok(None);
            }

            self.delay.delay_ms(step);
            t = t.saturating_add(step);
        }
    }
}

/// Wire page index of the `index`th of `count` image pages
fn page_index<E: Debug>(index: usize, count: usize) -> Result<u16, Error<E>> {
    u16::try_from(index).map_err(|_| Error::ImageTooLarge {
        pages: count,
        available: u32::from(u16::MAX) + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts everything, never answers
    struct Quiet;

    impl Read<u8> for Quiet {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            Err(nb::Error::WouldBlock)
        }
    }

    impl Write<u8> for Quiet {
        type Error = ();

        fn write(&mut self, _byte: u8) -> nb::Result<(), ()> {
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    impl SerialPort<()> for Quiet {
        fn set_rts(&mut self, _level: bool) -> Result<(), ()> {
            Ok(())
        }

        fn set_dtr(&mut self, _level: bool) -> Result<(), ()> {
            Ok(())
        }
    }

    /// Adds up requested delays instead of sleeping
    #[derive(Default)]
    struct Elapsed(u32);

    impl DelayMs<u32> for Elapsed {
        fn delay_ms(&mut self, ms: u32) {
            self.0 += ms;
        }
    }

    #[test]
    fn zero_poll_delay_still_waits_the_timeout() {
        let options = Options {
            poll_delay_ms: 0,
            response_timeout_ms: 20,
            ..Options::default()
        };
        let mut u = Updater::new(Quiet, Elapsed::default(), options);

        assert_eq!(u.bootloader_version(), Err(Error::ResponseTimeout));

        let (_, waited) = u.free();
        assert_eq!(waited.0, 20);
    }

    #[test]
    fn oversized_image_fails_before_erase() {
        let mut u = Updater::new(Quiet, Elapsed::default(), Options::default());

        // One-byte pages, one more than a u16 index can address
        let image = Image::from_bytes(vec![0u8; 65_537], 1);
        assert_eq!(
            u.update(&image, |_, _| ()),
            Err(Error::ImageTooLarge { pages: 65_537, available: 65_536 })
        );

        // Nothing went out, so nothing was waited for
        let (_, waited) = u.free();
        assert_eq!(waited.0, 0);
    }

    #[test]
    fn page_indices() {
        assert_eq!(page_index::<()>(65_535, 65_536), Ok(65_535));
        assert!(page_index::<()>(65_536, 65_537).is_err());
    }
}
