//! Bootloader command loop.
//!
//! One opcode is read, handled and fully answered before the next byte is
//! consumed. Handlers resolve their own failures into a FAIL status so the
//! loop is always ready for the next opcode; only link errors leave
//! [`Dispatcher::step`]. Unknown opcodes are dropped without a reply.

use core::convert::TryFrom;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::watchdog::Watchdog;

use crate::device::link::{receive, respond, Link};
use crate::device::nvm::{Nvm, NvmController, NvmError};
use crate::device::system::{software_reset, SystemControl};
use crate::device::DeviceConfig;
use crate::protocol::{Command, Status, BOOTLOADER_VERSION, MAX_PAGE_SIZE, STATUS_OK};

pub struct Dispatcher<L, C, S, W, D> {
    link: L,
    nvm: Nvm<C>,
    system: S,
    watchdog: W,
    delay: D,
    config: DeviceConfig,

    /// Staging for page payloads and read-back data. Reused without
    /// clearing, contents are only meaningful within one command.
    buffer: [u8; MAX_PAGE_SIZE],
}

impl<L, C, S, W, D> Dispatcher<L, C, S, W, D>
where
    L: Link,
    C: NvmController,
    S: SystemControl,
    W: Watchdog,
    D: DelayMs<u16>,
{
    pub fn new(link: L, nvm: Nvm<C>, system: S, watchdog: W, delay: D, config: DeviceConfig) -> Self {
        Self {
            link,
            nvm,
            system,
            watchdog,
            delay,
            config,
            buffer: [0u8; MAX_PAGE_SIZE],
        }
    }

    pub fn nvm(&self) -> &Nvm<C> {
        &self.nvm
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn release(self) -> (L, Nvm<C>, S, W, D) {
        (self.link, self.nvm, self.system, self.watchdog, self.delay)
    }

    /// Serves commands forever
    pub fn run(&mut self) -> ! {
        info!("Bootloader ready");

        loop {
            if let Err(e) = self.step() {
                warn!("Link error: {:?}", e);
            }
        }
    }

    /// Reads and handles a single command, returning `None` for an unknown opcode
    pub fn step(&mut self) -> Result<Option<Command>, L::Error> {
        let opcode = block!(self.link.read())?;
        self.watchdog.feed();

        let command = match Command::try_from(opcode) {
            Ok(c) => c,
            Err(v) => {
                trace!("Ignoring opcode {:#04x}", v);
                return Ok(None);
            }
        };

        debug!("Command {:?}", command);

        match command {
            Command::Nop => self.status(Status::Ok)?,
            Command::EraseApplication => {
                let r = self.nvm.erase_application();
                self.report(r)?;
            }
            Command::WritePage => self.write_flash_page()?,
            Command::ReadPage => self.read_flash_page()?,
            Command::ReadFlashCrcs => match self.nvm.flash_crcs() {
                Ok((app, boot)) => {
                    respond(&mut self.link, &[&[STATUS_OK], &app.to_le_bytes(), &boot.to_le_bytes()])?
                }
                Err(e) => self.report(Err(e))?,
            },
            Command::ReadMcuIds => {
                let id = self.system.device_id();
                self.sized(&id)?;
            }
            Command::ReadSerial => match self.nvm.serial_number() {
                Ok(s) => self.sized(&s)?,
                Err(e) => self.report(Err(e))?,
            },
            Command::ReadBootloaderVersion => respond(&mut self.link, &[&[STATUS_OK, BOOTLOADER_VERSION]])?,
            Command::ResetMcu => {
                self.status(Status::Ok)?;
                self.delay.delay_ms(self.config.reset_delay_ms);
                software_reset(&mut self.system);
            }
            Command::ReadFuses => match self.nvm.fuses() {
                Ok(f) => respond(&mut self.link, &[&[STATUS_OK], &f])?,
                Err(e) => self.report(Err(e))?,
            },
            Command::ReadEeprom => self.read_eeprom_page()?,
            Command::WriteEeprom => self.write_eeprom_page()?,
            Command::EraseUserSignatureRow => {
                let r = self.nvm.erase_user_signature_row();
                self.report(r)?;
            }
            Command::ReadUserSignatureRow => {
                let len = self.nvm.geometry().user_signature.page_len();
                match self.nvm.read_user_signature_row(&mut self.buffer[..len]) {
                    Ok(()) => respond_sized(&mut self.link, &self.buffer[..len])?,
                    Err(e) => self.report(Err(e))?,
                }
            }
            Command::WriteUserSignatureRow => {
                let len = self.nvm.geometry().user_signature.page_len();
                if self.fill_buffer(len)? {
                    let r = self.nvm.write_user_signature_row(&self.buffer[..len]);
                    self.report(r)?;
                } else {
                    self.abandon()?;
                }
            }
            Command::ReadMemorySizes => {
                let sizes = self.nvm.geometry().to_wire();
                respond(&mut self.link, &[&[STATUS_OK], &sizes])?;
            }
        }

        Ok(Some(command))
    }

    fn write_flash_page(&mut self) -> Result<(), L::Error> {
        let index = match self.read_index()? {
            Some(i) => i,
            None => return self.abandon(),
        };
        let region = self.nvm.geometry().application;
        if !region.contains_page(index) {
            warn!("Write to flash page {} out of range", index);
            return self.status(Status::Fail);
        }

        // Index accepted, the payload follows
        self.status(Status::Ok)?;

        let len = region.page_len();
        if !self.fill_buffer(len)? {
            return self.abandon();
        }

        let r = self.nvm.write_flash_page(index, &self.buffer[..len]);
        self.report(r)
    }

    fn read_flash_page(&mut self) -> Result<(), L::Error> {
        let index = match self.read_index()? {
            Some(i) => i,
            None => return self.abandon(),
        };
        let len = self.nvm.geometry().application.page_len();

        match self.nvm.read_flash_page(index, &mut self.buffer[..len]) {
            Ok(()) => respond_sized(&mut self.link, &self.buffer[..len]),
            Err(e) => self.report(Err(e)),
        }
    }

    fn write_eeprom_page(&mut self) -> Result<(), L::Error> {
        let index = match self.read_index()? {
            Some(i) => i,
            None => return self.abandon(),
        };
        let region = self.nvm.geometry().eeprom;
        if !region.contains_page(index) {
            warn!("Write to EEPROM page {} out of range", index);
            return self.status(Status::Fail);
        }

        self.status(Status::Ok)?;

        let len = region.page_len();
        if !self.fill_buffer(len)? {
            return self.abandon();
        }

        let r = self.nvm.write_eeprom_page(index, &self.buffer[..len]);
        self.report(r)
    }

    fn read_eeprom_page(&mut self) -> Result<(), L::Error> {
        let index = match self.read_index()? {
            Some(i) => i,
            None => return self.abandon(),
        };
        let len = self.nvm.geometry().eeprom.page_len();

        match self.nvm.read_eeprom_page(index, &mut self.buffer[..len]) {
            Ok(()) => respond_sized(&mut self.link, &self.buffer[..len]),
            Err(e) => self.report(Err(e)),
        }
    }

    /// Page indices are sent high byte first
    fn read_index(&mut self) -> Result<Option<u16>, L::Error> {
        let mut b = [0u8; 2];
        if receive(&mut self.link, &mut b, self.config.byte_spin_limit)? {
            Ok(Some(u16::from_be_bytes(b)))
        } else {
            Ok(None)
        }
    }

    /// Fills the first `len` bytes of the page buffer from the link
    fn fill_buffer(&mut self, len: usize) -> Result<bool, L::Error> {
        receive(&mut self.link, &mut self.buffer[..len], self.config.byte_spin_limit)
    }

    /// The host went quiet part way through a command
    fn abandon(&mut self) -> Result<(), L::Error> {
        warn!("Incomplete command abandoned");
        self.status(Status::Fail)
    }

    fn status(&mut self, status: Status) -> Result<(), L::Error> {
        respond(&mut self.link, &[&[status.byte()]])
    }

    fn report(&mut self, r: Result<(), NvmError>) -> Result<(), L::Error> {
        if let Err(e) = &r {
            warn!("{}", e);
        }
        self.status(Status::from(&r))
    }

    fn sized(&mut self, data: &[u8]) -> Result<(), L::Error> {
        respond_sized(&mut self.link, data)
    }
}

/// OK, little-endian length, then `data`
fn respond_sized<L: Link>(link: &mut L, data: &[u8]) -> Result<(), L::Error> {
    let len = (data.len() as u16).to_le_bytes();
    respond(link, &[&[STATUS_OK], &len, data])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::link::{Rs485, Uart};
    use crate::device::sim::{SimulatedNvm, SimulatedSystem};
    use crate::geometry::{Geometry, Region, ERASED};
    use crate::protocol::{STATUS_FAIL, STATUS_OK};
    use embedded_hal_mock::delay::MockNoop;
    use embedded_hal_mock::pin::{Mock as PinMock, State, Transaction as PinTransaction};
    use embedded_hal_mock::serial::{Mock as SerialMock, Transaction};

    #[derive(Default)]
    struct CountingWatchdog(usize);

    impl Watchdog for CountingWatchdog {
        fn feed(&mut self) {
            self.0 += 1;
        }
    }

    type TestDispatcher = Dispatcher<Uart<SerialMock<u8>>, SimulatedNvm, SimulatedSystem, CountingWatchdog, MockNoop>;

    fn geometry() -> Geometry {
        Geometry {
            application: Region::new(0, 1024, 256),
            boot: Region::new(0x400, 512, 256),
            eeprom: Region::new(0, 128, 32),
            user_signature: Region::new(0, 64, 64),
        }
    }

    fn dispatcher(expectations: &[Transaction<u8>]) -> TestDispatcher {
        dispatcher_with(Uart::new(SerialMock::new(expectations)), DeviceConfig::default())
    }

    fn dispatcher_with<L: Link>(
        link: L,
        config: DeviceConfig,
    ) -> Dispatcher<L, SimulatedNvm, SimulatedSystem, CountingWatchdog, MockNoop> {
        let g = geometry();
        let nvm = Nvm::new(SimulatedNvm::new(g).with_latency(2), g, 100);

        Dispatcher::new(
            link,
            nvm,
            SimulatedSystem::new(),
            CountingWatchdog::default(),
            MockNoop::new(),
            config,
        )
    }

    fn finish(d: TestDispatcher) -> (SimulatedNvm, SimulatedSystem, usize) {
        let (link, nvm, system, watchdog, _) = d.release();
        link.free().done();
        (nvm.release(), system, watchdog.0)
    }

    fn reply(bytes: &[u8]) -> Vec<Transaction<u8>> {
        vec![Transaction::write_many(bytes), Transaction::flush()]
    }

    #[test]
    fn write_then_read_page() {
        let page: Vec<u8> = (0..=255u8).rev().collect();

        let mut sized = vec![STATUS_OK, 0x00, 0x01];
        sized.extend_from_slice(&page);

        let mut t = vec![Transaction::read_many(&[b'W', 0x00, 0x03])];
        t.extend(reply(&[STATUS_OK]));
        t.push(Transaction::read_many(&page));
        t.extend(reply(&[STATUS_OK]));
        t.push(Transaction::read_many(&[b'r', 0x00, 0x03]));
        t.extend(reply(&sized));

        let mut d = dispatcher(&t);
        assert_eq!(d.step(), Ok(Some(Command::WritePage)));
        assert_eq!(d.step(), Ok(Some(Command::ReadPage)));

        let (nvm, _, feeds) = finish(d);
        assert_eq!(&nvm.application()[0x300..0x400], &page[..]);
        assert_eq!(nvm.violations(), 0);
        assert_eq!(feeds, 2);
    }

    #[test]
    fn out_of_range_write_reads_no_payload() {
        // Index 4 of a 4 page section, FAIL and the next byte is an opcode again
        let mut t = vec![Transaction::read_many(&[b'W', 0x00, 0x04])];
        t.extend(reply(&[STATUS_FAIL]));
        t.push(Transaction::read(b'v'));
        t.extend(reply(&[STATUS_OK, BOOTLOADER_VERSION]));

        let mut d = dispatcher(&t);
        assert_eq!(d.step(), Ok(Some(Command::WritePage)));
        assert_eq!(d.step(), Ok(Some(Command::ReadBootloaderVersion)));

        let (nvm, _, _) = finish(d);
        assert!(nvm.application().iter().all(|&b| b == ERASED));
        assert_eq!(nvm.commands(), 0);
    }

    #[test]
    fn out_of_range_reads_fail() {
        let mut t = vec![Transaction::read_many(&[b'r', 0x01, 0x00])];
        t.extend(reply(&[STATUS_FAIL]));
        t.push(Transaction::read_many(&[b'e', 0x00, 0x04]));
        t.extend(reply(&[STATUS_FAIL]));
        t.push(Transaction::read_many(&[b'E', 0xFF, 0xFF]));
        t.extend(reply(&[STATUS_FAIL]));

        let mut d = dispatcher(&t);
        for _ in 0..3 {
            d.step().unwrap();
        }

        let (nvm, _, _) = finish(d);
        assert!(nvm.eeprom().iter().all(|&b| b == ERASED));
    }

    #[test]
    fn unknown_opcode_is_ignored() {
        let mut t = vec![Transaction::read(b'x'), Transaction::read(0x00), Transaction::read(b'n')];
        t.extend(reply(&[STATUS_OK]));

        let mut d = dispatcher(&t);
        assert_eq!(d.step(), Ok(None));
        assert_eq!(d.step(), Ok(None));
        assert_eq!(d.step(), Ok(Some(Command::Nop)));

        let (_, _, feeds) = finish(d);
        assert_eq!(feeds, 3);
    }

    #[test]
    fn back_to_back_commands_reply_in_order() {
        let mut t = vec![Transaction::read(b'v')];
        t.extend(reply(&[STATUS_OK, BOOTLOADER_VERSION]));
        t.push(Transaction::read(b'i'));
        t.extend(reply(&[STATUS_OK, 4, 0, 0x1E, 0x97, 0x46, 0x09]));
        t.push(Transaction::read(b'#'));
        t.extend(reply(&[STATUS_OK]));

        let mut d = dispatcher(&t);
        assert_eq!(d.step(), Ok(Some(Command::ReadBootloaderVersion)));
        assert_eq!(d.step(), Ok(Some(Command::ReadMcuIds)));
        assert_eq!(d.step(), Ok(Some(Command::ResetMcu)));

        let (_, system, _) = finish(d);
        assert_eq!(system.resets(), 1);
    }

    #[test]
    fn erase_then_crcs() {
        let g = geometry();
        let app = crate::crc::crc32(&vec![ERASED; g.application.size as usize]);
        let boot = crate::crc::crc32(&vec![ERASED; g.boot.size as usize]);

        let mut expected = vec![STATUS_OK];
        expected.extend_from_slice(&app.to_le_bytes());
        expected.extend_from_slice(&boot.to_le_bytes());

        let mut t = vec![Transaction::read(b'!')];
        t.extend(reply(&[STATUS_OK]));
        t.push(Transaction::read(b'c'));
        t.extend(reply(&expected));

        let mut d = dispatcher(&t);
        d.step().unwrap();
        d.step().unwrap();
        finish(d);
    }

    #[test]
    fn eeprom_page_write_read() {
        let page = [0x5Au8; 32];
        let mut sized = vec![STATUS_OK, 32, 0];
        sized.extend_from_slice(&page);

        let mut t = vec![Transaction::read_many(&[b'E', 0x00, 0x02])];
        t.extend(reply(&[STATUS_OK]));
        t.push(Transaction::read_many(&page));
        t.extend(reply(&[STATUS_OK]));
        t.push(Transaction::read_many(&[b'e', 0x00, 0x02]));
        t.extend(reply(&sized));

        let mut d = dispatcher(&t);
        d.step().unwrap();
        d.step().unwrap();

        let (nvm, _, _) = finish(d);
        assert_eq!(&nvm.eeprom()[64..96], &page[..]);
    }

    #[test]
    fn user_signature_row_commands() {
        let row = [0x11u8; 64];
        let mut sized = vec![STATUS_OK, 64, 0];
        sized.extend_from_slice(&row);

        let mut t = vec![Transaction::read(b'U'), Transaction::read_many(&row)];
        t.extend(reply(&[STATUS_OK]));
        t.push(Transaction::read(b'u'));
        t.extend(reply(&sized));
        t.push(Transaction::read(b'*'));
        t.extend(reply(&[STATUS_OK]));

        let mut d = dispatcher(&t);
        for _ in 0..3 {
            d.step().unwrap();
        }

        let (nvm, _, _) = finish(d);
        assert!(nvm.user_signature().iter().all(|&b| b == ERASED));
    }

    #[test]
    fn identity_queries() {
        let mut fuses = vec![STATUS_OK];
        fuses.extend_from_slice(&[0xFF, 0x00, 0xFE, 0xFF, 0xFE, 0xFF]);

        let mut sizes = vec![STATUS_OK];
        sizes.extend_from_slice(&geometry().to_wire());

        let mut serial = vec![STATUS_OK, 11, 0];
        serial.extend_from_slice(&[0u8; 11]);

        let mut t = vec![Transaction::read(b'f')];
        t.extend(reply(&fuses));
        t.push(Transaction::read(b'm'));
        t.extend(reply(&sizes));
        t.push(Transaction::read(b's'));
        t.extend(reply(&serial));

        let mut d = dispatcher(&t);
        assert_eq!(d.step(), Ok(Some(Command::ReadFuses)));
        assert_eq!(d.step(), Ok(Some(Command::ReadMemorySizes)));
        assert_eq!(d.step(), Ok(Some(Command::ReadSerial)));
        finish(d);
    }

    #[test]
    fn stuck_controller_reports_fail_and_keeps_serving() {
        let mut t = vec![Transaction::read(b'!')];
        t.extend(reply(&[STATUS_FAIL]));
        t.push(Transaction::read(b'n'));
        t.extend(reply(&[STATUS_OK]));

        let mut d = dispatcher(&t);
        d.nvm.controller_mut().set_stuck(true);

        assert_eq!(d.step(), Ok(Some(Command::EraseApplication)));
        assert_eq!(d.step(), Ok(Some(Command::Nop)));
        finish(d);
    }

    #[test]
    fn stalled_payload_is_abandoned() {
        let config = DeviceConfig {
            byte_spin_limit: 3,
            ..DeviceConfig::default()
        };

        // Ten bytes of a page, then the host goes quiet
        let mut t = vec![Transaction::read_many(&[b'W', 0x00, 0x01])];
        t.extend(reply(&[STATUS_OK]));
        t.push(Transaction::read_many(&[0u8; 10]));
        t.extend((0..3).map(|_| Transaction::read_error(nb::Error::WouldBlock)));
        t.extend(reply(&[STATUS_FAIL]));
        t.push(Transaction::read(b'v'));
        t.extend(reply(&[STATUS_OK, BOOTLOADER_VERSION]));

        let mut d = dispatcher_with(Uart::new(SerialMock::new(&t)), config);
        assert_eq!(d.step(), Ok(Some(Command::WritePage)));
        assert_eq!(d.step(), Ok(Some(Command::ReadBootloaderVersion)));

        let (link, nvm, _, _, _) = d.release();
        link.free().done();

        let nvm = nvm.release();
        assert_eq!(nvm.commands(), 0);
        assert!(nvm.application().iter().all(|&b| b == ERASED));
    }

    #[test]
    fn rs485_brackets_every_reply() {
        let page = [0x3Cu8; 256];

        let mut sized = vec![STATUS_OK, 0x00, 0x01];
        sized.extend_from_slice(&page);

        // Each reply is followed by a flush and the echo reads of the turnaround
        let serial = SerialMock::new(&[
            Transaction::read_many(&[b'W', 0x00, 0x02]),
            Transaction::write(STATUS_OK),
            Transaction::flush(),
            Transaction::read(STATUS_OK),
            Transaction::read_error(nb::Error::WouldBlock),
            Transaction::read_many(&page),
            Transaction::write(STATUS_OK),
            Transaction::flush(),
            Transaction::read_error(nb::Error::WouldBlock),
            Transaction::read_many(&[b'r', 0x00, 0x02]),
            Transaction::write_many(&sized),
            Transaction::flush(),
            Transaction::read_error(nb::Error::WouldBlock),
        ]);

        // Listening after construction, then one drive/listen pair per reply
        let mut pins = vec![PinTransaction::set(State::Low)];
        for _ in 0..3 {
            pins.push(PinTransaction::set(State::High));
            pins.push(PinTransaction::set(State::Low));
        }
        let de = PinMock::new(&pins);
        let re = PinMock::new(&pins);

        let link = Rs485::new(serial, de, re, MockNoop::new(), 50).unwrap();
        let mut d = dispatcher_with(link, DeviceConfig::default());

        assert_eq!(d.step(), Ok(Some(Command::WritePage)));
        assert_eq!(d.step(), Ok(Some(Command::ReadPage)));

        let (link, nvm, _, _, _) = d.release();
        let (mut serial, mut de, mut re, _) = link.free();
        serial.done();
        de.done();
        re.done();

        assert_eq!(&nvm.release().application()[0x200..0x300], &page[..]);
    }
}
