//! Non-volatile memory programming.
//!
//! [`NvmController`] is the raw controller: each method issues one command
//! and returns immediately, with no check that the controller is idle.
//! [`Nvm`] is the only path the command loop uses. It validates page
//! indices before anything reaches the hardware and brackets every command
//! with a bounded wait for the controller to go idle, since a command
//! issued while another is in flight corrupts both.

use thiserror::Error;

use crate::geometry::{Geometry, Region, ERASED};
use crate::protocol::{FUSE_COUNT, MAX_PAGE_SIZE, SERIAL_NUMBER_LEN};

/// Offset of LOTNUM0 in the production signature row, the serial number
/// runs from here
pub const SERIAL_NUMBER_OFFSET: u8 = 0x08;

/// Raw XMEGA NVM controller commands
pub trait NvmController {
    /// Whether the previous command is still executing
    fn busy(&mut self) -> bool;

    /// Loads the flash page buffer, shared by application pages and the
    /// user signature row
    fn load_flash_buffer(&mut self, data: &[u8]);

    /// Erases the page at `address` and programs it from the flash buffer
    fn erase_write_application_page(&mut self, address: u32);

    fn erase_application_section(&mut self);

    fn erase_user_signature_row(&mut self);

    /// Programs the user signature row from the flash buffer
    fn write_user_signature_row(&mut self);

    /// Loads `data` into the EEPROM page buffer starting at `offset`.
    /// Only loaded locations take part in the next EEPROM command.
    fn load_eeprom_buffer(&mut self, offset: usize, data: &[u8]);

    /// Atomic erase and write of the loaded locations of one EEPROM page
    fn erase_write_eeprom_page(&mut self, address: u32);

    /// Erases the loaded locations of every EEPROM page
    fn erase_eeprom(&mut self);

    fn read_flash(&mut self, address: u32, buf: &mut [u8]);
    fn read_eeprom(&mut self, address: u32, buf: &mut [u8]);
    fn read_user_signature(&mut self, offset: u32, buf: &mut [u8]);

    /// Reads one byte of the production signature (calibration) row
    fn read_calibration(&mut self, offset: u8) -> u8;

    fn read_fuse(&mut self, index: u8) -> u8;

    fn application_crc(&mut self) -> u32;
    fn boot_crc(&mut self) -> u32;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum RegionKind {
    Application,
    Eeprom,
    UserSignature,
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum NvmError {
    #[error("page {index} outside {region:?} region of {count} pages")]
    OutOfRange { region: RegionKind, index: u16, count: u32 },

    #[error("{len} bytes do not fit a {page} byte page")]
    PageLength { len: usize, page: usize },

    #[error("NVM controller still busy after {0} polls")]
    Timeout(u32),
}

pub struct Nvm<C> {
    controller: C,
    geometry: Geometry,
    spin_limit: u32,
}

impl<C: NvmController> Nvm<C> {
    /// Wraps a controller. Panics if a writable page does not fit the page buffer.
    pub fn new(controller: C, geometry: Geometry, spin_limit: u32) -> Self {
        for r in &[geometry.application, geometry.eeprom, geometry.user_signature] {
            assert!(r.page_len() <= MAX_PAGE_SIZE, "page of {} bytes exceeds the page buffer", r.page_size);
        }

        Self { controller, geometry, spin_limit }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    pub fn release(self) -> C {
        self.controller
    }

    /// Spins until the controller is idle
    pub fn wait_ready(&mut self) -> Result<(), NvmError> {
        for _ in 0..self.spin_limit {
            if !self.controller.busy() {
                return Ok(());
            }
        }

        error!("NVM controller stuck busy");
        Err(NvmError::Timeout(self.spin_limit))
    }

    pub fn erase_application(&mut self) -> Result<(), NvmError> {
        self.wait_ready()?;
        self.controller.erase_application_section();
        self.wait_ready()
    }

    /// Programs one full application page
    pub fn write_flash_page(&mut self, index: u16, page: &[u8]) -> Result<(), NvmError> {
        let region = self.geometry.application;
        let address = Self::locate(&region, RegionKind::Application, index)?;
        Self::check_len(&region, page.len(), true)?;

        trace!("flash page {} at {:#07x}", index, address);

        self.wait_ready()?;
        self.controller.load_flash_buffer(page);
        self.wait_ready()?;
        self.controller.erase_write_application_page(address);
        self.wait_ready()
    }

    pub fn read_flash_page(&mut self, index: u16, buf: &mut [u8]) -> Result<(), NvmError> {
        let region = self.geometry.application;
        let address = Self::locate(&region, RegionKind::Application, index)?;
        Self::check_len(&region, buf.len(), true)?;

        self.wait_ready()?;
        self.controller.read_flash(address, buf);
        Ok(())
    }

    /// Atomic erase and write of one EEPROM page.
    ///
    /// Only the `staged.len()` leading bytes of the page are written, the
    /// rest of the page keeps whatever it held before.
    pub fn write_eeprom_page(&mut self, index: u16, staged: &[u8]) -> Result<(), NvmError> {
        let region = self.geometry.eeprom;
        let address = Self::locate(&region, RegionKind::Eeprom, index)?;
        Self::check_len(&region, staged.len(), false)?;

        trace!("eeprom page {} at {:#06x}, {} bytes staged", index, address, staged.len());

        self.wait_ready()?;
        self.controller.load_eeprom_buffer(0, staged);
        self.wait_ready()?;
        self.controller.erase_write_eeprom_page(address);
        self.wait_ready()
    }

    pub fn read_eeprom_page(&mut self, index: u16, buf: &mut [u8]) -> Result<(), NvmError> {
        let region = self.geometry.eeprom;
        let address = Self::locate(&region, RegionKind::Eeprom, index)?;
        Self::check_len(&region, buf.len(), true)?;

        self.wait_ready()?;
        self.controller.read_eeprom(address, buf);
        Ok(())
    }

    /// Erases the whole EEPROM. Recovery only, not reachable from the wire.
    pub fn erase_eeprom(&mut self) -> Result<(), NvmError> {
        let erased = [ERASED; MAX_PAGE_SIZE];
        let page = self.geometry.eeprom.page_len();

        self.wait_ready()?;
        self.controller.load_eeprom_buffer(0, &erased[..page]);
        self.wait_ready()?;
        self.controller.erase_eeprom();
        self.wait_ready()
    }

    pub fn erase_user_signature_row(&mut self) -> Result<(), NvmError> {
        self.wait_ready()?;
        self.controller.erase_user_signature_row();
        self.wait_ready()
    }

    pub fn write_user_signature_row(&mut self, row: &[u8]) -> Result<(), NvmError> {
        Self::check_len(&self.geometry.user_signature, row.len(), true)?;

        self.wait_ready()?;
        self.controller.load_flash_buffer(row);
        self.wait_ready()?;
        self.controller.write_user_signature_row();
        self.wait_ready()
    }

    pub fn read_user_signature_row(&mut self, buf: &mut [u8]) -> Result<(), NvmError> {
        Self::check_len(&self.geometry.user_signature, buf.len(), true)?;

        self.wait_ready()?;
        self.controller.read_user_signature(0, buf);
        Ok(())
    }

    /// Application and boot section CRCs
    pub fn flash_crcs(&mut self) -> Result<(u32, u32), NvmError> {
        self.wait_ready()?;
        let app = self.controller.application_crc();
        self.wait_ready()?;
        let boot = self.controller.boot_crc();
        self.wait_ready()?;

        Ok((app, boot))
    }

    pub fn fuses(&mut self) -> Result<[u8; FUSE_COUNT], NvmError> {
        let mut f = [0u8; FUSE_COUNT];
        for (i, v) in f.iter_mut().enumerate() {
            self.wait_ready()?;
            *v = self.controller.read_fuse(i as u8);
        }
        Ok(f)
    }

    pub fn serial_number(&mut self) -> Result<[u8; SERIAL_NUMBER_LEN], NvmError> {
        let mut s = [0u8; SERIAL_NUMBER_LEN];
        for (i, v) in s.iter_mut().enumerate() {
            self.wait_ready()?;
            *v = self.controller.read_calibration(SERIAL_NUMBER_OFFSET + i as u8);
        }
        Ok(s)
    }

    fn locate(region: &Region, kind: RegionKind, index: u16) -> Result<u32, NvmError> {
        region.page_address(index).ok_or(NvmError::OutOfRange {
            region: kind,
            index,
            count: region.page_count(),
        })
    }

    fn check_len(region: &Region, len: usize, exact: bool) -> Result<(), NvmError> {
        let page = region.page_len();
        if len > page || (exact && len != page) {
            return Err(NvmError::PageLength { len, page });
        }
        Ok(())
    }
}
