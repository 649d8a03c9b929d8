//! Hosted model of the XMEGA NVM controller and system control block.
//!
//! Models the parts of the hardware the protocol relies on: erased state,
//! page buffers with per-byte load tracking for EEPROM, a busy period after
//! every command, and the protected write that resets the part. Commands
//! issued while the controller is busy are counted as violations.

use crate::crc::crc32;
use crate::device::nvm::NvmController;
use crate::device::system::{ProtectedRegister, SystemControl};
use crate::geometry::{Geometry, ERASED};
use crate::protocol::{FUSE_COUNT, MCU_ID_LEN};

/// Size of the production signature row
const PRODUCTION_SIGNATURE_LEN: usize = 0x40;

#[derive(Clone, Debug)]
pub struct SimulatedNvm {
    geometry: Geometry,

    application: Vec<u8>,
    boot: Vec<u8>,
    eeprom: Vec<u8>,
    user_signature: Vec<u8>,

    flash_buffer: Vec<u8>,
    eeprom_buffer: Vec<u8>,
    eeprom_loaded: Vec<bool>,

    production_signature: [u8; PRODUCTION_SIGNATURE_LEN],
    fuses: [u8; FUSE_COUNT],

    latency: u32,
    pending: u32,
    stuck: bool,
    commands: usize,
    violations: usize,
}

impl SimulatedNvm {
    /// A blank part, every region erased
    pub fn new(geometry: Geometry) -> Self {
        let erased = |n: u32| vec![ERASED; n as usize];

        Self {
            application: erased(geometry.application.size),
            boot: erased(geometry.boot.size),
            eeprom: erased(geometry.eeprom.size),
            user_signature: erased(geometry.user_signature.size),
            flash_buffer: erased(geometry.application.page_size.max(geometry.user_signature.page_size)),
            eeprom_buffer: erased(geometry.eeprom.page_size),
            eeprom_loaded: vec![false; geometry.eeprom.page_len()],
            production_signature: [0; PRODUCTION_SIGNATURE_LEN],
            fuses: [0xFF, 0x00, 0xFE, 0xFF, 0xFE, 0xFF],
            latency: 0,
            pending: 0,
            stuck: false,
            commands: 0,
            violations: 0,
            geometry,
        }
    }

    /// Number of busy polls each command keeps the controller busy for
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    pub fn with_boot_section(mut self, boot: &[u8]) -> Self {
        self.boot[..boot.len()].copy_from_slice(boot);
        self
    }

    /// Keeps the busy flag raised forever
    pub fn set_stuck(&mut self, stuck: bool) {
        self.stuck = stuck;
    }

    pub fn set_production_signature(&mut self, row: &[u8]) {
        self.production_signature[..row.len()].copy_from_slice(row);
    }

    pub fn set_fuses(&mut self, fuses: [u8; FUSE_COUNT]) {
        self.fuses = fuses;
    }

    pub fn application(&self) -> &[u8] {
        &self.application
    }

    pub fn boot(&self) -> &[u8] {
        &self.boot
    }

    pub fn eeprom(&self) -> &[u8] {
        &self.eeprom
    }

    pub fn user_signature(&self) -> &[u8] {
        &self.user_signature
    }

    /// Commands issued, including buffer loads
    pub fn commands(&self) -> usize {
        self.commands
    }

    /// Commands issued while the controller was busy
    pub fn violations(&self) -> usize {
        self.violations
    }

    fn issue(&mut self) {
        if self.pending > 0 {
            warn!("NVM command issued while busy");
            self.violations += 1;
        }
        self.commands += 1;
        self.pending = self.latency;
    }

    fn page_offset(base: u32, address: u32) -> usize {
        (address - base) as usize
    }
}

impl NvmController for SimulatedNvm {
    fn busy(&mut self) -> bool {
        if self.stuck {
            return true;
        }
        if self.pending > 0 {
            self.pending -= 1;
            return true;
        }
        false
    }

    fn load_flash_buffer(&mut self, data: &[u8]) {
        self.issue();
        self.flash_buffer[..data.len()].copy_from_slice(data);
    }

    fn erase_write_application_page(&mut self, address: u32) {
        self.issue();

        let page = self.geometry.application.page_len();
        let offset = Self::page_offset(self.geometry.application.base, address);
        self.application[offset..offset + page].copy_from_slice(&self.flash_buffer[..page]);

        // The buffer is cleared by the write
        self.flash_buffer.iter_mut().for_each(|b| *b = ERASED);
    }

    fn erase_application_section(&mut self) {
        self.issue();
        self.application.iter_mut().for_each(|b| *b = ERASED);
    }

    fn erase_user_signature_row(&mut self) {
        self.issue();
        self.user_signature.iter_mut().for_each(|b| *b = ERASED);
    }

    fn write_user_signature_row(&mut self) {
        self.issue();

        let len = self.user_signature.len();
        self.user_signature.copy_from_slice(&self.flash_buffer[..len]);
        self.flash_buffer.iter_mut().for_each(|b| *b = ERASED);
    }

    fn load_eeprom_buffer(&mut self, offset: usize, data: &[u8]) {
        self.issue();

        self.eeprom_buffer[offset..offset + data.len()].copy_from_slice(data);
        self.eeprom_loaded[offset..offset + data.len()]
            .iter_mut()
            .for_each(|l| *l = true);
    }

    fn erase_write_eeprom_page(&mut self, address: u32) {
        self.issue();

        let offset = Self::page_offset(self.geometry.eeprom.base, address);
        for (i, loaded) in self.eeprom_loaded.iter_mut().enumerate() {
            if *loaded {
                self.eeprom[offset + i] = self.eeprom_buffer[i];
                *loaded = false;
            }
        }
    }

    fn erase_eeprom(&mut self) {
        self.issue();

        let page = self.geometry.eeprom.page_len();
        for chunk in self.eeprom.chunks_mut(page) {
            for (b, loaded) in chunk.iter_mut().zip(self.eeprom_loaded.iter()) {
                if *loaded {
                    *b = ERASED;
                }
            }
        }
        self.eeprom_loaded.iter_mut().for_each(|l| *l = false);
    }

    fn read_flash(&mut self, address: u32, buf: &mut [u8]) {
        let app = self.geometry.application;
        let boot = self.geometry.boot;

        let (mem, offset) = if address >= boot.base && address < boot.base + boot.size {
            (&self.boot, Self::page_offset(boot.base, address))
        } else {
            (&self.application, Self::page_offset(app.base, address))
        };
        buf.copy_from_slice(&mem[offset..offset + buf.len()]);
    }

    fn read_eeprom(&mut self, address: u32, buf: &mut [u8]) {
        let offset = Self::page_offset(self.geometry.eeprom.base, address);
        buf.copy_from_slice(&self.eeprom[offset..offset + buf.len()]);
    }

    fn read_user_signature(&mut self, offset: u32, buf: &mut [u8]) {
        let offset = offset as usize;
        buf.copy_from_slice(&self.user_signature[offset..offset + buf.len()]);
    }

    fn read_calibration(&mut self, offset: u8) -> u8 {
        self.issue();
        self.production_signature[offset as usize % PRODUCTION_SIGNATURE_LEN]
    }

    fn read_fuse(&mut self, index: u8) -> u8 {
        self.issue();
        self.fuses[index as usize % FUSE_COUNT]
    }

    fn application_crc(&mut self) -> u32 {
        self.issue();
        crc32(&self.application)
    }

    fn boot_crc(&mut self) -> u32 {
        self.issue();
        crc32(&self.boot)
    }
}

/// Events recorded by [`SimulatedSystem`]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum SystemEvent {
    InterruptsMasked,
    InterruptsRestored(bool),
    ProtectedWrite(ProtectedRegister, u8),
    ExtendedAddressingCleared,
    Jump(u32),
}

#[derive(Clone, Debug)]
pub struct SimulatedSystem {
    device_id: [u8; MCU_ID_LEN],
    interrupts: bool,
    events: Vec<SystemEvent>,
    resets: usize,
}

impl SimulatedSystem {
    /// ATxmega128A4U, revision J
    pub fn new() -> Self {
        Self::with_device_id([0x1E, 0x97, 0x46, 0x09])
    }

    pub fn with_device_id(device_id: [u8; MCU_ID_LEN]) -> Self {
        Self {
            device_id,
            interrupts: true,
            events: Vec::new(),
            resets: 0,
        }
    }

    pub fn events(&self) -> &[SystemEvent] {
        &self.events
    }

    /// Software resets requested through the protected reset register
    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }
}

impl Default for SimulatedSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemControl for SimulatedSystem {
    fn device_id(&mut self) -> [u8; MCU_ID_LEN] {
        self.device_id
    }

    fn mask_interrupts(&mut self) -> bool {
        let was = self.interrupts;
        self.interrupts = false;
        self.events.push(SystemEvent::InterruptsMasked);
        was
    }

    fn restore_interrupts(&mut self, enabled: bool) {
        self.interrupts = enabled;
        self.events.push(SystemEvent::InterruptsRestored(enabled));
    }

    unsafe fn unlock_and_write(&mut self, register: ProtectedRegister, value: u8) {
        // An interrupt inside the unlock window makes the real write miss
        assert!(!self.interrupts, "protected write with interrupts enabled");

        self.events.push(SystemEvent::ProtectedWrite(register, value));
        if register == ProtectedRegister::ResetControl && value & crate::device::system::SOFTWARE_RESET != 0 {
            self.resets += 1;
        }
    }

    fn clear_extended_addressing(&mut self) {
        self.events.push(SystemEvent::ExtendedAddressingCleared);
    }

    unsafe fn jump(&mut self, address: u32) -> ! {
        self.events.push(SystemEvent::Jump(address));
        panic!("simulated jump to application at {:#x}", address);
    }
}
