//! Wire protocol shared by the bootloader and the host utility.
//!
//! Every command is a single opcode byte, optionally followed by a
//! big-endian page index and a page of payload. There is no framing and no
//! per-frame checksum, both ends rely on the fixed sizes below.

use core::convert::TryFrom;

/// Command accepted, or command completed successfully
pub const STATUS_OK: u8 = b'A';

/// Command rejected (bad index) or the memory operation failed
pub const STATUS_FAIL: u8 = b'F';

/// Serial line rate, 8N1
pub const BAUD_RATE: usize = 19_200;

/// Version reported by [`Command::ReadBootloaderVersion`]
pub const BOOTLOADER_VERSION: u8 = 1;

/// Length of the MCU identifier reply (DEVID0..2, REVID)
pub const MCU_ID_LEN: usize = 4;

/// Length of the serial number reply, taken from the production signature row
pub const SERIAL_NUMBER_LEN: usize = 11;

/// Number of fuse bytes reported by [`Command::ReadFuses`]
pub const FUSE_COUNT: usize = 6;

/// Largest page of any writable region, and so the size of the page buffer
pub const MAX_PAGE_SIZE: usize = 256;

/// Length of the memory sizes reply body, six little-endian u32 fields
pub const MEMORY_SIZES_LEN: usize = 6 * 4;

/// Reply status
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Status {
    Ok,
    Fail,
}

impl Status {
    pub fn byte(self) -> u8 {
        match self {
            Status::Ok => STATUS_OK,
            Status::Fail => STATUS_FAIL,
        }
    }
}

impl<T, E> From<&Result<T, E>> for Status {
    fn from(r: &Result<T, E>) -> Self {
        match r {
            Ok(_) => Status::Ok,
            Err(_) => Status::Fail,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
#[repr(u8)]
pub enum Command {
    /// Presence check, answered with OK
    Nop = b'n',

    /// Erases the whole application section
    EraseApplication = b'!',

    /// Writes one application flash page: index, then a page of data
    WritePage = b'W',

    /// Reads one application flash page
    ReadPage = b'r',

    /// Fetches the application and boot section CRCs
    ReadFlashCrcs = b'c',

    /// Fetches the device and revision identifiers
    ReadMcuIds = b'i',

    /// Fetches the device-unique serial number
    ReadSerial = b's',

    ReadBootloaderVersion = b'v',

    /// Acknowledges, then resets the device
    ResetMcu = b'#',

    ReadFuses = b'f',

    /// Reads one EEPROM page
    ReadEeprom = b'e',

    /// Writes one EEPROM page with an atomic erase and write
    WriteEeprom = b'E',

    EraseUserSignatureRow = b'*',
    ReadUserSignatureRow = b'u',
    WriteUserSignatureRow = b'U',

    /// Fetches page and section sizes of every memory region
    ReadMemorySizes = b'm',
}

impl Command {
    pub const ALL: [Command; 16] = [
        Command::Nop,
        Command::EraseApplication,
        Command::WritePage,
        Command::ReadPage,
        Command::ReadFlashCrcs,
        Command::ReadMcuIds,
        Command::ReadSerial,
        Command::ReadBootloaderVersion,
        Command::ResetMcu,
        Command::ReadFuses,
        Command::ReadEeprom,
        Command::WriteEeprom,
        Command::EraseUserSignatureRow,
        Command::ReadUserSignatureRow,
        Command::WriteUserSignatureRow,
        Command::ReadMemorySizes,
    ];

    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Whether the opcode is followed by a big-endian page index
    pub fn takes_index(self) -> bool {
        matches!(
            self,
            Command::WritePage | Command::ReadPage | Command::ReadEeprom | Command::WriteEeprom
        )
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.opcode() == v)
            .ok_or(v)
    }
}

/// Builds the opcode + big-endian index header of an indexed command
pub fn indexed(command: Command, index: u16) -> [u8; 3] {
    let [hi, lo] = index.to_be_bytes();
    [command.opcode(), hi, lo]
}
