//! Memory regions of the target part.
//!
//! Regions are hardware constants: a geometry is fixed when the bootloader
//! is built and reported to the host with [`crate::protocol::Command::ReadMemorySizes`].

use crate::protocol::MEMORY_SIZES_LEN;

/// Value every byte takes after an erase
pub const ERASED: u8 = 0xFF;

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Region {
    pub base: u32,
    pub size: u32,
    pub page_size: u32,
}

impl Region {
    /// Creates a region, rejecting sizes that are not a whole number of pages
    pub const fn new(base: u32, size: u32, page_size: u32) -> Self {
        assert!(page_size > 0, "page size must be non-zero");
        assert!(size % page_size == 0, "region size must be a multiple of the page size");
        Self { base, size, page_size }
    }

    pub const fn page_count(&self) -> u32 {
        self.size / self.page_size
    }

    pub fn page_len(&self) -> usize {
        self.page_size as usize
    }

    pub fn contains_page(&self, index: u16) -> bool {
        u32::from(index) < self.page_count()
    }

    /// Absolute address of the page at `index`, `None` when out of range
    pub fn page_address(&self, index: u16) -> Option<u32> {
        if self.contains_page(index) {
            Some(self.base + u32::from(index) * self.page_size)
        } else {
            None
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Geometry {
    pub application: Region,
    pub boot: Region,
    pub eeprom: Region,
    pub user_signature: Region,
}

impl Geometry {
    /// ATxmega128A4U: 128K application, 8K boot, 2K EEPROM
    pub const ATXMEGA128A4U: Geometry = Geometry {
        application: Region::new(0x0000_0000, 128 * 1024, 256),
        boot: Region::new(0x0002_0000, 8 * 1024, 256),
        eeprom: Region::new(0x0000_0000, 2 * 1024, 32),
        user_signature: Region::new(0x0000_0000, 256, 256),
    };

    /// Address the entry arbiter jumps to
    pub fn application_entry(&self) -> u32 {
        self.application.base
    }

    /// Encodes the memory sizes reply body
    pub fn to_wire(&self) -> [u8; MEMORY_SIZES_LEN] {
        let fields = [
            self.application.page_size,
            self.application.size,
            self.boot.page_size,
            self.boot.size,
            self.eeprom.page_size,
            self.eeprom.size,
        ];

        let mut b = [0u8; MEMORY_SIZES_LEN];
        for (chunk, v) in b.chunks_exact_mut(4).zip(fields.iter()) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        b
    }
}

/// Memory sizes as reported by the bootloader
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct MemorySizes {
    pub application_page: u32,
    pub application: u32,
    pub boot_page: u32,
    pub boot: u32,
    pub eeprom_page: u32,
    pub eeprom: u32,
}

impl MemorySizes {
    /// Decodes the memory sizes reply body, `None` for zero page sizes or
    /// sections that are not a whole number of pages
    pub fn from_wire(b: &[u8; MEMORY_SIZES_LEN]) -> Option<Self> {
        let mut f = [0u32; 6];
        for (v, chunk) in f.iter_mut().zip(b.chunks_exact(4)) {
            *v = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let s = MemorySizes {
            application_page: f[0],
            application: f[1],
            boot_page: f[2],
            boot: f[3],
            eeprom_page: f[4],
            eeprom: f[5],
        };

        let whole = |size: u32, page: u32| page != 0 && size % page == 0;
        if whole(s.application, s.application_page)
            && whole(s.boot, s.boot_page)
            && whole(s.eeprom, s.eeprom_page)
        {
            Some(s)
        } else {
            None
        }
    }

    pub fn application_pages(&self) -> u32 {
        self.application / self.application_page
    }

    pub fn eeprom_pages(&self) -> u32 {
        self.eeprom / self.eeprom_page
    }
}
