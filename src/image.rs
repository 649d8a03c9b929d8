//! Firmware image as handed to the updater.
//!
//! Only raw binaries are read here. The image is padded with the erased
//! value up to a whole number of pages so every page can be sent as is.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::crc::Crc32;
use crate::geometry::ERASED;

#[derive(Clone, PartialEq, Debug)]
pub struct Image {
    data: Vec<u8>,
    len: usize,
    page_size: usize,
}

impl Image {
    /// Builds an image from raw bytes, padding the last page with 0xFF
    pub fn from_bytes(mut data: Vec<u8>, page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be non-zero");

        let len = data.len();
        let padded = (len + page_size - 1) / page_size * page_size;
        data.resize(padded, ERASED);

        Self { data, len, page_size }
    }

    /// Reads a raw binary file
    pub fn load<P: AsRef<Path>>(path: P, page_size: usize) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        Ok(Self::from_bytes(data, page_size))
    }

    /// Length of the image content before padding
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.data.len() / self.page_size
    }

    pub fn page(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.page_size)?;
        self.data.get(start..start + self.page_size)
    }

    pub fn pages(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.page_size)
    }

    /// CRC of the image as it will sit in a section of `section_size`
    /// bytes, the remainder being erased flash
    pub fn section_crc(&self, section_size: usize) -> Option<u32> {
        if self.data.len() > section_size {
            return None;
        }

        let mut crc = Crc32::new();
        crc.update(&self.data);
        crc.fill(ERASED, section_size - self.data.len());
        Some(crc.finish())
    }
}
