//! CRC-32 (IEEE 802.3, reflected) as computed over flash sections.

const POLY: u32 = 0xEDB8_8320;

#[derive(Clone, Debug)]
pub struct Crc32 {
    crc: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self { crc: 0xFFFF_FFFF }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.crc ^= byte as u32;
            for _ in 0..8 {
                if self.crc & 1 == 1 {
                    self.crc = (self.crc >> 1) ^ POLY;
                } else {
                    self.crc >>= 1;
                }
            }
        }
    }

    /// Feeds `count` copies of `byte`, used for erased padding
    pub fn fill(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.update(&[byte]);
        }
    }

    pub fn finish(&self) -> u32 {
        !self.crc
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut c = Crc32::new();
    c.update(data);
    c.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn fill_matches_update() {
        let mut a = Crc32::new();
        a.update(&[1, 2, 3]);
        a.fill(0xFF, 5);

        assert_eq!(a.finish(), crc32(&[1, 2, 3, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]));
    }
}
