//! MCU flash sector layouts
//!
//! Used before touching the bus: an image that would land on a
//! write-protected sector (the bootloader itself) or outside flash is
//! refused for that board.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigError;
use crate::image::FirmwareImage;

/// One erasable flash sector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashSector {
    pub id: u32,
    pub base_address: u32,
    /// Size in bytes
    pub size: u32,
    /// Sector holds the bootloader and must never be written
    #[serde(default)]
    pub write_protect: bool,
}

impl FlashSector {
    pub const fn new(id: u32, base_address: u32, size: u32, write_protect: bool) -> Self {
        Self {
            id,
            base_address,
            size,
            write_protect,
        }
    }

    pub fn end_address(&self) -> u64 {
        u64::from(self.base_address) + u64::from(self.size)
    }

    fn contains(&self, address: u64) -> bool {
        u64::from(self.base_address) <= address && address < self.end_address()
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        u64::from(self.base_address) < end && start < self.end_address()
    }
}

/// A microcontroller's flash layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Microcontroller {
    pub name: String,
    pub sectors: Vec<FlashSector>,
}

/// Why an image does not fit a layout
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutViolation {
    #[error("Address {address:#010x} lies in write-protected sector {sector}")]
    Protected { sector: u32, address: u64 },

    #[error("Address {address:#010x} is outside flash")]
    Unmapped { address: u64 },
}

const KB: u32 = 1024;

impl Microcontroller {
    /// STM32F412xx: bootloader in sectors 0-4
    pub fn stm32f412() -> Self {
        let mut sectors = vec![
            FlashSector::new(0, 0x0800_0000, 16 * KB, true),
            FlashSector::new(1, 0x0800_4000, 16 * KB, true),
            FlashSector::new(2, 0x0800_8000, 16 * KB, true),
            FlashSector::new(3, 0x0800_C000, 16 * KB, true),
            FlashSector::new(4, 0x0801_0000, 64 * KB, true),
        ];
        sectors.extend((5..12).map(|id| {
            FlashSector::new(id, 0x0802_0000 + (id - 5) * 0x2_0000, 128 * KB, false)
        }));
        Self {
            name: "STM32F412xx".to_string(),
            sectors,
        }
    }

    /// STM32H733xx: bootloader in sector 0
    pub fn stm32h733() -> Self {
        let sectors = (0..8)
            .map(|id| FlashSector::new(id, 0x0800_0000 + id * 0x2_0000, 128 * KB, id == 0))
            .collect();
        Self {
            name: "STM32H733xx".to_string(),
            sectors,
        }
    }

    /// Layouts known without configuration
    pub fn builtin(name: &str) -> Option<Self> {
        [Self::stm32f412(), Self::stm32h733()]
            .into_iter()
            .find(|mcu| mcu.name == name)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let mut sorted: Vec<&FlashSector> = self.sectors.iter().collect();
        sorted.sort_by_key(|s| s.base_address);

        for sector in &sorted {
            if sector.size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "MCU '{}': sector {} has zero size",
                    self.name, sector.id
                )));
            }
            if sector.end_address() > 1 << 32 {
                return Err(ConfigError::Invalid(format!(
                    "MCU '{}': sector {} runs past the 32-bit address space",
                    self.name, sector.id
                )));
            }
        }
        for pair in sorted.windows(2) {
            if pair[0].end_address() > u64::from(pair[1].base_address) {
                return Err(ConfigError::Invalid(format!(
                    "MCU '{}': sectors {} and {} overlap",
                    self.name, pair[0].id, pair[1].id
                )));
            }
        }
        Ok(())
    }

    /// Every byte of the image must land in a writable sector
    pub fn check_image(&self, image: &FirmwareImage) -> Result<(), LayoutViolation> {
        for segment in image.segments() {
            let end = segment.end_address();
            let mut cursor = u64::from(segment.base_address);
            while cursor < end {
                let sector = self
                    .sectors
                    .iter()
                    .find(|s| s.contains(cursor))
                    .ok_or(LayoutViolation::Unmapped { address: cursor })?;
                if sector.write_protect {
                    return Err(LayoutViolation::Protected {
                        sector: sector.id,
                        address: cursor,
                    });
                }
                cursor = sector.end_address();
            }
        }
        Ok(())
    }

    /// Sectors the image touches, in address order
    pub fn sectors_for(&self, image: &FirmwareImage) -> Vec<&FlashSector> {
        let mut touched: Vec<&FlashSector> = self
            .sectors
            .iter()
            .filter(|sector| {
                image
                    .segments()
                    .iter()
                    .any(|seg| sector.overlaps(u64::from(seg.base_address), seg.end_address()))
            })
            .collect();
        touched.sort_by_key(|s| s.base_address);
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageFormat;

    fn image(pieces: Vec<(u32, Vec<u8>)>) -> FirmwareImage {
        FirmwareImage::from_pieces(ImageFormat::IntelHex, pieces, None).unwrap()
    }

    #[test]
    fn test_builtin_layouts() {
        let f4 = Microcontroller::builtin("STM32F412xx").unwrap();
        assert_eq!(f4.sectors.len(), 12);
        assert_eq!(f4.sectors[11].base_address, 0x080E_0000);
        assert_eq!(f4.sectors[11].end_address(), 0x0810_0000);
        f4.validate().unwrap();

        let h7 = Microcontroller::builtin("STM32H733xx").unwrap();
        assert_eq!(h7.sectors.len(), 8);
        assert!(h7.sectors[0].write_protect);
        assert!(!h7.sectors[1].write_protect);
        h7.validate().unwrap();

        assert!(Microcontroller::builtin("STM32G474").is_none());
    }

    #[test]
    fn test_application_region_accepted() {
        let f4 = Microcontroller::stm32f412();
        // Spans sectors 5 and 6
        let img = image(vec![(0x0803_FFFE, vec![1, 2, 3, 4])]);
        f4.check_image(&img).unwrap();

        let ids: Vec<u32> = f4.sectors_for(&img).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![5, 6]);
    }

    #[test]
    fn test_bootloader_region_refused() {
        let f4 = Microcontroller::stm32f412();
        let img = image(vec![(0x0801_FFFF, vec![0xAA, 0xBB])]);
        assert_eq!(
            f4.check_image(&img).unwrap_err(),
            LayoutViolation::Protected {
                sector: 4,
                address: 0x0801_FFFF
            }
        );
    }

    #[test]
    fn test_outside_flash_refused() {
        let h7 = Microcontroller::stm32h733();
        let img = image(vec![(0x080F_FFFF, vec![1, 2])]);
        assert_eq!(
            h7.check_image(&img).unwrap_err(),
            LayoutViolation::Unmapped {
                address: 0x0810_0000
            }
        );
    }

    #[test]
    fn test_overlapping_sectors_invalid() {
        let mcu = Microcontroller {
            name: "broken".to_string(),
            sectors: vec![
                FlashSector::new(0, 0x0800_0000, 0x1000, false),
                FlashSector::new(1, 0x0800_0800, 0x1000, false),
            ],
        };
        assert!(matches!(mcu.validate(), Err(ConfigError::Invalid(_))));
    }
}
