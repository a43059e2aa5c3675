//! Supported target devices
//!
//! Identification works through the chip-magic register: every die revision
//! reports one of a small set of 32-bit values, looked up here. The registry
//! also carries the per-family flash layout and which chips expect the
//! reserved flash-encryption word in their `*Begin` packets.

use strum::{Display, EnumIter};

use crate::error::Error;

const CHIP_DETECT_MAGIC_VALUES_ESP8266: &[u32] = &[0xfff0_c101];
const CHIP_DETECT_MAGIC_VALUES_ESP32: &[u32] = &[0x00f0_1d83];
const CHIP_DETECT_MAGIC_VALUES_ESP32S2: &[u32] = &[0x0000_07c6];
const CHIP_DETECT_MAGIC_VALUES_ESP32S3: &[u32] = &[0x0000_0009];
const CHIP_DETECT_MAGIC_VALUES_ESP32H2: &[u32] = &[0xca26_cc22, 0xd7b7_3e80];
const CHIP_DETECT_MAGIC_VALUES_ESP32C2: &[u32] = &[0x6f51_306f, 0x7c41_a06f];
const CHIP_DETECT_MAGIC_VALUES_ESP32C3: &[u32] = &[0x6921_506f, 0x1b31_506f];
const CHIP_DETECT_MAGIC_VALUES_ESP32C6: &[u32] = &[0x0da1_806f, 0x2ce0_806f];

/// Logical areas of on-chip flash with their conventional offsets and sizes.
///
/// Offsets vary per chip family, see [Chip::region_offset]; sizes do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[non_exhaustive]
pub enum FlashRegion {
    Bootloader,
    AppBootloader,
    PartitionTable,
    App0,
    App1,
    Nvs,
}

impl FlashRegion {
    pub fn default_offset(&self) -> u32 {
        match self {
            FlashRegion::Bootloader => 0x1000,
            FlashRegion::AppBootloader => 0xe000,
            FlashRegion::PartitionTable => 0x8000,
            FlashRegion::App0 => 0x1_0000,
            FlashRegion::App1 => 0x21_0000,
            FlashRegion::Nvs => 0x9000,
        }
    }

    pub fn default_size(&self) -> u32 {
        match self {
            FlashRegion::Bootloader => 0x8000,
            FlashRegion::AppBootloader => 0x2000,
            FlashRegion::PartitionTable => 0x1000,
            FlashRegion::App0 => 0x1f_0000,
            FlashRegion::App1 => 0x1f_0000,
            FlashRegion::Nvs => 0x6000,
        }
    }
}

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[non_exhaustive]
pub enum Chip {
    /// ESP8266
    #[strum(serialize = "ESP8266")]
    Esp8266,
    /// ESP32
    #[strum(serialize = "ESP32")]
    Esp32,
    /// ESP32-S2
    #[strum(serialize = "ESP32-S2")]
    Esp32s2,
    /// ESP32-S3
    #[strum(serialize = "ESP32-S3")]
    Esp32s3,
    /// ESP32-H2
    #[strum(serialize = "ESP32-H2")]
    Esp32h2,
    /// ESP32-C2, ESP8684
    #[strum(serialize = "ESP32-C2")]
    Esp32c2,
    /// ESP32-C3, ESP8685
    #[strum(serialize = "ESP32-C3")]
    Esp32c3,
    /// ESP32-C6
    #[strum(serialize = "ESP32-C6")]
    Esp32c6,
}

impl Chip {
    /// Identify a chip from the value of its chip-detect magic register.
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        use strum::IntoEnumIterator;

        Chip::iter()
            .find(|chip| chip.magic_values().contains(&magic))
            .ok_or(Error::UnknownChip(magic))
    }

    /// Look a chip up by its 16-bit identifier.
    pub fn from_id(id: u16) -> Result<Self, Error> {
        use strum::IntoEnumIterator;

        Chip::iter()
            .find(|chip| chip.id() == id)
            .ok_or(Error::UnknownChip(id as u32))
    }

    pub fn id(&self) -> u16 {
        match self {
            Chip::Esp8266 => 0x8266,
            Chip::Esp32 => 0x32,
            Chip::Esp32s2 => 0x3252,
            Chip::Esp32s3 => 0x3253,
            Chip::Esp32h2 => 0x3282,
            Chip::Esp32c2 => 0x32C2,
            Chip::Esp32c3 => 0x32C3,
            Chip::Esp32c6 => 0x32C6,
        }
    }

    pub fn magic_values(&self) -> &'static [u32] {
        match self {
            Chip::Esp8266 => CHIP_DETECT_MAGIC_VALUES_ESP8266,
            Chip::Esp32 => CHIP_DETECT_MAGIC_VALUES_ESP32,
            Chip::Esp32s2 => CHIP_DETECT_MAGIC_VALUES_ESP32S2,
            Chip::Esp32s3 => CHIP_DETECT_MAGIC_VALUES_ESP32S3,
            Chip::Esp32h2 => CHIP_DETECT_MAGIC_VALUES_ESP32H2,
            Chip::Esp32c2 => CHIP_DETECT_MAGIC_VALUES_ESP32C2,
            Chip::Esp32c3 => CHIP_DETECT_MAGIC_VALUES_ESP32C3,
            Chip::Esp32c6 => CHIP_DETECT_MAGIC_VALUES_ESP32C6,
        }
    }

    /// Resource name of the flasher stub for this chip, if one exists.
    pub fn stub_ref(&self) -> Option<&'static str> {
        match self {
            Chip::Esp8266 | Chip::Esp32c2 => None,
            Chip::Esp32 => Some("stubs/1/esp32.json"),
            Chip::Esp32s2 => Some("stubs/1/esp32s2.json"),
            Chip::Esp32s3 => Some("stubs/1/esp32s3.json"),
            Chip::Esp32h2 => Some("stubs/1/esp32h2.json"),
            Chip::Esp32c3 => Some("stubs/1/esp32c3.json"),
            Chip::Esp32c6 => Some("stubs/1/esp32c6.json"),
        }
    }

    /// Whether the ROM loader on this chip expects the reserved
    /// flash-encryption word in `FLASH_BEGIN` / `FLASH_DEFL_BEGIN`.
    pub fn supports_flash_encryption(&self) -> bool {
        !matches!(self, Chip::Esp8266 | Chip::Esp32)
    }

    /// Flash offset of `region` on this chip.
    pub fn region_offset(&self, region: FlashRegion) -> u32 {
        match (self, region) {
            // The ESP32 keeps its second-stage bootloader at 0x1000, every
            // later family moved it to the start of flash.
            (Chip::Esp8266, _) => region.default_offset(),
            (Chip::Esp32, FlashRegion::Bootloader) => 0x1000,
            (_, FlashRegion::Bootloader) => 0x0,
            (_, _) => region.default_offset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_chips_from_magic_values() {
        assert_eq!(Chip::from_magic(0x00f01d83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0xfff0c101).unwrap(), Chip::Esp8266);
        assert_eq!(Chip::from_magic(0x6921506f).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x1b31506f).unwrap(), Chip::Esp32c3);
        assert!(matches!(
            Chip::from_magic(0xdeadbeef),
            Err(Error::UnknownChip(0xdeadbeef))
        ));
    }

    /// Both registered ESP32-C2 magic values resolve, 2084675695 decimal
    /// included.
    #[test]
    fn esp32c2_keeps_duplicate_magic_values() {
        assert_eq!(Chip::from_magic(0x6f51306f).unwrap(), Chip::Esp32c2);
        assert_eq!(Chip::from_magic(2084675695).unwrap(), Chip::Esp32c2);
    }

    #[test]
    fn bootloader_offset_differs_per_family() {
        assert_eq!(Chip::Esp32.region_offset(FlashRegion::Bootloader), 0x1000);
        assert_eq!(Chip::Esp32c3.region_offset(FlashRegion::Bootloader), 0x0);
        assert_eq!(Chip::Esp8266.region_offset(FlashRegion::Bootloader), 0x1000);
        assert_eq!(
            Chip::Esp32s3.region_offset(FlashRegion::App0),
            FlashRegion::App0.default_offset()
        );
    }

    #[test]
    fn stubless_chips() {
        assert!(Chip::Esp8266.stub_ref().is_none());
        assert!(Chip::Esp32c2.stub_ref().is_none());
        assert!(Chip::Esp32c3.stub_ref().is_some());
    }

    #[test]
    fn chip_ids_round_trip() {
        use strum::IntoEnumIterator;

        for chip in Chip::iter() {
            assert_eq!(Chip::from_id(chip.id()).unwrap(), chip);
        }
    }
}
