//! A library for flashing Espressif devices over a serial byte channel
//!
//! [Flasher] speaks the serial bootloader protocol of the ESP8266 and the
//! ESP32 family: reset the chip into download mode, sync, identify the chip
//! from its magic register, optionally upload the RAM-resident flasher stub
//! for the extended command set, then write, read, erase and MD5-verify
//! flash.
//!
//! The library never opens serial ports itself. Implement [SerialTransport]
//! for whatever moves bytes to your device and hand it over:
//!
//! ```no_run
//! use esp_flasher::{Flasher, SerialTransport};
//!
//! fn flash<T: SerialTransport>(transport: T, image: &[u8]) -> Result<(), esp_flasher::Error> {
//!     let mut flasher = Flasher::new(transport);
//!     flasher.enter_bootloader()?;
//!     flasher.sync()?;
//!     flasher.detect_chip()?;
//!     flasher.spi_attach()?;
//!     flasher.flash_defl_write(image, 0x400, 0x1_0000)?;
//!     flasher.flash_md5_verify(image, 0x1_0000)?;
//!     flasher.reset()
//! }
//! ```
//!
//! The [trace] module records live sessions and replays them as
//! deterministic regression tests.

pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod progress;
pub mod slip;
pub mod targets;
pub mod trace;
pub mod transport;

pub use crate::error::Error;
pub use crate::flasher::stubs::FlashStub;
pub use crate::flasher::{Flasher, ESP_ROM_BAUD, ESP_ROM_BAUD_HIGH, ESP_ROM_BAUD_HIGHEST};
pub use crate::progress::ProgressCallbacks;
pub use crate::targets::{Chip, FlashRegion};
pub use crate::transport::SerialTransport;
