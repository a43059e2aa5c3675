//! Flasher stub definitions
//!
//! Stubs ship as the JSON packaging used by `esptool.py`: entry point,
//! section load addresses and base64-encoded section contents. The library
//! treats them as opaque data, loading the right blob for a chip is the
//! caller's job (see [crate::targets::Chip::stub_ref]).

use base64::engine::general_purpose;
use base64::Engine as _;
use serde::Deserialize;

use crate::error::Error;

/// A parsed flash stub object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    /// Text (base64 encoded)
    text: String,
    /// Start of text section address
    text_start: u32,
    /// Data (base64 encoded)
    data: String,
    /// Start of data section address
    data_start: u32,
}

impl FlashStub {
    pub fn from_json(stub: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(stub)?)
    }

    /// Stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Text section load address and bytes
    pub fn text(&self) -> Result<(u32, Vec<u8>), Error> {
        let decoded = general_purpose::STANDARD.decode(&self.text)?;
        Ok((self.text_start, decoded))
    }

    /// Data section load address and bytes
    pub fn data(&self) -> Result<(u32, Vec<u8>), Error> {
        let decoded = general_purpose::STANDARD.decode(&self.data)?;
        Ok((self.data_start, decoded))
    }
}
