//! Library errors

use std::fmt::{Display, Formatter};
use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while communicating with the device")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error("The ROM bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("The flasher stub returned an error")]
    #[diagnostic(transparent)]
    StubError(#[from] StubError),

    #[error("Chip not recognized, magic value 0x{0:08x} is unknown")]
    #[diagnostic(
        code(esp_flasher::unknown_chip),
        help("If your chip is supported, try hard-resetting the device and try again")
    )]
    UnknownChip(u32),

    #[error("MD5 digest mismatch: flash reports {device}, image is {expected}")]
    #[diagnostic(
        code(esp_flasher::md5_mismatch),
        help("The written data did not survive the round trip, erase the region and flash again")
    )]
    Md5Mismatch { expected: String, device: String },

    #[error("Received a malformed response to the {0} command")]
    #[diagnostic(code(esp_flasher::malformed_response))]
    MalformedResponse(CommandType),

    #[error("{0} is a stub loader only command")]
    #[diagnostic(
        code(esp_flasher::stub_required),
        help("Upload and start the flasher stub before issuing this command")
    )]
    StubRequired(CommandType),

    #[error("Soft resetting is only supported on the ESP8266")]
    #[diagnostic(code(esp_flasher::soft_reset_unsupported))]
    SoftResetNotSupported,

    #[error("Supplied stub definition is not valid")]
    #[diagnostic(code(esp_flasher::invalid_stub))]
    StubParse(#[from] serde_json::Error),

    #[error("Supplied stub definition holds invalid base64 data")]
    #[diagnostic(code(esp_flasher::invalid_stub))]
    StubDecode(#[from] base64::DecodeError),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial transport: {0}")]
    #[diagnostic(code(esp_flasher::transport_error))]
    Transport(#[source] io::Error),

    #[error("Timeout while waiting for a {0}response")]
    #[diagnostic(
        code(esp_flasher::timeout),
        help("Try resetting the device into the bootloader and syncing again")
    )]
    Timeout(TimedOutCommand),

    #[error("Failed to sync with the chip")]
    #[diagnostic(
        code(esp_flasher::sync_failed),
        help("Ensure the device is in download mode and no other process holds the port")
    )]
    SyncFailed,

    #[error("Received data frame does not fit the destination buffer")]
    #[diagnostic(code(esp_flasher::oversized_packet))]
    OverSizedPacket,
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Transport(err)
    }
}

/// The command a timeout occurred for, if any. Pattern waits (the stub
/// startup marker, raw read-flash frames) time out without one.
#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(command: CommandType) -> Self {
        TimedOutCommand {
            command: Some(command),
        }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

/// Error codes reported by the ROM bootloader.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Received message is invalid")]
    #[diagnostic(code(esp_flasher::rom::invalid_message))]
    InvalidMessage = 0x05,
    #[error("Failed to act on received message")]
    #[diagnostic(code(esp_flasher::rom::failed))]
    FailedToAct = 0x06,
    #[error("Received message has invalid CRC")]
    #[diagnostic(code(esp_flasher::rom::crc))]
    InvalidCrc = 0x07,
    #[error("Flash write error, verification mismatch after writing")]
    #[diagnostic(code(esp_flasher::rom::flash_write))]
    FlashWriteError = 0x08,
    #[error("Flash read error, SPI read failed")]
    #[diagnostic(code(esp_flasher::rom::flash_read))]
    FlashReadError = 0x09,
    #[error("Flash read length error, SPI read request length is too long")]
    #[diagnostic(code(esp_flasher::rom::flash_read_length))]
    FlashReadLengthError = 0x0A,
    #[error("Deflate error")]
    #[diagnostic(code(esp_flasher::rom::deflate))]
    DeflateError = 0x0B,
    #[error("Unknown ROM error")]
    #[diagnostic(code(esp_flasher::rom::other))]
    Other = 0xFF,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidMessage,
            0x06 => RomErrorKind::FailedToAct,
            0x07 => RomErrorKind::InvalidCrc,
            0x08 => RomErrorKind::FlashWriteError,
            0x09 => RomErrorKind::FlashReadError,
            0x0A => RomErrorKind::FlashReadLengthError,
            0x0B => RomErrorKind::DeflateError,
            _ => RomErrorKind::Other,
        }
    }
}

#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[error("Error while running {command} command")]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }
}

/// Error codes reported by the flasher stub, disjoint from the ROM table.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[repr(u8)]
pub enum StubErrorKind {
    #[error("Invalid size")]
    #[diagnostic(code(esp_flasher::stub::size))]
    InvalidSize = 0x01,
    #[error("Invalid argument")]
    #[diagnostic(code(esp_flasher::stub::argument))]
    InvalidArgument = 0x02,
    #[error("Flash read error")]
    #[diagnostic(code(esp_flasher::stub::flash_read))]
    FlashReadError = 0x03,
    #[error("Flash write error")]
    #[diagnostic(code(esp_flasher::stub::flash_write))]
    FlashWriteError = 0x04,
    #[error("Flash erase error")]
    #[diagnostic(code(esp_flasher::stub::flash_erase))]
    FlashEraseError = 0x05,
    #[error("Invalid flash arguments")]
    #[diagnostic(code(esp_flasher::stub::flash_args))]
    FlashArgsError = 0x06,
    #[error("Flash timeout")]
    #[diagnostic(code(esp_flasher::stub::flash_timeout))]
    FlashTimeout = 0x07,
    #[error("Unknown stub error")]
    #[diagnostic(code(esp_flasher::stub::other))]
    Other = 0xFF,
}

impl From<u8> for StubErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x01 => StubErrorKind::InvalidSize,
            0x02 => StubErrorKind::InvalidArgument,
            0x03 => StubErrorKind::FlashReadError,
            0x04 => StubErrorKind::FlashWriteError,
            0x05 => StubErrorKind::FlashEraseError,
            0x06 => StubErrorKind::FlashArgsError,
            0x07 => StubErrorKind::FlashTimeout,
            _ => StubErrorKind::Other,
        }
    }
}

#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[error("Error while running {command} command")]
pub struct StubError {
    command: CommandType,
    #[source]
    kind: StubErrorKind,
}

impl StubError {
    pub fn new(command: CommandType, kind: StubErrorKind) -> StubError {
        StubError { command, kind }
    }
}
