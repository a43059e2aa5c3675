//! Low-level exchange with a target device
//!
//! [Connection] owns the serial transport and provides the mechanics the
//! flashing operations are built from: SLIP frame reassembly, response
//! demultiplexing by opcode against a monotonic deadline, the retried sync
//! handshake and the DTR/RTS reset sequencing.

use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::command::{Command, CommandType};
use crate::error::{ConnectionError, Error, TimedOutCommand};
use crate::slip;
use crate::trace::hex_dump;
use crate::transport::SerialTransport;

const MAX_RESPONSE_FRAME_SIZE: usize = 16 * 1024;
const MAX_SYNC_ATTEMPTS: usize = 20;
// Part of the contract with the reset circuitry on the board, do not shorten
const RESET_HOLD: Duration = Duration::from_millis(100);

/// Shape of the status trailer in response packets.
///
/// The ROM bootloader ends every response payload with four status bytes,
/// the flasher stub with two, and they disagree on which byte carries the
/// flag. The view is selected once, when the stub takes over, instead of
/// branching at every call site.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ResponseView {
    #[default]
    Rom,
    Stub,
}

impl ResponseView {
    /// Success flag of a response payload, or `None` when the payload is
    /// too short to carry a status trailer.
    pub fn success(&self, data: &[u8]) -> Option<bool> {
        match self {
            ResponseView::Rom if data.len() >= 4 => Some(data[data.len() - 4] == 0),
            ResponseView::Stub if data.len() >= 2 => Some(data[data.len() - 1] == 0),
            _ => None,
        }
    }

    /// Device error code of a failed response.
    pub fn error_code(&self, data: &[u8]) -> u8 {
        match self {
            ResponseView::Rom => data[data.len() - 3],
            ResponseView::Stub => data[data.len() - 1],
        }
    }
}

/// A response from a target device following a command
#[derive(Debug, Clone)]
pub struct ResponsePacket {
    opcode: u8,
    value: u32,
    data: Vec<u8>,
}

impl ResponsePacket {
    /// Parse a decoded frame. Frames too short for the response header, or
    /// shorter than their declared payload length, yield `None` and are
    /// discarded by the wait loop.
    fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < 8 {
            return None;
        }
        let size = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        let value = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        let data = frame.get(8..8 + size)?.to_vec();

        Some(ResponsePacket {
            opcode: frame[1],
            value,
            data,
        })
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A serial connection to a device running the bootloader protocol.
pub struct Connection<T: SerialTransport> {
    transport: T,
    buffer: Vec<u8>,
    buffer_pos: usize,
    buffer_limit: usize,
}

impl<T: SerialTransport> Connection<T> {
    pub fn new(transport: T) -> Self {
        let buffer = vec![0; transport.read_buffer_size()];
        Connection {
            transport,
            buffer,
            buffer_pos: 0,
            buffer_limit: 0,
        }
    }

    /// Reset the chip with the boot-select line held, leaving it in the
    /// ROM download mode.
    pub fn enter_bootloader(&mut self) -> Result<(), Error> {
        debug!("Resetting target into download mode");
        self.transport.set_control_lines(true, false)?;
        sleep(RESET_HOLD);
        self.transport.set_control_lines(false, true)?;
        sleep(RESET_HOLD);
        self.transport.set_control_lines(true, false)?;
        Ok(())
    }

    /// Reset the chip into its regular boot flow.
    pub fn reset(&mut self) -> Result<(), Error> {
        debug!("Resetting target");
        self.transport.set_control_lines(false, false)?;
        sleep(RESET_HOLD);
        self.transport.set_control_lines(false, true)?;
        sleep(RESET_HOLD);
        self.transport.set_control_lines(false, false)?;
        Ok(())
    }

    /// Establish the command handshake with the ROM bootloader.
    ///
    /// The ROM tends to answer one sync with a burst of identical replies,
    /// so a successful attempt keeps reading until the line goes quiet.
    /// Otherwise stale replies would be matched against later commands.
    pub fn sync(&mut self) -> Result<(), Error> {
        debug!("Syncing with the ROM bootloader");
        for _ in 0..MAX_SYNC_ATTEMPTS {
            self.write_command(&Command::Sync)?;
            match self.wait_for_response(CommandType::Sync, CommandType::Sync.timeout()) {
                Ok(response) if ResponseView::Rom.success(response.data()) == Some(true) => loop {
                    match self.wait_for_response(CommandType::Sync, CommandType::Sync.timeout()) {
                        Ok(_) => continue,
                        Err(Error::Connection(ConnectionError::Timeout(_))) => return Ok(()),
                        Err(err) => return Err(err),
                    }
                },
                Ok(_) => continue,
                Err(Error::Connection(ConnectionError::Timeout(_))) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(Error::Connection(ConnectionError::SyncFailed))
    }

    /// Encode `command` and send it as a single SLIP frame.
    pub fn write_command(&mut self, command: &Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {:?}", command.command_type());

        let mut packet = Vec::new();
        command.write(&mut packet)?;
        self.write_raw_frame(&packet)?;
        Ok(())
    }

    /// SLIP-frame `data` verbatim, without the command header. Used for the
    /// bare position acks of the read-flash stream.
    pub fn write_raw_frame(&mut self, data: &[u8]) -> Result<(), Error> {
        let framed = slip::encode(data);
        trace!(">>>> ({}): {}", framed.len(), hex_dump(&framed));
        self.transport.write(&framed)?;
        Ok(())
    }

    /// Wait until a response with the given opcode arrives, or until
    /// `timeout` expires. Frames carrying any other opcode, and frames too
    /// mangled to parse, are dropped.
    pub fn wait_for_response(
        &mut self,
        command: CommandType,
        timeout: Duration,
    ) -> Result<ResponsePacket, Error> {
        let deadline = Instant::now() + timeout;
        let mut frame = Vec::new();
        let mut in_frame = false;

        while Instant::now() < deadline {
            let Some(value) = self.read_byte()? else {
                continue;
            };
            if value == slip::END {
                if in_frame {
                    let decoded = slip::decode(&frame);
                    trace!("<<<< ({}): {}", decoded.len(), hex_dump(&decoded));
                    in_frame = false;
                    if let Some(response) = ResponsePacket::parse(&decoded) {
                        if response.opcode() == command as u8 {
                            return Ok(response);
                        }
                    }
                } else {
                    frame.clear();
                    in_frame = true;
                }
            } else if in_frame && frame.len() < MAX_RESPONSE_FRAME_SIZE {
                frame.push(value);
            }
        }

        Err(Error::Connection(ConnectionError::Timeout(command.into())))
    }

    /// Wait for the next frame of any kind, decoded but not interpreted.
    /// With `pattern` set, frames that do not match it byte for byte are
    /// dropped instead of returned.
    pub fn wait_for_frame(
        &mut self,
        pattern: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;
        let mut frame = Vec::new();
        let mut in_frame = false;

        while Instant::now() < deadline {
            let Some(value) = self.read_byte()? else {
                continue;
            };
            if value == slip::END {
                if in_frame {
                    let decoded = slip::decode(&frame);
                    trace!("<<<< ({}): {}", decoded.len(), hex_dump(&decoded));
                    in_frame = false;
                    match pattern {
                        Some(pattern) if pattern != decoded => {}
                        _ => return Ok(decoded),
                    }
                } else {
                    frame.clear();
                    in_frame = true;
                }
            } else if in_frame && frame.len() < MAX_RESPONSE_FRAME_SIZE {
                frame.push(value);
            }
        }

        Err(Error::Connection(ConnectionError::Timeout(
            TimedOutCommand::default(),
        )))
    }

    /// Drive the DTR/RTS lines directly.
    pub fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), Error> {
        self.transport.set_control_lines(dtr, rts)?;
        Ok(())
    }

    /// Hand the transport back to the caller.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn read_byte(&mut self) -> Result<Option<u8>, ConnectionError> {
        if self.buffer_pos >= self.buffer_limit {
            self.buffer_limit = self.transport.read(&mut self.buffer)?;
            self.buffer_pos = 0;
        }
        if self.buffer_pos >= self.buffer_limit {
            return Ok(None);
        }
        let value = self.buffer[self.buffer_pos];
        self.buffer_pos += 1;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rom_view_checks_leading_status_byte() {
        let view = ResponseView::Rom;
        assert_eq!(view.success(&[0x00, 0x00, 0x00, 0x00]), Some(true));
        assert_eq!(view.success(&[0xAA, 0x01, 0x06, 0x00, 0x00]), Some(false));
        assert_eq!(view.error_code(&[0xAA, 0x01, 0x06, 0x00, 0x00]), 0x06);
        assert_eq!(view.success(&[0x00, 0x00]), None);
    }

    #[test]
    fn stub_view_checks_trailing_status_byte() {
        let view = ResponseView::Stub;
        assert_eq!(view.success(&[0x00, 0x00]), Some(true));
        assert_eq!(view.success(&[0x01, 0x03]), Some(false));
        assert_eq!(view.error_code(&[0x01, 0x03]), 0x03);
        assert_eq!(view.success(&[0x00]), None);
    }

    #[test]
    fn parses_response_packets() {
        let frame = [
            0x01, 0x0A, 0x04, 0x00, 0x83, 0x1D, 0xF0, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let response = ResponsePacket::parse(&frame).unwrap();
        assert_eq!(response.opcode(), 0x0A);
        assert_eq!(response.value(), 0x00F0_1D83);
        assert_eq!(response.data(), &[0x00; 4]);
    }

    #[test]
    fn rejects_truncated_response_packets() {
        assert!(ResponsePacket::parse(&[0x01, 0x0A, 0x04]).is_none());
        // declared payload length exceeds the frame
        assert!(ResponsePacket::parse(&[0x01, 0x0A, 0x08, 0x00, 0, 0, 0, 0, 0, 0]).is_none());
    }
}
