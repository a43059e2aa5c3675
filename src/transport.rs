//! Serial byte transport
//!
//! The library does not open or configure serial ports itself. Callers hand
//! it anything that can move raw bytes and toggle the DTR/RTS control lines,
//! typically a thin wrapper around a `serialport`-style handle.

use std::io;

/// A blocking byte channel to the target device.
pub trait SerialTransport {
    /// Read up to `buf.len()` bytes from the device.
    ///
    /// Returns the number of bytes placed into `buf`. A return value of `0`
    /// means no data was available yet; the caller retries until its
    /// deadline expires.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf` to the device.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Drive the DTR and RTS control lines, which are wired to the chip's
    /// reset and boot-select pins on common dev boards.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()>;

    /// Suggested size for the internal read buffer.
    fn read_buffer_size(&self) -> usize {
        64
    }
}
