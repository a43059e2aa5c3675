//! Flash a binary image onto a target device
//!
//! The [Flasher] struct drives the staged lifecycle of a flashing session:
//! reset into the bootloader, sync, chip identification, optionally handing
//! control to the RAM-resident flasher stub, then the chunked write, read,
//! erase and verify operations.

use std::io::Write;
use std::time::{Duration, Instant};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;

use self::stubs::FlashStub;
use crate::command::{Command, CommandType};
use crate::connection::{Connection, ResponsePacket, ResponseView};
use crate::error::{ConnectionError, Error, RomError, RomErrorKind, StubError, StubErrorKind};
use crate::progress::{NoProgress, ProgressCallbacks};
use crate::targets::Chip;
use crate::transport::SerialTransport;

pub mod stubs;

/// Default baud rate of the ROM bootloader
pub const ESP_ROM_BAUD: u32 = 115_200;
/// Higher baud rate most adapters handle
pub const ESP_ROM_BAUD_HIGH: u32 = 460_800;
/// Highest baud rate worth negotiating over common USB bridges
pub const ESP_ROM_BAUD_HIGHEST: u32 = 921_600;

pub(crate) const CHECKSUM_INIT: u8 = 0xEF;

const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;
const EXPECTED_STUB_HANDSHAKE: &[u8] = b"OHAI";
const STUB_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);
const MEM_WRITE_SIZE: usize = 0x1800;
const READ_FLASH_BLOCK_SIZE: usize = 0x400;
const READ_FLASH_IN_FLIGHT_BLOCKS: u32 = 2;

/// Connect to and flash a target device
pub struct Flasher<T: SerialTransport> {
    /// Connection for the command exchange
    connection: Connection<T>,
    /// Identified chip, set by [Flasher::detect_chip]
    chip: Option<Chip>,
    /// Which response shape the other side speaks, flips on stub start
    view: ResponseView,
    /// Observer for long operations
    progress: Box<dyn ProgressCallbacks>,
}

impl<T: SerialTransport> Flasher<T> {
    pub fn new(transport: T) -> Self {
        Flasher {
            connection: Connection::new(transport),
            chip: None,
            view: ResponseView::Rom,
            progress: Box::new(NoProgress),
        }
    }

    /// Replace the progress sink.
    pub fn set_progress_callbacks(&mut self, progress: Box<dyn ProgressCallbacks>) {
        self.progress = progress;
    }

    /// The chip identified by [Flasher::detect_chip], if any.
    pub fn chip(&self) -> Option<Chip> {
        self.chip
    }

    /// Whether the flasher stub has taken over from the ROM bootloader.
    pub fn is_stub(&self) -> bool {
        self.view == ResponseView::Stub
    }

    /// The underlying connection.
    pub fn connection(&mut self) -> &mut Connection<T> {
        &mut self.connection
    }

    /// Hand the transport back to the caller.
    pub fn into_transport(self) -> T {
        self.connection.into_transport()
    }

    /// Reset the chip into the ROM download mode.
    pub fn enter_bootloader(&mut self) -> Result<(), Error> {
        self.connection.enter_bootloader()
    }

    /// Establish the command handshake with the ROM bootloader.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.connection.sync()
    }

    /// Reset the chip into its regular boot flow.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.connection.reset()
    }

    /// Identify the connected chip from its magic register.
    pub fn detect_chip(&mut self) -> Result<Chip, Error> {
        let response = self.exchange(
            Command::ReadReg {
                address: CHIP_DETECT_MAGIC_REG_ADDR,
            },
            CommandType::ReadReg.timeout(),
            true,
        )?;
        let chip = Chip::from_magic(response.value())?;
        self.chip = Some(chip);
        self.progress.on_info(&format!("Detected chip: {chip}"));
        Ok(chip)
    }

    /// Upload the flasher stub into RAM and hand control to it.
    ///
    /// Success is proven by the 4-byte `OHAI` marker the stub emits once it
    /// owns the serial line; only then does the response view switch over.
    pub fn load_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        let (text_addr, text) = stub.text()?;
        let (data_addr, data) = stub.data()?;
        let entry = stub.entry();

        self.progress.on_info(&format!(
            "Loading stub: text at 0x{text_addr:08X}, data at 0x{data_addr:08X}, entry at 0x{entry:08X}"
        ));
        self.mem_write(&text, MEM_WRITE_SIZE, text_addr)?;
        self.mem_write(&data, MEM_WRITE_SIZE, data_addr)?;

        debug!("Executing stub at 0x{entry:08X}");
        self.exchange(
            Command::MemEnd { entry },
            CommandType::MemEnd.timeout(),
            true,
        )?;
        self.connection
            .wait_for_frame(Some(EXPECTED_STUB_HANDSHAKE), STUB_HANDSHAKE_TIMEOUT)?;
        self.view = ResponseView::Stub;
        self.progress.on_info("Stub is running");
        Ok(())
    }

    /// Write `image` to flash at `offset`, uncompressed.
    pub fn flash_write(&mut self, image: &[u8], block_size: usize, offset: u32) -> Result<(), Error> {
        let blocks = image.len().div_ceil(block_size);
        self.progress.on_start();
        self.progress
            .on_info(&format!("Writing {} bytes at 0x{offset:08X}...", image.len()));

        let erase_start = Instant::now();
        self.exchange(
            Command::FlashBegin {
                size: image.len() as u32,
                blocks: blocks as u32,
                block_size: block_size as u32,
                offset,
                supports_encryption: self.rom_needs_encryption_field(),
            },
            CommandType::FlashBegin.timeout_for_size(image.len() as u32),
            true,
        )?;
        if !self.is_stub() {
            // The ROM erases the whole region inside FLASH_BEGIN
            self.progress.on_info(&format!(
                "Took {:.2} seconds to erase {} bytes at 0x{offset:08x}",
                erase_start.elapsed().as_secs_f64(),
                image.len(),
            ));
        }

        let write_start = Instant::now();
        for (sequence, chunk) in image.chunks(block_size).enumerate() {
            self.progress
                .on_progress(sequence as f32 * 100.0 / blocks as f32);
            self.exchange(
                Command::FlashData {
                    data: chunk,
                    pad_to: block_size,
                    sequence: sequence as u32,
                },
                CommandType::FlashData.timeout_for_size(block_size as u32),
                true,
            )?;
        }
        self.progress.on_progress(100.0);
        self.progress.on_end();
        self.progress.on_info(&throughput_message(
            "Wrote",
            image.len(),
            offset,
            write_start.elapsed(),
        ));
        Ok(())
    }

    /// Write `image` to flash at `offset`, deflate-compressed on the wire.
    pub fn flash_defl_write(
        &mut self,
        image: &[u8],
        block_size: usize,
        offset: u32,
    ) -> Result<(), Error> {
        self.progress.on_start();
        self.progress
            .on_info(&format!("Writing {} bytes at 0x{offset:08X}...", image.len()));

        let compressed = compress(image)?;
        let blocks = compressed.len().div_ceil(block_size);

        // The ROM loader wants the erase size rounded up to whole blocks
        // where the stub takes the true uncompressed size.
        let size = if self.is_stub() {
            image.len() as u32
        } else {
            (block_size * blocks) as u32
        };

        let erase_start = Instant::now();
        self.exchange(
            Command::FlashDeflBegin {
                size,
                blocks: blocks as u32,
                block_size: block_size as u32,
                offset,
                supports_encryption: self.rom_needs_encryption_field(),
            },
            CommandType::FlashDeflBegin.timeout_for_size(image.len() as u32),
            true,
        )?;
        if !self.is_stub() {
            self.progress.on_info(&format!(
                "Took {:.2} seconds to erase {} bytes at 0x{offset:08x}",
                erase_start.elapsed().as_secs_f64(),
                image.len(),
            ));
        }

        let write_start = Instant::now();
        for (sequence, chunk) in compressed.chunks(block_size).enumerate() {
            self.progress
                .on_progress(sequence as f32 * 100.0 / blocks as f32);
            self.exchange(
                Command::FlashDeflData {
                    data: chunk,
                    sequence: sequence as u32,
                },
                CommandType::FlashDeflData.timeout_for_size(block_size as u32),
                true,
            )?;
        }
        self.progress.on_progress(100.0);
        self.progress.on_end();
        self.progress.on_info(&format!(
            "Wrote {} bytes ({} compressed) at 0x{offset:08X} in {:.2} seconds",
            image.len(),
            compressed.len(),
            write_start.elapsed().as_secs_f64(),
        ));
        Ok(())
    }

    /// Check `image` against the device's own MD5 digest of the flash range
    /// it was written to.
    pub fn flash_md5_verify(&mut self, image: &[u8], offset: u32) -> Result<(), Error> {
        let response = self.exchange(
            Command::SpiFlashMd5 {
                address: offset,
                size: image.len() as u32,
            },
            CommandType::SpiFlashMd5.timeout_for_size(image.len() as u32),
            true,
        )?;

        // The stub replies with 16 raw digest bytes, the ROM with 32 hex
        // characters.
        let data = response.data();
        let device = match self.view {
            ResponseView::Stub if data.len() >= 16 => hex_digest(&data[..16]),
            ResponseView::Rom if data.len() >= 32 => match std::str::from_utf8(&data[..32]) {
                Ok(digest) => digest.to_ascii_lowercase(),
                Err(_) => return Err(Error::MalformedResponse(CommandType::SpiFlashMd5)),
            },
            _ => return Err(Error::MalformedResponse(CommandType::SpiFlashMd5)),
        };
        let expected = format!("{:x}", md5::compute(image));
        if expected != device {
            return Err(Error::Md5Mismatch { expected, device });
        }
        Ok(())
    }

    /// Read `dst.len()` bytes of flash starting at `offset` into `dst`.
    /// Stub only.
    ///
    /// The stub streams raw data frames, up to two in flight, and expects a
    /// cumulative byte-count ack after every frame. A trailing 16-byte frame
    /// carries the digest of the whole transfer.
    pub fn read_flash(&mut self, dst: &mut [u8], offset: u32) -> Result<(), Error> {
        self.ensure_stub(CommandType::ReadFlash)?;
        let length = dst.len();
        self.progress.on_info(&format!(
            "Reading flash region: offset=0x{offset:08X}, size={length}"
        ));

        let start = Instant::now();
        let block_timeout =
            CommandType::ReadFlash.timeout_for_size(READ_FLASH_BLOCK_SIZE as u32);
        self.exchange(
            Command::ReadFlash {
                offset,
                size: length as u32,
                block_size: READ_FLASH_BLOCK_SIZE as u32,
                in_flight_blocks: READ_FLASH_IN_FLIGHT_BLOCKS,
            },
            CommandType::ReadFlash.timeout(),
            true,
        )?;

        let mut pos = 0;
        while pos < length {
            let chunk = self.connection.wait_for_frame(None, block_timeout)?;
            if pos + chunk.len() > length {
                return Err(Error::Connection(ConnectionError::OverSizedPacket));
            }
            dst[pos..pos + chunk.len()].copy_from_slice(&chunk);
            pos += chunk.len();
            self.connection
                .write_raw_frame(&(pos as u32).to_le_bytes())?;
            self.progress.on_progress(pos as f32 * 100.0 / length as f32);
        }

        let digest_frame = self.connection.wait_for_frame(None, block_timeout)?;
        if digest_frame.len() != 16 {
            return Err(Error::MalformedResponse(CommandType::ReadFlash));
        }
        let device = hex_digest(&digest_frame);
        let expected = format!("{:x}", md5::compute(&dst[..length]));
        if expected != device {
            return Err(Error::Md5Mismatch { expected, device });
        }

        self.progress.on_progress(100.0);
        self.progress.on_end();
        self.progress.on_info(&throughput_message(
            "Read",
            length,
            offset,
            start.elapsed(),
        ));
        Ok(())
    }

    /// Erase the entire flash chip. Stub only.
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        self.ensure_stub(CommandType::EraseFlash)?;
        self.progress.on_info("Erasing entire flash...");
        self.exchange(Command::EraseFlash, CommandType::EraseFlash.timeout(), true)?;
        Ok(())
    }

    /// Erase `size` bytes of flash starting at `offset`. Stub only.
    pub fn erase_flash_region(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        self.ensure_stub(CommandType::EraseRegion)?;
        self.progress.on_info(&format!(
            "Erasing flash region: offset=0x{offset:08X}, size={size}"
        ));
        self.exchange(
            Command::EraseRegion { offset, size },
            CommandType::EraseRegion.timeout_for_size(size),
            true,
        )?;
        Ok(())
    }

    /// Attach the SPI flash with the chip's fused pin configuration.
    pub fn spi_attach(&mut self) -> Result<(), Error> {
        self.exchange(Command::SpiAttach, CommandType::SpiAttach.timeout(), true)?;
        Ok(())
    }

    /// Declare the flash geometry for a chip of `total_size` bytes.
    pub fn set_flash_size(&mut self, total_size: u32) -> Result<(), Error> {
        self.exchange(
            Command::SpiSetParams { total_size },
            CommandType::SpiSetParams.timeout(),
            true,
        )?;
        Ok(())
    }

    /// Negotiate a new baud rate. The caller must reconfigure its transport
    /// to `new_baud` immediately after this returns.
    pub fn change_baud(&mut self, new_baud: u32) -> Result<(), Error> {
        debug!("Changing baud rate to {new_baud}");
        self.exchange(
            Command::ChangeBaudrate { new_baud },
            CommandType::ChangeBaudrate.timeout(),
            true,
        )?;
        Ok(())
    }

    /// Leave the flashing mode and run the user application.
    ///
    /// The success check is skipped, the chip may reset before the reply
    /// makes it out.
    pub fn end_flash(&mut self) -> Result<(), Error> {
        self.exchange(
            Command::FlashEnd { flag: 0 },
            CommandType::FlashEnd.timeout(),
            false,
        )?;
        Ok(())
    }

    /// Terminate a compressed write and run the user application.
    pub fn end_defl_flash(&mut self) -> Result<(), Error> {
        self.exchange(
            Command::FlashDeflEnd { flag: 0 },
            CommandType::FlashDeflEnd.timeout(),
            true,
        )?;
        Ok(())
    }

    /// Leave the stub and run the user application without a reset.
    pub fn soft_reset(&mut self) -> Result<(), Error> {
        if self.chip != Some(Chip::Esp8266) {
            return Err(Error::SoftResetNotSupported);
        }
        self.exchange(
            Command::RunUserCode,
            CommandType::RunUserCode.timeout(),
            true,
        )?;
        Ok(())
    }

    /// Upload `image` into RAM at `offset`, chunked but never padded. The
    /// caller follows up with `MEM_END` once all segments are in place.
    fn mem_write(&mut self, image: &[u8], block_size: usize, offset: u32) -> Result<(), Error> {
        let blocks = image.len().div_ceil(block_size);
        self.exchange(
            Command::MemBegin {
                size: image.len() as u32,
                blocks: blocks as u32,
                block_size: block_size as u32,
                offset,
            },
            CommandType::MemBegin.timeout_for_size(image.len() as u32),
            true,
        )?;
        for (sequence, chunk) in image.chunks(block_size).enumerate() {
            self.exchange(
                Command::MemData {
                    data: chunk,
                    sequence: sequence as u32,
                },
                CommandType::MemData.timeout_for_size(block_size as u32),
                true,
            )?;
        }
        Ok(())
    }

    fn exchange(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
        verify: bool,
    ) -> Result<ResponsePacket, Error> {
        let ty = command.command_type();
        self.connection.write_command(&command)?;
        let response = self.connection.wait_for_response(ty, timeout)?;
        if verify {
            match self.view.success(response.data()) {
                Some(true) => {}
                Some(false) => {
                    let code = self.view.error_code(response.data());
                    return Err(match self.view {
                        ResponseView::Rom => RomError::new(ty, RomErrorKind::from(code)).into(),
                        ResponseView::Stub => StubError::new(ty, StubErrorKind::from(code)).into(),
                    });
                }
                None => return Err(Error::MalformedResponse(ty)),
            }
        }
        Ok(response)
    }

    fn ensure_stub(&self, command: CommandType) -> Result<(), Error> {
        if self.is_stub() {
            Ok(())
        } else {
            Err(Error::StubRequired(command))
        }
    }

    /// The `*Begin` packets grow a reserved word on encryption-capable
    /// chips, but only while the ROM loader is still in charge.
    fn rom_needs_encryption_field(&self) -> bool {
        !self.is_stub()
            && self
                .chip
                .is_some_and(|chip| chip.supports_flash_encryption())
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn throughput_message(verb: &str, len: usize, offset: u32, elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64().max(0.001);
    format!(
        "{verb} {len} bytes at 0x{offset:08X} in {seconds:.2} seconds (effective {:.2} kbit/s)",
        (len * 8) as f64 / seconds / 1024.0,
    )
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_seeded_xor() {
        assert_eq!(checksum(&[], CHECKSUM_INIT), 0xEF);
        assert_eq!(checksum(&[0xEF], CHECKSUM_INIT), 0x00);
        assert_eq!(
            checksum(&[0x01, 0x02, 0x03], CHECKSUM_INIT),
            0xEF ^ 0x01 ^ 0x02 ^ 0x03
        );
        // zero padding never alters the digest
        assert_eq!(
            checksum(&[0x55, 0x00, 0x00, 0x00], CHECKSUM_INIT),
            checksum(&[0x55], CHECKSUM_INIT)
        );
    }

    #[test]
    fn compression_round_trips_through_zlib() {
        use std::io::Read;

        let image: Vec<u8> = (0..4096u32).map(|v| (v % 251) as u8).collect();
        let compressed = compress(&image).unwrap();
        assert!(compressed.len() < image.len());

        let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, image);
    }

    #[test]
    fn hex_digest_formats_lowercase() {
        assert_eq!(hex_digest(&[0x0F, 0xA0, 0x3B]), "0fa03b");
        assert_eq!(
            format!("{:x}", md5::compute([0u8; 1024])),
            "0f343b0931126a20f133d67c2b018a3b"
        );
    }
}
