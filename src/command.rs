//! Bootloader commands and their wire encodings
//!
//! Every packet the host sends is `[0x00][opcode][len:u16][checksum:u32]`
//! followed by the payload, all little-endian, then SLIP-framed in one
//! piece. The checksum field is zero except for the three data-carrying
//! commands, which checksum their raw chunk.

use std::io::Write;
use std::mem::size_of;
use std::time::Duration;

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::flasher::{checksum, CHECKSUM_INIT};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const WRITE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const READ_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(16 * 30);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const COMMAND_SHORT_TIMEOUT: Duration = Duration::from_millis(100);

/// Operation codes understood by the ROM bootloader, plus the extensions
/// only the flasher stub implements (`0xD0..`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    // Reserved, the flashing paths never issue it
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    SpiFlashMd5 = 0x13,
    // Stub loader only
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
    ReadFlash = 0xD2,
    RunUserCode = 0xD3,
}

impl CommandType {
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::ReadReg
            | CommandType::SpiSetParams
            | CommandType::SpiAttach
            | CommandType::ChangeBaudrate
            | CommandType::MemEnd
            | CommandType::FlashEnd
            | CommandType::ReadFlash
            | CommandType::RunUserCode => COMMAND_SHORT_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Timeout for operations whose duration scales with the amount of
    /// flash touched, never less than the default.
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                DEFAULT_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }
        match self {
            CommandType::FlashBegin
            | CommandType::FlashDeflBegin
            | CommandType::MemBegin
            | CommandType::EraseRegion => calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size),
            CommandType::FlashData | CommandType::FlashDeflData | CommandType::MemData => {
                calc_timeout(WRITE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::ReadFlash => calc_timeout(READ_REGION_TIMEOUT_PER_MB, size),
            CommandType::SpiFlashMd5 => calc_timeout(MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// A command with its payload, ready to be encoded.
#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        sequence: u32,
    },
    FlashEnd {
        flag: u32,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemEnd {
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    Sync,
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        total_size: u32,
    },
    SpiAttach,
    ChangeBaudrate {
        new_baud: u32,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashDeflEnd {
        flag: u32,
    },
    SpiFlashMd5 {
        address: u32,
        size: u32,
    },
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
    ReadFlash {
        offset: u32,
        size: u32,
        block_size: u32,
        in_flight_blocks: u32,
    },
    RunUserCode,
}

impl<'a> Command<'a> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::MemData { .. } => CommandType::MemData,
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::SpiFlashMd5 { .. } => CommandType::SpiFlashMd5,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
            Command::ReadFlash { .. } => CommandType::ReadFlash,
            Command::RunUserCode => CommandType::RunUserCode,
        }
    }

    pub fn timeout_for_size(&self, size: u32) -> Duration {
        self.command_type().timeout_for_size(size)
    }

    /// Serialize the full command packet, header included.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                begin_command(
                    writer,
                    size,
                    blocks,
                    block_size,
                    offset,
                    supports_encryption,
                )?;
            }
            Command::FlashData {
                data,
                pad_to,
                sequence,
            } => {
                data_command(writer, data, pad_to, sequence)?;
            }
            Command::FlashEnd { flag } | Command::FlashDeflEnd { flag } => {
                write_basic(writer, &flag.to_le_bytes(), 0)?;
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset, false)?;
            }
            Command::MemEnd { entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams { no_entry: 0, entry };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::MemData { data, sequence } | Command::FlashDeflData { data, sequence } => {
                data_command(writer, data, 0, sequence)?;
            }
            Command::Sync => {
                write_basic(
                    writer,
                    &[
                        0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                    ],
                    0,
                )?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiSetParams { total_size } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct SpiParams {
                    id: u32,
                    total_size: u32,
                    block_size: u32,
                    sector_size: u32,
                    page_size: u32,
                    status_mask: u32,
                }
                let params = SpiParams {
                    id: 0,
                    total_size,
                    block_size: 64 * 1024,
                    sector_size: 4 * 1024,
                    page_size: 256,
                    status_mask: 0xFFFF,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::SpiAttach => {
                write_basic(writer, &[0; 8], 0)?;
            }
            Command::ChangeBaudrate { new_baud } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct BaudParams {
                    new_baud: u32,
                    reserved: u32,
                }
                let params = BaudParams {
                    new_baud,
                    reserved: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::SpiFlashMd5 { address, size } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct Md5Params {
                    address: u32,
                    size: u32,
                    reserved1: u32,
                    reserved2: u32,
                }
                let params = Md5Params {
                    address,
                    size,
                    reserved1: 0,
                    reserved2: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::EraseFlash | Command::RunUserCode => {
                write_basic(writer, &[], 0)?;
            }
            Command::EraseRegion { offset, size } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct EraseParams {
                    offset: u32,
                    size: u32,
                }
                let params = EraseParams { offset, size };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadFlash {
                offset,
                size,
                block_size,
                in_flight_blocks,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct ReadParams {
                    offset: u32,
                    size: u32,
                    block_size: u32,
                    in_flight_blocks: u32,
                }
                let params = ReadParams {
                    offset,
                    size,
                    block_size,
                    in_flight_blocks,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    mut writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
        encrypted: 0,
    };

    // Chips without the flash-encryption extension take a 16 byte payload,
    // the rest expect the reserved trailing word.
    let bytes = bytes_of(&params);
    let data = if supports_encryption {
        bytes
    } else {
        &bytes[..bytes.len() - 4]
    };
    write_basic(writer, data, 0)
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    // Zero padding leaves the XOR checksum untouched.
    let pad_length = pad_to.saturating_sub(block_data.len());
    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };
    let check = checksum(block_data, CHECKSUM_INIT);

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&(total_length as u16).to_le_bytes())?;
    writer.write_all(&(check as u32).to_le_bytes())?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[0])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(command: Command<'_>) -> Vec<u8> {
        let mut packet = Vec::new();
        command.write(&mut packet).unwrap();
        packet
    }

    #[test]
    fn sync_packet_layout() {
        let packet = encode(Command::Sync);
        assert_eq!(&packet[..8], &[0x00, 0x08, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&packet[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert_eq!(&packet[12..], &[0x55; 28]);
    }

    #[test]
    fn read_reg_packet_layout() {
        let packet = encode(Command::ReadReg {
            address: 0x4000_1000,
        });
        assert_eq!(
            packet,
            [0x00, 0x0A, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x40]
        );
    }

    #[test]
    fn flash_begin_packet_layout() {
        let packet = encode(Command::FlashBegin {
            size: 1024,
            blocks: 1,
            block_size: 0x400,
            offset: 0,
            supports_encryption: false,
        });
        assert_eq!(&packet[..8], &[0x00, 0x02, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&packet[8..12], 1024u32.to_le_bytes());
        assert_eq!(&packet[12..16], 1u32.to_le_bytes());
        assert_eq!(&packet[16..20], 0x400u32.to_le_bytes());
        assert_eq!(&packet[20..24], 0u32.to_le_bytes());
        assert_eq!(packet.len(), 24);
    }

    #[test]
    fn flash_begin_carries_reserved_word_for_encryption_capable_chips() {
        let packet = encode(Command::FlashBegin {
            size: 1024,
            blocks: 1,
            block_size: 0x400,
            offset: 0,
            supports_encryption: true,
        });
        assert_eq!(packet[2], 0x14);
        assert_eq!(packet.len(), 28);
        assert_eq!(&packet[24..], &[0x00; 4]);
    }

    #[test]
    fn flash_data_pads_and_checksums() {
        let packet = encode(Command::FlashData {
            data: &[0x01, 0x02, 0x03],
            pad_to: 8,
            sequence: 2,
        });
        // len = 16 header words + 8 data bytes
        assert_eq!(&packet[2..4], &24u16.to_le_bytes());
        // checksum = 0x01 ^ 0x02 ^ 0x03 ^ 0xEF
        assert_eq!(&packet[4..8], &0xEFu32.to_le_bytes());
        assert_eq!(&packet[8..12], &8u32.to_le_bytes());
        assert_eq!(&packet[12..16], &2u32.to_le_bytes());
        assert_eq!(&packet[24..27], &[0x01, 0x02, 0x03]);
        assert_eq!(&packet[27..], &[0x00; 5]);
    }

    #[test]
    fn mem_data_sends_exact_chunk() {
        let packet = encode(Command::MemData {
            data: &[0xAA, 0xBB],
            sequence: 0,
        });
        assert_eq!(&packet[2..4], &18u16.to_le_bytes());
        assert_eq!(&packet[4..8], &(0xAAu32 ^ 0xBB ^ 0xEF).to_le_bytes());
        assert_eq!(&packet[8..12], &2u32.to_le_bytes());
        assert_eq!(packet.len(), 26);
    }

    #[test]
    fn mem_end_packet_layout() {
        let packet = encode(Command::MemEnd { entry: 0x4038_0010 });
        assert_eq!(&packet[..8], &[0x00, 0x06, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&packet[8..12], &[0x00; 4]);
        assert_eq!(&packet[12..], 0x4038_0010u32.to_le_bytes());
    }

    #[test]
    fn spi_set_params_geometry() {
        let packet = encode(Command::SpiSetParams {
            total_size: 0x40_0000,
        });
        assert_eq!(&packet[2..4], &24u16.to_le_bytes());
        assert_eq!(&packet[8..12], &[0x00; 4]);
        assert_eq!(&packet[12..16], 0x40_0000u32.to_le_bytes());
        assert_eq!(&packet[16..20], 0x1_0000u32.to_le_bytes());
        assert_eq!(&packet[20..24], 0x1000u32.to_le_bytes());
        assert_eq!(&packet[24..28], 256u32.to_le_bytes());
        assert_eq!(&packet[28..32], 0xFFFFu32.to_le_bytes());
    }

    #[test]
    fn stub_only_packet_layouts() {
        assert_eq!(
            encode(Command::EraseFlash),
            [0x00, 0xD0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        let packet = encode(Command::EraseRegion {
            offset: 0x1000,
            size: 0x2000,
        });
        assert_eq!(&packet[..4], &[0x00, 0xD1, 0x08, 0x00]);
        assert_eq!(&packet[8..12], 0x1000u32.to_le_bytes());
        assert_eq!(&packet[12..], 0x2000u32.to_le_bytes());

        let packet = encode(Command::ReadFlash {
            offset: 0,
            size: 1024,
            block_size: 0x400,
            in_flight_blocks: 2,
        });
        assert_eq!(&packet[..4], &[0x00, 0xD2, 0x10, 0x00]);
        assert_eq!(&packet[20..24], 2u32.to_le_bytes());
    }

    #[test]
    fn scaled_timeouts_never_undercut_the_default() {
        assert_eq!(
            CommandType::FlashData.timeout_for_size(0x400),
            Duration::from_secs(3)
        );
        assert_eq!(
            CommandType::FlashBegin.timeout_for_size(4_000_000),
            Duration::from_secs(120)
        );
        assert_eq!(CommandType::EraseFlash.timeout(), Duration::from_secs(480));
    }
}
