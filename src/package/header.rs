// src/package/header.rs

//! Fixed-size headers of the sensor package format
//!
//! Download header (32 bytes, little endian):
//!
//! ```text
//! 0..4    identifier, ASCII "4649"
//! 4..8    payload size
//! 8..10   current block number (1-based)
//! 10..12  total block count
//! 12      header flag (unused here)
//! 13      option flags, bit 0 = MAC authentication footer extension
//! 14..32  reserved
//! ```
//!
//! Image packet header (first 32 payload bytes of block 1): 16 reserved
//! bytes followed by a 16-byte decimal version with no terminator.

use crate::error::{Error, Result};

pub const DOWNLOAD_HEADER_SIZE: usize = 32;
pub const DOWNLOAD_FOOTER_SIZE: usize = 32;
pub const MAC_EXTENSION_SIZE: usize = 32;
pub const IMAGE_PACKET_HEADER_SIZE: usize = 32;
pub const VERSION_FIELD_SIZE: usize = 16;

/// Magic identifier opening every download header
pub const DOWNLOAD_MAGIC: [u8; 4] = *b"4649";

const MAC_EXTENSION_FLAG: u8 = 0x01;
const VERSION_FIELD_OFFSET: usize = IMAGE_PACKET_HEADER_SIZE - VERSION_FIELD_SIZE;

/// Header opening one download block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadHeader {
    pub data_size: u32,
    pub current_num: u16,
    pub total_num: u16,
    pub header_flag: u8,
    pub mac_extension: bool,
}

impl DownloadHeader {
    /// Parse and check the magic
    pub fn parse(bytes: &[u8; DOWNLOAD_HEADER_SIZE]) -> Result<Self> {
        if bytes[0..4] != DOWNLOAD_MAGIC {
            return Err(Error::InvalidData(format!(
                "Invalid download header identifier: {:?}",
                String::from_utf8_lossy(&bytes[0..4])
            )));
        }

        Ok(Self {
            data_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            current_num: u16::from_le_bytes([bytes[8], bytes[9]]),
            total_num: u16::from_le_bytes([bytes[10], bytes[11]]),
            header_flag: bytes[12],
            mac_extension: bytes[13] & MAC_EXTENSION_FLAG != 0,
        })
    }

    pub fn encode(&self) -> [u8; DOWNLOAD_HEADER_SIZE] {
        let mut bytes = [0u8; DOWNLOAD_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&DOWNLOAD_MAGIC);
        bytes[4..8].copy_from_slice(&self.data_size.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.current_num.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.total_num.to_le_bytes());
        bytes[12] = self.header_flag;
        if self.mac_extension {
            bytes[13] |= MAC_EXTENSION_FLAG;
        }
        bytes
    }

    /// Footer length following this block's payload
    pub fn footer_size(&self) -> usize {
        if self.mac_extension {
            DOWNLOAD_FOOTER_SIZE + MAC_EXTENSION_SIZE
        } else {
            DOWNLOAD_FOOTER_SIZE
        }
    }

    /// Whole block length: header, payload and footer
    pub fn block_size(&self) -> u64 {
        DOWNLOAD_HEADER_SIZE as u64 + u64::from(self.data_size) + self.footer_size() as u64
    }
}

/// Header nested at the start of the first block's payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePacketHeader {
    pub version: String,
}

impl ImagePacketHeader {
    /// Parse and check the version field is decimal digits only
    ///
    /// Trailing NUL bytes are padding; everything before them must be digits.
    pub fn parse(bytes: &[u8; IMAGE_PACKET_HEADER_SIZE]) -> Result<Self> {
        let field = &bytes[VERSION_FIELD_OFFSET..];
        let end = field
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        let version = &field[..end];

        if version.is_empty() {
            return Err(Error::InvalidData(
                "Empty version in image packet header".to_string(),
            ));
        }
        if !version.iter().all(u8::is_ascii_digit) {
            return Err(Error::InvalidData(format!(
                "Non-digit version in image packet header: {:?}",
                String::from_utf8_lossy(version)
            )));
        }

        // Digits only, so this is valid ASCII
        Ok(Self {
            version: String::from_utf8_lossy(version).into_owned(),
        })
    }

    /// Build a header carrying `version`, which must fit the 16-byte field
    pub fn encode(version: &str) -> Result<[u8; IMAGE_PACKET_HEADER_SIZE]> {
        if version.len() > VERSION_FIELD_SIZE {
            return Err(Error::InvalidArgument(format!(
                "Version {:?} exceeds {} bytes",
                version, VERSION_FIELD_SIZE
            )));
        }
        let mut bytes = [0u8; IMAGE_PACKET_HEADER_SIZE];
        bytes[VERSION_FIELD_OFFSET..VERSION_FIELD_OFFSET + version.len()]
            .copy_from_slice(version.as_bytes());
        Ok(bytes)
    }
}
