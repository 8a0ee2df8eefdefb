// src/package/parser.rs

//! Resumable package stream parser
//!
//! The package arrives in chunks of arbitrary size. [`PackageParser::feed`]
//! classifies every byte exactly once as download framing (header or
//! footer), payload, or trailing manifest text, and forwards payload and
//! manifest bytes to a [`PackageSink`]. Headers that straddle a chunk
//! boundary are buffered until their last byte arrives; the parser never
//! reads past the chunk it was given.
//!
//! ```text
//! +---------------------+
//! | download header 1   | 32
//! | image packet header | 32  (first payload bytes of block 1)
//! | payload             |
//! | footer              | 32, or 64 with MAC extension
//! +---------------------+
//! | download header 2   | 32
//! | payload             |
//! | footer              |
//! +---------------------+
//! | ...                 |
//! +---------------------+
//! | manifest text       | everything after the last footer
//! +---------------------+
//! ```

use super::header::{
    DOWNLOAD_HEADER_SIZE, DownloadHeader, IMAGE_PACKET_HEADER_SIZE, ImagePacketHeader,
};
use crate::error::{Error, Result};
use tracing::{debug, info};

/// Receiver of the parsed streams
pub trait PackageSink {
    /// Payload bytes, framing removed
    fn write_artifact(&mut self, bytes: &[u8]) -> Result<()>;
    /// Manifest text following the last block
    fn write_manifest(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Where the next input byte belongs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Header,
    Payload { remaining: u64 },
    Footer { remaining: usize },
    Manifest,
}

/// Cursor over the image packet header nested in block 1
#[derive(Debug)]
struct ImagePacketReader {
    buf: Vec<u8>,
    done: bool,
}

impl ImagePacketReader {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(IMAGE_PACKET_HEADER_SIZE),
            done: false,
        }
    }

    /// Copy header bytes out of `payload`; returns the version once complete
    fn feed(&mut self, payload: &[u8]) -> Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        let take = (IMAGE_PACKET_HEADER_SIZE - self.buf.len()).min(payload.len());
        self.buf.extend_from_slice(&payload[..take]);
        if self.buf.len() < IMAGE_PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; IMAGE_PACKET_HEADER_SIZE];
        raw.copy_from_slice(&self.buf);
        let header = ImagePacketHeader::parse(&raw)?;
        self.done = true;
        self.buf = Vec::new();
        Ok(Some(header.version))
    }
}

/// Totals of a fully parsed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSummary {
    pub version: String,
    pub blocks: u16,
    /// Payload bytes forwarded to the artifact stream
    pub payload_size: u64,
    /// Header and footer bytes
    pub framing_size: u64,
    pub manifest_size: u64,
}

/// Streaming parser state carried across `Write` calls
#[derive(Debug)]
pub struct PackageParser {
    cursor: Cursor,
    header_buf: Vec<u8>,
    headers_read: u16,
    total_blocks: Option<u16>,
    all_headers_read: bool,
    pending_footer: usize,
    framing_size: u64,
    payload_size: u64,
    manifest_size: u64,
    image_packet: ImagePacketReader,
    version: Option<String>,
}

impl Default for PackageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageParser {
    pub fn new() -> Self {
        Self {
            cursor: Cursor::Header,
            header_buf: Vec::with_capacity(DOWNLOAD_HEADER_SIZE),
            headers_read: 0,
            total_blocks: None,
            all_headers_read: false,
            pending_footer: 0,
            framing_size: 0,
            payload_size: 0,
            manifest_size: 0,
            image_packet: ImagePacketReader::new(),
            version: None,
        }
    }

    /// Consume the next contiguous extent of the package
    pub fn feed<S: PackageSink + ?Sized>(&mut self, mut data: &[u8], sink: &mut S) -> Result<()> {
        while !data.is_empty() {
            match self.cursor {
                Cursor::Header => {
                    let take = (DOWNLOAD_HEADER_SIZE - self.header_buf.len()).min(data.len());
                    self.header_buf.extend_from_slice(&data[..take]);
                    self.framing_size += take as u64;
                    data = &data[take..];

                    if self.header_buf.len() == DOWNLOAD_HEADER_SIZE {
                        self.complete_header()?;
                    }
                }
                Cursor::Payload { remaining } => {
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(data.len());
                    let bytes = &data[..take];

                    if self.headers_read == 1
                        && let Some(version) = self.image_packet.feed(bytes)?
                    {
                        info!("Package version: {}", version);
                        self.version = Some(version);
                    }

                    sink.write_artifact(bytes)?;
                    self.payload_size += take as u64;
                    data = &data[take..];

                    let remaining = remaining - take as u64;
                    self.cursor = if remaining == 0 {
                        Cursor::Footer {
                            remaining: self.pending_footer,
                        }
                    } else {
                        Cursor::Payload { remaining }
                    };
                }
                Cursor::Footer { remaining } => {
                    let take = remaining.min(data.len());
                    self.framing_size += take as u64;
                    data = &data[take..];

                    let remaining = remaining - take;
                    self.cursor = if remaining > 0 {
                        Cursor::Footer { remaining }
                    } else if self.all_headers_read {
                        debug!("All {} download blocks consumed", self.headers_read);
                        Cursor::Manifest
                    } else {
                        Cursor::Header
                    };
                }
                Cursor::Manifest => {
                    sink.write_manifest(data)?;
                    self.manifest_size += data.len() as u64;
                    data = &[];
                }
            }
        }
        Ok(())
    }

    fn complete_header(&mut self) -> Result<()> {
        let mut raw = [0u8; DOWNLOAD_HEADER_SIZE];
        raw.copy_from_slice(&self.header_buf);
        self.header_buf.clear();

        let header = DownloadHeader::parse(&raw)?;
        self.headers_read += 1;

        if header.current_num != self.headers_read {
            return Err(Error::InvalidData(format!(
                "Download block {} arrived where block {} was expected",
                header.current_num, self.headers_read
            )));
        }
        if header.total_num == 0 {
            return Err(Error::InvalidData(
                "Download header declares zero blocks".to_string(),
            ));
        }
        match self.total_blocks {
            None => self.total_blocks = Some(header.total_num),
            Some(total) if total != header.total_num => {
                return Err(Error::InvalidData(format!(
                    "Block count changed from {} to {} at block {}",
                    total, header.total_num, header.current_num
                )));
            }
            Some(_) => {}
        }
        if header.current_num == 1 && (header.data_size as usize) < IMAGE_PACKET_HEADER_SIZE {
            return Err(Error::InvalidData(format!(
                "First block payload of {} bytes cannot hold the image packet header",
                header.data_size
            )));
        }

        debug!(
            "Download header {}/{}: {} payload bytes, MAC extension {}",
            header.current_num, header.total_num, header.data_size, header.mac_extension
        );

        self.all_headers_read = header.current_num == header.total_num;
        self.pending_footer = header.footer_size();
        self.cursor = if header.data_size == 0 {
            Cursor::Footer {
                remaining: self.pending_footer,
            }
        } else {
            Cursor::Payload {
                remaining: u64::from(header.data_size),
            }
        };
        Ok(())
    }

    /// Version extracted from the image packet header, once seen
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn headers_read(&self) -> u16 {
        self.headers_read
    }

    pub fn is_all_headers_read(&self) -> bool {
        self.all_headers_read
    }

    pub fn framing_size(&self) -> u64 {
        self.framing_size
    }

    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// Check the stream ended on a block boundary with every declared block present
    pub fn finish(&self) -> Result<PackageSummary> {
        if self.cursor != Cursor::Manifest {
            return Err(Error::InvalidData(format!(
                "Package truncated: {} of {} blocks read, cursor at {:?}",
                self.headers_read,
                self.total_blocks.unwrap_or(0),
                self.cursor
            )));
        }
        let version = self.version.clone().ok_or_else(|| {
            Error::InvalidData("Package carries no image packet header".to_string())
        })?;

        Ok(PackageSummary {
            version,
            blocks: self.headers_read,
            payload_size: self.payload_size,
            framing_size: self.framing_size,
            manifest_size: self.manifest_size,
        })
    }
}
