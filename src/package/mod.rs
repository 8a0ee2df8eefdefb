// src/package/mod.rs

//! Sensor package format
//!
//! A package is a sequence of download blocks followed by a short text
//! manifest. Parsing strips the block framing, extracts the component
//! version from the image packet header, and splits the stream into the
//! raw artifact and the manifest.

pub mod header;
mod parser;

pub use header::{DownloadHeader, ImagePacketHeader};
pub use parser::{PackageParser, PackageSink, PackageSummary};
