// src/component.rs

//! Component metadata records
//!
//! A [`ComponentInfo`] is the persisted description of one firmware or
//! AI-model component. Records are stored back to back in the parameter
//! store, so the binary layout below is fixed:
//!
//! ```text
//! offset  size  field
//!      0     1  valid
//!      1    33  parameter_name (NUL padded)
//!     34    45  version (NUL padded)
//!     79    32  hash
//!    111     1  (padding)
//!    112     4  total_size (i32, little endian)
//!    116    33  update_date (NUL padded)
//!    149     3  (padding)
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, Local, Offset, TimeZone};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub const PARAMETER_NAME_CAPACITY: usize = 33;
pub const VERSION_CAPACITY: usize = 45;
pub const HASH_SIZE: usize = 32;
pub const UPDATE_DATE_CAPACITY: usize = 33;

/// Size of one persisted record, including alignment padding
pub const RECORD_SIZE: usize = 152;

/// Longest accepted target device identifier
pub const MAX_TARGET_DEVICE_LEN: usize = 32;

const VALID_OFFSET: usize = 0;
const PARAMETER_NAME_OFFSET: usize = 1;
const VERSION_OFFSET: usize = PARAMETER_NAME_OFFSET + PARAMETER_NAME_CAPACITY;
const HASH_OFFSET: usize = VERSION_OFFSET + VERSION_CAPACITY;
const TOTAL_SIZE_OFFSET: usize = 112;
const UPDATE_DATE_OFFSET: usize = TOTAL_SIZE_OFFSET + 4;

/// Location of the bundle identifier inside an AI-model version string
pub const BUNDLE_ID_OFFSET: usize = 6;
pub const BUNDLE_ID_SIZE: usize = 6;

/// Updatable parts of the sensor module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum TargetComponent {
    Loader,
    Firmware,
    AiModel,
}

/// Persisted metadata of one component
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// False marks a free or erased slot
    pub valid: bool,
    /// Reserved, kept for layout stability
    pub parameter_name: String,
    pub version: String,
    pub hash: [u8; HASH_SIZE],
    pub total_size: i32,
    pub update_date: String,
}

impl ComponentInfo {
    /// Describe a component about to be written
    pub fn new(version: impl Into<String>, hash: [u8; HASH_SIZE]) -> Self {
        Self {
            version: version.into(),
            hash,
            ..Self::default()
        }
    }

    /// Check every text field fits its fixed-capacity slot
    pub fn validate(&self) -> Result<()> {
        check_text("parameter_name", &self.parameter_name, PARAMETER_NAME_CAPACITY)?;
        check_text("version", &self.version, VERSION_CAPACITY)?;
        check_text("update_date", &self.update_date, UPDATE_DATE_CAPACITY)?;
        Ok(())
    }

    /// Content identity: two records describe the same content if their hashes match
    pub fn same_content(&self, other: &ComponentInfo) -> bool {
        self.hash == other.hash
    }

    /// Bundle identifier embedded in the version, zero padded if the version is short
    pub fn bundle_id(&self) -> [u8; BUNDLE_ID_SIZE] {
        let mut id = [0u8; BUNDLE_ID_SIZE];
        let bytes = self.version.as_bytes();
        for (i, slot) in id.iter_mut().enumerate() {
            if let Some(b) = bytes.get(BUNDLE_ID_OFFSET + i) {
                *slot = *b;
            }
        }
        id
    }

    /// Bundle identifier as text, without padding
    pub fn bundle_id_str(&self) -> String {
        let id = self.bundle_id();
        let end = id.iter().position(|b| *b == 0).unwrap_or(id.len());
        String::from_utf8_lossy(&id[..end]).into_owned()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Mark the record complete with the artifact size and the current time
    pub fn stamp_completed(&mut self, total_size: i32) {
        self.valid = true;
        self.total_size = total_size;
        self.update_date = timestamp(&Local::now());
    }

    /// Serialize into the fixed on-storage layout
    pub fn encode(&self) -> Result<[u8; RECORD_SIZE]> {
        self.validate()?;
        let mut buf = [0u8; RECORD_SIZE];
        buf[VALID_OFFSET] = u8::from(self.valid);
        put_text(&mut buf, PARAMETER_NAME_OFFSET, &self.parameter_name);
        put_text(&mut buf, VERSION_OFFSET, &self.version);
        buf[HASH_OFFSET..HASH_OFFSET + HASH_SIZE].copy_from_slice(&self.hash);
        buf[TOTAL_SIZE_OFFSET..TOTAL_SIZE_OFFSET + 4]
            .copy_from_slice(&self.total_size.to_le_bytes());
        put_text(&mut buf, UPDATE_DATE_OFFSET, &self.update_date);
        Ok(buf)
    }

    /// Parse one record from the fixed on-storage layout
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_SIZE {
            return Err(Error::InvalidData(format!(
                "Component record is {} bytes, expected {}",
                bytes.len(),
                RECORD_SIZE
            )));
        }

        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes[HASH_OFFSET..HASH_OFFSET + HASH_SIZE]);
        let mut total_size = [0u8; 4];
        total_size.copy_from_slice(&bytes[TOTAL_SIZE_OFFSET..TOTAL_SIZE_OFFSET + 4]);

        Ok(Self {
            valid: bytes[VALID_OFFSET] != 0,
            parameter_name: get_text(bytes, PARAMETER_NAME_OFFSET, PARAMETER_NAME_CAPACITY),
            version: get_text(bytes, VERSION_OFFSET, VERSION_CAPACITY),
            hash,
            total_size: i32::from_le_bytes(total_size),
            update_date: get_text(bytes, UPDATE_DATE_OFFSET, UPDATE_DATE_CAPACITY),
        })
    }
}

fn check_text(field: &str, value: &str, capacity: usize) -> Result<()> {
    if value.len() >= capacity {
        return Err(Error::InvalidArgument(format!(
            "{} is {} bytes, limit is {}",
            field,
            value.len(),
            capacity - 1
        )));
    }
    if value.contains('\0') {
        return Err(Error::InvalidArgument(format!("{} contains NUL", field)));
    }
    Ok(())
}

fn put_text(buf: &mut [u8], offset: usize, value: &str) {
    buf[offset..offset + value.len()].copy_from_slice(value.as_bytes());
}

/// Decode a NUL-terminated field into text that encodes back into it
///
/// The last byte is reserved for the terminator even when a stored record
/// fills the field. Invalid UTF-8 is replaced, and the result is cut at a
/// char boundary if the replacements grew it past the field.
fn get_text(bytes: &[u8], offset: usize, capacity: usize) -> String {
    let field = &bytes[offset..offset + capacity - 1];
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    let mut text = String::from_utf8_lossy(&field[..end]).into_owned();
    if text.len() >= capacity {
        let mut cut = capacity - 1;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Validate a target device identifier
pub fn check_target_device(device: &str) -> Result<()> {
    if device.is_empty() {
        return Err(Error::InvalidArgument("target device is empty".to_string()));
    }
    if device.len() > MAX_TARGET_DEVICE_LEN {
        return Err(Error::InvalidArgument(format!(
            "target device is {} bytes, limit is {}",
            device.len(),
            MAX_TARGET_DEVICE_LEN
        )));
    }
    Ok(())
}

/// ISO-8601 timestamp with milliseconds and a `Z` or `+HH:MM` suffix
pub fn timestamp<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let offset_secs = time.offset().fix().local_minus_utc();
    let base = time.format("%Y-%m-%dT%H:%M:%S%.3f");
    if offset_secs == 0 {
        format!("{}Z", base)
    } else {
        let sign = if offset_secs >= 0 { '+' } else { '-' };
        let abs = offset_secs.unsigned_abs();
        format!("{}{}{:02}:{:02}", base, sign, abs / 3600, (abs % 3600) / 60)
    }
}
