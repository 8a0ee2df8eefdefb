// src/target/network_info.rs

//! AI-model manifest parsing and JSON descriptor generation
//!
//! The manifest trailing an AI-model package is a list of `key=value`
//! lines describing how the sensor normalises its input tensor. Only the
//! keys below are used; anything else is ignored.
//!
//! | Key | Meaning |
//! |---|---|
//! | `networkNum` | must be 1 |
//! | `inputTensorFormat` | `RGB` (default), `BGR`, `Y` or `BayerRGB` |
//! | `inputTensorNorm_K00`..`K23` | 3x4 normalisation matrix |
//! | `inputNormShift_CH0`..`CH3` | per-channel shift (Bayer) |
//! | `inputNorm_CH0`..`CH3` | per-channel offset (Bayer) |
//! | `inputTensorNorm_YAdd` / `_YGain` | luma offset and gain |
//!
//! Integer values accept the same prefixes as C's `strtol` with base 0.

use crate::filesystem::write_file_durable;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Longest manifest line, excluding the line terminator
pub const MAX_LINE_LEN: usize = 255;

const MAX_CHANNELS: usize = 4;
const ISP_CHANNELS: usize = 3;

/// Fixed capture settings written into every descriptor
const INPUT_TENSOR_FILENAME: &str = "/home/pi/input_tensor.raw";
const NUM_TENSORS: u32 = 10;

/// Colour layout of the network's input tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputTensorFormat {
    #[default]
    Rgb,
    Bgr,
    Y,
    BayerRgb,
}

impl InputTensorFormat {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "RGB" => Ok(Self::Rgb),
            "BGR" => Ok(Self::Bgr),
            "Y" => Ok(Self::Y),
            "BayerRGB" => Ok(Self::BayerRgb),
            other => Err(Error::InvalidData(format!(
                "Unknown inputTensorFormat: {}",
                other
            ))),
        }
    }
}

/// Values read from a manifest
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkInfo {
    pub format: InputTensorFormat,
    pub norm_k: [[i64; MAX_CHANNELS]; ISP_CHANNELS],
    pub norm_shift: [i64; MAX_CHANNELS],
    pub norm: [i64; MAX_CHANNELS],
    pub y_add: i64,
    pub y_gain: i64,
}

/// Normalisation parameters as the descriptor states them
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorParams {
    pub norm_val: [i64; MAX_CHANNELS],
    pub norm_shift: [i64; MAX_CHANNELS],
    pub div_val: [i64; MAX_CHANNELS],
    pub div_shift: i64,
}

impl NetworkInfo {
    /// Parse manifest text
    pub fn parse(text: &str) -> Result<Self> {
        let mut info = Self::default();

        for (line_num, line) in text.lines().enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.len() > MAX_LINE_LEN {
                return Err(Error::InvalidData(format!(
                    "Manifest line {} is {} characters, limit is {}",
                    line_num + 1,
                    line.len(),
                    MAX_LINE_LEN
                )));
            }
            if line.trim().is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!("Invalid manifest line {}: {}", line_num + 1, line);
                continue;
            };
            info.apply(key.trim(), value.trim())?;
        }

        Ok(info)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        if !is_known_key(key) {
            return Ok(());
        }
        if value.is_empty() {
            return Err(Error::InvalidData(format!("Empty value for {}", key)));
        }
        if key == "inputTensorFormat" {
            self.format = InputTensorFormat::parse(value)?;
            return Ok(());
        }

        let parsed = parse_long(value).ok_or_else(|| {
            Error::InvalidData(format!("Invalid integer for {}: {}", key, value))
        })?;

        if key == "networkNum" {
            if parsed != 1 {
                return Err(Error::InvalidData(format!(
                    "networkNum = {}, only 1 is supported",
                    parsed
                )));
            }
        } else if let Some(ij) = key.strip_prefix("inputTensorNorm_K") {
            let digits = ij.as_bytes();
            let i = usize::from(digits[0] - b'0');
            let j = usize::from(digits[1] - b'0');
            self.norm_k[i][j] = parsed;
        } else if let Some(ch) = key.strip_prefix("inputNormShift_CH") {
            self.norm_shift[channel_index(ch)] = parsed;
        } else if let Some(ch) = key.strip_prefix("inputNorm_CH") {
            self.norm[channel_index(ch)] = parsed;
        } else if key == "inputTensorNorm_YAdd" {
            self.y_add = parsed;
        } else if key == "inputTensorNorm_YGain" {
            self.y_gain = parsed;
        }

        debug!("Manifest {} = {}", key, parsed);
        Ok(())
    }

    /// Derive the descriptor's normalisation parameters
    pub fn tensor_params(&self) -> Result<TensorParams> {
        let mut params = TensorParams {
            norm_val: [0; MAX_CHANNELS],
            norm_shift: [0; MAX_CHANNELS],
            div_val: [1; MAX_CHANNELS],
            div_shift: 0,
        };

        match self.format {
            InputTensorFormat::Rgb | InputTensorFormat::Bgr => {
                for i in 0..ISP_CHANNELS {
                    params.norm_val[i] = self.norm_k[i][3];
                    params.norm_shift[i] = 4;
                    params.div_val[i] = if self.format == InputTensorFormat::Rgb {
                        self.norm_k[i][i]
                    } else {
                        self.norm_k[i][2 - i]
                    };
                }
                params.div_shift = 6;
            }
            InputTensorFormat::Y => {
                params.norm_val[0] = self.y_add;
                params.div_val[0] = self.y_gain;
                params.div_shift = 5;
            }
            InputTensorFormat::BayerRgb => {
                params.norm_val = self.norm;
                params.norm_shift = self.norm_shift;
                params.div_val = [self.y_gain; MAX_CHANNELS];
                params.div_shift = 5;
            }
        }

        if let Some(ch) = params.div_val.iter().position(|v| *v == 0) {
            return Err(Error::InvalidData(format!(
                "div_val[{}] is 0 for {:?} input",
                ch, self.format
            )));
        }
        Ok(params)
    }
}

fn is_known_key(key: &str) -> bool {
    match key {
        "networkNum" | "inputTensorFormat" | "inputTensorNorm_YAdd" | "inputTensorNorm_YGain" => {
            true
        }
        _ => {
            if let Some(ij) = key.strip_prefix("inputTensorNorm_K") {
                let d = ij.as_bytes();
                d.len() == 2 && (b'0'..=b'2').contains(&d[0]) && (b'0'..=b'3').contains(&d[1])
            } else if let Some(ch) = key
                .strip_prefix("inputNormShift_CH")
                .or_else(|| key.strip_prefix("inputNorm_CH"))
            {
                matches!(ch, "0" | "1" | "2" | "3")
            } else {
                false
            }
        }
    }
}

fn channel_index(ch: &str) -> usize {
    usize::from(ch.as_bytes()[0] - b'0')
}

/// Parse an integer the way `strtol(value, &end, 0)` does, requiring the whole input
fn parse_long(value: &str) -> Option<i64> {
    let (negative, rest) = match value.as_bytes().first()? {
        b'-' => (true, &value[1..]),
        b'+' => (false, &value[1..]),
        _ => (false, value),
    };

    let (radix, digits) = if let Some(hex) = rest
        .strip_prefix("0x")
        .or_else(|| rest.strip_prefix("0X"))
    {
        (16, hex)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (8, &rest[1..])
    } else {
        (10, rest)
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = i64::from_str_radix(digits, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

#[derive(Serialize)]
struct SaveInputTensor<'a> {
    filename: &'a str,
    num_tensors: u32,
    #[serde(flatten)]
    params: &'a TensorParams,
}

#[derive(Serialize)]
struct NetworkEntry<'a> {
    network_file: &'a str,
    save_input_tensor: SaveInputTensor<'a>,
}

/// Render the JSON descriptor for a converted network
pub fn render_descriptor(
    network_name: &str,
    network_file: &Path,
    params: &TensorParams,
) -> Result<Vec<u8>> {
    let network_file = network_file.to_str().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "Network path is not UTF-8: {}",
            network_file.display()
        ))
    })?;

    let mut root = BTreeMap::new();
    root.insert(
        network_name,
        NetworkEntry {
            network_file,
            save_input_tensor: SaveInputTensor {
                filename: INPUT_TENSOR_FILENAME,
                num_tensors: NUM_TENSORS,
                params,
            },
        },
    );

    let mut out = Vec::new();
    let mut ser = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    root.serialize(&mut ser)
        .map_err(|e| Error::Internal(format!("Failed to render descriptor: {}", e)))?;
    out.push(b'\n');
    Ok(out)
}

/// Parse `manifest`, then durably write the descriptor to `json_path`
pub fn write_descriptor(
    manifest: &Path,
    json_path: &Path,
    network_name: &str,
    network_file: &Path,
) -> Result<()> {
    let text = std::fs::read(manifest).map_err(|e| {
        Error::Internal(format!(
            "Failed to read manifest {}: {}",
            manifest.display(),
            e
        ))
    })?;
    let info = NetworkInfo::parse(&String::from_utf8_lossy(&text))?;
    let params = info.tensor_params()?;
    let json = render_descriptor(network_name, network_file, &params)?;
    write_file_durable(json_path, &json)?;
    debug!("Wrote descriptor {}", json_path.display());
    Ok(())
}
