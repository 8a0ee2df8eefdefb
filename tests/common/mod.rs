// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use sensor_fwupdate::package::{DownloadHeader, ImagePacketHeader};
use sensor_fwupdate::{
    ComponentInfo, ConversionWait, HeapBufferManager, MemoryParameterStore, ParameterStore,
    TargetComponent, UpdateConfig, UpdateEngine,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Manifest with an RGB normalisation matrix
pub const RGB_MANIFEST: &str = "networkNum=1\n\
    inputTensorFormat=RGB\n\
    inputTensorNorm_K00=64\n\
    inputTensorNorm_K03=-12\n\
    inputTensorNorm_K11=65\n\
    inputTensorNorm_K13=-13\n\
    inputTensorNorm_K22=66\n\
    inputTensorNorm_K23=-14\n";

/// Footer filler, distinct from payload bytes
pub const FOOTER_BYTE: u8 = 0xf0;

/// A package and the artifact it should produce
pub struct Package {
    pub bytes: Vec<u8>,
    pub artifact: Vec<u8>,
    pub manifest: Vec<u8>,
}

/// Build a package of `payload_sizes.len()` blocks
///
/// Block 1's payload starts with the image packet header carrying `version`.
pub fn build_package(version: &str, payload_sizes: &[u32], mac: bool, manifest: &str) -> Package {
    let total = payload_sizes.len() as u16;
    let mut bytes = Vec::new();
    let mut artifact = Vec::new();

    for (i, &size) in payload_sizes.iter().enumerate() {
        let header = DownloadHeader {
            data_size: size,
            current_num: i as u16 + 1,
            total_num: total,
            header_flag: 0,
            mac_extension: mac,
        };
        bytes.extend_from_slice(&header.encode());

        let mut payload: Vec<u8> = (0..size).map(|n| (n % 199) as u8).collect();
        if i == 0 {
            let image = ImagePacketHeader::encode(version).unwrap();
            payload[..image.len()].copy_from_slice(&image);
        }
        bytes.extend_from_slice(&payload);
        artifact.extend_from_slice(&payload);

        bytes.extend(std::iter::repeat_n(FOOTER_BYTE, header.footer_size()));
    }

    bytes.extend_from_slice(manifest.as_bytes());
    Package {
        bytes,
        artifact,
        manifest: manifest.as_bytes().to_vec(),
    }
}

/// Single-block AI-model package with the RGB manifest
pub fn model_package(version: &str, payload_size: u32) -> Package {
    build_package(version, &[payload_size], false, RGB_MANIFEST)
}

pub fn hash(byte: u8) -> [u8; 32] {
    [byte; 32]
}

/// Component description passed to Begin
pub fn component(byte: u8) -> ComponentInfo {
    ComponentInfo::new("", hash(byte))
}

/// Install a converter stand-in that copies the raw artifact
///
/// A manifest containing `fake_converter=sleep` makes it hang, and
/// `fake_converter=fail` makes it exit non-zero.
pub fn fake_converter(dir: &Path) -> PathBuf {
    let path = dir.join("fake-converter.sh");
    let script = r#"#!/bin/sh
case "$(/bin/cat "$2")" in
  *fake_converter=sleep*) exec /bin/sleep 30 ;;
  *fake_converter=fail*) echo "conversion failed" >&2; exit 2 ;;
esac
echo "converted $5"
/bin/cat "$5" > "$4"
"#;
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Short converter wait used by timeout tests
pub fn quick_wait() -> ConversionWait {
    ConversionWait {
        initial_interval_ms: 20,
        max_interval_ms: 100,
        attempts: 4,
    }
}

/// Engine over a temporary root with a fake converter
pub struct Harness {
    pub temp_dir: TempDir,
    pub config: UpdateConfig,
    pub store: Arc<MemoryParameterStore>,
    pub buffers: Arc<HeapBufferManager>,
    pub engine: UpdateEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_wait(ConversionWait::default())
    }

    pub fn with_wait(wait: ConversionWait) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = UpdateConfig::with_root(temp_dir.path().join("root"))
            .with_converter(fake_converter(temp_dir.path()))
            .with_wait(wait);
        let store = Arc::new(MemoryParameterStore::new());
        let buffers = Arc::new(HeapBufferManager::new());
        let engine = UpdateEngine::new(config.clone(), store.clone(), buffers.clone()).unwrap();
        Self {
            temp_dir,
            config,
            store,
            buffers,
            engine,
        }
    }

    /// Second engine sharing this harness's directories and store
    pub fn sibling_engine(&self) -> UpdateEngine {
        UpdateEngine::new(
            self.config.clone(),
            self.store.clone() as Arc<dyn ParameterStore>,
            self.buffers.clone(),
        )
        .unwrap()
    }

    pub fn rpk_path(&self, version: &str, hash_byte: u8) -> PathBuf {
        self.config
            .ai_model_dir
            .join(format!("network_{}_{}.rpk", version, hex::encode(hash(hash_byte))))
    }

    pub fn json_path(&self, bundle_id: &str) -> PathBuf {
        self.config.json_dir.join(format!("custom_{}.json", bundle_id))
    }

    /// Valid AI-model slots, skipping free ones
    pub fn installed(&self) -> Vec<ComponentInfo> {
        self.engine
            .list_components(TargetComponent::AiModel, "dev0")
            .unwrap()
            .into_iter()
            .filter(|c| c.valid)
            .collect()
    }
}

/// Write `data` through the buffer manager in `chunks` roughly equal calls
pub fn write_in_chunks(
    harness: &Harness,
    handle: sensor_fwupdate::UpdateHandle,
    data: &[u8],
    chunks: usize,
) -> sensor_fwupdate::Result<()> {
    let chunk_size = data.len().div_ceil(chunks).max(1);
    for chunk in data.chunks(chunk_size) {
        let buffer = harness.buffers.allocate(chunk.to_vec())?;
        let result = harness.engine.write(handle, buffer, chunk.len());
        harness.buffers.free(buffer)?;
        result?;
    }
    Ok(())
}
