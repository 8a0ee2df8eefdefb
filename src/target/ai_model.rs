// src/target/ai_model.rs

//! AI-model target
//!
//! An AI-model package is streamed into a raw artifact (`network.fpk`) and
//! a manifest (`network_info.txt`) inside the working directory. Completing
//! the write runs the converter to produce the sensor-native `.rpk`, moves
//! it to `network_<version>_<hex hash>.rpk`, and writes the JSON descriptor
//! `custom_<bundle id>.json` derived from the manifest.

use super::network_info::write_descriptor;
use super::{TargetHandler, TargetWriter};
use crate::component::{ComponentInfo, TargetComponent};
use crate::config::UpdateConfig;
use crate::convert::{ConversionJob, Converter};
use crate::filesystem::path::join_filename;
use crate::filesystem::{
    create_dir_all_durable, create_file_durable, flush_and_sync, move_file_atomic,
    remove_dir_all_durable, remove_file_durable,
};
use crate::package::{PackageParser, PackageSink};
use crate::registry::SlotLayout;
use crate::storage::StorageItem;
use crate::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Handler for the multi-slot AI-model target
#[derive(Debug, Clone)]
pub struct AiModelHandler {
    config: UpdateConfig,
    converter: Converter,
}

impl AiModelHandler {
    pub fn new(config: &UpdateConfig) -> Self {
        Self {
            config: config.clone(),
            converter: Converter::new(&config.converter_path, config.wait),
        }
    }

    /// Converted network location
    pub fn rpk_path(&self, info: &ComponentInfo) -> Result<PathBuf> {
        join_filename(
            &self.config.ai_model_dir,
            &format!("network_{}_{}.rpk", info.version, info.hash_hex()),
        )
    }

    /// Descriptor location, keyed by bundle identifier
    pub fn json_path(&self, info: &ComponentInfo) -> Result<PathBuf> {
        join_filename(
            &self.config.json_dir,
            &format!("custom_{}.json", info.bundle_id_str()),
        )
    }
}

impl TargetHandler for AiModelHandler {
    fn target(&self) -> TargetComponent {
        TargetComponent::AiModel
    }

    fn active_item(&self) -> StorageItem {
        StorageItem::FwMgrBinaryInfo1
    }

    fn pending_item(&self) -> Option<StorageItem> {
        Some(StorageItem::FwMgrBinaryInfo2)
    }

    fn layout(&self) -> SlotLayout {
        SlotLayout::Multi {
            capacity: self.config.max_ai_model_count,
        }
    }

    fn same_component(&self, a: &ComponentInfo, b: &ComponentInfo) -> bool {
        a.bundle_id() == b.bundle_id()
    }

    fn max_write_chunk_size(&self) -> u32 {
        // No limit on a single write
        u32::MAX
    }

    fn work_dir(&self) -> &Path {
        &self.config.tmp_dir
    }

    fn artifact_paths(&self, info: &ComponentInfo) -> Result<Vec<PathBuf>> {
        Ok(vec![self.rpk_path(info)?, self.json_path(info)?])
    }

    fn begin_write(&self, _info: &ComponentInfo) -> Result<Box<dyn TargetWriter>> {
        create_dir_all_durable(&self.config.tmp_dir)?;

        let raw_artifact = self.config.raw_artifact_path();
        let manifest = self.config.manifest_path();
        let files = StreamFiles {
            artifact: BufWriter::new(create_file_durable(&raw_artifact)?),
            manifest: BufWriter::new(create_file_durable(&manifest)?),
        };
        debug!("Opened {} for writing", raw_artifact.display());

        Ok(Box::new(AiModelWriter {
            handler: self.clone(),
            parser: PackageParser::new(),
            files: Some(files),
            placed: Vec::new(),
        }))
    }

    fn erase(&self, info: &ComponentInfo) -> Result<()> {
        let mut first_error = None;
        for path in self.artifact_paths(info)? {
            match remove_file_durable(&path) {
                Ok(()) => debug!("Erased {}", path.display()),
                Err(e) => {
                    warn!("Failed to erase {}: {}", path.display(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Erased AI model version {}", info.version);
                Ok(())
            }
        }
    }
}

/// Open destinations of the two parsed streams
struct StreamFiles {
    artifact: BufWriter<File>,
    manifest: BufWriter<File>,
}

impl PackageSink for StreamFiles {
    fn write_artifact(&mut self, bytes: &[u8]) -> Result<()> {
        self.artifact.write_all(bytes)?;
        Ok(())
    }

    fn write_manifest(&mut self, bytes: &[u8]) -> Result<()> {
        self.manifest.write_all(bytes)?;
        Ok(())
    }
}

impl StreamFiles {
    fn close(self) -> Result<()> {
        for writer in [self.artifact, self.manifest] {
            let mut file = writer.into_inner().map_err(|e| e.into_error())?;
            flush_and_sync(&mut file)?;
        }
        Ok(())
    }
}

struct AiModelWriter {
    handler: AiModelHandler,
    parser: PackageParser,
    /// `None` once the streams are closed
    files: Option<StreamFiles>,
    /// Final artifacts this writer may have created
    placed: Vec<PathBuf>,
}

impl AiModelWriter {
    fn close_files(&mut self) -> Result<()> {
        match self.files.take() {
            Some(files) => files.close(),
            None => Ok(()),
        }
    }

    fn remove_work_dir(&self) {
        let work_dir = &self.handler.config.tmp_dir;
        if let Err(e) = remove_dir_all_durable(work_dir) {
            warn!(
                "Failed to remove working directory {}: {}",
                work_dir.display(),
                e
            );
        }
    }
}

impl TargetWriter for AiModelWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let files = self
            .files
            .as_mut()
            .ok_or_else(|| Error::FailedPrecondition("AI model writer is closed".to_string()))?;
        self.parser.feed(data, files)
    }

    fn version(&self) -> Option<&str> {
        self.parser.version()
    }

    fn complete(&mut self, info: &ComponentInfo) -> Result<u64> {
        let summary = self.parser.finish()?;
        self.close_files()?;
        debug!(
            "Package complete: {} blocks, {} payload bytes, {} manifest bytes",
            summary.blocks, summary.payload_size, summary.manifest_size
        );

        let config = &self.handler.config;
        let rpk_path = self.handler.rpk_path(info)?;
        let json_path = self.handler.json_path(info)?;
        create_dir_all_durable(&config.ai_model_dir)?;
        create_dir_all_durable(&config.json_dir)?;

        let staged = config.staged_binary_path();
        self.handler.converter.run(&ConversionJob {
            raw_artifact: config.raw_artifact_path(),
            manifest: config.manifest_path(),
            output: staged.clone(),
            log: config.converter_log_path(),
        })?;

        self.placed.push(rpk_path.clone());
        move_file_atomic(&staged, &rpk_path)?;

        self.placed.push(json_path.clone());
        write_descriptor(
            &config.manifest_path(),
            &json_path,
            &config.network_name,
            &rpk_path,
        )?;

        self.remove_work_dir();
        info!(
            "Installed AI model {} as {}",
            summary.version,
            rpk_path.display()
        );
        Ok(summary.payload_size)
    }

    fn cancel(&mut self) -> Result<()> {
        if let Err(e) = self.close_files() {
            warn!("Failed to close AI model streams: {}", e);
        }
        for path in self.placed.drain(..) {
            match remove_file_durable(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        self.remove_work_dir();
        Ok(())
    }
}
