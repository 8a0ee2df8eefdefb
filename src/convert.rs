// src/convert.rs

//! Format converter supervision
//!
//! The converter is a separate, pre-built executable that turns the raw
//! artifact and its manifest into the sensor's native binary format. This
//! module runs it with:
//!
//! - A fixed argument list: `-r <manifest> -o <output> <raw artifact>`
//! - An empty environment and stdin nullified
//! - stdout and stderr redirected to a log file
//! - Bounded waiting with exponential backoff, then SIGKILL on timeout
//!
//! The log is replayed through `tracing` whatever the outcome. Failures are
//! reported, never retried here.

use crate::config::ConversionWait;
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// How long to wait for a killed converter to be reaped
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Files handed to one conversion run
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub raw_artifact: PathBuf,
    pub manifest: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
}

/// Runs the converter executable under a bounded wait
#[derive(Debug, Clone)]
pub struct Converter {
    executable: PathBuf,
    wait: ConversionWait,
}

impl Converter {
    pub fn new(executable: impl Into<PathBuf>, wait: ConversionWait) -> Self {
        Self {
            executable: executable.into(),
            wait,
        }
    }

    /// Run one conversion to completion, timeout or failure
    pub fn run(&self, job: &ConversionJob) -> Result<()> {
        info!(
            "Converting {} to {}",
            job.raw_artifact.display(),
            job.output.display()
        );

        let outcome = self.spawn(job).and_then(|mut child| self.supervise(&mut child));
        replay_log(&job.log);
        outcome
    }

    fn spawn(&self, job: &ConversionJob) -> Result<Child> {
        let log = File::create(&job.log).map_err(|e| {
            Error::Internal(format!(
                "Failed to create converter log {}: {}",
                job.log.display(),
                e
            ))
        })?;
        let log_err = log.try_clone()?;

        debug!(
            "Executing {} -r {} -o {} {}",
            self.executable.display(),
            job.manifest.display(),
            job.output.display(),
            job.raw_artifact.display()
        );

        Command::new(&self.executable)
            .arg("-r")
            .arg(&job.manifest)
            .arg("-o")
            .arg(&job.output)
            .arg(&job.raw_artifact)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| {
                Error::Internal(format!(
                    "Failed to spawn converter {}: {}",
                    self.executable.display(),
                    e
                ))
            })
    }

    fn supervise(&self, child: &mut Child) -> Result<()> {
        for attempt in 0..self.wait.attempts {
            let interval = self.wait.interval(attempt);
            if let Some(status) = child.wait_timeout(interval)? {
                return check_status(status);
            }
            debug!(
                "Converter (pid {}) still running after attempt {}",
                child.id(),
                attempt + 1
            );
        }

        warn!(
            "Converter (pid {}) did not finish within {:?}, killing it",
            child.id(),
            self.wait.total()
        );
        if let Err(e) = child.kill() {
            warn!("Failed to kill converter: {}", e);
        }
        match child.wait_timeout(KILL_GRACE) {
            Ok(Some(_)) => {}
            Ok(None) => warn!("Killed converter was not reaped within {:?}", KILL_GRACE),
            Err(e) => warn!("Failed to reap killed converter: {}", e),
        }

        Err(Error::DeadlineExceeded(format!(
            "Converter timed out after {:?}",
            self.wait.total()
        )))
    }
}

fn check_status(status: ExitStatus) -> Result<()> {
    if status.success() {
        info!("Converter completed successfully");
        return Ok(());
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => Err(Error::Internal(format!(
            "Converter failed with exit code {}",
            code
        ))),
        (None, Some(signal)) => Err(Error::Internal(format!(
            "Converter terminated by signal {}",
            signal
        ))),
        (None, None) => Err(Error::Internal(format!(
            "Converter ended abnormally: {}",
            status
        ))),
    }
}

/// Re-emit the converter log line by line
fn replay_log(path: &Path) {
    match fs::read(path) {
        Ok(bytes) => {
            for line in String::from_utf8_lossy(&bytes).lines() {
                info!("[converter] {}", line);
            }
        }
        Err(e) => warn!("Failed to read converter log {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn job(dir: &Path) -> ConversionJob {
        fs::write(dir.join("raw.fpk"), b"raw bytes").unwrap();
        fs::write(dir.join("info.txt"), b"networkNum=1\n").unwrap();
        ConversionJob {
            raw_artifact: dir.join("raw.fpk"),
            manifest: dir.join("info.txt"),
            output: dir.join("out.rpk"),
            log: dir.join("convert.log"),
        }
    }

    fn quick_wait() -> ConversionWait {
        ConversionWait {
            initial_interval_ms: 20,
            max_interval_ms: 50,
            attempts: 3,
        }
    }

    #[test]
    fn test_run_success_passes_arguments() {
        let temp_dir = TempDir::new().unwrap();
        let exe = script(
            temp_dir.path(),
            "ok.sh",
            "[ \"$1\" = -r ] && [ \"$3\" = -o ] || exit 9\necho converting\n/bin/cat \"$5\" > \"$4\"",
        );
        let job = job(temp_dir.path());

        Converter::new(exe, ConversionWait::default()).run(&job).unwrap();

        assert_eq!(fs::read(&job.output).unwrap(), b"raw bytes");
        assert_eq!(fs::read_to_string(&job.log).unwrap(), "converting\n");
    }

    #[test]
    fn test_run_with_empty_environment() {
        let temp_dir = TempDir::new().unwrap();
        let exe = script(temp_dir.path(), "env.sh", "[ -z \"$HOME\" ] || exit 3");
        Converter::new(exe, quick_wait())
            .run(&job(temp_dir.path()))
            .unwrap();
    }

    #[test]
    fn test_run_nonzero_exit_is_internal() {
        let temp_dir = TempDir::new().unwrap();
        let exe = script(temp_dir.path(), "fail.sh", "echo broken >&2\nexit 4");
        let job = job(temp_dir.path());

        let err = Converter::new(exe, quick_wait()).run(&job).unwrap_err();
        assert!(matches!(err, Error::Internal(ref m) if m.contains("exit code 4")));
        assert_eq!(fs::read_to_string(&job.log).unwrap(), "broken\n");
    }

    #[test]
    fn test_run_timeout_kills_child() {
        let temp_dir = TempDir::new().unwrap();
        let exe = script(temp_dir.path(), "hang.sh", "exec /bin/sleep 30");
        let converter = Converter::new(exe, quick_wait());

        let started = Instant::now();
        let err = converter.run(&job(temp_dir.path())).unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_missing_executable() {
        let temp_dir = TempDir::new().unwrap();
        let converter = Converter::new(temp_dir.path().join("absent"), quick_wait());
        let err = converter.run(&job(temp_dir.path())).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
