//! On-disk job layout
//!
//! ```text
//! <jobs_dir>/<id>.json            manifest (JobStatus)
//! <jobs_dir>/<id>.log             combined stdout/stderr
//! <jobs_dir>/<id>.artifact.json   optional worker report
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use ov_core::Result;

use crate::job::JobStatus;

const ARTIFACT_SUFFIX: &str = ".artifact.json";
const TEMP_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct JobLayout {
    dir: PathBuf,
}

impl JobLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", id))
    }

    pub fn artifact_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, ARTIFACT_SUFFIX))
    }

    pub fn write_manifest(&self, status: &JobStatus) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(status)?;
        write_atomic(&self.manifest_path(&status.id), &bytes)?;
        Ok(())
    }

    pub fn read_manifest(&self, id: &str) -> Result<Option<JobStatus>> {
        read_manifest_file(&self.manifest_path(id))
    }

    /// Every readable manifest in the directory. Unreadable ones are skipped.
    pub fn scan(&self) -> Result<Vec<JobStatus>> {
        let mut manifests = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(".json") || name.ends_with(ARTIFACT_SUFFIX) {
                continue;
            }
            match read_manifest_file(&path) {
                Ok(Some(status)) => manifests.push(status),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "Skipping unreadable manifest: {}", e),
            }
        }
        manifests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(manifests)
    }

    /// Last `max_lines` lines of the job's log file, None when it has no output.
    pub fn read_log_tail(&self, id: &str, max_lines: usize) -> Result<Option<String>> {
        let content = match fs::read_to_string(self.log_path(id)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() || max_lines == 0 {
            return Ok(None);
        }
        let start = lines.len().saturating_sub(max_lines);
        Ok(Some(lines[start..].join("\n")))
    }
}

fn read_manifest_file(path: &Path) -> Result<Option<JobStatus>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write to a uniquely named temp file in the same directory, then rename
/// over the target. Readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

    for _ in 0..TEMP_ATTEMPTS {
        let suffix = Uuid::new_v4().simple().to_string();
        let tmp = dir.join(format!(".{}.{}.tmp", name, &suffix[..12]));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&tmp) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(tmp = %tmp.display(), "Temp name collision, retrying");
                continue;
            }
            Err(e) => return Err(e),
        };

        let written = file.write_all(bytes).and_then(|_| file.sync_all());
        drop(file);
        if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        return Ok(());
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free temp name for {}", path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        write_atomic(&path, b"{\"v\":1}").unwrap();
        write_atomic(&path, b"{\"v\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_scan_ignores_artifacts_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path());
        fs::write(layout.artifact_path("x"), "{}").unwrap();
        fs::write(dir.path().join("broken.json"), "not json").unwrap();
        fs::write(dir.path().join("x.log"), "line").unwrap();
        assert!(layout.scan().unwrap().is_empty());
    }

    #[test]
    fn test_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path());
        assert_eq!(layout.read_log_tail("j", 10).unwrap(), None);

        fs::write(layout.log_path("j"), "one\ntwo\nthree\n").unwrap();
        assert_eq!(layout.read_log_tail("j", 2).unwrap().as_deref(), Some("two\nthree"));
        assert_eq!(layout.read_log_tail("j", 10).unwrap().as_deref(), Some("one\ntwo\nthree"));
    }
}
