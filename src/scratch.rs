//! Scratch directory selection
//!
//! Downloaded objects are written to the fastest writable location: a
//! RAM-backed directory when one is present and accepts a test write,
//! otherwise the durable temp directory. Writability is re-probed on every
//! call since it can change during a session (tmpfs full, unmounted).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::ScratchSettings;

/// Picks and creates scratch files.
#[derive(Debug, Clone)]
pub struct TempLocationSelector {
    ram_dirs: Vec<PathBuf>,
    fallback: PathBuf,
}

impl TempLocationSelector {
    /// Prefix of every scratch file name.
    pub const FILE_PREFIX: &'static str = "s3nc-";

    pub fn new(ram_dirs: Vec<PathBuf>, fallback: Option<PathBuf>) -> Self {
        Self {
            ram_dirs,
            fallback: fallback.unwrap_or_else(std::env::temp_dir),
        }
    }

    pub fn from_settings(settings: &ScratchSettings) -> Self {
        Self::new(settings.ram_dirs.clone(), settings.fallback_dir.clone())
    }

    /// The durable fallback directory.
    pub fn fallback(&self) -> &Path {
        &self.fallback
    }

    /// First writable RAM-backed directory, else the fallback.
    pub fn select(&self) -> PathBuf {
        self.ram_dirs
            .iter()
            .find(|dir| is_writable(dir))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Create a new, empty scratch file named after `hint` (typically the
    /// object's base name, so the extension is kept).
    ///
    /// Falls back to the durable directory if the selected one refuses the
    /// create (e.g. it filled up between probe and write).
    pub fn create_file(&self, hint: &str) -> io::Result<(PathBuf, File)> {
        let dir = self.select();
        match create_unique(&dir, hint) {
            Ok(created) => Ok(created),
            Err(e) if dir != self.fallback => {
                debug!(dir = %dir.display(), error = %e, "scratch dir refused file, using fallback");
                create_unique(&self.fallback, hint)
            }
            Err(e) => Err(e),
        }
    }

    /// Write `bytes` to a new scratch file and flush it.
    pub fn write_file(&self, hint: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let (path, mut file) = self.create_file(hint)?;
        let result = file.write_all(bytes).and_then(|()| file.flush());
        if let Err(e) = result {
            drop(file);
            let _ = fs::remove_file(&path);
            // Retry once on the durable fallback if the fast dir filled up.
            if path.parent() != Some(self.fallback.as_path()) {
                let (path, mut file) = create_unique(&self.fallback, hint)?;
                if let Err(e) = file.write_all(bytes).and_then(|()| file.flush()) {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    return Err(e);
                }
                return Ok(path);
            }
            return Err(e);
        }
        Ok(path)
    }
}

impl Default for TempLocationSelector {
    fn default() -> Self {
        Self::from_settings(&ScratchSettings::default())
    }
}

/// Check a directory by actually creating and removing a file in it.
fn is_writable(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let probe = dir.join(format!(".s3nc-probe-{}", uuid::Uuid::new_v4().simple()));
    let ok = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .and_then(|mut f| f.write_all(b"\0"))
        .is_ok();
    let _ = fs::remove_file(&probe);
    ok
}

fn create_unique(dir: &Path, hint: &str) -> io::Result<(PathBuf, File)> {
    let path = dir.join(format!(
        "{}{}-{}",
        TempLocationSelector::FILE_PREFIX,
        uuid::Uuid::new_v4().simple(),
        sanitize_hint(hint)
    ));
    let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    Ok((path, file))
}

/// Keep a short, filesystem-safe tail of `hint`.
fn sanitize_hint(hint: &str) -> String {
    const MAX_LEN: usize = 64;
    let base = hint.rsplit('/').next().unwrap_or(hint);
    let clean: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let start = clean.len().saturating_sub(MAX_LEN);
    let tail = clean[start..].trim_start_matches('.');
    if tail.is_empty() {
        "object".to_string()
    } else {
        tail.to_string()
    }
}
