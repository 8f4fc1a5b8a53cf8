//! Append-only journal of managed process ids
//!
//! Each spawn appends one line and syncs before returning, so a crash right
//! after spawning never loses a live pid. A separate `stop` invocation reads
//! the same file to find processes it did not start.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PidRegistry {
    path: PathBuf,
}

impl PidRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Record a pid and flush it to disk
    pub fn append(&self, pid: u32) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", pid)?;
        file.sync_data()?;
        debug!(pid, registry = %self.path.display(), "Pid recorded");
        Ok(())
    }

    /// Recorded pids in append order, without duplicates.
    ///
    /// A missing file is an empty registry. Lines that do not parse (for
    /// example a write torn by a crash) are skipped.
    pub fn read(&self) -> io::Result<Vec<u32>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut pids = Vec::new();
        for (lineno, raw) in content.split(|&b| b == b'\n').enumerate() {
            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Bytes that are not UTF-8 never form a pid
            let parsed = std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            match parsed {
                Some(0 | 1) | None => {
                    warn!(
                        registry = %self.path.display(),
                        line = lineno + 1,
                        content = %line.escape_debug(),
                        "Ignoring unreadable registry entry"
                    );
                }
                Some(pid) => {
                    if !pids.contains(&pid) {
                        pids.push(pid);
                    }
                }
            }
        }
        Ok(pids)
    }

    /// Delete the registry file; already gone is fine
    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
