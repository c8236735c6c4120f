//! Directory size reports, logged after weights are prepared.

use std::io;
use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct DirReport {
    /// Every regular file found, largest first.
    pub files: Vec<(PathBuf, u64)>,
    pub total_bytes: u64,
}

impl DirReport {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Emit one log line per file plus a total.
    pub fn log(&self, root: &Path) {
        for (path, size) in &self.files {
            let rel = path.strip_prefix(root).unwrap_or(path);
            info!(file = %rel.display(), size = %format_size(*size), "weights file");
        }
        info!(
            dir = %root.display(),
            files = self.file_count(),
            total = %format_size(self.total_bytes),
            "weights directory summary"
        );
    }
}

/// Walk `root` recursively. A missing root yields an empty report.
pub fn scan_dir(root: &Path) -> Result<DirReport> {
    let mut report = DirReport::default();
    if !root.exists() {
        return Ok(report);
    }

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let len = entry.metadata().map_err(io::Error::from)?.len();
        report.total_bytes += len;
        report.files.push((entry.into_path(), len));
    }
    report.files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(report)
}

/// `0 B`, `512 B`, `1.5 KB`, `2.0 GB`, ...
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PB")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
