//! Source file discovery

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// List the files in `dir` (non-recursive) whose extension matches `ext`,
/// case-insensitively. Results are sorted by path so runs are deterministic.
pub fn files_with_extension(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read source directory {}", dir.display()))?;

    let want = ext.trim_start_matches('.').to_ascii_lowercase();

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read directory entry in {}", dir.display()))?;
        let path = entry.path();

        if !path.is_file() {
            continue;
        }

        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&want));

        if matches {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
