use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Stem shared by every artifact of the submission made at `timestamp`.
pub fn artifact_stem(timestamp: u64) -> String {
    format!("output_{}", timestamp)
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn files_with_extension<'a>(dir: &'a Path, ext: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(move |p| has_extension(p, ext))
}

/// Deletes every artifact with the given extension. Returns how many were
/// removed.
pub fn purge_format(dir: &Path, ext: &str) -> std::io::Result<usize> {
    let mut removed = 0;
    for path in files_with_extension(dir, ext) {
        std::fs::remove_file(&path)?;
        info!("Removed stale artifact {:?}", path);
        removed += 1;
    }
    Ok(removed)
}

/// Finds the artifact for `ext` by scanning the directory.
///
/// More than one match means the purge-before-write rule was bypassed; the
/// most recently modified file is returned.
pub fn find_artifact(dir: &Path, ext: &str) -> Option<PathBuf> {
    let mut matches: Vec<(SystemTime, PathBuf)> = files_with_extension(dir, ext)
        .map(|p| {
            let modified = std::fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            (modified, p)
        })
        .collect();

    if matches.len() > 1 {
        warn!(
            "Found {} artifacts with extension {:?} in {:?}; serving the newest",
            matches.len(),
            ext,
            dir
        );
    }

    matches.sort_by(|a, b| a.0.cmp(&b.0));
    matches.pop().map(|(_, p)| p)
}
