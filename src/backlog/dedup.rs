use std::collections::HashSet;
use tracing::info;

use super::resolver::ResolvedFile;

/// Drops repeated files, keeping the first occurrence of each full path.
pub fn dedup(files: Vec<ResolvedFile>) -> Vec<ResolvedFile> {
    let total = files.len();
    let mut seen = HashSet::with_capacity(total);
    let unique: Vec<ResolvedFile> = files
        .into_iter()
        .filter(|file| seen.insert(file.full_path.clone()))
        .collect();

    if unique.len() < total {
        info!(duplicates = total - unique.len(), unique = unique.len(), "Removed duplicate files");
    }
    unique
}
