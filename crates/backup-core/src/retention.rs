use tracing::{debug, info, warn};

use crate::adapter::{DirEntry, StorageAdapter};
use crate::destination::StorageDestination;
use crate::error::StorageError;
use crate::path::join_path;

/// Suffix of in-flight partial uploads, never counted as artifacts.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Delete artifacts of `prefix` at the destination beyond its `keep_recent` policy.
///
/// Artifacts are ordered newest first by modification time, then by name
/// (artifact names embed a sortable timestamp). `current` is never deleted.
/// Returns the number of files removed.
pub async fn apply_retention(
    adapter: &dyn StorageAdapter,
    destination: &StorageDestination,
    prefix: &str,
    current: &str,
) -> Result<usize, StorageError> {
    let Some(keep) = destination.keep_recent else {
        return Ok(0);
    };
    let folder = destination.artifact_folder();
    let entries = adapter.scan_dir(&folder).await?;
    let doomed = select_expired(entries, prefix, current, keep as usize);

    let mut removed = 0;
    for entry in doomed {
        let path = join_path(&folder, &entry.name);
        match adapter.delete(&path, false).await {
            Ok(true) => {
                debug!("Retention removed {} from {}", path, destination.id);
                removed += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("Retention could not remove {} from {}: {}", path, destination.id, e),
        }
    }
    if removed > 0 {
        info!(
            "Retention kept {} artifact(s) of {} at {}, removed {}",
            keep, prefix, destination.id, removed
        );
    }
    Ok(removed)
}

fn select_expired(entries: Vec<DirEntry>, prefix: &str, current: &str, keep: usize) -> Vec<DirEntry> {
    let pattern = format!("{}-", prefix);
    let mut artifacts: Vec<DirEntry> = entries
        .into_iter()
        .filter(|e| !e.is_dir && e.name.starts_with(&pattern) && !e.name.ends_with(PARTIAL_SUFFIX))
        .collect();
    artifacts.sort_by(|a, b| {
        b.modified_at
            .cmp(&a.modified_at)
            .then_with(|| b.name.cmp(&a.name))
    });

    // The current artifact always counts toward the kept set.
    let (current_entry, others): (Vec<DirEntry>, Vec<DirEntry>) =
        artifacts.into_iter().partition(|e| e.name == current);
    let slots = keep.saturating_sub(current_entry.len());
    others.into_iter().skip(slots).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn file(name: &str, minute: u32) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            is_dir: false,
            size: 1,
            modified_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap()),
        }
    }

    #[test]
    fn test_keeps_newest_and_current() {
        let entries = vec![
            file("nightly-001.tar", 1),
            file("nightly-002.tar", 2),
            file("nightly-003.tar", 3),
            file("nightly-004.tar", 4),
            file("weekly-001.tar", 0),
            file("nightly-005.tar.part", 5),
        ];
        let doomed = select_expired(entries, "nightly", "nightly-004.tar", 2);
        let names: Vec<&str> = doomed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["nightly-002.tar", "nightly-001.tar"]);
    }

    #[test]
    fn test_current_survives_even_when_oldest() {
        let entries = vec![
            file("nightly-001.tar", 9),
            file("nightly-002.tar", 2),
            file("nightly-003.tar", 3),
        ];
        let doomed = select_expired(entries, "nightly", "nightly-002.tar", 1);
        let names: Vec<&str> = doomed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["nightly-001.tar", "nightly-003.tar"]);
    }

    #[test]
    fn test_directories_are_ignored() {
        let mut dir = file("nightly-old", 0);
        dir.is_dir = true;
        let doomed = select_expired(vec![dir, file("nightly-1.tar", 1)], "nightly", "nightly-1.tar", 1);
        assert!(doomed.is_empty());
    }
}
