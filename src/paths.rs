//! Session file naming, session-number discovery and destination free space.
//!
//! File names follow `<base>[_<session>][-<qualifier>].<ext>`: session 0 has no
//! number suffix, and the qualifier names a processor or an electrode when one
//! session writes several files of the same kind.

use crate::error::{RecordError, RecordResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// File stem shared by every file of a session.
pub fn session_stem(base_name: &str, session_number: u32) -> String {
    if session_number == 0 {
        base_name.to_string()
    } else {
        format!("{base_name}_{session_number}")
    }
}

/// Full file name for one file of a session.
pub fn session_file_name(
    base_name: &str,
    session_number: u32,
    qualifier: Option<&str>,
    extension: &str,
) -> String {
    let stem = session_stem(base_name, session_number);
    match qualifier {
        Some(q) => format!("{stem}-{q}.{extension}"),
        None => format!("{stem}.{extension}"),
    }
}

fn belongs_to(file_name: &str, stem: &str) -> bool {
    file_name
        .strip_prefix(stem)
        .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'))
}

/// First session number `>= start` with no file of that session in `directory`.
///
/// A missing directory has no sessions.
pub fn next_session_number(directory: &Path, base_name: &str, start: u32) -> RecordResult<u32> {
    let names: Vec<String> = match std::fs::read_dir(directory) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(start),
        Err(e) => return Err(RecordError::fs(directory, e)),
    };

    let mut session = start;
    while names
        .iter()
        .any(|name| belongs_to(name, &session_stem(base_name, session)))
    {
        session = session.checked_add(1).ok_or_else(|| {
            RecordError::Configuration(format!("no free session number for '{base_name}'"))
        })?;
    }
    Ok(session)
}

/// Space on the volume holding a directory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeUsage {
    /// Bytes available to the recorder
    pub available: u64,
    /// Volume size in bytes
    pub total: u64,
}

impl VolumeUsage {
    /// Fraction of the volume in use, `0.0..=1.0`.
    pub fn used_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        1.0 - self.available as f64 / self.total as f64
    }
}

/// Free-space estimate for the volume that holds (or will hold) `directory`.
///
/// Picks the mounted disk with the longest mount point containing the path.
/// Returns `None` when no disk matches, e.g. in minimal containers.
pub fn free_space(directory: &Path) -> Option<VolumeUsage> {
    let existing: PathBuf = directory
        .ancestors()
        .find(|p| p.exists())
        .and_then(|p| p.canonicalize().ok())?;

    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| existing.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| VolumeUsage {
            available: d.available_space(),
            total: d.total_space(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(session_file_name("rec", 0, None, "dat"), "rec.dat");
        assert_eq!(session_file_name("rec", 2, Some("101"), "dat"), "rec_2-101.dat");
        assert_eq!(session_file_name("rec", 1, Some("tetrode 1"), "spk"), "rec_1-tetrode 1.spk");
    }

    #[test]
    fn test_belongs_to() {
        assert!(belongs_to("rec.dat", "rec"));
        assert!(belongs_to("rec-101.dat", "rec"));
        assert!(!belongs_to("rec_1.dat", "rec"));
        assert!(belongs_to("rec_1.json", "rec_1"));
        assert!(!belongs_to("rec_10.dat", "rec_1"));
        assert!(!belongs_to("record.dat", "rec"));
    }

    #[test]
    fn test_next_session_number_skips_taken() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_session_number(dir.path(), "rec", 0).unwrap(), 0);

        std::fs::write(dir.path().join("rec.dat"), b"").unwrap();
        std::fs::write(dir.path().join("rec_1-7.dat"), b"").unwrap();
        std::fs::write(dir.path().join("other.dat"), b"").unwrap();
        assert_eq!(next_session_number(dir.path(), "rec", 0).unwrap(), 2);
        assert_eq!(next_session_number(dir.path(), "rec", 5).unwrap(), 5);
        assert_eq!(next_session_number(dir.path(), "other", 0).unwrap(), 1);
    }

    #[test]
    fn test_missing_directory_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-yet");
        assert_eq!(next_session_number(&missing, "rec", 3).unwrap(), 3);
    }

    #[test]
    fn test_used_fraction() {
        let usage = VolumeUsage {
            available: 25,
            total: 100,
        };
        assert!((usage.used_fraction() - 0.75).abs() < 1e-9);
        assert_eq!(VolumeUsage { available: 0, total: 0 }.used_fraction(), 0.0);
    }
}
