// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flag-file path conventions and the RAII handle that owns a created flag
//! file's lifetime.
//!
//! A flag file's existence means "this instance is currently offered at
//! this quality level". Path shape:
//! `{root}/{service_id}/{instance_id}/{quality_tag}_{disambiguator}`.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::ids::{EnrichedInstanceIdentifier, InstanceId, QualityType, ServiceId};

/// Directory holding every instance of one service type.
#[must_use]
pub fn service_dir(root: &Path, service_id: ServiceId) -> PathBuf {
    root.join(service_id.to_string())
}

/// Directory holding the flag files for one concrete instance.
#[must_use]
pub fn instance_dir(root: &Path, service_id: ServiceId, instance_id: InstanceId) -> PathBuf {
    service_dir(root, service_id).join(instance_id.to_string())
}

/// Full path of the flag file for one offer of `(service, instance,
/// quality)` distinguished by `disambiguator`.
///
/// # Panics
///
/// Panics if `enriched.instance_id` is `None` or `enriched.quality` is
/// [`QualityType::Invalid`] — a flag file always names a concrete instance
/// at a concrete quality.
#[must_use]
pub fn flag_file_path(root: &Path, enriched: EnrichedInstanceIdentifier, disambiguator: u64) -> PathBuf {
    let instance_id = enriched.instance_id.expect("flag file requires a concrete instance id");
    assert_ne!(enriched.quality, QualityType::Invalid, "flag file requires a concrete quality");
    instance_dir(root, enriched.service_id, instance_id).join(format!("{}_{disambiguator}", enriched.quality.tag()))
}

/// Parse the quality tag out of a flag file's filename (not its full path).
///
/// Unknown tags are not an error: callers treat an unrecognized tag as a
/// skip-worthy but non-fatal condition (see the crawler).
#[must_use]
pub fn parse_quality_from_filename(filename: &str) -> QualityType {
    QualityType::parse_from_filename(filename)
}

/// Parse a numeric instance id out of a service directory's child name.
///
/// # Errors
///
/// Returns an error if `s` is not a valid instance id; this is an expected,
/// non-fatal outcome when walking directories that contain entries other
/// than instance directories.
pub fn parse_instance_id_from_str(s: &str) -> Result<InstanceId, std::num::ParseIntError> {
    crate::ids::convert_from_string_to_instance_id(s)
}

/// Source of per-process monotonically increasing disambiguators, seeded
/// from the steady clock so successive offers from a restarted provider
/// process still produce distinct flag file names.
pub struct DisambiguatorSource {
    next: u64,
}

impl DisambiguatorSource {
    #[must_use]
    pub fn new() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let seed = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0);
        Self { next: seed }
    }

    pub fn next(&mut self) -> u64 {
        let value = self.next;
        self.next += 1;
        value
    }
}

impl Default for DisambiguatorSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised while creating or probing a flag file.
#[derive(Debug)]
pub enum FlagFileError {
    /// Could not create the instance directory.
    CreateInstanceDir(std::io::Error),
    /// The flag file already exists (offer already in progress) or
    /// creation otherwise failed.
    CreateFlagFile(std::io::Error),
}

impl std::fmt::Display for FlagFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagFileError::CreateInstanceDir(e) => write!(f, "failed to create instance directory: {e}"),
            FlagFileError::CreateFlagFile(e) => write!(f, "failed to create flag file: {e}"),
        }
    }
}

impl std::error::Error for FlagFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlagFileError::CreateInstanceDir(e) | FlagFileError::CreateFlagFile(e) => Some(e),
        }
    }
}

/// RAII handle for one created flag file. Removes the file on drop, giving
/// `StopOfferService` release-on-all-exit-paths semantics for free.
pub struct FlagFile {
    path: PathBuf,
}

impl FlagFile {
    /// Create the instance directory (if absent) then atomically create the
    /// flag file for `enriched` at `disambiguator`.
    ///
    /// # Errors
    ///
    /// Returns [`FlagFileError::CreateFlagFile`] if the flag file already
    /// exists (an offer is already in progress at this quality) or cannot
    /// be created for another reason.
    pub fn make(root: &Path, enriched: EnrichedInstanceIdentifier, disambiguator: u64) -> Result<Self, FlagFileError> {
        let instance_id = enriched.instance_id.expect("flag file requires a concrete instance id");
        let dir = instance_dir(root, enriched.service_id, instance_id);
        fs::create_dir_all(&dir).map_err(FlagFileError::CreateInstanceDir)?;

        let path = flag_file_path(root, enriched, disambiguator);
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(FlagFileError::CreateFlagFile)?;
        Ok(Self { path })
    }

    /// Whether a flag file for `enriched` exists at `disambiguator`.
    #[must_use]
    pub fn exists(root: &Path, enriched: EnrichedInstanceIdentifier, disambiguator: u64) -> bool {
        flag_file_path(root, enriched, disambiguator).is_file()
    }

    /// Whether any flag file for this `(service, instance, quality)` exists,
    /// regardless of disambiguator.
    #[must_use]
    pub fn exists_any(root: &Path, enriched: EnrichedInstanceIdentifier) -> bool {
        let instance_id = match enriched.instance_id {
            Some(id) => id,
            None => return false,
        };
        let dir = instance_dir(root, enriched.service_id, instance_id);
        let Ok(entries) = fs::read_dir(&dir) else {
            return false;
        };
        entries.filter_map(Result::ok).any(|entry| {
            entry.file_name().to_str().is_some_and(|name| parse_quality_from_filename(name) == enriched.quality)
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FlagFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove flag file {}: {e}", self.path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn enriched(service: ServiceId, instance: InstanceId, quality: QualityType) -> EnrichedInstanceIdentifier {
        EnrichedInstanceIdentifier::new(service, Some(instance), quality)
    }

    #[test]
    fn make_creates_directory_and_file() {
        let dir = TempDir::new().unwrap();
        let id = enriched(1, 2, QualityType::AsilB);
        let flag = FlagFile::make(dir.path(), id, 0).expect("make");
        assert!(flag.path().is_file());
        assert!(FlagFile::exists(dir.path(), id, 0));
    }

    #[test]
    fn drop_removes_file() {
        let dir = TempDir::new().unwrap();
        let id = enriched(1, 2, QualityType::AsilQm);
        let path = {
            let flag = FlagFile::make(dir.path(), id, 0).expect("make");
            flag.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn make_twice_with_same_disambiguator_fails() {
        let dir = TempDir::new().unwrap();
        let id = enriched(1, 2, QualityType::AsilB);
        let _first = FlagFile::make(dir.path(), id, 0).expect("make");
        assert!(FlagFile::make(dir.path(), id, 0).is_err());
    }

    #[test]
    fn exists_any_matches_regardless_of_disambiguator() {
        let dir = TempDir::new().unwrap();
        let id = enriched(1, 2, QualityType::AsilB);
        let _flag = FlagFile::make(dir.path(), id, 42).expect("make");
        assert!(FlagFile::exists_any(dir.path(), id));
        assert!(!FlagFile::exists(dir.path(), id, 0));
    }

    #[test]
    fn parse_quality_unknown_tag_is_invalid() {
        assert_eq!(parse_quality_from_filename("mystery_1"), QualityType::Invalid);
    }

    #[test]
    fn disambiguator_source_is_monotonic() {
        let mut src = DisambiguatorSource::new();
        let a = src.next();
        let b = src.next();
        assert!(b > a);
    }
}
