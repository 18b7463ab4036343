//! Template store
//!
//! Small state blobs, one JSON document per file under a fixed directory.
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so a reader never sees a partial document. One lock covers every
//! file.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use edge_core::{DeviceSettings, TemplatePids, TemplateUrls};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Job name of the script-request sample dump
pub const CAN_DUMP_JOB: &str = "can_dump";

/// One cached blob and its file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    VinSettings,
    PidSettings,
    TemplateUrls,
    DeviceSettings,
    JobMarkers,
    SignalDatabase,
    Certificate,
}

impl StoreKind {
    pub const ALL: [StoreKind; 7] = [
        StoreKind::VinSettings,
        StoreKind::PidSettings,
        StoreKind::TemplateUrls,
        StoreKind::DeviceSettings,
        StoreKind::JobMarkers,
        StoreKind::SignalDatabase,
        StoreKind::Certificate,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            StoreKind::VinSettings => "vin-settings.json",
            StoreKind::PidSettings => "logger-pid-settings.json",
            StoreKind::TemplateUrls => "template-urls.json",
            StoreKind::DeviceSettings => "device-settings.json",
            StoreKind::JobMarkers => "can-dump-info.json",
            StoreKind::SignalDatabase => "signal-database.dbc",
            StoreKind::Certificate => "client.pem",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            StoreKind::VinSettings => "vin settings",
            StoreKind::PidSettings => "pid settings",
            StoreKind::TemplateUrls => "template urls",
            StoreKind::DeviceSettings => "device settings",
            StoreKind::JobMarkers => "job markers",
            StoreKind::SignalDatabase => "signal database",
            StoreKind::Certificate => "certificate",
        }
    }
}

/// What the fingerprint runner remembers between boots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VinSettings {
    #[serde(default)]
    pub vin: String,
    /// Name of the query that last produced a VIN
    #[serde(default)]
    pub vin_query_name: String,
    #[serde(default)]
    pub protocol: String,
    /// Fingerprint table version the fields above were recorded against
    #[serde(default)]
    pub version: u32,
    /// Consecutive boots that found no VIN
    #[serde(default)]
    pub failed_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct JobRecord {
    date_executed: DateTime<Utc>,
}

/// Durable cache of configuration blobs
#[derive(Debug)]
pub struct TemplateStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl TemplateStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: StoreKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Read a JSON blob. `Ok(None)` when the file does not exist.
    pub fn read<T: DeserializeOwned>(&self, kind: StoreKind) -> StoreResult<Option<T>> {
        let Some(bytes) = self.read_bytes(kind)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: self.path(kind).display().to_string(),
                source,
            })
    }

    /// Read a JSON blob, treating a corrupt file as absent
    pub fn read_or_absent<T: DeserializeOwned>(&self, kind: StoreKind) -> Option<T> {
        match self.read(kind) {
            Ok(value) => value,
            Err(e) => {
                warn!(kind = kind.label(), error = %e, "Ignoring unreadable state file");
                None
            }
        }
    }

    /// Replace a JSON blob
    pub fn write<T: Serialize>(&self, kind: StoreKind, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
            kind: kind.label(),
            source,
        })?;
        self.write_bytes(kind, &bytes)
    }

    /// Read a text blob (signal database, certificate)
    pub fn read_text(&self, kind: StoreKind) -> StoreResult<Option<String>> {
        Ok(self
            .read_bytes(kind)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn write_text(&self, kind: StoreKind, text: &str) -> StoreResult<()> {
        self.write_bytes(kind, text.as_bytes())
    }

    /// Remove one blob; missing files are fine
    pub fn remove(&self, kind: StoreKind) -> StoreResult<()> {
        let _guard = self.lock.lock();
        let path = self.path(kind);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Remove every blob
    pub fn delete_all(&self) -> StoreResult<()> {
        for kind in StoreKind::ALL {
            self.remove(kind)?;
        }
        debug!(dir = %self.dir.display(), "Template store cleared");
        Ok(())
    }

    // =========================================================================
    // Job markers
    // =========================================================================

    /// Record that `job` completed at `at`
    pub fn mark_job_done(&self, job: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut markers: BTreeMap<String, JobRecord> =
            self.read_or_absent(StoreKind::JobMarkers).unwrap_or_default();
        markers.insert(job.to_string(), JobRecord { date_executed: at });
        self.write(StoreKind::JobMarkers, &markers)
    }

    /// When `job` last completed
    pub fn read_job_done(&self, job: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let markers: Option<BTreeMap<String, JobRecord>> = self.read(StoreKind::JobMarkers)?;
        Ok(markers.and_then(|m| m.get(job).map(|r| r.date_executed)))
    }

    // =========================================================================
    // Typed accessors
    // =========================================================================

    pub fn read_vin_settings(&self) -> Option<VinSettings> {
        self.read_or_absent(StoreKind::VinSettings)
    }

    pub fn write_vin_settings(&self, settings: &VinSettings) -> StoreResult<()> {
        self.write(StoreKind::VinSettings, settings)
    }

    pub fn read_pids(&self) -> Option<TemplatePids> {
        self.read_or_absent(StoreKind::PidSettings)
    }

    pub fn read_urls(&self) -> Option<TemplateUrls> {
        self.read_or_absent(StoreKind::TemplateUrls)
    }

    pub fn read_device_settings(&self) -> Option<DeviceSettings> {
        self.read_or_absent(StoreKind::DeviceSettings)
    }

    fn read_bytes(&self, kind: StoreKind) -> StoreResult<Option<Vec<u8>>> {
        let _guard = self.lock.lock();
        let path = self.path(kind);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn write_bytes(&self, kind: StoreKind, bytes: &[u8]) -> StoreResult<()> {
        let _guard = self.lock.lock();
        let path = self.path(kind);
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut file = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.as_file().sync_all().map_err(io_err)?;
        file.persist(&path).map_err(|e| io_err(e.error))?;

        debug!(kind = kind.label(), bytes = bytes.len(), "State file written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> (tempfile::TempDir, TemplateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_vin_settings_round_trip() {
        let (_dir, store) = store();
        assert_eq!(store.read_vin_settings(), None);

        let settings = VinSettings {
            vin: "1FTEW1CP3NKE68593".to_string(),
            vin_query_name: "vin_7DF_09_02".to_string(),
            protocol: "6".to_string(),
            version: 1,
            failed_attempts: 0,
        };
        store.write_vin_settings(&settings).unwrap();
        assert_eq!(store.read_vin_settings(), Some(settings));
    }

    #[test]
    fn test_fixed_file_names() {
        let (dir, store) = store();
        store.write(StoreKind::TemplateUrls, &TemplateUrls::default()).unwrap();
        store.write_text(StoreKind::Certificate, "PEM").unwrap();

        assert!(dir.path().join("template-urls.json").exists());
        assert!(dir.path().join("client.pem").exists());
        assert_eq!(store.read_text(StoreKind::Certificate).unwrap().as_deref(), Some("PEM"));
    }

    #[test]
    fn test_corrupt_file_is_distinct_from_absent() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("device-settings.json"), b"{not json").unwrap();

        let result: StoreResult<Option<DeviceSettings>> = store.read(StoreKind::DeviceSettings);
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
        assert_eq!(store.read_device_settings(), None);
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let (dir, store) = store();
        for version in ["v1", "v2", "v3"] {
            let pids = TemplatePids {
                version: version.to_string(),
                ..TemplatePids::default()
            };
            store.write(StoreKind::PidSettings, &pids).unwrap();
        }

        assert_eq!(store.read_pids().unwrap().version, "v3");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_job_markers() {
        let (_dir, store) = store();
        assert_eq!(store.read_job_done(CAN_DUMP_JOB).unwrap(), None);

        let at = Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap();
        store.mark_job_done(CAN_DUMP_JOB, at).unwrap();
        store.mark_job_done("other", at).unwrap();

        assert_eq!(store.read_job_done(CAN_DUMP_JOB).unwrap(), Some(at));
        assert_eq!(store.read_job_done("other").unwrap(), Some(at));
    }

    #[test]
    fn test_delete_all() {
        let (dir, store) = store();
        store.write_vin_settings(&VinSettings::default()).unwrap();
        store.write_text(StoreKind::SignalDatabase, "BO_").unwrap();

        store.delete_all().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
