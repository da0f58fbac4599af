//! Camera Status Registry
//!
//! One record per configured camera, created up front and reset in place.
//! Readers always receive copies.

use crate::camera::CameraId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("camera not registered: {0}")]
    UnknownCamera(CameraId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStatus {
    pub is_connected: bool,
    pub is_streaming: bool,
    pub transcoding_active: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub connection_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraMetrics {
    pub total_connections: u64,
    pub total_disconnections: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraEntry {
    pub camera: CameraId,
    pub status: CameraStatus,
    pub metrics: CameraMetrics,
}

#[derive(Debug, Default)]
struct Record {
    status: CameraStatus,
    metrics: CameraMetrics,
}

#[derive(Debug)]
pub struct CameraRegistry {
    records: RwLock<HashMap<CameraId, Record>>,
}

impl CameraRegistry {
    pub fn new(cameras: impl IntoIterator<Item = CameraId>) -> Self {
        let records = cameras
            .into_iter()
            .map(|camera| (camera, Record::default()))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn contains(&self, camera: &CameraId) -> bool {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.contains_key(camera)
    }

    pub fn cameras(&self) -> Vec<CameraId> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut cameras: Vec<CameraId> = records.keys().cloned().collect();
        cameras.sort();
        cameras
    }

    fn update<T>(
        &self,
        camera: &CameraId,
        apply: impl FnOnce(&mut Record) -> T,
    ) -> Result<T, RegistryError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records
            .get_mut(camera)
            .map(apply)
            .ok_or_else(|| RegistryError::UnknownCamera(camera.clone()))
    }

    pub fn on_connect(&self, camera: &CameraId) -> Result<(), RegistryError> {
        let now = Utc::now();
        self.update(camera, |record| {
            record.status.is_connected = true;
            record.status.last_seen = Some(now);
            record.status.connection_time = Some(now);
            record.metrics.total_connections += 1;
        })
    }

    pub fn on_publish_start(&self, camera: &CameraId) -> Result<(), RegistryError> {
        let now = Utc::now();
        self.update(camera, |record| {
            record.status.is_streaming = true;
            record.status.last_seen = Some(now);
        })
    }

    pub fn on_publish_end(&self, camera: &CameraId) -> Result<(), RegistryError> {
        let now = Utc::now();
        self.update(camera, |record| {
            record.status.is_streaming = false;
            record.status.is_connected = false;
            record.status.last_seen = Some(now);
            record.metrics.total_disconnections += 1;
        })
    }

    /// Returns whether the flag changed.
    pub fn set_transcoding(&self, camera: &CameraId, active: bool) -> Result<bool, RegistryError> {
        self.update(camera, |record| {
            let changed = record.status.transcoding_active != active;
            record.status.transcoding_active = active;
            changed
        })
    }

    pub fn record_error(&self, camera: &CameraId, error: impl Into<String>) -> Result<(), RegistryError> {
        let error = error.into();
        self.update(camera, |record| record.metrics.last_error = Some(error))
    }

    /// Copy of one camera's record, or `None` for an unregistered name.
    pub fn get(&self, camera: &CameraId) -> Option<(CameraStatus, CameraMetrics)> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .get(camera)
            .map(|r| (r.status.clone(), r.metrics.clone()))
    }

    pub fn all(&self) -> Vec<CameraEntry> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<CameraEntry> = records
            .iter()
            .map(|(camera, r)| CameraEntry {
                camera: camera.clone(),
                status: r.status.clone(),
                metrics: r.metrics.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.camera.cmp(&b.camera));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CameraRegistry {
        CameraRegistry::new(["camera1", "camera2"].map(CameraId::from))
    }

    #[test]
    fn test_connect_publish_unpublish() {
        let registry = registry();
        let cam = CameraId::from("camera1");

        registry.on_connect(&cam).unwrap();
        registry.on_publish_start(&cam).unwrap();
        let (status, metrics) = registry.get(&cam).unwrap();
        assert!(status.is_connected);
        assert!(status.is_streaming);
        assert!(status.connection_time.is_some());
        assert_eq!(metrics.total_connections, 1);

        registry.on_publish_end(&cam).unwrap();
        let (status, metrics) = registry.get(&cam).unwrap();
        assert!(!status.is_connected);
        assert!(!status.is_streaming);
        assert!(status.last_seen.is_some());
        assert_eq!(metrics.total_disconnections, 1);

        // Untouched camera stays at defaults
        let (other, _) = registry.get(&CameraId::from("camera2")).unwrap();
        assert_eq!(other, CameraStatus::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let registry = registry();
        let cam = CameraId::from("camera2");
        for _ in 0..3 {
            registry.on_connect(&cam).unwrap();
            registry.on_publish_end(&cam).unwrap();
        }
        let (_, metrics) = registry.get(&cam).unwrap();
        assert_eq!(metrics.total_connections, 3);
        assert_eq!(metrics.total_disconnections, 3);
    }

    #[test]
    fn test_unknown_camera() {
        let registry = registry();
        let ghost = CameraId::from("unknown_camera");

        assert!(registry.get(&ghost).is_none());
        assert_eq!(
            registry.on_connect(&ghost),
            Err(RegistryError::UnknownCamera(ghost.clone()))
        );
        // Rejected events never create an entry
        assert!(registry.get(&ghost).is_none());
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = registry();
        let cam = CameraId::from("camera1");
        let (before, _) = registry.get(&cam).unwrap();

        registry.on_publish_start(&cam).unwrap();
        registry.set_transcoding(&cam, true).unwrap();
        registry.record_error(&cam, "boom").unwrap();

        assert!(!before.is_streaming);
        let (after, metrics) = registry.get(&cam).unwrap();
        assert!(after.transcoding_active);
        assert_eq!(metrics.last_error.as_deref(), Some("boom"));
    }
}
