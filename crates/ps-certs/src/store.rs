use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CertError, Result};

/// An identity issued to a device during bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub device_id: String,
    pub csr: String,
    pub app_name: String,
    pub os: String,
    pub destination: String,
    pub issued_at: DateTime<Utc>,
    /// Hex SHA-256 of the issued certificate's DER.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_fingerprint: Option<String>,
}

/// Issued identities keyed by device id, optionally mirrored to a JSON file.
#[derive(Debug)]
pub struct CertificateStore {
    records: DashMap<String, CertificateRecord>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl CertificateStore {
    pub fn in_memory() -> Self {
        Self {
            records: DashMap::new(),
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Open a store backed by `path`, loading any records already there.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = DashMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let loaded: Vec<CertificateRecord> = serde_json::from_slice(&bytes)
                    .map_err(|e| CertError::Store(format!("{}: {e}", path.display())))?;
                for record in loaded {
                    records.insert(record.device_id.clone(), record);
                }
                debug!(path = %path.display(), count = records.len(), "certificate records loaded");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            records,
            path: Some(path),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or replace the record for its device id.
    pub async fn insert(&self, record: CertificateRecord) -> Result<()> {
        self.records.insert(record.device_id.clone(), record);
        self.persist().await
    }

    pub async fn remove(&self, device_id: &str) -> Result<Option<CertificateRecord>> {
        let removed = self.records.remove(device_id).map(|(_, r)| r);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    pub fn get(&self, device_id: &str) -> Option<CertificateRecord> {
        self.records.get(device_id).map(|r| r.clone())
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.records.contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;

        let mut snapshot: Vec<CertificateRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        snapshot.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| CertError::Store(e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
