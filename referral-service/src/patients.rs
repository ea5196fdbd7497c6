//! JSON-file patient registry used by the id-based assessment route.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use guideline_rag::PatientInput;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A stored patient as kept in the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub name: String,
    pub age: u32,
    pub gender: String,
    pub smoking_history: String,
    pub symptoms: Vec<String>,
    pub symptom_duration_days: u32,
}

impl PatientRecord {
    /// Clinical fields only; the name stays out of prompts and cache keys.
    pub fn to_input(&self) -> PatientInput {
        let smoker = smoking_status(&self.smoking_history);
        let mut risk_factors = Vec::new();
        if smoker == Some(true) {
            risk_factors.push(format!("smoking history: {}", self.smoking_history.trim()));
        }

        PatientInput {
            age: self.age,
            sex: Some(self.gender.clone()).filter(|g| !g.trim().is_empty()),
            symptoms: self.symptoms.clone(),
            duration_weeks: Some(self.symptom_duration_days.div_ceil(7)),
            smoker,
            risk_factors,
        }
    }
}

/// "Never Smoked" is false, "Current Smoker" or "Ex-Smoker" is true,
/// anything else is unknown.
fn smoking_status(history: &str) -> Option<bool> {
    let history = history.trim().to_lowercase();
    if history.is_empty() {
        None
    } else if history.contains("never") || history.starts_with("non") || history == "no" {
        Some(false)
    } else if history.contains("smok") || history == "yes" {
        Some(true)
    } else {
        None
    }
}

/// In-memory view of the registry file; writes go back to the file.
#[derive(Clone)]
pub struct PatientRegistry {
    path: PathBuf,
    records: Arc<DashMap<String, PatientRecord>>,
    // keeps file order stable across rewrites and serializes writers
    order: Arc<Mutex<Vec<String>>>,
}

impl PatientRegistry {
    /// A missing file is an empty registry.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let records: Vec<PatientRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| RegistryError::Format {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "patient registry file not found, starting empty");
                Vec::new()
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        let map = DashMap::new();
        let mut order = Vec::with_capacity(records.len());
        for record in records {
            if !map.contains_key(&record.patient_id) {
                order.push(record.patient_id.clone());
                map.insert(record.patient_id.clone(), record);
            }
        }
        info!(path = %path.display(), patients = order.len(), "loaded patient registry");

        Ok(Self {
            path,
            records: Arc::new(map),
            order: Arc::new(Mutex::new(order)),
        })
    }

    pub fn get(&self, patient_id: &str) -> Option<PatientRecord> {
        self.records.get(patient_id).map(|entry| entry.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds records whose id is not yet known and rewrites the file.
    /// Returns how many were added.
    pub async fn add(&self, new_records: Vec<PatientRecord>) -> Result<usize, RegistryError> {
        let mut order = self.order.lock().await;
        let mut added = Vec::new();
        for record in new_records {
            if self.records.contains_key(&record.patient_id) {
                continue;
            }
            order.push(record.patient_id.clone());
            added.push(record.patient_id.clone());
            self.records.insert(record.patient_id.clone(), record);
        }

        if added.is_empty() {
            return Ok(0);
        }

        let snapshot: Vec<PatientRecord> = order.iter().filter_map(|id| self.get(id)).collect();
        if let Err(e) = self.persist(&snapshot).await {
            // keep memory consistent with the file
            for id in &added {
                self.records.remove(id);
            }
            order.retain(|id| !added.contains(id));
            return Err(e);
        }

        info!(added = added.len(), total = order.len(), "patient registry updated");
        Ok(added.len())
    }

    async fn persist(&self, records: &[PatientRecord]) -> Result<(), RegistryError> {
        let io_error = |source| RegistryError::Io {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(records).map_err(|source| RegistryError::Format {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(&self.path, json).await.map_err(io_error)
    }
}
