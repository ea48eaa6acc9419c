//! Keyed trial record store: the trait the reconciler talks to, plus an
//! in-memory map and a one-document-per-trial JSON directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use dermsync_core::{Field, TrialId, TrialRecord, UNAVAILABLE};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no stored record for {0}")]
    NotFound(TrialId),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable document {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Record fields that `find` can filter on by text equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupField {
    Identifier,
    Source,
    Title,
    OverallStatus,
    LinkedEudract,
}

impl LookupField {
    /// Text of this field on `record`; unavailable values read as [`UNAVAILABLE`].
    pub fn text_of(&self, record: &TrialRecord) -> String {
        match self {
            LookupField::Identifier => record.identifier.to_string(),
            LookupField::Source => record.source.to_string(),
            LookupField::Title => record.title.to_string(),
            LookupField::OverallStatus => record.overall_status.to_string(),
            LookupField::LinkedEudract => match &record.linked_eudract {
                Field::Available(id) => id.to_string(),
                Field::Unavailable => UNAVAILABLE.to_string(),
            },
        }
    }

    pub fn matches(&self, record: &TrialRecord, value: &str) -> bool {
        self.text_of(record) == value
    }
}

impl FromStr for LookupField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "identifier" | "id" => Ok(LookupField::Identifier),
            "source" => Ok(LookupField::Source),
            "title" => Ok(LookupField::Title),
            "overall_status" | "status" => Ok(LookupField::OverallStatus),
            "linked_eudract" | "eudract" => Ok(LookupField::LinkedEudract),
            other => Err(format!("unknown lookup field: {other}")),
        }
    }
}

/// Partial update. Only the fields set here are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub overall_status: Option<Field<String>>,
}

impl RecordPatch {
    pub fn status(status: Field<String>) -> Self {
        Self {
            overall_status: Some(status),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.overall_status.is_none()
    }

    pub fn apply(&self, record: &mut TrialRecord) {
        if let Some(status) = &self.overall_status {
            record.overall_status = status.clone();
        }
    }
}

/// Document store keyed by trial identifier.
pub trait RecordStore {
    fn get(&self, id: &TrialId) -> Result<Option<TrialRecord>, StoreError>;

    fn find(&self, field: LookupField, value: &str) -> Result<Vec<TrialRecord>, StoreError>;

    /// Create-or-replace keyed by `record.identifier`.
    fn put(&mut self, record: &TrialRecord) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] when nothing is stored under `id`.
    fn patch(&mut self, id: &TrialId, patch: &RecordPatch) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] when nothing is stored under `id`.
    fn delete(&mut self, id: &TrialId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: BTreeMap<TrialId, TrialRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &TrialRecord> {
        self.records.values()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, id: &TrialId) -> Result<Option<TrialRecord>, StoreError> {
        Ok(self.records.get(id).cloned())
    }

    fn find(&self, field: LookupField, value: &str) -> Result<Vec<TrialRecord>, StoreError> {
        Ok(self
            .records
            .values()
            .filter(|r| field.matches(r, value))
            .cloned()
            .collect())
    }

    fn put(&mut self, record: &TrialRecord) -> Result<(), StoreError> {
        self.records.insert(record.identifier.clone(), record.clone());
        Ok(())
    }

    fn patch(&mut self, id: &TrialId, patch: &RecordPatch) -> Result<(), StoreError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        patch.apply(record);
        Ok(())
    }

    fn delete(&mut self, id: &TrialId) -> Result<(), StoreError> {
        self.records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

/// One pretty-printed JSON document per trial under `<root>/<collection>/`.
/// Writes go through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct JsonDocumentStore {
    dir: PathBuf,
}

impl JsonDocumentStore {
    pub fn open(root: impl AsRef<Path>, collection: &str) -> Result<Self, StoreError> {
        let dir = root.as_ref().join(collection);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn document_path(&self, id: &TrialId) -> PathBuf {
        let key = id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>();
        self.dir.join(format!("{key}.json"))
    }

    fn read_document(&self, path: &Path) -> Result<Option<TrialRecord>, StoreError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    fn write_document(&self, record: &TrialRecord) -> Result<(), StoreError> {
        let path = self.document_path(&record.identifier);
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let temp_path = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let io_err = |source| StoreError::Io {
            path: temp_path.clone(),
            source,
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io { path, source });
        }
        debug!(id = %record.identifier, path = %path.display(), "wrote trial document");
        Ok(())
    }
}

impl RecordStore for JsonDocumentStore {
    fn get(&self, id: &TrialId) -> Result<Option<TrialRecord>, StoreError> {
        self.read_document(&self.document_path(id))
    }

    fn find(&self, field: LookupField, value: &str) -> Result<Vec<TrialRecord>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut paths = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut out = Vec::new();
        for path in paths {
            if let Some(record) = self.read_document(&path)? {
                if field.matches(&record, value) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    fn put(&mut self, record: &TrialRecord) -> Result<(), StoreError> {
        self.write_document(record)
    }

    fn patch(&mut self, id: &TrialId, patch: &RecordPatch) -> Result<(), StoreError> {
        let mut record = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        patch.apply(&mut record);
        self.write_document(&record)
    }

    fn delete(&mut self, id: &TrialId) -> Result<(), StoreError> {
        let path = self.document_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id.clone())),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}
