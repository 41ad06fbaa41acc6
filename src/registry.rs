//! In-memory registry of uploaded files
//!
//! Remembers where each upload ended up (object key and optional backup copy
//! in the storage channel). Entries are lost on restart; the bucket stays the
//! source of truth for listings.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_name: String,
    pub file_size: u64,
    pub storage_key: String,
    /// Message id of the backup copy in the storage channel
    pub channel_message_id: Option<i32>,
    pub uploaded_at: DateTime<Utc>,
}

impl FileRecord {
    #[must_use]
    pub fn new(file_name: impl Into<String>, file_size: u64, storage_key: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            storage_key: storage_key.into(),
            channel_message_id: None,
            uploaded_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_channel_message(mut self, message_id: Option<i32>) -> Self {
        self.channel_message_id = message_id;
        self
    }
}

#[derive(Debug, Default)]
pub struct FileRegistry {
    records: RwLock<HashMap<String, FileRecord>>,
}

impl FileRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record, replacing any previous one for the same key.
    pub fn insert(&self, record: FileRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.storage_key.clone(), record);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<FileRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<FileRecord> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Records under `prefix`, newest first
    #[must_use]
    pub fn for_user(&self, prefix: &str) -> Vec<FileRecord> {
        let mut records: Vec<FileRecord> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.storage_key.starts_with(prefix))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
