//! File memory: append-only NDJSON with compaction.
//!
//! Each `add` appends one JSON line; `clear` compacts the file by
//! rewriting it without this scope's entries.  The whole file is the
//! shared backend, so multiple scoped instances over one path stay
//! isolated the same way the other variants do.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::{Memory, MemoryEntry, TenantScope};
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::RwLock;

/// NDJSON-file-backed memory.
pub struct FileMemory {
    path: PathBuf,
    // Serializes file access; the file itself is the source of truth.
    file_lock: Mutex<()>,
    scope: TenantScope,
    metadata: RwLock<Map<String, Value>>,
}

impl FileMemory {
    /// Open (creating if absent) the NDJSON file at `path`.
    pub fn open(path: impl Into<PathBuf>, scope: TenantScope) -> Result<Self, AiError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AiError::ConfigMissing(format!("cannot create {:?}: {}", parent, e)))?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AiError::ConfigMissing(format!("cannot open {:?}: {}", path, e)))?;
        Ok(FileMemory {
            path,
            file_lock: Mutex::new(()),
            scope,
            metadata: RwLock::new(Map::new()),
        })
    }

    fn read_entries(&self) -> Result<Vec<MemoryEntry>, AiError> {
        let file = File::open(&self.path)
            .map_err(|e| AiError::Protocol(format!("cannot read {:?}: {}", self.path, e)))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| AiError::Protocol(format!("read failed: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryEntry>(&line) {
                Ok(entry) => entries.push(entry),
                // A torn trailing line (crash mid-append) is skipped, not fatal.
                Err(e) => log::warn!("skipping corrupt memory line in {:?}: {}", self.path, e),
            }
        }
        Ok(entries)
    }

    fn write_entries(&self, entries: &[MemoryEntry]) -> Result<(), AiError> {
        let mut file = File::create(&self.path)
            .map_err(|e| AiError::Protocol(format!("cannot rewrite {:?}: {}", self.path, e)))?;
        for entry in entries {
            let line = serde_json::to_string(entry)
                .map_err(|e| AiError::Protocol(format!("encode failed: {}", e)))?;
            writeln!(file, "{}", line)
                .map_err(|e| AiError::Protocol(format!("write failed: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Memory for FileMemory {
    fn kind(&self) -> &str {
        "file"
    }

    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn add(&self, mut entry: MemoryEntry) -> Result<(), AiError> {
        self.scope.stamp(&mut entry.metadata);
        let line = serde_json::to_string(&entry)
            .map_err(|e| AiError::Protocol(format!("encode failed: {}", e)))?;
        let _guard = self.file_lock.lock().map_err(|_| {
            AiError::Protocol("file memory lock poisoned".into())
        })?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| AiError::Protocol(format!("cannot append {:?}: {}", self.path, e)))?;
        writeln!(file, "{}", line)
            .map_err(|e| AiError::Protocol(format!("append failed: {}", e)))?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<MemoryEntry>, AiError> {
        let _guard = self.file_lock.lock().map_err(|_| {
            AiError::Protocol("file memory lock poisoned".into())
        })?;
        Ok(self
            .read_entries()?
            .into_iter()
            .filter(|e| self.scope.matches(&e.metadata))
            .collect())
    }

    async fn clear(&self) -> Result<(), AiError> {
        let _guard = self.file_lock.lock().map_err(|_| {
            AiError::Protocol("file memory lock poisoned".into())
        })?;
        // Compaction: rewrite keeping only other tenants' entries.
        let remaining: Vec<MemoryEntry> = self
            .read_entries()?
            .into_iter()
            .filter(|e| !self.scope.matches(&e.metadata))
            .collect();
        self.write_entries(&remaining)
    }

    async fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().await.get(key).cloned()
    }

    async fn set_metadata(&self, key: &str, value: Value) {
        self.metadata.write().await.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omnillm::message::Role;

    #[tokio::test]
    async fn appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.ndjson");
        let mem = FileMemory::open(&path, TenantScope::default()).unwrap();

        mem.add(MemoryEntry::new(Role::User, "first")).await.unwrap();
        mem.add(MemoryEntry::new(Role::Assistant, "second")).await.unwrap();

        // A second instance over the same path sees the same entries.
        let reopened = FileMemory::open(&path, TenantScope::default()).unwrap();
        let all = reopened.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].content, "second");
    }

    #[tokio::test]
    async fn clear_compacts_only_this_scope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.ndjson");
        let mem_a = FileMemory::open(&path, TenantScope::new("a", "c")).unwrap();
        let mem_b = FileMemory::open(&path, TenantScope::new("b", "c")).unwrap();

        mem_a.add(MemoryEntry::new(Role::User, "blue")).await.unwrap();
        mem_b.add(MemoryEntry::new(Role::User, "red")).await.unwrap();

        mem_a.clear().await.unwrap();
        assert!(mem_a.get_all().await.unwrap().is_empty());
        assert_eq!(mem_b.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.ndjson");
        let mem = FileMemory::open(&path, TenantScope::default()).unwrap();
        mem.add(MemoryEntry::new(Role::User, "good")).await.unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{torn line").unwrap();
        }
        let all = mem.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
