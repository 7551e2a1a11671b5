//! Append-only JSON-lines log.

use std::marker::PhantomData;
use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

/// An ordered, append-only sequence of `T` backed by one file.
///
/// Entries are never rewritten. A trailing line left incomplete by a crash
/// mid-append is ignored on read.
pub struct AppendLog<T> {
    path: PathBuf,
    _entry: PhantomData<fn() -> T>,
}

impl<T> AppendLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _entry: PhantomData,
        }
    }

    #[cfg(test)]
    fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Read every entry in order. A missing file is an empty log.
    pub async fn read_all(&self) -> Result<Vec<T>, StoreError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let complete = raw.ends_with('\n');
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i + 1 == lines.len() && !complete => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Skipping incomplete trailing log entry"
                    );
                }
                Err(e) => {
                    return Err(StoreError::Serialization {
                        path: self.path.display().to_string(),
                        reason: format!("line {}: {e}", i + 1),
                    });
                }
            }
        }

        Ok(entries)
    }

    /// Number of durable entries.
    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read_all().await?.len())
    }

    /// Append one entry and flush it to disk.
    pub async fn append(&self, entry: &T) -> Result<(), StoreError> {
        self.append_many(std::slice::from_ref(entry)).await
    }

    /// Append the entries of `all` beyond what is already durable, assuming
    /// the log is a prefix of `all`. Returns how many were written.
    pub async fn append_missing(&self, all: &[T]) -> Result<usize, StoreError> {
        let durable = self.len().await?;
        if durable > all.len() {
            tracing::warn!(
                path = %self.path.display(),
                durable,
                held = all.len(),
                "Log on disk is ahead of the in-memory copy"
            );
            return Ok(0);
        }
        let missing = &all[durable..];
        self.append_many(missing).await?;
        Ok(missing.len())
    }

    async fn append_many(&self, entries: &[T]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for entry in entries {
            let line = serde_json::to_string(entry).map_err(|e| StoreError::Serialization {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
            buf.push_str(&line);
            buf.push('\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        n: u32,
    }

    fn log(dir: &tempfile::TempDir) -> AppendLog<Entry> {
        AppendLog::new(dir.path().join("log.jsonl"))
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(log(&dir).read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(&dir);
        for n in 0..3 {
            log.append(&Entry { n }).await.unwrap();
        }
        let entries = log.read_all().await.unwrap();
        assert_eq!(entries, vec![Entry { n: 0 }, Entry { n: 1 }, Entry { n: 2 }]);
    }

    #[tokio::test]
    async fn append_missing_only_writes_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(&dir);
        log.append(&Entry { n: 0 }).await.unwrap();

        let held = vec![Entry { n: 0 }, Entry { n: 1 }, Entry { n: 2 }];
        assert_eq!(log.append_missing(&held).await.unwrap(), 2);
        assert_eq!(log.append_missing(&held).await.unwrap(), 0);
        assert_eq!(log.read_all().await.unwrap(), held);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(&dir);
        log.append(&Entry { n: 7 }).await.unwrap();
        let mut raw = std::fs::read_to_string(log.path()).unwrap();
        raw.push_str("{\"n\":");
        std::fs::write(log.path(), raw).unwrap();

        assert_eq!(log.read_all().await.unwrap(), vec![Entry { n: 7 }]);
    }

    #[tokio::test]
    async fn corrupt_inner_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(&dir);
        std::fs::write(log.path(), "garbage\n{\"n\":1}\n").unwrap();
        assert!(matches!(
            log.read_all().await,
            Err(StoreError::Serialization { .. })
        ));
    }
}
