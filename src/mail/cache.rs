//! On-disk cache of fetched message headers, one JSON file per mailbox.
//!
//! Entries expire purely by age; nothing on the server side invalidates them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::RemoteMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFile {
    /// Milliseconds since the Unix epoch at write time.
    pub timestamp: i64,
    pub messages: Vec<RemoteMessage>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub cached: bool,
    pub fresh: bool,
    pub age_seconds: Option<i64>,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct MailCache {
    dir: PathBuf,
    ttl: Duration,
}

impl MailCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    fn path_for(&self, mailbox_id: i64) -> PathBuf {
        self.dir.join(format!("{}.json", mailbox_id))
    }

    fn is_fresh(&self, entry: &CacheFile, now_ms: i64) -> bool {
        let age = now_ms.saturating_sub(entry.timestamp);
        age >= 0 && (age as u128) < self.ttl.as_millis()
    }

    async fn read(&self, mailbox_id: i64) -> Result<Option<CacheFile>> {
        let path = self.path_for(mailbox_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        match serde_json::from_slice::<CacheFile>(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                warn!(?err, path = %path.display(), "discarding unreadable cache file");
                Ok(None)
            }
        }
    }

    /// Cached messages for a mailbox if the entry is younger than the TTL.
    pub async fn read_fresh(&self, mailbox_id: i64) -> Result<Option<Vec<RemoteMessage>>> {
        let now_ms = Utc::now().timestamp_millis();
        Ok(self
            .read(mailbox_id)
            .await?
            .filter(|entry| self.is_fresh(entry, now_ms))
            .map(|entry| entry.messages))
    }

    pub async fn write(&self, mailbox_id: i64, messages: &[RemoteMessage]) -> Result<()> {
        self.write_entry(
            mailbox_id,
            &CacheFile {
                timestamp: Utc::now().timestamp_millis(),
                messages: messages.to_vec(),
            },
        )
        .await
    }

    async fn write_entry(&self, mailbox_id: i64, entry: &CacheFile) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create cache dir: {}", self.dir.display()))?;
        let path = self.path_for(mailbox_id);
        // each writer gets its own temp file; the rename is the only shared step
        let tmp = self
            .dir
            .join(format!("{}.{}.tmp", mailbox_id, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec(entry)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("failed to replace {}", path.display()));
        }
        debug!(mailbox_id, count = entry.messages.len(), "cache written");
        Ok(())
    }

    /// Flag a cached message as seen without touching the entry's age.
    pub async fn mark_seen(&self, mailbox_id: i64, uid: u32) -> Result<()> {
        let Some(mut entry) = self.read(mailbox_id).await? else {
            return Ok(());
        };
        let mut changed = false;
        for m in entry.messages.iter_mut().filter(|m| m.uid == uid && !m.seen) {
            m.seen = true;
            changed = true;
        }
        if changed {
            self.write_entry(mailbox_id, &entry).await?;
        }
        Ok(())
    }

    pub async fn invalidate(&self, mailbox_id: i64) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(mailbox_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every cache file. Used after restores and resets, when mailbox ids
    /// may now point at different accounts.
    pub async fn clear_all(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        debug!(removed, "cache cleared");
        Ok(removed)
    }

    pub async fn status(&self, mailbox_id: i64) -> Result<CacheStatus> {
        let now_ms = Utc::now().timestamp_millis();
        Ok(match self.read(mailbox_id).await? {
            Some(entry) => CacheStatus {
                cached: true,
                fresh: self.is_fresh(&entry, now_ms),
                age_seconds: Some(now_ms.saturating_sub(entry.timestamp) / 1000),
                count: entry.messages.len(),
            },
            None => CacheStatus {
                cached: false,
                fresh: false,
                age_seconds: None,
                count: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn msg(uid: u32) -> RemoteMessage {
        RemoteMessage {
            uid,
            message_id: None,
            subject: format!("subject {}", uid),
            sender: "a@b.c".into(),
            date: None,
            seen: false,
            flagged: false,
        }
    }

    #[tokio::test]
    async fn write_then_read_fresh() {
        let td = tempdir().unwrap();
        let cache = MailCache::new(td.path().join("cache"), Duration::from_secs(300));
        assert!(cache.read_fresh(1).await.unwrap().is_none());

        cache.write(1, &[msg(5), msg(4)]).await.unwrap();
        let got = cache.read_fresh(1).await.unwrap().unwrap();
        assert_eq!(got.len(), 2);
        assert!(td.path().join("cache").join("1.json").exists());

        let status = cache.status(1).await.unwrap();
        assert!(status.cached && status.fresh);
        assert_eq!(status.count, 2);
    }

    #[tokio::test]
    async fn stale_entries_are_ignored() {
        let td = tempdir().unwrap();
        let cache = MailCache::new(td.path(), Duration::from_secs(60));
        let old = CacheFile {
            timestamp: Utc::now().timestamp_millis() - 61_000,
            messages: vec![msg(1)],
        };
        cache.write_entry(3, &old).await.unwrap();
        assert!(cache.read_fresh(3).await.unwrap().is_none());
        let status = cache.status(3).await.unwrap();
        assert!(status.cached);
        assert!(!status.fresh);
    }

    #[tokio::test]
    async fn mark_seen_and_invalidate() {
        let td = tempdir().unwrap();
        let cache = MailCache::new(td.path(), Duration::from_secs(60));
        cache.write(2, &[msg(7), msg(8)]).await.unwrap();
        cache.mark_seen(2, 8).await.unwrap();
        let got = cache.read_fresh(2).await.unwrap().unwrap();
        assert!(got.iter().find(|m| m.uid == 8).unwrap().seen);
        assert!(!got.iter().find(|m| m.uid == 7).unwrap().seen);

        assert!(cache.invalidate(2).await.unwrap());
        assert!(!cache.invalidate(2).await.unwrap());
        cache.mark_seen(2, 8).await.unwrap();
    }

    #[tokio::test]
    async fn clear_all_removes_every_entry() {
        let td = tempdir().unwrap();
        let cache = MailCache::new(td.path().join("c"), Duration::from_secs(60));
        assert_eq!(cache.clear_all().await.unwrap(), 0);
        cache.write(1, &[msg(1)]).await.unwrap();
        cache.write(2, &[msg(2)]).await.unwrap();
        assert_eq!(cache.clear_all().await.unwrap(), 2);
        assert!(!cache.status(1).await.unwrap().cached);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_miss() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("9.json"), b"{not json").unwrap();
        let cache = MailCache::new(td.path(), Duration::from_secs(60));
        assert!(cache.read_fresh(9).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_leave_a_readable_entry() {
        let td = tempdir().unwrap();
        let cache = MailCache::new(td.path().join("cache"), Duration::from_secs(300));
        let tasks: Vec<_> = (0..16u32)
            .map(|n| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.write(3, &[msg(n), msg(n + 100)]).await })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let got = cache.read_fresh(3).await.unwrap().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].uid, got[0].uid + 100);
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(td.path().join("cache")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["3.json".to_string()]);
    }
}
