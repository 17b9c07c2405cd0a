//! Durable queue of object ids awaiting full-text (re)indexing.

use log::debug;

use super::common::{CommonStore, QueueStamp, FULLTEXT_QUEUE};
use crate::context::Context;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: String,
    pub stamp: QueueStamp,
}

impl CommonStore {
    /// Adds or refreshes ids. A refreshed id survives an in-flight drain.
    pub fn add_to_index_queue(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp_millis();
        self.kv.write(|w| {
            for id in ids {
                let stamp = QueueStamp {
                    timestamp_ms: now,
                    seq: self.next_seq(),
                };
                w.put_json(FULLTEXT_QUEUE, id.as_bytes(), &stamp)?;
            }
            Ok(())
        })
    }

    /// Up to `limit` entries; 0 means no limit.
    pub fn list_full_text_queue(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let raw = self.kv.scan_prefix(FULLTEXT_QUEUE, b"")?;
        let take = if limit == 0 { usize::MAX } else { limit };
        raw.into_iter()
            .take(take)
            .map(|(k, v)| {
                Ok(QueueEntry {
                    id: String::from_utf8_lossy(&k).into_owned(),
                    stamp: serde_json::from_slice(&v)?,
                })
            })
            .collect()
    }

    pub fn list_ids_from_full_text_queue(&self, limit: usize) -> Result<Vec<String>> {
        Ok(self.list_full_text_queue(limit)?.into_iter().map(|e| e.id).collect())
    }

    /// Idempotent.
    pub fn remove_ids_from_full_text_queue(&self, ids: &[String]) -> Result<()> {
        self.kv.write(|w| {
            for id in ids {
                w.delete(FULLTEXT_QUEUE, id.as_bytes())?;
            }
            Ok(())
        })
    }

    pub fn full_text_queue_len(&self) -> Result<usize> {
        self.kv.count(FULLTEXT_QUEUE)
    }

    /// Drains the queue in batches of `limit`, calling `process` for each.
    ///
    /// A batch whose `process` fails stays queued. After a successful batch
    /// only entries whose stamp is unchanged are removed, so ids re-added while
    /// `process` ran are picked up by the next drain.
    pub fn batch_process_full_text_queue(
        &self,
        ctx: &Context,
        limit: usize,
        mut process: impl FnMut(&[String]) -> Result<()>,
    ) -> Result<usize> {
        let mut processed = 0;
        let mut last_batch: Vec<QueueEntry> = Vec::new();
        loop {
            ctx.check()?;
            let batch = self.list_full_text_queue(limit)?;
            // Identical stamps mean nothing was removed; stop instead of spinning.
            if batch.is_empty() || batch == last_batch {
                return Ok(processed);
            }
            let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
            process(&ids)?;
            ctx.check()?;
            self.remove_processed(&batch)?;
            processed += ids.len();
            debug!("full-text queue batch of {} done", ids.len());
            last_batch = batch;
        }
    }

    fn remove_processed(&self, batch: &[QueueEntry]) -> Result<()> {
        self.kv.write(|w| {
            for entry in batch {
                let current: Option<QueueStamp> = w.get_json(FULLTEXT_QUEUE, entry.id.as_bytes())?;
                if current == Some(entry.stamp) {
                    w.delete(FULLTEXT_QUEUE, entry.id.as_bytes())?;
                }
            }
            Ok(())
        })
    }
}
