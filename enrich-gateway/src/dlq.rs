use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::prelude::*;
use thiserror::Error;
use uuid::Uuid;

use enrich_common::types::{DlqMessage, DlqState};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DlqError {
    #[error("dead letter message not found: {0}")]
    NotFound(Uuid),
    #[error("dead letter message {0} is archived and read-only")]
    Archived(Uuid),
}

struct Inner {
    messages: HashMap<Uuid, DlqMessage>,
    /// Subject key -> message ids, for lookup by subject.
    by_subject: HashMap<String, Vec<Uuid>>,
}

/// Holding area for enrichment runs that produced nothing. Active messages
/// are replayed (by sweep or operator) and never expire; archived ones are
/// read-only, excluded from sweeps, and purged after the retention window.
pub struct DeadLetterQueue {
    max_retries: u32,
    inner: RwLock<Inner>,
}

impl DeadLetterQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            inner: RwLock::new(Inner {
                messages: HashMap::new(),
                by_subject: HashMap::new(),
            }),
        }
    }

    pub fn enqueue(&self, message: DlqMessage) -> Uuid {
        let mut inner = self.inner.write().expect("poisoned dlq lock");
        let id = message.id;
        inner
            .by_subject
            .entry(message.request.subject_key.clone())
            .or_default()
            .push(id);
        inner.messages.insert(id, message);
        metrics::gauge!("dlq_active_messages").set(active_count(&inner) as f64);
        id
    }

    pub fn message(&self, id: Uuid) -> Option<DlqMessage> {
        let inner = self.inner.read().expect("poisoned dlq lock");
        inner.messages.get(&id).cloned()
    }

    /// All messages in `state`, oldest first.
    pub fn list(&self, state: DlqState) -> Vec<DlqMessage> {
        let inner = self.inner.read().expect("poisoned dlq lock");
        let mut messages: Vec<DlqMessage> = inner
            .messages
            .values()
            .filter(|message| message.state == state)
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.enqueued_at);
        messages
    }

    pub fn for_subject(&self, subject_key: &str) -> Vec<DlqMessage> {
        let inner = self.inner.read().expect("poisoned dlq lock");
        inner
            .by_subject
            .get(subject_key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.messages.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark the start of a replay attempt: bumps the retry counter. Archived
    /// messages cannot be replayed.
    pub fn begin_replay(&self, id: Uuid) -> Result<DlqMessage, DlqError> {
        let mut inner = self.inner.write().expect("poisoned dlq lock");
        let message = inner.messages.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if message.state == DlqState::Archived {
            return Err(DlqError::Archived(id));
        }
        message.retry_count += 1;
        Ok(message.clone())
    }

    /// Successful replay: the message leaves the queue for good.
    pub fn resolve(&self, id: Uuid) -> Result<(), DlqError> {
        let mut inner = self.inner.write().expect("poisoned dlq lock");
        let message = inner.messages.remove(&id).ok_or(DlqError::NotFound(id))?;
        if let Some(ids) = inner.by_subject.get_mut(&message.request.subject_key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                inner.by_subject.remove(&message.request.subject_key);
            }
        }
        metrics::gauge!("dlq_active_messages").set(active_count(&inner) as f64);
        Ok(())
    }

    /// Failed replay: archive once the retry budget is spent, otherwise the
    /// message stays active for the next sweep.
    pub fn record_failed_replay(&self, id: Uuid) -> Result<DlqState, DlqError> {
        let mut inner = self.inner.write().expect("poisoned dlq lock");
        let max_retries = self.max_retries;
        let message = inner.messages.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if message.retry_count >= max_retries {
            message.state = DlqState::Archived;
        }
        let state = message.state;
        metrics::gauge!("dlq_active_messages").set(active_count(&inner) as f64);
        Ok(state)
    }

    /// Archived messages older than the retention window. Active messages
    /// are never listed: they must not silently expire.
    pub fn list_expired(&self, retention: Duration) -> Vec<DlqMessage> {
        let cutoff = cutoff(retention);
        self.list(DlqState::Archived)
            .into_iter()
            .filter(|message| message.enqueued_at < cutoff)
            .collect()
    }

    /// Drop archived messages past retention. Returns how many were purged.
    pub fn purge_expired(&self, retention: Duration) -> usize {
        let expired: Vec<Uuid> = self
            .list_expired(retention)
            .into_iter()
            .map(|message| message.id)
            .collect();

        let mut inner = self.inner.write().expect("poisoned dlq lock");
        let mut purged = 0;
        for id in expired {
            if let Some(message) = inner.messages.remove(&id) {
                if let Some(ids) = inner.by_subject.get_mut(&message.request.subject_key) {
                    ids.retain(|other| *other != id);
                    if ids.is_empty() {
                        inner.by_subject.remove(&message.request.subject_key);
                    }
                }
                purged += 1;
            }
        }
        purged
    }
}

fn active_count(inner: &Inner) -> usize {
    inner
        .messages
        .values()
        .filter(|message| message.state == DlqState::Active)
        .count()
}

fn cutoff(retention: Duration) -> DateTime<Utc> {
    Utc::now()
        - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::max_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_common::types::{EnrichmentRequest, FieldMap};

    fn message(subject: &str) -> DlqMessage {
        DlqMessage::new(
            EnrichmentRequest::new(subject.to_string(), FieldMap::new(), 0.8),
            vec![],
            "waterfall exhausted with zero fields",
        )
    }

    #[test]
    fn resolve_removes_the_message_and_its_index_entry() {
        let dlq = DeadLetterQueue::new(3);
        let id = dlq.enqueue(message("subject-a"));

        assert_eq!(dlq.for_subject("subject-a").len(), 1);
        dlq.resolve(id).unwrap();
        assert!(dlq.message(id).is_none());
        assert!(dlq.for_subject("subject-a").is_empty());
    }

    #[test]
    fn replay_attempts_bump_the_retry_counter() {
        let dlq = DeadLetterQueue::new(3);
        let id = dlq.enqueue(message("subject-a"));

        assert_eq!(dlq.begin_replay(id).unwrap().retry_count, 1);
        assert_eq!(dlq.begin_replay(id).unwrap().retry_count, 2);
    }

    #[test]
    fn messages_archive_after_the_retry_budget() {
        let dlq = DeadLetterQueue::new(2);
        let id = dlq.enqueue(message("subject-a"));

        dlq.begin_replay(id).unwrap();
        assert_eq!(dlq.record_failed_replay(id).unwrap(), DlqState::Active);
        dlq.begin_replay(id).unwrap();
        assert_eq!(dlq.record_failed_replay(id).unwrap(), DlqState::Archived);

        // Archived messages are read-only and excluded from replay.
        assert_eq!(dlq.begin_replay(id), Err(DlqError::Archived(id)));
        assert!(dlq.message(id).is_some());
        assert_eq!(dlq.list(DlqState::Active).len(), 0);
        assert_eq!(dlq.list(DlqState::Archived).len(), 1);
    }

    #[test]
    fn retention_only_ever_purges_archived_messages() {
        let dlq = DeadLetterQueue::new(0);
        let active_id = dlq.enqueue(message("subject-a"));
        let archived_id = dlq.enqueue(message("subject-b"));

        // Exhaust subject-b immediately (max_retries = 0).
        dlq.begin_replay(archived_id).unwrap();
        dlq.record_failed_replay(archived_id).unwrap();

        // Zero retention: everything archived is already expired.
        assert_eq!(dlq.list_expired(Duration::ZERO).len(), 1);
        assert_eq!(dlq.purge_expired(Duration::ZERO), 1);

        assert!(dlq.message(archived_id).is_none());
        assert!(dlq.message(active_id).is_some());
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let dlq = DeadLetterQueue::new(3);
        let id = Uuid::now_v7();
        assert_eq!(dlq.begin_replay(id), Err(DlqError::NotFound(id)));
        assert_eq!(dlq.resolve(id), Err(DlqError::NotFound(id)));
    }
}
