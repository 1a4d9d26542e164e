use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tt_domain::error::{Error, Result};

use crate::db::{db_err, now_ms, Store};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl CaptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Store(format!("unknown capture status {other:?}"))),
        }
    }
}

/// One conversation exchange to be enqueued.
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub session_id: String,
    pub user_message: String,
    pub assistant_response: String,
    pub channel: String,
}

/// A persisted outbox record.
#[derive(Debug, Clone, Serialize)]
pub struct PendingCapture {
    pub id: i64,
    pub session_id: String,
    pub user_message: String,
    pub assistant_response: String,
    pub channel: String,
    pub status: CaptureStatus,
    pub retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// State of a capture after a failed delivery attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub status: CaptureStatus,
    pub retries: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending_count: u64,
    pub sending_count: u64,
    pub sent_count: u64,
    pub failed_count: u64,
    /// Age of the oldest pending capture, in seconds.
    pub oldest_pending_age_secs: Option<u64>,
    /// Error recorded on the most recently failed capture.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sent_deleted: usize,
    pub failed_deleted: usize,
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

const COLUMNS: &str = "id, session_id, user_message, assistant_response, channel, \
                       status, retries, last_error, created_at, sent_at";

fn row_to_capture(row: &Row<'_>) -> rusqlite::Result<PendingCapture> {
    let status: String = row.get(5)?;
    let status = status.parse::<CaptureStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sent_at: Option<i64> = row.get(9)?;
    Ok(PendingCapture {
        id: row.get(0)?,
        session_id: row.get(1)?,
        user_message: row.get(2)?,
        assistant_response: row.get(3)?,
        channel: row.get(4)?,
        status,
        retries: row.get(6)?,
        last_error: row.get(7)?,
        created_at: ms_to_datetime(row.get(8)?),
        sent_at: sent_at.map(ms_to_datetime),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CaptureStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable outbox of conversation captures.
///
/// Status moves `pending -> sending -> sent`, or back to `pending` on a
/// failed attempt until `retries` reaches the caller's limit, at which
/// point it becomes `failed`. Every transition out of `sending` is
/// conditional on the row still being `sending`, so only the claimer
/// can settle it.
#[derive(Clone)]
pub struct CaptureStore {
    store: Store,
}

impl CaptureStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persist a capture as `pending` and return its id.
    pub fn enqueue(&self, capture: &NewCapture) -> Result<i64> {
        let now = now_ms();
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO pending_captures
                (session_id, user_message, assistant_response, channel, status,
                 retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
            params![
                capture.session_id,
                capture.user_message,
                capture.assistant_response,
                capture.channel,
                now,
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically move the oldest pending capture to `sending`.
    pub fn claim_next_pending(&self) -> Result<Option<PendingCapture>> {
        let mut conn = self.store.conn();
        let tx = conn.transaction().map_err(db_err)?;

        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM pending_captures WHERE status = 'pending'
                 ORDER BY created_at, id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(id) = id else {
            return Ok(None);
        };

        let claimed = tx
            .execute(
                "UPDATE pending_captures SET status = 'sending', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_ms()],
            )
            .map_err(db_err)?;
        if claimed == 0 {
            return Ok(None);
        }

        let capture = tx
            .query_row(
                &format!("SELECT {COLUMNS} FROM pending_captures WHERE id = ?1"),
                [id],
                row_to_capture,
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(Some(capture))
    }

    /// `sending -> sent`. Returns false if the row was not in `sending`.
    pub fn mark_sent(&self, id: i64) -> Result<bool> {
        let now = now_ms();
        let n = self
            .store
            .conn()
            .execute(
                "UPDATE pending_captures
                 SET status = 'sent', sent_at = ?2, updated_at = ?2, last_error = NULL
                 WHERE id = ?1 AND status = 'sending'",
                params![id, now],
            )
            .map_err(db_err)?;
        Ok(n == 1)
    }

    /// Count a failed attempt. The capture goes back to `pending`, or to
    /// `failed` once its retry count reaches `max_retries`.
    pub fn record_failure(&self, id: i64, error: &str, max_retries: u32) -> Result<FailureOutcome> {
        let conn = self.store.conn();
        let n = conn
            .execute(
                "UPDATE pending_captures
                 SET retries = retries + 1,
                     last_error = ?2,
                     updated_at = ?4,
                     status = CASE WHEN retries + 1 >= ?3 THEN 'failed' ELSE 'pending' END
                 WHERE id = ?1 AND status = 'sending'",
                params![id, error, max_retries, now_ms()],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(Error::Store(format!("capture {id} is not being sent")));
        }
        conn.query_row(
            "SELECT status, retries FROM pending_captures WHERE id = ?1",
            [id],
            |row| {
                let status: String = row.get(0)?;
                let retries: u32 = row.get(1)?;
                Ok((status, retries))
            },
        )
        .map_err(db_err)
        .and_then(|(status, retries)| {
            Ok(FailureOutcome {
                status: status.parse()?,
                retries,
            })
        })
    }

    /// `sending -> pending` without counting an attempt. Used when a
    /// claimed capture could not be attempted at all.
    pub fn release_claim(&self, id: i64) -> Result<bool> {
        let n = self
            .store
            .conn()
            .execute(
                "UPDATE pending_captures SET status = 'pending', updated_at = ?2
                 WHERE id = ?1 AND status = 'sending'",
                params![id, now_ms()],
            )
            .map_err(db_err)?;
        Ok(n == 1)
    }

    /// Reset every `sending` row to `pending`. Run once at startup, before
    /// the processor starts, to recover from a crash mid-delivery.
    pub fn recover_stuck_sending(&self) -> Result<usize> {
        let n = self
            .store
            .conn()
            .execute(
                "UPDATE pending_captures SET status = 'pending', updated_at = ?1
                 WHERE status = 'sending'",
                [now_ms()],
            )
            .map_err(db_err)?;
        if n > 0 {
            tracing::warn!(count = n, "recovered captures stuck in sending");
        }
        Ok(n)
    }

    /// Delete terminal captures older than their retention window.
    pub fn sweep(&self, sent_retention: Duration, failed_retention: Duration) -> Result<SweepReport> {
        let now = now_ms();
        let sent_cutoff = now - sent_retention.as_millis() as i64;
        let failed_cutoff = now - failed_retention.as_millis() as i64;
        let conn = self.store.conn();
        let sent_deleted = conn
            .execute(
                "DELETE FROM pending_captures WHERE status = 'sent' AND sent_at <= ?1",
                [sent_cutoff],
            )
            .map_err(db_err)?;
        let failed_deleted = conn
            .execute(
                "DELETE FROM pending_captures WHERE status = 'failed' AND updated_at <= ?1",
                [failed_cutoff],
            )
            .map_err(db_err)?;
        Ok(SweepReport {
            sent_deleted,
            failed_deleted,
        })
    }

    /// Oldest-first view of pending captures. Never includes failed ones.
    pub fn get_pending(&self, limit: usize) -> Result<Vec<PendingCapture>> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM pending_captures WHERE status = 'pending'
                 ORDER BY created_at, id LIMIT ?1"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([limit as i64], row_to_capture)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn get(&self, id: i64) -> Result<Option<PendingCapture>> {
        self.store
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM pending_captures WHERE id = ?1"),
                [id],
                row_to_capture,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.store.conn();
        let mut stats = QueueStats::default();
        {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM pending_captures GROUP BY status")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))
                .map_err(db_err)?;
            for row in rows {
                let (status, count) = row.map_err(db_err)?;
                match status.as_str() {
                    "pending" => stats.pending_count = count,
                    "sending" => stats.sending_count = count,
                    "sent" => stats.sent_count = count,
                    "failed" => stats.failed_count = count,
                    _ => {}
                }
            }
        }
        let oldest: Option<i64> = conn
            .query_row(
                "SELECT MIN(created_at) FROM pending_captures WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        stats.oldest_pending_age_secs =
            oldest.map(|created| ((now_ms() - created).max(0) / 1000) as u64);
        stats.last_error = conn
            .query_row(
                "SELECT last_error FROM pending_captures WHERE status = 'failed'
                 ORDER BY updated_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .flatten();
        Ok(stats)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(n: usize) -> NewCapture {
        NewCapture {
            session_id: format!("turn-{n}"),
            user_message: format!("question {n}"),
            assistant_response: format!("answer {n}"),
            channel: "telegram:42".into(),
        }
    }

    fn fresh() -> CaptureStore {
        CaptureStore::new(Store::open_in_memory().unwrap())
    }

    #[test]
    fn enqueue_then_claim_oldest_first() {
        let store = fresh();
        let a = store.enqueue(&capture(1)).unwrap();
        let b = store.enqueue(&capture(2)).unwrap();

        let first = store.claim_next_pending().unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.status, CaptureStatus::Sending);
        let second = store.claim_next_pending().unwrap().unwrap();
        assert_eq!(second.id, b);
        assert!(store.claim_next_pending().unwrap().is_none());
    }

    #[test]
    fn mark_sent_requires_claim() {
        let store = fresh();
        let id = store.enqueue(&capture(1)).unwrap();
        assert!(!store.mark_sent(id).unwrap(), "pending row cannot be marked sent");

        store.claim_next_pending().unwrap();
        assert!(store.mark_sent(id).unwrap());
        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.status, CaptureStatus::Sent);
        assert!(row.sent_at.is_some());
        assert!(!store.mark_sent(id).unwrap(), "second settle is a no-op");
    }

    #[test]
    fn failures_return_to_pending_until_limit() {
        let store = fresh();
        let id = store.enqueue(&capture(1)).unwrap();

        for attempt in 1..3 {
            store.claim_next_pending().unwrap().unwrap();
            let out = store.record_failure(id, "connection refused", 3).unwrap();
            assert_eq!(out.status, CaptureStatus::Pending);
            assert_eq!(out.retries, attempt);
        }

        store.claim_next_pending().unwrap().unwrap();
        let out = store.record_failure(id, "connection refused", 3).unwrap();
        assert_eq!(out.status, CaptureStatus::Failed);
        assert_eq!(out.retries, 3);

        assert!(store.get_pending(10).unwrap().is_empty());
        assert!(store.claim_next_pending().unwrap().is_none());
        let stats = store.stats().unwrap();
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn record_failure_rejects_unclaimed_rows() {
        let store = fresh();
        let id = store.enqueue(&capture(1)).unwrap();
        assert!(matches!(
            store.record_failure(id, "x", 3),
            Err(Error::Store(_))
        ));
        assert_eq!(store.get(id).unwrap().unwrap().retries, 0);
    }

    #[test]
    fn release_claim_does_not_count_an_attempt() {
        let store = fresh();
        let id = store.enqueue(&capture(1)).unwrap();
        store.claim_next_pending().unwrap();
        assert!(store.release_claim(id).unwrap());
        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.status, CaptureStatus::Pending);
        assert_eq!(row.retries, 0);
    }

    #[test]
    fn recover_resets_stuck_rows() {
        let store = fresh();
        store.enqueue(&capture(1)).unwrap();
        store.enqueue(&capture(2)).unwrap();
        store.claim_next_pending().unwrap();
        store.claim_next_pending().unwrap();
        assert_eq!(store.stats().unwrap().sending_count, 2);

        assert_eq!(store.recover_stuck_sending().unwrap(), 2);
        let stats = store.stats().unwrap();
        assert_eq!(stats.sending_count, 0);
        assert_eq!(stats.pending_count, 2);
    }

    #[test]
    fn sweep_uses_separate_windows() {
        let store = fresh();
        let sent = store.enqueue(&capture(1)).unwrap();
        let failed = store.enqueue(&capture(2)).unwrap();
        let pending = store.enqueue(&capture(3)).unwrap();

        store.claim_next_pending().unwrap();
        store.mark_sent(sent).unwrap();
        store.claim_next_pending().unwrap();
        store.record_failure(failed, "boom", 1).unwrap();

        // Backdate both terminal rows by two hours.
        let two_hours_ago = now_ms() - 2 * 3600 * 1000;
        store
            .store
            .conn()
            .execute(
                "UPDATE pending_captures SET sent_at = ?1, updated_at = ?1
                 WHERE id IN (?2, ?3)",
                params![two_hours_ago, sent, failed],
            )
            .unwrap();

        let report = store
            .sweep(Duration::from_secs(3600), Duration::from_secs(24 * 3600))
            .unwrap();
        assert_eq!(report.sent_deleted, 1);
        assert_eq!(report.failed_deleted, 0);
        assert!(store.get(sent).unwrap().is_none());
        assert!(store.get(failed).unwrap().is_some());
        assert!(store.get(pending).unwrap().is_some());
    }

    #[test]
    fn stats_report_oldest_pending_age() {
        let store = fresh();
        assert!(store.stats().unwrap().oldest_pending_age_secs.is_none());
        let id = store.enqueue(&capture(1)).unwrap();
        store
            .store
            .conn()
            .execute(
                "UPDATE pending_captures SET created_at = ?1 WHERE id = ?2",
                params![now_ms() - 90_000, id],
            )
            .unwrap();
        let age = store.stats().unwrap().oldest_pending_age_secs.unwrap();
        assert!((89..=91).contains(&age));
    }

    #[test]
    fn concurrent_claims_never_share_a_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = CaptureStore::new(Store::open(&dir.path().join("t.db")).unwrap());
        for n in 0..20 {
            store.enqueue(&capture(n)).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Some(c) = store.claim_next_pending().unwrap() {
                        ids.push(c.id);
                    }
                    ids
                })
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 20);
        assert_eq!(all.len(), 20);
    }
}
