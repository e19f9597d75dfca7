//! Persistent anomaly store.
//!
//! Records are stored once, keyed by `anomaly_id`, and never rewritten.
//! Resolution status lives in its own column and every change is appended
//! to `anomaly_transitions`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::detect::{AnomalyRecord, DetectError, ResolutionStatus};
use crate::sink::AnomalySink;
use crate::storage::Pool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("anomaly {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] DetectError),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row for {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// A stored record with its current lifecycle state.
#[derive(Debug, Clone, Serialize)]
pub struct StoredAnomaly {
    pub record: AnomalyRecord,
    pub status: ResolutionStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: ResolutionStatus,
    pub to: ResolutionStatus,
    pub changed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AnomalyStore {
    pool: Pool,
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

fn parse_status(id: &str, raw: &str) -> Result<ResolutionStatus, StoreError> {
    raw.parse().map_err(|reason| StoreError::Corrupt {
        id: id.to_string(),
        reason,
    })
}

type Row = (String, String, String, Option<String>);

impl AnomalyStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Store `record`. Returns `false` when the id is already present, in
    /// which case nothing changes.
    pub fn insert(&self, record: &AnomalyRecord) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let record_json = serde_json::to_string(record)?;
        let created_at = ts(record.created_at());

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO anomalies
                (anomaly_id, metric_name, severity, resolution_status, observed_at,
                 record_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                record.anomaly_id(),
                record.metric_name(),
                record.severity().as_str(),
                record.resolution_status().as_str(),
                ts(record.observed_at()),
                record_json,
                created_at,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get(&self, anomaly_id: &str) -> Result<StoredAnomaly, StoreError> {
        let conn = self.pool.get()?;
        let row: Option<Row> = conn
            .query_row(
                "SELECT anomaly_id, record_json, resolution_status, updated_at
                 FROM anomalies WHERE anomaly_id = ?1",
                [anomaly_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match row {
            Some(row) => Self::decode(row),
            None => Err(StoreError::NotFound(anomaly_id.to_string())),
        }
    }

    /// Newest first by observation time.
    pub fn list(
        &self,
        status: Option<ResolutionStatus>,
        limit: usize,
    ) -> Result<Vec<StoredAnomaly>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT anomaly_id, record_json, resolution_status, updated_at
             FROM anomalies
             WHERE ?1 IS NULL OR resolution_status = ?1
             ORDER BY observed_at DESC, anomaly_id ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let mut anomalies = Vec::new();
        for row in rows {
            anomalies.push(Self::decode(row?)?);
        }
        Ok(anomalies)
    }

    /// Move an anomaly to `to`, recording the change. Illegal moves leave
    /// the stored state untouched.
    pub fn transition(
        &self,
        anomaly_id: &str,
        to: ResolutionStatus,
    ) -> Result<StoredAnomaly, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT resolution_status FROM anomalies WHERE anomaly_id = ?1",
                [anomaly_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(StoreError::NotFound(anomaly_id.to_string()));
        };
        let from = parse_status(anomaly_id, &current)?;
        let to = from.transition_to(to)?;

        let now = ts(Utc::now());
        tx.execute(
            "UPDATE anomalies SET resolution_status = ?1, updated_at = ?2 WHERE anomaly_id = ?3",
            params![to.as_str(), now, anomaly_id],
        )?;
        tx.execute(
            "INSERT INTO anomaly_transitions (anomaly_id, from_status, to_status, changed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![anomaly_id, from.as_str(), to.as_str(), now],
        )?;
        tx.commit()?;

        info!(anomaly_id = %anomaly_id, %from, %to, "anomaly status changed");
        drop(conn);
        self.get(anomaly_id)
    }

    /// Status history, oldest first.
    pub fn transitions(&self, anomaly_id: &str) -> Result<Vec<Transition>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT from_status, to_status, changed_at FROM anomaly_transitions
             WHERE anomaly_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([anomaly_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut transitions = Vec::new();
        for row in rows {
            let (from, to, changed_at) = row?;
            transitions.push(Transition {
                from: parse_status(anomaly_id, &from)?,
                to: parse_status(anomaly_id, &to)?,
                changed_at: parse_ts(anomaly_id, &changed_at)?,
            });
        }
        Ok(transitions)
    }

    fn decode((id, record_json, status, updated_at): Row) -> Result<StoredAnomaly, StoreError> {
        let record: AnomalyRecord = serde_json::from_str(&record_json)?;
        let updated_at = match updated_at {
            Some(raw) => parse_ts(&id, &raw)?,
            None => record.created_at(),
        };
        Ok(StoredAnomaly {
            status: parse_status(&id, &status)?,
            record,
            updated_at,
        })
    }
}

#[async_trait]
impl AnomalySink for AnomalyStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn deliver(&self, record: &AnomalyRecord) -> anyhow::Result<()> {
        let store = self.clone();
        let owned = record.clone();
        let inserted = tokio::task::spawn_blocking(move || store.insert(&owned)).await??;
        if !inserted {
            debug!(anomaly_id = %record.anomaly_id(), "anomaly already stored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::record;
    use crate::storage::open_pool;

    fn store() -> (tempfile::TempDir, AnomalyStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("anomalies.db")).unwrap();
        (dir, AnomalyStore::new(pool))
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (_dir, store) = store();
        let r = record("active_requests", 0);

        assert!(store.insert(&r).unwrap());
        assert!(!store.insert(&r).unwrap());
        assert_eq!(store.list(None, 10).unwrap().len(), 1);

        let stored = store.get(r.anomaly_id()).unwrap();
        assert_eq!(stored.status, ResolutionStatus::Open);
        assert_eq!(stored.record.anomaly_id(), r.anomaly_id());
        assert_eq!(stored.record.deviation().percentage_change, 2460.0);
    }

    #[test]
    fn test_list_newest_first_with_status_filter() {
        let (_dir, store) = store();
        for secs in [0, 120, 60] {
            store.insert(&record("rps", secs)).unwrap();
        }
        let ids: Vec<String> = store
            .list(None, 10)
            .unwrap()
            .into_iter()
            .map(|a| a.record.anomaly_id().to_string())
            .collect();
        assert_eq!(
            ids,
            vec!["rps_1718000120.000000", "rps_1718000060.000000", "rps_1718000000.000000"]
        );

        store
            .transition("rps_1718000060.000000", ResolutionStatus::Resolved)
            .unwrap();
        let open = store.list(Some(ResolutionStatus::Open), 10).unwrap();
        assert_eq!(open.len(), 2);
        let resolved = store.list(Some(ResolutionStatus::Resolved), 10).unwrap();
        assert_eq!(resolved[0].record.anomaly_id(), "rps_1718000060.000000");
        assert_eq!(store.list(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_lifecycle_with_audit_trail() {
        let (_dir, store) = store();
        let r = record("active_requests", 0);
        store.insert(&r).unwrap();
        let id = r.anomaly_id();

        let acked = store.transition(id, ResolutionStatus::Acknowledged).unwrap();
        assert_eq!(acked.status, ResolutionStatus::Acknowledged);
        // The record itself still reflects its creation state.
        assert_eq!(acked.record.resolution_status(), ResolutionStatus::Open);

        store.transition(id, ResolutionStatus::Resolved).unwrap();
        let err = store.transition(id, ResolutionStatus::Acknowledged).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Transition(DetectError::InvalidTransition { .. })
        ));

        let history = store.transitions(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, ResolutionStatus::Open);
        assert_eq!(history[0].to, ResolutionStatus::Acknowledged);
        assert_eq!(history[1].to, ResolutionStatus::Resolved);
        assert_eq!(store.get(id).unwrap().status, ResolutionStatus::Resolved);
    }

    #[test]
    fn test_unknown_id() {
        let (_dir, store) = store();
        assert!(matches!(store.get("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.transition("nope", ResolutionStatus::Resolved),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sink_delivery_tolerates_redelivery() {
        let (_dir, store) = store();
        let r = record("avg_response_time_1min", 5);
        store.deliver(&r).await.unwrap();
        store.deliver(&r).await.unwrap();
        assert_eq!(store.list(None, 10).unwrap().len(), 1);
    }
}
