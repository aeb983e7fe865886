//! libSQL backend: async `AnalysisStore` implementation.
//!
//! Supports local file and in-memory databases. Structured results are kept
//! in a JSON `payload` column; the scalar columns exist for filtering.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::record::{AnalysisRecord, AnalysisStatus};
use crate::pipeline::types::ChainAnalysis;
use crate::store::traits::AnalysisStore;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS analysis_records (
        email_id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        status TEXT NOT NULL,
        failed_phase TEXT,
        payload TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_analysis_records_status ON analysis_records(status);
    CREATE INDEX IF NOT EXISTS idx_analysis_records_conversation ON analysis_records(conversation_id);

    CREATE TABLE IF NOT EXISTS chain_analyses (
        chain_id TEXT PRIMARY KEY,
        chain_type TEXT NOT NULL,
        completeness_score REAL NOT NULL,
        is_complete INTEGER NOT NULL,
        payload TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
"#;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    // Keeps the database alive for the connection's lifetime.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and create tables.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn to_json<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Read the payload column (index 0) of the next row, if any.
async fn next_payload(rows: &mut libsql::Rows, op: &str) -> Result<Option<String>, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => {
            let payload: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
            Ok(Some(payload))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl AnalysisStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Query(format!("init_schema: {e}")))?;
        Ok(())
    }

    // ── Records ─────────────────────────────────────────────────────

    async fn upsert_record(&self, record: &AnalysisRecord) -> Result<(), DatabaseError> {
        let payload = to_json(record)?;
        self.conn()
            .execute(
                "INSERT INTO analysis_records (email_id, conversation_id, content_hash, status, failed_phase, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (email_id) DO UPDATE SET
                    conversation_id = ?2, content_hash = ?3, status = ?4,
                    failed_phase = ?5, payload = ?6, updated_at = ?7",
                params![
                    record.email_id.as_str(),
                    record.conversation_id.as_str(),
                    record.content_hash.as_str(),
                    record.status.as_str(),
                    opt_text(record.failed_phase.map(|p| p.as_str())),
                    payload,
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_record: {e}")))?;

        debug!(email_id = %record.email_id, status = %record.status, "Record upserted");
        Ok(())
    }

    async fn get_record(&self, email_id: &str) -> Result<Option<AnalysisRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT payload FROM analysis_records WHERE email_id = ?1",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?;

        match next_payload(&mut rows, "get_record").await? {
            Some(payload) => from_json(&payload).map(Some),
            None => Ok(None),
        }
    }

    async fn records_by_status(&self, status: AnalysisStatus) -> Result<Vec<AnalysisRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT payload FROM analysis_records WHERE status = ?1 ORDER BY updated_at DESC, email_id",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("records_by_status: {e}")))?;

        let mut records = Vec::new();
        while let Some(payload) = next_payload(&mut rows, "records_by_status").await? {
            records.push(from_json(&payload)?);
        }
        Ok(records)
    }

    async fn count_records(&self) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM analysis_records", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_records: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_records row parse: {e}")))?;
                Ok(count.max(0) as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_records: {e}"))),
        }
    }

    // ── Chains ──────────────────────────────────────────────────────

    async fn upsert_chain(&self, analysis: &ChainAnalysis) -> Result<(), DatabaseError> {
        let payload = to_json(analysis)?;
        self.conn()
            .execute(
                "INSERT INTO chain_analyses (chain_id, chain_type, completeness_score, is_complete, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (chain_id) DO UPDATE SET
                    chain_type = ?2, completeness_score = ?3, is_complete = ?4,
                    payload = ?5, updated_at = ?6",
                params![
                    analysis.chain_id.as_str(),
                    analysis.chain_type.as_str(),
                    analysis.completeness_score,
                    analysis.is_complete as i64,
                    payload,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_chain: {e}")))?;

        debug!(
            chain_id = %analysis.chain_id,
            chain_type = %analysis.chain_type,
            score = analysis.completeness_score,
            "Chain analysis upserted"
        );
        Ok(())
    }

    async fn get_chain(&self, chain_id: &str) -> Result<Option<ChainAnalysis>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT payload FROM chain_analyses WHERE chain_id = ?1",
                params![chain_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_chain: {e}")))?;

        match next_payload(&mut rows, "get_chain").await? {
            Some(payload) => from_json(&payload).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::pipeline::types::{ChainType, Email, Phase};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_email(id: &str) -> Email {
        Email {
            id: id.into(),
            conversation_id: "conv-1".into(),
            subject: "RFQ for valves".into(),
            body: "Please quote 200 units".into(),
            sender: "buyer@acme.com".into(),
            recipients: vec!["sales@vendor.com".into()],
            received_at: Utc::now(),
            is_important: false,
            has_attachments: false,
        }
    }

    fn make_record(id: &str) -> AnalysisRecord {
        AnalysisRecord::new(&make_email(id), ChainType::Rfq, 0.35, Utc::now())
    }

    // ── Record tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_and_get_record() {
        let db = test_db().await;
        let record = make_record("e1");
        db.upsert_record(&record).await.unwrap();

        let loaded = db.get_record("e1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(db.get_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let db = test_db().await;
        let mut record = make_record("e1");
        db.upsert_record(&record).await.unwrap();
        db.upsert_record(&record).await.unwrap();
        assert_eq!(db.count_records().await.unwrap(), 1);

        record.status = AnalysisStatus::Error;
        record.failed_phase = Some(Phase::Phase2);
        record.error = Some("timed out".into());
        db.upsert_record(&record).await.unwrap();

        assert_eq!(db.count_records().await.unwrap(), 1);
        let loaded = db.get_record("e1").await.unwrap().unwrap();
        assert_eq!(loaded.status, AnalysisStatus::Error);
        assert_eq!(loaded.failed_phase, Some(Phase::Phase2));
    }

    #[tokio::test]
    async fn filter_by_status() {
        let db = test_db().await;
        let mut done = make_record("e1");
        done.status = AnalysisStatus::Complete;
        db.upsert_record(&done).await.unwrap();
        db.upsert_record(&make_record("e2")).await.unwrap();

        let complete = db.records_by_status(AnalysisStatus::Complete).await.unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].email_id, "e1");
        assert!(db.records_by_status(AnalysisStatus::Error).await.unwrap().is_empty());
    }

    // ── Chain tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_and_get_chain() {
        let db = test_db().await;
        let mut analysis = ChainAnalysis::unknown("conv-1");
        analysis.chain_type = ChainType::Order;
        analysis.completeness_score = 0.8;
        analysis.is_complete = true;
        db.upsert_chain(&analysis).await.unwrap();

        analysis.completeness_score = 0.9;
        db.upsert_chain(&analysis).await.unwrap();

        let loaded = db.get_chain("conv-1").await.unwrap().unwrap();
        assert_eq!(loaded, analysis);
        assert!(db.get_chain("conv-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mailflow.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_record(&make_record("e1")).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.count_records().await.unwrap(), 1);
        assert!(db.get_record("e1").await.unwrap().is_some());
    }
}
