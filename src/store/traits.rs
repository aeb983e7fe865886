//! `AnalysisStore` trait: single async interface for analysis persistence.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::pipeline::record::{AnalysisRecord, AnalysisStatus};
use crate::pipeline::types::ChainAnalysis;

/// Backend-agnostic store for analysis records and chain analyses.
///
/// Writes are upserts keyed by email id / chain id: storing the same record
/// twice replaces it and never duplicates.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Create tables if they do not exist.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Records ─────────────────────────────────────────────────────

    /// Insert or replace the record for `record.email_id`.
    async fn upsert_record(&self, record: &AnalysisRecord) -> Result<(), DatabaseError>;

    async fn get_record(&self, email_id: &str) -> Result<Option<AnalysisRecord>, DatabaseError>;

    /// Records with `status`, most recently updated first.
    async fn records_by_status(&self, status: AnalysisStatus) -> Result<Vec<AnalysisRecord>, DatabaseError>;

    async fn count_records(&self) -> Result<usize, DatabaseError>;

    // ── Chains ──────────────────────────────────────────────────────

    /// Insert or replace the analysis for `analysis.chain_id`.
    async fn upsert_chain(&self, analysis: &ChainAnalysis) -> Result<(), DatabaseError>;

    async fn get_chain(&self, chain_id: &str) -> Result<Option<ChainAnalysis>, DatabaseError>;
}
