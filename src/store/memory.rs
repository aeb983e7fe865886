//! In-memory `AnalysisStore` for tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::pipeline::record::{AnalysisRecord, AnalysisStatus};
use crate::pipeline::types::ChainAnalysis;
use crate::store::traits::AnalysisStore;

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, AnalysisRecord>>,
    chains: RwLock<HashMap<String, ChainAnalysis>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, ordered by email id.
    pub async fn all_records(&self) -> Vec<AnalysisRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.email_id.cmp(&b.email_id));
        records
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn upsert_record(&self, record: &AnalysisRecord) -> Result<(), DatabaseError> {
        self.records
            .write()
            .await
            .insert(record.email_id.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, email_id: &str) -> Result<Option<AnalysisRecord>, DatabaseError> {
        Ok(self.records.read().await.get(email_id).cloned())
    }

    async fn records_by_status(&self, status: AnalysisStatus) -> Result<Vec<AnalysisRecord>, DatabaseError> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.email_id.cmp(&b.email_id))
        });
        Ok(records)
    }

    async fn count_records(&self) -> Result<usize, DatabaseError> {
        Ok(self.records.read().await.len())
    }

    async fn upsert_chain(&self, analysis: &ChainAnalysis) -> Result<(), DatabaseError> {
        self.chains
            .write()
            .await
            .insert(analysis.chain_id.clone(), analysis.clone());
        Ok(())
    }

    async fn get_chain(&self, chain_id: &str) -> Result<Option<ChainAnalysis>, DatabaseError> {
        Ok(self.chains.read().await.get(chain_id).cloned())
    }
}
