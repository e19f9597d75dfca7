//! In-process sink, used by replay and tests.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::detect::AnomalyRecord;
use crate::sink::AnomalySink;

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AnomalyRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AnomalyRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl AnomalySink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, record: &AnomalyRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
