//! Reads recorded metric batches from a JSON-lines file.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::detect::MetricBatch;
use crate::source::MetricSource;

/// One batch per non-blank line, in file order.
pub fn read_batches(path: &Path) -> Result<Vec<MetricBatch>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read replay file: {}", path.display()))?;
    parse_batches(&content).with_context(|| format!("in replay file {}", path.display()))
}

pub fn parse_batches(content: &str) -> Result<Vec<MetricBatch>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<MetricBatch>(line)
                .with_context(|| format!("line {}: invalid metric batch", idx + 1))
        })
        .collect()
}

/// Hands out pre-recorded batches in order, then reports exhaustion.
#[derive(Debug, Default)]
pub struct ReplaySource {
    batches: Mutex<VecDeque<MetricBatch>>,
}

impl ReplaySource {
    pub fn new(batches: impl IntoIterator<Item = MetricBatch>) -> Self {
        Self {
            batches: Mutex::new(batches.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl MetricSource for ReplaySource {
    async fn fetch(&self) -> Result<MetricBatch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .context("replay exhausted")
    }
}
