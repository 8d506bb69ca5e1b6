//! Result reporter
//!
//! Turns finished [`PipelineResult`]s into status updates for external sinks.
//! Delivery runs on its own task so a slow sink never holds up the scheduler.
//! Re-publishing an identical result only reaches the sinks that have not
//! yet accepted it.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteStatusStore;

use crate::core::state::{JobStatus, PipelineResult, PipelineStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// External collaborator receiving status updates.
///
/// Implementations must update in place keyed by execution id, so a second
/// delivery of the same result leaves the same external state.
#[async_trait::async_trait]
pub trait StatusSink: Send + Sync {
    fn name(&self) -> &str;

    async fn update(&self, result: &PipelineResult) -> Result<()>;
}

/// One line of run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub git_ref: String,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: usize,
    pub failed_jobs: usize,
}

impl RunSummary {
    pub fn from_result(result: &PipelineResult) -> Self {
        Self {
            execution_id: result.execution_id,
            pipeline: result.pipeline.clone(),
            git_ref: result.ref_context.git_ref.clone(),
            status: result.status,
            started_at: result.started_at,
            finished_at: result.finished_at,
            jobs: result.jobs.len(),
            failed_jobs: result
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Failed)
                .count(),
        }
    }
}

fn fingerprint(result: &PipelineResult) -> Option<u64> {
    let bytes = serde_json::to_vec(result).ok()?;
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    Some(hasher.finish())
}

/// Deliveries remembered for de-duplication; the oldest are forgotten first
const DELIVERY_MEMORY: usize = 1024;

/// Fingerprints of results each sink has accepted, keyed by sink position
#[derive(Default)]
struct Deliveries {
    prints: HashMap<(usize, Uuid), u64>,
    order: VecDeque<(usize, Uuid)>,
}

impl Deliveries {
    fn is_current(&self, key: (usize, Uuid), print: u64) -> bool {
        self.prints.get(&key) == Some(&print)
    }

    fn record(&mut self, key: (usize, Uuid), print: u64) {
        if self.prints.insert(key, print).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > DELIVERY_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.prints.remove(&oldest);
            }
        }
    }
}

fn lock(deliveries: &Mutex<Deliveries>) -> MutexGuard<'_, Deliveries> {
    match deliveries.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fans finished results out to every registered sink
#[derive(Default)]
pub struct ResultReporter {
    sinks: Vec<Arc<dyn StatusSink>>,
    delivered: Arc<Mutex<Deliveries>>,
}

impl ResultReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Deliver `result` to every sink in the background. Returns the delivery
    /// task; dropping it does not cancel delivery.
    ///
    /// A sink is skipped when it already accepted this exact result. A failed
    /// delivery is not remembered, so publishing again retries that sink.
    pub fn publish(&self, result: Arc<PipelineResult>) -> JoinHandle<()> {
        let print = fingerprint(&result);
        let pending: Vec<(usize, Arc<dyn StatusSink>)> = {
            let delivered = lock(&self.delivered);
            self.sinks
                .iter()
                .enumerate()
                .filter(|(index, _)| {
                    print.map_or(true, |p| !delivered.is_current((*index, result.execution_id), p))
                })
                .map(|(index, sink)| (index, sink.clone()))
                .collect()
        };
        if pending.is_empty() {
            debug!("Result {} already published; skipping", result.execution_id);
            return tokio::spawn(async {});
        }

        let delivered = self.delivered.clone();
        tokio::spawn(async move {
            for (index, sink) in pending {
                match sink.update(&result).await {
                    Ok(()) => {
                        if let Some(print) = print {
                            lock(&delivered).record((index, result.execution_id), print);
                        }
                    }
                    Err(e) => warn!(
                        "Status sink {} failed for run {}: {:#}",
                        sink.name(),
                        result.execution_id,
                        e
                    ),
                }
            }
        })
    }
}

/// Writes a summary of each run to the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl StatusSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn update(&self, result: &PipelineResult) -> Result<()> {
        info!(
            "Pipeline {} on {}: {} ({} jobs, {}ms)",
            result.pipeline,
            result.ref_context.git_ref,
            result.status,
            result.jobs.len(),
            result.duration_ms()
        );
        for job in &result.jobs {
            match &job.reason {
                Some(reason) => info!("  job {}: {} ({})", job.job_id, job.status, reason),
                None => info!("  job {}: {}", job.job_id, job.status),
            }
        }
        Ok(())
    }
}

/// In-memory status board, one entry per execution id
#[derive(Debug, Default)]
pub struct InMemoryStatusSink {
    results: RwLock<HashMap<Uuid, PipelineResult>>,
    updates: AtomicUsize,
}

impl InMemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, execution_id: Uuid) -> Option<PipelineResult> {
        self.results.read().await.get(&execution_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }

    /// Number of deliveries received, including in-place updates
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StatusSink for InMemoryStatusSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn update(&self, result: &PipelineResult) -> Result<()> {
        self.results
            .write()
            .await
            .insert(result.execution_id, result.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
