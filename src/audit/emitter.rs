//! Background audit emitter
//!
//! `emit` never blocks the request path. A small worker pool drains an
//! unbounded channel into the sink; `shutdown` closes the channel and waits
//! until every queued record has been written or given up on.

use super::{AuditRecord, AuditSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_APPEND_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

#[derive(Debug, Default)]
struct Counters {
    emitted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of emitter counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitterStats {
    pub emitted: u64,
    pub written: u64,
    pub failed: u64,
    /// Records offered after shutdown
    pub rejected: u64,
}

pub struct AuditEmitter {
    sender: Mutex<Option<mpsc::UnboundedSender<AuditRecord>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl AuditEmitter {
    /// Spawn `worker_count` workers on the current runtime
    pub fn spawn(sink: Arc<dyn AuditSink>, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<AuditRecord>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let sink = sink.clone();
                let counters = counters.clone();

                tokio::spawn(async move {
                    loop {
                        let next = { rx.lock().await.recv().await };
                        let Some(record) = next else { break };

                        if append_with_retry(sink.as_ref(), &record).await {
                            counters.written.fetch_add(1, Ordering::SeqCst);
                        } else {
                            counters.failed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    debug!(worker, "Audit worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(workers),
            counters,
        }
    }

    /// Queue a record. Returns false when the emitter is shut down.
    pub fn emit(&self, record: AuditRecord) -> bool {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let event_id = record.event_id;
        let accepted = guard
            .as_ref()
            .map(|tx| tx.send(record).is_ok())
            .unwrap_or(false);

        if accepted {
            self.counters.emitted.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.rejected.fetch_add(1, Ordering::SeqCst);
            warn!(event_id = %event_id, "Audit emitter closed, record dropped");
        }
        accepted
    }

    /// Close the queue and wait for workers to drain it
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Audit worker panicked");
            }
        }

        let stats = self.stats();
        info!(
            emitted = stats.emitted,
            written = stats.written,
            failed = stats.failed,
            "Audit emitter drained"
        );
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            emitted: self.counters.emitted.load(Ordering::SeqCst),
            written: self.counters.written.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
        }
    }
}

async fn append_with_retry(sink: &dyn AuditSink, record: &AuditRecord) -> bool {
    for attempt in 1..=MAX_APPEND_ATTEMPTS {
        match sink.append(record).await {
            Ok(()) => return true,
            Err(e) if attempt < MAX_APPEND_ATTEMPTS => {
                warn!(event_id = %record.event_id, attempt, error = %e, "Audit append failed, retrying");
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
            Err(e) => {
                error!(event_id = %record.event_id, error = %e, "Audit append failed permanently");
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{sample_record, InMemoryAuditSink};
    use crate::error::OrchestrationError;
    use crate::Result;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` appends
    struct FlakySink {
        inner: InMemoryAuditSink,
        failures: AtomicU32,
    }

    #[async_trait::async_trait]
    impl AuditSink for FlakySink {
        async fn append(&self, record: &AuditRecord) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(OrchestrationError::Audit("connection reset".to_string()));
            }
            self.inner.append(record).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_emits_are_all_durable() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let emitter = Arc::new(AuditEmitter::spawn(sink.clone(), 3));

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let emitter = emitter.clone();
                tokio::spawn(async move { emitter.emit(sample_record(&format!("s{}", i))) })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }

        emitter.shutdown().await;

        assert_eq!(sink.len().await, 50);
        let stats = emitter.stats();
        assert_eq!(stats.emitted, 50);
        assert_eq!(stats.written, 50);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_transient_sink_failure_is_retried() {
        let sink = Arc::new(FlakySink {
            inner: InMemoryAuditSink::new(),
            failures: AtomicU32::new(2),
        });
        let emitter = AuditEmitter::spawn(sink.clone(), 1);

        emitter.emit(sample_record("s1"));
        emitter.shutdown().await;

        assert_eq!(sink.inner.len().await, 1);
        assert_eq!(emitter.stats().written, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_counted_not_raised() {
        let sink = Arc::new(FlakySink {
            inner: InMemoryAuditSink::new(),
            failures: AtomicU32::new(u32::MAX),
        });
        let emitter = AuditEmitter::spawn(sink, 1);

        emitter.emit(sample_record("s1"));
        emitter.shutdown().await;

        assert_eq!(emitter.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_emit_after_shutdown_is_rejected() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let emitter = AuditEmitter::spawn(sink.clone(), 2);

        emitter.shutdown().await;
        emitter.shutdown().await;

        assert!(!emitter.emit(sample_record("late")));
        assert_eq!(emitter.stats().rejected, 1);
        assert!(sink.is_empty().await);
    }
}
