//! Per-request execution context
//!
//! Shared by every operator of one request through an `Arc`. Holds the
//! request services operators call back into: error sink, phase counters,
//! scan consistency and named parameters.

use super::base::StopSignal;
use crate::algebra::EvalContext;
use crate::config::ExecConfig;
use crate::datastore::{ScanConsistency, ScanVector, ScanVectorSource};
use crate::error::Error;
use crate::metrics::{OPERATOR_ERRORS, PHASE_ITEMS};
use crate::value::Value;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

/// Execution phases with their own counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    IndexScan,
    UnionAll,
    Group,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::IndexScan, Phase::UnionAll, Phase::Group];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::IndexScan => "index_scan",
            Phase::UnionAll => "union_all",
            Phase::Group => "group",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Context {
    request_id: String,
    config: ExecConfig,
    consistency: ScanConsistency,
    scan_vectors: Option<Arc<dyn ScanVectorSource>>,
    named_args: HashMap<String, Value>,
    stop: StopSignal,
    errors: Mutex<Vec<Error>>,
    phase_counts: [AtomicU64; 3],
    phase_times: [AtomicU64; 3],
    sort_count: AtomicU64,
}

impl Context {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            consistency: config.scan_consistency,
            config,
            scan_vectors: None,
            named_args: HashMap::new(),
            stop: StopSignal::new(),
            errors: Mutex::new(Vec::new()),
            phase_counts: Default::default(),
            phase_times: Default::default(),
            sort_count: AtomicU64::new(0),
        }
    }

    pub fn with_named_args(mut self, args: HashMap<String, Value>) -> Self {
        self.named_args = args;
        self
    }

    pub fn with_named_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named_args.insert(name.into(), value);
        self
    }

    pub fn with_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_scan_vectors(mut self, source: Arc<dyn ScanVectorSource>) -> Self {
        self.scan_vectors = Some(source);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn scan_consistency(&self) -> ScanConsistency {
        self.consistency
    }

    pub fn scan_vector(&self, namespace: &str, keyspace: &str) -> Option<ScanVector> {
        self.scan_vectors
            .as_ref()
            .and_then(|source| source.scan_vector(namespace, keyspace))
    }

    /// Request-level cancellation.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn cancel(&self) {
        self.stop.stop();
    }

    /// Record a request error.
    pub fn error(&self, err: Error) {
        warn!(request_id = %self.request_id, error = %err, "Request error");
        self.errors.lock().push(err);
    }

    fn report(&self, operator: &str, err: Error) {
        OPERATOR_ERRORS.with_label_values(&[operator]).inc();
        self.error(err);
    }

    /// Errors recorded so far, oldest first.
    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    /// Report `message` as an assertion failure unless `cond` holds.
    pub fn assert(&self, cond: bool, message: &str) -> bool {
        if !cond {
            self.error(Error::Assertion(message.to_string()));
        }
        cond
    }

    pub fn add_phase_count(&self, phase: Phase, count: u64) {
        self.phase_counts[phase.slot()].fetch_add(count, Ordering::Relaxed);
        PHASE_ITEMS.with_label_values(&[phase.as_str()]).inc_by(count);
    }

    pub fn phase_count(&self, phase: Phase) -> u64 {
        self.phase_counts[phase.slot()].load(Ordering::Relaxed)
    }

    pub fn add_phase_time(&self, phase: Phase, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.phase_times[phase.slot()].fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn phase_time(&self, phase: Phase) -> Duration {
        Duration::from_nanos(self.phase_times[phase.slot()].load(Ordering::Relaxed))
    }

    pub fn sort_count(&self) -> u64 {
        self.sort_count.load(Ordering::Relaxed)
    }

    pub fn set_sort_count(&self, count: u64) {
        self.sort_count.store(count, Ordering::Relaxed);
    }

    /// Run an operator body, turning an error return or a panic into a
    /// reported request error. Returns `false` in both cases.
    pub async fn recover<F>(&self, operator: &str, body: F) -> bool
    where
        F: Future<Output = crate::error::Result<bool>>,
    {
        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(ok)) => ok,
            Ok(Err(err)) => {
                self.report(operator, err);
                false
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(operator, message = %message, "Operator panicked");
                self.report(
                    operator,
                    Error::Panic {
                        operator: operator.to_string(),
                        message,
                    },
                );
                false
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl EvalContext for Context {
    fn named_arg(&self, name: &str) -> Option<&Value> {
        self.named_args.get(name)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("consistency", &self.consistency)
            .field("errors", &self.errors.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recover_reports_errors() {
        let ctx = Context::new(ExecConfig::default());
        let ok = ctx
            .recover("Test", async { Err(Error::Execution("bad".into())) })
            .await;
        assert!(!ok);
        assert_eq!(ctx.errors(), vec![Error::Execution("bad".into())]);
    }

    #[tokio::test]
    async fn test_recover_catches_panics() {
        let ctx = Context::new(ExecConfig::default());
        let ok = ctx
            .recover("Test", async {
                if ctx.request_id().len() < usize::MAX {
                    panic!("index out of range");
                }
                Ok(true)
            })
            .await;
        assert!(!ok);
        assert_eq!(
            ctx.errors(),
            vec![Error::Panic {
                operator: "Test".into(),
                message: "index out of range".into()
            }]
        );
    }

    #[test]
    fn test_phase_counts() {
        let ctx = Context::new(ExecConfig::default());
        ctx.add_phase_count(Phase::IndexScan, 1024);
        ctx.add_phase_count(Phase::IndexScan, 5);
        assert_eq!(ctx.phase_count(Phase::IndexScan), 1029);
        assert_eq!(ctx.phase_count(Phase::Group), 0);
    }

    #[test]
    fn test_assert() {
        let ctx = Context::new(ExecConfig::default());
        assert!(ctx.assert(true, "fine"));
        assert!(!ctx.assert(false, "no children"));
        assert_eq!(ctx.errors(), vec![Error::Assertion("no children".into())]);
    }

    #[test]
    fn test_named_args() {
        let ctx = Context::new(ExecConfig::default()).with_named_arg("list", Value::from(1));
        assert_eq!(ctx.named_arg("list"), Some(&Value::from(1)));
        assert!(ctx.named_arg("other").is_none());
    }
}
