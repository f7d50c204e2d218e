//! State and plumbing shared by every operator.

use super::context::{Context, Phase};
use crate::value::AnnotatedValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Cooperative cancellation flag.
///
/// Clones observe the same flag. Stopping never blocks and wakes every task
/// waiting in [`StopSignal::stopped`].
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is stopped.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Sending half of a row pipeline. Operators feeding the same consumer hold
/// clones; the consumer sees end of stream once every clone is dropped.
#[derive(Debug, Clone)]
pub struct RowSender {
    tx: mpsc::Sender<AnnotatedValue>,
}

#[derive(Debug)]
pub struct RowReceiver {
    rx: mpsc::Receiver<AnnotatedValue>,
}

/// Bounded row pipeline.
pub fn row_channel(capacity: usize) -> (RowSender, RowReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RowSender { tx }, RowReceiver { rx })
}

impl RowSender {
    /// Send `item` unless `stop` fires first. Returns `false` when stopped
    /// or when the consumer went away.
    pub async fn send(&self, item: AnnotatedValue, stop: &StopSignal) -> bool {
        if stop.is_stopped() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(item) => sent.is_ok(),
            _ = stop.stopped() => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl RowReceiver {
    pub async fn recv(&mut self) -> Option<AnnotatedValue> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Operator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatorState {
    #[default]
    Idle,
    Running,
    /// Has delivered at least one row downstream.
    Active,
    Stopped,
    Done,
}

/// Wall time an operator spent working, waiting on its source and waiting
/// on its consumer.
#[derive(Debug, Clone, Default)]
pub struct PhaseTimes {
    exec: Duration,
    serv: Duration,
    chan: Duration,
    started: Option<Instant>,
}

impl PhaseTimes {
    pub fn start(&mut self) {
        self.started.get_or_insert_with(Instant::now);
    }

    /// Close the running exec interval and return its length.
    pub fn stop(&mut self) -> Duration {
        match self.started.take() {
            Some(started) => {
                let elapsed = started.elapsed();
                self.exec += elapsed;
                elapsed
            }
            None => Duration::ZERO,
        }
    }

    pub fn add_serv(&mut self, d: Duration) {
        self.serv += d;
    }

    pub fn add_chan(&mut self, d: Duration) {
        self.chan += d;
    }

    pub fn exec_time(&self) -> Duration {
        self.exec
    }

    pub fn serv_time(&self) -> Duration {
        self.serv
    }

    pub fn chan_time(&self) -> Duration {
        self.chan
    }
}

/// Fields every operator embeds.
#[derive(Debug)]
pub struct OperatorBase {
    once: AtomicBool,
    state: OperatorState,
    output: Option<RowSender>,
    stop: StopSignal,
    times: PhaseTimes,
    bit: u8,
    done: watch::Sender<bool>,
}

impl Default for OperatorBase {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorBase {
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            once: AtomicBool::new(false),
            state: OperatorState::Idle,
            output: None,
            stop: StopSignal::new(),
            times: PhaseTimes::default(),
            bit: 0,
            done,
        }
    }

    /// Fresh base for a copied operator. Only the bit carries over; the copy
    /// gets its own stop signal and no output.
    pub fn copy(&self) -> Self {
        let mut base = Self::new();
        base.bit = self.bit;
        base
    }

    /// Claim the single execution of this operator. Returns `false` if it
    /// already ran or was stopped before starting.
    pub fn begin(&mut self) -> bool {
        if self
            .once
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.stop.is_stopped() {
            self.state = OperatorState::Stopped;
            return false;
        }
        self.state = OperatorState::Running;
        self.times.start();
        true
    }

    /// Exit path of every run: close the output, record time, notify
    /// waiters.
    pub fn finish(&mut self, ctx: &Context, phase: Phase) {
        self.output = None;
        let elapsed = self.times.stop();
        ctx.add_phase_time(phase, elapsed);
        self.state = OperatorState::Done;
        self.done.send_replace(true);
    }

    /// Forward a row downstream.
    pub async fn send_item(&mut self, item: AnnotatedValue) -> bool {
        let Some(output) = self.output.as_ref() else {
            return false;
        };
        let started = Instant::now();
        let sent = output.send(item, &self.stop).await;
        self.times.add_chan(started.elapsed());
        if sent {
            if self.state == OperatorState::Running {
                self.state = OperatorState::Active;
            }
        } else if self.stop.is_stopped() {
            self.state = OperatorState::Stopped;
        }
        sent
    }

    pub fn mark_stopped(&mut self) {
        self.state = OperatorState::Stopped;
    }

    pub fn set_output(&mut self, output: RowSender) {
        self.output = Some(output);
    }

    pub fn output(&self) -> Option<&RowSender> {
        self.output.as_ref()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn times(&self) -> &PhaseTimes {
        &self.times
    }

    pub fn times_mut(&mut self) -> &mut PhaseTimes {
        &mut self.times
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }

    pub fn set_bit(&mut self, bit: u8) {
        self.bit = bit;
    }

    /// Resolves when the operator finished its run.
    pub fn waiter(&self) -> Waiter {
        Waiter {
            rx: self.done.subscribe(),
        }
    }

    /// Clear every per-run field before the instance is pooled.
    pub fn recycle(&mut self) {
        *self = Self::new();
    }
}

/// Completion handle of one operator run.
#[derive(Debug, Clone)]
pub struct Waiter {
    rx: watch::Receiver<bool>,
}

impl Waiter {
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecConfig;
    use std::time::Duration;

    #[test]
    fn test_begin_runs_once() {
        let mut base = OperatorBase::new();
        assert!(base.begin());
        assert!(!base.begin());
        assert_eq!(base.state(), OperatorState::Running);
    }

    #[test]
    fn test_begin_after_stop() {
        let mut base = OperatorBase::new();
        base.stop_signal().stop();
        assert!(!base.begin());
        assert_eq!(base.state(), OperatorState::Stopped);
    }

    #[tokio::test]
    async fn test_send_item_unblocks_on_stop() {
        let (tx, _rx) = row_channel(1);
        let mut base = OperatorBase::new();
        base.set_output(tx);
        assert!(base.begin());
        assert!(base.send_item(AnnotatedValue::default()).await);
        assert_eq!(base.state(), OperatorState::Active);

        let stop = base.stop_signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop.stop();
        });
        assert!(!base.send_item(AnnotatedValue::default()).await);
        assert_eq!(base.state(), OperatorState::Stopped);
    }

    #[tokio::test]
    async fn test_finish_closes_output_and_notifies() {
        let ctx = Context::new(ExecConfig::default());
        let (tx, mut rx) = row_channel(4);
        let mut base = OperatorBase::new();
        base.set_output(tx);
        let mut waiter = base.waiter();
        assert!(base.begin());
        base.finish(&ctx, Phase::IndexScan);

        assert_eq!(base.state(), OperatorState::Done);
        assert!(rx.recv().await.is_none());
        tokio::time::timeout(Duration::from_secs(1), waiter.wait())
            .await
            .unwrap();
    }

    #[test]
    fn test_recycle_clears_state() {
        let (tx, _rx) = row_channel(1);
        let mut base = OperatorBase::new();
        base.set_output(tx);
        base.set_bit(3);
        base.stop_signal().stop();
        base.recycle();
        assert!(base.output().is_none());
        assert!(!base.is_stopped());
        assert_eq!(base.bit(), 0);
        assert!(base.begin());
    }
}
