//! Terminal consumer buffering a pipeline's output.

use super::base::{row_channel, RowReceiver, RowSender, StopSignal};
use crate::value::AnnotatedValue;
use tracing::debug;

#[derive(Debug)]
pub struct Collector {
    rx: RowReceiver,
    limit: Option<usize>,
}

impl Collector {
    pub fn new(capacity: usize) -> (Self, RowSender) {
        let (tx, rx) = row_channel(capacity);
        (Self { rx, limit: None }, tx)
    }

    /// Stop reading after `limit` rows. The producer sees a closed channel.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Drain until every sender is gone, the limit is hit, or `stop` fires.
    pub async fn collect(mut self, stop: &StopSignal) -> Vec<AnnotatedValue> {
        let mut rows = Vec::new();
        loop {
            if self.limit.is_some_and(|limit| rows.len() >= limit) {
                break;
            }
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => rows.push(item),
                    None => break,
                },
                _ = stop.stopped() => break,
            }
        }
        self.rx.close();
        debug!(rows = rows.len(), "Collected");
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[tokio::test]
    async fn test_collects_until_senders_gone() {
        let (collector, tx) = Collector::new(4);
        let stop = StopSignal::new();
        let producer = tokio::spawn({
            let stop = stop.clone();
            async move {
                for i in 0..10 {
                    assert!(tx.send(AnnotatedValue::new(Value::from(i)), &stop).await);
                }
            }
        });
        let rows = collector.collect(&stop).await;
        producer.await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[9].value(), &Value::from(9));
    }

    #[tokio::test]
    async fn test_limit_closes_channel() {
        let (collector, tx) = Collector::new(1);
        let stop = StopSignal::new();
        let producer = tokio::spawn({
            let stop = stop.clone();
            async move {
                let mut sent = 0;
                while tx.send(AnnotatedValue::new(Value::from(sent)), &stop).await {
                    sent += 1;
                }
                sent
            }
        });
        let rows = collector.with_limit(3).collect(&stop).await;
        assert_eq!(rows.len(), 3);
        assert!(producer.await.unwrap() >= 3);
    }
}
