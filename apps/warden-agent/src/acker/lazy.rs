//! Batching layer: `ack` only buffers, `commit` flushes the buffer as a
//! single request. A failed flush is handed to the retrier instead of
//! being lost.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use warden_protocol::Action;

use super::{Acker, BatchAcker, Retrier};
use crate::errors::AgentError;

pub struct LazyAcker {
    inner: Arc<dyn BatchAcker>,
    buffer: Mutex<Vec<Action>>,
    retrier: Option<Retrier>,
}

impl LazyAcker {
    pub fn new(inner: Arc<dyn BatchAcker>, retrier: Option<Retrier>) -> Self {
        Self {
            inner,
            buffer: Mutex::new(Vec::new()),
            retrier,
        }
    }
}

#[async_trait]
impl Acker for LazyAcker {
    async fn ack(&self, action: &Action) -> Result<(), AgentError> {
        self.buffer.lock().await.push(action.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<(), AgentError> {
        let batch: Vec<Action> = {
            let mut guard = self.buffer.lock().await;
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return Ok(());
        }
        match self.inner.ack_batch(&batch).await {
            Ok(()) => Ok(()),
            Err(err) => match &self.retrier {
                Some(retrier) => {
                    warn!(%err, count = batch.len(), "ack flush failed; handing batch to retrier");
                    retrier.enqueue(batch);
                    Ok(())
                }
                None => Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acker::testutil::RecordingBatchAcker;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use warden_events::Bus;

    fn unenroll(id: &str) -> Action {
        serde_json::from_value(json!({"id": id, "type": "UNENROLL"})).unwrap()
    }

    #[tokio::test]
    async fn commit_sends_one_batch_per_commit() {
        let inner = Arc::new(RecordingBatchAcker::default());
        let acker = LazyAcker::new(inner.clone(), None);

        acker.ack(&unenroll("a1")).await.unwrap();
        acker.ack(&unenroll("a2")).await.unwrap();
        acker.commit().await.unwrap();
        // An empty commit is not a request.
        acker.commit().await.unwrap();

        let batches = inner.batch_ids();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec!["a1", "a2"]);
    }

    #[tokio::test]
    async fn flush_failure_goes_to_retrier() {
        let failing = Arc::new(RecordingBatchAcker::failing(1));
        let token = CancellationToken::new();
        let (retrier, handle) = Retrier::spawn(failing.clone(), Bus::new(8), token.clone());
        let acker = LazyAcker::new(failing.clone(), Some(retrier));

        acker.ack(&unenroll("a1")).await.unwrap();
        // First send fails and is absorbed; the retrier owns it now.
        acker.commit().await.unwrap();

        for _ in 0..64 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if !failing.batch_ids().is_empty() {
                break;
            }
        }
        assert_eq!(failing.batch_ids(), vec![vec!["a1".to_string()]]);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn flush_failure_without_retrier_surfaces() {
        let failing = Arc::new(RecordingBatchAcker::failing(1));
        let acker = LazyAcker::new(failing, None);
        acker.ack(&unenroll("a1")).await.unwrap();
        assert!(acker.commit().await.is_err());
    }
}
