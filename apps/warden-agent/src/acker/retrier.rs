//! Background re-send of failed acknowledgements. Owns its own task:
//! the lazy acker hands over whole failed batches, and this keeps
//! retrying them with capped exponential backoff until they land or the
//! agent shuts down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warden_events::{topics, Bus};
use warden_protocol::Action;

use super::BatchAcker;
use crate::backoff::ExpBackoff;
use crate::util::env_u64;

#[derive(Clone)]
pub struct Retrier {
    tx: mpsc::UnboundedSender<Vec<Action>>,
}

impl Retrier {
    /// Spawn the retry task. It drains until cancellation; pending acks
    /// at shutdown are dropped (the server re-delivers).
    pub fn spawn(
        acker: Arc<dyn BatchAcker>,
        bus: Bus,
        token: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let init = Duration::from_secs(env_u64("WARDEN_ACK_RETRY_INIT_SECS", 1).max(1));
        let max = Duration::from_secs(env_u64("WARDEN_ACK_RETRY_MAX_SECS", 60).max(1));
        let handle = tokio::spawn(run(acker, bus, token, rx, ExpBackoff::new(init, max)));
        (Self { tx }, handle)
    }

    /// Hand a failed batch over. Order within a batch is preserved.
    pub fn enqueue(&self, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }
        if self.tx.send(actions).is_err() {
            warn!("ack retrier is gone; dropping failed acknowledgements");
        }
    }
}

async fn run(
    acker: Arc<dyn BatchAcker>,
    bus: Bus,
    token: CancellationToken,
    mut rx: mpsc::UnboundedReceiver<Vec<Action>>,
    mut backoff: ExpBackoff,
) {
    // Pending actions in arrival order; an id already present is not
    // appended again, so a re-enqueued batch cannot grow the set.
    let mut pending: Vec<Action> = Vec::new();
    loop {
        if pending.is_empty() {
            tokio::select! {
                _ = token.cancelled() => return,
                batch = rx.recv() => match batch {
                    Some(actions) => merge(&mut pending, actions),
                    None => return,
                },
            }
            backoff.reset();
        }

        let delay = ExpBackoff::jittered(backoff.next_delay());
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        // Fold in anything that queued up while we slept.
        while let Ok(actions) = rx.try_recv() {
            merge(&mut pending, actions);
        }

        match acker.ack_batch(&pending).await {
            Ok(()) => {
                debug!(count = pending.len(), "retried acknowledgements delivered");
                pending.clear();
                backoff.reset();
            }
            Err(err) => {
                warn!(%err, count = pending.len(), "ack retry failed; backing off");
                bus.publish(
                    topics::TOPIC_ACK_RETRY,
                    &serde_json::json!({"pending": pending.len(), "error": err.to_string()}),
                );
            }
        }
    }
}

fn merge(pending: &mut Vec<Action>, incoming: Vec<Action>) {
    for action in incoming {
        if !pending.iter().any(|a| a.id == action.id) {
            pending.push(action);
        }
    }
}
