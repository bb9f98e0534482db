//! Typed action dispatch: a registry from action kind to handler, the
//! batch loop that feeds the acker chain, and the scheduler tick that
//! drains due actions from the shared queue.
//!
//! Per-action errors are logged and withheld from acknowledgement so the
//! server re-delivers; they never abort the rest of the batch. A state
//! store write failure does abort the batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_events::{topics, Bus};
use warden_protocol::{Action, ActionKind};

use crate::acker::Acker;
use crate::errors::AgentError;
use crate::queue::SharedQueue;
use crate::state_store::StateStore;

/// One handler per action kind. Handlers may fill response slots (app
/// actions) before the dispatcher acknowledges the mutated action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        token: &CancellationToken,
        action: &mut Action,
        acker: &dyn Acker,
    ) -> Result<(), AgentError>;
}

pub struct Dispatcher {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
    default: Arc<dyn ActionHandler>,
    queue: Arc<SharedQueue>,
    store: Arc<StateStore>,
    bus: Bus,
}

impl Dispatcher {
    pub fn new(
        default: Arc<dyn ActionHandler>,
        queue: Arc<SharedQueue>,
        store: Arc<StateStore>,
        bus: Bus,
    ) -> Self {
        Self {
            handlers: HashMap::new(),
            default,
            queue,
            store,
            bus,
        }
    }

    pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
        if self.handlers.insert(kind, handler).is_some() {
            // Double registration is a wiring bug, not a runtime state.
            panic!("handler for {kind} registered twice");
        }
    }

    fn resolve(&self, kind: ActionKind) -> Arc<dyn ActionHandler> {
        self.handlers
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Dispatch one server batch in server order. Cancels are applied to
    /// the live queue before any other action of the same batch runs.
    pub async fn dispatch(
        &self,
        token: &CancellationToken,
        actions: Vec<Action>,
        acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        let (cancels, rest): (Vec<Action>, Vec<Action>) = actions
            .into_iter()
            .partition(|a| a.kind() == ActionKind::Cancel);

        for action in cancels {
            self.run_one(token, action, acker).await?;
        }
        for action in rest {
            self.run_one(token, action, acker).await?;
        }

        if let Err(err) = acker.commit().await {
            warn!(%err, "ack commit failed after batch");
        }
        Ok(())
    }

    async fn run_one(
        &self,
        token: &CancellationToken,
        mut action: Action,
        acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        let now = Utc::now();
        let kind = action.kind();

        if kind != ActionKind::Cancel && self.queue.was_cancelled(&action.id) {
            info!(action_id = %action.id, %kind, "action was cancelled earlier; skipping");
            self.ack_quiet(&action, acker).await;
            return Ok(());
        }

        if action.expired(now) {
            warn!(action_id = %action.id, %kind, "action expired before execution");
            self.ack_quiet(&action, acker).await;
            return Ok(());
        }

        if !action.due(now) {
            debug!(action_id = %action.id, %kind, start_time = ?action.start_time, "scheduling action");
            self.queue.add(action.clone());
            self.persist_queue()?;
            self.ack_quiet(&action, acker).await;
            return Ok(());
        }

        let handler = self.resolve(kind);
        match handler.handle(token, &mut action, acker).await {
            Ok(()) => {
                self.bus.publish(
                    topics::TOPIC_ACTION_DISPATCHED,
                    &serde_json::json!({"action_id": action.id, "kind": kind.as_str()}),
                );
                // Upgrade acknowledgements are owned by the upgrader: a
                // successful swap defers its ack past the restart, and
                // failures/same-version runs were already acked there.
                if kind != ActionKind::Upgrade {
                    self.ack_quiet(&action, acker).await;
                }
            }
            Err(err) => {
                // Withhold the ack; the server re-delivers. Store errors
                // inside the handler already aborted that handler only.
                error!(action_id = %action.id, %kind, %err, error_kind = err.kind(),
                       "action handler failed");
                self.bus.publish(
                    topics::TOPIC_ACTION_FAILED,
                    &serde_json::json!({
                        "action_id": action.id,
                        "kind": kind.as_str(),
                        "error": err.to_string(),
                    }),
                );
            }
        }
        Ok(())
    }

    async fn ack_quiet(&self, action: &Action, acker: &dyn Acker) {
        if let Err(err) = acker.ack(action).await {
            warn!(action_id = %action.id, %err, "failed to queue acknowledgement");
        }
    }

    fn persist_queue(&self) -> Result<(), AgentError> {
        self.store.set_queue(self.queue.snapshot());
        self.store.save()
    }

    /// Background tick draining due scheduled actions through the same
    /// dispatch path.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        acker: Arc<dyn Acker>,
        token: CancellationToken,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let due = self.queue.dequeue_due(Utc::now());
                if due.is_empty() {
                    continue;
                }
                info!(count = due.len(), "dispatching scheduled actions");
                if let Err(err) = self.persist_queue() {
                    error!(%err, "failed to persist queue after drain");
                    continue;
                }
                if let Err(err) = self.dispatch(&token, due, acker.as_ref()).await {
                    error!(%err, "scheduled dispatch failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acker::testutil::RecordingAcker;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct CountingHandler {
        ran: AtomicUsize,
        ids: Mutex<Vec<String>>,
        fail: bool,
    }

    impl CountingHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                ran: AtomicUsize::new(0),
                ids: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl ActionHandler for CountingHandler {
        async fn handle(
            &self,
            _token: &CancellationToken,
            action: &mut Action,
            _acker: &dyn Acker,
        ) -> Result<(), AgentError> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            self.ids.lock().unwrap().push(action.id.clone());
            if self.fail {
                Err(AgentError::unexpected("boom"))
            } else {
                Ok(())
            }
        }
    }

    struct CancelHandler {
        queue: Arc<SharedQueue>,
    }

    #[async_trait]
    impl ActionHandler for CancelHandler {
        async fn handle(
            &self,
            _token: &CancellationToken,
            action: &mut Action,
            _acker: &dyn Acker,
        ) -> Result<(), AgentError> {
            if let warden_protocol::ActionPayload::Cancel { target_id } = &action.payload {
                self.queue.cancel(target_id);
            }
            Ok(())
        }
    }

    fn fixture() -> (Arc<SharedQueue>, Arc<StateStore>, tempfile::TempDir) {
        let tmp = tempdir().unwrap();
        let store = Arc::new(
            StateStore::load_with_migration(
                tmp.path().join("state.json"),
                tmp.path().join("action_store.yml"),
            )
            .unwrap(),
        );
        (Arc::new(SharedQueue::new(Vec::new())), store, tmp)
    }

    fn action(id: &str, body: serde_json::Value) -> Action {
        let mut full = body;
        full["id"] = json!(id);
        serde_json::from_value(full).unwrap()
    }

    fn unenroll(id: &str) -> Action {
        action(id, json!({"type": "UNENROLL"}))
    }

    #[tokio::test]
    async fn batch_runs_in_server_order_and_commits_once() {
        let (queue, store, _tmp) = fixture();
        let handler = CountingHandler::new(false);
        let mut d = Dispatcher::new(handler.clone(), queue, store, Bus::new(8));
        d.register(ActionKind::Unenroll, handler.clone());

        let acker = RecordingAcker::default();
        let token = CancellationToken::new();
        d.dispatch(&token, vec![unenroll("a"), unenroll("b")], &acker)
            .await
            .unwrap();

        assert_eq!(*handler.ids.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(acker.acked_ids(), vec!["a", "b"]);
        assert_eq!(acker.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_handler_is_not_acked_but_batch_continues() {
        let (queue, store, _tmp) = fixture();
        let failing = CountingHandler::new(true);
        let ok = CountingHandler::new(false);
        let mut d = Dispatcher::new(ok.clone(), queue, store, Bus::new(8));
        d.register(ActionKind::Unenroll, failing.clone());
        d.register(ActionKind::Settings, ok.clone());

        let acker = RecordingAcker::default();
        let token = CancellationToken::new();
        let batch = vec![
            unenroll("bad"),
            action("good", json!({"type": "SETTINGS", "data": {"log_level": "debug"}})),
        ];
        d.dispatch(&token, batch, &acker).await.unwrap();

        assert_eq!(failing.ran.load(Ordering::SeqCst), 1);
        assert_eq!(acker.acked_ids(), vec!["good"]);
    }

    #[tokio::test]
    async fn unknown_kind_falls_back_to_default() {
        let (queue, store, _tmp) = fixture();
        let default = CountingHandler::new(false);
        let d = Dispatcher::new(default.clone(), queue, store, Bus::new(8));

        let acker = RecordingAcker::default();
        let token = CancellationToken::new();
        d.dispatch(
            &token,
            vec![action("u", json!({"type": "NOT_YET_A_THING", "data": {}}))],
            &acker,
        )
        .await
        .unwrap();
        assert_eq!(default.ran.load(Ordering::SeqCst), 1);
        assert_eq!(acker.acked_ids(), vec!["u"]);
    }

    #[tokio::test]
    async fn cancel_in_same_batch_beats_scheduled_action() {
        let (queue, store, _tmp) = fixture();
        let policy_handler = CountingHandler::new(false);
        let mut d = Dispatcher::new(
            CountingHandler::new(false),
            queue.clone(),
            store.clone(),
            Bus::new(8),
        );
        d.register(ActionKind::PolicyChange, policy_handler.clone());
        d.register(
            ActionKind::Cancel,
            Arc::new(CancelHandler { queue: queue.clone() }),
        );

        let acker = RecordingAcker::default();
        let token = CancellationToken::new();
        let batch = vec![
            action(
                "pol",
                json!({
                    "type": "POLICY_CHANGE",
                    "start_time": "2099-01-01T00:00:00Z",
                    "data": {"policy": {}}
                }),
            ),
            action("cxl", json!({"type": "CANCEL", "data": {"target_id": "pol"}})),
        ];
        d.dispatch(&token, batch, &acker).await.unwrap();

        // The policy handler never ran; both actions were acknowledged.
        assert_eq!(policy_handler.ran.load(Ordering::SeqCst), 0);
        let mut acked = acker.acked_ids();
        acked.sort();
        assert_eq!(acked, vec!["cxl", "pol"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn earlier_cancel_suppresses_later_delivery() {
        let (queue, store, _tmp) = fixture();
        let handler = CountingHandler::new(false);
        let mut d = Dispatcher::new(handler.clone(), queue.clone(), store, Bus::new(8));
        d.register(ActionKind::Unenroll, handler.clone());
        d.register(
            ActionKind::Cancel,
            Arc::new(CancelHandler { queue: queue.clone() }),
        );

        let acker = RecordingAcker::default();
        let token = CancellationToken::new();
        d.dispatch(
            &token,
            vec![action("c1", json!({"type": "CANCEL", "data": {"target_id": "x"}}))],
            &acker,
        )
        .await
        .unwrap();
        d.dispatch(&token, vec![unenroll("x")], &acker).await.unwrap();

        assert_eq!(handler.ran.load(Ordering::SeqCst), 0);
        let mut acked = acker.acked_ids();
        acked.sort();
        assert_eq!(acked, vec!["c1", "x"]);
    }

    #[tokio::test]
    async fn scheduled_actions_drain_on_tick() {
        let (queue, store, _tmp) = fixture();
        let handler = CountingHandler::new(false);
        let mut d = Dispatcher::new(handler.clone(), queue.clone(), store.clone(), Bus::new(8));
        d.register(ActionKind::Unenroll, handler.clone());
        let d = Arc::new(d);

        // Already due: the first tick should pick it up.
        queue.add(action(
            "due",
            json!({"type": "UNENROLL", "start_time": "2020-01-01T00:00:00Z"}),
        ));

        let acker = Arc::new(RecordingAcker::default());
        let token = CancellationToken::new();
        let task = d.clone().spawn_scheduler(
            acker.clone(),
            token.clone(),
            Duration::from_millis(20),
        );

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if handler.ran.load(Ordering::SeqCst) > 0 {
                break;
            }
        }
        assert_eq!(handler.ran.load(Ordering::SeqCst), 1);
        assert_eq!(acker.acked_ids(), vec!["due"]);
        // Queue snapshot was persisted empty.
        assert!(store.queue().is_empty());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn expired_action_is_acked_without_running() {
        let (queue, store, _tmp) = fixture();
        let handler = CountingHandler::new(false);
        let mut d = Dispatcher::new(handler.clone(), queue, store, Bus::new(8));
        d.register(ActionKind::Unenroll, handler.clone());

        let acker = RecordingAcker::default();
        let token = CancellationToken::new();
        d.dispatch(
            &token,
            vec![action(
                "old",
                json!({"type": "UNENROLL", "expiration": "2020-01-01T00:00:00Z"}),
            )],
            &acker,
        )
        .await
        .unwrap();
        assert_eq!(handler.ran.load(Ordering::SeqCst), 0);
        assert_eq!(acker.acked_ids(), vec!["old"]);
    }
}
