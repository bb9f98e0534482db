//! Managed-mode assembly: wires the acker chain, state store, queue,
//! dispatcher, handlers, upgrader, and gateway together, replays
//! persisted actions, and owns start/stop of the long-running tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_events::{topics, Bus};
use warden_protocol::ActionKind;

use crate::acker::{Acker, FleetAcker, LazyAcker, Retrier, StateStoreAcker};
use crate::agent_info::AgentInfo;
use crate::config::FleetConfig;
use crate::dispatcher::Dispatcher;
use crate::emitter::Emitter;
use crate::errors::AgentError;
use crate::fleet_client::FleetClient;
use crate::gateway::{FleetGateway, GatewaySettings, LocalFleetServerGateway};
use crate::handlers;
use crate::handlers::AppBridge;
use crate::queue::SharedQueue;
use crate::reexec::ReexecManager;
use crate::router::{Router, WorkerSupervisor};
use crate::state_store::StateStore;
use crate::status::StatusController;
use crate::upgrade::download::DownloadSettings;
use crate::upgrade::Upgrader;
use crate::{paths, util};

pub struct Managed {
    root: CancellationToken,
    bus: Bus,
    store: Arc<StateStore>,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    action_acker: Arc<dyn Acker>,
    upgrader: Arc<Upgrader>,
    gateway: Option<LocalFleetServerGateway>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Managed {
    /// Build the managed application. The worker supervisor and app
    /// bridge are external collaborators injected by the caller.
    pub fn new(
        cfg: &FleetConfig,
        agent_info: AgentInfo,
        reexec: Arc<ReexecManager>,
        bus: Bus,
        status: StatusController,
        supervisor: Arc<dyn WorkerSupervisor>,
        bridge: Arc<dyn AppBridge>,
    ) -> Result<Self, AgentError> {
        let root = CancellationToken::new();
        let client = FleetClient::new(&cfg.host, &cfg.api_key)
            .with_headers(agent_info.snapshot().headers);

        let store = Arc::new(StateStore::load_with_migration(
            paths::state_file(),
            paths::legacy_action_store_file(),
        )?);

        // Acker chain, innermost first: HTTP → retrier → batching →
        // persist-then-ack.
        let fleet_acker = Arc::new(FleetAcker::new(client.clone(), agent_info.clone()));
        let (retrier, retrier_task) =
            Retrier::spawn(fleet_acker.clone(), bus.clone(), root.child_token());
        let lazy = Arc::new(LazyAcker::new(fleet_acker.clone(), Some(retrier)));
        let action_acker: Arc<dyn Acker> =
            Arc::new(StateStoreAcker::new(lazy, store.clone()));

        let queue = Arc::new(SharedQueue::new(store.queue()));
        let router = Arc::new(Router::new(supervisor));
        let emitter = Arc::new(
            Emitter::new(agent_info.clone(), router.clone(), bus.clone())
                .with_decorator(crate::emitter::inject_monitoring)
                .with_filter(crate::emitter::input_type_checker),
        );

        let upgrader = Arc::new(Upgrader::new(
            DownloadSettings::from_env(),
            fleet_acker.clone() as Arc<dyn Acker>,
            status.clone(),
            bus.clone(),
            reexec.clone(),
        ));

        let mut dispatcher = Dispatcher::new(
            Arc::new(handlers::UnknownHandler),
            queue.clone(),
            store.clone(),
            bus.clone(),
        );
        dispatcher.register(
            ActionKind::PolicyChange,
            Arc::new(handlers::PolicyChangeHandler::new(emitter)),
        );
        dispatcher.register(
            ActionKind::PolicyReassign,
            Arc::new(handlers::PolicyReassignHandler),
        );
        dispatcher.register(
            ActionKind::Unenroll,
            Arc::new(handlers::UnenrollHandler::new(
                store.clone(),
                router.clone(),
                bus.clone(),
                vec![root.clone()],
            )),
        );
        dispatcher.register(
            ActionKind::Upgrade,
            Arc::new(handlers::UpgradeHandler::new(upgrader.clone())),
        );
        dispatcher.register(
            ActionKind::Settings,
            Arc::new(handlers::SettingsHandler::new(agent_info.clone(), reexec)),
        );
        dispatcher.register(
            ActionKind::Cancel,
            Arc::new(handlers::CancelHandler::new(queue.clone(), store.clone())),
        );
        dispatcher.register(
            ActionKind::App,
            Arc::new(handlers::AppActionHandler::new(bridge)),
        );
        let dispatcher = Arc::new(dispatcher);

        let gateway = FleetGateway::new(
            client.clone(),
            agent_info,
            dispatcher.clone(),
            action_acker.clone(),
            store.clone(),
            status.clone(),
            bus.clone(),
            GatewaySettings::from_env(),
        );
        let gateway = LocalFleetServerGateway::new(gateway, client, cfg.local_server);

        Ok(Self {
            root,
            bus,
            store,
            router,
            dispatcher,
            action_acker,
            upgrader,
            gateway: Some(gateway),
            tasks: vec![retrier_task],
        })
    }

    /// A persisted unenroll short-circuits the whole managed mode: no
    /// gateway, no further server contact.
    pub fn was_unenrolled(&self) -> bool {
        self.store
            .actions()
            .iter()
            .any(|a| a.kind() == ActionKind::Unenroll)
    }

    pub async fn start(&mut self) -> Result<(), AgentError> {
        info!("agent is starting");
        if self.was_unenrolled() {
            warn!("agent was previously unenrolled; to reactivate enroll again");
            return Ok(());
        }

        // Deferred upgrade acknowledgement from a pre-restart swap.
        if let Err(err) = self.upgrader.ack_pending().await {
            warn!(%err, "failed to send deferred upgrade acknowledgement");
        }

        self.replay_persisted_actions().await;

        let gateway = self
            .gateway
            .take()
            .ok_or_else(|| AgentError::unexpected("managed application started twice"))?;
        let gateway_token = self.root.child_token();
        self.tasks.push(tokio::spawn(async move {
            gateway.run(gateway_token).await;
        }));

        let scheduler_period =
            Duration::from_secs(util::env_u64("WARDEN_SCHEDULER_PERIOD_SECS", 5).max(1));
        self.tasks.push(self.dispatcher.clone().spawn_scheduler(
            self.action_acker.clone(),
            self.root.child_token(),
            scheduler_period,
        ));

        self.tasks.push(spawn_marker_cleaner(self.root.child_token()));

        self.bus.publish(
            topics::TOPIC_SERVICE_START,
            &serde_json::json!({"pid": std::process::id()}),
        );
        Ok(())
    }

    /// Re-dispatch the persisted state (the last good policy) so workers
    /// come back up before the first check-in.
    async fn replay_persisted_actions(&self) {
        let actions = self.store.actions();
        if actions.is_empty() {
            return;
        }
        // TODO: if dispatching the persisted policy fails here we cannot
        // ask the server for the latest configuration, because the
        // original policy change was already acknowledged.
        info!(count = actions.len(), "replaying persisted actions");
        if let Err(err) = self
            .dispatcher
            .dispatch(&self.root, actions, self.action_acker.as_ref())
            .await
        {
            error!(%err, "could not recover state; skipping");
        }
    }

    /// Cancel everything, flush what can be flushed, stop the routes.
    pub async fn stop(&mut self) {
        info!("agent is stopping");
        self.root.cancel();
        // One last commit so buffered acks do not die with the process.
        if let Err(err) = self.action_acker.commit().await {
            warn!(%err, "final ack flush failed");
        }
        self.router.shutdown().await;

        let drain = crate::reexec::drain_window();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(drain, task).await.is_err() {
                warn!("task did not stop within the drain window");
            }
        }
        self.bus
            .publish(topics::TOPIC_SERVICE_STOP, &serde_json::json!({}));
    }

}

/// Retires an acknowledged upgrade marker once the post-upgrade grace
/// period has passed. The watcher removes it on the happy path; this
/// covers the case where the ack only went out after the watcher exited.
fn spawn_marker_cleaner(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let grace = Duration::from_secs(util::env_u64("WARDEN_UPGRADE_GRACE_SECS", 600).max(10));
        let poll = Duration::from_secs(util::env_u64("WARDEN_CLEANER_POLL_SECS", 60).max(1));
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }
        loop {
            match crate::upgrade::marker::UpgradeMarker::load(&paths::marker_file()) {
                Ok(None) => return,
                Ok(Some(marker)) if marker.acked => {
                    if let Err(err) =
                        crate::upgrade::marker::UpgradeMarker::remove(&paths::marker_file())
                    {
                        warn!(%err, "failed to retire upgrade marker");
                    } else {
                        info!("upgrade marker retired after grace period");
                    }
                    return;
                }
                Ok(Some(_)) => {}
                Err(err) => {
                    warn!(%err, "could not read upgrade marker");
                    return;
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    })
}
