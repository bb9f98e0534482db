//! UPGRADE: delegate to the upgrader state machine. A failure has
//! already been acknowledged and reported as Failed by the upgrader;
//! the error still propagates so the dispatcher logs it and skips its
//! own ack.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use warden_protocol::Action;

use crate::acker::Acker;
use crate::dispatcher::ActionHandler;
use crate::errors::AgentError;
use crate::upgrade::Upgrader;

pub struct UpgradeHandler {
    upgrader: Arc<Upgrader>,
}

impl UpgradeHandler {
    pub fn new(upgrader: Arc<Upgrader>) -> Self {
        Self { upgrader }
    }
}

#[async_trait]
impl ActionHandler for UpgradeHandler {
    async fn handle(
        &self,
        token: &CancellationToken,
        action: &mut Action,
        _acker: &dyn Acker,
    ) -> Result<(), AgentError> {
        self.upgrader.upgrade(token, action, true).await
    }
}
