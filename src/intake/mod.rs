//! Command Intake Loop
//!
//! Watches the coordinator for `CommandPending` events addressed to this
//! agent and runs each one through the execution pipeline, strictly in
//! delivery order. A failing command is logged and dropped; it never stops
//! the loop or touches the next command.

pub mod dedup;

pub use dedup::RecentCommands;

use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::IntakeConfig;
use crate::error::{AgentError, Result};
use crate::identity::AgentIdentity;
use crate::ledger::{
    EventFilter, EventHandler, EventSchema, EventSubscription, LedgerEvent, LedgerGateway,
    SubscriptionConfig, COMMAND_PENDING_EVENT,
};
use crate::pipeline::{CommandEnvelope, ExecutionPipeline};
use crate::session::SessionState;
use crate::shutdown::{GracefulShutdown, ShutdownPhase, ShutdownSignal};

const CMD_ID_FIELD: &str = "cmdId";
const COMMAND_FIELD: &str = "command";

/// Counters for one intake run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeStats {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub malformed: u64,
}

pub struct CommandIntakeLoop {
    gateway: Arc<dyn LedgerGateway>,
    schema: EventSchema,
    contract: Address,
    address_topic: B256,
    pipeline: ExecutionPipeline,
    recent: RecentCommands,
    config: IntakeConfig,
    stats: IntakeStats,
}

impl CommandIntakeLoop {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        identity: &AgentIdentity,
        contract: Address,
        abi: &JsonAbi,
        pipeline: ExecutionPipeline,
        config: IntakeConfig,
    ) -> Result<Self> {
        let schema = EventSchema::resolve(abi, COMMAND_PENDING_EVENT)?;
        for field in [CMD_ID_FIELD, COMMAND_FIELD] {
            if !schema.has_field(field) {
                return Err(AgentError::FilterCreation {
                    event: COMMAND_PENDING_EVENT.to_string(),
                    reason: format!("event has no {} field", field),
                });
            }
        }

        Ok(Self {
            gateway,
            schema,
            contract,
            address_topic: identity.address_topic(),
            pipeline,
            recent: RecentCommands::new(config.dedup_window),
            config,
            stats: IntakeStats::default(),
        })
    }

    pub fn stats(&self) -> IntakeStats {
        self.stats
    }

    /// Install the command filter.
    ///
    /// The filter is anchored at the block that confirmed registration, so
    /// commands mined between confirmation and now are still delivered.
    /// Only a Registered session may receive commands.
    pub async fn open(&self, session: &Mutex<SessionState>) -> Result<EventSubscription> {
        let (session_id, confirmed_block) = {
            let state = session.lock().await;
            let session_id = state.registered_session().ok_or_else(|| {
                AgentError::InvalidState("command intake requires a registered session".into())
            })?;
            (session_id, state.confirmed_block())
        };

        let from_block = match confirmed_block {
            Some(block) => block,
            None => self.gateway.current_height().await?,
        };
        let filter = EventFilter::new(
            &self.schema,
            self.contract,
            vec![self.address_topic],
            from_block,
        )?;

        let subscription = EventSubscription::subscribe(
            self.gateway.clone(),
            filter,
            SubscriptionConfig {
                poll_interval: self.config.poll_interval(),
                capacity: self.config.channel_capacity,
            },
        )
        .await?;

        info!("Command intake open for session {} from block {}", session_id, from_block);
        Ok(subscription)
    }

    /// Process commands until shutdown, then remove the command filter.
    ///
    /// A graceful stop lets the in-flight command finish; an urgent one
    /// drops it.
    pub async fn run(
        &mut self,
        session: &Mutex<SessionState>,
        shutdown: &GracefulShutdown,
    ) -> Result<IntakeStats> {
        let mut subscription = self.open(session).await?;
        let mut token = shutdown.token();
        let mut watcher = shutdown.token();

        {
            let dispatch = subscription.dispatch(self, &mut token);
            tokio::pin!(dispatch);

            tokio::select! {
                biased;
                signal = watcher.wait_for_shutdown() => {
                    shutdown.set_phase(ShutdownPhase::StoppingIntake);
                    if signal == ShutdownSignal::Graceful {
                        dispatch.await;
                    } else {
                        warn!(%signal, "Not waiting for the in-flight command");
                    }
                }
                _ = &mut dispatch => shutdown.set_phase(ShutdownPhase::StoppingIntake),
            }
        }

        shutdown.set_phase(ShutdownPhase::Unsubscribing);
        subscription.unsubscribe().await;

        info!(
            received = self.stats.received,
            processed = self.stats.processed,
            failed = self.stats.failed,
            duplicates = self.stats.duplicates,
            malformed = self.stats.malformed,
            "Command intake stopped"
        );
        Ok(self.stats)
    }

    /// Handle one `CommandPending` event
    pub async fn process(&mut self, event: LedgerEvent) -> Result<()> {
        self.stats.received += 1;

        let envelope = match self.envelope(&event) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.malformed += 1;
                return Err(e);
            }
        };

        let cmd_id = envelope.cmd_id;
        if !self.recent.insert(cmd_id) {
            self.stats.duplicates += 1;
            debug!(cmd_id = %cmd_id, "Dropping redelivered command");
            return Ok(());
        }

        info!(cmd_id = %cmd_id, block = ?event.block_number, "Executing command");
        match self.pipeline.run(envelope).await {
            Ok(()) => {
                self.stats.processed += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!(cmd_id = %cmd_id, disposition = %e.disposition(), "Command dropped");
                Err(e.for_command(cmd_id))
            }
        }
    }

    fn envelope(&self, event: &LedgerEvent) -> Result<CommandEnvelope> {
        let decoded = self.schema.decode(event)?;

        let cmd_id = match decoded.uint(CMD_ID_FIELD) {
            Ok(id) => id,
            // Some coordinators declare cmdId as bytes32
            Err(_) => U256::from_be_bytes(decoded.bytes32(CMD_ID_FIELD)?.0),
        };

        Ok(CommandEnvelope {
            cmd_id,
            encrypted_payload: decoded.bytes(COMMAND_FIELD)?,
            source_address: event.address,
        })
    }
}

#[async_trait]
impl EventHandler for CommandIntakeLoop {
    async fn handle(&mut self, event: LedgerEvent) -> Result<()> {
        self.process(event).await
    }
}
