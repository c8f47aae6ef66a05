//! Registration Protocol
//!
//! Brings a freshly started agent into a confirmed session with the
//! coordinator contract:
//!
//! 1. read the chain height, which anchors the confirmation filter
//! 2. subscribe to `InstanceRegistered` for this agent's address topic
//! 3. submit `registerInstance(idHash)`
//! 4. wait, bounded by a timeout, for one confirmation and keep its `sessionId`
//!
//! The filter exists before the transaction is sent, so a confirmation mined
//! in the same block cannot be missed.

pub mod backoff;

pub use backoff::Backoff;

use alloy::dyn_abi::DynSolValue;
use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, B256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RegistrationConfig;
use crate::error::{AgentError, Disposition, Result};
use crate::identity::AgentIdentity;
use crate::ledger::{
    ContractCall, EventFilter, EventSchema, EventSubscription, LedgerGateway, SubscriptionConfig,
    REGISTRATION_CONFIRMATION_EVENT,
};
use crate::session::{RegistrationStatus, SessionState};
use crate::shutdown::ShutdownToken;

const REGISTER_FUNCTION: &str = "registerInstance";
const SESSION_ID_FIELD: &str = "sessionId";

pub struct RegistrationProtocol {
    gateway: Arc<dyn LedgerGateway>,
    identity: AgentIdentity,
    contract: Address,
    confirmation: EventSchema,
    config: RegistrationConfig,
}

impl RegistrationProtocol {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        identity: AgentIdentity,
        contract: Address,
        abi: &JsonAbi,
        config: RegistrationConfig,
    ) -> Result<Self> {
        let confirmation = EventSchema::resolve(abi, REGISTRATION_CONFIRMATION_EVENT)?;
        if !confirmation.has_field(SESSION_ID_FIELD) {
            return Err(AgentError::FilterCreation {
                event: REGISTRATION_CONFIRMATION_EVENT.to_string(),
                reason: format!("event has no {} field", SESSION_ID_FIELD),
            });
        }
        if abi.function(REGISTER_FUNCTION).is_none() {
            return Err(AgentError::InvalidConfig(format!(
                "contract ABI does not declare {}",
                REGISTER_FUNCTION
            )));
        }

        Ok(Self {
            gateway,
            identity,
            contract,
            confirmation,
            config,
        })
    }

    /// One registration attempt.
    ///
    /// Holds the session lock for the whole attempt, so a concurrent caller
    /// waits and then sees the outcome. A Registered session returns its id
    /// without touching the ledger.
    pub async fn attempt_registration(&self, session: &Mutex<SessionState>) -> Result<B256> {
        let mut state = session.lock().await;

        match state.status() {
            RegistrationStatus::Registered => {
                debug!("Already registered, skipping attempt");
                return state.session_id().ok_or_else(|| {
                    AgentError::InvalidState("registered without a session id".into())
                });
            }
            RegistrationStatus::Failed => {
                return Err(AgentError::RegistrationExhausted {
                    attempts: state.attempts(),
                });
            }
            // Left behind by an attempt whose future was dropped
            RegistrationStatus::Registering => state.abandon_attempt(&AgentError::Cancelled)?,
            RegistrationStatus::Unregistered => {}
        }

        state.begin_registration()?;
        info!(attempt = state.attempts(), "Registering agent {}", self.identity.address());

        match self.register_once().await {
            Ok((session_id, block)) => {
                state.confirm(session_id, block)?;
                info!(block = ?block, "Registered with session {}", session_id);
                Ok(session_id)
            }
            Err(e) => {
                state.abandon_attempt(&e)?;
                warn!(attempt = state.attempts(), "Registration attempt failed: {}", e);
                Err(e)
            }
        }
    }

    /// Attempt until Registered, backing off between failures.
    ///
    /// Fatal errors and a spent attempt budget move the session to Failed.
    /// Shutdown cuts a backoff sleep short with `Cancelled`.
    pub async fn register_with_retry(
        &self,
        session: &Mutex<SessionState>,
        shutdown: &mut ShutdownToken,
    ) -> Result<B256> {
        let mut backoff = Backoff::from_config(&self.config);

        loop {
            if shutdown.is_shutdown_requested() {
                return Err(AgentError::Cancelled);
            }

            let err = match self.attempt_registration(session).await {
                Ok(session_id) => return Ok(session_id),
                Err(e) => e,
            };

            if err.disposition() == Disposition::Fatal {
                error!("Registration failed permanently: {}", err);
                mark_failed(session, &err).await;
                return Err(err);
            }

            let Some(delay) = backoff.next_delay() else {
                let exhausted = AgentError::RegistrationExhausted {
                    attempts: backoff.failures(),
                };
                error!("{}", exhausted);
                mark_failed(session, &exhausted).await;
                return Err(exhausted);
            };

            info!("Retrying registration in {:?}", delay);
            tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Session id and the block its confirmation was mined in
    #[instrument(skip(self))]
    async fn register_once(&self) -> Result<(B256, Option<u64>)> {
        let from_block = self.gateway.current_height().await?;
        let filter = EventFilter::new(
            &self.confirmation,
            self.contract,
            vec![self.identity.address_topic()],
            from_block,
        )?;

        let mut subscription = EventSubscription::subscribe(
            self.gateway.clone(),
            filter,
            SubscriptionConfig {
                poll_interval: self.config.poll_interval(),
                capacity: 1,
            },
        )
        .await?;

        let outcome = self.submit_and_confirm(&mut subscription).await;
        // One-shot: the filter goes whatever the outcome
        subscription.unsubscribe().await;
        outcome
    }

    async fn submit_and_confirm(
        &self,
        subscription: &mut EventSubscription,
    ) -> Result<(B256, Option<u64>)> {
        let call = ContractCall::new(
            REGISTER_FUNCTION,
            vec![DynSolValue::FixedBytes(self.identity.id_hash(), 32)],
        );
        let tx = self.gateway.transact(&call, self.config.gas_limit).await?;
        debug!("Registration submitted in tx {}", tx.hash);

        let timeout = self.config.confirmation_timeout();
        let event = match tokio::time::timeout(timeout, subscription.next_event()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                return Err(AgentError::Transport(
                    "confirmation subscription closed".to_string(),
                ))
            }
            Err(_) => {
                return Err(AgentError::RegistrationTimeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
        };

        let session_id = self.confirmation.decode(&event)?.bytes32(SESSION_ID_FIELD)?;
        Ok((session_id, event.block_number))
    }
}

async fn mark_failed(session: &Mutex<SessionState>, error: &AgentError) {
    let mut state = session.lock().await;
    if state.status().is_terminal() {
        return;
    }
    if let Err(e) = state.fail(error) {
        warn!("Could not mark session failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, LedgerOp};
    use crate::shutdown::{GracefulShutdown, ShutdownSignal};
    use crate::testing::{self, registered_log, CONTRACT};
    use std::time::Duration;

    const SESSION: B256 = B256::repeat_byte(0x5e);

    fn config() -> RegistrationConfig {
        RegistrationConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: None,
            confirmation_timeout_secs: 5,
            gas_limit: 500_000,
            poll_interval_ms: 10,
        }
    }

    fn protocol(ledger: &Arc<InMemoryLedger>, config: RegistrationConfig) -> RegistrationProtocol {
        RegistrationProtocol::new(
            ledger.clone(),
            testing::identity(),
            CONTRACT,
            &testing::coordinator_abi(),
            config,
        )
        .unwrap()
    }

    fn confirming_ledger() -> Arc<InMemoryLedger> {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        ledger.on_transact(REGISTER_FUNCTION, |_| {
            vec![registered_log(testing::requester(), SESSION)]
        });
        ledger
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_and_unsubscribes() {
        let ledger = confirming_ledger();
        let protocol = protocol(&ledger, config());
        let session = Mutex::new(SessionState::new());

        let session_id = protocol.attempt_registration(&session).await.unwrap();

        assert_eq!(session_id, SESSION);
        assert_eq!(session.lock().await.registered_session(), Some(SESSION));
        assert_eq!(ledger.active_filters(), 0);

        let submissions = ledger.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].gas_limit, 500_000);
        assert_eq!(
            submissions[0].call.args,
            vec![DynSolValue::FixedBytes(testing::identity().id_hash(), 32)]
        );
        assert_eq!(
            session.lock().await.confirmed_block(),
            Some(submissions[0].block)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_session_is_idempotent() {
        let ledger = confirming_ledger();
        let protocol = protocol(&ledger, config());
        let session = Mutex::new(SessionState::new());
        protocol.attempt_registration(&session).await.unwrap();

        let requests = ledger.requests();
        let again = protocol.attempt_registration(&session).await.unwrap();

        assert_eq!(again, SESSION);
        assert_eq!(ledger.requests(), requests);
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_attempts_submit_once() {
        let ledger = confirming_ledger();
        let protocol = Arc::new(protocol(&ledger, config()));
        let session = Arc::new(Mutex::new(SessionState::new()));

        let first = {
            let (protocol, session) = (protocol.clone(), session.clone());
            tokio::spawn(async move { protocol.attempt_registration(&session).await })
        };
        let second = {
            let (protocol, session) = (protocol.clone(), session.clone());
            tokio::spawn(async move { protocol.attempt_registration(&session).await })
        };

        assert_eq!(first.await.unwrap().unwrap(), SESSION);
        assert_eq!(second.await.unwrap().unwrap(), SESSION);
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_anchored_before_submission() {
        let ledger = confirming_ledger();
        ledger.emit(testing::command_log(B256::ZERO, alloy::primitives::U256::from(1), b"x"));
        ledger.emit(testing::command_log(B256::ZERO, alloy::primitives::U256::from(2), b"y"));
        let protocol = protocol(&ledger, config());

        protocol
            .attempt_registration(&Mutex::new(SessionState::new()))
            .await
            .unwrap();

        let installed = ledger.installed();
        let submission = &ledger.submissions()[0];
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].event_name, REGISTRATION_CONFIRMATION_EVENT);
        assert_eq!(installed[0].topic_matchers, vec![testing::requester()]);
        assert!(installed[0].from_block <= submission.height_before);
        assert_eq!(installed[0].from_block, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_to_unregistered() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        let protocol = protocol(&ledger, config());
        let session = Mutex::new(SessionState::new());

        let err = protocol.attempt_registration(&session).await.unwrap_err();

        assert!(matches!(err, AgentError::RegistrationTimeout { timeout_secs: 5 }));
        let state = session.lock().await;
        assert_eq!(state.status(), RegistrationStatus::Unregistered);
        assert_eq!(state.last_error(), Some(err.to_string().as_str()));
        assert_eq!(ledger.active_filters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_for_other_agent_is_ignored() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        ledger.on_transact(REGISTER_FUNCTION, |_| {
            vec![registered_log(B256::repeat_byte(0xff), SESSION)]
        });
        let protocol = protocol(&ledger, config());
        let session = Mutex::new(SessionState::new());

        let err = protocol.attempt_registration(&session).await.unwrap_err();
        assert!(matches!(err, AgentError::RegistrationTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_submission_failure() {
        let ledger = confirming_ledger();
        ledger.fail_next(LedgerOp::Transact, 2);
        let protocol = protocol(&ledger, config());
        let session = Mutex::new(SessionState::new());
        let shutdown = GracefulShutdown::with_defaults();

        let session_id = protocol
            .register_with_retry(&session, &mut shutdown.token())
            .await
            .unwrap();

        assert_eq!(session_id, SESSION);
        assert_eq!(session.lock().await.attempts(), 3);
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_fails_session() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        ledger.fail_next(LedgerOp::Height, 10);
        let protocol = protocol(
            &ledger,
            RegistrationConfig {
                max_attempts: Some(3),
                ..config()
            },
        );
        let session = Mutex::new(SessionState::new());
        let shutdown = GracefulShutdown::with_defaults();

        let err = protocol
            .register_with_retry(&session, &mut shutdown.token())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::RegistrationExhausted { attempts: 3 }));
        let state = session.lock().await;
        assert_eq!(state.status(), RegistrationStatus::Failed);
        assert_eq!(state.attempts(), 3);
        drop(state);

        // Failed is terminal
        assert!(matches!(
            protocol.attempt_registration(&session).await,
            Err(AgentError::RegistrationExhausted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_creation_is_fatal() {
        let ledger = confirming_ledger();
        ledger.reject_filters(true);
        let protocol = protocol(&ledger, config());
        let session = Mutex::new(SessionState::new());
        let shutdown = GracefulShutdown::with_defaults();

        let err = protocol
            .register_with_retry(&session, &mut shutdown.token())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::FilterCreation { .. }));
        assert_eq!(session.lock().await.status(), RegistrationStatus::Failed);
        assert!(ledger.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        ledger.fail_next(LedgerOp::Height, u32::MAX);
        let protocol = protocol(
            &ledger,
            RegistrationConfig {
                base_delay_ms: 60_000,
                max_delay_ms: 60_000,
                ..config()
            },
        );
        let session = Mutex::new(SessionState::new());
        let shutdown = Arc::new(GracefulShutdown::with_defaults());
        let mut token = shutdown.token();

        let stopper = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            })
        };

        let started = tokio::time::Instant::now();
        let err = protocol
            .register_with_retry(&session, &mut token)
            .await
            .unwrap_err();
        stopper.await.unwrap();

        assert!(matches!(err, AgentError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(session.lock().await.status(), RegistrationStatus::Unregistered);
    }

    #[test]
    fn test_abi_without_confirmation_event_is_rejected() {
        let abi: JsonAbi = serde_json::from_str("[]").unwrap();
        let result = RegistrationProtocol::new(
            Arc::new(InMemoryLedger::new(CONTRACT)),
            testing::identity(),
            CONTRACT,
            &abi,
            config(),
        );
        assert!(matches!(result, Err(AgentError::FilterCreation { .. })));
    }
}
