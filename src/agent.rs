//! The agent: identity, gateway and session wired together.
//!
//! `run` is the whole life of the process: register (with retry), then
//! take commands until shutdown.

use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, B256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::identity::AgentIdentity;
use crate::intake::{CommandIntakeLoop, IntakeStats};
use crate::ledger::{LedgerGateway, RpcLedgerGateway};
use crate::pipeline::{
    AcknowledgeExecutor, ContractTransmitter, ExecutionPipeline, LogTransmitter, PassthroughCipher,
    ResultTransmitter,
};
use crate::registration::RegistrationProtocol;
use crate::session::SessionState;
use crate::shutdown::{GracefulShutdown, ShutdownPhase};

pub struct Agent {
    config: AgentConfig,
    identity: AgentIdentity,
    gateway: Arc<dyn LedgerGateway>,
    abi: JsonAbi,
    contract: Address,
    session: Mutex<SessionState>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        identity: AgentIdentity,
        gateway: Arc<dyn LedgerGateway>,
    ) -> Result<Self> {
        let abi = config.contract.load_abi()?;
        let contract = config.contract.parsed_address()?;

        Ok(Self {
            config,
            identity,
            gateway,
            abi,
            contract,
            session: Mutex::new(SessionState::new()),
        })
    }

    /// Build the identity from this host and connect to `node_rpc_url`
    pub fn connect(config: AgentConfig) -> Result<Self> {
        let identity = AgentIdentity::load(&config)?;
        let gateway = RpcLedgerGateway::connect(
            &config.node_rpc_url,
            identity.wallet(),
            config.contract.parsed_address()?,
            config.contract.load_abi()?,
        )?;
        Self::new(config, identity, Arc::new(gateway))
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn session(&self) -> &Mutex<SessionState> {
        &self.session
    }

    pub fn registration(&self) -> Result<RegistrationProtocol> {
        RegistrationProtocol::new(
            self.gateway.clone(),
            self.identity.clone(),
            self.contract,
            &self.abi,
            self.config.registration.clone(),
        )
    }

    /// Placeholder crypto and executor; results go to the configured
    /// contract function, or to the log when there is none
    pub fn default_pipeline(&self) -> ExecutionPipeline {
        let transmitter: Arc<dyn ResultTransmitter> = match &self.config.intake.result_function {
            Some(function) => Arc::new(ContractTransmitter::new(
                self.gateway.clone(),
                function.clone(),
                self.config.intake.result_gas_limit,
            )),
            None => Arc::new(LogTransmitter),
        };

        ExecutionPipeline::new(
            Arc::new(PassthroughCipher),
            Arc::new(AcknowledgeExecutor),
            Arc::new(PassthroughCipher),
            transmitter,
        )
    }

    pub fn intake(&self, pipeline: ExecutionPipeline) -> Result<CommandIntakeLoop> {
        CommandIntakeLoop::new(
            self.gateway.clone(),
            &self.identity,
            self.contract,
            &self.abi,
            pipeline,
            self.config.intake.clone(),
        )
    }

    pub async fn register(&self, shutdown: &GracefulShutdown) -> Result<B256> {
        self.registration()?
            .register_with_retry(&self.session, &mut shutdown.token())
            .await
    }

    /// Register, then process commands with `pipeline` until shutdown
    pub async fn run_with(
        &self,
        pipeline: ExecutionPipeline,
        shutdown: &GracefulShutdown,
    ) -> Result<IntakeStats> {
        let mut intake = self.intake(pipeline)?;

        let session_id = self.register(shutdown).await?;
        info!("Agent {} registered, session {}", self.identity.address(), session_id);

        let stats = intake.run(&self.session, shutdown).await?;
        shutdown.set_phase(ShutdownPhase::Complete);
        Ok(stats)
    }

    pub async fn run(&self, shutdown: &GracefulShutdown) -> Result<IntakeStats> {
        self.run_with(self.default_pipeline(), shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::ledger::InMemoryLedger;
    use crate::shutdown::ShutdownSignal;
    use crate::testing::{self, command_log, registered_log, CONTRACT};
    use alloy::primitives::U256;
    use std::time::Duration;

    fn agent(ledger: &Arc<InMemoryLedger>, result_function: Option<&str>) -> Agent {
        let mut config = testing::config();
        config.intake.result_function = result_function.map(str::to_string);
        Agent::new(config, testing::identity(), ledger.clone()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_then_execute_commands() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        ledger.on_transact("registerInstance", |_| {
            vec![registered_log(testing::requester(), B256::repeat_byte(9))]
        });
        let agent = agent(&ledger, Some("submitResult"));
        let shutdown = Arc::new(GracefulShutdown::with_defaults());

        let driver = {
            let ledger = ledger.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                // Wait for the command filter, then queue two commands
                while ledger.installed().len() < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                ledger.emit(command_log(testing::requester(), U256::from(1), b"ping"));
                ledger.emit(command_log(testing::requester(), U256::from(2), b"uptime"));
                while ledger.submissions().len() < 3 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            })
        };

        let stats = agent.run(&shutdown).await.unwrap();
        driver.await.unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
        assert_eq!(ledger.active_filters(), 0);
        assert!(agent.session().lock().await.is_registered());

        let functions: Vec<String> =
            ledger.submissions().into_iter().map(|s| s.call.function).collect();
        assert_eq!(functions, vec!["registerInstance", "submitResult", "submitResult"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_registration_is_cancelled() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        let agent = agent(&ledger, None);
        let shutdown = GracefulShutdown::with_defaults();
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        assert!(matches!(agent.run(&shutdown).await, Err(AgentError::Cancelled)));
        assert!(ledger.submissions().is_empty());
    }

    #[test]
    fn test_invalid_contract_address_rejected() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        let mut config = testing::config();
        config.contract.address = "0x1234".to_string();

        let result = Agent::new(config, testing::identity(), ledger);
        assert!(matches!(result, Err(AgentError::AddressParsing(_))));
    }
}
