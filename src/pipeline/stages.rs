//! Stage implementations shipped with the agent.
//!
//! The cipher and executor are placeholders: the coordinator protocol does
//! not fix an encryption scheme or a command set.

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Bytes, U256};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    CommandDecryptor, CommandEnvelope, CommandExecutor, ResultEncryptor, ResultEnvelope,
    ResultTransmitter,
};
use crate::error::{AgentError, Result};
use crate::ledger::{ContractCall, LedgerGateway};

/// Identity transform for both directions
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCipher;

#[async_trait]
impl CommandDecryptor for PassthroughCipher {
    async fn decrypt(&self, envelope: &CommandEnvelope) -> Result<Bytes> {
        Ok(envelope.encrypted_payload.clone())
    }
}

#[async_trait]
impl ResultEncryptor for PassthroughCipher {
    async fn encrypt(&self, _cmd_id: U256, result: Bytes) -> Result<Bytes> {
        Ok(result)
    }
}

#[derive(Debug, Serialize)]
struct Acknowledgement {
    cmd_id: String,
    status: &'static str,
    command_bytes: usize,
    received_at: String,
}

/// Answers every command with a JSON acknowledgement
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgeExecutor;

#[async_trait]
impl CommandExecutor for AcknowledgeExecutor {
    async fn execute(&self, cmd_id: U256, command: Bytes) -> Result<Bytes> {
        if command.is_empty() {
            return Err(AgentError::Execution(format!("command {} is empty", cmd_id)));
        }

        let ack = Acknowledgement {
            cmd_id: cmd_id.to_string(),
            status: "ack",
            command_bytes: command.len(),
            received_at: Utc::now().to_rfc3339(),
        };
        Ok(serde_json::to_vec(&ack)?.into())
    }
}

/// Posts results to the coordinator as `function(uint256 cmdId, bytes result)`
pub struct ContractTransmitter {
    gateway: Arc<dyn LedgerGateway>,
    function: String,
    gas_limit: u64,
}

impl ContractTransmitter {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        function: impl Into<String>,
        gas_limit: u64,
    ) -> Self {
        Self {
            gateway,
            function: function.into(),
            gas_limit,
        }
    }
}

#[async_trait]
impl ResultTransmitter for ContractTransmitter {
    async fn transmit(&self, result: ResultEnvelope) -> Result<()> {
        let call = ContractCall::new(
            self.function.clone(),
            vec![
                DynSolValue::Uint(result.cmd_id, 256),
                DynSolValue::Bytes(result.encrypted_result.to_vec()),
            ],
        );
        let tx = self.gateway.transact(&call, self.gas_limit).await?;
        info!(cmd_id = %result.cmd_id, "Result submitted in tx {}", tx.hash);
        Ok(())
    }
}

/// Used when no result function is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransmitter;

#[async_trait]
impl ResultTransmitter for LogTransmitter {
    async fn transmit(&self, result: ResultEnvelope) -> Result<()> {
        warn!(
            cmd_id = %result.cmd_id,
            "No result function configured; result of {} bytes not sent: {}",
            result.encrypted_result.len(),
            String::from_utf8_lossy(&result.encrypted_result)
        );
        Ok(())
    }
}
