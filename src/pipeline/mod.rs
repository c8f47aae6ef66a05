//! Execution Pipeline
//!
//! `decrypt -> execute -> encrypt -> transmit`, one command at a time. The
//! first failing stage aborts the run, so a failed command never produces a
//! transmitted result.

pub mod stages;

pub use stages::{AcknowledgeExecutor, ContractTransmitter, LogTransmitter, PassthroughCipher};

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::Result;

/// A command as delivered by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub cmd_id: U256,
    pub encrypted_payload: Bytes,
    /// Contract that emitted the command
    pub source_address: Address,
}

/// An encrypted result ready to send back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEnvelope {
    pub cmd_id: U256,
    pub encrypted_result: Bytes,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandDecryptor: Send + Sync {
    async fn decrypt(&self, envelope: &CommandEnvelope) -> Result<Bytes>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, cmd_id: U256, command: Bytes) -> Result<Bytes>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultEncryptor: Send + Sync {
    async fn encrypt(&self, cmd_id: U256, result: Bytes) -> Result<Bytes>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultTransmitter: Send + Sync {
    async fn transmit(&self, result: ResultEnvelope) -> Result<()>;
}

#[derive(Clone)]
pub struct ExecutionPipeline {
    decryptor: Arc<dyn CommandDecryptor>,
    executor: Arc<dyn CommandExecutor>,
    encryptor: Arc<dyn ResultEncryptor>,
    transmitter: Arc<dyn ResultTransmitter>,
}

impl ExecutionPipeline {
    pub fn new(
        decryptor: Arc<dyn CommandDecryptor>,
        executor: Arc<dyn CommandExecutor>,
        encryptor: Arc<dyn ResultEncryptor>,
        transmitter: Arc<dyn ResultTransmitter>,
    ) -> Self {
        Self {
            decryptor,
            executor,
            encryptor,
            transmitter,
        }
    }

    #[instrument(skip(self, envelope), fields(cmd_id = %envelope.cmd_id))]
    pub async fn run(&self, envelope: CommandEnvelope) -> Result<()> {
        let cmd_id = envelope.cmd_id;

        let command = self.decryptor.decrypt(&envelope).await?;
        debug!("Decrypted {} bytes", command.len());

        let output = self.executor.execute(cmd_id, command).await?;
        let encrypted_result = self.encryptor.encrypt(cmd_id, output).await?;

        self.transmitter
            .transmit(ResultEnvelope {
                cmd_id,
                encrypted_result,
            })
            .await?;
        debug!("Result transmitted");
        Ok(())
    }
}
