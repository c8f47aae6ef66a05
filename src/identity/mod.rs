//! Agent identity: who the agent is on the ledger and which host it runs on.

pub mod fingerprint;
pub mod wallet;

pub use fingerprint::HostFacts;
pub use wallet::AgentWallet;

use crate::config::AgentConfig;
use crate::error::Result;
use alloy::primitives::{keccak256, Address, B256};

/// Identity built once at startup and never mutated afterwards
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    machine_fingerprint: Vec<u8>,
    wallet: AgentWallet,
}

impl AgentIdentity {
    pub fn new(machine_fingerprint: Vec<u8>, wallet: AgentWallet) -> Self {
        Self {
            machine_fingerprint,
            wallet,
        }
    }

    /// Fingerprint this host and unlock the configured wallet
    pub fn load(config: &AgentConfig) -> Result<Self> {
        let wallet = AgentWallet::from_config(config)?;
        Ok(Self::new(HostFacts::collect().fingerprint(), wallet))
    }

    pub fn machine_fingerprint(&self) -> &[u8] {
        &self.machine_fingerprint
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn wallet(&self) -> &AgentWallet {
        &self.wallet
    }

    /// Hash submitted with `registerInstance`
    pub fn id_hash(&self) -> B256 {
        keccak256(&self.machine_fingerprint)
    }

    /// Indexed topic the coordinator uses to address this agent's events
    pub fn address_topic(&self) -> B256 {
        keccak256(self.address().as_slice())
    }
}
