use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, Bytes, LogData, B256, U256};
use async_trait::async_trait;

use super::filter::EventFilter;
use crate::error::Result;

/// Node-side identifier of an installed log filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(pub U256);

impl std::fmt::Display for FilterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A contract function invocation, encoded by the gateway against its ABI
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCall {
    pub function: String,
    pub args: Vec<DynSolValue>,
}

impl ContractCall {
    pub fn new(function: impl Into<String>, args: Vec<DynSolValue>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }
}

/// Handle to a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle {
    pub hash: B256,
}

/// One matched log entry as delivered by the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
    /// Emitting contract
    pub address: Address,
    pub log: LogData,
}

/// The only path from the agent to the ledger peer.
///
/// The signer is bound at construction: transactions go out `from` the
/// agent address and are signed by the agent key.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Latest block number known to the peer
    async fn current_height(&self) -> Result<u64>;

    /// Read-only contract call
    async fn call(&self, call: &ContractCall) -> Result<Bytes>;

    /// Sign and submit a state-changing contract call
    async fn transact(&self, call: &ContractCall, gas_limit: u64) -> Result<TxHandle>;

    /// Install a log filter; rejection is a `FilterCreation` error
    async fn install_filter(&self, filter: &EventFilter) -> Result<FilterId>;

    /// Matches since the previous poll, in ledger order
    async fn filter_changes(&self, id: FilterId) -> Result<Vec<LedgerEvent>>;

    /// Returns false when the node did not know the filter
    async fn uninstall_filter(&self, id: FilterId) -> Result<bool>;
}
