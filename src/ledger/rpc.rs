//! JSON-RPC ledger gateway backed by an alloy HTTP provider.

use alloy::dyn_abi::JsonAbiExt;
use alloy::json_abi::JsonAbi;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Log, TransactionRequest};
use alloy::transports::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info, instrument};

use super::filter::EventFilter;
use super::gateway::{ContractCall, FilterId, LedgerEvent, LedgerGateway, TxHandle};
use crate::error::{AgentError, Result};
use crate::identity::AgentWallet;

type LogKey = (B256, u64);

/// Poll state of one installed filter.
///
/// `eth_getFilterChanges` only reports blocks mined after the filter was
/// created, so the first poll reads `eth_getFilterLogs` to cover the range
/// from `fromBlock`. Logs from that backfill are dropped from the following
/// changes batch, which may overlap it.
enum FilterCursor {
    Fresh,
    Backfilled(HashSet<LogKey>),
    Live,
}

pub struct RpcLedgerGateway {
    provider: DynProvider,
    contract: Address,
    abi: JsonAbi,
    from: Address,
    cursors: Mutex<HashMap<U256, FilterCursor>>,
}

impl RpcLedgerGateway {
    /// Connect to `rpc_url` with a provider that signs as `wallet`
    pub fn connect(
        rpc_url: &str,
        wallet: &AgentWallet,
        contract: Address,
        abi: JsonAbi,
    ) -> Result<Self> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e| AgentError::InvalidConfig(format!("Invalid RPC URL {}: {}", rpc_url, e)))?;

        let provider = ProviderBuilder::new()
            .wallet(wallet.ethereum_wallet())
            .connect_http(url)
            .erased();

        info!("Ledger gateway connected to {} as {}", rpc_url, wallet.address());
        Ok(Self {
            provider,
            contract,
            abi,
            from: wallet.address(),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    fn encode(&self, call: &ContractCall) -> Result<Bytes> {
        let function = self
            .abi
            .function(&call.function)
            .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == call.args.len()))
            .ok_or_else(|| {
                AgentError::Call(format!(
                    "{}/{} not declared in contract ABI",
                    call.function,
                    call.args.len()
                ))
            })?;

        let data = function
            .abi_encode_input(&call.args)
            .map_err(|e| AgentError::Call(format!("Failed to encode {}: {}", call.function, e)))?;
        Ok(data.into())
    }

    fn request(&self, call: &ContractCall) -> Result<TransactionRequest> {
        Ok(TransactionRequest::default()
            .with_from(self.from)
            .with_to(self.contract)
            .with_input(self.encode(call)?))
    }

    fn cursors(&self) -> std::sync::MutexGuard<'_, HashMap<U256, FilterCursor>> {
        self.cursors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn fetch(&self, method: &'static str, id: U256) -> Result<Vec<Log>> {
        self.provider
            .raw_request::<_, Vec<Log>>(method.into(), (id,))
            .await
            .map_err(|e| classify(e, |reason| {
                if reason.to_ascii_lowercase().contains("filter not found") {
                    AgentError::FilterNotFound(format!("{:#x}", id))
                } else {
                    AgentError::Transport(reason)
                }
            }))
    }
}

/// JSON-RPC error responses are rejections; anything else is transport
fn classify(err: TransportError, rejected: impl FnOnce(String) -> AgentError) -> AgentError {
    match err.as_error_resp() {
        Some(payload) => rejected(format!("{} (code {})", payload.message, payload.code)),
        None => AgentError::Transport(err.to_string()),
    }
}

fn log_key(log: &Log) -> Option<LogKey> {
    Some((log.transaction_hash?, log.log_index?))
}

fn to_event(log: Log) -> LedgerEvent {
    LedgerEvent {
        block_number: log.block_number,
        transaction_hash: log.transaction_hash,
        log_index: log.log_index,
        address: log.inner.address,
        log: log.inner.data,
    }
}

#[async_trait]
impl LedgerGateway for RpcLedgerGateway {
    async fn current_height(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| classify(e, AgentError::Transport))
    }

    async fn call(&self, call: &ContractCall) -> Result<Bytes> {
        let tx = self.request(call)?;
        self.provider
            .call(tx)
            .await
            .map_err(|e| classify(e, AgentError::Call))
    }

    #[instrument(skip(self, call), fields(function = %call.function))]
    async fn transact(&self, call: &ContractCall, gas_limit: u64) -> Result<TxHandle> {
        let tx = self.request(call)?.with_gas_limit(gas_limit);
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| classify(e, AgentError::Submission))?;

        let hash = *pending.tx_hash();
        debug!("Submitted {} tx {}", call.function, hash);
        Ok(TxHandle { hash })
    }

    async fn install_filter(&self, filter: &EventFilter) -> Result<FilterId> {
        let id = self
            .provider
            .new_filter(&filter.to_rpc_filter())
            .await
            .map_err(|e| {
                classify(e, |reason| AgentError::FilterCreation {
                    event: filter.event_name.clone(),
                    reason,
                })
            })?;

        self.cursors().insert(id, FilterCursor::Fresh);
        Ok(FilterId(id))
    }

    async fn filter_changes(&self, id: FilterId) -> Result<Vec<LedgerEvent>> {
        let fresh = matches!(self.cursors().get(&id.0), Some(FilterCursor::Fresh) | None);

        let logs = if fresh {
            let logs = self.fetch("eth_getFilterLogs", id.0).await?;
            let seen = logs.iter().filter_map(log_key).collect();
            self.cursors().insert(id.0, FilterCursor::Backfilled(seen));
            logs
        } else {
            let logs = self.fetch("eth_getFilterChanges", id.0).await?;
            let previous = self.cursors().insert(id.0, FilterCursor::Live);
            match previous {
                Some(FilterCursor::Backfilled(seen)) if !seen.is_empty() => logs
                    .into_iter()
                    .filter(|log| log_key(log).map_or(true, |key| !seen.contains(&key)))
                    .collect(),
                _ => logs,
            }
        };

        Ok(logs
            .into_iter()
            // Logs retracted by a reorg are not commands
            .filter(|log| !log.removed)
            .map(to_event)
            .collect())
    }

    async fn uninstall_filter(&self, id: FilterId) -> Result<bool> {
        self.cursors().remove(&id.0);
        self.provider
            .uninstall_filter(id.0)
            .await
            .map_err(|e| classify(e, AgentError::Transport))
    }
}
