//! In-process ledger for dry runs and tests.
//!
//! Every `transact` and every `emit` mines one block. Installed filters see
//! all logs at or above their `fromBlock`, including ones emitted before the
//! filter existed. Failures can be scripted per operation.

use alloy::primitives::{keccak256, Address, Bytes, LogData, B256, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::filter::EventFilter;
use super::gateway::{ContractCall, FilterId, LedgerEvent, LedgerGateway, TxHandle};
use crate::error::{AgentError, Result};

/// Reaction to a submitted transaction: logs mined in the same block
pub type TransactHook = Box<dyn Fn(&ContractCall) -> Vec<LogData> + Send + Sync>;

/// A transaction accepted by the in-memory ledger
#[derive(Debug, Clone)]
pub struct Submission {
    pub call: ContractCall,
    pub gas_limit: u64,
    /// Block the transaction was mined in
    pub block: u64,
    /// Chain height observed just before submission
    pub height_before: u64,
}

/// Which gateway operation a scripted failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    Height,
    Call,
    Transact,
    Poll,
}

struct InstalledFilter {
    filter: EventFilter,
    cursor: usize,
}

#[derive(Default)]
struct LedgerState {
    height: u64,
    logs: Vec<LedgerEvent>,
    filters: HashMap<U256, InstalledFilter>,
    installed: Vec<EventFilter>,
    next_filter_id: u64,
    submissions: Vec<Submission>,
    hooks: HashMap<String, TransactHook>,
    failures: HashMap<LedgerOp, u32>,
    reject_filters: bool,
    requests: u64,
    delivered: usize,
}

pub struct InMemoryLedger {
    contract: Address,
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new(contract: Address) -> Self {
        Self {
            contract,
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // A panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mine a block carrying one log from the coordinator contract
    pub fn emit(&self, log: LogData) -> u64 {
        let mut state = self.state();
        state.height += 1;
        let block = state.height;
        self.push_log(&mut state, log, block, None);
        block
    }

    fn push_log(&self, state: &mut LedgerState, log: LogData, block: u64, tx: Option<B256>) {
        let log_index = state.logs.len() as u64;
        state.logs.push(LedgerEvent {
            block_number: Some(block),
            transaction_hash: tx,
            log_index: Some(log_index),
            address: self.contract,
            log,
        });
    }

    /// Emit logs whenever `function` is transacted
    pub fn on_transact<F>(&self, function: &str, hook: F)
    where
        F: Fn(&ContractCall) -> Vec<LogData> + Send + Sync + 'static,
    {
        self.state().hooks.insert(function.to_string(), Box::new(hook));
    }

    /// Fail the next `count` requests of `op` with a transport error
    pub fn fail_next(&self, op: LedgerOp, count: u32) {
        *self.state().failures.entry(op).or_default() += count;
    }

    pub fn fail_polls(&self, count: u32) {
        self.fail_next(LedgerOp::Poll, count);
    }

    pub fn reject_filters(&self, reject: bool) {
        self.state().reject_filters = reject;
    }

    /// Forget every installed filter, as a restarted node would
    pub fn expire_filters(&self) {
        self.state().filters.clear();
    }

    pub fn height(&self) -> u64 {
        self.state().height
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn active_filters(&self) -> usize {
        self.state().filters.len()
    }

    /// Every filter ever installed, in installation order
    pub fn installed(&self) -> Vec<EventFilter> {
        self.state().installed.clone()
    }

    /// Gateway requests served so far
    pub fn requests(&self) -> u64 {
        self.state().requests
    }

    /// Events handed out through `filter_changes`
    pub fn delivered(&self) -> usize {
        self.state().delivered
    }

    fn begin(&self, state: &mut LedgerState, op: LedgerOp) -> Result<()> {
        state.requests += 1;
        match state.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(AgentError::Transport(format!("scripted {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn current_height(&self) -> Result<u64> {
        let mut state = self.state();
        self.begin(&mut state, LedgerOp::Height)?;
        Ok(state.height)
    }

    async fn call(&self, _call: &ContractCall) -> Result<Bytes> {
        let mut state = self.state();
        self.begin(&mut state, LedgerOp::Call)?;
        Ok(Bytes::new())
    }

    async fn transact(&self, call: &ContractCall, gas_limit: u64) -> Result<TxHandle> {
        let mut state = self.state();
        self.begin(&mut state, LedgerOp::Transact)?;

        let height_before = state.height;
        state.height += 1;
        let block = state.height;
        let hash = keccak256(format!("{}:{}:{:?}", block, call.function, call.args));

        state.submissions.push(Submission {
            call: call.clone(),
            gas_limit,
            block,
            height_before,
        });

        let logs = state
            .hooks
            .get(&call.function)
            .map(|hook| hook(call))
            .unwrap_or_default();
        for log in logs {
            self.push_log(&mut state, log, block, Some(hash));
        }

        Ok(TxHandle { hash })
    }

    async fn install_filter(&self, filter: &EventFilter) -> Result<FilterId> {
        let mut state = self.state();
        state.requests += 1;
        if state.reject_filters {
            return Err(AgentError::FilterCreation {
                event: filter.event_name.clone(),
                reason: "filter rejected by node".to_string(),
            });
        }

        state.next_filter_id += 1;
        let id = U256::from(state.next_filter_id);
        state.installed.push(filter.clone());
        state.filters.insert(
            id,
            InstalledFilter {
                filter: filter.clone(),
                cursor: 0,
            },
        );
        Ok(FilterId(id))
    }

    async fn filter_changes(&self, id: FilterId) -> Result<Vec<LedgerEvent>> {
        let mut state = self.state();
        self.begin(&mut state, LedgerOp::Poll)?;

        let state = &mut *state;
        let installed = state
            .filters
            .get_mut(&id.0)
            .ok_or_else(|| AgentError::FilterNotFound(id.to_string()))?;

        let matched: Vec<LedgerEvent> = state.logs[installed.cursor..]
            .iter()
            .filter(|event| installed.filter.matches(event))
            .cloned()
            .collect();
        installed.cursor = state.logs.len();
        state.delivered += matched.len();
        Ok(matched)
    }

    async fn uninstall_filter(&self, id: FilterId) -> Result<bool> {
        let mut state = self.state();
        state.requests += 1;
        Ok(state.filters.remove(&id.0).is_some())
    }
}
