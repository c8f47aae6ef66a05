//! Event schemas resolved from the coordinator ABI, and the filters built
//! from them.
//!
//! Topic matchers are positional: the first matcher constrains the first
//! indexed parameter, and so on, exactly as the contract declares them.

use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::{Event, JsonAbi};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::Filter;
use std::collections::BTreeMap;

use super::gateway::LedgerEvent;
use crate::error::{AgentError, Result};

/// Confirmation emitted by the coordinator after `registerInstance`
pub const REGISTRATION_CONFIRMATION_EVENT: &str = "InstanceRegistered";
/// Emitted by the coordinator when a command is queued for an agent
pub const COMMAND_PENDING_EVENT: &str = "CommandPending";

/// Declared shape of one contract event
#[derive(Debug, Clone)]
pub struct EventSchema {
    event: Event,
}

impl EventSchema {
    /// Look up `name` in the ABI
    pub fn resolve(abi: &JsonAbi, name: &str) -> Result<Self> {
        let event = abi
            .event(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| AgentError::FilterCreation {
                event: name.to_string(),
                reason: "event not declared in contract ABI".to_string(),
            })?;

        if event.anonymous {
            return Err(AgentError::FilterCreation {
                event: name.to_string(),
                reason: "anonymous events cannot be matched by name".to_string(),
            });
        }

        Ok(Self {
            event: event.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.event.name
    }

    /// topic0 of every log of this event
    pub fn selector(&self) -> B256 {
        self.event.selector()
    }

    pub fn indexed_count(&self) -> usize {
        self.event.inputs.iter().filter(|p| p.indexed).count()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.event.inputs.iter().any(|p| p.name == field)
    }

    /// Decode a raw log into named fields
    pub fn decode(&self, event: &LedgerEvent) -> Result<DecodedEvent> {
        if event.log.topics().first() != Some(&self.selector()) {
            return Err(AgentError::malformed(self.name(), "topic0 does not match event selector"));
        }

        let decoded = self
            .event
            .decode_log(&event.log)
            .map_err(|e| AgentError::malformed(self.name(), e.to_string()))?;

        let indexed_names = self.event.inputs.iter().filter(|p| p.indexed);
        let body_names = self.event.inputs.iter().filter(|p| !p.indexed);

        let fields = indexed_names
            .zip(decoded.indexed)
            .chain(body_names.zip(decoded.body))
            .filter(|(param, _)| !param.name.is_empty())
            .map(|(param, value)| (param.name.clone(), value))
            .collect();

        Ok(DecodedEvent {
            name: self.event.name.clone(),
            fields,
        })
    }
}

/// Event payload keyed by parameter name
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    name: String,
    fields: BTreeMap<String, DynSolValue>,
}

impl DecodedEvent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self, field: &str) -> Result<&DynSolValue> {
        self.fields
            .get(field)
            .ok_or_else(|| AgentError::malformed(&self.name, format!("missing field {}", field)))
    }

    pub fn bytes32(&self, field: &str) -> Result<B256> {
        match self.field(field)?.as_fixed_bytes() {
            Some((word, 32)) => Ok(B256::from_slice(word)),
            _ => Err(self.wrong_type(field, "bytes32")),
        }
    }

    pub fn uint(&self, field: &str) -> Result<U256> {
        self.field(field)?
            .as_uint()
            .map(|(value, _)| value)
            .ok_or_else(|| self.wrong_type(field, "uint"))
    }

    /// Dynamic `bytes`, or `string` taken as its UTF-8 bytes
    pub fn bytes(&self, field: &str) -> Result<Bytes> {
        let value = self.field(field)?;
        if let Some(raw) = value.as_bytes() {
            return Ok(Bytes::copy_from_slice(raw));
        }
        if let Some(text) = value.as_str() {
            return Ok(Bytes::copy_from_slice(text.as_bytes()));
        }
        Err(self.wrong_type(field, "bytes"))
    }

    fn wrong_type(&self, field: &str, expected: &str) -> AgentError {
        AgentError::malformed(&self.name, format!("field {} is not {}", field, expected))
    }
}

/// A named filter over the ledger event log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub event_name: String,
    pub contract_address: Address,
    pub selector: B256,
    pub topic_matchers: Vec<B256>,
    pub from_block: u64,
}

impl EventFilter {
    pub fn new(
        schema: &EventSchema,
        contract_address: Address,
        topic_matchers: Vec<B256>,
        from_block: u64,
    ) -> Result<Self> {
        if topic_matchers.len() > schema.indexed_count() {
            return Err(AgentError::FilterCreation {
                event: schema.name().to_string(),
                reason: format!(
                    "{} topic matchers but only {} indexed parameters",
                    topic_matchers.len(),
                    schema.indexed_count()
                ),
            });
        }

        Ok(Self {
            event_name: schema.name().to_string(),
            contract_address,
            selector: schema.selector(),
            topic_matchers,
            from_block,
        })
    }

    /// Same filter anchored at a later block
    pub fn resumed_at(&self, from_block: u64) -> Self {
        Self {
            from_block,
            ..self.clone()
        }
    }

    /// JSON-RPC filter object for `eth_newFilter`
    pub fn to_rpc_filter(&self) -> Filter {
        let filter = Filter::new()
            .address(self.contract_address)
            .event_signature(self.selector)
            .from_block(self.from_block);

        self.topic_matchers
            .iter()
            .enumerate()
            .fold(filter, |filter, (position, topic)| match position {
                0 => filter.topic1(*topic),
                1 => filter.topic2(*topic),
                _ => filter.topic3(*topic),
            })
    }

    /// Whether a log satisfies this filter
    pub fn matches(&self, event: &LedgerEvent) -> bool {
        let topics = event.log.topics();

        event.address == self.contract_address
            && topics.first() == Some(&self.selector)
            && event.block_number.map_or(true, |b| b >= self.from_block)
            && self
                .topic_matchers
                .iter()
                .enumerate()
                .all(|(i, matcher)| topics.get(i + 1) == Some(matcher))
    }
}
