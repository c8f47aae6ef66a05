//! Shared fixtures for unit tests.

use alloy::json_abi::JsonAbi;
use alloy::primitives::{address, Address, Bytes, LogData, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;

use crate::config::{
    AgentConfig, ContractConfig, IntakeConfig, LoggingConfig, NodeConfig, OpMode,
    RegistrationConfig,
};
use crate::identity::{AgentIdentity, AgentWallet};
use crate::ledger::LedgerEvent;

pub const COORDINATOR_ABI: &str = include_str!("../abi/Coordinator.json");

pub const CONTRACT: Address = address!("5FbDB2315678afecb367f032d93F642f64180aa3");

pub const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

sol! {
    event InstanceRegistered(bytes32 indexed requester, bytes32 sessionId);
    event CommandPending(bytes32 indexed requester, uint256 cmdId, bytes command);
}

pub fn coordinator_abi() -> JsonAbi {
    serde_json::from_str(COORDINATOR_ABI).expect("bundled ABI parses")
}

/// Configuration with fast polling, bound to the bundled ABI
pub fn config() -> AgentConfig {
    AgentConfig {
        contract: ContractConfig {
            address: CONTRACT.to_string(),
            abi: Some(COORDINATOR_ABI.to_string()),
            abi_path: None,
        },
        node_rpc_url: "http://127.0.0.1:8545".to_string(),
        client_wallet: None,
        client_wallet_password: None,
        client_private_key: Some(TEST_KEY.to_string()),
        op_mode: OpMode::Test,
        registration: RegistrationConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            confirmation_timeout_secs: 5,
            poll_interval_ms: 10,
            ..RegistrationConfig::default()
        },
        intake: IntakeConfig {
            poll_interval_ms: 10,
            ..IntakeConfig::default()
        },
        node: NodeConfig::default(),
        logging: LoggingConfig::default(),
    }
}

pub fn identity() -> AgentIdentity {
    let wallet = AgentWallet::from_private_key(TEST_KEY).expect("test key parses");
    AgentIdentity::new(b"test-host".to_vec(), wallet)
}

/// Topic the coordinator uses for the test identity
pub fn requester() -> B256 {
    identity().address_topic()
}

pub fn registered_log(requester: B256, session_id: B256) -> LogData {
    InstanceRegistered {
        requester,
        sessionId: session_id,
    }
    .encode_log_data()
}

pub fn command_log(requester: B256, cmd_id: U256, command: &[u8]) -> LogData {
    CommandPending {
        requester,
        cmdId: cmd_id,
        command: Bytes::copy_from_slice(command),
    }
    .encode_log_data()
}

pub fn event_at(log: LogData, block: u64) -> LedgerEvent {
    LedgerEvent {
        block_number: Some(block),
        transaction_hash: None,
        log_index: Some(0),
        address: CONTRACT,
        log,
    }
}
