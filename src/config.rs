use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Main configuration structure
#[derive(Clone, Deserialize)]
pub struct AgentConfig {
    pub contract: ContractConfig,
    /// JSON-RPC endpoint of the local ledger node
    #[serde(alias = "nodeRpcUrl")]
    pub node_rpc_url: String,
    /// Encrypted JSON keystore holding the agent key
    #[serde(default, alias = "clientWallet")]
    pub client_wallet: Option<PathBuf>,
    #[serde(default, alias = "clientWalletPassword")]
    pub client_wallet_password: Option<String>,
    /// Raw hex private key, used when no keystore is configured
    #[serde(default)]
    pub client_private_key: Option<String>,
    #[serde(default, alias = "opMode")]
    pub op_mode: OpMode,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    /// Address of the coordinator contract
    pub address: String,
    /// Contract ABI as JSON text
    #[serde(default)]
    pub abi: Option<String>,
    /// Path to a JSON ABI file (used when `abi` is not set)
    #[serde(default)]
    pub abi_path: Option<PathBuf>,
}

impl ContractConfig {
    pub fn parsed_address(&self) -> Result<Address> {
        Address::from_str(self.address.trim()).map_err(|e| {
            AgentError::AddressParsing(format!("contract.address {}: {}", self.address, e))
        })
    }

    /// Load and parse the contract interface description
    pub fn load_abi(&self) -> Result<JsonAbi> {
        let text = match (&self.abi, &self.abi_path) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)?,
            (None, None) => {
                return Err(AgentError::InvalidConfig(
                    "contract.abi or contract.abi_path is required".to_string(),
                ))
            }
        };
        Ok(serde_json::from_str(&text)?)
    }
}

/// Network the agent joins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OpMode {
    /// Private development chain, initialised from a local genesis
    #[default]
    Test,
    #[serde(alias = "TestNet")]
    Testnet,
    #[serde(alias = "RealNet")]
    Realnet,
}

impl std::fmt::Display for OpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpMode::Test => write!(f, "test"),
            OpMode::Testnet => write!(f, "testnet"),
            OpMode::Realnet => write!(f, "realnet"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    /// First retry delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling for the exponential backoff
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Give up after this many failed attempts (unset = retry forever)
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// How long one attempt waits for the confirmation event
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Filter polling interval while waiting for confirmation
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

fn default_gas_limit() -> u64 {
    3_000_000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            gas_limit: default_gas_limit(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl RegistrationConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of recent cmdIds remembered to drop redelivered events
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    /// Contract function used to post results, e.g. `submitResult`
    #[serde(default)]
    pub result_function: Option<String>,
    #[serde(default = "default_gas_limit")]
    pub result_gas_limit: u64,
    /// Events buffered between the filter poller and the intake loop
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_dedup_window() -> usize {
    1024
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            dedup_window: default_dedup_window(),
            result_function: None,
            result_gas_limit: default_gas_limit(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl IntakeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Start and supervise the node process ourselves
    #[serde(default)]
    pub managed: bool,
    /// Node executable, used for genesis initialisation
    #[serde(default = "default_geth")]
    pub geth: String,
    #[serde(default = "default_data_dir", alias = "BlockChainData")]
    pub data_dir: PathBuf,
    #[serde(default, alias = "genesisFile")]
    pub genesis_file: Option<PathBuf>,
    /// Genesis block as JSON text (test mode only)
    #[serde(default)]
    pub genesis: Option<String>,
    /// Full command line used to run the node
    #[serde(default, alias = "gethCmd")]
    pub command: Vec<String>,
    #[serde(default = "default_node_log_file")]
    pub log_file: PathBuf,
    /// Peer to add once the node is up
    #[serde(default)]
    pub enode: Option<String>,
    /// Grace period after spawning before probing RPC
    #[serde(default = "default_startup_wait_ms")]
    pub startup_wait_ms: u64,
    #[serde(default = "default_node_retries")]
    pub rpc_retries: u32,
    #[serde(default = "default_node_retries")]
    pub peer_retries: u32,
    #[serde(default = "default_node_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_geth() -> String {
    "geth".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("chaindata")
}

fn default_node_log_file() -> PathBuf {
    PathBuf::from("logs/geth.client.log")
}

fn default_startup_wait_ms() -> u64 {
    3000
}

fn default_node_retries() -> u32 {
    10
}

fn default_node_poll_interval_ms() -> u64 {
    100
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            managed: false,
            geth: default_geth(),
            data_dir: default_data_dir(),
            genesis_file: None,
            genesis: None,
            command: Vec::new(),
            log_file: default_node_log_file(),
            enode: None,
            startup_wait_ms: default_startup_wait_ms(),
            rpc_retries: default_node_retries(),
            peer_retries: default_node_retries(),
            poll_interval_ms: default_node_poll_interval_ms(),
        }
    }
}

impl NodeConfig {
    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("LOCK.pid")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Self::defaults()?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific file (e.g., config/testnet.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CNC_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            .add_source(Self::env_source());

        builder.build()?.try_deserialize()
    }

    /// Load configuration from one explicit file plus environment overrides
    pub fn load_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        Self::defaults()?
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(Self::env_source())
            .build()?
            .try_deserialize()
    }

    fn defaults() -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)
    }

    // CNC_NODE_RPC_URL, CNC_REGISTRATION__MAX_ATTEMPTS, ...
    fn env_source() -> Environment {
        Environment::with_prefix("CNC")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Cross-field checks the deserializer cannot express
    pub fn validate(&self) -> Result<()> {
        self.contract.parsed_address()?;
        if self.contract.abi.is_none() && self.contract.abi_path.is_none() {
            return Err(AgentError::InvalidConfig(
                "contract.abi or contract.abi_path is required".to_string(),
            ));
        }
        url::Url::parse(&self.node_rpc_url).map_err(|e| {
            AgentError::InvalidConfig(format!("node_rpc_url {}: {}", self.node_rpc_url, e))
        })?;

        match (&self.client_wallet, &self.client_private_key) {
            (Some(_), _) if self.client_wallet_password.is_none() => {
                return Err(AgentError::InvalidConfig(
                    "client_wallet_password is required with client_wallet".to_string(),
                ))
            }
            (None, None) => {
                return Err(AgentError::InvalidConfig(
                    "one of client_wallet or client_private_key is required".to_string(),
                ))
            }
            _ => {}
        }

        let reg = &self.registration;
        if reg.base_delay_ms == 0 || reg.base_delay_ms > reg.max_delay_ms {
            return Err(AgentError::InvalidConfig(format!(
                "registration delays must satisfy 0 < base_delay_ms ({}) <= max_delay_ms ({})",
                reg.base_delay_ms, reg.max_delay_ms
            )));
        }
        if reg.confirmation_timeout_secs == 0 {
            return Err(AgentError::InvalidConfig(
                "registration.confirmation_timeout_secs must be positive".to_string(),
            ));
        }
        if self.intake.dedup_window == 0 || self.intake.channel_capacity == 0 {
            return Err(AgentError::InvalidConfig(
                "intake.dedup_window and intake.channel_capacity must be positive".to_string(),
            ));
        }
        if self.node.managed && self.node.command.is_empty() {
            return Err(AgentError::InvalidConfig(
                "node.command is required when node.managed = true".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("contract", &self.contract)
            .field("node_rpc_url", &self.node_rpc_url)
            .field("client_wallet", &self.client_wallet)
            .field(
                "client_wallet_password",
                &self.client_wallet_password.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "client_private_key",
                &self.client_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("op_mode", &self.op_mode)
            .field("registration", &self.registration)
            .field("intake", &self.intake)
            .field("node", &self.node)
            .field("logging", &self.logging)
            .finish()
    }
}
