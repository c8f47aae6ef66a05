use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use std::path::Path;
use tracing::info;
use zeroize::Zeroize;

/// Signing key of the agent
///
/// # Security
/// Raw key material is zeroized as soon as the signer is built. The signer
/// itself is only handed out as an [`EthereumWallet`] for the provider.
#[derive(Clone)]
pub struct AgentWallet {
    signer: PrivateKeySigner,
}

impl AgentWallet {
    /// Create a wallet from a private key hex string
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let mut secure_key = private_key.trim().trim_start_matches("0x").to_string();

        let parsed = secure_key.parse::<PrivateKeySigner>();
        secure_key.zeroize();

        let signer =
            parsed.map_err(|e| AgentError::Wallet(format!("Invalid private key: {}", e)))?;

        info!("Wallet initialized: {} (private key zeroized from memory)", signer.address());
        Ok(Self { signer })
    }

    /// Decrypt an encrypted JSON keystore
    pub fn from_keystore(path: &Path, password: &str) -> Result<Self> {
        let mut secure_password = password.to_string();

        let decrypted = PrivateKeySigner::decrypt_keystore(path, &secure_password);
        secure_password.zeroize();

        let signer = decrypted.map_err(|e| {
            AgentError::Wallet(format!("Failed to unlock keystore {}: {}", path.display(), e))
        })?;

        info!("Wallet unlocked from keystore {}: {}", path.display(), signer.address());
        Ok(Self { signer })
    }

    /// Keystore when configured, otherwise the raw private key
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        match (&config.client_wallet, &config.client_private_key) {
            (Some(path), _) => {
                let password = config.client_wallet_password.as_deref().ok_or_else(|| {
                    AgentError::Wallet("client_wallet_password not set".to_string())
                })?;
                Self::from_keystore(path, password)
            }
            (None, Some(key)) => Self::from_private_key(key),
            (None, None) => Err(AgentError::Wallet(
                "no client_wallet or client_private_key configured".to_string(),
            )),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Wallet for a signing provider
    pub fn ethereum_wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }
}

impl std::fmt::Debug for AgentWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentWallet")
            .field("address", &self.address())
            .finish()
    }
}
