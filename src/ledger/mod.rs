//! Ledger access: the gateway contract, event filters and subscriptions.

pub mod filter;
pub mod gateway;
pub mod memory;
pub mod rpc;
pub mod subscription;

pub use filter::{
    DecodedEvent, EventFilter, EventSchema, COMMAND_PENDING_EVENT,
    REGISTRATION_CONFIRMATION_EVENT,
};
pub use gateway::{ContractCall, FilterId, LedgerEvent, LedgerGateway, TxHandle};
pub use memory::{InMemoryLedger, LedgerOp};
pub use rpc::RpcLedgerGateway;
pub use subscription::{EventHandler, EventSubscription, SubscriptionConfig};
