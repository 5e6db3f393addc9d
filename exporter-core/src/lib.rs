//! Core abstractions for the blockchain exporter: the chain/account/contract
//! data model, the categorised RPC error taxonomy, the capability trait a
//! conforming EVM JSON-RPC client must provide, and the adaptive log-range
//! chunker that sits on top of it.

pub mod chunker;
pub mod error;
pub mod rpc;
pub mod types;

pub use error::{ErrorCategory, RpcError, RpcIssue};
pub use rpc::{EvmRpc, RpcFactory};
pub use types::{
    u256_to_f64, AccountSpec, BlockTag, ChainSpec, ContractAccountSpec, ContractSpec, LogEntry,
    TokenKind,
};
