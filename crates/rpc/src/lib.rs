//! Bitcoin Core JSON-RPC adapter for the chainscan block and mempool sources.

pub mod client;
pub mod op_return;

pub use client::{BitcoindClient, NodeConfig};
pub use op_return::{decode_op_return, OpReturnHandler, OpReturnPayload, TransactionLookup};
