//! SentinelX oracle-safety core.
//!
//! Watches pairs of price oracles behind guarded contracts, decides whether the
//! reported price can be trusted, opens incidents when it cannot, and drives
//! operator-approved pause/unpause mitigations on chain.
//!
//! ```text
//!   MonitorEvaluator
//!     -> OracleGateway (router eth_call | demo feed)
//!     -> consensus::evaluate
//!     -> Repository (telemetry, status, incidents)
//!     -> Advisor (summary + proposed plans)
//!     -> ActionIntentService (proposed -> approved -> executing -> executed)
//!        -> ExecutionGateway (sign, broadcast, wait for receipt)
//! ```

pub mod abi;
pub mod advisor;
pub mod api;
pub mod clock;
pub mod config;
pub mod consensus;
pub mod error;
pub mod evaluator;
pub mod execution;
pub mod incidents;
pub mod intents;
pub mod models;
pub mod oracle;
pub mod registry;
pub mod rpc;
pub mod storage;
