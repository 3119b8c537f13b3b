//! Core crate of the vellum permissioned ledger node.
//!
//! The pipeline turns externally submitted, signed transactions into an
//! ordered, validated, and durably committed chain of blocks: the
//! `ordering` gate batches accepted transactions into proposals, the
//! `simulator` filters them against a scratch world state and assembles
//! candidate blocks, the `consensus` gate drives peer agreement on the
//! next block hash, and the `synchronizer` advances local `storage` to
//! whatever was committed, fetching from peers when the node lags.
//!
//! Applications typically depend on [`config::NodeConfig`] to bootstrap a
//! node, [`node::Node`] and [`node::NodeHandle`] to operate it, and `api`
//! for the HTTP transport surface.

pub mod api;
pub mod block_store;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod errors;
pub mod node;
pub mod ordering;
pub mod pcs;
pub mod simulator;
pub mod storage;
pub mod synchronizer;
pub mod types;
pub mod validation;
pub mod wsv;
