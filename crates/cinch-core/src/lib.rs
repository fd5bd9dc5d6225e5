//! Core domain types and collaborator traits for the Cinch control plane.
//!
//! This crate has no transport, storage, or container-runtime
//! dependencies of its own: `Storage`, `Runtime`, and `Forge` are
//! abstract interfaces implemented by `cinch-db`, `cinch-agent`, and
//! `cinch-server` respectively. Everything here is plain domain
//! modeling plus the pure functions (state transitions, trust
//! computation) that don't need I/O to be tested.

pub mod error;
pub mod event;
pub mod forge;
pub mod id;
pub mod job;
pub mod log;
pub mod repository;
pub mod runtime;
pub mod storage;
pub mod trust;
pub mod worker;

#[cfg(feature = "test-support")]
pub mod test_support;

pub use error::{Error, Result};
pub use id::{IdParseError, JobId, RepositoryId, TokenId, WorkerId};
pub use job::{Job, JobStatus, TerminalReason, TrustLevel};
pub use repository::{ForgeKind, Repository};
pub use worker::{Worker, WorkerMode};
