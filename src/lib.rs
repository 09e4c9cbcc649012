//! Distributed transcoding control plane.
//!
//! The crate is split into the master-side scheduling core (`lifecycle`,
//! `store`, `master`), the worker agent (`worker`), and the non-owning
//! process governance wrapper (`wrapper`). Binaries live in `src/bin`.

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod lifecycle;
pub mod master;
pub mod store;
pub mod worker;
pub mod wrapper;

pub use domain::{Job, JobRequest, JobResult, Node, NodeRegistration};
pub use lifecycle::JobStatus;
pub use master::Master;
pub use store::{MemoryStore, SqliteStore, Store, StoreError};
