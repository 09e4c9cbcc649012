//! Data model shared by the master, the worker agent and the wire.

pub mod job;
pub mod node;
pub mod result;

pub use job::{
    Classification, EngineKind, FailureReason, Job, JobParameters, JobRequest, Priority,
    QueueClass, StateTransition,
};
pub use node::{Node, NodeCapabilities, NodeRegistration, NodeStatus, NodeType};
pub use result::JobResult;
