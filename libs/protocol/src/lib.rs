//! # connect-protocol
//!
//! Wire types exchanged between the worker and the control plane.
//!
//! ## Design Principles
//!
//! - Requests arrive as a loosely typed envelope and are decoded exactly once
//!   into [`WorkerRequest`]; nothing past the boundary sees raw params
//! - Responses are either `{data}` or `{errorMessage, statusCode}`
//! - Status reports are plain data; the worker decides when to send them
//!
//! ## Message Families
//!
//! - Requests: local runtime (`createContainer`, `deleteContainer`) and
//!   Kubernetes (`deploy`, `redeploy`, `undeploy`, namespaces, storage, logs)
//! - Reports: worker status, cluster status (node-pool snapshot), pod status

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::ProtocolError;
pub use types::*;
