//! Connect worker library.
//!
//! The worker runs on a node and applies workload requests from the
//! marketplace control plane to one of two backends: the local Docker engine
//! or a Kubernetes cluster. It reports capacity and workload health back.
//!
//! ## Architecture
//!
//! ```text
//! RequestQueue ── WorkerCore ─┬─ ContainerLifecycle ── ResourcePool, ImageCache, ContainerRuntime
//!                             └─ WorkspaceReconciler ── ClusterApi, AutoSleepScheduler
//! ClusterStateWatcher ── ClusterApi (pod watch, capacity) ── ControlPlane
//! ```
//!
//! ## Modules
//!
//! - `container`: local container lifecycle over a [`runtime::ContainerRuntime`]
//! - `workspace`: Kubernetes workspace, namespace and storage reconciliation
//! - `watcher`: pod watch, stale record cleanup and node pool capacity
//! - `queue`: request polling and per-target ordering

pub mod autosleep;
pub mod client;
pub mod config;
pub mod container;
pub mod error;
pub mod heartbeat;
pub mod image;
pub mod k8s;
pub mod keyed_lock;
pub mod labels;
pub mod queue;
pub mod resources;
pub mod runtime;
pub mod watcher;
pub mod worker;
pub mod workspace;

// Re-export commonly used types
pub use client::{ControlPlane, HttpControlPlane, RecordingControlPlane};
pub use container::ContainerLifecycle;
pub use error::{ErrorKind, WorkerError};
pub use queue::RequestQueue;
pub use resources::ResourcePool;
pub use runtime::MockRuntime;
pub use watcher::ClusterStateWatcher;
pub use worker::WorkerCore;
pub use workspace::WorkspaceReconciler;
