//! saltctl-control - container dependency control for a Saltbox host.
//!
//! This crate provides the two long-lived services: the controller, which
//! starts and stops managed containers in dependency order behind a small
//! HTTP surface, and the hosts synchronizer, which mirrors container network
//! aliases into /etc/hosts.

mod block;
pub use block::BlockGate;

mod config;
pub use config::{CONFIG_FILENAME, Config, ControllerConfig, HostsConfig};

mod docker;
pub use docker::SaltDocker;

mod engine;
pub use engine::{ContainerEngine, ContainerView, HealthState, NetworkAttachment};

mod graph;
pub use graph::{
    ContainerNode, DELAY_LABEL, DEPENDS_ON_LABEL, DependencyGraph, HEALTHCHECKS_LABEL, LabelError,
    MANAGED_LABEL,
};

mod hosts;
pub use hosts::{BEGIN_MARKER, END_MARKER, HostsFile};

mod hosts_sync;
pub use hosts_sync::{Debouncer, HostsSync};

mod jobs;
pub use jobs::{Job, JobKind, JobManager, JobStatus};

mod orchestrate;
pub use orchestrate::{Outcome, start_in_dependency_order, stop_in_dependency_order};

mod server;
pub use server::{AppState, router, serve};

#[cfg(test)]
mod testutil;
