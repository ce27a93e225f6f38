//! Container engine contract consumed by the orchestrators.

use std::collections::HashMap;

use anyhow::Result;

/// Live health of a container as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Starting,
    None,
    Unknown,
}

impl HealthState {
    pub fn is_healthy(self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

/// A container's attachment to a single engine network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    /// The network the container is attached to.
    pub network: String,
    /// The container's IP address on that network.
    pub ip: String,
    /// Network-scoped aliases, as reported by the engine.
    pub aliases: Vec<String>,
}

/// Snapshot of a container as the engine reports it.
///
/// This is the explicit record standing in for the engine's dynamic
/// attribute dictionaries.
#[derive(Debug, Clone)]
pub struct ContainerView {
    /// The container name, unique per host.
    pub name: String,
    /// All labels on the container.
    pub labels: HashMap<String, String>,
    /// The engine's coarse state string ("running", "exited", ...).
    pub state: Option<String>,
    /// Health at listing time, if the listing carried it.
    pub health: HealthState,
    /// Network attachments with IP and alias information.
    pub networks: Vec<NetworkAttachment>,
}

impl ContainerView {
    /// A view with just a name and labels, everything else unknown.
    pub fn new(name: impl Into<String>, labels: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            labels,
            state: None,
            health: HealthState::Unknown,
            networks: Vec::new(),
        }
    }
}

/// Operations the controller needs from a container engine.
///
/// [`SaltDocker`](crate::SaltDocker) is the production implementation; tests
/// substitute an in-memory engine.
pub trait ContainerEngine: Send + Sync + 'static {
    /// List every managed container, running or stopped.
    fn list_managed(&self) -> impl Future<Output = Result<Vec<ContainerView>>> + Send;

    /// Whether the container declares a real healthcheck.
    fn has_healthcheck(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    /// The container's health as of now.
    fn health_status(&self, name: &str) -> impl Future<Output = Result<HealthState>> + Send;

    /// Start a batch of containers.
    fn start_containers(&self, names: &[String]) -> impl Future<Output = Result<()>> + Send;

    /// Stop a batch of containers.
    fn stop_containers(&self, names: &[String]) -> impl Future<Output = Result<()>> + Send;
}
