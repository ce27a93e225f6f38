//! Docker client for the controller and hosts synchronizer.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use backon::{ConstantBuilder, Retryable};
use bollard::{
    Docker,
    container::{ListContainersOptions, StartContainerOptions, StopContainerOptions},
    errors::Error as DockerError,
    secret::{ContainerSummary, EventMessage, HealthStatusEnum},
    system::EventsOptions,
};
use derive_more::Deref;
use futures::Stream;

use crate::engine::{ContainerEngine, ContainerView, HealthState, NetworkAttachment};
use crate::graph::MANAGED_LABEL;

/// Attempts and spacing for the startup connectivity probe.
const CONNECT_RETRIES: usize = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Grace period handed to the engine when stopping containers.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Docker client wrapper for controller operations.
#[derive(Debug, Clone, Deref)]
pub struct SaltDocker {
    #[deref]
    docker: Docker,
}

impl SaltDocker {
    /// Connect with local defaults and verify the daemon answers, retrying a
    /// bounded number of times before giving up.
    pub async fn connect() -> Result<Self> {
        let docker = (|| async {
            let docker = Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker. Is Docker running?")?;
            let version = docker
                .version()
                .await
                .context("Docker daemon did not answer the version probe")?;
            if let Some(version) = version.version.as_deref() {
                tracing::info!("Using Docker version: {version}");
            }
            Ok::<_, anyhow::Error>(docker)
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(CONNECT_RETRY_DELAY)
                .with_max_times(CONNECT_RETRIES),
        )
        .notify(|err, delay| {
            tracing::error!("An error occurred during Docker initialization: {err:#}, retrying in {delay:?}");
        })
        .await
        .context("Failed to initialize Docker after multiple attempts")?;

        Ok(Self { docker })
    }

    /// True when the daemon currently answers a ping.
    pub async fn ping_ok(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Stream engine events for container starts and network disconnects.
    pub fn events(&self) -> impl Stream<Item = Result<EventMessage, DockerError>> + '_ {
        let mut filters = HashMap::new();
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "disconnect".to_string()],
        );
        self.docker.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        }))
    }

    /// Running containers attached to `network` with an IP address and at
    /// least one non-empty alias. The listing endpoint omits aliases, so
    /// each candidate is inspected individually.
    pub async fn network_attachments(&self, network: &str) -> Result<Vec<NetworkAttachment>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("Failed to list running containers")?;

        let mut attachments = Vec::new();
        for summary in containers {
            let Some(id) = summary.id else { continue };
            let inspect = match self.docker.inspect_container(&id, None).await {
                Ok(inspect) => inspect,
                Err(err) => {
                    tracing::warn!("Failed to inspect container {id}: {err}");
                    continue;
                }
            };
            let Some(networks) = inspect.network_settings.and_then(|s| s.networks) else {
                continue;
            };
            let Some(endpoint) = networks.get(network) else {
                continue;
            };
            let Some(ip) = endpoint.ip_address.clone().filter(|ip| !ip.is_empty()) else {
                continue;
            };
            let aliases: Vec<String> = endpoint
                .aliases
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|alias| !alias.is_empty())
                .collect();
            if aliases.is_empty() {
                continue;
            }
            attachments.push(NetworkAttachment {
                network: network.to_string(),
                ip,
                aliases,
            });
        }
        Ok(attachments)
    }

    fn container_name(summary: &ContainerSummary) -> Option<String> {
        // Names from the engine carry a leading "/".
        summary
            .names
            .as_ref()?
            .first()
            .map(|name| name.strip_prefix('/').unwrap_or(name).to_string())
    }
}

impl ContainerEngine for SaltDocker {
    async fn list_managed(&self) -> Result<Vec<ContainerView>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        );
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list managed containers")?;

        let mut views = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(name) = Self::container_name(&summary) else {
                continue;
            };
            views.push(ContainerView {
                name,
                labels: summary.labels.unwrap_or_default(),
                state: summary.state,
                // The listing endpoint does not report health; traversals
                // poll it live.
                health: HealthState::Unknown,
                networks: Vec::new(),
            });
        }
        Ok(views)
    }

    async fn has_healthcheck(&self, name: &str) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_container(name, None)
            .await
            .with_context(|| format!("Failed to inspect container {name}"))?;
        let configured = match inspect.config.and_then(|c| c.healthcheck).and_then(|h| h.test) {
            Some(test) => !test.is_empty() && test.first().map(String::as_str) != Some("NONE"),
            None => false,
        };
        Ok(configured)
    }

    async fn health_status(&self, name: &str) -> Result<HealthState> {
        let inspect = self
            .docker
            .inspect_container(name, None)
            .await
            .with_context(|| format!("Failed to inspect container {name}"))?;
        Ok(health_from(
            inspect.state.and_then(|s| s.health).and_then(|h| h.status),
        ))
    }

    async fn start_containers(&self, names: &[String]) -> Result<()> {
        for name in names {
            if let Err(err) = self
                .docker
                .start_container(name, None::<StartContainerOptions<String>>)
                .await
            {
                if !already_in_state(&err) {
                    return Err(err).with_context(|| format!("Failed to start container {name}"));
                }
            }
        }
        Ok(())
    }

    async fn stop_containers(&self, names: &[String]) -> Result<()> {
        for name in names {
            if let Err(err) = self
                .docker
                .stop_container(
                    name,
                    Some(StopContainerOptions {
                        t: STOP_TIMEOUT.as_secs() as i64,
                    }),
                )
                .await
            {
                if !already_in_state(&err) {
                    return Err(err).with_context(|| format!("Failed to stop container {name}"));
                }
            }
        }
        Ok(())
    }
}

/// The engine answers 304 when a container is already in the requested
/// state; that is success for our purposes.
fn already_in_state(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn health_from(status: Option<HealthStatusEnum>) -> HealthState {
    match status {
        Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
        Some(HealthStatusEnum::STARTING) => HealthState::Starting,
        Some(HealthStatusEnum::NONE) => HealthState::None,
        _ => HealthState::Unknown,
    }
}
