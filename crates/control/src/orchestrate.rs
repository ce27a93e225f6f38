//! Start and stop traversals over the dependency graph.
//!
//! Each traversal is a single cooperative loop owned by the background task
//! of one job: evaluate readiness, batch the ready names into one engine
//! call, sleep, re-poll. Engine failures are logged and retried on the next
//! iteration; only the wall-clock budget (or a detected cycle) fails a job.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::engine::{ContainerEngine, HealthState};
use crate::graph::DependencyGraph;

/// Sleep between traversal iterations.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause before each live health query. Just-started containers may not
/// report a health state yet.
const HEALTH_QUERY_DELAY: Duration = Duration::from_secs(1);

/// How a traversal ended. `Aborted` means the shutdown flag flipped and the
/// job was abandoned mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Aborted,
}

/// Start every non-placeholder node so that each parent has been started,
/// its delay observed and, where the health gate applies, reported healthy
/// before any of its children are issued to the engine.
pub async fn start_in_dependency_order<E: ContainerEngine>(
    engine: &E,
    graph: &mut DependencyGraph,
    timeout: Duration,
    shutdown: &watch::Receiver<bool>,
) -> Result<Outcome> {
    let deadline = Instant::now() + timeout;

    let mut pending: BTreeSet<String> = graph.names().map(String::from).collect();
    let mut started: HashSet<String> = HashSet::new();
    let mut skipped: HashSet<String> = HashSet::new();
    let mut waiting_logged: HashSet<String> = HashSet::new();
    let mut delay_deadlines: HashMap<String, Instant> = HashMap::new();

    while !pending.is_empty() {
        if *shutdown.borrow() {
            return Ok(Outcome::Aborted);
        }
        if Instant::now() >= deadline {
            bail!(
                "container start operation timed out after {} seconds",
                timeout.as_secs()
            );
        }

        let now = Instant::now();
        let mut ready: Vec<String> = Vec::new();
        let mut delay_waiting = 0usize;
        let mut health_waiting = 0usize;

        for name in pending.clone() {
            let Some(node) = graph.node(&name).cloned() else {
                pending.remove(&name);
                continue;
            };

            if node.is_placeholder {
                tracing::info!("Skipping start of '{name}' because it is a placeholder");
                pending.remove(&name);
                skipped.insert(name);
                continue;
            }

            if let Some(placeholder) = node
                .parents
                .iter()
                .find(|p| graph.node(p).is_some_and(|n| n.is_placeholder))
            {
                tracing::warn!(
                    "Skipping start of '{name}' due to placeholder dependency '{placeholder}'"
                );
                pending.remove(&name);
                skipped.insert(name);
                continue;
            }

            let mut dependencies_ready = true;
            for parent in &node.parents {
                // A parent skipped over a placeholder counts as satisfied:
                // the subtree below it must not be held hostage.
                if skipped.contains(parent) {
                    continue;
                }
                if !started.contains(parent) {
                    dependencies_ready = false;
                    break;
                }
                let gate_requested = node.healthcheck_gate
                    || graph.node(parent).is_some_and(|p| p.healthcheck_gate);
                if gate_requested && parent_health_blocks(engine, graph, parent).await {
                    dependencies_ready = false;
                    health_waiting += 1;
                    if waiting_logged.insert(name.clone()) {
                        tracing::info!(
                            "Container '{name}' is waiting for the health check of \
                             dependency '{parent}'"
                        );
                    }
                    break;
                }
            }
            if !dependencies_ready {
                continue;
            }

            if node.delay_seconds > 0 {
                match delay_deadlines.get(&name) {
                    Option::None => {
                        delay_deadlines
                            .insert(name.clone(), now + Duration::from_secs(node.delay_seconds));
                        tracing::info!(
                            "Container '{name}' is scheduled to start in {} seconds",
                            node.delay_seconds
                        );
                        delay_waiting += 1;
                    }
                    Some(due) if now < *due => delay_waiting += 1,
                    Some(_) => ready.push(name),
                }
            } else {
                ready.push(name);
            }
        }

        // An empty batch with nothing scheduled and nothing health-gated
        // means no iteration will ever make progress: a dependency cycle.
        if ready.is_empty() && delay_waiting == 0 && health_waiting == 0 && !pending.is_empty() {
            bail!(
                "no startable containers remain, dependency cycle among: {}",
                pending.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }

        if !ready.is_empty() {
            tracing::info!("Starting containers: {}", ready.join(", "));
            match engine.start_containers(&ready).await {
                Ok(()) => {
                    tracing::info!("Started containers: {}", ready.join(", "));
                    for name in ready {
                        pending.remove(&name);
                        waiting_logged.remove(&name);
                        delay_deadlines.remove(&name);
                        started.insert(name);
                    }
                }
                // Leave the batch in pending; the next iteration retries it.
                Err(err) => tracing::error!("Failed to start containers: {err:#}"),
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Ok(Outcome::Completed)
}

/// True when the parent's health gate is active and not yet satisfied.
///
/// A gate on a parent with no configured healthcheck is treated as
/// immediately satisfied. Engine errors count as "not healthy"; the next
/// iteration polls again.
async fn parent_health_blocks<E: ContainerEngine>(
    engine: &E,
    graph: &mut DependencyGraph,
    parent: &str,
) -> bool {
    let configured = match graph.healthcheck_configured(parent) {
        Some(configured) => configured,
        Option::None => {
            let configured = match engine.has_healthcheck(parent).await {
                Ok(configured) => configured,
                Err(err) => {
                    tracing::error!(
                        "Error checking healthcheck configuration for container {parent}: {err:#}"
                    );
                    false
                }
            };
            graph.set_healthcheck_configured(parent, configured);
            configured
        }
    };
    if !configured {
        return false;
    }

    tokio::time::sleep(HEALTH_QUERY_DELAY).await;
    let health = match engine.health_status(parent).await {
        Ok(health) => health,
        Err(err) => {
            tracing::error!("Error checking health for container {parent}: {err:#}");
            HealthState::Unknown
        }
    };
    tracing::debug!("Container {parent} health status: '{health}'");
    graph.set_health(parent, health);
    !health.is_healthy()
}

/// Stop every managed container outside the ignore set, children before
/// parents. Symmetric to the start traversal without delays or health gates.
pub async fn stop_in_dependency_order<E: ContainerEngine>(
    engine: &E,
    graph: &DependencyGraph,
    ignore: &HashSet<String>,
    timeout: Duration,
    shutdown: &watch::Receiver<bool>,
) -> Result<Outcome> {
    let deadline = Instant::now() + timeout;

    // Ignored names are out of scope and count as already stopped for the
    // child-satisfaction test applied to their parents.
    let mut stopped: HashSet<String> = ignore.clone();
    let mut remaining: BTreeSet<String> = graph
        .names()
        .filter(|name| !ignore.contains(*name))
        .map(String::from)
        .collect();

    while !remaining.is_empty() {
        if *shutdown.borrow() {
            return Ok(Outcome::Aborted);
        }
        if Instant::now() >= deadline {
            bail!(
                "container stop operation timed out after {} seconds",
                timeout.as_secs()
            );
        }

        let mut ready: Vec<String> = Vec::new();
        for name in remaining.clone() {
            let Some(node) = graph.node(&name) else {
                remaining.remove(&name);
                continue;
            };
            if node.is_placeholder {
                remaining.remove(&name);
                stopped.insert(name);
                continue;
            }
            let children_satisfied = node.children.iter().all(|child| {
                stopped.contains(child) || graph.node(child).is_none_or(|n| n.is_placeholder)
            });
            if children_satisfied {
                ready.push(name);
            }
        }

        if !ready.is_empty() {
            tracing::info!("Stopping containers: {}", ready.join(", "));
            match engine.stop_containers(&ready).await {
                Ok(()) => {
                    tracing::info!("Stopped containers: {}", ready.join(", "));
                    for name in ready {
                        remaining.remove(&name);
                        stopped.insert(name);
                    }
                }
                // Leave the batch in place; the next iteration retries it.
                Err(err) => tracing::error!("Failed to stop containers: {err:#}"),
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Ok(Outcome::Completed)
}
