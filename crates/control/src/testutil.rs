//! In-memory container engine for exercising the orchestrators and the HTTP
//! surface without a Docker daemon.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{Result, bail};

use crate::engine::{ContainerEngine, ContainerView, HealthState};

/// One observable interaction with the mock engine, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Start(Vec<String>),
    Stop(Vec<String>),
    HealthQuery(String),
}

#[derive(Default)]
struct MockState {
    views: Vec<ContainerView>,
    healthchecks: HashMap<String, bool>,
    health_scripts: HashMap<String, VecDeque<HealthState>>,
    events: Vec<EngineEvent>,
    failing_starts: usize,
    failing_stops: usize,
}

/// Scriptable [`ContainerEngine`] that records every call.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn with_views(views: Vec<ContainerView>) -> Self {
        let engine = Self::default();
        engine.lock().views = views;
        engine
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock engine lock poisoned")
    }

    /// Declare whether `name` carries a configured healthcheck.
    pub fn set_healthcheck(&self, name: &str, configured: bool) {
        self.lock().healthchecks.insert(name.to_string(), configured);
    }

    /// Script the answers successive health queries for `name` receive.
    /// The final state repeats once the script is exhausted.
    pub fn set_health_script(&self, name: &str, states: &[HealthState]) {
        self.lock()
            .health_scripts
            .insert(name.to_string(), states.iter().copied().collect());
    }

    /// Make the next `count` start batches fail.
    pub fn fail_starts(&self, count: usize) {
        self.lock().failing_starts = count;
    }

    /// Make the next `count` stop batches fail.
    pub fn fail_stops(&self, count: usize) {
        self.lock().failing_stops = count;
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.lock().events.clone()
    }

    pub fn start_batches(&self) -> Vec<Vec<String>> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Start(batch) => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn stop_batches(&self) -> Vec<Vec<String>> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Stop(batch) => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ContainerEngine for MockEngine {
    async fn list_managed(&self) -> Result<Vec<ContainerView>> {
        Ok(self.lock().views.clone())
    }

    async fn has_healthcheck(&self, name: &str) -> Result<bool> {
        Ok(self.lock().healthchecks.get(name).copied().unwrap_or(false))
    }

    async fn health_status(&self, name: &str) -> Result<HealthState> {
        let mut state = self.lock();
        state.events.push(EngineEvent::HealthQuery(name.to_string()));
        let health = match state.health_scripts.get_mut(name) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(HealthState::Unknown),
            Some(script) => script.front().copied().unwrap_or(HealthState::Unknown),
            None => HealthState::Unknown,
        };
        Ok(health)
    }

    async fn start_containers(&self, names: &[String]) -> Result<()> {
        let mut state = self.lock();
        state.events.push(EngineEvent::Start(names.to_vec()));
        if state.failing_starts > 0 {
            state.failing_starts = state.failing_starts.saturating_sub(1);
            bail!("mock engine refused to start {}", names.join(", "));
        }
        Ok(())
    }

    async fn stop_containers(&self, names: &[String]) -> Result<()> {
        let mut state = self.lock();
        state.events.push(EngineEvent::Stop(names.to_vec()));
        if state.failing_stops > 0 {
            state.failing_stops = state.failing_stops.saturating_sub(1);
            bail!("mock engine refused to stop {}", names.join(", "));
        }
        Ok(())
    }
}
