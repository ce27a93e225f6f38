//! In-memory registry for start/stop runs.
//!
//! Jobs live only for the lifetime of the process; losing them on restart is
//! acceptable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states are sticky; later updates are ignored.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum JobKind {
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub kind: JobKind,
    pub status: JobStatus,
    /// Wall-clock budget for the whole traversal.
    pub timeout: Duration,
}

/// Hands out opaque job ids and tracks each job's state transitions.
#[derive(Debug, Default)]
pub struct JobManager {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending job and return its id.
    pub fn create(&self, kind: JobKind, timeout: Duration) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(
            id,
            Job {
                kind,
                status: JobStatus::Pending,
                timeout,
            },
        );
        id
    }

    /// Transition a job. Unknown ids and updates to terminal jobs are
    /// ignored.
    pub fn update(&self, id: Uuid, status: JobStatus) {
        if let Some(job) = self.lock().get_mut(&id) {
            if !job.status.is_terminal() {
                job.status = status;
            }
        }
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.lock().get(&id).map(|job| job.status)
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.lock().get(&id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().expect("job registry lock poisoned")
    }
}
