//! Process-wide maintenance gate for start/stop requests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A flag that rejects start/stop requests while maintenance runs.
///
/// Blocking arms an auto-unblock timer; arming again replaces the previous
/// timer, and an explicit unblock cancels it.
#[derive(Debug, Default)]
pub struct BlockGate {
    state: Mutex<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    blocked: bool,
    deadline: Option<Instant>,
    unblock_task: Option<JoinHandle<()>>,
}

impl BlockGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blocked(&self) -> bool {
        self.lock().blocked
    }

    /// When the gate will lift itself, if it is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    /// Block operations for `duration`, replacing any previous timer.
    pub fn block(self: &Arc<Self>, duration: Duration) {
        let mut state = self.lock();
        state.blocked = true;
        state.deadline = Some(Instant::now() + duration);
        if let Some(task) = state.unblock_task.take() {
            task.abort();
        }
        let gate = Arc::clone(self);
        state.unblock_task = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut state = gate.lock();
            state.blocked = false;
            state.deadline = None;
            state.unblock_task = None;
            tracing::info!("Auto unblock complete");
        }));
    }

    /// Lift the gate and cancel any pending auto-unblock.
    pub fn unblock(&self) {
        let mut state = self.lock();
        state.blocked = false;
        state.deadline = None;
        if let Some(task) = state.unblock_task.take() {
            task.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().expect("block gate lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn gate_lifts_itself_at_the_deadline() {
        let gate = Arc::new(BlockGate::new());
        gate.block(Duration::from_secs(60));
        assert!(gate.is_blocked());
        assert!(gate.deadline().is_some());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(gate.is_blocked());

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(!gate.is_blocked());
        assert!(gate.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_unblock_cancels_the_timer() {
        let gate = Arc::new(BlockGate::new());
        gate.block(Duration::from_secs(60));
        gate.unblock();
        assert!(!gate.is_blocked());

        // The cancelled timer must not flip anything later.
        tokio::time::sleep(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert!(!gate.is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn re_blocking_replaces_the_timer() {
        let gate = Arc::new(BlockGate::new());
        gate.block(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(5)).await;
        gate.block(Duration::from_secs(10));

        // The first timer would have fired here; the replacement keeps the
        // gate closed.
        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(gate.is_blocked());

        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(!gate.is_blocked());
    }
}
