//! Background checkpointer
//!
//! Wakes on a fixed cadence and writes a snapshot once enough log has
//! accumulated since the previous one, keeping replay time and log size
//! bounded. The thread holds only a weak reference to the environment and
//! exits on its own when the environment is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::env::EnvShared;
use crate::error::{KvError, KvResult};

/// Granularity at which the sleeping thread notices a shutdown request
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// Counters shared between the environment and its checkpointer.
#[derive(Debug, Default)]
pub struct CheckpointStats {
    cycles: AtomicU64,
    checkpoints: AtomicU64,
}

impl CheckpointStats {
    /// Wake-ups completed by the background thread.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Snapshots written, by either the thread or explicit calls.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    pub(crate) fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to the running checkpointer thread.
///
/// Dropping the handle only signals the thread; `shutdown` also waits for
/// it, which must not be done from the checkpointer thread itself.
pub struct CheckpointHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CheckpointHandle {
    /// Request shutdown and wait for the thread to finish its cycle.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for CheckpointHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Spawn the checkpointer for `env`.
pub(crate) fn start_checkpointer(env: Weak<EnvShared>, cadence: Duration) -> KvResult<CheckpointHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    let thread = thread::Builder::new()
        .name("nodestore-checkpoint".to_string())
        .spawn(move || checkpoint_loop(env, cadence, flag))
        .map_err(|e| KvError::Io {
            path: None,
            kind: std::io::ErrorKind::Other,
            detail: format!("Failed to spawn checkpoint thread: {}", e),
        })?;

    Ok(CheckpointHandle { shutdown, thread: Some(thread) })
}

fn checkpoint_loop(env: Weak<EnvShared>, cadence: Duration, shutdown: Arc<AtomicBool>) {
    loop {
        let wake_time = Instant::now() + cadence;
        while Instant::now() < wake_time {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(SHUTDOWN_POLL.min(cadence));
        }

        let Some(env) = env.upgrade() else { return };
        match env.checkpoint_if_due() {
            Ok(Some(result)) => debug!(
                covered = result.covered_sequence,
                entries = result.entries,
                "background checkpoint written"
            ),
            Ok(None) => {}
            Err(KvError::Closed) => return,
            Err(e) => warn!(error = %e, "background checkpoint failed"),
        }
        env.stats().record_cycle();
    }
}
