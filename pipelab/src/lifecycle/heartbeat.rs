use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

use crate::running::RunningRegistry;

/// Heartbeat for one run, driven from its own OS thread so a step that
/// blocks its async worker cannot starve it.
///
/// Dropping the guard stops the thread and waits for any in-flight write;
/// no beat lands after the run is finalized.
pub(crate) struct HeartbeatGuard {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatGuard {
    pub(crate) fn spawn(running: RunningRegistry, pplid: String, period: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name("pipelab-heartbeat".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = running.heartbeat(&pplid) {
                            warn!(pplid = %pplid, error = %err, "Heartbeat failed; stopping");
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "Could not start heartbeat thread; run will not refresh");
                None
            }
        };
        Self {
            stop: Some(stop),
            handle,
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Heartbeat thread panicked");
            }
        }
    }
}
