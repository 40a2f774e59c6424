//! Loop thread management
//!
//! Each [`LoopThread`] is one OS thread running one [`EventLoop`] until it
//! is stopped. The loop keeps its waker referenced so it stays up with no
//! registrations, and runs an unreferenced heartbeat timer that delivers
//! `on_tick` to every handler.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use sluice_core::error::{Result, TransportError};

use crate::event_loop::{EventLoop, LoopHandle, LoopStopper, RunMode};

/// One loop on its own OS thread
pub struct LoopThread {
    index: usize,
    handle: LoopHandle,
    stopper: LoopStopper,
    /// Receives `run`'s return code once the loop thread is done
    done: Receiver<i32>,
    join: Option<JoinHandle<()>>,
}

impl LoopThread {
    /// Spawn `sluice-loop-{index}` and wait until its loop is running.
    pub fn start(index: usize, heartbeat: Duration) -> Result<Self> {
        let (init_tx, init_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let join = thread::Builder::new()
            .name(format!("sluice-loop-{}", index))
            .spawn(move || {
                let mut lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                lp.ref_waker();
                let heartbeat_timer = lp.add_timer(heartbeat, Some(heartbeat), |lp, _| lp.tick_handlers());
                lp.set_timer_ref(heartbeat_timer, false);
                let _ = init_tx.send(Ok((lp.handle(), lp.stopper())));

                tracing::debug!(loop_index = index, "loop started");
                let rc = lp.run(RunMode::Default);
                tracing::debug!(loop_index = index, rc, handlers = lp.handler_count(), "loop exited");
                // Remaining handlers release their handles here.
                drop(lp);
                let _ = done_tx.send(rc);
            })
            .map_err(|e| TransportError::Initialization {
                what: "loop thread",
                errno: e.raw_os_error().unwrap_or(0),
            })?;

        match init_rx.recv() {
            Ok(Ok((handle, stopper))) => Ok(Self {
                index,
                handle,
                stopper,
                done: done_rx,
                join: Some(join),
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(TransportError::LoopStopped)
            }
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Run `f` on this loop.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.handle.post(f)
    }

    /// Close every handler and wait up to `timeout` for the loop to drain.
    /// Falls back to a hard stop. Returns `true` when the loop drained on
    /// its own.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(join) = self.join.take() else {
            return true;
        };

        let graceful = match self.handle.post(|lp| {
            lp.close_all();
            lp.unref_waker();
        }) {
            Ok(()) => match self.done.recv_timeout(timeout) {
                Ok(_) => true,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        loop_index = self.index,
                        timeout_ms = timeout.as_millis() as u64,
                        "loop did not drain in time, stopping"
                    );
                    false
                }
                Err(RecvTimeoutError::Disconnected) => true,
            },
            // Already gone.
            Err(_) => true,
        };

        if !graceful {
            self.stopper.stop();
        }
        let _ = join.join();
        graceful
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop(Duration::from_millis(crate::config::defaults::SHUTDOWN_TIMEOUT_MS));
    }
}

impl std::fmt::Debug for LoopThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopThread")
            .field("index", &self.index)
            .field("running", &self.join.is_some())
            .finish()
    }
}
