//! Tick Runner - Background thread that ticks the match world at regular intervals

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::events::{MatchEvent, TickReport};
use crate::world::MatchWorld;

/// Runner that owns a background thread ticking a shared world
pub struct TickRunner {
    is_running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl TickRunner {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Start ticking at the given interval
    ///
    /// # Arguments
    /// * `world` - Shared match world
    /// * `interval_ms` - Milliseconds between ticks
    /// * `callback` - Receives each tick's report and the events it produced,
    ///   called outside the world lock
    pub fn start<F>(&mut self, world: Arc<Mutex<MatchWorld>>, interval_ms: u64, mut callback: F)
    where
        F: FnMut(TickReport, Vec<MatchEvent>) + Send + 'static,
    {
        if self.is_running.load(Ordering::Relaxed) {
            warn!("Tick runner already running");
            return;
        }

        info!("Starting tick runner ({}ms intervals)", interval_ms);
        self.is_running.store(true, Ordering::Relaxed);
        let running = Arc::clone(&self.is_running);

        let handle = thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let (report, events) = {
                    let mut w = world.lock().unwrap_or_else(PoisonError::into_inner);
                    let report = w.tick();
                    (report, w.drain_events())
                };

                callback(report, events);

                thread::sleep(Duration::from_millis(interval_ms));
            }
            info!("Tick runner thread stopped");
        });

        self.thread_handle = Some(handle);
    }

    /// Stop ticking and wait for the thread to finish
    pub fn stop(&mut self) {
        if !self.is_running.load(Ordering::Relaxed) {
            return;
        }

        info!("Stopping tick runner...");
        self.is_running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("Tick runner thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }
}

impl Default for TickRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TickRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
