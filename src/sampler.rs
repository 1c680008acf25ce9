//! Interval samplers.
//!
//! A sampler owns one named thread.  It idles until the designated
//! store's bind-complete hook signals the start event, then runs its
//! tick closure once per interval until the tick declines or the
//! context stops it.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{TraceResult, TraceStoreError};
use crate::sync::Event;

/// Poll step while waiting for the start signal, so stop requests are
/// honored before the designated store ever binds.
const START_POLL: Duration = Duration::from_millis(20);

type Tick = Box<dyn FnMut() -> bool + Send + 'static>;

pub(crate) struct Sampler {
    name: String,
    stop: Arc<Event>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    pub(crate) fn spawn(
        name: &str,
        interval: Duration,
        start: Arc<Event>,
        mut tick: Tick,
    ) -> TraceResult<Self> {
        let stop = Arc::new(Event::new());
        let thread_stop = stop.clone();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                loop {
                    if thread_stop.wait_timeout(START_POLL) {
                        return;
                    }
                    if start.is_signaled() {
                        break;
                    }
                }
                debug!(sampler = %thread_name, "sampler started");
                loop {
                    if thread_stop.wait_timeout(interval) {
                        return;
                    }
                    if !tick() {
                        debug!(sampler = %thread_name, "sampler retired");
                        return;
                    }
                }
            })
            .map_err(TraceStoreError::Io)?;
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(mut self) {
        self.stop.signal();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(sampler = %self.name, "sampler thread panicked");
            }
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop.signal();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
