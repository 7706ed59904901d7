//! Drives the engine from two trigger sources: the container lifecycle
//! event stream and a fixed-interval sweep.
//!
//! Both loops observe a cooperative stop signal at every wait point and
//! finish any write already in flight before exiting. The dedup window is
//! the only state shared with event handling; the same lifecycle
//! transition is often delivered more than once, and within the window a
//! container id triggers exactly one conversion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::models::EventMessage;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;

use crate::orchestrator::Orchestrator;
use crate::reconciler::Reconciler;

/// Backoff after the event stream fails before resubscribing.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(3);

/// Bounded, time-evicted record of recently processed container ids.
pub struct DedupWindow {
    seen: Mutex<HashMap<String, Instant>>,
    window: Duration,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
            capacity,
        }
    }

    /// Records an id and reports whether this is its first sighting within
    /// the eviction window.
    pub async fn first_sighting(&self, id: &str) -> bool {
        let mut seen = self.seen.lock().await;
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        if seen.contains_key(id) {
            return false;
        }
        if seen.len() >= self.capacity {
            if let Some(oldest) = seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone())
            {
                seen.remove(&oldest);
            }
        }
        seen.insert(id.to_string(), now);
        true
    }
}

pub struct Scheduler {
    engine: Arc<Reconciler>,
    orchestrator: Arc<dyn Orchestrator>,
    dedup: DedupWindow,
    sweep_interval: Duration,
}

impl Scheduler {
    pub fn new(
        engine: Arc<Reconciler>,
        orchestrator: Arc<dyn Orchestrator>,
        dedup: DedupWindow,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            engine,
            orchestrator,
            dedup,
            sweep_interval,
        }
    }

    /// Consumes the lifecycle event stream, converting each newly seen
    /// container once. Stream errors resubscribe after a short delay;
    /// resubscription only yields future events, which the periodic sweep
    /// compensates for.
    pub async fn run_event_watcher(&self, mut stop: watch::Receiver<bool>) {
        info!("Listening for container lifecycle events...");
        loop {
            let mut stream = self.orchestrator.subscribe_events();
            loop {
                let event = tokio::select! {
                    _ = stop.changed() => return,
                    event = stream.next() => event,
                };
                match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(err)) => {
                        error!("Event stream error: {err}");
                        break;
                    }
                    None => break,
                }
            }
            drop(stream);
            warn!("Event stream ended; resubscribing shortly.");
            tokio::select! {
                _ = stop.changed() => return,
                _ = sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }

    async fn handle_event(&self, event: EventMessage) {
        let Some(actor) = event.actor else { return };
        let Some(id) = actor.id.filter(|id| !id.is_empty()) else {
            return;
        };
        let action = event.action.unwrap_or_default();
        if action != "create" && action != "start" {
            return;
        }
        if !self.dedup.first_sighting(&id).await {
            debug!("Duplicate event for container '{id}' within dedup window.");
            return;
        }
        debug!("Container event: {action} for {id}");
        if let Err(err) = self.engine.convert(&id).await {
            error!("Failed to convert container '{id}': {err}");
        }
    }

    /// Runs a full reconciliation sweep immediately and then at the
    /// configured interval until stopped.
    pub async fn run_sweeper(&self, mut stop: watch::Receiver<bool>) {
        loop {
            if let Err(err) = self.engine.reconcile_all().await {
                error!("Reconciliation sweep failed: {err}");
            }
            tokio::select! {
                _ = stop.changed() => return,
                _ = sleep(self.sweep_interval) => {}
            }
        }
    }
}
