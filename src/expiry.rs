//! Peer expiry manager
//!
//! Ordered-by-deadline collection of peer inactivity deadlines with its own
//! lock, independent from any per-peer structure. A background sweep wakes at
//! the nearest deadline, posts a state-timeout event to the peer's event
//! queue and removes the entry. Activity that should keep a peer alive goes
//! through `update`, which removes and reinserts the entry at its new
//! deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::event::PeerEvent;
use crate::peer::PeerHandle;

#[derive(Default)]
struct Entries {
    by_deadline: BTreeMap<(Instant, PeerHandle), mpsc::Sender<PeerEvent>>,
    by_peer: HashMap<PeerHandle, Instant>,
}

struct State {
    entries: Mutex<Entries>,
    changed: Notify,
    stopping: AtomicBool,
}

/// Timer structure tracking per-peer inactivity deadlines
pub struct ExpiryManager {
    state: Arc<State>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl ExpiryManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                entries: Mutex::new(Entries::default()),
                changed: Notify::new(),
                stopping: AtomicBool::new(false),
            }),
            sweep: Mutex::new(None),
        }
    }

    /// Spawn the background sweep task
    pub fn start(&self) {
        let mut sweep = self.sweep.lock().unwrap_or_else(|e| e.into_inner());
        if sweep.is_none() {
            let state = self.state.clone();
            *sweep = Some(tokio::spawn(run_sweep(state)));
        }
    }

    /// Move a peer's deadline, inserting it if absent
    pub fn update(&self, handle: PeerHandle, deadline: Instant, events: mpsc::Sender<PeerEvent>) {
        {
            let mut entries = self.state.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = entries.by_peer.remove(&handle) {
                entries.by_deadline.remove(&(old, handle));
            }
            entries.by_peer.insert(handle, deadline);
            entries.by_deadline.insert((deadline, handle), events);
        }
        self.state.changed.notify_one();
    }

    /// Drop a peer's deadline entirely
    pub fn remove(&self, handle: PeerHandle) {
        {
            let mut entries = self.state.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = entries.by_peer.remove(&handle) {
                entries.by_deadline.remove(&(old, handle));
            }
        }
        self.state.changed.notify_one();
    }

    /// Whether the peer currently has a deadline scheduled
    pub fn contains(&self, handle: PeerHandle) -> bool {
        let entries = self.state.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.by_peer.contains_key(&handle)
    }

    /// Stop the sweep task and drop all deadlines
    pub async fn shutdown(&self) {
        self.state.stopping.store(true, Ordering::SeqCst);
        self.state.changed.notify_one();
        let task = {
            let mut sweep = self.sweep.lock().unwrap_or_else(|e| e.into_inner());
            sweep.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut entries = self.state.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.by_deadline.clear();
        entries.by_peer.clear();
    }
}

impl Default for ExpiryManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_sweep(state: Arc<State>) {
    loop {
        if state.stopping.load(Ordering::SeqCst) {
            break;
        }

        let nearest = {
            let entries = state.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.by_deadline.keys().next().map(|(dl, _)| *dl)
        };

        match nearest {
            None => state.changed.notified().await,
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                        _ = state.changed.notified() => {}
                    }
                    continue;
                }

                // Pop the due entry under the lock, deliver outside it
                let due = {
                    let mut entries =
                        state.entries.lock().unwrap_or_else(|e| e.into_inner());
                    match entries.by_deadline.pop_first() {
                        Some(((dl, handle), tx)) if dl <= now => {
                            entries.by_peer.remove(&handle);
                            Some((handle, tx))
                        }
                        Some((key, tx)) => {
                            // raced with an update, put it back
                            entries.by_deadline.insert(key, tx);
                            None
                        }
                        None => None,
                    }
                };

                if let Some((handle, tx)) = due {
                    log::debug!("{handle} reached its inactivity deadline");
                    if tx.send(PeerEvent::Timeout).await.is_err() {
                        log::debug!("{handle} event queue gone, expiry dropped");
                    }
                }
            }
        }
    }
}
