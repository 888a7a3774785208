//! Sandbox state store, memory backend.
//!
//! Sandboxes live in a concurrent map keyed by sandbox id; each entry's
//! state and in-flight transition handle are protected by an entry-level
//! mutex, so transitions are linearized per sandbox. A transition is a
//! single-shot [`ErrorOnce`]: the one caller that installed it finishes it
//! through a [`TransitionHandle`]; everyone else waits on the cell. A failed
//! transition is sticky: the handle keeps the error and later attempts
//! return it until [`MemoryStore::clear_failed_transition`] resets the entry.

pub mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use log::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sync::cancel::CancelToken;
use crate::sync::once::ErrorOnce;

pub use state::{RemoveAction, SandboxState};

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub sandbox_id: String,
    pub team_id: Uuid,
    pub state: SandboxState,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub max_instance_length: Duration,
    pub node_id: String,
    pub metadata: HashMap<String, String>,
}

impl Sandbox {
    pub fn new(sandbox_id: impl Into<String>, team_id: Uuid, node_id: impl Into<String>) -> Self {
        Sandbox {
            sandbox_id: sandbox_id.into(),
            team_id,
            state: SandboxState::Running,
            start_time: SystemTime::now(),
            end_time: None,
            max_instance_length: Duration::from_secs(60 * 60),
            node_id: node_id.into(),
            metadata: HashMap::new(),
        }
    }
}

struct Transition {
    target: SandboxState,
    once: Arc<ErrorOnce>,
}

struct EntryData {
    sandbox: Sandbox,
    transition: Option<Transition>,
}

struct Entry {
    data: Mutex<EntryData>,
}

/// Outcome of [`MemoryStore::start_removing`].
pub enum Removal {
    /// The sandbox is already in (or past) the requested state; someone
    /// else's transition completed.
    AlreadyDone,
    /// This caller owns the transition and must finish it.
    Started(TransitionHandle),
}

impl Removal {
    pub fn is_already_done(&self) -> bool {
        matches!(self, Removal::AlreadyDone)
    }
}

/// The single writer's side of an installed transition. Must be finished
/// exactly once; dropping it unfinished records a cancellation error so
/// waiters are never stranded.
pub struct TransitionHandle {
    entry: Arc<Entry>,
    action: RemoveAction,
    once: Arc<ErrorOnce>,
    finished: bool,
}

impl TransitionHandle {
    /// Completes the transition. On success the sandbox settles in the
    /// action's terminal state and the handle is cleared; on failure the
    /// handle stays installed with the error recorded (sticky).
    pub fn finish(mut self, result: Result<()>) {
        self.do_finish(result);
    }

    fn do_finish(&mut self, result: Result<()>) {
        if self.finished {
            return;
        }
        self.finished = true;
        match result {
            Ok(()) => {
                {
                    let mut data = self.entry.data.lock().unwrap();
                    data.sandbox.state = self.action.terminal();
                    data.transition = None;
                }
                let _ = self.once.set_ok();
            }
            Err(e) => {
                let _ = self.once.set_error(e);
            }
        }
    }
}

impl Drop for TransitionHandle {
    fn drop(&mut self) {
        self.do_finish(Err(Error::Canceled));
    }
}

pub struct MemoryStore {
    entries: DashMap<String, Arc<Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            entries: DashMap::new(),
        }
    }

    fn entry(&self, sandbox_id: &str) -> Result<Arc<Entry>> {
        self.entries
            .get(sandbox_id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::NotFound {
                sandbox_id: sandbox_id.to_string(),
            })
    }

    pub fn add(&self, sandbox: Sandbox) -> Result<()> {
        use dashmap::mapref::entry::Entry as MapEntry;
        match self.entries.entry(sandbox.sandbox_id.clone()) {
            MapEntry::Occupied(_) => Err(Error::AlreadyExists(sandbox.sandbox_id)),
            MapEntry::Vacant(slot) => {
                slot.insert(Arc::new(Entry {
                    data: Mutex::new(EntryData {
                        sandbox,
                        transition: None,
                    }),
                }));
                Ok(())
            }
        }
    }

    pub fn get(&self, sandbox_id: &str) -> Result<Sandbox> {
        let entry = self.entry(sandbox_id)?;
        let data = entry.data.lock().unwrap();
        Ok(data.sandbox.clone())
    }

    pub fn remove(&self, sandbox_id: &str) {
        self.entries.remove(sandbox_id);
    }

    pub fn update<F>(&self, sandbox_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Sandbox),
    {
        let entry = self.entry(sandbox_id)?;
        let mut data = entry.data.lock().unwrap();
        f(&mut data.sandbox);
        Ok(())
    }

    pub fn team_items(&self, team_id: Uuid) -> Vec<Sandbox> {
        self.entries
            .iter()
            .filter_map(|e| {
                let data = e.value().data.lock().unwrap();
                (data.sandbox.team_id == team_id).then(|| data.sandbox.clone())
            })
            .collect()
    }

    pub fn all_items(&self) -> Vec<Sandbox> {
        self.entries
            .iter()
            .map(|e| e.value().data.lock().unwrap().sandbox.clone())
            .collect()
    }

    /// Reconciles this store with the authoritative list of sandboxes
    /// reported running on `node_id`: unseen sandboxes are inserted, known
    /// ones have their descriptive fields refreshed, and entries of that
    /// node that are no longer reported (and have no transition in flight)
    /// are evicted.
    pub fn sync(&self, running: Vec<Sandbox>, node_id: &str) {
        let mut seen: Vec<String> = Vec::with_capacity(running.len());
        for sandbox in running {
            seen.push(sandbox.sandbox_id.clone());
            match self.entry(&sandbox.sandbox_id) {
                Ok(entry) => {
                    let mut data = entry.data.lock().unwrap();
                    data.sandbox.team_id = sandbox.team_id;
                    data.sandbox.start_time = sandbox.start_time;
                    data.sandbox.max_instance_length = sandbox.max_instance_length;
                    data.sandbox.node_id = sandbox.node_id;
                    data.sandbox.metadata = sandbox.metadata;
                }
                Err(_) => {
                    let _ = self.add(sandbox);
                }
            }
        }
        self.entries.retain(|id, entry| {
            let data = entry.data.lock().unwrap();
            if data.sandbox.node_id != node_id || seen.iter().any(|s| s == id) {
                return true;
            }
            if data.transition.is_some() {
                return true;
            }
            debug!("evicting sandbox {id} no longer reported by {node_id}");
            false
        });
    }

    /// Requests that `sandbox_id` move toward `action`'s state.
    ///
    /// Exactly one concurrent caller per transition receives
    /// [`Removal::Started`]; the rest wait for that transition and get
    /// [`Removal::AlreadyDone`] (same target) or recurse (valid follow-on).
    /// A previously failed transition's error is returned to every attempt
    /// until the entry is reset.
    pub fn start_removing(
        &self,
        token: &CancelToken,
        sandbox_id: &str,
        action: RemoveAction,
    ) -> Result<Removal> {
        let target = action.target();
        loop {
            token.check()?;
            let entry = self.entry(sandbox_id)?;
            let wait_cell: Arc<ErrorOnce>;
            let is_same_target: bool;
            {
                let mut data = entry.data.lock().unwrap();

                // Only failed transitions persist after resolution; surface
                // the sticky error, or clear a stale success and retry.
                if let Some(resolved) = data.transition.as_ref().and_then(|tr| tr.once.peek()) {
                    resolved?;
                    data.transition = None;
                    continue;
                }

                if let Some(tr) = &data.transition {
                    if tr.target == target {
                        is_same_target = true;
                        wait_cell = tr.once.clone();
                    } else if tr.target.can_transition_to(target) {
                        is_same_target = false;
                        wait_cell = tr.once.clone();
                    } else {
                        return Err(Error::InvalidTransition {
                            from: tr.target,
                            to: target,
                        });
                    }
                } else {
                    let state = data.sandbox.state;
                    if state == target || state == action.terminal() {
                        return Ok(Removal::AlreadyDone);
                    }
                    if !state.can_transition_to(target) {
                        return Err(Error::InvalidTransition { from: state, to: target });
                    }
                    let once = Arc::new(ErrorOnce::new());
                    data.transition = Some(Transition {
                        target,
                        once: once.clone(),
                    });
                    data.sandbox.state = target;
                    // The sandbox is on its way out; mark it expired.
                    data.sandbox.end_time = Some(SystemTime::now());
                    return Ok(Removal::Started(TransitionHandle {
                        entry: entry.clone(),
                        action,
                        once,
                        finished: false,
                    }));
                }
            }

            // Wait outside the entry lock.
            wait_cell.wait_with(token)?;
            if is_same_target {
                return Ok(Removal::AlreadyDone);
            }
            // Valid follow-on: re-evaluate against the settled state.
        }
    }

    /// Resolves when any in-flight transition on `sandbox_id` finishes,
    /// propagating its error. No transition resolves immediately.
    pub fn wait_for_state_change(&self, token: &CancelToken, sandbox_id: &str) -> Result<()> {
        let entry = self.entry(sandbox_id)?;
        let cell = {
            let data = entry.data.lock().unwrap();
            match &data.transition {
                Some(tr) => tr.once.clone(),
                None => return Ok(()),
            }
        };
        cell.wait_with(token)
    }

    /// Clears a failed (sticky) transition so the state machine can move
    /// again. The external actor is expected to have repaired the sandbox.
    pub fn clear_failed_transition(&self, sandbox_id: &str, state: SandboxState) -> Result<()> {
        let entry = self.entry(sandbox_id)?;
        let mut data = entry.data.lock().unwrap();
        data.transition = None;
        data.sandbox.state = state;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
