use log::warn;
use std::panic::Location;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Identity of the task currently holding the bus.
#[derive(Debug, Clone)]
pub struct BusOwner {
    pub task: String,
    pub call_site: String,
    pub since: Instant,
}

/// Diagnostic view of the guard state, safe to log from any task.
#[derive(Debug, Clone)]
pub struct GuardSnapshot {
    pub locked: bool,
    pub owner_task: Option<String>,
    pub call_site: Option<String>,
    pub held_for: Option<Duration>,
}

#[derive(Default)]
struct GuardState {
    owner: Option<BusOwner>,
    owner_thread: Option<ThreadId>,
}

/// Mutual exclusion over the physical RS-485 bus.
///
/// The half-duplex bus admits exactly one transaction at a time; every polling
/// task must hold this guard for the full request/response window. The guard
/// is a bounded-wait lock, not a queue: `try_acquire` gives up after the
/// caller's timeout and the caller is expected to back off and retry.
///
/// Constructed once at startup and shared by handle (`Arc<BusGuard>`); there
/// is deliberately no global instance.
pub struct BusGuard {
    state: Mutex<GuardState>,
    freed: Condvar,
}

impl Default for BusGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl BusGuard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GuardState::default()),
            freed: Condvar::new(),
        }
    }

    fn task_name() -> String {
        let current = thread::current();
        match current.name() {
            Some(name) => name.to_string(),
            None => format!("{:?}", current.id()),
        }
    }

    /// Attempt to claim exclusive bus ownership within `timeout`.
    ///
    /// Returns `false` on timeout; the caller must treat the bus as busy.
    /// Records the owning task and call-site for deadlock diagnostics.
    #[track_caller]
    pub fn try_acquire(&self, timeout: Duration) -> bool {
        let call_site = Location::caller().to_string();
        let deadline = Instant::now() + timeout;

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while state.owner.is_some() {
            let now = Instant::now();
            if now >= deadline {
                if let Some(owner) = &state.owner {
                    warn!(
                        "bus guard timeout after {:?}; held by {} ({}) for {:?}",
                        timeout,
                        owner.task,
                        owner.call_site,
                        owner.since.elapsed()
                    );
                }
                return false;
            }
            let (next, _) = match self.freed.wait_timeout(state, deadline - now) {
                Ok(res) => res,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = next;
        }

        state.owner = Some(BusOwner {
            task: Self::task_name(),
            call_site,
            since: Instant::now(),
        });
        state.owner_thread = Some(thread::current().id());
        true
    }

    /// Release ownership. Only the current owner should call this; the bus
    /// itself has no enforcement, so a mismatched release is logged and the
    /// lock is cleared anyway.
    pub fn release(&self) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.owner.take() {
            None => {
                warn!("bus guard release without matching acquire");
            }
            Some(owner) => {
                if state.owner_thread != Some(thread::current().id()) {
                    warn!(
                        "bus guard released by {} but held by {} ({})",
                        Self::task_name(),
                        owner.task,
                        owner.call_site
                    );
                }
            }
        }
        state.owner_thread = None;
        self.freed.notify_one();
    }

    /// Administrative override: clear a lock whose owner died without
    /// releasing. Never called automatically: a forced release during a
    /// borderline race would let two tasks both believe they own the bus.
    pub fn force_release(&self) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.owner.take() {
            Some(owner) => warn!(
                "bus guard force-released; evicted {} ({}) after {:?}",
                owner.task,
                owner.call_site,
                owner.since.elapsed()
            ),
            None => warn!("bus guard force-release on an unlocked guard"),
        }
        state.owner_thread = None;
        self.freed.notify_all();
    }

    /// Current lock state for logging and diagnostics.
    pub fn snapshot(&self) -> GuardSnapshot {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &state.owner {
            Some(owner) => GuardSnapshot {
                locked: true,
                owner_task: Some(owner.task.clone()),
                call_site: Some(owner.call_site.clone()),
                held_for: Some(owner.since.elapsed()),
            },
            None => GuardSnapshot {
                locked: false,
                owner_task: None,
                call_site: None,
                held_for: None,
            },
        }
    }
}
