use crate::CoreError;
use riptide_engine::UnitId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LockResult, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

/// Cooperative cancellation shared by every worker of one operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Trip this token on SIGINT. A second interrupt exits the process.
    ///
    /// Only one handler can be installed per process.
    pub fn cancel_on_ctrlc(&self) -> Result<(), CoreError> {
        let flag = Arc::clone(&self.flag);
        ctrlc::set_handler(move || {
            if flag.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
            eprintln!("\ncancellation requested, rolling back current operation...");
        })
        .map_err(|e| CoreError::Io(std::io::Error::other(e)))
    }
}

fn relock<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poisoned| {
        warn!("recovering poisoned lock");
        poisoned.into_inner()
    })
}

/// One execution token per unit; Start and Stop of the same unit never
/// overlap.
#[derive(Debug, Default)]
pub struct UnitLocks {
    tokens: Mutex<HashMap<UnitId, Arc<Mutex<()>>>>,
}

impl UnitLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self, unit: &UnitId) -> Arc<Mutex<()>> {
        let mut tokens = relock(self.tokens.lock());
        Arc::clone(tokens.entry(unit.clone()).or_default())
    }

    /// Run `f` while holding the unit's token.
    pub fn with<R>(&self, unit: &UnitId, f: impl FnOnce() -> R) -> R {
        let token = self.token(unit);
        let _guard = relock(token.lock());
        f()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed,
}

/// Readiness of the services of one start operation. Dependents block on
/// it until their dependencies settle.
#[derive(Debug, Default)]
pub struct ReadySignals {
    states: Mutex<HashMap<String, Readiness>>,
    changed: Condvar,
}

impl ReadySignals {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            states: Mutex::new(
                names
                    .into_iter()
                    .map(|n| (n.to_owned(), Readiness::Pending))
                    .collect(),
            ),
            changed: Condvar::new(),
        }
    }

    pub fn publish(&self, name: &str, readiness: Readiness) {
        relock(self.states.lock()).insert(name.to_owned(), readiness);
        self.changed.notify_all();
    }

    pub fn get(&self, name: &str) -> Readiness {
        relock(self.states.lock())
            .get(name)
            .copied()
            .unwrap_or(Readiness::Ready)
    }

    /// Block until `name` settles. Returns `Pending` if `cancel` trips
    /// first; a name this operation does not track counts as ready.
    pub fn wait(&self, name: &str, cancel: &CancelToken) -> Readiness {
        let mut states = relock(self.states.lock());
        loop {
            match states.get(name).copied() {
                None => return Readiness::Ready,
                Some(Readiness::Pending) => {}
                Some(settled) => return settled,
            }
            if cancel.is_cancelled() {
                return Readiness::Pending;
            }
            states = match self.changed.wait_timeout(states, Duration::from_millis(50)) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
