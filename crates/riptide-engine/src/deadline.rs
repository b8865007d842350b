//! Deadlines, timeout wrapping and readiness polling.

use crate::EngineError;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Absolute point in time after which a call counts as unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// The duration this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// Run `call` on a worker thread and wait for it until `deadline`.
///
/// A call that outlives its deadline yields [`EngineError::Timeout`]; the
/// worker is left to finish on its own and its result is dropped.
pub fn call_with_deadline<T, F>(
    operation: &str,
    deadline: Deadline,
    call: F,
) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    let timeout = || EngineError::Timeout {
        operation: operation.to_owned(),
        after: deadline.budget(),
    };
    if deadline.expired() {
        return Err(timeout());
    }

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("engine-{operation}"))
        .spawn(move || {
            let _ = tx.send(call());
        })?;

    match rx.recv_timeout(deadline.remaining()) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!("{operation} did not answer within {:?}", deadline.budget());
            Err(timeout())
        }
        Err(RecvTimeoutError::Disconnected) => Err(EngineError::Backend(format!(
            "{operation}: worker exited without a result"
        ))),
    }
}

/// Call `check` every `interval` until it returns true or `deadline` passes.
/// The check always runs at least once.
pub fn poll_until(deadline: Deadline, interval: Duration, mut check: impl FnMut() -> bool) -> bool {
    loop {
        if check() {
            return true;
        }
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return false;
        }
        thread::sleep(interval.min(remaining));
    }
}

pub fn tcp_reachable(addr: SocketAddr, timeout: Duration) -> bool {
    TcpStream::connect_timeout(&addr, timeout.max(Duration::from_millis(1))).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fast_call_returns_its_result() {
        let result = call_with_deadline("start", Deadline::after(Duration::from_secs(5)), || Ok(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn backend_error_is_not_a_timeout() {
        let result: Result<(), _> =
            call_with_deadline("start", Deadline::after(Duration::from_secs(5)), || {
                Err(EngineError::Backend("image not found".to_owned()))
            });
        assert!(matches!(result, Err(EngineError::Backend(_))));
    }

    #[test]
    fn slow_call_times_out() {
        let result = call_with_deadline("stop", Deadline::after(Duration::from_millis(50)), || {
            thread::sleep(Duration::from_secs(2));
            Ok(())
        });
        match result {
            Err(EngineError::Timeout { operation, after }) => {
                assert_eq!(operation, "stop");
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn expired_deadline_never_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let deadline = Deadline::after(Duration::ZERO);
        let result = call_with_deadline("exec", deadline, move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(result, Err(EngineError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn polling_stops_when_check_passes() {
        let mut n = 0;
        let ok = poll_until(
            Deadline::after(Duration::from_secs(5)),
            Duration::from_millis(1),
            || {
                n += 1;
                n == 3
            },
        );
        assert!(ok);
        assert_eq!(n, 3);
    }

    #[test]
    fn polling_gives_up_at_deadline() {
        let started = Instant::now();
        let ok = poll_until(
            Deadline::after(Duration::from_millis(30)),
            Duration::from_millis(5),
            || false,
        );
        assert!(!ok);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn tcp_reachability_follows_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(tcp_reachable(addr, Duration::from_secs(1)));
        drop(listener);
        assert!(!tcp_reachable(addr, Duration::from_millis(200)));
    }
}
