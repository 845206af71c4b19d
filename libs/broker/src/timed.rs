use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub const DEFAULT_PRIORITY: u8 = 10;

/// A deadline watchdog shared by the tunnel managers.
///
/// Registered entries expire `lifespan` after registration; on expiry the
/// completion predicate is evaluated and, when it says the work never
/// finished, the expiry callback runs exactly once. A dedicated worker thread
/// wakes every tick and drains all due entries. Ties on the deadline are
/// broken by priority (lower first), then registration order.
pub struct TimedTransactions {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    tick: Duration,
}

struct State {
    queue: BTreeMap<(Instant, u8, u64), Entry>,
    next_seq: u64,
    exiting: bool,
}

struct Entry {
    // Checks completion and, if incomplete, consumes the item.
    fire: Box<dyn FnOnce(Instant) + Send>,
}

impl TimedTransactions {
    pub fn new(tick: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: BTreeMap::new(),
                    next_seq: 0,
                    exiting: false,
                }),
                wake: Condvar::new(),
                tick,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Registers `item` for expiry `lifespan` from now.
    ///
    /// A no-op after [`terminate`](Self::terminate).
    pub fn register<T: Send + 'static>(
        &self,
        item: T,
        is_complete: impl FnOnce(&T) -> bool + Send + 'static,
        on_expire: impl FnOnce(T, Instant) + Send + 'static,
        lifespan: Duration,
        priority: u8,
    ) {
        let mut state = self.shared.state.lock();
        if state.exiting {
            return;
        }

        let deadline = Instant::now() + lifespan;
        let seq = state.next_seq;
        state.next_seq += 1;

        state.queue.insert(
            (deadline, priority, seq),
            Entry {
                fire: Box::new(move |now| {
                    if !is_complete(&item) {
                        on_expire(item, now);
                    }
                }),
            },
        );
    }

    /// Spawns the worker thread. Call once.
    pub fn start(&self) {
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("timed-transactions".to_owned())
            .spawn(move || run(&shared))
            .expect("spawning the watchdog thread cannot fail under normal conditions");

        *self.worker.lock() = Some(handle);
    }

    /// Drops every pending entry without firing it.
    pub fn cancel_all(&self) {
        self.shared.state.lock().queue.clear();
    }

    /// Stops the worker and drops all pending entries. Idempotent; subsequent
    /// [`register`](Self::register) calls become no-ops.
    ///
    /// Must not be called from inside an expiry callback.
    pub fn terminate(&self) {
        {
            let mut state = self.shared.state.lock();
            state.exiting = true;
            state.queue.clear();
        }
        self.shared.wake.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Watchdog worker panicked");
            }
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

impl Drop for TimedTransactions {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();

    loop {
        shared.wake.wait_for(&mut state, shared.tick);
        if state.exiting {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(entry) = state.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }

        if due.is_empty() {
            continue;
        }

        // Callbacks run without the lock so they may re-register.
        drop(state);
        for entry in due {
            if catch_unwind(AssertUnwindSafe(|| (entry.fire)(now))).is_err() {
                tracing::error!("Expiry callback panicked; watchdog continues");
            }
        }
        state = shared.state.lock();
    }
}
