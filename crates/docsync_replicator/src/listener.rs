//! Listener registration and ordered delivery.
//!
//! Each session owns one dispatcher thread. Notifications are queued to it
//! in the order the session produces them, and it hands each one to every
//! listener's [`SerialExecutor`]. A listener therefore observes events in
//! production order and never runs concurrently with itself.
//!
//! The set of recipients is fixed when a notification is produced, so a
//! listener added after the final `Stopped` status never hears from the
//! session. A panicking listener is logged and skipped; delivery to the
//! others continues.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::warn;

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs `task`, containing a panic to the task itself.
fn run_contained(task: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        warn!(panic = %message, "listener panicked; notification skipped");
    }
}

/// Runs tasks one at a time, in submission order.
pub trait SerialExecutor: Send + Sync {
    /// Queues `task`.
    fn execute(&self, task: Task);
}

/// Runs tasks on the session's dispatcher thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl SerialExecutor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// Runs tasks on a dedicated thread.
pub struct ThreadExecutor {
    tx: Mutex<Option<Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl ThreadExecutor {
    /// Spawns the executor thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            for task in rx {
                run_contained(task);
            }
        })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl SerialExecutor for ThreadExecutor {
    fn execute(&self, task: Task) {
        if let Some(tx) = self.tx.lock().as_ref() {
            if tx.send(task).is_err() {
                warn!("listener executor has exited; dropping notification");
            }
        }
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if thread::current().id() != self.thread_id {
                let _ = handle.join();
            }
        }
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

struct Registered<E> {
    token: ListenerToken,
    executor: Arc<dyn SerialExecutor>,
    callback: Arc<dyn Fn(&E) + Send + Sync>,
}

impl<E> Clone for Registered<E> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            executor: Arc::clone(&self.executor),
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Listeners for one kind of event.
pub(crate) struct Listeners<E> {
    entries: Mutex<Vec<Registered<E>>>,
}

impl<E: Clone + Send + 'static> Listeners<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(
        &self,
        executor: Arc<dyn SerialExecutor>,
        callback: Arc<dyn Fn(&E) + Send + Sync>,
    ) -> ListenerToken {
        let token = ListenerToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Registered {
            token,
            executor,
            callback,
        });
        token
    }

    pub(crate) fn remove(&self, token: ListenerToken) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|r| r.token != token);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Queues `event` for every listener registered right now.
    pub(crate) fn notify(&self, dispatcher: &Dispatcher, event: E) {
        let targets = self.entries.lock().clone();
        if targets.is_empty() {
            return;
        }
        dispatcher.dispatch(Box::new(move || {
            for target in targets {
                let event = event.clone();
                let callback = target.callback;
                target.executor.execute(Box::new(move || run_contained(|| callback(&event))));
            }
        }));
    }
}

/// The per-session delivery thread, spawned on first use.
pub(crate) struct Dispatcher {
    name: String,
    tx: Mutex<Option<Sender<Task>>>,
}

impl Dispatcher {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            tx: Mutex::new(None),
        }
    }

    fn dispatch(&self, job: Task) {
        let mut tx = self.tx.lock();
        if tx.is_none() {
            let (sender, rx) = mpsc::channel::<Task>();
            let spawned = thread::Builder::new().name(self.name.clone()).spawn(move || {
                for job in rx {
                    run_contained(job);
                }
            });
            match spawned {
                Ok(_) => *tx = Some(sender),
                Err(err) => {
                    warn!(error = %err, "cannot spawn dispatcher; delivering inline");
                    drop(tx);
                    job();
                    return;
                }
            }
        }
        if let Some(sender) = tx.as_ref() {
            if sender.send(job).is_err() {
                warn!("dispatcher has exited; dropping notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn delivers_in_order() {
        let dispatcher = Dispatcher::new("test-dispatch".into());
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listeners.add(
            Arc::new(InlineExecutor),
            Arc::new(move |n: &u32| sink.lock().push(*n)),
        );

        for n in 0..100 {
            listeners.notify(&dispatcher, n);
        }
        wait_for(|| seen.lock().len() == 100);
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn thread_executor_preserves_order() {
        let dispatcher = Dispatcher::new("test-dispatch".into());
        let listeners = Listeners::<u32>::new();
        let executor = Arc::new(ThreadExecutor::new("test-listener").unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listeners.add(executor, Arc::new(move |n: &u32| sink.lock().push(*n)));

        for n in 0..50 {
            listeners.notify(&dispatcher, n);
        }
        wait_for(|| seen.lock().len() == 50);
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn late_listener_misses_earlier_events() {
        let dispatcher = Dispatcher::new("test-dispatch".into());
        let listeners = Listeners::<u32>::new();
        let early = Arc::new(Mutex::new(Vec::new()));
        let late = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&early);
        listeners.add(Arc::new(InlineExecutor), Arc::new(move |n: &u32| sink.lock().push(*n)));
        listeners.notify(&dispatcher, 1);

        let sink = Arc::clone(&late);
        listeners.add(Arc::new(InlineExecutor), Arc::new(move |n: &u32| sink.lock().push(*n)));
        listeners.notify(&dispatcher, 2);

        wait_for(|| early.lock().len() == 2 && late.lock().len() == 1);
        assert_eq!(*late.lock(), vec![2]);
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let dispatcher = Dispatcher::new("test-dispatch".into());
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        listeners.add(
            Arc::new(InlineExecutor),
            Arc::new(|n: &u32| {
                if *n == 1 {
                    panic!("listener failure");
                }
            }),
        );
        let sink = Arc::clone(&seen);
        listeners.add(
            Arc::new(InlineExecutor),
            Arc::new(move |n: &u32| sink.lock().push(*n)),
        );

        for n in 0..5 {
            listeners.notify(&dispatcher, n);
        }
        wait_for(|| seen.lock().len() == 5);
        assert_eq!(*seen.lock(), (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn thread_executor_survives_panicking_task() {
        let executor = ThreadExecutor::new("test-listener").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        executor.execute(Box::new(|| panic!("task failure")));
        let sink = Arc::clone(&seen);
        executor.execute(Box::new(move || sink.lock().push(1)));
        wait_for(|| seen.lock().len() == 1);
    }

    #[test]
    fn removed_listener_is_silent() {
        let dispatcher = Dispatcher::new("test-dispatch".into());
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let token = listeners.add(
            Arc::new(InlineExecutor),
            Arc::new(move |n: &u32| sink.lock().push(*n)),
        );

        assert!(listeners.remove(token));
        assert!(!listeners.remove(token));
        assert_eq!(listeners.len(), 0);
        listeners.notify(&dispatcher, 1);
        thread::sleep(Duration::from_millis(20));
        assert!(seen.lock().is_empty());
    }
}
