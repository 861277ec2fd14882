use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, error};

/// A deferred unit of work, run once on the host thread.
pub type QueuedTask = Box<dyn FnOnce() + Send + 'static>;

/// The host's cooperative scheduler. Callbacks handed to it run on the host
/// thread once per tick until the process exits.
pub trait HostScheduler {
    fn schedule_repeating(&mut self, callback: Box<dyn FnMut() + 'static>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub ran: usize,
    pub panicked: usize,
}

/// FIFO of callables produced on any thread and drained on the host thread.
///
/// Cloning yields another handle to the same queue.
/// - `enqueue` never blocks beyond a short internal lock and never drops
/// - `drain_once` runs only the tasks present when it starts
/// - a panicking task is isolated; the rest of the batch still runs
#[derive(Clone, Default)]
pub struct TaskQueue {
    inner: Arc<TaskQueueInner>,
}

#[derive(Default)]
struct TaskQueueInner {
    pending: Mutex<VecDeque<QueuedTask>>,
    registered: AtomicBool,
}

static GLOBAL_QUEUE: OnceLock<TaskQueue> = OnceLock::new();

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide queue.
    pub fn global() -> TaskQueue {
        GLOBAL_QUEUE.get_or_init(TaskQueue::new).clone()
    }

    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock_pending().push_back(Box::new(task));
    }

    pub fn len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every task queued before this call, in order. Tasks queued while
    /// the batch runs wait for the next call.
    pub fn drain_once(&self) -> DrainReport {
        let batch = std::mem::take(&mut *self.lock_pending());
        let mut report = DrainReport::default();
        for task in batch {
            report.ran += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                report.panicked += 1;
                error!(
                    panic = %panic_message(payload.as_ref()),
                    "queued task panicked; continuing with the rest of the batch"
                );
            }
        }
        if report.ran > 0 {
            debug!(ran = report.ran, panicked = report.panicked, "drained task queue");
        }
        report
    }

    /// Hooks `drain_once` into the host tick. Returns `false` without
    /// scheduling anything when this queue is already registered.
    pub fn register<S>(&self, scheduler: &mut S) -> bool
    where
        S: HostScheduler + ?Sized,
    {
        if self.inner.registered.swap(true, Ordering::SeqCst) {
            debug!("task queue already registered with host scheduler");
            return false;
        }
        let queue = self.clone();
        scheduler.schedule_repeating(Box::new(move || {
            queue.drain_once();
        }));
        true
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    // Tasks never run under this lock, so poisoning can only come from a
    // panic inside VecDeque itself; the data is still consistent.
    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<QueuedTask>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;

    use super::{HostScheduler, TaskQueue};

    #[derive(Default)]
    struct RecordingScheduler {
        callbacks: Vec<Box<dyn FnMut()>>,
    }

    impl HostScheduler for RecordingScheduler {
        fn schedule_repeating(&mut self, callback: Box<dyn FnMut() + 'static>) {
            self.callbacks.push(callback);
        }
    }

    #[test]
    fn drain_runs_tasks_in_fifo_order() {
        let queue = TaskQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for idx in 0..5 {
            let seen = Arc::clone(&seen);
            queue.enqueue(move || seen.lock().unwrap().push(idx));
        }
        let report = queue.drain_once();
        assert_eq!(report.ran, 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producers_keep_per_thread_order() {
        let queue = TaskQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let workers = (0..4)
            .map(|worker| {
                let queue = queue.clone();
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    for idx in 0..50 {
                        let seen = Arc::clone(&seen);
                        queue.enqueue(move || seen.lock().unwrap().push((worker, idx)));
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().unwrap();
        }

        let report = queue.drain_once();
        assert_eq!(report.ran, 200);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 200);
        for worker in 0..4 {
            let order = seen
                .iter()
                .filter(|(owner, _)| *owner == worker)
                .map(|(_, idx)| *idx)
                .collect::<Vec<_>>();
            assert_eq!(order, (0..50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn task_enqueued_during_drain_waits_for_next_tick() {
        let queue = TaskQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let inner_queue = queue.clone();
            let seen = Arc::clone(&seen);
            queue.enqueue(move || {
                seen.lock().unwrap().push("outer");
                let seen = Arc::clone(&seen);
                inner_queue.enqueue(move || seen.lock().unwrap().push("inner"));
            });
        }

        assert_eq!(queue.drain_once().ran, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["outer"]);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.drain_once().ran, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn panicking_task_does_not_stop_the_batch() {
        let queue = TaskQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            queue.enqueue(move || seen.lock().unwrap().push(1));
        }
        queue.enqueue(|| panic!("task exploded"));
        {
            let seen = Arc::clone(&seen);
            queue.enqueue(move || seen.lock().unwrap().push(3));
        }

        let report = queue.drain_once();
        assert_eq!(report.ran, 3);
        assert_eq!(report.panicked, 1);
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn registration_is_idempotent() {
        let queue = TaskQueue::new();
        let mut scheduler = RecordingScheduler::default();
        assert!(queue.register(&mut scheduler));
        assert!(!queue.register(&mut scheduler));
        assert!(!queue.clone().register(&mut scheduler));
        assert_eq!(scheduler.callbacks.len(), 1);
        assert!(queue.is_registered());

        let seen = Arc::new(Mutex::new(0));
        {
            let seen = Arc::clone(&seen);
            queue.enqueue(move || *seen.lock().unwrap() += 1);
        }
        for callback in scheduler.callbacks.iter_mut() {
            callback();
        }
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn global_queue_is_shared() {
        let first = TaskQueue::global();
        let second = TaskQueue::global();
        assert!(std::sync::Arc::ptr_eq(&first.inner, &second.inner));
    }
}
