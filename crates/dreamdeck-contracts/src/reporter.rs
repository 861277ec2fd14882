use std::sync::Arc;

use tracing::warn;

use crate::errors::{ErrorKey, GenerationError};
use crate::queue::TaskQueue;

/// The host's user-facing error channel. Only ever called on the host thread.
pub trait UiNotifier: Send + Sync {
    /// `key` is an [`ErrorKey`] in wire form, or empty for a generic failure.
    fn notify_error(&self, message: &str, key: &str);
}

/// Routes failures detected on any thread to the host UI via the task queue.
#[derive(Clone)]
pub struct ErrorReporter {
    queue: TaskQueue,
    notifier: Arc<dyn UiNotifier>,
}

impl ErrorReporter {
    pub fn new(queue: TaskQueue, notifier: Arc<dyn UiNotifier>) -> Self {
        Self { queue, notifier }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn report(&self, message: impl Into<String>, key: Option<ErrorKey>) {
        self.report_error(GenerationError {
            message: message.into(),
            key,
        });
    }

    pub fn report_error(&self, err: GenerationError) {
        warn!(key = err.key_str(), message = %err.message, "reporting generation failure");
        let notifier = Arc::clone(&self.notifier);
        self.queue.enqueue(move || {
            notifier.notify_error(&err.message, err.key_str());
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;

    use super::{ErrorReporter, UiNotifier};
    use crate::errors::{ErrorKey, GenerationError};
    use crate::queue::TaskQueue;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<(String, String, thread::ThreadId)>>,
    }

    impl UiNotifier for Collect {
        fn notify_error(&self, message: &str, key: &str) {
            self.seen.lock().unwrap().push((
                message.to_string(),
                key.to_string(),
                thread::current().id(),
            ));
        }
    }

    #[test]
    fn report_from_worker_is_delivered_on_draining_thread() {
        let queue = TaskQueue::new();
        let notifier = Arc::new(Collect::default());
        let reporter = ErrorReporter::new(queue.clone(), notifier.clone());

        let worker_reporter = reporter.clone();
        thread::spawn(move || {
            worker_reporter
                .report_error(GenerationError::new("Request timed out.", ErrorKey::Timeout));
        })
        .join()
        .unwrap();

        assert!(notifier.seen.lock().unwrap().is_empty());
        queue.drain_once();

        let seen = notifier.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "Request timed out.");
        assert_eq!(seen[0].1, "timeout");
        assert_eq!(seen[0].2, thread::current().id());
    }

    #[test]
    fn missing_key_is_delivered_as_empty_string() {
        let queue = TaskQueue::new();
        let notifier = Arc::new(Collect::default());
        let reporter = ErrorReporter::new(queue.clone(), notifier.clone());

        reporter.report("Something went wrong.", None);
        queue.drain_once();

        let seen = notifier.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "");
    }
}
