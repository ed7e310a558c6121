//! Task lifetime management.

use std::sync::Mutex;

use tokio::task::JoinHandle;

/// A set of background tasks that are aborted together.
///
/// Role subscriptions, per-device timers and periodic tickers register here
/// so that a role flip or a disconnect tears them all down at once.
#[derive(Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a task. Finished handles are reaped opportunistically.
    pub fn add(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Spawn a future and track it.
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.add(tokio::spawn(fut));
    }

    /// Abort every tracked task.
    pub fn clear(&self) {
        let mut handles = self.handles.lock().unwrap();
        for h in handles.drain(..) {
            h.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().unwrap().is_empty()
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_clear_aborts_tasks() {
        let set = TaskSet::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        set.spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(set.len(), 1);
        set.clear();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_finished_tasks_are_reaped() {
        let set = TaskSet::new();
        set.spawn(async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        set.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert_eq!(set.len(), 1);
        set.clear();
    }
}
