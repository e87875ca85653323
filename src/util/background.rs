//! The engine's single background worker.
//!
//! Flush and compaction work is funneled through one FIFO so background
//! I/O never competes with itself. The thread is spawned lazily on the
//! first `schedule` call and runs for the life of the process.

use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct BackgroundWorker {
    sender: Mutex<Option<Sender<Task>>>,
}

impl Default for BackgroundWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundWorker {
    pub fn new() -> Self {
        BackgroundWorker {
            sender: Mutex::new(None),
        }
    }

    /// Enqueues `task` to run on the background thread. Tasks run in FIFO
    /// order, one at a time.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut sender = self.sender.lock().unwrap();
        let tx = sender.get_or_insert_with(|| {
            let (tx, rx) = unbounded::<Task>();
            thread::Builder::new()
                .name("siltdb-background".to_owned())
                .spawn(move || {
                    debug!("background worker started");
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                    debug!("background worker stopped");
                })
                .expect("failed to spawn background worker");
            tx
        });
        // The receiver lives on the worker thread for the process lifetime,
        // so a send can only fail if the thread panicked.
        let _ = tx.send(Box::new(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_order() {
        let worker = BackgroundWorker::new();
        let log = Arc::new(Mutex::new(vec![]));
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let log = log.clone();
            let done = done.clone();
            worker.schedule(move || {
                log.lock().unwrap().push(i);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        while done.load(Ordering::SeqCst) < 10 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_thread_spawned_once() {
        let worker = Arc::new(BackgroundWorker::new());
        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let worker = worker.clone();
            let done = done.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    let done = done.clone();
                    worker.schedule(move || {
                        done.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        while done.load(Ordering::SeqCst) < 100 {
            thread::sleep(Duration::from_millis(1));
        }
    }
}
