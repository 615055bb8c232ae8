//! Fixed pool of threads that decode records off the reading thread.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

/// A unit of work handed from the reader to the pool.
///
/// The unit owns everything it needs and signals its own completion.
pub trait UnmarshalWork: Send + 'static {
    fn unmarshal(self: Box<Self>);
}

/// Threads draining a bounded queue of [`UnmarshalWork`].
///
/// `schedule` blocks while the queue is full, which is what slows a reader
/// down when decoding falls behind. Dropping the pool closes the queue, lets
/// the workers finish what is already queued, and joins them.
pub struct WorkerPool {
    tx: Option<flume::Sender<Box<dyn UnmarshalWork>>>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> io::Result<Self> {
        let (tx, rx) = flume::bounded::<Box<dyn UnmarshalWork>>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("vmingest-unmarshal-{}", i))
                .spawn(move || {
                    while let Ok(work) = rx.recv() {
                        // The unit records its own panic; keep the thread alive
                        // for the next one.
                        if panic::catch_unwind(AssertUnwindSafe(|| work.unmarshal())).is_err() {
                            tracing::warn!("unmarshal work panicked on worker {}", i);
                        }
                    }
                })?;
            handles.push(handle);
        }
        tracing::debug!(
            "started {} unmarshal workers, queue capacity {}",
            workers,
            queue_capacity
        );

        Ok(Self {
            tx: Some(tx),
            handles,
        })
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Queues `work`, blocking while the queue is full.
    pub fn schedule(&self, work: Box<dyn UnmarshalWork>) {
        let Some(tx) = &self.tx else {
            work.unmarshal();
            return;
        };
        // Only fails once every worker is gone; run the unit here so its
        // completion is still signalled.
        if let Err(flume::SendError(work)) = tx.send(work) {
            work.unmarshal();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    struct CountWork(Arc<AtomicUsize>);

    impl UnmarshalWork for CountWork {
        fn unmarshal(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanicWork;

    impl UnmarshalWork for PanicWork {
        fn unmarshal(self: Box<Self>) {
            panic!("bad record");
        }
    }

    struct SignalWork(mpsc::Sender<String>);

    impl UnmarshalWork for SignalWork {
        fn unmarshal(self: Box<Self>) {
            let name = thread::current().name().unwrap_or("").to_string();
            self.0.send(name).unwrap();
        }
    }

    #[test]
    fn test_drop_drains_queue() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(3, 2).unwrap();
        assert_eq!(pool.workers(), 3);
        for _ in 0..100 {
            pool.schedule(Box::new(CountWork(done.clone())));
        }
        drop(pool);
        assert_eq!(done.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_work_runs_on_named_threads() {
        let pool = WorkerPool::new(2, 4).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.schedule(Box::new(SignalWork(tx)));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.starts_with("vmingest-unmarshal-"), "ran on {}", name);
    }

    #[test]
    fn test_worker_survives_panicking_unit() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(1, 4).unwrap();
        pool.schedule(Box::new(PanicWork));
        for _ in 0..10 {
            pool.schedule(Box::new(CountWork(done.clone())));
        }
        drop(pool);
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }
}
