//! Bounded lossy write queue.
//!
//! Every outbound RTP/RTCP packet of a session traverses one of these, so
//! that a slow or blocked peer never stalls the task that produced the
//! packet. Jobs are executed strictly in push order by a dedicated worker
//! task; backpressure is signalled by `push` failing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// A deferred write: a closure producing the future that performs the I/O.
pub type WriteJob = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Inner {
    queue: Mutex<VecDeque<WriteJob>>,
    capacity: usize,
    drop_on_full: bool,
    notify: Notify,
    started: AtomicBool,
    closed: AtomicBool,
}

/// Bounded lossy ring buffer executing write closures on a worker task.
pub struct WriteQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Creates the queue and spawns its worker.
    ///
    /// With `drop_on_full`, a push onto a full queue drops the oldest
    /// pending job instead of failing.
    pub fn new(capacity: usize, drop_on_full: bool) -> Self {
        let q = Self::new_paused(capacity, drop_on_full);
        q.start();
        q
    }

    /// Creates the queue with its worker idle: jobs accumulate (subject to
    /// the capacity rules) until [`Self::start`] releases them. Used to
    /// hold back media packets until the PLAY/RECORD response is on the
    /// wire.
    pub fn new_paused(capacity: usize, drop_on_full: bool) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            drop_on_full,
            notify: Notify::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let worker_inner = inner.clone();
        let worker = tokio::spawn(async move {
            while !worker_inner.started.load(Ordering::Acquire) {
                if worker_inner.closed.load(Ordering::Acquire) {
                    return;
                }
                worker_inner.notify.notified().await;
            }
            loop {
                let job = worker_inner.queue.lock().pop_front();
                match job {
                    Some(job) => job().await,
                    None => {
                        if worker_inner.closed.load(Ordering::Acquire) {
                            break;
                        }
                        worker_inner.notify.notified().await;
                    }
                }
            }
        });

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Releases the worker of a paused queue.
    pub fn start(&self) {
        self.inner.started.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    /// Enqueues a write job.
    pub fn push<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                if !self.inner.drop_on_full {
                    return Err(Error::WriteQueueFull);
                }
                queue.pop_front();
            }
            queue.push_back(Box::new(job));
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Number of pending jobs.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Drains remaining jobs and joins the worker. Further pushes fail
    /// with [`Error::Terminated`].
    pub async fn stop(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn executes_in_push_order() {
        let queue = WriteQueue::new(16, false);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5u32 {
            let log = log.clone();
            queue
                .push(move || {
                    Box::pin(async move {
                        log.lock().push(i);
                    })
                })
                .unwrap();
        }
        queue.stop().await;
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn full_queue_signals_backpressure() {
        let queue = WriteQueue::new(2, false);
        let gate = Arc::new(Notify::new());

        // Occupy the worker so pushed jobs stay queued.
        let g = gate.clone();
        queue
            .push(move || Box::pin(async move { g.notified().await }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.push(|| Box::pin(async {})).unwrap();
        queue.push(|| Box::pin(async {})).unwrap();
        assert!(matches!(
            queue.push(|| Box::pin(async {})),
            Err(Error::WriteQueueFull)
        ));

        gate.notify_one();
        queue.stop().await;
    }

    #[tokio::test]
    async fn drop_on_full_discards_oldest() {
        let queue = WriteQueue::new(2, true);
        let gate = Arc::new(Notify::new());
        let ran = Arc::new(AtomicU32::new(0));

        let g = gate.clone();
        queue
            .push(move || Box::pin(async move { g.notified().await }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // First of these gets dropped by the third push.
        for bit in [1u32, 2, 4] {
            let ran = ran.clone();
            queue
                .push(move || {
                    Box::pin(async move {
                        ran.fetch_or(bit, Ordering::SeqCst);
                    })
                })
                .unwrap();
        }

        gate.notify_one();
        queue.stop().await;
        assert_eq!(ran.load(Ordering::SeqCst), 2 | 4);
    }

    #[tokio::test]
    async fn paused_queue_holds_jobs_until_started() {
        let queue = WriteQueue::new_paused(4, false);
        let ran = Arc::new(AtomicU32::new(0));
        let r = ran.clone();
        queue
            .push(move || {
                Box::pin(async move {
                    r.fetch_add(1, Ordering::SeqCst);
                })
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        queue.start();
        queue.stop().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn push_after_stop_fails() {
        let queue = WriteQueue::new(4, false);
        queue.stop().await;
        assert!(matches!(
            queue.push(|| Box::pin(async {})),
            Err(Error::Terminated)
        ));
    }
}
