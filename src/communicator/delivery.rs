//! Delivery context for user-facing callbacks
//!
//! Background tasks never call user callbacks themselves. They post a job to
//! a [`DeliveryContext`] and the application decides where jobs run: on a
//! dedicated task draining a [`DeliveryLoop`], or inline with [`Immediate`].

use tokio::sync::mpsc;
use tracing::debug;

/// A posted callback invocation
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where callback invocations are executed
pub trait DeliveryContext: Send + Sync + 'static {
    fn post(&self, job: Job);
}

/// Create a FIFO delivery queue and the loop that drains it
pub fn delivery_queue() -> (DeliveryQueue, DeliveryLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliveryQueue { tx }, DeliveryLoop { rx })
}

/// Posting side of a delivery queue
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl DeliveryContext for DeliveryQueue {
    fn post(&self, job: Job) {
        if self.tx.send(job).is_err() {
            debug!("[DELIVERY] Loop gone, dropping callback");
        }
    }
}

/// Executing side of a delivery queue. Jobs run one at a time in post order.
pub struct DeliveryLoop {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl DeliveryLoop {
    /// Run jobs until every [`DeliveryQueue`] handle has been dropped
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            job();
        }
        debug!("[DELIVERY] Loop finished");
    }

    /// Wait for and run a single job. Returns `false` once all senders are gone.
    pub async fn run_one(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run every job already queued without waiting; returns how many ran
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }
}

/// Runs each job on the posting thread. Meant for single-threaded harnesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl DeliveryContext for Immediate {
    fn post(&self, job: Job) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_queue_runs_in_post_order() {
        let (queue, mut looper) = delivery_queue();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            queue.post(Box::new(move || seen.lock().unwrap().push(i)));
        }

        assert!(seen.lock().unwrap().is_empty(), "nothing runs until drained");
        assert_eq!(looper.run_pending(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_run_stops_when_senders_dropped() {
        let (queue, looper) = delivery_queue();
        let seen = Arc::new(Mutex::new(0));

        let counter = seen.clone();
        queue.post(Box::new(move || *counter.lock().unwrap() += 1));
        drop(queue);

        looper.run().await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_immediate_runs_inline() {
        let seen = Arc::new(Mutex::new(false));
        let flag = seen.clone();
        Immediate.post(Box::new(move || *flag.lock().unwrap() = true));
        assert!(*seen.lock().unwrap());
    }
}
