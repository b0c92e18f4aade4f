//! Bounded worker pool. Candidates queue through a kanal channel; a fixed
//! number of workers pull and drive each probe to completion, so the seed
//! expansion never outruns the configured concurrency.

use std::{future::Future, pin::Pin};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::expander::Candidate;

/// Queue slots per worker; deep enough that the seed expander rarely stalls
/// while a burst of slow candidates occupies the pool.
const QUEUE_DEPTH_PER_WORKER: usize = 1024;

pub fn default_queue_capacity(worker_count: usize) -> usize {
    worker_count.max(1) * QUEUE_DEPTH_PER_WORKER
}

pub struct Task {
    pub candidate: Candidate,
    action: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Task {
    pub fn new<F>(candidate: Candidate, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            candidate,
            action: Box::pin(action),
        }
    }
}

pub struct WorkerPool {
    sender: Option<kanal::AsyncSender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(worker_count: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = kanal::bounded_async::<Task>(queue_capacity.max(1));
        let workers = (0..worker_count.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    while let Ok(task) = receiver.recv().await {
                        log::trace!("worker {} probing {}", id, task.candidate);
                        task.action.await;
                    }
                })
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Blocks when the queue is full, throttling the producer.
    pub async fn submit(&self, task: Task) -> Result<()> {
        self.sender
            .as_ref()
            .context("worker pool already closed")?
            .send(task)
            .await
            .context("worker pool hung up")
    }

    /// Drops the sender so workers drain the queue and exit, then joins them.
    pub async fn wait(mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                log::error!("worker panicked: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn bounds_concurrency_and_runs_everything() {
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::start(2, 4);
        for i in 0..10u16 {
            let current = Arc::clone(&current);
            let max_seen = Arc::clone(&max_seen);
            let done = Arc::clone(&done);
            let task = Task::new(Candidate::new("127.0.0.1", 1000 + i), async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
            pool.submit(task).await.unwrap();
        }
        pool.wait().await;

        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn queue_capacity_scales_with_worker_count() {
        assert_eq!(default_queue_capacity(8), 8 * 1024);
        assert_eq!(default_queue_capacity(0), 1024);
    }
}
