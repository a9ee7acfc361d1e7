//! The single-consumer background task queue.
//!
//! Every post-save job runs on one worker, one at a time, in submission order.
//! Each job is spawned onto its own task and awaited, so a job that errors or
//! panics is logged and the worker moves on to the next one.

use std::{
  future::Future,
  pin::Pin,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
  },
};

use tokio::{
  sync::{mpsc, oneshot},
  task::JoinHandle,
};
use tracing::{debug, error, info};

use fstore_core::{Error, Result};

type Job = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

enum Message {
  Run { label: String, job: Job },
  Flush(oneshot::Sender<()>),
}

pub struct TaskQueue {
  tx:      Mutex<Option<mpsc::UnboundedSender<Message>>>,
  pending: Arc<AtomicUsize>,
  worker:  tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
  /// Start the worker. Must be called from within a tokio runtime.
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    let worker = tokio::spawn(run_worker(rx, pending.clone()));
    Self {
      tx: Mutex::new(Some(tx)),
      pending,
      worker: tokio::sync::Mutex::new(Some(worker)),
    }
  }

  /// Queue `job` behind everything already submitted. Never blocks.
  pub fn enqueue<F>(&self, label: impl Into<String>, job: F) -> Result<()>
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    let label = label.into();
    let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(tx) = tx.as_ref() else {
      return Err(Error::Internal(format!("task queue is shut down; dropped {label}")));
    };
    self.pending.fetch_add(1, Ordering::SeqCst);
    if tx.send(Message::Run { label, job: Box::pin(job) }).is_err() {
      self.pending.fetch_sub(1, Ordering::SeqCst);
      return Err(Error::Internal("task queue worker has stopped".into()));
    }
    Ok(())
  }

  /// Jobs submitted but not yet finished.
  pub fn pending(&self) -> usize { self.pending.load(Ordering::SeqCst) }

  /// Wait until every job submitted before this call has finished.
  pub async fn flush(&self) {
    let (done_tx, done_rx) = oneshot::channel();
    let sent = {
      let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
      tx.as_ref().is_some_and(|tx| tx.send(Message::Flush(done_tx)).is_ok())
    };
    if sent {
      let _ = done_rx.await;
    }
  }

  /// Stop accepting jobs, let the worker drain what is queued, and wait for
  /// it to exit.
  pub async fn shutdown(&self) {
    let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    drop(tx);
    if let Some(worker) = self.worker.lock().await.take() {
      let _ = worker.await;
    }
  }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Message>, pending: Arc<AtomicUsize>) {
  info!("task queue worker started");
  while let Some(message) = rx.recv().await {
    match message {
      Message::Run { label, job } => {
        debug!(task = %label, queued = pending.load(Ordering::SeqCst), "task started");
        match tokio::spawn(job).await {
          Ok(Ok(())) => debug!(task = %label, "task finished"),
          Ok(Err(err)) => error!(task = %label, error = %err, "background task failed"),
          Err(err) if err.is_panic() => error!(task = %label, "background task panicked"),
          Err(err) => error!(task = %label, error = %err, "background task was cancelled"),
        }
        pending.fetch_sub(1, Ordering::SeqCst);
      }
      Message::Flush(done) => {
        let _ = done.send(());
      }
    }
  }
  info!("task queue worker stopped");
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  async fn explode() -> Result<()> { panic!("worker must survive this") }

  #[tokio::test]
  async fn jobs_run_in_submission_order() {
    let queue = TaskQueue::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5u64 {
      let seen = seen.clone();
      queue
        .enqueue(format!("job {i}"), async move {
          // Later jobs sleep less; order must still hold.
          tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
          seen.lock().unwrap().push(i);
          Ok(())
        })
        .unwrap();
    }
    queue.flush().await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(queue.pending(), 0);
  }

  #[tokio::test]
  async fn failing_and_panicking_jobs_do_not_stop_the_worker() {
    let queue = TaskQueue::new();
    let ran = Arc::new(AtomicUsize::new(0));

    queue.enqueue("fails", async { Err::<(), _>(Error::Internal("boom".into())) }).unwrap();
    queue.enqueue("panics", explode()).unwrap();
    let counter = ran.clone();
    queue
      .enqueue("after", async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      })
      .unwrap();

    queue.flush().await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn shutdown_drains_then_rejects() {
    let queue = TaskQueue::new();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
      let counter = ran.clone();
      queue
        .enqueue("count", async move {
          tokio::time::sleep(Duration::from_millis(5)).await;
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(())
        })
        .unwrap();
    }
    queue.shutdown().await;
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert!(queue.enqueue("late", async { Ok(()) }).is_err());
    // Flushing a stopped queue returns at once.
    queue.flush().await;
  }
}
