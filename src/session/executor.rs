/// Dedicated serial executors.
///
/// Each executor is one worker task draining one channel, so everything
/// submitted to it runs strictly in order with no overlap. The core runs
/// two: one for ratchet operations and job consumption, one for one-time
/// key publication and deletion, so a slow key-transport call cannot stall
/// message processing.
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type SerialJob = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Serial executor stopped")]
    Stopped,
}

#[derive(Clone)]
pub struct SerialExecutor {
    sender: mpsc::UnboundedSender<SerialJob>,
}

impl SerialExecutor {
    /// Spawn the worker task; requires a running tokio runtime
    pub fn new(name: &'static str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<SerialJob>();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
            log::debug!("serial executor '{}' drained and stopped", name);
        });
        Self { sender }
    }

    /// Enqueue a job; runs after everything previously enqueued completes
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.sender.send(Box::pin(future));
    }

    /// Enqueue a job and await its result
    pub async fn run<F, T>(&self, future: F) -> Result<T, ExecutorError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.spawn(async move {
            let _ = reply.send(future.await);
        });
        response.await.map_err(|_| ExecutorError::Stopped)
    }
}
