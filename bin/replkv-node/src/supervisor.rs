//! Process supervision
//!
//! Background loops and the HTTP server run as supervised tasks. Any of them
//! ending, or a fatal failure reported from a request path, shuts the whole
//! node down through one cancellation token.

use replkv_common::Error;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long stopped tasks get to finish their final work
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A condition that stops the node
#[derive(Debug, thiserror::Error)]
pub enum NodeFailure {
    #[error("write-ahead log failure: {0}")]
    Wal(String),
    #[error("{task} failed: {error}")]
    Task { task: &'static str, error: Error },
    #[error("task panicked: {0}")]
    Panic(String),
}

/// Handle for reporting fatal failures from request paths
#[derive(Clone, Debug)]
pub struct FailureReporter {
    tx: mpsc::UnboundedSender<NodeFailure>,
}

impl FailureReporter {
    /// A reporter whose reports go nowhere
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn report(&self, failure: NodeFailure) {
        error!("Fatal: {}", failure);
        // The receiver is gone once shutdown has started
        let _ = self.tx.send(failure);
    }
}

type TaskResult = (&'static str, replkv_common::Result<()>);

/// Owns the node's long-running tasks
pub struct Supervisor {
    shutdown: CancellationToken,
    tasks: JoinSet<TaskResult>,
    reporter: FailureReporter,
    failures: mpsc::UnboundedReceiver<NodeFailure>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, failures) = mpsc::unbounded_channel();
        Self {
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
            reporter: FailureReporter { tx },
            failures,
        }
    }

    pub fn reporter(&self) -> FailureReporter {
        self.reporter.clone()
    }

    /// Token cancelled when the node starts shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<F>(&mut self, task: &'static str, fut: F)
    where
        F: Future<Output = replkv_common::Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (task, fut.await) });
    }

    /// Run until `signal` fires, a task stops, or a failure is reported
    ///
    /// Then cancels every task, waits for them to drain and returns the first
    /// failure seen.
    pub async fn wait(mut self, signal: impl Future<Output = ()>) -> Result<(), NodeFailure> {
        tokio::pin!(signal);

        let mut failure = tokio::select! {
            () = &mut signal => {
                info!("Shutdown requested");
                None
            }
            Some(reported) = self.failures.recv() => Some(reported),
            Some(joined) = self.tasks.join_next() => task_failure(joined),
        };

        self.shutdown.cancel();

        let drain = async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Some(late) = task_failure(joined) {
                    if failure.is_none() {
                        failure = Some(late);
                    } else {
                        warn!("Additional failure during shutdown: {}", late);
                    }
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("Tasks did not stop within {:?}, aborting", DRAIN_TIMEOUT);
        }

        match failure {
            Some(failure) => {
                error!("Node stopped: {}", failure);
                Err(failure)
            }
            None => {
                info!("Node stopped");
                Ok(())
            }
        }
    }
}

fn task_failure(joined: Result<TaskResult, JoinError>) -> Option<NodeFailure> {
    match joined {
        Ok((task, Ok(()))) => {
            info!("{} stopped", task);
            None
        }
        Ok((task, Err(error))) => Some(NodeFailure::Task { task, error }),
        Err(e) => Some(NodeFailure::Panic(e.to_string())),
    }
}
