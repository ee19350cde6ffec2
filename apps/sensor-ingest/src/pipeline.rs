use crate::broker::{ConnectionState, MessageSource};
use crate::config::MalformedPolicy;
use crate::queue::TransferQueue;
use crate::reading::{parse_message, Reading};
use crate::sink;
use crate::store::ReadingStore;
use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskName {
    Receive,
    Insert,
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskName::Receive => f.write_str("receive-task"),
            TaskName::Insert => f.write_str("insert-task"),
        }
    }
}

/// Terminal errors of every task that did not end cleanly.
#[derive(Debug)]
pub struct PipelineError {
    pub failures: Vec<(TaskName, anyhow::Error)>,
}

impl PipelineError {
    pub fn tasks(&self) -> Vec<TaskName> {
        self.failures.iter().map(|(task, _)| *task).collect()
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.failures.iter().map(|(task, _)| task.to_string()).collect();
        write!(f, "pipeline failed in {}", names.join(", "))
    }
}

impl std::error::Error for PipelineError {}

pub struct Pipeline<M, S> {
    source: M,
    store: S,
    malformed: MalformedPolicy,
    queue: Arc<TransferQueue<Reading>>,
}

impl<M, S> Pipeline<M, S>
where
    M: MessageSource + 'static,
    S: ReadingStore + 'static,
{
    pub fn new(source: M, store: S, malformed: MalformedPolicy) -> Self {
        Self {
            source,
            store,
            malformed,
            queue: Arc::new(TransferQueue::new()),
        }
    }

    #[cfg(test)]
    pub fn queue(&self) -> Arc<TransferQueue<Reading>> {
        self.queue.clone()
    }

    /// Runs both tasks until `shutdown` resolves (drain, then stop) or one of
    /// them fails (stop the other at once, no drain).
    pub async fn run<F>(self, shutdown: F) -> Result<(), PipelineError>
    where
        F: Future<Output = ()>,
    {
        let queue = self.queue;
        let receive_cancel = CancellationToken::new();
        let insert_cancel = CancellationToken::new();

        let mut receiving = tokio::spawn(run_receiver(
            self.source,
            queue.clone(),
            self.malformed,
            receive_cancel.clone(),
        ));
        let mut inserting = tokio::spawn(sink::run_sink(
            queue.clone(),
            self.store,
            insert_cancel.clone(),
        ));
        tokio::pin!(shutdown);

        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("interrupt received; stopping receive task");
                receive_cancel.cancel();
                if let Err(err) = flatten(&mut receiving).await {
                    insert_cancel.cancel();
                    return fail_fast(TaskName::Receive, err, TaskName::Insert, inserting).await;
                }

                tracing::info!(pending = queue.pending(), "draining transfer queue");
                tokio::select! {
                    _ = queue.join() => {}
                    res = &mut inserting => {
                        let err = task_error(res, "insert task stopped before the queue drained");
                        return Err(PipelineError { failures: vec![(TaskName::Insert, err)] });
                    }
                }

                tracing::info!("queue drained; stopping insert task");
                insert_cancel.cancel();
                match flatten(&mut inserting).await {
                    Ok(()) => {
                        tracing::info!("pipeline stopped cleanly");
                        Ok(())
                    }
                    Err(err) => Err(PipelineError { failures: vec![(TaskName::Insert, err)] }),
                }
            }
            res = &mut receiving => {
                insert_cancel.cancel();
                let err = task_error(res, "receive task ended without being cancelled");
                fail_fast(TaskName::Receive, err, TaskName::Insert, inserting).await
            }
            res = &mut inserting => {
                receive_cancel.cancel();
                let err = task_error(res, "insert task ended without being cancelled");
                fail_fast(TaskName::Insert, err, TaskName::Receive, receiving).await
            }
        }
    }
}

/// `failed` is already done; `other` has been cancelled and is awaited here.
async fn fail_fast(
    failed: TaskName,
    err: anyhow::Error,
    other: TaskName,
    other_handle: JoinHandle<Result<()>>,
) -> Result<(), PipelineError> {
    tracing::error!(task = %failed, "task failed; stopping pipeline: {err:#}");
    let mut failures = vec![(failed, err)];
    if let Err(other_err) = flatten(other_handle).await {
        failures.push((other, other_err));
    }
    failures.sort_by_key(|(task, _)| *task == TaskName::Insert);
    Err(PipelineError { failures })
}

async fn flatten<H>(handle: H) -> Result<()>
where
    H: Future<Output = Result<Result<()>, JoinError>>,
{
    match handle.await {
        Ok(result) => result,
        Err(err) => Err(anyhow!("task aborted: {err}")),
    }
}

/// A task that finished on its own. Even `Ok(())` counts as a failure, since
/// neither task is supposed to stop before it is cancelled.
fn task_error(res: Result<Result<()>, JoinError>, unexpected: &str) -> anyhow::Error {
    match res {
        Ok(Ok(())) => anyhow!(unexpected.to_string()),
        Ok(Err(err)) => err,
        Err(err) => anyhow!("task aborted: {err}"),
    }
}

/// receive-task: broker -> parser -> queue. Always releases the broker link.
async fn run_receiver<M: MessageSource>(
    mut source: M,
    queue: Arc<TransferQueue<Reading>>,
    malformed: MalformedPolicy,
    cancel: CancellationToken,
) -> Result<()> {
    let result = receive(&mut source, &queue, malformed, &cancel).await;
    if source.state() != ConnectionState::Disconnected {
        if let Err(err) = source.disconnect().await {
            tracing::warn!(error = %err, "broker disconnect failed");
        }
    }
    result
}

async fn receive<M: MessageSource>(
    source: &mut M,
    queue: &TransferQueue<Reading>,
    malformed: MalformedPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        connected = source.connect() => connected.context("failed to connect to broker")?,
    }

    let mut received: u64 = 0;
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = source.next_message() => message.context("broker message stream failed")?,
        };

        match parse_message(&message.topic, &message.payload) {
            Ok(reading) => {
                queue.put(reading);
                received += 1;
            }
            Err(err) => match malformed {
                MalformedPolicy::Fail => {
                    return Err(err)
                        .with_context(|| format!("malformed message on topic {}", message.topic));
                }
                MalformedPolicy::Skip => {
                    tracing::warn!(error = %err, topic = %message.topic, "skipping malformed message");
                }
            },
        }
    }

    tracing::info!(received, "receive task stopped");
    Ok(())
}
