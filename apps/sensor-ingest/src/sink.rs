use crate::queue::TransferQueue;
use crate::reading::{Reading, ReadingKind};
use crate::store::{ReadingStore, StoreError};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Persisted,
    /// Kind segment is neither temperature nor relative-humidity.
    DroppedUnknownKind,
    /// The store refused the row through a check constraint.
    DroppedRejected,
}

/// Routes one reading to the matching upsert.
pub async fn persist<S: ReadingStore>(
    store: &mut S,
    reading: &Reading,
) -> Result<Disposition, StoreError> {
    let result = match &reading.kind {
        ReadingKind::Temperature => {
            store
                .upsert_temperature(&reading.device, reading.timestamp, reading.value)
                .await
        }
        ReadingKind::RelativeHumidity => {
            store
                .upsert_relative_humidity(&reading.device, reading.timestamp, reading.value)
                .await
        }
        ReadingKind::Unknown(kind) => {
            tracing::warn!(device = %reading.device, kind = %kind, "dropping reading of unknown kind");
            return Ok(Disposition::DroppedUnknownKind);
        }
    };

    match result {
        Ok(()) => Ok(Disposition::Persisted),
        Err(err) if err.is_check_violation() => {
            tracing::warn!(
                device = %reading.device,
                kind = %reading.kind,
                timestamp = %reading.timestamp,
                error = %err,
                "store rejected reading; dropping"
            );
            Ok(Disposition::DroppedRejected)
        }
        Err(err) => Err(err),
    }
}

/// Consumes the queue until `cancel` fires. The store is closed on every exit.
pub async fn run_sink<S: ReadingStore>(
    queue: Arc<TransferQueue<Reading>>,
    mut store: S,
    cancel: CancellationToken,
) -> Result<()> {
    let result = consume(&queue, &mut store, &cancel).await;
    store.close().await;
    result
}

async fn consume<S: ReadingStore>(
    queue: &TransferQueue<Reading>,
    store: &mut S,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut persisted: u64 = 0;
    let mut dropped: u64 = 0;

    loop {
        let reading = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            reading = queue.get() => reading,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = persist(store, &reading) => outcome,
        };

        match outcome {
            Ok(Disposition::Persisted) => persisted += 1,
            Ok(_) => dropped += 1,
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed to persist {} reading for device {} at {}",
                        reading.kind, reading.device, reading.timestamp
                    )
                });
            }
        }
        queue.mark_done();
        tracing::trace!(device = %reading.device, kind = %reading.kind, "reading handled");
    }

    tracing::info!(persisted, dropped, "insert task stopped");
    Ok(())
}
