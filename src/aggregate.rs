//! Bounded-concurrency fan-out for batch embeddings.
//!
//! One backend call per batch item, at most `limit` in flight. Admission is
//! a sliding window: each completion frees a worker for the next queued
//! item. A single accumulator consumes completions, so the merged result is
//! never mutated concurrently.

use crate::errors::{GatewayError, GatewayResult};
use crate::models::{EmbeddingSubResult, MergedEmbeddings};
use serde_json::Value;
use std::future::Future;

/// Fixed fan-out bound; protects the backend, not local CPU.
pub const EMBEDDING_CONCURRENCY: usize = 3;

/// Run `call` once per item with bounded concurrency and merge the
/// sub-results.
///
/// The merged `data` sequence lists every item's records at the position of
/// the item's submission index, re-indexed `0..K` with no gaps, regardless
/// of completion order; usage counters are summed the same way. Any failing
/// sub-call fails the whole aggregate and cancels the calls still in
/// flight.
pub async fn aggregate<F, Fut>(
    items: Vec<Value>,
    limit: usize,
    call: F,
) -> GatewayResult<MergedEmbeddings>
where
    F: Fn(usize, Value) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = GatewayResult<EmbeddingSubResult>> + Send + 'static,
{
    let total = items.len();
    let workers = limit.max(1).min(total.max(1));

    let (job_tx, job_rx) = async_channel::bounded::<(usize, Value)>(total.max(1));
    let (done_tx, done_rx) =
        async_channel::bounded::<(usize, GatewayResult<EmbeddingSubResult>)>(workers);

    for job in items.into_iter().enumerate() {
        // capacity covers the whole batch, so queueing never blocks
        job_tx
            .send(job)
            .await
            .map_err(|_| GatewayError::Upstream("fan-out queue closed".to_string()))?;
    }
    drop(job_tx);

    let pool: Vec<smol::Task<()>> = (0..workers)
        .map(|_| {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let call = call.clone();
            smol::spawn(async move {
                while let Ok((index, item)) = jobs.recv().await {
                    let outcome = call(index, item).await;
                    if done.send((index, outcome)).await.is_err() {
                        break;
                    }
                }
            })
        })
        .collect();
    drop(done_tx);

    // Completions arrive in arbitrary order and are parked in their
    // submission slot; merging happens once, below, in input order.
    let mut slots: Vec<Option<EmbeddingSubResult>> = (0..total).map(|_| None).collect();
    let mut failure: Option<GatewayError> = None;
    for _ in 0..total {
        match done_rx.recv().await {
            Ok((index, Ok(sub_result))) => slots[index] = Some(sub_result),
            Ok((_, Err(err))) => {
                failure = Some(err);
                break;
            }
            Err(_) => break,
        }
    }
    drop(pool); // cancels sub-calls still in flight

    if let Some(err) = failure {
        return Err(err);
    }

    let mut merged = MergedEmbeddings::empty();
    let mut next_index: u64 = 0;
    for slot in slots {
        let sub_result = slot.ok_or_else(|| {
            GatewayError::Upstream("embeddings sub-result went missing".to_string())
        })?;
        for mut record in sub_result.data {
            record.insert("index".to_string(), Value::from(next_index));
            merged.data.push(record);
            next_index += 1;
        }
        merged.usage.accumulate(&sub_result.usage);
    }
    Ok(merged)
}
