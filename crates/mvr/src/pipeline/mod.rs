//! The streaming pipeline: one reader task, N writer workers.
//!
//! The reader executes the query and pushes batches into the stream's
//! bounded channel; writers drain it through per-worker batch writers.
//! Any worker error trips the shared cancellation token so the reader
//! stops at its next row-fetch boundary. The engine never returns until
//! every task has joined, so nothing can still be writing to the sink
//! when teardown starts.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::StreamSpec;
use crate::core::DataStream;
use crate::drivers::DbReader;
use crate::encode::Encoder;
use crate::error::{MvrError, Result};

/// Run the pipeline to completion.
///
/// Returns the first error observed; later errors are folded into its
/// message rather than dropped.
pub async fn run(
    reader: Arc<dyn DbReader>,
    ds: Arc<DataStream>,
    spec: StreamSpec,
    encoder: Arc<dyn Encoder>,
    workers: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let workers = workers.max(1);
    let (err_tx, mut err_rx) = mpsc::channel::<MvrError>(workers + 1);

    let mut worker_handles = Vec::with_capacity(workers);

    for worker_id in 0..workers {
        let rx = ds.receiver();
        let ds = ds.clone();
        let mut batch_writer = encoder.create_batch_writer();
        let cancel = cancel.clone();
        let err_tx = err_tx.clone();

        worker_handles.push(tokio::task::spawn_blocking(move || {
            while let Ok(batch) = rx.recv_blocking() {
                let rows = batch.len() as u64;
                if let Err(e) = batch_writer.write_batch(&batch) {
                    error!(worker_id, "writer failed: {}", e);
                    cancel.cancel();
                    let _ = err_tx.try_send(e);
                    return;
                }
                ds.add_rows(rows);

                // drain whatever was already received, then exit
                if cancel.is_cancelled() {
                    break;
                }
            }
            debug!(worker_id, "writer drained");
        }));
    }

    let reader_handle = {
        let reader = reader.clone();
        let ds = ds.clone();
        let cancel = cancel.clone();
        let err_tx = err_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = reader.stream(cancel.clone(), ds, &spec).await {
                error!("reader failed: {}", e);
                cancel.cancel();
                let _ = err_tx.try_send(e);
            }
        })
    };
    drop(err_tx);

    // join everything before looking at errors; nothing may still be
    // writing to the sink when the caller starts teardown
    let mut panicked: Option<String> = None;

    if let Err(e) = reader_handle.await {
        cancel.cancel();
        panicked = Some(e.to_string());
    }
    // normally the reader closed the channel on its way out; if it
    // panicked mid-stream the workers would otherwise block forever
    ds.close_channel();

    for handle in worker_handles {
        if let Err(e) = handle.await {
            cancel.cancel();
            panicked = Some(e.to_string());
        }
    }
    if let Some(p) = panicked {
        return Err(MvrError::Stream(format!("pipeline task panicked: {}", p)));
    }

    let mut errors: Vec<MvrError> = Vec::new();
    while let Ok(e) = err_rx.try_recv() {
        errors.push(e);
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => {
            let rest = errors
                .iter()
                .skip(1)
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            let first = errors.remove(0);
            Err(MvrError::Stream(format!("{}; also: {}", first, rest)))
        }
    }
}
