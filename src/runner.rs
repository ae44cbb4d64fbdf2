use crate::error::QueueError;
use crate::worker::{self, Uploader, WorkMessage};
use crate::{UploadQueue, UploadRecord, UploadRequest};
use anyhow::Error;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Notifications emitted to the embedding application.
#[derive(Debug)]
pub enum UploadEvent {
    Enqueued(i64),
    Completed(i64),
    Failed(i64, String),
    QueueError(QueueError),
}

/// Drives the queue: requeues stale claims left by a previous crash, then
/// dispatches claimed records to a pool of upload workers and records each
/// outcome. The queue itself stays policy-free; the grace threshold and
/// the transport both live here, above it.
pub async fn drain(
    cancel_token: CancellationToken,
    queue: UploadQueue,
    workers_count: u16,
    grace: Duration,
    uploader: Arc<dyn Uploader>,
    mut recv_from_client: mpsc::UnboundedReceiver<UploadRequest>,
    send_to_client: mpsc::UnboundedSender<UploadEvent>,
) -> Result<(), Error> {
    let (send_to_runner, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_pool, recv_from_pool) =
        async_channel::bounded::<UploadRecord>(workers_count as usize);

    let mut workers = vec![];
    for _ in 0..workers_count {
        let send_to_runner = send_to_runner.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_pool = recv_from_pool.clone();
        let uploader = uploader.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, recv_from_pool, send_to_runner, uploader).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }

    let mut free_workers = workers_count as i64;

    // A crash mid-upload leaves records stranded in UPLOADING; anything
    // older than the grace threshold goes back to QUEUED before we start.
    let requeued = queue
        .requeue_stale(Utc::now() - chrono::Duration::from_std(grace)?)
        .await?;
    if requeued > 0 {
        info!(requeued, "recovered stale uploads from previous run");
    }

    loop {
        while free_workers > 0 {
            match queue.dequeue_next().await {
                Ok(Some(record)) => {
                    send_to_pool.send(record).await?;
                    free_workers -= 1;
                }
                Ok(None) => break,
                Err(err) => {
                    send_to_client.send(UploadEvent::QueueError(err))?;
                    break;
                }
            }
        }

        // Waiting for something else to happen to continue...
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Runner cancelled");
                break;
            },
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::Completed(id)) => {
                        debug!(message = "Completed upload", id);
                        free_workers += 1;
                        if let Err(err) = queue.mark_done(id).await {
                            if send_to_client.send(UploadEvent::QueueError(err)).is_err() {
                                error!("Failed to send event to client");
                                cancel_token.cancel();
                                break;
                            }
                        }
                        if send_to_client.send(UploadEvent::Completed(id)).is_err() {
                            error!("Failed to send event to client");
                            cancel_token.cancel();
                            break;
                        }
                    },
                    Some(WorkMessage::Failed(id, error_msg)) => {
                        debug!(message = "Failed upload", id, error = ?error_msg);
                        free_workers += 1;
                        if let Err(err) = queue.mark_failed(id).await {
                            if send_to_client.send(UploadEvent::QueueError(err)).is_err() {
                                error!("Failed to send event to client");
                                cancel_token.cancel();
                                break;
                            }
                        }
                        if send_to_client.send(UploadEvent::Failed(id, error_msg)).is_err() {
                            error!("Failed to send event to client");
                            cancel_token.cancel();
                            break;
                        }
                    },
                }
            },
            chan_msg = recv_from_client.recv() => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(request) => {
                        debug!(message = "Requested upload", request = ?request);
                        let event = match queue.enqueue(request).await {
                            Ok(id) => UploadEvent::Enqueued(id),
                            Err(err) => UploadEvent::QueueError(err),
                        };
                        if send_to_client.send(event).is_err() {
                            error!("Failed to send event to client");
                            cancel_token.cancel();
                            break;
                        }
                    }
                }
            }
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Runner stopped.");

    Ok(())
}
