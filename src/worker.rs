use crate::UploadRecord;
use anyhow::Error;
use async_channel::Receiver;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// The black-box network transport. The queue never touches the wire;
/// implementors move the bytes and report the outcome.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, record: &UploadRecord) -> Result<(), Error>;
}

#[derive(Debug)]
pub enum WorkMessage {
    Completed(i64),
    Failed(i64, String),
}

/// One worker task: receives claimed records, runs the transport, reports
/// the outcome back to the runner. The record is already `UPLOADING` when
/// it arrives here; the runner owns the status bookkeeping.
pub async fn start(
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<UploadRecord>,
    send_to_runner: UnboundedSender<WorkMessage>,
    uploader: Arc<dyn Uploader>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker cancelled");
                break;
            },
            record = recv_from_queue.recv() => {
                match record {
                    Err(err) => {
                        error!(message = "Error receiving record by worker, exiting", error = ?err);
                        break;
                    },
                    Ok(record) => {
                        let id = record.id;
                        let outcome = process(&*uploader, record).await;
                        // If the runner is gone, no one is left to be told; panic.
                        match outcome {
                            Ok(()) => {
                                send_to_runner.send(WorkMessage::Completed(id)).unwrap();
                            },
                            Err(err) => {
                                let failed = WorkMessage::Failed(id, err.to_string());
                                send_to_runner.send(failed).unwrap();
                            }
                        };
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(id = %record.id, file_name = %record.file_name))]
async fn process(uploader: &dyn Uploader, record: UploadRecord) -> Result<(), Error> {
    uploader.upload(&record).await
}
