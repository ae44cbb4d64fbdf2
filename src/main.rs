use anyhow::{anyhow, Error};
use async_trait::async_trait;
use clap::Parser;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use uploadq::runner;
use uploadq::telemetry;
use uploadq::worker::Uploader;
use uploadq::{UploadQueue, UploadRecord, UploadRequest};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'd',
        long = "data_dir",
        help = "Directory holding the upload database",
        default_value = "."
    )]
    data_dir: PathBuf,

    #[arg(
        short = 'n',
        long = "number_active",
        help = "Number of Active Uploads in Parallel",
        default_value = "3"
    )]
    num: u16,

    #[arg(
        short = 'g',
        long = "grace_secs",
        help = "Age in seconds before a stale UPLOADING record is requeued",
        default_value = "300"
    )]
    grace_secs: u64,
}

/// Stand-in transport for the demo: sleeps, then fails every twelfth
/// record so the FAILED path is visible in the logs.
struct SimulatedUploader;

#[async_trait]
impl Uploader for SimulatedUploader {
    async fn upload(&self, record: &UploadRecord) -> Result<(), Error> {
        sleep(Duration::from_millis(100)).await;
        if record.id % 12 == 0 {
            return Err(anyhow!("Simulating failure"));
        }

        Ok(())
    }
}

#[instrument(skip(cancel_token))]
async fn setup(cancel_token: CancellationToken) -> Result<(), Error> {
    let config = ConfigContext::parse();

    let queue = UploadQueue::open(&config.data_dir).await?;
    info!(params = ?queue.db_params(), "upload store ready");

    // Channel for sending requests to be processed
    let (send_to_runner, recv_from_client) = mpsc::unbounded_channel();

    // Channel for getting events from the runner
    let (send_to_client, mut recv_from_runner) = mpsc::unbounded_channel();

    let runner_spawn = {
        let cancel_token = cancel_token.clone();
        let queue = queue.clone();
        let send_to_client = send_to_client.clone();
        let grace = Duration::from_secs(config.grace_secs);
        tokio::spawn(
            async move {
                if let Err(err) = runner::drain(
                    cancel_token,
                    queue,
                    config.num,
                    grace,
                    Arc::new(SimulatedUploader),
                    recv_from_client,
                    send_to_client,
                )
                .await
                {
                    error!("Error starting runner: {}", err);
                }
            }
            .instrument(info_span!("runner")),
        )
    };

    // Simulating captured photos

    for n in 0..10 {
        let request = UploadRequest {
            source_uri: format!("file:///var/app/dummy/photo{n}.jpg"),
            file_name: format!("photo{n}.jpg"),
            latitude: Some(38.473469),
            longitude: Some(-121.821177),
            accuracy: Some(40.0),
            metadata: r#"{"device":666,"targetWidth":1536,"targetHeight":2048}"#.into(),
        };

        send_to_runner.send(request)?;
    }

    debug!("Done setting tasks");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Runner cancelled");
                break;
            },
            runner_event = recv_from_runner.recv() => {
                match runner_event {
                    Some(event) => {
                        info!(event = "Message", msg = ?event);
                    },
                    None => {
                        debug!("Runner connection closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    println!("Waiting for runner to shutdown...");
    runner_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Current dir: {:?}", env::current_dir()?);
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "uploadq=DEBUG");
    }

    telemetry::init()?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token));

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");

    Ok(())
}
