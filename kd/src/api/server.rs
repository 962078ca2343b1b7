//! Daemon request handlers
//!
//! Stateless handlers over one [`ActionExecutor`]: each connection carries
//! one request and is served on its own task, so a long build never blocks
//! pings or other builds.

use std::sync::Arc;

use eyre::Result;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{DaemonMessage, DaemonResponse};
use crate::action::ActionExecutor;
use crate::engine::VERSION;
use crate::events::{ActionRun, RunObserver};
use crate::ipc::{read_message, send_response};
use crate::rule::ErrorInfo;

/// Accept loop of the daemon
pub struct DaemonServer {
    executor: Arc<ActionExecutor>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl DaemonServer {
    pub fn new(executor: Arc<ActionExecutor>) -> Self {
        debug!("DaemonServer::new: called");
        let (shutdown_tx, shutdown_rx) = mpsc::channel(4);
        Self {
            executor,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Sender that stops [`DaemonServer::run`]
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve connections until a `Shutdown` request or the shutdown handle fires
    ///
    /// Runs still in progress are cancelled on the way out.
    pub async fn run(mut self, listener: UnixListener) -> Result<()> {
        info!("DaemonServer: accepting connections");
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            debug!("DaemonServer: connection accepted");
                            let executor = Arc::clone(&self.executor);
                            let shutdown_tx = self.shutdown_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, executor, shutdown_tx).await {
                                    warn!(error = %e, "DaemonServer: connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "DaemonServer: accept error");
                        }
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let cancelled = self.executor.cancel_all();
        info!(cancelled, "DaemonServer: stopped");
        Ok(())
    }
}

/// Serve one request on `stream`
pub async fn handle_connection(
    stream: UnixStream,
    executor: Arc<ActionExecutor>,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let msg = match read_message(&mut reader).await {
        Ok(msg) => msg,
        Err(e) => {
            let response = DaemonResponse::error(ErrorInfo::request(format!("{:#}", e)));
            send_response(&mut writer, &response).await?;
            return Err(e);
        }
    };
    debug!(?msg, "handle_connection: received message");

    let response = match msg {
        DaemonMessage::GetRepoInfo => DaemonResponse::RepoInfo {
            info: executor.repo_info().await,
        },
        DaemonMessage::ReloadScript => match executor.reload().await {
            Ok(info) => DaemonResponse::RepoInfo { info },
            Err(error) => DaemonResponse::Error { error },
        },
        DaemonMessage::BuildTarget { target } => match executor.build_target(&target).await {
            Ok(info) => DaemonResponse::BuiltTarget { info },
            Err(error) => DaemonResponse::Error { error },
        },
        DaemonMessage::InvokeAction { action, args } => match executor.invoke_action(&action, args).await {
            Ok(result) => DaemonResponse::ActionResult { result },
            Err(error) => DaemonResponse::Error { error },
        },
        DaemonMessage::StreamingInvokeAction {
            action,
            args,
            cancel_on_disconnect,
        } => match executor.start_action(&action, args) {
            Ok(run) => {
                let observer = run.observe();
                let owner = cancel_on_disconnect.then_some(run);
                return stream_events(observer, owner, reader, &mut writer).await;
            }
            Err(error) => DaemonResponse::Error { error },
        },
        DaemonMessage::ObserveRun { run_id } => {
            if let Some(observer) = executor.observe(&run_id) {
                return stream_events(observer, None, reader, &mut writer).await;
            }
            match executor.replay(&run_id) {
                Some(events) => {
                    for event in events {
                        send_response(&mut writer, &DaemonResponse::Event { event }).await?;
                    }
                    return Ok(());
                }
                None => DaemonResponse::error(ErrorInfo::request(format!("unknown run: {}", run_id))),
            }
        }
        DaemonMessage::CancelRun { run_id } => {
            if executor.cancel(&run_id) {
                DaemonResponse::Ok
            } else {
                DaemonResponse::error(ErrorInfo::request(format!("run {} is not in progress", run_id)))
            }
        }
        DaemonMessage::Ping => DaemonResponse::Pong {
            version: VERSION.to_string(),
        },
        DaemonMessage::Shutdown => {
            info!("handle_connection: Shutdown");
            let _ = shutdown_tx.send(()).await;
            DaemonResponse::Ok
        }
    };

    send_response(&mut writer, &response).await
}

/// Forward run events until the terminal one or until the peer goes away
///
/// When `owner` is set, a peer that disconnects early cancels the run.
async fn stream_events(
    mut observer: RunObserver,
    owner: Option<Arc<ActionRun>>,
    mut reader: BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> Result<()> {
    debug!(run_id = %observer.run_id(), "stream_events: called");
    let mut scratch = [0u8; 64];

    loop {
        tokio::select! {
            event = observer.next() => {
                let Some(event) = event else {
                    return Ok(());
                };
                let terminal = event.is_terminal();
                if let Err(e) = send_response(writer, &DaemonResponse::Event { event }).await {
                    disconnected(&observer, owner.as_ref());
                    return Err(e);
                }
                if terminal {
                    return Ok(());
                }
            }

            read = reader.read(&mut scratch) => {
                if matches!(read, Ok(0) | Err(_)) {
                    disconnected(&observer, owner.as_ref());
                    return Ok(());
                }
            }
        }
    }
}

fn disconnected(observer: &RunObserver, owner: Option<&Arc<ActionRun>>) {
    match owner {
        Some(run) => {
            info!(run_id = %observer.run_id(), "stream_events: peer disconnected, cancelling run");
            run.cancel();
        }
        None => debug!(run_id = %observer.run_id(), "stream_events: peer disconnected"),
    }
}

