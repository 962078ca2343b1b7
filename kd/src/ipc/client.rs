//! IPC client for communicating with the daemon

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use super::MAX_MESSAGE_SIZE;
use crate::action::{ActionResult, BuiltTargetInfo};
use crate::api::{DaemonMessage, DaemonResponse};
use crate::engine::RepoInfo;
use crate::events::ActionEvent;
use crate::rule::ErrorInfo;
use crate::value::Args;

/// Default timeout for connect, write and quick replies
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure reported by the daemon, as opposed to a transport failure
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RemoteError(pub ErrorInfo);

/// Client for communicating with the daemon via IPC
///
/// Evaluation requests wait as long as the build takes; only connecting,
/// writing and quick queries are bounded by the timeout.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Check if the daemon socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if daemon is alive and get its version
    pub async fn ping(&self) -> Result<String> {
        debug!("DaemonClient: pinging daemon");
        match self.request(DaemonMessage::Ping, Some(self.timeout)).await? {
            DaemonResponse::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Request daemon to shutdown gracefully
    pub async fn shutdown(&self) -> Result<()> {
        debug!("DaemonClient: requesting daemon shutdown");
        match self.request(DaemonMessage::Shutdown, Some(self.timeout)).await? {
            DaemonResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn repo_info(&self) -> Result<RepoInfo> {
        debug!("DaemonClient: requesting repo info");
        match self.request(DaemonMessage::GetRepoInfo, Some(self.timeout)).await? {
            DaemonResponse::RepoInfo { info } => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn reload(&self) -> Result<RepoInfo> {
        debug!("DaemonClient: requesting reload");
        match self.request(DaemonMessage::ReloadScript, None).await? {
            DaemonResponse::RepoInfo { info } => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn build_target(&self, target: &str) -> Result<BuiltTargetInfo> {
        debug!(%target, "DaemonClient: requesting build");
        let msg = DaemonMessage::BuildTarget {
            target: target.to_string(),
        };
        match self.request(msg, None).await? {
            DaemonResponse::BuiltTarget { info } => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn invoke_action(&self, action: &str, args: Args) -> Result<ActionResult> {
        debug!(%action, "DaemonClient: invoking action");
        let msg = DaemonMessage::InvokeAction {
            action: action.to_string(),
            args,
        };
        match self.request(msg, None).await? {
            DaemonResponse::ActionResult { result } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// Invoke an action and stream its events
    pub async fn stream_action(&self, action: &str, args: Args, cancel_on_disconnect: bool) -> Result<EventStream> {
        debug!(%action, cancel_on_disconnect, "DaemonClient: streaming action");
        let msg = DaemonMessage::StreamingInvokeAction {
            action: action.to_string(),
            args,
            cancel_on_disconnect,
        };
        self.open_stream(msg).await
    }

    /// Stream the events of an existing run from the beginning
    pub async fn observe_run(&self, run_id: &str) -> Result<EventStream> {
        debug!(%run_id, "DaemonClient: observing run");
        self.open_stream(DaemonMessage::ObserveRun {
            run_id: run_id.to_string(),
        })
        .await
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<()> {
        debug!(%run_id, "DaemonClient: cancelling run");
        let msg = DaemonMessage::CancelRun {
            run_id: run_id.to_string(),
        };
        match self.request(msg, Some(self.timeout)).await? {
            DaemonResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Send one request and read one response
    async fn request(&self, msg: DaemonMessage, read_timeout: Option<Duration>) -> Result<DaemonResponse> {
        let (read_half, write_half) = self.send(&msg).await?;
        let mut reader = BufReader::new(read_half);
        let read = read_response(&mut reader);
        let response = match read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, read).await.context("Read timeout")??,
            None => read.await?,
        };
        drop(write_half);
        response.ok_or_else(|| eyre::eyre!("Daemon closed the connection without responding"))
    }

    async fn open_stream(&self, msg: DaemonMessage) -> Result<EventStream> {
        let (read_half, write_half) = self.send(&msg).await?;
        Ok(EventStream {
            reader: BufReader::new(read_half),
            _writer: write_half,
            done: false,
        })
    }

    /// Connect and write `msg`
    async fn send(&self, msg: &DaemonMessage) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
        debug!(?self.socket_path, ?msg, "DaemonClient: sending message");

        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to daemon socket")?;

        let msg_json = serde_json::to_string(msg).context("Failed to serialize message")?;
        if msg_json.len() > MAX_MESSAGE_SIZE {
            return Err(eyre::eyre!("Message too large: {} bytes", msg_json.len()));
        }

        let (read_half, mut write_half) = stream.into_split();
        tokio::time::timeout(self.timeout, async {
            write_half
                .write_all(msg_json.as_bytes())
                .await
                .context("Failed to write message")?;
            write_half.write_all(b"\n").await.context("Failed to write newline")?;
            write_half.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")??;

        Ok((read_half, write_half))
    }
}

/// Events of a streamed run, ending after the terminal event
///
/// Dropping the stream closes the connection; the run keeps going unless
/// it was started with `cancel_on_disconnect`.
pub struct EventStream {
    reader: BufReader<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
    done: bool,
}

impl EventStream {
    /// Next event, or `None` once the terminal event has been returned
    pub async fn next(&mut self) -> Result<Option<ActionEvent>> {
        if self.done {
            return Ok(None);
        }
        match read_response(&mut self.reader).await? {
            Some(DaemonResponse::Event { event }) => {
                self.done = event.is_terminal();
                Ok(Some(event))
            }
            Some(other) => {
                self.done = true;
                Err(unexpected(other))
            }
            None => {
                self.done = true;
                Err(eyre::eyre!("Daemon closed the stream before the run finished"))
            }
        }
    }
}

/// One response line; `None` on end of stream
async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<DaemonResponse>> {
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await.context("Failed to read response")?;
    if bytes_read == 0 {
        return Ok(None);
    }
    if bytes_read > MAX_MESSAGE_SIZE {
        return Err(eyre::eyre!("Response too large: {} bytes", bytes_read));
    }
    let response: DaemonResponse =
        serde_json::from_str(line.trim()).context("Failed to parse daemon response")?;
    debug!(response_type = response_type(&response), "DaemonClient: received response");
    Ok(Some(response))
}

fn response_type(response: &DaemonResponse) -> &'static str {
    match response {
        DaemonResponse::RepoInfo { .. } => "RepoInfo",
        DaemonResponse::BuiltTarget { .. } => "BuiltTarget",
        DaemonResponse::ActionResult { .. } => "ActionResult",
        DaemonResponse::Event { .. } => "Event",
        DaemonResponse::Ok => "Ok",
        DaemonResponse::Pong { .. } => "Pong",
        DaemonResponse::Error { .. } => "Error",
    }
}

/// Daemon errors keep their `ErrorInfo`; anything else is a protocol error
fn unexpected(response: DaemonResponse) -> eyre::Report {
    match response {
        DaemonResponse::Error { error } => RemoteError(error).into(),
        other => eyre::eyre!("Unexpected response: {}", response_type(&other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_client_with_custom_path() {
        let path = PathBuf::from("/custom/path/daemon.sock");
        let client = DaemonClient::with_socket_path(path.clone());
        assert_eq!(client.socket_path(), &path);
        assert_eq!(client.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_client_with_timeout() {
        let client = DaemonClient::with_socket_path(PathBuf::from("/x.sock")).with_timeout(Duration::from_secs(10));
        assert_eq!(client.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_socket_exists_false() {
        let temp = TempDir::new().unwrap();
        let client = DaemonClient::with_socket_path(temp.path().join("nonexistent.sock"));
        assert!(!client.socket_exists());
    }

    #[tokio::test]
    async fn test_ping_without_daemon_fails() {
        let temp = TempDir::new().unwrap();
        let client = DaemonClient::with_socket_path(temp.path().join("nonexistent.sock"));
        assert!(client.ping().await.is_err());
    }

    #[test]
    fn test_remote_error_is_downcastable() {
        let report = unexpected(DaemonResponse::error(ErrorInfo::request("unknown target: x")));
        let remote = report.downcast_ref::<RemoteError>().unwrap();
        assert_eq!(remote.0.kind, "RequestError");
        assert!(report.to_string().contains("unknown target"));
    }
}
