//! Unix domain socket transport between CLI and daemon
//!
//! One daemon per project listens on `<repo>/daemon.sock`. Each connection
//! carries one request; see [`crate::api::messages`] for the protocol.

use std::path::{Path, PathBuf};

pub mod client;
pub mod listener;

pub use client::{DaemonClient, EventStream, RemoteError};
pub use listener::{cleanup_socket, create_listener_at, read_message, send_response};

/// Maximum size of one message line
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Longest socket path accepted by `bind` on common platforms
const MAX_SOCKET_PATH: usize = 100;

/// Socket path to use for a repository socket path
///
/// Deeply nested projects can exceed the platform limit on socket path
/// length; those fall back to a short path under the runtime directory
/// derived from a hash of the preferred path.
pub fn socket_path(preferred: &Path) -> PathBuf {
    if preferred.as_os_str().len() <= MAX_SOCKET_PATH {
        return preferred.to_path_buf();
    }
    let digest = blake3::hash(preferred.as_os_str().as_encoded_bytes());
    let name = format!("{}.sock", &hex::encode(digest.as_bytes())[..16]);
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kiln")
        .join(name)
}
