//! Local producer socket.
//!
//! A Unix-domain socket that trusted processes on the same host write
//! newline-delimited `TOPIC PAYLOAD` lines into. Every line lands on one
//! queue, which the command processor forwards to the coordinator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines read from local producers but not yet forwarded.
pub const LOCAL_QUEUE_CAPACITY: usize = 256;

pub struct LocalSocket {
    path: PathBuf,
}

impl LocalSocket {
    /// Bind `path`, replacing a stale socket file left by an earlier run, and
    /// accept producers until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the stale file cannot be removed or the socket
    /// cannot be bound.
    pub fn bind(path: &Path, shutdown: CancellationToken) -> Result<(Self, mpsc::Receiver<String>)> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding local socket {}", path.display()))?;
        info!(path = %path.display(), "accepting local producers");

        let (tx, rx) = mpsc::channel(LOCAL_QUEUE_CAPACITY);
        tokio::spawn(accept_loop(listener, tx, shutdown));
        Ok((
            Self {
                path: path.to_path_buf(),
            },
            rx,
        ))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
) {
    let mut producers = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    debug!("local producer connected");
                    producers.spawn(read_lines(stream, tx.clone(), shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "accepting local producer failed"),
            },
            Some(_) = producers.join_next(), if !producers.is_empty() => {}
        }
    }
    producers.shutdown().await;
    debug!("local socket closed");
}

async fn read_lines(stream: UnixStream, tx: mpsc::Sender<String>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("local producer disconnected");
                return;
            }
            Err(e) => {
                warn!(error = %e, "reading from local producer failed");
                return;
            }
        }
    }
}
