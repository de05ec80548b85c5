//! Device-style control entry point carried over a Unix domain socket.
//!
//! Each connection maps to one attempt at opening the control session: the
//! first connection holds the session for its lifetime, any concurrent
//! connection is answered with a single `BUSY` status frame and closed.
//! Connection teardown is session teardown.

use std::path::{Path, PathBuf};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};
use tracing::{debug, info, warn};
use weir_common::control as wire;

use crate::control::{channel::ControlChannel, error::ControlError};

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    channel: ControlChannel,
}

impl ControlServer {
    /// Bind the entry point. A stale socket file from a previous run is
    /// removed first.
    pub fn bind(path: impl AsRef<Path>, channel: ControlChannel) -> Result<Self, ControlError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(
            event.name = "control.server_started",
            server.path = %path.display(),
            "control entry point listening"
        );
        Ok(Self {
            listener,
            path,
            channel,
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }

    /// Accept loop. Runs until the task is aborted at shutdown.
    pub async fn run(self) -> Result<(), ControlError> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let channel = self.channel.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, channel).await {
                    debug!(
                        event.name = "control.connection_ended",
                        error.message = %e,
                        "control connection ended"
                    );
                }
            });
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    channel: ControlChannel,
) -> Result<(), ControlError> {
    let mut session = match channel.open() {
        Ok(session) => session,
        Err(ControlError::Busy) => {
            // Tell the loser why, then hang up.
            write_frame(&mut stream, wire::STATUS_BUSY, &[]).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    loop {
        let mut header = [0u8; wire::HEADER_LEN];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            // Peer hung up between requests: normal teardown, the session
            // drops and the slot frees.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let Some(frame) = wire::FrameHeader::from_bytes(&header) else {
            write_frame(&mut stream, wire::STATUS_PROTOCOL, &[]).await?;
            return Ok(());
        };
        if frame.length > wire::MAX_PAYLOAD {
            warn!(
                event.name = "control.oversized_request",
                request.opcode = frame.word,
                request.length = frame.length,
                "request payload over limit; closing session"
            );
            write_frame(&mut stream, wire::STATUS_PROTOCOL, &[]).await?;
            return Ok(());
        }
        let mut payload = vec![0u8; frame.length as usize];
        stream.read_exact(&mut payload).await?;

        let response = session.call(frame.word, &payload).await;
        write_frame(&mut stream, response.status, &response.payload).await?;
    }
}

async fn write_frame(
    stream: &mut UnixStream,
    status: u32,
    payload: &[u8],
) -> Result<(), ControlError> {
    let header = wire::FrameHeader::new(status, payload.len() as u32);
    stream.write_all(&header.to_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}
