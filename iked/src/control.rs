//! The local administrative control socket
//!
//! A client connects to the unix socket, sends one typed command and
//! reads typed replies until the explicit `End` marker. The control
//! process only relays: [ControlServer::bridge] carries the command
//! over IPC into the parent, which fans it out, and streams the reply
//! parts back the same way. [request] is the matching client side, for
//! the external control utility.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::ipc::{ImsgChannel, IpcPayload, ResetScope};
use crate::{Error, Result};

/// Largest accepted control frame
const MAX_CONTROL_SIZE: usize = 64 * 1024;

/// Commands an administrator can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Reload the configuration
    Reload,
    /// Flush state of the given scope
    Reset(ResetScope),
    /// Load the negotiated flows into the kernel
    Couple,
    /// Remove the flows from the kernel
    Decouple,
    /// List the IKE SAs
    ShowSas,
    /// List the compiled policies
    ShowPolicies,
    /// List the installed flows
    ShowFlows,
    /// Raise the log verbosity
    LogVerbose,
    /// Reset the log verbosity
    LogBrief,
}

/// One IKE SA as reported by `show sa`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaSummary {
    /// Initiator SPI, hex
    pub spi_i: String,
    /// Responder SPI, hex
    pub spi_r: String,
    /// State name
    pub state: String,
    /// Peer endpoint
    pub peer: String,
    /// Proven peer identity, if any
    pub peer_id: Option<String>,
    /// Number of child SAs
    pub children: usize,
    /// NAT-T active
    pub natt: bool,
}

/// One policy as reported by `show policies`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySummary {
    /// Policy name
    pub name: String,
    /// Active or passive
    pub mode: String,
    /// Peer prefix, if restricted
    pub peer: Option<String>,
    /// SAs born from this policy
    pub refs: usize,
}

/// One flow as reported by `show flows`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    /// Source prefix
    pub src: String,
    /// Destination prefix
    pub dst: String,
    /// Direction
    pub direction: String,
    /// Routing domain
    pub rdomain: u32,
}

/// A single reply part; a stream of parts ends with `End`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlReply {
    /// Command accepted
    Ok,
    /// Command failed
    Fail(String),
    /// One SA of a `show sa` listing
    Sa(SaSummary),
    /// One policy of a `show policies` listing
    Policy(PolicySummary),
    /// One flow of a `show flows` listing
    Flow(FlowSummary),
    /// Terminates a multi-part reply
    End,
}

/// Read one length-prefixed frame
async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut UnixStream) -> Result<T> {
    let len = stream
        .read_u32()
        .await
        .map_err(|e| Error::Internal(format!("control read: {e}")))? as usize;
    if len > MAX_CONTROL_SIZE {
        return Err(Error::Resource("control frame exceeds the size cap"));
    }
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::Internal(format!("control read: {e}")))?;
    serde_json::from_slice(&buf).map_err(|e| Error::Internal(format!("control decode: {e}")))
}

/// Write one length-prefixed frame
async fn write_frame<T: Serialize>(stream: &mut UnixStream, value: &T) -> Result<()> {
    let buf =
        serde_json::to_vec(value).map_err(|e| Error::Internal(format!("control encode: {e}")))?;
    stream
        .write_u32(buf.len() as u32)
        .await
        .map_err(|e| Error::Internal(format!("control write: {e}")))?;
    stream
        .write_all(&buf)
        .await
        .map_err(|e| Error::Internal(format!("control write: {e}")))?;
    Ok(())
}

/// The listening side run by the control process
#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one
    pub fn bind(path: &std::path::Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| Error::Config(format!("control socket {}: {e}", path.display())))?;
        Ok(Self { listener })
    }

    /// Wrap an already bound listener (fd passed by the parent)
    pub fn from_listener(listener: UnixListener) -> Self {
        Self { listener }
    }

    /// Wait for the next client connection
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("control accept: {e}")))?;
        Ok(stream)
    }

    /// Serve one client conversation: read its command, relay it over
    /// the IPC channel and stream the reply parts back until `End`.
    ///
    /// Returns `false` when a shutdown announcement arrived on the
    /// channel mid-conversation; the client still gets its `End`.
    pub async fn bridge(
        &self,
        stream: &mut UnixStream,
        channel: &mut ImsgChannel,
    ) -> Result<bool> {
        let command: ControlCommand = read_frame(stream).await?;
        debug!(?command, "control command");
        channel.compose(0, &IpcPayload::ControlCommand(command), None)?;
        channel.flush().await?;

        loop {
            let (_, payload, _) = channel.recv().await?;
            let part = match payload {
                IpcPayload::ControlReply(part) => part,
                IpcPayload::Shutdown => {
                    write_frame(stream, &ControlReply::End).await?;
                    return Ok(false);
                }
                other => {
                    debug!(?other, "ignored while relaying a control reply");
                    continue;
                }
            };
            let done = matches!(part, ControlReply::End);
            write_frame(stream, &part).await?;
            if done {
                return Ok(true);
            }
        }
    }
}

/// The client side used by the control utility
pub async fn request(
    path: &std::path::Path,
    command: ControlCommand,
) -> Result<Vec<ControlReply>> {
    let mut stream = UnixStream::connect(path)
        .await
        .map_err(|e| Error::Internal(format!("control connect: {e}")))?;
    write_frame(&mut stream, &command).await?;
    let mut parts = vec![];
    loop {
        let part: ControlReply = read_frame(&mut stream).await?;
        if matches!(part, ControlReply::End) {
            return Ok(parts);
        }
        parts.push(part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_travels_the_bridge() {
        let dir = std::env::temp_dir().join(format!("iked-ctl-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("control.sock");
        let server = ControlServer::bind(&path).unwrap();
        let (mut near, mut far) = ImsgChannel::pair().unwrap();

        // the engine side of the relay answers one ShowSas command
        let engine_task = tokio::spawn(async move {
            let (peer_id, payload, _) = far.recv().await.unwrap();
            assert!(matches!(
                payload,
                IpcPayload::ControlCommand(ControlCommand::ShowSas)
            ));
            for part in [
                ControlReply::Sa(SaSummary {
                    spi_i: "0x01".into(),
                    spi_r: "0x02".into(),
                    state: "Established".into(),
                    peer: "192.0.2.1:500".into(),
                    peer_id: None,
                    children: 1,
                    natt: false,
                }),
                ControlReply::End,
            ] {
                far.compose(peer_id, &IpcPayload::ControlReply(part), None)
                    .unwrap();
            }
            far.flush().await.unwrap();
        });

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            assert!(server.bridge(&mut stream, &mut near).await.unwrap());
        });

        let parts = request(&path, ControlCommand::ShowSas).await.unwrap();
        engine_task.await.unwrap();
        server_task.await.unwrap();
        assert_eq!(parts.len(), 1);
        assert!(matches!(&parts[0], ControlReply::Sa(sa) if sa.children == 1));
        let _ = std::fs::remove_file(&path);
    }
}
