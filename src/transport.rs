use crate::session::Session;
use crate::sync::PeerEndpoint;
use crate::types::{Envelope, Party, Peer, PeerMessage, SessionMessage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// One outbound line: a session envelope and the peer it is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundLine {
    pub to: Peer,
    pub envelope: Envelope<SessionMessage>,
}

/// Serves `session` over a JSON-lines stream carrying both peers.
///
/// Each input line is an `Envelope<PeerMessage>` routed by its `sender`;
/// each output line is an [`OutboundLine`]. Both peers get a snapshot first.
/// End of input closes the agent side: the session shuts down and every
/// remaining message is written before this returns.
pub async fn serve_jsonl<R, W>(session: Session, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Session { handle, agent, ui } = session;
    let mut agent = Some(agent);
    let mut ui = Some(ui);
    let mut lines = reader.lines();
    let mut input_open = true;
    let mut shutdown = None;

    handle.send_snapshot(Peer::Agent);
    handle.send_snapshot(Peer::Ui);

    while agent.is_some() || ui.is_some() {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                match line.context("failed to read session input")? {
                    Some(line) => route_line(&line, agent.as_ref(), ui.as_ref()),
                    None => {
                        tracing::info!(session_id = %handle.id(), "input closed; shutting session down");
                        input_open = false;
                        let handle = handle.clone();
                        shutdown = Some(tokio::spawn(async move { handle.shutdown().await }));
                    }
                }
            }
            envelope = next_outbound(&mut agent) => match envelope {
                Some(envelope) => write_line(&mut writer, Peer::Agent, envelope).await?,
                None => agent = None,
            },
            envelope = next_outbound(&mut ui) => match envelope {
                Some(envelope) => write_line(&mut writer, Peer::Ui, envelope).await?,
                None => ui = None,
            },
        }
    }

    if let Some(shutdown) = shutdown {
        shutdown.await.context("session shutdown task failed")?;
    }
    writer.flush().await?;
    Ok(())
}

async fn next_outbound(endpoint: &mut Option<PeerEndpoint>) -> Option<Envelope<SessionMessage>> {
    match endpoint {
        Some(endpoint) => endpoint.recv_envelope().await,
        None => std::future::pending().await,
    }
}

fn route_line(line: &str, agent: Option<&PeerEndpoint>, ui: Option<&PeerEndpoint>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let envelope: Envelope<PeerMessage> = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, "unparseable session input line dropped");
            return;
        }
    };

    let endpoint = match envelope.sender {
        Party::Agent => agent,
        Party::Ui => ui,
        Party::Session => {
            tracing::warn!("input line claims to come from the session; dropped");
            return;
        }
    };
    match endpoint {
        Some(endpoint) => {
            if endpoint.forward(envelope).is_err() {
                tracing::debug!("session inbox closed; input dropped");
            }
        }
        None => tracing::debug!(sender = ?envelope.sender, "peer detached; input dropped"),
    }
}

async fn write_line<W>(writer: &mut W, to: Peer, envelope: Envelope<SessionMessage>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(&OutboundLine { to, envelope })?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .context("failed to write session output")?;
    writer.flush().await?;
    Ok(())
}
