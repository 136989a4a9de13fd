use scenesync::backend::ScriptedBackend;
use scenesync::tools::ToolRegistry;
use scenesync::transport::{serve_jsonl, OutboundLine};
use scenesync::types::{
    Envelope, InvocationStatus, Party, Peer, PeerMessage, SessionId, SessionMessage,
};
use scenesync::{Config, Session};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

const WAIT: Duration = Duration::from_secs(5);

fn input_line(session_id: SessionId, sender: Party, seq: u64, message: PeerMessage) -> String {
    let envelope = Envelope {
        session_id,
        sender,
        seq,
        message,
    };
    let mut line = serde_json::to_string(&envelope).expect("serialize envelope");
    line.push('\n');
    line
}

async fn next_line(lines: &mut Lines<BufReader<DuplexStream>>) -> Option<OutboundLine> {
    let line = tokio::time::timeout(WAIT, lines.next_line())
        .await
        .expect("output before timeout")
        .expect("read output")?;
    Some(serde_json::from_str(&line).expect("outbound line parses"))
}

async fn until<T>(
    lines: &mut Lines<BufReader<DuplexStream>>,
    mut pick: impl FnMut(&OutboundLine) -> Option<T>,
) -> T {
    loop {
        let line = next_line(lines).await.expect("output still open");
        if let Some(found) = pick(&line) {
            return found;
        }
    }
}

#[tokio::test]
async fn test_serve_jsonl_runs_an_ungated_tool_end_to_end() {
    let session = Session::open(
        &Config::default(),
        ToolRegistry::default(),
        Arc::new(ScriptedBackend::new()),
    );
    let handle = session.handle.clone();
    let session_id = handle.id();

    let (mut input, server_input) = tokio::io::duplex(64 * 1024);
    let (server_output, output) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_jsonl(
        session,
        BufReader::new(server_input),
        server_output,
    ));
    let mut lines = BufReader::new(output).lines();

    let mut greeted = Vec::new();
    for _ in 0..2 {
        let line = next_line(&mut lines).await.expect("snapshot line");
        assert!(matches!(
            line.envelope.message,
            SessionMessage::StateSnapshot { .. }
        ));
        assert_eq!(line.envelope.sender, Party::Session);
        greeted.push(line.to);
    }
    assert!(greeted.contains(&Peer::Agent) && greeted.contains(&Peer::Ui));

    input
        .write_all(b"this is not an envelope\n")
        .await
        .expect("write junk");
    let request = PeerMessage::InvocationRequest {
        request_id: "r-1".to_string(),
        tool: "set_story_field".to_string(),
        args: json!({"path": "story.title", "value": "Harbor Lights"})
            .as_object()
            .cloned()
            .unwrap_or_default(),
    };
    input
        .write_all(input_line(session_id, Party::Agent, 1, request).as_bytes())
        .await
        .expect("write request");

    let result = until(&mut lines, |line| match &line.envelope.message {
        SessionMessage::ToolResult(result) => {
            assert_eq!(line.to, Peer::Agent, "tool results go to the agent only");
            Some(result.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(result.status, InvocationStatus::Succeeded);
    assert_eq!(
        handle.snapshot().field("story.title"),
        Some(&json!("Harbor Lights"))
    );

    drop(input);
    while next_line(&mut lines).await.is_some() {}
    tokio::time::timeout(WAIT, server)
        .await
        .expect("server returns after end of input")
        .expect("server task")
        .expect("serve ok");
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_serve_jsonl_drops_lines_claiming_the_session_as_sender() {
    let session = Session::open(
        &Config::default(),
        ToolRegistry::default(),
        Arc::new(ScriptedBackend::new()),
    );
    let handle = session.handle.clone();
    let session_id = handle.id();

    let (mut input, server_input) = tokio::io::duplex(64 * 1024);
    let (server_output, output) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_jsonl(
        session,
        BufReader::new(server_input),
        server_output,
    ));
    let mut lines = BufReader::new(output).lines();

    let forged = PeerMessage::StatePatch {
        based_on_version: 0,
        patch: scenesync::types::Patch::set("title", json!("forged")),
    };
    input
        .write_all(input_line(session_id, Party::Session, 1, forged).as_bytes())
        .await
        .expect("write forged");
    input
        .write_all(input_line(session_id, Party::Ui, 1, PeerMessage::SnapshotRequest).as_bytes())
        .await
        .expect("write snapshot request");

    // Two greeting snapshots, then the one the UI asked for.
    let mut snapshots = 0;
    let state = until(&mut lines, |line| match &line.envelope.message {
        SessionMessage::StateSnapshot { state } => {
            snapshots += 1;
            (snapshots == 3).then(|| state.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(state.version, 0);
    assert!(state.field("title").is_none());

    drop(input);
    while next_line(&mut lines).await.is_some() {}
    tokio::time::timeout(WAIT, server)
        .await
        .expect("server returns")
        .expect("server task")
        .expect("serve ok");
}
