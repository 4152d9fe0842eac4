//! Shared helpers: scripted fake agents written into a temp directory.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agentwire_core::ndjson::Message;
use agentwire_core::{AgentOptions, CommandSpec, build_command};
use agentwire_runtime::MessageStream;

/// Speaks just enough stream-json to exercise the runtime.
///
/// - a user turn emits `system`, an `assistant` echo (written in two
///   pieces), and a `result`;
/// - the prompt `env` echoes `$CLAUDE_CODE_ENTRYPOINT`;
/// - the prompt `die` writes to stderr and exits with code 3;
/// - a control request is acknowledged with a `control_response`;
/// - stdin EOF exits cleanly.
pub const FAKE_AGENT: &str = r#"#!/bin/sh
n=0
while IFS= read -r line; do
  case "$line" in
    *'"control_request"'*)
      id=$(printf '%s' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
      printf '{"type":"control_response","response":{"subtype":"success","request_id":"%s"}}\n' "$id"
      ;;
    *'"type":"user"'*)
      text=$(printf '%s' "$line" | sed -n 's/.*"content":"\([^"]*\)".*/\1/p')
      n=$((n+1))
      if [ "$text" = "die" ]; then
        echo "fatal: asked to die" >&2
        exit 3
      fi
      if [ "$text" = "env" ]; then
        text="$CLAUDE_CODE_ENTRYPOINT"
      fi
      printf '{"type":"system","subtype":"init","session_id":"fake"}\n'
      printf '{"type":"assistant","session_id":"fake","message":{"model":"fake","content":[{"type":"text",'
      sleep 0.05
      printf '"text":"echo: %s"}]}}\n' "$text"
      printf '{"type":"result","subtype":"success","is_error":false,"duration_ms":5,"num_turns":%d,"session_id":"fake"}\n' "$n"
      ;;
  esac
done
"#;

/// Ignores SIGTERM and stdin EOF.
pub const STUBBORN_AGENT: &str = r#"#!/bin/sh
trap '' TERM
while :; do sleep 1; done
"#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn fake_agent(dir: &Path) -> PathBuf {
    write_script(dir, "fake-agent", FAKE_AGENT)
}

pub fn spec_for(program: &Path) -> CommandSpec {
    build_command(&AgentOptions::default(), program)
}

/// Collect messages up to and including the next result.
pub async fn read_turn(stream: &mut MessageStream) -> Vec<Message> {
    let mut turn = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), stream.messages.recv())
            .await
            .expect("timed out waiting for agent output")
            .expect("message stream closed mid-turn");
        let done = msg.is_result();
        turn.push(msg);
        if done {
            return turn;
        }
    }
}

/// Text of the first assistant message in `turn`.
pub fn assistant_text(turn: &[Message]) -> String {
    turn.iter()
        .find_map(|m| match m {
            Message::Assistant(a) => Some(a.text()),
            _ => None,
        })
        .unwrap_or_default()
}
