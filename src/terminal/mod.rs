//! Terminal Command Interpreter — the durable consumer that turns
//! `terminal.command` messages into session mutations plus a freeze event,
//! and the pure command table it dispatches through.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::client::BrokerClient;
use crate::bus::messages::{ScriptCreateCommand, ScriptRunCommand, ScriptType, TerminalCommand};
use crate::bus::{self, event_terminal_freeze};
use crate::error::SwitchboardError;
use crate::presets::PresetRegistry;
use crate::session::layout::LayoutNode;
use crate::session::{SessionDocument, SessionStore};

const TERMINAL_DURABLE: &str = "terminal-interpreter";

pub struct TerminalContext {
    pub broker: BrokerClient,
    pub store: Arc<dyn SessionStore>,
    pub presets: Arc<PresetRegistry>,
    pub scripts_root: PathBuf,
}

/// Split on whitespace; single/double quotes flip an in-quote flag during
/// which whitespace is literal and the quote characters themselves are
/// consumed rather than copied into the token.
pub fn tokenize(cmd: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;
    let mut has_current = false;

    for ch in cmd.chars() {
        match in_quote {
            Some(q) => {
                if ch == q {
                    in_quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => {
                if ch == '\'' || ch == '"' {
                    in_quote = Some(ch);
                    has_current = true;
                } else if ch.is_whitespace() {
                    if has_current || !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                        has_current = false;
                    }
                } else {
                    current.push(ch);
                    has_current = true;
                }
            }
        }
    }
    if has_current || !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Collects every occurrence of each `--flag value`, in order, so repeatable
/// flags like `--env K=V --env K2=V2` all survive; single-valued flags just
/// read their first entry.
fn parse_flags(rest: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut flags: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut i = 0;
    while i < rest.len() {
        if let Some(key) = rest[i].strip_prefix("--") {
            let value = rest.get(i + 1).cloned().unwrap_or_default();
            flags.entry(key.to_string()).or_default().push(value);
            i += 2;
        } else {
            i += 1;
        }
    }
    flags
}

fn first_flag<'a>(flags: &'a BTreeMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    flags.get(key).and_then(|v| v.first()).map(String::as_str)
}

fn help_text(topic: Option<&str>) -> String {
    match topic {
        None => "commands: help, echo, env, ls, load, script, view".to_string(),
        Some("env") => "env set K=V | env list | env clear".to_string(),
        Some("ls") => "ls scripts | ls presets | ls preset <id>".to_string(),
        Some("load") => "load <preset-id> [--k v ...]".to_string(),
        Some("script") => "script create <name> <lang> | script run <name> [--input JSON] [--env K=V ...] | script info <name>".to_string(),
        Some("view") => "view <path> [path ...]".to_string(),
        Some(other) => format!("no help for '{other}'"),
    }
}

fn cmd_env(mut doc: SessionDocument, argv: &[String]) -> (SessionDocument, String) {
    match argv.get(1).map(String::as_str) {
        Some("set") => {
            let Some(kv) = argv.get(2) else {
                return (doc, "error: env set requires K=V".to_string());
            };
            let Some((k, v)) = kv.split_once('=') else {
                return (doc, "error: env set requires K=V".to_string());
            };
            doc.env.insert(k.to_string(), v.to_string());
            (doc, format!("{k}={v}"))
        }
        Some("list") => {
            let listing = doc
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("\n");
            (doc, listing)
        }
        Some("clear") => {
            doc.env.clear();
            (doc, "env cleared".to_string())
        }
        _ => (doc, "error: unknown env subcommand".to_string()),
    }
}

async fn cmd_ls(ctx: &TerminalContext, argv: &[String]) -> String {
    match argv.get(1).map(String::as_str) {
        Some("scripts") => {
            let mut names = Vec::new();
            if let Ok(mut entries) = tokio::fs::read_dir(&ctx.scripts_root).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        names.push(entry.file_name().to_string_lossy().to_string());
                    }
                }
            }
            names.sort();
            names.join("\n")
        }
        Some("presets") => ctx.presets.ids().join("\n"),
        Some("preset") => {
            let Some(id) = argv.get(2) else {
                return "error: ls preset requires <id>".to_string();
            };
            match ctx.presets.get(id).await {
                Ok(preset) => preset.expand_subscriptions(&BTreeMap::new()).join("\n"),
                Err(e) => format!("error: {e}"),
            }
        }
        _ => "error: unknown ls subcommand".to_string(),
    }
}

async fn cmd_load(
    ctx: &TerminalContext,
    mut doc: SessionDocument,
    argv: &[String],
) -> (SessionDocument, String) {
    let Some(id) = argv.get(1) else {
        return (doc, "error: load requires <preset-id>".to_string());
    };
    let flags = parse_flags(&argv[2..]);
    let args: BTreeMap<String, String> = flags
        .into_iter()
        .filter_map(|(k, v)| v.into_iter().next().map(|first| (k, first)))
        .collect();
    let preset = match ctx.presets.get(id).await {
        Ok(p) => p,
        Err(e) => return (doc, format!("error: {e}")),
    };
    match preset.build(&args) {
        Ok(layout) => {
            doc.layout = Some(layout);
            (doc, format!("loaded preset {id}"))
        }
        Err(e) => (doc, format!("error: {e}")),
    }
}

async fn cmd_script(
    ctx: &TerminalContext,
    doc: SessionDocument,
    argv: &[String],
) -> (SessionDocument, String) {
    match argv.get(1).map(String::as_str) {
        Some("create") => {
            let (Some(name), Some(lang)) = (argv.get(2), argv.get(3)) else {
                return (doc, "error: script create requires <name> <lang>".to_string());
            };
            let script_type = match lang.as_str() {
                "python" => ScriptType::Python,
                "typescript" => ScriptType::Typescript,
                other => return (doc, format!("error: unknown script type '{other}'")),
            };
            let command = ScriptCreateCommand {
                script_name: name.clone(),
                script_type,
                correlation_id: None,
            };
            if let Err(e) = command.validate() {
                return (doc, format!("error: {e}"));
            }
            match ctx
                .broker
                .publish_command(bus::COMMAND_SCRIPT_CREATE, &command)
                .await
            {
                Ok(()) => (doc, format!("script create requested: {name}")),
                Err(e) => (doc, format!("error: {e}")),
            }
        }
        Some("run") => {
            let Some(name) = argv.get(2) else {
                return (doc, "error: script run requires <name>".to_string());
            };
            let flags = parse_flags(&argv[3..]);
            let input = if let Some(raw) = first_flag(&flags, "input") {
                serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
            } else if let Some(path) = first_flag(&flags, "file") {
                match tokio::fs::read_to_string(path).await {
                    Ok(contents) => {
                        serde_json::from_str(&contents).unwrap_or(serde_json::Value::Null)
                    }
                    Err(e) => return (doc, format!("error: cannot read {path}: {e}")),
                }
            } else {
                serde_json::Value::Object(serde_json::Map::new())
            };
            let mut env = doc.env.clone();
            for kv in flags.get("env").into_iter().flatten() {
                if let Some((k, v)) = kv.split_once('=') {
                    env.insert(k.to_string(), v.to_string());
                }
            }
            let command = ScriptRunCommand {
                script_name: name.clone(),
                input,
                env,
                correlation_id: None,
            };
            if let Err(e) = command.validate() {
                return (doc, format!("error: {e}"));
            }
            match ctx
                .broker
                .publish_command(bus::COMMAND_SCRIPT_RUN, &command)
                .await
            {
                Ok(()) => (doc, format!("script run requested: {name}")),
                Err(e) => (doc, format!("error: {e}")),
            }
        }
        Some("info") => {
            let Some(name) = argv.get(2) else {
                return (doc, "error: script info requires <name>".to_string());
            };
            let dir = ctx.scripts_root.join(name);
            if !dir.is_dir() {
                return (doc, format!("error: script '{name}' not found"));
            }
            let language = if dir.join("main.py").is_file() {
                "python"
            } else if dir.join("index.ts").is_file() {
                "typescript"
            } else {
                "unknown"
            };
            let has_in_schema = dir.join("in.schema.json").is_file();
            let has_out_schema = dir.join("out.schema.json").is_file();
            let has_env = dir.join(".env").is_file();
            let type_count = std::fs::read_dir(dir.join("types"))
                .map(|rd| rd.filter_map(Result::ok).count())
                .unwrap_or(0);
            (
                doc,
                format!(
                    "language={language} in_schema={has_in_schema} out_schema={has_out_schema} env={has_env} types={type_count}"
                ),
            )
        }
        _ => (doc, "error: unknown script subcommand".to_string()),
    }
}

fn cmd_view(mut doc: SessionDocument, argv: &[String]) -> (SessionDocument, String) {
    if argv.len() < 2 {
        return (doc, "error: view requires at least one path".to_string());
    }
    let paths = argv[1..].to_vec();
    let node = LayoutNode::Document {
        document_paths: paths,
    };
    let layout = doc.layout.get_or_insert_with(Default::default);
    layout.panels.insert("left".to_string(), node);
    match layout.validate() {
        Ok(()) => (doc, "left panel updated".to_string()),
        Err(e) => (doc, format!("error: {e}")),
    }
}

/// Pure-ish dispatch: everything but `script create/run` (which publish to
/// the broker) and `ls`/`load` (which read presets/filesystem) could run
/// without I/O; all are folded into one async entry point for simplicity.
pub async fn dispatch(
    ctx: &TerminalContext,
    doc: SessionDocument,
    argv: &[String],
) -> (SessionDocument, String) {
    match argv.first().map(String::as_str) {
        None => (doc, String::new()),
        Some("help") => (doc, help_text(argv.get(1).map(String::as_str))),
        Some("echo") => (doc, argv[1..].join(" ")),
        Some("env") => cmd_env(doc, argv),
        Some("ls") => {
            let output = cmd_ls(ctx, argv).await;
            (doc, output)
        }
        Some("load") => cmd_load(ctx, doc, argv).await,
        Some("script") => cmd_script(ctx, doc, argv).await,
        Some("view") => cmd_view(doc, argv),
        Some(_) => (doc, "error: unknown command".to_string()),
    }
}

/// Durable, explicit-ack consumer loop: decode, dispatch, persist
/// best-effort, publish the freeze event, then ack on publish success or
/// nak (redeliver) on publish failure.
pub async fn run(ctx: Arc<TerminalContext>, cancel: CancellationToken) {
    let consumer = match ctx
        .broker
        .durable_consumer(bus::STREAM_TERMINAL, TERMINAL_DURABLE, bus::TERMINAL_COMMAND)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "terminal interpreter could not create its consumer");
            return;
        }
    };
    let mut messages = match consumer.messages().await {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "terminal interpreter consumer failed to start delivery");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = messages.next() => {
                let Some(message) = next else { break };
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(error = %e, "terminal consumer message error");
                        continue;
                    }
                };
                let command: TerminalCommand = match serde_json::from_slice(&message.payload) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed terminal command");
                        let _ = message.ack().await;
                        continue;
                    }
                };
                if command.validate().is_err() {
                    let _ = message.ack().await;
                    continue;
                }

                let argv = tokenize(&command.cmd);
                let mut output = String::new();
                loop {
                    let (doc, revision) = match ctx.store.get(&command.session_id).await {
                        Ok(Some((doc, rev))) => (doc, Some(rev)),
                        Ok(None) => (SessionDocument::default(), None),
                        Err(e) => {
                            tracing::warn!(error = %e, session_id = %command.session_id, "failed to load session for terminal command");
                            break;
                        }
                    };
                    let (new_doc, cmd_output) = dispatch(&ctx, doc, &argv).await;
                    output = cmd_output;
                    match ctx.store.put(&command.session_id, &new_doc, revision).await {
                        Ok(_) => break,
                        Err(SwitchboardError::Conflict(_)) => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, session_id = %command.session_id, "failed to persist session after terminal command");
                            break;
                        }
                    }
                }

                let freeze = serde_json::json!({
                    "session_id": command.session_id,
                    "cmd": command.cmd,
                    "output": output,
                    "frozen_at": Utc::now().to_rfc3339(),
                });
                let subject = event_terminal_freeze(&command.session_id);
                match ctx.broker.publish_event(&subject, &freeze).await {
                    Ok(()) => { let _ = message.ack().await; }
                    Err(e) => {
                        tracing::warn!(error = %e, subject, "failed to publish terminal freeze, leaving for redelivery");
                        let _ = message.ack_with(async_nats::jetstream::AckKind::Nak(None)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_whitespace() {
        assert_eq!(tokenize("echo hello world"), vec!["echo", "hello", "world"]);
    }

    #[test]
    fn tokenize_respects_double_quotes() {
        assert_eq!(
            tokenize(r#"echo "hello world""#),
            vec!["echo", "hello world"]
        );
    }

    #[test]
    fn tokenize_respects_single_quotes_and_mixed() {
        assert_eq!(
            tokenize(r#"script run foo --input '{"x": 1}'"#),
            vec!["script", "run", "foo", "--input", r#"{"x": 1}"#]
        );
    }

    #[test]
    fn env_set_is_idempotent() {
        let doc = SessionDocument::default();
        let (doc1, _) = cmd_env(doc, &["env".into(), "set".into(), "K=V".into()]);
        let (doc2, _) = cmd_env(doc1.clone(), &["env".into(), "set".into(), "K=V".into()]);
        assert_eq!(doc1.env, doc2.env);
    }

    #[test]
    fn env_list_sorted() {
        let mut doc = SessionDocument::default();
        doc.env.insert("B".into(), "2".into());
        doc.env.insert("A".into(), "1".into());
        let (_, output) = cmd_env(doc, &["env".into(), "list".into()]);
        assert_eq!(output, "A=1\nB=2");
    }

    #[test]
    fn view_sets_left_panel_document_node() {
        let doc = SessionDocument::default();
        let (doc, output) = cmd_view(
            doc,
            &["view".into(), "README.md".into(), "docs/x.md".into()],
        );
        assert_eq!(output, "left panel updated");
        let layout = doc.layout.unwrap();
        match layout.panels.get("left").unwrap() {
            LayoutNode::Document { document_paths } => {
                assert_eq!(document_paths, &vec!["README.md".to_string(), "docs/x.md".to_string()]);
            }
            _ => panic!("expected document node"),
        }
    }

    #[test]
    fn help_text_has_a_topic_and_a_default() {
        assert!(help_text(None).contains("help"));
        assert!(help_text(Some("env")).contains("env set"));
    }
}
