use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{session_id_from_headers, AppState, SESSION_COOKIE};
use crate::bus::messages::{
    LayoutPatchCommand, PanelSetCommand, PresetApplyCommand, PresetApplyMode, ScriptCreateCommand,
    ScriptRunCommand, TerminalCommand,
};
use crate::bus::{self};
use crate::error::{Result, SwitchboardError};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ui", get(stream_ui))
        .route("/command/{message_type}", post(post_command))
        .route("/terminal", post(post_terminal))
        .route("/session/load/{preset}", post(post_load_preset))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn set_cookie_header(session_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly")) {
        headers.insert(axum::http::header::SET_COOKIE, value);
    }
    headers
}

async fn stream_ui(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (session_id, is_new) = match session_id_from_headers(&headers) {
        Some(sid) => (sid, false),
        None => (ulid::Ulid::new().to_string(), true),
    };

    let cancel = CancellationToken::new();
    let stream = match state.sse.clone().open(session_id.clone(), cancel).await {
        Ok(stream) => stream,
        Err(e @ SwitchboardError::NotFound(_)) => {
            tracing::info!(error = %e, session_id, "SSE connection rejected, no subscriptions");
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, session_id, "SSE connection aborted before start");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let sse = Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default());
    if is_new {
        (set_cookie_header(&session_id), sse).into_response()
    } else {
        sse.into_response()
    }
}

#[derive(serde::Deserialize)]
struct CommandEnvelope {
    #[serde(flatten)]
    fields: Value,
}

async fn post_command(
    State(state): State<AppState>,
    Path(message_type): Path<String>,
    headers: HeaderMap,
    Json(envelope): Json<CommandEnvelope>,
) -> Result<StatusCode> {
    let session_id = session_id_from_headers(&headers)
        .ok_or_else(|| SwitchboardError::Validation("missing session cookie".into()))?;
    let mut fields = envelope.fields;
    if let Value::Object(map) = &mut fields {
        map.insert("session_id".to_string(), Value::String(session_id));
    }

    match message_type.as_str() {
        "PanelSetCommand" => {
            let command: PanelSetCommand = serde_json::from_value(fields)
                .map_err(|e| SwitchboardError::Validation(e.to_string()))?;
            command.validate()?;
            state
                .broker
                .publish_command(bus::COMMAND_LAYOUT_PANEL_SET, &command)
                .await
                .map_err(SwitchboardError::BrokerTransient)?;
        }
        "PresetApplyCommand" => {
            let command: PresetApplyCommand = serde_json::from_value(fields)
                .map_err(|e| SwitchboardError::Validation(e.to_string()))?;
            command.validate()?;
            state
                .broker
                .publish_command(bus::COMMAND_LAYOUT_PRESET_APPLY, &command)
                .await
                .map_err(SwitchboardError::BrokerTransient)?;
        }
        "LayoutPatchCommand" => {
            let command: LayoutPatchCommand = serde_json::from_value(fields)
                .map_err(|e| SwitchboardError::Validation(e.to_string()))?;
            command.validate()?;
            state
                .broker
                .publish_command(bus::COMMAND_LAYOUT_PATCH, &command)
                .await
                .map_err(SwitchboardError::BrokerTransient)?;
        }
        "ScriptCreateCommand" => {
            let command: ScriptCreateCommand = serde_json::from_value(fields)
                .map_err(|e| SwitchboardError::Validation(e.to_string()))?;
            command.validate()?;
            state
                .broker
                .publish_command(bus::COMMAND_SCRIPT_CREATE, &command)
                .await
                .map_err(SwitchboardError::BrokerTransient)?;
        }
        "ScriptRunCommand" => {
            let command: ScriptRunCommand = serde_json::from_value(fields)
                .map_err(|e| SwitchboardError::Validation(e.to_string()))?;
            command.validate()?;
            state
                .broker
                .publish_command(bus::COMMAND_SCRIPT_RUN, &command)
                .await
                .map_err(SwitchboardError::BrokerTransient)?;
        }
        other => {
            return Err(SwitchboardError::Validation(format!(
                "unknown message type '{other}'"
            )))
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize)]
struct TerminalBody {
    cmd: String,
}

async fn post_terminal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TerminalBody>,
) -> Result<StatusCode> {
    let session_id = session_id_from_headers(&headers)
        .ok_or_else(|| SwitchboardError::Validation("missing session cookie".into()))?;
    let command = TerminalCommand {
        session_id,
        cmd: body.cmd,
    };
    command.validate()?;
    state
        .broker
        .publish_command(bus::TERMINAL_COMMAND, &command)
        .await
        .map_err(SwitchboardError::BrokerTransient)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_load_preset(
    State(state): State<AppState>,
    Path(preset): Path<String>,
    Query(args): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let session_id = session_id_from_headers(&headers)
        .ok_or_else(|| SwitchboardError::Validation("missing session cookie".into()))?;
    let command = PresetApplyCommand {
        session_id,
        preset_id: preset,
        args,
        panel: None,
        mode: PresetApplyMode::Merge,
    };
    command.validate()?;
    state
        .broker
        .publish_command(bus::COMMAND_LAYOUT_PRESET_APPLY, &command)
        .await
        .map_err(SwitchboardError::BrokerTransient)?;
    Ok(StatusCode::NO_CONTENT)
}
