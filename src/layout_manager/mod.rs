//! Layout Manager — the durable consumer on `command.layout.>` that applies
//! panel-set, preset-apply, and patch commands to a session's layout.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::messages::{LayoutPatchCommand, PanelSetCommand, PatchType, PresetApplyCommand, PresetApplyMode};
use crate::bus::{self, matches as subject_matches};
use crate::error::SwitchboardError;
use crate::presets::PresetRegistry;
use crate::session::layout::PanelLayout;
use crate::session::{SessionDocument, SessionStore};

const LAYOUT_DURABLE: &str = "layout-manager";
const LAYOUT_FILTER: &str = "command.layout.>";

pub struct LayoutManagerContext {
    pub store: Arc<dyn SessionStore>,
    pub presets: Arc<PresetRegistry>,
}

async fn load_doc(
    ctx: &LayoutManagerContext,
    session_id: &str,
) -> (SessionDocument, Option<u64>) {
    match ctx.store.get(session_id).await {
        Ok(Some((doc, rev))) => (doc, Some(rev)),
        Ok(None) | Err(_) => (SessionDocument::default(), None),
    }
}

async fn handle_panel_set(
    ctx: &LayoutManagerContext,
    command: PanelSetCommand,
) -> Result<(), SwitchboardError> {
    command.validate()?;
    loop {
        let (mut doc, revision) = load_doc(ctx, &command.session_id).await;
        let layout = doc.layout.get_or_insert_with(PanelLayout::default);
        layout.panels.insert(command.panel.clone(), command.node.clone());
        layout.validate()?;
        match ctx.store.put(&command.session_id, &doc, revision).await {
            Ok(_) => return Ok(()),
            Err(SwitchboardError::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn handle_preset_apply(
    ctx: &LayoutManagerContext,
    command: PresetApplyCommand,
) -> Result<(), SwitchboardError> {
    command.validate()?;
    let preset = ctx.presets.get(&command.preset_id).await?;
    let built = preset.build(&command.args)?;

    loop {
        let (mut doc, revision) = load_doc(ctx, &command.session_id).await;

        match command.mode {
            PresetApplyMode::ReplaceAll => {
                doc.layout = Some(built.clone());
            }
            PresetApplyMode::Merge => {
                let layout = doc.layout.get_or_insert_with(PanelLayout::default);
                for (panel, node) in built.clone().panels {
                    layout.panels.insert(panel, node);
                }
            }
            PresetApplyMode::PanelOnly => {
                let panel = command.panel.clone().ok_or_else(|| {
                    SwitchboardError::Validation("panel-only requires panel".into())
                })?;
                let node = built.panels.get(&panel).cloned().ok_or_else(|| {
                    SwitchboardError::NotFound(format!("preset has no panel '{panel}'"))
                })?;
                let layout = doc.layout.get_or_insert_with(PanelLayout::default);
                layout.panels.insert(panel, node);
            }
        }

        if let Some(layout) = &doc.layout {
            layout.validate()?;
        }
        match ctx.store.put(&command.session_id, &doc, revision).await {
            Ok(_) => return Ok(()),
            Err(SwitchboardError::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn handle_patch(
    ctx: &LayoutManagerContext,
    command: LayoutPatchCommand,
) -> Result<(), SwitchboardError> {
    command.validate()?;
    loop {
        let (mut doc, revision) = load_doc(ctx, &command.session_id).await;

        let current = doc
            .layout
            .as_ref()
            .map(|l| l.to_value())
            .unwrap_or_else(|| serde_json::json!({}));

        let patched = match command.patch_type {
            PatchType::Merge => {
                let mut target = current;
                json_patch::merge(&mut target, &command.patch);
                target
            }
            PatchType::Jsonpatch => {
                let mut target = current;
                let patch: json_patch::Patch = serde_json::from_value(command.patch.clone())
                    .map_err(|e| SwitchboardError::Validation(format!("invalid JSON patch: {e}")))?;
                json_patch::patch(&mut target, &patch).map_err(|e| {
                    SwitchboardError::Validation(format!("patch application failed: {e}"))
                })?;
                target
            }
        };

        let layout: PanelLayout = serde_json::from_value(patched)
            .map_err(|e| SwitchboardError::Validation(format!("patched layout invalid: {e}")))?;
        layout.validate()?;
        doc.layout = Some(layout);
        match ctx.store.put(&command.session_id, &doc, revision).await {
            Ok(_) => return Ok(()),
            Err(SwitchboardError::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Durable, explicit-ack consumer loop. Unknown subjects under
/// `command.layout.>` are acked (terminated) rather than redelivered.
pub async fn run(
    broker: crate::bus::client::BrokerClient,
    ctx: Arc<LayoutManagerContext>,
    cancel: CancellationToken,
) {
    let consumer = match broker
        .durable_consumer(bus::STREAM_COMMAND, LAYOUT_DURABLE, LAYOUT_FILTER)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "layout manager could not create its consumer");
            return;
        }
    };
    let mut messages = match consumer.messages().await {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "layout manager consumer failed to start delivery");
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
                        tracing::warn!(error = %e, "layout manager message error");
                        continue;
                    }
                };
                let subject = message.subject.to_string();

                if subject_matches(bus::COMMAND_LAYOUT_PANEL_SET, &subject) {
                    match serde_json::from_slice::<PanelSetCommand>(&message.payload) {
                        Ok(cmd) => {
                            if let Err(e) = handle_panel_set(&ctx, cmd).await {
                                tracing::info!(error = %e, subject, "panel.set rejected");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, subject, "malformed panel.set payload"),
                    }
                    let _ = message.ack().await;
                } else if subject_matches(bus::COMMAND_LAYOUT_PRESET_APPLY, &subject) {
                    match serde_json::from_slice::<PresetApplyCommand>(&message.payload) {
                        Ok(cmd) => {
                            if let Err(e) = handle_preset_apply(&ctx, cmd).await {
                                tracing::info!(error = %e, subject, "preset.apply rejected");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, subject, "malformed preset.apply payload"),
                    }
                    let _ = message.ack().await;
                } else if subject_matches(bus::COMMAND_LAYOUT_PATCH, &subject) {
                    match serde_json::from_slice::<LayoutPatchCommand>(&message.payload) {
                        Ok(cmd) => {
                            if let Err(e) = handle_patch(&ctx, cmd).await {
                                tracing::info!(error = %e, subject, "layout.patch rejected");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, subject, "malformed layout.patch payload"),
                    }
                    let _ = message.ack().await;
                } else {
                    tracing::warn!(subject, "unknown layout subject, terminating delivery");
                    let _ = message.ack().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::layout::LayoutNode;
    use crate::session::InMemorySessionStore;
    use std::collections::BTreeMap;

    fn test_ctx() -> LayoutManagerContext {
        LayoutManagerContext {
            store: InMemorySessionStore::shared(),
            presets: Arc::new(PresetRegistry::load_builtin().unwrap()),
        }
    }

    #[tokio::test]
    async fn panel_set_rejects_unknown_panel_name() {
        let ctx = test_ctx();
        let command = PanelSetCommand {
            session_id: "s1".into(),
            panel: "center".into(),
            node: LayoutNode::Component { component: "terminal".into() },
        };
        let result = handle_panel_set(&ctx, command).await;
        assert!(result.is_err());
        assert!(ctx.store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn panel_set_persists_valid_node() {
        let ctx = test_ctx();
        let command = PanelSetCommand {
            session_id: "s1".into(),
            panel: "main".into(),
            node: LayoutNode::Component { component: "terminal".into() },
        };
        handle_panel_set(&ctx, command).await.unwrap();
        let (doc, _) = ctx.store.get("s1").await.unwrap().unwrap();
        assert!(doc.layout.unwrap().panels.contains_key("main"));
    }

    #[tokio::test]
    async fn preset_apply_merge_preserves_other_panels() {
        let ctx = test_ctx();
        let mut panels = BTreeMap::new();
        panels.insert("right".to_string(), LayoutNode::Component { component: "notes".into() });
        ctx.store
            .put(
                "s1",
                &SessionDocument {
                    env: Default::default(),
                    layout: Some(PanelLayout { panels }),
                },
                None,
            )
            .await
            .unwrap();

        let command = PresetApplyCommand {
            session_id: "s1".into(),
            preset_id: "default".into(),
            args: BTreeMap::new(),
            panel: None,
            mode: PresetApplyMode::Merge,
        };
        handle_preset_apply(&ctx, command).await.unwrap();
        let (doc, _) = ctx.store.get("s1").await.unwrap().unwrap();
        let layout = doc.layout.unwrap();
        assert!(layout.panels.contains_key("right"));
        assert!(layout.panels.contains_key("main"));
    }

    #[tokio::test]
    async fn merge_patch_updates_layout() {
        let ctx = test_ctx();
        let command = LayoutPatchCommand {
            session_id: "s1".into(),
            patch: serde_json::json!({"main": {"component": "terminal"}}),
            patch_type: PatchType::Merge,
        };
        handle_patch(&ctx, command).await.unwrap();
        let (doc, _) = ctx.store.get("s1").await.unwrap().unwrap();
        assert!(doc.layout.unwrap().panels.contains_key("main"));
    }
}
