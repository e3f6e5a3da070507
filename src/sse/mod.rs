//! SSE Streaming Engine — one scheduler per `/ui` connection: computes the
//! session's required subscriptions, drives an ephemeral consumer through
//! the renderer registry, and watches the session document for changes
//! that require swapping that consumer for a new one.

use std::convert::Infallible;
use std::sync::Arc;

use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::Consumer;
use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::client::BrokerClient;
use crate::error::SwitchboardError;
use crate::presets::{PresetRegistry, DEFAULT_PRESET_ID};
use crate::render::{Fragment, MergeStrategy, Renderer, RendererRegistry};
use crate::session::{SessionDocument, SessionStore};

pub struct SseEngine {
    broker: BrokerClient,
    store: Arc<dyn SessionStore>,
    presets: Arc<PresetRegistry>,
    renderers: Arc<RendererRegistry>,
}

impl SseEngine {
    pub fn new(
        broker: BrokerClient,
        store: Arc<dyn SessionStore>,
        presets: Arc<PresetRegistry>,
        renderers: Arc<RendererRegistry>,
    ) -> Self {
        Self {
            broker,
            store,
            presets,
            renderers,
        }
    }

    /// Creates the default-preset document on first visit. A `Conflict` on
    /// the create means another request just created the same session
    /// first — re-read rather than overwrite it.
    async fn load_or_default(&self, session_id: &str) -> Result<SessionDocument, SwitchboardError> {
        if let Some((doc, _)) = self.store.get(session_id).await? {
            return Ok(doc);
        }
        let preset = self.presets.get(DEFAULT_PRESET_ID).await?;
        let layout = preset.build(&Default::default())?;
        let doc = SessionDocument {
            env: Default::default(),
            layout: Some(layout),
        };
        match self.store.put(session_id, &doc, None).await {
            Ok(_) => Ok(doc),
            Err(SwitchboardError::Conflict(_)) => self
                .store
                .get(session_id)
                .await?
                .map(|(doc, _)| doc)
                .ok_or_else(|| {
                    SwitchboardError::NotFound(format!("session {session_id} vanished right after creation"))
                }),
            Err(e) => Err(e),
        }
    }

    fn panel_fragments(doc: &SessionDocument) -> Vec<Fragment> {
        match &doc.layout {
            Some(layout) if !layout.panels.is_empty() => layout
                .panels
                .keys()
                .map(|panel| {
                    Fragment::replace(
                        format!("#{panel}-panel-content"),
                        format!("<div class=\"panel\" data-panel=\"{panel}\"></div>"),
                    )
                })
                .collect(),
            _ => vec![Fragment::replace(
                "#subscriptions-grid",
                "<div class=\"subscriptions-grid empty\"></div>".to_string(),
            )],
        }
    }

    /// Build the per-connection fragment stream. Returns `NotFound` if the
    /// session's layout yields zero subscriptions (caller maps this to a
    /// 404 without ever opening the SSE response), and `BrokerTransient`
    /// if the first ephemeral consumer can't be created (caller maps this
    /// to a 500, also before opening the response).
    pub async fn open(
        self: Arc<Self>,
        session_id: String,
        conn_cancel: CancellationToken,
    ) -> Result<impl Stream<Item = Result<Event, Infallible>>, SwitchboardError> {
        let doc = self.load_or_default(&session_id).await?;
        if let Some(layout) = &doc.layout {
            layout.validate()?;
        }
        let subs = doc.required_subscriptions(&session_id);
        if subs.is_empty() {
            return Err(SwitchboardError::NotFound(format!(
                "session {session_id} has no subscriptions"
            )));
        }

        let consumer = self
            .broker
            .ephemeral_consumer(subs.clone())
            .await
            .map_err(SwitchboardError::BrokerTransient)?;

        let (tx, mut rx) = mpsc::channel::<Fragment>(256);
        for fragment in Self::panel_fragments(&doc) {
            let _ = tx.send(fragment).await;
        }

        let driver = ConnectionDriver::spawn(
            self.clone(),
            session_id,
            subs,
            consumer,
            tx,
            conn_cancel,
        );

        let stream = async_stream::stream! {
            let _driver = driver;
            while let Some(fragment) = rx.recv().await {
                yield Ok(fragment_to_event(fragment));
            }
        };
        Ok(stream)
    }
}

fn fragment_to_event(fragment: Fragment) -> Event {
    let event_name = match fragment.strategy {
        MergeStrategy::Replace => "replace",
        MergeStrategy::Append => "append",
    };
    let payload = serde_json::json!({ "selector": fragment.selector, "html": fragment.html });
    Event::default().event(event_name).data(payload.to_string())
}

/// Owns the connection's two concurrent actors (ephemeral consumer pump,
/// KV watcher) and enforces the swap protocol between them: cancel the old
/// consumer, await its done-signal, only then create the new one.
struct ConnectionDriver {
    cancel: CancellationToken,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

impl Drop for ConnectionDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ConnectionDriver {
    fn spawn(
        engine: Arc<SseEngine>,
        session_id: String,
        initial_subs: Vec<String>,
        initial_consumer: Consumer<PullConfig>,
        tx: mpsc::Sender<Fragment>,
        conn_cancel: CancellationToken,
    ) -> Self {
        let task = tokio::spawn(Self::run(
            engine,
            session_id,
            initial_subs,
            initial_consumer,
            tx,
            conn_cancel.clone(),
        ));
        Self {
            cancel: conn_cancel,
            task,
        }
    }

    async fn run(
        engine: Arc<SseEngine>,
        session_id: String,
        mut subs: Vec<String>,
        initial_consumer: Consumer<PullConfig>,
        tx: mpsc::Sender<Fragment>,
        cancel: CancellationToken,
    ) {
        let mut renderers = engine.renderers.for_subjects(&subs);
        let mut active = ConsumerPump::spawn(initial_consumer, renderers, tx.clone());

        let mut watch = match engine.broker.sessions_kv().await {
            Ok(kv) => match kv.watch(&session_id).await {
                Ok(w) => w,
                Err(e) => {
                    tracing::error!(error = %e, session_id, "failed to start session watcher");
                    active.cancel_and_wait().await;
                    return;
                }
            },
            Err(e) => {
                tracing::error!(error = %e, session_id, "sessions bucket unavailable for watch");
                active.cancel_and_wait().await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = watch.next() => {
                    // The first item is the KV watcher's replay-complete
                    // sentinel; it carries no useful document and is
                    // skipped like any update that doesn't change `subs`.
                    match next {
                        None => {
                            tracing::warn!(session_id, "session watcher ended");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, session_id, "session watcher error");
                            break;
                        }
                        Some(Ok(entry)) => {
                            if entry.operation == async_nats::jetstream::kv::Operation::Delete
                                || entry.operation == async_nats::jetstream::kv::Operation::Purge
                            {
                                break;
                            }
                            let doc: SessionDocument = match serde_json::from_slice(&entry.value) {
                                Ok(doc) => doc,
                                Err(_) => continue,
                            };
                            let new_subs = doc.required_subscriptions(&session_id);
                            if new_subs == subs {
                                continue;
                            }
                            for fragment in SseEngine::panel_fragments(&doc) {
                                if tx.send(fragment).await.is_err() {
                                    break;
                                }
                            }
                            active.cancel_and_wait().await;
                            renderers = engine.renderers.for_subjects(&new_subs);
                            match engine.broker.ephemeral_consumer(new_subs.clone()).await {
                                Ok(consumer) => {
                                    subs = new_subs;
                                    active = ConsumerPump::spawn(consumer, renderers.clone(), tx.clone());
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, session_id, "failed to recreate ephemeral consumer");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
        active.cancel_and_wait().await;
    }
}

/// One actor: pulls from an ephemeral consumer and renders each message.
/// `cancel_and_wait` is the `(cancel, done)` pair from the swap protocol.
struct ConsumerPump {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerPump {
    fn spawn(
        consumer: Consumer<PullConfig>,
        renderers: Vec<Renderer>,
        tx: mpsc::Sender<Fragment>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::pump(consumer, renderers, tx, cancel.clone()));
        Self { cancel, task }
    }

    async fn pump(
        consumer: Consumer<PullConfig>,
        renderers: Vec<Renderer>,
        tx: mpsc::Sender<Fragment>,
        cancel: CancellationToken,
    ) {
        let mut messages = match consumer.messages().await {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "ephemeral consumer failed to start delivering");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = messages.next() => {
                    match next {
                        None => break,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "ephemeral consumer message error");
                        }
                        Some(Ok(message)) => {
                            let subject = message.subject.to_string();
                            let payload: Value =
                                serde_json::from_slice(&message.payload).unwrap_or(Value::Null);
                            if let Some(fragment) =
                                RendererRegistry::dispatch(&renderers, &subject, &payload)
                            {
                                if tx.send(fragment).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Signal cancellation and wait for the pump to actually stop before
    /// returning — the primitive the swap protocol is built from.
    async fn cancel_and_wait(&mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::layout::{LayoutNode, PanelLayout};
    use std::collections::BTreeMap;

    #[test]
    fn panel_fragments_target_each_panel_content_selector() {
        let mut panels = BTreeMap::new();
        panels.insert(
            "main".to_string(),
            LayoutNode::Component {
                component: "terminal".into(),
            },
        );
        panels.insert(
            "left".to_string(),
            LayoutNode::Document {
                document_paths: vec!["README.md".into()],
            },
        );
        let doc = SessionDocument {
            env: Default::default(),
            layout: Some(PanelLayout { panels }),
        };
        let fragments = SseEngine::panel_fragments(&doc);
        let selectors: Vec<&str> = fragments.iter().map(|f| f.selector.as_str()).collect();
        assert!(selectors.contains(&"#main-panel-content"));
        assert!(selectors.contains(&"#left-panel-content"));
    }

    #[test]
    fn no_layout_falls_back_to_subscriptions_grid() {
        let doc = SessionDocument::default();
        let fragments = SseEngine::panel_fragments(&doc);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].selector, "#subscriptions-grid");
    }

    #[test]
    fn fragment_to_event_uses_strategy_as_event_name() {
        let fragment = Fragment::append("#x", "<p></p>");
        let event = fragment_to_event(fragment);
        // Event's internal fields aren't publicly inspectable beyond Display;
        // constructing it without panicking is the behavior under test here.
        let _ = format!("{event:?}");
    }
}
