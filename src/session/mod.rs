//! Session Store — the durable `SessionDocument` (env vars + panel layout)
//! behind every browser view, backed by the `sessions` KV bucket with an
//! in-memory double for tests that don't need a broker.

pub mod layout;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::bus::client::BrokerClient;
use crate::error::SwitchboardError;
use layout::PanelLayout;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub layout: Option<PanelLayout>,
}

impl SessionDocument {
    pub fn required_subscriptions(&self, session_id: &str) -> Vec<String> {
        self.layout
            .as_ref()
            .map(|l| l.required_subscriptions(session_id))
            .unwrap_or_default()
    }
}

/// `Get` returns the document paired with its current revision so a later
/// `Put` can compact-and-swap against it; `revision: None` on `put` means
/// "create, must not already exist". A mismatched revision is
/// `SwitchboardError::Conflict`, never silently overwritten.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(
        &self,
        session_id: &str,
    ) -> Result<Option<(SessionDocument, u64)>, SwitchboardError>;
    async fn put(
        &self,
        session_id: &str,
        doc: &SessionDocument,
        revision: Option<u64>,
    ) -> Result<u64, SwitchboardError>;
}

/// Backed by the `sessions` watchable KV bucket; a missing key is a fresh
/// session, not an error.
pub struct JetStreamSessionStore {
    broker: BrokerClient,
}

impl JetStreamSessionStore {
    pub fn new(broker: BrokerClient) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl SessionStore for JetStreamSessionStore {
    async fn get(
        &self,
        session_id: &str,
    ) -> Result<Option<(SessionDocument, u64)>, SwitchboardError> {
        let kv = self
            .broker
            .sessions_kv()
            .await
            .map_err(SwitchboardError::BrokerTransient)?;
        let entry = kv
            .entry(session_id)
            .await
            .map_err(|e| SwitchboardError::BrokerTransient(e.into()))?;
        match entry {
            Some(entry) => {
                let doc = serde_json::from_slice(&entry.value).map_err(|e| {
                    SwitchboardError::Validation(format!("corrupt session document: {e}"))
                })?;
                Ok(Some((doc, entry.revision)))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        session_id: &str,
        doc: &SessionDocument,
        revision: Option<u64>,
    ) -> Result<u64, SwitchboardError> {
        let kv = self
            .broker
            .sessions_kv()
            .await
            .map_err(SwitchboardError::BrokerTransient)?;
        let bytes = serde_json::to_vec(doc)
            .map_err(|e| SwitchboardError::Validation(format!("cannot serialize session: {e}")))?;
        match revision {
            Some(rev) => kv
                .update(session_id, bytes.into(), rev)
                .await
                .map_err(|e| match e.kind() {
                    async_nats::jetstream::kv::UpdateErrorKind::WrongLastRevision => {
                        SwitchboardError::Conflict(format!(
                            "session {session_id} changed since last read"
                        ))
                    }
                    _ => SwitchboardError::BrokerTransient(e.into()),
                }),
            None => kv
                .create(session_id, bytes.into())
                .await
                .map_err(|e| match e.kind() {
                    async_nats::jetstream::kv::CreateErrorKind::AlreadyExists => {
                        SwitchboardError::Conflict(format!("session {session_id} already exists"))
                    }
                    _ => SwitchboardError::BrokerTransient(e.into()),
                }),
        }
    }
}

/// Plain `RwLock<HashMap>` double, for tests and for components (the
/// interpreter, the layout manager) that only need the store in isolation.
#[derive(Default)]
pub struct InMemorySessionStore {
    docs: RwLock<std::collections::HashMap<String, (SessionDocument, u64)>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(
        &self,
        session_id: &str,
    ) -> Result<Option<(SessionDocument, u64)>, SwitchboardError> {
        Ok(self.docs.read().await.get(session_id).cloned())
    }

    async fn put(
        &self,
        session_id: &str,
        doc: &SessionDocument,
        revision: Option<u64>,
    ) -> Result<u64, SwitchboardError> {
        let mut docs = self.docs.write().await;
        match (docs.get(session_id), revision) {
            (Some((_, current)), Some(rev)) if *current != rev => {
                Err(SwitchboardError::Conflict(format!(
                    "session {session_id} changed since last read"
                )))
            }
            (Some(_), None) => Err(SwitchboardError::Conflict(format!(
                "session {session_id} already exists"
            ))),
            (None, Some(_)) => Err(SwitchboardError::Conflict(format!(
                "session {session_id} no longer exists"
            ))),
            _ => {
                let new_rev = docs.get(session_id).map(|(_, r)| r + 1).unwrap_or(1);
                docs.insert(session_id.to_string(), (doc.clone(), new_rev));
                Ok(new_rev)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::layout::{LayoutNode, PanelLayout};
    use super::*;

    #[tokio::test]
    async fn missing_session_is_none_not_error() {
        let store = InMemorySessionStore::new();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemorySessionStore::new();
        let mut panels = BTreeMap::new();
        panels.insert(
            "main".to_string(),
            LayoutNode::Component {
                component: "terminal".into(),
            },
        );
        let doc = SessionDocument {
            env: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
            layout: Some(PanelLayout { panels }),
        };
        let rev = store.put("s1", &doc, None).await.unwrap();
        let (fetched, fetched_rev) = store.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched_rev, rev);
        assert_eq!(fetched.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(
            fetched.required_subscriptions("s1"),
            vec!["event.terminal.session.s1.freeze".to_string()]
        );
    }

    #[tokio::test]
    async fn put_rejects_stale_revision() {
        let store = InMemorySessionStore::new();
        let doc = SessionDocument::default();
        let rev = store.put("s1", &doc, None).await.unwrap();
        assert!(store.put("s1", &doc, Some(rev)).await.is_ok());
        assert!(matches!(
            store.put("s1", &doc, Some(rev)).await,
            Err(SwitchboardError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn put_rejects_create_over_existing() {
        let store = InMemorySessionStore::new();
        let doc = SessionDocument::default();
        store.put("s1", &doc, None).await.unwrap();
        assert!(matches!(
            store.put("s1", &doc, None).await,
            Err(SwitchboardError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn document_with_no_layout_has_no_subscriptions() {
        let doc = SessionDocument::default();
        assert!(doc.required_subscriptions("s1").is_empty());
    }
}
