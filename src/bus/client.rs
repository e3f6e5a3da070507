//! Thin wrapper over the embedded JetStream-style broker: stream/consumer
//! bootstrap, typed publish helpers, and the `sessions`/`layouts` KV
//! buckets. The broker itself is a collaborator (see SPEC_FULL §1); this
//! module only shapes how the five core components talk to it.

use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::AckPolicy, consumer::DeliverPolicy, kv, stream};
use bytes::Bytes;
use serde::Serialize;

use super::{STREAM_COMMAND, STREAM_EVENT, STREAM_TERMINAL};

pub const SESSIONS_BUCKET: &str = "sessions";
pub const LAYOUTS_BUCKET: &str = "layouts";
const SESSIONS_HISTORY: i64 = 5;

#[derive(Clone)]
pub struct BrokerClient {
    pub js: jetstream::Context,
}

impl BrokerClient {
    pub async fn connect(url: &str, store_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(store_dir)
            .with_context(|| format!("failed to create store dir {}", store_dir.display()))?;
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("failed to connect to broker at {url}"))?;
        let js = jetstream::new(client);
        Ok(Self { js })
    }

    /// Idempotently create the three file-backed streams this platform
    /// relies on. Safe to call on every startup.
    pub async fn ensure_streams(&self) -> Result<()> {
        self.js
            .get_or_create_stream(stream::Config {
                name: STREAM_COMMAND.to_string(),
                subjects: vec!["command.>".to_string()],
                retention: stream::RetentionPolicy::WorkQueue,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .context("failed to ensure COMMAND stream")?;

        self.js
            .get_or_create_stream(stream::Config {
                name: STREAM_EVENT.to_string(),
                subjects: vec!["event.>".to_string()],
                retention: stream::RetentionPolicy::Limits,
                storage: stream::StorageType::File,
                max_age: Duration::from_secs(7 * 24 * 3600),
                ..Default::default()
            })
            .await
            .context("failed to ensure EVENT stream")?;

        self.js
            .get_or_create_stream(stream::Config {
                name: STREAM_TERMINAL.to_string(),
                subjects: vec!["terminal.command".to_string()],
                retention: stream::RetentionPolicy::WorkQueue,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .context("failed to ensure TERMINAL stream")?;

        self.js
            .create_key_value(kv::Config {
                bucket: SESSIONS_BUCKET.to_string(),
                history: SESSIONS_HISTORY as i64,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .context("failed to ensure sessions KV bucket")?;

        self.js
            .create_key_value(kv::Config {
                bucket: LAYOUTS_BUCKET.to_string(),
                history: 1,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .context("failed to ensure layouts KV bucket")?;

        Ok(())
    }

    pub async fn sessions_kv(&self) -> Result<kv::Store> {
        self.js
            .get_key_value(SESSIONS_BUCKET)
            .await
            .context("sessions KV bucket missing — ensure_streams not called?")
    }

    pub async fn layouts_kv(&self) -> Result<kv::Store> {
        self.js
            .get_key_value(LAYOUTS_BUCKET)
            .await
            .context("layouts KV bucket missing — ensure_streams not called?")
    }

    pub async fn publish_command<T: Serialize>(&self, subject: &str, payload: &T) -> Result<()> {
        let bytes = serde_json::to_vec(payload).context("serialize command payload")?;
        self.js
            .publish(subject.to_string(), Bytes::from(bytes))
            .await
            .context("publish to COMMAND stream")?
            .await
            .context("await COMMAND publish ack")?;
        Ok(())
    }

    pub async fn publish_event<T: Serialize>(&self, subject: &str, payload: &T) -> Result<()> {
        let bytes = serde_json::to_vec(payload).context("serialize event payload")?;
        self.js
            .publish(subject.to_string(), Bytes::from(bytes))
            .await
            .context("publish to EVENT stream")?
            .await
            .context("await EVENT publish ack")?;
        Ok(())
    }

    /// Get-or-create a durable, explicit-ack consumer filtered to a single
    /// subject, redelivering on nack or ack-wait timeout.
    pub async fn durable_consumer(
        &self,
        stream_name: &str,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<jetstream::consumer::Consumer<jetstream::consumer::pull::Config>> {
        let stream = self
            .js
            .get_stream(stream_name)
            .await
            .with_context(|| format!("stream {stream_name} missing"))?;
        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: filter_subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(30),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("failed to create durable consumer {durable_name}"))?;
        Ok(consumer)
    }

    /// Create a fresh ephemeral, no-ack consumer on EVENT replaying full
    /// history plus the live tail, filtered to the given subjects. Callers
    /// own the swap protocol (cancel old, await done, create new).
    pub async fn ephemeral_consumer(
        &self,
        filter_subjects: Vec<String>,
    ) -> Result<jetstream::consumer::Consumer<jetstream::consumer::pull::Config>> {
        let stream = self
            .js
            .get_stream(STREAM_EVENT)
            .await
            .context("EVENT stream missing")?;
        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                ack_policy: AckPolicy::None,
                deliver_policy: DeliverPolicy::All,
                filter_subjects,
                ..Default::default()
            })
            .await
            .context("failed to create ephemeral consumer")?;
        Ok(consumer)
    }
}
