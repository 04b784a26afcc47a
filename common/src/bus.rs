use anyhow::{Context, Result};
use async_nats::Client;
use async_nats::jetstream::{self, consumer::pull::Config as PullConfig, stream::Config as StreamConfig};
use bytes::Bytes;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

/// Shared, lazily-created, auto-reconnecting bus client handle.
///
/// Mirrors `spec.md` §5 "Shared resources": one connection per controller
/// instance, guarded by a mutex during setup only - publishes and
/// subscribes on the established client are thread-safe without further
/// locking.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Mutex<Option<Client>>>,
    url: String,
}

impl Bus {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            url: url.into(),
        }
    }

    async fn client(&self) -> Result<Client> {
        let mut guard = self.inner.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = connect_with_backoff(&self.url).await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Publishes `payload` on `subject`, flushing to surface send errors
    /// immediately rather than letting them hide in the background flush.
    pub async fn publish(&self, subject: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        let client = self.client().await?;
        let subject = subject.into();
        client
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("publish to {subject} failed"))?;
        client.flush().await.context("bus flush failed")?;
        Ok(())
    }

    /// Bounded, single-shot poll for one message on `subject`: subscribe,
    /// wait up to `timeout`, unsubscribe. Per `spec.md` §9 "coroutine-style
    /// polling": this trades latency for simplicity, avoiding a long-lived
    /// task per pipeline step.
    pub async fn poll_once(&self, subject: impl Into<String>, timeout: Duration) -> Result<Option<Bytes>> {
        let client = self.client().await?;
        let subject = subject.into();
        let mut sub = client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("subscribe to {subject} failed"))?;
        let next = tokio::time::timeout(timeout, sub.next()).await;
        let _ = sub.unsubscribe().await;
        match next {
            Ok(Some(msg)) => Ok(Some(msg.payload)),
            Ok(None) | Err(_) => Ok(None),
        }
    }

    fn jetstream(&self, client: Client) -> jetstream::Context {
        jetstream::new(client)
    }

    /// Idempotently ensures a stream exists. Per `spec.md` §4.4 step 4: "if
    /// a stream of the same name exists, leave it alone."
    pub async fn ensure_stream(&self, config: StreamConfig) -> Result<()> {
        let client = self.client().await?;
        let js = self.jetstream(client);
        if js.get_stream(&config.name).await.is_ok() {
            return Ok(());
        }
        js.create_stream(config)
            .await
            .context("create stream failed")?;
        Ok(())
    }

    /// Deletes a durable consumer, tolerating it already being gone. Used
    /// by the Agent finalizer path to avoid orphaned bus consumers
    /// (`spec.md` §3 "Lifecycle & Ownership").
    pub async fn delete_consumer(&self, stream: &str, durable_name: &str) -> Result<()> {
        let client = self.client().await?;
        let js = self.jetstream(client);
        let mut js_stream = match js.get_stream(stream).await {
            Ok(s) => s,
            Err(_) => return Ok(()),
        };
        match js_stream.delete_consumer(durable_name).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("not found") => Ok(()),
            Err(e) => Err(e).context("delete consumer failed"),
        }
    }

    /// Idempotently ensures a durable pull consumer exists on `stream`.
    pub async fn ensure_consumer(
        &self,
        stream: &str,
        durable_name: &str,
        filter_subjects: Vec<String>,
        max_deliver: i64,
    ) -> Result<()> {
        let client = self.client().await?;
        let js = self.jetstream(client);
        let mut js_stream = js
            .get_stream(stream)
            .await
            .with_context(|| format!("stream {stream} does not exist"))?;
        if js_stream
            .get_consumer::<PullConfig>(durable_name)
            .await
            .is_ok()
        {
            return Ok(());
        }
        js_stream
            .create_consumer(PullConfig {
                durable_name: Some(durable_name.to_string()),
                filter_subjects,
                max_deliver,
                ..Default::default()
            })
            .await
            .context("create consumer failed")?;
        Ok(())
    }
}

/// Unlimited reconnects with a fixed 2s delay between attempts, per
/// `spec.md` §5: "retries-on-failed-connect with 2s backoff and unlimited
/// reconnects."
async fn connect_with_backoff(url: &str) -> Result<Client> {
    fn opts() -> async_nats::ConnectOptions {
        async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .reconnect_delay_callback(|_attempts| Duration::from_secs(2))
            .max_reconnects(None)
    }
    loop {
        match opts().connect(url).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("🛑 bus connect to {url} failed: {e}; retrying in 2s").yellow()
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Maps our CRD-facing retention enum onto JetStream's.
pub fn retention_from_policy(policy: &str) -> jetstream::stream::RetentionPolicy {
    match policy {
        "interest" => jetstream::stream::RetentionPolicy::Interest,
        "workqueue" => jetstream::stream::RetentionPolicy::WorkQueue,
        _ => jetstream::stream::RetentionPolicy::Limits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_mapping_covers_all_three() {
        assert_eq!(
            retention_from_policy("limits"),
            jetstream::stream::RetentionPolicy::Limits
        );
        assert_eq!(
            retention_from_policy("interest"),
            jetstream::stream::RetentionPolicy::Interest
        );
        assert_eq!(
            retention_from_policy("workqueue"),
            jetstream::stream::RetentionPolicy::WorkQueue
        );
        assert_eq!(
            retention_from_policy("unknown"),
            jetstream::stream::RetentionPolicy::Limits
        );
    }
}
