use anyhow::{Context, Result};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A single process-wide cron registry, mutex-guarded for entry add/remove,
/// keyed by `namespace/name` - per `spec.md` §5 "Shared resources".
///
/// Firing a trigger sends the entry's key on an unbounded channel; the
/// Pipeline controller drains that channel and re-enqueues the named
/// Pipeline for reconciliation. Missed fires during controller downtime
/// are not replayed (`spec.md` §4.2).
#[derive(Clone)]
pub struct CronScheduler {
    entries: Arc<Mutex<HashMap<String, CronEntry>>>,
    tx: mpsc::UnboundedSender<String>,
}

struct CronEntry {
    cancel: CancellationToken,
}

impl CronScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                entries: Arc::new(Mutex::new(HashMap::new())),
                tx,
            },
            rx,
        )
    }

    /// Registers (replacing any existing entry for the same key) a cron
    /// expression and spawns the ticker task that fires it.
    pub fn register(&self, key: String, expr: &str) -> Result<()> {
        let schedule =
            Schedule::from_str(expr).with_context(|| format!("invalid cron expression {expr:?}"))?;
        self.remove(&key);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let tx = self.tx.clone();
        let task_key = key.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                    break;
                };
                let now = chrono::Utc::now();
                let delay = (next - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(1));
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        if tx.send(task_key.clone()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.entries.lock().unwrap().insert(key, CronEntry { cancel });
        Ok(())
    }

    /// Removes the entry (if any) and stops its ticker task. Idempotent.
    pub fn remove(&self, key: &str) {
        if let Some(entry) = self.entries.lock().unwrap().remove(key) {
            entry.cancel.cancel();
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_expressions() {
        let (scheduler, _rx) = CronScheduler::new();
        assert!(scheduler.register("ns/bad".to_string(), "not a cron").is_err());
        assert!(!scheduler.contains("ns/bad"));
    }

    #[tokio::test]
    async fn accepts_standard_five_field_expression_with_seconds_prefix() {
        let (scheduler, _rx) = CronScheduler::new();
        // The `cron` crate expects a leading seconds field.
        assert!(scheduler.register("ns/every-minute".to_string(), "0 * * * * *").is_ok());
        assert!(scheduler.contains("ns/every-minute"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (scheduler, _rx) = CronScheduler::new();
        scheduler.remove("never-registered");
        scheduler
            .register("ns/x".to_string(), "0 * * * * *")
            .unwrap();
        scheduler.remove("ns/x");
        scheduler.remove("ns/x");
        assert!(!scheduler.contains("ns/x"));
    }
}
