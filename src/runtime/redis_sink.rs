use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::json;
use tracing::warn;

use crate::runtime::changes::ChangeSet;
use crate::runtime::job::JobId;
use crate::runtime::ports::{EventKind, NotificationSink};

/// Publishes job events as JSON on a Redis pub/sub channel, so external
/// dashboards and event buses can follow graph changes without touching
/// the engine.
pub struct RedisNotificationSink {
    client: redis::Client,
    channel: String,
}

impl RedisNotificationSink {
    pub fn new(client: redis::Client, channel: String) -> Self {
        Self { client, channel }
    }

    async fn try_publish(
        &self,
        job: JobId,
        event: EventKind,
        changes: &ChangeSet,
    ) -> redis::RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = json!({
            "job": job,
            "event": event,
            "added": changes.added,
            "updated": changes.updated,
            "skipped": changes.skipped,
        });
        let _: () = conn.publish(&self.channel, payload.to_string()).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for RedisNotificationSink {
    async fn publish(&self, job: JobId, event: EventKind, changes: &ChangeSet) {
        // fire-and-forget: a sink failure never fails the engine
        if let Err(e) = self.try_publish(job, event, changes).await {
            warn!(job = %job, error = %e, "failed to publish notification");
        }
    }
}
