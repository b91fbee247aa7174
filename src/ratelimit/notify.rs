use serde_json::json;

use crate::actor::{Actor, Feature};

/// Fire-and-forget notification when an actor first exhausts a limit in a
/// window. Must not block.
pub trait RateLimitNotifier: Send + Sync {
    fn notify(&self, actor: &Actor, feature: Feature, used: u64, limit: u64);
}

pub struct NoopNotifier;

impl RateLimitNotifier for NoopNotifier {
    fn notify(&self, _actor: &Actor, _feature: Feature, _used: u64, _limit: u64) {}
}

/// Posts a `{"text": ...}` message to a chat-style webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    fn message(actor: &Actor, feature: Feature, used: u64, limit: u64) -> String {
        format!(
            "actor {} ({}) hit the {} rate limit: {}/{} requests used",
            actor.id, actor.source, feature, used, limit
        )
    }
}

impl RateLimitNotifier for WebhookNotifier {
    fn notify(&self, actor: &Actor, feature: Feature, used: u64, limit: u64) {
        let body = json!({ "text": Self::message(actor, feature, used, limit) });
        let request = self.client.post(&self.url).json(&body);
        let actor_id = actor.id.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!(actor = %actor_id, status = resp.status().as_u16(), "rate limit webhook rejected notification");
                }
                Err(e) => {
                    tracing::warn!(actor = %actor_id, error = %e, "failed to send rate limit notification");
                }
            }
        });
    }
}
