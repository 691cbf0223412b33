//! Progress Notifications
//!
//! Optional Telegram pings for long unattended runs: start, stop and each
//! completed stage. Delivery failures are logged and swallowed; the loop
//! never stalls on the network.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::NotifyConfig;

pub struct Notifier {
    client: Option<reqwest::blocking::Client>,
    token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(config: &NotifyConfig) -> Self {
        let configured =
            config.enabled && !config.telegram_token.is_empty() && !config.telegram_chat_id.is_empty();
        if config.enabled && !configured {
            warn!("notifications enabled but token or chat id missing, disabling");
        }
        let client = if configured {
            match reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
            {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(%err, "notifier client build failed, disabling");
                    None
                }
            }
        } else {
            None
        };
        Self {
            client,
            token: config.telegram_token.clone(),
            chat_id: config.telegram_chat_id.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    fn send(&self, text: &str) {
        let Some(client) = &self.client else {
            return;
        };
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let result = client
            .post(&url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send();
        match result {
            Ok(resp) if resp.status().is_success() => debug!("notification delivered"),
            Ok(resp) => warn!(status = %resp.status(), "notification rejected"),
            Err(err) => warn!(%err, "notification send failed"),
        }
    }

    pub fn started(&self) {
        self.send("screenpilot started");
    }

    pub fn stopped(&self, stages: u64) {
        self.send(&format!("screenpilot stopped after {stages} completed stage(s)"));
    }

    pub fn stage_completed(&self, count: u64, elapsed: Duration) {
        self.send(&format!(
            "stage {count} completed in {:.0}s",
            elapsed.as_secs_f64()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_config_disables_delivery() {
        let disabled = Notifier::new(&NotifyConfig::default());
        assert!(!disabled.is_enabled());

        let half = Notifier::new(&NotifyConfig {
            enabled: true,
            telegram_token: "t".into(),
            telegram_chat_id: String::new(),
        });
        assert!(!half.is_enabled());

        // No client: send paths are no-ops, not panics.
        half.started();
        half.stage_completed(1, Duration::from_secs(30));
        half.stopped(1);
    }
}
