use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::pipeline::RunSummary;

/// Webhook content limit is 2000 chars; leave room for the ellipsis.
const MAX_MESSAGE_CHARS: usize = 1900;

/// End-of-run message delivery. Never fails the caller.
pub trait Notify: Send + Sync {
    fn send(&self, message: &str) -> impl Future<Output = ()> + Send;
}

/// Discord-style webhook: POST `{"content": message}`.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        WebhookNotifier {
            client,
            url: url.filter(|u| !u.trim().is_empty()),
        }
    }
}

impl Notify for WebhookNotifier {
    async fn send(&self, message: &str) {
        let Some(url) = &self.url else {
            warn!("webhook URL not set, skipping notification");
            return;
        };
        let body = serde_json::json!({ "content": clip(message, MAX_MESSAGE_CHARS) });
        match self.client.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => info!("notification sent"),
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                warn!("webhook answered {}: {}", status, clip(&text, 200));
            }
            Err(e) => warn!("webhook delivery failed: {}", e),
        }
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    }
}

pub fn success_message(summary: &RunSummary) -> String {
    let mut msg = format!(
        "✅ 番組表の更新が完了しました\n\n\
         **期間**: {} ～ {}\n\
         **番組概要**: {}件\n\
         **番組詳細**: 成功 {}件 / 失敗 {}件 / 対象外 {}件\n\
         **出演者**: {}件 (リンクなし {}件, 除外 {}件, 出演者なし {}番組)\n\
         **JSON**: 保存 {}件 / 失敗 {}件\n\
         **地上波**: {}件 / **BS**: {}件",
        summary.first_date,
        summary.last_date,
        summary.discovered,
        summary.success,
        summary.failed,
        summary.skipped,
        summary.appearances,
        summary.placeholders,
        summary.rejected,
        summary.no_cast,
        summary.snapshots_ok,
        summary.snapshots_failed,
        summary.terrestrial(),
        summary.satellite(),
    );
    if summary.archived > 0 {
        msg.push_str(&format!("\n**アーカイブ**: {}件", summary.archived));
    }
    msg
}

pub fn failure_message(error: &anyhow::Error, first_date: &str, last_date: &str) -> String {
    format!(
        "❌ 番組表の更新に失敗しました\n\n**期間**: {} ～ {}\n**エラー**: {:#}",
        first_date, last_date, error
    )
}
