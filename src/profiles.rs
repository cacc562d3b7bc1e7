use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::db;
use crate::fetch::Fetch;
use crate::notify::Notify;
use crate::parser::profile::parse_profile;
use crate::settings::Settings;

#[derive(Debug, Default, Serialize)]
pub struct ProfileSummary {
    pub attempted: usize,
    pub success: usize,
    pub failed: usize,
    pub mean_completeness: f64,
}

impl ProfileSummary {
    fn message(&self, offset: usize) -> String {
        format!(
            "👤 タレントプロフィール取得\n\n**対象**: {}件 (offset {})\n**成功**: {}件 / **失敗**: {}件\n**平均充足率**: {:.0}%",
            self.attempted,
            offset,
            self.success,
            self.failed,
            self.mean_completeness * 100.0
        )
    }
}

/// Fetch and store profiles for linked talents that have none yet.
/// Sends one notification at the end.
pub async fn scrape_profiles<F: Fetch, N: Notify>(
    fetcher: &F,
    conn: &Connection,
    notifier: &N,
    settings: &Settings,
    limit: usize,
    offset: usize,
) -> Result<ProfileSummary> {
    let pending = db::talents_without_profile(conn, limit, offset)?;
    info!("{} talents without a profile (limit {}, offset {})", pending.len(), limit, offset);

    let mut summary = ProfileSummary { attempted: pending.len(), ..Default::default() };
    let mut total_completeness = 0.0;

    let pb = ProgressBar::new(pending.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    for (i, talent) in pending.iter().enumerate() {
        let Some(url) = talent.link.as_deref() else {
            pb.inc(1);
            continue;
        };
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(settings.profile_delay_ms)).await;
        }

        match fetcher.get(url).await {
            Ok(resp) if resp.is_success() => {
                let mut profile = parse_profile(&resp.body, &talent.talent_id, url);
                profile.scraped_at = Local::now().to_rfc3339();
                match db::upsert(conn, std::slice::from_ref(&profile)) {
                    Ok(_) => {
                        summary.success += 1;
                        total_completeness += profile.completeness;
                    }
                    Err(e) => {
                        summary.failed += 1;
                        warn!(talent_id = %talent.talent_id, "storing profile failed: {:#}", e);
                    }
                }
            }
            Ok(resp) => {
                summary.failed += 1;
                warn!(talent_id = %talent.talent_id, "{} answered {}", url, resp.status);
            }
            Err(e) => {
                summary.failed += 1;
                warn!(talent_id = %talent.talent_id, "{} failed: {:#}", url, e);
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    if summary.success > 0 {
        summary.mean_completeness = total_completeness / summary.success as f64;
    }
    notifier.send(&summary.message(offset)).await;
    Ok(summary)
}
