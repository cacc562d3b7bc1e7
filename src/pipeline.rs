use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blob::{self, BlobStore, Snapshot};
use crate::db::{self, AppearanceRow, EpgEntry, ProgramRecord, TalentRow};
use crate::error::PipelineError;
use crate::fetch::{self, Fetch};
use crate::notify::{self, Notify};
use crate::parser::channels::is_bs;
use crate::parser::epg::{self, Broadcast};
use crate::parser::{self, reconcile::is_placeholder};
use crate::settings::Settings;

/// Per-run counters. Produced even when some programs fail.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub first_date: String,
    pub last_date: String,
    pub discovered: usize,
    pub targeted: usize,
    pub success: usize,
    pub failed: usize,
    /// Listed programs on channels outside the target set.
    pub skipped: usize,
    pub rejected: usize,
    pub no_cast: usize,
    pub appearances: usize,
    pub placeholders: usize,
    pub new_talents: usize,
    pub snapshots_ok: usize,
    pub snapshots_failed: usize,
    pub archived: usize,
    pub per_channel: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn terrestrial(&self) -> usize {
        self.per_channel.iter().filter(|(c, _)| !is_bs(c)).map(|(_, n)| n).sum()
    }

    pub fn satellite(&self) -> usize {
        self.per_channel.iter().filter(|(c, _)| is_bs(c)).map(|(_, n)| n).sum()
    }

    pub fn print(&self) {
        println!("EPG programs:   {}", self.discovered);
        println!("Targeted:       {} ({} on other channels)", self.targeted, self.skipped);
        println!("Details:        {} ok, {} failed", self.success, self.failed);
        println!(
            "Performers:     {} appearances, {} without link, {} rejected, {} without cast",
            self.appearances, self.placeholders, self.rejected, self.no_cast
        );
        println!("New talents:    {}", self.new_talents);
        println!("Snapshots:      {} ok, {} failed", self.snapshots_ok, self.snapshots_failed);
        println!("Terrestrial:    {}", self.terrestrial());
        println!("BS:             {}", self.satellite());
        for (code, n) in &self.per_channel {
            println!("  {:<16} {}", code, n);
        }
    }
}

/// Listing dates: yesterday through `today + target_days`.
pub fn target_dates(today: NaiveDate, target_days: i64) -> Vec<NaiveDate> {
    (-1..=target_days)
        .filter_map(|offset| today.checked_add_signed(chrono::Duration::days(offset)))
        .collect()
}

/// Pause between detail requests, uniform in `delay_min_ms..=delay_max_ms`.
pub fn jittered_delay(settings: &Settings) -> Duration {
    let (lo, hi) = (settings.delay_min_ms, settings.delay_max_ms);
    let ms = if lo >= hi { lo } else { rand::thread_rng().gen_range(lo..=hi) };
    Duration::from_millis(ms)
}

/// One batch run over the listing, with every collaborator injected.
pub struct Pipeline<F, N, B> {
    fetcher: F,
    conn: Connection,
    blobs: B,
    notifier: N,
    settings: Settings,
    /// Talents written so far in this run, first-seen name/link kept.
    registry: HashMap<String, TalentRow>,
}

impl<F: Fetch, N: Notify, B: BlobStore> Pipeline<F, N, B> {
    pub fn new(fetcher: F, conn: Connection, blobs: B, notifier: N, settings: Settings) -> Self {
        Pipeline {
            fetcher,
            conn,
            blobs,
            notifier,
            settings,
            registry: HashMap::new(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Fetch every listing page and store the entries. Zero entries is fatal.
    pub async fn discover(&self, dates: &[NaiveDate]) -> Result<Vec<EpgEntry>> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for kind in Broadcast::ALL {
            for &date in dates {
                let url = epg::listing_url(&self.settings.site_origin, kind, date);
                info!("Fetching listing {}", url);
                match self.fetcher.get(&url).await {
                    Ok(resp) if resp.is_success() => {
                        let origin = &self.settings.site_origin;
                        let found = epg::parse_listing(&resp.body, date, origin, &mut seen);
                        debug!("{} new programs from {}", found.len(), url);
                        entries.extend(found);
                    }
                    Ok(resp) => warn!("listing {} answered {}", url, resp.status),
                    Err(e) => warn!("listing {} failed: {:#}", url, e),
                }
            }
        }

        if entries.is_empty() {
            return Err(PipelineError::NoPrograms.into());
        }
        db::upsert(&self.conn, &entries)?;
        info!("Stored {} EPG entries", entries.len());
        Ok(entries)
    }

    pub async fn run(&mut self, today: NaiveDate) -> Result<RunSummary> {
        let dates = target_dates(today, self.settings.target_days);
        let mut summary = RunSummary {
            first_date: dates.first().map(|d| d.to_string()).unwrap_or_default(),
            last_date: dates.last().map(|d| d.to_string()).unwrap_or_default(),
            ..Default::default()
        };

        let entries = self.discover(&dates).await?;
        summary.discovered = entries.len();

        let targets: Vec<&EpgEntry> = entries
            .iter()
            .filter(|e| self.settings.is_target(e.channel_code.as_deref()))
            .collect();
        summary.targeted = targets.len();
        summary.skipped = entries.len() - targets.len();
        for e in &targets {
            if let Some(code) = &e.channel_code {
                *summary.per_channel.entry(code.clone()).or_default() += 1;
            }
        }
        info!("{} of {} programs on target channels", targets.len(), entries.len());

        let pb = ProgressBar::new(targets.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
                .progress_chars("=> "),
        );

        for (i, entry) in targets.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(jittered_delay(&self.settings)).await;
            }
            if let Err(e) = self.process_program(entry, &mut summary).await {
                summary.failed += 1;
                warn!(event_id = %entry.event_id, "detail failed: {:#}", e);
            }
            pb.inc(1);
        }

        pb.finish_and_clear();
        info!(
            "Details: {} ok, {} failed; snapshots {} ok, {} failed",
            summary.success, summary.failed, summary.snapshots_ok, summary.snapshots_failed
        );
        Ok(summary)
    }

    /// Run, rotate old rows on success, and send exactly one notification.
    pub async fn run_and_notify(&mut self, today: NaiveDate) -> Result<RunSummary> {
        let started_at = Local::now().to_rfc3339();
        let dates = target_dates(today, self.settings.target_days);
        let first = dates.first().map(|d| d.to_string()).unwrap_or_default();
        let last = dates.last().map(|d| d.to_string()).unwrap_or_default();

        match self.run(today).await {
            Ok(mut summary) => {
                match self.rotate(today) {
                    Ok(n) => summary.archived = n,
                    Err(e) => warn!("rotation failed: {:#}", e),
                }
                self.notifier.send(&notify::success_message(&summary)).await;
                let json = serde_json::to_string(&summary)?;
                db::record_run(&self.conn, "run", &started_at, true, Some(&json), None)?;
                Ok(summary)
            }
            Err(e) => {
                self.notifier.send(&notify::failure_message(&e, &first, &last)).await;
                let reason = format!("{:#}", e);
                if let Err(db_err) =
                    db::record_run(&self.conn, "run", &started_at, false, None, Some(&reason))
                {
                    warn!("could not record failed run: {:#}", db_err);
                }
                Err(e)
            }
        }
    }

    /// Archive rows older than `rotation_days`. Returns the number moved.
    pub fn rotate(&self, today: NaiveDate) -> Result<usize> {
        let cutoff = today - chrono::Duration::days(self.settings.rotation_days);
        let moved = db::archive_older_than(&self.conn, &cutoff.format("%Y-%m-%d").to_string())?;
        if moved.epg + moved.programs > 0 {
            info!(
                "Archived {} EPG rows and {} programs before {}",
                moved.epg, moved.programs, cutoff
            );
        }
        Ok(moved.epg + moved.programs)
    }

    async fn process_program(&mut self, entry: &EpgEntry, summary: &mut RunSummary) -> Result<()> {
        let candidates = fetch::detail_candidates(
            &entry.link,
            &entry.event_id,
            &self.settings.site_origin,
            &self.settings.detail_url_patterns,
        );
        let (url, resp) =
            fetch::fetch_first_success(&self.fetcher, &entry.event_id, &candidates).await?;
        debug!("{} via {} ({} chars)", entry.event_id, url, resp.body.len());

        let data = parser::process_detail(
            &resp.body,
            entry,
            self.settings.profile,
            &self.settings.site_origin,
        );
        summary.rejected += data.report.rejected;
        if data.report.outcome.is_empty() {
            summary.no_cast += 1;
            debug!(event_id = %entry.event_id, "no performers found");
        }

        let record = data.record;
        summary.new_talents += self.persist(&record)?;
        summary.appearances += record.performers.len();
        summary.placeholders +=
            record.performers.iter().filter(|t| is_placeholder(&t.identifier)).count();
        summary.success += 1;

        match self.write_snapshot(&record).await {
            Ok(()) => summary.snapshots_ok += 1,
            Err(e) => {
                summary.snapshots_failed += 1;
                warn!(event_id = %record.event_id, "snapshot not written: {:#}", e);
            }
        }
        Ok(())
    }

    /// Talents (insert-missing), then the program row, then its appearances.
    /// Returns how many talents were new to the store.
    fn persist(&mut self, record: &ProgramRecord) -> Result<usize> {
        let mut fresh: Vec<TalentRow> = Vec::new();
        for t in &record.performers {
            if !self.registry.contains_key(&t.identifier)
                && !fresh.iter().any(|r| r.talent_id == t.identifier)
            {
                fresh.push(TalentRow::from(t));
            }
        }
        // registered only once stored, so a failed write is retried next time
        let inserted = db::insert_missing(&self.conn, &fresh)?;
        self.registry.extend(fresh.into_iter().map(|r| (r.talent_id.clone(), r)));

        db::upsert(&self.conn, std::slice::from_ref(record))?;

        let appearances: Vec<AppearanceRow> = record
            .performers
            .iter()
            .map(|t| AppearanceRow {
                program_event_id: record.event_id.clone(),
                talent_id: t.identifier.clone(),
            })
            .collect();
        db::upsert(&self.conn, &appearances)?;
        Ok(inserted)
    }

    async fn write_snapshot(&self, record: &ProgramRecord) -> Result<()> {
        let path = blob::snapshot_path(
            &record.broadcast_date,
            &record.channel_code,
            &record.start_time,
            &record.event_id,
        );
        let created_at = blob::previous_created_at(&self.blobs, &path)
            .unwrap_or_else(|| Local::now().format("%Y-%m-%dT%H:%M:%S").to_string());
        let bytes = Snapshot::from_record(record, created_at).encode()?;
        blob::put_with_retry(
            &self.blobs,
            &path,
            &bytes,
            self.settings.max_upload_retries,
            self.settings.backoff_base_ms,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use crate::fetch::fake::FakeFetcher;
    use crate::notify::fake::RecordingNotifier;

    const ORIGIN: &str = "https://bangumi.org";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 13).unwrap()
    }

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    fn settings() -> Settings {
        Settings {
            target_days: 0,
            delay_min_ms: 0,
            delay_max_ms: 0,
            backoff_base_ms: 1,
            ..Settings::default()
        }
    }

    fn site() -> FakeFetcher {
        FakeFetcher::default()
            .with(
                &epg::listing_url(ORIGIN, Broadcast::Terrestrial, today()),
                200,
                &fixture("epg_td"),
            )
            .with(
                "https://bangumi.org/tv_events/AkZgQAVzwAM?overwrite_area=42",
                200,
                &fixture("detail_addition"),
            )
            .with("https://bangumi.org/tv_events/AkZgQAVzwBB", 200, &fixture("detail_panel"))
    }

    fn pipeline(
        fetcher: FakeFetcher,
        dir: &tempfile::TempDir,
    ) -> Pipeline<FakeFetcher, RecordingNotifier, FsBlobStore> {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        Pipeline::new(
            fetcher,
            conn,
            FsBlobStore::new(dir.path()),
            RecordingNotifier::default(),
            settings(),
        )
    }

    fn count(conn: &Connection, table: &str) -> usize {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0)).unwrap()
    }

    const SNAPSHOT: &str = "2025-07-13/NHKG-TKY/2025-07-13-0900_NHKG-TKY_AkZgQAVzwAM.json";

    #[test]
    fn dates_span_yesterday_to_target() {
        let dates = target_dates(today(), 2);
        assert_eq!(dates.len(), 4);
        assert_eq!(dates[0].to_string(), "2025-07-12");
        assert_eq!(dates[3].to_string(), "2025-07-15");
    }

    #[tokio::test]
    async fn full_run_counts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(site(), &dir);
        let s = p.run(today()).await.unwrap();

        assert_eq!(s.discovered, 4);
        assert_eq!(s.targeted, 3);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.success, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.snapshots_ok, 2);
        assert_eq!(s.placeholders, 1);
        assert_eq!(s.per_channel.get("NHKG-TKY"), Some(&2));
        assert_eq!(s.terrestrial(), 3);
        assert_eq!(s.satellite(), 0);

        let conn = p.connection();
        assert_eq!(count(conn, "programs_epg"), 4);
        assert_eq!(count(conn, "programs"), 2);
        assert_eq!(count(conn, "talents"), 8);
        assert_eq!(count(conn, "program_talent_appearances"), 8);

        let bytes = p.blobs.get(SNAPSHOT).unwrap().unwrap();
        let snap: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(snap["performer_count"], 6);
        assert_eq!(snap["performers"].as_array().unwrap().len(), 6);
        assert_eq!(snap["performers"][5]["name"], "森山裕");
        assert!(snap["performers"][5]["link"].is_null());
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(site(), &dir);
        p.run(today()).await.unwrap();
        let first = p.blobs.get(SNAPSHOT).unwrap().unwrap();

        let s = p.run(today()).await.unwrap();
        assert_eq!(s.new_talents, 0);
        let second = p.blobs.get(SNAPSHOT).unwrap().unwrap();
        assert_eq!(first, second);

        let conn = p.connection();
        assert_eq!(count(conn, "programs"), 2);
        assert_eq!(count(conn, "talents"), 8);
        assert_eq!(count(conn, "program_talent_appearances"), 8);
    }

    #[tokio::test]
    async fn failed_talent_write_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(site(), &dir);
        p.conn.execute_batch("DROP TABLE talents").unwrap();

        let s = p.run(today()).await.unwrap();
        assert_eq!(s.success, 0);
        assert_eq!(s.failed, 3);

        db::init_schema(&p.conn).unwrap();
        let s = p.run(today()).await.unwrap();
        assert_eq!(s.success, 2);
        assert_eq!(s.new_talents, 8);
        assert_eq!(count(p.connection(), "talents"), 8);
        assert_eq!(count(p.connection(), "program_talent_appearances"), 8);
    }

    #[tokio::test]
    async fn falls_back_to_url_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(site(), &dir);
        p.run(today()).await.unwrap();
        let requested = p.fetcher.requested();
        // listing link for AkZgQAVzwBB 404s, the direct pattern answers
        let listed = "https://bangumi.org/tv_events/AkZgQAVzwBB?overwrite_area=42";
        assert!(requested.contains(&listed.to_string()));
        assert!(requested.contains(&"https://bangumi.org/tv_events/AkZgQAVzwBB".to_string()));
    }

    #[tokio::test]
    async fn no_programs_is_fatal_and_notified_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(FakeFetcher::default(), &dir);
        let err = p.run_and_notify(today()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::NoPrograms)));

        let sent = p.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("❌"));
        let ok: bool = p.connection().query_row("SELECT ok FROM runs", [], |r| r.get(0)).unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn success_notified_once_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(site(), &dir);
        p.run_and_notify(today()).await.unwrap();

        let sent = p.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("✅"));
        assert_eq!(count(p.connection(), "runs"), 1);
    }

    #[tokio::test]
    async fn fixed_profile_keeps_only_linked_cast() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(site(), &dir);
        p.settings.profile = parser::Profile::Fixed;
        let s = p.run(today()).await.unwrap();
        assert_eq!(s.placeholders, 0);
        assert_eq!(count(p.connection(), "talents"), 7);
    }
}
