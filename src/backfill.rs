use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blob::{self, BlobStore, PerformerEntry, Snapshot};
use crate::db::{self, AppearanceRow, TalentRow};
use crate::fetch::{self, Fetch};
use crate::parser::{self, fallback, reconcile, TalentRef};
use crate::pipeline::jittered_delay;
use crate::settings::Settings;

#[derive(Debug, Default, Serialize)]
pub struct BackfillSummary {
    pub checked: usize,
    /// Snapshots that already listed performers.
    pub already_filled: usize,
    pub updated: usize,
    /// Refetched, but extraction still found nobody.
    pub still_empty: usize,
    pub failed: usize,
}

/// Re-extract the cast for snapshots of `dates` whose `performers` is empty
/// and rewrite them in place.
pub async fn backfill<F: Fetch, B: BlobStore + ?Sized>(
    fetcher: &F,
    conn: &Connection,
    store: &B,
    settings: &Settings,
    dates: &[NaiveDate],
) -> Result<BackfillSummary> {
    let mut summary = BackfillSummary::default();
    let mut fetched_any = false;

    for date in dates {
        let paths = store.list(&date.format("%Y-%m-%d").to_string())?;
        info!("{}: {} snapshots", date, paths.len());

        for path in paths.iter().filter(|p| p.ends_with(".json")) {
            summary.checked += 1;
            let snapshot = match load(store, path) {
                Ok(s) => s,
                Err(e) => {
                    summary.failed += 1;
                    warn!("skipping {}: {:#}", path, e);
                    continue;
                }
            };
            if !snapshot.performers().is_empty() {
                summary.already_filled += 1;
                continue;
            }

            if fetched_any {
                tokio::time::sleep(jittered_delay(settings)).await;
            }
            fetched_any = true;

            match refill(fetcher, conn, store, settings, path, snapshot).await {
                Ok(0) => summary.still_empty += 1,
                Ok(n) => {
                    summary.updated += 1;
                    debug!("{}: {} performers", path, n);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!("backfill {} failed: {:#}", path, e);
                }
            }
        }
    }

    info!(
        "Backfill: {} checked, {} updated, {} still empty, {} already filled, {} failed",
        summary.checked,
        summary.updated,
        summary.still_empty,
        summary.already_filled,
        summary.failed
    );
    Ok(summary)
}

fn load<B: BlobStore + ?Sized>(store: &B, path: &str) -> Result<Snapshot> {
    let bytes = store.get(path)?.ok_or_else(|| anyhow!("vanished"))?;
    Snapshot::decode(&bytes)
}

/// Returns the number of performers written; 0 leaves the snapshot untouched.
async fn refill<F: Fetch, B: BlobStore + ?Sized>(
    fetcher: &F,
    conn: &Connection,
    store: &B,
    settings: &Settings,
    path: &str,
    mut snapshot: Snapshot,
) -> Result<usize> {
    // prefer the listing link stored at discovery time
    let entry = db::fetch_epg_entry(conn, &snapshot.event_id)?
        .unwrap_or_else(|| snapshot.to_epg_entry());
    let candidates = fetch::detail_candidates(
        &entry.link,
        &entry.event_id,
        &settings.site_origin,
        &settings.detail_url_patterns,
    );
    let (_, resp) = fetch::fetch_first_success(fetcher, &entry.event_id, &candidates).await?;
    let data = parser::process_detail(&resp.body, &entry, settings.profile, &settings.site_origin);
    let performers = data.record.performers;
    if performers.is_empty() {
        return Ok(0);
    }

    store_performers(conn, &snapshot.event_id, &performers)?;
    snapshot.set_performers(performers.iter().map(PerformerEntry::from).collect());
    rewrite(store, settings, path, snapshot).await?;
    Ok(performers.len())
}

/// Insert-missing the talents and their appearance pairs for one program.
fn store_performers(conn: &Connection, event_id: &str, performers: &[TalentRef]) -> Result<()> {
    let talents: Vec<TalentRow> = performers.iter().map(TalentRow::from).collect();
    db::insert_missing(conn, &talents)?;
    let pairs: Vec<AppearanceRow> = performers
        .iter()
        .map(|t| AppearanceRow {
            program_event_id: event_id.to_string(),
            talent_id: t.identifier.clone(),
        })
        .collect();
    db::insert_missing(conn, &pairs)?;
    Ok(())
}

async fn rewrite<B: BlobStore + ?Sized>(
    store: &B,
    settings: &Settings,
    path: &str,
    mut snapshot: Snapshot,
) -> Result<()> {
    snapshot.updated_at = Some(Local::now().format("%Y-%m-%dT%H:%M:%S").to_string());
    let bytes = snapshot.encode()?;
    blob::put_with_retry(store, path, &bytes, settings.max_upload_retries, settings.backoff_base_ms)
        .await
}

// ── Cast from description text ──

#[derive(Debug, Default, Serialize)]
pub struct TextFillSummary {
    pub checked: usize,
    /// Snapshots whose description has no `【出演】` section.
    pub no_marker: usize,
    /// The text named nobody missing from `performers`.
    pub complete: usize,
    pub updated: usize,
    /// Performers appended across all updated snapshots.
    pub added: usize,
    pub failed: usize,
}

/// Append performers named in each snapshot's own `【出演】` text but missing
/// from its linked cast. No detail pages are fetched; existing entries keep
/// their order and identifiers, additions get placeholder ids.
pub async fn fill_from_text<B: BlobStore + ?Sized>(
    conn: &Connection,
    store: &B,
    settings: &Settings,
    dates: &[NaiveDate],
) -> Result<TextFillSummary> {
    let mut summary = TextFillSummary::default();

    for date in dates {
        let paths = store.list(&date.format("%Y-%m-%d").to_string())?;
        for path in paths.iter().filter(|p| p.ends_with(".json")) {
            summary.checked += 1;
            let snapshot = match load(store, path) {
                Ok(s) => s,
                Err(e) => {
                    summary.failed += 1;
                    warn!("skipping {}: {:#}", path, e);
                    continue;
                }
            };
            if !fallback::has_cast_marker(&snapshot.description_detail) {
                summary.no_marker += 1;
                continue;
            }

            match append_text_cast(conn, store, settings, path, snapshot).await {
                Ok(0) => summary.complete += 1,
                Ok(n) => {
                    summary.updated += 1;
                    summary.added += n;
                    debug!("{}: {} performers appended", path, n);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!("text fill {} failed: {:#}", path, e);
                }
            }
        }
    }

    info!(
        "Text fill: {} checked, {} updated (+{} performers), {} complete, {} without {}, {} failed",
        summary.checked,
        summary.updated,
        summary.added,
        summary.complete,
        summary.no_marker,
        fallback::CAST_MARKER,
        summary.failed
    );
    Ok(summary)
}

/// Returns how many performers were appended; 0 leaves the snapshot untouched.
async fn append_text_cast<B: BlobStore + ?Sized>(
    conn: &Connection,
    store: &B,
    settings: &Settings,
    path: &str,
    mut snapshot: Snapshot,
) -> Result<usize> {
    let existing: Vec<TalentRef> = snapshot
        .performers()
        .iter()
        .map(|p| TalentRef {
            identifier: p.talent_id.clone(),
            display_name: p.name.clone(),
            source_link: p.link.clone(),
            role_label: None,
        })
        .collect();
    let candidates = fallback::extract_from_text(&snapshot.description_detail);
    let added: Vec<TalentRef> = reconcile::reconcile(existing.clone(), candidates)
        .into_iter()
        .filter(|t| !existing.iter().any(|e| e.display_name == t.display_name))
        .collect();
    if added.is_empty() {
        return Ok(0);
    }

    store_performers(conn, &snapshot.event_id, &added)?;
    let mut performers = snapshot.performers().to_vec();
    performers.extend(added.iter().map(PerformerEntry::from));
    snapshot.set_performers(performers);
    rewrite(store, settings, path, snapshot).await?;
    Ok(added.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use crate::db::ProgramRecord;
    use crate::fetch::fake::FakeFetcher;

    fn record(event_id: &str, start: &str) -> ProgramRecord {
        ProgramRecord {
            event_id: event_id.to_string(),
            broadcast_date: "2025-07-13".to_string(),
            channel: "1 NHK総合1..".to_string(),
            start_time: start.to_string(),
            end_time: "202507131020".to_string(),
            master_title: "日曜討論".to_string(),
            program_title: "日曜討論　投開票まで1週間".to_string(),
            description: String::new(),
            description_detail: String::new(),
            genre: String::new(),
            official_website: String::new(),
            channel_code: "NHKG-TKY".to_string(),
            performers: Vec::new(),
        }
    }

    fn created() -> String {
        "2025-07-13T06:00:00".to_string()
    }

    fn count(conn: &Connection, table: &str) -> usize {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0)).unwrap()
    }

    fn settings() -> Settings {
        Settings {
            delay_min_ms: 0,
            delay_max_ms: 0,
            backoff_base_ms: 1,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn fills_empty_snapshots_only() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let empty = Snapshot::from_record(&record("AkZgQAVzwAM", "202507130900"), created());
        let mut filled_record = record("AkZgQAVzwBB", "202507131030");
        filled_record.performers = vec![parser::TalentRef {
            identifier: "300001".into(),
            display_name: "佐藤一郎".into(),
            source_link: None,
            role_label: None,
        }];
        let filled = Snapshot::from_record(&filled_record, created());
        let unreachable = Snapshot::from_record(&record("Gone000001", "202507132300"), created());
        for s in [&empty, &filled, &unreachable] {
            store.put(&s.path(), &s.encode().unwrap()).unwrap();
        }

        let html = std::fs::read_to_string("tests/fixtures/detail_addition.html").unwrap();
        let fetcher =
            FakeFetcher::default().with("https://bangumi.org/tv_events/AkZgQAVzwAM", 200, &html);
        let date = NaiveDate::from_ymd_opt(2025, 7, 13).unwrap();

        let s = backfill(&fetcher, &conn, &store, &settings(), &[date]).await.unwrap();
        assert_eq!(s.checked, 3);
        assert_eq!(s.already_filled, 1);
        assert_eq!(s.updated, 1);
        assert_eq!(s.failed, 1);

        let back = Snapshot::decode(&store.get(&empty.path()).unwrap().unwrap()).unwrap();
        assert_eq!(back.performers().len(), 6);
        assert_eq!(back.created_at, "2025-07-13T06:00:00");
        assert!(back.updated_at.is_some());
        assert_eq!(back.program_title, empty.program_title);

        assert_eq!(count(&conn, "program_talent_appearances"), 6);

        // second pass has nothing left to fill
        let again = backfill(&fetcher, &conn, &store, &settings(), &[date]).await.unwrap();
        assert_eq!(again.already_filled, 2);
        assert_eq!(again.updated, 0);
    }

    const PARTIES: [(&str, &str, &str); 11] = [
        ("172499", "立憲民主党幹事長", "小川淳也"),
        ("172501", "国民民主党幹事長", "榛葉賀津也"),
        ("172502", "公明党幹事長", "西田実仁"),
        ("172503", "れいわ新選組幹事長", "高井崇志"),
        ("172504", "日本共産党書記局長", "小池晃"),
        ("172505", "参政党事務局長", "神谷宗幣"),
        ("172506", "日本保守党事務総長", "有本香"),
        ("172507", "社民党幹事長", "服部良一"),
        ("172508", "NHK解説委員", "伊藤雅之"),
        ("", "自由民主党幹事長", "森山裕"),
        ("", "日本維新の会幹事長", "岩谷良平"),
    ];

    fn discussion() -> ProgramRecord {
        let mut r = record("AkZgQAVzwAM", "202507130900");
        let cast: Vec<String> =
            PARTIES.iter().map(|(_, role, name)| format!("{}・{}", role, name)).collect();
        r.description_detail = format!("【出演】{}【司会】NHK・伊藤雅之", cast.join("、"));
        r.performers = PARTIES
            .iter()
            .filter(|(id, _, _)| !id.is_empty())
            .map(|(id, _, name)| parser::TalentRef {
                identifier: id.to_string(),
                display_name: name.to_string(),
                source_link: Some(format!("https://bangumi.org/talents/{}", id)),
                role_label: None,
            })
            .collect();
        r
    }

    #[tokio::test]
    async fn text_fill_appends_unlinked_cast() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let sunday = Snapshot::from_record(&discussion(), created());
        let plain = Snapshot::from_record(&record("AkZgQAVzwBB", "202507131030"), created());
        for s in [&sunday, &plain] {
            store.put(&s.path(), &s.encode().unwrap()).unwrap();
        }
        let date = NaiveDate::from_ymd_opt(2025, 7, 13).unwrap();

        let s = fill_from_text(&conn, &store, &settings(), &[date]).await.unwrap();
        assert_eq!(s.checked, 2);
        assert_eq!(s.no_marker, 1);
        assert_eq!(s.updated, 1);
        assert_eq!(s.added, 2);

        let back = Snapshot::decode(&store.get(&sunday.path()).unwrap().unwrap()).unwrap();
        let performers = back.performers();
        assert_eq!(performers.len(), 11);
        assert_eq!(performers[0].talent_id, "172499");
        assert_eq!(performers[9].name, "森山裕");
        assert_eq!(performers[10].name, "岩谷良平");
        assert!(reconcile::is_placeholder(&performers[9].talent_id));
        assert_eq!(performers[9].talent_id, reconcile::placeholder_id("森山裕"));
        assert!(performers[10].link.is_none());
        assert_eq!(back.created_at, created());
        assert!(back.updated_at.is_some());

        assert_eq!(count(&conn, "talents"), 2);
        assert_eq!(count(&conn, "program_talent_appearances"), 2);

        // nothing left to append on a second pass
        let again = fill_from_text(&conn, &store, &settings(), &[date]).await.unwrap();
        assert_eq!(again.complete, 1);
        assert_eq!(again.updated, 0);
    }
}
