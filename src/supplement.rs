use std::collections::HashSet;

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::blob::{BlobStore, Snapshot};
use crate::db::{self, AppearanceRow, TalentRow};

#[derive(Debug, Default, Serialize)]
pub struct SupplementSummary {
    pub files: usize,
    /// Appearance pairs written.
    pub supplemented: usize,
    /// Pairs already present.
    pub skipped: usize,
    pub new_talents: usize,
    pub errors: usize,
}

/// `today` and the `days_back - 1` days before it, newest first.
pub fn recent_dates(today: NaiveDate, days_back: i64) -> Vec<NaiveDate> {
    (0..days_back.max(1))
        .filter_map(|i| today.checked_sub_signed(chrono::Duration::days(i)))
        .collect()
}

/// Rebuild talents and appearances from stored snapshots. Existing rows are
/// never modified.
pub fn supplement<B: BlobStore + ?Sized>(
    conn: &Connection,
    store: &B,
    dates: &[NaiveDate],
    max_programs: usize,
) -> Result<SupplementSummary> {
    let mut summary = SupplementSummary::default();

    let mut paths = Vec::new();
    for date in dates {
        match store.list(&date.format("%Y-%m-%d").to_string()) {
            Ok(found) => paths.extend(found.into_iter().filter(|p| p.ends_with(".json"))),
            Err(e) => {
                summary.errors += 1;
                warn!("listing snapshots for {} failed: {:#}", date, e);
            }
        }
    }
    if paths.len() > max_programs {
        info!("{} snapshots found, limiting to {}", paths.len(), max_programs);
        paths.truncate(max_programs);
    }
    summary.files = paths.len();

    let mut snapshots = Vec::with_capacity(paths.len());
    for path in &paths {
        let loaded = store
            .get(path)
            .and_then(|bytes| bytes.ok_or_else(|| anyhow::anyhow!("vanished")))
            .and_then(|bytes| Snapshot::decode(&bytes));
        match loaded {
            Ok(s) => snapshots.push(s),
            Err(e) => {
                summary.errors += 1;
                warn!("skipping {}: {:#}", path, e);
            }
        }
    }

    let event_ids: Vec<String> = snapshots.iter().map(|s| s.event_id.clone()).collect();
    let mut pairs = db::existing_pairs(conn, &event_ids)?;
    let talent_ids: Vec<String> = snapshots
        .iter()
        .flat_map(|s| s.performers().iter().map(|p| p.talent_id.clone()))
        .collect();
    let mut known: HashSet<String> = db::existing_talents(conn, &talent_ids)?;

    let mut talents = Vec::new();
    let mut appearances = Vec::new();
    for s in &snapshots {
        for p in s.performers() {
            if p.talent_id.is_empty() {
                continue;
            }
            if known.insert(p.talent_id.clone()) {
                talents.push(TalentRow {
                    talent_id: p.talent_id.clone(),
                    name: p.name.clone(),
                    link: p.link.clone(),
                });
            }
            let pair = AppearanceRow {
                program_event_id: s.event_id.clone(),
                talent_id: p.talent_id.clone(),
            };
            if pairs.insert(pair.clone()) {
                appearances.push(pair);
            } else {
                summary.skipped += 1;
            }
        }
    }

    summary.new_talents = db::insert_missing(conn, &talents)?;
    summary.supplemented = db::insert_missing(conn, &appearances)?;
    info!(
        "Supplement: {} files, {} pairs added, {} already present, {} new talents, {} errors",
        summary.files, summary.supplemented, summary.skipped, summary.new_talents, summary.errors
    );
    Ok(summary)
}
