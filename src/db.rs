use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::parser::TalentRef;

/// Max bound parameters per `IN (...)` lookup.
const LOOKUP_CHUNK: usize = 100;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS programs_epg (
            event_id       TEXT PRIMARY KEY,
            broadcast_date TEXT NOT NULL,
            channel        TEXT NOT NULL,
            start_time     TEXT NOT NULL,
            end_time       TEXT NOT NULL,
            program_title  TEXT NOT NULL,
            program_detail TEXT NOT NULL,
            link           TEXT NOT NULL,
            region         TEXT NOT NULL,
            channel_code   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_epg_date ON programs_epg(broadcast_date);

        CREATE TABLE IF NOT EXISTS programs (
            event_id           TEXT PRIMARY KEY,
            broadcast_date     TEXT NOT NULL,
            channel            TEXT NOT NULL,
            start_time         TEXT NOT NULL,
            end_time           TEXT NOT NULL,
            master_title       TEXT NOT NULL,
            program_title      TEXT NOT NULL,
            description        TEXT NOT NULL,
            description_detail TEXT NOT NULL,
            genre              TEXT NOT NULL,
            official_website   TEXT NOT NULL,
            channel_code       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_programs_date ON programs(broadcast_date);

        CREATE TABLE IF NOT EXISTS talents (
            talent_id  TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            link       TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS program_talent_appearances (
            id               INTEGER PRIMARY KEY,
            program_event_id TEXT NOT NULL,
            talent_id        TEXT NOT NULL,
            UNIQUE(program_event_id, talent_id)
        );
        CREATE INDEX IF NOT EXISTS idx_appearances_talent ON program_talent_appearances(talent_id);

        CREATE TABLE IF NOT EXISTS talent_profiles (
            talent_id         TEXT PRIMARY KEY,
            source_url        TEXT NOT NULL,
            full_name         TEXT,
            reading           TEXT,
            birth_date        TEXT,
            zodiac_sign       TEXT,
            blood_type        TEXT,
            height_cm         INTEGER,
            birthplace        TEXT,
            profile_image_url TEXT,
            genres            TEXT NOT NULL,
            skills            TEXT NOT NULL,
            hobbies           TEXT NOT NULL,
            career_history    TEXT,
            tags              TEXT NOT NULL,
            completeness      REAL NOT NULL,
            scraped_at        TEXT NOT NULL
        );

        -- Rotation targets
        CREATE TABLE IF NOT EXISTS programs_epg_archive AS SELECT * FROM programs_epg WHERE 0;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_epg_archive_id ON programs_epg_archive(event_id);
        CREATE TABLE IF NOT EXISTS programs_archive AS SELECT * FROM programs WHERE 0;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_programs_archive_id ON programs_archive(event_id);

        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            kind        TEXT NOT NULL,
            started_at  TEXT NOT NULL,
            finished_at TEXT NOT NULL DEFAULT (datetime('now')),
            ok          BOOLEAN NOT NULL,
            summary     TEXT,
            error       TEXT
        );
        ",
    )?;
    Ok(())
}

// ── Rows ──

/// A table row with a declared conflict key.
pub trait Record {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    /// Must match a PRIMARY KEY or UNIQUE constraint of `TABLE`.
    const KEY: &'static [&'static str];

    fn values(&self) -> Vec<Value>;
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn opt_text(s: &Option<String>) -> Value {
    s.as_deref().map(text).unwrap_or(Value::Null)
}

/// One program as listed in the EPG grid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpgEntry {
    pub event_id: String,
    pub broadcast_date: String,
    pub channel: String,
    pub start_time: String,
    pub end_time: String,
    pub program_title: String,
    pub program_detail: String,
    pub link: String,
    pub region: String,
    pub channel_code: Option<String>,
}

impl Record for EpgEntry {
    const TABLE: &'static str = "programs_epg";
    const COLUMNS: &'static [&'static str] = &[
        "event_id", "broadcast_date", "channel", "start_time", "end_time",
        "program_title", "program_detail", "link", "region", "channel_code",
    ];
    const KEY: &'static [&'static str] = &["event_id"];

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.event_id),
            text(&self.broadcast_date),
            text(&self.channel),
            text(&self.start_time),
            text(&self.end_time),
            text(&self.program_title),
            text(&self.program_detail),
            text(&self.link),
            text(&self.region),
            opt_text(&self.channel_code),
        ]
    }
}

/// One broadcast with its detail fields and reconciled cast.
/// `performers` is not a column; it is projected into `talents` and
/// `program_talent_appearances`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramRecord {
    pub event_id: String,
    pub broadcast_date: String,
    pub channel: String,
    pub start_time: String,
    pub end_time: String,
    pub master_title: String,
    pub program_title: String,
    pub description: String,
    pub description_detail: String,
    pub genre: String,
    pub official_website: String,
    pub channel_code: String,
    pub performers: Vec<TalentRef>,
}

impl Record for ProgramRecord {
    const TABLE: &'static str = "programs";
    const COLUMNS: &'static [&'static str] = &[
        "event_id", "broadcast_date", "channel", "start_time", "end_time", "master_title",
        "program_title", "description", "description_detail", "genre", "official_website",
        "channel_code",
    ];
    const KEY: &'static [&'static str] = &["event_id"];

    fn values(&self) -> Vec<Value> {
        [
            &self.event_id,
            &self.broadcast_date,
            &self.channel,
            &self.start_time,
            &self.end_time,
            &self.master_title,
            &self.program_title,
            &self.description,
            &self.description_detail,
            &self.genre,
            &self.official_website,
            &self.channel_code,
        ]
        .into_iter()
        .map(|s| text(s))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalentRow {
    pub talent_id: String,
    pub name: String,
    pub link: Option<String>,
}

impl From<&TalentRef> for TalentRow {
    fn from(t: &TalentRef) -> Self {
        TalentRow {
            talent_id: t.identifier.clone(),
            name: t.display_name.clone(),
            link: t.source_link.clone(),
        }
    }
}

impl Record for TalentRow {
    const TABLE: &'static str = "talents";
    const COLUMNS: &'static [&'static str] = &["talent_id", "name", "link"];
    const KEY: &'static [&'static str] = &["talent_id"];

    fn values(&self) -> Vec<Value> {
        vec![text(&self.talent_id), text(&self.name), opt_text(&self.link)]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppearanceRow {
    pub program_event_id: String,
    pub talent_id: String,
}

impl Record for AppearanceRow {
    const TABLE: &'static str = "program_talent_appearances";
    const COLUMNS: &'static [&'static str] = &["program_event_id", "talent_id"];
    const KEY: &'static [&'static str] = &["program_event_id", "talent_id"];

    fn values(&self) -> Vec<Value> {
        vec![text(&self.program_event_id), text(&self.talent_id)]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TalentProfile {
    pub talent_id: String,
    pub source_url: String,
    pub full_name: Option<String>,
    pub reading: Option<String>,
    pub birth_date: Option<String>,
    pub zodiac_sign: Option<String>,
    pub blood_type: Option<String>,
    pub height_cm: Option<i64>,
    pub birthplace: Option<String>,
    pub profile_image_url: Option<String>,
    pub genres: Vec<String>,
    pub skills: Vec<String>,
    pub hobbies: Vec<String>,
    pub career_history: Option<String>,
    pub tags: Vec<String>,
    pub completeness: f64,
    pub scraped_at: String,
}

fn json_list(items: &[String]) -> Value {
    Value::Text(serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string()))
}

impl Record for TalentProfile {
    const TABLE: &'static str = "talent_profiles";
    const COLUMNS: &'static [&'static str] = &[
        "talent_id", "source_url", "full_name", "reading", "birth_date", "zodiac_sign",
        "blood_type", "height_cm", "birthplace", "profile_image_url", "genres", "skills",
        "hobbies", "career_history", "tags", "completeness", "scraped_at",
    ];
    const KEY: &'static [&'static str] = &["talent_id"];

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.talent_id),
            text(&self.source_url),
            opt_text(&self.full_name),
            opt_text(&self.reading),
            opt_text(&self.birth_date),
            opt_text(&self.zodiac_sign),
            opt_text(&self.blood_type),
            self.height_cm.map(Value::Integer).unwrap_or(Value::Null),
            opt_text(&self.birthplace),
            opt_text(&self.profile_image_url),
            json_list(&self.genres),
            json_list(&self.skills),
            json_list(&self.hobbies),
            opt_text(&self.career_history),
            json_list(&self.tags),
            Value::Real(self.completeness),
            text(&self.scraped_at),
        ]
    }
}

// ── Writes ──

fn insert_sql<R: Record>(conflict: &str) -> String {
    let placeholders: Vec<String> = (1..=R::COLUMNS.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        R::TABLE,
        R::COLUMNS.join(", "),
        placeholders.join(", "),
        R::KEY.join(", "),
        conflict
    )
}

fn write_all<R: Record>(conn: &Connection, rows: &[R], sql: &str) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(sql)?;
        for r in rows {
            count += stmt.execute(params_from_iter(r.values()))?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Insert-or-update on the record's key. Writing the same rows twice leaves
/// the table as after the first write.
pub fn upsert<R: Record>(conn: &Connection, rows: &[R]) -> Result<usize> {
    let updates: Vec<String> = R::COLUMNS
        .iter()
        .filter(|c| !R::KEY.contains(c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    write_all(conn, rows, &insert_sql::<R>(&conflict))
        .with_context(|| format!("upsert into {}", R::TABLE))
}

/// Insert rows whose key is not present yet; existing rows are untouched.
/// Returns the number of rows actually inserted.
pub fn insert_missing<R: Record>(conn: &Connection, rows: &[R]) -> Result<usize> {
    write_all(conn, rows, &insert_sql::<R>("DO NOTHING"))
        .with_context(|| format!("insert into {}", R::TABLE))
}

/// Explicit overwrite of a registry entry's name/link.
pub fn update_talent(conn: &Connection, talent: &TalentRow) -> Result<bool> {
    let n = conn.execute(
        "UPDATE talents SET name = ?2, link = ?3 WHERE talent_id = ?1",
        rusqlite::params![talent.talent_id, talent.name, talent.link],
    )?;
    Ok(n > 0)
}

pub struct ArchiveCounts {
    pub epg: usize,
    pub programs: usize,
}

/// Move rows broadcast before `cutoff` (YYYY-MM-DD) into the archive tables.
pub fn archive_older_than(conn: &Connection, cutoff: &str) -> Result<ArchiveCounts> {
    let tx = conn.unchecked_transaction()?;
    let mut moved = [0usize; 2];
    for (i, (table, columns)) in [
        ("programs_epg", EpgEntry::COLUMNS),
        ("programs", ProgramRecord::COLUMNS),
    ]
    .into_iter()
    .enumerate()
    {
        let cols = columns.join(", ");
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {table}_archive ({cols})
                 SELECT {cols} FROM {table} WHERE broadcast_date < ?1"
            ),
            [cutoff],
        )?;
        moved[i] = tx.execute(&format!("DELETE FROM {table} WHERE broadcast_date < ?1"), [cutoff])?;
    }
    tx.commit()?;
    Ok(ArchiveCounts { epg: moved[0], programs: moved[1] })
}

pub fn record_run(
    conn: &Connection,
    kind: &str,
    started_at: &str,
    ok: bool,
    summary: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO runs (kind, started_at, ok, summary, error) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![kind, started_at, ok, summary, error],
    )?;
    Ok(())
}

// ── Reads ──

fn in_clause(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `(event_id, talent_id)` pairs already recorded for the given programs.
pub fn existing_pairs(conn: &Connection, event_ids: &[String]) -> Result<HashSet<AppearanceRow>> {
    let mut found = HashSet::new();
    for chunk in event_ids.chunks(LOOKUP_CHUNK) {
        let sql = format!(
            "SELECT program_event_id, talent_id FROM program_talent_appearances
             WHERE program_event_id IN ({})",
            in_clause(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk), |row| {
            Ok(AppearanceRow {
                program_event_id: row.get(0)?,
                talent_id: row.get(1)?,
            })
        })?;
        for r in rows {
            found.insert(r?);
        }
    }
    Ok(found)
}

pub fn existing_talents(conn: &Connection, ids: &[String]) -> Result<HashSet<String>> {
    let mut found = HashSet::new();
    for chunk in ids.chunks(LOOKUP_CHUNK) {
        let sql = format!(
            "SELECT talent_id FROM talents WHERE talent_id IN ({})",
            in_clause(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk), |row| row.get::<_, String>(0))?;
        for r in rows {
            found.insert(r?);
        }
    }
    Ok(found)
}

pub fn fetch_talent(conn: &Connection, talent_id: &str) -> Result<Option<TalentRow>> {
    let mut stmt = conn.prepare("SELECT talent_id, name, link FROM talents WHERE talent_id = ?1")?;
    let mut rows = stmt.query_map([talent_id], |row| {
        Ok(TalentRow {
            talent_id: row.get(0)?,
            name: row.get(1)?,
            link: row.get(2)?,
        })
    })?;
    Ok(rows.next().transpose()?)
}

/// Linked talents that have no profile row yet, in id order.
pub fn talents_without_profile(
    conn: &Connection,
    limit: usize,
    offset: usize,
) -> Result<Vec<TalentRow>> {
    let sql = format!(
        "SELECT t.talent_id, t.name, t.link
         FROM talents t
         LEFT JOIN talent_profiles tp ON tp.talent_id = t.talent_id
         WHERE tp.talent_id IS NULL AND t.link IS NOT NULL
         ORDER BY t.talent_id
         LIMIT {} OFFSET {}",
        limit, offset
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(TalentRow {
                talent_id: row.get(0)?,
                name: row.get(1)?,
                link: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_epg_entry(conn: &Connection, event_id: &str) -> Result<Option<EpgEntry>> {
    let sql = format!(
        "SELECT {} FROM programs_epg WHERE event_id = ?1",
        EpgEntry::COLUMNS.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map([event_id], |row| {
        Ok(EpgEntry {
            event_id: row.get(0)?,
            broadcast_date: row.get(1)?,
            channel: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            program_title: row.get(5)?,
            program_detail: row.get(6)?,
            link: row.get(7)?,
            region: row.get(8)?,
            channel_code: row.get(9)?,
        })
    })?;
    Ok(rows.next().transpose()?)
}

// ── Stats ──

pub struct Stats {
    pub epg: usize,
    pub programs: usize,
    pub talents: usize,
    pub placeholders: usize,
    pub appearances: usize,
    pub profiles: usize,
    pub archived_epg: usize,
    pub archived_programs: usize,
    pub last_run: Option<(String, String, bool)>,
}

pub fn stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    let last_run = conn
        .prepare("SELECT kind, finished_at, ok FROM runs ORDER BY id DESC LIMIT 1")?
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .next()
        .transpose()?;
    Ok(Stats {
        epg: count("SELECT COUNT(*) FROM programs_epg")?,
        programs: count("SELECT COUNT(*) FROM programs")?,
        talents: count("SELECT COUNT(*) FROM talents")?,
        placeholders: count("SELECT COUNT(*) FROM talents WHERE talent_id LIKE 'extracted\\_%' ESCAPE '\\'")?,
        appearances: count("SELECT COUNT(*) FROM program_talent_appearances")?,
        profiles: count("SELECT COUNT(*) FROM talent_profiles")?,
        archived_epg: count("SELECT COUNT(*) FROM programs_epg_archive")?,
        archived_programs: count("SELECT COUNT(*) FROM programs_archive")?,
        last_run,
    })
}
