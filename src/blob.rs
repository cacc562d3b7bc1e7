use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::db::{EpgEntry, ProgramRecord};
use crate::error::SnapshotError;
use crate::parser::TalentRef;

/// Smallest serialised snapshot accepted for upload.
const MIN_SNAPSHOT_CHARS: usize = 50;
const REQUIRED_FIELDS: [&str; 4] = ["event_id", "broadcast_date", "channel", "program_title"];

/// Keyed byte storage for JSON snapshots. Paths are `/`-separated and relative.
pub trait BlobStore {
    /// Create or overwrite.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
    /// Every blob path under `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Blob store on the local filesystem, one file per path under `root`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsBlobStore { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            bail!("blob path must be relative without '..': {:?}", path);
        }
        Ok(self.root.join(rel))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if path.extension().is_some_and(|e| e != "tmp") {
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    let parts: Vec<_> =
                        rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
                    out.push(parts.join("/"));
                }
            }
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = target.with_extension("tmp");
        std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &target)
            .with_context(|| format!("renaming to {}", target.display()))?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match std::fs::read(&target) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", target.display())),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        self.walk(&dir, &mut out)?;
        out.sort();
        Ok(out)
    }
}

// ── Snapshots ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformerEntry {
    pub talent_id: String,
    pub name: String,
    pub link: Option<String>,
}

impl From<&TalentRef> for PerformerEntry {
    fn from(t: &TalentRef) -> Self {
        PerformerEntry {
            talent_id: t.identifier.clone(),
            name: t.display_name.clone(),
            link: t.source_link.clone(),
        }
    }
}

/// Denormalised JSON mirror of one program. `performer_count` always follows
/// `performers`; both are only set through [`Snapshot::set_performers`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
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
    performers: Vec<PerformerEntry>,
    performer_count: usize,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Snapshot {
    pub fn from_record(r: &ProgramRecord, created_at: String) -> Self {
        let mut s = Snapshot {
            event_id: r.event_id.clone(),
            broadcast_date: r.broadcast_date.clone(),
            channel: r.channel.clone(),
            start_time: r.start_time.clone(),
            end_time: r.end_time.clone(),
            master_title: r.master_title.clone(),
            program_title: r.program_title.clone(),
            description: r.description.clone(),
            description_detail: r.description_detail.clone(),
            genre: r.genre.clone(),
            official_website: r.official_website.clone(),
            channel_code: r.channel_code.clone(),
            created_at,
            ..Default::default()
        };
        s.set_performers(r.performers.iter().map(PerformerEntry::from).collect());
        s
    }

    pub fn performers(&self) -> &[PerformerEntry] {
        &self.performers
    }

    pub fn set_performers(&mut self, performers: Vec<PerformerEntry>) {
        self.performer_count = performers.len();
        self.performers = performers;
    }

    pub fn path(&self) -> String {
        snapshot_path(&self.broadcast_date, &self.channel_code, &self.start_time, &self.event_id)
    }

    /// Listing-shaped view used to refetch the detail page.
    pub fn to_epg_entry(&self) -> EpgEntry {
        EpgEntry {
            event_id: self.event_id.clone(),
            broadcast_date: self.broadcast_date.clone(),
            channel: self.channel.clone(),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            program_title: self.program_title.clone(),
            program_detail: String::new(),
            link: String::new(),
            region: String::new(),
            channel_code: Some(self.channel_code.clone()).filter(|c| !c.is_empty()),
        }
    }

    /// Validated, pretty-printed UTF-8 bytes ready for upload.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let round_trip = |e: serde_json::Error| SnapshotError::RoundTrip(e.to_string());
        let value = serde_json::to_value(self).map_err(round_trip)?;
        validate(&value)?;
        let text = serde_json::to_string_pretty(&value).map_err(round_trip)?;
        let chars = text.chars().count();
        if chars < MIN_SNAPSHOT_CHARS {
            return Err(SnapshotError::TooSmall(chars));
        }
        let back: Value = serde_json::from_str(&text).map_err(round_trip)?;
        if back != value {
            return Err(SnapshotError::RoundTrip("re-read value differs".to_string()));
        }
        Ok(text.into_bytes())
    }

    /// Parse and validate a stored snapshot. A missing `performer_count` is
    /// recomputed from `performers`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).context("snapshot is not JSON")?;
        validate(&value)?;
        let mut snapshot: Snapshot = serde_json::from_value(value)?;
        let performers = std::mem::take(&mut snapshot.performers);
        snapshot.set_performers(performers);
        Ok(snapshot)
    }
}

/// Snapshots stored for `date`, optionally narrowed to one channel code and to
/// titles containing `keyword`. Unreadable blobs are logged and skipped.
pub fn find_snapshots<B: BlobStore + ?Sized>(
    store: &B,
    date: &str,
    channel: Option<&str>,
    keyword: Option<&str>,
) -> Result<Vec<(String, Snapshot)>> {
    let prefix = match channel {
        Some(code) => format!("{}/{}", date, code),
        None => date.to_string(),
    };
    let mut found = Vec::new();
    for path in store.list(&prefix)?.into_iter().filter(|p| p.ends_with(".json")) {
        let Some(bytes) = store.get(&path)? else { continue };
        let snapshot = match Snapshot::decode(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!("skipping {}: {:#}", path, e);
                continue;
            }
        };
        let matches = keyword.map_or(true, |k| {
            snapshot.program_title.contains(k) || snapshot.master_title.contains(k)
        });
        if matches {
            found.push((path, snapshot));
        }
    }
    Ok(found)
}

/// `{date}/{code}/{date}-{HHMM}_{code}_{event_id}.json`, HHMM from a
/// `YYYYMMDDHHMM` start time or `0000` when it is shorter.
pub fn snapshot_path(
    broadcast_date: &str,
    channel_code: &str,
    start_time: &str,
    event_id: &str,
) -> String {
    let hhmm = start_time.get(8..12).unwrap_or("0000");
    format!(
        "{date}/{code}/{date}-{hhmm}_{code}_{event_id}.json",
        date = broadcast_date,
        code = channel_code,
        hhmm = hhmm,
        event_id = event_id
    )
}

/// Structural checks on a snapshot before it is written or trusted.
pub fn validate(value: &Value) -> Result<(), SnapshotError> {
    let obj = value.as_object().ok_or(SnapshotError::NotAnObject)?;
    for field in REQUIRED_FIELDS {
        match obj.get(field) {
            Some(Value::String(s)) if !s.is_empty() => {}
            Some(Value::Null) | Some(Value::String(_)) | None => {
                return Err(SnapshotError::MissingField(field))
            }
            Some(_) => {}
        }
    }
    let performers = match obj.get("performers") {
        None => return Ok(()),
        Some(Value::Array(list)) => list,
        Some(_) => return Err(SnapshotError::PerformersNotList),
    };
    if let Some(declared) = obj.get("performer_count").and_then(Value::as_u64) {
        if declared as usize != performers.len() {
            return Err(SnapshotError::CountMismatch { declared, actual: performers.len() });
        }
    }
    Ok(())
}

/// `created_at` of the blob already stored at `path`, if any.
pub fn previous_created_at<B: BlobStore + ?Sized>(store: &B, path: &str) -> Option<String> {
    let bytes = store.get(path).ok()??;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value
        .get("created_at")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Write with bounded attempts, sleeping `base_backoff_ms * 2^attempt` between them.
pub async fn put_with_retry<B: BlobStore + ?Sized>(
    store: &B,
    path: &str,
    bytes: &[u8],
    max_attempts: u32,
    base_backoff_ms: u64,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match store.put(path, bytes) {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 >= max_attempts => {
                let msg = format!("upload {} failed after {} attempts", path, max_attempts);
                return Err(e.context(msg));
            }
            Err(e) => {
                let backoff = Duration::from_millis(base_backoff_ms * 2u64.pow(attempt));
                warn!(
                    "upload {} failed (attempt {}/{}): {:#}, retrying in {:.1}s",
                    path,
                    attempt + 1,
                    max_attempts,
                    e,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn record(performers: Vec<TalentRef>) -> ProgramRecord {
        ProgramRecord {
            event_id: "AkZgQAVzwAM".to_string(),
            broadcast_date: "2025-07-13".to_string(),
            channel: "1 NHK総合1..".to_string(),
            start_time: "202507130900".to_string(),
            end_time: "202507131020".to_string(),
            master_title: "日曜討論".to_string(),
            program_title: "日曜討論　投開票まで1週間".to_string(),
            description: "与野党が徹底討論".to_string(),
            description_detail: "【出演】自由民主党幹事長・森山裕".to_string(),
            genre: "ニュース／報道 政治".to_string(),
            official_website: String::new(),
            channel_code: "NHKG-TKY".to_string(),
            performers,
        }
    }

    fn ogawa() -> TalentRef {
        TalentRef {
            identifier: "172499".to_string(),
            display_name: "小川淳也".to_string(),
            source_link: Some("https://bangumi.org/talents/172499".to_string()),
            role_label: None,
        }
    }

    #[test]
    fn path_convention() {
        assert_eq!(
            snapshot_path("2025-07-13", "NHKG-TKY", "202507130900", "AkZgQAVzwAM"),
            "2025-07-13/NHKG-TKY/2025-07-13-0900_NHKG-TKY_AkZgQAVzwAM.json"
        );
        assert_eq!(
            snapshot_path("2025-07-13", "BS11", "2025", "X"),
            "2025-07-13/BS11/2025-07-13-0000_BS11_X.json"
        );
    }

    #[test]
    fn count_follows_performers() {
        let mut s = Snapshot::from_record(&record(vec![ogawa()]), "t0".into());
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["performer_count"], 1);
        assert_eq!(v["performers"][0]["talent_id"], "172499");
        assert!(v.get("updated_at").is_none());

        s.set_performers(Vec::new());
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["performer_count"], 0);
    }

    #[test]
    fn encode_is_stable_and_unescaped() {
        let s = Snapshot::from_record(&record(vec![ogawa()]), "2025-07-13T06:00:00".into());
        let a = s.encode().unwrap();
        let b = s.encode().unwrap();
        assert_eq!(a, b);
        let text = String::from_utf8(a).unwrap();
        assert!(text.contains("小川淳也"));
        assert!(text.contains("\n  \"event_id\""));
    }

    #[test]
    fn empty_cast_still_valid() {
        let s = Snapshot::from_record(&record(Vec::new()), "t0".into());
        assert!(s.encode().is_ok());
    }

    #[test]
    fn validation_failures() {
        let mut s = Snapshot::from_record(&record(Vec::new()), "t0".into());
        s.program_title.clear();
        assert_eq!(s.encode(), Err(SnapshotError::MissingField("program_title")));

        assert_eq!(validate(&serde_json::json!([])), Err(SnapshotError::NotAnObject));
        let bad = serde_json::json!({
            "event_id": "E", "broadcast_date": "d", "channel": "c", "program_title": "t",
            "performers": {"a": 1}
        });
        assert_eq!(validate(&bad), Err(SnapshotError::PerformersNotList));
        let mismatch = serde_json::json!({
            "event_id": "E", "broadcast_date": "d", "channel": "c", "program_title": "t",
            "performers": [], "performer_count": 2
        });
        assert_eq!(
            validate(&mismatch),
            Err(SnapshotError::CountMismatch { declared: 2, actual: 0 })
        );
    }

    #[test]
    fn fs_store_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.put("2025-07-13/NHKG-TKY/a.json", b"{}").unwrap();
        store.put("2025-07-13/BS11/b.json", b"{}").unwrap();
        store.put("2025-07-14/BS11/c.json", b"{}").unwrap();

        assert_eq!(store.get("2025-07-13/NHKG-TKY/a.json").unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.get("missing.json").unwrap(), None);
        assert_eq!(
            store.list("2025-07-13").unwrap(),
            vec!["2025-07-13/BS11/b.json", "2025-07-13/NHKG-TKY/a.json"]
        );
        assert!(store.list("2030-01-01").unwrap().is_empty());
        assert!(store.put("../escape.json", b"x").is_err());
    }

    #[test]
    fn decode_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let s = Snapshot::from_record(&record(vec![ogawa()]), "2025-07-13T06:00:00".into());
        store.put(&s.path(), &s.encode().unwrap()).unwrap();

        assert_eq!(previous_created_at(&store, &s.path()).as_deref(), Some("2025-07-13T06:00:00"));
        let back = Snapshot::decode(&store.get(&s.path()).unwrap().unwrap()).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn decode_derives_missing_count() {
        let json = serde_json::json!({
            "event_id": "AkZgQAVzwAM", "broadcast_date": "2025-07-13",
            "channel": "1 NHK総合1..", "program_title": "日曜討論",
            "channel_code": "NHKG-TKY", "start_time": "202507130900",
            "created_at": "2025-07-13T06:00:00",
            "performers": [
                {"talent_id": "172499", "name": "小川淳也", "link": null},
                {"talent_id": "172500", "name": "森山裕", "link": null}
            ]
        });
        let s = Snapshot::decode(json.to_string().as_bytes()).unwrap();
        assert_eq!(s.performers().len(), 2);

        let v: Value = serde_json::from_slice(&s.encode().unwrap()).unwrap();
        assert_eq!(v["performer_count"], 2);
    }

    #[test]
    fn find_by_channel_and_keyword() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let sunday = Snapshot::from_record(&record(vec![ogawa()]), "t0".into());
        let mut other = record(Vec::new());
        other.event_id = "BSevent001".to_string();
        other.channel_code = "BS11".to_string();
        other.program_title = "天気予報".to_string();
        other.master_title = "天気予報".to_string();
        let other = Snapshot::from_record(&other, "t0".into());
        for s in [&sunday, &other] {
            store.put(&s.path(), &s.encode().unwrap()).unwrap();
        }
        store.put("2025-07-13/BS11/broken.json", b"not json").unwrap();

        assert_eq!(find_snapshots(&store, "2025-07-13", None, None).unwrap().len(), 2);
        let bs = find_snapshots(&store, "2025-07-13", Some("BS11"), None).unwrap();
        assert_eq!(bs.len(), 1);
        assert_eq!(bs[0].1.event_id, "BSevent001");

        let hits = find_snapshots(&store, "2025-07-13", None, Some("討論")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, sunday.path());
        assert_eq!(hits[0].1.performers()[0].name, "小川淳也");
        assert!(find_snapshots(&store, "2025-07-14", None, None).unwrap().is_empty());
    }

    struct Flaky {
        failures: Cell<u32>,
        inner: FsBlobStore,
    }

    impl BlobStore for Flaky {
        fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                bail!("transient");
            }
            self.inner.put(path, bytes)
        }
        fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(path)
        }
        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Flaky { failures: Cell::new(2), inner: FsBlobStore::new(dir.path()) };
        put_with_retry(&store, "a/b.json", b"{}", 3, 1).await.unwrap();
        assert!(store.get("a/b.json").unwrap().is_some());
    }

    #[tokio::test]
    async fn retry_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = Flaky { failures: Cell::new(5), inner: FsBlobStore::new(dir.path()) };
        assert!(put_with_retry(&store, "a/b.json", b"{}", 3, 1).await.is_err());
        assert_eq!(store.failures.get(), 2);
    }
}
