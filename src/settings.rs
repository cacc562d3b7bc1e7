use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::parser::channels::DEFAULT_TARGETS;
use crate::parser::Profile;

const ENV_PREFIX: &str = "BANGUMI";

/// Runtime settings: defaults, then the optional config file, then
/// `BANGUMI_*` environment variables. List values in the environment are
/// comma separated.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub blob_root: PathBuf,
    pub webhook_url: Option<String>,
    pub site_origin: String,
    pub user_agent: String,
    pub target_channels: Vec<String>,
    /// Listing dates run from yesterday through today + `target_days`.
    pub target_days: i64,
    pub rotation_days: i64,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub request_timeout_secs: u64,
    pub max_upload_retries: u32,
    pub backoff_base_ms: u64,
    pub profile: Profile,
    /// Detail page URLs tried after the listing link. `{origin}` and
    /// `{event_id}` are substituted.
    pub detail_url_patterns: Vec<String>,
    pub days_back: i64,
    pub max_programs: usize,
    pub profile_limit: usize,
    pub profile_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: PathBuf::from("data/bangumi.sqlite"),
            blob_root: PathBuf::from("data/json-backups"),
            webhook_url: None,
            site_origin: "https://bangumi.org".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            target_channels: DEFAULT_TARGETS.iter().map(|c| c.to_string()).collect(),
            target_days: 2,
            rotation_days: 120,
            delay_min_ms: 1500,
            delay_max_ms: 2500,
            request_timeout_secs: 30,
            max_upload_retries: 3,
            backoff_base_ms: 1000,
            profile: Profile::Improved,
            detail_url_patterns: vec![
                "{origin}/tv_events/seasons?season_id={event_id}&from=x".to_string(),
                "{origin}/tv_events/{event_id}".to_string(),
            ],
            days_back: 7,
            max_programs: 5000,
            profile_limit: 50,
            profile_delay_ms: 1500,
        }
    }
}

impl Settings {
    pub fn load(file: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("target_channels")
                    .with_list_parse_key("detail_url_patterns"),
            )
            .build()
            .context("reading settings")?;
        let settings: Settings = settings.try_deserialize().context("invalid settings")?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        anyhow::ensure!(
            self.delay_min_ms <= self.delay_max_ms,
            "delay_min_ms ({}) exceeds delay_max_ms ({})",
            self.delay_min_ms,
            self.delay_max_ms
        );
        anyhow::ensure!(self.max_upload_retries > 0, "max_upload_retries must be at least 1");
        anyhow::ensure!(
            self.detail_url_patterns.iter().all(|p| p.contains("{event_id}")),
            "every detail_url_pattern needs an {{event_id}} placeholder"
        );
        Ok(())
    }

    pub fn is_target(&self, channel_code: Option<&str>) -> bool {
        channel_code.is_some_and(|c| self.target_channels.iter().any(|t| t == c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        s.check().unwrap();
        assert_eq!(s.target_channels.len(), 14);
        assert_eq!(s.profile, Profile::Improved);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let s = Settings::load("does-not-exist/bangumi").unwrap();
        assert_eq!(s.site_origin, "https://bangumi.org");
        assert_eq!(s.rotation_days, 120);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bangumi.toml");
        std::fs::write(
            &path,
            "profile = \"fixed\"\ntarget_channels = [\"NHKG-TKY\"]\ndelay_min_ms = 0\ndelay_max_ms = 0\n",
        )
        .unwrap();
        let s = Settings::load(path.to_str().unwrap()).unwrap();
        assert_eq!(s.profile, Profile::Fixed);
        assert_eq!(s.target_channels, vec!["NHKG-TKY"]);
        assert_eq!(s.delay_max_ms, 0);
        assert_eq!(s.max_programs, 5000);
    }

    #[test]
    fn rejects_inverted_delay() {
        let s = Settings { delay_min_ms: 10, delay_max_ms: 1, ..Settings::default() };
        assert!(s.check().is_err());
    }

    #[test]
    fn target_filter() {
        let s = Settings::default();
        assert!(s.is_target(Some("BS11")));
        assert!(!s.is_target(Some("TOKYO-MX")));
        assert!(!s.is_target(None));
    }
}
