use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::debug;

use super::channels::find_channel_code;
use super::normalize::last_segment;
use crate::db::EpgEntry;
use crate::html::{self, Document};

pub const REGION: &str = "東京";
pub const UNKNOWN_CHANNEL: &str = "不明";
const TERRESTRIAL_GROUP: &str = "42";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcast {
    Terrestrial,
    Satellite,
}

impl Broadcast {
    pub const ALL: [Broadcast; 2] = [Broadcast::Terrestrial, Broadcast::Satellite];

    fn path(self) -> &'static str {
        match self {
            Broadcast::Terrestrial => "td",
            Broadcast::Satellite => "bs",
        }
    }
}

pub fn listing_url(origin: &str, kind: Broadcast, date: NaiveDate) -> String {
    let mut url = format!(
        "{}/epg/{}?broad_cast_date={}",
        origin.trim_end_matches('/'),
        kind.path(),
        date.format("%Y%m%d")
    );
    if kind == Broadcast::Terrestrial {
        url.push_str("&ggm_group_id=");
        url.push_str(TERRESTRIAL_GROUP);
    }
    url
}

/// Parse one listing page. Columns are matched to channel headers by index;
/// event ids already in `seen` are skipped and new ones are added to it.
pub fn parse_listing(
    html_text: &str,
    date: NaiveDate,
    origin: &str,
    seen: &mut HashSet<String>,
) -> Vec<EpgEntry> {
    let doc = Document::parse(html_text);
    let channel_names: Vec<String> = doc
        .find_by_tag_class("li", "js_channel topmost")
        .into_iter()
        .map(html::raw_text)
        .collect();

    let columns = html::find_by_attr(doc.root(), "ul", "id", |id| id.starts_with("program_line_"));
    debug!("{} channels, {} program columns", channel_names.len(), columns.len());

    let broadcast_date = date.format("%Y-%m-%d").to_string();
    let mut entries = Vec::new();

    for (i, column) in columns.into_iter().enumerate() {
        let channel = channel_names
            .get(i)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_CHANNEL.to_string());
        let channel_code = find_channel_code(&channel).map(str::to_string);

        for item in html::select(column, "li") {
            let Some(anchor) = html::select(item, "a.title_link").into_iter().next() else {
                continue;
            };
            let href = html::attr(anchor, "href").unwrap_or_default();
            let event_id = last_segment(href);
            if event_id.is_empty() || !seen.insert(event_id.to_string()) {
                continue;
            }

            let text_of = |css: &str| {
                html::select(anchor, css)
                    .into_iter()
                    .next()
                    .map(html::raw_text)
                    .unwrap_or_default()
            };
            let time_of =
                |name: &str| html::attr(item, name).unwrap_or_default().trim().to_string();

            entries.push(EpgEntry {
                event_id: event_id.to_string(),
                broadcast_date: broadcast_date.clone(),
                channel: channel.clone(),
                start_time: time_of("s"),
                end_time: time_of("e"),
                program_title: text_of("p.program_title"),
                program_detail: text_of("p.program_detail"),
                link: absolute(origin, href),
                region: REGION.to_string(),
                channel_code: channel_code.clone(),
            });
        }
    }

    entries
}

fn absolute(origin: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}{}", origin.trim_end_matches('/'), href)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://bangumi.org";

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 13).unwrap()
    }

    fn load() -> String {
        std::fs::read_to_string("tests/fixtures/epg_td.html").unwrap()
    }

    #[test]
    fn listing_urls() {
        assert_eq!(
            listing_url(ORIGIN, Broadcast::Terrestrial, date()),
            "https://bangumi.org/epg/td?broad_cast_date=20250713&ggm_group_id=42"
        );
        assert_eq!(
            listing_url("https://bangumi.org/", Broadcast::Satellite, date()),
            "https://bangumi.org/epg/bs?broad_cast_date=20250713"
        );
    }

    #[test]
    fn parses_columns_by_header_index() {
        let mut seen = HashSet::new();
        let entries = parse_listing(&load(), date(), ORIGIN, &mut seen);
        let ids: Vec<&str> = entries.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["AkZgQAVzwAM", "AkZgQAVzwBB", "CeXsAAA01", "ZzUnknown1"]);

        let first = &entries[0];
        assert_eq!(first.broadcast_date, "2025-07-13");
        assert_eq!(first.channel, "1 NHK総合1..");
        assert_eq!(first.channel_code.as_deref(), Some("NHKG-TKY"));
        assert_eq!(first.start_time, "202507130900");
        assert_eq!(first.end_time, "202507131020");
        assert_eq!(first.program_title, "日曜討論　投開票まで1週間");
        assert_eq!(first.program_detail, "各党幹事長が討論");
        assert_eq!(first.link, "https://bangumi.org/tv_events/AkZgQAVzwAM?overwrite_area=42");
        assert_eq!(first.region, REGION);

        let tbs = &entries[2];
        assert_eq!(tbs.channel_code.as_deref(), Some("TBS-TKY"));
        assert_eq!(tbs.program_detail, "");
    }

    #[test]
    fn column_without_header_is_unknown() {
        let mut seen = HashSet::new();
        let entries = parse_listing(&load(), date(), ORIGIN, &mut seen);
        let last = entries.last().unwrap();
        assert_eq!(last.channel, UNKNOWN_CHANNEL);
        assert!(last.channel_code.is_none());
    }

    #[test]
    fn duplicates_across_listings_dropped() {
        let mut seen = HashSet::new();
        let first = parse_listing(&load(), date(), ORIGIN, &mut seen);
        let again = parse_listing(&load(), date(), ORIGIN, &mut seen);
        assert_eq!(first.len(), 4);
        assert!(again.is_empty());
    }

    #[test]
    fn empty_page_yields_nothing() {
        let mut seen = HashSet::new();
        assert!(parse_listing("<html><body></body></html>", date(), ORIGIN, &mut seen).is_empty());
    }
}
