pub mod channels;
pub mod detail;
pub mod epg;
pub mod fallback;
pub mod normalize;
pub mod profile;
pub mod reconcile;
pub mod structured;

use serde::{Deserialize, Serialize};

use crate::db::{EpgEntry, ProgramRecord};
use crate::html::Document;

/// One performer as known from a single extraction pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalentRef {
    pub identifier: String,
    pub display_name: String,
    pub source_link: Option<String>,
    pub role_label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `ul.addition`
    CastList,
    /// `ul.talent_panel`
    TalentPanel,
    /// every `/talents/` link on the page
    WholeDocument,
    /// `【出演】` section of the long description
    DescriptionText,
}

impl Strategy {
    pub fn container(self) -> Option<(&'static str, &'static str)> {
        match self {
            Strategy::CastList => Some(("ul", "addition")),
            Strategy::TalentPanel => Some(("ul", "talent_panel")),
            Strategy::WholeDocument | Strategy::DescriptionText => None,
        }
    }
}

/// Named, ordered strategy lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Markup only.
    Fixed,
    /// Markup, then the description text for names the markup missed.
    #[default]
    Improved,
}

impl Profile {
    pub fn strategies(self) -> &'static [Strategy] {
        match self {
            Profile::Fixed => &[Strategy::CastList, Strategy::TalentPanel, Strategy::WholeDocument],
            Profile::Improved => &[
                Strategy::CastList,
                Strategy::TalentPanel,
                Strategy::WholeDocument,
                Strategy::DescriptionText,
            ],
        }
    }
}

/// Result of cast extraction. `NotFound` is a valid outcome, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(Vec<TalentRef>),
    NotFound,
}

impl Extraction {
    pub fn from_refs(refs: Vec<TalentRef>) -> Self {
        if refs.is_empty() {
            Extraction::NotFound
        } else {
            Extraction::Found(refs)
        }
    }

    pub fn into_refs(self) -> Vec<TalentRef> {
        match self {
            Extraction::Found(refs) => refs,
            Extraction::NotFound => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Extraction::Found(refs) => refs.len(),
            Extraction::NotFound => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Extraction::NotFound)
    }
}

#[derive(Debug)]
pub struct ExtractReport {
    pub outcome: Extraction,
    pub from_markup: usize,
    pub from_text: usize,
    pub rejected: usize,
}

/// Markup strategies first; the description text is consulted only when the
/// profile lists it and either markup found nobody or the text has a cast section.
pub fn extract_performers(
    doc: &Document,
    description_detail: &str,
    profile: Profile,
    origin: &str,
) -> ExtractReport {
    let strategies = profile.strategies();
    let markup = structured::extract_structured(doc, strategies, origin);
    let from_markup = markup.refs.len();

    let use_text = strategies.contains(&Strategy::DescriptionText)
        && (markup.refs.is_empty() || fallback::has_cast_marker(description_detail));
    let text = if use_text {
        fallback::extract_from_text(description_detail)
    } else {
        Vec::new()
    };

    let merged = reconcile::reconcile(markup.refs, text);
    ExtractReport {
        from_text: merged.len() - from_markup.min(merged.len()),
        from_markup,
        rejected: markup.rejected,
        outcome: Extraction::from_refs(merged),
    }
}

pub struct DetailData {
    pub record: ProgramRecord,
    pub report: ExtractReport,
}

/// Detail page → program record with its reconciled cast.
pub fn process_detail(html: &str, entry: &EpgEntry, profile: Profile, origin: &str) -> DetailData {
    let doc = Document::parse(html);
    let mut record = detail::parse_detail(&doc, entry);
    let report = extract_performers(&doc, &record.description_detail, profile, origin);
    record.performers = report.outcome.clone().into_refs();
    DetailData { record, report }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::reconcile::placeholder_id;

    const ORIGIN: &str = "https://bangumi.org";

    fn load(fixture: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", fixture)).unwrap()
    }

    fn entry(event_id: &str) -> EpgEntry {
        EpgEntry {
            event_id: event_id.to_string(),
            broadcast_date: "2025-07-13".to_string(),
            channel: "1 NHK総合1..".to_string(),
            start_time: "202507130900".to_string(),
            end_time: "202507131020".to_string(),
            program_title: "日曜討論　投開票まで1週間".to_string(),
            program_detail: String::new(),
            link: format!("{}/tv_events/{}", ORIGIN, event_id),
            region: "東京".to_string(),
            channel_code: Some("NHKG-TKY".to_string()),
        }
    }

    #[test]
    fn improved_profile_adds_text_only_names() {
        let html = load("detail_addition");
        let data = process_detail(&html, &entry("AkZgQAVzwAM"), Profile::Improved, ORIGIN);
        let names: Vec<&str> =
            data.record.performers.iter().map(|t| t.display_name.as_str()).collect();
        assert_eq!(names, vec!["小川淳也", "西田実仁", "榛葉賀津也", "小池晃", "山下毅", "森山裕"]);
        assert_eq!(data.report.from_markup, 5);
        assert_eq!(data.report.from_text, 1);
        assert_eq!(data.report.rejected, 2);

        let moriyama = data.record.performers.last().unwrap();
        assert_eq!(moriyama.identifier, placeholder_id("森山裕"));
        assert_eq!(moriyama.role_label.as_deref(), Some("自由民主党幹事長"));
    }

    #[test]
    fn fixed_profile_ignores_text() {
        let html = load("detail_addition");
        let data = process_detail(&html, &entry("AkZgQAVzwAM"), Profile::Fixed, ORIGIN);
        assert_eq!(data.record.performers.len(), 5);
        assert!(data.record.performers.iter().all(|t| t.source_link.is_some()));
    }

    #[test]
    fn empty_everywhere_is_not_found() {
        let html = "<html><head><meta name=\"description\" content=\"x\"></head>\
                    <body><p class=\"letter_body\">【司会】アナ・佐藤一郎</p></body></html>";
        let data = process_detail(html, &entry("E1"), Profile::Improved, ORIGIN);
        assert_eq!(data.report.outcome, Extraction::NotFound);
        assert!(data.record.performers.is_empty());
    }

    #[test]
    fn text_only_when_markup_empty() {
        let html = "<html><body><p class=\"letter_body\">【出演】歌手・山田花子、俳優・田中一郎</p></body></html>";
        let data = process_detail(html, &entry("E2"), Profile::Improved, ORIGIN);
        assert_eq!(data.report.outcome.len(), 2);
        assert!(data.record.performers.iter().all(|t| t.source_link.is_none()));
    }
}
