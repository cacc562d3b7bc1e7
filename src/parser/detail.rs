use crate::db::{EpgEntry, ProgramRecord};
use crate::html::{self, Document};

const IDEOGRAPHIC_SPACE: char = '\u{3000}';

/// Series name: the title up to its first ideographic space.
pub fn master_title(title: &str) -> &str {
    title.split(IDEOGRAPHIC_SPACE).next().unwrap_or(title)
}

/// Scalar fields of a detail page, joined with the listing entry it came from.
/// `performers` is left empty for the extractor to fill.
pub fn parse_detail(doc: &Document, entry: &EpgEntry) -> ProgramRecord {
    let description = doc
        .select_first("meta[name=\"description\"]")
        .and_then(|m| html::attr(m, "content"))
        .map(|c| c.trim().to_string())
        .unwrap_or_default();

    let description_detail = doc
        .find_by_tag_class("p", "letter_body")
        .into_iter()
        .next()
        .map(html::visible_text)
        .unwrap_or_default();

    let genre = doc
        .find_by_tag_class("p", "genre nomal")
        .into_iter()
        .next()
        .map(|g| html::raw_text(g).replace(IDEOGRAPHIC_SPACE, " "))
        .unwrap_or_default();

    let official_website = doc
        .select_first("ul.related_link a")
        .and_then(|a| html::attr(a, "href"))
        .map(|h| h.trim().to_string())
        .unwrap_or_default();

    let title = entry.program_title.trim();

    ProgramRecord {
        event_id: entry.event_id.clone(),
        broadcast_date: entry.broadcast_date.clone(),
        channel: entry.channel.clone(),
        start_time: entry.start_time.clone(),
        end_time: entry.end_time.clone(),
        master_title: master_title(title).to_string(),
        program_title: title.to_string(),
        description,
        description_detail,
        genre,
        official_website,
        channel_code: entry.channel_code.clone().unwrap_or_default(),
        performers: Vec::new(),
    }
}
