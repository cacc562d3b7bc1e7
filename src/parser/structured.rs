use scraper::ElementRef;
use tracing::debug;

use super::normalize::normalize;
use super::{Strategy, TalentRef};
use crate::html::{self, Document};

const TALENT_PATH: &str = "/talents/";

/// Accepted candidates in strategy order, plus how many links were rejected.
#[derive(Debug, Default)]
pub struct StructuredOutcome {
    pub refs: Vec<TalentRef>,
    pub rejected: usize,
}

/// Run the markup strategies listed in `strategies` in their fixed priority:
/// cast list, then talent panel (both accumulated), then the whole-document
/// scan only when neither container produced anything.
pub fn extract_structured(
    doc: &Document,
    strategies: &[Strategy],
    origin: &str,
) -> StructuredOutcome {
    let mut out = StructuredOutcome::default();
    let mut scanned = Vec::new();

    for strategy in [Strategy::CastList, Strategy::TalentPanel] {
        if !strategies.contains(&strategy) {
            continue;
        }
        let Some((tag, class)) = strategy.container() else {
            continue;
        };
        for container in doc.find_by_tag_class(tag, class) {
            collect(container, &[], origin, &mut out);
            scanned.push(container);
        }
        debug!("{:?}: {} accepted so far", strategy, out.refs.len());
    }

    if out.refs.is_empty() && strategies.contains(&Strategy::WholeDocument) {
        // links inside containers were already judged above
        collect(doc.root(), &scanned, origin, &mut out);
        debug!("WholeDocument: {} accepted", out.refs.len());
    }

    out
}

fn collect<'a>(
    scope: ElementRef<'a>,
    skip: &[ElementRef<'a>],
    origin: &str,
    out: &mut StructuredOutcome,
) {
    for link in html::find_links(scope, |h| h.contains(TALENT_PATH)) {
        if link.ancestors().filter_map(ElementRef::wrap).any(|a| skip.contains(&a)) {
            continue;
        }
        let href = html::attr(link, "href").unwrap_or_default();
        match normalize(&html::visible_text(link), href, origin) {
            // same person linked twice (cast list + panel): first wins
            Ok(t) if out.refs.iter().any(|r| r.display_name == t.display_name) => {}
            Ok(t) => out.refs.push(t),
            Err(reason) => {
                debug!("rejected {:?} ({:?})", href, reason);
                out.rejected += 1;
            }
        }
    }
}

/// What the known cast containers look like on a page, for `probe`.
#[derive(Debug)]
pub struct MarkupReport {
    pub has_cast_list: bool,
    pub has_talent_panel: bool,
    pub talent_links: usize,
}

pub fn diagnose(doc: &Document) -> MarkupReport {
    let has = |s: Strategy| {
        s.container()
            .map(|(tag, class)| !doc.find_by_tag_class(tag, class).is_empty())
            .unwrap_or(false)
    };
    MarkupReport {
        has_cast_list: has(Strategy::CastList),
        has_talent_panel: has(Strategy::TalentPanel),
        talent_links: html::find_links(doc.root(), |h| h.contains(TALENT_PATH)).len(),
    }
}
