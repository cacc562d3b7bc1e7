use scraper::{ElementRef, Html, Selector};
use tracing::debug;

/// Parsed page. Every query degrades to "no match" instead of failing.
pub struct Document {
    html: Html,
}

impl Document {
    pub fn parse(text: &str) -> Self {
        Document {
            html: Html::parse_document(text),
        }
    }

    pub fn root(&self) -> ElementRef<'_> {
        self.html.root_element()
    }

    /// All `tag.class` elements in document order. `class` may hold several
    /// space-separated class names, all of which must be present.
    pub fn find_by_tag_class(&self, tag: &str, class: &str) -> Vec<ElementRef<'_>> {
        let css = format!("{}.{}", tag, class.split_whitespace().collect::<Vec<_>>().join("."));
        select(self.root(), &css)
    }

    pub fn select(&self, css: &str) -> Vec<ElementRef<'_>> {
        select(self.root(), css)
    }

    pub fn select_first(&self, css: &str) -> Option<ElementRef<'_>> {
        select(self.root(), css).into_iter().next()
    }
}

/// Elements under `scope` matching a CSS selector. Invalid selectors match nothing.
pub fn select<'a>(scope: ElementRef<'a>, css: &str) -> Vec<ElementRef<'a>> {
    match Selector::parse(css) {
        Ok(sel) => scope.select(&sel).collect(),
        Err(e) => {
            debug!("bad selector {:?}: {:?}", css, e);
            Vec::new()
        }
    }
}

/// `<tag>` elements under `scope` whose `attr` value satisfies `pred`.
pub fn find_by_attr<'a, P>(
    scope: ElementRef<'a>,
    tag: &str,
    attr: &str,
    pred: P,
) -> Vec<ElementRef<'a>>
where
    P: Fn(&str) -> bool,
{
    select(scope, tag)
        .into_iter()
        .filter(|el| el.value().attr(attr).is_some_and(&pred))
        .collect()
}

/// Anchors under `scope` whose href satisfies `pred`.
pub fn find_links<'a, P>(scope: ElementRef<'a>, pred: P) -> Vec<ElementRef<'a>>
where
    P: Fn(&str) -> bool,
{
    find_by_attr(scope, "a", "href", pred)
}

/// Text of the subtree with runs of whitespace collapsed to one space.
pub fn visible_text(el: ElementRef) -> String {
    let raw: String = el.text().collect();
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text of the subtree, trimmed at both ends only.
pub fn raw_text(el: ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

pub fn attr<'a>(el: ElementRef<'a>, name: &str) -> Option<&'a str> {
    el.value().attr(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
        <ul class="addition"><li><a href="/talents/1">Ａ　Ｂ</a></li></ul>
        <ul class="talent_panel other"><li><a href="/talents/2">C</a></li></ul>
        <a href="/programs/9">x</a>
    </body></html>"#;

    #[test]
    fn tag_class_matches_multi_class() {
        let doc = Document::parse(PAGE);
        assert_eq!(doc.find_by_tag_class("ul", "addition").len(), 1);
        assert_eq!(doc.find_by_tag_class("ul", "talent_panel other").len(), 1);
        assert!(doc.find_by_tag_class("div", "addition").is_empty());
    }

    #[test]
    fn links_by_predicate() {
        let doc = Document::parse(PAGE);
        let links = find_links(doc.root(), |h| h.contains("/talents/"));
        assert_eq!(links.len(), 2);
        assert_eq!(attr(links[0], "href"), Some("/talents/1"));
    }

    #[test]
    fn text_collapses_whitespace() {
        let doc = Document::parse("<p> a \n  <b>b</b>\u{3000}c </p>");
        let p = doc.select_first("p").unwrap();
        assert_eq!(visible_text(p), "a b c");
    }

    #[test]
    fn raw_text_keeps_inner_spacing() {
        let doc = Document::parse("<p> 日曜討論\u{3000}特集 </p>");
        assert_eq!(raw_text(doc.select_first("p").unwrap()), "日曜討論\u{3000}特集");
    }

    #[test]
    fn invalid_selector_is_empty() {
        let doc = Document::parse(PAGE);
        assert!(doc.select("ul[[").is_empty());
    }
}
