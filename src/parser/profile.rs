use std::sync::LazyLock;

use regex::Regex;
use scraper::ElementRef;

use crate::db::TalentProfile;
use crate::html::{self, Document};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"名前：\s*(.+?)（(.+?)）").unwrap());
static BIRTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})年(\d{1,2})月(\d{1,2})日").unwrap());
static ZODIAC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(おひつじ座|おうし座|ふたご座|かに座|しし座|おとめ座|てんびん座|さそり座|いて座|やぎ座|みずがめ座|うお座)")
        .unwrap()
});
static BLOOD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(AB|A|B|O)型").unwrap());
static HEIGHT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)cm").unwrap());

const BIRTHPLACE_SUFFIX: &str = "出身";

/// Profession tags derived from the genre list.
const GENRE_TAGS: &[(&str, &str)] = &[
    ("女優", "actress"),
    ("俳優", "actor"),
    ("タレント", "talent"),
    ("歌手", "singer"),
    ("声優", "voice_actor"),
    ("アナウンサー", "announcer"),
    ("NHKアナウンサー", "nhk_announcer"),
    ("政治家", "politician"),
    ("お笑い芸人", "comedian"),
    ("モデル", "model"),
];

pub fn genre_tag(genre: &str) -> Option<&'static str> {
    GENRE_TAGS.iter().find(|(g, _)| *g == genre).map(|(_, tag)| *tag)
}

/// Parse a talent page into a profile. Fields that are absent stay `None`/empty.
pub fn parse_profile(html_text: &str, talent_id: &str, source_url: &str) -> TalentProfile {
    let doc = Document::parse(html_text);
    let mut p = TalentProfile {
        talent_id: talent_id.to_string(),
        source_url: source_url.to_string(),
        ..Default::default()
    };

    if let Some(li) = labelled(&doc, "li", "名前：") {
        if let Some(caps) = NAME_RE.captures(&html::raw_text(li)) {
            p.full_name = Some(caps[1].trim().to_string());
            p.reading = Some(caps[2].trim().to_string());
        }
    }

    let info = labelled(&doc, "li", "情報：").or_else(|| {
        labelled(&doc, "span", "情報：").and_then(|s| s.parent().and_then(ElementRef::wrap))
    });
    if let Some(info) = info {
        parse_info(&html::raw_text(info), &mut p);
    }

    p.profile_image_url = doc
        .find_by_tag_class("img", "talent_img")
        .into_iter()
        .next()
        .and_then(|img| html::attr(img, "src"))
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    p.genres = section(&doc, "ジャンル").map(|t| split_words(&t)).unwrap_or_default();
    p.skills = section(&doc, "特技").map(|t| split_words(&t)).unwrap_or_default();
    p.hobbies = section(&doc, "趣味").map(|t| split_words(&t)).unwrap_or_default();
    p.career_history = section(&doc, "芸歴").filter(|t| !t.is_empty());

    p.tags = p.genres.iter().filter_map(|g| genre_tag(g)).map(str::to_string).collect();
    p.completeness = completeness(&p);
    p
}

fn parse_info(text: &str, p: &mut TalentProfile) {
    if let Some(c) = BIRTH_RE.captures(text) {
        p.birth_date = Some(format!("{}-{:0>2}-{:0>2}", &c[1], &c[2], &c[3]));
    }
    if let Some(c) = ZODIAC_RE.captures(text) {
        p.zodiac_sign = Some(c[1].to_string());
    }
    if let Some(c) = BLOOD_RE.captures(text) {
        p.blood_type = Some(format!("{}型", &c[1]));
    }
    if let Some(c) = HEIGHT_RE.captures(text) {
        p.height_cm = c[1].parse().ok();
    }
    p.birthplace = text
        .split_whitespace()
        .find_map(|token| token.strip_suffix(BIRTHPLACE_SUFFIX))
        .map(|place| place.trim_start_matches("情報：").to_string())
        .filter(|place| !place.is_empty());
}

fn labelled<'a>(doc: &'a Document, tag: &str, label: &str) -> Option<ElementRef<'a>> {
    doc.select(tag).into_iter().find(|el| html::raw_text(*el).contains(label))
}

/// `p#<id>`, or the first `p` after a `<span>id：</span>` label.
fn section(doc: &Document, id: &str) -> Option<String> {
    if let Some(p) = doc.select_first(&format!("p[id=\"{}\"]", id)) {
        return Some(html::raw_text(p));
    }
    let label = labelled(doc, "span", &format!("{}：", id))?;
    label
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "p")
        .map(html::raw_text)
}

fn split_words(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// Weighted share of filled fields, out of 10, capped at 1.0.
pub fn completeness(p: &TalentProfile) -> f64 {
    let mut score = 0.0;
    if p.full_name.is_some() {
        score += 1.0;
    }
    if p.reading.is_some() {
        score += 0.5;
    }
    if p.birth_date.is_some() {
        score += 1.5;
    }
    if p.birthplace.is_some() {
        score += 1.0;
    }
    if p.profile_image_url.is_some() {
        score += 0.5;
    }
    if !p.genres.is_empty() {
        score += 2.0;
    }
    if !p.skills.is_empty() {
        score += 1.0;
    }
    if !p.hobbies.is_empty() {
        score += 1.0;
    }
    if p.career_history.is_some() {
        score += 1.5;
    }
    f64::min(1.0, score / 10.0)
}
