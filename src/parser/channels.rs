use std::sync::LazyLock;

use regex::Regex;

static LEADING_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+\s*").unwrap());

/// Channel code → display names seen in the listing headers.
const CHANNEL_ALIASES: &[(&str, &[&str])] = &[
    // Tokyo terrestrial
    ("NHKG-TKY", &["NHK総合", "ＮＨＫ総合", "NHK総合 東京"]),
    ("NHKE-TKY", &["NHKEテレ", "ＮＨＫＥテレ", "NHKEテレ 東京"]),
    ("NTV-TKY", &["日テレ", "日本テレビ"]),
    ("TV-ASAHI-TKY", &["テレビ朝日", "テレ朝"]),
    ("TBS-TKY", &["TBS", "ＴＢＳ"]),
    ("TV-TOKYO-TKY", &["テレ東", "テレビ東京"]),
    ("FUJI-TV-TKY", &["フジテレビ", "フジ"]),
    ("TOKYO-MX", &["TOKYO MX", "ＴＯＫＹＯ　ＭＸ"]),
    // Kanto regional
    ("TVS", &["テレ玉"]),
    ("CTC", &["チバテレビ", "チバテレ"]),
    ("TVK", &["tvk"]),
    // free BS
    ("NHK-BS", &["ＮＨＫ　ＢＳ", "NHK BS"]),
    ("BS-NTV", &["BS日テレ", "ＢＳ日テレ"]),
    ("BS-ASAHI", &["BS朝日", "ＢＳ朝日"]),
    ("BS-TBS", &["BS-TBS", "ＢＳ－ＴＢＳ"]),
    ("BS-TV-TOKYO", &["ＢＳテレ東", "BSテレ東"]),
    ("BS-FUJI", &["BSフジ", "ＢＳフジ"]),
    ("BS11", &["BS11", "ＢＳ１１"]),
    ("BS12-TWELLV", &["BS12", "ＢＳ１２"]),
    ("BS-YOSHIMOTO", &["ＢＳよしもと"]),
    ("OUJ-TV-BS", &["放送大学"]),
    // pay BS
    ("WOWOW-PRIME-BS", &["WOWOWプライム", "WOWOWプ"]),
    ("WOWOW-LIVE-BS", &["WOWOWライブ"]),
    ("WOWOW-CINEMA-BS", &["WOWOWシネマ"]),
    ("WOWOW-PLUS-BS", &["WOWOWプラス"]),
    ("STAR-CH-BS", &["スターｃｈ"]),
    ("JSPORTS-1-BS", &["J SPORTS 1"]),
    ("JSPORTS-2-BS", &["J SPORTS 2"]),
    ("JSPORTS-3-BS", &["J SPORTS 3"]),
    ("JSPORTS-4-BS", &["J SPORTS 4"]),
    ("GREEN-CH-BS", &["グリーンチャンネル"]),
    ("ANIMAX-BS", &["BSアニマックス"]),
    ("TSURIVISION-BS", &["BS釣りビジョン"]),
    ("DISNEY-CH-BS", &["ディズニーch"]),
    ("NIHON-EIGA-BS", &["日本映画専門ch"]),
    ("JCOM-BS", &["J:COM"]),
];

/// Default detail-scrape targets: 7 terrestrial + 7 BS.
pub const DEFAULT_TARGETS: &[&str] = &[
    "NHKG-TKY", "NHKE-TKY", "NTV-TKY", "TV-ASAHI-TKY", "TBS-TKY", "TV-TOKYO-TKY", "FUJI-TV-TKY",
    "NHK-BS", "BS-NTV", "BS-ASAHI", "BS-TBS", "BS-TV-TOKYO", "BS-FUJI", "BS11",
];

/// Satellite codes either lead with `BS` or end in `-BS`; "TBS-TKY" is terrestrial.
pub fn is_bs(code: &str) -> bool {
    code.starts_with("BS") || code.ends_with("-BS")
}

fn exact(name: &str) -> Option<&'static str> {
    CHANNEL_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&name))
        .map(|(code, _)| *code)
}

/// Resolve a listing header to a channel code.
///
/// Exact alias match, then exact match with the leading channel number
/// removed ("7 ＢＳテレ東"), then substring match in either direction. For
/// substring matches, BS codes are preferred when the header says BS, and the
/// longest alias wins.
pub fn find_channel_code(channel_name: &str) -> Option<&'static str> {
    let name = channel_name.trim();
    if name.is_empty() {
        return None;
    }

    if let Some(code) = exact(name) {
        return Some(code);
    }

    let unnumbered = LEADING_NUMBER_RE.replace(name, "");
    if unnumbered != name {
        if let Some(code) = exact(&unnumbered) {
            return Some(code);
        }
    }

    let mut bs_matches: Vec<(&'static str, &'static str)> = Vec::new();
    let mut other_matches: Vec<(&'static str, &'static str)> = Vec::new();
    for (code, aliases) in CHANNEL_ALIASES {
        for alias in aliases.iter() {
            if name.contains(alias) || alias.contains(name) {
                if is_bs(code) {
                    bs_matches.push((code, alias));
                } else {
                    other_matches.push((code, alias));
                }
            }
        }
    }

    let longest = |m: &[(&'static str, &'static str)]| {
        m.iter()
            .max_by_key(|(_, alias)| alias.chars().count())
            .map(|(code, _)| *code)
    };

    if name.contains("BS") || name.contains("ＢＳ") {
        if let Some(code) = longest(&bs_matches) {
            return Some(code);
        }
    }
    if let Some(code) = longest(&other_matches) {
        return Some(code);
    }
    longest(&bs_matches)
}
