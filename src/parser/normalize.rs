use super::TalentRef;

/// Path segment of the talent collection page (`/talents/`), not a person.
const LISTING_SEGMENT: &str = "talents";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    EmptyName,
    ShortName,
    EmptyHref,
    ListingLink,
    NonNumericId,
}

/// Trimmed display name, or the reason it is unusable.
/// Needs at least two visible characters so stray punctuation never passes.
pub fn clean_name(raw: &str) -> Result<String, Rejection> {
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(Rejection::EmptyName);
    }
    let visible = name.chars().filter(|c| !c.is_whitespace() && !c.is_control()).count();
    if visible < 2 {
        return Err(Rejection::ShortName);
    }
    Ok(name)
}

/// Final path segment of an href: query, fragment and trailing slashes removed.
pub fn last_segment(href: &str) -> &str {
    let path = href.split(['?', '#']).next().unwrap_or_default();
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

/// Validate a `(name, href)` pair from structured markup into a [`TalentRef`].
/// `raw_href` may also be a bare identifier.
pub fn normalize(raw_name: &str, raw_href: &str, origin: &str) -> Result<TalentRef, Rejection> {
    let display_name = clean_name(raw_name)?;

    let href = raw_href.trim();
    if href.is_empty() {
        return Err(Rejection::EmptyHref);
    }

    let id = last_segment(href);
    if id == LISTING_SEGMENT {
        return Err(Rejection::ListingLink);
    }
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(Rejection::NonNumericId);
    }

    let source_link = if href.starts_with('/') {
        format!("{}{}", origin.trim_end_matches('/'), href)
    } else if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if !href.contains('/') {
        format!("{}/{}/{}", origin.trim_end_matches('/'), LISTING_SEGMENT, id)
    } else {
        format!("{}/{}", origin.trim_end_matches('/'), href)
    };

    Ok(TalentRef {
        identifier: id.to_string(),
        display_name,
        source_link: Some(source_link),
        role_label: None,
    })
}
