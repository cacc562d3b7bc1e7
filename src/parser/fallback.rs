/// Section heading that opens the cast list in program descriptions.
pub const CAST_MARKER: &str = "【出演】";
const SECTION_OPEN: char = '【';
const ENTRY_SEP: char = '、';
const ROLE_SEP: char = '・';

/// A `role・name` pair read from free text. Never carries an identifier or link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextCandidate {
    pub role_label: Option<String>,
    pub name: String,
}

/// Text between the cast marker and the next `【…】` heading (or end of text).
pub fn cast_segment(text: &str) -> Option<&str> {
    let start = text.find(CAST_MARKER)? + CAST_MARKER.len();
    let rest = &text[start..];
    let end = rest.find(SECTION_OPEN).unwrap_or(rest.len());
    Some(&rest[..end])
}

pub fn has_cast_marker(text: &str) -> bool {
    text.contains(CAST_MARKER)
}

/// Read `role・name` entries from the cast section of a description.
///
/// Entries are separated by `、`; only the first `・` in an entry splits role
/// from name, and entries without one are dropped.
pub fn extract_from_text(text: &str) -> Vec<TextCandidate> {
    let Some(segment) = cast_segment(text) else {
        return Vec::new();
    };

    segment
        .split(ENTRY_SEP)
        .filter_map(|entry| {
            let (role, name) = entry.split_once(ROLE_SEP)?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let role = role.trim();
            Some(TextCandidate {
                role_label: (!role.is_empty()).then(|| role.to_string()),
                name: name.to_string(),
            })
        })
        .collect()
}
