use std::collections::HashSet;

use sha2::{Digest, Sha256};

use super::fallback::TextCandidate;
use super::normalize::clean_name;
use super::TalentRef;

pub const PLACEHOLDER_PREFIX: &str = "extracted_";

/// Stable stand-in identifier for a name with no site ID.
/// Content hash of the trimmed name, so it survives process restarts.
pub fn placeholder_id(name: &str) -> String {
    let digest = Sha256::digest(name.trim().as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", PLACEHOLDER_PREFIX, hex)
}

pub fn is_placeholder(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}

/// Merge structured and free-text candidates into one list unique by name.
///
/// Structured entries come first in their given order and always win; text
/// entries are only appended for names not seen yet (exact match after trim).
pub fn reconcile(structured: Vec<TalentRef>, fallback: Vec<TextCandidate>) -> Vec<TalentRef> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged = Vec::with_capacity(structured.len() + fallback.len());

    for t in structured {
        if seen.insert(t.display_name.clone()) {
            merged.push(t);
        }
    }

    for c in fallback {
        let Ok(name) = clean_name(&c.name) else {
            continue;
        };
        if seen.contains(&name) {
            continue;
        }
        seen.insert(name.clone());
        merged.push(TalentRef {
            identifier: placeholder_id(&name),
            display_name: name,
            source_link: None,
            role_label: c.role_label,
        });
    }

    merged
}
