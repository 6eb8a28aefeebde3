//! File tags.

use std::collections::BTreeSet;

/// Maximum tag length in characters.
pub const MAX_TAG_LEN: usize = 64;

/// Maximum number of tags on a single file.
pub const MAX_TAGS_PER_FILE: usize = 32;

/// Trim and validate a single tag.
pub fn normalize_tag(raw: &str) -> crate::Result<String> {
    let tag = raw.trim();
    if tag.is_empty() {
        return Err(crate::Error::InvalidTag("tag cannot be empty".to_string()));
    }
    if tag.chars().count() > MAX_TAG_LEN {
        return Err(crate::Error::InvalidTag(format!(
            "tag exceeds {MAX_TAG_LEN} characters"
        )));
    }
    if tag.chars().any(|c| c.is_control() || c == ',') {
        return Err(crate::Error::InvalidTag(format!(
            "tag contains forbidden characters: {tag:?}"
        )));
    }
    Ok(tag.to_string())
}

/// Normalize a list of tags into a sorted set.
///
/// Entries may themselves be comma separated (`"a, b"`), matching how tags
/// arrive from form fields.
pub fn normalize_tags<S: AsRef<str>>(raw: &[S]) -> crate::Result<BTreeSet<String>> {
    let mut tags = BTreeSet::new();
    for entry in raw {
        for part in entry.as_ref().split(',') {
            if part.trim().is_empty() {
                continue;
            }
            tags.insert(normalize_tag(part)?);
        }
    }
    if tags.len() > MAX_TAGS_PER_FILE {
        return Err(crate::Error::InvalidTag(format!(
            "at most {MAX_TAGS_PER_FILE} tags per file"
        )));
    }
    Ok(tags)
}
