//! Topic names, topic filters and wildcard matching.

pub const LEVEL_SEPARATOR: char = '/';
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Returns true if `filter` matches the literal `topic`.
///
/// Segments are compared left to right. `+` consumes exactly one topic
/// segment; a trailing `#` consumes the rest of the topic, including nothing
/// at all (so `a/#` matches `a`). `filter` is assumed to have passed
/// [`is_valid_filter`].
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A filter is valid when it is non-empty, `#` only appears as the whole last
/// level and `+` only as a whole level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }

    let mut levels = filter.split(LEVEL_SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != MULTI_LEVEL_WILDCARD || levels.peek().is_some()) {
            return false;
        }
        if level.contains('+') && level != SINGLE_LEVEL_WILDCARD {
            return false;
        }
    }
    true
}

/// Topic names used in PUBLISH must be non-empty and wildcard-free.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}
