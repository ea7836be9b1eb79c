//! Mapping between logical keys and backend object paths.
//!
//! Backend paths are `prefix/key`. Prefix matching everywhere in coffer is a literal
//! string test against the stored path, so `"abc123"` is under the prefix `"abc"`.

/// Separator used in backend paths.
pub const SEPARATOR: char = '/';

/// Join two path fragments with a single separator, collapsing separator runs.
///
/// An empty side yields the other side unchanged.
pub fn consistent_join(left: &str, right: &str) -> String {
    if left.is_empty() {
        return right.to_string();
    }
    if right.is_empty() {
        return left.to_string();
    }
    collapse_separators(&format!("{}{}{}", left, SEPARATOR, right))
}

fn collapse_separators(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut previous = None;
    for c in path.chars() {
        if c == SEPARATOR && previous == Some(SEPARATOR) {
            continue;
        }
        out.push(c);
        previous = Some(c);
    }
    out
}

/// The part of `key` that follows `remote`, without a leading separator.
///
/// This is a literal strip, matching the literal prefix semantics of listing.
pub fn relative_key<'a>(remote: &str, key: &'a str) -> &'a str {
    let rest = key.strip_prefix(remote).unwrap_or(key);
    rest.strip_prefix(SEPARATOR).unwrap_or(rest)
}

/// Key codec for a bucket prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    /// Create a codec. Trailing separators on the prefix are dropped.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = collapse_separators(&prefix.into());
        let prefix = prefix.trim_end_matches(SEPARATOR).to_string();
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Backend path for a logical key. The empty key maps to the bare prefix.
    pub fn normalize(&self, key: &str) -> String {
        if key.is_empty() {
            return self.prefix.clone();
        }
        consistent_join(&self.prefix, key)
    }

    /// Logical key for a backend path. Paths outside the prefix come back unchanged.
    pub fn denormalize<'a>(&self, path: &'a str) -> &'a str {
        if self.prefix.is_empty() || path.len() <= self.prefix.len() + 1 {
            return path;
        }
        path.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .unwrap_or(path)
    }

    /// Backend listing query for a logical prefix.
    ///
    /// A non-empty prefix is matched literally against `normalize(prefix)`. The empty prefix
    /// selects the whole namespace of this bucket: everything when the bucket has no prefix,
    /// otherwise everything below `prefix/`.
    pub fn list_query(&self, prefix: &str) -> Option<String> {
        if !prefix.is_empty() {
            return Some(self.normalize(prefix));
        }
        if self.prefix.is_empty() {
            None
        } else {
            Some(format!("{}{}", self.prefix, SEPARATOR))
        }
    }
}
