use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

/// Error raised when parsing a filter string fails
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterParseError {
    #[error("empty element in filter list")]
    EmptyElement,
}

/// A glob pattern over index, type, field or permission names.
///
/// Supports two wildcards: `*` (zero or more characters) and `?` (exactly
/// one character). Comparison is by language containment: `a > b` holds iff
/// every name matched by `b` is also matched by `a` and the reverse does not
/// hold. Equality is by literal text.
#[derive(Debug, Clone, Eq)]
pub struct Pattern {
    text: String,
    chars: Vec<char>,
}

impl Pattern {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let chars = text.chars().collect();
        Self { text, chars }
    }

    /// The literal text this pattern was built from
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether this pattern contains any wildcard
    pub fn has_wildcards(&self) -> bool {
        self.chars.iter().any(|&c| c == '*' || c == '?')
    }

    /// Whether this pattern matches every name (`*` and equivalents)
    pub fn is_match_all(&self) -> bool {
        !self.chars.is_empty() && self.chars.iter().all(|&c| c == '*')
    }

    /// Return whether every name matched by `other` is also matched by `self`
    pub fn matches(&self, other: &Pattern) -> bool {
        contains(&self.chars, &other.chars)
    }

    /// Return whether this pattern matches the given literal name
    pub fn matches_str(&self, name: &str) -> bool {
        let name: Vec<char> = name.chars().collect();
        glob_match(&self.chars, &name)
    }

    /// Return whether at least one name is matched by both patterns
    pub fn intersects(&self, other: &Pattern) -> bool {
        intersects(&self.chars, &other.chars)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Hash for Pattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl PartialOrd for Pattern {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.text == other.text {
            return Some(Ordering::Equal);
        }

        match (self.matches(other), other.matches(self)) {
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            // Incomparable, or equal languages spelled differently
            _ => None,
        }
    }
}

/// Decide language containment: every name matched by `b` is matched by `a`.
///
/// Both sides are glob patterns, so this is not ordinary glob matching. The
/// recursion treats `b`'s wildcards as generators: a `*` in `b` can only be
/// covered by a `*` in `a` (or absorbed one character at a time by `?`), a
/// `?` in `b` only by a wildcard in `a`.
fn contains(a: &[char], b: &[char]) -> bool {
    let mut memo = vec![None; (a.len() + 1) * (b.len() + 1)];
    contains_at(a, b, 0, 0, &mut memo)
}

fn contains_at(a: &[char], b: &[char], i: usize, j: usize, memo: &mut [Option<bool>]) -> bool {
    if j == b.len() {
        return a[i..].iter().all(|&c| c == '*');
    }
    if i == a.len() {
        return false;
    }

    let key = i * (b.len() + 1) + j;
    if let Some(known) = memo[key] {
        return known;
    }

    let result = if a[i] == '*' {
        contains_at(a, b, i + 1, j, memo) || contains_at(a, b, i, j + 1, memo)
    } else if b[j] == '*' {
        // b generates names of any length here; without a star of its own,
        // a can only keep up by spending `?`s on both the empty and the
        // growing expansion
        a[i] == '?' && contains_at(a, b, i, j + 1, memo) && contains_at(a, b, i + 1, j, memo)
    } else if b[j] == '?' {
        a[i] == '?' && contains_at(a, b, i + 1, j + 1, memo)
    } else {
        (a[i] == '?' || a[i] == b[j]) && contains_at(a, b, i + 1, j + 1, memo)
    };

    memo[key] = Some(result);
    result
}

/// Decide whether the languages of two glob patterns overlap
fn intersects(a: &[char], b: &[char]) -> bool {
    let mut memo = vec![None; (a.len() + 1) * (b.len() + 1)];
    intersects_at(a, b, 0, 0, &mut memo)
}

fn intersects_at(a: &[char], b: &[char], i: usize, j: usize, memo: &mut [Option<bool>]) -> bool {
    if i == a.len() && j == b.len() {
        return true;
    }
    if i == a.len() {
        return b[j..].iter().all(|&c| c == '*');
    }
    if j == b.len() {
        return a[i..].iter().all(|&c| c == '*');
    }

    let key = i * (b.len() + 1) + j;
    if let Some(known) = memo[key] {
        return known;
    }

    let result = if a[i] == '*' {
        intersects_at(a, b, i + 1, j, memo) || intersects_at(a, b, i, j + 1, memo)
    } else if b[j] == '*' {
        intersects_at(a, b, i, j + 1, memo) || intersects_at(a, b, i + 1, j, memo)
    } else if a[i] == '?' || b[j] == '?' || a[i] == b[j] {
        intersects_at(a, b, i + 1, j + 1, memo)
    } else {
        false
    };

    memo[key] = Some(result);
    result
}

/// Ordinary glob match of a pattern against a literal name
fn glob_match(pattern: &[char], name: &[char]) -> bool {
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((sp, sn)) = star {
            p = sp + 1;
            n = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// One include pattern together with the excludes narrowing it
#[derive(Debug, Clone, PartialEq)]
pub struct FilterEntry {
    include: Pattern,
    excludes: Vec<Pattern>,
}

impl FilterEntry {
    pub fn new(include: Pattern) -> Self {
        Self {
            include,
            excludes: Vec::new(),
        }
    }

    pub fn include(&self) -> &Pattern {
        &self.include
    }

    pub fn excludes(&self) -> &[Pattern] {
        &self.excludes
    }
}

/// An ordered list of include patterns, each with its own excludes.
///
/// This is the typed form of the comma separated index/type lists the
/// Elasticsearch API uses in URLs (`logs-*,-logs-secret`). A pattern is
/// admitted iff some include contains it and none of that include's
/// excludes do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterString {
    entries: Vec<FilterEntry>,
    combined: Vec<Pattern>,
}

impl FilterString {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma separated filter list. A leading `-` marks an exclude
    /// for the preceding include, a leading `+` is an explicit include.
    pub fn from_string(s: &str) -> Result<Self, FilterParseError> {
        if s.trim().is_empty() {
            return Ok(Self::new());
        }

        let mut filter = Self::new();
        for element in s.split(',') {
            let element = element.trim();
            let (negated, text) = match element.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, element.strip_prefix('+').unwrap_or(element)),
            };

            if text.is_empty() {
                return Err(FilterParseError::EmptyElement);
            }

            if negated {
                filter.append_exclude(Pattern::new(text));
            } else {
                filter.append_include(Pattern::new(text));
            }
        }

        Ok(filter)
    }

    /// Parse a list of elements, each of which may carry a sign prefix
    pub fn from_list<S: AsRef<str>>(elements: &[S]) -> Result<Self, FilterParseError> {
        let joined = elements
            .iter()
            .map(|e| e.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        Self::from_string(&joined)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }

    pub fn first_include(&self) -> Option<&Pattern> {
        self.entries.first().map(|e| &e.include)
    }

    /// Includes that survived the last `combine()` call
    pub fn combined(&self) -> &[Pattern] {
        &self.combined
    }

    /// Append an include pattern; duplicates are collapsed
    pub fn append_include(&mut self, pattern: Pattern) {
        if !self.entries.iter().any(|e| e.include == pattern) {
            self.entries.push(FilterEntry::new(pattern));
        }
    }

    /// Append an exclude to the most recently appended include. An exclude
    /// with no preceding include implies a match-all include.
    pub fn append_exclude(&mut self, pattern: Pattern) {
        if self.entries.is_empty() {
            self.entries.push(FilterEntry::new(Pattern::new("*")));
        }

        if let Some(entry) = self.entries.last_mut() {
            if !entry.excludes.contains(&pattern) {
                entry.excludes.push(pattern);
            }
        }
    }

    /// Iterate over the effective include patterns
    pub fn iter_patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.entries.iter().map(|e| &e.include)
    }

    /// A single pattern summarizing this filter's includes, used when the
    /// filter stands in for a scope in permission checks
    pub fn base_pattern(&self) -> Option<Pattern> {
        match self.entries.len() {
            0 => None,
            1 => Some(self.entries[0].include.clone()),
            _ => Some(Pattern::new(
                self.entries
                    .iter()
                    .map(|e| e.include.text())
                    .collect::<Vec<_>>()
                    .join(","),
            )),
        }
    }

    /// Return whether the given pattern is admitted by this filter
    pub fn admits(&self, pattern: &Pattern) -> bool {
        self.entries.iter().any(|e| {
            e.include.matches(pattern) && !e.excludes.iter().any(|x| x.matches(pattern))
        })
    }

    /// Return whether every include of `other` is admitted by this filter.
    /// An empty filter selects everything and therefore matches anything.
    pub fn matches(&self, other: &FilterString) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        other.iter_patterns().all(|p| self.admits(p))
    }

    /// Intersect this filter with another one. For every pair of includes
    /// where one contains the other, the narrower include survives and
    /// inherits the excludes of both sides that still apply to it. A pair is
    /// void when an exclude of the wider side swallows the narrower include
    /// entirely. Returns false if nothing survives; the surviving includes
    /// are recorded in `combined()`.
    pub fn combine(&mut self, other: &FilterString) -> bool {
        let mut result: Vec<FilterEntry> = Vec::new();

        for se in &self.entries {
            for oe in &other.entries {
                let (narrow, wide) = if oe.include.matches(&se.include) {
                    (se, oe)
                } else if se.include.matches(&oe.include) {
                    (oe, se)
                } else {
                    continue;
                };

                if wide.excludes.iter().any(|x| x.matches(&narrow.include))
                    || narrow.excludes.iter().any(|x| x.matches(&narrow.include))
                {
                    continue;
                }

                let mut excludes = narrow.excludes.clone();
                for x in &wide.excludes {
                    if x.intersects(&narrow.include) && !excludes.contains(x) {
                        excludes.push(x.clone());
                    }
                }

                match result.iter_mut().find(|r| r.include == narrow.include) {
                    Some(existing) => {
                        for x in excludes {
                            if !existing.excludes.contains(&x) {
                                existing.excludes.push(x);
                            }
                        }
                    }
                    None => result.push(FilterEntry {
                        include: narrow.include.clone(),
                        excludes,
                    }),
                }
            }
        }

        if result.is_empty() {
            self.combined.clear();
            return false;
        }

        self.combined = result.iter().map(|e| e.include.clone()).collect();
        self.entries = result;
        true
    }
}

impl fmt::Display for FilterString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for entry in &self.entries {
            parts.push(entry.include.text().to_string());
            for exclude in &entry.excludes {
                parts.push(format!("-{}", exclude.text()));
            }
        }
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(s: &str) -> Pattern {
        Pattern::new(s)
    }

    #[test]
    fn test_pattern_matches_literal() {
        assert!(pat("logs-*").matches_str("logs-2016"));
        assert!(pat("logs-*").matches_str("logs-"));
        assert!(!pat("logs-*").matches_str("metrics-2016"));
        assert!(pat("logs-????").matches_str("logs-2016"));
        assert!(!pat("logs-????").matches_str("logs-16"));
        assert!(pat("*").matches_str(""));
    }

    #[test]
    fn test_pattern_containment() {
        assert!(pat("logs-*").matches(&pat("logs-2016")));
        assert!(pat("logs-*").matches(&pat("logs-2016-*")));
        assert!(!pat("logs-2016-*").matches(&pat("logs-*")));
        assert!(pat("*").matches(&pat("logs-*")));
        assert!(!pat("logs-?").matches(&pat("logs-*")));
        assert!(pat("logs-*").matches(&pat("logs-?")));
    }

    #[test]
    fn test_pattern_ordering() {
        assert!(pat("*") > pat("logs-*"));
        assert!(pat("logs-*") > pat("logs-2016"));
        assert!(pat("logs-*") < pat("*"));
        assert_eq!(
            pat("logs-*").partial_cmp(&pat("logs-*")),
            Some(Ordering::Equal)
        );
        // Disjoint patterns are incomparable
        assert_eq!(pat("logs-*").partial_cmp(&pat("metrics-*")), None);
        assert!(pat("*") >= pat("*"));
    }

    #[test]
    fn test_strict_containment_is_asymmetric() {
        let wide = pat("logs-*");
        let narrow = pat("logs-2016");
        assert!(wide > narrow);
        assert!(wide.matches(&narrow));
        assert!(!narrow.matches(&wide));
    }

    #[test]
    fn test_pattern_intersects() {
        assert!(pat("logs-*").intersects(&pat("*-2016")));
        assert!(pat("logs-*").intersects(&pat("logs-2016")));
        assert!(!pat("logs-*").intersects(&pat("metrics-*")));
        assert!(pat("*").intersects(&pat("anything")));
        assert!(!pat("a?c").intersects(&pat("ab")));
    }

    #[test]
    fn test_filter_string_parsing() {
        let filter = FilterString::from_string("logs-*,-logs-secret,metrics").unwrap();
        assert_eq!(filter.len(), 2);
        assert_eq!(filter.entries()[0].include().text(), "logs-*");
        assert_eq!(filter.entries()[0].excludes().len(), 1);
        assert_eq!(filter.to_string(), "logs-*,-logs-secret,metrics");

        assert!(FilterString::from_string("").unwrap().is_empty());
        assert_eq!(
            FilterString::from_string("a,,b"),
            Err(FilterParseError::EmptyElement)
        );
        assert_eq!(
            FilterString::from_string("a,-"),
            Err(FilterParseError::EmptyElement)
        );
    }

    #[test]
    fn test_filter_string_leading_exclude_implies_match_all() {
        let filter = FilterString::from_string("-logs-secret").unwrap();
        assert_eq!(filter.len(), 1);
        assert_eq!(filter.entries()[0].include().text(), "*");
        assert_eq!(filter.entries()[0].excludes()[0].text(), "logs-secret");
    }

    #[test]
    fn test_filter_string_collapses_duplicates() {
        let filter = FilterString::from_string("a,a,+a").unwrap();
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_filter_string_admits() {
        let filter = FilterString::from_string("logs-*,-logs-secret*").unwrap();
        assert!(filter.admits(&pat("logs-2016")));
        assert!(!filter.admits(&pat("logs-secret-2016")));
        assert!(!filter.admits(&pat("metrics")));
    }

    #[test]
    fn test_combine_narrower_request_wins() {
        let mut requested = FilterString::from_string("logs-2016").unwrap();
        let permitted = FilterString::from_string("logs-*").unwrap();
        assert!(requested.combine(&permitted));
        assert_eq!(requested.to_string(), "logs-2016");
        assert_eq!(requested.combined().len(), 1);
    }

    #[test]
    fn test_combine_narrower_grant_wins() {
        let mut requested = FilterString::from_string("*").unwrap();
        let permitted = FilterString::from_string("logs-*").unwrap();
        assert!(requested.combine(&permitted));
        assert_eq!(requested.to_string(), "logs-*");
    }

    #[test]
    fn test_combine_disjoint_is_empty() {
        let mut requested = FilterString::from_string("secrets").unwrap();
        let permitted = FilterString::from_string("logs-*").unwrap();
        assert!(!requested.combine(&permitted));
    }

    #[test]
    fn test_combine_inherits_applicable_excludes() {
        let mut requested = FilterString::from_string("logs-*").unwrap();
        let permitted = FilterString::from_string("*,-logs-secret*").unwrap();
        assert!(requested.combine(&permitted));
        assert_eq!(requested.to_string(), "logs-*,-logs-secret*");
    }

    #[test]
    fn test_combine_swallowed_include_is_void() {
        let mut requested = FilterString::from_string("logs-secret-2016").unwrap();
        let permitted = FilterString::from_string("logs-*,-logs-secret*").unwrap();
        assert!(!requested.combine(&permitted));
    }

    #[test]
    fn test_combine_result_admitted_by_both_sides() {
        let mut requested = FilterString::from_string("logs-*,metrics-*").unwrap();
        let original = requested.clone();
        let permitted = FilterString::from_string("logs-2016,metrics-*,-metrics-internal").unwrap();
        assert!(requested.combine(&permitted));

        for pattern in requested.combined() {
            assert!(original.admits(pattern), "{pattern} not admitted by request");
            assert!(permitted.admits(pattern), "{pattern} not admitted by grant");
        }
    }
}
