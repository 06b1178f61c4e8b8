use serde_json::{json, Value};

use crate::pattern::{FilterString, Pattern};

/// A `_source` filter: which source fields a request may retrieve.
///
/// Mirrors the shapes Elasticsearch 1.7 accepts, both as query string
/// parameters (`_source`, `_source_include`, `_source_exclude`) and as the
/// `_source` key of a search body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceFilter {
    pub includes: Vec<Pattern>,
    pub excludes: Vec<Pattern>,
    pub disabled: bool,
}

impl SourceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this filter neither disables nor restricts the source
    pub fn is_empty(&self) -> bool {
        !self.disabled && self.includes.is_empty() && self.excludes.is_empty()
    }

    /// Whether the client asked for no source at all
    pub fn discards_source(&self) -> bool {
        self.disabled || self.excludes.iter().any(|e| e.is_match_all())
    }

    /// Build from the `_source`, `_source_include` and `_source_exclude`
    /// query parameters
    pub fn from_query(
        source: Option<&str>,
        include: Option<&str>,
        exclude: Option<&str>,
    ) -> Self {
        let mut filter = Self::new();

        if let Some(source) = source {
            match source.trim() {
                "false" | "0" | "no" | "off" => filter.disabled = true,
                "true" | "1" | "yes" | "on" | "" => {}
                patterns => {
                    for element in patterns.split(',').filter(|e| !e.trim().is_empty()) {
                        filter.includes.push(Pattern::new(element.trim()));
                    }
                }
            }
        }

        if let Some(include) = include {
            for element in include.split(',').filter(|e| !e.trim().is_empty()) {
                filter.includes.push(Pattern::new(element.trim()));
            }
        }

        if let Some(exclude) = exclude {
            for element in exclude.split(',').filter(|e| !e.trim().is_empty()) {
                filter.excludes.push(Pattern::new(element.trim()));
            }
        }

        filter
    }

    /// Build from the `_source` key of a request body
    pub fn from_json(value: &Value) -> Self {
        let mut filter = Self::new();

        match value {
            Value::Null => {}
            Value::Bool(enabled) => filter.disabled = !enabled,
            Value::String(pattern) => filter.includes.push(Pattern::new(pattern.as_str())),
            Value::Array(patterns) => {
                for pattern in patterns.iter().filter_map(Value::as_str) {
                    filter.includes.push(Pattern::new(pattern));
                }
            }
            Value::Object(map) => {
                for key in ["include", "includes"] {
                    if let Some(patterns) = map.get(key) {
                        filter.includes.extend(json_patterns(patterns));
                    }
                }
                for key in ["exclude", "excludes"] {
                    if let Some(patterns) = map.get(key) {
                        filter.excludes.extend(json_patterns(patterns));
                    }
                }
            }
            _ => {}
        }

        filter
    }

    pub fn as_json(&self) -> Value {
        if self.disabled {
            return Value::Bool(false);
        }
        if self.is_empty() {
            return Value::Bool(true);
        }
        if self.excludes.is_empty() {
            return Value::Array(
                self.includes
                    .iter()
                    .map(|p| Value::String(p.text().to_string()))
                    .collect(),
            );
        }

        json!({
            "include": self.includes.iter().map(|p| p.text()).collect::<Vec<_>>(),
            "exclude": self.excludes.iter().map(|p| p.text()).collect::<Vec<_>>(),
        })
    }

    /// Query parameters expressing this filter
    pub fn as_query(&self) -> Vec<(String, String)> {
        if self.disabled {
            return vec![("_source".to_string(), "false".to_string())];
        }

        let mut params = Vec::new();
        if !self.includes.is_empty() {
            params.push(("_source_include".to_string(), join_patterns(&self.includes)));
        }
        if !self.excludes.is_empty() {
            params.push(("_source_exclude".to_string(), join_patterns(&self.excludes)));
        }
        params
    }

    /// Intersect with another source filter, the permitted one. Returns
    /// false when nothing the client requested remains.
    pub fn combine(&mut self, other: &SourceFilter) -> bool {
        let mut ours = self.to_filter_string();
        if !ours.combine(&other.to_filter_string()) {
            return false;
        }

        self.includes.clear();
        self.excludes.clear();
        for entry in ours.entries() {
            if !self.includes.contains(entry.include()) {
                self.includes.push(entry.include().clone());
            }
            for exclude in entry.excludes() {
                if !self.excludes.contains(exclude) {
                    self.excludes.push(exclude.clone());
                }
            }
        }

        drop_subtree_twins(&mut self.includes);
        drop_subtree_twins(&mut self.excludes);
        true
    }

    /// Source patterns select whole subtrees: `obj.secret` also covers
    /// `obj.secret.key`. The containment algebra works on plain globs, so
    /// every wildcard-free pattern gets a `<pattern>.*` twin for the
    /// intersection and is collapsed back afterwards.
    fn to_filter_string(&self) -> FilterString {
        let mut filter = FilterString::new();
        let match_all = [Pattern::new("*")];
        let includes: &[Pattern] = if self.includes.is_empty() {
            &match_all
        } else {
            &self.includes
        };

        for include in includes.iter().flat_map(with_subtree_twin) {
            filter.append_include(include);
            for exclude in self.excludes.iter().flat_map(with_subtree_twin) {
                filter.append_exclude(exclude);
            }
        }
        filter
    }
}

/// A stored-fields filter: the `fields` parameter of searches and lookups.
///
/// `_source` and `_source.<path>` elements are not stored fields; they flip
/// the `source` flag instead of landing in the list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldsFilter {
    fields: Vec<Pattern>,
    source: bool,
}

impl FieldsFilter {
    pub fn new(fields: Vec<Pattern>) -> Self {
        Self {
            fields,
            source: false,
        }
    }

    pub fn source_only() -> Self {
        Self {
            fields: Vec::new(),
            source: true,
        }
    }

    pub fn fields(&self) -> &[Pattern] {
        &self.fields
    }

    /// Whether retrieving these fields needs the document source
    pub fn requires_source(&self) -> bool {
        self.source
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && !self.source
    }

    /// Build from the `fields` query parameter
    pub fn from_query(fields: Option<&str>) -> Self {
        let mut filter = Self::default();
        if let Some(fields) = fields {
            for element in fields.split(',').filter(|e| !e.trim().is_empty()) {
                filter.push(element.trim());
            }
        }
        filter
    }

    /// Build from the `fields` key of a request body (string or list)
    pub fn from_json(value: &Value) -> Self {
        let mut filter = Self::default();
        match value {
            Value::String(field) => filter.push(field),
            Value::Array(fields) => {
                for field in fields.iter().filter_map(Value::as_str) {
                    filter.push(field);
                }
            }
            _ => {}
        }
        filter
    }

    fn push(&mut self, field: &str) {
        if field == "_source" || field.starts_with("_source.") {
            self.source = true;
        } else {
            let pattern = Pattern::new(field);
            if !self.fields.contains(&pattern) {
                self.fields.push(pattern);
            }
        }
    }

    pub fn as_json(&self) -> Value {
        let mut fields: Vec<Value> = self
            .fields
            .iter()
            .map(|p| Value::String(p.text().to_string()))
            .collect();
        if self.source {
            fields.push(Value::String("_source".to_string()));
        }
        Value::Array(fields)
    }

    pub fn as_query(&self) -> Vec<(String, String)> {
        let mut elements: Vec<String> = self.fields.iter().map(|p| p.text().to_string()).collect();
        if self.source {
            elements.push("_source".to_string());
        }
        if elements.is_empty() {
            return Vec::new();
        }
        vec![("fields".to_string(), elements.join(","))]
    }

    /// Narrow the requested fields to those covered by the permitted ones.
    /// For every pair where one pattern contains the other, the narrower one
    /// survives. Returns false when nothing remains.
    pub fn combine(&mut self, permitted: &FieldsFilter) -> bool {
        if self.fields.is_empty() {
            return true;
        }

        let mut narrowed: Vec<Pattern> = Vec::new();
        for requested in &self.fields {
            for granted in &permitted.fields {
                let narrow = if granted.matches(requested) {
                    requested
                } else if requested.matches(granted) {
                    granted
                } else {
                    continue;
                };

                if !narrowed.contains(narrow) {
                    narrowed.push(narrow.clone());
                }
            }
        }

        if narrowed.is_empty() {
            return false;
        }

        self.fields = narrowed;
        true
    }
}

fn with_subtree_twin(pattern: &Pattern) -> Vec<Pattern> {
    if pattern.has_wildcards() {
        vec![pattern.clone()]
    } else {
        vec![pattern.clone(), Pattern::new(format!("{}.*", pattern.text()))]
    }
}

fn drop_subtree_twins(patterns: &mut Vec<Pattern>) {
    let bases: Vec<String> = patterns
        .iter()
        .filter(|p| !p.has_wildcards())
        .map(|p| format!("{}.*", p.text()))
        .collect();
    patterns.retain(|p| !bases.iter().any(|twin| twin == p.text()));
}

fn json_patterns(value: &Value) -> Vec<Pattern> {
    match value {
        Value::String(pattern) => vec![Pattern::new(pattern.as_str())],
        Value::Array(patterns) => patterns
            .iter()
            .filter_map(Value::as_str)
            .map(Pattern::new)
            .collect(),
        _ => Vec::new(),
    }
}

fn join_patterns(patterns: &[Pattern]) -> String {
    patterns
        .iter()
        .map(|p| p.text())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_filter_from_query() {
        let filter = SourceFilter::from_query(Some("false"), None, None);
        assert!(filter.disabled);
        assert!(filter.discards_source());

        let filter = SourceFilter::from_query(Some("obj.*,name"), None, Some("obj.secret"));
        assert_eq!(filter.includes.len(), 2);
        assert_eq!(filter.excludes.len(), 1);
        assert!(!filter.is_empty());

        let filter = SourceFilter::from_query(None, None, None);
        assert!(filter.is_empty());
    }

    #[test]
    fn test_source_filter_json_round_trip() {
        let cases = [
            json!(false),
            json!(["obj.*", "name"]),
            json!({"include": ["obj.*"], "exclude": ["obj.secret"]}),
        ];

        for case in cases {
            let filter = SourceFilter::from_json(&case);
            assert_eq!(SourceFilter::from_json(&filter.as_json()), filter);
        }
    }

    #[test]
    fn test_source_filter_combine() {
        let mut requested = SourceFilter::from_json(&json!(["obj.*"]));
        let permitted = SourceFilter::from_json(&json!({"include": ["*"], "exclude": ["obj.secret"]}));
        assert!(requested.combine(&permitted));
        assert_eq!(requested.includes.len(), 1);
        assert_eq!(requested.includes[0].text(), "obj.*");
        assert_eq!(requested.excludes.len(), 1);

        let mut requested = SourceFilter::from_json(&json!(["obj.secret.key"]));
        assert!(!requested.combine(&permitted));
    }

    #[test]
    fn test_fields_filter_source_flag() {
        let filter = FieldsFilter::from_query(Some("name,_source"));
        assert!(filter.requires_source());
        assert_eq!(filter.fields().len(), 1);

        let filter = FieldsFilter::from_query(Some("_source.obj"));
        assert!(filter.requires_source());
        assert!(filter.fields().is_empty());

        let filter = FieldsFilter::from_query(None);
        assert!(filter.is_empty());
    }

    #[test]
    fn test_fields_filter_combine() {
        let mut requested = FieldsFilter::from_json(&json!(["name", "address.*", "secret"]));
        let permitted = FieldsFilter::new(vec![Pattern::new("name"), Pattern::new("address.city")]);
        assert!(requested.combine(&permitted));
        let fields: Vec<_> = requested.fields().iter().map(|p| p.text()).collect();
        assert_eq!(fields, vec!["name", "address.city"]);

        let mut requested = FieldsFilter::from_json(&json!(["secret"]));
        assert!(!requested.combine(&permitted));
    }

    #[test]
    fn test_fields_filter_as_query() {
        let filter = FieldsFilter::from_query(Some("name,_source"));
        assert_eq!(
            filter.as_query(),
            vec![("fields".to_string(), "name,_source".to_string())]
        );
    }
}
