use serde_json::Value;

use super::{BodyParser, PermissionTuple};

/// Option keys that never name a field in single-field clauses
const CLAUSE_OPTIONS: &[&str] = &[
    "boost",
    "minimum_should_match",
    "minimum_match",
    "disable_coord",
    "execution",
    "_cache",
    "_cache_key",
    "_name",
    "distance",
    "distance_type",
    "unit",
    "optimize_bbox",
    "validation_method",
    "ignore_unmapped",
];

/// Structural walker over the Elasticsearch 1.7 Query DSL.
///
/// Recognized query and filter clauses surface the fields, indices and
/// types they mention plus the feature permissions they imply. Unknown
/// clause types pass through untouched.
#[derive(Debug, Default)]
pub struct QueryDslParser {
    pub permissions: Vec<PermissionTuple>,
    pub indices: Vec<String>,
    pub documents: Vec<(Option<String>, String)>,
    pub fields: Vec<(Option<String>, Option<String>, String)>,
}

impl QueryDslParser {
    /// Walk a query clause
    pub fn query(&mut self, value: &Value) {
        let Some(clauses) = value.as_object() else {
            return;
        };

        for (kind, body) in clauses {
            match kind.as_str() {
                "match" | "match_phrase" | "match_phrase_prefix" | "term" | "common" | "fuzzy"
                | "prefix" | "range" | "regexp" | "wildcard" | "span_term" => {
                    self.single_field(body);
                }
                "terms" | "in" => self.single_field(body),
                "multi_match" => self.field_list(body.get("fields")),
                "bool" => self.bool_clauses(body, Self::query),
                "filtered" => {
                    if let Some(query) = body.get("query") {
                        self.query(query);
                    }
                    if let Some(filter) = body.get("filter") {
                        self.filter(filter);
                    }
                }
                "constant_score" => {
                    if let Some(query) = body.get("query") {
                        self.query(query);
                    }
                    if let Some(filter) = body.get("filter") {
                        self.filter(filter);
                    }
                }
                "dis_max" => {
                    if let Some(queries) = body.get("queries").and_then(Value::as_array) {
                        for query in queries {
                            self.query(query);
                        }
                    }
                }
                "boosting" => {
                    for key in ["positive", "negative"] {
                        if let Some(query) = body.get(key) {
                            self.query(query);
                        }
                    }
                }
                "query_string" | "simple_query_string" => {
                    self.permissions
                        .push(PermissionTuple::cluster("api/feature/queryString"));
                }
                "more_like_this" | "mlt" => {
                    self.permissions
                        .push(PermissionTuple::cluster("api/feature/moreLikeThis"));
                    self.field_list(body.get("fields"));
                    self.document_references(body.get("docs"));
                    self.document_references(body.get("ids"));
                }
                "more_like_this_field" | "mlt_field" => {
                    if let Some(field) = first_field_key(body) {
                        self.permissions
                            .push(PermissionTuple::field("api/feature/moreLikeThis", field));
                    } else {
                        self.permissions
                            .push(PermissionTuple::cluster("api/feature/moreLikeThis"));
                    }
                }
                "fuzzy_like_this" | "flt" => {
                    self.permissions
                        .push(PermissionTuple::cluster("api/feature/fuzzyLikeThis"));
                    self.field_list(body.get("fields"));
                }
                "fuzzy_like_this_field" | "flt_field" => {
                    if let Some(field) = first_field_key(body) {
                        self.permissions
                            .push(PermissionTuple::field("api/feature/fuzzyLikeThis", field));
                    } else {
                        self.permissions
                            .push(PermissionTuple::cluster("api/feature/fuzzyLikeThis"));
                    }
                }
                "nested" => {
                    if let Some(path) = body.get("path").and_then(Value::as_str) {
                        self.fields.push((None, None, path.to_string()));
                    }
                    if let Some(query) = body.get("query") {
                        self.query(query);
                    }
                    if let Some(filter) = body.get("filter") {
                        self.filter(filter);
                    }
                }
                "has_child" | "has_parent" | "top_children" => {
                    for key in ["type", "parent_type"] {
                        if let Some(doc_type) = body.get(key).and_then(Value::as_str) {
                            self.documents.push((None, doc_type.to_string()));
                        }
                    }
                    if let Some(query) = body.get("query") {
                        self.query(query);
                    }
                    if let Some(filter) = body.get("filter") {
                        self.filter(filter);
                    }
                }
                "indices" => {
                    self.index_references(body);
                    for key in ["query", "no_match_query"] {
                        if let Some(query) = body.get(key).filter(|v| v.is_object()) {
                            self.query(query);
                        }
                    }
                }
                "ids" => self.type_references(body.get("type")),
                "span_near" | "span_or" => {
                    if let Some(clauses) = body.get("clauses").and_then(Value::as_array) {
                        for clause in clauses {
                            self.query(clause);
                        }
                    }
                }
                "span_not" => {
                    for key in ["include", "exclude"] {
                        if let Some(clause) = body.get(key) {
                            self.query(clause);
                        }
                    }
                }
                "span_first" | "span_multi" => {
                    if let Some(clause) = body.get("match") {
                        self.query(clause);
                    }
                }
                "function_score" => {
                    if let Some(query) = body.get("query") {
                        self.query(query);
                    }
                    if let Some(filter) = body.get("filter") {
                        self.filter(filter);
                    }
                    if let Some(functions) = body.get("functions").and_then(Value::as_array) {
                        for function in functions {
                            if function.get("script_score").is_some() {
                                self.permissions
                                    .push(PermissionTuple::cluster("api/feature/script"));
                            }
                            if let Some(field) = function
                                .pointer("/field_value_factor/field")
                                .and_then(Value::as_str)
                            {
                                self.fields.push((None, None, field.to_string()));
                            }
                        }
                    }
                    if body.get("script_score").is_some() {
                        self.permissions
                            .push(PermissionTuple::cluster("api/feature/script"));
                    }
                }
                // Unknown query types pass through
                _ => {}
            }
        }
    }

    /// Walk a filter clause
    pub fn filter(&mut self, value: &Value) {
        let Some(clauses) = value.as_object() else {
            return;
        };

        for (kind, body) in clauses {
            match kind.as_str() {
                "and" | "or" => {
                    let filters = body
                        .as_array()
                        .or_else(|| body.get("filters").and_then(Value::as_array));
                    if let Some(filters) = filters {
                        for filter in filters {
                            self.filter(filter);
                        }
                    }
                }
                "not" => {
                    match body.get("filter") {
                        Some(filter) => self.filter(filter),
                        None => self.filter(body),
                    };
                }
                "bool" => self.bool_clauses(body, Self::filter),
                "exists" | "missing" => {
                    if let Some(field) = body.get("field").and_then(Value::as_str) {
                        self.fields.push((None, None, field.to_string()));
                    }
                }
                "term" | "terms" | "in" | "range" | "prefix" | "regexp" | "fuzzy" => {
                    self.single_field(body);
                }
                "nested" => {
                    if let Some(path) = body.get("path").and_then(Value::as_str) {
                        self.fields.push((None, None, path.to_string()));
                    }
                    if let Some(query) = body.get("query") {
                        self.query(query);
                    }
                    if let Some(filter) = body.get("filter") {
                        self.filter(filter);
                    }
                }
                "has_child" | "has_parent" => {
                    for key in ["type", "parent_type"] {
                        if let Some(doc_type) = body.get(key).and_then(Value::as_str) {
                            self.documents.push((None, doc_type.to_string()));
                        }
                    }
                    if let Some(query) = body.get("query") {
                        self.query(query);
                    }
                    if let Some(filter) = body.get("filter") {
                        self.filter(filter);
                    }
                }
                "indices" => {
                    self.index_references(body);
                    for key in ["filter", "no_match_filter"] {
                        if let Some(filter) = body.get(key).filter(|v| v.is_object()) {
                            self.filter(filter);
                        }
                    }
                }
                "type" => {
                    if let Some(doc_type) = body.get("value").and_then(Value::as_str) {
                        self.documents.push((None, doc_type.to_string()));
                    }
                }
                "ids" => self.type_references(body.get("type")),
                "query" => self.query(body),
                "fquery" => {
                    if let Some(query) = body.get("query") {
                        self.query(query);
                    }
                }
                "script" => {
                    self.permissions
                        .push(PermissionTuple::cluster("api/feature/script"));
                }
                kind if kind.starts_with("geo_") => {
                    if let Some(fields) = body.as_object() {
                        for (field, value) in fields {
                            if !CLAUSE_OPTIONS.contains(&field.as_str())
                                && (value.is_object() || value.is_array())
                            {
                                self.fields.push((None, None, field.to_string()));
                            }
                        }
                    }
                }
                "limit" | "match_all" => {}
                // Unknown filter types pass through
                _ => {}
            }
        }
    }

    fn bool_clauses(&mut self, body: &Value, mut walk: impl FnMut(&mut Self, &Value)) {
        for key in ["must", "must_not", "should"] {
            match body.get(key) {
                Some(Value::Array(clauses)) => {
                    for clause in clauses {
                        walk(self, clause);
                    }
                }
                Some(clause @ Value::Object(_)) => walk(self, clause),
                _ => {}
            }
        }
    }

    /// Record the field of a `{field: …}` shaped clause
    fn single_field(&mut self, body: &Value) {
        if let Some(field) = first_field_key(body) {
            self.fields.push((None, None, field));
        }
    }

    fn field_list(&mut self, value: Option<&Value>) {
        if let Some(fields) = value.and_then(Value::as_array) {
            for field in fields.iter().filter_map(Value::as_str) {
                // A boost suffix ("title^3") is not part of the field name
                let field = field.split('^').next().unwrap_or(field);
                self.fields.push((None, None, field.to_string()));
            }
        }
    }

    fn index_references(&mut self, body: &Value) {
        if let Some(index) = body.get("index").and_then(Value::as_str) {
            self.indices.push(index.to_string());
        }
        if let Some(indices) = body.get("indices").and_then(Value::as_array) {
            for index in indices.iter().filter_map(Value::as_str) {
                self.indices.push(index.to_string());
            }
        }
    }

    fn type_references(&mut self, value: Option<&Value>) {
        match value {
            Some(Value::String(doc_type)) => self.documents.push((None, doc_type.clone())),
            Some(Value::Array(types)) => {
                for doc_type in types.iter().filter_map(Value::as_str) {
                    self.documents.push((None, doc_type.to_string()));
                }
            }
            _ => {}
        }
    }

    fn document_references(&mut self, value: Option<&Value>) {
        if let Some(docs) = value.and_then(Value::as_array) {
            for doc in docs {
                if let Some(index) = doc.get("_index").and_then(Value::as_str) {
                    self.indices.push(index.to_string());
                }
                if let Some(doc_type) = doc.get("_type").and_then(Value::as_str) {
                    self.documents.push((None, doc_type.to_string()));
                }
            }
        }
    }
}

fn first_field_key(body: &Value) -> Option<String> {
    body.as_object()?
        .keys()
        .find(|key| !CLAUSE_OPTIONS.contains(&key.as_str()))
        .cloned()
}

impl BodyParser for QueryDslParser {
    fn permissions(&self) -> &[PermissionTuple] {
        &self.permissions
    }

    fn indices(&self) -> &[String] {
        &self.indices
    }

    fn documents(&self) -> &[(Option<String>, String)] {
        &self.documents
    }

    fn fields(&self) -> &[(Option<String>, Option<String>, String)] {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_clauses_surface_fields() {
        let mut parser = QueryDslParser::default();
        parser.query(&json!({"match": {"message": "hello"}}));
        parser.query(&json!({"term": {"status": {"value": "open", "boost": 2.0}}}));
        parser.query(&json!({"multi_match": {"query": "x", "fields": ["title^3", "body"]}}));

        let fields: Vec<&str> = parser.fields.iter().map(|(_, _, f)| f.as_str()).collect();
        assert_eq!(fields, vec!["message", "status", "title", "body"]);
        assert!(parser.permissions.is_empty());
    }

    #[test]
    fn test_bool_and_filtered_recursion() {
        let mut parser = QueryDslParser::default();
        parser.query(&json!({
            "filtered": {
                "query": {"bool": {
                    "must": [{"match": {"message": "x"}}],
                    "must_not": {"term": {"status": "closed"}}
                }},
                "filter": {"and": [
                    {"exists": {"field": "timestamp"}},
                    {"type": {"value": "events"}}
                ]}
            }
        }));

        let fields: Vec<&str> = parser.fields.iter().map(|(_, _, f)| f.as_str()).collect();
        assert_eq!(fields, vec!["message", "status", "timestamp"]);
        assert_eq!(parser.documents, vec![(None, "events".to_string())]);
    }

    #[test]
    fn test_feature_permissions() {
        let mut parser = QueryDslParser::default();
        parser.query(&json!({"query_string": {"query": "message:error"}}));
        parser.query(&json!({"more_like_this": {"fields": ["message"], "like_text": "x"}}));
        parser.filter(&json!({"script": {"script": "doc.value > 1"}}));

        let permissions: Vec<&str> = parser
            .permissions
            .iter()
            .map(|p| p.permission)
            .collect();
        assert_eq!(
            permissions,
            vec![
                "api/feature/queryString",
                "api/feature/moreLikeThis",
                "api/feature/script"
            ]
        );
    }

    #[test]
    fn test_scoped_references() {
        let mut parser = QueryDslParser::default();
        parser.query(&json!({
            "indices": {
                "indices": ["logs-2016", "logs-2017"],
                "query": {"term": {"status": "open"}},
                "no_match_query": "none"
            }
        }));
        parser.query(&json!({"has_child": {"type": "reply", "query": {"match_all": {}}}}));

        assert_eq!(parser.indices, vec!["logs-2016", "logs-2017"]);
        assert_eq!(parser.documents, vec![(None, "reply".to_string())]);
    }

    #[test]
    fn test_unknown_clauses_pass_through() {
        let mut parser = QueryDslParser::default();
        parser.query(&json!({"made_up_query": {"whatever": true}}));
        assert!(parser.fields.is_empty());
        assert!(parser.permissions.is_empty());
    }
}
