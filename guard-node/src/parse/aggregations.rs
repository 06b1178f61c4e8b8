use serde_json::Value;

use super::{escape_pointer, BodyParser, PermissionTuple, QueryDslParser};

/// Structural walker over nested aggregation definitions.
///
/// Surfaces the fields aggregations reference, flags scripted aggregations
/// and records JSON pointers to embedded `top_hits` bodies so the handler
/// can narrow their source and fielddata selections in place.
#[derive(Debug, Default)]
pub struct AggregationParser {
    pub permissions: Vec<PermissionTuple>,
    pub indices: Vec<String>,
    pub documents: Vec<(Option<String>, String)>,
    pub fields: Vec<(Option<String>, Option<String>, String)>,
    pub document_requests: Vec<String>,
}

impl AggregationParser {
    /// Walk an aggregations object. `base` is the JSON pointer to it within
    /// the request body, used to address embedded document requests.
    pub fn aggregations(&mut self, value: &Value, base: &str) {
        let Some(aggregations) = value.as_object() else {
            return;
        };

        for (name, body) in aggregations {
            let Some(body) = body.as_object() else {
                continue;
            };

            for (kind, definition) in body {
                match kind.as_str() {
                    "aggs" | "aggregations" => {
                        let pointer =
                            format!("{base}/{}/{}", escape_pointer(name), escape_pointer(kind));
                        self.aggregations(definition, &pointer);
                    }
                    "meta" => {}
                    "top_hits" => {
                        let pointer =
                            format!("{base}/{}/{}", escape_pointer(name), escape_pointer(kind));
                        self.document_requests.push(pointer);
                        self.scripted_check(definition);
                    }
                    "scripted_metric" => {
                        self.permissions
                            .push(PermissionTuple::cluster("api/feature/script"));
                    }
                    "filter" => {
                        let mut query = QueryDslParser::default();
                        query.filter(definition);
                        self.merge(query);
                    }
                    "filters" => {
                        if let Some(filters) =
                            definition.get("filters").and_then(Value::as_object)
                        {
                            let mut query = QueryDslParser::default();
                            for filter in filters.values() {
                                query.filter(filter);
                            }
                            self.merge(query);
                        }
                    }
                    _ => {
                        // Unknown aggregation types pass through unless they
                        // reference a field or carry a script
                        if let Some(field) = definition.get("field").and_then(Value::as_str) {
                            if !field.is_empty() {
                                self.fields.push((None, None, field.to_string()));
                            }
                        }
                        self.scripted_check(definition);
                    }
                }
            }
        }
    }

    fn scripted_check(&mut self, definition: &Value) {
        for key in ["script", "script_file", "script_id", "script_field", "script_fields"] {
            if definition.get(key).is_some() {
                self.permissions
                    .push(PermissionTuple::cluster("api/feature/script"));
                return;
            }
        }
    }

    fn merge(&mut self, mut query: QueryDslParser) {
        self.permissions.append(&mut query.permissions);
        self.indices.append(&mut query.indices);
        self.documents.append(&mut query.documents);
        self.fields.append(&mut query.fields);
    }
}

impl BodyParser for AggregationParser {
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

    fn document_requests(&self) -> &[String] {
        &self.document_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_aggregations() {
        let mut parser = AggregationParser::default();
        parser.aggregations(
            &json!({
                "hosts": {
                    "terms": {"field": "host"},
                    "aggs": {
                        "response_times": {"stats": {"field": "took_ms"}}
                    }
                }
            }),
            "/aggregations",
        );

        let fields: Vec<&str> = parser.fields.iter().map(|(_, _, f)| f.as_str()).collect();
        assert_eq!(fields, vec!["host", "took_ms"]);
    }

    #[test]
    fn test_scripted_aggregations_need_the_script_feature() {
        let mut parser = AggregationParser::default();
        parser.aggregations(
            &json!({
                "custom": {"terms": {"script": "doc['host'].value"}}
            }),
            "/aggs",
        );

        assert_eq!(parser.permissions.len(), 1);
        assert_eq!(parser.permissions[0].permission, "api/feature/script");
    }

    #[test]
    fn test_top_hits_pointer() {
        let mut parser = AggregationParser::default();
        parser.aggregations(
            &json!({
                "per_host": {
                    "terms": {"field": "host"},
                    "aggs": {
                        "latest": {"top_hits": {"size": 1, "_source": ["message"]}}
                    }
                }
            }),
            "/aggregations",
        );

        assert_eq!(
            parser.document_requests,
            vec!["/aggregations/per_host/aggs/latest/top_hits".to_string()]
        );
    }

    #[test]
    fn test_filter_aggregation_walks_the_filter() {
        let mut parser = AggregationParser::default();
        parser.aggregations(
            &json!({
                "errors": {"filter": {"term": {"level": "error"}}}
            }),
            "/aggs",
        );

        let fields: Vec<&str> = parser.fields.iter().map(|(_, _, f)| f.as_str()).collect();
        assert_eq!(fields, vec!["level"]);
    }
}
