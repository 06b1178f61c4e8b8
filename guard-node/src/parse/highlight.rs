use serde_json::Value;

use super::{BodyParser, PermissionTuple, QueryDslParser};

/// Walker over a search request's highlight block.
///
/// Every highlighted field is a field reference; embedded highlight
/// queries go through the Query DSL walker.
#[derive(Debug, Default)]
pub struct HighlightParser {
    pub permissions: Vec<PermissionTuple>,
    pub indices: Vec<String>,
    pub documents: Vec<(Option<String>, String)>,
    pub fields: Vec<(Option<String>, Option<String>, String)>,
}

impl HighlightParser {
    pub fn parse(&mut self, value: &Value) {
        match value.get("fields") {
            Some(Value::Object(fields)) => {
                for (name, body) in fields {
                    self.field(name, body);
                }
            }
            // The 1.7 API also accepts an ordered list of single-entry maps
            Some(Value::Array(fields)) => {
                for entry in fields {
                    if let Some(entry) = entry.as_object() {
                        for (name, body) in entry {
                            self.field(name, body);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn field(&mut self, name: &str, body: &Value) {
        self.fields.push((None, None, name.to_string()));

        if let Some(query) = body.get("highlight_query") {
            let mut parser = QueryDslParser::default();
            parser.query(query);
            self.permissions.append(&mut parser.permissions);
            self.indices.append(&mut parser.indices);
            self.documents.append(&mut parser.documents);
            self.fields.append(&mut parser.fields);
        }
    }
}

impl BodyParser for HighlightParser {
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
    fn test_highlighted_fields() {
        let mut parser = HighlightParser::default();
        parser.parse(&json!({
            "pre_tags": ["<em>"],
            "fields": {
                "message": {},
                "summary": {"highlight_query": {"match": {"summary.raw": "x"}}}
            }
        }));

        let fields: Vec<&str> = parser.fields.iter().map(|(_, _, f)| f.as_str()).collect();
        assert!(fields.contains(&"message"));
        assert!(fields.contains(&"summary"));
        assert!(fields.contains(&"summary.raw"));
    }

    #[test]
    fn test_field_list_form() {
        let mut parser = HighlightParser::default();
        parser.parse(&json!({"fields": [{"message": {}}, {"summary": {}}]}));
        assert_eq!(parser.fields.len(), 2);
    }
}
