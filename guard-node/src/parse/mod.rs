pub mod aggregations;
pub mod highlight;
pub mod query_dsl;

pub use aggregations::AggregationParser;
pub use highlight::HighlightParser;
pub use query_dsl::QueryDslParser;

/// A permission requirement discovered while walking a request body.
///
/// Parsers only enumerate; whether a tuple is satisfied is for the handler
/// to decide.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionTuple {
    pub permission: &'static str,
    pub index: Option<String>,
    pub document_type: Option<String>,
    pub field: Option<String>,
}

impl PermissionTuple {
    pub fn cluster(permission: &'static str) -> Self {
        Self {
            permission,
            index: None,
            document_type: None,
            field: None,
        }
    }

    pub fn field(permission: &'static str, field: impl Into<String>) -> Self {
        Self {
            permission,
            index: None,
            document_type: None,
            field: Some(field.into()),
        }
    }
}

/// Access to what a body walker has surfaced
pub trait BodyParser {
    fn permissions(&self) -> &[PermissionTuple];

    /// Indices referenced by the body
    fn indices(&self) -> &[String];

    /// (index, type) references
    fn documents(&self) -> &[(Option<String>, String)];

    /// (index, type, field) references
    fn fields(&self) -> &[(Option<String>, Option<String>, String)];

    /// JSON pointers to embedded document requests (e.g. top_hits bodies)
    /// whose source and fielddata selections need narrowing
    fn document_requests(&self) -> &[String] {
        &[]
    }
}

/// Escape a JSON object key for use in a JSON pointer
pub(crate) fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
