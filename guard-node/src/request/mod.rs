pub mod cluster;
pub mod documents;
pub mod indices;
pub mod search;

use std::collections::HashMap;

use hyper::Method;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value;
use thiserror::Error;

use crate::auth::Client;
use crate::pattern::FilterString;

/// Characters escaped when re-encoding query strings
const QUERY_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'=')
    .add(b'+');

/// A request refused during inspection, carrying its HTTP semantics
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InspectionError {
    /// The client lacks a permission; reported as HTTP 403
    #[error("{0}")]
    Forbidden(String),

    /// The request is malformed or out of scope; reported with the carried
    /// status code
    #[error("{reason}")]
    BadRequest { status: u16, reason: String },
}

impl InspectionError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        InspectionError::Forbidden(reason.into())
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        InspectionError::BadRequest {
            status: 400,
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            InspectionError::Forbidden(_) => 403,
            InspectionError::BadRequest { status, .. } => *status,
        }
    }
}

/// An ordered multi-map over the request's query parameters
#[derive(Debug, Clone, Default)]
pub struct QueryString {
    params: Vec<(String, String)>,
}

impl QueryString {
    pub fn parse(raw: Option<&str>) -> Self {
        let mut params = Vec::new();
        for pair in raw.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (name, value) = match pair.split_once('=') {
                Some((name, value)) => (name, value),
                None => (pair, ""),
            };
            params.push((decode_component(name), decode_component(value)));
        }
        Self { params }
    }

    /// The last value given for the parameter, if any
    pub fn last(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the parameter is absent or set to a falsy value. A bare
    /// parameter (`?explain`) counts as enabled.
    pub fn is_false(&self, name: &str) -> bool {
        match self.last(name) {
            None => true,
            Some(value) => matches!(value.trim(), "false" | "0" | "no" | "off"),
        }
    }

    pub fn discard(&mut self, names: &[&str]) {
        self.params.retain(|(n, _)| !names.contains(&n.as_str()));
    }

    /// Replace the given parameters, dropping previous values
    pub fn update(&mut self, pairs: Vec<(String, String)>) {
        for (name, value) in pairs {
            self.params.retain(|(n, _)| *n != name);
            self.params.push((name, value));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn encode(&self) -> String {
        self.params
            .iter()
            .map(|(n, v)| {
                if v.is_empty() {
                    utf8_percent_encode(n, QUERY_ESCAPES).to_string()
                } else {
                    format!(
                        "{}={}",
                        utf8_percent_encode(n, QUERY_ESCAPES),
                        utf8_percent_encode(v, QUERY_ESCAPES)
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

fn decode_component(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    percent_decode_str(&raw).decode_utf8_lossy().into_owned()
}

/// One segment of a URL pattern
#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    /// A literal with an optional plural suffix, e.g. `_mapping{s}`
    OptionalSuffix { base: String, suffix: String },
    Param(String),
}

/// A URL pattern with named `{param}` segments matching one path component
#[derive(Debug, Clone)]
pub struct UrlPattern {
    segments: Vec<Segment>,
}

impl UrlPattern {
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|segment| {
                if let Some(name) = segment
                    .strip_prefix('{')
                    .and_then(|s| s.strip_suffix('}'))
                {
                    Segment::Param(name.to_string())
                } else if let Some((base, rest)) = segment.split_once('{') {
                    let suffix = rest.trim_end_matches('}').to_string();
                    Segment::OptionalSuffix {
                        base: base.to_string(),
                        suffix,
                    }
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();

        Self { segments }
    }

    /// Match a path against this pattern, extracting its parameters
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if components.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, component) in self.segments.iter().zip(&components) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != component {
                        return None;
                    }
                }
                Segment::OptionalSuffix { base, suffix } => {
                    let plural = format!("{base}{suffix}");
                    if *component != base.as_str() && *component != plural.as_str() {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    // Leading underscores mark API components, which only
                    // the keywords parameter of the get-index API accepts
                    if component.is_empty() || (component.starts_with('_') && name != "keywords") {
                        return None;
                    }
                    params.insert(name.clone(), decode_component(component));
                }
            }
        }

        Some(params)
    }
}

/// A locally produced response that short-circuits the upstream call
#[derive(Debug, Clone, PartialEq)]
pub struct LocalResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl LocalResponse {
    pub fn json(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }
}

/// Post-processing applied to the upstream response
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseTransform {
    /// Splice locally recorded multi-search errors back into the upstream
    /// `responses` array at their original positions
    MsearchErrors {
        errors: Vec<(usize, Value)>,
        pretty: bool,
    },
}

/// Outcome of inspecting a request
#[derive(Debug, Clone, PartialEq)]
pub enum Inspection {
    /// Forward the (possibly rewritten) request upstream
    Forward,
    /// Forward, then post-process the upstream response
    ForwardWithTransform(ResponseTransform),
    /// Answer locally without consulting the upstream cluster
    Respond(LocalResponse),
}

/// A request being inspected: method, path, query, body and the path
/// parameters of the matched location. Handlers mutate path, query and
/// body to narrow the request before it is forwarded.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: QueryString,
    pub body: Vec<u8>,
    params: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(method: Method, path: &str, query: Option<&str>, body: Vec<u8>) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: QueryString::parse(query),
            body,
            params: HashMap::new(),
        }
    }

    pub fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    /// The value of a path parameter of the matched location
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// The value of a path parameter, or an empty string
    pub fn param_or_empty(&self, name: &str) -> &str {
        self.path_param(name).unwrap_or("")
    }

    /// Parse a path parameter as a filter string
    pub fn param_filter(&self, name: &str) -> Result<FilterString, InspectionError> {
        FilterString::from_string(self.param_or_empty(name))
            .map_err(|e| InspectionError::bad_request(e.to_string()))
    }

    /// Parse the request body as JSON; an empty body yields `None`
    pub fn parse_json(&self) -> Result<Option<Value>, InspectionError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        serde_json::from_slice(&self.body)
            .map(Some)
            .map_err(|e| InspectionError::bad_request(format!("Failed to decode JSON body: {e}")))
    }

    /// Re-encode a JSON value as the request body
    pub fn set_body_json(&mut self, value: &Value) {
        self.body = encode_json(value, !self.query.is_false("pretty")).into_bytes();
    }
}

pub fn encode_json(value: &Value, pretty: bool) -> String {
    let encoded = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    // Encoding a Value cannot fail
    encoded.unwrap_or_default()
}

/// A recognized Elasticsearch API endpoint: where it lives and how to
/// authorize and rewrite requests to it
pub trait ElasticHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// The method and URL patterns this handler answers for
    fn locations(&self) -> Vec<(Method, &'static str)>;

    /// Whether inspection reads the request body. Handlers that only gate
    /// permissions or rewrite the path leave the body streaming to the
    /// upstream cluster; it is never buffered for them.
    fn needs_body(&self) -> bool {
        true
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError>;
}

/// Scope at which a plain permission gate checks its permission
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateScope {
    /// Check against each requested index, or the cluster when none is given
    Default,
    /// Always check as a cluster permission
    Cluster,
}

/// A pass-through handler that only checks permissions and never rewrites
pub struct GateHandler {
    name: &'static str,
    locations: Vec<(Method, &'static str)>,
    permissions: Vec<(&'static str, GateScope)>,
}

impl GateHandler {
    pub fn new(
        name: &'static str,
        locations: Vec<(Method, &'static str)>,
        permissions: Vec<(&'static str, GateScope)>,
    ) -> Self {
        Self {
            name,
            locations,
            permissions,
        }
    }
}

impl ElasticHandler for GateHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        self.locations.clone()
    }

    fn needs_body(&self) -> bool {
        false
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        for (permission, scope) in &self.permissions {
            check_gate(ctx, client, permission, *scope)?;
        }
        Ok(Inspection::Forward)
    }
}

/// Check a single gate permission in the given scope
pub fn check_gate(
    ctx: &RequestContext,
    client: &Client,
    permission: &str,
    scope: GateScope,
) -> Result<(), InspectionError> {
    let requested = match scope {
        GateScope::Cluster => None,
        GateScope::Default => ctx
            .path_param("indices")
            .or_else(|| ctx.path_param("index")),
    };

    match requested {
        None => {
            if !client.can(permission, None, None, None) {
                return Err(InspectionError::forbidden(format!(
                    "You are missing the following permission: {permission}"
                )));
            }
        }
        Some(requested) => {
            let filter = FilterString::from_string(requested)
                .map_err(|e| InspectionError::bad_request(e.to_string()))?;
            let forbidden: Vec<String> = filter
                .iter_patterns()
                .filter(|p| !client.can(permission, Some(p), None, None))
                .map(|p| p.text().to_string())
                .collect();
            if !forbidden.is_empty() {
                return Err(InspectionError::forbidden(format!(
                    "You are missing the permission {} for the following indices: {}",
                    permission,
                    forbidden.join(", ")
                )));
            }
        }
    }

    Ok(())
}

struct Route {
    method: Method,
    pattern: UrlPattern,
    handler: usize,
}

/// Settings the registry hands to handlers at construction time
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub kibana_validate_bypass: bool,
}

/// The dispatch table mapping (method, URL pattern) to handlers.
///
/// Built once at startup. Handlers are registered in an order that keeps
/// specific locations ahead of the catch-all index locations, so the first
/// matching route decides.
pub struct RequestRegistry {
    handlers: Vec<Box<dyn ElasticHandler>>,
    routes: Vec<Route>,
}

impl RequestRegistry {
    pub fn new(settings: &RegistrySettings) -> Self {
        let mut registry = Self {
            handlers: Vec::new(),
            routes: Vec::new(),
        };

        cluster::register(&mut registry);
        search::register(&mut registry, settings);
        documents::register(&mut registry);
        indices::register(&mut registry);

        registry
    }

    pub fn register(&mut self, handler: Box<dyn ElasticHandler>) {
        let index = self.handlers.len();
        for (method, pattern) in handler.locations() {
            self.routes.push(Route {
                method,
                pattern: UrlPattern::new(pattern),
                handler: index,
            });
        }
        self.handlers.push(handler);
    }

    /// Find the first handler whose location matches, extracting the path
    /// parameters
    pub fn resolve(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(&dyn ElasticHandler, HashMap<String, String>)> {
        for route in &self.routes {
            if route.method != *method {
                continue;
            }
            if let Some(params) = route.pattern.matches(path) {
                return Some((self.handlers[route.handler].as_ref(), params));
            }
        }

        None
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string_parsing() {
        let query = QueryString::parse(Some("q=foo%20bar&pretty&explain=false"));
        assert_eq!(query.last("q"), Some("foo bar"));
        assert_eq!(query.last("pretty"), Some(""));
        assert!(!query.is_false("pretty"));
        assert!(query.is_false("explain"));
        assert!(query.is_false("missing"));
    }

    #[test]
    fn test_query_string_discard_and_update() {
        let mut query = QueryString::parse(Some("_source=false&fields=a,b"));
        query.discard(&["_source"]);
        assert_eq!(query.last("_source"), None);

        query.update(vec![("fields".to_string(), "a".to_string())]);
        assert_eq!(query.last("fields"), Some("a"));
        assert_eq!(query.encode(), "fields=a");
    }

    #[test]
    fn test_url_pattern_literals_and_params() {
        let pattern = UrlPattern::new("/{indices}/_search");
        let params = pattern.matches("/logs-2016,logs-2017/_search").unwrap();
        assert_eq!(params.get("indices").map(String::as_str), Some("logs-2016,logs-2017"));

        assert!(pattern.matches("/logs/_count").is_none());
        assert!(pattern.matches("/_search").is_none());
        // API components never match ordinary parameters
        assert!(pattern.matches("/_all_docs/_search").is_none());
    }

    #[test]
    fn test_url_pattern_keywords_accept_api_components() {
        let pattern = UrlPattern::new("/{indices}/{keywords}");
        let params = pattern.matches("/logs/_settings,_mappings").unwrap();
        assert_eq!(
            params.get("keywords").map(String::as_str),
            Some("_settings,_mappings")
        );
    }

    #[test]
    fn test_url_pattern_optional_suffix() {
        let pattern = UrlPattern::new("/{indices}/_mapping{s}/{document}");
        assert!(pattern.matches("/logs/_mapping/events").is_some());
        assert!(pattern.matches("/logs/_mappings/events").is_some());
        assert!(pattern.matches("/logs/_warmers/events").is_none());
    }

    #[test]
    fn test_registry_dispatch_order() {
        let registry = RequestRegistry::new(&RegistrySettings {
            kibana_validate_bypass: true,
        });

        // The search location wins over the catch-all get-index location
        let (handler, _) = registry.resolve(&Method::GET, "/logs/_search").unwrap();
        assert_eq!(handler.name(), "Search");

        let (handler, params) = registry.resolve(&Method::GET, "/logs-2016").unwrap();
        assert_eq!(handler.name(), "GetIndex");
        assert_eq!(params.get("indices").map(String::as_str), Some("logs-2016"));

        // Settings routes are not swallowed by index creation
        let (handler, _) = registry.resolve(&Method::PUT, "/_settings").unwrap();
        assert_eq!(handler.name(), "UpdateIndexSettings");

        assert!(registry.resolve(&Method::GET, "/_nodes/hot/unknown/api").is_none());
    }

    #[test]
    fn test_pass_through_handlers_leave_the_body_streaming() {
        let registry = RequestRegistry::new(&RegistrySettings {
            kibana_validate_bypass: true,
        });

        // Pure gates and path rewriters never read the body
        let (handler, _) = registry.resolve(&Method::GET, "/_cluster/health").unwrap();
        assert!(!handler.needs_body());
        let (handler, _) = registry.resolve(&Method::POST, "/logs/_bulk").unwrap();
        assert!(!handler.needs_body());
        let (handler, _) = registry.resolve(&Method::POST, "/logs/_refresh").unwrap();
        assert!(!handler.needs_body());

        // Body-inspecting handlers need it buffered
        let (handler, _) = registry.resolve(&Method::POST, "/logs/_search").unwrap();
        assert!(handler.needs_body());
        let (handler, _) = registry.resolve(&Method::POST, "/_msearch").unwrap();
        assert!(handler.needs_body());
        let (handler, _) = registry.resolve(&Method::PUT, "/logs-2016").unwrap();
        assert!(handler.needs_body());
    }

    #[test]
    fn test_inspection_error_status() {
        assert_eq!(InspectionError::forbidden("nope").status_code(), 403);
        assert_eq!(InspectionError::bad_request("bad").status_code(), 400);
    }
}
