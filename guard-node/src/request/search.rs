use hyper::Method;
use serde_json::{json, Value};

use crate::auth::Client;
use crate::filters::{FieldsFilter, SourceFilter};
use crate::parse::{AggregationParser, BodyParser, HighlightParser, QueryDslParser};
use crate::pattern::FilterString;
use crate::role::RestrictedScope;
use crate::APP_NAME;

use super::{
    check_gate, encode_json, ElasticHandler, GateHandler, GateScope, Inspection, InspectionError,
    LocalResponse, RegistrySettings, RequestContext, RequestRegistry, ResponseTransform,
};

/// Register the search API family. Registration order keeps the specific
/// `_search`-style locations ahead of the catch-all index locations
/// registered later.
pub fn register(registry: &mut RequestRegistry, settings: &RegistrySettings) {
    registry.register(Box::new(GateHandler::new(
        "SearchTemplate",
        vec![
            (Method::GET, "/_search/template"),
            (Method::GET, "/_search/template/{identifier}"),
            (Method::POST, "/_search/template"),
            (Method::POST, "/_search/template/{identifier}"),
            (Method::DELETE, "/_search/template/{identifier}"),
        ],
        vec![("api/search/templates", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "SearchShards",
        vec![
            (Method::GET, "/{indices}/_search_shards"),
            (Method::POST, "/{indices}/_search_shards"),
        ],
        vec![("api/search/shards", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "SearchExists",
        vec![
            (Method::GET, "/_search/exists"),
            (Method::GET, "/{indices}/_search/exists"),
            (Method::GET, "/{indices}/{documents}/_search/exists"),
            (Method::POST, "/_search/exists"),
            (Method::POST, "/{indices}/_search/exists"),
            (Method::POST, "/{indices}/{documents}/_search/exists"),
        ],
        vec![
            ("api/feature/notImplemented", GateScope::Default),
            ("api/search/documents", GateScope::Default),
        ],
    )));
    registry.register(Box::new(GateHandler::new(
        "Suggest",
        vec![(Method::GET, "/_suggest"), (Method::POST, "/_suggest")],
        vec![("api/search/suggest", GateScope::Default)],
    )));
    registry.register(Box::new(MultiSearchHandler));
    registry.register(Box::new(CountHandler));
    registry.register(Box::new(ValidateHandler {
        kibana_bypass: settings.kibana_validate_bypass,
    }));
    registry.register(Box::new(SearchHandler));
    registry.register(Box::new(GateHandler::new(
        "Explain",
        vec![
            (Method::GET, "/{index}/{document}/{identifier}/_explain"),
            (Method::POST, "/{index}/{document}/{identifier}/_explain"),
        ],
        vec![
            ("api/feature/notImplemented", GateScope::Default),
            ("api/search/explain", GateScope::Default),
        ],
    )));
    registry.register(Box::new(GateHandler::new(
        "Percolate",
        vec![
            (Method::GET, "/{index}/{document}/_percolate"),
            (Method::GET, "/{index}/{document}/{identifier}/_percolate"),
            (Method::POST, "/{index}/{document}/_percolate"),
            (Method::POST, "/{index}/{document}/{identifier}/_percolate"),
        ],
        vec![("api/search/percolate", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "MultiPercolate",
        vec![
            (Method::GET, "/_mpercolate"),
            (Method::GET, "/{index}/_mpercolate"),
            (Method::GET, "/{index}/{document}/_mpercolate"),
            (Method::POST, "/_mpercolate"),
            (Method::POST, "/{index}/_mpercolate"),
            (Method::POST, "/{index}/{document}/_mpercolate"),
        ],
        vec![
            ("api/bulk", GateScope::Cluster),
            ("api/search/percolate", GateScope::Default),
        ],
    )));
    registry.register(Box::new(GateHandler::new(
        "MoreLikeThis",
        vec![(Method::GET, "/{index}/{document}/{identifier}/_mlt")],
        vec![
            ("api/feature/deprecated", GateScope::Cluster),
            ("api/feature/moreLikeThis", GateScope::Default),
        ],
    )));
    registry.register(Box::new(GateHandler::new(
        "FieldStats",
        vec![(Method::GET, "/{indices}/_field_stats")],
        vec![("api/search/fieldStats", GateScope::Default)],
    )));
}

/// Scope a permission error message refers to
#[derive(Debug, Clone, Copy, PartialEq)]
enum ErrorScope {
    Cluster,
    Indices,
    Types,
    Fields,
}

/// The user-facing refusal for a missing feature permission
fn permission_error(permission: &str, scope: ErrorScope, offenders: &str) -> String {
    match (permission, scope) {
        ("api/search/explain", ErrorScope::Cluster) => {
            "You are not permitted to access scoring explanations.".to_string()
        }
        ("api/search/explain", ErrorScope::Indices) => format!(
            "You are not permitted to access scoring explanations of the following indices: {offenders}"
        ),
        ("api/search/explain", ErrorScope::Types) => format!(
            "You are not permitted to access scoring explanations of the following types: {offenders}"
        ),
        ("api/search/explain", ErrorScope::Fields) => format!(
            "You are not permitted to access scoring explanations of the following fields: {offenders}"
        ),
        ("api/feature/innerHits", ErrorScope::Cluster) => {
            "You are not permitted to access inner hits.".to_string()
        }
        ("api/feature/innerHits", ErrorScope::Indices) => format!(
            "You are not permitted to access inner hits of the following indices: {offenders}"
        ),
        ("api/feature/innerHits", _) => format!(
            "You are not permitted to access inner hits of the following types: {offenders}"
        ),
        ("api/search/suggest", ErrorScope::Cluster) => {
            "You are not permitted to perform suggest requests.".to_string()
        }
        ("api/search/suggest", ErrorScope::Indices) => format!(
            "You are not permitted to perform suggest requests on the following indices: {offenders}"
        ),
        ("api/search/suggest", _) => format!(
            "You are not permitted to perform suggest requests on the following types: {offenders}"
        ),
        ("api/indices/stats", ErrorScope::Cluster) => {
            "You are not permitted to access index statistics.".to_string()
        }
        ("api/indices/stats", _) => format!(
            "You are not permitted to access statistics of the following indices: {offenders}"
        ),
        ("api/feature/facets", ErrorScope::Cluster) => {
            "You are not permitted to utilize facets.".to_string()
        }
        ("api/feature/facets", ErrorScope::Indices) => format!(
            "You are not permitted to utilize facets in the following indices: {offenders}"
        ),
        ("api/feature/facets", _) => format!(
            "You are not permitted to utilize facets in the following types: {offenders}"
        ),
        ("api/feature/script", ErrorScope::Cluster) => {
            "You are not permitted to utilize scripts.".to_string()
        }
        ("api/feature/script", ErrorScope::Indices) => format!(
            "You are not permitted to utilize scripts in the following indices: {offenders}"
        ),
        ("api/feature/script", ErrorScope::Types) => format!(
            "You are not permitted to utilize scripts in the following types: {offenders}"
        ),
        ("api/feature/script", ErrorScope::Fields) => format!(
            "You are not permitted to utilize scripts with the following fields: {offenders}"
        ),
        ("api/feature/moreLikeThis", ErrorScope::Cluster) => {
            "You are not permitted to utilize the more_like_this query.".to_string()
        }
        ("api/feature/moreLikeThis", ErrorScope::Indices) => format!(
            "You are not permitted to utilize the more_like_this query in the following indices: {offenders}"
        ),
        ("api/feature/moreLikeThis", ErrorScope::Types) => format!(
            "You are not permitted to utilize the more_like_this query in the following types: {offenders}"
        ),
        ("api/feature/moreLikeThis", ErrorScope::Fields) => format!(
            "You are not permitted to utilize the more_like_this query with the following fields: {offenders}"
        ),
        ("api/feature/fuzzyLikeThis", ErrorScope::Cluster) => {
            "You are not permitted to utilize the fuzzy_like_this or fuzzy_like_this_field query."
                .to_string()
        }
        ("api/feature/fuzzyLikeThis", ErrorScope::Indices) => format!(
            "You are not permitted to utilize the fuzzy_like_this or fuzzy_like_this_field query in the following indices: {offenders}"
        ),
        ("api/feature/fuzzyLikeThis", ErrorScope::Types) => format!(
            "You are not permitted to utilize the fuzzy_like_this or fuzzy_like_this_field query in the following types: {offenders}"
        ),
        ("api/feature/fuzzyLikeThis", ErrorScope::Fields) => format!(
            "You are not permitted to utilize the fuzzy_like_this or fuzzy_like_this_field query with the following fields: {offenders}"
        ),
        (permission, ErrorScope::Cluster) => {
            format!("You are missing the following permission: {permission}")
        }
        (permission, _) => format!(
            "You are missing the permission {permission} for the following: {offenders}"
        ),
    }
}

/// Check a permission against every surviving (index[, type[, field]])
/// combination, refusing with a precise message listing the offenders
fn check_permission(
    client: &Client,
    permission: &str,
    index_filter: &FilterString,
    type_filter: Option<&FilterString>,
    fields: Option<&[String]>,
) -> Result<(), InspectionError> {
    let type_filter = type_filter.filter(|t| !t.is_empty());

    if index_filter.is_empty() {
        if !client.can(permission, None, None, None) {
            return Err(InspectionError::forbidden(permission_error(
                permission,
                ErrorScope::Cluster,
                "",
            )));
        }
        return Ok(());
    }

    let mut forbidden = Vec::new();
    for index in index_filter.iter_patterns() {
        match type_filter {
            Some(types) => {
                for document_type in types.iter_patterns() {
                    match fields {
                        Some(fields) => {
                            for field in fields {
                                let field = crate::pattern::Pattern::new(field.as_str());
                                if !client.can(
                                    permission,
                                    Some(index),
                                    Some(document_type),
                                    Some(&field),
                                ) {
                                    forbidden.push(format!(
                                        "{}/{}/{}",
                                        index, document_type, field
                                    ));
                                }
                            }
                        }
                        None => {
                            if !client.can(permission, Some(index), Some(document_type), None) {
                                forbidden.push(format!("{index}/{document_type}"));
                            }
                        }
                    }
                }
            }
            None => {
                if !client.can(permission, Some(index), None, None) {
                    forbidden.push(index.text().to_string());
                }
            }
        }
    }

    if !forbidden.is_empty() {
        let scope = if fields.is_some() {
            ErrorScope::Fields
        } else if type_filter.is_some() {
            ErrorScope::Types
        } else {
            ErrorScope::Indices
        };
        return Err(InspectionError::forbidden(permission_error(
            permission,
            scope,
            &forbidden.join(", "),
        )));
    }

    Ok(())
}

/// Outcome of the shared search-request inspection
struct InspectedRequest {
    index_filter: FilterString,
    type_filter: FilterString,
    /// Source filter still to be expressed via query parameters
    source_filter: Option<SourceFilter>,
    /// The request body, when it had to be modified
    json: Option<Value>,
}

/// The inspection shared by the search, count, validate and multi-search
/// APIs: narrow indices and types to the granted filters, gate the body
/// features, walk the body and shrink source and field selections.
fn inspect_request(
    client: &Client,
    requested_indices: &FilterString,
    requested_types: &FilterString,
    requested_source: Option<SourceFilter>,
    json: Option<Value>,
) -> Result<InspectedRequest, InspectionError> {
    let index_filter = match client.create_filter_string(
        "api/search/documents",
        Some(requested_indices),
        None,
        client.is_restricted(RestrictedScope::Types),
    ) {
        Err(error) => {
            return Err(InspectionError::forbidden(format!(
                "You are restricted to specific types or fields. To use the search api, please \
                 pick a single index from the following list: {}",
                error.includes.join(", ")
            )))
        }
        Ok(None) => {
            return Err(InspectionError::forbidden(format!(
                "You are not permitted to search for documents using the index filter \"{}\".",
                requested_indices
            )))
        }
        Ok(Some(filter)) => filter,
    };

    let type_filter = match client.create_filter_string(
        "api/search/documents",
        Some(requested_types),
        Some(&index_filter),
        client.is_restricted(RestrictedScope::Fields),
    ) {
        Err(error) => {
            return Err(InspectionError::forbidden(format!(
                "You are restricted to specific fields. To use the search api, please pick a \
                 single type from the following list: {}",
                error.includes.join(", ")
            )))
        }
        Ok(None) => {
            return Err(InspectionError::forbidden(format!(
                "You are not permitted to search for documents using the type filter \"{}\".",
                requested_types
            )))
        }
        Ok(Some(filter)) => filter,
    };

    let mut json = json;
    let mut json_updated = false;

    if let Some(body) = &json {
        if truthy(body.get("stats")) {
            check_permission(client, "api/indices/stats", &index_filter, None, None)?;
        }
        if truthy(body.get("facets")) {
            check_permission(
                client,
                "api/feature/facets",
                &index_filter,
                Some(&type_filter),
                None,
            )?;
        }
        if truthy(body.get("script_fields")) {
            check_permission(
                client,
                "api/feature/script",
                &index_filter,
                Some(&type_filter),
                None,
            )?;
        }
        if body.get("explain").and_then(Value::as_bool).unwrap_or(false) {
            check_permission(
                client,
                "api/search/explain",
                &index_filter,
                Some(&type_filter),
                None,
            )?;
        }
        if truthy(body.get("inner_hits")) {
            check_permission(
                client,
                "api/feature/innerHits",
                &index_filter,
                Some(&type_filter),
                None,
            )?;
        }
        if truthy(body.get("suggest")) {
            check_permission(
                client,
                "api/search/suggest",
                &index_filter,
                Some(&type_filter),
                None,
            )?;
        }
    }

    let mut source_filter = requested_source.clone();
    if !type_filter.is_empty() && client.is_restricted(RestrictedScope::Fields) {
        if let Some(body) = json.as_mut() {
            if let Some(fielddata) = body.get("fielddata_fields") {
                let requested = FieldsFilter::from_json(fielddata);
                match client.create_fields_filter(
                    "api/search/documents",
                    &index_filter,
                    &type_filter,
                    Some(requested),
                ) {
                    None => {
                        return Err(InspectionError::forbidden(
                            "You are not permitted to access any of the requested fielddata fields.",
                        ))
                    }
                    Some(permitted) if !permitted.is_empty() => {
                        body["fielddata_fields"] = permitted.as_json();
                        json_updated = true;
                    }
                    Some(_) => {}
                }
            }
        }

        let mut inspect_source = true;
        if let Some(body) = json.as_mut() {
            if body.get("fields").is_some() || body.get("partial_fields").is_some() {
                inspect_source = body.get("_source").is_some();

                if let Some(fields) = body.get("fields") {
                    let requested = FieldsFilter::from_json(fields);
                    match client.create_fields_filter(
                        "api/search/documents",
                        &index_filter,
                        &type_filter,
                        Some(requested),
                    ) {
                        None => {
                            return Err(InspectionError::forbidden(
                                "You are not permitted to access any of the requested stored fields.",
                            ))
                        }
                        Some(permitted) if !permitted.is_empty() => {
                            if permitted.requires_source() {
                                inspect_source = true;
                            }
                            body["fields"] = permitted.as_json();
                            json_updated = true;
                        }
                        Some(_) => {}
                    }
                }

                if let Some(partials) = body.get("partial_fields").and_then(Value::as_object) {
                    let mut rewritten = serde_json::Map::new();
                    let mut changed = false;
                    for (partial, partial_body) in partials {
                        let requested = SourceFilter::from_json(partial_body);
                        match client.create_source_filter(
                            "api/search/documents",
                            &index_filter,
                            &type_filter,
                            Some(requested),
                        ) {
                            None => {
                                return Err(InspectionError::forbidden(format!(
                                    "You are not permitted to access any of the requested stored \
                                     fields in group \"{partial}\"."
                                )))
                            }
                            Some(permitted) if !permitted.is_empty() => {
                                rewritten.insert(
                                    partial.clone(),
                                    json!({
                                        "include": permitted
                                            .includes
                                            .iter()
                                            .map(|p| p.text())
                                            .collect::<Vec<_>>(),
                                        "exclude": permitted
                                            .excludes
                                            .iter()
                                            .map(|p| p.text())
                                            .collect::<Vec<_>>(),
                                    }),
                                );
                                changed = true;
                            }
                            Some(_) => {
                                rewritten.insert(partial.clone(), partial_body.clone());
                            }
                        }
                    }

                    if changed {
                        body["partial_fields"] = Value::Object(rewritten);
                        json_updated = true;
                    }
                }
            }
        }

        if inspect_source {
            let requested = match json.as_ref().and_then(|body| body.get("_source")) {
                Some(source) => Some(SourceFilter::from_json(source)),
                None => requested_source,
            };

            match client.create_source_filter(
                "api/search/documents",
                &index_filter,
                &type_filter,
                requested,
            ) {
                None => {
                    return Err(InspectionError::forbidden(
                        "You are not permitted to access any of the requested source fields.",
                    ))
                }
                Some(permitted) => {
                    if let Some(body) = json.as_mut() {
                        if !permitted.is_empty() {
                            body["_source"] = permitted.as_json();
                            source_filter = None;
                            json_updated = true;
                        } else {
                            source_filter = Some(permitted);
                        }
                    } else {
                        source_filter = Some(permitted);
                    }
                }
            }
        }
    }

    if let Some(body) = json.as_mut() {
        if let Some(query) = body.get("query").filter(|q| truthy(Some(*q))).cloned() {
            let mut parser = QueryDslParser::default();
            parser.query(&query);
            inspect_parser(client, &parser, &index_filter, &type_filter, body)?;
        }

        for keyword in ["aggregations", "aggs"] {
            if let Some(aggregations) = body.get(keyword).filter(|a| truthy(Some(*a))).cloned() {
                let mut parser = AggregationParser::default();
                parser.aggregations(&aggregations, &format!("/{keyword}"));
                if inspect_parser(client, &parser, &index_filter, &type_filter, body)? {
                    json_updated = true;
                }
            }
        }

        if let Some(highlight) = body.get("highlight").filter(|h| truthy(Some(*h))).cloned() {
            let mut parser = HighlightParser::default();
            parser.parse(&highlight);
            inspect_parser(client, &parser, &index_filter, &type_filter, body)?;
        }

        if let Some(post_filter) = body.get("post_filter").filter(|f| truthy(Some(*f))).cloned() {
            let mut parser = QueryDslParser::default();
            parser.filter(&post_filter);
            inspect_parser(client, &parser, &index_filter, &type_filter, body)?;
        }

        if let Some(rescore) = body.get("rescore").cloned() {
            let rescores: Vec<Value> = match rescore {
                Value::Array(entries) => entries,
                entry => vec![entry],
            };
            for entry in rescores {
                if let Some(query) = entry.pointer("/query/rescore_query") {
                    let mut parser = QueryDslParser::default();
                    parser.query(query);
                    inspect_parser(client, &parser, &index_filter, &type_filter, body)?;
                }
            }
        }
    }

    Ok(InspectedRequest {
        index_filter,
        type_filter,
        source_filter,
        json: if json_updated { json } else { None },
    })
}

/// Check everything a body walker surfaced: feature permissions, scope
/// matches of explicit index/type references, field accessibility, and
/// embedded document requests. Returns whether the body was modified.
fn inspect_parser(
    client: &Client,
    parser: &dyn BodyParser,
    index_filter: &FilterString,
    type_filter: &FilterString,
    json: &mut Value,
) -> Result<bool, InspectionError> {
    let mut json_updated = false;

    for tuple in parser.permissions() {
        if tuple.permission != "api/feature/queryString" {
            let indices = match &tuple.index {
                Some(index) => parse_scope_filter(index)?,
                None => index_filter.clone(),
            };
            let types = match &tuple.document_type {
                Some(document_type) => parse_scope_filter(document_type)?,
                None => type_filter.clone(),
            };
            let fields = tuple.field.as_ref().map(|f| vec![f.clone()]);
            check_permission(
                client,
                tuple.permission,
                &indices,
                Some(&types),
                fields.as_deref(),
            )?;
        } else if client.has_restriction(index_filter, Some(type_filter), None) {
            return Err(InspectionError::forbidden(
                "You are restricted to specific fields and as such cannot utilize the query \
                 string search.",
            ));
        }
    }

    if client.is_restricted(RestrictedScope::Indices) {
        for index in parser.indices() {
            let reference = parse_scope_filter(index)?;
            if !index_filter.matches(&reference) {
                return Err(scope_mismatch("Index", index, index_filter));
            }
        }
    }

    if client.is_restricted(RestrictedScope::Types) {
        for (index, document_type) in parser.documents() {
            if let Some(index) = index {
                let reference = parse_scope_filter(index)?;
                if !index_filter.matches(&reference) {
                    return Err(scope_mismatch("Index", index, index_filter));
                }
            }
            let reference = parse_scope_filter(document_type)?;
            if !type_filter.matches(&reference) {
                return Err(scope_mismatch("Type", document_type, type_filter));
            }
        }
    }

    if client.is_restricted(RestrictedScope::Fields) {
        for (index, document_type, field) in parser.fields() {
            let indices = match index {
                Some(index) => {
                    let reference = parse_scope_filter(index)?;
                    if !index_filter.matches(&reference) {
                        return Err(scope_mismatch("Index", index, index_filter));
                    }
                    reference
                }
                None => index_filter.clone(),
            };
            let types = match document_type {
                Some(document_type) => {
                    let reference = parse_scope_filter(document_type)?;
                    if !type_filter.matches(&reference) {
                        return Err(scope_mismatch("Type", document_type, type_filter));
                    }
                    reference
                }
                None => type_filter.clone(),
            };

            let field_pattern = crate::pattern::Pattern::new(field.as_str());
            for index in indices.iter_patterns() {
                for document_type in types.iter_patterns() {
                    if !client.can(
                        "api/search/documents",
                        Some(index),
                        Some(document_type),
                        Some(&field_pattern),
                    ) {
                        return Err(InspectionError::forbidden(format!(
                            "You are not permitted to search for documents of type \"{}\" in \
                             index \"{}\" by using field \"{}\".",
                            document_type, index, field
                        )));
                    }
                }
            }
        }

        for pointer in parser.document_requests() {
            let Some(request) = json.pointer_mut(pointer) else {
                continue;
            };

            let requested = SourceFilter::from_json(request.get("_source").unwrap_or(&Value::Null));
            let requested_display = requested.clone();
            match client.create_source_filter(
                "api/search/documents",
                index_filter,
                type_filter,
                Some(requested),
            ) {
                None => {
                    return Err(InspectionError::forbidden(format!(
                        "You are either not permitted to access the document type \"{}\" or any \
                         of the requested fields ({}) in index \"{}\".",
                        type_filter, requested_display.as_json(), index_filter
                    )))
                }
                Some(permitted) if !permitted.is_empty() => {
                    request["_source"] = permitted.as_json();
                    json_updated = true;
                }
                Some(_) => {}
            }

            if let Some(fielddata) = request.get("fielddata_fields") {
                let requested = FieldsFilter::from_json(fielddata);
                match client.create_fields_filter(
                    "api/search/documents",
                    index_filter,
                    type_filter,
                    Some(requested),
                ) {
                    None => {
                        return Err(InspectionError::forbidden(format!(
                            "You are not permitted to access any of the requested fielddata \
                             fields of type \"{}\" in index \"{}\".",
                            type_filter, index_filter
                        )))
                    }
                    Some(permitted) if !permitted.is_empty() => {
                        request["fielddata_fields"] = permitted.as_json();
                        json_updated = true;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    Ok(json_updated)
}

fn parse_scope_filter(reference: &str) -> Result<FilterString, InspectionError> {
    FilterString::from_string(reference).map_err(|e| InspectionError::bad_request(e.to_string()))
}

fn scope_mismatch(what: &str, reference: &str, filter: &FilterString) -> InspectionError {
    InspectionError::BadRequest {
        status: 400,
        reason: format!(
            "{} filter \"{}\" does not match the requested scope \"{}\".",
            what, reference, filter
        ),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Object(o)) => !o.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(_)) => true,
    }
}

/// Refuse `q=` searches for clients with field restrictions in scope; no
/// query string parser exists that could narrow them.
fn check_query_string(
    ctx: &RequestContext,
    client: &Client,
    index_filter: &FilterString,
    type_filter: &FilterString,
) -> Result<(), InspectionError> {
    let q = ctx.query.last("q").unwrap_or("").trim();
    if !q.is_empty() && q != "*" && client.has_restriction(index_filter, Some(type_filter), None) {
        return Err(InspectionError::forbidden(
            "You are restricted to specific fields and as such cannot utilize the query string \
             search.",
        ));
    }
    Ok(())
}

/// The search API: the most involved rewrite of them all
pub struct SearchHandler;

impl ElasticHandler for SearchHandler {
    fn name(&self) -> &'static str {
        "Search"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/_search"),
            (Method::GET, "/{indices}/_search"),
            (Method::GET, "/{indices}/{documents}/_search"),
            (Method::POST, "/_search"),
            (Method::POST, "/{indices}/_search"),
            (Method::POST, "/{indices}/{documents}/_search"),
        ]
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let requested_indices = ctx.param_filter("indices")?;
        let requested_types = ctx.param_filter("documents")?;
        let requested_source = SourceFilter::from_query(
            ctx.query.last("_source"),
            ctx.query.last("_source_include"),
            ctx.query.last("_source_exclude"),
        );

        let inspected = inspect_request(
            client,
            &requested_indices,
            &requested_types,
            Some(requested_source),
            ctx.parse_json()?,
        )?;

        check_query_string(ctx, client, &inspected.index_filter, &inspected.type_filter)?;

        if !ctx.query.is_false("explain") {
            check_permission(
                client,
                "api/search/explain",
                &inspected.index_filter,
                Some(&inspected.type_filter),
                None,
            )?;
        }

        let requested_fields = FieldsFilter::from_query(ctx.query.last("fields"));
        match client.create_fields_filter(
            "api/search/documents",
            &inspected.index_filter,
            &inspected.type_filter,
            Some(requested_fields),
        ) {
            None => {
                return Err(InspectionError::forbidden(
                    "You are not permitted to access any of the requested stored fields.",
                ))
            }
            Some(permitted) if !permitted.is_empty() => {
                ctx.query.update(permitted.as_query());
            }
            Some(_) => {}
        }

        if !inspected.index_filter.is_empty() {
            ctx.path = if !inspected.type_filter.is_empty() {
                format!(
                    "/{}/{}/_search",
                    inspected.index_filter, inspected.type_filter
                )
            } else {
                format!("/{}/_search", inspected.index_filter)
            };
        }

        ctx.query
            .discard(&["_source", "_source_include", "_source_exclude"]);
        if let Some(source_filter) = inspected.source_filter.filter(|s| !s.is_empty()) {
            ctx.query.update(source_filter.as_query());
        }

        if let Some(json) = &inspected.json {
            ctx.set_body_json(json);
        }

        Ok(Inspection::Forward)
    }
}

/// The count API shares the search inspection without source handling
pub struct CountHandler;

impl ElasticHandler for CountHandler {
    fn name(&self) -> &'static str {
        "Count"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/_count"),
            (Method::GET, "/{indices}/_count"),
            (Method::GET, "/{indices}/{documents}/_count"),
            (Method::POST, "/_count"),
            (Method::POST, "/{indices}/_count"),
            (Method::POST, "/{indices}/{documents}/_count"),
        ]
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let requested_indices = ctx.param_filter("indices")?;
        let requested_types = ctx.param_filter("documents")?;

        let inspected = inspect_request(
            client,
            &requested_indices,
            &requested_types,
            None,
            ctx.parse_json()?,
        )?;

        check_query_string(ctx, client, &inspected.index_filter, &inspected.type_filter)?;

        if !inspected.index_filter.is_empty() {
            ctx.path = if !inspected.type_filter.is_empty() {
                format!(
                    "/{}/{}/_count",
                    inspected.index_filter, inspected.type_filter
                )
            } else {
                format!("/{}/_count", inspected.index_filter)
            };
        }

        if let Some(json) = &inspected.json {
            ctx.set_body_json(json);
        }

        Ok(Inspection::Forward)
    }
}

/// The validate API, with the Kibana query validator special case
pub struct ValidateHandler {
    pub kibana_bypass: bool,
}

impl ElasticHandler for ValidateHandler {
    fn name(&self) -> &'static str {
        "Validate"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/_validate/query"),
            (Method::GET, "/{indices}/_validate/query"),
            (Method::GET, "/{indices}/{documents}/_validate/query"),
            (Method::POST, "/_validate/query"),
            (Method::POST, "/{indices}/_validate/query"),
            (Method::POST, "/{indices}/{documents}/_validate/query"),
            (Method::POST, "/.kibana/__kibanaQueryValidator/_validate/query"),
        ]
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        if self.kibana_bypass && ctx.path.contains("__kibanaQueryValidator") {
            let kibana = crate::pattern::Pattern::new(".kibana");
            if client.can("api/search/explain", Some(&kibana), None, None) {
                return Ok(Inspection::Forward);
            }
            return Err(InspectionError::forbidden(permission_error(
                "api/search/explain",
                ErrorScope::Indices,
                ".kibana",
            )));
        }

        let requested_indices = ctx.param_filter("indices")?;
        let requested_types = ctx.param_filter("documents")?;

        let inspected = inspect_request(
            client,
            &requested_indices,
            &requested_types,
            None,
            ctx.parse_json()?,
        )?;

        check_query_string(ctx, client, &inspected.index_filter, &inspected.type_filter)?;

        if !ctx.query.is_false("explain") {
            check_permission(
                client,
                "api/search/explain",
                &inspected.index_filter,
                Some(&inspected.type_filter),
                None,
            )?;
        }

        if !inspected.index_filter.is_empty() {
            ctx.path = if !inspected.type_filter.is_empty() {
                format!(
                    "/{}/{}/_validate/query",
                    inspected.index_filter, inspected.type_filter
                )
            } else {
                format!("/{}/_validate/query", inspected.index_filter)
            };
        }

        if let Some(json) = &inspected.json {
            ctx.set_body_json(json);
        }

        Ok(Inspection::Forward)
    }
}

/// The multi-search API: line pairs of header and body, each inspected
/// like a search request. Failing pairs are withheld and their errors
/// spliced back into the upstream response at their original positions.
pub struct MultiSearchHandler;

impl MultiSearchHandler {
    fn parse_payload(
        ctx: &RequestContext,
    ) -> Result<Vec<(Value, Value)>, InspectionError> {
        let text = std::str::from_utf8(&ctx.body)
            .map_err(|_| InspectionError::bad_request("Request body is not valid UTF-8."))?;

        let default_indices: Vec<String> = ctx
            .param_or_empty("indices")
            .split(',')
            .map(str::to_string)
            .collect();
        let default_types: Vec<String> = ctx
            .param_or_empty("documents")
            .split(',')
            .map(str::to_string)
            .collect();

        let mut pairs = Vec::new();
        let mut pending: Option<(&str, usize)> = None;
        for (line_index, line) in text.lines().enumerate() {
            let line_no = line_index + 1;
            match pending.take() {
                None => pending = Some((line.trim(), line_no)),
                Some((header, header_no)) => {
                    let body = line.trim();
                    if body.is_empty() {
                        return Err(InspectionError::bad_request(format!(
                            "Expected body at line #{line_no}. Got an empty line instead."
                        )));
                    }

                    let mut header: Value = if header.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(header).map_err(|e| {
                            InspectionError::bad_request(format!(
                                "Failed to decode JSON header at line #{header_no}: {e}"
                            ))
                        })?
                    };
                    if !header.is_object() {
                        return Err(InspectionError::bad_request(format!(
                            "Failed to parse header at line #{header_no}. Invalid JSON object."
                        )));
                    }

                    for (key, defaults) in
                        [("index", &default_indices), ("type", &default_types)]
                    {
                        match header.get(key).cloned() {
                            None | Some(Value::Null) => {
                                header[key] = json!(defaults);
                            }
                            Some(Value::String(value)) => {
                                if value.is_empty() {
                                    header[key] = json!(defaults);
                                } else {
                                    header[key] = json!([value]);
                                }
                            }
                            Some(Value::Array(values)) => {
                                if values.is_empty() {
                                    header[key] = json!(defaults);
                                }
                            }
                            Some(other) => {
                                return Err(InspectionError::bad_request(format!(
                                    "Failed to parse header at line #{header_no}. List or string \
                                     expected for key \"{key}\". Got type \"{}\" instead.",
                                    json_type_name(&other)
                                )));
                            }
                        }
                    }

                    let body: Value = serde_json::from_str(body).map_err(|e| {
                        InspectionError::bad_request(format!(
                            "Failed to decode JSON body at line #{line_no}: {e}"
                        ))
                    })?;

                    pairs.push((header, body));
                }
            }
        }

        Ok(pairs)
    }
}

impl ElasticHandler for MultiSearchHandler {
    fn name(&self) -> &'static str {
        "MultiSearch"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/_msearch"),
            (Method::GET, "/{indices}/_msearch"),
            (Method::GET, "/{indices}/{documents}/_msearch"),
            (Method::POST, "/_msearch"),
            (Method::POST, "/{indices}/_msearch"),
            (Method::POST, "/{indices}/{documents}/_msearch"),
        ]
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        check_gate(ctx, client, "api/bulk", GateScope::Cluster)?;

        let pretty = !ctx.query.is_false("pretty");
        let pairs = Self::parse_payload(ctx)?;

        let mut lines = Vec::new();
        let mut errors: Vec<(usize, Value)> = Vec::new();
        for (position, (mut header, body)) in pairs.into_iter().enumerate() {
            let result = filter_list(&header, "index")
                .and_then(|indices| Ok((indices, filter_list(&header, "type")?)))
                .and_then(|(indices, types)| {
                    inspect_request(client, &indices, &types, None, Some(body.clone()))
                });

            match result {
                Err(error) => {
                    errors.push((
                        position,
                        json!({
                            "status": error.status_code(),
                            "error": format!("[{}] {}", APP_NAME, error),
                        }),
                    ));
                }
                Ok(inspected) => {
                    header["index"] = json!(filter_parts(&inspected.index_filter));
                    header["type"] = json!(filter_parts(&inspected.type_filter));
                    lines.push(encode_json(&header, false));
                    lines.push(encode_json(&inspected.json.unwrap_or(body), false));
                }
            }
        }

        if lines.is_empty() {
            // Every sub-request failed; answer with their errors directly
            let body = encode_json(
                &json!({"responses": errors.iter().map(|(_, e)| e).collect::<Vec<_>>()}),
                pretty,
            );
            return Ok(Inspection::Respond(LocalResponse::json(200, body)));
        }

        // Headers now carry indices and types where applicable
        ctx.path = "/_msearch".to_string();
        ctx.body = (lines.join("\n") + "\n").into_bytes();

        if errors.is_empty() {
            Ok(Inspection::Forward)
        } else {
            Ok(Inspection::ForwardWithTransform(
                ResponseTransform::MsearchErrors { errors, pretty },
            ))
        }
    }
}

/// Read a header key as a filter string
fn filter_list(header: &Value, key: &str) -> Result<FilterString, InspectionError> {
    let elements: Vec<String> = header
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    FilterString::from_list(&elements).map_err(|e| InspectionError::bad_request(e.to_string()))
}

/// Render a filter string as the list elements of a multi-search header
fn filter_parts(filter: &FilterString) -> Vec<String> {
    let mut parts = Vec::new();
    for entry in filter.entries() {
        parts.push(entry.include().text().to_string());
        for exclude in entry.excludes() {
            parts.push(format!("-{}", exclude.text()));
        }
    }
    parts
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Role;
    use serde_json::json;

    fn client_with_roles(privileges: Vec<Value>) -> Client {
        let mut client = Client::new("127.0.0.1".parse().unwrap(), 9200);
        let roles = privileges
            .into_iter()
            .enumerate()
            .map(|(i, p)| Role::from_json(format!("role-{i}"), &p).unwrap())
            .collect();
        client.set_roles(roles);
        client
    }

    fn search_client() -> Client {
        client_with_roles(vec![json!({
            "indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]
        })])
    }

    fn search_ctx(path: &str, query: Option<&str>, body: &str) -> RequestContext {
        let mut ctx = RequestContext::new(Method::GET, path, query, body.as_bytes().to_vec());
        let pattern = super::super::UrlPattern::new(match path.matches('/').count() {
            1 => "/_search",
            2 => "/{indices}/_search",
            _ => "/{indices}/{documents}/_search",
        });
        if let Some(params) = pattern.matches(path) {
            ctx.set_params(params);
        }
        ctx
    }

    #[test]
    fn test_unrestricted_caller_passes_through() {
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "*", "permissions": ["api/search/documents"]}]
        })]);

        let mut ctx = search_ctx("/logs/_search", None, "");
        let result = SearchHandler.inspect(&mut ctx, &client).unwrap();
        assert_eq!(result, Inspection::Forward);
        assert_eq!(ctx.path, "/logs/_search");
        assert!(ctx.body.is_empty());
    }

    #[test]
    fn test_single_requested_index_stays() {
        let client = search_client();
        let mut ctx = search_ctx("/logs-2016/_search", None, "");
        SearchHandler.inspect(&mut ctx, &client).unwrap();
        assert_eq!(ctx.path, "/logs-2016/_search");
    }

    #[test]
    fn test_wildcard_request_narrowed_to_grant() {
        let client = search_client();
        let mut ctx = search_ctx("/_search", None, "");
        SearchHandler.inspect(&mut ctx, &client).unwrap();
        assert_eq!(ctx.path, "/logs-*/_search");
    }

    #[test]
    fn test_denied_index_is_refused() {
        let client = search_client();
        let mut ctx = search_ctx("/secrets/_search", None, "");
        let error = SearchHandler.inspect(&mut ctx, &client).unwrap_err();
        assert_eq!(error.status_code(), 403);
        assert_eq!(
            error.to_string(),
            "You are not permitted to search for documents using the index filter \"secrets\"."
        );
    }

    fn field_restricted_client() -> Client {
        client_with_roles(vec![json!({
            "indices": [{
                "include": "logs-*",
                "permissions": ["api/search/documents"],
                "types": [{
                    "include": "events",
                    "fields": [{"include": ["message", "@*"]}]
                }]
            }]
        })])
    }

    #[test]
    fn test_query_string_refused_under_field_restriction() {
        let client = field_restricted_client();
        let mut ctx = search_ctx("/logs-2016/_search", Some("q=foo"), "");
        let error = SearchHandler.inspect(&mut ctx, &client).unwrap_err();
        assert_eq!(error.status_code(), 403);
        assert_eq!(
            error.to_string(),
            "You are restricted to specific fields and as such cannot utilize the query string \
             search."
        );
    }

    #[test]
    fn test_field_restricted_source_rewrite() {
        let client = field_restricted_client();
        let mut ctx = search_ctx(
            "/logs-2016/events/_search",
            None,
            r#"{"query": {"match": {"message": "x"}}, "_source": ["*"]}"#,
        );
        SearchHandler.inspect(&mut ctx, &client).unwrap();

        let body: Value = serde_json::from_slice(&ctx.body).unwrap();
        assert!(body.get("_source").is_some());
        // The rewritten source selection is what the role grants
        let source = SourceFilter::from_json(&body["_source"]);
        let includes: Vec<&str> = source.includes.iter().map(|p| p.text()).collect();
        assert_eq!(includes, vec!["message", "@*"]);
    }

    #[test]
    fn test_forbidden_field_in_query_refused() {
        let client = field_restricted_client();
        let mut ctx = search_ctx(
            "/logs-2016/events/_search",
            None,
            r#"{"query": {"match": {"secret": "x"}}}"#,
        );
        let error = SearchHandler.inspect(&mut ctx, &client).unwrap_err();
        assert_eq!(error.status_code(), 403);
        assert!(error.to_string().contains("by using field \"secret\""));
    }

    #[test]
    fn test_body_scope_mismatch_is_a_request_error() {
        let client = search_client();
        let mut ctx = search_ctx(
            "/logs-2016/_search",
            None,
            r#"{"query": {"indices": {"index": "metrics", "query": {"match_all": {}}}}}"#,
        );
        let error = SearchHandler.inspect(&mut ctx, &client).unwrap_err();
        assert_eq!(error.status_code(), 400);
        assert!(error.to_string().contains("does not match the requested scope"));
    }

    #[test]
    fn test_multiple_includes_require_choice() {
        let client = client_with_roles(vec![json!({
            "indices": [
                {"include": "logs-*", "permissions": ["api/search/documents"],
                 "types": [{"include": "events"}]},
                {"include": "metrics-*", "permissions": ["api/search/documents"],
                 "types": [{"include": "samples"}]}
            ]
        })]);

        let mut ctx = search_ctx("/_search", None, "");
        let error = SearchHandler.inspect(&mut ctx, &client).unwrap_err();
        assert_eq!(error.status_code(), 403);
        assert!(error.to_string().contains("pick a single index"));
        assert!(error.to_string().contains("logs-*"));
        assert!(error.to_string().contains("metrics-*"));
    }

    fn msearch_ctx(body: &str) -> RequestContext {
        RequestContext::new(Method::POST, "/_msearch", None, body.as_bytes().to_vec())
    }

    fn msearch_client() -> Client {
        client_with_roles(vec![json!({
            "cluster": ["api/bulk"],
            "indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]
        })])
    }

    #[test]
    fn test_msearch_partial_failure_forwards_survivors() {
        let client = msearch_client();
        let mut ctx = msearch_ctx(
            "{\"index\": \"logs-2016\"}\n{\"query\": {\"match_all\": {}}}\n\
             {\"index\": \"secrets\"}\n{\"query\": {\"match_all\": {}}}\n",
        );

        let result = MultiSearchHandler.inspect(&mut ctx, &client).unwrap();
        match result {
            Inspection::ForwardWithTransform(ResponseTransform::MsearchErrors {
                errors, ..
            }) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].0, 1);
                assert_eq!(errors[0].1["status"], json!(403));
            }
            other => panic!("unexpected inspection: {other:?}"),
        }

        let body = String::from_utf8(ctx.body.clone()).unwrap();
        assert!(body.contains("logs-2016"));
        assert!(!body.contains("secrets"));
        assert_eq!(ctx.path, "/_msearch");
    }

    #[test]
    fn test_msearch_total_failure_short_circuits() {
        let client = msearch_client();
        let mut ctx = msearch_ctx("{\"index\": \"secrets\"}\n{\"query\": {\"match_all\": {}}}\n");

        match MultiSearchHandler.inspect(&mut ctx, &client).unwrap() {
            Inspection::Respond(response) => {
                assert_eq!(response.status, 200);
                let body: Value = serde_json::from_str(&response.body).unwrap();
                assert_eq!(body["responses"].as_array().map(Vec::len), Some(1));
                assert_eq!(body["responses"][0]["status"], json!(403));
            }
            other => panic!("unexpected inspection: {other:?}"),
        }
    }

    #[test]
    fn test_msearch_malformed_body_is_refused() {
        let client = msearch_client();

        let mut ctx = msearch_ctx("{\"index\": \"logs-2016\"}\n\n");
        let error = MultiSearchHandler.inspect(&mut ctx, &client).unwrap_err();
        assert_eq!(error.status_code(), 400);
        assert!(error.to_string().contains("Expected body at line #2"));

        let mut ctx = msearch_ctx("{\"index\": 42}\n{\"query\": {\"match_all\": {}}}\n");
        let error = MultiSearchHandler.inspect(&mut ctx, &client).unwrap_err();
        assert!(error
            .to_string()
            .contains("List or string expected for key \"index\""));
    }

    #[test]
    fn test_count_rewrites_like_search() {
        let client = search_client();
        let mut ctx = RequestContext::new(Method::GET, "/_count", None, Vec::new());
        CountHandler.inspect(&mut ctx, &client).unwrap();
        assert_eq!(ctx.path, "/logs-*/_count");
    }

    #[test]
    fn test_kibana_validate_bypass() {
        let client = client_with_roles(vec![json!({
            "indices": [{"include": ".kibana", "permissions": ["api/search/explain"]}]
        })]);

        let handler = ValidateHandler {
            kibana_bypass: true,
        };
        let mut ctx = RequestContext::new(
            Method::POST,
            "/.kibana/__kibanaQueryValidator/_validate/query",
            None,
            Vec::new(),
        );
        assert_eq!(
            handler.inspect(&mut ctx, &client).unwrap(),
            Inspection::Forward
        );

        let stranger = search_client();
        let mut ctx = RequestContext::new(
            Method::POST,
            "/.kibana/__kibanaQueryValidator/_validate/query",
            None,
            Vec::new(),
        );
        assert!(handler.inspect(&mut ctx, &stranger).is_err());
    }
}
