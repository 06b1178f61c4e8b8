//! Unit tests for the ElasticGuard proxy node
//!
//! This module contains tests for the major components:
//! - Pattern and filter string algebra
//! - Role restrictions and the filter planning engine
//! - Request registry dispatch
//! - The search and multi-search rewrites
//! - Configuration management

use serde_json::{json, Value};

use guard_node::auth::Client;
use guard_node::config::GuardConfig;
use guard_node::pattern::FilterString;
use guard_node::request::{RegistrySettings, RequestContext, RequestRegistry};
use guard_node::role::Role;

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

fn registry() -> RequestRegistry {
    RequestRegistry::new(&RegistrySettings {
        kibana_validate_bypass: true,
    })
}

fn dispatch(
    registry: &RequestRegistry,
    method: hyper::Method,
    path: &str,
    query: Option<&str>,
    body: &str,
    client: &Client,
) -> Result<(RequestContext, guard_node::request::Inspection), guard_node::request::InspectionError>
{
    let (handler, params) = registry
        .resolve(&method, path)
        .unwrap_or_else(|| panic!("no handler for {path}"));
    let mut ctx = RequestContext::new(method, path, query, body.as_bytes().to_vec());
    ctx.set_params(params);
    let inspection = handler.inspect(&mut ctx, client)?;
    Ok((ctx, inspection))
}

/// Test configuration loading and validation
#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_example_config_loads() {
        let config = GuardConfig::from_file("config/elasticguard");
        assert!(config.is_ok(), "Should be able to load the example config");

        if let Ok(config) = config {
            assert!(config.validate().is_ok());
            assert_eq!(config.proxy.port, 59200);
            assert_eq!(config.authorization.config_index, ".elasticguard");
        }
    }

    #[test]
    fn test_defaults_are_complete() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.elasticsearch_nodes().is_empty());
    }

    #[test]
    fn test_config_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elasticguard.toml");

        let mut config = GuardConfig::default();
        config.proxy.port = 59201;
        config.save_to_file(path.to_str().unwrap()).unwrap();

        let reloaded = GuardConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(reloaded.proxy.port, 59201);
    }
}

/// End-to-end inspection scenarios through the dispatch table
#[cfg(test)]
mod scenario_tests {
    use super::*;
    use guard_node::request::Inspection;

    #[test]
    fn test_unrestricted_caller_forwards_unchanged() {
        let registry = registry();
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "*", "permissions": ["api/search/documents"]}]
        })]);

        let (ctx, inspection) = dispatch(
            &registry,
            hyper::Method::GET,
            "/logs/_search",
            None,
            "",
            &client,
        )
        .unwrap();

        assert_eq!(inspection, Inspection::Forward);
        assert_eq!(ctx.path, "/logs/_search");
        assert!(ctx.body.is_empty());
    }

    #[test]
    fn test_restricted_caller_requesting_single_index() {
        let registry = registry();
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]
        })]);

        let (ctx, _) = dispatch(
            &registry,
            hyper::Method::GET,
            "/logs-2016/_search",
            None,
            "",
            &client,
        )
        .unwrap();
        assert_eq!(ctx.path, "/logs-2016/_search");
    }

    #[test]
    fn test_restricted_caller_requesting_everything() {
        let registry = registry();
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]
        })]);

        let (ctx, _) = dispatch(
            &registry,
            hyper::Method::GET,
            "/_search",
            None,
            "",
            &client,
        )
        .unwrap();
        assert_eq!(ctx.path, "/logs-*/_search");
    }

    #[test]
    fn test_denied_index_refused_with_message() {
        let registry = registry();
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]
        })]);

        let error = dispatch(
            &registry,
            hyper::Method::GET,
            "/secrets/_search",
            None,
            "",
            &client,
        )
        .unwrap_err();

        assert_eq!(error.status_code(), 403);
        assert_eq!(
            error.to_string(),
            "You are not permitted to search for documents using the index filter \"secrets\"."
        );
    }

    #[test]
    fn test_field_restricted_caller_cannot_use_query_strings() {
        let registry = registry();
        let client = client_with_roles(vec![json!({
            "indices": [{
                "include": "logs-*",
                "permissions": ["api/search/documents"],
                "types": [{
                    "include": "events",
                    "fields": [{"include": ["message"]}]
                }]
            }]
        })]);

        let error = dispatch(
            &registry,
            hyper::Method::GET,
            "/logs-2016/_search",
            Some("q=foo"),
            "",
            &client,
        )
        .unwrap_err();

        assert_eq!(error.status_code(), 403);
        assert!(error.to_string().contains("query string search"));
    }

    #[test]
    fn test_msearch_bad_subrequest_is_withheld() {
        let registry = registry();
        let client = client_with_roles(vec![json!({
            "cluster": ["api/bulk"],
            "indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]
        })]);

        let body = "{\"index\": \"logs-2016\"}\n{\"query\": {\"match_all\": {}}}\n\
                    {\"index\": \"secrets\"}\n{\"query\": {\"match_all\": {}}}\n";
        let (ctx, inspection) = dispatch(
            &registry,
            hyper::Method::POST,
            "/_msearch",
            None,
            body,
            &client,
        )
        .unwrap();

        let forwarded = String::from_utf8(ctx.body).unwrap();
        assert!(forwarded.contains("logs-2016"));
        assert!(!forwarded.contains("secrets"));

        match inspection {
            Inspection::ForwardWithTransform(
                guard_node::request::ResponseTransform::MsearchErrors { errors, .. },
            ) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].0, 1);
            }
            other => panic!("unexpected inspection outcome: {other:?}"),
        }
    }

    #[test]
    fn test_cluster_gate_refuses_without_permission() {
        let registry = registry();
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "*", "permissions": ["api/search/documents"]}]
        })]);

        let error = dispatch(
            &registry,
            hyper::Method::GET,
            "/_cluster/health",
            None,
            "",
            &client,
        )
        .unwrap_err();
        assert_eq!(error.status_code(), 403);
    }
}

/// The empty body and round-trip properties of the filter types
#[cfg(test)]
mod filter_tests {
    use super::*;
    use guard_node::filters::SourceFilter;

    #[test]
    fn test_filter_string_canonical_form() {
        let filter = FilterString::from_string("+a,a,-b,c").unwrap();
        assert_eq!(filter.to_string(), "a,-b,c");
    }

    #[test]
    fn test_source_filter_round_trip() {
        let filter = SourceFilter::from_json(&json!({
            "include": ["obj.*", "name"],
            "exclude": ["obj.secret"]
        }));
        assert_eq!(SourceFilter::from_json(&filter.as_json()), filter);
    }

    #[test]
    fn test_empty_body_produces_no_rewrite() {
        let registry = registry();
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "*", "permissions": ["api/search/documents"]}]
        })]);

        let (ctx, _) = dispatch(
            &registry,
            hyper::Method::POST,
            "/logs/_search",
            None,
            "",
            &client,
        )
        .unwrap();
        assert!(ctx.body.is_empty());
    }
}
