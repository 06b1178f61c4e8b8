use hyper::Method;

use crate::auth::Client;
use crate::pattern::Pattern;
use crate::role::RestrictedScope;

use super::{
    check_gate, ElasticHandler, GateHandler, GateScope, Inspection, InspectionError,
    RequestContext, RequestRegistry,
};

/// Register the indices API family. The get-index handler matches nearly
/// everything and therefore goes last.
pub fn register(registry: &mut RequestRegistry) {
    registry.register(Box::new(GateHandler::new(
        "DeleteIndex",
        vec![(Method::DELETE, "/{indices}")],
        vec![("api/indices/delete/index", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "OpenIndex",
        vec![(Method::POST, "/{indices}/_open")],
        vec![("api/indices/open", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "CloseIndex",
        vec![(Method::POST, "/{indices}/_close")],
        vec![("api/indices/close", GateScope::Default)],
    )));
    registry.register(Box::new(CreateMappingHandler));
    registry.register(Box::new(GetMappingHandler));
    registry.register(Box::new(GetFieldMappingHandler));
    registry.register(Box::new(GateHandler::new(
        "DeleteMapping",
        vec![
            (Method::DELETE, "/{indices}/_mapping{s}"),
            (Method::DELETE, "/{indices}/{documents}/_mapping{s}"),
            (Method::DELETE, "/{indices}/_mapping{s}/{documents}"),
        ],
        vec![("api/indices/delete/mappings", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "CreateAlias",
        vec![
            (Method::POST, "/_aliases"),
            (Method::PUT, "/{indices}/_alias{es}/{name}"),
        ],
        vec![("api/indices/create/aliases", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "DeleteAlias",
        vec![(Method::DELETE, "/{indices}/_alias{es}/{names}")],
        vec![("api/indices/delete/aliases", GateScope::Default)],
    )));
    registry.register(Box::new(GetAliasHandler));
    registry.register(Box::new(GateHandler::new(
        "UpdateIndexSettings",
        vec![
            (Method::PUT, "/_settings"),
            (Method::PUT, "/{indices}/_settings"),
        ],
        vec![("api/indices/update/settings", GateScope::Default)],
    )));
    registry.register(Box::new(GetIndexSettingsHandler));
    registry.register(Box::new(GateHandler::new(
        "Analyze",
        vec![
            (Method::GET, "/_analyze"),
            (Method::GET, "/{index}/_analyze"),
            (Method::POST, "/_analyze"),
            (Method::POST, "/{index}/_analyze"),
        ],
        vec![("api/indices/analyze", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "CreateIndexTemplate",
        vec![(Method::PUT, "/_template/{name}")],
        vec![("api/indices/create/templates", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "DeleteIndexTemplate",
        vec![(Method::DELETE, "/_template/{name}")],
        vec![("api/indices/delete/templates", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "GetIndexTemplate",
        vec![
            (Method::GET, "/_template"),
            (Method::GET, "/_template/{names}"),
        ],
        vec![("api/indices/get/templates", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "CreateIndexWarmer",
        vec![
            (Method::PUT, "/_warmer{s}/{identifier}"),
            (Method::PUT, "/{indices}/_warmer{s}/{identifier}"),
            (Method::PUT, "/{indices}/{documents}/_warmer{s}/{identifier}"),
        ],
        vec![("api/indices/create/warmers", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "DeleteIndexWarmer",
        vec![(Method::DELETE, "/{indices}/_warmer{s}/{identifiers}")],
        vec![("api/indices/delete/warmers", GateScope::Default)],
    )));
    registry.register(Box::new(GetWarmerHandler));
    registry.register(Box::new(GateHandler::new(
        "IndexStats",
        vec![
            (Method::GET, "/_stats"),
            (Method::GET, "/{indices}/_stats"),
        ],
        vec![("api/indices/stats", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "IndexSegments",
        vec![
            (Method::GET, "/_segments"),
            (Method::GET, "/{indices}/_segments"),
        ],
        vec![("api/indices/segments", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "IndexRecovery",
        vec![
            (Method::GET, "/_recovery"),
            (Method::GET, "/{indices}/_recovery"),
        ],
        vec![("api/indices/recovery", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "IndexCacheClear",
        vec![
            (Method::POST, "/_cache/clear"),
            (Method::POST, "/{indices}/_cache/clear"),
        ],
        vec![("api/indices/cache/clear", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "IndexFlush",
        vec![
            (Method::POST, "/_flush"),
            (Method::POST, "/_flush/synced"),
            (Method::POST, "/{indices}/_flush"),
            (Method::POST, "/{indices}/_flush/synced"),
        ],
        vec![("api/indices/flush", GateScope::Default)],
    )));
    registry.register(Box::new(RefreshHandler));
    registry.register(Box::new(GateHandler::new(
        "IndexOptimize",
        vec![
            (Method::POST, "/_optimize"),
            (Method::POST, "/{indices}/_optimize"),
        ],
        vec![("api/indices/optimize", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "IndexUpgrade",
        vec![
            (Method::GET, "/{index}/_upgrade"),
            (Method::POST, "/{index}/_upgrade"),
        ],
        vec![("api/indices/upgrade", GateScope::Default)],
    )));
    registry.register(Box::new(CreateIndexHandler));
    registry.register(Box::new(GetIndexHandler));
}

/// Index creation: the top-level body keys carry their own permissions
pub struct CreateIndexHandler;

/// Body keys accepted on index creation and the permission each requires
const INDEX_CREATION_SETTINGS: &[(&str, Option<&str>)] = &[
    ("settings", None),
    ("creation_date", None),
    ("mappings", Some("api/indices/create/mappings")),
    ("warmers", Some("api/indices/create/warmers")),
    ("aliases", Some("api/indices/create/aliases")),
];

impl ElasticHandler for CreateIndexHandler {
    fn name(&self) -> &'static str {
        "CreateIndex"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![(Method::PUT, "/{index}"), (Method::POST, "/{index}")]
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        check_gate(ctx, client, "api/indices/create/index", GateScope::Default)?;

        let Some(body) = ctx.parse_json()? else {
            return Ok(Inspection::Forward);
        };
        let Some(settings) = body.as_object() else {
            return Err(InspectionError::bad_request("Invalid JSON object."));
        };

        if let Some(unknown) = settings.keys().find(|key| {
            !INDEX_CREATION_SETTINGS
                .iter()
                .any(|(name, _)| *name == key.as_str())
        }) {
            return Err(InspectionError::forbidden(format!(
                "Unknown index setting: {unknown}"
            )));
        }

        let index = Pattern::new(ctx.param_or_empty("index"));
        let missing: Vec<&str> = INDEX_CREATION_SETTINGS
            .iter()
            .copied()
            .filter_map(|(setting, permission)| permission.map(|p| (setting, p)))
            .filter(|(setting, permission)| {
                settings.contains_key(*setting)
                    && !client.can(permission, Some(&index), None, None)
            })
            .map(|(_, permission)| permission)
            .collect();

        if !missing.is_empty() {
            return Err(InspectionError::forbidden(format!(
                "You are missing the following permissions: {}",
                missing.join(", ")
            )));
        }

        Ok(Inspection::Forward)
    }
}

/// Index retrieval: rewrite to the permitted indices and the permitted
/// setting categories
pub struct GetIndexHandler;

const INDEX_RETRIEVAL_SETTINGS: &[(&str, &str)] = &[
    ("_settings", "api/indices/get/settings"),
    ("_mappings", "api/indices/get/mappings"),
    ("_warmers", "api/indices/get/warmers"),
    ("_aliases", "api/indices/get/aliases"),
];

impl ElasticHandler for GetIndexHandler {
    fn name(&self) -> &'static str {
        "GetIndex"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::HEAD, "/{indices}"),
            (Method::GET, "/{indices}"),
            (Method::GET, "/{indices}/{keywords}"),
        ]
    }

    fn needs_body(&self) -> bool {
        false
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let requested = ctx.param_filter("indices")?;
        let index_filter = client
            .create_filter_string("api/indices/get/*", Some(&requested), None, false)
            .map_err(|e| InspectionError::forbidden(e.to_string()))?
            .ok_or_else(|| {
                InspectionError::forbidden(
                    "You are not permitted to access any settings of the given index or indices.",
                )
            })?;

        let keywords: Vec<String> = ctx
            .param_or_empty("keywords")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if !index_filter.is_empty() {
            ctx.path = if keywords.is_empty() {
                format!("/{index_filter}")
            } else {
                format!("/{}/{}", index_filter, keywords.join(","))
            };
        }

        if ctx.method == Method::HEAD {
            return Ok(Inspection::Forward);
        }

        if let Some(unknown) = keywords.iter().find(|kw| {
            !INDEX_RETRIEVAL_SETTINGS
                .iter()
                .any(|(name, _)| *name == kw.as_str())
        }) {
            return Err(InspectionError::forbidden(format!(
                "Unknown index setting: {unknown}"
            )));
        }

        let mut permitted_settings = Vec::new();
        let mut missing: Vec<(String, Vec<String>)> = Vec::new();
        for (setting, permission) in INDEX_RETRIEVAL_SETTINGS.iter().copied() {
            if !keywords.is_empty() && !keywords.iter().any(|kw| kw.as_str() == setting) {
                continue;
            }

            let denied: Vec<String> = index_filter
                .iter_patterns()
                .filter(|index| !client.can(permission, Some(index), None, None))
                .map(|index| index.text().to_string())
                .collect();

            if denied.is_empty() {
                permitted_settings.push(setting);
            } else if keywords.iter().any(|kw| kw.as_str() == setting) {
                missing.push((permission.to_string(), denied));
            }
        }

        if !missing.is_empty() {
            let hint = missing
                .iter()
                .map(|(permission, indices)| format!("{} ({})", permission, indices.join(", ")))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(InspectionError::forbidden(format!(
                "You are missing the following permissions: {hint}"
            )));
        }

        // Without explicit keywords, append the permitted categories so the
        // upstream reply contains only what the caller may see
        if keywords.is_empty() && permitted_settings.len() < INDEX_RETRIEVAL_SETTINGS.len() {
            ctx.path = format!(
                "{}/{}",
                ctx.path.trim_end_matches('/'),
                permitted_settings.join(",")
            );
        }

        Ok(Inspection::Forward)
    }
}

/// Mapping creation needs a single index when types are restricted
pub struct CreateMappingHandler;

impl ElasticHandler for CreateMappingHandler {
    fn name(&self) -> &'static str {
        "CreateMapping"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::PUT, "/_mapping{s}/{document}"),
            (Method::PUT, "/{indices}/_mapping{s}/{document}"),
        ]
    }

    fn needs_body(&self) -> bool {
        false
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let restricted_types = client.is_restricted(RestrictedScope::Types);
        let requested = ctx.param_filter("indices")?;

        let index_filter = match client.create_filter_string(
            "api/indices/create/mappings",
            Some(&requested),
            None,
            restricted_types,
        ) {
            Err(error) => {
                return Err(InspectionError::forbidden(format!(
                    "You are restricted to specific types. To create type mappings, please pick \
                     a single index from the following list: {}",
                    error.includes.join(", ")
                )))
            }
            Ok(None) => {
                return Err(InspectionError::forbidden(
                    "You are not permitted to create mappings in the given indices.",
                ))
            }
            Ok(Some(filter)) => filter,
        };

        let document = ctx.param_or_empty("document").to_string();
        if restricted_types {
            let requested_index = index_filter
                .combined()
                .first()
                .cloned()
                .or_else(|| index_filter.first_include().cloned());
            let document_type = Pattern::new(document.as_str());
            let permitted = requested_index.map_or(false, |index| {
                client.can(
                    "api/indices/create/mappings",
                    Some(&index),
                    Some(&document_type),
                    None,
                )
            });
            if !permitted {
                return Err(InspectionError::forbidden(
                    "You are not permitted to create a mapping for this document type.",
                ));
            }
        }

        if !index_filter.is_empty() {
            ctx.path = format!("/{}/_mappings/{}", index_filter, document);
        }

        Ok(Inspection::Forward)
    }
}

/// Mapping retrieval narrows both the index and the type filter
pub struct GetMappingHandler;

impl ElasticHandler for GetMappingHandler {
    fn name(&self) -> &'static str {
        "GetMapping"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/_mapping{s}"),
            (Method::GET, "/{indices}/_mapping{s}"),
            (Method::GET, "/_mapping{s}/{documents}"),
            (Method::GET, "/{indices}/_mapping{s}/{documents}"),
            (Method::HEAD, "/{indices}/{documents}"),
        ]
    }

    fn needs_body(&self) -> bool {
        false
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let restricted_types = client.is_restricted(RestrictedScope::Types);
        let requested = ctx.param_filter("indices")?;

        let index_filter = match client.create_filter_string(
            "api/indices/get/mappings",
            Some(&requested),
            None,
            restricted_types,
        ) {
            Err(error) => {
                return Err(InspectionError::forbidden(format!(
                    "You are restricted to specific types. To retrieve type mappings, please \
                     pick a single index from the following list: {}",
                    error.includes.join(", ")
                )))
            }
            Ok(None) => {
                return Err(InspectionError::forbidden(
                    "You are not permitted to access the mappings of the given indices.",
                ))
            }
            Ok(Some(filter)) => filter,
        };

        let type_filter = if restricted_types {
            let requested_types = ctx.param_filter("documents")?;
            let filter = client
                .create_filter_string(
                    "api/indices/get/mappings",
                    Some(&requested_types),
                    Some(&index_filter),
                    false,
                )
                .map_err(|e| InspectionError::forbidden(e.to_string()))?
                .ok_or_else(|| {
                    InspectionError::forbidden(
                        "You are not permitted to access the mappings of the given types.",
                    )
                })?;
            filter.to_string()
        } else {
            ctx.param_or_empty("documents").to_string()
        };

        if !index_filter.is_empty() {
            ctx.path = if !type_filter.is_empty() {
                if ctx.method == Method::HEAD {
                    format!("/{}/{}", index_filter, type_filter)
                } else {
                    format!("/{}/_mappings/{}", index_filter, type_filter)
                }
            } else {
                format!("/{}/_mappings", index_filter)
            };
        }

        Ok(Inspection::Forward)
    }
}

/// Field-mapping retrieval follows the mapping permissions
pub struct GetFieldMappingHandler;

impl ElasticHandler for GetFieldMappingHandler {
    fn name(&self) -> &'static str {
        "GetFieldMapping"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/{indices}/_mapping/field/{fields}"),
            (Method::GET, "/{indices}/{documents}/_mapping/field/{fields}"),
            (Method::GET, "/{indices}/_mapping/{documents}/field/{fields}"),
        ]
    }

    fn needs_body(&self) -> bool {
        false
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let restricted_types = client.is_restricted(RestrictedScope::Types);
        let requested = ctx.param_filter("indices")?;

        let index_filter = match client.create_filter_string(
            "api/indices/get/mappings",
            Some(&requested),
            None,
            restricted_types,
        ) {
            Err(error) => {
                return Err(InspectionError::forbidden(format!(
                    "You are restricted to specific types. To retrieve field mappings, please \
                     pick a single index from the following list: {}",
                    error.includes.join(", ")
                )))
            }
            Ok(None) => {
                return Err(InspectionError::forbidden(
                    "You are not permitted to access the mappings of the given indices.",
                ))
            }
            Ok(Some(filter)) => filter,
        };

        let type_filter = if restricted_types {
            let requested_types = ctx.param_filter("documents")?;
            let filter = client
                .create_filter_string(
                    "api/indices/get/mappings",
                    Some(&requested_types),
                    Some(&index_filter),
                    false,
                )
                .map_err(|e| InspectionError::forbidden(e.to_string()))?
                .ok_or_else(|| {
                    InspectionError::forbidden(
                        "You are not permitted to access the mappings of the given types.",
                    )
                })?;
            filter.to_string()
        } else {
            ctx.param_or_empty("documents").to_string()
        };

        let fields = ctx.param_or_empty("fields").to_string();
        ctx.path = if !type_filter.is_empty() {
            format!("/{}/_mapping/{}/field/{}", index_filter, type_filter, fields)
        } else {
            format!("/{}/_mapping/field/{}", index_filter, fields)
        };

        Ok(Inspection::Forward)
    }
}

/// Alias retrieval rewrites the path to the permitted indices
pub struct GetAliasHandler;

impl ElasticHandler for GetAliasHandler {
    fn name(&self) -> &'static str {
        "GetAlias"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/_alias"),
            (Method::GET, "/_alias/{name}"),
            (Method::GET, "/{indices}/_alias"),
            (Method::GET, "/{indices}/_alias/{name}"),
            (Method::HEAD, "/_alias/{name}"),
            (Method::HEAD, "/{indices}/_alias/{name}"),
        ]
    }

    fn needs_body(&self) -> bool {
        false
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let requested = ctx.param_filter("indices")?;
        let index_filter = client
            .create_filter_string("api/indices/get/aliases", Some(&requested), None, false)
            .map_err(|e| InspectionError::forbidden(e.to_string()))?
            .ok_or_else(|| {
                InspectionError::forbidden(
                    "You are not permitted to access aliases of the given indices.",
                )
            })?;

        if !index_filter.is_empty() {
            let name = ctx.param_or_empty("name");
            ctx.path = if name.is_empty() {
                format!("/{index_filter}/_alias")
            } else {
                format!("/{index_filter}/_alias/{name}")
            };
        }

        Ok(Inspection::Forward)
    }
}

/// Settings retrieval rewrites the path to the permitted indices
pub struct GetIndexSettingsHandler;

impl ElasticHandler for GetIndexSettingsHandler {
    fn name(&self) -> &'static str {
        "GetIndexSettings"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/_settings"),
            (Method::GET, "/{indices}/_settings"),
        ]
    }

    fn needs_body(&self) -> bool {
        false
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let requested = ctx.param_filter("indices")?;
        let index_filter = client
            .create_filter_string("api/indices/get/settings", Some(&requested), None, false)
            .map_err(|e| InspectionError::forbidden(e.to_string()))?
            .ok_or_else(|| {
                InspectionError::forbidden(
                    "You are not permitted to access the general settings of the given index or \
                     indices.",
                )
            })?;

        if !index_filter.is_empty() {
            ctx.path = format!("/{index_filter}/_settings");
        }

        Ok(Inspection::Forward)
    }
}

/// Warmer retrieval rewrites the path to the permitted indices
pub struct GetWarmerHandler;

impl ElasticHandler for GetWarmerHandler {
    fn name(&self) -> &'static str {
        "GetIndexWarmer"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/_warmer{s}/{identifiers}"),
            (Method::GET, "/{indices}/_warmer{s}/{identifiers}"),
        ]
    }

    fn needs_body(&self) -> bool {
        false
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let requested = ctx.param_filter("indices")?;
        let index_filter = client
            .create_filter_string("api/indices/get/warmers", Some(&requested), None, false)
            .map_err(|e| InspectionError::forbidden(e.to_string()))?
            .ok_or_else(|| {
                InspectionError::forbidden(
                    "You are not permitted to access warmers of the given indices.",
                )
            })?;

        if !index_filter.is_empty() {
            ctx.path = format!(
                "/{}/_warmers/{}",
                index_filter,
                ctx.param_or_empty("identifiers")
            );
        }

        Ok(Inspection::Forward)
    }
}

/// Refresh rewrites the path to the permitted indices
pub struct RefreshHandler;

impl ElasticHandler for RefreshHandler {
    fn name(&self) -> &'static str {
        "IndexRefresh"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::POST, "/_refresh"),
            (Method::POST, "/{indices}/_refresh"),
        ]
    }

    fn needs_body(&self) -> bool {
        false
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        let requested = ctx.param_filter("indices")?;
        let index_filter = client
            .create_filter_string("api/indices/refresh", Some(&requested), None, false)
            .map_err(|e| InspectionError::forbidden(e.to_string()))?
            .ok_or_else(|| {
                InspectionError::forbidden("You are not permitted to refresh the given indices.")
            })?;

        if !index_filter.is_empty() {
            ctx.path = format!("/{index_filter}/_refresh");
        }

        Ok(Inspection::Forward)
    }
}
