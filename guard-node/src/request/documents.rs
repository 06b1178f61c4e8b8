use hyper::Method;

use crate::auth::Client;
use crate::filters::{FieldsFilter, SourceFilter};

use super::{
    check_gate, ElasticHandler, GateHandler, GateScope, Inspection, InspectionError,
    RequestContext, RequestRegistry,
};

/// Register the document API family
pub fn register(registry: &mut RequestRegistry) {
    registry.register(Box::new(GateHandler::new(
        "Bulk",
        vec![
            (Method::POST, "/_bulk"),
            (Method::POST, "/{index}/_bulk"),
            (Method::POST, "/{index}/{document}/_bulk"),
            (Method::PUT, "/_bulk"),
            (Method::PUT, "/{index}/_bulk"),
            (Method::PUT, "/{index}/{document}/_bulk"),
        ],
        vec![("api/bulk", GateScope::Cluster)],
    )));
    registry.register(Box::new(GateHandler::new(
        "MultiGet",
        vec![
            (Method::GET, "/_mget"),
            (Method::GET, "/{index}/_mget"),
            (Method::GET, "/{index}/{document}/_mget"),
            (Method::POST, "/_mget"),
            (Method::POST, "/{index}/_mget"),
            (Method::POST, "/{index}/{document}/_mget"),
        ],
        vec![
            ("api/bulk", GateScope::Cluster),
            ("api/documents/get", GateScope::Default),
        ],
    )));
    registry.register(Box::new(GateHandler::new(
        "DeleteByQuery",
        vec![
            (Method::DELETE, "/{indices}/_query"),
            (Method::DELETE, "/{indices}/{documents}/_query"),
        ],
        vec![
            ("api/feature/deprecated", GateScope::Cluster),
            ("api/documents/deleteByQuery", GateScope::Default),
        ],
    )));
    registry.register(Box::new(GateHandler::new(
        "TermVector",
        vec![
            (Method::GET, "/{index}/{document}/{identifier}/_termvector{s}"),
            (Method::POST, "/{index}/{document}/{identifier}/_termvector{s}"),
        ],
        vec![("api/documents/termVector", GateScope::Default)],
    )));
    registry.register(Box::new(UpdateHandler));
    registry.register(Box::new(GetDocumentHandler));
    registry.register(Box::new(GateHandler::new(
        "IndexDocument",
        vec![
            (Method::POST, "/{index}/{document}"),
            (Method::POST, "/{index}/{document}/{identifier}"),
            (Method::PUT, "/{index}/{document}/{identifier}"),
            (Method::POST, "/{index}/{document}/{identifier}/_create"),
            (Method::PUT, "/{index}/{document}/{identifier}/_create"),
        ],
        vec![("api/documents/index", GateScope::Default)],
    )));
    registry.register(Box::new(GateHandler::new(
        "DeleteDocument",
        vec![(Method::DELETE, "/{index}/{document}/{identifier}")],
        vec![("api/documents/delete", GateScope::Default)],
    )));
}

/// Single-document retrieval, with the source narrowed to what the client
/// may see
pub struct GetDocumentHandler;

impl ElasticHandler for GetDocumentHandler {
    fn name(&self) -> &'static str {
        "GetDocument"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/{index}/{document}/{identifier}"),
            (Method::HEAD, "/{index}/{document}/{identifier}"),
            (Method::GET, "/{index}/{document}/{identifier}/_source"),
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
        check_gate(ctx, client, "api/documents/get", GateScope::Default)?;

        let index = ctx.param_filter("index")?;
        let document_type = ctx.param_filter("document")?;

        let requested = SourceFilter::from_query(
            ctx.query.last("_source"),
            ctx.query.last("_source_include"),
            ctx.query.last("_source_exclude"),
        );
        match client.create_source_filter("api/documents/get", &index, &document_type, Some(requested))
        {
            None => {
                return Err(InspectionError::forbidden(
                    "You are not permitted to access any of the requested source fields.",
                ))
            }
            Some(permitted) if !permitted.is_empty() => {
                ctx.query
                    .discard(&["_source", "_source_include", "_source_exclude"]);
                ctx.query.update(permitted.as_query());
            }
            Some(_) => {}
        }

        let requested = FieldsFilter::from_query(ctx.query.last("fields"));
        match client.create_fields_filter("api/documents/get", &index, &document_type, Some(requested))
        {
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

        Ok(Inspection::Forward)
    }
}

/// Document updates; scripted updates additionally need the script feature
pub struct UpdateHandler;

impl ElasticHandler for UpdateHandler {
    fn name(&self) -> &'static str {
        "UpdateDocument"
    }

    fn locations(&self) -> Vec<(Method, &'static str)> {
        vec![(Method::POST, "/{index}/{document}/{identifier}/_update")]
    }

    fn inspect(
        &self,
        ctx: &mut RequestContext,
        client: &Client,
    ) -> Result<Inspection, InspectionError> {
        check_gate(ctx, client, "api/documents/update", GateScope::Default)?;

        if let Some(body) = ctx.parse_json()? {
            if body.get("script").is_some() || body.get("script_file").is_some() {
                let index = crate::pattern::Pattern::new(ctx.param_or_empty("index"));
                let document_type = crate::pattern::Pattern::new(ctx.param_or_empty("document"));
                if !client.can(
                    "api/feature/script",
                    Some(&index),
                    Some(&document_type),
                    None,
                ) {
                    return Err(InspectionError::forbidden(
                        "You are not permitted to utilize scripts.",
                    ));
                }
            }
        }

        Ok(Inspection::Forward)
    }
}
