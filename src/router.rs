use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, Method, Request, StatusCode, Uri, header};
use axum::response::Response;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

static PREFER: HeaderName = HeaderName::from_static("prefer");

use crate::batch;
use crate::csdl::CsdlFormat;
use crate::error::{Error, Result};
use crate::handler::{EntityHandler, json_content_type};
use crate::hooks::{Operation, Principal};
use crate::jobs::{JobRequest, JobResponse, JobStatus};
use crate::metadata::OperationMetadata;
use crate::serialize::{MetadataLevel, Serializer};
use crate::service::{OperationContext, Service, ServiceInner};
use crate::store::{Row, StoreTx};
use crate::url::{UrlComponents, parse_path, parse_query_pairs, resolve_key};

const SERVER_MAX_VERSION: &str = "4.01";
const RETRY_AFTER_SECS: &str = "2";

/// Parsed `Prefer` header values the server honors.
#[derive(Debug, Clone, Default)]
pub struct Preferences {
    /// `return=minimal` (true) / `return=representation` (false).
    pub return_minimal: Option<bool>,
    pub max_page_size: Option<u64>,
    pub track_changes: bool,
    pub respond_async: bool,
}

impl Preferences {
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut prefs = Preferences::default();
        for value in headers.get_all(&PREFER) {
            let Ok(text) = value.to_str() else { continue };
            for part in text.split(',') {
                let part = part.trim();
                match part.split_once('=') {
                    Some(("return", "minimal")) => prefs.return_minimal = Some(true),
                    Some(("return", "representation")) => prefs.return_minimal = Some(false),
                    Some(("odata.maxpagesize", n)) => {
                        prefs.max_page_size = n.trim().parse().ok();
                    }
                    None if part == "odata.track-changes" => prefs.track_changes = true,
                    None if part == "respond-async" => prefs.respond_async = true,
                    _ => {}
                }
            }
        }
        prefs
    }
}

/// A change-log entry staged by a changeset member; appended to the tracker
/// only when the whole group commits.
pub(crate) struct PendingChange {
    pub set: String,
    pub operation: crate::changes::ChangeOperation,
    pub key: Row,
    pub snapshot: Option<Row>,
}

/// Everything request handling needs about the current request, resolved by
/// the router before dispatch.
pub struct RequestContext {
    pub principal: Option<Principal>,
    pub version: String,
    pub level: MetadataLevel,
    /// Link prefix for emitted URLs (the configured base path).
    pub base: String,
    pub prefer: Preferences,
    /// Set inside a batch changeset: mutations join this transaction instead
    /// of opening their own.
    pub shared_tx: Option<Arc<tokio::sync::Mutex<Box<dyn StoreTx>>>>,
    pub(crate) pending_changes: Option<Arc<std::sync::Mutex<Vec<PendingChange>>>>,
}

impl Service {
    /// Mount the service as an axum router. The OData router owns path
    /// parsing, so everything funnels through one fallback handler.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(serve)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.inner)
    }
}

async fn serve(State(svc): State<Arc<ServiceInner>>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, 16 * 1024 * 1024).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return Error::PayloadTooLarge {
                message: "request body too large".into(),
            }
            .into_response(SERVER_MAX_VERSION);
        }
    };
    let headers = parts.headers.clone();
    dispatch(
        svc,
        parts.method,
        &parts.uri,
        headers,
        &body,
        false,
    )
    .await
}

/// Re-entrant dispatch used by live requests, batch sub-requests and async
/// job workers alike, so negotiation, hooks and policies apply uniformly.
pub(crate) async fn dispatch(
    svc: Arc<ServiceInner>,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: &[u8],
    in_batch: bool,
) -> Response {
    match dispatch_inner(svc, method, uri, headers, body, in_batch, None, None).await {
        Ok(response) => response,
        Err(e) => e.into_response(SERVER_MAX_VERSION),
    }
}

pub(crate) async fn dispatch_with_tx(
    svc: Arc<ServiceInner>,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: &[u8],
    shared_tx: Arc<tokio::sync::Mutex<Box<dyn StoreTx>>>,
    pending: Arc<std::sync::Mutex<Vec<PendingChange>>>,
) -> Response {
    match dispatch_inner(
        svc,
        method,
        uri,
        headers,
        body,
        true,
        Some(shared_tx),
        Some(pending),
    )
    .await
    {
        Ok(response) => response,
        Err(e) => e.into_response(SERVER_MAX_VERSION),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_inner(
    svc: Arc<ServiceInner>,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: &[u8],
    in_batch: bool,
    shared_tx: Option<Arc<tokio::sync::Mutex<Box<dyn StoreTx>>>>,
    pending_changes: Option<Arc<std::sync::Mutex<Vec<PendingChange>>>>,
) -> Result<Response> {
    let version = negotiate_version(&headers)?;

    // Base-path stripping: exact match or a `/` boundary only.
    let base = svc.base_path();
    let full_path = uri.path().to_string();
    let path = if base.is_empty() {
        full_path.as_str()
    } else if full_path == base {
        ""
    } else if full_path.starts_with(&format!("{base}/")) {
        &full_path[base.len()..]
    } else {
        return Err(Error::not_found(format!(
            "{full_path} is outside the service root"
        )));
    };
    let raw_query = uri.query().unwrap_or("");

    // HEAD is GET with the body dropped.
    let effective_method = if method == Method::HEAD {
        Method::GET
    } else {
        method.clone()
    };

    let trimmed = path.trim_matches('/');

    // Metadata and service documents negotiate their own formats.
    if trimmed == "$metadata" {
        let response = metadata_document(&svc, &headers, raw_query, &version)?;
        return Ok(strip_head(response, &method));
    }

    // Request bodies are JSON only; stream writes and $batch negotiate
    // their own media types.
    if matches!(
        effective_method,
        Method::POST | Method::PATCH | Method::PUT
    ) && !body.is_empty()
        && trimmed != "$batch"
        && !trimmed.ends_with("$value")
    {
        if let Some(ct) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !ct.starts_with("application/json") {
                return Err(Error::UnsupportedMediaType {
                    message: format!("request bodies must be application/json, got {ct}"),
                });
            }
        }
    }

    let query_pairs = parse_query_pairs(raw_query)?;
    let options = crate::parser::parse_query_options(&query_pairs, svc.config.max_expand_depth)?;

    // Batch payloads negotiate multipart/JSON themselves.
    let level = if trimmed == "$batch" {
        MetadataLevel::Minimal
    } else {
        negotiate_level(&headers, options.format.as_deref())?
    };

    let principal = match &svc.request_hook {
        Some(hook) => {
            let (mut dummy_parts, _) = Request::new(Body::empty()).into_parts();
            dummy_parts.method = effective_method.clone();
            dummy_parts.uri = uri.clone();
            dummy_parts.headers = headers.clone();
            hook.on_request(&dummy_parts).await?
        }
        None => None,
    };

    let prefer = Preferences::parse(&headers);
    let ctx = RequestContext {
        principal,
        version: version.clone(),
        level,
        base: base.clone(),
        prefer,
        shared_tx,
        pending_changes,
    };

    // Async diversion happens before normal routing; monitors and batches
    // are excluded.
    let is_monitor = trimmed.starts_with(svc.config.monitor_prefix.trim_matches('/'));
    if ctx.prefer.respond_async && !in_batch && !is_monitor && trimmed != "$batch" {
        return accept_async(&svc, &ctx, &method, uri, &headers, body);
    }

    if trimmed.is_empty() {
        if effective_method != Method::GET {
            return Err(Error::MethodNotAllowed {
                allowed: vec!["GET".into()],
            });
        }
        let serializer = Serializer {
            model: &svc.model,
            base: &ctx.base,
            level: ctx.level,
        };
        let doc = serializer.service_document();
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, json_content_type(ctx.level))
            .header("OData-Version", &version)
            .body(Body::from(serde_json::to_vec(&doc).unwrap_or_default()))
            .map_err(|e| Error::internal(format!("response assembly failed: {e}")))?;
        return Ok(strip_head(response, &method));
    }

    if trimmed == "$batch" {
        if effective_method != Method::POST {
            return Err(Error::MethodNotAllowed {
                allowed: vec!["POST".into()],
            });
        }
        return Box::pin(batch::execute(svc.clone(), &ctx, &headers, body)).await;
    }

    if let Some(job_id) = monitor_target(&svc, trimmed) {
        return monitor_response(&svc, &ctx, job_id);
    }

    let components = parse_path(path)?;

    if method == Method::OPTIONS {
        let allowed = options_allow(&svc, &components);
        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(header::ALLOW, allowed.join(", "))
            .header("OData-Version", &version)
            .body(Body::empty())
            .map_err(|e| Error::internal(format!("response assembly failed: {e}")));
    }

    // Actions and functions resolve by name before entity routing.
    if let Some(response) = try_operation(
        &svc,
        &ctx,
        &effective_method,
        &components,
        &query_pairs,
        body,
    )
    .await?
    {
        return Ok(strip_head(response, &method));
    }

    let handler = EntityHandler { svc: &svc, ctx: &ctx };
    let response = handler
        .handle(&effective_method, &components, options, raw_query, &headers, body)
        .await?;
    Ok(strip_head(response, &method))
}

/// min(server max, client max); clients below 4.0 are not serveable.
fn negotiate_version(headers: &HeaderMap) -> Result<String> {
    let client_max = headers
        .get("OData-MaxVersion")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    match client_max {
        None | Some("") => Ok(SERVER_MAX_VERSION.to_string()),
        Some(v) => {
            let numeric: f64 = v.parse().map_err(|_| Error::NotAcceptable {
                message: format!("invalid OData-MaxVersion: {v}"),
            })?;
            if numeric < 4.0 {
                return Err(Error::NotAcceptable {
                    message: format!("OData version {v} is not supported"),
                });
            }
            if v == "4.0" {
                Ok("4.0".to_string())
            } else {
                Ok(SERVER_MAX_VERSION.to_string())
            }
        }
    }
}

/// Only JSON is honored for entity data; `odata.metadata` picks the level.
fn negotiate_level(headers: &HeaderMap, format: Option<&str>) -> Result<MetadataLevel> {
    if let Some(format) = format {
        return match format {
            "json" => Ok(MetadataLevel::Minimal),
            other => Err(Error::NotAcceptable {
                message: format!("unsupported $format: {other}"),
            }),
        };
    }
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return Ok(MetadataLevel::Minimal);
    };
    for candidate in accept.split(',') {
        let candidate = candidate.trim();
        let mut parts = candidate.split(';');
        let media = parts.next().unwrap_or("").trim();
        if media == "*/*" || media == "application/*" {
            return Ok(MetadataLevel::Minimal);
        }
        if media == "application/json" {
            for param in parts {
                let param = param.trim();
                if let Some(level) = param.strip_prefix("odata.metadata=") {
                    return match level {
                        "none" => Ok(MetadataLevel::None),
                        "minimal" => Ok(MetadataLevel::Minimal),
                        "full" => Ok(MetadataLevel::Full),
                        other => Err(Error::NotAcceptable {
                            message: format!("unsupported odata.metadata level: {other}"),
                        }),
                    };
                }
            }
            return Ok(MetadataLevel::Minimal);
        }
    }
    Err(Error::NotAcceptable {
        message: format!("no acceptable media type in: {accept}"),
    })
}

fn metadata_document(
    svc: &ServiceInner,
    headers: &HeaderMap,
    raw_query: &str,
    version: &str,
) -> Result<Response> {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*/*");
    let pairs = parse_query_pairs(raw_query)?;
    let format_param = pairs
        .iter()
        .find(|(name, _)| name == "$format")
        .map(|(_, v)| v.as_str());
    let format = match format_param {
        Some("json") => CsdlFormat::Json,
        Some("xml") => CsdlFormat::Xml,
        Some(other) => {
            return Err(Error::NotAcceptable {
                message: format!("unsupported $format: {other}"),
            });
        }
        None if accept.contains("application/json") => CsdlFormat::Json,
        None => CsdlFormat::Xml,
    };
    let doc = svc.csdl.get(&svc.model, version, format)?;
    if let Some(if_none) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if if_none == doc.etag {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, &doc.etag)
                .header("OData-Version", version)
                .body(Body::empty())
                .map_err(|e| Error::internal(format!("response assembly failed: {e}")));
        }
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, doc.content_type)
        .header(header::ETAG, &doc.etag)
        .header("OData-Version", version)
        .body(Body::from(doc.body.clone()))
        .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
}

fn strip_head(response: Response, method: &Method) -> Response {
    if method != Method::HEAD {
        return response;
    }
    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Body::empty())
}

fn options_allow(svc: &ServiceInner, components: &UrlComponents) -> Vec<String> {
    match svc.model.set(&components.entity_set) {
        Some(meta) => match &meta.allowed_methods {
            Some(methods) => methods.clone(),
            None => ["GET", "POST", "PATCH", "PUT", "DELETE", "HEAD", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        },
        None => vec!["GET".into()],
    }
}

// ───────────────────────── async jobs ─────────────────────────

fn accept_async(
    svc: &Arc<ServiceInner>,
    ctx: &RequestContext,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response> {
    let mut snapshot_headers: Vec<(String, String)> = Vec::new();
    for (name, value) in headers {
        if name == PREFER {
            // The replayed request must not divert into the job queue again.
            if let Ok(text) = value.to_str() {
                let rest: Vec<&str> = text
                    .split(',')
                    .map(str::trim)
                    .filter(|p| *p != "respond-async")
                    .collect();
                if !rest.is_empty() {
                    snapshot_headers.push((name.to_string(), rest.join(", ")));
                }
            }
            continue;
        }
        if let Ok(text) = value.to_str() {
            snapshot_headers.push((name.to_string(), text.to_string()));
        }
    }
    let request = JobRequest {
        method: method.to_string(),
        target: uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers: snapshot_headers,
        body: body.to_vec(),
    };
    let worker_svc = svc.clone();
    let id = svc.jobs.submit(request, move |req| run_job(worker_svc, req));
    let monitor = format!(
        "{}/{}/{id}",
        ctx.base,
        svc.config.monitor_prefix.trim_matches('/')
    );
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, monitor)
        .header(header::RETRY_AFTER, RETRY_AFTER_SECS)
        .header("Preference-Applied", "respond-async")
        .header("OData-Version", &ctx.version)
        .body(Body::empty())
        .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
}

async fn run_job(svc: Arc<ServiceInner>, request: JobRequest) -> JobResponse {
    let method = request
        .method
        .parse::<Method>()
        .unwrap_or(Method::GET);
    let uri: Uri = request.target.parse().unwrap_or_else(|_| Uri::from_static("/"));
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<axum::http::HeaderName>(),
            value.parse::<axum::http::HeaderValue>(),
        ) {
            headers.insert(name, value);
        }
    }
    let response = dispatch(svc, method, &uri, headers, &request.body, false).await;
    let status = response.status().as_u16();
    let header_list: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
        .collect();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();
    JobResponse {
        status,
        headers: header_list,
        body,
    }
}

fn monitor_target(svc: &ServiceInner, trimmed: &str) -> Option<Uuid> {
    let prefix = svc.config.monitor_prefix.trim_matches('/');
    let rest = trimmed.strip_prefix(prefix)?.strip_prefix('/')?;
    rest.parse().ok()
}

fn monitor_response(svc: &ServiceInner, ctx: &RequestContext, id: Uuid) -> Result<Response> {
    let job = svc
        .jobs
        .get(&id)
        .ok_or_else(|| Error::not_found("unknown async job"))?;
    match job.status {
        JobStatus::Pending | JobStatus::Running => Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(header::RETRY_AFTER, RETRY_AFTER_SECS)
            .header("OData-Version", &ctx.version)
            .body(Body::empty())
            .map_err(|e| Error::internal(format!("response assembly failed: {e}"))),
        JobStatus::Succeeded => {
            let response = job.response.as_ref();
            let location = response
                .and_then(|r| {
                    r.headers
                        .iter()
                        .find(|(n, _)| n.eq_ignore_ascii_case("location"))
                        .map(|(_, v)| v.clone())
                })
                .unwrap_or(job.request.target.clone());
            Response::builder()
                .status(StatusCode::SEE_OTHER)
                .header(header::LOCATION, location)
                .header("OData-Version", &ctx.version)
                .body(Body::empty())
                .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
        }
        JobStatus::Failed => {
            let recorded = job
                .response
                .ok_or_else(|| Error::internal("failed job lost its response"))?;
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(recorded.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
            for (name, value) in &recorded.headers {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(recorded.body))
                .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
        }
    }
}

// ───────────────────────── actions & functions ─────────────────────────

/// Resolve the URL against the operation registry; None means "route as an
/// entity request".
async fn try_operation(
    svc: &Arc<ServiceInner>,
    ctx: &RequestContext,
    method: &Method,
    components: &UrlComponents,
    query_pairs: &[(String, String)],
    body: &[u8],
) -> Result<Option<Response>> {
    let is_action = *method == Method::POST;
    if !is_action && *method != Method::GET {
        return Ok(None);
    }

    // Unbound: the first segment is the operation name.
    if svc.model.set(&components.entity_set).is_none() {
        let name = short_name(&components.entity_set);
        let (params, supplied) = operation_parameters(components, query_pairs, body, is_action)?;
        let Some(op) = svc.resolve_operation(name, None, is_action, &supplied) else {
            return Ok(None);
        };
        let response = invoke_operation(svc, ctx, &op.meta, op.handler.clone(), None, params).await?;
        return Ok(Some(response));
    }

    // Bound: `/Set(k)/NS.Operation` — the qualified segment parses as a
    // typecast, or as a trailing segment when unqualified.
    let (bound_name, op_components) = match &components.type_cast {
        Some(cast) if components.key.is_some() => (short_name(cast), components),
        _ => match components.segments.last() {
            Some(seg) if components.key.is_some() => (short_name(&seg.name), components),
            _ => return Ok(None),
        },
    };
    let (params, supplied) = operation_parameters(op_components, query_pairs, body, is_action)?;
    let Some(op) = svc.resolve_operation(
        bound_name,
        Some(components.entity_set.as_str()),
        is_action,
        &supplied,
    ) else {
        return Ok(None);
    };

    let meta = svc
        .model
        .set(&components.entity_set)
        .ok_or_else(|| Error::not_found("unknown entity set"))?;
    let key = components
        .key
        .as_ref()
        .ok_or_else(|| Error::validation("bound operations require an entity key"))?;
    let key_row = resolve_key(meta, key)?;
    let plan = crate::plan::SelectPlan {
        table: meta.table.clone(),
        predicate: Some(crate::handler::row_predicate_for(meta, &key_row)),
        limit: Some(1),
        ..Default::default()
    };
    let bound_row = svc
        .store
        .query(&plan)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found("entity does not exist"))?;

    let response = invoke_operation(
        svc,
        ctx,
        &op.meta,
        op.handler.clone(),
        Some(bound_row),
        params,
    )
    .await?;
    Ok(Some(response))
}

fn short_name(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

/// Collect parameters: action bodies are JSON objects, function parameters
/// arrive inline (`Fn(p=1)`) or as `@alias` query values.
fn operation_parameters(
    components: &UrlComponents,
    query_pairs: &[(String, String)],
    body: &[u8],
    is_action: bool,
) -> Result<(serde_json::Map<String, serde_json::Value>, Vec<String>)> {
    let mut params = serde_json::Map::new();
    if is_action {
        if !body.is_empty() {
            let parsed: serde_json::Value = serde_json::from_slice(body)
                .map_err(|e| Error::validation(format!("malformed parameter body: {e}")))?;
            if let serde_json::Value::Object(map) = parsed {
                params.extend(map);
            }
        }
    } else {
        // Inline parameters parsed as a key-ish list on the last segment.
        let inline = components
            .segments
            .last()
            .and_then(|seg| seg.key.as_ref())
            .or(components.key.as_ref());
        if let Some(inline) = inline {
            for (name, value) in inline {
                if let Some(name) = name {
                    params.insert(name.clone(), value.to_json());
                }
            }
        }
        for (name, value) in query_pairs {
            if let Some(alias) = name.strip_prefix('@') {
                let parsed: serde_json::Value =
                    serde_json::from_str(value).unwrap_or(serde_json::Value::String(value.clone()));
                params.insert(alias.to_string(), parsed);
            }
        }
    }
    let supplied = params.keys().cloned().collect();
    Ok((params, supplied))
}

async fn invoke_operation(
    svc: &Arc<ServiceInner>,
    ctx: &RequestContext,
    meta: &OperationMetadata,
    handler: Arc<dyn crate::service::OperationHandler>,
    bound_row: Option<Row>,
    params: serde_json::Map<String, serde_json::Value>,
) -> Result<Response> {
    if let Some(bound) = &meta.bound_to {
        svc.policy()
            .authorize(ctx.principal.as_ref(), bound, Operation::Invoke)
            .await
            .into_result(ctx.principal.as_ref())?;
    }
    // Declared parameters must be satisfiable from the payload.
    for (name, _) in &meta.parameters {
        if !params.contains_key(name) {
            return Err(Error::validation(format!(
                "missing operation parameter {name}"
            )));
        }
    }
    let op_ctx = OperationContext {
        principal: ctx.principal.as_ref(),
        bound_row: bound_row.as_ref(),
        store: svc.store.as_ref(),
    };
    let result = handler.invoke(&op_ctx, params).await?;
    if meta.return_type.is_none() || result.is_null() {
        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("OData-Version", &ctx.version)
            .body(Body::empty())
            .map_err(|e| Error::internal(format!("response assembly failed: {e}")));
    }
    let body = serde_json::json!({ "value": result });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, json_content_type(ctx.level))
        .header("OData-Version", &ctx.version)
        .body(Body::from(serde_json::to_vec(&body).unwrap_or_default()))
        .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_negotiation() {
        let mut headers = HeaderMap::new();
        assert_eq!(negotiate_version(&headers).unwrap(), "4.01");
        headers.insert("OData-MaxVersion", "4.0".parse().unwrap());
        assert_eq!(negotiate_version(&headers).unwrap(), "4.0");
        headers.insert("OData-MaxVersion", "4.01".parse().unwrap());
        assert_eq!(negotiate_version(&headers).unwrap(), "4.01");
        headers.insert("OData-MaxVersion", "3.0".parse().unwrap());
        let err = negotiate_version(&headers).unwrap_err();
        assert_eq!(err.status().as_u16(), 406);
    }

    #[test]
    fn accept_negotiation() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            negotiate_level(&headers, None).unwrap(),
            MetadataLevel::Minimal
        );
        headers.insert(
            header::ACCEPT,
            "application/json;odata.metadata=full".parse().unwrap(),
        );
        assert_eq!(negotiate_level(&headers, None).unwrap(), MetadataLevel::Full);
        headers.insert(header::ACCEPT, "text/html".parse().unwrap());
        assert_eq!(
            negotiate_level(&headers, None).unwrap_err().status().as_u16(),
            406
        );
        headers.insert(header::ACCEPT, "*/*".parse().unwrap());
        assert_eq!(
            negotiate_level(&headers, None).unwrap(),
            MetadataLevel::Minimal
        );
    }

    #[test]
    fn prefer_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            PREFER.clone(),
            "return=minimal, odata.maxpagesize=50, respond-async"
                .parse()
                .unwrap(),
        );
        let prefs = Preferences::parse(&headers);
        assert_eq!(prefs.return_minimal, Some(true));
        assert_eq!(prefs.max_page_size, Some(50));
        assert!(prefs.respond_async);
        assert!(!prefs.track_changes);
    }
}
