use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::Response;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::router::{PendingChange, RequestContext, dispatch, dispatch_with_tx};
use crate::service::ServiceInner;

/// One sub-request of a batch, either encoding.
#[derive(Debug, Clone)]
struct SubRequest {
    content_id: Option<String>,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    depends_on: Vec<String>,
}

enum BatchItem {
    Single(SubRequest),
    Changeset(Vec<SubRequest>),
}

struct SubResponse {
    content_id: Option<String>,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Entry point for `POST $batch`: multipart/mixed or JSON encoding, atomic
/// changesets, Content-ID cross-referencing.
pub(crate) async fn execute(
    svc: Arc<ServiceInner>,
    ctx: &RequestContext,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (items, multipart) = if content_type.starts_with("multipart/mixed") {
        let boundary = boundary_of(content_type).ok_or_else(|| Error::validation(
            "multipart batch requires a boundary parameter",
        ))?;
        let text = std::str::from_utf8(body)
            .map_err(|_| Error::validation("batch body must be UTF-8"))?;
        (parse_multipart(text, &boundary)?, true)
    } else if content_type.starts_with("application/json") {
        (parse_json_batch(body)?, false)
    } else {
        return Err(Error::UnsupportedMediaType {
            message: format!("unsupported batch content type: {content_type}"),
        });
    };

    let total: usize = items
        .iter()
        .map(|item| match item {
            BatchItem::Single(_) => 1,
            BatchItem::Changeset(members) => members.len(),
        })
        .sum();
    if total > svc.config.max_batch_size {
        return Err(Error::PayloadTooLarge {
            message: format!(
                "batch contains {total} requests, the limit is {}",
                svc.config.max_batch_size
            ),
        });
    }

    let mut responses: Vec<SubResponse> = Vec::new();
    // Content-ID → canonical URL of the created/addressed entity.
    let mut cid_map: HashMap<String, String> = HashMap::new();
    // Request id → final status, for dependsOn checks.
    let mut statuses: HashMap<String, u16> = HashMap::new();

    for item in items {
        match item {
            BatchItem::Single(request) => {
                if let Some(blocked) = dependency_failure(&request, &statuses) {
                    responses.push(blocked);
                    continue;
                }
                let response = match resolve_refs(&request, &cid_map, &ctx.base) {
                    Ok(resolved) => run_single(&svc, ctx, &resolved).await,
                    Err(e) => error_sub_response(&request, e, &ctx.version),
                };
                note_response(&request, &response, &mut cid_map, &mut statuses);
                responses.push(response);
            }
            BatchItem::Changeset(members) => {
                let group = run_changeset(&svc, ctx, &members, &mut cid_map).await?;
                for (request, response) in members.iter().zip(&group) {
                    if let Some(id) = &request.content_id {
                        statuses.insert(id.clone(), response.status);
                    }
                }
                responses.extend(group);
            }
        }
    }

    if multipart {
        multipart_response(&responses, &ctx.version)
    } else {
        json_response(&responses, &ctx.version)
    }
}

/// Top-level requests run sequentially with no shared transaction.
async fn run_single(
    svc: &Arc<ServiceInner>,
    ctx: &RequestContext,
    request: &SubRequest,
) -> SubResponse {
    let (method, uri, headers) = match request_parts(request, &ctx.base) {
        Ok(parts) => parts,
        Err(e) => return error_sub_response(request, e, &ctx.version),
    };
    let response = dispatch(svc.clone(), method, &uri, headers, &request.body, true).await;
    into_sub_response(request, response).await
}

/// Changeset members share one transaction; any failure rolls the whole
/// group back and every member reports an error.
async fn run_changeset(
    svc: &Arc<ServiceInner>,
    ctx: &RequestContext,
    members: &[SubRequest],
    cid_map: &mut HashMap<String, String>,
) -> Result<Vec<SubResponse>> {
    if members.is_empty() {
        return Err(Error::validation("a changeset must not be empty"));
    }
    let tx = svc.store.begin().await?;
    let shared = Arc::new(tokio::sync::Mutex::new(tx));
    let pending: Arc<std::sync::Mutex<Vec<PendingChange>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut group: Vec<SubResponse> = Vec::new();
    let mut group_cids: HashMap<String, String> = HashMap::new();
    let mut failed = false;

    for request in members {
        if failed {
            group.push(error_sub_response(
                request,
                Error::validation("changeset aborted by an earlier failure"),
                &ctx.version,
            ));
            continue;
        }
        let mut combined = cid_map.clone();
        combined.extend(group_cids.clone());
        let resolved = match resolve_refs(request, &combined, &ctx.base) {
            Ok(resolved) => resolved,
            Err(e) => {
                failed = true;
                group.push(error_sub_response(request, e, &ctx.version));
                continue;
            }
        };
        let (method, uri, headers) = match request_parts(&resolved, &ctx.base) {
            Ok(parts) => parts,
            Err(e) => {
                failed = true;
                group.push(error_sub_response(request, e, &ctx.version));
                continue;
            }
        };
        let response = dispatch_with_tx(
            svc.clone(),
            method,
            &uri,
            headers,
            &resolved.body,
            shared.clone(),
            pending.clone(),
        )
        .await;
        let sub = into_sub_response(request, response).await;
        if sub.status >= 400 {
            failed = true;
        } else if let (Some(id), Some(url)) = (&request.content_id, location_of(&sub)) {
            group_cids.insert(id.clone(), url);
        }
        group.push(sub);
    }

    let tx = Arc::try_unwrap(shared)
        .map_err(|_| Error::internal("changeset transaction is still referenced"))?
        .into_inner();
    if failed {
        let _ = tx.rollback().await;
        // Every member of a failed group reports an error.
        for sub in group.iter_mut() {
            if sub.status < 400 {
                *sub = error_sub_response_raw(
                    sub.content_id.clone(),
                    Error::validation("changeset rolled back"),
                    &ctx.version,
                );
            }
        }
    } else {
        tx.commit().await?;
        for change in pending.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            svc.tracker
                .record(&change.set, change.operation, change.key, change.snapshot);
        }
        cid_map.extend(group_cids);
    }
    Ok(group)
}

fn dependency_failure(
    request: &SubRequest,
    statuses: &HashMap<String, u16>,
) -> Option<SubResponse> {
    for dep in &request.depends_on {
        let ok = statuses.get(dep).is_some_and(|s| *s < 400);
        if !ok {
            return Some(SubResponse {
                content_id: request.content_id.clone(),
                status: StatusCode::FAILED_DEPENDENCY.as_u16(),
                headers: vec![("Content-Type".into(), "application/json".into())],
                body: serde_json::json!({
                    "error": {
                        "code": "FailedDependency",
                        "message": format!("request {dep} did not complete successfully"),
                    }
                })
                .to_string()
                .into_bytes(),
            });
        }
    }
    None
}

/// `$<cid>` placeholders resolve to the canonical URL of an earlier request.
fn resolve_refs(
    request: &SubRequest,
    cid_map: &HashMap<String, String>,
    _base: &str,
) -> Result<SubRequest> {
    let mut resolved = request.clone();
    if let Some(rest) = resolved.url.strip_prefix('$') {
        let (cid, tail) = match rest.split_once('/') {
            Some((cid, tail)) => (cid, format!("/{tail}")),
            None => (rest, String::new()),
        };
        if !cid.is_empty() && cid != "batch" && !cid.starts_with('$') {
            let target = cid_map.get(cid).ok_or_else(|| {
                Error::validation(format!("unresolved Content-ID reference ${cid}"))
            })?;
            resolved.url = format!("{target}{tail}");
        }
    }
    if !resolved.body.is_empty() {
        if let Ok(text) = std::str::from_utf8(&resolved.body) {
            let mut replaced = text.to_string();
            for (cid, url) in cid_map {
                replaced = replaced
                    .replace(&format!("\"${cid}\""), &format!("\"{url}\""))
                    .replace(&format!("\"${cid}/"), &format!("\"{url}/"));
            }
            resolved.body = replaced.into_bytes();
        }
    }
    Ok(resolved)
}

fn request_parts(request: &SubRequest, base: &str) -> Result<(Method, Uri, HeaderMap)> {
    let method: Method = request
        .method
        .parse()
        .map_err(|_| Error::validation(format!("invalid method {}", request.method)))?;
    let mut url = request.url.clone();
    // Absolute URLs reduce to their path and query.
    if let Some(idx) = url.find("://") {
        let after = &url[idx + 3..];
        url = match after.find('/') {
            Some(slash) => after[slash..].to_string(),
            None => "/".to_string(),
        };
    }
    if !url.starts_with('/') {
        url = format!("{base}/{url}");
    }
    let uri: Uri = url
        .parse()
        .map_err(|_| Error::validation(format!("invalid sub-request url {url}")))?;
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<axum::http::HeaderName>(),
            value.parse::<axum::http::HeaderValue>(),
        ) {
            headers.insert(name, value);
        }
    }
    Ok((method, uri, headers))
}

async fn into_sub_response(request: &SubRequest, response: Response) -> SubResponse {
    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
        .collect();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();
    SubResponse {
        content_id: request.content_id.clone(),
        status,
        headers,
        body,
    }
}

fn error_sub_response(request: &SubRequest, error: Error, version: &str) -> SubResponse {
    error_sub_response_raw(request.content_id.clone(), error, version)
}

fn error_sub_response_raw(
    content_id: Option<String>,
    error: Error,
    _version: &str,
) -> SubResponse {
    let status = error.status().as_u16();
    let body = serde_json::json!({
        "error": { "code": error.code(), "message": error.to_string() }
    });
    SubResponse {
        content_id,
        status,
        headers: vec![("Content-Type".into(), "application/json".into())],
        body: body.to_string().into_bytes(),
    }
}

fn note_response(
    request: &SubRequest,
    response: &SubResponse,
    cid_map: &mut HashMap<String, String>,
    statuses: &mut HashMap<String, u16>,
) {
    if let Some(id) = &request.content_id {
        statuses.insert(id.clone(), response.status);
        if let Some(url) = location_of(response) {
            cid_map.insert(id.clone(), url);
        }
    }
}

fn location_of(response: &SubResponse) -> Option<String> {
    response
        .headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("location") || n.eq_ignore_ascii_case("odata-entityid"))
        .map(|(_, v)| v.clone())
}

// ───────────────────────── multipart encoding ─────────────────────────

fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("boundary=")
            .map(|b| b.trim_matches('"').to_string())
    })
}

fn parse_multipart(text: &str, boundary: &str) -> Result<Vec<BatchItem>> {
    let mut items = Vec::new();
    for part in split_parts(text, boundary)? {
        let (headers, payload) = split_mime_headers(&part)?;
        let content_type = header_value(&headers, "content-type").unwrap_or_default();
        if content_type.starts_with("multipart/mixed") {
            let inner_boundary = boundary_of(&content_type).ok_or_else(|| {
                Error::validation("changeset part is missing its boundary")
            })?;
            let mut members = Vec::new();
            for inner in split_parts(&payload, &inner_boundary)? {
                members.push(parse_http_part(&inner)?);
            }
            items.push(BatchItem::Changeset(members));
        } else {
            items.push(BatchItem::Single(parse_http_part(&part)?));
        }
    }
    Ok(items)
}

/// Split a multipart body into its parts, exclusive of the delimiters.
fn split_parts(text: &str, boundary: &str) -> Result<Vec<String>> {
    let open = format!("--{boundary}");
    let close = format!("--{boundary}--");
    let mut parts = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in text.lines() {
        let trimmed = line.trim_end_matches('\r');
        if trimmed == close {
            if let Some(lines) = current.take() {
                parts.push(lines.join("\n"));
            }
            break;
        }
        if trimmed == open {
            if let Some(lines) = current.take() {
                parts.push(lines.join("\n"));
            }
            current = Some(Vec::new());
            continue;
        }
        if let Some(lines) = current.as_mut() {
            lines.push(trimmed);
        }
    }
    if parts.is_empty() {
        return Err(Error::validation("batch body contains no parts"));
    }
    Ok(parts)
}

/// A part wrapping `application/http`: MIME headers, blank line, then the
/// embedded HTTP request.
fn parse_http_part(part: &str) -> Result<SubRequest> {
    let (mime_headers, payload) = split_mime_headers(part)?;
    let content_id = header_value(&mime_headers, "content-id");

    let mut lines = payload.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| Error::validation("empty request in batch part"))?;
    let mut words = request_line.split_whitespace();
    let method = words
        .next()
        .ok_or_else(|| Error::validation("missing method in batch request line"))?
        .to_string();
    let url = words
        .next()
        .ok_or_else(|| Error::validation("missing URL in batch request line"))?
        .to_string();

    let mut headers = Vec::new();
    let mut body_lines = Vec::new();
    let mut in_body = false;
    for line in lines {
        if in_body {
            body_lines.push(line);
            continue;
        }
        if line.trim().is_empty() {
            in_body = true;
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(SubRequest {
        content_id,
        method,
        url,
        headers,
        body: body_lines.join("\n").trim().as_bytes().to_vec(),
        depends_on: Vec::new(),
    })
}

fn split_mime_headers(part: &str) -> Result<(Vec<(String, String)>, String)> {
    let mut headers = Vec::new();
    let mut rest = Vec::new();
    let mut in_payload = false;
    for line in part.lines() {
        if in_payload {
            rest.push(line);
            continue;
        }
        if line.trim().is_empty() {
            in_payload = true;
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok((headers, rest.join("\n")))
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn multipart_response(responses: &[SubResponse], version: &str) -> Result<Response> {
    let boundary = format!("batchresponse_{}", Uuid::new_v4());
    let mut out = String::new();
    for sub in responses {
        out.push_str(&format!("--{boundary}\r\n"));
        out.push_str("Content-Type: application/http\r\n");
        if let Some(id) = &sub.content_id {
            out.push_str(&format!("Content-ID: {id}\r\n"));
        }
        out.push_str("\r\n");
        let reason = StatusCode::from_u16(sub.status)
            .map(|s| s.canonical_reason().unwrap_or(""))
            .unwrap_or("");
        out.push_str(&format!("HTTP/1.1 {} {reason}\r\n", sub.status));
        for (name, value) in &sub.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.push_str(&String::from_utf8_lossy(&sub.body));
        out.push_str("\r\n");
    }
    out.push_str(&format!("--{boundary}--\r\n"));
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/mixed; boundary={boundary}"),
        )
        .header("OData-Version", version)
        .body(Body::from(out))
        .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
}

fn json_response(responses: &[SubResponse], version: &str) -> Result<Response> {
    let rendered: Vec<serde_json::Value> = responses
        .iter()
        .map(|sub| {
            let headers: serde_json::Map<String, serde_json::Value> = sub
                .headers
                .iter()
                .map(|(n, v)| (n.clone(), serde_json::json!(v)))
                .collect();
            let body: serde_json::Value =
                serde_json::from_slice(&sub.body).unwrap_or(serde_json::Value::Null);
            serde_json::json!({
                "id": sub.content_id,
                "status": sub.status,
                "headers": headers,
                "body": body,
            })
        })
        .collect();
    let body = serde_json::json!({ "responses": rendered });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header("OData-Version", version)
        .body(Body::from(serde_json::to_vec(&body).unwrap_or_default()))
        .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
}

// ───────────────────────── JSON encoding ─────────────────────────

fn parse_json_batch(body: &[u8]) -> Result<Vec<BatchItem>> {
    #[derive(serde::Deserialize)]
    struct JsonBatch {
        requests: Vec<JsonRequest>,
    }
    #[derive(serde::Deserialize)]
    struct JsonRequest {
        id: String,
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
        #[serde(rename = "atomicityGroup")]
        atomicity_group: Option<String>,
        #[serde(rename = "dependsOn", default)]
        depends_on: Vec<String>,
    }

    let parsed: JsonBatch = serde_json::from_slice(body)
        .map_err(|e| Error::validation(format!("malformed JSON batch: {e}")))?;

    let mut items: Vec<BatchItem> = Vec::new();
    let mut current_group: Option<(String, Vec<SubRequest>)> = None;
    for request in parsed.requests {
        let sub = SubRequest {
            content_id: Some(request.id),
            method: request.method,
            url: request.url,
            headers: request.headers.into_iter().collect(),
            body: request
                .body
                .map(|b| serde_json::to_vec(&b).unwrap_or_default())
                .unwrap_or_default(),
            depends_on: request.depends_on,
        };
        match (&mut current_group, request.atomicity_group) {
            (Some((group, members)), Some(next)) if *group == next => {
                members.push(sub);
            }
            (current, next) => {
                if let Some((_, members)) = current.take() {
                    items.push(BatchItem::Changeset(members));
                }
                match next {
                    Some(group) => *current = Some((group, vec![sub])),
                    None => items.push(BatchItem::Single(sub)),
                }
            }
        }
    }
    if let Some((_, members)) = current_group.take() {
        items.push(BatchItem::Changeset(members));
    }
    Ok(items)
}
