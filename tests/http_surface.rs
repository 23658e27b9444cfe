//! End-to-end coverage of the HTTP surface against the in-memory store:
//! the boundary scenarios plus the cross-cutting properties (canonical
//! URLs, ETags, pagination, changesets, delta links, async monitors).

mod support;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use tower::util::ServiceExt;

use odata_server::hooks::{Decision, Operation, Policy, Principal};
use odata_server::{EdmType, EntityMetadata, NavigationMetadata, PropertyMetadata, Service};
use support::{MemStore, products_store};

fn build_service(store: &MemStore) -> Service {
    service_builder(store).build(Arc::new(store.clone())).unwrap()
}

fn service_builder(_store: &MemStore) -> odata_server::ServiceBuilder {
    Service::builder("Shop", "Container")
        .base_path("/odata")
        .entity_set(
            EntityMetadata::new("Products", "Product", "products")
                .property(
                    PropertyMetadata::new("ID", EdmType::Int32)
                        .markers("key,computed")
                        .unwrap(),
                )
                .property(
                    PropertyMetadata::new("Name", EdmType::String)
                        .markers("required")
                        .unwrap(),
                )
                .property(
                    PropertyMetadata::new("Price", EdmType::Double)
                        .markers("etag")
                        .unwrap(),
                )
                .navigation(
                    NavigationMetadata::collection("Descriptions", "ProductDescriptions")
                        .foreign_key("ID", "ProductID"),
                ),
        )
        .entity_set(
            EntityMetadata::new(
                "ProductDescriptions",
                "ProductDescription",
                "product_descriptions",
            )
            .property(PropertyMetadata::new("ID", EdmType::Int32).markers("key").unwrap())
            .property(PropertyMetadata::new("ProductID", EdmType::Int32).markers("required").unwrap())
            .property(PropertyMetadata::new("LanguageKey", EdmType::String).markers("required").unwrap())
            .property(PropertyMetadata::new("Text", EdmType::String))
            .navigation(
                NavigationMetadata::single("Product", "Products").foreign_key("ProductID", "ID"),
            ),
        )
}

fn router(store: &MemStore) -> Router {
    build_service(store).into_router()
}

async fn send(
    app: &Router,
    method: &str,
    target: &str,
    headers: &[(&str, &str)],
    body: Option<serde_json::Value>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(target);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, headers, bytes)
}

fn json(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null)
}

// ───────────────────────── boundary scenarios ─────────────────────────

#[tokio::test]
async fn filter_orderby_top_count() {
    let store = products_store();
    let app = router(&store);
    let (status, _, body) = send(
        &app,
        "GET",
        "/odata/Products?$filter=Price%20gt%20500&$orderby=Price%20desc&$top=2&$count=true",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["@odata.count"], 2);
    let names: Vec<&str> = body["value"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["Name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Laptop", "Smartphone"]);
    assert!(body.get("@odata.nextLink").is_none());
}

#[tokio::test]
async fn create_sets_location_and_entity_id() {
    let store = products_store();
    let app = router(&store);
    let (status, headers, body) = send(
        &app,
        "POST",
        "/odata/Products",
        &[],
        Some(serde_json::json!({"Name": "X", "Price": 1.0})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        headers.get("Location").unwrap(),
        "/odata/Products(6)"
    );
    assert_eq!(
        headers.get("OData-EntityId").unwrap(),
        "/odata/Products(6)"
    );
    let body = json(&body);
    assert_eq!(body["ID"], 6);

    // P3: the Location answers a GET with the same entity.
    let (status, _, fetched) = send(&app, "GET", "/odata/Products(6)", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&fetched)["Name"], "X");
}

#[tokio::test]
async fn stale_if_match_yields_412_and_no_change() {
    let store = products_store();
    let app = router(&store);
    let (status, _, body) = send(
        &app,
        "PATCH",
        "/odata/Products(1)",
        &[("If-Match", "W/\"not-the-current-etag\"")],
        Some(serde_json::json!({"Price": 123.0})),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(json(&body)["error"]["code"], "PreconditionFailed");

    let (_, _, current) = send(&app, "GET", "/odata/Products(1)", &[], None).await;
    assert_eq!(json(&current)["Price"], 999.99);
}

#[tokio::test]
async fn expand_with_nested_options_is_two_round_trips() {
    let store = products_store();
    let app = router(&store);
    store.reset_query_count();
    let (status, _, body) = send(
        &app,
        "GET",
        "/odata/Products?$expand=Descriptions($filter=LanguageKey%20eq%20%27EN%27;$top=1)&$top=1",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    let first = &body["value"][0];
    assert_eq!(first["Name"], "Laptop");
    let descriptions = first["Descriptions"].as_array().unwrap();
    assert_eq!(descriptions.len(), 1);
    assert_eq!(descriptions[0]["LanguageKey"], "EN");
    assert_eq!(
        store.query_count(),
        2,
        "one query for parents, one batched query for children"
    );
}

#[tokio::test]
async fn changeset_is_atomic() {
    let store = products_store();
    let app = router(&store);
    let before = store.row_count("product_descriptions");

    // Second member reuses an existing key: the whole group must roll back.
    let batch = serde_json::json!({
        "requests": [
            {"id": "1", "method": "POST", "url": "ProductDescriptions", "atomicityGroup": "g1",
             "body": {"ID": 50, "ProductID": 3, "LanguageKey": "EN", "Text": "A chair"}},
            {"id": "2", "method": "POST", "url": "ProductDescriptions", "atomicityGroup": "g1",
             "body": {"ID": 1, "ProductID": 3, "LanguageKey": "DE", "Text": "Ein Stuhl"}}
        ]
    });
    let (status, _, body) = send(&app, "POST", "/odata/$batch", &[], Some(batch)).await;
    assert_eq!(status, StatusCode::OK);
    let responses = json(&body)["responses"].as_array().unwrap().clone();
    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r["status"].as_u64().unwrap() >= 400));
    assert_eq!(store.row_count("product_descriptions"), before);

    let (_, _, count) = send(&app, "GET", "/odata/ProductDescriptions/$count", &[], None).await;
    assert_eq!(String::from_utf8(count).unwrap(), before.to_string());
}

#[tokio::test]
async fn metadata_versions_and_cache() {
    let store = products_store();
    let app = router(&store);
    let (status, headers, body) = send(
        &app,
        "GET",
        "/odata/$metadata",
        &[("OData-MaxVersion", "4.0")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("OData-Version").unwrap(), "4.0");
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains(r#"Version="4.0""#));
    let first_etag = headers.get("ETag").unwrap().clone();

    let (_, headers_401, body_401) = send(
        &app,
        "GET",
        "/odata/$metadata",
        &[("OData-MaxVersion", "4.01")],
        None,
    )
    .await;
    assert_eq!(headers_401.get("OData-Version").unwrap(), "4.01");
    assert!(String::from_utf8(body_401).unwrap().contains(r#"Version="4.01""#));

    // Same version again: served from cache with the identical ETag.
    let (_, headers_repeat, _) = send(
        &app,
        "GET",
        "/odata/$metadata",
        &[("OData-MaxVersion", "4.0")],
        None,
    )
    .await;
    assert_eq!(headers_repeat.get("ETag").unwrap(), &first_etag);

    // Pre-4.0 clients are not serveable.
    let (status, _, _) = send(
        &app,
        "GET",
        "/odata/$metadata",
        &[("OData-MaxVersion", "3.0")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
}

// ───────────────────────── universal properties ─────────────────────────

#[tokio::test]
async fn repeated_reads_are_stable_and_etags_deterministic() {
    let store = products_store();
    let app = router(&store);
    let (_, headers_a, body_a) = send(&app, "GET", "/odata/Products(1)", &[], None).await;
    let (_, headers_b, body_b) = send(&app, "GET", "/odata/Products(1)", &[], None).await;
    assert_eq!(json(&body_a), json(&body_b));
    let etag_a = headers_a.get("ETag").unwrap().clone();
    assert_eq!(headers_b.get("ETag").unwrap(), &etag_a);

    // A mutation changes the ETag.
    let (status, _, _) = send(
        &app,
        "PATCH",
        "/odata/Products(1)",
        &[],
        Some(serde_json::json!({"Price": 1099.99})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, headers_c, _) = send(&app, "GET", "/odata/Products(1)", &[], None).await;
    assert_ne!(headers_c.get("ETag").unwrap(), &etag_a);
}

#[tokio::test]
async fn pagination_concatenates_to_the_full_result() {
    let store = products_store();
    let app = router(&store);
    let (_, _, single) = send(
        &app,
        "GET",
        "/odata/Products?$orderby=Price%20desc",
        &[],
        None,
    )
    .await;
    let all: Vec<serde_json::Value> = json(&single)["value"].as_array().unwrap().clone();
    assert_eq!(all.len(), 5);

    let mut collected = Vec::new();
    let mut target = "/odata/Products?$orderby=Price%20desc".to_string();
    let mut hops = 0;
    loop {
        let (status, _, page) = send(
            &app,
            "GET",
            &target,
            &[("Prefer", "odata.maxpagesize=2")],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let page = json(&page);
        collected.extend(page["value"].as_array().unwrap().clone());
        match page.get("@odata.nextLink").and_then(|v| v.as_str()) {
            Some(next) => target = next.to_string(),
            None => break,
        }
        hops += 1;
        assert!(hops < 10, "nextLink chain does not terminate");
    }
    assert_eq!(collected, all);
}

struct ReadOnlyPolicy;

#[async_trait::async_trait]
impl Policy for ReadOnlyPolicy {
    async fn authorize(
        &self,
        principal: Option<&Principal>,
        _set: &str,
        operation: Operation,
    ) -> Decision {
        match operation {
            Operation::ReadCollection | Operation::ReadEntity => Decision::Allow,
            _ if principal.is_some() => Decision::Allow,
            _ => Decision::deny("writes require authentication"),
        }
    }
}

#[tokio::test]
async fn denied_writes_leave_the_store_unchanged() {
    let store = products_store();
    let service = service_builder(&store)
        .policy(Arc::new(ReadOnlyPolicy))
        .build(Arc::new(store.clone()))
        .unwrap();
    let app = service.into_router();

    let before = store.row_count("products");
    let (status, headers, body) = send(
        &app,
        "POST",
        "/odata/Products",
        &[],
        Some(serde_json::json!({"Name": "Nope", "Price": 5.0})),
    )
    .await;
    // Anonymous caller: 401 with a challenge.
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.get("WWW-Authenticate").is_some());
    assert_eq!(json(&body)["error"]["code"], "Unauthenticated");
    assert_eq!(store.row_count("products"), before);

    // Reads still work.
    let (status, _, _) = send(&app, "GET", "/odata/Products", &[], None).await;
    assert_eq!(status, StatusCode::OK);
}

// ───────────────────────── additional surface ─────────────────────────

#[tokio::test]
async fn service_document_lists_sets() {
    let store = products_store();
    let app = router(&store);
    let (status, _, body) = send(&app, "GET", "/odata/", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    let names: Vec<&str> = body["value"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"Products"));
    assert!(names.contains(&"ProductDescriptions"));
}

#[tokio::test]
async fn property_and_raw_value() {
    let store = products_store();
    let app = router(&store);
    let (status, _, body) = send(&app, "GET", "/odata/Products(1)/Name", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["value"], "Laptop");

    let (status, headers, body) =
        send(&app, "GET", "/odata/Products(1)/Name/$value", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("Content-Type").unwrap().to_str().unwrap(),
        "text/plain"
    );
    assert_eq!(body, b"Laptop");
}

#[tokio::test]
async fn navigation_fetch_with_nested_filter() {
    let store = products_store();
    let app = router(&store);
    let (status, _, body) = send(
        &app,
        "GET",
        "/odata/Products(1)/Descriptions?$filter=LanguageKey%20eq%20%27DE%27",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value = json(&body)["value"].as_array().unwrap().clone();
    assert_eq!(value.len(), 1);
    assert_eq!(value[0]["LanguageKey"], "DE");

    // Lambda over the same navigation.
    let (status, _, body) = send(
        &app,
        "GET",
        "/odata/Products?$filter=Descriptions/any(d:%20d/LanguageKey%20eq%20%27DE%27)",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value = json(&body)["value"].as_array().unwrap().clone();
    assert_eq!(value.len(), 1);
    assert_eq!(value[0]["Name"], "Laptop");
}

#[tokio::test]
async fn unknown_set_option_and_method_errors() {
    let store = products_store();
    let app = router(&store);
    let (status, _, _) = send(&app, "GET", "/odata/Nope", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, "GET", "/odata/Products?$bogus=1", &[], None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, "GET", "/odata/Products?$top=-1", &[], None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, "GET", "/elsewhere/Products", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn apply_groupby_aggregates() {
    let store = products_store();
    let app = router(&store);
    let (status, _, body) = send(
        &app,
        "GET",
        "/odata/ProductDescriptions?$apply=groupby((LanguageKey),aggregate($count%20as%20Cnt))",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value = json(&body)["value"].as_array().unwrap().clone();
    assert_eq!(value.len(), 2, "EN and DE groups: {value:?}");
    let en = value
        .iter()
        .find(|v| v["LanguageKey"] == "EN")
        .expect("EN group");
    assert_eq!(en["Cnt"], 2);
}

#[tokio::test]
async fn search_falls_back_to_in_memory_matching() {
    let store = products_store();
    let app = router(&store);
    let (status, _, body) = send(
        &app,
        "GET",
        "/odata/Products?$search=laptop",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value = json(&body)["value"].as_array().unwrap().clone();
    assert_eq!(value.len(), 1);
    assert_eq!(value[0]["Name"], "Laptop");
}

#[tokio::test]
async fn delta_tracking_round_trip() {
    let store = products_store();
    let service = service_builder(&store)
        .track_changes(true)
        .build(Arc::new(store.clone()))
        .unwrap();
    let app = service.into_router();

    let (_, _, body) = send(
        &app,
        "GET",
        "/odata/Products",
        &[("Prefer", "odata.track-changes")],
        None,
    )
    .await;
    let delta_link = json(&body)["@odata.deltaLink"]
        .as_str()
        .expect("delta link present")
        .to_string();

    // One create and one delete after the token was handed out.
    let (status, _, _) = send(
        &app,
        "POST",
        "/odata/Products",
        &[],
        Some(serde_json::json!({"Name": "Desk", "Price": 120.0})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _, _) = send(&app, "DELETE", "/odata/Products(2)", &[], None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, body) = send(&app, "GET", &delta_link, &[], None).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    let value = body["value"].as_array().unwrap();
    assert_eq!(value.len(), 2);
    assert!(value.iter().any(|v| v["Name"] == "Desk"));
    assert!(
        value
            .iter()
            .any(|v| v.get("@removed").is_some() && v["ID"] == 2)
    );
    assert!(body["@odata.deltaLink"].as_str().is_some());
}

#[tokio::test]
async fn respond_async_returns_a_monitor() {
    let store = products_store();
    let app = router(&store);
    let (status, headers, _) = send(
        &app,
        "GET",
        "/odata/Products(1)",
        &[("Prefer", "respond-async")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(headers.get("Preference-Applied").unwrap(), "respond-async");
    assert!(headers.get("Retry-After").is_some());
    let monitor = headers.get("Location").unwrap().to_str().unwrap().to_string();
    assert!(monitor.starts_with("/odata/$async/"));

    // Poll until the worker finishes; a successful job redirects.
    for _ in 0..100 {
        let (status, headers, _) = send(&app, "GET", &monitor, &[], None).await;
        if status == StatusCode::SEE_OTHER {
            assert!(headers.get("Location").is_some());
            return;
        }
        assert_eq!(status, StatusCode::ACCEPTED, "unexpected monitor status");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("async job never completed");
}

#[tokio::test]
async fn batch_content_id_references() {
    let store = products_store();
    let app = router(&store);
    let batch = serde_json::json!({
        "requests": [
            {"id": "1", "method": "POST", "url": "Products",
             "body": {"Name": "Lamp", "Price": 45.0}},
            {"id": "2", "method": "GET", "url": "$1", "dependsOn": ["1"]}
        ]
    });
    let (status, _, body) = send(&app, "POST", "/odata/$batch", &[], Some(batch)).await;
    assert_eq!(status, StatusCode::OK);
    let responses = json(&body)["responses"].as_array().unwrap().clone();
    assert_eq!(responses[0]["status"], 201);
    assert_eq!(responses[1]["status"], 200);
    assert_eq!(responses[1]["body"]["Name"], "Lamp");
}

#[tokio::test]
async fn batch_size_cap_yields_413() {
    let store = products_store();
    let service = service_builder(&store)
        .max_batch_size(1)
        .build(Arc::new(store.clone()))
        .unwrap();
    let app = service.into_router();
    let batch = serde_json::json!({
        "requests": [
            {"id": "1", "method": "GET", "url": "Products"},
            {"id": "2", "method": "GET", "url": "Products"}
        ]
    });
    let (status, _, _) = send(&app, "POST", "/odata/$batch", &[], Some(batch)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn put_replaces_unmentioned_properties() {
    let store = products_store();
    let app = router(&store);
    let (status, _, _) = send(
        &app,
        "PUT",
        "/odata/Products(4)",
        &[],
        Some(serde_json::json!({"Name": "Trackball"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, _, body) = send(&app, "GET", "/odata/Products(4)", &[], None).await;
    let body = json(&body);
    assert_eq!(body["Name"], "Trackball");
    assert_eq!(body["Price"], serde_json::Value::Null);
}

#[tokio::test]
async fn ref_bind_and_unbind() {
    let store = products_store();
    let app = router(&store);

    // Rebind description 3 (Smartphone's) onto the Chair.
    let (status, _, _) = send(
        &app,
        "POST",
        "/odata/Products(3)/Descriptions/$ref",
        &[],
        Some(serde_json::json!({"@odata.id": "/odata/ProductDescriptions(3)"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, _, body) = send(&app, "GET", "/odata/Products(3)/Descriptions", &[], None).await;
    assert_eq!(json(&body)["value"].as_array().unwrap().len(), 1);

    // Refs payloads carry only @odata.id.
    let (_, _, body) = send(
        &app,
        "GET",
        "/odata/Products(3)/Descriptions/$ref",
        &[],
        None,
    )
    .await;
    let refs = json(&body)["value"].as_array().unwrap().clone();
    assert_eq!(refs[0]["@odata.id"], "/odata/ProductDescriptions(3)");
    assert!(refs[0].get("Text").is_none());

    // Unbind requires the member key for collection navigations.
    let (status, _, _) = send(
        &app,
        "DELETE",
        "/odata/Products(3)/Descriptions(3)/$ref",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, _, body) = send(&app, "GET", "/odata/Products(3)/Descriptions", &[], None).await;
    assert_eq!(json(&body)["value"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn options_and_head() {
    let store = products_store();
    let app = router(&store);
    let (status, headers, _) = send(&app, "OPTIONS", "/odata/Products", &[], None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(
        headers
            .get("Allow")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("GET")
    );

    let (status, headers, body) = send(&app, "HEAD", "/odata/Products(1)", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("Content-Type").is_some());
    assert!(body.is_empty());
}

#[tokio::test]
async fn metadata_levels_shape_annotations() {
    let store = products_store();
    let app = router(&store);
    let (_, _, body) = send(
        &app,
        "GET",
        "/odata/Products(1)",
        &[("Accept", "application/json;odata.metadata=full")],
        None,
    )
    .await;
    let body = json(&body);
    assert_eq!(body["@odata.id"], "/odata/Products(1)");
    assert_eq!(body["@odata.type"], "#Shop.Product");

    let (_, _, body) = send(
        &app,
        "GET",
        "/odata/Products(1)",
        &[("Accept", "application/json;odata.metadata=none")],
        None,
    )
    .await;
    let body = json(&body);
    assert!(body.get("@odata.context").is_none());

    let (status, _, _) = send(
        &app,
        "GET",
        "/odata/Products(1)",
        &[("Accept", "text/html")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
}
