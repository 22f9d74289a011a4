mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{doc, sales};
use crmsync_client::shared::{FetchError, FetchParams, WriteTarget};
use crmsync_client::{FetchClient, HttpFetchClient, TokenProvider};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint(server: &MockServer) -> String {
    format!("{}/fetch", server.uri())
}

struct StaticToken;

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        Some("t0ken".into())
    }
}

// ── Reads ───────────────────────────────────────────────────────

#[tokio::test]
async fn get_posts_a_job_and_parses_documents() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fetch"))
        .and(body_partial_json(json!({
            "job": "get",
            "store": "sales",
            "collection": "sales",
            "filter": { "approved": true },
            "sort": { "no": -1 },
            "limit": 20
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "s2", "no": 1002 },
            { "id": "s1", "no": 1001 }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpFetchClient::new(endpoint(&server));
    let params = FetchParams::new()
        .filter("approved", true)
        .sort_desc("no")
        .limit(20);
    let docs = client.get(&sales(), &params).await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0], doc(json!({ "id": "s2", "no": 1002 })));
}

#[tokio::test]
async fn wrapped_result_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [{ "id": "a" }] })))
        .mount(&server)
        .await;

    let client = HttpFetchClient::new(endpoint(&server));
    let docs = client.get(&sales(), &FetchParams::new()).await.unwrap();
    assert_eq!(docs, vec![doc(json!({ "id": "a" }))]);
}

#[tokio::test]
async fn server_error_maps_to_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = HttpFetchClient::new(endpoint(&server));
    let err = client.get(&sales(), &FetchParams::new()).await.unwrap_err();
    assert_eq!(
        err,
        FetchError::Http {
            status: 500,
            body: "boom".into()
        }
    );
}

#[tokio::test]
async fn error_body_is_a_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "no such collection" })))
        .mount(&server)
        .await;

    let client = HttpFetchClient::new(endpoint(&server));
    let err = client.get(&sales(), &FetchParams::new()).await.unwrap_err();
    assert_eq!(err, FetchError::Rejected("no such collection".into()));
}

#[tokio::test]
async fn malformed_body_is_a_deserialize_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let client = HttpFetchClient::new(endpoint(&server));
    let err = client.get(&sales(), &FetchParams::new()).await.unwrap_err();
    assert!(matches!(err, FetchError::Deserialize(_)));
}

#[tokio::test]
async fn token_provider_sets_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer t0ken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpFetchClient::new(endpoint(&server)).with_token_provider(Arc::new(StaticToken));
    assert!(client.get(&sales(), &FetchParams::new()).await.unwrap().is_empty());
}

// ── Writes ──────────────────────────────────────────────────────

#[tokio::test]
async fn upsert_returns_the_stored_document() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "job": "upsert",
            "filter": { "id": "s1" },
            "data": { "id": "s1", "approved": true }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "s1",
            "approved": true,
            "updatedAt": "2024-05-01T10:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpFetchClient::new(endpoint(&server));
    let data = doc(json!({ "id": "s1", "approved": true }));
    let stored = client
        .write(&sales(), &WriteTarget::Id("s1".into()), &data)
        .await
        .unwrap();
    assert_eq!(stored["updatedAt"], json!("2024-05-01T10:00:00Z"));
}

#[tokio::test]
async fn empty_upsert_response_echoes_the_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = HttpFetchClient::new(endpoint(&server));
    let data = doc(json!({ "id": "s1", "no": 7 }));
    let stored = client
        .write(&sales(), &WriteTarget::Id("s1".into()), &data)
        .await
        .unwrap();
    assert_eq!(stored, data);
}

#[tokio::test]
async fn delete_targets_the_id_filter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "job": "delete",
            "store": "sales",
            "collection": "sales",
            "filter": { "id": "s1" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpFetchClient::new(endpoint(&server));
    let ack = client
        .remove(&sales(), &WriteTarget::Id("s1".into()))
        .await
        .unwrap();
    assert_eq!(ack, json!({ "deleted": 1 }));
}
