//! API endpoint integration tests

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower::ServiceExt;

use courier_gateway::api::{router, ApiState};
use courier_gateway::channels::{CloudClient, SessionRegistry};
use courier_gateway::config::{CloudConfig, Config, MediaConfig};
use courier_gateway::db::{ConversationRepo, MessageRepo};
use courier_gateway::fanout::{Backbone, EventHub};
use courier_gateway::ingest::canonical::ConnectionType;
use courier_gateway::ingest::IngestPipeline;
use courier_gateway::media::{CloudMediaClient, FsMediaStore};
use courier_gateway::DbPool;

mod common;
use common::{seed_default_pipeline, seed_number, seed_session, seed_tenant, setup_test_db};

const APP_SECRET: &str = "test-secret";
const VERIFY_TOKEN: &str = "hub-token";

fn build_test_state(db: DbPool) -> Arc<ApiState> {
    let hub = Arc::new(EventHub::new());
    let registry = Arc::new(SessionRegistry::new());

    let pipeline = Arc::new(IngestPipeline::new(
        db.clone(),
        CloudMediaClient::new("http://127.0.0.1:1".to_string(), "v21.0".to_string()),
        Arc::new(FsMediaStore::new(std::env::temp_dir())),
        Arc::clone(&hub) as Arc<dyn Backbone>,
        None,
        CloudClient::new("http://127.0.0.1:1".to_string(), "v21.0".to_string()),
        false,
        false,
    ));

    let config = Config {
        db_path: "unused.db".into(),
        port: 0,
        cloud: CloudConfig {
            app_secret: Some(APP_SECRET.to_string()),
            verify_token: Some(VERIFY_TOKEN.to_string()),
            ..CloudConfig::default()
        },
        media: MediaConfig::default(),
    };

    Arc::new(ApiState::new(db, config, pipeline, hub, registry))
}

fn sign(body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(APP_SECRET.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn message_envelope(provider_id: &str) -> String {
    format!(
        r#"{{
            "object": "whatsapp_business_account",
            "entry": [{{ "changes": [{{ "field": "messages", "value": {{
                "metadata": {{ "phone_number_id": "1001" }},
                "contacts": [{{ "wa_id": "5215512345678", "profile": {{ "name": "Ana" }} }}],
                "messages": [{{
                    "id": "{provider_id}",
                    "from": "5215512345678",
                    "timestamp": "1700000000",
                    "type": "text",
                    "text": {{ "body": "hola" }}
                }}]
            }} }}] }}]
        }}"#
    )
}

#[tokio::test]
async fn test_health_endpoint() {
    let db = setup_test_db();
    let app = router(build_test_state(db));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_number_session_reports_presence() {
    let db = setup_test_db();
    let tenant = seed_tenant(&db, "acme");
    let number = seed_number(&db, tenant, "+5211000000001", None);
    seed_session(&db, tenant, "tok-acme");

    let state = build_test_state(db);
    state.registry.set_status(number, "connected");
    state.registry.set_typing(number, "200@c.us");
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/numbers/{number}/session?token=tok-acme"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "connected");
    assert_eq!(json["typing"][0], "200@c.us");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/numbers/9999/session?token=tok-acme")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_number_session_requires_token_and_tenant() {
    let db = setup_test_db();
    let tenant = seed_tenant(&db, "acme");
    let number = seed_number(&db, tenant, "+5211000000001", None);
    let other = seed_tenant(&db, "globex");
    seed_session(&db, other, "tok-globex");

    let app = router(build_test_state(db));

    // No token
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/numbers/{number}/session"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Valid token from another tenant cannot see the number
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/numbers/{number}/session?token=tok-globex"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_verify_handshake() {
    let db = setup_test_db();
    let app = router(build_test_state(db));

    let response = app
        .oneshot(
            Request::builder()
                .uri(
                    "/api/webhooks/whatsapp?hub.mode=subscribe\
                     &hub.verify_token=hub-token&hub.challenge=challenge-123",
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"challenge-123");
}

#[tokio::test]
async fn test_webhook_verify_rejects_wrong_token() {
    let db = setup_test_db();
    let app = router(build_test_state(db));

    let response = app
        .oneshot(
            Request::builder()
                .uri(
                    "/api/webhooks/whatsapp?hub.mode=subscribe\
                     &hub.verify_token=wrong&hub.challenge=challenge-123",
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature_with_no_side_effects() {
    let db = setup_test_db();
    let tenant = seed_tenant(&db, "acme");
    seed_number(&db, tenant, "+5211000000001", Some("1001"));
    seed_default_pipeline(&db, tenant);

    let app = router(build_test_state(db.clone()));
    let body = message_envelope("wamid.forged");

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webhooks/whatsapp")
                .header("content-type", "application/json")
                .header("x-hub-signature-256", "sha256=deadbeef")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let conn = db.get().unwrap();
    let leads: i64 = conn
        .query_row("SELECT COUNT(*) FROM leads", [], |row| row.get(0))
        .unwrap();
    let messages: i64 = conn
        .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
        .unwrap();
    assert_eq!((leads, messages), (0, 0));
}

#[tokio::test]
async fn test_webhook_ingests_signed_message() {
    let db = setup_test_db();
    let tenant = seed_tenant(&db, "acme");
    let number = seed_number(&db, tenant, "+5211000000001", Some("1001"));
    seed_default_pipeline(&db, tenant);

    let app = router(build_test_state(db.clone()));
    let body = message_envelope("wamid.signed");
    let signature = sign(&body);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webhooks/whatsapp")
                .header("content-type", "application/json")
                .header("x-hub-signature-256", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    // The provider gets its ack before processing finishes
    assert_eq!(response.status(), StatusCode::OK);

    let messages = MessageRepo::new(db.clone());
    let mut stored = false;
    for _ in 0..50 {
        if messages
            .exists(tenant, number, ConnectionType::Api, "wamid.signed")
            .unwrap()
        {
            stored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(stored, "webhook message was not ingested");

    let conversation = ConversationRepo::new(db)
        .find_by_identity(tenant, number, ConnectionType::Api, "5215512345678")
        .unwrap()
        .expect("conversation created");
    assert_eq!(conversation.unread_count, 1);
}

#[tokio::test]
async fn test_webhook_acks_unknown_number_without_storing() {
    let db = setup_test_db();
    let app = router(build_test_state(db.clone()));

    let body = message_envelope("wamid.orphan");
    let signature = sign(&body);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webhooks/whatsapp")
                .header("content-type", "application/json")
                .header("x-hub-signature-256", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    // Unknown routing keys are acked so the provider stops retrying
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let conn = db.get().unwrap();
    let messages: i64 = conn
        .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
        .unwrap();
    assert_eq!(messages, 0);
}
