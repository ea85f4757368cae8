//! API Integration Tests
//!
//! Drives the full router against the in-memory store, request by request,
//! the way a client would.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use payrail_edge::AppState;
use payrail_identity::{Hasher, Identity};
use payrail_ledger::{MemStore, TransferEngine};

fn app() -> (Router, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    // Minimum hash cost: these tests exercise the HTTP surface.
    let identity = Identity::new(store.clone(), Hasher::new(1));
    let engine = TransferEngine::new(store.clone());
    let state = AppState {
        store: store.clone(),
        identity,
        engine,
    };
    (payrail_edge::router(state), store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_req(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn register(app: &Router, name: &str, email: &str) -> String {
    let (status, body) = send(
        app,
        post_json(
            "/api/auth/register",
            None,
            json!({
                "name": name,
                "email": email,
                "password": "s3cret-pass",
                "password_confirmation": "s3cret-pass",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["token"].as_str().unwrap().to_string()
}

/// Register two users and fund the first with 100_000 minor units.
async fn funded_pair(app: &Router, store: &Arc<MemStore>) -> (String, String) {
    let alice_token = register(app, "Alice", "alice@example.com").await;
    let bob_token = register(app, "Bob", "bob@example.com").await;
    store.seed_balance(1, 100_000).await;
    store.seed_balance(2, 50_000).await;
    (alice_token, bob_token)
}

#[tokio::test]
async fn test_register_returns_user_and_token() {
    let (app, _) = app();
    let (status, body) = send(
        &app,
        post_json(
            "/api/auth/register",
            None,
            json!({
                "name": "Alice",
                "email": "alice@example.com",
                "password": "s3cret-pass",
                "password_confirmation": "s3cret-pass",
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["user"]["name"], "Alice");
    assert_eq!(body["user"]["balance"], 0);
    assert_eq!(body["user"]["balance_dollars"], "0.00");
    assert!(body["user"].get("password_hash").is_none());
    assert!(!body["token"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_register_rejects_bad_input_and_duplicates() {
    let (app, _) = app();

    let (status, body) = send(
        &app,
        post_json(
            "/api/auth/register",
            None,
            json!({
                "name": "A",
                "email": "nope",
                "password": "short",
                "password_confirmation": "short",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["errors"].as_array().unwrap().len(), 3);

    register(&app, "Alice", "alice@example.com").await;
    let (status, _) = send(
        &app,
        post_json(
            "/api/auth/register",
            None,
            json!({
                "name": "Alice Again",
                "email": "alice@example.com",
                "password": "s3cret-pass",
                "password_confirmation": "s3cret-pass",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_login_success_and_indistinct_failure() {
    let (app, _) = app();
    register(&app, "Alice", "alice@example.com").await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/auth/login",
            None,
            json!({ "email": "alice@example.com", "password": "s3cret-pass" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["token"].as_str().unwrap().is_empty());

    let (wrong_pw_status, wrong_pw_body) = send(
        &app,
        post_json(
            "/api/auth/login",
            None,
            json!({ "email": "alice@example.com", "password": "not-the-password" }),
        ),
    )
    .await;
    let (no_user_status, no_user_body) = send(
        &app,
        post_json(
            "/api/auth/login",
            None,
            json!({ "email": "ghost@example.com", "password": "whatever-pass" }),
        ),
    )
    .await;

    assert_eq!(wrong_pw_status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(no_user_status, StatusCode::UNPROCESSABLE_ENTITY);
    // The two failure modes must be indistinguishable on the wire.
    assert_eq!(wrong_pw_body["message"], no_user_body["message"]);
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let (app, _) = app();
    for uri in [
        "/api/auth/user",
        "/api/balance",
        "/api/transactions",
        "/api/transactions/stats",
    ] {
        let (status, _) = send(&app, get_req(uri, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri} must require auth");
    }

    let (status, _) = send(&app, get_req("/api/balance", Some("bogus-token"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_current_user_and_balance() {
    let (app, store) = app();
    let token = register(&app, "Alice", "alice@example.com").await;
    store.seed_balance(1, 12_345).await;

    let (status, body) = send(&app, get_req("/api/auth/user", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["balance"], 12_345);
    assert_eq!(body["user"]["balance_dollars"], "123.45");

    let (status, body) = send(&app, get_req("/api/balance", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 12_345);
}

#[tokio::test]
async fn test_logout_revokes_the_session_token() {
    let (app, _) = app();
    let token = register(&app, "Alice", "alice@example.com").await;

    let (status, _) = send(&app, post_json("/api/auth/logout", Some(&token), json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, get_req("/api/balance", Some(&token))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_validate_receiver() {
    let (app, _) = app();
    let token = register(&app, "Alice", "alice@example.com").await;
    register(&app, "Bob", "bob@example.com").await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/transactions/validate-receiver",
            Some(&token),
            json!({ "email": "bob@example.com" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["valid"], true);
    assert_eq!(body["data"]["user"]["name"], "Bob");
    // Only name and email may leak.
    assert!(body["data"]["user"].get("id").is_none());
    assert!(body["data"]["user"].get("balance").is_none());

    let (status, body) = send(
        &app,
        post_json(
            "/api/transactions/validate-receiver",
            Some(&token),
            json!({ "email": "ghost@example.com" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["data"]["valid"], false);

    let (status, body) = send(
        &app,
        post_json(
            "/api/transactions/validate-receiver",
            Some(&token),
            json!({ "email": "alice@example.com" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["data"]["valid"], false);
}

#[tokio::test]
async fn test_transfer_happy_path() {
    let (app, store) = app();
    let (alice_token, _) = funded_pair(&app, &store).await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/transactions",
            Some(&alice_token),
            json!({ "receiver_email": "bob@example.com", "amount": 10_000 }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["amount"], 10_000);
    assert_eq!(body["data"]["commission"], 150);
    assert_eq!(body["data"]["total_debited"], 10_150);
    assert_eq!(body["data"]["sender_balance"], 89_850);
    assert_eq!(body["data"]["receiver_balance"], 60_000);

    let (users, transactions, snapshots, outbox) = store.dump().await;
    assert_eq!(users[0].balance, 89_850);
    assert_eq!(users[1].balance, 60_000);
    assert_eq!(transactions.len(), 1);
    assert_eq!(snapshots.len(), 2);
    assert_eq!(outbox.len(), 1);
}

#[tokio::test]
async fn test_transfer_with_idempotency_key_header_replays() {
    let (app, store) = app();
    let (alice_token, _) = funded_pair(&app, &store).await;

    let request = || {
        let mut req = post_json(
            "/api/transactions",
            Some(&alice_token),
            json!({ "receiver_email": "bob@example.com", "amount": 10_000 }),
        );
        req.headers_mut()
            .insert("Idempotency-Key", "k1".parse().unwrap());
        req
    };

    let (status, first) = send(&app, request()).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = send(&app, request()).await;
    assert_eq!(status, StatusCode::CREATED);

    assert_eq!(first["data"]["uuid"], second["data"]["uuid"]);
    assert_eq!(first["data"]["created_at"], second["data"]["created_at"]);

    let (users, transactions, _, outbox) = store.dump().await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(outbox.len(), 1);
    assert_eq!(users[0].balance, 89_850);
}

#[tokio::test]
async fn test_transfer_business_failures() {
    let (app, store) = app();
    let (alice_token, _) = funded_pair(&app, &store).await;

    // Receiver unknown.
    let (status, _) = send(
        &app,
        post_json(
            "/api/transactions",
            Some(&alice_token),
            json!({ "receiver_email": "ghost@example.com", "amount": 1_000 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Self transfer.
    let (status, _) = send(
        &app,
        post_json(
            "/api/transactions",
            Some(&alice_token),
            json!({ "receiver_email": "alice@example.com", "amount": 1_000 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Zero amount.
    let (status, _) = send(
        &app,
        post_json(
            "/api/transactions",
            Some(&alice_token),
            json!({ "receiver_email": "bob@example.com", "amount": 0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Insufficient balance.
    let (status, body) = send(
        &app,
        post_json(
            "/api/transactions",
            Some(&alice_token),
            json!({ "receiver_email": "bob@example.com", "amount": 1_000_000 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("insufficient"));

    // Nothing was written along the way.
    let (users, transactions, _, _) = store.dump().await;
    assert!(transactions.is_empty());
    assert_eq!(users[0].balance, 100_000);
}

#[tokio::test]
async fn test_transaction_listing_direction_and_clamp() {
    let (app, store) = app();
    let (alice_token, bob_token) = funded_pair(&app, &store).await;

    for amount in [1_000, 2_000, 3_000] {
        let (status, _) = send(
            &app,
            post_json(
                "/api/transactions",
                Some(&alice_token),
                json!({ "receiver_email": "bob@example.com", "amount": amount }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, _) = send(
        &app,
        post_json(
            "/api/transactions",
            Some(&bob_token),
            json!({ "receiver_email": "alice@example.com", "amount": 500 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, get_req("/api/transactions", Some(&alice_token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["transactions"].as_array().unwrap().len(), 4);
    // Newest first.
    assert_eq!(body["data"]["transactions"][0]["amount"], 500);

    let (_, sent) = send(
        &app,
        get_req("/api/transactions?direction=sent", Some(&alice_token)),
    )
    .await;
    assert_eq!(sent["data"]["transactions"].as_array().unwrap().len(), 3);

    let (_, received) = send(
        &app,
        get_req("/api/transactions?direction=received", Some(&alice_token)),
    )
    .await;
    assert_eq!(received["data"]["transactions"].as_array().unwrap().len(), 1);

    let (_, paged) = send(
        &app,
        get_req(
            "/api/transactions?page=2&per_page=3&direction=all",
            Some(&alice_token),
        ),
    )
    .await;
    assert_eq!(paged["data"]["transactions"].as_array().unwrap().len(), 1);
    assert_eq!(paged["data"]["pagination"]["total"], 4);
    assert_eq!(paged["data"]["pagination"]["last_page"], 2);

    let (_, clamped) = send(
        &app,
        get_req("/api/transactions?per_page=100000", Some(&alice_token)),
    )
    .await;
    assert_eq!(clamped["data"]["pagination"]["per_page"], 100);
}

#[tokio::test]
async fn test_transaction_detail_visibility() {
    let (app, store) = app();
    let (alice_token, bob_token) = funded_pair(&app, &store).await;
    let outsider_token = register(&app, "Carol", "carol@example.com").await;

    let (_, created) = send(
        &app,
        post_json(
            "/api/transactions",
            Some(&alice_token),
            json!({ "receiver_email": "bob@example.com", "amount": 1_000 }),
        ),
    )
    .await;
    let uuid = created["data"]["uuid"].as_str().unwrap().to_string();

    for token in [&alice_token, &bob_token] {
        let (status, body) = send(
            &app,
            get_req(&format!("/api/transactions/{uuid}"), Some(token)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["amount"], 1_000);
    }

    // Not visible to a third party: same 404 as a nonexistent row.
    let (status, _) = send(
        &app,
        get_req(&format!("/api/transactions/{uuid}"), Some(&outsider_token)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        get_req(
            &format!("/api/transactions/{}", uuid::Uuid::new_v4()),
            Some(&alice_token),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stats() {
    let (app, store) = app();
    let (alice_token, bob_token) = funded_pair(&app, &store).await;

    let (_, _) = send(
        &app,
        post_json(
            "/api/transactions",
            Some(&alice_token),
            json!({ "receiver_email": "bob@example.com", "amount": 10_000 }),
        ),
    )
    .await;
    let (_, _) = send(
        &app,
        post_json(
            "/api/transactions",
            Some(&bob_token),
            json!({ "receiver_email": "alice@example.com", "amount": 2_000 }),
        ),
    )
    .await;

    let (status, body) = send(&app, get_req("/api/transactions/stats", Some(&alice_token))).await;
    assert_eq!(status, StatusCode::OK);
    let data = &body["data"];
    // Sent 10_000 + 150 commission; received 2_000.
    assert_eq!(data["total_sent"], 10_150);
    assert_eq!(data["total_received"], 2_000);
    assert_eq!(data["total_commission"], 150);
    assert_eq!(data["total_transactions"], 2);
    assert_eq!(data["net_balance_change"], -8_150);
    assert_eq!(data["sent_count"], 1);
    assert_eq!(data["received_count"], 1);
}
