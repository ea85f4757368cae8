//! Payrail HTTP Edge
//!
//! The thin request/response adapter in front of the transfer engine:
//! bearer-token auth, receiver resolution, idempotency-key plumbing, and
//! response shaping. It performs no money arithmetic of its own.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use payrail_identity::Identity;
use payrail_ledger::store::Store;
use payrail_ledger::TransferEngine;

pub mod auth;
pub mod dto;
pub mod error;
pub mod routes;

pub use auth::AuthSession;
pub use error::ApiError;

/// Everything a handler needs, shared across workers.
pub struct AppState<S> {
    pub store: Arc<S>,
    pub identity: Identity<S>,
    pub engine: TransferEngine<S>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            identity: self.identity.clone(),
            engine: self.engine.clone(),
        }
    }
}

/// Build the API router.
pub fn router<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/api/auth/register", post(routes::register::<S>))
        .route("/api/auth/login", post(routes::login::<S>))
        .route("/api/auth/logout", post(routes::logout::<S>))
        .route("/api/auth/user", get(routes::current_user::<S>))
        .route("/api/balance", get(routes::balance::<S>))
        .route(
            "/api/transactions/validate-receiver",
            post(routes::validate_receiver::<S>),
        )
        .route(
            "/api/transactions",
            post(routes::create_transfer::<S>).get(routes::list_transactions::<S>),
        )
        .route("/api/transactions/stats", get(routes::stats::<S>))
        .route("/api/transactions/{uuid}", get(routes::get_transaction::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
