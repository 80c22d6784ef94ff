//! Test utilities and common setup.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, header};
use serde_json::Value;

use userdir::api;
use userdir::db::Database;
use userdir::user::{MemoryUserStore, PasswordPolicy, UserDirectory, UserRepository, UserStore};

fn app_with_store(store: Arc<dyn UserStore>) -> Router {
    let policy = PasswordPolicy {
        min_password_length: 6,
        bcrypt_cost: 4,
    };
    let state = api::AppState::new(UserDirectory::new(store, policy));
    api::create_router(state)
}

/// Create a test application backed by an in-memory SQLite database.
pub async fn test_app() -> Router {
    let db = Database::in_memory().await.unwrap();
    app_with_store(Arc::new(UserRepository::new(db.pool().clone())))
}

/// Create a test application backed by the in-memory store.
pub fn memory_app() -> Router {
    app_with_store(Arc::new(MemoryUserStore::new()))
}

/// Build a request with an optional JSON body.
pub fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().uri(uri).method(method);
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Read a response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
