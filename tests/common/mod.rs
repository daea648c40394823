//! Local stand-in for the UTS REST API shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;

pub const API_KEY: &str = "test-key";

#[derive(Clone, Default)]
pub struct Stub {
    pub calls: Arc<AtomicUsize>,
    pub flaky: Arc<AtomicUsize>,
}

async fn search(State(stub): State<Stub>, Query(q): Query<HashMap<String, String>>) -> Response {
    stub.calls.fetch_add(1, Ordering::SeqCst);
    if q.get("apiKey").map(String::as_str) != Some(API_KEY) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let hit = |ui: &str| Json(json!({"result": {"results": [{"ui": ui, "name": "x"}]}}));
    match q.get("string").map(String::as_str) {
        Some("D006973") => hit("C0020538").into_response(),
        Some("D003920") => {
            if stub.flaky.fetch_add(1, Ordering::SeqCst) == 0 {
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            } else {
                hit("C0011849").into_response()
            }
        }
        Some("D999999") => (StatusCode::OK, "<html>maintenance</html>").into_response(),
        _ => hit("NONE").into_response(),
    }
}

async fn atoms(State(stub): State<Stub>, Path(cui): Path<String>) -> Response {
    stub.calls.fetch_add(1, Ordering::SeqCst);
    let atom = |sab: &str, code: &str| {
        json!({"code": format!("https://uts-ws.nlm.nih.gov/rest/content/2025AA/source/{sab}/{code}"), "rootSource": sab})
    };
    match cui.as_str() {
        "C0020538" => Json(json!({"result": [atom("ICD10CM", "I10"), atom("MSH", "D006973")]}))
            .into_response(),
        "C0011849" => Json(json!({"result": [atom("ICD10CM", "E11.9")]})).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve the stub on an ephemeral port and return its base URL.
pub async fn spawn_uts(stub: Stub) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new()
        .route("/search/current", get(search))
        .route("/content/current/CUI/:cui/atoms", get(atoms))
        .with_state(stub);
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    format!("http://{addr}")
}
