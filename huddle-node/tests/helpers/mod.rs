//! Shared helpers for HTTP-level tests

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use huddle_common::config::HuddleConfig;
use huddle_common::store::Stores;
use huddle_node::{build_router, AppState};

pub struct TestNode {
    pub state: AppState,
    pub app: Router,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_config(HuddleConfig::default())
    }

    pub fn with_config(config: HuddleConfig) -> Self {
        Self::on_stores(config, "node-a", Stores::memory())
    }

    pub fn on_stores(config: HuddleConfig, node_id: &str, stores: Stores) -> Self {
        let state = AppState::new(config, node_id.to_string(), stores);
        let app = build_router(state.clone());
        Self { state, app }
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    session: Option<&str>,
    body: Option<Value>,
    extra_headers: &[(&str, &str)],
) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(session) = session {
        builder = builder.header("x-session-id", session);
    }
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    Reply {
        status,
        headers,
        body,
    }
}

pub async fn get(app: &Router, uri: &str, session: &str) -> Reply {
    send(app, Method::GET, uri, Some(session), None, &[]).await
}

pub async fn post(app: &Router, uri: &str, session: &str, body: Value) -> Reply {
    send(app, Method::POST, uri, Some(session), Some(body), &[]).await
}

/// Log a user in; returns the session id
pub async fn login(app: &Router, tenant: &str, user: &str) -> String {
    let reply = send(
        app,
        Method::POST,
        "/sessions",
        None,
        Some(json!({ "tenantId": tenant, "userId": user })),
        &[],
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    reply.body["sessionId"].as_str().unwrap().to_string()
}

/// Open a connection with the given capabilities; returns its id
pub async fn connect(app: &Router, session: &str, push: bool, long_poll: bool) -> String {
    let reply = post(
        app,
        "/connections",
        session,
        json!({ "supportsPush": push, "supportsLongPoll": long_poll }),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    reply.body["connectionId"].as_str().unwrap().to_string()
}

pub async fn publish(app: &Router, session: &str, users: &[&str], event_type: &str, n: u64) {
    for i in 0..n {
        let reply = post(
            app,
            "/publish",
            session,
            json!({ "userIds": users, "type": event_type, "payload": { "n": i } }),
        )
        .await;
        assert_eq!(reply.status, StatusCode::CREATED);
    }
}

pub fn events_of_type<'a>(events: &'a Value, event_type: &str) -> Vec<&'a Value> {
    events
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["type"] == event_type)
        .collect()
}
