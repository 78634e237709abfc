//! Thin forwarding layer in front of the assessment backend.
//!
//! The first path segment picks an entry from a fixed endpoint table; the
//! request is replayed against the backend with the caller's bearer token
//! unless it is flagged `guest=true`.

use axum::body::Bytes;
use axum::http::StatusCode;
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub path: &'static str,
    pub verb: Verb,
}

const ENDPOINTS: &[(&str, Endpoint)] = &[
    ("questions", Endpoint { path: "/api/questions", verb: Verb::Get }),
    ("code-questions", Endpoint { path: "/api/code-questions", verb: Verb::Get }),
    ("subtopics", Endpoint { path: "/api/subtopics", verb: Verb::Get }),
    ("attempts", Endpoint { path: "/api/attempts", verb: Verb::Get }),
    ("start-attempt", Endpoint { path: "/api/attempts/start", verb: Verb::Post }),
    ("finish-attempt", Endpoint { path: "/api/attempts/finish", verb: Verb::Post }),
    ("submit-answer", Endpoint { path: "/api/answers", verb: Verb::Post }),
    ("send-otp", Endpoint { path: "/api/otp/send", verb: Verb::Post }),
    ("verify-otp", Endpoint { path: "/api/otp/verify", verb: Verb::Post }),
    ("server-time", Endpoint { path: "/api/server-time", verb: Verb::Get }),
];

pub fn lookup(segment: &str) -> Option<Endpoint> {
    ENDPOINTS
        .iter()
        .find(|(name, _)| *name == segment)
        .map(|(_, endpoint)| *endpoint)
}

/// Forwarded request, already split out of the incoming HTTP request.
#[derive(Debug, Default)]
pub struct ProxyRequest {
    pub segment: String,
    pub query: Vec<(String, String)>,
    pub token: Option<String>,
    pub body: Bytes,
}

impl ProxyRequest {
    fn is_guest(&self) -> bool {
        self.query.iter().any(|(k, v)| k == "guest" && v == "true")
    }
}

pub struct ApiProxy {
    client: reqwest::Client,
    backend_url: String,
}

impl ApiProxy {
    pub fn new(client: reqwest::Client, backend_url: impl Into<String>) -> Self {
        Self {
            client,
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn forward(&self, req: ProxyRequest) -> (StatusCode, Value) {
        let Some(endpoint) = lookup(&req.segment) else {
            return (
                StatusCode::NOT_FOUND,
                json!({ "error": "Invalid laravelEndpoint" }),
            );
        };

        let guest = req.is_guest();
        let token = match (&req.token, guest) {
            (_, true) => None,
            (Some(token), false) => Some(token.as_str()),
            (None, false) => return unauthorized(),
        };

        let url = format!("{}{}", self.backend_url, endpoint.path);
        let query: Vec<&(String, String)> = req.query.iter().filter(|(k, _)| k != "guest").collect();
        let mut builder = match endpoint.verb {
            Verb::Get => self.client.get(&url),
            Verb::Post => self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(req.body.clone()),
        }
        .query(&query)
        .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        info!(endpoint = %req.segment, guest, "Forwarding to backend");
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(endpoint = %req.segment, error = %e, "Backend unreachable");
                return internal_error();
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!(endpoint = %req.segment, "Backend rejected token");
            return unauthorized();
        }
        if !status.is_success() {
            warn!(endpoint = %req.segment, status = status.as_u16(), "Backend error");
            return internal_error();
        }

        match response.json::<Value>().await {
            Ok(body) => (
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK),
                body,
            ),
            Err(e) => {
                warn!(endpoint = %req.segment, error = %e, "Backend sent non-JSON body");
                internal_error()
            }
        }
    }
}

fn unauthorized() -> (StatusCode, Value) {
    (StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" }))
}

fn internal_error() -> (StatusCode, Value) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "Internal Server Error" }),
    )
}
