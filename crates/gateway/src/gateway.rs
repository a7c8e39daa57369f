//! HTTP front end served by pingora.
//!
//! Every request is answered from `request_filter`; nothing is proxied. The
//! upstream call on `/api/request` is mocked once admission succeeds.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::prelude::*;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::clock::Clock;
use crate::context::Context;
use crate::error::AdmissionError;
use crate::metric::{Metrics, Subject};
use crate::pipeline::{Admission, AdmissionPipeline, Caller};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Health,
    Request,
    Usage,
    RotateKey,
    MethodNotAllowed,
    NotFound,
}

pub fn route(method: &str, path: &str) -> Route {
    let path = path.trim_end_matches('/');
    let (expected, route) = match path {
        "/health" => ("GET", Route::Health),
        "/api/usage" => ("GET", Route::Usage),
        "/api/rotate-key" => ("POST", Route::RotateKey),
        p if p == "/api/request" || p.starts_with("/api/request/") => ("POST", Route::Request),
        _ => return Route::NotFound,
    };
    if method.eq_ignore_ascii_case(expected) {
        route
    } else {
        Route::MethodNotAllowed
    }
}

/// Key from `Authorization: Bearer <key>`, else from `x-api-key`.
pub fn presented_key(req: &RequestHeader) -> Option<&str> {
    let header = |name: &str| {
        req.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(auth) = header("authorization") {
        let (scheme, token) = auth.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        return (!token.is_empty()).then_some(token);
    }
    header(API_KEY_HEADER)
}

/// Caller-supplied idempotency key, or a fresh UUIDv7.
pub fn idempotency_key(req: &RequestHeader) -> String {
    req.headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_IDEMPOTENCY_KEY_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string())
}

struct Reply {
    status: u16,
    body: Value,
    headers: Vec<(&'static str, String)>,
}

impl Reply {
    fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            headers: Vec::new(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
            headers: Vec::new(),
        }
    }

    fn missing_key() -> Self {
        let mut reply = Self::error(401, "missing API key");
        reply
            .headers
            .push(("WWW-Authenticate", "Bearer".to_string()));
        reply
    }

    fn rejected(err: &AdmissionError) -> Self {
        match err {
            AdmissionError::RateLimitExceeded {
                ceiling,
                window_secs,
            } => Self {
                status: 429,
                body: json!({ "error": "rate limit exceeded", "rate_limit": ceiling }),
                headers: vec![
                    ("Retry-After", window_secs.to_string()),
                    ("X-RateLimit-Limit", ceiling.to_string()),
                    ("X-RateLimit-Remaining", "0".to_string()),
                ],
            },
            AdmissionError::Timeout { .. } => {
                log::warn!("admission timed out: {err}");
                let mut reply = Self::error(503, "temporarily unavailable, retry later");
                reply.headers.push(("Retry-After", "1".to_string()));
                reply
            }
            AdmissionError::Internal { .. } => {
                log::error!("admission failed: {err}");
                Self::error(500, "internal error")
            }
            other => Self::error(other.http_status(), &other.to_string()),
        }
    }
}

pub struct Gateway {
    pipeline: AdmissionPipeline,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl Gateway {
    pub fn new(ctx: &Context, metrics: Arc<Metrics>) -> Self {
        Self {
            pipeline: AdmissionPipeline::new(ctx),
            clock: ctx.clock.clone(),
            metrics,
        }
    }

    async fn handle(&self, req: &RequestHeader) -> (Subject, Reply) {
        let path = req.uri.path();
        let route = route(req.method.as_str(), path);
        match route {
            Route::Health => return (Subject::Anonymous, Reply::ok(json!({ "status": "ok" }))),
            Route::NotFound => return (Subject::Anonymous, Reply::error(404, "not found")),
            Route::MethodNotAllowed => {
                return (Subject::Anonymous, Reply::error(405, "method not allowed"));
            }
            Route::Request | Route::Usage | Route::RotateKey => {}
        }

        let Some(raw_key) = presented_key(req) else {
            return (Subject::Anonymous, Reply::missing_key());
        };
        let account = match self.pipeline.authenticate(raw_key).await {
            Ok(account) => account,
            Err(e) => return (Subject::Anonymous, Reply::rejected(&e)),
        };
        let subject = Subject::Account(account.account_id);

        let reply = match route {
            Route::Request => {
                let key = idempotency_key(req);
                match self
                    .pipeline
                    .admit(Caller::Account(account.account_id), &key, path)
                    .await
                {
                    Ok(admission) => self.mocked_upstream(&admission),
                    Err(e) => Reply::rejected(&e),
                }
            }
            Route::Usage => match self.pipeline.usage().report(&account).await {
                Ok(report) => Reply::ok(json!(report)),
                Err(e) => Reply::rejected(&e),
            },
            Route::RotateKey => match self.pipeline.verifier().rotate(account.account_id).await {
                Ok(issued) => Reply::ok(json!({
                    "message": "API key rotated successfully",
                    "api_key": issued.reveal(),
                    "warning": "Save this key securely. You won't be able to see it again.",
                })),
                Err(e) => {
                    log::error!("key rotation failed for account {}: {e}", account.account_id);
                    Reply::error(500, "failed to rotate key")
                }
            },
            _ => Reply::error(404, "not found"),
        };
        (subject, reply)
    }

    fn mocked_upstream(&self, admission: &Admission) -> Reply {
        let mut reply = Reply::ok(json!({
            "request_id": admission.idempotency_key,
            "cost": admission.cost,
            "upstream": {
                "status": "success",
                "message": "Request processed successfully",
                "data": {
                    "request_id": admission.idempotency_key,
                    "timestamp": self.clock.now().to_rfc3339(),
                    "mock": true,
                },
            },
        }));
        if let (Some(ceiling), Some(remaining)) =
            (admission.rate.ceiling, admission.rate.remaining())
        {
            reply.headers.push(("X-RateLimit-Limit", ceiling.to_string()));
            reply
                .headers
                .push(("X-RateLimit-Remaining", remaining.to_string()));
        }
        reply
    }
}

#[async_trait]
impl ProxyHttp for Gateway {
    type CTX = ();

    fn new_ctx(&self) -> Self::CTX {}

    async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let (subject, reply) = self.handle(session.req_header()).await;
        self.metrics
            .record(subject, reply.status, self.clock.unix_secs());

        let body = Bytes::from(reply.body.to_string());
        let mut header = ResponseHeader::build(reply.status, Some(4))?;
        header.insert_header("Content-Type", "application/json")?;
        header.insert_header("Content-Length", body.len().to_string())?;
        for (name, value) in reply.headers {
            header.insert_header(name, value)?;
        }
        // The request body is never read.
        session.set_keepalive(None);
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session.write_response_body(Some(body), true).await?;
        Ok(true)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Err(Error::explain(
            ErrorType::HTTPStatus(404),
            "requests are answered locally",
        ))
    }
}
