use crate::{admission::Admission, audit::AuditLogWatcher};
use bytes::Bytes;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{trace, warn};

/// Serves admission reviews and pushed audit batches.
///
/// - `POST /` and `POST /validate` take an `AdmissionReview`;
/// - `POST /audit` takes audit entries from the API server's webhook backend.
#[derive(Clone, Debug)]
pub struct Webhook {
    admission: Admission,
    audit: AuditLogWatcher,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Body = http_body_util::Full<Bytes>;

#[derive(Serialize)]
struct PushError {
    error: String,
}

// === impl Webhook ===

impl Webhook {
    pub fn new(admission: Admission, audit: AuditLogWatcher) -> Self {
        Self { admission, audit }
    }

    fn handle(
        &self,
        method: &http::Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<Body>, Error> {
        if *method != http::Method::POST {
            return Ok(not_found());
        }

        match path {
            "/" | "/validate" => {
                json_response(http::StatusCode::OK, &self.admission.review_body(&body))
            }
            "/audit" => match self.audit.handle_push(&body) {
                Ok(summary) => json_response(http::StatusCode::OK, &summary),
                Err(error) => {
                    warn!(%error, "Failed to parse pushed audit batch");
                    json_response(
                        http::StatusCode::BAD_REQUEST,
                        &PushError {
                            error: error.to_string(),
                        },
                    )
                }
            },
            _ => Ok(not_found()),
        }
    }
}

impl tower::Service<Request<hyper::body::Incoming>> for Webhook {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let (parts, body) = req.into_parts();
        if parts.method != http::Method::POST {
            return Box::pin(future::ok(not_found()));
        }

        let webhook = self.clone();
        Box::pin(async move {
            let bytes = body.collect().await?.to_bytes();
            webhook.handle(&parts.method, parts.uri.path(), bytes)
        })
    }
}

fn json_response<T: Serialize>(
    status: http::StatusCode,
    body: &T,
) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(body)?;
    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("json response must be valid"))
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::NOT_FOUND)
        .body(Body::default())
        .expect("not found response must be valid")
}
