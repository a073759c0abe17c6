//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Request as HttpRequest, State, rejection::BytesRejection},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};

use crate::bridge::protocol::{ErrorObject, ErrorResponse, Request, RequestId};
use crate::proxy::Outcome;
use crate::service::BridgeService;

/// Largest accepted `POST /` body.
pub const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

async fn health() -> &'static str {
    "OK"
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn error_response(status: StatusCode, id: Option<RequestId>, error: ErrorObject) -> Response {
    (status, Json(ErrorResponse::new(id, error))).into_response()
}

/// Forward one JSON-RPC request to the worker and relay its answer.
async fn handle_rpc(
    State(service): State<Arc<BridgeService>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            tracing::warn!(limit = MAX_REQUEST_BODY_BYTES, "Rejecting oversized request body");
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                None,
                ErrorObject::request_too_large(),
            );
        }
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, None, ErrorObject::parse_error());
        }
    };

    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting unparseable request body");
            return error_response(StatusCode::BAD_REQUEST, None, ErrorObject::parse_error());
        }
    };

    let handle = service.dispatch(request).await;
    let id = handle.id().cloned();

    match handle.outcome().await {
        Outcome::Resolved(message) => (
            [(header::CONTENT_TYPE, "application/json")],
            message.into_bytes(),
        )
            .into_response(),
        Outcome::TimedOut => {
            error_response(StatusCode::GATEWAY_TIMEOUT, id, ErrorObject::request_timeout())
        }
        Outcome::WorkerDown => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            id,
            ErrorObject::worker_unavailable(),
        ),
        Outcome::DuplicateId => error_response(StatusCode::CONFLICT, id, ErrorObject::duplicate_id()),
    }
}

/// Permissive CORS on every response; preflight is answered here.
async fn cors(request: HttpRequest, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

pub fn routes(service: Arc<BridgeService>) -> Router {
    Router::new()
        .route("/", post(handle_rpc).fallback(not_found))
        .route("/health", get(health).fallback(not_found))
        .fallback(not_found)
        .with_state(service)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(cors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{WorkerExit, WorkerState};
    use crate::testing::{MockWorker, reply};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tower::ServiceExt;

    async fn response_body(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    async fn response_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&response_body(response).await).unwrap()
    }

    fn rpc(body: &'static str) -> HttpRequest<Body> {
        HttpRequest::post("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn service() -> (Arc<BridgeService>, Arc<MockWorker>, UnboundedReceiver<Request>) {
        let (worker, written) = MockWorker::running();
        let service = Arc::new(BridgeService::new(worker.clone()));
        (service, worker, written)
    }

    /// Answer every request with `"pong"` as soon as it is written.
    fn pong_responder(service: &Arc<BridgeService>, mut written: UnboundedReceiver<Request>) {
        let proxy = Arc::clone(service.proxy());
        tokio::spawn(async move {
            while let Some(request) = written.recv().await {
                proxy.on_framed_message(reply(&request, json!("pong")));
            }
        });
    }

    fn assert_cors(response: &Response) {
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_METHODS],
            "POST, GET, OPTIONS"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
    }

    #[tokio::test]
    async fn rpc_relays_worker_response_verbatim() {
        let (service, _worker, mut written) = service();
        let proxy = Arc::clone(service.proxy());
        tokio::spawn(async move {
            let request = written.recv().await.unwrap();
            assert_eq!(request.method, "ping");
            proxy.on_framed_message(crate::testing::message(
                r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#,
            ));
        });

        let response = routes(service)
            .oneshot(rpc(r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_cors(&response);
        assert_eq!(
            response_body(response).await.as_ref(),
            br#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_times_out_with_504() {
        let (worker, _written) = MockWorker::running();
        let service =
            Arc::new(BridgeService::new(worker).with_request_timeout(Duration::from_secs(30)));

        let response = routes(service)
            .oneshot(rpc(r#"{"jsonrpc":"2.0","id":2,"method":"ping","params":{}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response_body(response).await.as_ref(),
            br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Request timeout"},"id":2}"#
        );
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (service, _worker, _written) = service();

        let response = routes(service)
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        assert_eq!(response_body(response).await.as_ref(), b"OK");
    }

    #[tokio::test]
    async fn health_stays_ok_when_worker_is_down() {
        let (service, worker, _written) = service();
        worker.exit(WorkerExit {
            code: Some(1),
            signal: None,
        });

        let response = routes(service)
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unparseable_body_is_400_parse_error() {
        let (service, _worker, mut written) = service();

        let response = routes(service).oneshot(rpc("not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_cors(&response);
        assert_eq!(
            response_body(response).await.as_ref(),
            br#"{"jsonrpc":"2.0","error":{"code":-32700,"message":"Parse error"},"id":null}"#
        );
        assert!(written.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_request_json_is_400_parse_error() {
        let (service, _worker, _written) = service();

        let response = routes(service)
            .oneshot(rpc(r#"{"jsonrpc":"2.0","id":3}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], -32700);
        assert!(json["id"].is_null());
    }

    #[tokio::test]
    async fn concurrent_requests_are_matched_by_id() {
        let (service, _worker, mut written) = service();
        let proxy = Arc::clone(service.proxy());
        tokio::spawn(async move {
            let first = written.recv().await.unwrap();
            let second = written.recv().await.unwrap();
            let (ten, eleven) = if first.id == Some(RequestId::from(10)) {
                (first, second)
            } else {
                (second, first)
            };
            proxy.on_framed_message(reply(&eleven, json!("eleven")));
            proxy.on_framed_message(reply(&ten, json!("ten")));
        });

        let app = routes(service);
        let (a, b) = tokio::join!(
            app.clone()
                .oneshot(rpc(r#"{"jsonrpc":"2.0","id":10,"method":"ping","params":{}}"#)),
            app.oneshot(rpc(r#"{"jsonrpc":"2.0","id":11,"method":"ping","params":{}}"#)),
        );

        let a = response_json(a.unwrap()).await;
        let b = response_json(b.unwrap()).await;
        assert_eq!(a["id"], 10);
        assert_eq!(a["result"], "ten");
        assert_eq!(b["id"], 11);
        assert_eq!(b["result"], "eleven");
    }

    #[tokio::test]
    async fn request_without_id_still_gets_answer() {
        let (service, _worker, written) = service();
        pong_responder(&service, written);

        let response = routes(service)
            .oneshot(rpc(r#"{"jsonrpc":"2.0","method":"tools/list"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["result"], "pong");
        assert!(json["id"].is_string());
    }

    #[tokio::test]
    async fn worker_down_is_503() {
        let (service, worker, _written) = service();
        worker.set_state(WorkerState::Failed);

        let response = routes(service)
            .oneshot(rpc(r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response_body(response).await.as_ref(),
            br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Worker unavailable"},"id":"abc"}"#
        );
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_409() {
        let (service, _worker, _written) = service();
        let app = routes(Arc::clone(&service));

        // Hold id 5 pending without going through HTTP.
        let held = service
            .dispatch(Request::new(Some(RequestId::from(5)), "slow", None))
            .await;

        let response = app
            .oneshot(rpc(r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], -32600);
        assert_eq!(json["error"]["message"], "Duplicate request id");
        assert_eq!(json["id"], 5);
        drop(held);
    }

    #[tokio::test]
    async fn fractional_and_u64_ids_are_forwarded() {
        let (service, _worker, written) = service();
        pong_responder(&service, written);
        let app = routes(service);

        for (body, id) in [
            (r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#, json!(1.5)),
            (
                r#"{"jsonrpc":"2.0","id":18446744073709551615,"method":"ping"}"#,
                json!(u64::MAX),
            ),
        ] {
            let response = app.clone().oneshot(rpc(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{body}");
            let json = response_json(response).await;
            assert_eq!(json["id"], id);
            assert_eq!(json["result"], "pong");
        }
    }

    #[tokio::test]
    async fn oversized_body_gets_json_rpc_envelope() {
        let (service, _worker, mut written) = service();

        let body = vec![b' '; MAX_REQUEST_BODY_BYTES + 1];
        let response = routes(service)
            .oneshot(
                HttpRequest::post("/")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_cors(&response);
        assert_eq!(
            response_body(response).await.as_ref(),
            br#"{"jsonrpc":"2.0","error":{"code":-32600,"message":"Request body too large"},"id":null}"#
        );
        assert!(written.try_recv().is_err());
    }

    #[tokio::test]
    async fn preflight_on_any_path() {
        let (service, _worker, _written) = service();
        let app = routes(service);

        for path in ["/", "/health", "/anything/else"] {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .method(Method::OPTIONS)
                        .uri(path)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK, "OPTIONS {path}");
            assert_cors(&response);
            assert!(response_body(response).await.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_routes_are_404() {
        let (service, _worker, _written) = service();
        let app = routes(service);

        let cases = [
            HttpRequest::get("/").body(Body::empty()).unwrap(),
            HttpRequest::post("/health").body(Body::empty()).unwrap(),
            HttpRequest::get("/nope").body(Body::empty()).unwrap(),
            HttpRequest::post("/rpc").body(Body::from("{}")).unwrap(),
        ];

        for request in cases {
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_cors(&response);
        }
    }
}
