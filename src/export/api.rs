//! Attribute viewer and measurement transport over HTTP.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::health::bind_address;
use crate::error::AttributeError;
use crate::notification::dispatcher::Headers;
use crate::resource::Resource;

/// Resources served by the API, by name.
pub struct ApiState {
    resources: BTreeMap<String, Resource>,
}

impl ApiState {
    pub fn new(resources: impl IntoIterator<Item = Resource>) -> Self {
        Self {
            resources: resources
                .into_iter()
                .map(|r| (r.name().to_string(), r))
                .collect(),
        }
    }

    fn resource(&self, name: &str) -> Result<&Resource, ApiError> {
        self.resources
            .get(name)
            .ok_or_else(|| ApiError::NotFound(format!("resource {name}")))
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/resources", get(list_resources))
        .route("/resources/:resource/notifications", post(post_notification))
        .route("/resources/:resource/attributes", get(list_attributes))
        .route(
            "/resources/:resource/attributes/:attribute",
            get(get_attribute),
        )
        .route("/resources/:resource/metrics/reset", post(reset_all_metrics))
        .route(
            "/resources/:resource/metrics/:attribute/reset",
            post(reset_metric),
        )
        .with_state(state)
}

/// HTTP server for [`router`].
pub struct ApiServer {
    addr: String,
    state: Arc<ApiState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ApiServer {
    pub fn new(addr: &str, state: Arc<ApiState>) -> Self {
        Self {
            addr: addr.to_string(),
            state,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr, ":8080");
        let app = router(Arc::clone(&self.state));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "api server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "api server error");
            }
        });

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

enum ApiError {
    NotFound(String),
    Attribute(AttributeError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            Self::Attribute(e @ AttributeError::AttributeNotFound(_)) => {
                (StatusCode::NOT_FOUND, e.to_string())
            }
            Self::Attribute(e @ AttributeError::ForeignAttributeUnavailable(_)) => {
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            Self::Attribute(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

#[derive(Serialize)]
struct ResourceSummary {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    attributes: usize,
}

#[derive(Serialize)]
struct ResetResponse {
    reset: usize,
}

fn transport_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect::<HashMap<_, _>>()
}

/// GET /resources
async fn list_resources(State(state): State<Arc<ApiState>>) -> Json<Vec<ResourceSummary>> {
    Json(
        state
            .resources
            .values()
            .map(|r| ResourceSummary {
                name: r.name().to_string(),
                kind: r.kind().as_str(),
                attributes: r.registry().len(),
            })
            .collect(),
    )
}

/// POST /resources/:resource/notifications - measurement transport.
async fn post_notification(
    State(state): State<Arc<ApiState>>,
    Path(resource): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let resource = state.resource(&resource)?;
    match resource.handle(&transport_headers(&headers), &body).await {
        Some(true) => Ok(StatusCode::ACCEPTED),
        Some(false) => Ok(StatusCode::UNPROCESSABLE_ENTITY),
        None => Err(ApiError::NotFound(format!(
            "transport of {} resource {}",
            resource.kind(),
            resource.name()
        ))),
    }
}

/// GET /resources/:resource/attributes
async fn list_attributes(
    State(state): State<Arc<ApiState>>,
    Path(resource): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.resource(&resource)?.metadata()))
}

/// GET /resources/:resource/attributes/:attribute
async fn get_attribute(
    State(state): State<Arc<ApiState>>,
    Path((resource, attribute)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let value = state
        .resource(&resource)?
        .get_value(&attribute)
        .await
        .map_err(ApiError::Attribute)?;
    Ok(Json(value))
}

/// POST /resources/:resource/metrics/reset
async fn reset_all_metrics(
    State(state): State<Arc<ApiState>>,
    Path(resource): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    let reset = state.resource(&resource)?.reset_all_metrics();
    Ok(Json(ResetResponse { reset }))
}

/// POST /resources/:resource/metrics/:attribute/reset
async fn reset_metric(
    State(state): State<Arc<ApiState>>,
    Path((resource, attribute)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.resource(&resource)?.reset_metric(&attribute) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("metric {attribute}")))
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{self, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::cluster::ClusterContext;
    use crate::descriptor::{keys, Descriptor};
    use crate::engine::MessageDrivenResource;

    async fn app() -> Router {
        let resource =
            MessageDrivenResource::new("orders", &Descriptor::new(), &ClusterContext::local(true))
                .expect("resource");
        resource
            .connect("hits", &Descriptor::new().with(keys::NAME, "gauge64"))
            .await
            .expect("connect");
        let state = ApiState::new([Resource::MessageDriven(Arc::new(resource))]);
        router(Arc::new(state))
    }

    async fn json(resp: Response) -> serde_json::Value {
        let bytes = body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn test_notification_then_read() {
        let app = app().await;

        let req = Request::builder()
            .method("POST")
            .uri("/resources/orders/notifications")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"kind":"valueChanged","integer":5}"#))
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let req = Request::builder()
            .uri("/resources/orders/attributes/hits")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let value = json(resp).await;
        assert_eq!(value["items"]["lastValue"], 5);

        let req = Request::builder()
            .uri("/resources/orders/attributes")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        let list = json(resp).await;
        assert_eq!(list[0]["name"], "hits");
        assert_eq!(list[0]["kind"], "composite");
    }

    #[tokio::test]
    async fn test_dropped_message_is_unprocessable() {
        let req = Request::builder()
            .method("POST")
            .uri("/resources/orders/notifications")
            .body(Body::from("not json"))
            .expect("request");
        let resp = app().await.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_unknown_resource_and_attribute() {
        let app = app().await;
        let req = Request::builder()
            .uri("/resources/nope/attributes")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder()
            .uri("/resources/orders/attributes/nope")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_endpoints() {
        let app = app().await;
        let req = Request::builder()
            .method("POST")
            .uri("/resources/orders/metrics/hits/reset")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let req = Request::builder()
            .method("POST")
            .uri("/resources/orders/metrics/missing/reset")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder()
            .method("POST")
            .uri("/resources/orders/metrics/reset")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(json(resp).await["reset"], 1);
    }
}
