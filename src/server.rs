//! HTTP/JSON surface: ingest, queries, freeing, health and debug.

use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::checkpoint::{GapValue, StagedSample};
use crate::decoder::LineProtocolDecoder;
use crate::error::{Result, StoreError};
use crate::model::{Selector, SelectorElement};
use crate::store::MemoryStore;

pub struct ServerState {
    store: Arc<MemoryStore>,
    staging: Option<SyncSender<StagedSample>>,
}

type AppState = Arc<ServerState>;

impl ServerState {
    pub fn new(store: Arc<MemoryStore>, staging: Option<SyncSender<StagedSample>>) -> Self {
        Self { store, staging }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/write", post(handle_write))
        .route("/free", post(handle_free))
        .route("/query", post(handle_query))
        .route("/healthcheck", get(handle_healthcheck))
        .route("/debug", post(handle_debug))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    listen: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| StoreError::Init(format!("cannot bind {listen}: {e}")))?;
    info!(%listen, "http server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| StoreError::Init(format!("http server failed: {e}")))?;
    Ok(())
}

struct ApiError(StoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::InvalidTimeRange { .. }
            | StoreError::UnknownMetric(_)
            | StoreError::UnknownField(_)
            | StoreError::MissingTag(_)
            | StoreError::MissingField(_)
            | StoreError::UnsupportedKind(_)
            | StoreError::UnsupportedResolution { .. }
            | StoreError::InvalidAggregation => StatusCode::BAD_REQUEST,
            StoreError::NoHostOrMetric => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err)
    }
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    cluster: Option<String>,
}

#[derive(Debug, Serialize)]
struct WriteResponse {
    accepted: usize,
    dropped: usize,
}

async fn handle_write(
    State(state): State<AppState>,
    Query(params): Query<WriteParams>,
    body: String,
) -> Json<WriteResponse> {
    let mut decoder = LineProtocolDecoder::new(Arc::clone(&state.store), params.cluster);
    if let Some(staging) = &state.staging {
        decoder = decoder.with_staging(staging.clone());
    }
    let summary = decoder.decode(&body);
    Json(WriteResponse {
        accepted: summary.accepted,
        dropped: summary.dropped,
    })
}

#[derive(Debug, Deserialize)]
struct FreeParams {
    to: Option<i64>,
}

async fn handle_free(
    State(state): State<AppState>,
    Query(params): Query<FreeParams>,
    Json(selectors): Json<Vec<Vec<String>>>,
) -> std::result::Result<Json<usize>, ApiError> {
    let threshold = params.to.unwrap_or(i64::MAX);
    let mut freed = 0;
    for path in &selectors {
        freed += state.store.free(path, threshold)?;
    }
    Ok(Json(freed))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiQueryRequest {
    pub cluster: String,
    pub from: i64,
    pub to: i64,
    #[serde(default)]
    pub queries: Vec<ApiQuery>,
    /// Metrics to answer for every node of the cluster.
    #[serde(default)]
    pub for_all_nodes: Vec<String>,
    #[serde(default)]
    pub with_stats: bool,
    #[serde(default = "default_true")]
    pub with_data: bool,
    /// Pad the response with leading nulls back to the requested `from`.
    #[serde(default)]
    pub with_padding: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiQuery {
    pub metric: String,
    pub hostname: String,
    #[serde(default, rename = "type")]
    pub scope: Option<String>,
    #[serde(default, rename = "type-ids")]
    pub type_ids: Vec<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default, rename = "subtype-ids")]
    pub subtype_ids: Vec<String>,
    #[serde(default)]
    pub resolution: i64,
    /// Collapse the selected scopes into one series instead of one
    /// series per scope id.
    #[serde(default)]
    pub aggregate: bool,
    /// Multiplies returned values; zero is treated as a no-op.
    #[serde(default, rename = "scale-by")]
    pub scale_by: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiMetricData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<GapValue>>,
    pub from: i64,
    pub to: i64,
    pub resolution: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiNodeMetric {
    pub hostname: String,
    pub metric: String,
    #[serde(flatten)]
    pub data: ApiMetricData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiQueryResponse {
    pub results: Vec<Vec<ApiMetricData>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub for_all_nodes: Vec<ApiNodeMetric>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<ApiQueryRequest>,
) -> Json<ApiQueryResponse> {
    let store = &state.store;

    let mut results = Vec::with_capacity(request.queries.len());
    for query in &request.queries {
        let selectors = build_selectors(&request.cluster, query);
        let mut per_query = Vec::with_capacity(selectors.len());
        for selector in selectors {
            per_query.push(run_query(store, &selector, query, &request));
        }
        results.push(per_query);
    }

    let mut for_all_nodes = Vec::new();
    for metric in &request.for_all_nodes {
        for host in store.list_children(&[request.cluster.clone()]) {
            let selector = vec![
                SelectorElement::String(request.cluster.clone()),
                SelectorElement::String(host.clone()),
            ];
            let query = ApiQuery {
                metric: metric.clone(),
                hostname: host.clone(),
                scope: None,
                type_ids: Vec::new(),
                subtype: None,
                subtype_ids: Vec::new(),
                resolution: 0,
                aggregate: false,
                scale_by: 0.0,
            };
            for_all_nodes.push(ApiNodeMetric {
                hostname: host,
                metric: metric.clone(),
                data: run_query(store, &selector, &query, &request),
            });
        }
    }

    Json(ApiQueryResponse {
        results,
        for_all_nodes,
    })
}

/// One selector per series the query expands to: aggregated scopes fold
/// their ids into a group element, unaggregated ones fan out.
fn build_selectors(cluster: &str, query: &ApiQuery) -> Vec<Selector> {
    let base = vec![
        SelectorElement::String(cluster.to_string()),
        SelectorElement::String(query.hostname.clone()),
    ];

    let mut selectors = vec![base];
    selectors = expand_scope(selectors, query.scope.as_deref(), &query.type_ids, query.aggregate);
    selectors = expand_scope(
        selectors,
        query.subtype.as_deref(),
        &query.subtype_ids,
        query.aggregate,
    );
    selectors
}

fn expand_scope(
    selectors: Vec<Selector>,
    scope: Option<&str>,
    ids: &[String],
    aggregate: bool,
) -> Vec<Selector> {
    let Some(scope) = scope else {
        return selectors;
    };
    let components: Vec<String> = if ids.is_empty() {
        vec![scope.to_string()]
    } else {
        ids.iter().map(|id| format!("{scope}{id}")).collect()
    };

    if aggregate || components.len() == 1 {
        let element = if components.len() == 1 {
            SelectorElement::String(components.into_iter().next().expect("one component"))
        } else {
            SelectorElement::Group(components)
        };
        selectors
            .into_iter()
            .map(|mut s| {
                s.push(element.clone());
                s
            })
            .collect()
    } else {
        let mut out = Vec::with_capacity(selectors.len() * components.len());
        for selector in &selectors {
            for component in &components {
                let mut s = selector.clone();
                s.push(SelectorElement::String(component.clone()));
                out.push(s);
            }
        }
        out
    }
}

fn run_query(
    store: &MemoryStore,
    selector: &Selector,
    query: &ApiQuery,
    request: &ApiQueryRequest,
) -> ApiMetricData {
    match store.read(selector, &query.metric, request.from, request.to, query.resolution) {
        Ok(mut result) => {
            if query.scale_by != 0.0 {
                for v in result.data.iter_mut() {
                    *v *= query.scale_by;
                }
            }

            let (avg, min, max) = if request.with_stats {
                stats(&result.data)
            } else {
                (None, None, None)
            };

            let data = request.with_data.then(|| {
                let mut values: Vec<GapValue> = Vec::new();
                if request.with_padding && result.from > request.from {
                    let missing = ((result.from - request.from) / result.resolution) as usize;
                    values.resize(missing, GapValue(f32::NAN));
                }
                values.extend(result.data.iter().map(|v| GapValue(*v)));
                values
            });

            ApiMetricData {
                data,
                from: result.from,
                to: result.to,
                resolution: result.resolution,
                avg,
                min,
                max,
                error: None,
            }
        }
        Err(err) => ApiMetricData {
            data: None,
            from: request.from,
            to: request.to,
            resolution: query.resolution,
            avg: None,
            min: None,
            max: None,
            error: Some(err.to_string()),
        },
    }
}

fn stats(data: &[f32]) -> (Option<f32>, Option<f32>, Option<f32>) {
    let mut sum = 0.0f64;
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut n = 0usize;
    for &v in data {
        if v.is_nan() {
            continue;
        }
        sum += v as f64;
        min = min.min(v);
        max = max.max(v);
        n += 1;
    }
    if n == 0 {
        return (None, None, None);
    }
    (Some((sum / n as f64) as f32), Some(min), Some(max))
}

#[derive(Debug, Deserialize)]
struct HealthParams {
    cluster: String,
    node: String,
}

async fn handle_healthcheck(
    State(state): State<AppState>,
    Query(params): Query<HealthParams>,
) -> impl IntoResponse {
    Json(state.store.health_check(&params.cluster, &params.node))
}

#[derive(Debug, Deserialize)]
struct DebugParams {
    selector: Option<String>,
}

async fn handle_debug(
    State(state): State<AppState>,
    Query(params): Query<DebugParams>,
) -> Json<serde_json::Value> {
    let path: Vec<String> = params
        .selector
        .as_deref()
        .map(|s| s.split(':').map(str::to_string).collect())
        .unwrap_or_default();
    Json(state.store.debug_dump(&path))
}
