use crate::aggregate::{self, Aggregation};
use crate::cache::{self, DatasetCache};
use crate::config::AppConfig;
use crate::error::DataLoadError;
use crate::filter::{self, Choice, CoordinateTable, Criteria, FilterOptions};
use crate::join::JoinedDataset;
use crate::render;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::{spawn_blocking, JoinError};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

pub struct AppState {
    pub config: AppConfig,
    pub cache: &'static DatasetCache,
}

impl AppState {
    /// State backed by the process-wide cache.
    pub fn new(config: AppConfig) -> Self {
        Self { config, cache: cache::global() }
    }

    fn dataset(&self) -> Result<Arc<JoinedDataset>, ApiError> {
        Ok(self.cache.get_or_load(&self.config.input)?)
    }
}

pub enum ApiError {
    Load(DataLoadError),
    Render(anyhow::Error),
    Task(JoinError),
}

impl From<JoinError> for ApiError {
    fn from(e: JoinError) -> Self {
        ApiError::Task(e)
    }
}

impl From<DataLoadError> for ApiError {
    fn from(e: DataLoadError) -> Self {
        ApiError::Load(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match self {
            ApiError::Load(e) => e.to_string(),
            ApiError::Render(e) => format!("{:#}", e),
            ApiError::Task(e) => format!("request task failed: {}", e),
        };
        error!("{}", message);
        (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Serialize)]
pub struct SummaryResponse {
    total: usize,
    aggregation: Option<Aggregation>,
    warning: Option<String>,
    invalid_districts: usize,
    invalid_restaurants: usize,
}

#[derive(Serialize)]
pub struct OptionsResponse {
    #[serde(flatten)]
    options: Option<FilterOptions>,
    all: &'static str,
    warning: Option<String>,
}

#[derive(Deserialize)]
pub struct FilterParams {
    region: String,
    category: Option<String>,
    price: Option<String>,
    min_rating: Option<f64>,
}

#[derive(Serialize)]
pub struct RestaurantsResponse {
    total: usize,
    threshold: Option<f64>,
    restaurants: Vec<Map<String, Value>>,
    coordinates: CoordinateTable,
    excluded_missing_rating: usize,
    messages: Vec<&'static str>,
    warning: Option<String>,
}

pub async fn start_server(config: AppConfig) -> Result<()> {
    let state = Arc::new(AppState::new(config));

    // Warm the cache so the first request doesn't pay for the join
    info!("Loading data for API...");
    let warm = Arc::clone(&state);
    spawn_blocking(move || warm.cache.get_or_load(&warm.config.input)).await??;

    let addr = SocketAddr::from(([127, 0, 0, 1], state.config.server.port));
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/api/summary", get(summary_handler))
        .route("/api/options", get(options_handler))
        .route("/api/restaurants", get(restaurants_handler))
        .route("/api/map.png", get(map_handler))
        .route("/api/reload", post(reload_handler));
    if let Some(dir) = &state.config.server.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    app.layer(CorsLayer::permissive()).with_state(state)
}

/// Loading, joining, filtering and PNG encoding all block, so they run off the
/// async worker threads.
async fn blocking<T, F>(op: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(op).await?
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Result<Json<SummaryResponse>, ApiError> {
    blocking(move || summary(&state)).await.map(Json)
}

async fn options_handler(State(state): State<Arc<AppState>>) -> Result<Json<OptionsResponse>, ApiError> {
    blocking(move || options(&state)).await.map(Json)
}

async fn restaurants_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FilterParams>,
) -> Result<Json<RestaurantsResponse>, ApiError> {
    blocking(move || restaurants(&state, params)).await.map(Json)
}

async fn map_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let png = blocking(move || {
        let dataset = state.dataset()?;
        let output = &state.config.output;
        render::encode_png(&dataset, output.width, output.height).map_err(ApiError::Render)
    })
    .await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

async fn reload_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    blocking(move || {
        state.cache.invalidate();
        let dataset = state.dataset()?;
        Ok(Json(serde_json::json!({ "restaurants": dataset.len(), "districts": dataset.regions.len() })))
    })
    .await
}

fn summary(state: &AppState) -> Result<SummaryResponse, ApiError> {
    let dataset = state.dataset()?;
    let (aggregation, warning) = match aggregate::count_by_region(&dataset, &state.config.schema.group_candidates) {
        Ok(agg) => (Some(agg), None),
        Err(e) => (None, Some(e.to_string())),
    };

    Ok(SummaryResponse {
        total: dataset.len(),
        aggregation,
        warning,
        invalid_districts: dataset.report.invalid_regions.len(),
        invalid_restaurants: dataset.report.invalid_points.len(),
    })
}

fn options(state: &AppState) -> Result<OptionsResponse, ApiError> {
    let dataset = state.dataset()?;
    let schema = &state.config.schema;

    Ok(match aggregate::resolve_column(&dataset, &schema.group_candidates) {
        Some(column) => OptionsResponse {
            options: Some(filter::options(&dataset, &column, schema)),
            all: filter::ALL,
            warning: None,
        },
        None => OptionsResponse {
            options: None,
            all: filter::ALL,
            warning: Some(no_key_warning(&schema.group_candidates)),
        },
    })
}

fn restaurants(state: &AppState, params: FilterParams) -> Result<RestaurantsResponse, ApiError> {
    let dataset = state.dataset()?;
    let schema = &state.config.schema;

    let Some(column) = aggregate::resolve_column(&dataset, &schema.group_candidates) else {
        return Ok(RestaurantsResponse {
            total: 0,
            threshold: None,
            restaurants: Vec::new(),
            coordinates: CoordinateTable::default(),
            excluded_missing_rating: 0,
            messages: vec![filter::EMPTY_FILTER_MESSAGE],
            warning: Some(no_key_warning(&schema.group_candidates)),
        });
    };

    // slider default is the lowest observed rating
    let min_rating = params
        .min_rating
        .unwrap_or_else(|| filter::rating_bounds(&dataset, &schema.rating_column).min);
    let criteria = Criteria {
        region: params.region,
        category: Choice::from_input(params.category.as_deref()),
        price: Choice::from_input(params.price.as_deref()),
        min_rating: Some(min_rating),
    };

    let outcome = filter::apply(&dataset, &column, schema, &criteria);
    let coordinates = filter::coordinates(outcome.records.iter().copied(), schema);
    let messages = match outcome.message() {
        Some(empty) => vec![empty],
        None => coordinates.message().into_iter().collect(),
    };

    Ok(RestaurantsResponse {
        total: outcome.len(),
        threshold: outcome.threshold,
        restaurants: outcome.records.iter().map(|r| r.poi.properties.clone()).collect(),
        excluded_missing_rating: outcome.excluded_missing_rating,
        coordinates,
        messages,
        warning: None,
    })
}

fn no_key_warning(candidates: &[String]) -> String {
    crate::error::NoGroupingKeyError { checked: candidates.to_vec() }.to_string()
}
