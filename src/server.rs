use crate::choropleth::HoverInfo;
use crate::config::{AppConfig, Center};
use crate::render::MapLayer;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

const INDEX_HTML: &str = include_str!("../static/index.html");

pub struct AppState {
    pub layer: MapLayer,
    pub config: AppConfig,
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Legend {
    pub show_scale: bool,
    pub color_scale: String,
    pub stops: Vec<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewResponse {
    pub center: [f64; 2],
    /// Zoom as configured, on the 512px tile grid mapbox styles use
    pub zoom: u8,
    /// The same scale on the 256px grid the viewer draws
    pub map_zoom: u8,
    pub basemap_url: Option<String>,
    pub attribution: String,
    pub legend: Legend,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/view", get(view_handler))
        .route("/api/query", get(query_handler))
        .route("/tiles/:z/:x/:y", get(tile_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: AppConfig, layer: MapLayer) -> Result<()> {
    let port = config.server.port;
    let state = Arc::new(AppState { layer, config });
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Map available at http://{}/", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn view_handler(State(state): State<Arc<AppState>>) -> Json<ViewResponse> {
    let style = &state.config.style;
    let choropleth = state.layer.choropleth();
    let Center { lat, lon } = style.center;

    Json(ViewResponse {
        center: [lat, lon],
        zoom: style.zoom,
        map_zoom: style.zoom.saturating_add(1),
        basemap_url: style.background_style.tile_url().map(str::to_string),
        attribution: style.background_style.attribution().to_string(),
        legend: Legend {
            show_scale: style.show_scale,
            color_scale: choropleth.scale.to_string(),
            stops: choropleth.scale.css_stops(),
            min: choropleth.range.map(|r| r.min),
            max: choropleth.range.map(|r| r.max),
        },
    })
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<HoverInfo>> {
    Json(
        state
            .layer
            .feature_at(params.lat, params.lon)
            .and_then(|feature| feature.hover.clone()),
    )
}

async fn tile_handler(
    State(state): State<Arc<AppState>>,
    Path((z, x, y)): Path<(u8, u32, String)>,
) -> Response {
    let Ok(y) = y.trim_end_matches(".png").parse::<u32>() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // CPU bound
    let result = tokio::task::spawn_blocking(move || state.layer.tile_png(z, x, y)).await;

    match result {
        Ok(Ok(Some(png))) => (
            [(header::CONTENT_TYPE, "image/png")],
            png.to_vec(),
        )
            .into_response(),
        Ok(Ok(None)) => StatusCode::NOT_FOUND.into_response(),
        Ok(Err(e)) => {
            error!("Failed to render tile {}/{}/{}: {:?}", z, x, y, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            error!("Tile task for {}/{}/{} failed: {:?}", z, x, y, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
