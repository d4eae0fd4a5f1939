//! HTTP command surface: REST routes over the broker, plus the SSE stream.

use crate::broker::{Broker, CreatePositionRequest, Stats};
use crate::error::AppResult;
use crate::live_stream::LiveStream;
use crate::store::SlTpPatch;
use crate::types::{Event, Money, Position, PositionStatus, Settings, SettingsPatch};
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

pub struct AppState {
    pub broker: Broker,
    pub live_stream: Arc<LiveStream>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/positions", web::post().to(create_position))
        .route("/positions", web::get().to(list_positions))
        .route("/positions/{id}", web::get().to(get_position))
        .route("/positions/{id}", web::patch().to(update_sltp))
        .route("/positions/{id}", web::delete().to(delete_position))
        .route("/positions/{id}/close", web::post().to(close_position))
        .route("/stats", web::get().to(get_stats))
        .route("/events", web::get().to(get_events))
        .route("/stream", web::get().to(stream_positions))
        .route("/export", web::get().to(export_csv))
        .route("/settings", web::get().to(get_settings))
        .route("/settings", web::post().to(update_settings))
        .route("/settings", web::patch().to(update_settings));
}

async fn create_position(
    state: web::Data<AppState>,
    body: web::Json<CreatePositionRequest>,
) -> AppResult<HttpResponse> {
    let position = state.broker.create_position(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(position))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_positions(state: web::Data<AppState>, query: web::Query<ListQuery>) -> AppResult<HttpResponse> {
    let status = match query.status.as_deref() {
        Some("OPEN") => Some(PositionStatus::Open),
        Some("CLOSED") => Some(PositionStatus::Closed),
        _ => None,
    };
    let positions: Vec<Position> = state.broker.list_positions(status)?;
    Ok(HttpResponse::Ok().json(positions))
}

async fn get_position(state: web::Data<AppState>, id: web::Path<i64>) -> AppResult<HttpResponse> {
    let position = state.broker.get_position(id.into_inner())?;
    Ok(HttpResponse::Ok().json(position))
}

#[derive(Debug, Deserialize, Default)]
struct SlTpBody {
    #[serde(default, deserialize_with = "deserialize_nullable_f64")]
    sl: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_nullable_f64")]
    tp: Option<Option<f64>>,
}

// Distinguishes an absent field ("not in the JSON body") from an explicit
// `null` ("clear this trigger"), which `Option<Option<f64>>`'s default serde
// impl cannot do on its own.
fn deserialize_nullable_f64<'de, D>(deserializer: D) -> Result<Option<Option<f64>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer).map(Some)
}

async fn update_sltp(
    state: web::Data<AppState>,
    id: web::Path<i64>,
    body: web::Json<SlTpBody>,
) -> AppResult<HttpResponse> {
    let patch = SlTpPatch {
        sl: body.sl.map(|v| v.map(Money::from_f64)),
        tp: body.tp.map(|v| v.map(Money::from_f64)),
    };
    let position = state.broker.update_sltp(id.into_inner(), patch)?;
    Ok(HttpResponse::Ok().json(position))
}

async fn close_position(state: web::Data<AppState>, id: web::Path<i64>) -> AppResult<HttpResponse> {
    let position = state.broker.close_position_manual(id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(position))
}

async fn delete_position(state: web::Data<AppState>, id: web::Path<i64>) -> AppResult<HttpResponse> {
    state.broker.delete_position(id.into_inner())?;
    Ok(HttpResponse::NoContent().finish())
}

async fn get_stats(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let stats: Stats = state.broker.get_stats()?;
    Ok(HttpResponse::Ok().json(stats))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    position_id: Option<i64>,
    limit: Option<i64>,
}

async fn get_events(state: web::Data<AppState>, query: web::Query<EventsQuery>) -> AppResult<HttpResponse> {
    let events: Vec<Event> = state.broker.get_events(query.position_id, query.limit)?;
    Ok(HttpResponse::Ok().json(events))
}

async fn stream_positions(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(state.live_stream.client_stream())
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    #[serde(rename = "startDate")]
    start_date: Option<DateTime<Utc>>,
    #[serde(rename = "endDate")]
    end_date: Option<DateTime<Utc>>,
    symbol: Option<String>,
}

async fn export_csv(state: web::Data<AppState>, query: web::Query<ExportQuery>) -> AppResult<HttpResponse> {
    let symbol = query.symbol.as_deref().map(crate::types::Symbol::new);
    let csv = state.broker.export_csv(query.start_date, query.end_date, symbol)?;
    Ok(HttpResponse::Ok()
        .content_type("text/csv")
        .insert_header(("Content-Disposition", "attachment; filename=\"positions.csv\""))
        .body(csv))
}

async fn get_settings(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let settings: Settings = state.broker.get_settings()?;
    Ok(HttpResponse::Ok().json(settings))
}

async fn update_settings(
    state: web::Data<AppState>,
    body: web::Json<SettingsPatch>,
) -> AppResult<HttpResponse> {
    let settings = state.broker.update_settings(body.into_inner())?;
    Ok(HttpResponse::Ok().json(settings))
}
