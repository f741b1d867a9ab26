//! HTTP frontend (spec §6), grounded in the Flask-RESTX routes of
//! `examples/original_source/website/web/__init__.py`, rebuilt on `axum` the
//! way the BGP-domain examples (`wayback-rpki`, `monocle`) expose their HTTP
//! surfaces.
//!
//! Every handler returns `200` with a JSON body; failures surface as
//! `{"error": "..."}` rather than a 4xx/5xx status or a panic (spec §7), so a
//! caller never needs to branch on status code to find out what went wrong —
//! matching the original Flask API's behavior.

use crate::error::IpasnError;
use crate::key::AddressFamily;
use crate::router::{DateSelector, Router};
use crate::store::{CacheStore, ResponseHash, StorageStore};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// How long `query` blocks waiting for a worker to answer before returning
/// whatever it has (spec §4.4 "query... polls until answered").
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AppState<C: CacheStore, S: StorageStore> {
    pub router: Router<C, S>,
    pub sources: Vec<String>,
}

pub fn build_router<C, S>(state: Arc<AppState<C, S>>) -> axum::Router
where
    C: CacheStore + 'static,
    S: StorageStore + 'static,
{
    axum::Router::new()
        .route("/", get(query_handler))
        .route("/mass_query", post(mass_query_handler))
        .route("/mass_cache", post(mass_cache_handler))
        .route("/asn_meta", post(asn_meta_handler))
        .route("/meta", get(meta_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wraps [`IpasnError`] as a JSON body instead of letting it become a panic
/// or an opaque 500 (spec §7).
struct AppError(IpasnError);

impl From<IpasnError> for AppError {
    fn from(e: IpasnError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        Json(ErrorBody {
            error: self.0.to_string(),
        })
        .into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// `precision_delta` (spec §6): a dict of any of `{days, seconds,
/// microseconds, milliseconds, minutes, hours, weeks}`, summed into one
/// `chrono::Duration`. Every field defaults to zero, so `{"days":1}` means
/// exactly one day, not one day plus whatever else was left unset.
#[derive(Debug, Deserialize, Default)]
struct PrecisionDelta {
    #[serde(default)]
    days: i64,
    #[serde(default)]
    weeks: i64,
    #[serde(default)]
    hours: i64,
    #[serde(default)]
    minutes: i64,
    #[serde(default)]
    seconds: i64,
    #[serde(default)]
    milliseconds: i64,
    #[serde(default)]
    microseconds: i64,
}

impl PrecisionDelta {
    fn to_duration(&self) -> ChronoDuration {
        ChronoDuration::weeks(self.weeks)
            + ChronoDuration::days(self.days)
            + ChronoDuration::hours(self.hours)
            + ChronoDuration::minutes(self.minutes)
            + ChronoDuration::seconds(self.seconds)
            + ChronoDuration::milliseconds(self.milliseconds)
            + ChronoDuration::microseconds(self.microseconds)
    }
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    ip: String,
    source: Option<String>,
    date: Option<String>,
    first: Option<String>,
    last: Option<String>,
    /// JSON-encoded `PrecisionDelta` dict, e.g. `?precision_delta=%7B%22days%22%3A1%7D`
    /// — a query string has no native nested-object syntax, so the dict
    /// travels as its JSON text the way a `date` travels as ISO text.
    precision_delta: Option<String>,
}

fn parse_sources(raw: Option<&str>, configured: &[String]) -> Vec<String> {
    match raw {
        Some(s) if !s.is_empty() => s.split(',').map(|s| s.trim().to_string()).collect(),
        _ => configured.to_vec(),
    }
}

/// Parses a GET query string's `precision_delta` (see [`QueryParams`]).
fn parse_precision_delta_param(raw: Option<&str>) -> Result<Option<ChronoDuration>, AppError> {
    match raw {
        None => Ok(None),
        Some(s) => {
            let delta: PrecisionDelta = serde_json::from_str(s).map_err(|e| {
                AppError(IpasnError::InvalidQuery(format!("precision_delta: {e}")))
            })?;
            Ok(Some(delta.to_duration()))
        }
    }
}

fn selector_from(
    date: Option<String>,
    first: Option<String>,
    last: Option<String>,
    precision_delta: Option<ChronoDuration>,
) -> DateSelector {
    DateSelector {
        date,
        first,
        last,
        precision_delta,
    }
}

/// Builds the `{"meta": {...}, "response": {...}}` envelope (spec §6
/// "Response shape for `query`"), preserving the descending date order
/// `Router::query` already produced.
fn query_envelope(
    ip: &str,
    sources: &[String],
    family: AddressFamily,
    answer: Vec<(String, ResponseHash)>,
) -> serde_json::Value {
    let mut response = serde_json::Map::new();
    for (date, hash) in answer {
        response.insert(date, serde_json::json!(hash));
    }
    serde_json::json!({
        "meta": { "source": sources, "address_family": family.as_str(), "ip": ip },
        "response": response,
    })
}

async fn query_handler<C, S>(
    State(state): State<Arc<AppState<C, S>>>,
    Query(params): Query<QueryParams>,
) -> Result<Json<serde_json::Value>, AppError>
where
    C: CacheStore + 'static,
    S: StorageStore + 'static,
{
    let sources = parse_sources(params.source.as_deref(), &state.sources);
    let family = AddressFamily::infer(&params.ip);
    let is_point = params.first.is_none();
    let precision_delta = parse_precision_delta_param(params.precision_delta.as_deref())?;
    let selector = selector_from(params.date, params.first, params.last, precision_delta);
    let keys = state
        .router
        .keys_for_query(&sources, &params.ip, &selector)
        .await
        .map_err(AppError::from)?;
    let answer = state
        .router
        .query(&keys, QUERY_TIMEOUT, is_point)
        .await
        .map_err(AppError::from)?;
    Ok(Json(query_envelope(&params.ip, &sources, family, answer)))
}

#[derive(Debug, Deserialize)]
struct MassQueryBody {
    ips: Vec<String>,
    source: Option<Vec<String>>,
    date: Option<String>,
    first: Option<String>,
    last: Option<String>,
    #[serde(default)]
    precision_delta: Option<PrecisionDelta>,
}

async fn mass_query_handler<C, S>(
    State(state): State<Arc<AppState<C, S>>>,
    Json(body): Json<MassQueryBody>,
) -> Result<Json<serde_json::Value>, AppError>
where
    C: CacheStore + 'static,
    S: StorageStore + 'static,
{
    let sources = body.source.unwrap_or_else(|| state.sources.clone());
    let precision_delta = body.precision_delta.map(|d| d.to_duration());
    let selector = selector_from(body.date, body.first, body.last, precision_delta);

    let mut responses = Vec::with_capacity(body.ips.len());
    for ip in &body.ips {
        let family = AddressFamily::infer(ip);
        let keys = state
            .router
            .keys_for_query(&sources, ip, &selector)
            .await
            .map_err(AppError::from)?;
        let answered = state.router.mass_query(&keys).await.map_err(AppError::from)?;
        let collated = state.router.collate_mass_query(&keys, &answered);
        responses.push(query_envelope(ip, &sources, family, collated));
    }

    Ok(Json(serde_json::json!({
        "meta": { "number_queries": body.ips.len() },
        "responses": responses,
    })))
}

async fn mass_cache_handler<C, S>(
    State(state): State<Arc<AppState<C, S>>>,
    Json(body): Json<MassQueryBody>,
) -> Result<Json<serde_json::Value>, AppError>
where
    C: CacheStore + 'static,
    S: StorageStore + 'static,
{
    let sources = body.source.unwrap_or_else(|| state.sources.clone());
    let precision_delta = body.precision_delta.map(|d| d.to_duration());
    let selector = selector_from(body.date, body.first, body.last, precision_delta);

    let mut cached = Vec::new();
    let mut not_cached = Vec::new();
    for ip in &body.ips {
        match state.router.keys_for_query(&sources, ip, &selector).await {
            Ok(keys) => {
                state.router.mass_cache(&keys).await.map_err(AppError::from)?;
                cached.extend(keys.into_iter().map(|k| k.format()));
            }
            Err(e) => not_cached.push(serde_json::json!({ "ip": ip, "error": e.to_string() })),
        }
    }

    Ok(Json(serde_json::json!({
        "meta": { "number_queries": body.ips.len() },
        "cached": cached,
        "not_cached": not_cached,
    })))
}

#[derive(Debug, Deserialize)]
struct AsnMetaBody {
    source: String,
    family: AddressFamily,
    /// Omitted to enumerate every ASN announced on the resolved date(s).
    asn: Option<String>,
    date: Option<String>,
    first: Option<String>,
    last: Option<String>,
    #[serde(default)]
    precision_delta: Option<PrecisionDelta>,
}

/// `asn_meta` (spec §6): `{"meta":{...}, "response":{date:{asn:{prefixes,
/// ipcount}}}}`, the same nested-by-date envelope shape as `query`.
async fn asn_meta_handler<C, S>(
    State(state): State<Arc<AppState<C, S>>>,
    Json(body): Json<AsnMetaBody>,
) -> Result<Json<serde_json::Value>, AppError>
where
    C: CacheStore + 'static,
    S: StorageStore + 'static,
{
    let selector = selector_from(
        body.date,
        body.first,
        body.last,
        body.precision_delta.map(|d| d.to_duration()),
    );
    let by_date = state
        .router
        .asn_meta(&body.source, body.family, body.asn.as_deref(), &selector)
        .await
        .map_err(AppError::from)?;

    let mut response = serde_json::Map::new();
    for (date, by_asn) in by_date {
        let mut asn_map = serde_json::Map::new();
        for (asn, meta) in by_asn {
            asn_map.insert(
                asn,
                serde_json::json!({ "prefixes": meta.prefixes, "ipcount": meta.ipcount }),
            );
        }
        response.insert(date, serde_json::Value::Object(asn_map));
    }

    Ok(Json(serde_json::json!({
        "meta": { "source": body.source, "address_family": body.family.as_str() },
        "response": response,
    })))
}

/// `GET /meta` (spec §6): `{sources, expected_interval, cached_dates}`,
/// `cached_dates` nested `source -> family -> {cached, missing, percent}`.
async fn meta_handler<C, S>(
    State(state): State<Arc<AppState<C, S>>>,
) -> Result<Json<serde_json::Value>, AppError>
where
    C: CacheStore + 'static,
    S: StorageStore + 'static,
{
    let report = state.router.meta(&state.sources).await.map_err(AppError::from)?;

    let cached_dates: serde_json::Map<String, serde_json::Value> = report
        .cached_dates
        .into_iter()
        .map(|(source, families)| {
            let per_family: serde_json::Map<String, serde_json::Value> = families
                .into_iter()
                .map(|(family, meta)| {
                    (
                        family,
                        serde_json::json!({
                            "cached": meta.cached,
                            "missing": meta.missing,
                            "percent": meta.percent,
                        }),
                    )
                })
                .collect();
            (source, serde_json::Value::Object(per_family))
        })
        .collect();

    Ok(Json(serde_json::json!({
        "sources": state.sources,
        "expected_interval": { "first": report.expected_first, "last": report.expected_last },
        "cached_dates": cached_dates,
    })))
}
