//! Crate-wide error type.
//!
//! Library-boundary failures are typed so the HTTP layer can turn them into
//! `{"error": "..."}" bodies without ever propagating a panic across the
//! request boundary (see the error-handling design in SPEC_FULL.md §10.3).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpasnError {
    #[error("No route views have been loaded for {source} / {family} yet.")]
    NoRouteViews { source: String, family: String },

    #[error(
        "Unable to find a date in the expected interval: {min} -> {max} for {source}."
    )]
    OutsidePrecision {
        source: String,
        min: String,
        max: String,
    },

    #[error(
        "The first date of the interval ({first}) has to be before the last one ({last})..."
    )]
    IntervalOrder { first: String, last: String },

    #[error(
        "No data available in the given interval: {first} -> {last}. Nearest data to first: {near_first}, nearest data to last: {near_last}"
    )]
    EmptyInterval {
        first: String,
        last: String,
        near_first: String,
        near_last: String,
    },

    #[error("Query invalid: {0}")]
    InvalidQuery(String),

    #[error("malformed prefix: {0}")]
    InvalidPrefix(String),

    #[error("malformed IP literal: {0}")]
    InvalidIp(String),

    #[error("malformed date: {0}")]
    InvalidDate(String),

    #[error("cache store error: {0}")]
    Cache(String),

    #[error("storage store error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, IpasnError>;
