//! Dashboard Portal Library
//!
//! An authenticated menu of analytics dashboards backed by cloud blob storage.
//!
//! # Features
//!
//! - **Sign-in**: OAuth2 authorization-code flow with PKCE against an external
//!   identity provider, with a per-session token cache and silent refresh
//! - **Access gate**: every dashboard route requires a valid token and one of
//!   the configured role claims
//! - **Blob cache**: data files are served from a local compressed cache as long
//!   as the remote copy has not been modified since
//! - **Dashboards**: pluggable pages; ships a k-means clustering view

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod credential;
pub mod dashboards;
pub mod data;
pub mod error;
pub mod oauth;
pub mod portal;
pub mod secrets;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let initialized = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    initialized.map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))
}
