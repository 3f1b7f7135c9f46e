//! Environment-driven server settings. Command-line flags override
//! these; both override the built-in defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context as _, Result};

pub const DEFAULT_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self> {
        let addr = env::var("COMPLAINTFLOW_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let addr: SocketAddr =
            addr.parse().with_context(|| format!("invalid COMPLAINTFLOW_ADDR `{addr}`"))?;

        let log_level = env::var("COMPLAINTFLOW_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
        let log_dir = env::var("COMPLAINTFLOW_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self { addr, log_level, log_dir })
    }
}
