//! Engine configuration
//!
//! An engine is described by a URL whose scheme selects the backend, the way
//! `mem://` selects the in-memory engine. Unknown schemes are rejected with
//! `ScopeError::UnsupportedEngine` before any connection is attempted.

use serde::{Deserialize, Serialize};

use crate::error::{ScopeError, ScopeResult};

/// Default URL when `TXSCOPE_DATABASE_URL` is not set.
pub const DEFAULT_URL: &str = "mem://";

/// Engine backends this crate can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// `mem://` or `memory://`
    Memory,
}

/// Configuration for opening an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine URL (e.g. "mem://", "memory://test")
    pub url: String,
    /// Name used in log lines (default: the URL)
    #[serde(default)]
    pub name: Option<String>,
}

impl EngineConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
        }
    }

    /// Set a display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - TXSCOPE_DATABASE_URL (optional, default: "mem://")
    /// - TXSCOPE_ENGINE_NAME (optional)
    pub fn from_env() -> Self {
        let url = std::env::var("TXSCOPE_DATABASE_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
        let name = std::env::var("TXSCOPE_ENGINE_NAME").ok();
        Self { url, name }
    }

    /// Name for log lines.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }

    /// URL scheme, lowercased.
    pub fn scheme(&self) -> ScopeResult<String> {
        match self.url.split_once("://") {
            Some((scheme, _)) if !scheme.is_empty() => Ok(scheme.to_ascii_lowercase()),
            _ => Err(ScopeError::Config(format!(
                "engine url must look like <scheme>://..., got {:?}",
                self.url
            ))),
        }
    }

    /// Which backend the URL selects.
    pub fn kind(&self) -> ScopeResult<EngineKind> {
        let scheme = self.scheme()?;
        match scheme.as_str() {
            "mem" | "memory" => Ok(EngineKind::Memory),
            _ => Err(ScopeError::UnsupportedEngine { scheme }),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_schemes() {
        assert_eq!(EngineConfig::new("mem://").kind().unwrap(), EngineKind::Memory);
        assert_eq!(
            EngineConfig::new("MEMORY://orders").kind().unwrap(),
            EngineKind::Memory
        );
    }

    #[test]
    fn test_unknown_scheme_is_unsupported() {
        let err = EngineConfig::new("postgres://localhost/app").kind().unwrap_err();
        assert!(matches!(
            err,
            ScopeError::UnsupportedEngine { ref scheme } if scheme == "postgres"
        ));
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_url_without_scheme_is_config_error() {
        assert!(matches!(
            EngineConfig::new("localhost").kind(),
            Err(ScopeError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::new("://x").kind(),
            Err(ScopeError::Config(_))
        ));
    }

    #[test]
    fn test_display_name() {
        assert_eq!(EngineConfig::new("mem://").display_name(), "mem://");
        assert_eq!(
            EngineConfig::new("mem://").with_name("orders").display_name(),
            "orders"
        );
    }

    #[test]
    fn test_deserialize_without_name() {
        let config: EngineConfig = serde_json::from_str(r#"{"url": "mem://"}"#).unwrap();
        assert_eq!(config, EngineConfig::new("mem://"));
    }
}
