//! Upstream reporting-service clients
//!
//! A [`ViewSource`] turns a view id into a [`Dataset`]. Implementations must be
//! safe to call concurrently for distinct ids; the metrics server fans out one
//! call per missing view.

pub mod directory;
pub mod http;

pub use directory::DirectoryViewSource;
pub use http::HttpViewSource;

use async_trait::async_trait;
use std::sync::Arc;
use viewmetrics_shared::{Dataset, FetchError, Result, SourceConfig};

/// Fetch capability for one remote tabular view
#[async_trait]
pub trait ViewSource: Send + Sync {
    /// Fetch the current rows of a view
    async fn fetch_view(&self, view_id: &str) -> std::result::Result<Dataset, FetchError>;

    /// Name of the source implementation, for logs
    fn source_name(&self) -> &'static str;
}

/// Build the configured view source
pub fn from_config(config: &SourceConfig) -> Result<Arc<dyn ViewSource>> {
    match config {
        SourceConfig::Http {
            base_url,
            token,
            timeout_secs,
        } => {
            let source = HttpViewSource::new(
                base_url,
                token.clone(),
                std::time::Duration::from_secs(*timeout_secs),
            )?;
            Ok(Arc::new(source))
        }
        SourceConfig::Directory { path } => Ok(Arc::new(DirectoryViewSource::new(path))),
    }
}

/// Reject ids that cannot be embedded in a URL path segment or file name
pub(crate) fn check_view_id(view_id: &str) -> std::result::Result<(), FetchError> {
    let valid = !view_id.is_empty()
        && view_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && view_id != "."
        && view_id != "..";

    if valid {
        Ok(())
    } else {
        Err(FetchError::new(view_id, "invalid view id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_view_id() {
        assert!(check_view_id("sales-by-region_2024.v2").is_ok());
        assert!(check_view_id("").is_err());
        assert!(check_view_id("..").is_err());
        assert!(check_view_id("a/b").is_err());
        assert!(check_view_id("a b").is_err());
    }

    #[test]
    fn test_from_config_directory() {
        let source = from_config(&SourceConfig::Directory {
            path: "/tmp/views".to_string(),
        })
        .unwrap();
        assert_eq!(source.source_name(), "directory");
    }

    #[test]
    fn test_from_config_rejects_bad_url() {
        let result = from_config(&SourceConfig::Http {
            base_url: "not a url".to_string(),
            token: None,
            timeout_secs: 5,
        });
        assert!(result.is_err());
    }
}
