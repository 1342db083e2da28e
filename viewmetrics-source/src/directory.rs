//! View source backed by a directory of exported record files

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use viewmetrics_shared::{Dataset, FetchError};

use crate::{check_view_id, ViewSource};

/// Reads `<root>/<view_id>.json`, each holding a JSON record list
pub struct DirectoryViewSource {
    root: PathBuf,
}

impl DirectoryViewSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn view_path(&self, view_id: &str) -> PathBuf {
        self.root.join(format!("{view_id}.json"))
    }
}

#[async_trait]
impl ViewSource for DirectoryViewSource {
    async fn fetch_view(&self, view_id: &str) -> Result<Dataset, FetchError> {
        check_view_id(view_id)?;
        let path = self.view_path(view_id);

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| FetchError::new(view_id, format!("{}: {e}", path.display())))?;

        let dataset = Dataset::from_records_json(&content)
            .map_err(|e| FetchError::new(view_id, e.to_string()))?;

        tracing::debug!(view_id, rows = dataset.len(), path = %path.display(), "Loaded view export");
        Ok(dataset)
    }

    fn source_name(&self) -> &'static str {
        "directory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_view_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("v1.json"),
            r#"[{"category": "filter1", "value": 4}]"#,
        )
        .unwrap();

        let source = DirectoryViewSource::new(dir.path());
        let dataset = source.fetch_view("v1").await.unwrap();
        assert_eq!(dataset.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_fetch_error() {
        let dir = TempDir::new().unwrap();
        let source = DirectoryViewSource::new(dir.path());

        let err = source.fetch_view("absent").await.unwrap_err();
        assert_eq!(err.view_id, "absent");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fetch_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("v1.json"), "{not json").unwrap();

        let source = DirectoryViewSource::new(dir.path());
        assert!(source.fetch_view("v1").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let source = DirectoryViewSource::new(dir.path());
        assert!(source.fetch_view("../secrets").await.is_err());
    }
}
