//! Remote store backed by a JSON document on disk, so the authoritative state
//! can be edited by hand while the companion runs.

use async_trait::async_trait;
use companion_sync::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct JsonRemoteState {
    path: PathBuf,
}

impl JsonRemoteState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RemoteStateSource for JsonRemoteState {
    async fn fetch_latest_state(&self) -> SyncResult<Option<BTreeMap<String, Value>>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SyncError::RemoteStore {
                    reason: format!("{}: {err}", self.path.display()),
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| SyncError::RemoteStore {
                reason: format!("{}: {err}", self.path.display()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_file_means_no_remote_state() {
        let dir = tempfile::tempdir().unwrap();
        let remote = JsonRemoteState::new(dir.path().join("remote.json"));
        assert_eq!(remote.fetch_latest_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_keyed_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.json");
        std::fs::write(&path, r#"{"progress.current_week": 5}"#).unwrap();

        let state = JsonRemoteState::new(&path)
            .fetch_latest_state()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.get("progress.current_week"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn malformed_document_is_a_remote_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.json");
        std::fs::write(&path, "[1, 2").unwrap();

        let err = JsonRemoteState::new(&path)
            .fetch_latest_state()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteStore { .. }));
    }
}
