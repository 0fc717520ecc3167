//! IDF snapshot persistence and the periodic autosave task
//!
//! Snapshots are written to `<file>.last`, fsynced, then renamed over
//! `<file>`. A missing or unreadable snapshot initializes an empty store;
//! the daemon never refuses to start over snapshot problems.

use super::{IdfState, IdfStore};
use crate::error::Result;
use crate::shutdown::ShutdownNotifier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// On-disk snapshot shape. The tokenizer identity is part of the schema:
/// statistics produced under one encoding are invalid under another.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdfSnapshot {
    pub tokenizer: String,
    #[serde(rename = "DF")]
    pub df: HashMap<u32, u64>,
    #[serde(rename = "N")]
    pub n: u64,
    #[serde(rename = "IDF")]
    pub idf: HashMap<u32, f64>,
    #[serde(rename = "NgramDF")]
    pub ngram_df: HashMap<u64, u64>,
    #[serde(rename = "NgramIDF")]
    pub ngram_idf: HashMap<u64, f64>,
    #[serde(rename = "TotalTokens")]
    pub total_tokens: i64,
}

impl IdfSnapshot {
    fn from_state(state: &IdfState, tokenizer: &str) -> Self {
        Self {
            tokenizer: tokenizer.to_string(),
            df: state.df.clone(),
            n: state.n,
            idf: state.idf.clone(),
            ngram_df: state.ngram_df.clone(),
            ngram_idf: state.ngram_idf.clone(),
            total_tokens: state.total_tokens,
        }
    }

    fn into_state(self) -> IdfState {
        IdfState {
            df: self.df,
            idf: self.idf,
            ngram_df: self.ngram_df,
            ngram_idf: self.ngram_idf,
            n: self.n,
            total_tokens: self.total_tokens,
            dirty: false,
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut last = path.as_os_str().to_os_string();
    last.push(".last");
    let last = std::path::PathBuf::from(last);
    let mut file = std::fs::File::create(&last)?;
    if let Err(e) = file.write_all(data).and_then(|_| file.sync_all()) {
        let _ = std::fs::remove_file(&last);
        return Err(e);
    }
    drop(file);
    std::fs::rename(&last, path)
}

/// Write the store to disk. Always writes, regardless of the dirty flag.
pub fn save(store: &IdfStore, path: &Path, tokenizer: &str) -> Result<()> {
    let mut state = store.write();
    let snapshot = IdfSnapshot::from_state(&state, tokenizer);
    let data = serde_json::to_vec(&snapshot)?;
    write_atomic(path, &data)?;
    state.dirty = false;
    Ok(())
}

/// Write the store to disk only when it changed since the last save.
/// Returns whether a snapshot was written.
pub fn save_if_dirty(store: &IdfStore, path: &Path, tokenizer: &str) -> Result<bool> {
    let mut state = store.write();
    if !state.dirty {
        return Ok(false);
    }
    let snapshot = IdfSnapshot::from_state(&state, tokenizer);
    let data = serde_json::to_vec(&snapshot)?;
    write_atomic(path, &data)?;
    state.dirty = false;
    Ok(true)
}

/// Load the store from disk. A missing file, a parse error, or a snapshot
/// written under a different tokenizer all initialize an empty store.
pub fn load(store: &IdfStore, path: &Path, tokenizer: &str) {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "IDF snapshot not found, initializing empty store");
            store.replace(IdfState::default());
            return;
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "error reading IDF snapshot, initializing empty store");
            store.replace(IdfState::default());
            return;
        }
    };

    let snapshot: IdfSnapshot = match serde_json::from_slice(&data) {
        Ok(s) => s,
        Err(e) => {
            error!(path = %path.display(), error = %e, "IDF snapshot parse error, initializing empty store");
            store.replace(IdfState::default());
            return;
        }
    };

    if snapshot.tokenizer != tokenizer {
        warn!(
            snapshot_tokenizer = %snapshot.tokenizer,
            tokenizer = %tokenizer,
            "IDF snapshot was written under a different tokenizer, initializing empty store"
        );
        store.replace(IdfState::default());
        return;
    }

    info!(n = snapshot.n, total_tokens = snapshot.total_tokens, "loaded IDF snapshot");
    store.replace(snapshot.into_state());
}

/// Periodically snapshot the store until shutdown is signalled; a final
/// pending save completes before the task exits.
pub fn spawn_autosave(
    store: Arc<IdfStore>,
    path: std::path::PathBuf,
    tokenizer: String,
    period: Duration,
    notifier: ShutdownNotifier,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await; // first tick fires immediately
        loop {
            let save_store = store.clone();
            let save_path = path.clone();
            let save_tokenizer = tokenizer.clone();
            tokio::select! {
                _ = notifier.wait() => {
                    let _ = tokio::task::spawn_blocking(move || {
                        match save_if_dirty(&save_store, &save_path, &save_tokenizer) {
                            Ok(true) => info!("IDF saved on shutdown"),
                            Ok(false) => {}
                            Err(e) => error!(error = %e, "final IDF save failed"),
                        }
                    })
                    .await;
                    return;
                }
                _ = ticker.tick() => {
                    let result = tokio::task::spawn_blocking(move || {
                        save_if_dirty(&save_store, &save_path, &save_tokenizer)
                    })
                    .await;
                    match result {
                        Ok(Ok(true)) => debug!("IDF autosaved"),
                        Ok(Ok(false)) => {}
                        Ok(Err(e)) => error!(error = %e, "IDF autosave failed"),
                        Err(e) => error!(error = %e, "IDF autosave task failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizerConfig;
    use crate::tokenize::TokenService;

    fn token_service() -> TokenService {
        TokenService::new(&TokenizerConfig {
            cache_size: 64,
            cache_ttl_secs: 0,
            reserve_percent: 0.0,
        })
        .unwrap()
    }

    #[test]
    fn test_snapshot_round_trip() {
        let tokens = token_service();
        let store = IdfStore::new(false);
        for body in ["first document body", "second body", "third one here"] {
            let hash = crate::tokenize::sha512_hex(body);
            store.add_document(&tokens, body, tokens.count_with_reserve(body), &hash);
        }
        let before = store.read().clone();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idf.json");
        save(&store, &path, "cl100k_base").unwrap();

        let restored = IdfStore::new(false);
        load(&restored, &path, "cl100k_base");
        let after = restored.read();

        assert_eq!(after.n, before.n);
        assert_eq!(after.total_tokens, before.total_tokens);
        assert_eq!(after.df, before.df);
        assert_eq!(after.ngram_df, before.ngram_df);
        for (id, w) in &before.idf {
            assert!((after.idf[id] - w).abs() < 1e-12);
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdfStore::new(false);
        load(&store, &dir.path().join("absent.json"), "cl100k_base");
        assert_eq!(store.read().n, 0);
    }

    #[test]
    fn test_parse_error_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = IdfStore::new(false);
        load(&store, &path, "cl100k_base");
        assert_eq!(store.read().n, 0);
    }

    #[test]
    fn test_tokenizer_mismatch_loads_empty() {
        let tokens = token_service();
        let store = IdfStore::new(false);
        let hash = crate::tokenize::sha512_hex("doc");
        store.add_document(&tokens, "doc", 1, &hash);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idf.json");
        save(&store, &path, "cl100k_base").unwrap();

        let restored = IdfStore::new(false);
        load(&restored, &path, "o200k_base");
        assert_eq!(restored.read().n, 0);
    }

    #[test]
    fn test_save_clears_dirty() {
        let tokens = token_service();
        let store = IdfStore::new(false);
        let hash = crate::tokenize::sha512_hex("doc");
        store.add_document(&tokens, "doc", 1, &hash);
        assert!(store.read().dirty);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idf.json");
        assert!(save_if_dirty(&store, &path, "cl100k_base").unwrap());
        assert!(!store.read().dirty);
        assert!(!save_if_dirty(&store, &path, "cl100k_base").unwrap());
    }
}
