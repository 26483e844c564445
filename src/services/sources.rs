use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use url::Url;

use crate::errors::{LauncherError, Result};
use crate::models::{LoadJsonRawRequest, LoadJsonRequest, Source, SourceImport, SourceItem};
use crate::services::ApiClient;

// Keys checked in order before falling back to the first array-valued key.
const ITEM_ARRAY_KEYS: &[&str] = &["items", "downloads", "data", "results", "content"];

/// Source endpoints of the backend.
#[async_trait]
pub trait SourcesBackend: Send + Sync {
    async fn list_sources(&self) -> Result<Vec<Source>>;
    async fn source_items(&self, source_id: i64) -> Result<Vec<SourceItem>>;
    async fn import_url(&self, url: &str) -> Result<SourceImport>;
    async fn import_raw(&self, data: &Value) -> Result<SourceImport>;
    async fn delete_source(&self, source_id: i64) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpSourcesBackend {
    api: ApiClient,
}

impl HttpSourcesBackend {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl SourcesBackend for HttpSourcesBackend {
    async fn list_sources(&self) -> Result<Vec<Source>> {
        self.api.get("api/sources").await
    }

    async fn source_items(&self, source_id: i64) -> Result<Vec<SourceItem>> {
        self.api
            .get(&format!("api/sources/{}/items", source_id))
            .await
    }

    async fn import_url(&self, url: &str) -> Result<SourceImport> {
        let body = LoadJsonRequest {
            url: url.to_string(),
        };
        self.api.post("api/load-json", &body).await
    }

    async fn import_raw(&self, data: &Value) -> Result<SourceImport> {
        let body = LoadJsonRawRequest { data: data.clone() };
        self.api.post("api/load-json/raw", &body).await
    }

    async fn delete_source(&self, source_id: i64) -> Result<()> {
        let _: Value = self
            .api
            .delete(&format!("api/sources/{}", source_id))
            .await?;
        Ok(())
    }
}

/// Finds the item array of a pasted catalog document. Returns the key it
/// was found under (empty for a top-level array) and the array itself.
pub fn detect_item_array(data: &Value) -> Option<(&str, &[Value])> {
    match data {
        Value::Array(items) => Some(("", items.as_slice())),
        Value::Object(map) => ITEM_ARRAY_KEYS
            .iter()
            .find_map(|key| {
                map.get(*key)
                    .and_then(Value::as_array)
                    .map(|items| (*key, items.as_slice()))
            })
            .or_else(|| {
                map.iter().find_map(|(key, value)| {
                    value.as_array().map(|items| (key.as_str(), items.as_slice()))
                })
            }),
        _ => None,
    }
}

fn item_key(item: &SourceItem) -> &str {
    item.id.as_deref().unwrap_or(item.url.as_str())
}

/// Registered sources and the items loaded from them.
#[derive(Clone)]
pub struct SourceCatalog {
    backend: Arc<dyn SourcesBackend>,
    inner: Arc<CatalogInner>,
}

struct CatalogInner {
    state: RwLock<CatalogState>,
    revision: watch::Sender<u64>,
}

#[derive(Default)]
struct CatalogState {
    sources: Vec<Source>,
    items: Vec<SourceItem>,
}

impl SourceCatalog {
    pub fn new(backend: Arc<dyn SourcesBackend>) -> Self {
        let (revision, _) = watch::channel(0_u64);
        Self {
            backend,
            inner: Arc::new(CatalogInner {
                state: RwLock::new(CatalogState::default()),
                revision,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn sources(&self) -> Vec<Source> {
        self.read().sources.clone()
    }

    pub fn items(&self) -> Vec<SourceItem> {
        self.read().items.clone()
    }

    pub fn items_for(&self, source_id: i64) -> Vec<SourceItem> {
        self.read()
            .items
            .iter()
            .filter(|item| item.source_id == Some(source_id))
            .cloned()
            .collect()
    }

    pub async fn fetch_sources(&self) -> Result<usize> {
        let sources = self.backend.list_sources().await?;
        let count = sources.len();
        tracing::info!("loaded {} sources", count);
        self.write().sources = sources;
        self.bump();
        Ok(count)
    }

    /// Adds the items of one source, skipping ones already present. Returns
    /// how many were added.
    pub async fn fetch_source_items(&self, source_id: i64) -> Result<usize> {
        let fetched = self.backend.source_items(source_id).await?;
        let received = fetched.len();
        let added = {
            let mut state = self.write();
            let mut known: HashSet<String> =
                state.items.iter().map(|item| item_key(item).to_string()).collect();
            let before = state.items.len();
            for item in fetched {
                if known.insert(item_key(&item).to_string()) {
                    state.items.push(item);
                }
            }
            state.items.len() - before
        };
        tracing::info!(
            "source {}: {} items received, {} new",
            source_id,
            received,
            added
        );
        if added > 0 {
            self.bump();
        }
        Ok(added)
    }

    /// Rebuilds the item list from every known source. The previous list is
    /// kept if any source fails.
    pub async fn fetch_all_items(&self) -> Result<usize> {
        let mut items = Vec::new();
        for source in self.sources() {
            let fetched = self.backend.source_items(source.id).await?;
            tracing::debug!("source {}: {} items", source.id, fetched.len());
            items.extend(fetched);
        }
        let count = items.len();
        self.write().items = items;
        self.bump();
        tracing::info!("loaded {} items from all sources", count);
        Ok(count)
    }

    /// Registers a JSON catalog URL. A duplicate only refreshes the source
    /// list; a new source also has its items loaded.
    pub async fn load_json_from_url(&self, url: &str) -> Result<SourceImport> {
        let trimmed = url.trim();
        match Url::parse(trimmed) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => {
                return Err(LauncherError::Validation(format!(
                    "source url must be http(s): {}",
                    trimmed
                )))
            }
        }

        let import = self.backend.import_url(trimmed).await?;
        self.after_import(&import).await?;
        Ok(import)
    }

    /// Registers a pasted catalog document after checking it holds items.
    pub async fn load_json_raw(&self, data: Value) -> Result<SourceImport> {
        let count = match detect_item_array(&data) {
            Some((key, items)) if !items.is_empty() => {
                tracing::debug!("pasted catalog items found under {:?}", key);
                items.len()
            }
            _ => {
                return Err(LauncherError::Validation(
                    "no item array found; accepted formats are [], {items: []}, \
                     {downloads: []}, {data: []}, {results: []}, {content: []}"
                        .to_string(),
                ))
            }
        };
        tracing::info!("importing pasted catalog with {} items", count);

        let import = self.backend.import_raw(&data).await?;
        self.after_import(&import).await?;
        Ok(import)
    }

    async fn after_import(&self, import: &SourceImport) -> Result<()> {
        self.fetch_sources().await?;
        if import.duplicate {
            tracing::warn!("source {} was already registered", import.source_id);
            return Ok(());
        }
        tracing::info!("source {} registered", import.source_id);
        self.fetch_source_items(import.source_id).await?;
        Ok(())
    }

    /// Deletes a source and its cached items. A source the backend no longer
    /// knows is treated as already deleted.
    pub async fn delete_source(&self, source_id: i64) -> Result<()> {
        match self.backend.delete_source(source_id).await {
            Ok(()) => {}
            Err(err) => match err.into_stale(&[404]) {
                LauncherError::StaleState(message) => {
                    tracing::warn!("source {} was already gone: {}", source_id, message);
                }
                err => return Err(err),
            },
        }
        self.write()
            .items
            .retain(|item| item.source_id != Some(source_id));
        self.bump();
        self.fetch_sources().await?;
        Ok(())
    }
}
