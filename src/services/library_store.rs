use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use crate::errors::Result;
use crate::models::{
    EnrichmentCandidate, LibraryGroup, LibraryItem, LibraryResponse, LibraryStats,
    ResolverResponse,
};
use crate::services::ApiClient;

const UNKNOWN_GENRE_RANK: u32 = 999;

// Ordered by preference within a rank.
const GENRE_PRIORITY: &[(&str, u32)] = &[
    ("Ação", 1),
    ("Action", 1),
    ("Tiro", 1),
    ("Shooter", 1),
    ("FPS", 1),
    ("Corrida", 2),
    ("Racing", 2),
    ("Esportes", 2),
    ("Sports", 2),
    ("Luta", 3),
    ("Fighting", 3),
    ("RPG", 5),
    ("Estratégia", 6),
    ("Strategy", 6),
    ("Aventura", 7),
    ("Adventure", 7),
    ("Sobrevivência", 8),
    ("Survival", 8),
    ("Terror", 9),
    ("Horror", 9),
    ("Terror Psicológico", 9),
    ("Psychological Horror", 9),
    ("Simulação", 15),
    ("Simulation", 15),
    ("Plataforma", 16),
    ("Platformer", 16),
    ("Quebra-cabeça", 17),
    ("Puzzle", 17),
    ("Sandbox", 18),
    ("Mundo Aberto", 19),
    ("Open World", 19),
    ("Indie", 100),
    ("Casual", 105),
    ("Multijogador", 110),
    ("Multiplayer", 110),
    ("Massively Multiplayer", 110),
    ("Acesso Antecipado", 200),
    ("Early Access", 200),
    ("Gratuito para Jogar", 205),
    ("Free to Play", 205),
    ("Utilitários", 210),
    ("Utilities", 210),
];

fn genre_rank(genre: &str) -> (u32, usize) {
    GENRE_PRIORITY
        .iter()
        .position(|(name, _)| *name == genre)
        .map(|index| (GENRE_PRIORITY[index].1, index))
        .unwrap_or((UNKNOWN_GENRE_RANK, usize::MAX))
}

/// Display category for a genre list: the best ranked genre, or `None` for an
/// empty list.
pub fn category_for(genres: &[String]) -> Option<String> {
    genres
        .iter()
        .enumerate()
        .min_by_key(|(position, genre)| {
            let (rank, index) = genre_rank(genre);
            (rank, index, *position)
        })
        .map(|(_, genre)| genre.clone())
}

/// Cached library groups as served by `GET /api/library`.
#[derive(Clone)]
pub struct LibraryStore {
    api: ApiClient,
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: RwLock<StoreState>,
    revision: watch::Sender<u64>,
}

#[derive(Default)]
struct StoreState {
    groups: Vec<LibraryGroup>,
    stats: LibraryStats,
    loaded: bool,
}

impl LibraryStore {
    pub fn new(api: ApiClient) -> Self {
        let (revision, _) = watch::channel(0_u64);
        Self {
            api,
            inner: Arc::new(StoreInner {
                state: RwLock::new(StoreState::default()),
                revision,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
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

    /// Loads the library unless it is already cached. Returns whether a
    /// request was made.
    pub async fn fetch_library(&self, refresh: bool) -> Result<bool> {
        if self.is_loaded() && !refresh {
            tracing::debug!("library cache hit");
            return Ok(false);
        }

        let path = if refresh {
            "api/library?refresh=true"
        } else {
            "api/library"
        };
        let response: LibraryResponse = self.api.get(path).await?;
        tracing::info!(
            "library loaded: {} groups from {} sources",
            response.groups.len(),
            response.stats.total_sources
        );
        self.load(response);
        Ok(true)
    }

    /// Replaces the cached library with a backend response.
    pub fn load(&self, response: LibraryResponse) {
        {
            let mut state = self.write();
            state.groups = response.groups;
            state.stats = response.stats;
            state.loaded = true;
        }
        self.bump();
    }

    pub fn clear_cache(&self) {
        {
            let mut state = self.write();
            *state = StoreState::default();
        }
        self.bump();
    }

    pub fn is_loaded(&self) -> bool {
        self.read().loaded
    }

    pub fn stats(&self) -> LibraryStats {
        self.read().stats.clone()
    }

    pub fn group_count(&self) -> usize {
        self.read().groups.len()
    }

    pub fn groups(&self) -> Vec<LibraryGroup> {
        self.read().groups.clone()
    }

    pub fn group(&self, name: &str) -> Option<LibraryGroup> {
        self.read()
            .groups
            .iter()
            .find(|group| group.name == name)
            .cloned()
    }

    pub fn enrichment_candidates(&self) -> Vec<EnrichmentCandidate> {
        self.read()
            .groups
            .iter()
            .filter(|group| group.needs_enrichment())
            .map(|group| EnrichmentCandidate {
                name: group.name.clone(),
                app_id: group.app_id.clone(),
            })
            .collect()
    }

    /// Swaps in a new representative item built from a resolver hit and marks
    /// the group resolved. Readers holding the previous `best` keep it.
    pub fn apply_metadata(&self, name: &str, response: &ResolverResponse) -> bool {
        let applied = {
            let mut state = self.write();
            match state.groups.iter_mut().find(|group| group.name == name) {
                Some(group) => {
                    group.best = Arc::new(merged_item(&group.best, response));
                    group.metadata_resolved = true;
                    true
                }
                None => false,
            }
        };
        if applied {
            tracing::debug!("metadata applied for {}", name);
            self.bump();
        }
        applied
    }
}

fn merged_item(current: &LibraryItem, response: &ResolverResponse) -> LibraryItem {
    let mut item = current.clone();
    if let Some(app_id) = response.app_id.as_ref() {
        item.app_id = Some(app_id.clone());
    }
    if let Some(header) = response.header.as_ref().filter(|value| !value.is_empty()) {
        item.header_image = Some(header.clone());
    }
    if let Some(capsule) = response.capsule.as_ref().filter(|value| !value.is_empty()) {
        item.image = Some(capsule.clone());
    }
    if let Some(genres) = response.genres.as_ref() {
        item.genres = genres.clone();
    }
    if let Some(developer) = response
        .developers
        .as_ref()
        .and_then(|developers| developers.first())
    {
        item.developer = Some(developer.clone());
    }
    if let Some(category) = category_for(&item.genres) {
        item.category = Some(category);
    }
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn genres(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn store_with(groups: serde_json::Value) -> LibraryStore {
        let store = LibraryStore::new(ApiClient::new("http://127.0.0.1:9".to_string()));
        let response: LibraryResponse = serde_json::from_value(json!({
            "groups": groups,
            "total_sources": 2,
            "total_items": 3,
            "built_at": "2026-01-01T00:00:00Z"
        }))
        .expect("decode library");
        store.load(response);
        store
    }

    #[test]
    fn category_prefers_lowest_rank() {
        assert_eq!(
            category_for(&genres(&["RPG", "Action", "Indie"])).as_deref(),
            Some("Action")
        );
        assert_eq!(
            category_for(&genres(&["Indie", "Casual"])).as_deref(),
            Some("Indie")
        );
        assert_eq!(category_for(&[]), None);
    }

    #[test]
    fn category_ties_follow_table_then_list_order() {
        assert_eq!(
            category_for(&genres(&["Shooter", "Action"])).as_deref(),
            Some("Action")
        );
        assert_eq!(
            category_for(&genres(&["Roguelike", "Deckbuilder"])).as_deref(),
            Some("Roguelike")
        );
        assert_eq!(
            category_for(&genres(&["Roguelike", "Early Access"])).as_deref(),
            Some("Early Access")
        );
    }

    #[test]
    fn candidates_skip_resolved_and_complete_groups() {
        let store = store_with(json!([
            {"name": "Bare", "best": {}},
            {"name": "Complete", "best": {"genres": ["RPG"], "image": "http://img"}},
            {"name": "Resolved", "metadata_resolved": true, "best": {}},
            {"name": "NoImage", "appId": 10, "best": {"genres": ["RPG"]}}
        ]));

        let names: Vec<String> = store
            .enrichment_candidates()
            .into_iter()
            .map(|candidate| candidate.name)
            .collect();
        assert_eq!(names, vec!["Bare".to_string(), "NoImage".to_string()]);
        assert_eq!(store.stats().total_items, 3);
    }

    #[test]
    fn applying_metadata_swaps_best_and_marks_resolved() {
        let store = store_with(json!([
            {"name": "Celeste", "best": {"thumbnail": "http://thumb", "size": "1 GB"}}
        ]));
        let before = store.group("Celeste").expect("group").best;
        let response: ResolverResponse = serde_json::from_value(json!({
            "found": true,
            "appId": 504230,
            "header": "http://header",
            "capsule": "http://capsule",
            "genres": ["Indie", "Platformer", "Action"],
            "developers": ["Maddy Makes Games", "Extremely OK Games"]
        }))
        .expect("decode resolver response");

        assert!(store.apply_metadata("Celeste", &response));

        let group = store.group("Celeste").expect("group");
        assert!(group.metadata_resolved);
        assert!(!Arc::ptr_eq(&before, &group.best));
        assert!(before.genres.is_empty());
        assert_eq!(group.best.app_id.as_deref(), Some("504230"));
        assert_eq!(group.best.header_image.as_deref(), Some("http://header"));
        assert_eq!(group.best.image.as_deref(), Some("http://capsule"));
        assert_eq!(group.best.developer.as_deref(), Some("Maddy Makes Games"));
        assert_eq!(group.best.category.as_deref(), Some("Action"));
        assert_eq!(group.best.extra.get("size"), Some(&json!("1 GB")));
        assert!(store.enrichment_candidates().is_empty());
    }

    #[test]
    fn unknown_group_is_ignored() {
        let store = store_with(json!([]));
        let revision = *store.subscribe().borrow();
        assert!(!store.apply_metadata("Missing", &ResolverResponse::default()));
        assert_eq!(*store.subscribe().borrow(), revision);
    }

    #[tokio::test]
    async fn loaded_library_is_served_from_cache() {
        let store = store_with(json!([{"name": "Celeste", "best": {}}]));
        let fetched = store.fetch_library(false).await.expect("cached fetch");
        assert!(!fetched);
        assert_eq!(store.groups().len(), 1);

        store.clear_cache();
        assert!(!store.is_loaded());
        assert!(store.groups().is_empty());
    }
}
