use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;

use crate::errors::{ErrorKind, LauncherError, Result};
use crate::models::{EnrichmentCandidate, ResolverResponse};
use crate::services::{ApiClient, LibraryStore};

pub const GENTLE_CONCURRENCY: usize = 1;
pub const TURBO_CONCURRENCY: usize = 5;

const MIN_DISPATCH_GAP: Duration = Duration::from_millis(600);
const DISPATCH_JITTER_MS: u64 = 500;
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(93);

/// Looks up external metadata for a library group by name.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, game_name: &str) -> Result<ResolverResponse>;
}

#[derive(Clone)]
pub struct HttpResolver {
    api: ApiClient,
}

impl HttpResolver {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl MetadataResolver for HttpResolver {
    async fn resolve(&self, game_name: &str) -> Result<ResolverResponse> {
        let path = format!(
            "api/resolver?game_name={}",
            urlencoding::encode(game_name)
        );
        self.api.post_empty(&path).await
    }
}

/// Shared spacing of resolver call starts across all workers. Slots are
/// reserved ahead of time; `last_started` is when a call actually went out.
#[derive(Debug, Default)]
struct Pacer {
    last_dispatch: Option<Instant>,
    last_started: Option<Instant>,
}

impl Pacer {
    /// Reserves the next dispatch slot. A worker that cannot go right away
    /// gets the remaining gap plus `jitter`.
    fn reserve(&mut self, now: Instant, jitter: Duration) -> Instant {
        let slot = match self.last_dispatch {
            Some(last) if now < last + MIN_DISPATCH_GAP => last + MIN_DISPATCH_GAP + jitter,
            _ => now,
        };
        self.last_dispatch = Some(slot);
        slot
    }

    /// Records a call start at `now`, or returns how long to wait if the
    /// previous start was less than the minimum gap ago.
    fn try_start(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        if let Some(last) = self.last_started {
            let earliest = last + MIN_DISPATCH_GAP;
            if now < earliest {
                return Err(earliest - now);
            }
        }
        self.last_started = Some(now);
        self.last_dispatch = Some(self.last_dispatch.map_or(now, |slot| slot.max(now)));
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrichmentStatus {
    pub enriching: bool,
    pub cooling_down: bool,
    pub turbo: bool,
    pub concurrency: usize,
    pub workers: usize,
    pub queued: usize,
}

/// Background metadata enrichment over the library's unresolved groups.
#[derive(Clone)]
pub struct EnrichmentScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: LibraryStore,
    resolver: Arc<dyn MetadataResolver>,
    state: Mutex<SchedulerState>,
}

struct SchedulerState {
    queue: VecDeque<EnrichmentCandidate>,
    enriching: bool,
    cooling_down: bool,
    turbo: bool,
    concurrency: usize,
    workers: usize,
    pacer: Pacer,
}

impl SchedulerState {
    fn dispatch_suppressed(&self) -> bool {
        !self.enriching || self.cooling_down
    }

    fn worker_delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let millis = if self.concurrency > 1 {
            rng.gen_range(500..=1000)
        } else {
            rng.gen_range(3000..=5000)
        };
        Duration::from_millis(millis)
    }
}

impl EnrichmentScheduler {
    pub fn new(store: LibraryStore, resolver: Arc<dyn MetadataResolver>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                resolver,
                state: Mutex::new(SchedulerState {
                    queue: VecDeque::new(),
                    enriching: false,
                    cooling_down: false,
                    turbo: false,
                    concurrency: GENTLE_CONCURRENCY,
                    workers: 0,
                    pacer: Pacer::default(),
                }),
            }),
        }
    }

    /// Queues every group still missing genres or artwork and starts workers.
    /// With no explicit concurrency the turbo flag decides. Calling this while
    /// a run is in progress only updates the concurrency.
    pub fn start(&self, concurrency: Option<usize>) {
        let mut state = self.inner.lock();
        state.concurrency = concurrency.unwrap_or(if state.turbo {
            TURBO_CONCURRENCY
        } else {
            GENTLE_CONCURRENCY
        });
        state.concurrency = state.concurrency.max(1);

        if state.enriching {
            self.inner.spawn_workers(&mut state);
            return;
        }

        let candidates = self.inner.store.enrichment_candidates();
        if candidates.is_empty() {
            tracing::info!("library already fully enriched");
            return;
        }

        tracing::info!(
            "starting enrichment of {} groups with concurrency {}",
            candidates.len(),
            state.concurrency
        );
        state.queue = candidates.into();
        state.enriching = true;
        self.inner.spawn_workers(&mut state);
    }

    /// Raising spawns workers right away; lowering retires the surplus at
    /// their next loop turn.
    pub fn set_concurrency(&self, concurrency: usize) {
        let mut state = self.inner.lock();
        state.concurrency = concurrency.max(1);
        tracing::info!("enrichment concurrency set to {}", state.concurrency);
        if state.enriching {
            self.inner.spawn_workers(&mut state);
        }
    }

    pub fn set_turbo(&self, turbo: bool) {
        let mut state = self.inner.lock();
        state.turbo = turbo;
        state.concurrency = if turbo {
            TURBO_CONCURRENCY
        } else {
            GENTLE_CONCURRENCY
        };
        if state.enriching {
            self.inner.spawn_workers(&mut state);
        }
    }

    /// Flips turbo mode. An idle scheduler over a non-empty library starts a
    /// run at the new concurrency.
    pub fn toggle_turbo(&self) -> bool {
        let turbo = !self.is_turbo();
        self.set_turbo(turbo);
        tracing::info!("enrichment turbo {}", if turbo { "on" } else { "off" });
        if !self.is_enriching() && self.inner.store.group_count() > 0 {
            self.start(None);
        }
        turbo
    }

    /// Stops dispatching. Calls already in flight still complete.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        state.queue.clear();
        if state.enriching {
            state.enriching = false;
            tracing::info!("enrichment stopped");
        }
    }

    pub fn remove_from_queue(&self, name: &str) {
        self.inner
            .lock()
            .queue
            .retain(|candidate| candidate.name != name);
    }

    pub fn is_enriching(&self) -> bool {
        self.inner.lock().enriching
    }

    pub fn is_cooling_down(&self) -> bool {
        self.inner.lock().cooling_down
    }

    pub fn is_turbo(&self) -> bool {
        self.inner.lock().turbo
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn status(&self) -> EnrichmentStatus {
        let state = self.inner.lock();
        EnrichmentStatus {
            enriching: state.enriching,
            cooling_down: state.cooling_down,
            turbo: state.turbo,
            concurrency: state.concurrency,
            workers: state.workers,
            queued: state.queue.len(),
        }
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_workers(self: &Arc<Self>, state: &mut SchedulerState) {
        if state.dispatch_suppressed() {
            return;
        }
        while state.workers < state.concurrency && !state.queue.is_empty() {
            state.workers += 1;
            let inner = self.clone();
            tokio::spawn(async move { inner.run_worker().await });
        }
        self.finish_if_drained(state);
    }

    /// Clears `enriching` once nothing is queued, running or cooling down.
    fn finish_if_drained(&self, state: &mut SchedulerState) {
        if state.enriching && state.workers == 0 && state.queue.is_empty() && !state.cooling_down
        {
            state.enriching = false;
            tracing::info!("enrichment complete");
        }
    }

    fn retire(&self, state: &mut SchedulerState) {
        state.workers = state.workers.saturating_sub(1);
        self.finish_if_drained(state);
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let (candidate, slot) = {
                let mut state = self.lock();
                if state.dispatch_suppressed() || state.workers > state.concurrency {
                    self.retire(&mut state);
                    return;
                }
                let Some(candidate) = state.queue.pop_front() else {
                    self.retire(&mut state);
                    return;
                };
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..=DISPATCH_JITTER_MS));
                let slot = state.pacer.reserve(Instant::now(), jitter);
                (candidate, slot)
            };

            if slot > Instant::now() {
                tokio::time::sleep_until(slot).await;
            }

            // A late wake can land within the gap of another worker's start.
            loop {
                let wait = {
                    let mut state = self.lock();
                    if state.dispatch_suppressed() {
                        state.queue.push_front(candidate);
                        self.retire(&mut state);
                        return;
                    }
                    let started = state.pacer.try_start(Instant::now());
                    match started {
                        Ok(()) => break,
                        Err(remaining) => remaining,
                    }
                };
                tokio::time::sleep(wait).await;
            }

            match self.enrich(&candidate).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::RateLimited => {
                    let mut state = self.lock();
                    state.queue.push_front(candidate);
                    self.begin_cooldown(&mut state, &err);
                    self.retire(&mut state);
                    return;
                }
                Err(err) => {
                    tracing::debug!("resolver failed for {}: {}", candidate.name, err);
                }
            }

            let delay = self.lock().worker_delay();
            tokio::time::sleep(delay).await;
        }
    }

    /// One resolver lookup. A rate-limited answer, flagged or HTTP 429,
    /// comes back as `LauncherError::RateLimited`.
    async fn enrich(&self, candidate: &EnrichmentCandidate) -> Result<()> {
        let response = self
            .resolver
            .resolve(&candidate.name)
            .await
            .map_err(|err| match err.status() {
                Some(429) => LauncherError::RateLimited(err.to_string()),
                _ => err,
            })?;

        if response.found {
            self.store.apply_metadata(&candidate.name, &response);
        } else if response.rate_limited {
            return Err(LauncherError::RateLimited(format!(
                "lookup of {} was refused",
                candidate.name
            )));
        } else {
            tracing::debug!(
                "no metadata for {}: {}",
                candidate.name,
                response.error.as_deref().unwrap_or("not found")
            );
        }
        Ok(())
    }

    fn begin_cooldown(self: &Arc<Self>, state: &mut SchedulerState, cause: &LauncherError) {
        if state.cooling_down {
            return;
        }
        tracing::warn!(
            "{}, pausing enrichment for {}s",
            cause,
            RATE_LIMIT_COOLDOWN.as_secs()
        );
        state.cooling_down = true;
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RATE_LIMIT_COOLDOWN).await;
            let mut state = inner.lock();
            state.cooling_down = false;
            tracing::info!("enrichment cooldown finished");
            inner.spawn_workers(&mut state);
            inner.finish_if_drained(&mut state);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LauncherError;
    use crate::models::LibraryResponse;
    use serde_json::json;
    use std::collections::HashSet;

    #[derive(Default)]
    struct ScriptedResolver {
        calls: Mutex<Vec<(String, Instant)>>,
        rate_limited_once: Mutex<HashSet<String>>,
        throttled_once: Mutex<HashSet<String>>,
        failing: HashSet<String>,
    }

    impl ScriptedResolver {
        fn rate_limit_first(names: &[&str]) -> Self {
            Self {
                rate_limited_once: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl MetadataResolver for ScriptedResolver {
        async fn resolve(&self, game_name: &str) -> Result<ResolverResponse> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((game_name.to_string(), Instant::now()));
            if self.failing.contains(game_name) {
                return Err(LauncherError::Http {
                    status: 502,
                    message: "Bad Gateway".to_string(),
                });
            }
            if self
                .throttled_once
                .lock()
                .expect("throttle lock")
                .remove(game_name)
            {
                return Err(LauncherError::Http {
                    status: 429,
                    message: "Too Many Requests".to_string(),
                });
            }
            if self
                .rate_limited_once
                .lock()
                .expect("rate limit lock")
                .remove(game_name)
            {
                return Ok(ResolverResponse {
                    rate_limited: true,
                    ..ResolverResponse::default()
                });
            }
            Ok(ResolverResponse {
                found: true,
                header: Some(format!("http://img/{game_name}")),
                genres: Some(vec!["RPG".to_string(), "Action".to_string()]),
                ..ResolverResponse::default()
            })
        }
    }

    fn library(names: &[&str]) -> LibraryStore {
        let store = LibraryStore::new(ApiClient::new("http://127.0.0.1:9".to_string()));
        let groups: Vec<serde_json::Value> = names
            .iter()
            .map(|name| json!({"name": name, "best": {}}))
            .collect();
        let response: LibraryResponse =
            serde_json::from_value(json!({ "groups": groups })).expect("decode library");
        store.load(response);
        store
    }

    async fn wait_until_idle(scheduler: &EnrichmentScheduler) {
        while scheduler.is_enriching() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_reservations() {
        let mut pacer = Pacer::default();
        let start = Instant::now();
        let jitter = Duration::from_millis(200);

        assert_eq!(pacer.reserve(start, jitter), start);
        let second = pacer.reserve(start, jitter);
        assert_eq!(second, start + Duration::from_millis(800));
        let third = pacer.reserve(start + Duration::from_millis(100), Duration::ZERO);
        assert_eq!(third, second + MIN_DISPATCH_GAP);
        let later = start + Duration::from_secs(10);
        assert_eq!(pacer.reserve(later, jitter), later);
    }

    #[tokio::test(start_paused = true)]
    async fn late_start_waits_out_the_gap() {
        let mut pacer = Pacer::default();
        let start = Instant::now();

        assert_eq!(pacer.reserve(start, Duration::ZERO), start);
        let slot = pacer.reserve(start, Duration::ZERO);
        assert_eq!(slot, start + MIN_DISPATCH_GAP);

        // The first worker only gets going after its reserved slot.
        assert_eq!(pacer.try_start(start + Duration::from_millis(300)), Ok(()));
        assert_eq!(pacer.try_start(slot), Err(Duration::from_millis(300)));
        assert_eq!(
            pacer.try_start(start + Duration::from_millis(900)),
            Ok(())
        );
        assert_eq!(
            pacer.reserve(start + Duration::from_millis(900), Duration::ZERO),
            start + Duration::from_millis(1500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn turbo_workers_keep_minimum_gap() {
        let names: Vec<String> = (0..12).map(|i| format!("Game {i}")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let store = library(&name_refs);
        let resolver = Arc::new(ScriptedResolver::default());
        let scheduler = EnrichmentScheduler::new(store.clone(), resolver.clone());

        scheduler.start(Some(TURBO_CONCURRENCY));
        assert!(scheduler.is_enriching());
        wait_until_idle(&scheduler).await;

        let calls = resolver.calls();
        assert_eq!(calls.len(), 12);
        for pair in calls.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= MIN_DISPATCH_GAP);
        }
        assert!(store.enrichment_candidates().is_empty());
        assert_eq!(
            store.group("Game 3").and_then(|g| g.best.category.clone()),
            Some("Action".to_string())
        );
        assert_eq!(scheduler.status().workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_pauses_then_retries_same_candidate() {
        let store = library(&["Alpha", "Beta"]);
        let resolver = Arc::new(ScriptedResolver::rate_limit_first(&["Alpha"]));
        let scheduler = EnrichmentScheduler::new(store.clone(), resolver.clone());

        scheduler.start(None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.is_cooling_down());
        assert!(scheduler.is_enriching());
        assert_eq!(scheduler.queue_len(), 2);

        wait_until_idle(&scheduler).await;

        let calls = resolver.calls();
        let names: Vec<&str> = calls.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Alpha", "Beta"]);
        assert!(calls[1].1.duration_since(calls[0].1) >= RATE_LIMIT_COOLDOWN);
        assert!(!scheduler.is_cooling_down());
        assert!(store.group("Alpha").map(|g| g.metadata_resolved).unwrap_or(false));
    }

    #[tokio::test(start_paused = true)]
    async fn http_429_from_resolver_starts_cooldown() {
        let store = library(&["Alpha"]);
        let resolver = Arc::new(ScriptedResolver {
            throttled_once: Mutex::new(["Alpha".to_string()].into_iter().collect()),
            ..ScriptedResolver::default()
        });
        let scheduler = EnrichmentScheduler::new(store.clone(), resolver.clone());

        scheduler.start(None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.is_cooling_down());
        assert_eq!(scheduler.queue_len(), 1);

        wait_until_idle(&scheduler).await;
        assert_eq!(resolver.calls().len(), 2);
        assert!(store.enrichment_candidates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resolver_failures_are_skipped() {
        let store = library(&["Broken", "Fine"]);
        let resolver = Arc::new(ScriptedResolver {
            failing: ["Broken".to_string()].into_iter().collect(),
            ..ScriptedResolver::default()
        });
        let scheduler = EnrichmentScheduler::new(store.clone(), resolver.clone());

        scheduler.start(None);
        wait_until_idle(&scheduler).await;

        assert_eq!(resolver.calls().len(), 2);
        let remaining: Vec<String> = store
            .enrichment_candidates()
            .into_iter()
            .map(|candidate| candidate.name)
            .collect();
        assert_eq!(remaining, vec!["Broken".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn lowering_concurrency_retires_workers() {
        let names: Vec<String> = (0..40).map(|i| format!("Game {i}")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let resolver = Arc::new(ScriptedResolver::default());
        let scheduler = EnrichmentScheduler::new(library(&name_refs), resolver);

        scheduler.start(Some(TURBO_CONCURRENCY));
        assert_eq!(scheduler.status().workers, TURBO_CONCURRENCY);

        scheduler.set_concurrency(1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let status = scheduler.status();
        assert!(status.enriching);
        assert_eq!(status.workers, 1);
        assert_eq!(status.concurrency, 1);

        scheduler.set_concurrency(3);
        assert_eq!(scheduler.status().workers, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn turbo_toggle_switches_concurrency() {
        let scheduler = EnrichmentScheduler::new(
            library(&[]),
            Arc::new(ScriptedResolver::default()),
        );
        assert!(scheduler.toggle_turbo());
        assert_eq!(scheduler.status().concurrency, TURBO_CONCURRENCY);
        assert!(!scheduler.toggle_turbo());
        assert_eq!(scheduler.status().concurrency, GENTLE_CONCURRENCY);

        scheduler.start(None);
        assert!(!scheduler.is_enriching());
    }

    #[tokio::test(start_paused = true)]
    async fn turbo_toggle_starts_an_idle_run() {
        let store = library(&["Solo"]);
        let resolver = Arc::new(ScriptedResolver::default());
        let scheduler = EnrichmentScheduler::new(store.clone(), resolver.clone());

        assert!(scheduler.toggle_turbo());
        let status = scheduler.status();
        assert!(status.enriching);
        assert_eq!(status.concurrency, TURBO_CONCURRENCY);

        wait_until_idle(&scheduler).await;
        assert_eq!(resolver.calls().len(), 1);
        assert!(store.enrichment_candidates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_drain_makes_no_new_calls() {
        let resolver = Arc::new(ScriptedResolver::default());
        let scheduler = EnrichmentScheduler::new(library(&["Solo"]), resolver.clone());

        scheduler.start(None);
        wait_until_idle(&scheduler).await;
        assert_eq!(resolver.calls().len(), 1);

        scheduler.start(None);
        assert!(!scheduler.is_enriching());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(resolver.calls().len(), 1);
        assert_eq!(scheduler.status().workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_remove_prevent_dispatch() {
        let resolver = Arc::new(ScriptedResolver::default());
        let scheduler =
            EnrichmentScheduler::new(library(&["One", "Two", "Three"]), resolver.clone());

        scheduler.start(None);
        scheduler.remove_from_queue("Two");
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.stop();
        assert!(!scheduler.is_enriching());
        assert_eq!(scheduler.queue_len(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let names: Vec<String> = resolver.calls().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["One".to_string()]);
        assert_eq!(scheduler.status().workers, 0);
    }
}
