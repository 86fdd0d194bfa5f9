//! Engine Lifecycle - Create, Upgrade, Reset
//!
//! Owns the single engine of the process and the record of which optional
//! bundles and custom fonts it was built with.
//!
//! ```text
//! ABSENT --acquire--> CORE_LOADED --ensure_*--> EXPANDED --ensure_*--> EXPANDED
//!    ^                                              |
//!    +---------------- idle timeout / reset --------+
//! ```
//!
//! Engines are immutable, so every upgrade is a full rebuild from the union of
//! the core bundle, all loaded optional bundles and all loaded custom fonts.
//! Within a generation that union only grows.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::{bytes_to_embedded_locator, Locator};
use crate::detect::{AssetId, BundleId};
use crate::engine::{Engine, EngineBuilder, EngineError};
use crate::hashing::{fingerprint_locators, short};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static ENGINE_BUILD_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_engine_build_count() -> u32 {
    ENGINE_BUILD_COUNT.load(Ordering::SeqCst)
}

/// Source of the current time, injectable so idle expiry can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fixed inputs of the lifecycle: which fonts exist and when to give up on
/// an idle engine.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub idle_timeout: Duration,
    pub core_bundle: Vec<Locator>,
    pub optional_bundles: BTreeMap<BundleId, Vec<Locator>>,
}

type PendingEngine = Shared<BoxFuture<'static, Result<Arc<dyn Engine>, EngineError>>>;

pub struct EngineLifecycle {
    builder: Arc<dyn EngineBuilder>,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
    /// The construction in flight or completed for the current generation.
    current: Option<PendingEngine>,
    generation: Option<Uuid>,
    loaded_bundles: BTreeSet<BundleId>,
    /// Embedded locators of loaded custom fonts, kept for later rebuilds.
    custom_assets: BTreeMap<AssetId, Locator>,
    last_activity: DateTime<Utc>,
    builds: u64,
}

impl EngineLifecycle {
    pub fn new(
        builder: Arc<dyn EngineBuilder>,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        let last_activity = clock.now();
        Self {
            builder,
            clock,
            settings,
            current: None,
            generation: None,
            loaded_bundles: BTreeSet::new(),
            custom_assets: BTreeMap::new(),
            last_activity,
            builds: 0,
        }
    }

    /// Record job activity. An engine idle for longer than the timeout is
    /// torn down before the new stamp is taken, so this job starts from the
    /// core bundle.
    pub fn touch(&mut self) {
        let now = self.clock.now();
        self.expire_if_idle(now);
        self.last_activity = now;
    }

    /// The current engine, building one if there is none.
    pub async fn acquire(&mut self) -> Result<Arc<dyn Engine>, EngineError> {
        self.expire_if_idle(self.clock.now());

        let pending = match &self.current {
            Some(pending) => pending.clone(),
            None => {
                info!(generation = ?self.generation, "initializing new engine instance");
                self.start_build(self.current_assets())
            }
        };
        self.await_build(pending).await
    }

    /// Make sure every bundle in `bundles` is loaded. Returns whether a
    /// rebuild happened.
    pub async fn ensure_bundles(&mut self, bundles: &[BundleId]) -> Result<bool, EngineError> {
        let requested: BTreeSet<BundleId> = bundles
            .iter()
            .copied()
            .filter(|bundle| !self.loaded_bundles.contains(bundle))
            .collect();
        if requested.is_empty() {
            return Ok(false);
        }

        info!(bundles = ?requested, "upgrading engine with optional bundles");
        let mut assets = self.current_assets();
        for bundle in &requested {
            assets.extend(self.bundle_locators(*bundle).iter().cloned());
        }

        let pending = self.start_build(assets);
        self.await_build(pending).await?;
        self.loaded_bundles.extend(requested);
        Ok(true)
    }

    /// Make sure every `(id, bytes)` font is embedded in the engine. Returns
    /// whether a rebuild happened.
    pub async fn ensure_custom_assets(
        &mut self,
        assets: &[(&str, &[u8])],
    ) -> Result<bool, EngineError> {
        let new: BTreeMap<AssetId, Locator> = assets
            .iter()
            .filter(|(id, _)| !self.custom_assets.contains_key(*id))
            .map(|(id, bytes)| (id.to_string(), bytes_to_embedded_locator(bytes, id)))
            .collect();
        if new.is_empty() {
            return Ok(false);
        }

        info!(fonts = ?new.keys().collect::<Vec<_>>(), "reinitializing engine with custom fonts");
        let mut locators = self.current_assets();
        locators.extend(new.values().cloned());

        let pending = self.start_build(locators);
        self.await_build(pending).await?;
        self.custom_assets.extend(new);
        Ok(true)
    }

    /// Unconditional teardown, for memory reclamation.
    pub fn reset(&mut self) {
        info!(generation = ?self.generation, "manual engine reset");
        self.teardown();
    }

    pub fn has_engine(&self) -> bool {
        self.current.is_some()
    }

    pub fn generation(&self) -> Option<Uuid> {
        self.generation
    }

    pub fn loaded_bundles(&self) -> &BTreeSet<BundleId> {
        &self.loaded_bundles
    }

    pub fn is_custom_loaded(&self, id: &str) -> bool {
        self.custom_assets.contains_key(id)
    }

    pub fn loaded_custom_assets(&self) -> impl Iterator<Item = &AssetId> {
        self.custom_assets.keys()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Constructions started since this lifecycle was created.
    pub fn build_count(&self) -> u64 {
        self.builds
    }

    /// Core bundle, then loaded optional bundles, then loaded custom fonts.
    pub fn current_assets(&self) -> Vec<Locator> {
        let mut assets = self.settings.core_bundle.clone();
        for bundle in &self.loaded_bundles {
            assets.extend(self.bundle_locators(*bundle).iter().cloned());
        }
        assets.extend(self.custom_assets.values().cloned());
        assets
    }

    fn bundle_locators(&self, bundle: BundleId) -> &[Locator] {
        self.settings
            .optional_bundles
            .get(&bundle)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn expire_if_idle(&mut self, now: DateTime<Utc>) {
        if self.generation.is_some() && now - self.last_activity > self.settings.idle_timeout {
            info!(
                generation = ?self.generation,
                idle_secs = (now - self.last_activity).num_seconds(),
                "resetting engine after idle timeout"
            );
            self.teardown();
        }
    }

    fn teardown(&mut self) {
        self.current = None;
        self.generation = None;
        self.loaded_bundles.clear();
        self.custom_assets.clear();
    }

    /// Start a construction and memoize it as the current engine, so anything
    /// asking for the engine meanwhile awaits this same build.
    fn start_build(&mut self, assets: Vec<Locator>) -> PendingEngine {
        let generation = *self.generation.get_or_insert_with(Uuid::new_v4);
        let fingerprint = fingerprint_locators(&assets);
        self.builds += 1;

        #[cfg(feature = "test-hooks")]
        ENGINE_BUILD_COUNT.fetch_add(1, Ordering::SeqCst);

        debug!(
            %generation,
            fingerprint = short(&fingerprint),
            asset_count = assets.len(),
            "building engine"
        );

        let builder = Arc::clone(&self.builder);
        let pending = async move { builder.build(assets).await }.boxed().shared();
        self.current = Some(pending.clone());
        pending
    }

    async fn await_build(&mut self, pending: PendingEngine) -> Result<Arc<dyn Engine>, EngineError> {
        match pending.clone().await {
            Ok(engine) => Ok(engine),
            Err(err) => {
                // Forget the failed construction so the next acquire retries.
                if self.current.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
                    self.current = None;
                }
                warn!(error = %err, "engine construction failed");
                Err(err)
            }
        }
    }
}
