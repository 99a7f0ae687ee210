//! Generation-tracked status reporting.
//!
//! A translator produces config for a set of proxies in numbered passes called
//! generations. Each pass gets queued with the [Reconciler] along with the
//! [StatusPlugin]s that should see its results. Translation reports arrive
//! later, possibly from another thread, and the reconciler hands each one to
//! the plugins registered for the generation it came from, unless the proxy has
//! been queued for a newer generation in the meantime.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use gantry_api::{ProxyKey, ProxyWithReports, DEFAULT_CONTROLLER_NAME};

/// The error type returned by a [StatusPlugin].
pub type PluginError = Box<dyn std::error::Error + Send + Sync>;

/// The reports for one generation, handed to every [StatusPlugin] registered
/// for that generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusContext {
    pub generation: u64,
    pub proxies_with_reports: Vec<ProxyWithReports>,
}

/// Something that writes translation results somewhere visible, usually the
/// status of a Kubernetes object.
///
/// Every hook is called with the reconciler's lock held and should return
/// quickly.
pub trait StatusPlugin: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called for every plugin in a registry before any plugin's
    /// [apply_status_plugin][StatusPlugin::apply_status_plugin].
    fn init_status_plugin(&self, _ctx: &StatusContext) -> Result<(), PluginError> {
        Ok(())
    }

    fn apply_status_plugin(&self, ctx: &StatusContext) -> Result<(), PluginError>;
}

/// An ordered set of [StatusPlugin]s.
///
/// Registries are cheap to clone and are shared between every generation
/// they're queued with.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn StatusPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, plugin: impl StatusPlugin + 'static) -> Self {
        self.register(Arc::new(plugin));
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn StatusPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn plugins(&self) -> impl Iterator<Item = &dyn StatusPlugin> {
        self.plugins.iter().map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fn run(&self, ctx: &StatusContext) {
        for plugin in self.plugins() {
            if let Err(e) = plugin.init_status_plugin(ctx) {
                tracing::error!(
                    plugin = plugin.name(),
                    generation = ctx.generation,
                    err = %e,
                    "failed to initialize status plugin",
                );
            }
        }

        for plugin in self.plugins() {
            if let Err(e) = plugin.apply_status_plugin(ctx) {
                tracing::error!(
                    plugin = plugin.name(),
                    generation = ctx.generation,
                    err = %e,
                    "failed to apply status plugin",
                );
            }
        }
    }
}

macro_rules! no_poison {
    ($guard:expr) => {
        $guard.expect("Reconciler was poisoned: this is a bug in Gantry")
    };
}

/// Tracks the generation every proxy was last queued for and routes reports
/// to the plugins for their generation.
///
/// A proxy is queued for a generation with
/// [queue_for_generation][Reconciler::queue_for_generation] and stays queued
/// until a report for that generation or any newer one is handled. Reports for
/// older generations are stale and get dropped. Once every proxy queued for a
/// generation has been reported, the generation and its plugins are
/// forgotten.
///
/// Both operations take a single lock over all of the reconciler's state, so
/// a `Reconciler` can be shared freely between threads.
#[derive(Debug)]
pub struct Reconciler {
    controller: String,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    registered_generation: HashMap<ProxyKey, u64>,
    plugins_by_generation: BTreeMap<u64, PluginRegistry>,
    pending_by_generation: BTreeMap<u64, BTreeSet<ProxyKey>>,
}

impl State {
    /// Remove a key from a generation's pending set. Returns `true` if that
    /// leaves the generation with nothing pending.
    fn remove_pending(&mut self, generation: u64, key: &ProxyKey) -> bool {
        let Some(pending) = self.pending_by_generation.get_mut(&generation) else {
            return false;
        };

        pending.remove(key);
        if pending.is_empty() {
            self.pending_by_generation.remove(&generation);
            return true;
        }
        false
    }

    fn evict(&mut self, generation: u64) {
        tracing::trace!(generation, "evicting generation");
        self.pending_by_generation.remove(&generation);
        self.plugins_by_generation.remove(&generation);
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    /// Create a reconciler that handles reports for proxies created by the
    /// default controller.
    pub fn new() -> Self {
        Self::for_controller(DEFAULT_CONTROLLER_NAME)
    }

    /// Create a reconciler that only handles reports for proxies created by
    /// `controller`.
    pub fn for_controller(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Queue proxies for a generation, replacing whatever generation they were
    /// queued for before.
    ///
    /// Reports for these proxies from any older generation will be dropped.
    /// `registry` replaces any registry already queued for this generation.
    ///
    /// Queuing an empty set of proxies does nothing at all, not even
    /// recording `registry`. No report could ever complete that generation,
    /// so its registry would never be released.
    pub fn queue_for_generation(
        &self,
        keys: impl IntoIterator<Item = ProxyKey>,
        registry: PluginRegistry,
        generation: u64,
    ) {
        let keys: Vec<_> = keys.into_iter().collect();
        if keys.is_empty() {
            tracing::trace!(generation, "no proxies to queue");
            return;
        }

        let mut state = no_poison!(self.state.lock());

        for key in &keys {
            let Some(previous) = state.registered_generation.insert(key.clone(), generation)
            else {
                continue;
            };

            if previous > generation {
                // a report for the newer generation is still accepted and
                // still needs that generation's plugins, so leave it alone.
                tracing::debug!(
                    proxy = %key,
                    previous,
                    generation,
                    "proxy queued for an older generation",
                );
                continue;
            }

            // the key is never going to be reported for the older generation
            // it was queued for before, so stop waiting on it.
            if previous < generation && state.remove_pending(previous, key) {
                state.evict(previous);
            }
        }

        tracing::debug!(
            generation,
            proxies = keys.len(),
            plugins = registry.len(),
            "queued proxies",
        );

        state
            .pending_by_generation
            .entry(generation)
            .or_default()
            .extend(keys);
        state.plugins_by_generation.insert(generation, registry);
    }

    /// Handle a batch of translation reports.
    ///
    /// Reports for proxies from another controller are ignored. Reports
    /// older than the generation their proxy is currently queued for are
    /// dropped. Everything else is grouped by generation and passed to the
    /// plugins registered for that generation, in registration order. Plugin
    /// errors are logged and never stop other plugins from running.
    pub fn handle_reports(&self, reports: impl IntoIterator<Item = ProxyWithReports>) {
        let mut state = no_poison!(self.state.lock());

        let mut batches: BTreeMap<u64, Vec<ProxyWithReports>> = BTreeMap::new();
        let mut completed = BTreeSet::new();

        for report in reports {
            if report.proxy.created_by() != Some(self.controller.as_str()) {
                continue;
            }

            let key = report.key();
            let generation = report.generation();

            let registered = state.registered_generation.get(&key).copied();
            if let Some(registered) = registered {
                if registered > generation {
                    tracing::trace!(
                        proxy = %key,
                        generation,
                        registered,
                        "dropping stale report",
                    );
                    continue;
                }

                if registered != generation && state.remove_pending(registered, &key) {
                    completed.insert(registered);
                }
            }

            if state.remove_pending(generation, &key) {
                completed.insert(generation);
            }
            state.registered_generation.remove(&key);
            batches.entry(generation).or_default().push(report);
        }

        // grab registries before evicting anything. a batch can complete the
        // generation it's reporting on.
        let batches: Vec<_> = batches
            .into_iter()
            .map(|(generation, batch)| {
                let registry = state.plugins_by_generation.get(&generation).cloned();
                (generation, batch, registry)
            })
            .collect();

        for generation in completed {
            state.evict(generation);
        }

        for (generation, batch, registry) in batches {
            let Some(registry) = registry else {
                tracing::debug!(
                    generation,
                    reports = batch.len(),
                    "no plugins registered for generation",
                );
                continue;
            };

            tracing::debug!(
                generation,
                reports = batch.len(),
                plugins = registry.len(),
                "applying status plugins",
            );
            let ctx = StatusContext {
                generation,
                proxies_with_reports: batch,
            };
            registry.run(&ctx);
        }
    }
}
