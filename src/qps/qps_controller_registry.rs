use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use dashmap::DashMap;

use crate::{
    CandidateKeys, ConfigChange, ConfigTarget, FlowDirection, QpsConfig, QpsController,
    QpsPropertyNames, QualifiedKey, TimeSource, WindowSizeMs, parse_limit,
};

/// Owner of every [`QpsController`] for one [`FlowDirection`].
///
/// # Keying
///
/// Controllers are stored by the canonical form of their *governing* key: the
/// most specific candidate of a call that has an explicitly configured limit,
/// or the global key when none does. All operations of a schema limited at
/// schema level therefore share one controller.
///
/// # Thread Safety
///
/// - Lookups are sharded reads on a [`DashMap`]
/// - Creation goes through the entry API, which holds only the key's shard, so
///   at most one controller is ever installed per key
/// - Configuration changes update limits of existing controllers in place.
///   Writers (`apply`, `load`, `on_configuration_changed`) are serialized by a
///   mutex that admission never takes
/// - [`load`](Self::load) stages the new snapshot first and installs it key by
///   key without ever passing through an empty snapshot
///
/// Controllers live until [`reset_all`](Self::reset_all) is called.
pub struct QpsControllerRegistry {
    direction: FlowDirection,
    window_size_ms: WindowSizeMs,
    time_source: Arc<dyn TimeSource>,
    property_names: QpsPropertyNames,
    config: QpsConfig,
    controllers: DashMap<String, Arc<QpsController>>,
    config_writer: Mutex<()>,
}

/// A single interpreted property.
enum ConfigUpdate {
    Enabled(bool),
    Limit(String, Option<i64>),
}

impl QpsControllerRegistry {
    /// Create an empty registry with no configured limits.
    pub fn new(
        direction: FlowDirection,
        config_prefix: &str,
        window_size_ms: WindowSizeMs,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            direction,
            window_size_ms,
            time_source,
            property_names: QpsPropertyNames::new(config_prefix, direction),
            config: QpsConfig::default(),
            controllers: DashMap::new(),
            config_writer: Mutex::new(()),
        }
    } // end constructor

    /// Direction this registry serves.
    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    /// Property names recognised by this registry.
    pub fn property_names(&self) -> &QpsPropertyNames {
        &self.property_names
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> &QpsConfig {
        &self.config
    }

    /// Whether flow control is enabled for this direction.
    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Return the controller for exactly `key`, creating it on first use.
    ///
    /// A new controller is seeded with the limit configured for `key`, falling
    /// back through its less specific keys to the global limit, else unlimited.
    pub fn get_or_create(&self, key: &QualifiedKey) -> Arc<QpsController> {
        if let Some(controller) = self.controllers.get(key.as_str()) {
            return controller.clone();
        }

        self.controllers
            .entry(key.as_str().to_string())
            .or_insert_with(|| {
                let limit = self.config.effective_limit(key);
                tracing::debug!(
                    direction = %self.direction,
                    key = %key,
                    limit,
                    "qps.controller.create"
                );

                Arc::new(QpsController::new(
                    key.clone(),
                    limit,
                    self.window_size_ms,
                    self.time_source.clone(),
                ))
            })
            .clone()
    } // end method get_or_create

    /// The candidate that governs a call: the first with a configured limit,
    /// else the global key.
    pub fn governing_key<'a>(&self, candidates: &'a CandidateKeys) -> &'a QualifiedKey {
        candidates
            .iter()
            .find(|key| self.config.explicit_limit(key.as_str()).is_some())
            .unwrap_or_else(|| candidates.global())
    }

    /// Controller for the governing key of `candidates`.
    pub fn resolve(&self, candidates: &CandidateKeys) -> Arc<QpsController> {
        self.get_or_create(self.governing_key(candidates))
    }

    /// Existing controller for the canonical `key`, without creating one.
    pub fn get(&self, key: &str) -> Option<Arc<QpsController>> {
        self.controllers.get(key).map(|controller| controller.clone())
    }

    /// Record a new limit for the canonical `key` (`None` removes it).
    ///
    /// Existing controllers whose effective limit changes are updated in place
    /// and keep their in-window counts. If no controller exists yet the value
    /// only lands in the snapshot, to seed future creations.
    pub fn on_configuration_changed(&self, key: &str, new_limit: Option<i64>) {
        let _writer = self.lock_writer();
        self.set_limit(key, new_limit);
        self.refresh_limits();
    }

    /// Apply a change event.
    ///
    /// Returns `false` if the property does not belong to this registry.
    /// Invalid values are logged and treated as removal, so a bad value never
    /// fails calls; it only lifts the limit for that key.
    pub fn apply(&self, change: &ConfigChange) -> bool {
        let Some(target) = self.property_names.parse(&change.property) else {
            return false;
        };

        let _writer = self.lock_writer();
        match Self::interpret(target, change) {
            ConfigUpdate::Enabled(enabled) => self.config.set_enabled(enabled),
            ConfigUpdate::Limit(key, limit) => self.set_limit(&key, limit),
        }
        self.refresh_limits();

        true
    }

    /// Replace the configuration wholesale with `properties`.
    ///
    /// Properties that do not belong to this registry are ignored. The new
    /// snapshot is built aside, then installed: new and changed limits first,
    /// stale limits removed last, the enabled flag at the end. Limits of
    /// existing controllers are recomputed against the new snapshot.
    pub fn load<'a, I>(&self, properties: I)
    where
        I: IntoIterator<Item = &'a ConfigChange>,
    {
        let mut enabled = true;
        let mut limits = HashMap::new();

        for change in properties {
            let Some(target) = self.property_names.parse(&change.property) else {
                continue;
            };

            match Self::interpret(target, change) {
                ConfigUpdate::Enabled(value) => enabled = value,
                ConfigUpdate::Limit(key, Some(limit)) => {
                    limits.insert(key, limit);
                }
                ConfigUpdate::Limit(key, None) => {
                    limits.remove(&key);
                }
            }
        }

        let _writer = self.lock_writer();
        self.config.replace(limits, enabled);

        tracing::info!(
            direction = %self.direction,
            limits = self.config.len(),
            enabled = self.config.is_enabled(),
            "qps.config.loaded"
        );

        self.refresh_limits();
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.config_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_limit(&self, key: &str, new_limit: Option<i64>) {
        let previous = self.config.set_limit(key, new_limit);

        if previous != new_limit {
            tracing::info!(
                direction = %self.direction,
                key,
                previous = ?previous,
                limit = ?new_limit,
                "qps.limit.changed"
            );
        }
    }

    fn interpret(target: ConfigTarget, change: &ConfigChange) -> ConfigUpdate {
        match target {
            ConfigTarget::Enabled => {
                let enabled = match change.value.as_deref().map(str::trim) {
                    None => true,
                    Some(value) => value.parse::<bool>().unwrap_or_else(|_| {
                        tracing::warn!(
                            property = %change.property,
                            value,
                            "qps.config.invalid, expected a boolean; keeping flow control enabled"
                        );
                        true
                    }),
                };

                ConfigUpdate::Enabled(enabled)
            }
            ConfigTarget::Limit(key) => {
                let limit = match change.value.as_deref() {
                    None => None,
                    Some(value) => match parse_limit(&change.property, value) {
                        Ok(limit) => Some(limit),
                        Err(err) => {
                            tracing::warn!(error = %err, "qps.config.invalid, limit ignored");
                            None
                        }
                    },
                };

                ConfigUpdate::Limit(key, limit)
            }
        }
    }

    // Callers hold the writer lock, so no other refresh interleaves.
    fn refresh_limits(&self) {
        for entry in self.controllers.iter() {
            let controller = entry.value();
            let limit = self.config.effective_limit(controller.key());

            if controller.limit() != limit {
                controller.set_limit(limit);
            }
        }
    }

    /// Canonical keys of every installed controller.
    pub fn keys(&self) -> Vec<String> {
        self.controllers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of installed controllers.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether no controller has been created yet.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Drop every controller. The configuration snapshot is kept.
    ///
    /// Intended for test isolation; callers holding an `Arc` to a dropped
    /// controller keep a detached instance.
    pub fn reset_all(&self) {
        self.controllers.clear();
    }
} // end of impl

impl std::fmt::Debug for QpsControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QpsControllerRegistry")
            .field("direction", &self.direction)
            .field("window_size_ms", &*self.window_size_ms)
            .field("controllers", &self.controllers.len())
            .finish()
    }
}
