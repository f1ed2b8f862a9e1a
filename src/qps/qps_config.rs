use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;

use crate::{FlowControlError, FlowDirection, GLOBAL_KEY, QualifiedKey};

/// Default root segment of every configuration property name.
pub const DEFAULT_CONFIG_PREFIX: &str = "flowcontrol";

/// A change event from the dynamic configuration source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    /// Full property name.
    pub property: String,
    /// New raw value, or `None` when the property was removed.
    pub value: Option<String>,
}

impl ConfigChange {
    /// `property` was set to `value`.
    pub fn set(property: impl Into<String>, value: impl ToString) -> Self {
        Self {
            property: property.into(),
            value: Some(value.to_string()),
        }
    }

    /// `property` was removed.
    pub fn removed(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            value: None,
        }
    }
}

/// What a recognised property controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigTarget {
    /// `<prefix>.<direction>.qps.enabled`
    Enabled,
    /// A limit, with the canonical key it applies to.
    ///
    /// `<prefix>.<direction>.qps.global.limit` maps to [`GLOBAL_KEY`],
    /// `<prefix>.<direction>.qps.limit.<key>` maps to `<key>`.
    Limit(String),
}

/// Property names used by one direction.
#[derive(Debug, Clone)]
pub struct QpsPropertyNames {
    enabled: String,
    global_limit: String,
    limit_prefix: String,
}

impl QpsPropertyNames {
    /// Names under `<config_prefix>.<direction>.qps`.
    pub fn new(config_prefix: &str, direction: FlowDirection) -> Self {
        let base = format!("{config_prefix}.{direction}.qps");

        Self {
            enabled: format!("{base}.enabled"),
            global_limit: format!("{base}.global.limit"),
            limit_prefix: format!("{base}.limit."),
        }
    }

    /// Property toggling flow control for the direction.
    pub fn enabled(&self) -> &str {
        &self.enabled
    }

    /// Property holding the global limit.
    pub fn global_limit(&self) -> &str {
        &self.global_limit
    }

    /// Property holding the limit for `key`.
    pub fn limit_for(&self, key: &QualifiedKey) -> String {
        if key.as_str() == GLOBAL_KEY {
            return self.global_limit.clone();
        }

        format!("{}{}", self.limit_prefix, key)
    }

    /// Classify `property`, or `None` if it does not belong to this direction.
    pub fn parse(&self, property: &str) -> Option<ConfigTarget> {
        let property = property.trim();

        if property == self.enabled {
            return Some(ConfigTarget::Enabled);
        }

        if property == self.global_limit {
            return Some(ConfigTarget::Limit(GLOBAL_KEY.to_string()));
        }

        property
            .strip_prefix(&self.limit_prefix)
            .filter(|key| !key.is_empty())
            .map(|key| ConfigTarget::Limit(key.to_string()))
    }
}

/// Parse a raw limit value.
pub fn parse_limit(property: &str, value: &str) -> Result<i64, FlowControlError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| FlowControlError::InvalidLimit {
            property: property.to_string(),
            value: value.to_string(),
        })
}

/// Most recently observed configuration for one direction.
///
/// Only explicitly configured keys are stored; absence means "not configured",
/// which resolves to the next less specific key and finally to unlimited.
#[derive(Debug)]
pub struct QpsConfig {
    enabled: AtomicBool,
    limits: DashMap<String, i64>,
}

impl Default for QpsConfig {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            limits: DashMap::new(),
        }
    }
}

impl QpsConfig {
    /// Whether flow control is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Limit configured for exactly `key`, if any.
    pub fn explicit_limit(&self, key: &str) -> Option<i64> {
        self.limits.get(key).map(|limit| *limit)
    }

    /// Limit that applies to `key`: its own, else the nearest configured
    /// ancestor's, else the global limit, else `0` (unlimited).
    pub fn effective_limit(&self, key: &QualifiedKey) -> i64 {
        key.fallback_chain()
            .iter()
            .find_map(|candidate| self.explicit_limit(candidate.as_str()))
            .unwrap_or(0)
    }

    pub(crate) fn set_limit(&self, key: &str, limit: Option<i64>) -> Option<i64> {
        match limit {
            Some(limit) => self.limits.insert(key.to_string(), limit),
            None => self.limits.remove(key).map(|(_, limit)| limit),
        }
    }

    /// Install `limits` and `enabled` as the whole snapshot.
    ///
    /// Keys present in both snapshots are never absent in between: new and
    /// changed limits are written before stale ones are removed.
    pub(crate) fn replace(&self, limits: HashMap<String, i64>, enabled: bool) {
        for (key, limit) in &limits {
            if self.explicit_limit(key) != Some(*limit) {
                self.limits.insert(key.clone(), *limit);
            }
        }

        self.limits.retain(|key, _| limits.contains_key(key));
        self.set_enabled(enabled);
    }

    /// Number of explicitly configured limits.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Whether no limit is configured.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}
