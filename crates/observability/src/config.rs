//! Process logging configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::decode::RawOptions;
use crate::hooks::{BoxedLayer, HookError, HookRegistry};

#[derive(Debug, Error)]
pub enum LogConfigError {
    #[error("unknown log hook: {0}")]
    UnknownHook(String),

    /// Hooks listed in `started` were built before `hook` failed.
    #[error("log hook {hook} failed (started before it: {started:?}): {source}")]
    Hook {
        hook: String,
        started: Vec<String>,
        #[source]
        source: HookError,
    },

    #[error("invalid log level {level:?}: {reason}")]
    Level { level: String, reason: String },

    #[error("invalid log configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("global logger already installed: {0}")]
    Install(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
    /// Export hooks by name, each with its raw options.
    pub hooks: BTreeMap<String, RawOptions>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            hooks: BTreeMap::new(),
        }
    }
}

impl LogConfig {
    pub fn from_json(raw: &str) -> Result<Self, LogConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Build the layers of all configured hooks.
    ///
    /// Every hook name is checked against `registry` before any hook is
    /// built. Hooks are then built in name order; the first failure stops.
    /// Layers built before the failure are dropped with the error, not left
    /// running; the error only names them.
    pub fn hook_layers(&self, registry: &HookRegistry) -> Result<Vec<BoxedLayer>, LogConfigError> {
        if let Some(unknown) = self.hooks.keys().find(|name| !registry.contains(name)) {
            return Err(LogConfigError::UnknownHook(unknown.clone()));
        }

        let mut layers = Vec::with_capacity(self.hooks.len());
        let mut started = Vec::new();
        for (name, options) in &self.hooks {
            let hook = name.to_lowercase();
            let factory = registry
                .get(&hook)
                .ok_or_else(|| LogConfigError::UnknownHook(name.clone()))?;
            let layer = factory(options).map_err(|source| LogConfigError::Hook {
                hook: hook.clone(),
                started: started.clone(),
                source,
            })?;
            layers.push(layer);
            started.push(hook);
        }
        Ok(layers)
    }

    fn filter(&self) -> Result<EnvFilter, LogConfigError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|err| LogConfigError::Level {
            level: self.level.clone(),
            reason: err.to_string(),
        })
    }

    /// Install the process-wide subscriber with the configured hooks.
    ///
    /// Nothing is installed when any hook fails.
    pub fn set_logger(&self, registry: &HookRegistry) -> Result<(), LogConfigError> {
        let hooks = self.hook_layers(registry)?;
        let filter = self.filter()?;

        let (json, text) = match self.format {
            LogFormat::Json => (
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_timer(tracing_subscriber::fmt::time::SystemTime)
                        .with_target(false),
                ),
                None,
            ),
            LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer().with_target(false))),
        };

        tracing_subscriber::registry()
            .with(hooks)
            .with(filter)
            .with(json)
            .with(text)
            .try_init()
            .map_err(|err| LogConfigError::Install(err.to_string()))
    }
}
