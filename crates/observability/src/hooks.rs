//! Export hooks: extra `tracing` layers selected by name from configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, LineWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::Registry;

use crate::decode::{RawOptions, decode_raw_config};

/// Name of the built-in hook exporting one log stream as JSON lines.
pub const STREAM_EXPORT_HOOK: &str = "streamexport";

/// Stream exported by default; activity records are logged on it.
pub const DEFAULT_EXPORT_STREAM: &str = "activity";

pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

pub type HookFactory = Arc<dyn Fn(&RawOptions) -> Result<BoxedLayer, HookError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid hook options: {0}")]
    Options(#[from] serde_json::Error),

    #[error("hook output unavailable: {0}")]
    Io(#[from] io::Error),
}

/// Hooks known to the process, keyed by lower-case name.
#[derive(Clone, Default)]
pub struct HookRegistry {
    factories: BTreeMap<String, HookFactory>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in hooks.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(STREAM_EXPORT_HOOK, |options| {
            let options: StreamExportOptions = decode_raw_config(options)?;
            Ok(Box::new(StreamExportLayer::from_options(&options)?) as BoxedLayer)
        });
        registry
    }

    /// Register `factory` under `name`; a later registration replaces an
    /// earlier one.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&RawOptions) -> Result<BoxedLayer, HookError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_lowercase(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_lowercase())
    }

    pub fn get(&self, name: &str) -> Option<HookFactory> {
        self.factories.get(&name.to_lowercase()).cloned()
    }
}

/// Options of the [`STREAM_EXPORT_HOOK`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamExportOptions {
    /// Value of the `stream` field selecting exported events.
    pub stream: String,
    /// Output file; standard output when unset.
    pub path: Option<PathBuf>,
    /// Append to `path` instead of truncating it.
    pub append: bool,
}

impl Default for StreamExportOptions {
    fn default() -> Self {
        Self {
            stream: DEFAULT_EXPORT_STREAM.to_string(),
            path: None,
            append: true,
        }
    }
}

/// Writes every event carrying `stream = <stream>` as one JSON line.
///
/// A `record` field holding JSON text is embedded as JSON.
pub struct StreamExportLayer {
    stream: String,
    out: Mutex<Box<dyn Write + Send>>,
}

impl StreamExportLayer {
    pub fn new(stream: impl Into<String>, out: impl Write + Send + 'static) -> Self {
        Self {
            stream: stream.into(),
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn from_options(options: &StreamExportOptions) -> Result<Self, HookError> {
        let layer = match &options.path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(options.append)
                    .truncate(!options.append)
                    .open(path)?;
                Self::new(options.stream.clone(), LineWriter::new(file))
            }
            None => Self::new(options.stream.clone(), io::stdout()),
        };
        Ok(layer)
    }
}

impl<S: Subscriber> Layer<S> for StreamExportLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FieldCollector::default();
        event.record(&mut fields);
        if fields.stream.as_deref() != Some(self.stream.as_str()) {
            return;
        }

        let mut line = Map::new();
        line.insert("time".to_string(), Value::String(Utc::now().to_rfc3339()));
        line.insert(
            "level".to_string(),
            Value::String(event.metadata().level().as_str().to_lowercase()),
        );
        line.insert("stream".to_string(), Value::String(self.stream.clone()));
        line.extend(fields.values);

        let Ok(encoded) = serde_json::to_string(&Value::Object(line)) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{encoded}");
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    stream: Option<String>,
    values: Map<String, Value>,
}

impl FieldCollector {
    fn insert_text(&mut self, field: &Field, text: String) {
        match field.name() {
            "stream" => self.stream = Some(text),
            "record" => {
                let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
                self.values.insert("record".to_string(), value);
            }
            name => {
                self.values.insert(name.to_string(), Value::String(text));
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert_text(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.values.insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.values.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.values.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert_text(field, format!("{value:?}"));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tracing::info;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    #[test]
    fn exports_only_the_configured_stream() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry()
            .with(StreamExportLayer::new(DEFAULT_EXPORT_STREAM, captured.clone()));

        tracing::subscriber::with_default(subscriber, || {
            info!(stream = "activity", tenant_id = %"tenant", record = %r#"{"kind":"access"}"#, "activity");
            info!(stream = "audit", "not exported");
            info!("plain log line");
        });

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["stream"], "activity");
        assert_eq!(lines[0]["tenant_id"], "tenant");
        assert_eq!(lines[0]["record"], json!({ "kind": "access" }));
        assert_eq!(lines[0]["level"], "info");
    }

    #[test]
    fn registry_matches_names_case_insensitively() {
        let registry = HookRegistry::with_defaults();
        assert!(registry.contains("StreamExport"));
        assert!(registry.get("STREAMEXPORT").is_some());
        assert!(registry.get("logstash").is_none());
    }

    #[test]
    fn factory_rejects_bad_options() {
        let registry = HookRegistry::with_defaults();
        let factory = registry.get(STREAM_EXPORT_HOOK).unwrap();
        let options: RawOptions = [("Append".to_string(), json!("sometimes"))].into_iter().collect();
        assert!(matches!(factory(&options), Err(HookError::Options(_))));
    }
}
