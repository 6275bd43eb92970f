// SPDX-License-Identifier: Apache-2.0

//! Declarative TOML configuration.
//!
//! Three named object kinds plus shared forms:
//!
//! ```toml
//! state_dir = "/var/lib/logship"
//!
//! [source.nginx-error]
//! globs = "/var/log/nginx/error*.log"
//! prefix = '(?m)^\d{4}/\d{2}/\d{2} '
//! pattern = '(?s)\A(?P<ts>\S+ \S+) \[(?P<severity>\w+)\] (?P<message>.*)\z'
//! form = "error-entry"
//!
//! [form.error-entry.fields.severity]
//! kind = "capture"
//!
//! [sink.archive]
//! type = "file"
//! path = "/var/lib/logship/archive.out"
//!
//! [channel.errors]
//! sources = "nginx-error"
//! sink = "archive"
//! track = true
//! ```
//!
//! Everything is validated and compiled here; any malformed spec, unresolved
//! reference or dependency cycle aborts startup before consumption begins.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::block::BoundaryRule;
use crate::channel::{Channel, ThrottlePolicy};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::form::{CompiledForm, FnRegistry, FormSpec};
use crate::lock::LockManager;
use crate::position::PositionStore;
use crate::sink::{DeliveryWrapper, SinkRegistry};
use crate::source::Source;

const DEFAULT_READ_SIZE: usize = 4096;
const DEFAULT_BUFFER_SIZE: usize = 1_048_576;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    state_dir: Option<PathBuf>,
    lock_timeout_secs: Option<u64>,
    read_size: Option<usize>,
    buffer_size: Option<usize>,
    #[serde(default)]
    source: BTreeMap<String, RawSource>,
    #[serde(default)]
    form: BTreeMap<String, FormSpec>,
    #[serde(default)]
    sink: BTreeMap<String, toml::Table>,
    #[serde(default)]
    channel: BTreeMap<String, RawChannel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    globs: String,
    pattern: String,
    prefix: Option<String>,
    form: Option<String>,
    read_size: Option<usize>,
    buffer_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChannel {
    sources: String,
    sink: String,
    form: Option<String>,
    filter: Option<String>,
    batch_size: Option<usize>,
    track: Option<bool>,
    backfill: Option<bool>,
    strict: Option<bool>,
    strict_slack: Option<u64>,
    throttle_duration_secs: Option<u64>,
    throttle_backoff: Option<u32>,
    throttle_cap_secs: Option<u64>,
}

/// Values the command line may override on top of the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub state_dir: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub track: Option<bool>,
}

/// Shared runtime context: the one place process-wide facilities live.
pub struct Context {
    pub state_dir: PathBuf,
    pub locks: LockManager,
}

/// A fully compiled configuration, ready to run.
pub struct Engine {
    pub context: Context,
    pub channels: Vec<Channel>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state_dir", &self.context.state_dir)
            .field("channels", &self.channel_names())
            .finish()
    }
}

impl Engine {
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }
}

/// Parsed but not yet compiled configuration.
pub struct Config {
    raw: RawConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        info!(config = %path.display(), "loading configuration");
        let raw = fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(raw).map_err(|e| Error::Config(format!("malformed config: {e}")))?;
        Ok(Self { raw })
    }

    /// Names and globs of the configured sources, for listing.
    pub fn sources(&self) -> Vec<(&str, &str)> {
        self.raw
            .source
            .iter()
            .map(|(name, s)| (name.as_str(), s.globs.as_str()))
            .collect()
    }

    /// Names, source lists and sink of the configured channels, for listing.
    pub fn channels(&self) -> Vec<(&str, &str, &str)> {
        self.raw
            .channel
            .iter()
            .map(|(name, c)| (name.as_str(), c.sources.as_str(), c.sink.as_str()))
            .collect()
    }

    /// Compile everything into a runnable engine. All reference resolution,
    /// regex/glob compilation and dependency checking happens here.
    pub fn build(
        &self,
        functions: &FnRegistry,
        sinks: &SinkRegistry,
        overrides: &Overrides,
    ) -> Result<Engine> {
        let state_dir = overrides
            .state_dir
            .clone()
            .or_else(|| self.raw.state_dir.clone())
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&state_dir)?;

        let lock_timeout = Duration::from_secs(
            self.raw
                .lock_timeout_secs
                .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
        );
        let context = Context {
            locks: LockManager::new(&state_dir, lock_timeout),
            state_dir: state_dir.clone(),
        };

        // Compile every form up front so an unreferenced but malformed form
        // still fails at load time.
        for (name, spec) in &self.raw.form {
            CompiledForm::compile(spec, functions)
                .map_err(|e| Error::Config(format!("form \"{name}\": {e}")))?;
        }

        let mut sources: BTreeMap<&str, Arc<Source>> = BTreeMap::new();
        for (name, raw) in &self.raw.source {
            sources.insert(name.as_str(), Arc::new(self.build_source(name, raw, functions)?));
        }

        let mut channels = Vec::new();
        for (name, raw) in &self.raw.channel {
            channels.push(self.build_channel(
                name, raw, &sources, functions, sinks, overrides, &state_dir,
            )?);
        }

        Ok(Engine { context, channels })
    }

    fn build_source(&self, name: &str, raw: &RawSource, functions: &FnRegistry) -> Result<Source> {
        let pattern = regex::bytes::Regex::new(&raw.pattern).map_err(|e| {
            Error::Config(format!("source \"{name}\": bad pattern: {e}"))
        })?;
        let rule = match &raw.prefix {
            Some(prefix) => BoundaryRule::Prefix(regex::bytes::Regex::new(prefix).map_err(
                |e| Error::Config(format!("source \"{name}\": bad prefix: {e}")),
            )?),
            None => BoundaryRule::Entry(pattern.clone()),
        };
        let form = match &raw.form {
            Some(form_name) => {
                let spec = self.raw.form.get(form_name).ok_or_else(|| {
                    Error::Config(format!(
                        "source \"{name}\": unknown form \"{form_name}\""
                    ))
                })?;
                CompiledForm::compile(spec, functions)?
            }
            None => CompiledForm::compile(&FormSpec::default(), functions)?,
        };
        Source::new(
            name,
            raw.globs.split_whitespace().map(String::from).collect(),
            rule,
            pattern,
            form,
            raw.read_size
                .or(self.raw.read_size)
                .unwrap_or(DEFAULT_READ_SIZE),
            raw.buffer_size
                .or(self.raw.buffer_size)
                .unwrap_or(DEFAULT_BUFFER_SIZE),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_channel(
        &self,
        name: &str,
        raw: &RawChannel,
        sources: &BTreeMap<&str, Arc<Source>>,
        functions: &FnRegistry,
        sinks: &SinkRegistry,
        overrides: &Overrides,
        state_dir: &Path,
    ) -> Result<Channel> {
        let mut channel_sources = Vec::new();
        for source_name in raw.sources.split_whitespace() {
            let source = sources.get(source_name).ok_or_else(|| {
                Error::Config(format!(
                    "channel \"{name}\": unknown source \"{source_name}\""
                ))
            })?;
            channel_sources.push(source.clone());
        }
        if channel_sources.is_empty() {
            return Err(Error::Config(format!(
                "channel \"{name}\": needs at least one source"
            )));
        }

        let sink_table = self.raw.sink.get(&raw.sink).ok_or_else(|| {
            Error::Config(format!("channel \"{name}\": unknown sink \"{}\"", raw.sink))
        })?;
        let sink_type = sink_table
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::Config(format!("sink \"{}\": missing \"type\"", raw.sink))
            })?;
        let mut options = sink_table.clone();
        options.remove("type");
        let sink = sinks.build(&raw.sink, sink_type, &options)?;

        let form = match &raw.form {
            None => None,
            Some(form_name) => {
                let spec = self.raw.form.get(form_name).ok_or_else(|| {
                    Error::Config(format!(
                        "channel \"{name}\": unknown form \"{form_name}\""
                    ))
                })?;
                Some(CompiledForm::compile(spec, functions)?)
            }
        };

        let filter = match &raw.filter {
            None => None,
            Some(expr) => Some(
                Filter::parse(expr)
                    .map_err(|e| Error::Config(format!("channel \"{name}\": {e}")))?,
            ),
        };

        let track = overrides.track.or(raw.track).unwrap_or(false);
        let store = if track {
            PositionStore::open(state_dir.join(format!("{name}.track.json")))?
        } else {
            // Stateless replay still starts from the last persisted state
            // when one exists; it just never writes.
            let store_path = state_dir.join(format!("{name}.track.json"));
            if store_path.exists() {
                let mut store = PositionStore::open(store_path)?;
                store.detach();
                store
            } else {
                PositionStore::in_memory()
            }
        };

        let throttle = ThrottlePolicy {
            duration: raw
                .throttle_duration_secs
                .map(Duration::from_secs)
                .unwrap_or(ThrottlePolicy::default().duration),
            backoff: raw
                .throttle_backoff
                .unwrap_or(ThrottlePolicy::default().backoff),
            cap: raw
                .throttle_cap_secs
                .map(Duration::from_secs)
                .unwrap_or(ThrottlePolicy::default().cap),
        };

        Ok(Channel::new(
            name,
            channel_sources,
            DeliveryWrapper::new(sink),
            form,
            filter,
            overrides
                .batch_size
                .or(raw.batch_size)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            track,
            raw.backfill.unwrap_or(false),
            raw.strict.unwrap_or(false),
            raw.strict_slack.unwrap_or(0),
            store,
            throttle,
        ))
    }
}
