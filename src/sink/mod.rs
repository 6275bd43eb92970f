// SPDX-License-Identifier: Apache-2.0

//! Sink delivery contract and backend registry.
//!
//! A sink receives batches of bound records and reports a classified
//! outcome. Backends are constructed through an explicit name → constructor
//! registry; their options arrive as the raw TOML table from the sink's
//! config section and are opaque to the core.

mod builtin;

pub use builtin::{EchoSink, FileSink, NullSink, TallySink};

use std::collections::BTreeMap;
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::block::Block;
use crate::error::{Error, Result};
use crate::form::Value;

/// One bound record together with the block it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub record: BTreeMap<String, Value>,
    pub block: Block,
}

/// Classified outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Failed { reason: String, retryable: bool },
}

impl Delivery {
    pub fn failed_retryable(reason: impl Into<String>) -> Self {
        Delivery::Failed {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn failed_permanent(reason: impl Into<String>) -> Self {
        Delivery::Failed {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// The uniform delivery contract every backend implements.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Deliver one batch. Implementations classify their own failures;
    /// they do not panic for operational errors.
    fn deliver(&mut self, batch: &[Envelope]) -> Delivery;

    /// End-of-cycle hook for backends that buffer or report totals.
    fn flush(&mut self) {}
}

type Constructor = fn(name: &str, options: &toml::Table) -> Result<Box<dyn Sink>>;

/// Name → constructor registry, populated explicitly at startup.
#[derive(Default)]
pub struct SinkRegistry {
    map: HashMap<String, Constructor>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the builtin backends.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("echo", builtin::echo_sink);
        registry.register("file", builtin::file_sink);
        registry.register("null", builtin::null_sink);
        registry.register("tally", builtin::tally_sink);
        registry
    }

    pub fn register(&mut self, type_name: &str, constructor: Constructor) {
        self.map.insert(type_name.to_string(), constructor);
    }

    pub fn build(
        &self,
        sink_name: &str,
        type_name: &str,
        options: &toml::Table,
    ) -> Result<Box<dyn Sink>> {
        let constructor = self.map.get(type_name).ok_or_else(|| {
            Error::Config(format!(
                "sink \"{sink_name}\": unknown sink type \"{type_name}\""
            ))
        })?;
        constructor(sink_name, options)
    }
}

/// Wraps a sink with outcome classification. Only a `Delivered` outcome
/// authorizes the caller to advance the position store; both failure shapes
/// leave it untouched.
pub struct DeliveryWrapper {
    sink: Box<dyn Sink>,
}

impl DeliveryWrapper {
    pub fn new(sink: Box<dyn Sink>) -> Self {
        Self { sink }
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    pub fn deliver(&mut self, batch: &[Envelope]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let first = batch[0].block.begin;
        let last = batch[batch.len() - 1].block.end;
        match self.sink.deliver(batch) {
            Delivery::Delivered => {
                debug!(
                    sink = self.sink.name(),
                    records = batch.len(),
                    range = format!("{first}..{last}"),
                    "batch delivered"
                );
                Ok(())
            }
            Delivery::Failed { reason, retryable } => {
                warn!(
                    sink = self.sink.name(),
                    records = batch.len(),
                    range = format!("{first}..{last}"),
                    retryable,
                    %reason,
                    "delivery failed"
                );
                Err(Error::Delivery {
                    sink: self.sink.name().to_string(),
                    reason,
                    retryable,
                })
            }
        }
    }

    pub fn flush(&mut self) {
        self.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn envelope(begin: u64, end: u64) -> Envelope {
        Envelope {
            record: BTreeMap::new(),
            block: Block {
                path: Arc::from("test.log"),
                begin,
                end,
                raw: vec![b'x'; (end - begin) as usize],
            },
        }
    }

    struct FlakySink {
        failures_left: u32,
    }

    impl Sink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        fn deliver(&mut self, _batch: &[Envelope]) -> Delivery {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                Delivery::failed_retryable("backend unavailable")
            } else {
                Delivery::Delivered
            }
        }
    }

    #[test]
    fn wrapper_maps_outcomes_to_errors() {
        let mut wrapper = DeliveryWrapper::new(Box::new(FlakySink { failures_left: 1 }));
        let batch = vec![envelope(0, 10)];

        match wrapper.deliver(&batch) {
            Err(Error::Delivery { retryable, .. }) => assert!(retryable),
            other => panic!("expected delivery error, got {other:?}"),
        }
        assert!(wrapper.deliver(&batch).is_ok());
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut wrapper = DeliveryWrapper::new(Box::new(FlakySink { failures_left: 99 }));
        assert!(wrapper.deliver(&[]).is_ok());
    }

    #[test]
    fn registry_builds_builtin_types() {
        let registry = SinkRegistry::builtin();
        let sink = registry.build("out", "null", &toml::Table::new()).unwrap();
        assert_eq!(sink.name(), "out");

        assert!(registry
            .build("out", "no-such-backend", &toml::Table::new())
            .is_err());
    }
}
