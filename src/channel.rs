// SPDX-License-Identifier: Apache-2.0

//! Channels: one or more sources feeding one sink under a processing policy.
//!
//! `consume_path` is the unit of work. For one file it acquires the path
//! lock, reconciles the stored position, drains blocks, binds and filters
//! records, assembles batches and hands them to the delivery wrapper. Only a
//! confirmed delivery advances the position, so a crash between delivery and
//! persistence re-delivers (at-least-once) but never skips data.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::block::{Block, SplitItem};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::form::{BindContext, BindSource, CompiledForm, Value};
use crate::lock::LockManager;
use crate::position::PositionStore;
use crate::sink::{DeliveryWrapper, Envelope};
use crate::source::{Source, STDIN_PATH};

/// Bounded back-off throttle, tripped by retryable delivery failures and
/// reset by a confirmed delivery. While active the channel-source pair is
/// not consumed.
#[derive(Debug)]
pub struct Throttle {
    duration: Duration,
    backoff: u32,
    cap: Duration,
    count: u32,
    expires_at: Option<Instant>,
}

impl Throttle {
    pub fn new(duration: Duration, backoff: u32, cap: Duration) -> Self {
        Self {
            duration,
            backoff,
            cap,
            count: 0,
            expires_at: None,
        }
    }

    pub fn active(&mut self) -> bool {
        match self.expires_at {
            None => false,
            Some(at) if at <= Instant::now() => {
                self.expires_at = None;
                false
            }
            Some(_) => true,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.expires_at = None;
    }

    /// Record a failure and start the next back-off window. The window grows
    /// linearly with consecutive failures up to the cap, with a small random
    /// jitter so co-failing channels do not retry in lockstep.
    pub fn trip(&mut self) -> Duration {
        let base = self.duration + self.duration * self.backoff * self.count;
        let mut capped = base.min(self.cap);
        let quarter_ms = (capped.as_millis() as u64 / 4).max(1);
        let jitter_ms = (rand::random::<u64>() % (quarter_ms * 2)) as i64 - quarter_ms as i64;
        if jitter_ms >= 0 {
            capped += Duration::from_millis(jitter_ms as u64);
        } else {
            capped = capped.saturating_sub(Duration::from_millis((-jitter_ms) as u64));
        }
        self.count += 1;
        self.expires_at = Some(Instant::now() + capped);
        capped
    }
}

/// Throttle policy for a channel's sources.
#[derive(Debug, Clone, Copy)]
pub struct ThrottlePolicy {
    pub duration: Duration,
    pub backoff: u32,
    pub cap: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            backoff: 2,
            cap: Duration::from_secs(1000),
        }
    }
}

/// How one consumption cycle for one file ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Drained to the file's current end.
    Drained,
    /// Backing off after a retryable failure; retry after `retry_in`.
    Throttled { retry_in: Duration },
    /// Failed for this cycle; operator attention required.
    Failed { reason: String },
}

/// Per-file result of one consumption cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub path: String,
    pub records: u64,
    pub bytes: u64,
    pub errors: u64,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    pub fn failed(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Failed { .. })
    }
}

pub struct Channel {
    name: String,
    sources: Vec<Arc<Source>>,
    wrapper: DeliveryWrapper,
    form: Option<CompiledForm>,
    filter: Option<Filter>,
    batch_size: usize,
    track: bool,
    backfill: bool,
    strict: bool,
    strict_slack: u64,
    store: PositionStore,
    throttle_policy: ThrottlePolicy,
    throttles: HashMap<String, Throttle>,
}

#[allow(clippy::too_many_arguments)]
impl Channel {
    pub fn new(
        name: impl Into<String>,
        sources: Vec<Arc<Source>>,
        wrapper: DeliveryWrapper,
        form: Option<CompiledForm>,
        filter: Option<Filter>,
        batch_size: usize,
        track: bool,
        backfill: bool,
        strict: bool,
        strict_slack: u64,
        store: PositionStore,
        throttle_policy: ThrottlePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            sources,
            wrapper,
            form,
            filter,
            batch_size: batch_size.max(1),
            track,
            backfill,
            strict,
            strict_slack,
            store,
            throttle_policy,
            throttles: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    pub fn sink_name(&self) -> &str {
        self.wrapper.sink_name()
    }

    /// The first source whose globs claim `path`.
    pub fn match_source(&self, path: &Path) -> Option<&Arc<Source>> {
        self.sources.iter().find(|s| s.matches(path))
    }

    /// The tracked offset for `path`, if any.
    pub fn position(&self, path: &Path) -> Option<u64> {
        self.store.load(&path.to_string_lossy()).map(|p| p.offset)
    }

    /// Drop tracking for a deleted file.
    pub fn forget_path(&mut self, path: &Path) -> Result<()> {
        self.store.remove(&path.to_string_lossy())
    }

    /// Whether the named source is currently backing off.
    pub fn throttled(&mut self, source: &str) -> bool {
        self.throttles
            .get_mut(source)
            .map(Throttle::active)
            .unwrap_or(false)
    }

    /// Initialize a position for `path` without reading content: offset 0
    /// when backfilling, current end of file otherwise. No-op when already
    /// tracked.
    pub fn seed_path(&mut self, path: &Path) -> Result<bool> {
        let key = path.to_string_lossy();
        let offset = if self.backfill {
            0
        } else {
            fs::metadata(path)?.len()
        };
        if !self.track {
            return Ok(false);
        }
        self.store.seed(&key, offset)
    }

    /// Consume one file under its lock: the cycle described in the module
    /// docs. Lock timeouts and retryable delivery failures surface as a
    /// throttled outcome; everything unrecoverable fails the file for this
    /// cycle only.
    pub fn consume_path(&mut self, locks: &LockManager, path: &Path) -> Result<CycleReport> {
        let source = self
            .match_source(path)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no source in channel \"{}\" matches {}", self.name, path.display())))?;

        if self.throttled(source.name()) {
            let retry_in = self
                .throttles
                .get(source.name())
                .map(Throttle::remaining)
                .unwrap_or(Duration::ZERO);
            return Ok(CycleReport {
                path: path.to_string_lossy().to_string(),
                records: 0,
                bytes: 0,
                errors: 0,
                outcome: CycleOutcome::Throttled { retry_in },
            });
        }

        let _lock = match locks.acquire(path) {
            Ok(lock) => lock,
            Err(Error::LockTimeout { path, waited_ms }) => {
                debug!(path = %path.display(), waited_ms, "lock contended, retrying later");
                let retry_in = self.trip_throttle(source.name());
                return Ok(CycleReport {
                    path: path.to_string_lossy().to_string(),
                    records: 0,
                    bytes: 0,
                    errors: 0,
                    outcome: CycleOutcome::Throttled { retry_in },
                });
            }
            Err(e) => return Err(e),
        };

        let key = path.to_string_lossy().to_string();
        let offset = if self.store.load(&key).is_none() && !self.backfill {
            // First sight without backfill: pre-existing content is skipped.
            let end = fs::metadata(path)?.len();
            if self.track {
                self.store.seed(&key, end)?;
            }
            end
        } else {
            self.store.reconcile(&key)?
        };

        let stream = source.open(path, offset)?;
        self.drain(&source, stream, &key, offset, true)
    }

    /// Consume an arbitrary stream through this channel. Used for standard
    /// input: identical to a file source except no lock is taken and no
    /// position is persisted.
    pub fn consume_stream<R: Read>(&mut self, reader: R) -> Result<CycleReport> {
        if self.sources.len() != 1 {
            return Err(Error::Config(format!(
                "channel \"{}\" has {} sources; cannot pick one for a stream",
                self.name,
                self.sources.len()
            )));
        }
        let source = self.sources[0].clone();
        let stream = source.blocks(reader, Arc::from(STDIN_PATH), 0);
        self.drain(&source, stream, STDIN_PATH, 0, false)
    }

    fn drain<R: Read>(
        &mut self,
        source: &Source,
        stream: crate::source::BlockStream<R>,
        key: &str,
        start_offset: u64,
        persist: bool,
    ) -> Result<CycleReport> {
        let started = Instant::now();
        let mut batch: Vec<Envelope> = Vec::new();
        let mut consumed_end = start_offset;
        let mut delivered_through = start_offset;
        let mut records: u64 = 0;
        let mut bytes: u64 = 0;
        let mut errors: u64 = 0;
        let mut first_error_begin: Option<u64> = None;

        macro_rules! note_error {
            ($begin:expr, $end:expr, $label:expr) => {{
                errors += 1;
                first_error_begin.get_or_insert($begin);
                if self.strict && errors > self.strict_slack {
                    return Ok(self.fail_cycle(
                        key,
                        records,
                        bytes,
                        errors,
                        first_error_begin.unwrap_or($begin),
                        $end,
                    ));
                }
                warn!(channel = %self.name, path = key, begin = $begin, end = $end, "{}", $label);
            }};
        }

        for item in stream {
            match item? {
                SplitItem::Block(block) => {
                    let block_end = block.end;
                    let block_len = block.len();
                    match self.bind(source, &block) {
                        Ok(Some(envelope)) => {
                            batch.push(envelope);
                            records += 1;
                            bytes += block_len;
                        }
                        Ok(None) => {
                            debug!(channel = %self.name, path = key, begin = block.begin, "filtered");
                            bytes += block_len;
                        }
                        Err(Error::Binding(reason)) => {
                            note_error!(block.begin, block.end, format!("binding failed: {reason}"));
                        }
                        Err(e) => return Err(e),
                    }
                    consumed_end = block_end;
                    if batch.len() >= self.batch_size {
                        if let Some(report) = self.flush_batch(
                            &mut batch,
                            key,
                            consumed_end,
                            &mut delivered_through,
                            persist,
                            records,
                            bytes,
                            errors,
                        )? {
                            return Ok(report);
                        }
                    }
                }
                SplitItem::Skipped { begin, end } => {
                    note_error!(begin, end, "bytes matched no boundary, skipping");
                    consumed_end = end;
                }
                SplitItem::Overflow { begin, end } => {
                    let overflow = Error::BoundaryOverflow {
                        path: key.to_string(),
                        begin,
                        end,
                        limit: source.buffer_size(),
                    };
                    note_error!(begin, end, overflow.to_string());
                    consumed_end = end;
                }
            }
        }

        if let Some(report) = self.flush_batch(
            &mut batch,
            key,
            consumed_end,
            &mut delivered_through,
            persist,
            records,
            bytes,
            errors,
        )? {
            return Ok(report);
        }
        self.wrapper.flush();

        // Everything after the last delivery was filtered or skipped;
        // advance past it so the next cycle does not replay it.
        if persist && self.track && consumed_end > delivered_through {
            let file_id = crate::position::FileId::from_path(Path::new(key))?;
            self.store.save(key, file_id, consumed_end)?;
        }

        if let Some(throttle) = self.throttles.get_mut(source.name()) {
            throttle.reset();
        }

        info!(
            channel = %self.name,
            source = source.name(),
            path = key,
            records,
            bytes,
            errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "drained"
        );

        Ok(CycleReport {
            path: key.to_string(),
            records,
            bytes,
            errors,
            outcome: CycleOutcome::Drained,
        })
    }

    /// Deliver the current batch. On confirmed delivery the position advances
    /// to the end of the consumed range and the throttle resets. Returns a
    /// terminal report when the cycle cannot continue.
    #[allow(clippy::too_many_arguments)]
    fn flush_batch(
        &mut self,
        batch: &mut Vec<Envelope>,
        key: &str,
        consumed_end: u64,
        delivered_through: &mut u64,
        persist: bool,
        records: u64,
        bytes: u64,
        errors: u64,
    ) -> Result<Option<CycleReport>> {
        if batch.is_empty() {
            return Ok(None);
        }
        match self.wrapper.deliver(batch) {
            Ok(()) => {
                batch.clear();
                *delivered_through = consumed_end;
                if persist && self.track {
                    let file_id = crate::position::FileId::from_path(Path::new(key))?;
                    self.store.save(key, file_id, consumed_end)?;
                }
                Ok(None)
            }
            Err(Error::Delivery {
                sink,
                reason,
                retryable: true,
            }) => {
                let source = self
                    .sources
                    .iter()
                    .find(|s| s.matches(Path::new(key)))
                    .unwrap_or(&self.sources[0])
                    .name()
                    .to_string();
                let retry_in = self.trip_throttle(&source);
                warn!(
                    channel = %self.name,
                    sink = %sink,
                    path = key,
                    retry_in_ms = retry_in.as_millis() as u64,
                    %reason,
                    "retryable delivery failure, throttling"
                );
                Ok(Some(CycleReport {
                    path: key.to_string(),
                    records: records - batch.len() as u64,
                    bytes,
                    errors,
                    outcome: CycleOutcome::Throttled { retry_in },
                }))
            }
            Err(Error::Delivery {
                sink,
                reason,
                retryable: false,
            }) => Ok(Some(CycleReport {
                path: key.to_string(),
                records: records - batch.len() as u64,
                bytes,
                errors,
                outcome: CycleOutcome::Failed {
                    reason: format!("permanent delivery failure via sink \"{sink}\": {reason}"),
                },
            })),
            Err(e) => Err(e),
        }
    }

    fn fail_cycle(
        &self,
        key: &str,
        records: u64,
        bytes: u64,
        errors: u64,
        begin: u64,
        end: u64,
    ) -> CycleReport {
        let error = Error::SlackExhausted {
            path: key.to_string(),
            begin,
            end,
            errors,
            slack: self.strict_slack,
        };
        CycleReport {
            path: key.to_string(),
            records,
            bytes,
            errors,
            outcome: CycleOutcome::Failed {
                reason: error.to_string(),
            },
        }
    }

    fn trip_throttle(&mut self, source: &str) -> Duration {
        let policy = self.throttle_policy;
        self.throttles
            .entry(source.to_string())
            .or_insert_with(|| Throttle::new(policy.duration, policy.backoff, policy.cap))
            .trip()
    }

    /// Bind one block to a record, apply the channel form and filter.
    /// `Ok(None)` means the filter dropped it.
    fn bind(&self, source: &Source, block: &Block) -> Result<Option<Envelope>> {
        let captures = source.pattern().captures(&block.raw).ok_or_else(|| {
            Error::Binding(format!(
                "{}[{}..{}] does not match the binding pattern",
                block.path, block.begin, block.end
            ))
        })?;

        let ctx = BindContext {
            path: &block.path,
            begin: block.begin,
            end: block.end,
            source: source.name(),
            channel: &self.name,
        };

        let record = if source.form().is_empty() {
            // No form declared: every named group becomes a string field.
            let mut record = std::collections::BTreeMap::new();
            for name in source.pattern().capture_names().flatten() {
                if let Some(m) = captures.name(name) {
                    record.insert(
                        name.to_string(),
                        Value::Str(String::from_utf8_lossy(m.as_bytes()).into_owned()),
                    );
                }
            }
            record
        } else {
            source.form().bind(&BindSource::Captures(&captures), &ctx)?
        };

        let record = match &self.form {
            Some(form) => form.bind(&BindSource::Record(&record), &ctx)?,
            None => record,
        };

        if let Some(filter) = &self.filter {
            if !filter.keep(&record) {
                return Ok(None);
            }
        }

        Ok(Some(Envelope {
            record,
            block: block.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::{FnRegistry, FormSpec};
    use crate::sink::{Delivery, Sink};
    use regex::bytes::Regex;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Sink whose outcomes are scripted up front; delivers once the script
    /// runs out. Records every delivered batch size.
    struct ScriptedSink {
        script: Arc<Mutex<VecDeque<Delivery>>>,
        delivered: Arc<Mutex<Vec<usize>>>,
    }

    impl Sink for ScriptedSink {
        fn name(&self) -> &str {
            "scripted"
        }

        fn deliver(&mut self, batch: &[Envelope]) -> Delivery {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(outcome) => outcome,
                None => {
                    self.delivered.lock().unwrap().push(batch.len());
                    Delivery::Delivered
                }
            }
        }
    }

    struct Fixture {
        dir: TempDir,
        delivered: Arc<Mutex<Vec<usize>>>,
        script: Arc<Mutex<VecDeque<Delivery>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                delivered: Arc::new(Mutex::new(Vec::new())),
                script: Arc::new(Mutex::new(VecDeque::new())),
            }
        }

        fn write(&self, name: &str, content: &[u8]) -> std::path::PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn append(&self, name: &str, content: &[u8]) {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(self.dir.path().join(name))
                .unwrap();
            f.write_all(content).unwrap();
        }

        fn locks(&self) -> LockManager {
            LockManager::new(self.dir.path().join("state"), Duration::from_millis(200))
        }

        fn source(&self) -> Arc<Source> {
            let form =
                CompiledForm::compile(&FormSpec::default(), &FnRegistry::builtin()).unwrap();
            Arc::new(
                Source::new(
                    "lines",
                    vec![format!("{}/*.log", self.dir.path().display())],
                    crate::block::BoundaryRule::Entry(Regex::new(r"(?m)^[^\n]*\n").unwrap()),
                    Regex::new(r"\Aok (?P<msg>[^\n]*)\n\z").unwrap(),
                    form,
                    64,
                    4096,
                )
                .unwrap(),
            )
        }

        fn channel(&self, track: bool, backfill: bool, strict: bool, slack: u64) -> Channel {
            let sink = ScriptedSink {
                script: self.script.clone(),
                delivered: self.delivered.clone(),
            };
            let store = if track {
                PositionStore::open(self.dir.path().join("state").join("tc.track.json")).unwrap()
            } else {
                PositionStore::in_memory()
            };
            Channel::new(
                "tc",
                vec![self.source()],
                DeliveryWrapper::new(Box::new(sink)),
                None,
                None,
                100,
                track,
                backfill,
                strict,
                slack,
                store,
                ThrottlePolicy {
                    duration: Duration::from_millis(100),
                    backoff: 1,
                    cap: Duration::from_millis(200),
                },
            )
        }
    }

    #[test]
    fn consume_is_idempotent_across_runs() {
        let fx = Fixture::new();
        let path = fx.write("a.log", b"ok one\nok two\nok three\n");
        let mut channel = fx.channel(true, true, true, 0);
        let locks = fx.locks();

        let report = channel.consume_path(&locks, &path).unwrap();
        assert_eq!(report.records, 3);
        assert_eq!(report.bytes, 23);
        assert!(matches!(report.outcome, CycleOutcome::Drained));
        assert_eq!(channel.position(&path), Some(23));

        // Unchanged file: zero new blocks, unchanged position.
        let again = channel.consume_path(&locks, &path).unwrap();
        assert_eq!(again.records, 0);
        assert_eq!(channel.position(&path), Some(23));
    }

    #[test]
    fn retryable_failure_leaves_position_then_redelivers() {
        let fx = Fixture::new();
        let path = fx.write("a.log", b"ok one\nok two\n");
        let mut channel = fx.channel(true, true, true, 0);
        let locks = fx.locks();

        fx.script
            .lock()
            .unwrap()
            .push_back(Delivery::failed_retryable("backend down"));

        let report = channel.consume_path(&locks, &path).unwrap();
        assert!(matches!(report.outcome, CycleOutcome::Throttled { .. }));
        assert_eq!(report.records, 0);
        assert_eq!(channel.position(&path), None);

        // While the throttle holds, the source is not consumed.
        let held = channel.consume_path(&locks, &path).unwrap();
        assert!(matches!(held.outcome, CycleOutcome::Throttled { .. }));

        std::thread::sleep(Duration::from_millis(400));
        let retry = channel.consume_path(&locks, &path).unwrap();
        assert_eq!(retry.records, 2);
        assert_eq!(channel.position(&path), Some(14));
        assert_eq!(*fx.delivered.lock().unwrap(), vec![2]);
    }

    #[test]
    fn permanent_failure_fails_cycle_and_keeps_position() {
        let fx = Fixture::new();
        let path = fx.write("a.log", b"ok one\n");
        let mut channel = fx.channel(true, true, true, 0);
        let locks = fx.locks();

        fx.script
            .lock()
            .unwrap()
            .push_back(Delivery::failed_permanent("rejected"));

        let report = channel.consume_path(&locks, &path).unwrap();
        assert!(report.failed());
        assert_eq!(channel.position(&path), None);
    }

    #[test]
    fn strict_slack_tolerates_exactly_k_errors() {
        let fx = Fixture::new();
        // Two malformed lines among good ones.
        let content = b"ok one\nbad line\nok two\nworse line\nok three\n";

        // slack = 2: both malformed blocks are skipped, file completes.
        let path = fx.write("a.log", content);
        let mut channel = fx.channel(true, true, true, 2);
        let report = channel.consume_path(&fx.locks(), &path).unwrap();
        assert!(matches!(report.outcome, CycleOutcome::Drained));
        assert_eq!(report.records, 3);
        assert_eq!(report.errors, 2);
        assert_eq!(channel.position(&path), Some(content.len() as u64));

        // slack = 1: the second malformed block fails the file for the cycle.
        let path2 = fx.write("b.log", content);
        let mut channel = fx.channel(false, true, true, 1);
        let report = channel.consume_path(&fx.locks(), &path2).unwrap();
        assert!(report.failed());
    }

    #[test]
    fn strict_disabled_means_unbounded_tolerance() {
        let fx = Fixture::new();
        let path = fx.write("a.log", b"bad\nbad\nbad\nok one\n");
        let mut channel = fx.channel(false, true, false, 0);
        let report = channel.consume_path(&fx.locks(), &path).unwrap();
        assert!(matches!(report.outcome, CycleOutcome::Drained));
        assert_eq!(report.records, 1);
        assert_eq!(report.errors, 3);
    }

    #[test]
    fn backfill_false_skips_preexisting_content() {
        let fx = Fixture::new();
        let path = fx.write("a.log", b"ok old\n");
        let mut channel = fx.channel(true, false, true, 0);
        let locks = fx.locks();

        let report = channel.consume_path(&locks, &path).unwrap();
        assert_eq!(report.records, 0);
        assert_eq!(channel.position(&path), Some(7));

        fx.append("a.log", b"ok new\n");
        let report = channel.consume_path(&locks, &path).unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(channel.position(&path), Some(14));
    }

    #[test]
    fn untracked_channel_replays_every_run() {
        let fx = Fixture::new();
        let path = fx.write("a.log", b"ok one\nok two\n");
        let mut channel = fx.channel(false, true, true, 0);
        let locks = fx.locks();

        assert_eq!(channel.consume_path(&locks, &path).unwrap().records, 2);
        assert_eq!(channel.consume_path(&locks, &path).unwrap().records, 2);
    }

    #[test]
    fn filtered_blocks_still_advance_position() {
        let fx = Fixture::new();
        let path = fx.write("a.log", b"ok one\nok two\n");
        let source = fx.source();
        let store =
            PositionStore::open(fx.dir.path().join("state").join("f.track.json")).unwrap();
        let sink = ScriptedSink {
            script: fx.script.clone(),
            delivered: fx.delivered.clone(),
        };
        let mut channel = Channel::new(
            "f",
            vec![source],
            DeliveryWrapper::new(Box::new(sink)),
            None,
            Some(crate::filter::Filter::parse("msg == nothing-matches").unwrap()),
            100,
            true,
            true,
            true,
            0,
            store,
            ThrottlePolicy::default(),
        );

        let report = channel.consume_path(&fx.locks(), &path).unwrap();
        assert_eq!(report.records, 0);
        assert_eq!(channel.position(&path), Some(14));
        assert!(fx.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn stream_consumption_matches_file_consumption() {
        let fx = Fixture::new();
        let data = b"ok one\nok two\nok three\n";
        let path = fx.write("a.log", data);

        let mut file_channel = fx.channel(true, true, true, 0);
        let file_report = file_channel.consume_path(&fx.locks(), &path).unwrap();

        let mut stream_channel = fx.channel(false, true, true, 0);
        let stream_report = stream_channel
            .consume_stream(std::io::Cursor::new(&data[..]))
            .unwrap();

        assert_eq!(file_report.records, stream_report.records);
        assert_eq!(file_report.bytes, stream_report.bytes);
        assert_eq!(stream_report.path, STDIN_PATH);
        assert_eq!(stream_channel.position(Path::new(STDIN_PATH)), None);
    }

    #[test]
    fn throttle_backs_off_and_caps() {
        let mut throttle = Throttle::new(
            Duration::from_millis(100),
            1,
            Duration::from_millis(250),
        );
        let first = throttle.trip();
        let second = throttle.trip();
        let third = throttle.trip();
        // Durations grow then cap; jitter stays within ±25%.
        assert!(first <= Duration::from_millis(125));
        assert!(second >= first || second >= Duration::from_millis(150));
        assert!(third <= Duration::from_millis(313));
        assert!(throttle.active());

        throttle.reset();
        assert!(!throttle.active());
    }
}

