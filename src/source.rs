// SPDX-License-Identifier: Apache-2.0

//! Sources: which files to watch and how to split them into blocks.
//!
//! A source is immutable after load. Its globs are resolved against the
//! filesystem at schedule time, not once at startup, so files created later
//! are picked up. `blocks` drains a reader to its current end-of-file as a
//! lazy sequence; a later drain from the stored offset resumes
//! deterministically.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::glob;
use regex::bytes::Regex;
use tracing::debug;

use crate::block::{BoundaryRule, SplitItem, Splitter};
use crate::error::{Error, Result};
use crate::form::CompiledForm;

/// Path label given to standard-input streams. Stream sources behave exactly
/// like file sources except that no position is persisted for them.
pub const STDIN_PATH: &str = "<stdin>";

pub struct Source {
    name: String,
    globs: Vec<String>,
    matchers: Vec<glob::Pattern>,
    rule: BoundaryRule,
    pattern: Regex,
    form: CompiledForm,
    read_size: usize,
    buffer_size: usize,
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        globs: Vec<String>,
        rule: BoundaryRule,
        pattern: Regex,
        form: CompiledForm,
        read_size: usize,
        buffer_size: usize,
    ) -> Result<Self> {
        let mut matchers = Vec::with_capacity(globs.len());
        for g in &globs {
            matchers.push(
                glob::Pattern::new(g).map_err(|e| Error::InvalidGlob(format!("{g}: {e}")))?,
            );
        }
        if buffer_size < read_size {
            return Err(Error::Config(format!(
                "source buffer_size {buffer_size} must be >= read_size {read_size}"
            )));
        }
        Ok(Self {
            name: name.into(),
            globs,
            matchers,
            rule,
            pattern,
            form,
            read_size,
            buffer_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn globs(&self) -> &[String] {
        &self.globs
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn form(&self) -> &CompiledForm {
        &self.form
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Whether this source considers `path` one of its files.
    pub fn matches(&self, path: &Path) -> bool {
        self.matchers.iter().any(|m| m.matches_path(path))
    }

    /// Expand the globs against the filesystem right now. Directories are
    /// skipped and duplicates across overlapping globs removed.
    pub fn resolve_files(&self) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        for pattern in &self.globs {
            let matches =
                glob(pattern).map_err(|e| Error::InvalidGlob(format!("{pattern}: {e}")))?;
            for entry in matches {
                let path = entry.map_err(|e| Error::Io(e.into_error()))?;
                if path.is_dir() {
                    continue;
                }
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }
        debug!(source = %self.name, files = paths.len(), "resolved globs");
        Ok(paths)
    }

    /// Open `path` positioned at `from`, ready for one drain.
    pub fn open(&self, path: &Path, from: u64) -> Result<BlockStream<File>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(from))?;
        let label: Arc<str> = Arc::from(path.to_string_lossy().as_ref());
        Ok(self.blocks(file, label, from))
    }

    /// Lazy, finite, restartable block sequence over any reader. The
    /// sequence drains to the reader's current end and stops; a later call
    /// starting at the stored offset produces the same remaining blocks.
    pub fn blocks<R: Read>(&self, reader: R, path: Arc<str>, from: u64) -> BlockStream<R> {
        BlockStream {
            reader,
            splitter: Splitter::new(path, self.rule.clone(), self.buffer_size, from),
            read_size: self.read_size,
            queue: VecDeque::new(),
            done: false,
        }
    }
}

/// One drain of a reader: bounded physical reads feeding the splitter.
pub struct BlockStream<R> {
    reader: R,
    splitter: Splitter,
    read_size: usize,
    queue: VecDeque<SplitItem>,
    done: bool,
}

impl<R: Read> Iterator for BlockStream<R> {
    type Item = io::Result<SplitItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            let mut chunk = vec![0u8; self.read_size];
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.done = true;
                    self.queue.extend(self.splitter.feed(&[], true));
                }
                Ok(n) => {
                    self.queue.extend(self.splitter.feed(&chunk[..n], false));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
