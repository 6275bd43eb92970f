// SPDX-License-Identifier: Apache-2.0

//! Block boundary detection.
//!
//! A block is one delimited entry in a file's byte stream. Boundaries are
//! described either by a full-entry pattern (every match is a block) or by a
//! prefix marker (a match begins a block which runs to the next marker).
//! The splitter buffers the unmatched remainder between reads so a read
//! boundary falling inside an entry never produces a truncated block.

use std::borrow::Cow;
use std::sync::Arc;

use regex::bytes::Regex;

/// How a source's byte stream is divided into blocks.
#[derive(Debug, Clone)]
pub enum BoundaryRule {
    /// Every match of the pattern is one block, spanning its matched span.
    Entry(Regex),
    /// A match marks the start of a block; the block runs to the byte before
    /// the next match, or to end-of-data once no more data can follow.
    Prefix(Regex),
}

/// One delimited entry with its byte range, `begin < end`.
#[derive(Debug, Clone)]
pub struct Block {
    pub path: Arc<str>,
    pub begin: u64,
    pub end: u64,
    pub raw: Vec<u8>,
}

impl Block {
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn raw_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }
}

/// Output of one `Splitter::feed` call, in file order.
#[derive(Debug)]
pub enum SplitItem {
    Block(Block),
    /// Bytes that never matched a boundary. Counted against strict slack.
    Skipped { begin: u64, end: u64 },
    /// Pending bytes exceeded the buffer cap without a boundary and were
    /// discarded. Counted against strict slack.
    Overflow { begin: u64, end: u64 },
}

/// Incremental block splitter over an append-only byte stream.
///
/// Feed chunks in file order; complete blocks come back with byte-exact,
/// strictly increasing, non-overlapping spans. A trailing partial entry is
/// held back until the caller reports end-of-data.
pub struct Splitter {
    path: Arc<str>,
    rule: BoundaryRule,
    buffer_size: usize,
    buf: Vec<u8>,
    /// Absolute file offset of `buf[0]`.
    pos: u64,
}

impl Splitter {
    pub fn new(path: Arc<str>, rule: BoundaryRule, buffer_size: usize, start_offset: u64) -> Self {
        Self {
            path,
            rule,
            buffer_size,
            buf: Vec::new(),
            pos: start_offset,
        }
    }

    /// Bytes currently held pending a boundary.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Absolute offset of the first unconsumed byte.
    pub fn offset(&self) -> u64 {
        self.pos
    }

    /// Feed the next chunk. `at_eof` means no further data can follow in this
    /// drain, allowing the final entry to be emitted.
    pub fn feed(&mut self, chunk: &[u8], at_eof: bool) -> Vec<SplitItem> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        match &self.rule {
            BoundaryRule::Entry(re) => {
                let re = re.clone();
                self.split_entry(&re, at_eof, &mut out);
            }
            BoundaryRule::Prefix(re) => {
                let re = re.clone();
                self.split_prefix(&re, at_eof, &mut out);
            }
        }
        if !at_eof && self.buf.len() >= self.buffer_size {
            let begin = self.pos;
            let end = self.pos + self.buf.len() as u64;
            self.pos = end;
            self.buf.clear();
            out.push(SplitItem::Overflow { begin, end });
        }
        out
    }

    fn block(&self, begin: usize, end: usize) -> Block {
        Block {
            path: self.path.clone(),
            begin: self.pos + begin as u64,
            end: self.pos + end as u64,
            raw: self.buf[begin..end].to_vec(),
        }
    }

    fn skipped(&self, begin: usize, end: usize) -> SplitItem {
        SplitItem::Skipped {
            begin: self.pos + begin as u64,
            end: self.pos + end as u64,
        }
    }

    fn advance(&mut self, consumed: usize) {
        if consumed > 0 {
            self.buf.drain(..consumed);
            self.pos += consumed as u64;
        }
    }

    fn split_entry(&mut self, re: &Regex, at_eof: bool, out: &mut Vec<SplitItem>) {
        let mut consumed = 0usize;
        loop {
            let m = match re.find(&self.buf[consumed..]) {
                Some(m) => m,
                None => {
                    if at_eof && consumed < self.buf.len() {
                        out.push(self.skipped(consumed, self.buf.len()));
                        consumed = self.buf.len();
                    }
                    break;
                }
            };
            let (begin, end) = (consumed + m.start(), consumed + m.end());
            if begin == end {
                // Zero-width match cannot delimit an entry; step past it.
                consumed = end + 1;
                if consumed >= self.buf.len() {
                    consumed = self.buf.len();
                    break;
                }
                continue;
            }
            if end == self.buf.len() && !at_eof {
                // More data may extend this match; hold it back, but the gap
                // before it is bounded and will never match.
                if begin > consumed {
                    out.push(self.skipped(consumed, begin));
                }
                consumed = begin;
                break;
            }
            if begin > consumed {
                out.push(self.skipped(consumed, begin));
            }
            out.push(SplitItem::Block(self.block(begin, end)));
            consumed = end;
        }
        self.advance(consumed);
    }

    fn split_prefix(&mut self, re: &Regex, at_eof: bool, out: &mut Vec<SplitItem>) {
        let consumed;
        match re.find(&self.buf) {
            None => {
                if at_eof && !self.buf.is_empty() {
                    out.push(self.skipped(0, self.buf.len()));
                    consumed = self.buf.len();
                } else {
                    consumed = 0;
                }
            }
            Some(first) => {
                let mut block_start = first.start();
                if block_start > 0 {
                    out.push(self.skipped(0, block_start));
                }
                loop {
                    let search_from = block_start + 1;
                    let next = if search_from < self.buf.len() {
                        re.find(&self.buf[search_from..])
                            .map(|m| search_from + m.start())
                    } else {
                        None
                    };
                    match next {
                        Some(next_start) => {
                            out.push(SplitItem::Block(self.block(block_start, next_start)));
                            block_start = next_start;
                        }
                        None => {
                            if at_eof {
                                if block_start < self.buf.len() {
                                    out.push(SplitItem::Block(
                                        self.block(block_start, self.buf.len()),
                                    ));
                                }
                                consumed = self.buf.len();
                            } else {
                                consumed = block_start;
                            }
                            break;
                        }
                    }
                }
            }
        }
        self.advance(consumed);
    }
}
