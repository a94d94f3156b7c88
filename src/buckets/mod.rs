/*
 * Copyright (C) 2026 the scuttle authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod aggregate;
pub mod dechunk;
pub mod limit;
pub mod logwrap;
pub mod response;
pub mod simple;
pub mod socket;

pub use aggregate::AggregateBucket;
pub use dechunk::DechunkBucket;
pub use limit::LimitBucket;
pub use logwrap::LogWrapBucket;
pub use response::{HeaderSet, ResponseBucket, StatusLine};
pub use simple::SimpleBucket;
pub use socket::SocketBucket;

use crate::arena::BucketAlloc;
use crate::error::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::io::IoSlice;
use std::ops::BitOr;

/// Sentinel for "all readily available bytes".
pub const READ_ALL: usize = usize::MAX;

/// The limit on the length of a line in a status line or header.
pub const LINE_LIMIT: usize = 8000;

/// Status accompanying the data of a successful read-family call. EAGAIN is
/// not a state; it travels as [`Error::again`]. `Eof` may be delivered
/// together with the final bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    More,
    Eof,
}

/// What terminated the slice returned by `readline`. `CrlfSplit` means the
/// slice ends with a lone CR and the possibly-following LF was not yet
/// readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnd {
    None,
    Cr,
    Lf,
    Crlf,
    CrlfSplit,
}

/// Set of line endings acceptable to `readline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Newline(u8);

impl Newline {
    pub const CR: Newline = Newline(0b001);
    pub const LF: Newline = Newline(0b010);
    pub const CRLF: Newline = Newline(0b100);
    pub const ANY: Newline = Newline(0b111);

    pub fn contains(self, other: Newline) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Newline {
    type Output = Newline;

    fn bitor(self, rhs: Newline) -> Newline {
        Newline(self.0 | rhs.0)
    }
}

/// Scans `data` for the earliest acceptable terminator. Returns the number
/// of bytes belonging to the line, including the terminator bytes (for
/// `CrlfSplit`, including the trailing CR), and what was found.
pub fn find_line_end(data: &[u8], accept: Newline) -> (usize, LineEnd) {
    let mut i = 0;

    while i < data.len() {
        match data[i] {
            b'\n' if accept.contains(Newline::LF) => return (i + 1, LineEnd::Lf),
            b'\r' => {
                if accept.contains(Newline::CRLF) {
                    if i + 1 == data.len() {
                        // can't tell CR from CRLF yet
                        return (i + 1, LineEnd::CrlfSplit);
                    }

                    if data[i + 1] == b'\n' {
                        return (i + 2, LineEnd::Crlf);
                    }
                }

                if accept.contains(Newline::CR) {
                    return (i + 1, LineEnd::Cr);
                }
            }
            _ => {}
        }

        i += 1;
    }

    (data.len(), LineEnd::None)
}

/// Identifies concrete bucket kinds for `read_bucket` introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Simple,
    Aggregate,
    Socket,
    LogWrap,
    Limit,
    Dechunk,
    Response,
    External(&'static str),
}

/// The fields every bucket record carries: the allocator it was obtained
/// from and its (lazily created) metadata table. Dropping the core releases
/// the record through the allocator.
pub struct BucketCore {
    alloc: BucketAlloc,
    metadata: Option<HashMap<(String, String), String>>,
}

impl BucketCore {
    pub fn new(alloc: &BucketAlloc) -> Self {
        alloc.charge();

        Self {
            alloc: alloc.clone(),
            metadata: None,
        }
    }

    pub fn alloc(&self) -> &BucketAlloc {
        &self.alloc
    }

    pub fn metadata(&self, md_type: &str, name: &str) -> Option<&str> {
        let md = self.metadata.as_ref()?;

        md.get(&(md_type.to_string(), name.to_string()))
            .map(|v| v.as_str())
    }

    pub fn set_metadata(&mut self, md_type: &str, name: &str, value: &str) {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert((md_type.to_string(), name.to_string()), value.to_string());
    }
}

impl Drop for BucketCore {
    fn drop(&mut self) {
        self.alloc.discharge();
    }
}

pub type BoxBucket = Box<dyn Bucket>;

/// A polymorphic, pull-based byte stream. Reading is destructive; the
/// returned slice is owned by the bucket and valid until the next call on
/// it. Once a bucket reports `Eof` the owner must drop it.
pub trait Bucket {
    fn kind(&self) -> BucketKind;

    fn core(&self) -> &BucketCore;

    fn core_mut(&mut self) -> &mut BucketCore;

    /// Returns up to `requested` bytes ([`READ_ALL`] for "whatever is
    /// ready"). May return fewer.
    fn read(&mut self, requested: usize) -> Result<(&[u8], ReadState)>;

    /// Returns bytes up to and including the next acceptable terminator.
    fn readline(&mut self, accept: Newline) -> Result<(&[u8], LineEnd, ReadState)>;

    /// Non-destructive view of readily available bytes.
    fn peek(&mut self) -> Result<(&[u8], ReadState)>;

    fn read_iovec<'a>(
        &'a mut self,
        requested: usize,
        vecs: &mut Vec<IoSlice<'a>>,
    ) -> Result<ReadState> {
        let (data, state) = self.read(requested)?;

        if !data.is_empty() {
            vecs.push(IoSlice::new(data));
        }

        Ok(state)
    }

    fn read_for_sendfile(&mut self, requested: usize) -> Result<(&[u8], ReadState)> {
        self.read(requested)
    }

    /// Detaches and returns the nested input bucket of the requested kind,
    /// if this bucket has one. The engine uses this to reclaim the
    /// connection's stream bucket from a finished response.
    fn read_bucket(&mut self, kind: BucketKind) -> Option<BoxBucket> {
        let _ = kind;

        None
    }

    fn get_metadata(&self, md_type: &str, name: &str) -> Option<&str> {
        self.core().metadata(md_type, name)
    }

    fn set_metadata(&mut self, md_type: &str, name: &str, value: &str) {
        self.core_mut().set_metadata(md_type, name, value);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    Empty,
    Ready,
    Partial,
    CrlfSplit,
}

/// Accumulates one line from an input bucket across arbitrarily fragmented
/// reads, tolerating a CRLF split over two chunks. Shared by the response
/// parser and the chunked decoder.
pub(crate) struct LineAccumulator {
    line: Vec<u8>,
    state: LineState,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            state: LineState::Empty,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == LineState::Ready
    }

    /// The completed line, without its terminator. Valid while `is_ready`.
    pub fn line(&self) -> &[u8] {
        &self.line
    }

    /// Drives toward a complete line. A previously completed line is
    /// considered consumed by the caller and reset. Returns the input's
    /// status; callers check `is_ready` to see whether a line completed.
    /// EAGAIN and EOF propagate as-is.
    pub fn fetch(&mut self, input: &mut dyn Bucket) -> Result<ReadState> {
        if self.state == LineState::Ready {
            self.state = LineState::Empty;
            self.line.clear();
        }

        loop {
            if self.state == LineState::CrlfSplit {
                // the previous read ended in a lone CR. A single byte
                // decides whether that CR terminated the line by itself
                // or as the first half of a CRLF.
                let (data, state) = input.peek()?;

                if !data.is_empty() {
                    let eat = data[0] == b'\n';

                    if eat {
                        input.read(1)?;
                    }

                    self.state = LineState::Ready;
                    return Ok(ReadState::More);
                }

                match state {
                    // the CR was the last byte of the stream
                    ReadState::Eof => {
                        self.state = LineState::Ready;
                        return Ok(ReadState::Eof);
                    }
                    ReadState::More => return Err(Error::again()),
                }
            }

            let (data, end, state) = input.readline(Newline::ANY)?;

            let keep = match end {
                LineEnd::None => {
                    self.state = LineState::Partial;
                    data.len()
                }
                LineEnd::CrlfSplit => {
                    self.state = LineState::CrlfSplit;

                    // toss the partial CR, we won't need it
                    data.len() - 1
                }
                LineEnd::Cr | LineEnd::Lf => {
                    self.state = LineState::Ready;
                    data.len() - 1
                }
                LineEnd::Crlf => {
                    self.state = LineState::Ready;
                    data.len() - 2
                }
            };

            if self.line.len() + keep > LINE_LIMIT {
                return Err(Error::LineTooLong);
            }

            self.line.extend_from_slice(&data[..keep]);

            if self.state == LineState::Ready {
                return Ok(state);
            }

            // on EOF a pending CRLF split still resolves above: the empty
            // peek turns the lone CR into the line's terminator
            if state == ReadState::Eof && self.state != LineState::CrlfSplit {
                return Ok(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Scope;

    #[test]
    fn newline_sets() {
        assert!(Newline::ANY.contains(Newline::CR));
        assert!(Newline::ANY.contains(Newline::CRLF));
        assert!(!(Newline::CR | Newline::LF).contains(Newline::CRLF));
    }

    #[test]
    fn line_end_scanning() {
        assert_eq!(find_line_end(b"abc\ndef", Newline::ANY), (4, LineEnd::Lf));
        assert_eq!(find_line_end(b"abc\r\ndef", Newline::ANY), (5, LineEnd::Crlf));
        assert_eq!(find_line_end(b"abc\rdef", Newline::ANY), (4, LineEnd::Cr));
        assert_eq!(
            find_line_end(b"abc\r", Newline::ANY),
            (4, LineEnd::CrlfSplit)
        );
        assert_eq!(find_line_end(b"abcdef", Newline::ANY), (6, LineEnd::None));
        assert_eq!(find_line_end(b"", Newline::ANY), (0, LineEnd::None));

        // a lone CR is not a terminator when only LF is accepted
        assert_eq!(
            find_line_end(b"abc\rdef\n", Newline::LF),
            (8, LineEnd::Lf)
        );

        // CR at end of buffer with CRLF not accepted
        assert_eq!(find_line_end(b"abc\r", Newline::CR), (4, LineEnd::Cr));
    }

    #[test]
    fn cr_terminated_line_at_end_of_stream() {
        // a lone CR as the stream's last byte terminates the line
        let scope = Scope::new();
        let alloc = crate::arena::BucketAlloc::new(&scope);

        let mut b = SimpleBucket::from_static(b"abc\r", &alloc);
        let mut lines = LineAccumulator::new();

        let state = lines.fetch(&mut b).unwrap();
        assert!(lines.is_ready());
        assert_eq!(lines.line(), b"abc");
        assert_eq!(state, ReadState::Eof);
    }

    #[test]
    fn metadata_round_trip() {
        let scope = Scope::new();
        let alloc = crate::arena::BucketAlloc::new(&scope);

        let mut b = SimpleBucket::from_static(b"x", &alloc);
        assert_eq!(b.get_metadata("http", "charset"), None);

        b.set_metadata("http", "charset", "utf-8");
        assert_eq!(b.get_metadata("http", "charset"), Some("utf-8"));
        assert_eq!(b.get_metadata("http", "other"), None);
        assert_eq!(b.get_metadata("mime", "charset"), None);
    }

    #[test]
    fn default_read_iovec() {
        let scope = Scope::new();
        let alloc = crate::arena::BucketAlloc::new(&scope);

        let mut b = SimpleBucket::from_static(b"hello", &alloc);
        let mut vecs = Vec::new();

        let state = b.read_iovec(READ_ALL, &mut vecs).unwrap();
        assert_eq!(state, ReadState::Eof);
        assert_eq!(vecs.len(), 1);
        assert_eq!(&*vecs[0], b"hello");
    }
}
