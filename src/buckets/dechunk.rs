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

use crate::arena::BucketAlloc;
use crate::buckets::{
    find_line_end, BoxBucket, Bucket, BucketCore, BucketKind, LineAccumulator, LineEnd, Newline,
    ReadState, READ_ALL,
};
use crate::error::{Error, Result};
use std::any::Any;
use std::cmp;
use std::str;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DechunkState {
    /// Reading a chunk-size line.
    Size,
    /// Passing through the current chunk's data.
    Chunk,
    /// Consuming the CRLF that follows a chunk's data.
    AfterChunk,
    /// Consuming trailer lines after the terminating 0 chunk.
    Trailer,
    Done,
}

/// Incremental Transfer-Encoding: chunked decoder. Emits the dechunked body
/// bytes; the terminating 0 chunk and the trailing blank line are consumed
/// from the inner stream before `Eof` is reported.
pub struct DechunkBucket {
    core: BucketCore,
    inner: Option<BoxBucket>,
    state: DechunkState,
    chunk_left: u64,
    lines: LineAccumulator,
}

impl DechunkBucket {
    pub fn new(inner: BoxBucket, alloc: &BucketAlloc) -> Self {
        Self {
            core: BucketCore::new(alloc),
            inner: Some(inner),
            state: DechunkState::Size,
            chunk_left: 0,
            lines: LineAccumulator::new(),
        }
    }

    /// Completes one framing line. EAGAIN propagates; an inner stream that
    /// ends mid-line is a truncation.
    fn fetch_line(&mut self) -> Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(Error::TruncatedStream);
        };

        self.lines.fetch(inner.as_mut())?;

        if !self.lines.is_ready() {
            return Err(Error::TruncatedStream);
        }

        Ok(())
    }

    /// Parses a chunk-size line, ignoring any chunk extension.
    fn parse_size(line: &[u8]) -> Result<u64> {
        let digits = match line.iter().position(|&b| b == b';') {
            Some(p) => &line[..p],
            None => line,
        };

        let digits = str::from_utf8(digits)
            .map_err(|_| Error::BadHttpResponse)?
            .trim();

        u64::from_str_radix(digits, 16).map_err(|_| Error::BadHttpResponse)
    }

    /// Advances the framing machine until chunk data is available or the
    /// stream is done. Leaves `state` at `Chunk` or `Done`.
    fn advance(&mut self) -> Result<()> {
        loop {
            match self.state {
                DechunkState::Chunk | DechunkState::Done => return Ok(()),
                DechunkState::Size => {
                    self.fetch_line()?;

                    let size = Self::parse_size(self.lines.line())?;

                    if size == 0 {
                        self.state = DechunkState::Trailer;
                    } else {
                        self.chunk_left = size;
                        self.state = DechunkState::Chunk;
                    }
                }
                DechunkState::AfterChunk => {
                    self.fetch_line()?;

                    if !self.lines.line().is_empty() {
                        return Err(Error::BadHttpResponse);
                    }

                    self.state = DechunkState::Size;
                }
                DechunkState::Trailer => {
                    self.fetch_line()?;

                    if self.lines.line().is_empty() {
                        self.state = DechunkState::Done;
                    }
                }
            }
        }
    }

    fn capped(&self, requested: usize) -> usize {
        let left = usize::try_from(self.chunk_left).unwrap_or(usize::MAX);

        if requested == READ_ALL {
            left
        } else {
            cmp::min(requested, left)
        }
    }
}

impl Bucket for DechunkBucket {
    fn kind(&self) -> BucketKind {
        BucketKind::Dechunk
    }

    fn core(&self) -> &BucketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BucketCore {
        &mut self.core
    }

    fn read(&mut self, requested: usize) -> Result<(&[u8], ReadState)> {
        self.advance()?;

        if self.state == DechunkState::Done {
            return Ok((&[], ReadState::Eof));
        }

        let want = self.capped(requested);

        let Some(inner) = self.inner.as_mut() else {
            return Err(Error::TruncatedStream);
        };

        let (data, inner_state) = inner.read(want)?;

        if data.is_empty() && inner_state == ReadState::Eof {
            return Err(Error::TruncatedStream);
        }

        self.chunk_left -= data.len() as u64;

        if self.chunk_left == 0 {
            self.state = DechunkState::AfterChunk;
        }

        // Eof waits until the terminating chunk and trailer are consumed
        Ok((data, ReadState::More))
    }

    fn readline(&mut self, accept: Newline) -> Result<(&[u8], LineEnd, ReadState)> {
        self.advance()?;

        if self.state == DechunkState::Done {
            return Ok((&[], LineEnd::None, ReadState::Eof));
        }

        let chunk_left = self.chunk_left;

        let Some(inner) = self.inner.as_mut() else {
            return Err(Error::TruncatedStream);
        };

        let (avail, _) = inner.peek()?;
        let visible = cmp::min(avail.len() as u64, chunk_left) as usize;
        let (scan_len, _) = find_line_end(&avail[..visible], accept);

        let (data, inner_state) = inner.read(cmp::max(scan_len, 1))?;

        if data.is_empty() && inner_state == ReadState::Eof {
            return Err(Error::TruncatedStream);
        }

        let (_, end) = find_line_end(data, accept);

        self.chunk_left -= data.len() as u64;

        if self.chunk_left == 0 {
            self.state = DechunkState::AfterChunk;
        }

        Ok((data, end, ReadState::More))
    }

    fn peek(&mut self) -> Result<(&[u8], ReadState)> {
        match self.state {
            DechunkState::Done => Ok((&[], ReadState::Eof)),
            DechunkState::Chunk => {
                let chunk_left = self.chunk_left;

                let Some(inner) = self.inner.as_mut() else {
                    return Err(Error::TruncatedStream);
                };

                let (data, _) = inner.peek()?;
                let visible = cmp::min(data.len() as u64, chunk_left) as usize;

                Ok((&data[..visible], ReadState::More))
            }
            // framing lines are consumed destructively; nothing to show yet
            _ => Ok((&[], ReadState::More)),
        }
    }

    fn read_bucket(&mut self, kind: BucketKind) -> Option<BoxBucket> {
        if self
            .inner
            .as_ref()
            .is_some_and(|inner| inner.kind() == kind)
        {
            return self.inner.take();
        }

        self.inner.as_mut()?.read_bucket(kind)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Scope;
    use crate::buckets::SimpleBucket;

    fn alloc() -> BucketAlloc {
        BucketAlloc::new(&Scope::new())
    }

    fn drain(b: &mut dyn Bucket) -> Vec<u8> {
        let mut out = Vec::new();

        loop {
            let (data, state) = b.read(READ_ALL).unwrap();
            out.extend_from_slice(data);

            if state == ReadState::Eof {
                return out;
            }
        }
    }

    #[test]
    fn single_chunk() {
        let alloc = alloc();
        let inner = Box::new(SimpleBucket::from_static(b"5\r\nhello\r\n0\r\n\r\n", &alloc));
        let mut d = DechunkBucket::new(inner, &alloc);

        assert_eq!(drain(&mut d), b"hello");
    }

    #[test]
    fn multiple_chunks_and_extension() {
        let alloc = alloc();
        let inner = Box::new(SimpleBucket::from_static(
            b"3;ext=1\r\nabc\r\nA\r\n0123456789\r\n0\r\n\r\n",
            &alloc,
        ));
        let mut d = DechunkBucket::new(inner, &alloc);

        assert_eq!(drain(&mut d), b"abc0123456789");
    }

    #[test]
    fn trailers_are_consumed() {
        let alloc = alloc();
        let inner = Box::new(SimpleBucket::from_static(
            b"2\r\nhi\r\n0\r\nX-Trailer: v\r\n\r\n",
            &alloc,
        ));
        let mut d = DechunkBucket::new(inner, &alloc);

        assert_eq!(drain(&mut d), b"hi");

        // residual framing bytes all consumed from the inner stream
        let mut inner = d.read_bucket(BucketKind::Simple).unwrap();
        let (rest, _) = inner.read(READ_ALL).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn bad_size_line() {
        let alloc = alloc();
        let inner = Box::new(SimpleBucket::from_static(b"zz\r\nhello", &alloc));
        let mut d = DechunkBucket::new(inner, &alloc);

        let err = d.read(READ_ALL).unwrap_err();
        assert!(matches!(err, Error::BadHttpResponse));
    }

    #[test]
    fn truncated_mid_chunk() {
        let alloc = alloc();
        let inner = Box::new(SimpleBucket::from_static(b"5\r\nab", &alloc));
        let mut d = DechunkBucket::new(inner, &alloc);

        let (data, _) = d.read(READ_ALL).unwrap();
        assert_eq!(data, b"ab");

        let err = d.read(READ_ALL).unwrap_err();
        assert!(matches!(err, Error::TruncatedStream));
    }
}
