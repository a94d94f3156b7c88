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
    find_line_end, BoxBucket, Bucket, BucketCore, BucketKind, LineEnd, Newline, ReadState,
    READ_ALL,
};
use crate::error::{Error, Result};
use std::any::Any;
use std::cmp;

/// Passes through exactly `limit` bytes of the inner stream, then reports
/// `Eof`. Frames a Content-Length body over the connection's stream bucket.
/// If the inner stream ends before the limit is reached the read fails with
/// a truncated-stream error.
pub struct LimitBucket {
    core: BucketCore,
    inner: Option<BoxBucket>,
    remaining: u64,
}

impl LimitBucket {
    pub fn new(inner: BoxBucket, limit: u64, alloc: &BucketAlloc) -> Self {
        Self {
            core: BucketCore::new(alloc),
            inner: Some(inner),
            remaining: limit,
        }
    }

    fn capped(&self, requested: usize) -> usize {
        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);

        if requested == READ_ALL {
            remaining
        } else {
            cmp::min(requested, remaining)
        }
    }
}

impl Bucket for LimitBucket {
    fn kind(&self) -> BucketKind {
        BucketKind::Limit
    }

    fn core(&self) -> &BucketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BucketCore {
        &mut self.core
    }

    fn read(&mut self, requested: usize) -> Result<(&[u8], ReadState)> {
        if self.remaining == 0 {
            return Ok((&[], ReadState::Eof));
        }

        let want = self.capped(requested);

        let Some(inner) = self.inner.as_mut() else {
            return Err(Error::TruncatedStream);
        };

        let (data, inner_state) = inner.read(want)?;

        self.remaining -= data.len() as u64;

        let state = if self.remaining == 0 {
            ReadState::Eof
        } else if inner_state == ReadState::Eof {
            if data.is_empty() {
                // the server promised more bytes than it delivered
                return Err(Error::TruncatedStream);
            }

            // hand over the final bytes; the next read, finding the inner
            // stream exhausted, reports the truncation
            ReadState::More
        } else {
            ReadState::More
        };

        Ok((data, state))
    }

    fn readline(&mut self, accept: Newline) -> Result<(&[u8], LineEnd, ReadState)> {
        if self.remaining == 0 {
            return Ok((&[], LineEnd::None, ReadState::Eof));
        }

        let remaining = self.remaining;

        let Some(inner) = self.inner.as_mut() else {
            return Err(Error::TruncatedStream);
        };

        // scan within the framed window, then consume exactly that much
        let (avail, _) = inner.peek()?;
        let visible = cmp::min(avail.len() as u64, remaining) as usize;
        let (scan_len, _) = find_line_end(&avail[..visible], accept);

        let (data, inner_state) = inner.read(cmp::max(scan_len, 1))?;
        let (_, end) = find_line_end(data, accept);

        self.remaining -= data.len() as u64;

        let state = if self.remaining == 0 {
            ReadState::Eof
        } else if inner_state == ReadState::Eof {
            if data.is_empty() {
                return Err(Error::TruncatedStream);
            }

            ReadState::More
        } else {
            ReadState::More
        };

        Ok((data, end, state))
    }

    fn peek(&mut self) -> Result<(&[u8], ReadState)> {
        if self.remaining == 0 {
            return Ok((&[], ReadState::Eof));
        }

        let remaining = self.remaining;

        let Some(inner) = self.inner.as_mut() else {
            return Err(Error::TruncatedStream);
        };

        let (data, _) = inner.peek()?;
        let visible = cmp::min(data.len() as u64, remaining) as usize;

        let state = if visible as u64 == remaining {
            ReadState::Eof
        } else {
            ReadState::More
        };

        Ok((&data[..visible], state))
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
