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
use crate::buckets::{BoxBucket, Bucket, BucketCore, BucketKind, LineEnd, Newline, ReadState};
use crate::error::Result;
use log::trace;
use std::any::Any;

/// Transparent wrapper that records what flows through it at trace level.
/// The connection wraps its socket bucket with one labelled "receiving raw".
pub struct LogWrapBucket {
    core: BucketCore,
    label: &'static str,
    inner: Option<BoxBucket>,
}

impl LogWrapBucket {
    pub fn new(label: &'static str, inner: BoxBucket, alloc: &BucketAlloc) -> Self {
        Self {
            core: BucketCore::new(alloc),
            label,
            inner: Some(inner),
        }
    }

    fn inner_mut(&mut self) -> Option<&mut (dyn Bucket + 'static)> {
        // None after the inner bucket was detached; the stream is over
        // from this wrapper's point of view
        self.inner.as_mut().map(|b| b.as_mut())
    }
}

impl Bucket for LogWrapBucket {
    fn kind(&self) -> BucketKind {
        BucketKind::LogWrap
    }

    fn core(&self) -> &BucketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BucketCore {
        &mut self.core
    }

    fn read(&mut self, requested: usize) -> Result<(&[u8], ReadState)> {
        let label = self.label;

        let Some(inner) = self.inner_mut() else {
            return Ok((&[], ReadState::Eof));
        };

        match inner.read(requested) {
            Ok((data, state)) => {
                trace!("{}: {} bytes ({:?})", label, data.len(), state);
                Ok((data, state))
            }
            Err(e) => {
                if e.is_again() {
                    trace!("{}: EAGAIN", label);
                }

                Err(e)
            }
        }
    }

    fn readline(&mut self, accept: Newline) -> Result<(&[u8], LineEnd, ReadState)> {
        let label = self.label;

        let Some(inner) = self.inner_mut() else {
            return Ok((&[], LineEnd::None, ReadState::Eof));
        };

        match inner.readline(accept) {
            Ok((data, end, state)) => {
                trace!("{}: {} bytes, {:?} ({:?})", label, data.len(), end, state);
                Ok((data, end, state))
            }
            Err(e) => {
                if e.is_again() {
                    trace!("{}: EAGAIN", label);
                }

                Err(e)
            }
        }
    }

    fn peek(&mut self) -> Result<(&[u8], ReadState)> {
        match self.inner_mut() {
            Some(inner) => inner.peek(),
            None => Ok((&[], ReadState::Eof)),
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
    use crate::buckets::{SimpleBucket, READ_ALL};

    #[test]
    fn passes_through() {
        let alloc = BucketAlloc::new(&Scope::new());
        let inner = Box::new(SimpleBucket::from_static(b"abc", &alloc));
        let mut wrap = LogWrapBucket::new("test", inner, &alloc);

        let (data, state) = wrap.read(READ_ALL).unwrap();
        assert_eq!(data, b"abc");
        assert_eq!(state, ReadState::Eof);
    }

    #[test]
    fn detaches_inner() {
        let alloc = BucketAlloc::new(&Scope::new());
        let inner = Box::new(SimpleBucket::from_static(b"abc", &alloc));
        let mut wrap = LogWrapBucket::new("test", inner, &alloc);

        let detached = wrap.read_bucket(BucketKind::Simple);
        assert!(detached.is_some());
        assert!(wrap.read_bucket(BucketKind::Simple).is_none());
    }
}
