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
use crate::error::{Error, Result};
use std::any::Any;
use std::collections::VecDeque;

/// Concatenates a FIFO of buckets into one stream. Used to compose a
/// request from request-line, header and body buckets.
///
/// A front bucket that reports `Eof` together with its final bytes stays in
/// place until the next call, so the returned view remains valid for the
/// caller.
pub struct AggregateBucket {
    core: BucketCore,
    list: VecDeque<BoxBucket>,
    front_done: bool,
}

impl AggregateBucket {
    pub fn new(alloc: &BucketAlloc) -> Self {
        Self {
            core: BucketCore::new(alloc),
            list: VecDeque::new(),
            front_done: false,
        }
    }

    pub fn append(&mut self, bucket: BoxBucket) {
        self.list.push_back(bucket);
    }

    pub fn prepend(&mut self, bucket: BoxBucket) {
        // never in front of a held-open exhausted bucket
        if self.front_done {
            self.list.insert(1, bucket);
        } else {
            self.list.push_front(bucket);
        }
    }

    fn retire_front(&mut self) {
        if self.front_done {
            self.list.pop_front();
            self.front_done = false;
        }
    }

    /// Drops exhausted front buckets until one with readable data remains.
    /// Returns false if the whole aggregate is exhausted.
    fn settle_front(&mut self) -> Result<bool> {
        loop {
            let (len, state) = match self.list.front_mut() {
                Some(front) => {
                    let (data, state) = front.peek()?;

                    (data.len(), state)
                }
                None => return Ok(false),
            };

            if len > 0 {
                return Ok(true);
            }

            match state {
                ReadState::Eof => {
                    self.list.pop_front();
                }
                // a successful peek of nothing; yield rather than spin
                ReadState::More => return Err(Error::again()),
            }
        }
    }
}

impl Bucket for AggregateBucket {
    fn kind(&self) -> BucketKind {
        BucketKind::Aggregate
    }

    fn core(&self) -> &BucketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BucketCore {
        &mut self.core
    }

    fn read(&mut self, requested: usize) -> Result<(&[u8], ReadState)> {
        self.retire_front();

        if !self.settle_front()? {
            return Ok((&[], ReadState::Eof));
        }

        let is_last = self.list.len() == 1;

        let Some(front) = self.list.front_mut() else {
            return Ok((&[], ReadState::Eof));
        };
        let (data, state) = front.read(requested)?;

        self.front_done = state == ReadState::Eof;

        let overall = if state == ReadState::Eof && is_last {
            ReadState::Eof
        } else {
            ReadState::More
        };

        Ok((data, overall))
    }

    fn readline(&mut self, accept: Newline) -> Result<(&[u8], LineEnd, ReadState)> {
        self.retire_front();

        if !self.settle_front()? {
            return Ok((&[], LineEnd::None, ReadState::Eof));
        }

        let is_last = self.list.len() == 1;

        let Some(front) = self.list.front_mut() else {
            return Ok((&[], LineEnd::None, ReadState::Eof));
        };
        let (data, end, state) = front.readline(accept)?;

        self.front_done = state == ReadState::Eof;

        let overall = if state == ReadState::Eof && is_last {
            ReadState::Eof
        } else {
            ReadState::More
        };

        Ok((data, end, overall))
    }

    fn peek(&mut self) -> Result<(&[u8], ReadState)> {
        self.retire_front();

        if !self.settle_front()? {
            return Ok((&[], ReadState::Eof));
        }

        let is_last = self.list.len() == 1;

        let Some(front) = self.list.front_mut() else {
            return Ok((&[], ReadState::Eof));
        };
        let (data, state) = front.peek()?;

        let state = if state == ReadState::Eof && !is_last {
            ReadState::More
        } else {
            state
        };

        Ok((data, state))
    }

    fn read_bucket(&mut self, kind: BucketKind) -> Option<BoxBucket> {
        let pos = self.list.iter().position(|b| b.kind() == kind)?;

        if pos == 0 {
            self.front_done = false;
        }

        self.list.remove(pos)
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
    fn concatenates_in_order() {
        let alloc = alloc();
        let mut agg = AggregateBucket::new(&alloc);

        agg.append(Box::new(SimpleBucket::from_static(b"GET / HTTP/1.1\r\n", &alloc)));
        agg.append(Box::new(SimpleBucket::from_static(b"Host: example\r\n\r\n", &alloc)));
        agg.append(Box::new(SimpleBucket::from_static(b"body", &alloc)));

        assert_eq!(
            drain(&mut agg),
            b"GET / HTTP/1.1\r\nHost: example\r\n\r\nbody"
        );
    }

    #[test]
    fn empty_is_immediate_eof() {
        let alloc = alloc();
        let mut agg = AggregateBucket::new(&alloc);

        let (data, state) = agg.read(READ_ALL).unwrap();
        assert!(data.is_empty());
        assert_eq!(state, ReadState::Eof);
    }

    #[test]
    fn final_view_survives_until_next_call() {
        let alloc = alloc();
        let mut agg = AggregateBucket::new(&alloc);

        agg.append(Box::new(SimpleBucket::from_static(b"abc", &alloc)));
        agg.append(Box::new(SimpleBucket::from_static(b"def", &alloc)));

        let (data, state) = agg.read(READ_ALL).unwrap();
        assert_eq!(data, b"abc");
        assert_eq!(state, ReadState::More);

        let (data, state) = agg.read(READ_ALL).unwrap();
        assert_eq!(data, b"def");
        assert_eq!(state, ReadState::Eof);
    }

    #[test]
    fn readline_across_members() {
        let alloc = alloc();
        let mut agg = AggregateBucket::new(&alloc);

        agg.append(Box::new(SimpleBucket::from_static(b"one\r\ntwo", &alloc)));

        let (data, end, _) = agg.readline(Newline::ANY).unwrap();
        assert_eq!(data, b"one\r\n");
        assert_eq!(end, LineEnd::Crlf);

        let (data, end, state) = agg.readline(Newline::ANY).unwrap();
        assert_eq!(data, b"two");
        assert_eq!(end, LineEnd::None);
        assert_eq!(state, ReadState::Eof);
    }

    #[test]
    fn detach_nested() {
        let alloc = alloc();
        let mut agg = AggregateBucket::new(&alloc);

        agg.append(Box::new(SimpleBucket::from_static(b"abc", &alloc)));

        let inner = agg.read_bucket(BucketKind::Simple);
        assert!(inner.is_some());

        assert!(agg.read_bucket(BucketKind::Simple).is_none());

        let (_, state) = agg.read(READ_ALL).unwrap();
        assert_eq!(state, ReadState::Eof);
    }
}
