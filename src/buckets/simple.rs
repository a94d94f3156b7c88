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
    find_line_end, Bucket, BucketCore, BucketKind, LineEnd, Newline, ReadState, READ_ALL,
};
use crate::error::Result;
use std::any::Any;
use std::borrow::Cow;
use std::cmp;

/// A bucket over a fixed region of memory. Delivers the final bytes
/// together with `Eof`.
pub struct SimpleBucket {
    core: BucketCore,
    data: Cow<'static, [u8]>,
    pos: usize,
}

impl SimpleBucket {
    /// Copies `data` into bucket-owned memory.
    pub fn copy(data: &[u8], alloc: &BucketAlloc) -> Self {
        Self {
            core: BucketCore::new(alloc),
            data: Cow::Owned(data.to_vec()),
            pos: 0,
        }
    }

    /// Takes ownership of `data` without copying.
    pub fn own(data: Vec<u8>, alloc: &BucketAlloc) -> Self {
        Self {
            core: BucketCore::new(alloc),
            data: Cow::Owned(data),
            pos: 0,
        }
    }

    pub fn from_static(data: &'static [u8], alloc: &BucketAlloc) -> Self {
        Self {
            core: BucketCore::new(alloc),
            data: Cow::Borrowed(data),
            pos: 0,
        }
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn state_after(&self) -> ReadState {
        if self.pos == self.data.len() {
            ReadState::Eof
        } else {
            ReadState::More
        }
    }
}

impl Bucket for SimpleBucket {
    fn kind(&self) -> BucketKind {
        BucketKind::Simple
    }

    fn core(&self) -> &BucketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BucketCore {
        &mut self.core
    }

    fn read(&mut self, requested: usize) -> Result<(&[u8], ReadState)> {
        let want = if requested == READ_ALL {
            self.remaining().len()
        } else {
            cmp::min(requested, self.remaining().len())
        };

        let start = self.pos;
        self.pos += want;

        Ok((&self.data[start..self.pos], self.state_after()))
    }

    fn readline(&mut self, accept: Newline) -> Result<(&[u8], LineEnd, ReadState)> {
        let (len, end) = find_line_end(self.remaining(), accept);

        let start = self.pos;
        self.pos += len;

        Ok((&self.data[start..self.pos], end, self.state_after()))
    }

    fn peek(&mut self) -> Result<(&[u8], ReadState)> {
        // all remaining data is known, so the state is always Eof
        Ok((&self.data[self.pos..], ReadState::Eof))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
