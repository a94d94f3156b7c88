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

use crate::arena::{BucketAlloc, Scope};
use crate::buckets::{BoxBucket, Bucket, ReadState};
use crate::error::Result;

/// Identifies a request within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u64);

/// Builds the response bucket for a request when its first bytes arrive.
/// Receives the connection's stream bucket and the request's allocator.
pub type Acceptor = Box<dyn FnMut(BoxBucket, &BucketAlloc) -> Result<BoxBucket>>;

/// Consumes response data. Invoked with the response bucket and a scratch
/// scope whenever input is available, until it returns `Eof`.
pub type Handler = Box<dyn FnMut(&mut dyn Bucket, &Scope) -> Result<ReadState>>;

/// One queued request. Created blank by `request_create`; the caller builds
/// the request bucket from the request's own allocator and delivers it.
/// Everything allocated against the request scope is torn down when the
/// request leaves the queue.
pub(crate) struct Request {
    pub(crate) id: RequestId,
    pub(crate) scope: Scope,
    pub(crate) alloc: BucketAlloc,
    pub(crate) req_bucket: Option<BoxBucket>,
    pub(crate) delivered: bool,
    /// True once the write path consumed any of the request bucket. A
    /// started request can no longer be cancelled in isolation.
    pub(crate) started: bool,
    pub(crate) acceptor: Acceptor,
    pub(crate) handler: Handler,
    pub(crate) response: Option<BoxBucket>,
}

impl Request {
    pub(crate) fn new(id: RequestId, parent: &Scope, acceptor: Acceptor, handler: Handler) -> Self {
        let scope = parent.child();
        let alloc = BucketAlloc::new(&scope);

        Self {
            id,
            scope,
            alloc,
            req_bucket: None,
            delivered: false,
            started: false,
            acceptor,
            handler,
            response: None,
        }
    }
}
