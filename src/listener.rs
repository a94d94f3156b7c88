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

use crate::arena::Scope;
use crate::buckets::{BoxBucket, Bucket, ReadState};
use crate::error::Result;
use mio::net::TcpListener;
use std::cell::RefCell;
use std::rc::Rc;

/// Keys a listener owned by the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub(crate) usize);

/// Serves one inbound socket: called with its socket bucket whenever the
/// socket is readable, until it returns `Eof` to close the connection.
pub type InboundHandler = Box<dyn FnMut(&mut dyn Bucket) -> Result<ReadState>>;

/// A listening socket. Accepted sockets become their own context entries
/// and share this listener's handler.
pub(crate) struct Listener {
    pub(crate) listener: TcpListener,
    pub(crate) handler: Rc<RefCell<InboundHandler>>,
    pub(crate) scope: Scope,
}

impl Listener {
    pub(crate) fn new(listener: TcpListener, handler: InboundHandler, scope: Scope) -> Self {
        Self {
            listener,
            handler: Rc::new(RefCell::new(handler)),
            scope,
        }
    }
}

/// An accepted inbound socket and its bucket. The socket itself lives
/// inside the bucket; dropping the entry closes it.
pub(crate) struct InboundClient {
    pub(crate) bucket: Option<BoxBucket>,
    pub(crate) handler: Rc<RefCell<InboundHandler>>,
}
