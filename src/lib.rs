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

//! The core of a non-blocking, multiplexed HTTP/1.x client.
//!
//! A [`Context`] owns a pollset and a set of lazily connected
//! [`Connection`]s, each carrying a FIFO of pipelined requests. All data
//! flows through pull-based byte-stream [`Bucket`]s: the caller composes a
//! request from buckets and consumes the response through an incremental
//! response-parser bucket, driven entirely by readiness events.

pub mod arena;
pub mod buckets;
pub mod connection;
pub mod context;
pub mod error;
pub mod listener;
pub mod request;

pub use arena::{BucketAlloc, Scope};
pub use buckets::{
    AggregateBucket, BoxBucket, Bucket, BucketCore, BucketKind, DechunkBucket, HeaderSet,
    LimitBucket, LineEnd, LogWrapBucket, Newline, ReadState, ResponseBucket, SimpleBucket,
    SocketBucket, StatusLine, LINE_LIMIT, READ_ALL,
};
pub use connection::{ClosedCallback, ConnHandle, Connection, Readiness};
pub use context::{
    Context, CredentialsCallback, Progress, AUTHN_ALL, AUTHN_BASIC, AUTHN_DIGEST, AUTHN_NEGOTIATE,
    AUTHN_NONE, AUTHN_NTLM,
};
pub use error::{Error, Http2Error, Result};
pub use listener::{InboundHandler, ListenerHandle};
pub use request::{Acceptor, Handler, RequestId};

/// The library's semver triple.
pub fn lib_version() -> (u32, u32, u32) {
    (
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_manifest() {
        let (major, minor, patch) = lib_version();

        assert_eq!(
            format!("{major}.{minor}.{patch}"),
            env!("CARGO_PKG_VERSION")
        );
    }
}
