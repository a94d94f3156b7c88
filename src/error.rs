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

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// HTTP/2 error labels, carried for forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Http2Error {
    #[error("HTTP2 no error")]
    NoError,

    #[error("HTTP2 protocol error")]
    ProtocolError,

    #[error("HTTP2 internal error")]
    InternalError,

    #[error("HTTP2 flow control error")]
    FlowControlError,

    #[error("HTTP2 settings timeout")]
    SettingsTimeout,

    #[error("HTTP2 stream closed")]
    StreamClosed,

    #[error("HTTP2 frame size error")]
    FrameSizeError,

    #[error("HTTP2 refused stream")]
    RefusedStream,

    #[error("HTTP2 cancelled")]
    Cancel,

    #[error("HTTP2 compression error")]
    CompressionError,

    #[error("HTTP2 connect error")]
    ConnectError,

    #[error("HTTP2 enhance your calm")]
    EnhanceYourCalm,

    #[error("HTTP2 inadequate security")]
    InadequateSecurity,

    #[error("HTTP2 downgrade to HTTP/1.1 required")]
    Http11Required,
}

/// Everything that can go wrong in the engine. Transport errors travel as
/// the transparent `Io` variant; EAGAIN is `io::ErrorKind::WouldBlock` and
/// is a control signal, not a failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("the connection is closing")]
    Closing,

    #[error("a requested read was abandoned")]
    RequestLost,

    #[error("a connection is busy being set up")]
    WaitConn,

    #[error("decompression failed")]
    DecompressionFailed,

    #[error("the server sent an improper HTTP response")]
    BadHttpResponse,

    #[error("the server sent a truncated HTTP response body")]
    TruncatedHttpResponse,

    #[error("the server unexpectedly closed the connection")]
    AbortedConnection,

    #[error("the line too long")]
    LineTooLong,

    #[error("the HTTP response status line is too long")]
    StatusLineTooLong,

    #[error("the HTTP response header is too long")]
    ResponseHeaderTooLong,

    #[error("the connection timed out")]
    ConnectionTimedOut,

    #[error("stream crossed or ended prematurely")]
    TruncatedStream,

    #[error("stream is empty")]
    EmptyStream,

    #[error("a successful read of nothing")]
    EmptyRead,

    #[error("an error occurred during SSL communication")]
    SslCommFailed,

    #[error("an error occurred during SSL setup")]
    SslSetupFailed,

    #[error("an invalid certificate was received")]
    SslCertFailed,

    #[error("authentication failed")]
    AuthnFailed,

    #[error("the requested authentication type(s) are not supported")]
    AuthnNotSupported,

    #[error("an expected attribute was missing in the authentication challenge")]
    AuthnMissingAttribute,

    #[error("initialization of an authentication type failed")]
    AuthnInitializationFailed,

    #[error("the server rejected our repeated attempts to authenticate")]
    AuthnCredentialsRejected,

    #[error("setup of the SSL tunnel to the proxy failed")]
    SslTunnelSetupFailed,

    #[error(transparent)]
    Http2(#[from] Http2Error),
}

impl Error {
    /// The non-blocking "try again later" signal.
    pub fn again() -> Self {
        Self::Io(io::ErrorKind::WouldBlock.into())
    }

    pub fn is_again(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    pub fn is_intr(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::Interrupted)
    }

    pub fn is_timeup(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn again_classification() {
        assert!(Error::again().is_again());
        assert!(!Error::again().is_timeup());
        assert!(!Error::Closing.is_again());
    }

    #[test]
    fn messages() {
        assert_eq!(
            Error::TruncatedStream.to_string(),
            "stream crossed or ended prematurely"
        );
        assert_eq!(
            Http2Error::EnhanceYourCalm.to_string(),
            "HTTP2 enhance your calm"
        );
    }
}
