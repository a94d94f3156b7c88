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
    BoxBucket, Bucket, BucketCore, BucketKind, DechunkBucket, LimitBucket, LineAccumulator,
    LineEnd, Newline, ReadState,
};
use crate::error::{Error, Result};
use std::any::Any;
use std::str;

/// The parsed response status line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusLine {
    pub version_major: u16,
    pub version_minor: u16,
    pub code: u16,
    pub reason: String,
}

/// Response headers in wire order. Duplicates are preserved; lookup is
/// case-insensitive; a continuation line extends the preceding value.
#[derive(Debug, Default)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    /// First value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn add(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// Folds a continuation line into the last header. False if there is
    /// no header to continue.
    fn continue_last(&mut self, more: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, v)) => {
                v.push(' ');
                v.push_str(more);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    StatusLine,
    Headers,
    Body,
}

/// Parse failures are sticky; once the machine fails, every later call
/// reports the same error and the stream is not advanced further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseFailure {
    StatusLineTooLong,
    ResponseHeaderTooLong,
    BadHttpResponse,
    TruncatedHttpResponse,
}

impl ParseFailure {
    fn to_error(self) -> Error {
        match self {
            Self::StatusLineTooLong => Error::StatusLineTooLong,
            Self::ResponseHeaderTooLong => Error::ResponseHeaderTooLong,
            Self::BadHttpResponse => Error::BadHttpResponse,
            Self::TruncatedHttpResponse => Error::TruncatedHttpResponse,
        }
    }
}

/// Incremental HTTP/1.x response parser over the connection's stream
/// bucket. The machine advances as far as the readily available bytes
/// allow and parks on EAGAIN; every read-family call resumes it.
///
/// Body framing is decided once, when the blank line ends the headers:
/// chunked transfer wraps the stream in a dechunk bucket, Content-Length
/// in a limit bucket, and otherwise the body runs to connection close.
pub struct ResponseBucket {
    core: BucketCore,
    stream: Option<BoxBucket>,
    body: Option<BoxBucket>,
    state: ParseState,
    lines: LineAccumulator,
    status: StatusLine,
    headers: HeaderSet,
    head: bool,
    failure: Option<ParseFailure>,
}

impl ResponseBucket {
    pub fn new(stream: BoxBucket, alloc: &BucketAlloc) -> Self {
        Self {
            core: BucketCore::new(alloc),
            stream: Some(stream),
            body: None,
            state: ParseState::StatusLine,
            lines: LineAccumulator::new(),
            status: StatusLine::default(),
            headers: HeaderSet::default(),
            head: false,
            failure: None,
        }
    }

    /// Marks the response as answering a HEAD request, which never carries
    /// a body regardless of its headers.
    pub fn set_head(&mut self) {
        self.head = true;
    }

    /// Parsed status line. Drives the parser; EAGAIN means not enough
    /// bytes have arrived yet.
    pub fn status(&mut self) -> Result<&StatusLine> {
        self.check_failure()?;

        while self.state == ParseState::StatusLine {
            self.parse_status_line()?;
        }

        Ok(&self.status)
    }

    /// Parsed headers; drives the parser through the end of the header
    /// block.
    pub fn headers(&mut self) -> Result<&HeaderSet> {
        self.run_machine()?;

        Ok(&self.headers)
    }

    fn check_failure(&self) -> Result<()> {
        match self.failure {
            Some(f) => Err(f.to_error()),
            None => Ok(()),
        }
    }

    fn run_machine(&mut self) -> Result<()> {
        self.check_failure()?;

        loop {
            match self.state {
                ParseState::StatusLine => self.parse_status_line()?,
                ParseState::Headers => self.parse_headers()?,
                ParseState::Body => return Ok(()),
            }
        }
    }

    /// Completes one header-block line, mapping failures per phase.
    /// EAGAIN passes through unmapped.
    fn fetch_line(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::TruncatedHttpResponse);
        };

        match self.lines.fetch(stream.as_mut()) {
            Ok(_) => {}
            Err(e) if e.is_again() => return Err(e),
            Err(Error::LineTooLong) => {
                return Err(self.fail(match self.state {
                    ParseState::StatusLine => ParseFailure::StatusLineTooLong,
                    _ => ParseFailure::ResponseHeaderTooLong,
                }));
            }
            Err(e) => return Err(e),
        }

        if !self.lines.is_ready() {
            // the peer closed before finishing the head of the response
            return Err(self.fail(ParseFailure::TruncatedHttpResponse));
        }

        Ok(())
    }

    fn fail(&mut self, f: ParseFailure) -> Error {
        self.failure = Some(f);

        f.to_error()
    }

    fn parse_status_line(&mut self) -> Result<()> {
        self.fetch_line()?;

        if self.lines.line().is_empty() {
            // tolerate blank lines ahead of the status line
            return Ok(());
        }

        match parse_status(self.lines.line()) {
            Some(status) => {
                self.status = status;
                self.state = ParseState::Headers;

                Ok(())
            }
            None => Err(self.fail(ParseFailure::BadHttpResponse)),
        }
    }

    fn parse_headers(&mut self) -> Result<()> {
        self.fetch_line()?;

        let line = self.lines.line();

        if line.is_empty() {
            return self.decide_body();
        }

        let Ok(line) = str::from_utf8(line) else {
            return Err(self.fail(ParseFailure::BadHttpResponse));
        };

        if line.starts_with(' ') || line.starts_with('\t') {
            let more = line.trim_start_matches([' ', '\t']).to_string();

            if !self.headers.continue_last(&more) {
                return Err(self.fail(ParseFailure::BadHttpResponse));
            }

            return Ok(());
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(self.fail(ParseFailure::BadHttpResponse));
        };

        let (name, value) = (name.to_string(), value.trim().to_string());
        self.headers.add(&name, &value);

        Ok(())
    }

    /// Chooses the body framing from the parsed head and swaps the stream
    /// bucket into it. Called exactly once, on the header-ending blank
    /// line.
    fn decide_body(&mut self) -> Result<()> {
        self.state = ParseState::Body;

        if self.head || self.status.code == 204 || self.status.code == 304 {
            // bodiless response; the stream stays put for the next
            // response on this connection
            return Ok(());
        }

        let Some(stream) = self.stream.take() else {
            return Err(self.fail(ParseFailure::TruncatedHttpResponse));
        };

        let alloc = self.core.alloc().clone();

        // chunked must be the final coding in the list
        let chunked = self
            .headers
            .get("Transfer-Encoding")
            .and_then(|v| v.rsplit(',').next())
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));

        if chunked {
            self.body = Some(Box::new(DechunkBucket::new(stream, &alloc)));

            return Ok(());
        }

        if let Some(cl) = self.headers.get("Content-Length") {
            let Ok(len) = cl.trim().parse::<u64>() else {
                return Err(self.fail(ParseFailure::BadHttpResponse));
            };

            self.body = Some(Box::new(LimitBucket::new(stream, len, &alloc)));

            return Ok(());
        }

        // no framing headers; the body runs until the peer closes
        self.body = Some(stream);

        Ok(())
    }
}

fn parse_status(line: &[u8]) -> Option<StatusLine> {
    let s = str::from_utf8(line).ok()?;

    let rest = s.strip_prefix("HTTP/")?;
    let (version, rest) = rest.split_once(' ')?;
    let (major, minor) = version.split_once('.')?;

    let (code, reason) = match rest.split_once(' ') {
        Some((c, r)) => (c, r),
        None => (rest, ""),
    };

    Some(StatusLine {
        version_major: major.parse().ok()?,
        version_minor: minor.parse().ok()?,
        code: code.parse().ok()?,
        reason: reason.to_string(),
    })
}

impl Bucket for ResponseBucket {
    fn kind(&self) -> BucketKind {
        BucketKind::Response
    }

    fn core(&self) -> &BucketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BucketCore {
        &mut self.core
    }

    fn read(&mut self, requested: usize) -> Result<(&[u8], ReadState)> {
        self.run_machine()?;

        match self.body.as_mut() {
            Some(body) => body.read(requested),
            None => Ok((&[], ReadState::Eof)),
        }
    }

    fn readline(&mut self, accept: Newline) -> Result<(&[u8], LineEnd, ReadState)> {
        self.run_machine()?;

        match self.body.as_mut() {
            Some(body) => body.readline(accept),
            None => Ok((&[], LineEnd::None, ReadState::Eof)),
        }
    }

    fn peek(&mut self) -> Result<(&[u8], ReadState)> {
        self.run_machine()?;

        match self.body.as_mut() {
            Some(body) => body.peek(),
            None => Ok((&[], ReadState::Eof)),
        }
    }

    fn read_bucket(&mut self, kind: BucketKind) -> Option<BoxBucket> {
        if let Some(body) = self.body.as_mut() {
            if body.kind() == kind {
                return self.body.take();
            }

            if let Some(found) = body.read_bucket(kind) {
                return Some(found);
            }
        }

        if let Some(stream) = self.stream.as_mut() {
            if stream.kind() == kind {
                return self.stream.take();
            }

            return stream.read_bucket(kind);
        }

        None
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
