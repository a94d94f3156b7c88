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
use crate::context::Progress;
use crate::error::{Error, Result};
use mio::net::TcpStream;
use std::any::Any;
use std::cmp;
use std::io::{self, Read};
use std::rc::Rc;

const BUF_SIZE: usize = 8000;

/// Wraps a non-blocking socket in the bucket read surface. A 0-byte socket
/// read is reported as `Eof`. Consumed-but-unreturned bytes stay in the
/// internal buffer, so `peek` and CRLF-split handling never lose data.
pub struct SocketBucket {
    core: BucketCore,
    stream: Rc<TcpStream>,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    progress: Option<Rc<Progress>>,
}

impl SocketBucket {
    pub fn new(stream: Rc<TcpStream>, alloc: &BucketAlloc) -> Self {
        Self {
            core: BucketCore::new(alloc),
            stream,
            buf: vec![0; BUF_SIZE],
            start: 0,
            end: 0,
            eof: false,
            progress: None,
        }
    }

    /// Registers the progress tally read bytes are reported to.
    pub fn set_read_progress(&mut self, progress: Rc<Progress>) {
        self.progress = Some(progress);
    }

    fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Pulls from the socket into the internal buffer. Errors with EAGAIN
    /// if the socket has nothing; sets the eof flag on an orderly close.
    fn fill(&mut self) -> Result<()> {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }

        loop {
            match (&*self.stream).read(&mut self.buf[self.end..]) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.end += n;

                    if let Some(p) = &self.progress {
                        p.delta(n as u64, 0);
                    }

                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn ensure_data(&mut self) -> Result<()> {
        if self.buffered() == 0 && !self.eof {
            self.fill()?;
        }

        Ok(())
    }

    fn state_after(&self) -> ReadState {
        if self.buffered() == 0 && self.eof {
            ReadState::Eof
        } else {
            ReadState::More
        }
    }
}

impl Bucket for SocketBucket {
    fn kind(&self) -> BucketKind {
        BucketKind::Socket
    }

    fn core(&self) -> &BucketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BucketCore {
        &mut self.core
    }

    fn read(&mut self, requested: usize) -> Result<(&[u8], ReadState)> {
        self.ensure_data()?;

        let avail = self.buffered();

        if avail == 0 {
            // fill either hit eof or would have errored with EAGAIN
            return Ok((&[], ReadState::Eof));
        }

        let take = if requested == READ_ALL {
            avail
        } else {
            cmp::min(requested, avail)
        };

        let s = self.start;
        self.start += take;

        Ok((&self.buf[s..self.start], self.state_after()))
    }

    fn readline(&mut self, accept: Newline) -> Result<(&[u8], LineEnd, ReadState)> {
        self.ensure_data()?;

        let avail = self.buffered();

        if avail == 0 {
            return Ok((&[], LineEnd::None, ReadState::Eof));
        }

        let (len, end) = find_line_end(&self.buf[self.start..self.end], accept);

        let s = self.start;
        self.start += len;

        Ok((&self.buf[s..self.start], end, self.state_after()))
    }

    fn peek(&mut self) -> Result<(&[u8], ReadState)> {
        self.ensure_data()?;

        if self.buffered() == 0 {
            return Ok((&[], ReadState::Eof));
        }

        Ok((&self.buf[self.start..self.end], ReadState::More))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
