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
use crate::buckets::{
    BoxBucket, BucketKind, LogWrapBucket, ReadState, SocketBucket, READ_ALL,
};
use crate::context::Progress;
use crate::error::{Error, Result};
use crate::request::{Acceptor, Handler, Request, RequestId};
use log::debug;
use mio::net::TcpStream;
use mio::Interest;
use std::cell::Cell;
use std::cmp;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::rc::Rc;

/// Keys a connection owned by the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub(crate) usize);

/// Called when the connection closes; receives the error that took it
/// down, or `None` for an orderly close.
pub type ClosedCallback = Box<dyn FnMut(Option<&Error>)>;

/// What a readiness event reported for a registered socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

/// One outbound connection: a lazily connected socket, a FIFO of pipelined
/// requests, and the unwritten remainder left behind by a short write.
///
/// The write path walks the queue head-forward, never past an undelivered
/// request. The read path matches each inbound response to the earliest
/// delivered request and reclaims the stream bucket when a response
/// completes.
pub struct Connection {
    scope: Scope,
    alloc: BucketAlloc,
    addr: SocketAddr,
    stream: Option<Rc<TcpStream>>,
    stream_bucket: Option<BoxBucket>,
    queue: VecDeque<Request>,
    next_request_id: u64,
    unwritten: Vec<u8>,
    unwritten_pos: usize,
    write_stalled: bool,
    /// Cap on bytes per send call. Exists so short-write recovery is
    /// exercisable; the default is no cap.
    send_max: usize,
    dirty: bool,
    ctx_dirty: Rc<Cell<bool>>,
    progress: Rc<Progress>,
    closed_cb: Option<ClosedCallback>,
    pub(crate) registered: bool,
}

impl Connection {
    pub(crate) fn new(
        addr: SocketAddr,
        parent: &Scope,
        ctx_dirty: Rc<Cell<bool>>,
        progress: Rc<Progress>,
        closed_cb: Option<ClosedCallback>,
    ) -> Self {
        let scope = parent.child();
        let alloc = BucketAlloc::new(&scope);

        Self {
            scope,
            alloc,
            addr,
            stream: None,
            stream_bucket: None,
            queue: VecDeque::new(),
            next_request_id: 0,
            unwritten: Vec::new(),
            unwritten_pos: 0,
            write_stalled: false,
            send_max: usize::MAX,
            dirty: false,
            ctx_dirty,
            progress,
            closed_cb,
            registered: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Bytes pulled from a request bucket that the socket has not yet
    /// accepted.
    pub fn unwritten_len(&self) -> usize {
        self.unwritten.len() - self.unwritten_pos
    }

    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    /// Caps each send call at `max` bytes.
    pub fn set_send_max(&mut self, max: usize) {
        self.send_max = max;
    }

    /// Enqueues a blank request and returns its id. The caller builds the
    /// request bucket from `request_alloc` and then delivers it.
    pub fn request_create(&mut self, acceptor: Acceptor, handler: Handler) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;

        self.queue
            .push_back(Request::new(id, &self.scope, acceptor, handler));
        self.mark_dirty();

        debug!("conn {}: request {:?} created", self.addr, id);

        id
    }

    /// The allocator scoped to one request's lifetime.
    pub fn request_alloc(&self, id: RequestId) -> Option<&BucketAlloc> {
        self.queue.iter().find(|r| r.id == id).map(|r| &r.alloc)
    }

    pub fn request_scope(&self, id: RequestId) -> Option<&Scope> {
        self.queue.iter().find(|r| r.id == id).map(|r| &r.scope)
    }

    /// Hands the finished request bucket to the write path. The pipeline
    /// can now advance past this request.
    pub fn request_deliver(&mut self, id: RequestId, bucket: BoxBucket) -> Result<()> {
        let Some(req) = self.queue.iter_mut().find(|r| r.id == id) else {
            return Err(Error::RequestLost);
        };

        req.req_bucket = Some(bucket);
        req.delivered = true;

        self.write_stalled = false;
        self.mark_dirty();

        Ok(())
    }

    /// Withdraws a request. An unstarted request is unlinked and dropped;
    /// a request whose bytes are partially on the wire cannot be recalled,
    /// so cancelling it takes the whole connection down.
    pub fn request_cancel(&mut self, id: RequestId) -> Result<()> {
        let Some(pos) = self.queue.iter().position(|r| r.id == id) else {
            return Ok(());
        };

        let in_flight = self
            .queue
            .get(pos)
            .is_some_and(|r| r.started || r.response.is_some());

        if in_flight || (pos == 0 && self.unwritten_len() > 0) {
            debug!("conn {}: cancel of in-flight request {:?}", self.addr, id);

            self.reset();

            if let Some(cb) = self.closed_cb.as_mut() {
                cb(Some(&Error::RequestLost));
            }

            return Err(Error::RequestLost);
        }

        self.queue.remove(pos);
        self.mark_dirty();

        Ok(())
    }

    /// Re-arms a connection whose write side stalled on a request bucket
    /// that had nothing to give.
    pub fn wake(&mut self) {
        self.write_stalled = false;
        self.mark_dirty();
    }

    pub fn set_closed_cb(&mut self, cb: ClosedCallback) {
        self.closed_cb = Some(cb);
    }

    pub(crate) fn notify_closed(&mut self, err: Option<&Error>) {
        if let Some(cb) = self.closed_cb.as_mut() {
            cb(err);
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.ctx_dirty.set(true);
    }

    pub(crate) fn take_dirty(&mut self) -> bool {
        let d = self.dirty;
        self.dirty = false;

        d
    }

    /// A connection connects lazily, once it has something to do.
    pub(crate) fn wants_connect(&self) -> bool {
        self.stream.is_none() && !self.queue.is_empty()
    }

    pub(crate) fn attach_stream(&mut self, stream: Rc<TcpStream>) {
        let mut sock = SocketBucket::new(Rc::clone(&stream), &self.alloc);
        sock.set_read_progress(Rc::clone(&self.progress));

        self.stream_bucket = Some(Box::new(LogWrapBucket::new(
            "receiving raw",
            Box::new(sock),
            &self.alloc,
        )));
        self.stream = Some(stream);
        self.mark_dirty();

        debug!("conn {}: connected", self.addr);
    }

    pub(crate) fn raw_stream(&self) -> Option<&Rc<TcpStream>> {
        self.stream.as_ref()
    }

    /// The interest this connection currently needs from the pollset, or
    /// `None` when it should not be registered at all; socket errors then
    /// surface on the next I/O attempt after interest returns.
    pub(crate) fn desired_interest(&self) -> Option<Interest> {
        let mut want_write = self.unwritten_len() > 0;

        if !want_write && !self.write_stalled {
            for r in &self.queue {
                if r.req_bucket.is_some() {
                    want_write = true;
                    break;
                }

                if !r.delivered {
                    // the pipeline cannot advance past this request yet
                    break;
                }
            }
        }

        let want_read = !self.queue.is_empty();

        match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Dispatches one readiness report.
    pub(crate) fn process(&mut self, r: Readiness) -> Result<()> {
        if r.error || r.hangup {
            return self.handle_hangup();
        }

        if r.writable {
            self.write_more()?;
        }

        if r.readable {
            self.read_more()?;
        }

        self.mark_dirty();

        Ok(())
    }

    /// Sends as much as the socket will take: first the remainder of the
    /// previous short write, then data pulled from the queue's next
    /// writable request bucket.
    pub(crate) fn write_more(&mut self) -> Result<()> {
        loop {
            if !self.flush_unwritten()? {
                return Ok(());
            }

            // the next writable request: skip fully written entries, stop
            // at an undelivered one
            let mut idx = None;

            for (i, r) in self.queue.iter().enumerate() {
                if r.req_bucket.is_some() {
                    idx = Some(i);
                    break;
                }

                if !r.delivered {
                    break;
                }
            }

            let Some(i) = idx else {
                return Ok(());
            };

            if self.write_stalled {
                return Ok(());
            }

            let Some(stream) = self.stream.as_ref().map(Rc::clone) else {
                return Ok(());
            };

            let send_max = self.send_max;

            let Some(req) = self.queue.get_mut(i) else {
                return Ok(());
            };

            let Some(bucket) = req.req_bucket.as_mut() else {
                return Ok(());
            };

            let (data, state) = match bucket.read(READ_ALL) {
                Ok(r) => r,
                Err(e) if e.is_again() => {
                    // nothing to send right now; drop write interest so a
                    // writable socket doesn't spin us
                    self.write_stalled = true;
                    self.dirty = true;
                    self.ctx_dirty.set(true);

                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if data.is_empty() && state == ReadState::More {
                // a successful read of nothing is a control signal; stall
                self.write_stalled = true;
                self.dirty = true;
                self.ctx_dirty.set(true);

                return Ok(());
            }

            req.started = true;

            let mut written = 0;
            let mut blocked = false;

            while written < data.len() {
                let chunk = &data[written..cmp::min(data.len(), written + send_max)];

                match (&*stream).write(chunk) {
                    Ok(n) => {
                        written += n;
                        self.progress.delta(0, n as u64);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        blocked = true;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            if written < data.len() {
                self.unwritten.clear();
                self.unwritten.extend_from_slice(&data[written..]);
                self.unwritten_pos = 0;
                self.dirty = true;
                self.ctx_dirty.set(true);
            }

            if state == ReadState::Eof {
                // request fully pulled; the next pipeline entry becomes
                // writable once the remainder is flushed
                req.req_bucket = None;
            }

            if blocked {
                return Ok(());
            }
        }
    }

    /// Pushes out the remainder of a short write. True when the remainder
    /// is gone and more data may be pulled.
    fn flush_unwritten(&mut self) -> Result<bool> {
        while self.unwritten_pos < self.unwritten.len() {
            let Some(stream) = self.stream.as_ref().map(Rc::clone) else {
                return Ok(false);
            };

            let end = cmp::min(self.unwritten.len(), self.unwritten_pos + self.send_max);

            match (&*stream).write(&self.unwritten[self.unwritten_pos..end]) {
                Ok(n) => {
                    self.unwritten_pos += n;
                    self.progress.delta(0, n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.unwritten.clear();
        self.unwritten_pos = 0;

        Ok(true)
    }

    /// Feeds inbound bytes to the response of the earliest delivered
    /// request, creating it through the acceptor on first data. Loops so a
    /// single readiness event can complete several pipelined responses.
    pub(crate) fn read_more(&mut self) -> Result<()> {
        loop {
            let Some(head) = self.queue.front_mut() else {
                return self.unexpected_data();
            };

            if !head.delivered {
                // inbound bytes for a request we never sent
                return self.unexpected_data();
            }

            if head.response.is_none() {
                let Some(stream) = self.stream_bucket.take() else {
                    return Ok(());
                };

                head.response = Some((head.acceptor)(stream, &head.alloc)?);
            }

            let Some(response) = head.response.as_mut() else {
                return Ok(());
            };

            let tmp = head.scope.child();

            match (head.handler)(response.as_mut(), &tmp) {
                Ok(ReadState::Eof) => {
                    // response complete; reclaim the stream bucket and
                    // tear the request down
                    let mut response = match head.response.take() {
                        Some(r) => r,
                        None => return Ok(()),
                    };

                    self.stream_bucket = response.read_bucket(BucketKind::LogWrap);
                    drop(response);

                    let finished = self.queue.pop_front();
                    drop(finished);

                    self.write_stalled = false;
                    self.mark_dirty();

                    debug!("conn {}: request finished", self.addr);
                }
                Ok(ReadState::More) => {
                    // the handler yielded; leave the request in place and
                    // hand control back to the loop. Read-side progress
                    // also unblocks a stalled writer.
                    self.write_stalled = false;

                    return Ok(());
                }
                Err(e) if e.is_again() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Bytes arrived with no request expecting them.
    fn unexpected_data(&mut self) -> Result<()> {
        let Some(sb) = self.stream_bucket.as_mut() else {
            return Ok(());
        };

        match sb.peek() {
            Ok((data, _)) if !data.is_empty() => Err(Error::BadHttpResponse),
            Ok((_, ReadState::Eof)) => {
                // orderly close of an idle connection
                self.reset();

                if let Some(cb) = self.closed_cb.as_mut() {
                    cb(None);
                }

                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_again() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The peer hung up or the socket reported an error. Whatever was
    /// already received is drained through the normal read path, then the
    /// connection is torn down; unfinished requests are reported lost.
    pub(crate) fn handle_hangup(&mut self) -> Result<()> {
        debug!("conn {}: hangup", self.addr);

        let drained = match self.read_more() {
            Ok(()) => Ok(()),
            Err(e) if e.is_again() => Ok(()),
            Err(e) => Err(e),
        };

        if self.stream.is_none() {
            // the drain already saw the close and tore the connection down
            return drained;
        }

        let outstanding = self.queue.iter().any(|r| r.delivered);

        self.reset();

        if outstanding {
            if let Some(cb) = self.closed_cb.as_mut() {
                cb(Some(&Error::AbortedConnection));
            }

            drained?;

            return Err(Error::AbortedConnection);
        }

        if let Some(cb) = self.closed_cb.as_mut() {
            cb(None);
        }

        drained
    }

    /// Drops the socket and all queued state. Closing the descriptor also
    /// removes it from the kernel pollset.
    pub(crate) fn reset(&mut self) {
        self.stream_bucket = None;
        self.stream = None;
        self.queue.clear();
        self.unwritten.clear();
        self.unwritten_pos = 0;
        self.write_stalled = false;
        self.registered = false;
        self.mark_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::{Bucket, BucketCore, LineEnd, Newline, SimpleBucket};
    use crate::request::{Acceptor, Handler};
    use std::any::Any;
    use std::io::Read;

    fn test_conn() -> Connection {
        let addr = "127.0.0.1:1".parse().unwrap();

        Connection::new(
            addr,
            &Scope::new(),
            Rc::new(Cell::new(false)),
            Rc::new(Progress::new()),
            None,
        )
    }

    /// A connected nonblocking mio stream plus the peer's blocking end.
    fn pair() -> (Rc<TcpStream>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        client.set_nonblocking(true).unwrap();

        (Rc::new(TcpStream::from_std(client)), server)
    }

    fn noop_acceptor() -> Acceptor {
        Box::new(|stream, _| Ok(stream))
    }

    fn noop_handler() -> Handler {
        Box::new(|_, _| Ok(ReadState::More))
    }

    /// A request bucket with nothing to give yet.
    struct PendingBucket {
        core: BucketCore,
    }

    impl Bucket for PendingBucket {
        fn kind(&self) -> BucketKind {
            BucketKind::External("pending")
        }

        fn core(&self) -> &BucketCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut BucketCore {
            &mut self.core
        }

        fn read(&mut self, _requested: usize) -> Result<(&[u8], ReadState)> {
            Err(Error::again())
        }

        fn readline(&mut self, _accept: Newline) -> Result<(&[u8], LineEnd, ReadState)> {
            Err(Error::again())
        }

        fn peek(&mut self) -> Result<(&[u8], ReadState)> {
            Err(Error::again())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn interest_derivation() {
        let mut conn = test_conn();

        // nothing to do, nothing to watch
        assert!(conn.desired_interest().is_none());

        let id = conn.request_create(noop_acceptor(), noop_handler());

        // awaiting delivery: a response may not be written for it yet, but
        // the queue is non-empty
        assert_eq!(conn.desired_interest(), Some(Interest::READABLE));

        let bucket = Box::new(SimpleBucket::from_static(
            b"GET / HTTP/1.1\r\n\r\n",
            &BucketAlloc::new(conn.scope()),
        ));
        conn.request_deliver(id, bucket).unwrap();

        assert_eq!(
            conn.desired_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        // undelivered cancel unlinks without touching the connection
        conn.request_cancel(id).unwrap();
        assert!(conn.desired_interest().is_none());
        assert_eq!(conn.queued_requests(), 0);
    }

    #[test]
    fn pipeline_stops_at_undelivered_request() {
        let mut conn = test_conn();

        let a = conn.request_create(noop_acceptor(), noop_handler());
        let _b = conn.request_create(noop_acceptor(), noop_handler());

        // the head is undelivered, so b may not be written even if it
        // were ready
        assert_eq!(conn.desired_interest(), Some(Interest::READABLE));

        let alloc = BucketAlloc::new(conn.scope());
        conn.request_deliver(a, Box::new(SimpleBucket::from_static(b"x", &alloc)))
            .unwrap();

        assert_eq!(
            conn.desired_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn short_write_recovery() {
        let (stream, mut server) = pair();

        // a small send buffer guarantees the socket pushes back
        socket2::SockRef::from(&*stream)
            .set_send_buffer_size(4096)
            .unwrap();

        let mut conn = test_conn();
        conn.attach_stream(stream);
        conn.set_send_max(4096);

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

        let id = conn.request_create(noop_acceptor(), noop_handler());
        let alloc = BucketAlloc::new(conn.scope());
        conn.request_deliver(id, Box::new(SimpleBucket::own(payload.clone(), &alloc)))
            .unwrap();

        server.set_nonblocking(true).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 65536];
        let mut saw_remainder = false;

        while received.len() < payload.len() {
            conn.write_more().unwrap();

            saw_remainder |= conn.unwritten_len() > 0;

            match server.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(e) => panic!("server read: {e}"),
            }
        }

        conn.write_more().unwrap();

        assert_eq!(received, payload);
        assert!(saw_remainder, "payload never backed up in the remainder");
        assert_eq!(conn.unwritten_len(), 0);

        // the request bucket is gone; only read interest remains
        assert_eq!(conn.desired_interest(), Some(Interest::READABLE));
    }

    #[test]
    fn empty_request_bucket_stalls_instead_of_spinning() {
        let (stream, _server) = pair();
        let mut conn = test_conn();
        conn.attach_stream(stream);

        let id = conn.request_create(noop_acceptor(), noop_handler());
        let alloc = BucketAlloc::new(conn.scope());
        conn.request_deliver(
            id,
            Box::new(PendingBucket {
                core: BucketCore::new(&alloc),
            }),
        )
        .unwrap();

        assert_eq!(
            conn.desired_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        conn.write_more().unwrap();

        // stalled: write interest is withdrawn until woken
        assert_eq!(conn.desired_interest(), Some(Interest::READABLE));

        conn.wake();
        assert_eq!(
            conn.desired_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn handler_yield_returns_to_the_loop() {
        let (stream, _server) = pair();
        let mut conn = test_conn();
        conn.attach_stream(stream);

        let calls = Rc::new(Cell::new(0));
        let calls2 = Rc::clone(&calls);

        let id = conn.request_create(
            noop_acceptor(),
            Box::new(move |_, _| {
                calls2.set(calls2.get() + 1);

                Ok(ReadState::More)
            }),
        );
        let alloc = BucketAlloc::new(conn.scope());
        conn.request_deliver(id, Box::new(SimpleBucket::from_static(b"GET", &alloc)))
            .unwrap();

        // a handler yielding with success is invoked once per read event,
        // not busy-looped, and its request stays queued
        conn.read_more().unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(conn.queued_requests(), 1);

        conn.read_more().unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn cancel_of_started_request_kills_the_connection() {
        let (stream, mut server) = pair();
        let mut conn = test_conn();
        conn.attach_stream(stream);

        let lost = Rc::new(Cell::new(false));
        let lost2 = Rc::clone(&lost);
        conn.set_closed_cb(Box::new(move |err| {
            lost2.set(matches!(err, Some(Error::RequestLost)));
        }));

        let id = conn.request_create(noop_acceptor(), noop_handler());
        let alloc = BucketAlloc::new(conn.scope());
        conn.request_deliver(id, Box::new(SimpleBucket::from_static(b"GET", &alloc)))
            .unwrap();

        conn.write_more().unwrap();

        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"GET");

        let err = conn.request_cancel(id).unwrap_err();
        assert!(matches!(err, Error::RequestLost));
        assert!(lost.get());
        assert_eq!(conn.queued_requests(), 0);
        assert!(conn.desired_interest().is_none());
    }
}
