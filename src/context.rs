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
use crate::buckets::{ReadState, SocketBucket};
use crate::connection::{ClosedCallback, ConnHandle, Connection, Readiness};
use crate::error::{Error, Result};
use crate::listener::{InboundClient, InboundHandler, Listener, ListenerHandle};
use log::{debug, trace};
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

// Authentication schemes, as a bitmask for set_authn_types.
pub const AUTHN_NONE: u32 = 0x00;
pub const AUTHN_BASIC: u32 = 0x01;
pub const AUTHN_DIGEST: u32 = 0x02;
pub const AUTHN_NTLM: u32 = 0x04;
pub const AUTHN_NEGOTIATE: u32 = 0x08;
pub const AUTHN_ALL: u32 = 0xff;

/// Supplies credentials for an authentication challenge: given the realm
/// and the response code, returns (username, password).
pub type CredentialsCallback = Box<dyn FnMut(&str, u16) -> Result<(String, String)>>;

/// Cumulative byte tallies for everything the context moved, with an
/// optional callback fired on every change.
pub struct Progress {
    read: Cell<u64>,
    written: Cell<u64>,
    cb: RefCell<Option<Box<dyn FnMut(u64, u64)>>>,
}

impl Progress {
    pub(crate) fn new() -> Self {
        Self {
            read: Cell::new(0),
            written: Cell::new(0),
            cb: RefCell::new(None),
        }
    }

    pub(crate) fn delta(&self, read: u64, written: u64) {
        self.read.set(self.read.get() + read);
        self.written.set(self.written.get() + written);

        if let Ok(mut cb) = self.cb.try_borrow_mut() {
            if let Some(cb) = cb.as_mut() {
                cb(self.read.get(), self.written.get());
            }
        }
    }

    /// (bytes read, bytes written) so far.
    pub fn totals(&self) -> (u64, u64) {
        (self.read.get(), self.written.get())
    }
}

enum PollsetImpl {
    Own {
        poll: Poll,
        events: Events,
    },
    /// Interest changes are forwarded to a host event loop; the host calls
    /// `event_trigger` itself.
    Custom {
        add: Box<dyn FnMut(RawFd, Interest) -> io::Result<()>>,
        remove: Box<dyn FnMut(RawFd) -> io::Result<()>>,
    },
}

enum IoEntry {
    Conn(Connection),
    Listener(Listener),
    Client(InboundClient),
}

/// The event loop. Owns every connection, listener and accepted inbound
/// socket, keyed by pollset token, and drives them from readiness events.
pub struct Context {
    pollset: PollsetImpl,
    entries: Slab<IoEntry>,
    scope: Scope,
    progress: Rc<Progress>,
    dirty: Rc<Cell<bool>>,
    proxy: Option<SocketAddr>,
    credentials_cb: Option<CredentialsCallback>,
    authn_types: u32,
}

impl Context {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pollset: PollsetImpl::Own {
                poll: Poll::new()?,
                events: Events::with_capacity(128),
            },
            entries: Slab::new(),
            scope: Scope::new(),
            progress: Rc::new(Progress::new()),
            dirty: Rc::new(Cell::new(false)),
            proxy: None,
            credentials_cb: None,
            authn_types: AUTHN_ALL,
        })
    }

    /// Embeds the context in a host event loop. The host receives every
    /// interest change through `add`/`remove` and feeds readiness back via
    /// [`Context::event_trigger`]; [`Context::run`] is unavailable.
    pub fn with_pollset(
        add: impl FnMut(RawFd, Interest) -> io::Result<()> + 'static,
        remove: impl FnMut(RawFd) -> io::Result<()> + 'static,
    ) -> Self {
        Self {
            pollset: PollsetImpl::Custom {
                add: Box::new(add),
                remove: Box::new(remove),
            },
            entries: Slab::new(),
            scope: Scope::new(),
            progress: Rc::new(Progress::new()),
            dirty: Rc::new(Cell::new(false)),
            proxy: None,
            credentials_cb: None,
            authn_types: AUTHN_ALL,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn set_progress_cb(&mut self, cb: impl FnMut(u64, u64) + 'static) {
        *self.progress.cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_proxy(&mut self, addr: SocketAddr) {
        self.proxy = Some(addr);
    }

    pub fn proxy(&self) -> Option<SocketAddr> {
        self.proxy
    }

    pub fn set_credentials_cb(&mut self, cb: CredentialsCallback) {
        self.credentials_cb = Some(cb);
    }

    pub fn credentials_cb(&mut self) -> Option<&mut CredentialsCallback> {
        self.credentials_cb.as_mut()
    }

    /// Restricts which authentication schemes may be negotiated.
    pub fn set_authn_types(&mut self, types: u32) {
        self.authn_types = types;
    }

    pub fn authn_types(&self) -> u32 {
        self.authn_types
    }

    pub fn connection_create(
        &mut self,
        addr: SocketAddr,
        closed_cb: Option<ClosedCallback>,
    ) -> ConnHandle {
        // connecting through a proxy means dialing the proxy instead
        let dial = self.proxy.unwrap_or(addr);

        let conn = Connection::new(
            dial,
            &self.scope,
            Rc::clone(&self.dirty),
            Rc::clone(&self.progress),
            closed_cb,
        );

        let key = self.entries.insert(IoEntry::Conn(conn));

        debug!("conn {dial}: created (token {key})");

        ConnHandle(key)
    }

    pub fn connection(&self, h: ConnHandle) -> Option<&Connection> {
        match self.entries.get(h.0) {
            Some(IoEntry::Conn(c)) => Some(c),
            _ => None,
        }
    }

    pub fn connection_mut(&mut self, h: ConnHandle) -> Option<&mut Connection> {
        match self.entries.get_mut(h.0) {
            Some(IoEntry::Conn(c)) => Some(c),
            _ => None,
        }
    }

    pub fn connection_close(&mut self, h: ConnHandle) {
        if !matches!(self.entries.get(h.0), Some(IoEntry::Conn(_))) {
            return;
        }

        if let IoEntry::Conn(mut c) = self.entries.remove(h.0) {
            c.reset();
            c.notify_closed(None);
        }
    }

    /// Binds a listening socket. Each accepted inbound socket becomes its
    /// own pollset entry; `handler` is invoked with the inbound socket
    /// bucket whenever it is readable, until the handler reports `Eof`.
    pub fn listener_create(
        &mut self,
        addr: SocketAddr,
        handler: InboundHandler,
    ) -> Result<ListenerHandle> {
        let mut listener = TcpListener::bind(addr)?;

        let entry = self.entries.vacant_entry();
        let key = entry.key();

        match &mut self.pollset {
            PollsetImpl::Own { poll, .. } => {
                poll.registry()
                    .register(&mut listener, Token(key), Interest::READABLE)?;
            }
            PollsetImpl::Custom { add, .. } => {
                add(listener.as_raw_fd(), Interest::READABLE)?;
            }
        }

        let local = listener.local_addr()?;

        entry.insert(IoEntry::Listener(Listener::new(
            listener,
            handler,
            self.scope.child(),
        )));

        debug!("listener {local}: created (token {key})");

        Ok(ListenerHandle(key))
    }

    pub fn listener_addr(&self, h: ListenerHandle) -> Option<SocketAddr> {
        match self.entries.get(h.0) {
            Some(IoEntry::Listener(l)) => l.listener.local_addr().ok(),
            _ => None,
        }
    }

    /// Connects every connection that has work but no socket yet, then
    /// folds pending interest changes into the pollset. Called by `run`;
    /// custom-pollset hosts call it before their own poll.
    pub fn prerun(&mut self) -> Result<()> {
        for (key, entry) in self.entries.iter_mut() {
            let IoEntry::Conn(conn) = entry else {
                continue;
            };

            if !conn.wants_connect() {
                continue;
            }

            trace!("conn {}: opening (token {key})", conn.addr());

            let stream = TcpStream::connect(conn.addr())?;
            stream.set_nodelay(true)?;
            socket2::SockRef::from(&stream).set_keepalive(true)?;

            conn.attach_stream(Rc::new(stream));
        }

        self.check_dirty()
    }

    /// Applies accumulated interest changes, remove-then-add per socket.
    fn check_dirty(&mut self) -> Result<()> {
        if !self.dirty.get() {
            return Ok(());
        }

        self.dirty.set(false);

        for (key, entry) in self.entries.iter_mut() {
            let IoEntry::Conn(conn) = entry else {
                continue;
            };

            if !conn.take_dirty() {
                continue;
            }

            let Some(stream) = conn.raw_stream() else {
                continue;
            };

            let fd = stream.as_raw_fd();
            let desired = conn.desired_interest();

            if conn.registered {
                Self::pollset_remove(&mut self.pollset, fd)?;
                conn.registered = false;
            }

            if let Some(interest) = desired {
                trace!("conn {}: interest {:?}", conn.addr(), interest);

                Self::pollset_add(&mut self.pollset, fd, Token(key), interest)?;
                conn.registered = true;
            }
        }

        Ok(())
    }

    fn pollset_add(
        pollset: &mut PollsetImpl,
        fd: RawFd,
        token: Token,
        interest: Interest,
    ) -> Result<()> {
        match pollset {
            PollsetImpl::Own { poll, .. } => {
                poll.registry().register(&mut SourceFd(&fd), token, interest)?;
            }
            PollsetImpl::Custom { add, .. } => add(fd, interest)?,
        }

        Ok(())
    }

    fn pollset_remove(pollset: &mut PollsetImpl, fd: RawFd) -> Result<()> {
        let res = match pollset {
            PollsetImpl::Own { poll, .. } => poll.registry().deregister(&mut SourceFd(&fd)),
            PollsetImpl::Custom { remove, .. } => remove(fd),
        };

        match res {
            Ok(()) => Ok(()),
            // absent is fine; removal is unconditional before an add
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// One pass of the event loop: prerun, poll, dispatch. A poll timeout
    /// or EINTR is a successful (empty) pass. A handler failing with a
    /// timeout comes back as [`Error::ConnectionTimedOut`]; other errors
    /// propagate unchanged.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.prerun()?;

        let PollsetImpl::Own { poll, events } = &mut self.pollset else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "run requires the built-in pollset",
            )));
        };

        match poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let fired: Vec<(usize, Readiness)> = events
            .iter()
            .map(|ev| {
                (
                    ev.token().0,
                    Readiness {
                        readable: ev.is_readable(),
                        writable: ev.is_writable(),
                        hangup: ev.is_read_closed(),
                        error: ev.is_error(),
                    },
                )
            })
            .collect();

        for (key, readiness) in fired {
            match self.event_trigger(key, readiness) {
                Ok(()) => {}
                Err(e) if e.is_timeup() => return Err(Error::ConnectionTimedOut),
                Err(e) if e.is_again() || e.is_intr() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Dispatches one readiness report to the entry registered under
    /// `key`. Public so custom-pollset hosts can feed events in.
    pub fn event_trigger(&mut self, key: usize, readiness: Readiness) -> Result<()> {
        enum Kind {
            Conn,
            Listener,
            Client,
        }

        let kind = match self.entries.get(key) {
            Some(IoEntry::Conn(_)) => Kind::Conn,
            Some(IoEntry::Listener(_)) => Kind::Listener,
            Some(IoEntry::Client(_)) => Kind::Client,
            None => return Ok(()),
        };

        let result = match kind {
            Kind::Conn => match self.entries.get_mut(key) {
                Some(IoEntry::Conn(c)) => c.process(readiness),
                _ => Ok(()),
            },
            Kind::Listener => self.accept_pending(key),
            Kind::Client => self.client_read(key),
        };

        self.check_dirty()?;

        result
    }

    fn accept_pending(&mut self, key: usize) -> Result<()> {
        let mut accepted = Vec::new();

        if let Some(IoEntry::Listener(l)) = self.entries.get_mut(key) {
            loop {
                match l.listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("listener: accepted {peer}");
                        accepted.push(stream);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        for stream in accepted {
            stream.set_nodelay(true)?;

            let (handler, alloc) = match self.entries.get(key) {
                Some(IoEntry::Listener(l)) => {
                    (Rc::clone(&l.handler), BucketAlloc::new(&l.scope))
                }
                _ => continue,
            };

            let stream = Rc::new(stream);

            let mut sock = SocketBucket::new(Rc::clone(&stream), &alloc);
            sock.set_read_progress(Rc::clone(&self.progress));

            let entry = self.entries.vacant_entry();
            let ckey = entry.key();

            Self::pollset_add(
                &mut self.pollset,
                stream.as_raw_fd(),
                Token(ckey),
                Interest::READABLE,
            )?;

            entry.insert(IoEntry::Client(InboundClient {
                bucket: Some(Box::new(sock)),
                handler,
            }));
        }

        Ok(())
    }

    fn client_read(&mut self, key: usize) -> Result<()> {
        loop {
            let Some(IoEntry::Client(c)) = self.entries.get_mut(key) else {
                return Ok(());
            };

            let handler = Rc::clone(&c.handler);

            let Some(bucket) = c.bucket.as_mut() else {
                return Ok(());
            };

            let result = (handler.borrow_mut())(bucket.as_mut());

            match result {
                Ok(ReadState::More) => continue,
                Ok(ReadState::Eof) => {
                    debug!("client (token {key}): done");

                    self.entries.try_remove(key);

                    return Ok(());
                }
                Err(e) if e.is_again() => return Ok(()),
                Err(e) => {
                    self.entries.try_remove(key);

                    return Err(e);
                }
            }
        }
    }
}
