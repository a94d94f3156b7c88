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

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

struct ScopeInner {
    parent: Option<Rc<ScopeInner>>,
    live: Cell<usize>,
}

impl ScopeInner {
    fn incr(&self) {
        self.live.set(self.live.get() + 1);

        if let Some(p) = &self.parent {
            p.incr();
        }
    }

    fn decr(&self) {
        self.live.set(self.live.get() - 1);

        if let Some(p) = &self.parent {
            p.decr();
        }
    }
}

/// An explicit lifetime scope. The context, each connection and each request
/// own one, arranged in a tree. Rust ownership performs the actual release
/// of objects; the scope tallies what is still alive within it (and its
/// children), so teardown is observable.
///
/// Cloning a `Scope` yields another handle to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                parent: None,
                live: Cell::new(0),
            }),
        }
    }

    /// Creates a child scope. Allocations in the child are also counted
    /// against this scope.
    pub fn child(&self) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                parent: Some(Rc::clone(&self.inner)),
                live: Cell::new(0),
            }),
        }
    }

    /// Number of allocations currently charged to this scope, including
    /// those in child scopes.
    pub fn live(&self) -> usize {
        self.inner.live.get()
    }

    fn incr(&self) {
        self.inner.incr();
    }

    fn decr(&self) {
        self.inner.decr();
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// The allocator buckets obtain their memory through. Bound to a scope;
/// every bucket record and every [`Mem`] block is tallied against that
/// scope until dropped. Buckets created from an allocator must be released
/// by dropping them, individually or wholesale by dropping whatever owns
/// the scope.
#[derive(Clone)]
pub struct BucketAlloc {
    scope: Scope,
}

impl BucketAlloc {
    pub fn new(scope: &Scope) -> Self {
        Self {
            scope: scope.child(),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Allocates a zeroed block of `size` bytes charged to this allocator.
    pub fn mem_alloc(&self, size: usize) -> Mem {
        self.scope.incr();

        Mem {
            buf: vec![0; size],
            scope: self.scope.clone(),
        }
    }

    pub(crate) fn charge(&self) {
        self.scope.incr();
    }

    pub(crate) fn discharge(&self) {
        self.scope.decr();
    }
}

/// A block of bucket-owned memory. Freed by dropping.
pub struct Mem {
    buf: Vec<u8>,
    scope: Scope,
}

impl Drop for Mem {
    fn drop(&mut self) {
        self.scope.decr();
    }
}

impl Deref for Mem {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for Mem {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn live_counting() {
        let root = Scope::new();
        assert_eq!(root.live(), 0);

        let alloc = BucketAlloc::new(&root);

        let m1 = alloc.mem_alloc(16);
        let m2 = alloc.mem_alloc(32);
        assert_eq!(m1.len(), 16);
        assert_eq!(m2.len(), 32);
        assert_eq!(root.live(), 2);
        assert_eq!(alloc.scope().live(), 2);

        mem::drop(m1);
        assert_eq!(root.live(), 1);

        mem::drop(m2);
        assert_eq!(root.live(), 0);
    }

    #[test]
    fn child_scopes_bubble_up() {
        let root = Scope::new();
        let conn = root.child();
        let req = conn.child();

        let alloc = BucketAlloc::new(&req);
        let m = alloc.mem_alloc(8);

        assert_eq!(req.live(), 1);
        assert_eq!(conn.live(), 1);
        assert_eq!(root.live(), 1);

        mem::drop(m);
        assert_eq!(root.live(), 0);

        // dropping the request scope handle doesn't affect siblings
        let other = conn.child();
        let alloc2 = BucketAlloc::new(&other);
        let m2 = alloc2.mem_alloc(8);
        mem::drop(req);
        assert_eq!(conn.live(), 1);
        mem::drop(m2);
        assert_eq!(conn.live(), 0);
    }

    #[test]
    fn mem_is_writable() {
        let root = Scope::new();
        let alloc = BucketAlloc::new(&root);

        let mut m = alloc.mem_alloc(5);
        m.copy_from_slice(b"hello");
        assert_eq!(&*m, b"hello");
    }
}
