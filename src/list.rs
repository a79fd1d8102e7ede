// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait lists for blocked contexts.
//!
//! A [`WaitList`] records the contexts blocked on one primitive, in the order
//! they should be released. Each entry carries:
//!
//! - the waiting context,
//! - its priority, captured when it joined (later priority changes don't
//!   reorder an in-progress wait),
//! - a per-waiter condition `W` (the event mask, for instance), and
//! - once it has been chosen, the *grant* `G` it was handed.
//!
//! A context waits on at most one thing at a time, so its id names its
//! entry.
//!
//! Granting and claiming are separate steps. The releasing side picks a waiter
//! and leaves the grant in its entry, all inside the critical section, and
//! unparks it. The waiter, when it next runs, claims the grant and leaves.
//! Because the resource is already assigned by then, nobody arriving in
//! between can take it.
//!
//! In [`Order::Priority`] lists, higher priorities sit closer to the front,
//! with equal priorities kept in arrival order. In [`Order::Fifo`] lists,
//! arrival order is all that matters.

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::port::ContextId;
use crate::task::Priority;

/// Release order of a wait list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Order {
    Fifo,
    Priority,
}

/// Result of trying to claim a grant.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Claim<G> {
    /// The entry was granted; it has been removed.
    Granted(G),
    /// Still waiting.
    Pending,
    /// The entry is gone (withdrawn on the waiter's behalf).
    Missing,
}

struct Node<W, G> {
    ctx: ContextId,
    priority: Priority,
    want: W,
    grant: Option<G>,
}

pub(crate) struct WaitList<W = (), G = ()> {
    nodes: Vec<Node<W, G>>,
    order: Order,
}

impl<W, G> WaitList<W, G> {
    pub(crate) const fn new(order: Order) -> Self {
        Self { nodes: Vec::new(), order }
    }

    /// Adds a waiter.
    pub(crate) fn insert(&mut self, ctx: ContextId, priority: Priority, want: W) -> Result<()> {
        self.nodes.try_reserve(1).map_err(|_| Error::MemAllocFailure)?;

        let at = match self.order {
            Order::Fifo => self.nodes.len(),
            // Skip past everyone at our priority or better.
            Order::Priority => self
                .nodes
                .iter()
                .position(|n| n.priority < priority)
                .unwrap_or(self.nodes.len()),
        };
        self.nodes.insert(at, Node { ctx, priority, want, grant: None });
        Ok(())
    }

    /// Number of waiters that haven't been granted anything yet.
    pub(crate) fn pending(&self) -> usize {
        self.nodes.iter().filter(|n| n.grant.is_none()).count()
    }

    /// Hands `grant` to the first pending waiter and returns its context so
    /// it can be unparked. Gives the grant back if nobody is pending.
    pub(crate) fn grant_next(&mut self, grant: G) -> core::result::Result<ContextId, G> {
        match self.nodes.iter_mut().find(|n| n.grant.is_none()) {
            Some(n) => {
                n.grant = Some(grant);
                Ok(n.ctx)
            }
            None => Err(grant),
        }
    }

    /// Offers a grant to every pending waiter, front to back. `decide` sees
    /// each waiter's condition and returns the grant to give it, if any.
    pub(crate) fn grant_each(
        &mut self,
        mut decide: impl FnMut(&W) -> Option<G>,
        wake: &mut dyn FnMut(ContextId),
    ) {
        for n in self.nodes.iter_mut().filter(|n| n.grant.is_none()) {
            if let Some(g) = decide(&n.want) {
                n.grant = Some(g);
                wake(n.ctx);
            }
        }
    }

    /// Takes the grant for `ctx`, if there is one.
    pub(crate) fn claim(&mut self, ctx: ContextId) -> Claim<G> {
        let Some(i) = self.nodes.iter().position(|n| n.ctx == ctx) else {
            return Claim::Missing;
        };
        if self.nodes[i].grant.is_none() {
            return Claim::Pending;
        }
        match self.nodes.remove(i).grant {
            Some(g) => Claim::Granted(g),
            None => Claim::Missing,
        }
    }

    /// Removes `ctx`'s entry, returning any grant it had been handed but not
    /// yet claimed.
    pub(crate) fn withdraw(&mut self, ctx: ContextId) -> Option<G> {
        let i = self.nodes.iter().position(|n| n.ctx == ctx)?;
        self.nodes.remove(i).grant
    }

    /// Takes back every outstanding grant, returning those waiters to the
    /// pending state. Returns how many grants were revoked.
    pub(crate) fn revoke_all(&mut self) -> usize {
        let mut n = 0;
        for node in &mut self.nodes {
            if node.grant.take().is_some() {
                n += 1;
            }
        }
        n
    }

    /// Empties the list, waking everyone in it.
    pub(crate) fn drain(&mut self, wake: &mut dyn FnMut(ContextId)) {
        for n in self.nodes.drain(..) {
            wake(n.ctx);
        }
    }
}
