use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::NetplayEvent;

/// Drains queued [`NetplayEvent`]s from a session without allocating.
///
/// Returned by [`NetplaySession::events`](crate::NetplaySession::events). Events not
/// consumed before the drain is dropped are discarded.
///
/// # Examples
///
/// ```ignore
/// for event in session.events() {
///     match event {
///         NetplayEvent::Synchronized { peer, .. } => println!("playing against {peer}"),
///         NetplayEvent::Disconnected { reason } => println!("session over: {reason}"),
///         _ => {}
///     }
/// }
/// ```
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: Drain<'a, NetplayEvent>,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(inner: Drain<'a, NetplayEvent>) -> Self {
        Self { inner }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = NetplayEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for EventDrain<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
    }
}
