//! Process-wide counters of live buffers and graph nodes.
//!
//! Every [`Buffer`](crate::Buffer) and [`Node`](crate::Node) holds a token
//! that increments a counter on creation and decrements it on drop, so the
//! counts only fall when the last reference is released.

use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE_BUFFERS: AtomicUsize = AtomicUsize::new(0);
static LIVE_NODES: AtomicUsize = AtomicUsize::new(0);

/// Point-in-time liveness counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Liveness {
    pub buffers: usize,
    pub nodes: usize,
}

impl Liveness {
    pub fn total(&self) -> usize {
        self.buffers + self.nodes
    }
}

pub fn snapshot() -> Liveness {
    Liveness {
        buffers: LIVE_BUFFERS.load(Ordering::SeqCst),
        nodes: LIVE_NODES.load(Ordering::SeqCst),
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Buffer,
    Node,
}

impl Kind {
    fn counter(self) -> &'static AtomicUsize {
        match self {
            Kind::Buffer => &LIVE_BUFFERS,
            Kind::Node => &LIVE_NODES,
        }
    }
}

/// RAII liveness token. Not `Clone`: one token per tracked object.
#[derive(Debug)]
pub(crate) struct LiveToken(Kind);

impl LiveToken {
    pub(crate) fn buffer() -> Self {
        Self::new(Kind::Buffer)
    }

    pub(crate) fn node() -> Self {
        Self::new(Kind::Node)
    }

    fn new(kind: Kind) -> Self {
        kind.counter().fetch_add(1, Ordering::SeqCst);
        LiveToken(kind)
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.counter().fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total() {
        let l = Liveness { buffers: 2, nodes: 3 };
        assert_eq!(l.total(), 5);
    }
}
