use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use super::neighbours;
use crate::core::Direction;
use crate::errors::EngineResult;
use crate::store::Store;

/// Lazy breadth-first walk over the edge relation.
///
/// Each expanded node costs one edge lookup in its own read transaction, so
/// the walk never holds the store for longer than a single query and stops
/// issuing queries as soon as the caller stops pulling.
pub struct Traversal {
    store: Arc<Store>,
    direction: Direction,
    seen: HashSet<String>,
    frontier: VecDeque<String>,
    ready: VecDeque<String>,
    failed: bool,
}

impl Traversal {
    pub(super) fn new(store: Arc<Store>, start: &str, direction: Direction) -> Self {
        Self {
            store,
            direction,
            seen: HashSet::from([start.to_string()]),
            frontier: VecDeque::from([start.to_string()]),
            ready: VecDeque::new(),
            failed: false,
        }
    }

    /// Returns which way the walk follows edges.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl Iterator for Traversal {
    type Item = EngineResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while self.ready.is_empty() {
            let node = self.frontier.pop_front()?;
            let found = self
                .store
                .read(|conn| neighbours(conn, &node, self.direction));
            match found {
                Ok(ids) => {
                    for id in ids {
                        if self.seen.insert(id.clone()) {
                            self.frontier.push_back(id.clone());
                            self.ready.push_back(id);
                        }
                    }
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        self.ready.pop_front().map(Ok)
    }
}

impl std::fmt::Debug for Traversal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Traversal")
            .field("direction", &self.direction)
            .field("visited", &self.seen.len())
            .field("pending", &self.frontier.len())
            .finish()
    }
}
