//! Dependency Graph Store.
//!
//! Edges are append-only and the relation must stay a DAG. Cycle checks run
//! inside the same immediate transaction as the insert, so a concurrent
//! writer can never slip in the closing edge between check and write.

mod traversal;

pub use traversal::Traversal;

use rusqlite::{params, Connection, Row};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{Direction, Edge, RelationKind};
use crate::errors::{EngineError, EngineResult};
use crate::registry;
use crate::store::Store;
use crate::utils::{from_millis, now_utc, to_millis};

/// Handle on the edge table of one store.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    store: Arc<Store>,
}

impl DependencyGraph {
    /// Creates a graph over a store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Records `parent -> child`.
    ///
    /// Returns `false` if the identical edge already exists.
    ///
    /// # Errors
    ///
    /// `CycleError` for self-edges and for edges that would close a cycle,
    /// `NotFoundError` if either endpoint is unknown.
    pub fn add_edge(
        &self,
        parent: &str,
        child: &str,
        kind: impl Into<RelationKind>,
    ) -> EngineResult<bool> {
        let edge = Edge {
            parent: parent.to_string(),
            child: child.to_string(),
            kind: kind.into(),
            created_at: now_utc(),
        };

        let inserted = self.store.write(|conn| {
            for endpoint in [parent, child] {
                if !registry::exists(conn, endpoint)? {
                    return Err(EngineError::not_found(endpoint));
                }
            }
            insert_edge(conn, &edge)
        })?;

        if inserted {
            info!(parent, child, kind = %edge.kind, "Added edge");
        } else {
            debug!(parent, child, kind = %edge.kind, "Edge already present");
        }
        Ok(inserted)
    }

    /// Returns the edges on one side of a node.
    pub fn edges_of(&self, pplid: &str, direction: Direction) -> EngineResult<Vec<Edge>> {
        self.store.read(|conn| edges_of(conn, pplid, direction))
    }

    /// Lazily walks every upstream pipeline, nearest first.
    #[must_use]
    pub fn ancestors(&self, pplid: &str) -> Traversal {
        Traversal::new(Arc::clone(&self.store), pplid, Direction::Incoming)
    }

    /// Lazily walks every downstream pipeline, nearest first.
    #[must_use]
    pub fn descendants(&self, pplid: &str) -> Traversal {
        Traversal::new(Arc::clone(&self.store), pplid, Direction::Outgoing)
    }

    /// Returns `pplids` plus all of their ancestors, dependencies first.
    ///
    /// Within one dependency level, identifiers are ordered lexically.
    pub fn dependency_closure(&self, pplids: &[String]) -> EngineResult<Vec<String>> {
        self.store.read(|conn| dependency_closure(conn, pplids))
    }
}

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_edge(raw: (String, String, String, i64)) -> EngineResult<Edge> {
    let (parent, child, kind, created_at_ms) = raw;
    Ok(Edge {
        parent,
        child,
        kind: RelationKind::from(kind.as_str()),
        created_at: from_millis(created_at_ms)?,
    })
}

pub(crate) fn edges_of(conn: &Connection, pplid: &str, direction: Direction) -> EngineResult<Vec<Edge>> {
    let column = match direction {
        Direction::Incoming => "child",
        Direction::Outgoing => "parent",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT parent, child, kind, created_at_ms FROM edges WHERE {column} = ?1 \
         ORDER BY created_at_ms ASC, parent ASC, child ASC"
    ))?;
    let rows = stmt
        .query_map(params![pplid], edge_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode_edge).collect()
}

/// Every edge with `pplid` at either end.
pub(crate) fn edges_touching(conn: &Connection, pplid: &str) -> EngineResult<Vec<Edge>> {
    let mut edges = edges_of(conn, pplid, Direction::Incoming)?;
    edges.extend(
        edges_of(conn, pplid, Direction::Outgoing)?
            .into_iter()
            .filter(|e| e.child != pplid),
    );
    Ok(edges)
}

fn neighbours(conn: &Connection, pplid: &str, direction: Direction) -> EngineResult<Vec<String>> {
    let sql = match direction {
        Direction::Incoming => "SELECT DISTINCT parent FROM edges WHERE child = ?1 ORDER BY parent",
        Direction::Outgoing => "SELECT DISTINCT child FROM edges WHERE parent = ?1 ORDER BY child",
    };
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![pplid], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Finds a downstream path `from -> ... -> to`, if any.
fn downstream_path(conn: &Connection, from: &str, to: &str) -> EngineResult<Option<Vec<String>>> {
    let mut came_from: HashMap<String, String> = HashMap::new();
    let mut seen: HashSet<String> = HashSet::from([from.to_string()]);
    let mut queue: VecDeque<String> = VecDeque::from([from.to_string()]);

    while let Some(node) = queue.pop_front() {
        if node == to {
            let mut path = vec![node];
            while let Some(prev) = came_from.get(path.last().map_or("", String::as_str)) {
                path.push(prev.clone());
            }
            path.reverse();
            return Ok(Some(path));
        }
        for next in neighbours(conn, &node, Direction::Outgoing)? {
            if seen.insert(next.clone()) {
                came_from.insert(next.clone(), node.clone());
                queue.push_back(next);
            }
        }
    }
    Ok(None)
}

/// Cycle-checks and inserts an edge inside an open transaction.
pub(crate) fn insert_edge(conn: &Connection, edge: &Edge) -> EngineResult<bool> {
    if edge.parent == edge.child {
        return Err(EngineError::Cycle {
            parent: edge.parent.clone(),
            child: edge.child.clone(),
            path: vec![edge.parent.clone(), edge.child.clone()],
        });
    }

    if let Some(back) = downstream_path(conn, &edge.child, &edge.parent)? {
        let mut path = Vec::with_capacity(back.len() + 1);
        path.push(edge.parent.clone());
        path.extend(back);
        return Err(EngineError::Cycle {
            parent: edge.parent.clone(),
            child: edge.child.clone(),
            path,
        });
    }

    let changed = conn.execute(
        "INSERT OR IGNORE INTO edges(parent, child, kind, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
        params![
            edge.parent,
            edge.child,
            edge.kind.as_str(),
            to_millis(&edge.created_at)
        ],
    )?;
    Ok(changed == 1)
}

pub(crate) fn dependency_closure(conn: &Connection, pplids: &[String]) -> EngineResult<Vec<String>> {
    let mut members: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for id in pplids {
        if members.insert(id.clone()) {
            queue.push_back(id.clone());
        }
    }
    let mut parents_of: HashMap<String, Vec<String>> = HashMap::new();
    while let Some(node) = queue.pop_front() {
        let parents = neighbours(conn, &node, Direction::Incoming)?;
        for parent in &parents {
            if members.insert(parent.clone()) {
                queue.push_back(parent.clone());
            }
        }
        parents_of.insert(node, parents);
    }

    // Kahn over the closure; every parent of a member is itself a member.
    let mut pending: HashMap<&str, usize> = parents_of
        .iter()
        .map(|(node, parents)| (node.as_str(), parents.len()))
        .collect();
    let mut children_of: HashMap<&str, Vec<&str>> = HashMap::new();
    for (node, parents) in &parents_of {
        for parent in parents {
            children_of.entry(parent.as_str()).or_default().push(node.as_str());
        }
    }
    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, &n)| n == 0)
        .map(|(node, _)| *node)
        .collect();

    let mut ordered = Vec::with_capacity(members.len());
    while let Some(node) = ready.pop_first() {
        ordered.push(node.to_string());
        for child in children_of.get(node).into_iter().flatten() {
            if let Some(count) = pending.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*child);
                }
            }
        }
    }
    Ok(ordered)
}
