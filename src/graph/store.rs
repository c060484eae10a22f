//! Transactional graph storage interface and its in-process implementation
//!
//! Properties and scripts never touch storage directly; they go through a
//! `GraphTransaction`. `MemoryGraph` hands out snapshot transactions: all
//! reads and writes hit a private working copy which is merged back on
//! commit, so an abandoned transaction leaves no trace.
//!
//! Commits are optimistic. A transaction fails with `GraphError::Conflict`
//! when, since its snapshot was taken, another commit wrote an entity it
//! also wrote, changed what one of its queries would return, attached a
//! relationship to a node it deletes, or removed an endpoint of a
//! relationship it created.

use crate::graph::entity::{Entity, EntityKind};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

/// Storage level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Relationship endpoint {id} is not a node")]
    InvalidEndpoint { id: String },

    /// A concurrent commit invalidated this transaction; carries the id
    /// that collided
    #[error("Concurrent modification of {0}")]
    Conflict(String),
}

/// Which end of a relationship a node sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The node is the relationship's source
    Outgoing,
    /// The node is the relationship's target
    Incoming,
}

/// Operations the core needs from a storage engine inside one transaction
pub trait GraphTransaction {
    fn get(&self, id: &str) -> Option<&Entity>;

    /// Create an empty node of the given type and return its id
    fn create_node(&mut self, type_name: &str) -> String;

    fn create_relationship(
        &mut self,
        type_name: &str,
        rel: &str,
        source_id: &str,
        target_id: &str,
    ) -> Result<String, GraphError>;

    /// Set (`Some`) or remove (`None`) a persisted property value
    fn set_property(&mut self, id: &str, key: &str, value: Option<JsonValue>) -> Result<(), GraphError>;

    /// Delete an entity; deleting a node also deletes its relationships.
    /// Returns every deleted id.
    fn delete(&mut self, id: &str) -> Result<Vec<String>, GraphError>;

    /// Nodes of any of the given types whose `key` equals `value`
    fn find(&self, types: &[String], key: &str, value: &JsonValue) -> Vec<&Entity>;

    /// Relationships of the given definition attached to `node_id` on one side
    fn relationships(&self, node_id: &str, type_name: &str, direction: Direction) -> Vec<&Entity>;
}

#[derive(Debug, Default)]
struct Committed {
    entities: HashMap<String, Entity>,
    /// Revision of the last commit that wrote each id, deleted ids included
    revisions: HashMap<String, u64>,
    revision: u64,
}

/// In-process graph store
#[derive(Debug)]
pub struct MemoryGraph {
    state: RwLock<Committed>,
    sequence: AtomicU64,
    /// Ids of notifying commits
    changes: broadcast::Sender<Vec<String>>,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: RwLock::default(),
            sequence: AtomicU64::new(0),
            changes,
        }
    }
}

/// A query a transaction ran, re-checked against concurrent commits
#[derive(Debug, Clone)]
enum Observation {
    Find {
        types: Vec<String>,
        key: String,
        value: JsonValue,
    },
    Relationships {
        node_id: String,
        type_name: String,
        direction: Direction,
    },
}

impl Observation {
    fn matches(&self, entity: &Entity) -> bool {
        match self {
            Observation::Find { types, key, value } => {
                entity.is_node()
                    && types.contains(&entity.type_name)
                    && (entity.properties.get(key) == Some(value) || (key == "id" && value.as_str() == Some(&entity.id)))
            }
            Observation::Relationships {
                node_id,
                type_name,
                direction,
            } => {
                entity.type_name == *type_name
                    && match direction {
                        Direction::Outgoing => entity.source_id() == Some(node_id),
                        Direction::Incoming => entity.target_id() == Some(node_id),
                    }
            }
        }
    }
}

/// Snapshot transaction over a `MemoryGraph`
#[derive(Debug)]
pub struct MemoryTransaction<'g> {
    graph: &'g MemoryGraph,
    /// Revision the snapshot was taken at
    snapshot: u64,
    working: HashMap<String, Entity>,
    modified: BTreeSet<String>,
    observed: RefCell<Vec<Observation>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction on a snapshot of the current state
    pub fn begin(&self) -> MemoryTransaction<'_> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        MemoryTransaction {
            graph: self,
            snapshot: state.revision,
            working: state.entities.clone(),
            modified: BTreeSet::new(),
            observed: RefCell::default(),
        }
    }

    /// Receive the modified ids of every notifying commit
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.changes.subscribe()
    }

    /// Committed entity by id
    pub fn get(&self, id: &str) -> Option<Entity> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entities
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entities
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl MemoryTransaction<'_> {
    /// Merge modified entities back into the store and return their ids.
    /// Only touched ids are written, so concurrent transactions on
    /// disjoint entities do not overwrite each other.
    pub fn commit(self) -> Result<Vec<String>, GraphError> {
        self.commit_notifying(false)
    }

    /// Commit, publishing the modified ids to subscribers when `notify` is set
    pub fn commit_notifying(self, notify: bool) -> Result<Vec<String>, GraphError> {
        let graph = self.graph;
        let mut state = graph.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = self.conflict(&state) {
            tracing::warn!("⚠️ Rejected commit of {} entities: {} changed concurrently", self.modified.len(), id);
            return Err(GraphError::Conflict(id));
        }

        state.revision += 1;
        let revision = state.revision;
        let mut working = self.working;
        for id in &self.modified {
            match working.remove(id) {
                Some(entity) => {
                    state.entities.insert(id.clone(), entity);
                }
                None => {
                    state.entities.remove(id);
                }
            }
            state.revisions.insert(id.clone(), revision);
        }
        drop(state);
        tracing::debug!("💾 Committed {} modified entities", self.modified.len());

        let ids: Vec<String> = self.modified.into_iter().collect();
        if notify && !ids.is_empty() {
            // no subscribers is fine
            let _ = graph.changes.send(ids.clone());
        }
        Ok(ids)
    }

    /// Ids touched so far in this transaction
    pub fn modified(&self) -> impl Iterator<Item = &String> {
        self.modified.iter()
    }

    fn deletes(&self, id: &str) -> bool {
        self.modified.contains(id) && !self.working.contains_key(id)
    }

    /// First id that makes this transaction stale against `state`
    fn conflict(&self, state: &Committed) -> Option<String> {
        let observed = self.observed.borrow();
        for (id, revision) in &state.revisions {
            if *revision <= self.snapshot {
                continue;
            }
            if self.modified.contains(id) {
                return Some(id.clone());
            }
            // both the version this transaction saw and the one committed since
            for entity in state.entities.get(id).into_iter().chain(self.working.get(id)) {
                if observed.iter().any(|observation| observation.matches(entity)) {
                    return Some(id.clone());
                }
                if [entity.source_id(), entity.target_id()]
                    .into_iter()
                    .flatten()
                    .any(|end| self.deletes(end))
                {
                    return Some(id.clone());
                }
            }
        }

        for id in &self.modified {
            let Some(entity) = self.working.get(id) else {
                continue;
            };
            for end in [entity.source_id(), entity.target_id()].into_iter().flatten() {
                let created_here = self.modified.contains(end) && self.working.contains_key(end);
                if !state.entities.contains_key(end) && !created_here {
                    return Some(end.to_string());
                }
            }
        }
        None
    }

    fn observe(&self, observation: Observation) -> Vec<&Entity> {
        let mut found: Vec<&Entity> = self.working.values().filter(|e| observation.matches(e)).collect();
        found.sort_by_key(|e| e.seq);
        self.observed.borrow_mut().push(observation);
        found
    }
}

impl GraphTransaction for MemoryTransaction<'_> {
    fn get(&self, id: &str) -> Option<&Entity> {
        self.working.get(id)
    }

    fn create_node(&mut self, type_name: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut entity = Entity::node(id.clone(), type_name);
        entity.seq = self.graph.next_seq();
        self.working.insert(id.clone(), entity);
        self.modified.insert(id.clone());
        id
    }

    fn create_relationship(
        &mut self,
        type_name: &str,
        rel: &str,
        source_id: &str,
        target_id: &str,
    ) -> Result<String, GraphError> {
        for endpoint in [source_id, target_id] {
            match self.working.get(endpoint) {
                Some(entity) if entity.is_node() => {}
                Some(_) => return Err(GraphError::InvalidEndpoint { id: endpoint.to_string() }),
                None => return Err(GraphError::NotFound(endpoint.to_string())),
            }
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let entity = Entity {
            id: id.clone(),
            type_name: type_name.to_string(),
            kind: EntityKind::Relationship {
                rel: rel.to_string(),
                source_id: source_id.to_string(),
                target_id: target_id.to_string(),
            },
            properties: Default::default(),
            seq: self.graph.next_seq(),
        };
        self.working.insert(id.clone(), entity);
        self.modified.insert(id.clone());
        Ok(id)
    }

    fn set_property(&mut self, id: &str, key: &str, value: Option<JsonValue>) -> Result<(), GraphError> {
        let entity = self
            .working
            .get_mut(id)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        match value {
            Some(value) => entity.properties.insert(key.to_string(), value),
            None => entity.properties.remove(key),
        };
        self.modified.insert(id.to_string());
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<Vec<String>, GraphError> {
        let entity = self
            .working
            .remove(id)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        let mut deleted = vec![id.to_string()];

        if entity.is_node() {
            let attached: Vec<String> = self
                .working
                .values()
                .filter(|e| e.source_id() == Some(id) || e.target_id() == Some(id))
                .map(|e| e.id.clone())
                .collect();
            for rel_id in attached {
                self.working.remove(&rel_id);
                deleted.push(rel_id);
            }
        }

        self.modified.extend(deleted.iter().cloned());
        Ok(deleted)
    }

    fn find(&self, types: &[String], key: &str, value: &JsonValue) -> Vec<&Entity> {
        self.observe(Observation::Find {
            types: types.to_vec(),
            key: key.to_string(),
            value: value.clone(),
        })
    }

    fn relationships(&self, node_id: &str, type_name: &str, direction: Direction) -> Vec<&Entity> {
        self.observe(Observation::Relationships {
            node_id: node_id.to_string(),
            type_name: type_name.to_string(),
            direction,
        })
    }
}
