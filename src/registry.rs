// =============================================================================
// Task Registry & DAG (C5) — definitions, schedules, dependency edges
// =============================================================================
//
// Registration validates the dependency graph is acyclic (Kahn's algorithm)
// and that every referenced predecessor exists, per spec.md §4.5. A
// TaskDefinition is immutable once registered for a given (id, version);
// `disable` soft-deletes without mutating history.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::types::{ActionKind, ProtocolId, TaskId, WalletId};

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Exactly one trigger per definition, enforced by the enum itself rather
/// than a validation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Cron { expr: String, tz: String },
    Interval { period_secs: u64, jitter_secs: u64 },
    OneShot { at: DateTime<Utc> },
}

impl Trigger {
    /// Next fire time at or after `after`, per spec.md §4.6's "fired at or
    /// after the scheduled time."
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::OneShot { at } => {
                if *at >= after {
                    Some(*at)
                } else {
                    None
                }
            }
            Trigger::Interval { period_secs, .. } => {
                Some(after + chrono::Duration::seconds(*period_secs as i64))
            }
            Trigger::Cron { expr, tz } => {
                let schedule: cron::Schedule = expr.parse().ok()?;
                let tz: Tz = tz.parse().ok()?;
                let after_tz = after.with_timezone(&tz);
                schedule.after(&after_tz).next().map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub version: u32,
    pub action_kind: ActionKind,
    pub protocol_id: ProtocolId,
    /// The wallet this task's actions are executed from. One task definition
    /// always targets one wallet, so the Scheduler Engine can serialize
    /// attempts per wallet (spec.md §5) without consulting the param template.
    pub wallet_id: WalletId,
    pub trigger: Trigger,
    pub priority: i32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub deps: Vec<TaskId>,
    pub params: serde_json::Value,
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct TaskRegistry {
    definitions: RwLock<HashMap<TaskId, TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new definition, validating acyclicity and that every
    /// dependency already exists in the registry.
    pub fn register(&self, def: TaskDefinition) -> Result<(), RegistryError> {
        let mut definitions = self.definitions.write();

        if definitions.contains_key(&def.id) {
            return Err(RegistryError::AlreadyRegistered(def.id.clone()));
        }

        for dep in &def.deps {
            if !definitions.contains_key(dep) {
                return Err(RegistryError::UnknownDependency {
                    task: def.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let mut trial = definitions.clone();
        trial.insert(def.id.clone(), def.clone());
        if let Some(cycle_node) = find_cycle(&trial) {
            return Err(RegistryError::CycleDetected(cycle_node));
        }

        definitions.insert(def.id.clone(), def);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskDefinition> {
        self.definitions.read().get(id).cloned()
    }

    pub fn all_enabled(&self) -> Vec<TaskDefinition> {
        self.definitions.read().values().filter(|d| d.enabled).cloned().collect()
    }

    /// Soft-delete: marks disabled, never mutates history in place.
    pub fn disable(&self, id: &TaskId) -> Result<(), RegistryError> {
        let mut definitions = self.definitions.write();
        let def = definitions.get_mut(id).ok_or_else(|| RegistryError::UnknownTask(id.clone()))?;
        def.enabled = false;
        Ok(())
    }

    /// Direct successors of `task_id` (tasks whose `deps` include it),
    /// consulted by the Scheduler Engine to decide who may fire next.
    pub fn ready_successors(&self, task_id: &TaskId) -> Vec<TaskId> {
        self.definitions
            .read()
            .values()
            .filter(|d| d.enabled && d.deps.contains(task_id))
            .map(|d| d.id.clone())
            .collect()
    }

    pub fn predecessors(&self, task_id: &TaskId) -> Vec<TaskId> {
        self.definitions
            .read()
            .get(task_id)
            .map(|d| d.deps.clone())
            .unwrap_or_default()
    }

    /// All descendants of `task_id` (transitive successors), used to cascade
    /// a `CANCELLED(upstream_failed)` per spec.md §4.5 / S3.
    pub fn descendants(&self, task_id: &TaskId) -> HashSet<TaskId> {
        let definitions = self.definitions.read();
        let mut result = HashSet::new();
        let mut queue = VecDeque::from([task_id.clone()]);
        while let Some(current) = queue.pop_front() {
            for def in definitions.values() {
                if def.deps.contains(&current) && result.insert(def.id.clone()) {
                    queue.push_back(def.id.clone());
                }
            }
        }
        result
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Kahn's algorithm: returns the id of a node still unprocessed once no more
/// zero-in-degree nodes remain (i.e. a node participating in a cycle), or
/// `None` if the graph is acyclic.
fn find_cycle(definitions: &HashMap<TaskId, TaskDefinition>) -> Option<TaskId> {
    let mut in_degree: HashMap<&TaskId, usize> = definitions.keys().map(|id| (id, 0)).collect();
    for def in definitions.values() {
        for dep in &def.deps {
            // dep -> def.id edge; def.id's in-degree counts predecessors.
            if let Some(count) = in_degree.get_mut(&def.id) {
                if definitions.contains_key(dep) {
                    *count += 1;
                }
            }
        }
    }

    let mut queue: VecDeque<&TaskId> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        let successors: Vec<&TaskId> = definitions
            .values()
            .filter(|d| d.deps.contains(id))
            .map(|d| &d.id)
            .collect();
        for succ in successors {
            let count = in_degree.get_mut(succ).unwrap();
            *count -= 1;
            if *count == 0 {
                queue.push_back(succ);
            }
        }
    }

    if visited == definitions.len() {
        None
    } else {
        in_degree
            .into_iter()
            .find(|(_, deg)| *deg > 0)
            .map(|(id, _)| id.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, deps: &[&str]) -> TaskDefinition {
        TaskDefinition {
            id: TaskId(id.into()),
            version: 1,
            action_kind: ActionKind::Claim,
            protocol_id: ProtocolId("scroll".into()),
            wallet_id: WalletId("w1".into()),
            trigger: Trigger::OneShot { at: Utc::now() },
            priority: 0,
            max_retries: 3,
            timeout_secs: 30,
            deps: deps.iter().map(|d| TaskId((*d).into())).collect(),
            params: serde_json::json!({}),
            enabled: true,
        }
    }

    #[test]
    fn registers_acyclic_chain() {
        let registry = TaskRegistry::new();
        registry.register(def("a", &[])).unwrap();
        registry.register(def("b", &["a"])).unwrap();
        registry.register(def("c", &["b"])).unwrap();
        assert_eq!(registry.ready_successors(&TaskId("a".into())), vec![TaskId("b".into())]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let registry = TaskRegistry::new();
        let result = registry.register(def("b", &["a"]));
        assert!(matches!(result, Err(RegistryError::UnknownDependency { .. })));
    }

    #[test]
    fn rejects_cycle() {
        let registry = TaskRegistry::new();
        registry.register(def("a", &[])).unwrap();
        registry.register(def("b", &["a"])).unwrap();
        // c depends on b, but also forges a dependency back onto a "d" that
        // will in turn depend on c, closing a cycle c -> d -> c.
        registry.register(def("c", &["b"])).unwrap();
        let mut d = def("d", &["c"]);
        // Sneak a self-referential edge in by registering under an id that
        // already appears as one of its own (not-yet-existing) dependents is
        // impossible through the public API, so exercise the cycle check
        // directly against a hand-built map instead.
        d.deps = vec![TaskId("c".into())];
        registry.register(d).unwrap();

        let mut raw = HashMap::new();
        raw.insert(TaskId("x".into()), {
            let mut t = def("x", &[]);
            t.deps = vec![TaskId("y".into())];
            t
        });
        raw.insert(TaskId("y".into()), {
            let mut t = def("y", &[]);
            t.deps = vec![TaskId("x".into())];
            t
        });
        assert!(find_cycle(&raw).is_some());
    }

    #[test]
    fn descendants_are_transitive_for_cascade_cancel_s3() {
        let registry = TaskRegistry::new();
        registry.register(def("a", &[])).unwrap();
        registry.register(def("b", &["a"])).unwrap();
        registry.register(def("c", &["b"])).unwrap();
        let descendants = registry.descendants(&TaskId("a".into()));
        assert!(descendants.contains(&TaskId("b".into())));
        assert!(descendants.contains(&TaskId("c".into())));
    }

    #[test]
    fn disable_soft_deletes() {
        let registry = TaskRegistry::new();
        registry.register(def("a", &[])).unwrap();
        registry.disable(&TaskId("a".into())).unwrap();
        assert!(registry.all_enabled().is_empty());
        assert!(registry.get(&TaskId("a".into())).is_some());
    }
}
