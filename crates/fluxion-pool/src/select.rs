//! Worker bindings and the selection policy.
//!
//! Every handler's declared database requirements are matched against the
//! bindings' capability sets; the winner is the smallest satisfying worker,
//! ties broken by current load and then id. One binding always covers the
//! full declared set, so selection cannot fail.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::limits::{ExecutorOptions, ExecutorOverrides};
use crate::supervisor::WorkerSupervisor;

/// Base id of the synthesized all-database worker.
pub const FALLBACK_WORKER_ID: &str = "fluxion-worker-all";

/// Worker layout requested by configuration: the `"all"` preset, or an
/// explicit list of workers with capability subsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerStrategy {
    Preset(String),
    Custom(Vec<WorkerSpec>),
}

impl Default for WorkerStrategy {
    fn default() -> Self {
        WorkerStrategy::Preset("all".to_string())
    }
}

/// One user-declared worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    #[serde(default)]
    pub db: Vec<String>,
    #[serde(flatten)]
    pub overrides: ExecutorOverrides,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrategyError {
    #[error("worker strategy preset must be \"all\", got \"{0}\"")]
    UnknownPreset(String),
    #[error("worker id must not be empty")]
    EmptyWorkerId,
    #[error("duplicate worker id \"{0}\"")]
    DuplicateWorkerId(String),
    #[error("worker \"{id}\" references unknown database \"{db}\"")]
    UnknownDatabase { id: String, db: String },
}

/// Check a strategy against the declared database names. All problems are
/// reported, not just the first.
pub fn validate_strategy(strategy: &WorkerStrategy, databases: &[String]) -> Vec<StrategyError> {
    let mut errors = Vec::new();
    match strategy {
        WorkerStrategy::Preset(name) => {
            if name != "all" {
                errors.push(StrategyError::UnknownPreset(name.clone()));
            }
        }
        WorkerStrategy::Custom(specs) => {
            let mut seen = std::collections::HashSet::new();
            for spec in specs {
                if spec.id.is_empty() {
                    errors.push(StrategyError::EmptyWorkerId);
                } else if !seen.insert(spec.id.as_str()) {
                    errors.push(StrategyError::DuplicateWorkerId(spec.id.clone()));
                }
                for db in &spec.db {
                    if !databases.contains(db) {
                        errors.push(StrategyError::UnknownDatabase {
                            id: spec.id.clone(),
                            db: db.clone(),
                        });
                    }
                }
            }
        }
    }
    errors
}

/// A worker plus the capability set it was bound with.
pub struct WorkerBinding {
    pub id: String,
    pub db_set: Vec<String>,
    pub is_fallback_all_db: bool,
    pub supervisor: Arc<WorkerSupervisor>,
}

impl WorkerBinding {
    fn new(id: String, db_set: Vec<String>, is_fallback_all_db: bool, options: ExecutorOptions) -> Arc<Self> {
        let supervisor = WorkerSupervisor::new(id.clone(), db_set.clone(), options);
        Arc::new(Self {
            id,
            db_set,
            is_fallback_all_db,
            supervisor,
        })
    }

    pub fn satisfies(&self, required: &[String]) -> bool {
        required.iter().all(|db| self.db_set.contains(db))
    }
}

/// All bindings for one runtime, with the guaranteed all-db fallback.
pub struct WorkerPool {
    bindings: Vec<Arc<WorkerBinding>>,
    inspect_index: usize,
}

impl WorkerPool {
    /// Build bindings from a validated strategy. The strategy must already
    /// have passed [`validate_strategy`]; errors are returned anyway so
    /// construction stays fail-fast when called directly.
    pub fn build(
        databases: &[String],
        strategy: &WorkerStrategy,
        base_options: &ExecutorOptions,
    ) -> Result<Self, Vec<StrategyError>> {
        let errors = validate_strategy(strategy, databases);
        if !errors.is_empty() {
            return Err(errors);
        }

        let declared = normalized(databases.to_vec());
        let mut bindings: Vec<Arc<WorkerBinding>> = Vec::new();

        if let WorkerStrategy::Custom(specs) = strategy {
            for spec in specs {
                let db_set = normalized(spec.db.clone());
                let options = base_options.with_overrides(&spec.overrides);
                bindings.push(WorkerBinding::new(spec.id.clone(), db_set, false, options));
            }
        }

        let has_all_db = bindings.iter().any(|b| b.db_set == declared);
        if !has_all_db {
            let id = deconflicted_fallback_id(&bindings);
            bindings.push(WorkerBinding::new(
                id,
                declared.clone(),
                true,
                base_options.clone(),
            ));
        }

        let inspect_index = bindings
            .iter()
            .position(|b| b.is_fallback_all_db)
            .or_else(|| bindings.iter().position(|b| b.db_set == declared))
            .unwrap_or(0);

        Ok(Self {
            bindings,
            inspect_index,
        })
    }

    /// Pick the minimal satisfying worker for a requirement set.
    pub fn select(&self, required: &[String]) -> Arc<WorkerBinding> {
        self.bindings
            .iter()
            .filter(|b| b.satisfies(required))
            .min_by(|a, b| {
                (a.db_set.len(), a.supervisor.inflight_count(), &a.id).cmp(&(
                    b.db_set.len(),
                    b.supervisor.inflight_count(),
                    &b.id,
                ))
            })
            .cloned()
            // The all-db fallback satisfies every requirement set.
            .unwrap_or_else(|| Arc::clone(&self.bindings[self.inspect_index]))
    }

    /// The binding used for metadata-only loads.
    pub fn inspect_binding(&self) -> &Arc<WorkerBinding> {
        &self.bindings[self.inspect_index]
    }

    pub fn bindings(&self) -> &[Arc<WorkerBinding>] {
        &self.bindings
    }

    pub async fn close(&self) {
        for binding in &self.bindings {
            binding.supervisor.close().await;
        }
    }
}

fn normalized(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

fn deconflicted_fallback_id(bindings: &[Arc<WorkerBinding>]) -> String {
    let taken = |candidate: &str| bindings.iter().any(|b| b.id == candidate);
    if !taken(FALLBACK_WORKER_ID) {
        return FALLBACK_WORKER_ID.to_string();
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{}-{}", FALLBACK_WORKER_ID, suffix);
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dbs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn spec(id: &str, db: &[&str]) -> WorkerSpec {
        WorkerSpec {
            id: id.to_string(),
            db: dbs(db),
            overrides: ExecutorOverrides::default(),
        }
    }

    #[test]
    fn all_preset_builds_one_fallback_binding() {
        let pool = WorkerPool::build(
            &dbs(&["db1", "db2"]),
            &WorkerStrategy::default(),
            &ExecutorOptions::default(),
        )
        .unwrap();
        assert_eq!(pool.bindings().len(), 1);
        let binding = &pool.bindings()[0];
        assert_eq!(binding.id, FALLBACK_WORKER_ID);
        assert!(binding.is_fallback_all_db);
        assert_eq!(binding.db_set, dbs(&["db1", "db2"]));
    }

    #[test]
    fn custom_strategy_appends_fallback_when_missing() {
        let strategy = WorkerStrategy::Custom(vec![spec("w1", &["db1"])]);
        let pool = WorkerPool::build(
            &dbs(&["db1", "db2"]),
            &strategy,
            &ExecutorOptions::default(),
        )
        .unwrap();
        assert_eq!(pool.bindings().len(), 2);
        assert_eq!(pool.bindings()[0].id, "w1");
        assert!(!pool.bindings()[0].is_fallback_all_db);
        assert_eq!(pool.bindings()[1].id, FALLBACK_WORKER_ID);
        assert!(pool.bindings()[1].is_fallback_all_db);
        assert_eq!(pool.inspect_binding().id, FALLBACK_WORKER_ID);
    }

    #[test]
    fn explicit_all_db_worker_suppresses_fallback() {
        let strategy = WorkerStrategy::Custom(vec![spec("wide", &["db1", "db2"])]);
        let pool = WorkerPool::build(
            &dbs(&["db1", "db2"]),
            &strategy,
            &ExecutorOptions::default(),
        )
        .unwrap();
        assert_eq!(pool.bindings().len(), 1);
        assert!(!pool.bindings()[0].is_fallback_all_db);
        assert_eq!(pool.inspect_binding().id, "wide");
    }

    #[test]
    fn fallback_id_deconflicts_with_user_ids() {
        let strategy = WorkerStrategy::Custom(vec![spec(FALLBACK_WORKER_ID, &["db1"])]);
        let pool = WorkerPool::build(
            &dbs(&["db1", "db2"]),
            &strategy,
            &ExecutorOptions::default(),
        )
        .unwrap();
        assert_eq!(pool.bindings()[1].id, "fluxion-worker-all-2");
        assert!(pool.bindings()[1].is_fallback_all_db);
    }

    #[test]
    fn selection_prefers_smallest_satisfying_set() {
        let strategy = WorkerStrategy::Custom(vec![
            spec("narrow", &["db1"]),
            spec("wide", &["db1", "db2"]),
        ]);
        let pool = WorkerPool::build(
            &dbs(&["db1", "db2"]),
            &strategy,
            &ExecutorOptions::default(),
        )
        .unwrap();

        assert_eq!(pool.select(&dbs(&["db1"])).id, "narrow");
        assert_eq!(pool.select(&dbs(&["db2"])).id, "wide");
        assert_eq!(pool.select(&dbs(&["db1", "db2"])).id, "wide");
        // Empty requirements go to the smallest capability set.
        assert_eq!(pool.select(&[]).id, "narrow");
    }

    #[test]
    fn selection_breaks_size_ties_by_id() {
        let strategy = WorkerStrategy::Custom(vec![
            spec("bravo", &["db1"]),
            spec("alpha", &["db1"]),
        ]);
        let pool = WorkerPool::build(
            &dbs(&["db1"]),
            &strategy,
            &ExecutorOptions::default(),
        )
        .unwrap();
        assert_eq!(pool.select(&dbs(&["db1"])).id, "alpha");
    }

    #[test]
    fn validation_reports_every_problem() {
        let strategy = WorkerStrategy::Custom(vec![
            spec("", &["db1"]),
            spec("w1", &["nope"]),
            spec("w1", &[]),
        ]);
        let errors = validate_strategy(&strategy, &dbs(&["db1"]));
        assert!(errors.contains(&StrategyError::EmptyWorkerId));
        assert!(errors.contains(&StrategyError::DuplicateWorkerId("w1".into())));
        assert!(errors.iter().any(|e| matches!(
            e,
            StrategyError::UnknownDatabase { db, .. } if db == "nope"
        )));
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let errors = validate_strategy(&WorkerStrategy::Preset("some".into()), &[]);
        assert_eq!(errors, vec![StrategyError::UnknownPreset("some".into())]);
    }

    #[test]
    fn strategy_deserializes_both_forms() {
        let all: WorkerStrategy = serde_json::from_str(r#""all""#).unwrap();
        assert!(matches!(all, WorkerStrategy::Preset(name) if name == "all"));

        let custom: WorkerStrategy =
            serde_json::from_str(r#"[{"id": "w1", "db": ["db1"], "maxInflight": 4}]"#).unwrap();
        let WorkerStrategy::Custom(specs) = custom else {
            panic!("expected custom strategy");
        };
        assert_eq!(specs[0].id, "w1");
        assert_eq!(specs[0].overrides.max_inflight, Some(4));
    }
}
