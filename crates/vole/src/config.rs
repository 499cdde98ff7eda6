// Engine configuration
//
// Everything an Engine needs besides the graph: symbolic dimension values,
// the backends to compile for, per-node backend assignments, the tuning
// mode and the worker count. Built with chained `with_*` calls:
//
//   let config = EngineConfig::default()
//       .set_dim("Batch", 4)
//       .with_backend(BackendProfile::simd4_f32())
//       .with_backend(BackendProfile::scalar())
//       .with_autotune(16)
//       .with_workers(4);

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use vole_core::{Error, Result, TuneOptions};
use vole_cpu::BackendProfile;

/// How `select_algorithms` picks schedule parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningMode {
    /// First supported algorithm, heuristic default parameters.
    Heuristic,
    /// Time every supported algorithm and candidate. `budget` caps the
    /// number of manager sweeps per compile; once it runs out the remaining
    /// nodes fall back to the heuristic.
    Autotune { budget: usize },
}

/// Compile-time configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maps symbolic dimension names to concrete values (e.g. "Batch" → 4).
    pub dims: HashMap<String, usize>,
    /// Backend profiles in priority order. Empty means simd4_f32 then scalar.
    pub backends: Vec<BackendProfile>,
    /// Node name → backend names, overriding the graph's own assignment.
    pub assignments: HashMap<String, Vec<String>>,
    pub tuning: TuningMode,
    /// Trial settings used when autotuning.
    pub tune: TuneOptions,
    /// Threads in the worker pool.
    pub workers: usize,
    /// Record per-node execution times in every `Session::run`.
    pub profiling: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dims: HashMap::new(),
            backends: Vec::new(),
            assignments: HashMap::new(),
            tuning: TuningMode::Heuristic,
            tune: TuneOptions::default(),
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            profiling: false,
        }
    }
}

impl EngineConfig {
    /// Set a symbolic dimension value.
    pub fn set_dim(mut self, name: impl Into<String>, value: usize) -> Self {
        self.dims.insert(name.into(), value);
        self
    }

    /// Append a backend; earlier backends take priority.
    pub fn with_backend(mut self, profile: BackendProfile) -> Self {
        self.backends.push(profile);
        self
    }

    /// Enable autotuning with at most `budget` manager sweeps.
    pub fn with_autotune(mut self, budget: usize) -> Self {
        self.tuning = TuningMode::Autotune { budget };
        self
    }

    pub fn with_tune_options(mut self, tune: TuneOptions) -> Self {
        self.tune = tune;
        self
    }

    /// Soft per-candidate budget, checked between timed iterations.
    pub fn with_candidate_timeout(mut self, limit: Duration) -> Self {
        self.tune.candidate_timeout = Some(limit);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Restrict the node named `node` to `backends`, in priority order.
    pub fn assign(mut self, node: impl Into<String>, backends: &[&str]) -> Self {
        self.assignments
            .insert(node.into(), backends.iter().map(|b| b.to_string()).collect());
        self
    }

    pub fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    /// The configured backends, or the default pair.
    pub fn backend_profiles(&self) -> Vec<BackendProfile> {
        if self.backends.is_empty() {
            vec![BackendProfile::simd4_f32(), BackendProfile::scalar()]
        } else {
            self.backends.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid("worker count must be positive"));
        }
        if self.tune.bench_iters == 0 {
            return Err(Error::invalid("autotuning needs at least one timed iteration"));
        }
        let mut seen = HashSet::new();
        for p in &self.backends {
            if !seen.insert(p.name()) {
                return Err(Error::invalid(format!(
                    "backend '{}' is configured twice",
                    p.name()
                )));
            }
        }
        let names: HashSet<String> = self
            .backend_profiles()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        for (node, list) in &self.assignments {
            if let Some(bad) = list.iter().find(|b| !names.contains(*b)) {
                return Err(Error::invalid(format!(
                    "node '{node}' is assigned to unknown backend '{bad}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let c = EngineConfig::default()
            .set_dim("Batch", 4)
            .with_backend(BackendProfile::scalar())
            .with_autotune(3)
            .with_workers(2)
            .assign("conv1", &["scalar"])
            .with_candidate_timeout(Duration::from_millis(5))
            .with_profiling(true);
        assert_eq!(c.dims["Batch"], 4);
        assert_eq!(c.tuning, TuningMode::Autotune { budget: 3 });
        assert_eq!(c.tune.candidate_timeout, Some(Duration::from_millis(5)));
        assert_eq!(c.backend_profiles().len(), 1);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_default_backends() {
        let names: Vec<String> = EngineConfig::default()
            .backend_profiles()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["simd4_f32", "scalar"]);
    }

    #[test]
    fn test_validation_errors() {
        assert!(EngineConfig::default().with_workers(0).validate().is_err());
        let dup = EngineConfig::default()
            .with_backend(BackendProfile::scalar())
            .with_backend(BackendProfile::scalar());
        assert!(dup.validate().is_err());
        let unknown = EngineConfig::default().assign("n", &["gpu"]);
        assert!(unknown.validate().is_err());
    }
}
