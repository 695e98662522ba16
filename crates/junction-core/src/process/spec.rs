//! Static worker table and dependency ordering.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::SupervisorError;

fn default_true() -> bool {
    true
}

fn default_restart_delay_ms() -> u64 {
    2_000
}

fn default_max_restarts() -> u32 {
    5
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

/// Optional health predicate evaluated on every monitor tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthProbe {
    /// Healthy when the command exits 0 within the timeout.
    Command {
        command: Vec<String>,
        #[serde(default = "default_probe_timeout_ms")]
        timeout_ms: u64,
    },
    /// Healthy when the file was modified within `max_age_secs`.
    HeartbeatFile { path: PathBuf, max_age_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Exhausting the restart cap of a critical worker alerts the operator.
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub health: Option<HealthProbe>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            working_dir: None,
            env: BTreeMap::new(),
            auto_restart: true,
            restart_delay_ms: default_restart_delay_ms(),
            max_restarts: default_max_restarts(),
            critical: false,
            depends_on: Vec::new(),
            health: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_restart_delay_ms(mut self, delay_ms: u64) -> Self {
        self.restart_delay_ms = delay_ms;
        self
    }

    pub fn with_health(mut self, probe: HealthProbe) -> Self {
        self.health = Some(probe);
        self
    }
}

/// Topological launch order over `depends_on`. Among workers whose
/// dependencies are satisfied, declaration order decides.
pub fn launch_order(workers: &[WorkerSpec]) -> Result<Vec<&WorkerSpec>, SupervisorError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, w) in workers.iter().enumerate() {
        if w.command.is_empty() {
            return Err(SupervisorError::EmptyCommand {
                worker: w.name.clone(),
            });
        }
        if index.insert(w.name.as_str(), i).is_some() {
            return Err(SupervisorError::DuplicateWorker(w.name.clone()));
        }
    }

    let mut pending: Vec<usize> = vec![0; workers.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); workers.len()];
    for (i, w) in workers.iter().enumerate() {
        for dep in &w.depends_on {
            let &d = index
                .get(dep.as_str())
                .ok_or_else(|| SupervisorError::UnknownDependency {
                    worker: w.name.clone(),
                    dependency: dep.clone(),
                })?;
            pending[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut order = Vec::with_capacity(workers.len());
    let mut done = vec![false; workers.len()];
    while order.len() < workers.len() {
        let Some(next) = (0..workers.len()).find(|&i| !done[i] && pending[i] == 0) else {
            let stuck = (0..workers.len())
                .filter(|&i| !done[i])
                .map(|i| workers[i].name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(SupervisorError::DependencyCycle(stuck));
        };
        done[next] = true;
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
        }
        order.push(&workers[next]);
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(name: &str) -> WorkerSpec {
        WorkerSpec::new(name, vec!["true".into()])
    }

    fn names(order: Vec<&WorkerSpec>) -> Vec<&str> {
        order.into_iter().map(|w| w.name.as_str()).collect()
    }

    #[test]
    fn dependencies_launch_first() {
        let workers = vec![w("web").depends_on("db"), w("db"), w("bot").depends_on("web")];
        assert_eq!(names(launch_order(&workers).unwrap()), vec!["db", "web", "bot"]);
    }

    #[test]
    fn independent_workers_keep_declaration_order() {
        let workers = vec![w("a"), w("b"), w("c")];
        assert_eq!(names(launch_order(&workers).unwrap()), vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_bad_tables() {
        assert!(matches!(
            launch_order(&[w("a"), w("a")]),
            Err(SupervisorError::DuplicateWorker(_))
        ));
        assert!(matches!(
            launch_order(&[w("a").depends_on("ghost")]),
            Err(SupervisorError::UnknownDependency { .. })
        ));
        assert!(matches!(
            launch_order(&[w("a").depends_on("b"), w("b").depends_on("a")]),
            Err(SupervisorError::DependencyCycle(_))
        ));
        assert!(matches!(
            launch_order(&[WorkerSpec::new("empty", Vec::new())]),
            Err(SupervisorError::EmptyCommand { .. })
        ));
    }

    #[test]
    fn toml_defaults() {
        #[derive(Deserialize)]
        struct Table {
            workers: Vec<WorkerSpec>,
        }
        let t: Table = toml::from_str(
            r#"
            [[workers]]
            name = "bot"
            command = ["python3", "bot.py"]

            [workers.health]
            kind = "heartbeat_file"
            path = "/tmp/bot.beat"
            max_age_secs = 30
            "#,
        )
        .unwrap();
        let bot = &t.workers[0];
        assert!(bot.auto_restart);
        assert_eq!(bot.max_restarts, 5);
        assert!(!bot.critical);
        assert!(matches!(bot.health, Some(HealthProbe::HeartbeatFile { max_age_secs: 30, .. })));
    }
}
