use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::process::AgentProcess;

/// Running agents keyed by agent id. At most one entry per id.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: RwLock<HashMap<String, Arc<AgentProcess>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `process`, terminating whatever was registered under the same id.
    pub async fn register(&self, process: Arc<AgentProcess>) {
        let agent_id = process.agent_id().to_string();
        let previous = self
            .entries
            .write()
            .await
            .insert(agent_id.clone(), process);
        if let Some(previous) = previous {
            tracing::info!(agent_id = %agent_id, pid = ?previous.pid(), "replacing registered agent process");
            previous.terminate();
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentProcess>> {
        self.entries.read().await.get(agent_id).cloned()
    }

    /// Drops the mapping without touching the process.
    pub async fn remove(&self, agent_id: &str) -> Option<Arc<AgentProcess>> {
        self.entries.write().await.remove(agent_id)
    }

    /// Removes the entry only if it is still `process`, so a newer run is left alone.
    pub async fn remove_if_same(&self, process: &Arc<AgentProcess>) -> bool {
        let mut entries = self.entries.write().await;
        let same = entries
            .get(process.agent_id())
            .is_some_and(|current| Arc::ptr_eq(current, process));
        if same {
            entries.remove(process.agent_id());
        }
        same
    }

    pub async fn snapshot(&self) -> Vec<Arc<AgentProcess>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Terminates and forgets every agent.
    pub async fn terminate_all(&self) {
        let drained: Vec<_> = self.entries.write().await.drain().collect();
        for (agent_id, process) in drained {
            tracing::info!(agent_id = %agent_id, "terminating agent process on shutdown");
            process.terminate();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::artifacts::LaunchSpec;
    use crate::config::RuntimeConfig;
    use crate::process::Termination;

    fn sleeper(agent_id: &str) -> Arc<AgentProcess> {
        let launch = LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            env: HashMap::new(),
            cwd: std::env::temp_dir(),
        };
        AgentProcess::spawn(agent_id, &launch, &RuntimeConfig::default()).expect("spawn sh")
    }

    #[tokio::test]
    async fn register_replaces_and_terminates_previous_entry() {
        let registry = ProcessRegistry::new();
        let first = sleeper("demo");
        let second = sleeper("demo");

        registry.register(first.clone()).await;
        registry.register(second.clone()).await;

        assert_eq!(registry.len().await, 1);
        let current = registry.get("demo").await.expect("entry");
        assert!(Arc::ptr_eq(&current, &second));

        let termination = tokio::time::timeout(Duration::from_secs(5), first.wait_exit())
            .await
            .expect("first process exits");
        assert!(matches!(
            termination,
            Termination::Exited { signal: Some(ref name), .. } if name == "SIGTERM"
        ));

        registry.terminate_all().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_if_same_ignores_newer_runs() {
        let registry = ProcessRegistry::new();
        let old = sleeper("demo");
        let new = sleeper("demo");
        registry.register(new.clone()).await;

        assert!(!registry.remove_if_same(&old).await);
        assert!(registry.get("demo").await.is_some());
        assert!(registry.remove_if_same(&new).await);
        assert!(registry.get("demo").await.is_none());

        old.kill();
        new.kill();
    }
}
