use super::{Task, TaskState};
use crate::config::TaskConfig;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Index of live tasks, keyed by object path
///
/// Paths are `{prefix}/{n}` with `n` counting up from 1 and never
/// reused, even after the task is destroyed.
pub struct TaskManager {
    config: Arc<TaskConfig>,
    next_id: AtomicU64,
    tasks: RwLock<BTreeMap<String, Arc<Task>>>,
}

impl TaskManager {
    /// Create a manager
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid.
    pub fn new(config: TaskConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            next_id: AtomicU64::new(1),
            tasks: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Create a task for `program` in the `Created` state
    pub fn create(&self, program: impl Into<String>) -> Arc<Task> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = if self.config.path_prefix == "/" {
            format!("/{}", id)
        } else {
            format!("{}/{}", self.config.path_prefix, id)
        };

        let task = Arc::new(Task::new(path.clone(), program.into(), Arc::clone(&self.config)));
        debug!(path = %path, program = task.program(), "task created");
        self.tasks.write().insert(path, Arc::clone(&task));
        task
    }

    /// Look up a task by object path
    pub fn get(&self, path: &str) -> Option<Arc<Task>> {
        self.tasks.read().get(path).cloned()
    }

    /// Object paths of all live tasks
    pub fn tasks(&self) -> Vec<String> {
        self.tasks.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Route an IPC request to the task at `path`
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] for an unknown path or member
    /// - [`Error::Ipc`] if the handler fails
    pub async fn handle_request(
        &self,
        path: &str,
        member: &str,
        request: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let task = self
            .get(path)
            .ok_or_else(|| Error::not_found(format!("No task at {}", path)))?;
        task.handle(member, request).await
    }

    /// Remove the task at `path`, stopping it first if it is running
    ///
    /// The exit callback of a stopped task still fires once the child
    /// has been reaped. Returns `false` for an unknown path.
    pub fn destroy(&self, path: &str) -> bool {
        let Some(task) = self.tasks.write().remove(path) else {
            return false;
        };
        task.stop();
        debug!(path, "task destroyed");
        true
    }

    /// Stop every running task
    ///
    /// Returns the number of termination requests issued.
    pub fn shutdown(&self) -> usize {
        let tasks: Vec<Arc<Task>> = self.tasks.read().values().cloned().collect();
        let stopped = tasks
            .iter()
            .filter(|task| task.state() == TaskState::Running)
            .filter(|task| task.stop())
            .count();
        info!(stopped, total = tasks.len(), "task manager shut down");
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_sequential_and_not_reused() {
        let manager = TaskManager::new(TaskConfig::default()).unwrap();
        let a = manager.create("/bin/true");
        let b = manager.create("/bin/true");
        assert_eq!(a.path(), "/task/1");
        assert_eq!(b.path(), "/task/2");

        assert!(manager.destroy("/task/1"));
        assert!(!manager.destroy("/task/1"));

        let c = manager.create("/bin/true");
        assert_eq!(c.path(), "/task/3");
        assert_eq!(manager.tasks(), vec!["/task/2", "/task/3"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TaskConfig {
            path_prefix: "task".to_string(),
            ..Default::default()
        };
        assert!(TaskManager::new(config).is_err());
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let manager = TaskManager::new(TaskConfig::default()).unwrap();
        let err = manager
            .handle_request("/task/9", "Lease", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
