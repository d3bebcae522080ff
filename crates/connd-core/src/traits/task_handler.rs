// # Task Handler Trait
//
// Request/response handlers for the narrow IPC surface between the
// daemon and its helper processes. The transport (D-Bus or otherwise)
// lives outside the core; it resolves the task by object path and calls
// `TaskManager::handle_request`, which routes to the handler registered
// for the request's member name.
//
// ## Usage
//
// ```rust,ignore
// use connd_core::{Task, TaskHandler, Result};
// use serde_json::{json, Value};
//
// struct LeaseHandler;
//
// #[async_trait::async_trait]
// impl TaskHandler for LeaseHandler {
//     async fn handle(&self, task: &Task, request: Value) -> Result<Value> {
//         let address = request["address"].as_str().unwrap_or_default();
//         tracing::info!(path = task.path(), address, "lease acquired");
//         Ok(json!({ "ack": true }))
//     }
// }
//
// task.set_notify("Lease", std::sync::Arc::new(LeaseHandler))?;
// ```

use async_trait::async_trait;

use crate::task::Task;

/// Handler for one IPC member of a task
///
/// Handlers run on the transport's task. A returned error is reported
/// back through the transport to the helper; it never reaches the
/// task's exit callback or any other caller.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handle one request addressed to `task`
    async fn handle(
        &self,
        task: &Task,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, crate::Error>;
}
