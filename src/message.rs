//! Typed message shapes for the three inbound streams.
//!
//! Each stream gets an explicit message type instead of an untyped
//! key→value map passed straight from producer to store; projection onto
//! a table's columns is a method on that type (see [`crate::schema`])
//! rather than a blind dictionary walk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One execution attempt's key: `(task_id, try_id)`.
pub type TaskTryId = (i64, i64);

/// Item pulled off the priority external queue.
///
/// Either the `"STOP"` shutdown sentinel, or a tagged message.
#[derive(Debug, Clone)]
pub enum PriorityItem {
    Stop,
    Message(PriorityMessage),
}

/// A priority-queue message, tagged by what it represents.
///
/// `WORKFLOW_INFO` messages are split into `WorkflowStart`/`WorkflowEnd` at
/// the type level instead of being distinguished later by the presence of
/// an interpreter-version field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PriorityMessage {
    WorkflowStart(WorkflowStart),
    WorkflowEnd(WorkflowEnd),
    TaskInfo(TaskInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStart {
    pub run_id: String,
    pub workflow_name: Option<String>,
    pub workflow_version: Option<String>,
    pub host: String,
    pub user: String,
    pub rundir: String,
    pub time_began: DateTime<Utc>,
    pub tasks_failed_count: i64,
    pub tasks_completed_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEnd {
    pub run_id: String,
    pub tasks_failed_count: i64,
    pub tasks_completed_count: i64,
    pub time_completed: DateTime<Utc>,
}

/// Per-task/try event reported by the workflow engine.
///
/// A single `TaskInfo` message carries both task-level and try-level
/// fields at once; `Task`, `Try` and `Status` rows are all derived from
/// the same wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: i64,
    pub try_id: i64,
    pub run_id: String,

    // Task-level fields.
    pub task_depends: Option<String>,
    pub task_func_name: String,
    pub task_memoize: String,
    pub task_hashsum: Option<String>,
    pub task_inputs: Option<String>,
    pub task_outputs: Option<String>,
    pub task_stdin: Option<String>,
    pub task_stdout: Option<String>,
    pub task_stderr: Option<String>,
    pub task_time_returned: Option<DateTime<Utc>>,
    pub task_fail_count: i64,

    // Try-level fields.
    pub hostname: Option<String>,
    pub task_executor: String,
    pub task_time_submitted: Option<DateTime<Utc>>,
    pub task_try_time_returned: Option<DateTime<Utc>>,
    pub task_fail_history: Option<String>,

    // Status-level fields (Status is append-only; every TaskInfo is one row).
    pub task_status_name: String,
    pub timestamp: DateTime<Utc>,

    // Carried for the Workflow-counters update that runs on every message.
    pub tasks_failed_count: i64,
    pub tasks_completed_count: i64,
}

impl TaskInfo {
    pub fn task_try_id(&self) -> TaskTryId {
        (self.task_id, self.try_id)
    }
}

/// Node-queue message: one-time registration of a compute node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub run_id: String,
    pub hostname: String,
    pub cpu_count: i64,
    pub total_memory: i64,
    pub active: bool,
    pub worker_count: i64,
    pub python_v: String,
    pub reg_time: DateTime<Utc>,
}

/// Resource-queue message: a periodic process-level sample.
///
/// `first_msg` doubles as a "task transitioned to running" signal; see
/// [`crate::coordinator`] for how that reconciles against the priority
/// stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub task_id: i64,
    pub try_id: i64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub first_msg: bool,

    pub resource_monitoring_interval: Option<f64>,
    pub psutil_process_pid: Option<i64>,
    pub psutil_process_cpu_percent: Option<f64>,
    pub psutil_process_memory_percent: Option<f64>,
    pub psutil_process_memory_virtual: Option<f64>,
    pub psutil_process_memory_resident: Option<f64>,
    pub psutil_process_disk_read: Option<f64>,
    pub psutil_process_disk_write: Option<f64>,
    pub psutil_process_children_count: Option<f64>,
    pub psutil_process_time_user: Option<f64>,
    pub psutil_process_time_system: Option<f64>,
    pub psutil_process_status: Option<String>,

    /// Hostname of the try this sample belongs to; carried so a promoted
    /// deferred message can update `Try.hostname`.
    pub hostname: Option<String>,
}

impl ResourceSample {
    pub fn task_try_id(&self) -> TaskTryId {
        (self.task_id, self.try_id)
    }
}

/// Envelope shape used by the node/resource external queues: a tuple whose
/// last element is the message of interest. The leading field stands in
/// for whatever addressing metadata the transport attaches.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub meta: u64,
    pub message: T,
}

impl<T> Envelope<T> {
    pub fn new(meta: u64, message: T) -> Self {
        Self { meta, message }
    }
}
