//! Declarative table definitions and message→row projection (C1).
//!
//! `materialise`/`materialise_all` take a table, an optional column subset,
//! and a message, and produce a [`Row`] — a list of `(column, value)`
//! pairs in the order requested. A column absent from the message yields
//! `ColumnValue::Null` rather than an error; nullability is enforced only
//! by the store's column constraints.

use chrono::{DateTime, Utc};

use crate::message::{NodeInfo, ResourceSample, TaskInfo, WorkflowEnd, WorkflowStart};

/// One of the six persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Workflow,
    Task,
    Try,
    Status,
    Node,
    Resource,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Workflow => "workflow",
            Table::Task => "task",
            Table::Try => "try",
            Table::Status => "status",
            Table::Node => "node",
            Table::Resource => "resource",
        }
    }

    /// All columns defined for this table, in declaration order.
    pub fn all_columns(&self) -> &'static [&'static str] {
        match self {
            Table::Workflow => &[
                "run_id",
                "workflow_name",
                "workflow_version",
                "host",
                "user",
                "rundir",
                "time_began",
                "time_completed",
                "tasks_failed_count",
                "tasks_completed_count",
                "workflow_duration",
            ],
            Table::Task => &[
                "task_id",
                "run_id",
                "task_depends",
                "task_func_name",
                "task_memoize",
                "task_hashsum",
                "task_inputs",
                "task_outputs",
                "task_stdin",
                "task_stdout",
                "task_stderr",
                "task_time_returned",
                "task_fail_count",
            ],
            Table::Try => &[
                "try_id",
                "task_id",
                "run_id",
                "hostname",
                "task_executor",
                "task_time_submitted",
                "task_time_running",
                "task_try_time_returned",
                "task_fail_history",
            ],
            Table::Status => &[
                "task_id",
                "run_id",
                "task_status_name",
                "timestamp",
                "try_id",
            ],
            Table::Node => &[
                "id",
                "run_id",
                "hostname",
                "cpu_count",
                "total_memory",
                "active",
                "worker_count",
                "python_v",
                "reg_time",
            ],
            Table::Resource => &[
                "try_id",
                "task_id",
                "run_id",
                "timestamp",
                "resource_monitoring_interval",
                "psutil_process_pid",
                "psutil_process_cpu_percent",
                "psutil_process_memory_percent",
                "psutil_process_memory_virtual",
                "psutil_process_memory_resident",
                "psutil_process_disk_read",
                "psutil_process_disk_write",
                "psutil_process_children_count",
                "psutil_process_time_user",
                "psutil_process_time_system",
                "psutil_process_status",
            ],
        }
    }

    /// Primary key columns, in declaration order.
    pub fn primary_key(&self) -> &'static [&'static str] {
        match self {
            Table::Workflow => &["run_id"],
            Table::Task => &["task_id", "run_id"],
            Table::Try => &["try_id", "task_id", "run_id"],
            Table::Status => &["task_id", "run_id", "task_status_name", "timestamp"],
            Table::Node => &["id"],
            Table::Resource => &["try_id", "task_id", "run_id", "timestamp"],
        }
    }
}

/// A single column's value, loosely typed to match SQLite's storage
/// classes plus a timestamp convenience variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl From<Option<&str>> for ColumnValue {
    fn from(v: Option<&str>) -> Self {
        match v {
            Some(s) => ColumnValue::Text(s.to_string()),
            None => ColumnValue::Null,
        }
    }
}

/// One materialised row: column name paired with its value, in the order
/// the caller requested.
pub type Row = Vec<(&'static str, ColumnValue)>;

/// Implemented by every message type: projects the message onto a named
/// column, yielding `Null` for anything the message doesn't carry.
///
/// Each message type answers this per-column instead of via a generic
/// dictionary lookup.
pub trait ToColumns {
    fn column(&self, name: &str) -> ColumnValue;
}

macro_rules! opt_text {
    ($v:expr) => {
        match &$v {
            Some(s) => ColumnValue::Text(s.clone()),
            None => ColumnValue::Null,
        }
    };
}

macro_rules! opt_ts {
    ($v:expr) => {
        match $v {
            Some(t) => ColumnValue::Timestamp(t),
            None => ColumnValue::Null,
        }
    };
}

macro_rules! opt_real {
    ($v:expr) => {
        match $v {
            Some(f) => ColumnValue::Real(f),
            None => ColumnValue::Null,
        }
    };
}

impl ToColumns for WorkflowStart {
    fn column(&self, name: &str) -> ColumnValue {
        match name {
            "run_id" => ColumnValue::Text(self.run_id.clone()),
            "workflow_name" => opt_text!(self.workflow_name),
            "workflow_version" => opt_text!(self.workflow_version),
            "host" => ColumnValue::Text(self.host.clone()),
            "user" => ColumnValue::Text(self.user.clone()),
            "rundir" => ColumnValue::Text(self.rundir.clone()),
            "time_began" => ColumnValue::Timestamp(self.time_began),
            "tasks_failed_count" => ColumnValue::Integer(self.tasks_failed_count),
            "tasks_completed_count" => ColumnValue::Integer(self.tasks_completed_count),
            _ => ColumnValue::Null,
        }
    }
}

impl ToColumns for WorkflowEnd {
    fn column(&self, name: &str) -> ColumnValue {
        match name {
            "run_id" => ColumnValue::Text(self.run_id.clone()),
            "tasks_failed_count" => ColumnValue::Integer(self.tasks_failed_count),
            "tasks_completed_count" => ColumnValue::Integer(self.tasks_completed_count),
            "time_completed" => ColumnValue::Timestamp(self.time_completed),
            _ => ColumnValue::Null,
        }
    }
}

impl ToColumns for TaskInfo {
    fn column(&self, name: &str) -> ColumnValue {
        match name {
            "task_id" => ColumnValue::Integer(self.task_id),
            "try_id" => ColumnValue::Integer(self.try_id),
            "run_id" => ColumnValue::Text(self.run_id.clone()),
            "task_depends" => opt_text!(self.task_depends),
            "task_func_name" => ColumnValue::Text(self.task_func_name.clone()),
            "task_memoize" => ColumnValue::Text(self.task_memoize.clone()),
            "task_hashsum" => opt_text!(self.task_hashsum),
            "task_inputs" => opt_text!(self.task_inputs),
            "task_outputs" => opt_text!(self.task_outputs),
            "task_stdin" => opt_text!(self.task_stdin),
            "task_stdout" => opt_text!(self.task_stdout),
            "task_stderr" => opt_text!(self.task_stderr),
            "task_time_returned" => opt_ts!(self.task_time_returned),
            "task_fail_count" => ColumnValue::Integer(self.task_fail_count),
            "hostname" => opt_text!(self.hostname),
            "task_executor" => ColumnValue::Text(self.task_executor.clone()),
            "task_time_submitted" => opt_ts!(self.task_time_submitted),
            "task_try_time_returned" => opt_ts!(self.task_try_time_returned),
            "task_fail_history" => opt_text!(self.task_fail_history),
            "task_status_name" => ColumnValue::Text(self.task_status_name.clone()),
            "timestamp" => ColumnValue::Timestamp(self.timestamp),
            "tasks_failed_count" => ColumnValue::Integer(self.tasks_failed_count),
            "tasks_completed_count" => ColumnValue::Integer(self.tasks_completed_count),
            _ => ColumnValue::Null,
        }
    }
}

impl ToColumns for NodeInfo {
    fn column(&self, name: &str) -> ColumnValue {
        match name {
            "run_id" => ColumnValue::Text(self.run_id.clone()),
            "hostname" => ColumnValue::Text(self.hostname.clone()),
            "cpu_count" => ColumnValue::Integer(self.cpu_count),
            "total_memory" => ColumnValue::Integer(self.total_memory),
            "active" => ColumnValue::Bool(self.active),
            "worker_count" => ColumnValue::Integer(self.worker_count),
            "python_v" => ColumnValue::Text(self.python_v.clone()),
            "reg_time" => ColumnValue::Timestamp(self.reg_time),
            _ => ColumnValue::Null,
        }
    }
}

impl ToColumns for ResourceSample {
    fn column(&self, name: &str) -> ColumnValue {
        match name {
            "task_id" => ColumnValue::Integer(self.task_id),
            "try_id" => ColumnValue::Integer(self.try_id),
            "run_id" => ColumnValue::Text(self.run_id.clone()),
            "timestamp" => ColumnValue::Timestamp(self.timestamp),
            "resource_monitoring_interval" => opt_real!(self.resource_monitoring_interval),
            "psutil_process_pid" => match self.psutil_process_pid {
                Some(p) => ColumnValue::Integer(p),
                None => ColumnValue::Null,
            },
            "psutil_process_cpu_percent" => opt_real!(self.psutil_process_cpu_percent),
            "psutil_process_memory_percent" => opt_real!(self.psutil_process_memory_percent),
            "psutil_process_memory_virtual" => opt_real!(self.psutil_process_memory_virtual),
            "psutil_process_memory_resident" => opt_real!(self.psutil_process_memory_resident),
            "psutil_process_disk_read" => opt_real!(self.psutil_process_disk_read),
            "psutil_process_disk_write" => opt_real!(self.psutil_process_disk_write),
            "psutil_process_children_count" => opt_real!(self.psutil_process_children_count),
            "psutil_process_time_user" => opt_real!(self.psutil_process_time_user),
            "psutil_process_time_system" => opt_real!(self.psutil_process_time_system),
            "psutil_process_status" => opt_text!(self.psutil_process_status),
            // Synthesized columns used only when this sample is being
            // reprocessed as a "running" status/try-update: a first_msg
            // sample doubles as a state transition.
            "task_status_name" if self.first_msg => ColumnValue::Text("running".to_string()),
            "task_time_running" if self.first_msg => ColumnValue::Timestamp(self.timestamp),
            "hostname" => opt_text!(self.hostname),
            _ => ColumnValue::Null,
        }
    }
}

/// Project `msg` onto `columns` (or every column the table defines, if
/// `None`), in the requested order.
pub fn materialise<M: ToColumns>(table: Table, columns: Option<&[&'static str]>, msg: &M) -> Row {
    let cols = columns.unwrap_or_else(|| table.all_columns());
    cols.iter().map(|&c| (c, msg.column(c))).collect()
}

/// Bulk form of [`materialise`].
pub fn materialise_all<M: ToColumns>(
    table: Table,
    columns: Option<&[&'static str]>,
    msgs: &[M],
) -> Vec<Row> {
    msgs.iter().map(|m| materialise(table, columns, m)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_is_null_not_error() {
        let w = WorkflowEnd {
            run_id: "r1".into(),
            tasks_failed_count: 0,
            tasks_completed_count: 1,
            time_completed: Utc::now(),
        };
        let row = materialise(Table::Workflow, None, &w);
        let host = row.iter().find(|(c, _)| *c == "host").unwrap();
        assert_eq!(host.1, ColumnValue::Null);
    }

    #[test]
    fn requested_columns_preserve_order() {
        let w = WorkflowEnd {
            run_id: "r1".into(),
            tasks_failed_count: 2,
            tasks_completed_count: 3,
            time_completed: Utc::now(),
        };
        let cols: &[&'static str] = &["tasks_completed_count", "run_id"];
        let row = materialise(Table::Workflow, Some(cols), &w);
        assert_eq!(row[0].0, "tasks_completed_count");
        assert_eq!(row[1].0, "run_id");
    }
}
