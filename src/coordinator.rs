//! Coordinator (C5): the single-threaded loop that owns all store state,
//! batches each internal queue, classifies priority messages, and
//! resolves deferred resource messages.

use std::collections::{HashMap, HashSet};

use crate::batch::{collect_batch, BatchingParams};
use crate::message::{NodeInfo, PriorityMessage, ResourceSample, TaskTryId};
use crate::queue::{Receiver, Watch};
use crate::schema::{materialise_all, Row, Table};
use crate::shutdown::ShutdownFlag;
use crate::store::Store;

/// Internal queue receivers the coordinator drains each iteration.
pub struct CoordinatorQueues {
    pub priority_rx: Receiver<PriorityMessage>,
    pub node_rx: Receiver<NodeInfo>,
    pub resource_rx: Receiver<ResourceSample>,
    /// Watches on the *external* priority/resource queues, used only for
    /// the loop-termination check. Termination deliberately checks the
    /// external priority and resource queues but not the external node
    /// queue — node registrations are one-shot and never the reason the
    /// loop needs to keep spinning after shutdown.
    pub priority_external_watch: Watch,
    pub resource_external_watch: Watch,
}

pub struct Coordinator {
    store: Store,
    queues: CoordinatorQueues,
    batching: BatchingParams,

    inserted_tasks: HashSet<i64>,
    inserted_tries: HashSet<TaskTryId>,
    deferred_resource_messages: HashMap<TaskTryId, ResourceSample>,

    workflow_end: bool,
    workflow_start_run_id: Option<String>,
    workflow_start_time_began: Option<chrono::DateTime<chrono::Utc>>,
}

const TASK_UPDATE_COLUMNS: &[&str] = &[
    "task_time_submitted",
    "task_time_returned",
    "run_id",
    "task_id",
    "task_fail_count",
];

const WORKFLOW_COUNTERS_COLUMNS: &[&str] =
    &["run_id", "tasks_failed_count", "tasks_completed_count"];

const WORKFLOW_END_COLUMNS: &[&str] = &[
    "run_id",
    "tasks_failed_count",
    "tasks_completed_count",
    "time_completed",
];

const TRY_UPDATE_COLUMNS: &[&str] = &[
    "run_id",
    "task_id",
    "try_id",
    "task_fail_history",
    "task_time_submitted",
    "task_try_time_returned",
];

const TRY_RUNNING_UPDATE_COLUMNS: &[&str] =
    &["task_time_running", "run_id", "task_id", "try_id", "hostname"];

pub const ABNORMAL_EXIT_COLUMNS: &[&str] = &["run_id", "time_completed", "workflow_duration"];

impl Coordinator {
    pub fn new(store: Store, queues: CoordinatorQueues, batching: BatchingParams) -> Self {
        Self {
            store,
            queues,
            batching,
            inserted_tasks: HashSet::new(),
            inserted_tries: HashSet::new(),
            deferred_resource_messages: HashMap::new(),
            workflow_end: false,
            workflow_start_run_id: None,
            workflow_start_time_began: None,
        }
    }

    /// True once a workflow-start message has been seen and no
    /// workflow-end message has been processed since. Consulted by the
    /// lifecycle finaliser on abnormal exit.
    pub fn needs_abnormal_finalisation(&self) -> Option<(&str, chrono::DateTime<chrono::Utc>)> {
        if self.workflow_end {
            return None;
        }
        match (&self.workflow_start_run_id, self.workflow_start_time_began) {
            (Some(run_id), Some(began)) => Some((run_id.as_str(), began)),
            _ => None,
        }
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    fn should_continue(&self, shutdown: &ShutdownFlag) -> bool {
        !shutdown.is_set()
            || !self.queues.priority_rx.is_empty()
            || !self.queues.resource_rx.is_empty()
            || !self.queues.priority_external_watch.is_empty()
            || !self.queues.resource_external_watch.is_empty()
    }

    /// Run until shutdown has been requested and every queue this check
    /// covers has drained.
    pub fn run(&mut self, shutdown: &ShutdownFlag) {
        while self.should_continue(shutdown) {
            self.run_once();
        }
    }

    /// One iteration of the coordinator's phases. Public
    /// so tests can step the coordinator deterministically.
    pub fn run_once(&mut self) {
        let mut reprocessable: Vec<ResourceSample> = Vec::new();

        self.drain_priority_batch(&mut reprocessable);
        self.drain_node_batch();
        self.drain_resource_batch(&mut reprocessable);
        self.apply_reprocessable(&reprocessable);
    }

    fn drain_priority_batch(&mut self, reprocessable: &mut Vec<ResourceSample>) {
        let interval = self.batching.interval();
        let threshold = self.batching.threshold();
        let batch = collect_batch(&self.queues.priority_rx, interval, threshold);
        if batch.is_empty() {
            return;
        }

        let mut task_info_all = Vec::new();
        let mut task_info_insert = Vec::new();
        let mut task_info_update = Vec::new();
        let mut try_insert = Vec::new();
        let mut try_update = Vec::new();

        for msg in batch {
            match msg {
                PriorityMessage::WorkflowStart(start) => {
                    self.workflow_start_run_id = Some(start.run_id.clone());
                    self.workflow_start_time_began = Some(start.time_began);
                    self.workflow_end = false;
                    let rows = materialise_all(Table::Workflow, None, std::slice::from_ref(&start));
                    self.checked_insert(Table::Workflow, &rows);
                }
                PriorityMessage::WorkflowEnd(end) => {
                    let rows = materialise_all(
                        Table::Workflow,
                        Some(WORKFLOW_END_COLUMNS),
                        std::slice::from_ref(&end),
                    );
                    self.checked_update(Table::Workflow, &rows);
                    self.workflow_end = true;
                }
                PriorityMessage::TaskInfo(info) => {
                    task_info_all.push(info.clone());

                    if self.inserted_tasks.contains(&info.task_id) {
                        task_info_update.push(info.clone());
                    } else {
                        self.inserted_tasks.insert(info.task_id);
                        task_info_insert.push(info.clone());
                    }

                    let key = info.task_try_id();
                    if self.inserted_tries.contains(&key) {
                        try_update.push(info);
                    } else {
                        self.inserted_tries.insert(key);
                        try_insert.push(info);
                        if let Some(deferred) = self.deferred_resource_messages.remove(&key) {
                            reprocessable.push(deferred);
                        }
                    }
                }
            }
        }

        // Fixed DML order: counters, then Task, then Status, then Try.
        if !task_info_all.is_empty() {
            let rows = materialise_all(
                Table::Workflow,
                Some(WORKFLOW_COUNTERS_COLUMNS),
                &task_info_all,
            );
            self.checked_update(Table::Workflow, &rows);
        }
        if !task_info_insert.is_empty() {
            let rows = materialise_all(Table::Task, None, &task_info_insert);
            self.checked_insert(Table::Task, &rows);
        }
        if !task_info_update.is_empty() {
            let rows = materialise_all(Table::Task, Some(TASK_UPDATE_COLUMNS), &task_info_update);
            self.checked_update(Table::Task, &rows);
        }
        if !task_info_all.is_empty() {
            let rows = materialise_all(Table::Status, None, &task_info_all);
            self.checked_insert(Table::Status, &rows);
        }
        if !try_insert.is_empty() {
            let rows = materialise_all(Table::Try, None, &try_insert);
            self.checked_insert(Table::Try, &rows);
        }
        if !try_update.is_empty() {
            let rows = materialise_all(Table::Try, Some(TRY_UPDATE_COLUMNS), &try_update);
            self.checked_update(Table::Try, &rows);
        }
    }

    fn drain_node_batch(&mut self) {
        let interval = self.batching.interval();
        let threshold = self.batching.threshold();
        let batch = collect_batch(&self.queues.node_rx, interval, threshold);
        if batch.is_empty() {
            return;
        }
        let rows = materialise_all(Table::Node, None, &batch);
        self.checked_insert(Table::Node, &rows);
    }

    fn drain_resource_batch(&mut self, reprocessable: &mut Vec<ResourceSample>) {
        let interval = self.batching.interval();
        let threshold = self.batching.threshold();
        let batch = collect_batch(&self.queues.resource_rx, interval, threshold);
        if batch.is_empty() {
            return;
        }

        let rows = materialise_all(Table::Resource, None, &batch);
        self.checked_insert(Table::Resource, &rows);

        for msg in batch {
            if !msg.first_msg {
                continue;
            }
            let key = msg.task_try_id();
            if self.inserted_tries.contains(&key) {
                reprocessable.push(msg);
            } else {
                if self.deferred_resource_messages.contains_key(&key) {
                    tracing::error!(
                        task_id = msg.task_id,
                        try_id = msg.try_id,
                        "discarding previous deferred resource message for this try"
                    );
                }
                self.deferred_resource_messages.insert(key, msg);
            }
        }
    }

    fn apply_reprocessable(&mut self, reprocessable: &[ResourceSample]) {
        if reprocessable.is_empty() {
            return;
        }
        let status_rows = materialise_all(Table::Status, None, reprocessable);
        self.checked_insert(Table::Status, &status_rows);

        let try_rows = materialise_all(Table::Try, Some(TRY_RUNNING_UPDATE_COLUMNS), reprocessable);
        self.checked_update(Table::Try, &try_rows);
    }

    /// Transient store errors are logged, rolled back, and the batch is
    /// dropped — the coordinator never blocks on a single bad batch.
    fn checked_insert(&mut self, table: Table, rows: &[Row]) {
        if let Err(e) = self.store.bulk_insert(table, rows) {
            tracing::error!(table = table.name(), error = %e, "bulk insert failed");
            self.store.rollback();
        }
    }

    fn checked_update(&mut self, table: Table, rows: &[Row]) {
        if let Err(e) = self.store.bulk_update(table, rows) {
            tracing::error!(table = table.name(), error = %e, "bulk update failed");
            self.store.rollback();
        }
    }
}
