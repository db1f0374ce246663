//! Lifecycle (C6): startup wiring, shutdown signalling, and the
//! abnormal-exit workflow finaliser.

use std::fs;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::batch::BatchingParams;
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorQueues, ABNORMAL_EXIT_COLUMNS};
use crate::intake::{spawn_node_worker, spawn_priority_worker, spawn_resource_worker};
use crate::message::{Envelope, NodeInfo, PriorityItem, PriorityMessage, ResourceSample};
use crate::queue::{self, Sender};
use crate::schema::{ColumnValue, Table};
use crate::shutdown::ShutdownFlag;
use crate::store::Store;

/// Channel endpoints the host process drives. Producers clone and hold
/// these `Sender`s; intake workers own the matching `Receiver`s.
pub struct ExternalQueues {
    pub priority_tx: Sender<PriorityItem>,
    pub node_tx: Sender<Envelope<NodeInfo>>,
    pub resource_tx: Sender<Envelope<ResourceSample>>,
}

/// Everything spawned by [`start`]: the external senders the host uses to
/// feed the three streams, and the join handles for a graceful wait.
pub struct Lifecycle {
    pub queues: ExternalQueues,
    shutdown: ShutdownFlag,
    batching: BatchingParams,
    error_tx: Option<Sender<(String, String)>>,
    coordinator_handle: JoinHandle<()>,
    intake_handles: Vec<JoinHandle<()>>,
}

const EXTERNAL_QUEUE_BOUND: usize = 10_000;
const INTERNAL_QUEUE_BOUND: usize = 10_000;

impl Lifecycle {
    /// Create the log directory, open the store, spawn the three intake
    /// workers and the coordinator thread, and return the handles the host
    /// process uses to feed messages in and wait for shutdown.
    ///
    /// `error_tx` is the error-reporting queue supplied by the host —
    /// optional because this crate does not mandate a host process exist
    /// to receive it.
    pub fn start(config: &Config, error_tx: Option<Sender<(String, String)>>) -> Result<Self> {
        fs::create_dir_all(&config.logdir)
            .with_context(|| format!("creating log directory {}", config.logdir.display()))?;

        let store = Store::open(&config.db_url)
            .with_context(|| format!("opening store at {}", config.db_url))?;

        let shutdown = ShutdownFlag::new();
        let batching = BatchingParams::new(config.batching_interval, config.batching_threshold);

        let (priority_ext_tx, priority_ext_rx) = queue::channel::<PriorityItem>(EXTERNAL_QUEUE_BOUND);
        let (node_ext_tx, node_ext_rx) = queue::channel::<Envelope<NodeInfo>>(EXTERNAL_QUEUE_BOUND);
        let (resource_ext_tx, resource_ext_rx) =
            queue::channel::<Envelope<ResourceSample>>(EXTERNAL_QUEUE_BOUND);

        let priority_external_watch = priority_ext_tx.watch();
        let resource_external_watch = resource_ext_tx.watch();

        let (priority_int_tx, priority_int_rx) =
            queue::channel::<PriorityMessage>(INTERNAL_QUEUE_BOUND);
        let (node_int_tx, node_int_rx) = queue::channel::<NodeInfo>(INTERNAL_QUEUE_BOUND);
        let (resource_int_tx, resource_int_rx) =
            queue::channel::<ResourceSample>(INTERNAL_QUEUE_BOUND);

        let mut intake_handles = Vec::with_capacity(3);
        intake_handles.push(spawn_priority_worker(
            priority_ext_rx,
            priority_int_tx,
            shutdown.clone(),
        ));
        intake_handles.push(spawn_node_worker(node_ext_rx, node_int_tx, shutdown.clone()));
        intake_handles.push(spawn_resource_worker(
            resource_ext_rx,
            resource_int_tx,
            shutdown.clone(),
        ));

        let coordinator_queues = CoordinatorQueues {
            priority_rx: priority_int_rx,
            node_rx: node_int_rx,
            resource_rx: resource_int_rx,
            priority_external_watch,
            resource_external_watch,
        };
        let mut coordinator = Coordinator::new(store, coordinator_queues, batching.clone());
        let coordinator_shutdown = shutdown.clone();
        let coordinator_handle = std::thread::Builder::new()
            .name("coordinator".into())
            .spawn(move || {
                coordinator.run(&coordinator_shutdown);
                finalise_abnormal_exit(&mut coordinator);
            })
            .expect("failed to spawn coordinator thread");

        Ok(Self {
            queues: ExternalQueues {
                priority_tx: priority_ext_tx,
                node_tx: node_ext_tx,
                resource_tx: resource_ext_tx,
            },
            shutdown,
            batching,
            error_tx,
            coordinator_handle,
            intake_handles,
        })
    }

    /// Signal normal shutdown: push the `STOP` sentinel on the priority
    /// stream and drop the batching cutoffs so the coordinator drains
    /// whatever remains without further time-slicing.
    pub fn shutdown(&self) {
        self.batching.set_unbounded();
        if self.queues.priority_tx.send(PriorityItem::Stop).is_err() {
            tracing::warn!("priority queue already closed; setting shutdown flag directly");
            self.shutdown.set();
        }
    }

    /// Block until the intake workers and the coordinator have exited.
    /// Call `shutdown` first so this returns in bounded time.
    ///
    /// A panicking coordinator thread is this crate's one fatal-exception
    /// path (`spec.md` §6): it is reported on `error_tx` under the `"DBM"`
    /// tag before this returns an error to the caller.
    pub fn join(self) -> Result<()> {
        for handle in self.intake_handles {
            let _ = handle.join();
        }
        match self.coordinator_handle.join() {
            Ok(()) => Ok(()),
            Err(payload) => {
                let message = panic_message(&payload);
                tracing::error!(error = %message, "coordinator thread panicked");
                if let Some(tx) = &self.error_tx {
                    let _ = tx.send(("DBM".to_string(), message.clone()));
                }
                anyhow::bail!("coordinator thread panicked: {message}")
            }
        }
    }
}

/// Best-effort extraction of a panic's message; `std::panic::PanicHookInfo`
/// payloads are almost always a `&'static str` or `String`.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "coordinator thread panicked with a non-string payload".to_string()
    }
}

/// If a workflow was started but never ended, synthesise the missing
/// `Workflow` update with the current wall-clock time and a computed
/// `workflow_duration`.
fn finalise_abnormal_exit(coordinator: &mut Coordinator) {
    let Some((run_id, began)) = coordinator.needs_abnormal_finalisation() else {
        return;
    };
    let run_id = run_id.to_string();
    let now = Utc::now();
    let duration_secs = (now - began).num_milliseconds() as f64 / 1000.0;

    tracing::warn!(run_id = %run_id, "finalising workflow after abnormal exit");

    let row = vec![
        ("run_id", ColumnValue::Text(run_id)),
        ("time_completed", ColumnValue::Timestamp(now)),
        ("workflow_duration", ColumnValue::Real(duration_secs)),
    ];
    debug_assert_eq!(row.len(), ABNORMAL_EXIT_COLUMNS.len());

    if let Err(e) = coordinator.store_mut().bulk_update(Table::Workflow, &[row]) {
        tracing::error!(error = %e, "abnormal-exit workflow finalisation failed");
        coordinator.store_mut().rollback();
    }
}

/// Install a `SIGINT` handler that drives the same shutdown path as a
/// host-initiated `STOP`. Installed once per process; a second call
/// returns an error from `ctrlc` which is logged and ignored.
pub fn install_sigint_handler(priority_tx: Sender<PriorityItem>) {
    let result = ctrlc::set_handler(move || {
        tracing::info!("SIGINT received, signalling shutdown");
        let _ = priority_tx.send(PriorityItem::Stop);
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to install SIGINT handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PriorityMessage;
    use crate::queue;
    use std::time::Duration;

    /// A workflow starts but no workflow-end ever arrives before
    /// shutdown. The finaliser must still leave `Workflow.time_completed`
    /// non-null.
    #[test]
    fn abnormal_exit_finalises_an_unfinished_workflow() {
        let store = Store::open(":memory:").unwrap();
        let (priority_tx, priority_rx) = queue::channel::<PriorityMessage>(10);
        let (_node_tx, node_rx) = queue::channel::<crate::message::NodeInfo>(10);
        let (_resource_tx, resource_rx) = queue::channel::<crate::message::ResourceSample>(10);
        let (dummy_tx, _dummy_rx) = queue::channel::<()>(1);

        let queues = CoordinatorQueues {
            priority_rx,
            node_rx,
            resource_rx,
            priority_external_watch: dummy_tx.watch(),
            resource_external_watch: dummy_tx.watch(),
        };
        let batching = BatchingParams::new(Duration::from_millis(50), 99_999);
        let mut coordinator = Coordinator::new(store, queues, batching);

        let began = Utc::now() - chrono::Duration::seconds(5);
        priority_tx
            .send(PriorityMessage::WorkflowStart(
                crate::message::WorkflowStart {
                    run_id: "r1".into(),
                    workflow_name: None,
                    workflow_version: None,
                    host: "h".into(),
                    user: "u".into(),
                    rundir: "/tmp".into(),
                    time_began: began,
                    tasks_failed_count: 0,
                    tasks_completed_count: 0,
                },
            ))
            .unwrap();
        coordinator.run_once();

        assert!(coordinator.needs_abnormal_finalisation().is_some());
        finalise_abnormal_exit(&mut coordinator);
        assert!(coordinator.needs_abnormal_finalisation().is_none());

        let completed: Option<String> = coordinator
            .store_mut()
            .query_scalar("SELECT time_completed FROM workflow WHERE run_id = 'r1'");
        assert!(completed.is_some());
        let duration: Option<f64> = coordinator
            .store_mut()
            .query_scalar("SELECT workflow_duration FROM workflow WHERE run_id = 'r1'");
        assert!(duration.unwrap() >= 5.0);
    }

    #[test]
    fn no_finalisation_needed_when_workflow_end_already_processed() {
        let store = Store::open(":memory:").unwrap();
        let (priority_tx, priority_rx) = queue::channel::<PriorityMessage>(10);
        let (_node_tx, node_rx) = queue::channel::<crate::message::NodeInfo>(10);
        let (_resource_tx, resource_rx) = queue::channel::<crate::message::ResourceSample>(10);
        let (dummy_tx, _dummy_rx) = queue::channel::<()>(1);

        let queues = CoordinatorQueues {
            priority_rx,
            node_rx,
            resource_rx,
            priority_external_watch: dummy_tx.watch(),
            resource_external_watch: dummy_tx.watch(),
        };
        let batching = BatchingParams::new(Duration::from_millis(50), 99_999);
        let mut coordinator = Coordinator::new(store, queues, batching);

        let began = Utc::now();
        priority_tx
            .send(PriorityMessage::WorkflowStart(
                crate::message::WorkflowStart {
                    run_id: "r1".into(),
                    workflow_name: None,
                    workflow_version: None,
                    host: "h".into(),
                    user: "u".into(),
                    rundir: "/tmp".into(),
                    time_began: began,
                    tasks_failed_count: 0,
                    tasks_completed_count: 0,
                },
            ))
            .unwrap();
        coordinator.run_once();
        priority_tx
            .send(PriorityMessage::WorkflowEnd(crate::message::WorkflowEnd {
                run_id: "r1".into(),
                tasks_failed_count: 0,
                tasks_completed_count: 0,
                time_completed: Utc::now(),
            }))
            .unwrap();
        coordinator.run_once();

        assert!(coordinator.needs_abnormal_finalisation().is_none());
    }

    /// End-to-end startup: `Lifecycle::start` creates the log directory,
    /// opens the store, and the intake/coordinator threads come up and
    /// shut back down cleanly on `shutdown()` + `join()`.
    #[test]
    fn start_creates_logdir_and_shuts_down_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let logdir = tmp.path().join("logs");
        let config = Config {
            db_url: ":memory:".to_string(),
            logdir: logdir.clone(),
            logging_level: "info".to_string(),
            batching_interval: std::time::Duration::from_millis(50),
            batching_threshold: 99_999,
        };

        assert!(!logdir.exists());
        let lifecycle = Lifecycle::start(&config, None).unwrap();
        assert!(logdir.is_dir());

        lifecycle.shutdown();
        lifecycle.join().unwrap();
    }

    /// A coordinator thread panic is this crate's one fatal-exception
    /// path: `join` must report it on `error_tx` under the `"DBM"` tag
    /// and then return an error of its own.
    #[test]
    fn coordinator_panic_is_reported_on_error_tx() {
        let (priority_tx, _priority_rx) = queue::channel::<PriorityItem>(1);
        let (node_tx, _node_rx) = queue::channel::<Envelope<crate::message::NodeInfo>>(1);
        let (resource_tx, _resource_rx) =
            queue::channel::<Envelope<crate::message::ResourceSample>>(1);
        let (error_tx, error_rx) = queue::channel::<(String, String)>(1);

        let panicking_handle = std::thread::Builder::new()
            .name("test-coordinator-panic".into())
            .spawn(|| panic!("synthetic coordinator failure"))
            .unwrap();

        let lifecycle = Lifecycle {
            queues: ExternalQueues {
                priority_tx,
                node_tx,
                resource_tx,
            },
            shutdown: ShutdownFlag::new(),
            batching: BatchingParams::new(Duration::from_millis(50), 99_999),
            error_tx: Some(error_tx),
            coordinator_handle: panicking_handle,
            intake_handles: Vec::new(),
        };

        assert!(lifecycle.join().is_err());
        let (tag, message) = error_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(tag, "DBM");
        assert!(message.contains("synthetic coordinator failure"));
    }
}
