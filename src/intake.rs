//! Intake Workers (C3): one thread per external stream, draining into the
//! matching internal queue with a small per-stream transform.

use std::thread::{self, JoinHandle};

use crate::batch::POLL_INTERVAL;
use crate::message::{Envelope, NodeInfo, PriorityItem, PriorityMessage, ResourceSample};
use crate::queue::{Receiver, Sender};
use crate::shutdown::ShutdownFlag;

/// A worker terminates once shutdown has been requested *and* its
/// external queue has drained — this lets in-flight producers finish
/// without losing messages.
fn should_keep_running<T>(shutdown: &ShutdownFlag, external_rx: &Receiver<T>) -> bool {
    !shutdown.is_set() || !external_rx.is_empty()
}

/// Priority stream: forwards `(type_tag, message)` unchanged; the `STOP`
/// sentinel sets the shutdown flag instead of being forwarded.
pub fn spawn_priority_worker(
    external_rx: Receiver<PriorityItem>,
    internal_tx: Sender<PriorityMessage>,
    shutdown: ShutdownFlag,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("intake-priority".into())
        .spawn(move || {
            while should_keep_running(&shutdown, &external_rx) {
                match external_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(PriorityItem::Stop) => {
                        tracing::debug!("priority intake observed STOP sentinel");
                        shutdown.set();
                    }
                    Ok(PriorityItem::Message(msg)) => {
                        if internal_tx.send(msg).is_err() {
                            tracing::warn!("internal priority queue closed, intake exiting");
                            break;
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            tracing::debug!("priority intake worker exiting");
        })
        .expect("failed to spawn priority intake thread")
}

/// Node stream: forwards the last element of each external tuple.
pub fn spawn_node_worker(
    external_rx: Receiver<Envelope<NodeInfo>>,
    internal_tx: Sender<NodeInfo>,
    shutdown: ShutdownFlag,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("intake-node".into())
        .spawn(move || {
            while should_keep_running(&shutdown, &external_rx) {
                match external_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(envelope) => {
                        if internal_tx.send(envelope.message).is_err() {
                            tracing::warn!("internal node queue closed, intake exiting");
                            break;
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            tracing::debug!("node intake worker exiting");
        })
        .expect("failed to spawn node intake thread")
}

/// Resource stream: forwards the last element of each external tuple.
pub fn spawn_resource_worker(
    external_rx: Receiver<Envelope<ResourceSample>>,
    internal_tx: Sender<ResourceSample>,
    shutdown: ShutdownFlag,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("intake-resource".into())
        .spawn(move || {
            while should_keep_running(&shutdown, &external_rx) {
                match external_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(envelope) => {
                        if internal_tx.send(envelope.message).is_err() {
                            tracing::warn!("internal resource queue closed, intake exiting");
                            break;
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            tracing::debug!("resource intake worker exiting");
        })
        .expect("failed to spawn resource intake thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WorkflowEnd;
    use crate::queue;
    use std::time::Duration;

    #[test]
    fn priority_worker_forwards_messages_and_stops_on_sentinel() {
        let (external_tx, external_rx) = queue::channel::<PriorityItem>(10);
        let (internal_tx, internal_rx) = queue::channel::<PriorityMessage>(10);
        let shutdown = ShutdownFlag::new();

        let handle = spawn_priority_worker(external_rx, internal_tx, shutdown.clone());

        external_tx
            .send(PriorityItem::Message(PriorityMessage::WorkflowEnd(
                WorkflowEnd {
                    run_id: "r1".into(),
                    tasks_failed_count: 0,
                    tasks_completed_count: 0,
                    time_completed: chrono::Utc::now(),
                },
            )))
            .unwrap();

        let forwarded = internal_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("message forwarded to internal queue");
        match forwarded {
            PriorityMessage::WorkflowEnd(end) => assert_eq!(end.run_id, "r1"),
            other => panic!("unexpected message: {other:?}"),
        }

        assert!(!shutdown.is_set());
        external_tx.send(PriorityItem::Stop).unwrap();
        handle.join().unwrap();
        assert!(shutdown.is_set());
    }

    #[test]
    fn node_worker_unwraps_envelope_and_exits_after_shutdown_drains_queue() {
        let (external_tx, external_rx) = queue::channel::<Envelope<NodeInfo>>(10);
        let (internal_tx, internal_rx) = queue::channel::<NodeInfo>(10);
        let shutdown = ShutdownFlag::new();

        external_tx
            .send(Envelope::new(
                7,
                NodeInfo {
                    run_id: "r1".into(),
                    hostname: "h".into(),
                    cpu_count: 4,
                    total_memory: 1,
                    active: true,
                    worker_count: 1,
                    python_v: "3.11".into(),
                    reg_time: chrono::Utc::now(),
                },
            ))
            .unwrap();

        // Shutdown is signalled before the worker even starts; it must
        // still drain the one pending item before exiting.
        shutdown.set();
        let handle = spawn_node_worker(external_rx, internal_tx, shutdown);

        let forwarded = internal_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("pending item drained despite shutdown already set");
        assert_eq!(forwarded.hostname, "h");
        handle.join().unwrap();
    }
}
