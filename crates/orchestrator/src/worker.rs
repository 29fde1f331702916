//! Asynchronous finalization: a bounded task queue drained by a small pool
//! of workers. Each task turns a finished session's final snapshot into
//! durable follow records, applies entity merges, and clears the transient
//! dialog state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use salesnote_ai::LlmClient;
use salesnote_core::config::WorkerConfig;
use salesnote_core::errors::SnapshotError;
use salesnote_core::snapshot::RuntimeContext;
use salesnote_core::states::SessionStage;
use salesnote_db::{DbPool, SqlStore, Store, StoreError};

use crate::normalizer::normalize_entities;
use crate::records::{build_record_from_pending, parse_follow_time};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputTask {
    pub session_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl OutputTask {
    pub fn new(session_id: Uuid, user_id: String) -> OutputTask {
        OutputTask { session_id, user_id, created_at: Utc::now() }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("output task queue is full")]
    QueueFull,
    #[error("output worker is stopped")]
    Closed,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("transaction failed: {0}")]
    Transaction(#[from] sqlx::Error),
}

/// Producer handle. Submission never blocks: a full queue is reported to the
/// caller, which logs and carries on.
#[derive(Clone)]
pub struct OutputQueue {
    tx: mpsc::Sender<OutputTask>,
}

impl OutputQueue {
    pub fn new(tx: mpsc::Sender<OutputTask>) -> OutputQueue {
        OutputQueue { tx }
    }

    pub fn try_submit(&self, task: OutputTask) -> Result<(), SubmitError> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }
}

/// The worker pool. Workers run on detached tasks with their own root
/// context, so in-flight finalization survives inbound-handler cancellation.
/// `stop` signals the workers, which drain whatever is already queued and
/// then exit; producers may still hold queue handles at that point.
pub struct OutputWorker {
    queue: OutputQueue,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl OutputWorker {
    pub fn start(pool: DbPool, llm: Arc<dyn LlmClient>, config: &WorkerConfig) -> OutputWorker {
        let worker_size = config.worker_size.max(1);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        info!(worker_size, queue_capacity = config.queue_capacity, "starting output worker");
        let handles = (0..worker_size)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    pool.clone(),
                    llm.clone(),
                    rx.clone(),
                    stop_rx.clone(),
                ))
            })
            .collect();

        OutputWorker { queue: OutputQueue::new(tx), stop_tx, handles }
    }

    pub fn queue(&self) -> OutputQueue {
        self.queue.clone()
    }

    /// Drains remaining tasks and waits for the workers to finish.
    pub async fn stop(self) {
        info!("stopping output worker");
        let OutputWorker { queue, stop_tx, handles } = self;
        drop(queue);
        let _ = stop_tx.send(true);
        for handle in handles {
            if let Err(join_error) = handle.await {
                error!(%join_error, "output worker task panicked");
            }
        }
        info!("output worker stopped");
    }
}

enum Next {
    Task(OutputTask),
    Closed,
    Stop,
}

async fn worker_loop(
    worker_id: usize,
    pool: DbPool,
    llm: Arc<dyn LlmClient>,
    rx: Arc<Mutex<mpsc::Receiver<OutputTask>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(worker_id, "output worker started");
    loop {
        let next = {
            let mut guard = rx.lock().await;
            tokio::select! {
                task = guard.recv() => task.map(Next::Task).unwrap_or(Next::Closed),
                // A dropped stop sender counts as a stop signal too.
                _ = stop_rx.changed() => Next::Stop,
            }
        };

        match next {
            Next::Task(task) => run_task(worker_id, &pool, llm.as_ref(), task).await,
            Next::Closed => {
                info!(worker_id, "output worker stopping");
                return;
            }
            Next::Stop => {
                loop {
                    let task = { rx.lock().await.try_recv().ok() };
                    match task {
                        Some(task) => run_task(worker_id, &pool, llm.as_ref(), task).await,
                        None => break,
                    }
                }
                info!(worker_id, "output worker drained and stopping");
                return;
            }
        }
    }
}

async fn run_task(worker_id: usize, pool: &DbPool, llm: &dyn LlmClient, task: OutputTask) {
    info!(worker_id, session_id = %task.session_id, user_id = %task.user_id,
        "processing output task");
    match process_task(pool, llm, &task).await {
        Ok(()) => {
            info!(worker_id, session_id = %task.session_id,
                elapsed_ms = (Utc::now() - task.created_at).num_milliseconds(),
                "output task completed");
        }
        Err(worker_error) => {
            error!(worker_id, session_id = %task.session_id, %worker_error,
                "output task failed");
        }
    }
}

/// One task, one transaction: a failed finalization rolls back whole and the
/// session stays in OUTPUTTING for external retry.
async fn process_task(
    pool: &DbPool,
    llm: &dyn LlmClient,
    task: &OutputTask,
) -> Result<(), WorkerError> {
    let mut tx = pool.begin().await?;
    {
        let mut store = SqlStore::new(&mut *tx);
        finalize_session(&mut store, llm, task).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// The finalization pipeline. Normalization and merging are best-effort;
/// record emission is not, so a failed insert aborts the task.
pub async fn finalize_session<S: Store>(
    store: &mut S,
    llm: &dyn LlmClient,
    task: &OutputTask,
) -> Result<(), WorkerError> {
    // 1 + 2. Normalize entities and apply confident merges.
    match normalize_entities(store, llm, task.session_id).await {
        Ok(merge_map) if !merge_map.is_empty() => {
            info!(merge_count = merge_map.len(), "entity normalization completed");
            if let Err(store_error) = merge_customers(store, &merge_map).await {
                error!(%store_error, "customer merge failed");
            }
        }
        Ok(_) => {}
        Err(normalize_error) => {
            error!(%normalize_error, "entity normalization failed");
        }
    }

    // 3. Emit follow records from the final snapshot.
    emit_follow_records(store, task).await?;

    // 4. Drop the transient dialog state; the session row goes last for the
    // foreign key. A session that cannot be deleted is marked EXIT so it is
    // no longer considered active.
    if let Err(store_error) = store.delete_dialogs_by_session(task.session_id).await {
        error!(%store_error, session_id = %task.session_id, "dialog cleanup failed");
    }
    if let Err(store_error) = store.delete_session(task.session_id).await {
        error!(%store_error, session_id = %task.session_id, "session delete failed");
        if let Err(fallback_error) = store
            .update_session_stage(task.session_id, SessionStage::Exit, Some(Utc::now()))
            .await
        {
            error!(%fallback_error, session_id = %task.session_id,
                "session EXIT fallback failed");
        }
    }
    Ok(())
}

async fn emit_follow_records<S: Store>(
    store: &mut S,
    task: &OutputTask,
) -> Result<(), WorkerError> {
    let Some(latest) = store.latest_dialog(task.session_id).await? else {
        return Ok(());
    };
    let runtime = RuntimeContext::from_dialog(&latest)?;
    if runtime.pending_updates.is_empty() {
        return Ok(());
    }

    let dialogs = store.dialogs_by_session(task.session_id).await?;
    let first_focus_times: HashMap<Uuid, DateTime<Utc>> = dialogs
        .iter()
        .filter(|dialog| dialog.is_first_focus)
        .filter_map(|dialog| dialog.focus_customer_id.map(|id| (id, dialog.created_at)))
        .collect();

    for customer_id in runtime.pending_updates.customer_ids() {
        let data = runtime.pending_updates.fields_for(customer_id).cloned();
        if data.as_ref().map_or(true, |data| data.is_empty()) {
            continue;
        }
        let Some(customer) = store.get_customer(customer_id).await? else {
            warn!(%customer_id, "pending customer missing at output time");
            continue;
        };

        let mut record = build_record_from_pending(&customer, data.as_ref());
        record.follow_time = data
            .as_ref()
            .and_then(|data| data.get("follow_time"))
            .and_then(|raw| parse_follow_time(raw))
            .or_else(|| first_focus_times.get(&customer_id).copied())
            .unwrap_or_else(Utc::now);
        record.user_id = task.user_id.clone();
        record.id = Uuid::new_v4();
        store.create_follow_record(&record).await?;
    }
    Ok(())
}

/// Copies missing contact columns from the source customer onto the target
/// and re-points every source follow record. Customer rows themselves stay.
async fn merge_customers<S: Store>(
    store: &mut S,
    merge_map: &std::collections::BTreeMap<Uuid, Uuid>,
) -> Result<(), StoreError> {
    for (&source_id, &target_id) in merge_map {
        let (Some(source), Some(mut target)) = (
            store.get_customer(source_id).await?,
            store.get_customer(target_id).await?,
        ) else {
            warn!(%source_id, %target_id, "merge pair missing a customer");
            continue;
        };

        if target.contact_person.is_none() {
            target.contact_person = source.contact_person.clone();
        }
        if target.contact_phone.is_none() {
            target.contact_phone = source.contact_phone.clone();
        }
        if target.contact_role.is_none() {
            target.contact_role = source.contact_role.clone();
        }
        store.update_customer(&target).await?;

        for mut record in store.follow_records_by_customer(source_id).await? {
            record.customer_id = target_id;
            record.customer_name = target.name.clone();
            store.update_follow_record(&record).await?;
        }
        info!(%source_id, %target_id, "customers merged");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_reports_full_and_closed_queues() {
        let (tx, rx) = mpsc::channel(1);
        let queue = OutputQueue::new(tx);

        let task = OutputTask::new(Uuid::new_v4(), "u1".to_string());
        queue.try_submit(task.clone()).expect("first submit fits");
        assert_eq!(queue.try_submit(task.clone()), Err(SubmitError::QueueFull));

        drop(rx);
        assert_eq!(queue.try_submit(task), Err(SubmitError::Closed));
    }
}
