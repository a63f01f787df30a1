// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The scheduler: owns the task graph, admits ready tasks under a
//! concurrency cap, drives each through its agent coroutine, routes
//! tool-call suspensions through the dispatcher, and resolves dependency
//! and parent bookkeeping on every terminal transition.
//!
//! Control plane: one main-loop task `select!`s over the ready queue, the
//! resumption queue, and the shutdown flag; admission acquires an owned
//! semaphore permit *before* spawning the work future, so the loop itself
//! blocks while the cap is saturated and admission stays FIFO.
//!
//! Work plane: a task holds its permit only while RUNNING.  Suspending on
//! tool I/O drops the permit first and dispatches outside the semaphore;
//! planning tasks release theirs once their subtasks are linked.  The graph
//! lock is held only across graph mutations, never across a model or tool
//! call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use norn_model::{ModelProvider, ToolSchema};
use norn_tools::ToolRegistry;

use crate::dispatch::ToolDispatcher;
use crate::driver::{AgentCoroutine, StepOutcome};
use crate::error::SubmitError;
use crate::graph::TaskGraph;
use crate::planner::Planner;
use crate::task::{Task, TaskId, TaskPayload, TaskSnapshot, TaskStatus, TaskType};

/// How long shutdown waits for in-flight work to observe the flag and
/// release its semaphore slot.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time scheduler statistics (the `GET /stats` payload).
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub is_running: bool,
    pub running_tasks: usize,
    pub pending_tasks: usize,
    pub resumption_queue_size: usize,
    pub total_known_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub max_concurrent_tasks: usize,
}

/// Which queue an admission came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// First admission from the ready queue.
    Fresh,
    /// Re-entry after a tool round, from the resumption queue.
    Resume,
}

struct State {
    graph: TaskGraph,
    /// Parked coroutines of suspended tasks, one per task in
    /// WAITING_FOR_TOOL (and of preempted tasks, for a future resume).
    coroutines: HashMap<TaskId, AgentCoroutine>,
    completed_tasks: u64,
    failed_tasks: u64,
    pending_queued: usize,
    resumption_queued: usize,
    is_running: bool,
}

struct Inner {
    state: Mutex<State>,
    semaphore: Arc<Semaphore>,
    max_concurrent_tasks: usize,
    ready_tx: mpsc::UnboundedSender<TaskId>,
    resume_tx: mpsc::UnboundedSender<TaskId>,
    /// Receivers parked here until `start()` moves them into the main loop.
    queues: Mutex<Option<(mpsc::UnboundedReceiver<TaskId>, mpsc::UnboundedReceiver<TaskId>)>>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    model: Arc<dyn ModelProvider>,
    planner: Planner,
    dispatcher: ToolDispatcher,
    /// Catalogue snapshot; fixed for the lifetime of the scheduler.
    tool_schemas: Vec<ToolSchema>,
    /// Woken on every terminal (or preempting) transition.
    terminal_notify: Notify,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        max_concurrent_tasks: usize,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let dispatcher = ToolDispatcher::new(tools);
        let tool_schemas = dispatcher.schemas();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    graph: TaskGraph::new(),
                    coroutines: HashMap::new(),
                    completed_tasks: 0,
                    failed_tasks: 0,
                    pending_queued: 0,
                    resumption_queued: 0,
                    is_running: false,
                }),
                semaphore: Arc::new(Semaphore::new(max_concurrent_tasks)),
                max_concurrent_tasks,
                ready_tx,
                resume_tx,
                queues: Mutex::new(Some((ready_rx, resume_rx))),
                loop_handle: Mutex::new(None),
                shutdown_tx,
                planner: Planner::new(Arc::clone(&model)),
                model,
                dispatcher,
                tool_schemas,
                terminal_notify: Notify::new(),
            }),
        }
    }

    /// Start the main loop in the background.  Idempotent.
    pub fn start(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.is_running {
                warn!("scheduler is already running");
                return;
            }
            st.is_running = true;
        }
        let Some((ready_rx, resume_rx)) = self.inner.queues.lock().unwrap().take() else {
            warn!("scheduler was already started once; refusing to restart");
            return;
        };
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(main_loop(inner, ready_rx, resume_rx));
        *self.inner.loop_handle.lock().unwrap() = Some(handle);
        info!("scheduler started");
    }

    /// Stop the main loop, preempt in-flight work, and wait (bounded) for
    /// every semaphore slot to be released.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self.inner.loop_handle.lock().unwrap().take();
        if let Some(h) = handle {
            let _ = h.await;
        }

        // In-flight work observes the flag at its next suspension point and
        // releases its slot; wait for all permits to come home.
        let sem = Arc::clone(&self.inner.semaphore);
        let cap = self.inner.max_concurrent_tasks;
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async move {
            while sem.available_permits() < cap {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        {
            let mut st = self.inner.state.lock().unwrap();
            st.is_running = false;
            for id in st.graph.non_terminal_ids() {
                if let Some(task) = st.graph.get_mut(id) {
                    task.preempt();
                }
            }
        }
        self.inner.terminal_notify.notify_waiters();
        info!("scheduler stopped");
    }

    /// Register a task and enqueue it as ready.
    pub fn submit(&self, task: Task) -> Result<TaskId, SubmitError> {
        let mut st = self.inner.state.lock().unwrap();
        if !st.is_running {
            return Err(SubmitError::NotRunning);
        }
        let id = st.graph.add(task)?;
        if self.inner.ready_tx.send(id).is_err() {
            return Err(SubmitError::NotRunning);
        }
        st.pending_queued += 1;
        debug!(task = %id, "task submitted");
        Ok(id)
    }

    /// Snapshot of one task, taken under the scheduler lock.
    pub fn get_task(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.state.lock().unwrap().graph.snapshot(id)
    }

    pub fn stats(&self) -> SchedulerStats {
        let st = self.inner.state.lock().unwrap();
        SchedulerStats {
            is_running: st.is_running,
            running_tasks: self.inner.max_concurrent_tasks
                - self.inner.semaphore.available_permits(),
            pending_tasks: st.pending_queued,
            resumption_queue_size: st.resumption_queued,
            total_known_tasks: st.graph.len(),
            completed_tasks: st.completed_tasks,
            failed_tasks: st.failed_tasks,
            max_concurrent_tasks: self.inner.max_concurrent_tasks,
        }
    }

    /// Wait until `id` reaches COMPLETED, FAILED, or PREEMPTED and return
    /// its snapshot.  Returns `None` for an unknown id.
    pub async fn wait_until_terminal(&self, id: TaskId) -> Option<TaskSnapshot> {
        loop {
            // Register with the Notify before checking, so a transition
            // between the check and the await cannot be missed.
            let mut notified = std::pin::pin!(self.inner.terminal_notify.notified());
            notified.as_mut().enable();
            let snap = self.get_task(id)?;
            if snap.status.is_terminal() || snap.status == TaskStatus::Preempted {
                return Some(snap);
            }
            notified.await;
        }
    }
}

/// Resolve once the shutdown flag is set — including when it was already
/// set before this call, which `changed()` alone would sleep through.
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    eprintln!("DBG wait_shutdown: enter, current={}", *rx.borrow());
    while !*rx.borrow_and_update() {
        eprintln!("DBG wait_shutdown: awaiting changed()");
        if rx.changed().await.is_err() {
            break;
        }
    }
    eprintln!("DBG wait_shutdown: returning");
}

// ─── Main loop ────────────────────────────────────────────────────────────────

async fn main_loop(
    inner: Arc<Inner>,
    mut ready_rx: mpsc::UnboundedReceiver<TaskId>,
    mut resume_rx: mpsc::UnboundedReceiver<TaskId>,
) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    info!("scheduler main loop started");
    loop {
        let next = tokio::select! {
            biased;
            _ = wait_shutdown(&mut shutdown_rx) => None,
            id = ready_rx.recv() => id.map(|i| (i, Admission::Fresh)),
            id = resume_rx.recv() => id.map(|i| (i, Admission::Resume)),
        };
        let Some((task_id, admission)) = next else {
            break;
        };

        {
            let mut st = inner.state.lock().unwrap();
            match admission {
                Admission::Fresh => st.pending_queued = st.pending_queued.saturating_sub(1),
                Admission::Resume => {
                    st.resumption_queued = st.resumption_queued.saturating_sub(1)
                }
            }
        }

        // Acquire a slot before spawning so admission order stays FIFO and
        // the loop itself blocks while the cap is saturated.
        let permit = tokio::select! {
            biased;
            _ = wait_shutdown(&mut shutdown_rx) => break,
            p = Arc::clone(&inner.semaphore).acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        admit(&inner, task_id, admission, permit);
    }
    info!("scheduler main loop stopped");
}

/// Decide what work a popped task needs and spawn it, permit in hand.
fn admit(inner: &Arc<Inner>, id: TaskId, admission: Admission, permit: OwnedSemaphorePermit) {
    let mut st = inner.state.lock().unwrap();
    let Some(task) = st.graph.get(id) else {
        warn!(task = %id, "admitted task is not in the graph");
        return;
    };

    // A queued task may have been failed by dependency propagation between
    // enqueue and admission; anything no longer admissible is skipped and
    // the permit returns with the early drop.
    let admissible = match (admission, task.status) {
        (Admission::Fresh, TaskStatus::Queued) => true,
        (Admission::Resume, TaskStatus::WaitingForTool) => true,
        _ => false,
    };
    if !admissible {
        debug!(task = %id, status = ?task.status, "skipping admission");
        return;
    }

    let task_type = task.task_type;
    match admission {
        Admission::Fresh if task_type == TaskType::Planning => {
            let goal = match task.payload.goal() {
                Some(g) => g.to_string(),
                None => {
                    drop(st);
                    finish_task(
                        inner,
                        id,
                        Err("invalid payload: a planning task requires a 'prompt' goal".into()),
                    );
                    return;
                }
            };
            if let Some(t) = st.graph.get_mut(id) {
                t.start();
            }
            drop(st);
            tokio::spawn(run_planning(Arc::clone(inner), id, goal, permit));
        }
        Admission::Fresh => {
            // The final-summary prompt is synthesised at admission time from
            // the results of the completed dependencies.
            if task_type == TaskType::FinalSummary {
                let prompt = summary_prompt(&st, id);
                if let Some(t) = st.graph.get_mut(id) {
                    t.payload = TaskPayload::prompt(prompt);
                }
            }
            let payload = match st.graph.get(id) {
                Some(t) => t.payload.clone(),
                None => return,
            };
            let coroutine = match AgentCoroutine::new(&payload) {
                Ok(co) => co,
                Err(e) => {
                    drop(st);
                    finish_task(inner, id, Err(e.to_string()));
                    return;
                }
            };
            if let Some(t) = st.graph.get_mut(id) {
                t.start();
            }
            drop(st);
            tokio::spawn(drive_leaf(Arc::clone(inner), id, coroutine, permit));
        }
        Admission::Resume => {
            let Some(coroutine) = st.coroutines.remove(&id) else {
                drop(st);
                finish_task(
                    inner,
                    id,
                    Err("internal error: no parked coroutine on resumption".into()),
                );
                return;
            };
            if let Some(t) = st.graph.get_mut(id) {
                t.start();
            }
            drop(st);
            tokio::spawn(drive_leaf(Arc::clone(inner), id, coroutine, permit));
        }
    }
}

// ─── Work futures ─────────────────────────────────────────────────────────────

/// Drive a leaf task for one RUNNING span: step the coroutine, and either
/// finish the task, or suspend it on a tool batch and queue its resumption.
async fn drive_leaf(
    inner: Arc<Inner>,
    id: TaskId,
    mut coroutine: AgentCoroutine,
    permit: OwnedSemaphorePermit,
) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    let outcome = tokio::select! {
        biased;
        _ = wait_shutdown(&mut shutdown_rx) => {
            preempt_task(&inner, id, Some(coroutine));
            drop(permit);
            return;
        }
        r = coroutine.step(inner.model.as_ref(), &inner.tool_schemas) => r,
    };

    let batch = match outcome {
        Err(e) => {
            drop(permit);
            finish_task(&inner, id, Err(format!("model call failed: {e:#}")));
            return;
        }
        Ok(StepOutcome::Final(text)) => {
            drop(permit);
            finish_task(&inner, id, Ok(text));
            return;
        }
        Ok(StepOutcome::ToolCalls(batch)) => batch,
    };

    // Suspend: the slot is released for the whole tool round and dispatch
    // runs outside the semaphore.
    {
        let mut st = inner.state.lock().unwrap();
        if let Some(t) = st.graph.get_mut(id) {
            t.status = TaskStatus::WaitingForTool;
        }
    }
    drop(permit);
    debug!(task = %id, calls = batch.len(), "task suspended on tool batch");

    // join_all preserves input order, which is the request order the
    // coroutine needs for reassembly.
    let dispatches = join_all(batch.iter().map(|tc| inner.dispatcher.invoke(tc)));
    let results = tokio::select! {
        biased;
        _ = wait_shutdown(&mut shutdown_rx) => {
            preempt_task(&inner, id, Some(coroutine));
            return;
        }
        r = dispatches => r,
    };

    coroutine.on_tool_results(results);

    let mut st = inner.state.lock().unwrap();
    st.coroutines.insert(id, coroutine);
    st.resumption_queued += 1;
    if inner.resume_tx.send(id).is_err() {
        // The main loop is gone; leave the task preempted.
        st.resumption_queued -= 1;
        if let Some(t) = st.graph.get_mut(id) {
            t.preempt();
        }
    }
}

/// Decompose a planning task and link its subtasks into the graph.
async fn run_planning(inner: Arc<Inner>, id: TaskId, goal: String, permit: OwnedSemaphorePermit) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    let plan = tokio::select! {
        biased;
        _ = wait_shutdown(&mut shutdown_rx) => {
            preempt_task(&inner, id, None);
            drop(permit);
            return;
        }
        p = inner.planner.decompose(&goal, &inner.tool_schemas) => p,
    };
    drop(permit);

    let plan = match plan {
        Ok(p) => p,
        Err(e) => {
            finish_task(&inner, id, Err(format!("planning failed: {e}")));
            return;
        }
    };

    // Task types were validated during plan parsing; a failure here means
    // the plan slipped through and is treated like any other plan error.
    let mut subtasks = Vec::with_capacity(plan.subtasks.len());
    for spec in plan.subtasks {
        match spec.task_type() {
            Ok(tt) => subtasks.push((Task::new(spec.name, spec.payload, tt), spec.dependencies)),
            Err(e) => {
                finish_task(&inner, id, Err(format!("planning failed: {e}")));
                return;
            }
        }
    }

    let mut st = inner.state.lock().unwrap();
    match st.graph.link(id, subtasks) {
        Ok(ready) => {
            if let Some(t) = st.graph.get_mut(id) {
                t.status = TaskStatus::WaitingForSubtasks;
            }
            info!(task = %id, ready = ready.len(), "plan linked; parent waiting for subtasks");
            for rid in ready {
                st.pending_queued += 1;
                let _ = inner.ready_tx.send(rid);
            }
        }
        Err(e) => {
            drop(st);
            finish_task(&inner, id, Err(format!("planning failed: {e}")));
        }
    }
}

// ─── Terminal transitions ─────────────────────────────────────────────────────

/// Apply a terminal outcome to `id`, then run the resolution cascade:
/// newly-ready dependents are enqueued, failed dependencies propagate, and
/// parents whose last subtask finished are closed — iteratively, so deep
/// parent chains unwind without recursion.
fn finish_task(inner: &Arc<Inner>, id: TaskId, outcome: Result<String, String>) {
    let mut st = inner.state.lock().unwrap();
    match st.graph.get_mut(id) {
        Some(task) => match outcome {
            Ok(result) => {
                info!(task = %id, name = %task.name, "task completed");
                task.complete(result);
            }
            Err(error) => {
                warn!(task = %id, name = %task.name, error = %error, "task failed");
                task.fail(error);
            }
        },
        None => return,
    }
    cascade_terminal(inner, &mut st, id);
    drop(st);
    inner.terminal_notify.notify_waiters();
}

fn cascade_terminal(inner: &Arc<Inner>, st: &mut State, start: TaskId) {
    let mut work = vec![start];

    while let Some(id) = work.pop() {
        let (status, result, name) = match st.graph.get(id) {
            Some(t) => (t.status, t.result.clone(), t.name.clone()),
            None => continue,
        };
        match status {
            TaskStatus::Completed => st.completed_tasks += 1,
            TaskStatus::Failed => st.failed_tasks += 1,
            _ => continue,
        }
        st.coroutines.remove(&id);

        // 1. Dependency resolution among siblings.
        if status == TaskStatus::Failed {
            // Dependents of a failed task fail without ever being admitted.
            let dependents = st
                .graph
                .get(id)
                .map(|t| t.dependents.clone())
                .unwrap_or_default();
            let reason = format!(
                "dependency '{name}' failed: {}",
                result.as_deref().unwrap_or("unknown error")
            );
            for dep_id in dependents {
                if let Some(dependent) = st.graph.get_mut(dep_id) {
                    if dependent.status == TaskStatus::Queued {
                        dependent.fail(reason.clone());
                        work.push(dep_id);
                    }
                }
            }
            // Clean the waiting sets regardless; nothing becomes ready off a
            // failed dependency.
            let _ = st.graph.resolve_dependency(id);
        } else {
            for ready_id in st.graph.resolve_dependency(id) {
                debug!(task = %ready_id, "dependencies resolved; enqueueing");
                st.pending_queued += 1;
                let _ = inner.ready_tx.send(ready_id);
            }
        }

        // 2. Parent closure.
        if let Some(parent_id) = st.graph.mark_parent_progress(id) {
            let Some(parent) = st.graph.get(parent_id) else {
                continue;
            };
            if parent.status != TaskStatus::WaitingForSubtasks {
                continue;
            }
            let subtask_ids = parent.subtasks.clone();
            let summary_id = parent.summary_subtask;

            let failed_child = subtask_ids.iter().find_map(|sid| {
                st.graph
                    .get(*sid)
                    .filter(|t| t.status == TaskStatus::Failed)
                    .map(|t| (t.name.clone(), t.result.clone()))
            });

            if let Some((child_name, child_result)) = failed_child {
                if let Some(parent) = st.graph.get_mut(parent_id) {
                    parent.fail(format!(
                        "subtask '{child_name}' failed: {}",
                        child_result.as_deref().unwrap_or("unknown error")
                    ));
                }
            } else {
                // Result fan-in: the designated summary subtask's result, or
                // an aggregation when no summary was designated.
                let result = match summary_id.and_then(|sid| st.graph.get(sid)) {
                    Some(summary) => summary.result.clone().unwrap_or_default(),
                    None => aggregate_results(st, &subtask_ids),
                };
                if let Some(parent) = st.graph.get_mut(parent_id) {
                    parent.complete(result);
                }
            }
            work.push(parent_id);
        }
    }
}

/// JSON object mapping subtask names to their results, used when a plan has
/// no designated summary subtask.
fn aggregate_results(st: &State, subtask_ids: &[TaskId]) -> String {
    let mut map = serde_json::Map::new();
    for sid in subtask_ids {
        if let Some(t) = st.graph.get(*sid) {
            map.insert(
                t.name.clone(),
                serde_json::Value::String(t.result.clone().unwrap_or_default()),
            );
        }
    }
    serde_json::Value::Object(map).to_string()
}

/// Deterministic final-summary prompt: the root goal, then one section per
/// completed dependency with its result JSON-encoded.
fn summary_prompt(st: &State, id: TaskId) -> String {
    let Some(task) = st.graph.get(id) else {
        return String::new();
    };
    let goal = task
        .parent
        .and_then(|p| st.graph.get(p))
        .and_then(|p| p.payload.goal())
        .unwrap_or("")
        .to_string();

    let mut sections = String::new();
    for dep_id in &task.dependencies {
        if let Some(dep) = st.graph.get(*dep_id) {
            if dep.status == TaskStatus::Completed {
                let encoded = serde_json::Value::String(
                    dep.result.clone().unwrap_or_default(),
                )
                .to_string();
                sections.push_str(&format!("- Result from {}: {}\n", dep.name, encoded));
            }
        }
    }

    format!(
        "{goal}\n\nSynthesise the final answer for the user from the results of the completed subtasks:\n\n{sections}"
    )
}

fn preempt_task(inner: &Arc<Inner>, id: TaskId, coroutine: Option<AgentCoroutine>) {
    let mut st = inner.state.lock().unwrap();
    if let Some(task) = st.graph.get_mut(id) {
        task.preempt();
    }
    // Park the coroutine so a future implementation could resume it.
    if let Some(co) = coroutine {
        st.coroutines.insert(id, co);
    }
    drop(st);
    inner.terminal_notify.notify_waiters();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
//
// Scheduler behaviour is exercised end-to-end in crate::tests; the tests
// here cover the pieces that do not need a running main loop.
