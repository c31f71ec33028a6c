//! Priority-aware, cancellable worker pool (spec §4.3).
//!
//! Grounded in `SH11235-rshogi`'s `ThreadPool`/`worker_loop` (separate
//! control and job channels per worker, a dedicated control channel checked
//! cooperatively during work, graceful shutdown by joining handles) and in
//! `freddiehaddad-oxidized`'s choice of `crossbeam-channel` for control-
//! thread/worker fan-out. Unlike the teacher's pool (a single shared pull
//! queue), this pool pushes a job to a specific idle worker at drain time,
//! since spec §4.3 requires priority to be re-evaluated and the job handed
//! to "the chosen worker" rather than pulled opportunistically.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};

use crate::error::{CoreError, InvalidInput};
use crate::job::{Job, JobId, WorkerCommand, WorkerMessage};
use crate::solver::Solver;
use crate::window::WarmStartStrategy;

/// Wall-clock cadence for `on_intermediate`-equivalent messages (spec §4.1,
/// "target ~10 Hz").
const EMIT_INTERVAL: Duration = Duration::from_millis(100);

struct WorkerHandle {
    job_tx: Sender<Job>,
    ctrl_tx: Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
    busy: Option<JobId>,
}

/// Owns `N` worker threads, each wrapping one long-lived [`Solver`]
/// instance, and a pending-job queue re-sorted by priority at every drain
/// (spec §4.3 "Queueing and draining").
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    queue: Vec<Job>,
    results_tx: Sender<WorkerMessage>,
    results_rx: Receiver<WorkerMessage>,
    batch_size: u32,
}

impl WorkerPool {
    pub fn new(size: usize, batch_size: u32) -> Self {
        let size = size.max(1);
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        let workers = (0..size).map(|id| spawn_worker(id, results_tx.clone(), batch_size)).collect();
        WorkerPool { workers, queue: Vec::new(), results_tx, results_rx, batch_size }
    }

    /// Resolve pool size from a configured cap and the host's hardware
    /// concurrency (spec §5, `N = min(hardware_concurrency, 4)`).
    pub fn resolved_size(pool_size_cap: usize) -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(pool_size_cap.max(1))
    }

    /// Receiver for worker-to-pool messages. The caller (the Cell Solve
    /// Manager's event loop) selects over this alongside debounce timers.
    pub fn results(&self) -> &Receiver<WorkerMessage> {
        &self.results_rx
    }

    /// Enqueue a job and immediately attempt to drain (spec §4.3
    /// "`dispatch(job)` appends to the queue and calls `drain`").
    pub fn dispatch(&mut self, job: Job) {
        tracing::debug!(job_id = job.job_id, "job enqueued");
        self.queue.push(job);
        self.drain();
    }

    fn drain(&mut self) {
        loop {
            if self.queue.is_empty() {
                return;
            }
            let Some(idle_idx) = self.workers.iter().position(|w| w.busy.is_none()) else {
                return;
            };
            self.queue.sort_by_key(Job::priority);
            let job = self.queue.remove(0);
            let job_id = job.job_id;
            if self.workers[idle_idx].job_tx.send(job).is_err() {
                tracing::warn!(worker = idle_idx, "worker channel closed, respawning");
                self.workers[idle_idx] = spawn_worker(idle_idx, self.results_tx.clone(), self.batch_size);
                let fatal = CoreError::WorkerFatal { worker_id: idle_idx, message: "died before accepting job".into() };
                let _ = self.results_tx.send(WorkerMessage::Error { job_id, message: fatal.to_string() });
                continue;
            }
            self.workers[idle_idx].busy = Some(job_id);
        }
    }

    /// Replace any worker whose thread has exited without a corresponding
    /// result message (a panic). Call periodically from the owning event
    /// loop; a clean shutdown never triggers this path.
    pub fn reap_dead_workers(&mut self) {
        for idx in 0..self.workers.len() {
            let finished = self.workers[idx].handle.as_ref().is_some_and(JoinHandle::is_finished);
            if !finished {
                continue;
            }
            if let Some(job_id) = self.workers[idx].busy.take() {
                tracing::error!(worker = idx, job_id, "worker panicked mid-job");
                let fatal = CoreError::WorkerFatal { worker_id: idx, message: "panicked mid-job".into() };
                let _ = self.results_tx.send(WorkerMessage::Error { job_id, message: fatal.to_string() });
            }
            if let Some(h) = self.workers[idx].handle.take() {
                let _ = h.join();
            }
            self.workers[idx] = spawn_worker(idx, self.results_tx.clone(), self.batch_size);
        }
        self.drain();
    }

    /// Must be called once per terminal [`WorkerMessage`] (`Complete`,
    /// `Cancelled` for a busy job, or `Error`) so the pool's idle/busy
    /// bookkeeping stays accurate.
    pub fn notify_worker_free(&mut self, job_id: JobId) {
        if let Some(worker) = self.workers.iter_mut().find(|w| w.busy == Some(job_id)) {
            worker.busy = None;
        }
        self.drain();
    }

    /// Cancel one job: pre-dispatch removes it from the queue and emits
    /// `Cancelled` synchronously; mid-iteration sends a cancel signal to the
    /// owning worker (spec §4.3 "Cancellation").
    pub fn cancel(&mut self, job_id: JobId) {
        if let Some(pos) = self.queue.iter().position(|j| j.job_id == job_id) {
            self.queue.remove(pos);
            let _ = self.results_tx.send(WorkerMessage::Cancelled { job_id });
            return;
        }
        for worker in &self.workers {
            if worker.busy == Some(job_id) {
                let _ = worker.ctrl_tx.send(WorkerCommand::Cancel(job_id));
                return;
            }
        }
    }

    /// Empty the queue (each removed job gets `Cancelled`) and signal every
    /// busy worker (spec §4.3 "cancel_all").
    pub fn cancel_all(&mut self) {
        for job in self.queue.drain(..) {
            let _ = self.results_tx.send(WorkerMessage::Cancelled { job_id: job.job_id });
        }
        for worker in &self.workers {
            if worker.busy.is_some() {
                let _ = worker.ctrl_tx.send(WorkerCommand::CancelAll);
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Cancel everything and join every worker thread.
    pub fn dispose(&mut self) {
        self.cancel_all();
        for worker in &self.workers {
            let _ = worker.ctrl_tx.send(WorkerCommand::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(h) = worker.handle.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn spawn_worker(worker_id: usize, results_tx: Sender<WorkerMessage>, batch_size: u32) -> WorkerHandle {
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
    let (ctrl_tx, ctrl_rx) = crossbeam_channel::unbounded::<WorkerCommand>();
    let handle = thread::Builder::new()
        .name(format!("catune-worker-{worker_id}"))
        .spawn(move || worker_loop(job_rx, ctrl_rx, results_tx, batch_size))
        .expect("spawn catune worker thread");
    WorkerHandle { job_tx, ctrl_tx, handle: Some(handle), busy: None }
}

fn worker_loop(job_rx: Receiver<Job>, ctrl_rx: Receiver<WorkerCommand>, results_tx: Sender<WorkerMessage>, batch_size: u32) {
    let mut solver: Option<Solver> = None;
    loop {
        select! {
            recv(ctrl_rx) -> msg => match msg {
                Ok(WorkerCommand::Shutdown) | Err(_) => break,
                Ok(_) => continue,
            },
            recv(job_rx) -> msg => {
                let Ok(job) = msg else { break };
                run_job(&mut solver, job, &ctrl_rx, &results_tx, batch_size);
            }
        }
    }
}

fn run_job(solver_slot: &mut Option<Solver>, job: Job, ctrl_rx: &Receiver<WorkerCommand>, results_tx: &Sender<WorkerMessage>, batch_size: u32) {
    let job_id = job.job_id;
    tracing::trace!(job_id, "job started");

    let solver = match solver_slot {
        Some(s) => {
            if let Err(err) = s.set_params(job.params) {
                let _ = results_tx.send(WorkerMessage::Error { job_id, message: err.to_string() });
                return;
            }
            s
        }
        None => match Solver::new(job.params) {
            Ok(s) => solver_slot.insert(s),
            Err(err) => {
                let _ = results_tx.send(WorkerMessage::Error { job_id, message: err.to_string() });
                return;
            }
        },
    };

    if let Err(err) = solver.set_trace(&job.padded_trace) {
        let _ = results_tx.send(WorkerMessage::Error { job_id, message: err.to_string() });
        return;
    }

    if job.warm_strategy != WarmStartStrategy::Cold {
        let load_result = match job.warm_state.as_ref() {
            Some(blob) => solver.load_state(blob, job.warm_strategy),
            None => Err(InvalidInput::MissingWarmState),
        };
        if let Err(err) = load_result {
            let _ = results_tx.send(WorkerMessage::Error { job_id, message: err.to_string() });
            return;
        }
    }

    let mut last_emit = Instant::now();
    let mut steps_taken: u32 = 0;

    while steps_taken < job.max_iterations {
        let chunk = (job.max_iterations - steps_taken).min(batch_size.max(1));
        let iter_before = solver.iteration_count();
        let mut cancelled = false;

        let outcome = solver.step_batch(chunk, batch_size, || match ctrl_rx.try_recv() {
            Ok(WorkerCommand::Cancel(id)) if id == job_id => {
                cancelled = true;
                true
            }
            Ok(WorkerCommand::CancelAll) | Ok(WorkerCommand::Shutdown) => {
                cancelled = true;
                true
            }
            Ok(_) | Err(_) => false,
        });

        steps_taken += solver.iteration_count() - iter_before;

        match outcome {
            Ok(_) => {}
            Err(err) => {
                let _ = results_tx.send(WorkerMessage::Error { job_id, message: err.to_string() });
                return;
            }
        }

        if cancelled {
            tracing::debug!(job_id, "job cancelled mid-solve");
            let _ = results_tx.send(WorkerMessage::Cancelled { job_id });
            return;
        }

        if solver.converged() {
            break;
        }

        if last_emit.elapsed() >= EMIT_INTERVAL {
            let _ = results_tx.send(WorkerMessage::Intermediate {
                job_id,
                solution: solver.solution().to_vec(),
                reconvolution: solver.reconvolution().to_vec(),
                iteration: solver.iteration_count(),
            });
            last_emit = Instant::now();
        }
    }

    let filtered_trace = solver.params().filter_enabled.then(|| solver.filtered_trace().to_vec());
    let _ = results_tx.send(WorkerMessage::Complete {
        job_id,
        solution: solver.solution().to_vec(),
        reconvolution: solver.reconvolution().to_vec(),
        state: solver.export_state(),
        iterations: solver.iteration_count(),
        converged: solver.converged(),
        filtered_trace,
        baseline: solver.baseline(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SolverParams;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn params() -> SolverParams {
        SolverParams::new(0.02, 0.4, 0.01, 30.0, false)
    }

    fn job(job_id: JobId, trace_len: usize, priority: i32, max_iterations: u32) -> Job {
        let kernel_peak_len = 50;
        let mut trace = vec![0.0_f32; trace_len];
        if trace_len > kernel_peak_len {
            trace[kernel_peak_len] = 3.0;
        }
        Job {
            job_id,
            padded_trace: trace,
            params: params(),
            warm_state: None,
            warm_strategy: WarmStartStrategy::Cold,
            max_iterations,
            priority_fn: Box::new(move || priority),
        }
    }

    fn recv_timeout(pool: &WorkerPool) -> WorkerMessage {
        pool.results().recv_timeout(Duration::from_secs(5)).expect("expected a worker message")
    }

    #[test]
    fn single_job_completes() {
        let mut pool = WorkerPool::new(2, 32);
        pool.dispatch(job(1, 300, 0, 500));

        loop {
            match recv_timeout(&pool) {
                WorkerMessage::Complete { job_id, converged, .. } => {
                    assert_eq!(job_id, 1);
                    assert!(converged);
                    pool.notify_worker_free(job_id);
                    break;
                }
                WorkerMessage::Intermediate { job_id, .. } => {
                    pool.notify_worker_free(job_id); // no-op, worker still busy; exercised for coverage
                }
                other => panic!("unexpected message for job 1: job_id={}", other.job_id()),
            }
        }
    }

    #[test]
    fn queue_drains_in_priority_order() {
        let mut pool = WorkerPool::new(1, 32);
        pool.dispatch(job(1, 300, 2, 500)); // starts running immediately (only worker is idle)
        pool.dispatch(job(2, 300, 0, 500)); // queued, higher priority than job 3
        pool.dispatch(job(3, 300, 1, 500)); // queued

        let mut completion_order = Vec::new();
        while completion_order.len() < 3 {
            if let WorkerMessage::Complete { job_id, .. } = recv_timeout(&pool) {
                completion_order.push(job_id);
                pool.notify_worker_free(job_id);
            }
        }
        assert_eq!(completion_order, vec![1, 2, 3]);
    }

    #[test]
    fn pre_dispatch_cancel_removes_from_queue() {
        let mut pool = WorkerPool::new(1, 32);
        pool.dispatch(job(1, 300, 0, 500));
        pool.dispatch(job(2, 300, 0, 500));
        pool.cancel(2);

        let mut saw_cancel_for_2 = false;
        loop {
            match recv_timeout(&pool) {
                WorkerMessage::Cancelled { job_id } if job_id == 2 => {
                    saw_cancel_for_2 = true;
                    break;
                }
                WorkerMessage::Complete { job_id, .. } => {
                    pool.notify_worker_free(job_id);
                    if job_id == 1 {
                        continue;
                    }
                }
                _ => continue,
            }
        }
        assert!(saw_cancel_for_2);
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn mid_iteration_cancel_is_prompt() {
        let mut pool = WorkerPool::new(1, 32);
        pool.dispatch(job(1, 20_000, 0, 1_000_000));

        std::thread::sleep(Duration::from_millis(5));
        pool.cancel(1);

        match recv_timeout(&pool) {
            WorkerMessage::Cancelled { job_id } => assert_eq!(job_id, 1),
            other => panic!("expected Cancelled, got job_id={}", other.job_id()),
        }
    }

    #[test]
    fn hover_promotion_reorders_pending_drain() {
        let priority = Arc::new(AtomicI32::new(2));
        let pool_priority = Arc::clone(&priority);

        let mut pool = WorkerPool::new(1, 32);
        pool.dispatch(job(1, 300, 0, 500)); // occupies the only worker
        pool.dispatch(Job {
            job_id: 2,
            padded_trace: vec![0.0_f32; 300],
            params: params(),
            warm_state: None,
            warm_strategy: WarmStartStrategy::Cold,
            max_iterations: 500,
            priority_fn: Box::new(move || pool_priority.load(Ordering::SeqCst)),
        });
        pool.dispatch(job(3, 300, 1, 500));

        priority.store(-1, Ordering::SeqCst); // promote job 2 ahead of job 3

        let mut completion_order = Vec::new();
        while completion_order.len() < 3 {
            if let WorkerMessage::Complete { job_id, .. } = recv_timeout(&pool) {
                completion_order.push(job_id);
                pool.notify_worker_free(job_id);
            }
        }
        assert_eq!(completion_order, vec![1, 2, 3]);
    }

    #[test]
    fn cancel_all_drains_queue_and_cancels_busy() {
        let mut pool = WorkerPool::new(1, 32);
        pool.dispatch(job(1, 20_000, 0, 1_000_000));
        pool.dispatch(job(2, 300, 0, 500));
        pool.cancel_all();

        let mut cancelled = std::collections::HashSet::new();
        while cancelled.len() < 2 {
            if let WorkerMessage::Cancelled { job_id } = recv_timeout(&pool) {
                cancelled.insert(job_id);
            }
        }
        assert!(cancelled.contains(&1));
        assert!(cancelled.contains(&2));
    }

    #[test]
    fn resolved_size_respects_cap() {
        assert!(WorkerPool::resolved_size(4) <= 4);
        assert_eq!(WorkerPool::resolved_size(1), 1);
    }

    #[test]
    fn worker_count_matches_constructed_size() {
        let pool = WorkerPool::new(3, 32);
        assert_eq!(pool.worker_count(), 3);
    }
}
