//! Job envelopes and the pool/worker wire protocol (spec §3 "Job", §6
//! "Job → Worker wire messages"). No teacher analog — the WASM solver has no
//! concept of a job, since it's driven synchronously from one JS thread.
//! The message shapes are grounded in spec.md §6 directly; routing by
//! `job_id` rather than captured closures follows the design note in
//! spec.md §9 ("Closure-based callbacks → message routing").

use crate::params::SolverParams;
use crate::solver::StateBlob;
use crate::window::WarmStartStrategy;

pub type JobId = u64;

/// Lower value = higher priority. `0` = active/hovered, `1` = visible,
/// `2` = off-screen (spec §3 "Job").
pub type Priority = i32;

/// Evaluated at drain time, not enqueue time, so priority tracks live user
/// intent (spec §4.3 "draining").
pub type PriorityFn = Box<dyn Fn() -> Priority + Send>;

/// A dispatched unit of work. Trace and warm-state buffers are owned here
/// and move into the worker by channel send — never shared or cloned behind
/// an `Arc` (spec §4.3 "Buffer ownership").
pub struct Job {
    pub job_id: JobId,
    pub padded_trace: Vec<f32>,
    pub params: SolverParams,
    pub warm_state: Option<StateBlob>,
    pub warm_strategy: WarmStartStrategy,
    pub max_iterations: u32,
    pub priority_fn: PriorityFn,
}

impl Job {
    pub fn priority(&self) -> Priority {
        (self.priority_fn)()
    }
}

/// Worker → pool messages (spec §6). All variants carry `job_id` so the
/// receiver can route without the worker holding a reference back into
/// caller state (spec §9 "Cyclic references").
pub enum WorkerMessage {
    Intermediate {
        job_id: JobId,
        solution: Vec<f32>,
        reconvolution: Vec<f32>,
        iteration: u32,
    },
    Complete {
        job_id: JobId,
        solution: Vec<f32>,
        reconvolution: Vec<f32>,
        state: StateBlob,
        iterations: u32,
        converged: bool,
        filtered_trace: Option<Vec<f32>>,
        baseline: f64,
    },
    Cancelled {
        job_id: JobId,
    },
    Error {
        job_id: JobId,
        message: String,
    },
}

impl WorkerMessage {
    pub fn job_id(&self) -> JobId {
        match self {
            WorkerMessage::Intermediate { job_id, .. }
            | WorkerMessage::Complete { job_id, .. }
            | WorkerMessage::Cancelled { job_id, .. }
            | WorkerMessage::Error { job_id, .. } => *job_id,
        }
    }
}

/// Pool → worker control signals, sent on a channel separate from the job
/// channel so a cancel for job N can be observed while the worker is mid
/// solve on job N without racing the next dispatched job (spec §4.3
/// "Mid-iteration cancel").
pub(crate) enum WorkerCommand {
    Cancel(JobId),
    CancelAll,
    Shutdown,
}
