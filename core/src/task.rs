use crossbeam_channel::Receiver;
use log::{debug, error, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::component::ComponentLogic;
use crate::mailbox::{self, QueuedCall};

/// How a task's step logic gets driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Own thread; one step per period. Each wakeup is scheduled relative
    /// to the previous one, so jitter accumulates instead of steps being
    /// skipped.
    Periodic(Duration),
    /// Own thread; steps run back to back, parking only while the task is
    /// not started.
    Continuous,
    /// No owned thread; a foreign thread drives steps through a
    /// [`CallbackEntry`] whenever it chooses to.
    FromCallback,
}

/// Task lifecycle states.
///
/// `Constructed → Initializing → Ready ⇄ Active → Finished`, with `Killed`
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Constructed,
    Initializing,
    Ready,
    Active,
    Finished,
    Killed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Killed)
    }
}

struct TaskSync {
    state: TaskState,
    start_requested: bool,
    kill_requested: bool,
    finish_requested: bool,
}

/// Shared lifecycle state of one task. Park/wake goes through the condvar
/// with all flags behind the mutex, so a wake that arrives before the park
/// is never lost.
pub(crate) struct TaskCore {
    name: String,
    policy: SchedulingPolicy,
    sync: Mutex<TaskSync>,
    cond: Condvar,
}

impl TaskCore {
    pub fn new(name: &str, policy: SchedulingPolicy) -> Self {
        Self {
            name: name.to_string(),
            policy,
            sync: Mutex::new(TaskSync {
                state: TaskState::Constructed,
                start_requested: false,
                kill_requested: false,
                finish_requested: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, TaskSync> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    fn transition(&self, sync: &mut TaskSync, to: TaskState) {
        if sync.state != to {
            debug!("task '{}' {:?} -> {:?}", self.name, sync.state, to);
            sync.state = to;
        }
        self.cond.notify_all();
    }

    /// Start, or remember the wish to start if the task is still coming up.
    pub fn request_start(&self) {
        let mut sync = self.lock();
        match sync.state {
            TaskState::Ready => self.transition(&mut sync, TaskState::Active),
            TaskState::Constructed | TaskState::Initializing => {
                sync.start_requested = true;
            }
            TaskState::Active => {}
            TaskState::Finished | TaskState::Killed => {
                warn!("task '{}' cannot start from {:?}", self.name, sync.state);
            }
        }
    }

    pub fn request_suspend(&self) {
        let mut sync = self.lock();
        if sync.state == TaskState::Active {
            self.transition(&mut sync, TaskState::Ready);
        }
    }

    /// Request termination and wake the task wherever it is parked. The
    /// driver observes the request at its next suspension point.
    pub fn request_kill(&self) {
        let mut sync = self.lock();
        sync.kill_requested = true;
        self.cond.notify_all();
    }

    /// Like kill, but the task ends in `Finished`: the graceful shutdown.
    pub fn request_finish(&self) {
        let mut sync = self.lock();
        sync.finish_requested = true;
        self.cond.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        let sync = self.lock();
        sync.kill_requested || sync.finish_requested
    }

    /// Move a terminal-bound task to its final state directly, without a
    /// driver thread involved (never-created tasks, callback tasks).
    pub fn force_terminal(&self) {
        let mut sync = self.lock();
        if !sync.state.is_terminal() {
            let to = if sync.kill_requested || !sync.finish_requested {
                TaskState::Killed
            } else {
                TaskState::Finished
            };
            self.transition(&mut sync, to);
        }
    }

    pub fn wait_for_state(&self, target: TaskState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sync = self.lock();
        loop {
            if sync.state == target {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, _timed_out) = self
                .cond
                .wait_timeout(sync, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            sync = guard;
        }
    }

    // --- driver side ---

    pub(crate) fn begin_initializing(&self) {
        let mut sync = self.lock();
        self.transition(&mut sync, TaskState::Initializing);
    }

    /// Startup finished: park in Ready, or go straight to Active if a start
    /// request arrived while initializing.
    fn enter_ready(&self) {
        let mut sync = self.lock();
        let to = if sync.start_requested {
            sync.start_requested = false;
            TaskState::Active
        } else {
            TaskState::Ready
        };
        self.transition(&mut sync, to);
    }

    fn fail_startup(&self) {
        let mut sync = self.lock();
        self.transition(&mut sync, TaskState::Finished);
    }

    /// Park until the task is started or asked to stop. Returns `false`
    /// when the driver should exit its loop.
    fn park_until_active(&self) -> bool {
        let mut sync = self.lock();
        loop {
            if sync.kill_requested || sync.finish_requested {
                return false;
            }
            if sync.state == TaskState::Active {
                return true;
            }
            sync = self.cond.wait(sync).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn step_allowed(&self) -> bool {
        let sync = self.lock();
        sync.state == TaskState::Active && !sync.kill_requested && !sync.finish_requested
    }

    /// Sleep out the remainder of a periodic cycle, waking early for a
    /// suspend, kill or finish request.
    fn park_until_deadline(&self, deadline: Instant) {
        let mut sync = self.lock();
        loop {
            if sync.state != TaskState::Active || sync.kill_requested || sync.finish_requested {
                return;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            let (guard, _timed_out) = self
                .cond
                .wait_timeout(sync, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            sync = guard;
        }
    }

    /// Thread exit: the final state records whether this was a kill or a
    /// graceful finish.
    fn finalize(&self) {
        let mut sync = self.lock();
        let to = if sync.kill_requested {
            TaskState::Killed
        } else {
            TaskState::Finished
        };
        self.transition(&mut sync, to);
    }
}

/// Spawn the driver thread for a Periodic or Continuous task.
pub(crate) fn spawn_driver(
    core: Arc<TaskCore>,
    logic: Box<dyn ComponentLogic>,
    inbox: Receiver<QueuedCall>,
) -> std::io::Result<JoinHandle<()>> {
    let name = format!("task-{}", core.name());
    std::thread::Builder::new()
        .name(name)
        .spawn(move || drive(core, logic, inbox))
}

fn drive(core: Arc<TaskCore>, mut logic: Box<dyn ComponentLogic>, inbox: Receiver<QueuedCall>) {
    core.begin_initializing();
    match catch_unwind(AssertUnwindSafe(|| logic.startup())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("task '{}' startup failed: {:#}", core.name(), e);
            core.fail_startup();
            return;
        }
        Err(_) => {
            error!("task '{}' startup panicked", core.name());
            core.fail_startup();
            return;
        }
    }
    core.enter_ready();

    while core.park_until_active() {
        while core.step_allowed() {
            let cycle_start = Instant::now();
            mailbox::drain(core.name(), &inbox);
            run_step(&core, logic.as_mut());
            if let SchedulingPolicy::Periodic(period) = core.policy() {
                core.park_until_deadline(cycle_start + period);
            }
        }
    }

    // Leftover queued handlers still get their serialized slot before the
    // task goes away.
    mailbox::drain(core.name(), &inbox);
    if catch_unwind(AssertUnwindSafe(|| logic.cleanup())).is_err() {
        error!("task '{}' cleanup panicked", core.name());
    }
    core.finalize();
}

/// One step, with the panic boundary. A panicking step is logged and the
/// task keeps running; the next scheduled step still happens.
fn run_step(core: &TaskCore, logic: &mut dyn ComponentLogic) {
    if catch_unwind(AssertUnwindSafe(|| logic.step())).is_err() {
        error!("task '{}' step panicked, task keeps running", core.name());
    }
}

pub(crate) struct CallbackBody {
    pub logic: Box<dyn ComponentLogic>,
    pub inbox: Receiver<QueuedCall>,
}

/// Entry point of a callback-driven task, handed to the foreign code that
/// owns the driving thread. Cloneable; all clones share the one task.
#[derive(Clone)]
pub struct CallbackEntry {
    core: Arc<TaskCore>,
    body: Arc<Mutex<CallbackBody>>,
}

impl CallbackEntry {
    pub(crate) fn new(core: Arc<TaskCore>, body: Arc<Mutex<CallbackBody>>) -> Self {
        Self { core, body }
    }

    pub fn task_name(&self) -> &str {
        self.core.name()
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Drive the task once. The first invocation after `create()` runs the
    /// startup hook inline on the calling thread; while the task is Active,
    /// each invocation drains queued events and runs one step.
    ///
    /// Concurrent invocation from a second thread is a bug in the host: it
    /// is logged and ignored, never served.
    pub fn invoke(&self) {
        let Ok(mut body) = self.body.try_lock() else {
            warn!(
                "task '{}' callback invoked re-entrantly, ignoring",
                self.core.name()
            );
            return;
        };

        if self.core.stop_requested() {
            finish_callback_task(&self.core, &mut body);
            return;
        }

        match self.core.state() {
            TaskState::Constructed => {
                debug!(
                    "task '{}' callback invoked before create(), ignoring",
                    self.core.name()
                );
            }
            TaskState::Initializing => {
                match catch_unwind(AssertUnwindSafe(|| body.logic.startup())) {
                    Ok(Ok(())) => self.core.enter_ready(),
                    Ok(Err(e)) => {
                        error!("task '{}' startup failed: {:#}", self.core.name(), e);
                        self.core.fail_startup();
                    }
                    Err(_) => {
                        error!("task '{}' startup panicked", self.core.name());
                        self.core.fail_startup();
                    }
                }
            }
            TaskState::Ready => {}
            TaskState::Active => {
                mailbox::drain(self.core.name(), &body.inbox);
                run_step(&self.core, body.logic.as_mut());
                // A stop request that arrived during the step must not wait
                // for an invocation that may never come.
                if self.core.stop_requested() {
                    finish_callback_task(&self.core, &mut body);
                }
            }
            TaskState::Finished | TaskState::Killed => {}
        }
    }
}

/// Terminate a callback task: run cleanup if the task ever finished its
/// startup, then settle the terminal state. Callers must hold the body
/// lock, which is what serializes this against a concurrent invocation.
pub(crate) fn finish_callback_task(core: &TaskCore, body: &mut CallbackBody) {
    let state = core.state();
    if state.is_terminal() {
        return;
    }
    if matches!(state, TaskState::Ready | TaskState::Active) {
        mailbox::drain(core.name(), &body.inbox);
        if catch_unwind(AssertUnwindSafe(|| body.logic.cleanup())).is_err() {
            error!("task '{}' cleanup panicked", core.name());
        }
    }
    core.force_terminal();
}
