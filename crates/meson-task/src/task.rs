//! The cooperative stateful task and its multiplexer.
//!
//! A [`Task`] is a user state machine: a step closure that is re-entered
//! with the current run state until it finishes, aborts, or suspends
//! itself. The runtime owns the re-entry loop ([`multiplex`](Task::multiplex));
//! user code never blocks an OS thread — it calls `wait()` and returns.
//!
//! A task is driven by its [`Handler`]:
//!
//! * `Immediate` — multiplexed inline on whatever thread runs, signals, or
//!   wakes it;
//! * `Engine` — owned by a cooperative [`Engine`](crate::Engine) whose
//!   `mainloop()` the application calls;
//! * `Queue` — wrapped in a callable and pushed onto a thread-pool
//!   priority queue.
//!
//! The EXECUTING flag in the sub-state word guarantees a task's step
//! function never runs on two threads at once; concurrent wake-ups are
//! folded into a RELAUNCH of the running loop.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use meson_pool::QueueHandle;
use tracing::{debug, trace};

use crate::engine::Engine;
use crate::runtime::Runtime;
use crate::substate::{SignalEffect, SubState};

/// Which executor multiplexes a task.
#[derive(Clone)]
pub enum Handler {
    /// Run inline on the calling thread.
    Immediate,
    /// Run from the engine's `mainloop()`.
    Engine(Arc<Engine>),
    /// Run on a thread-pool priority queue.
    Queue(QueueHandle),
}

impl Handler {
    fn matches(&self, other: &Handler) -> bool {
        match (self, other) {
            (Handler::Immediate, Handler::Immediate) => true,
            (Handler::Engine(a), Handler::Engine(b)) => Arc::ptr_eq(a, b),
            (Handler::Queue(a), Handler::Queue(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Immediate => f.write_str("immediate"),
            Handler::Engine(engine) => write!(f, "engine({})", engine.name()),
            Handler::Queue(handle) => write!(f, "queue({handle})"),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BaseState {
    /// `run()` was called; the first multiplex cycle has not happened yet.
    Initialize,
    /// The task is being stepped.
    Multiplex,
    /// The task is parked in a `wait()`.
    Wait,
    /// `finish()` was called; completion runs on the next cycle.
    Finish,
    /// `abort()` was honored; completion runs on the next cycle.
    Abort,
    /// Not running: newly built, or released after finish/abort.
    Killed,
}

type StepFn = Box<dyn FnMut(&Arc<Task>, u32) + Send>;
type StateNameFn = Box<dyn Fn(u32) -> &'static str + Send + Sync>;
type DoneFn = Box<dyn FnOnce(bool) + Send>;
type HookFn = Box<dyn FnOnce(&Arc<Task>) + Send>;

enum YieldTarget {
    Current,
    To(Handler),
}

struct TaskInner {
    base: BaseState,
    run_state: u32,
    initial_state: u32,
    handler: Handler,
    runtime: Option<Arc<Runtime>>,
    callback: Option<DoneFn>,
    parent: Option<(Weak<Task>, u16)>,
    yield_request: Option<YieldTarget>,
    /// Engine frame this task sleeps until (yield_frames).
    wake_frame: u64,
}

/// A cooperative state-machine task.
///
/// Build one with [`TaskBuilder`], start it with [`run`](Task::run), and
/// communicate with it through [`signal`](Task::signal). Shared ownership:
/// the task object is destroyed when the last `Arc` goes away; completion
/// drops the step closure (and everything it captured) eagerly.
pub struct Task {
    name: &'static str,
    sub: SubState,
    inner: Mutex<TaskInner>,
    step: Mutex<Option<StepFn>>,
    state_name: StateNameFn,
    on_finish: Mutex<Option<HookFn>>,
    on_abort: Mutex<Option<HookFn>>,
}

/// Capability set for a [`Task`]: step function, state names, and optional
/// finish/abort hooks.
pub struct TaskBuilder {
    name: &'static str,
    initial_state: u32,
    step: StepFn,
    state_name: StateNameFn,
    on_finish: Option<HookFn>,
    on_abort: Option<HookFn>,
}

impl TaskBuilder {
    /// Starts a builder from the task's name and step function.
    ///
    /// The step function receives the task itself and the current run
    /// state; it must advance the machine by calling `set_state`, `wait`,
    /// `yield_*`, `finish` or `abort` on the task.
    pub fn new(
        name: &'static str,
        step: impl FnMut(&Arc<Task>, u32) + Send + 'static,
    ) -> Self {
        Self {
            name,
            initial_state: 0,
            step: Box::new(step),
            state_name: Box::new(|_| "?"),
            on_finish: None,
            on_abort: None,
        }
    }

    /// Sets the run state the task starts in (default 0).
    #[must_use]
    pub fn initial_state(mut self, state: u32) -> Self {
        self.initial_state = state;
        self
    }

    /// Installs a run-state-to-name function for logging.
    #[must_use]
    pub fn state_names(
        mut self,
        names: impl Fn(u32) -> &'static str + Send + Sync + 'static,
    ) -> Self {
        self.state_name = Box::new(names);
        self
    }

    /// Installs a hook that runs when the task finishes successfully.
    #[must_use]
    pub fn on_finish(mut self, hook: impl FnOnce(&Arc<Task>) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(hook));
        self
    }

    /// Installs a hook that runs when the task is aborted.
    #[must_use]
    pub fn on_abort(mut self, hook: impl FnOnce(&Arc<Task>) + Send + 'static) -> Self {
        self.on_abort = Some(Box::new(hook));
        self
    }

    /// Builds the task.
    pub fn build(self) -> Arc<Task> {
        Arc::new(Task {
            name: self.name,
            sub: SubState::new(),
            inner: Mutex::new(TaskInner {
                base: BaseState::Killed,
                run_state: self.initial_state,
                initial_state: self.initial_state,
                handler: Handler::Immediate,
                runtime: None,
                callback: None,
                parent: None,
                yield_request: None,
                wake_frame: 0,
            }),
            step: Mutex::new(Some(self.step)),
            state_name: self.state_name,
            on_finish: Mutex::new(self.on_finish),
            on_abort: Mutex::new(self.on_abort),
        })
    }
}

impl Task {
    /// The task's name, for logging.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The human-readable name of a run state.
    pub fn state_name(&self, state: u32) -> &'static str {
        (self.state_name)(state)
    }

    /// The runtime this task was started on.
    ///
    /// # Panics
    ///
    /// Panics when the task is not running.
    pub fn runtime(&self) -> Arc<Runtime> {
        self.inner
            .lock()
            .unwrap()
            .runtime
            .clone()
            .expect("task is not running")
    }

    /// Starts the task on `handler`.
    pub fn run(self: &Arc<Self>, runtime: &Arc<Runtime>, handler: Handler) {
        self.start(runtime, handler, None, None);
    }

    /// Starts the task; `callback` is invoked once with `success` when the
    /// task finishes (`true`) or aborts (`false`).
    pub fn run_with_callback(
        self: &Arc<Self>,
        runtime: &Arc<Runtime>,
        handler: Handler,
        callback: impl FnOnce(bool) + Send + 'static,
    ) {
        self.start(runtime, handler, Some(Box::new(callback)), None);
    }

    /// Starts the task as a child of `parent`: on completion the parent
    /// receives `signal(signal_parent)`.
    ///
    /// The child holds only a weak back reference, so parent/child cycles
    /// cannot leak.
    pub fn run_as_child(
        self: &Arc<Self>,
        runtime: &Arc<Runtime>,
        handler: Handler,
        parent: &Arc<Task>,
        signal_parent: u16,
    ) {
        self.start(
            runtime,
            handler,
            None,
            Some((Arc::downgrade(parent), signal_parent)),
        );
    }

    fn start(
        self: &Arc<Self>,
        runtime: &Arc<Runtime>,
        handler: Handler,
        callback: Option<DoneFn>,
        parent: Option<(Weak<Task>, u16)>,
    ) {
        assert!(
            self.step.lock().unwrap().is_some(),
            "run() on a task whose step closure is gone (completed tasks cannot be rerun)"
        );
        {
            let mut inner = self.inner.lock().unwrap();
            assert!(
                matches!(inner.base, BaseState::Killed),
                "run() on a task that is already running"
            );
            inner.base = BaseState::Initialize;
            inner.run_state = inner.initial_state;
            inner.handler = handler.clone();
            inner.runtime = Some(Arc::clone(runtime));
            inner.callback = callback;
            inner.parent = parent;
            inner.yield_request = None;
            inner.wake_frame = 0;
        }
        self.sub.reset();
        debug!(task = self.name, handler = ?handler, "run");
        match handler {
            Handler::Engine(ref engine) => engine.add(Arc::clone(self)),
            _ => self.reschedule(),
        }
    }

    /// Raises the condition bits in `mask` on this task.
    ///
    /// Returns `true` when the signal woke the task out of a wait; `false`
    /// when it was remembered for a later wait (or dropped into the
    /// saturated pending set).
    pub fn signal(self: &Arc<Self>, mask: u16) -> bool {
        trace!(task = self.name, mask, "signal");
        match self.sub.raise_signal(mask) {
            SignalEffect::Woken => {
                self.wake();
                true
            }
            SignalEffect::Remembered => false,
        }
    }

    /// Requests an abort. Honored at the task's next multiplex cycle; the
    /// callback then reports `success = false`. No-op on a task that is
    /// not running.
    pub fn abort(self: &Arc<Self>) {
        if matches!(self.inner.lock().unwrap().base, BaseState::Killed) {
            return;
        }
        debug!(task = self.name, "abort requested");
        if self.sub.raise_abort() {
            self.wake();
        }
    }

    /// Waits for any bit of `mask`; returns immediately when a pending
    /// signal already satisfies it. Only callable from the step function.
    pub fn wait(&self, mask: u16) {
        self.wait_until(mask, 0);
    }

    /// Waits until every bit of `required` has been signalled, or any bit
    /// of `mask` outside `required` has. `required` must be a subset of
    /// `mask`. Only callable from the step function.
    pub fn wait_until(&self, mask: u16, required: u16) {
        let outcome = self.sub.begin_wait(mask, required);
        trace!(task = self.name, mask, required, ?outcome, "wait");
    }

    /// Returns `true` while the task is parked in a wait.
    pub fn waiting(&self) -> bool {
        self.sub.is_idle()
    }

    /// Sets the run state for the next step. Voids a `wait()` issued
    /// earlier in the same step.
    pub fn set_state(&self, state: u32) {
        debug_assert!(
            self.sub.is_executing(),
            "set_state() outside the step function"
        );
        trace!(task = self.name, state = self.state_name(state), "set_state");
        self.inner.lock().unwrap().run_state = state;
        self.sub.void_wait();
    }

    /// Advances the run state to `state` if that is forward progress, and
    /// wakes the task when it is parked. Callable from other tasks.
    pub fn advance_state(self: &Arc<Self>, state: u32) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.base, BaseState::Killed) || state <= inner.run_state {
                return;
            }
            inner.run_state = state;
        }
        trace!(task = self.name, state = self.state_name(state), "advance_state");
        if self.sub.void_wait() {
            self.wake();
        }
    }

    /// Re-enqueues the task on its current handler and ends this multiplex
    /// cycle.
    ///
    /// # Panics
    ///
    /// Panics on an immediate-handler task: an inline task has nowhere to
    /// yield to, so it must name one with [`yield_to`](Self::yield_to).
    pub fn yield_next(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            !matches!(inner.handler, Handler::Immediate),
            "yield() on an immediate task requires an explicit handler"
        );
        inner.yield_request = Some(YieldTarget::Current);
    }

    /// Moves the task to `handler` and ends this multiplex cycle.
    pub fn yield_to(&self, handler: Handler) {
        debug_assert!(
            self.sub.is_executing(),
            "yield_to() outside the step function"
        );
        self.inner.lock().unwrap().yield_request = Some(YieldTarget::To(handler));
    }

    /// Like [`yield_to`](Self::yield_to), but a no-op when the task is
    /// already on `handler`. Returns `true` when a yield was requested.
    pub fn yield_if_not(&self, handler: Handler) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.handler.matches(&handler) {
            return false;
        }
        inner.yield_request = Some(YieldTarget::To(handler));
        true
    }

    /// Sleeps for `frames` invocations of the owning engine's `mainloop()`.
    ///
    /// # Panics
    ///
    /// Panics when the task is not on an engine handler.
    pub fn yield_frames(&self, frames: u64) {
        let mut inner = self.inner.lock().unwrap();
        let Handler::Engine(ref engine) = inner.handler else {
            panic!("yield_frames() on a task without an engine handler");
        };
        inner.wake_frame = engine.frame() + frames;
        inner.yield_request = Some(YieldTarget::Current);
    }

    /// Marks the task finished; completion (hook, callback, parent signal)
    /// runs when the current step returns.
    pub fn finish(&self) {
        debug_assert!(self.sub.is_executing(), "finish() outside the step function");
        self.sub.mark_finished();
    }

    /// Returns `true` once `finish()` has been called.
    pub fn finished(&self) -> bool {
        self.sub.finished()
    }

    /// Returns `true` once the task has been aborted.
    pub fn aborted(&self) -> bool {
        self.sub.aborted()
    }

    /// Returns `true` when the task finished without being aborted.
    pub fn success(&self) -> bool {
        self.finished() && !self.aborted()
    }

    /// Returns `true` while the task is running (between `run()` and
    /// completion).
    pub fn running(&self) -> bool {
        !matches!(self.inner.lock().unwrap().base, BaseState::Killed)
    }

    pub(crate) fn base_state(&self) -> BaseState {
        self.inner.lock().unwrap().base
    }

    pub(crate) fn wake_frame(&self) -> u64 {
        self.inner.lock().unwrap().wake_frame
    }

    pub(crate) fn is_on_engine(&self, engine: &Engine) -> bool {
        match self.inner.lock().unwrap().handler {
            Handler::Engine(ref e) => std::ptr::eq(Arc::as_ptr(e), engine),
            _ => false,
        }
    }

    /// A signal (or abort) made the task runnable: flip Wait back to
    /// Multiplex and hand it to its handler.
    fn wake(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.base, BaseState::Wait) {
                inner.base = BaseState::Multiplex;
            }
        }
        self.reschedule();
    }

    /// Hands the task to its current handler.
    fn reschedule(self: &Arc<Self>) {
        let handler = self.inner.lock().unwrap().handler.clone();
        match handler {
            Handler::Immediate => self.multiplex(),
            // Engine tasks sit in the engine's list; the next mainloop()
            // picks them up.
            Handler::Engine(_) => {}
            Handler::Queue(queue) => {
                let runtime = self.runtime();
                let task = Arc::clone(self);
                runtime.pool().submit(queue, move || {
                    task.multiplex();
                    false
                });
            }
        }
    }

    /// One trip through the task's state machine, stepping while runnable.
    ///
    /// Safe to call from any number of threads; only one gets to execute,
    /// the rest record a relaunch.
    pub fn multiplex(self: &Arc<Self>) {
        if !self.sub.enter_multiplex() {
            return;
        }
        loop {
            let enqueue_to = self.multiplex_cycle();
            if let Some(handler) = enqueue_to {
                // A yield: release the loop first, then enqueue, so the
                // next executor can claim EXECUTING immediately.
                while !self.sub.finish_executing() {}
                self.reschedule_on(handler);
                return;
            }
            if self.sub.finish_executing() {
                return;
            }
            // RELAUNCH: a wake-up landed while this thread held the loop.
        }
    }

    /// Runs base-state transitions and steps until the task parks, yields,
    /// or completes. Returns the handler to re-enqueue on after a yield.
    fn multiplex_cycle(self: &Arc<Self>) -> Option<Handler> {
        loop {
            let base = self.base_state();
            match base {
                BaseState::Initialize => {
                    let mut inner = self.inner.lock().unwrap();
                    trace!(
                        task = self.name,
                        state = self.state_name(inner.run_state),
                        "initialize"
                    );
                    inner.base = BaseState::Multiplex;
                }
                BaseState::Multiplex => {
                    if self.sub.aborted() {
                        self.inner.lock().unwrap().base = BaseState::Abort;
                        continue;
                    }
                    let run_state = {
                        let mut inner = self.inner.lock().unwrap();
                        inner.yield_request = None;
                        inner.run_state
                    };
                    trace!(task = self.name, state = self.state_name(run_state), "step");
                    {
                        let mut step = self.step.lock().unwrap();
                        if let Some(step) = step.as_mut() {
                            step(self, run_state);
                        }
                    }
                    if self.sub.aborted() {
                        self.inner.lock().unwrap().base = BaseState::Abort;
                        continue;
                    }
                    if self.sub.finished() {
                        self.inner.lock().unwrap().base = BaseState::Finish;
                        continue;
                    }
                    if self.sub.is_idle() {
                        self.inner.lock().unwrap().base = BaseState::Wait;
                        return None;
                    }
                    let target = self.inner.lock().unwrap().yield_request.take();
                    if let Some(target) = target {
                        let handler = {
                            let mut inner = self.inner.lock().unwrap();
                            match target {
                                YieldTarget::Current => inner.handler.clone(),
                                YieldTarget::To(handler) => {
                                    inner.handler = handler.clone();
                                    handler
                                }
                            }
                        };
                        match handler {
                            // Yielding to "inline" just keeps stepping.
                            Handler::Immediate => {}
                            handler => return Some(handler),
                        }
                    }
                }
                BaseState::Wait => {
                    if self.sub.is_idle() {
                        // Spurious relaunch of a still-parked task.
                        return None;
                    }
                    self.inner.lock().unwrap().base = BaseState::Multiplex;
                }
                BaseState::Finish => {
                    self.complete(true);
                    return None;
                }
                BaseState::Abort => {
                    self.complete(false);
                    return None;
                }
                BaseState::Killed => return None,
            }
        }
    }

    /// Re-enqueue after a yield. The task is no longer EXECUTING here.
    fn reschedule_on(self: &Arc<Self>, handler: Handler) {
        match handler {
            Handler::Immediate => self.multiplex(),
            Handler::Engine(engine) => engine.adopt(Arc::clone(self)),
            Handler::Queue(queue) => {
                let runtime = self.runtime();
                let task = Arc::clone(self);
                runtime.pool().submit(queue, move || {
                    task.multiplex();
                    false
                });
            }
        }
    }

    /// Final transition: hook, parent signal, callback, release.
    fn complete(self: &Arc<Self>, success: bool) {
        debug!(task = self.name, success, "complete");
        let hook = if success {
            self.on_finish.lock().unwrap().take()
        } else {
            self.on_abort.lock().unwrap().take()
        };
        if let Some(hook) = hook {
            hook(self);
        }
        let (callback, parent) = {
            let mut inner = self.inner.lock().unwrap();
            inner.base = BaseState::Killed;
            inner.runtime = None;
            (inner.callback.take(), inner.parent.take())
        };
        // Drop the closures eagerly: they own the task's captures
        // (child tasks, buffers) which must not outlive completion.
        *self.step.lock().unwrap() = None;
        *self.on_finish.lock().unwrap() = None;
        *self.on_abort.lock().unwrap() = None;
        if let Some((parent, bit)) = parent {
            if let Some(parent) = parent.upgrade() {
                parent.signal(bit);
            }
        }
        if let Some(callback) = callback {
            callback(success);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("base", &self.base_state())
            .field("sub", &self.sub.snapshot())
            .finish()
    }
}
