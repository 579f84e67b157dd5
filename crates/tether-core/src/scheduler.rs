//! Single logical thread of execution.
//!
//! All protocol and state mutation of a process runs inside scheduler
//! callbacks, which own the process state `S` exclusively. Network tasks and
//! timers never touch `S` directly; they enqueue work through a
//! [`SchedulerHandle`].
//!
//! ## Guarantees
//!
//! - One-shot callbacks run in the order they were enqueued.
//! - Every invocation receives one [`Tick`], a time snapshot that does not
//!   change while the callback runs.
//! - A repeating action never re-enters. Periods missed while the thread was
//!   busy are skipped, not queued.
//! - A repeating action with a zero period fires exactly once.
//! - A panicking callback is logged and the loop continues.

use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Callbacks slower than this are reported.
pub const SLOW_CALLBACK: Duration = Duration::from_millis(100);

type Label = Cow<'static, str>;
type CallbackFn<S> = Box<dyn FnOnce(&mut S, &Tick) + Send>;
type RepeatingFn<S> = Box<dyn FnMut(&mut S, &Tick) -> ControlFlow<()> + Send>;

/// Time snapshot handed to one callback invocation.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    now: Instant,
    date: SystemTime,
}

impl Tick {
    /// Sample the clocks.
    #[must_use]
    pub fn now() -> Self {
        Self {
            now: Instant::now(),
            date: SystemTime::now(),
        }
    }

    /// A tick at a given monotonic instant.
    #[must_use]
    pub fn at(now: Instant) -> Self {
        Self {
            now,
            date: SystemTime::now(),
        }
    }

    /// Monotonic time of this tick. Use it for every timeout.
    #[must_use]
    pub fn current_time(&self) -> Instant {
        self.now
    }

    /// Wall-clock date of this tick.
    #[must_use]
    pub fn current_date(&self) -> SystemTime {
        self.date
    }

    /// Time elapsed between `earlier` and this tick, zero if `earlier` is later.
    #[must_use]
    pub fn since(&self, earlier: Instant) -> Duration {
        self.now.saturating_duration_since(earlier)
    }
}

/// Identifier of a repeating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// A callback re-invoked on a fixed period.
pub struct RepeatingAction<S> {
    label: Label,
    initial_delay: Duration,
    period: Duration,
    callback: RepeatingFn<S>,
}

impl<S> RepeatingAction<S> {
    /// Create a repeating action. A zero `period` fires once after
    /// `initial_delay`. The callback stops the action by returning
    /// `ControlFlow::Break(())`.
    pub fn new(
        label: impl Into<Label>,
        initial_delay: Duration,
        period: Duration,
        callback: impl FnMut(&mut S, &Tick) -> ControlFlow<()> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            initial_delay,
            period,
            callback: Box::new(callback),
        }
    }

    /// Register the action with a scheduler.
    pub fn start(self, scheduler: &SchedulerHandle<S>) -> TaskId {
        scheduler.start(self)
    }
}

struct TimerTask<S> {
    label: Label,
    period: Duration,
    callback: RepeatingFn<S>,
}

/// Callback queue and timer heap, without any I/O.
pub struct TaskQueue<S> {
    callbacks: VecDeque<(Label, CallbackFn<S>)>,
    timers: BinaryHeap<Reverse<(Instant, TaskId)>>,
    tasks: HashMap<TaskId, TimerTask<S>>,
    queue_len: Arc<AtomicUsize>,
}

impl<S> TaskQueue<S> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::with_counter(Arc::new(AtomicUsize::new(0)))
    }

    fn with_counter(queue_len: Arc<AtomicUsize>) -> Self {
        Self {
            callbacks: VecDeque::new(),
            timers: BinaryHeap::new(),
            tasks: HashMap::new(),
            queue_len,
        }
    }

    /// Enqueue a one-shot callback already counted by the handle.
    fn push_callback(&mut self, label: Label, callback: CallbackFn<S>) {
        self.callbacks.push_back((label, callback));
    }

    /// Register a repeating action relative to `now`.
    pub fn schedule(&mut self, id: TaskId, action: RepeatingAction<S>, now: Instant) {
        let due = now + action.initial_delay;
        self.tasks.insert(
            id,
            TimerTask {
                label: action.label,
                period: action.period,
                callback: action.callback,
            },
        );
        self.timers.push(Reverse((due, id)));
    }

    /// Stop a repeating action. Returns `false` if it was not registered.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.tasks.remove(&id).is_some()
    }

    /// Number of registered repeating actions.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.tasks.len()
    }

    /// Earliest due time of a live timer.
    #[must_use]
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((due, id))) = self.timers.peek().copied() {
            if self.tasks.contains_key(&id) {
                return Some(due);
            }
            self.timers.pop();
        }
        None
    }

    /// Run every queued callback, then every timer due at `now`.
    ///
    /// Returns the number of invocations.
    pub fn run_ready(&mut self, state: &mut S, now: Instant) -> usize {
        let mut ran = 0;

        while let Some((label, callback)) = self.callbacks.pop_front() {
            let tick = Tick::now();
            invoke(&label, || callback(state, &tick));
            self.queue_len.fetch_sub(1, Ordering::SeqCst);
            ran += 1;
        }

        while let Some(Reverse((due, id))) = self.timers.peek().copied() {
            if due > now {
                break;
            }
            self.timers.pop();

            let Some(mut task) = self.tasks.remove(&id) else {
                continue;
            };

            let tick = Tick::now();
            let flow = invoke(&task.label, || (task.callback)(state, &tick));
            ran += 1;

            if matches!(flow, Some(ControlFlow::Break(()))) || task.period.is_zero() {
                debug!(label = %task.label, "Repeating action finished");
                continue;
            }

            let mut next = due + task.period;
            if next <= now {
                debug!(label = %task.label, "Skipping missed periods");
                next = now + task.period;
            }
            self.tasks.insert(id, task);
            self.timers.push(Reverse((next, id)));
        }

        ran
    }
}

impl<S> Default for TaskQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke<R>(label: &str, f: impl FnOnce() -> R) -> Option<R> {
    let started = std::time::Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    let elapsed = started.elapsed();

    if elapsed > SLOW_CALLBACK {
        warn!(
            label,
            elapsed_ms = elapsed.as_millis() as u64,
            "Scheduler callback is slow"
        );
    }

    match result {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(label, "Scheduler callback panicked: {}", message);
            None
        }
    }
}

enum Command<S> {
    Callback(Label, CallbackFn<S>),
    Start(TaskId, RepeatingAction<S>),
    Cancel(TaskId),
    Stop,
}

struct Shared {
    queue_len: Arc<AtomicUsize>,
    next_task: AtomicU64,
}

/// Cloneable entry point into a scheduler, usable from any thread.
pub struct SchedulerHandle<S> {
    tx: mpsc::UnboundedSender<Command<S>>,
    shared: Arc<Shared>,
}

impl<S> Clone for SchedulerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> SchedulerHandle<S> {
    /// Enqueue a one-shot callback.
    ///
    /// Returns `false` if the scheduler has stopped.
    pub fn add_callback(
        &self,
        label: impl Into<Label>,
        callback: impl FnOnce(&mut S, &Tick) + Send + 'static,
    ) -> bool {
        self.shared.queue_len.fetch_add(1, Ordering::SeqCst);
        let sent = self
            .tx
            .send(Command::Callback(label.into(), Box::new(callback)))
            .is_ok();
        if !sent {
            self.shared.queue_len.fetch_sub(1, Ordering::SeqCst);
        }
        sent
    }

    /// Register a repeating action.
    pub fn start(&self, action: RepeatingAction<S>) -> TaskId {
        let id = TaskId(self.shared.next_task.fetch_add(1, Ordering::Relaxed));
        if self.tx.send(Command::Start(id, action)).is_err() {
            debug!("Scheduler stopped, repeating action dropped");
        }
        id
    }

    /// Stop a repeating action.
    pub fn cancel(&self, id: TaskId) {
        let _ = self.tx.send(Command::Cancel(id));
    }

    /// Stop the scheduler after the commands already enqueued.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }

    /// Callbacks enqueued but not yet run.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.shared.queue_len.load(Ordering::SeqCst)
    }
}

/// The scheduler loop.
pub struct Scheduler<S> {
    queue: TaskQueue<S>,
    rx: mpsc::UnboundedReceiver<Command<S>>,
}

impl<S: 'static> Scheduler<S> {
    /// Create a scheduler and its handle.
    #[must_use]
    pub fn new() -> (Self, SchedulerHandle<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue_len = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(Shared {
            queue_len: Arc::clone(&queue_len),
            next_task: AtomicU64::new(1),
        });

        (
            Self {
                queue: TaskQueue::with_counter(queue_len),
                rx,
            },
            SchedulerHandle { tx, shared },
        )
    }

    /// Apply a command. Returns `false` on stop.
    fn apply(&mut self, command: Command<S>) -> bool {
        match command {
            Command::Callback(label, callback) => self.queue.push_callback(label, callback),
            Command::Start(id, action) => self.queue.schedule(id, action, Instant::now()),
            Command::Cancel(id) => {
                self.queue.cancel(id);
            }
            Command::Stop => return false,
        }
        true
    }

    /// Run until stopped, then hand the state back.
    pub async fn run(mut self, mut state: S) -> S {
        loop {
            while let Ok(command) = self.rx.try_recv() {
                if !self.apply(command) {
                    return self.finish(state);
                }
            }

            self.queue.run_ready(&mut state, Instant::now());

            let next_due = self.queue.next_due();
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => {
                        if !self.apply(command) {
                            return self.finish(state);
                        }
                    }
                    None => return self.finish(state),
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)),
                    if next_due.is_some() => {}
            }
        }
    }

    /// Drain what was enqueued before the stop.
    fn finish(mut self, mut state: S) -> S {
        self.queue.run_ready(&mut state, Instant::now());
        debug!("Scheduler stopped");
        state
    }

    /// Run the loop on a dedicated OS thread with its own runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime or the thread cannot be created.
    pub fn spawn(
        self,
        name: impl Into<String>,
        state: S,
    ) -> std::io::Result<std::thread::JoinHandle<S>>
    where
        S: Send,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        std::thread::Builder::new()
            .name(name.into())
            .spawn(move || runtime.block_on(self.run(state)))
    }
}
