//! Dispatchers: pinned worker loops draining one ether.
//!
//! Each dispatcher owns one OS thread, its components, a consumer cursor,
//! a timer queue and optionally an epoll readiness source. One loop
//! iteration drains up to a batch of messages (fanning each out to the
//! components), polls I/O readiness, fires due timers, runs the batch-end
//! hook, and pauses or yields when idle.
//!
//! The batch size adapts to backlog: it starts at 64, doubles while the
//! backlog exceeds eight times the batch (up to a trait-specific ceiling)
//! and halves back toward 64 when batches come up short. The thresholds
//! are tuning parameters; the backlog is only re-read between batches.
//!
//! Two kinds of failure are kept apart. Structural fatal errors (lap
//! overrun, a full timer queue, a failed core pin) terminate the worker:
//! the error is logged, surfaced as a structured value from `stop`, and
//! sibling dispatchers keep running. A panic escaping user code instead
//! terminates the whole process with a diagnostic; it never unwinds into
//! sibling dispatchers.

use crate::assembly::AssemblyHandle;
use crate::component::ComponentSet;
use crate::config::Context;
use crate::cpu;
use crate::ether::{Cursor, Ether, Read};
use crate::message::{Member, MemberVisitor, Message, MessageSet};
use crate::poller::{Interest, IoEvent, Poller};
use crate::time::{mono_time_ns, Nanos};
use crate::timer::{TimerEvent, TimerId, TimerKind, TimerQueue};
use crossbeam_utils::CachePadded;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Compile-time dispatcher flags. Traits never change message semantics;
/// they only enable optional per-iteration steps.
pub trait Traits: Send + 'static {
    /// Poll the timer queue each iteration.
    const TIMER: bool = false;
    /// Poll an epoll readiness source each iteration.
    const IO: bool = false;
    /// Run `process_batch_end` after each drained batch.
    const BATCH_END: bool = false;
    /// Yield to the scheduler when idle instead of issuing a pause hint.
    const NON_CRITICAL: bool = false;
}

/// Busy-spinning loop with no optional steps.
pub struct Critical;
impl Traits for Critical {}

/// The default: batch-end notifications, no timers or I/O.
pub struct WithBatchEnd;
impl Traits for WithBatchEnd {
    const BATCH_END: bool = true;
}

pub struct WithTimer;
impl Traits for WithTimer {
    const TIMER: bool = true;
}

pub struct WithIo;
impl Traits for WithIo {
    const IO: bool = true;
}

pub struct WithTimerAndBatchEnd;
impl Traits for WithTimerAndBatchEnd {
    const TIMER: bool = true;
    const BATCH_END: bool = true;
}

pub struct WithIoAndTimer;
impl Traits for WithIoAndTimer {
    const IO: bool = true;
    const TIMER: bool = true;
}

/// Yields when idle; for workers that share cores with other threads.
pub struct NonCritical;
impl Traits for NonCritical {
    const NON_CRITICAL: bool = true;
    const BATCH_END: bool = true;
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("reader lapped by producers: backlog {backlog} at batch size {batch}")]
    LapOverrun { backlog: u64, batch: usize },

    #[error("timer queue full")]
    TimerQueueFull,

    #[error("failed to pin worker to core {core}")]
    PinFailed { core: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Core to pin the worker thread to; unpinned when `None`.
    pub core: Option<usize>,
    /// Capacity of the timer queue.
    pub timer_capacity: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            core: None,
            timer_capacity: 1 << 10,
        }
    }
}

enum IoCommand {
    Add {
        fd: RawFd,
        interest: Interest,
        owner: usize,
    },
    Remove {
        fd: RawFd,
    },
}

/// Per-worker context handed to every component hook.
///
/// This is the component's interface to the rest of the system: publishing
/// into the dispatcher's ether, arming timers, registering descriptors,
/// looking up other ethers in the assembly and reading configuration.
pub struct Dispatch<L: MessageSet> {
    ether: Arc<Ether<L>>,
    handle: AssemblyHandle,
    timers: TimerQueue,
    io_pending: Vec<IoCommand>,
    now: Nanos,
    owner: usize,
    fatal: Option<DispatcherError>,
}

impl<L: MessageSet> Dispatch<L> {
    /// Monotonic timestamp refreshed once per loop iteration.
    #[inline(always)]
    pub fn now(&self) -> Nanos {
        self.now
    }

    /// Reserves the next slot of the dispatcher's ether and constructs
    /// `msg` in place. Pair with [`commit`](Self::commit).
    #[inline(always)]
    pub fn allocate<M: Message>(&self, msg: M) -> &mut M
    where
        L: Member<M>,
    {
        self.ether.allocate(msg)
    }

    /// Publishes a slot returned by [`allocate`](Self::allocate).
    #[inline(always)]
    pub fn commit<M: Message>(&self, msg: &mut M) -> bool
    where
        L: Member<M>,
    {
        self.ether.commit(msg)
    }

    /// Allocates, fills and commits in one step.
    #[inline(always)]
    pub fn publish<M: Message>(&self, msg: M) -> u64
    where
        L: Member<M>,
    {
        self.ether.publish(msg)
    }

    /// Arms a one-shot timer at an absolute deadline, owned by the calling
    /// component. A full timer queue is fatal for the dispatcher.
    pub fn set_timer_at(&mut self, deadline: Nanos, id: TimerId) {
        if !self.timers.schedule_at(deadline, self.owner, id) {
            self.fatal = Some(DispatcherError::TimerQueueFull);
        }
    }

    /// Arms a timer `delay` from now, owned by the calling component.
    /// Recurring timers re-fire every `delay` until the dispatcher stops.
    pub fn set_timer_after(&mut self, kind: TimerKind, delay: Nanos, id: TimerId) {
        if !self
            .timers
            .schedule_after(kind, self.now, delay, self.owner, id)
        {
            self.fatal = Some(DispatcherError::TimerQueueFull);
        }
    }

    /// Registers a descriptor for readiness events, routed to the calling
    /// component's `on_io`. Takes effect at the next iteration's poll
    /// step. The dispatcher must have the I/O trait enabled.
    pub fn register_io(&mut self, fd: RawFd, interest: Interest) {
        self.io_pending.push(IoCommand::Add {
            fd,
            interest,
            owner: self.owner,
        });
    }

    /// Removes a descriptor registration. Takes effect at the next poll
    /// step.
    pub fn deregister_io(&mut self, fd: RawFd) {
        self.io_pending.push(IoCommand::Remove { fd });
    }

    /// Looks up another ether in the assembly by its message set.
    ///
    /// Resolve once in `process_begin` and keep the `Arc`; the lookup
    /// takes a lock.
    pub fn ether<L2: MessageSet>(&self) -> Option<Arc<Ether<L2>>> {
        self.handle.ether::<L2>()
    }

    /// The application context this assembly was built with.
    pub fn context(&self) -> &Context {
        self.handle.context()
    }

    #[inline(always)]
    pub(crate) fn set_owner(&mut self, owner: usize) {
        self.owner = owner;
    }
}

/// A pinned worker loop draining one ether into a set of components.
///
/// `T` selects the optional loop steps at compile time; the default
/// enables batch-end notifications only.
pub struct Dispatcher<L: MessageSet, CS: ComponentSet<L>, T: Traits = WithBatchEnd> {
    name: String,
    ether: Arc<Ether<L>>,
    handle: AssemblyHandle,
    options: DispatcherOptions,
    components: Option<CS>,
    /// Padded so the hot-loop stop check never false-shares with
    /// whatever lands next to the flag.
    stop: Arc<CachePadded<AtomicBool>>,
    thread: Option<JoinHandle<Result<(), DispatcherError>>>,
    _traits: PhantomData<T>,
}

impl<L: MessageSet, CS: ComponentSet<L>, T: Traits> Dispatcher<L, CS, T> {
    pub fn new(
        name: &str,
        handle: AssemblyHandle,
        ether: Arc<Ether<L>>,
        components: CS,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            name: name.to_string(),
            ether,
            handle,
            options,
            components: Some(components),
            stop: Arc::new(CachePadded::new(AtomicBool::new(false))),
            thread: None,
            _traits: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ether(&self) -> &Arc<Ether<L>> {
        &self.ether
    }

    /// Spawns the worker thread. Fatal conditions inside the worker are
    /// reported by [`stop`](Self::stop).
    pub fn start(&mut self) -> Result<(), DispatcherError> {
        let Some(components) = self.components.take() else {
            return Ok(()); // already started
        };

        let name = self.name.clone();
        let ether = self.ether.clone();
        let handle = self.handle.clone();
        let options = self.options.clone();
        let stop = self.stop.clone();

        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run::<L, CS, T>(name, ether, handle, components, options, stop))?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Requests a cooperative stop and joins the worker, returning its
    /// terminal result. Idempotent; pending messages and in-flight timers
    /// are not drained.
    pub fn stop(&mut self) -> Result<(), DispatcherError> {
        self.stop.store(true, Ordering::Relaxed);
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            },
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl<L: MessageSet, CS: ComponentSet<L>, T: Traits> Drop for Dispatcher<L, CS, T> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Type-erased control surface, letting compartments hold dispatchers of
/// different component sets.
pub trait Runnable: Send {
    fn name(&self) -> &str;
    fn start(&mut self) -> Result<(), DispatcherError>;
    fn stop(&mut self) -> Result<(), DispatcherError>;
}

impl<L: MessageSet, CS: ComponentSet<L>, T: Traits> Runnable for Dispatcher<L, CS, T> {
    fn name(&self) -> &str {
        Dispatcher::name(self)
    }

    fn start(&mut self) -> Result<(), DispatcherError> {
        Dispatcher::start(self)
    }

    fn stop(&mut self) -> Result<(), DispatcherError> {
        Dispatcher::stop(self)
    }
}

const INITIAL_BATCH: usize = 64;

/// Routes each decoded message into the component fan-out.
struct Fanout<'x, L: MessageSet, CS: ComponentSet<L>> {
    components: &'x mut CS,
    cx: &'x mut Dispatch<L>,
}

impl<L: MessageSet, CS: ComponentSet<L>> MemberVisitor<L> for Fanout<'_, L, CS> {
    #[inline(always)]
    fn visit<M: Message>(&mut self, msg: &M)
    where
        L: Member<M>,
    {
        self.components.deliver(msg, self.cx);
    }
}

fn run<L: MessageSet, CS: ComponentSet<L>, T: Traits>(
    name: String,
    ether: Arc<Ether<L>>,
    handle: AssemblyHandle,
    components: CS,
    options: DispatcherOptions,
    stop: Arc<CachePadded<AtomicBool>>,
) -> Result<(), DispatcherError> {
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        worker_loop::<L, CS, T>(&name, ether, handle, components, options, stop)
    }));
    match caught {
        Ok(result) => result,
        Err(payload) => {
            let what = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!("dispatcher '{}' fatal: panic in user code: {}", name, what);
            // A panic out of user code takes down the process, not just
            // this worker; it must never unwind into sibling dispatchers.
            std::process::exit(1);
        }
    }
}

fn worker_loop<L: MessageSet, CS: ComponentSet<L>, T: Traits>(
    name: &str,
    ether: Arc<Ether<L>>,
    handle: AssemblyHandle,
    mut components: CS,
    options: DispatcherOptions,
    stop: Arc<CachePadded<AtomicBool>>,
) -> Result<(), DispatcherError> {
    if let Some(core) = options.core {
        if !cpu::pin_to_core(core) {
            let err = DispatcherError::PinFailed { core };
            log::error!("dispatcher '{}' fatal: {}", name, err);
            return Err(err);
        }
        log::info!("dispatcher '{}' pinned to core {}", name, core);
    }

    let mut cursor = Cursor::new(ether.clone());
    let mut poller = if T::IO { Some(Poller::new()?) } else { None };
    let mut cx = Dispatch {
        ether,
        handle,
        timers: TimerQueue::new(options.timer_capacity),
        io_pending: Vec::new(),
        now: mono_time_ns(),
        owner: 0,
        fatal: None,
    };

    // 1024 for I/O and batch-end traits (prioritize latency),
    // 2048 with timers (moderate latency),
    // 65536 otherwise (prioritize throughput).
    let max_batch: usize = if T::IO || T::BATCH_END {
        1024
    } else if T::TIMER {
        2048
    } else {
        65536
    };
    let mut batch = INITIAL_BATCH;

    let mut io_events: Vec<IoEvent> = Vec::with_capacity(64);
    let mut due: Vec<TimerEvent> = Vec::with_capacity(64);

    components.process_begin(&mut cx);

    while !stop.load(Ordering::Relaxed) {
        cx.now = mono_time_ns();

        let mut drained = 0usize;
        while drained < batch {
            let outcome = cursor.read_into(&mut Fanout {
                components: &mut components,
                cx: &mut cx,
            });
            match outcome {
                Read::Delivered => drained += 1,
                Read::Empty => break,
                Read::Lapped => {
                    let err = DispatcherError::LapOverrun {
                        backlog: cursor.backlog(),
                        batch,
                    };
                    log::error!("dispatcher '{}' fatal: {}", name, err);
                    return Err(err);
                }
            }
        }

        if cursor.backlog() as usize > batch << 3 {
            batch = max_batch.min(batch << 1);
        } else if drained < batch && batch > INITIAL_BATCH {
            batch = INITIAL_BATCH.max(batch >> 1);
        }

        if T::IO {
            let poller = poller.as_mut().expect("poller exists when IO trait set");
            for cmd in cx.io_pending.drain(..) {
                let result = match cmd {
                    IoCommand::Add {
                        fd,
                        interest,
                        owner,
                    } => poller.add(fd, interest, owner),
                    IoCommand::Remove { fd } => poller.remove(fd),
                };
                if let Err(err) = result {
                    log::error!("dispatcher '{}': epoll update failed: {}", name, err);
                }
            }
            io_events.clear();
            if let Err(err) = poller.poll(&mut io_events) {
                log::error!("dispatcher '{}' fatal: epoll wait failed: {}", name, err);
                return Err(err.into());
            }
            for ev in &io_events {
                components.io(ev.owner, *ev, &mut cx);
            }
        }

        if T::TIMER {
            due.clear();
            cx.timers.drain_due(cx.now, &mut due);
            for ev in &due {
                components.timer(ev.owner, ev.id, &mut cx);
            }
        }

        if T::BATCH_END {
            components.process_batch_end(&mut cx);
        }

        if drained == 0 {
            if T::NON_CRITICAL {
                std::thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }

        if let Some(err) = cx.fatal.take() {
            log::error!("dispatcher '{}' fatal: {}", name, err);
            return Err(err);
        }

        components.process_end(&mut cx);
    }

    log::debug!("dispatcher '{}' stopped", name);
    Ok(())
}
