//! Operation generators
//!
//! A generator describes intent only: it hands out [`Action`]s and never
//! touches the system under test. Generators are pulled concurrently by every
//! worker and the injector, so they take `&self`; stateful ones serialize their
//! own mutation.
//!
//! Combinators are available through [`GeneratorExt`]:
//!
//! ```ignore
//! use faultline::generator::{self, GeneratorExt};
//!
//! let clients = generator::register_workload(vec!["x".into()], 0.5, 0.1)
//!     .throttle(Duration::from_millis(5));
//! let nemesis = generator::nemesis_schedule(faults, Duration::from_secs(5));
//! let gen = generator::split(clients, nemesis).time_limit(Duration::from_secs(30));
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use rand::Rng;

use crate::history::{Action, Operation, Process};
use crate::nemesis::Fault;

/// What the caller of `next` is and knows
#[derive(Clone, Copy, Debug)]
pub struct Context<'a> {
    /// Time since test start
    pub elapsed: Duration,
    /// Process requesting work
    pub process: Process,
    /// This process's most recent completion, if any
    pub last: Option<&'a Operation>,
}

impl<'a> Context<'a> {
    pub fn new(elapsed: Duration, process: Process) -> Self {
        Context {
            elapsed,
            process,
            last: None,
        }
    }

    pub fn with_last(mut self, last: Option<&'a Operation>) -> Self {
        self.last = last;
        self
    }
}

/// Result of pulling a generator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Next {
    /// Perform this action
    Op(Action),
    /// Nothing yet; ask again after at most this long
    Wait(Duration),
    /// No more operations for this process, ever
    Exhausted,
}

/// A lazy, possibly infinite source of operations
pub trait Generator: Send + Sync {
    fn next(&self, ctx: &Context<'_>) -> Next;
}

/// Shared, type-erased generator
pub type BoxGenerator = Arc<dyn Generator>;

impl<G: Generator + ?Sized> Generator for Arc<G> {
    fn next(&self, ctx: &Context<'_>) -> Next {
        (**self).next(ctx)
    }
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    fn next(&self, ctx: &Context<'_>) -> Next {
        (**self).next(ctx)
    }
}

/// Combinators available on every generator
pub trait GeneratorExt: Generator + Sized + 'static {
    /// Exhausted after `n` operations in total, across all processes
    fn limit(self, n: u64) -> Limit<Self> {
        Limit {
            inner: self,
            remaining: AtomicU64::new(n),
        }
    }

    /// Exhausted once the test has run for `limit`
    fn time_limit(self, limit: Duration) -> TimeLimit<Self> {
        TimeLimit { inner: self, limit }
    }

    /// Only hands out operations between `start` and `end`
    fn window(self, start: Duration, end: Duration) -> Window<Self> {
        Window {
            inner: self,
            start,
            end,
        }
    }

    /// At most one operation per `interval` across all callers
    fn throttle(self, interval: Duration) -> Throttle<Self> {
        Throttle {
            inner: self,
            interval,
            next_slot: Mutex::new(Duration::ZERO),
        }
    }

    fn boxed(self) -> BoxGenerator {
        Arc::new(self)
    }
}

impl<G: Generator + Sized + 'static> GeneratorExt for G {}

/// Stateless generator backed by a closure
pub struct FromFn<F>(F);

/// Generator that calls `f` for every request
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: Fn(&Context<'_>) -> Next + Send + Sync,
{
    FromFn(f)
}

impl<F> Generator for FromFn<F>
where
    F: Fn(&Context<'_>) -> Next + Send + Sync,
{
    fn next(&self, ctx: &Context<'_>) -> Next {
        (self.0)(ctx)
    }
}

/// Hands out a fixed list of actions in order, then is exhausted
pub struct Sequence {
    actions: Vec<Action>,
    cursor: AtomicUsize,
    repeat: bool,
}

/// A single action, handed to whichever process asks first
pub fn once(action: Action) -> Sequence {
    sequence(vec![action])
}

pub fn sequence(actions: Vec<Action>) -> Sequence {
    Sequence {
        actions,
        cursor: AtomicUsize::new(0),
        repeat: false,
    }
}

/// Repeats `actions` forever
pub fn cycle(actions: Vec<Action>) -> Sequence {
    Sequence {
        actions,
        cursor: AtomicUsize::new(0),
        repeat: true,
    }
}

impl Generator for Sequence {
    fn next(&self, _ctx: &Context<'_>) -> Next {
        if self.actions.is_empty() {
            return Next::Exhausted;
        }
        let i = self.cursor.fetch_add(1, Ordering::SeqCst);
        let i = if self.repeat { i % self.actions.len() } else { i };
        match self.actions.get(i) {
            Some(action) => Next::Op(action.clone()),
            None => Next::Exhausted,
        }
    }
}

pub struct Limit<G> {
    inner: G,
    remaining: AtomicU64,
}

impl<G: Generator> Generator for Limit<G> {
    fn next(&self, ctx: &Context<'_>) -> Next {
        if self.remaining.load(Ordering::SeqCst) == 0 {
            return Next::Exhausted;
        }
        match self.inner.next(ctx) {
            Next::Op(action) => {
                // Claim a slot; another caller may have taken the last one
                let claimed = self
                    .remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if claimed {
                    Next::Op(action)
                } else {
                    Next::Exhausted
                }
            }
            other => other,
        }
    }
}

pub struct TimeLimit<G> {
    inner: G,
    limit: Duration,
}

impl<G: Generator> Generator for TimeLimit<G> {
    fn next(&self, ctx: &Context<'_>) -> Next {
        if ctx.elapsed >= self.limit {
            return Next::Exhausted;
        }
        match self.inner.next(ctx) {
            Next::Wait(wait) => Next::Wait(wait.min(self.limit - ctx.elapsed)),
            other => other,
        }
    }
}

pub struct Window<G> {
    inner: G,
    start: Duration,
    end: Duration,
}

impl<G: Generator> Generator for Window<G> {
    fn next(&self, ctx: &Context<'_>) -> Next {
        if ctx.elapsed >= self.end {
            return Next::Exhausted;
        }
        if ctx.elapsed < self.start {
            return Next::Wait(self.start - ctx.elapsed);
        }
        self.inner.next(ctx)
    }
}

pub struct Throttle<G> {
    inner: G,
    interval: Duration,
    /// Earliest elapsed time at which the next operation may go out
    next_slot: Mutex<Duration>,
}

impl<G: Generator> Generator for Throttle<G> {
    fn next(&self, ctx: &Context<'_>) -> Next {
        let mut next_slot = self.next_slot.lock();
        if ctx.elapsed < *next_slot {
            return Next::Wait(*next_slot - ctx.elapsed);
        }
        let next = self.inner.next(ctx);
        if matches!(next, Next::Op(_)) {
            *next_slot = ctx.elapsed + self.interval;
        }
        next
    }
}

/// Round-robin merge of several generators
pub struct RoundRobin {
    members: Vec<BoxGenerator>,
    cursor: AtomicUsize,
}

pub fn round_robin(members: Vec<BoxGenerator>) -> RoundRobin {
    RoundRobin {
        members,
        cursor: AtomicUsize::new(0),
    }
}

impl Generator for RoundRobin {
    fn next(&self, ctx: &Context<'_>) -> Next {
        let count = self.members.len();
        if count == 0 {
            return Next::Exhausted;
        }

        let start = self.cursor.fetch_add(1, Ordering::SeqCst);
        let mut shortest_wait: Option<Duration> = None;
        for offset in 0..count {
            match self.members[(start + offset) % count].next(ctx) {
                Next::Op(action) => return Next::Op(action),
                Next::Wait(wait) => {
                    shortest_wait = Some(shortest_wait.map_or(wait, |w| w.min(wait)));
                }
                Next::Exhausted => {}
            }
        }

        match shortest_wait {
            Some(wait) => Next::Wait(wait),
            None => Next::Exhausted,
        }
    }
}

/// Routes client processes and the nemesis to separate generators
pub struct Split {
    clients: BoxGenerator,
    nemesis: BoxGenerator,
}

pub fn split(clients: impl Generator + 'static, nemesis: impl Generator + 'static) -> Split {
    Split {
        clients: Arc::new(clients),
        nemesis: Arc::new(nemesis),
    }
}

/// Generator that only feeds clients; the nemesis is exhausted immediately
pub fn clients_only(clients: impl Generator + 'static) -> Split {
    split(clients, sequence(Vec::new()))
}

impl Generator for Split {
    fn next(&self, ctx: &Context<'_>) -> Next {
        match ctx.process {
            Process::Nemesis => self.nemesis.next(ctx),
            Process::Client(_) => self.clients.next(ctx),
        }
    }
}

/// Unique values so every read can be traced to its writer
#[derive(Debug, Default)]
struct ValueCounter(AtomicI64);

impl ValueCounter {
    fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn pick_key(keys: &[String]) -> Option<String> {
    keys.choose(&mut rand::rng()).cloned()
}

/// Random reads, writes and compare-and-sets over `keys`
pub struct RegisterWorkload {
    keys: Vec<String>,
    write_ratio: f64,
    cas_ratio: f64,
    values: ValueCounter,
}

/// `write_ratio` and `cas_ratio` are fractions of all operations; the rest are reads
pub fn register_workload(keys: Vec<String>, write_ratio: f64, cas_ratio: f64) -> RegisterWorkload {
    RegisterWorkload {
        keys,
        write_ratio,
        cas_ratio,
        values: ValueCounter::default(),
    }
}

impl Generator for RegisterWorkload {
    fn next(&self, _ctx: &Context<'_>) -> Next {
        let Some(key) = pick_key(&self.keys) else {
            return Next::Exhausted;
        };
        let roll: f64 = rand::rng().random();
        if roll < self.write_ratio {
            Next::Op(Action::Write {
                key,
                value: self.values.next(),
            })
        } else if roll < self.write_ratio + self.cas_ratio {
            let current = self.values.0.load(Ordering::SeqCst);
            let expected = if current > 0 {
                rand::rng().random_range(1..=current)
            } else {
                0
            };
            Next::Op(Action::Cas {
                key,
                expected,
                new: self.values.next(),
            })
        } else {
            Next::Op(Action::Read { key })
        }
    }
}

/// Random adds of fresh elements and reads over `keys`
pub struct SetWorkload {
    keys: Vec<String>,
    read_ratio: f64,
    elements: ValueCounter,
}

pub fn set_workload(keys: Vec<String>, read_ratio: f64) -> SetWorkload {
    SetWorkload {
        keys,
        read_ratio,
        elements: ValueCounter::default(),
    }
}

impl Generator for SetWorkload {
    fn next(&self, _ctx: &Context<'_>) -> Next {
        let Some(key) = pick_key(&self.keys) else {
            return Next::Exhausted;
        };
        if rand::rng().random::<f64>() < self.read_ratio {
            Next::Op(Action::Read { key })
        } else {
            Next::Op(Action::Add {
                key,
                element: self.elements.next(),
            })
        }
    }
}

/// Random unit increments and reads over `keys`
pub struct CounterWorkload {
    keys: Vec<String>,
    read_ratio: f64,
}

pub fn counter_workload(keys: Vec<String>, read_ratio: f64) -> CounterWorkload {
    CounterWorkload { keys, read_ratio }
}

impl Generator for CounterWorkload {
    fn next(&self, _ctx: &Context<'_>) -> Next {
        let Some(key) = pick_key(&self.keys) else {
            return Next::Exhausted;
        };
        if rand::rng().random::<f64>() < self.read_ratio {
            Next::Op(Action::Read { key })
        } else {
            Next::Op(Action::Increment { key, delta: 1 })
        }
    }
}

/// Alternates each fault with its heal at a fixed cadence
///
/// Emits `faults[0]`, waits `interval`, emits the heal, waits `interval`,
/// then moves on to `faults[1]`, cycling forever.
pub fn nemesis_schedule(faults: Vec<Fault>, interval: Duration) -> Throttle<Sequence> {
    let actions = faults
        .into_iter()
        .flat_map(|fault| {
            let heal = fault.heal();
            std::iter::once(fault).chain(heal)
        })
        .map(|fault| Action::Fault { fault })
        .collect();
    cycle(actions).throttle(interval)
}
