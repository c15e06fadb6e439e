//! # etherbus: in-process message bus and component runtime
//!
//! A lightweight, ultra-low-latency framework for **trading-style event
//! pipelines**: typed messages flow through fixed-capacity shared-memory
//! rings ("ethers") into pinned worker loops that fan each message out to
//! subscribed components.
//!
//! Provides predictable performance, minimal contention, and carefully
//! controlled memory access patterns. Works **between threads** in one
//! process or **between processes** over memory-mapped files.
//!
//! # Features
//!
//! * **Lock-free** multi-producer publication with total-order delivery
//! * **Seqno/commitno protocol** so readers only see fully written slots
//! * **Lap detection**: a reader that falls a full ring behind fails fast
//! * **Typed message sets** with stable ordinals and an attach-time
//!   signature guarding shared-memory layout
//! * **Pinned dispatcher loops** with adaptive batching, timers and
//!   non-blocking epoll readiness
//! * **SwissTable-style hash index** (single-writer SIMD probe and a
//!   lock-free concurrent variant) for hot-path key→pointer lookups
//! * **Ring counter and burst controller** for per-key rate governance
//! * Zero allocations on the hot path after initialization
//!
//! # Spin-Wait Behavior
//!
//! Dispatcher workers busy-wait: an idle iteration issues a CPU pause
//! hint (or yields, in the non-critical variant) and checks again.
//!
//! **Implications:**
//!
//! * **Lowest possible latency** (no OS scheduling on the hot path)
//! * A critical worker consumes **one logical CPU core**
//! * Pin producers and consumers to cores on the **same NUMA node**
//! * Not ideal when power efficiency is important
//!
//! # Quick Example
//!
//! ```ignore
//! use etherbus::prelude::*;
//!
//! #[derive(Clone, Copy, Default)]
//! #[repr(C)]
//! struct Tick { px: u64 }
//! impl_message!(Tick);
//! message_set! { pub set Feed(FeedRef) { Tick } }
//!
//! struct Printer;
//! impl Component<Feed> for Printer {
//!     const INPUTS: &'static [u16] = inputs![Feed => Tick];
//!     fn process(&mut self, msg: FeedRef<'_>, _cx: &mut Dispatch<Feed>) {
//!         let FeedRef::Tick(t) = msg;
//!         println!("px={}", t.px);
//!     }
//! }
//!
//! let mut assembly = Assembly::new(Context::default());
//! let feed = assembly.create_ether::<Feed>(4096, Storage::Private)?;
//! let mut compartment = Compartment::new("feed", feed.clone());
//! compartment.add(Dispatcher::<Feed, _>::new(
//!     "printer", assembly.handle(), feed.clone(), (Printer,),
//!     DispatcherOptions::default(),
//! ));
//! assembly.install(compartment);
//! assembly.start()?;
//! feed.publish(Tick { px: 101_250 });
//! ```
//!
//! # Design Overview
//!
//! Each slot carries its own sequence and commit numbers:
//!
//! 1. A producer claims seqno `s` with a CAS on the header counter
//! 2. It clears the slot's commit number and stores `s` into the slot
//! 3. It writes the payload and commits by storing `commitno = s`
//! 4. A reader delivers the slot only when both numbers equal `s`
//!
//! Readers never block producers; an overrun reader observes a lap and
//! its dispatcher terminates rather than deliver torn or skipped data.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

pub mod assembly;
pub mod component;
pub mod config;
pub mod counter;
pub mod cpu;
pub mod dispatcher;
pub mod ether;
pub mod message;
mod mmap;
pub mod poller;
pub mod pqueue;
pub mod swiss;
pub mod time;
pub mod timer;

pub use assembly::{Assembly, AssemblyError, AssemblyHandle, Compartment, EtherRegistry, Storage};
pub use component::{Component, ComponentSet, Subscribed};
pub use config::{Config, ConfigError, Context};
pub use counter::{BurstControl, BurstState, Mode, RingCounter};
pub use dispatcher::{
    Critical, Dispatch, Dispatcher, DispatcherError, DispatcherOptions, NonCritical, Runnable,
    Traits, WithBatchEnd, WithIo, WithIoAndTimer, WithTimer, WithTimerAndBatchEnd,
};
pub use ether::{Cursor, Ether, EtherError, Read, CACHE_LINE};
pub use message::{Member, MemberVisitor, Message, MessageSet};
pub use mmap::Region;
pub use poller::{Interest, IoEvent, Poller};
pub use pqueue::PriorityQueue;
pub use swiss::{ConcurrentHashIndex, DuplicatePolicy, HashIndex, InsertError};
pub use time::{busy_wait_until, mono_time_ns, wall_time_ns, Nanos};
pub use timer::{TimerId, TimerKind, TimerQueue};

/// One-stop imports for applications built on the bus.
pub mod prelude {
    pub use crate::assembly::{Assembly, AssemblyHandle, Compartment, Storage};
    pub use crate::component::Component;
    pub use crate::config::{Config, Context};
    pub use crate::dispatcher::{Dispatch, Dispatcher, DispatcherOptions};
    pub use crate::ether::{Cursor, Ether};
    pub use crate::message::{Member, Message, MessageSet};
    pub use crate::time::{mono_time_ns, Nanos};
    pub use crate::timer::{TimerId, TimerKind};
    pub use crate::{impl_message, inputs, message_set};
}
