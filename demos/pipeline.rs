//! Demo pipeline: a quote feed governed per key by the burst controller,
//! with admitted events timestamped end to end.
//!
//! `run` drives everything in one process over a private ether. `writer`
//! and `reader` split the same pipeline across two processes over a
//! file-backed shared ether (start the writer first, it resets the
//! region):
//!
//! ```text
//! pipeline writer -o /dev/shm/etherbus-demo &
//! pipeline reader -i /dev/shm/etherbus-demo
//! ```

use clap::{Parser, Subcommand};
use etherbus::prelude::*;
use etherbus::{busy_wait_until, AssemblyError, BurstControl, DuplicatePolicy, HashIndex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const EVENTS: u64 = 20_000;
const KEYS: u64 = 64;

/// Ring size for the shared writer/reader pair. Fixed so both sides agree
/// at attach time regardless of their event counts.
const RING_CAPACITY: usize = 1 << 17;

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Quote {
    pub key: u64,
    pub origin_ns: Nanos,
    pub px: u64,
}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Admit {
    pub key: u64,
    pub origin_ns: Nanos,
}

impl_message!(Quote, Admit);

message_set! {
    /// Quote feed plus the admissions derived from it.
    pub set MarketSet(MarketRef) { Quote, Admit }
}

#[derive(Parser, Debug)]
#[command(version, about = "Demo pipeline over an etherbus assembly", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs feeder, burst guard and sink in one process.
    Run {
        /// Number of quotes to publish.
        #[arg(short = 'n', long = "events", default_value_t = EVENTS)]
        events: u64,

        /// Minimum period between quotes in nanoseconds; 0 disables throttling.
        #[arg(short = 'p', long = "period", default_value_t = 0)]
        period: u64,

        /// Core to pin the dispatcher to.
        #[arg(short = 'c', long = "core")]
        core: Option<usize>,
    },

    /// Publishes quotes into a shared ether.
    Writer {
        /// Backing file for the shared ether.
        #[arg(short = 'o', long = "output", default_value = "/dev/shm/etherbus-demo")]
        output: String,

        /// Number of quotes to publish.
        #[arg(short = 'n', long = "events", default_value_t = EVENTS)]
        events: u64,

        /// Minimum period between quotes in nanoseconds; 0 disables throttling.
        #[arg(short = 'p', long = "period", default_value_t = 1_000)]
        period: u64,
    },

    /// Runs guard and sink against a shared ether.
    Reader {
        /// Backing file of the shared ether.
        #[arg(short = 'i', long = "input", default_value = "/dev/shm/etherbus-demo")]
        input: String,

        /// Core to pin the dispatcher to.
        #[arg(short = 'c', long = "core")]
        core: Option<usize>,
    },
}

/// Latency distribution with one bucket per power-of-two nanosecond
/// range. No samples are retained, so recording stays allocation-free no
/// matter how long the run; quantiles are reported as bucket upper
/// bounds.
struct LatencyHistogram {
    name: &'static str,
    buckets: [u64; 64],
    count: u64,
    min: Nanos,
    max: Nanos,
}

impl LatencyHistogram {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            buckets: [0; 64],
            count: 0,
            min: Nanos::MAX,
            max: 0,
        }
    }

    fn record(&mut self, ns: Nanos) {
        self.buckets[(ns | 1).ilog2() as usize] += 1;
        self.count += 1;
        self.min = self.min.min(ns);
        self.max = self.max.max(ns);
    }

    /// Upper bound of the bucket holding the q-th sample.
    fn quantile_bound(&self, q: f64) -> Nanos {
        let target = ((self.count as f64) * q).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (i, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if n > 0 && seen >= target {
                return if i >= 63 { Nanos::MAX } else { 1u64 << (i + 1) };
            }
        }
        self.max
    }

    fn report(&self) {
        if self.count == 0 {
            return;
        }
        println!(
            "{}: n={} min={}ns p50<{}ns p90<{}ns p99<{}ns p99.9<{}ns max={}ns",
            self.name,
            self.count,
            self.min,
            self.quantile_bound(0.5),
            self.quantile_bound(0.9),
            self.quantile_bound(0.99),
            self.quantile_bound(0.999),
            self.max,
        );
    }
}

/// Governs each quote stream by key: one burst controller per key, found
/// through the hash index, admitting into `Admit` messages on the same
/// ether.
struct BurstGuard {
    index: HashIndex<BurstControl<16>>,
    arena: Vec<Box<BurstControl<16>>>,
    heatup_window: Nanos,
    heatup_limit: u64,
    cooldown_window: Nanos,
    cooldown_limit: u64,
    rejected: Arc<AtomicU64>,
}

impl BurstGuard {
    fn new(ctx: &Context, rejected: Arc<AtomicU64>) -> Self {
        Self {
            index: HashIndex::new(1024, DuplicatePolicy::Reject),
            arena: Vec::with_capacity(1024),
            heatup_window: ctx.attribute("burst_guard", "heatup_window_ns", "1000000"),
            heatup_limit: ctx.attribute("burst_guard", "heatup_limit", "1000"),
            cooldown_window: ctx.attribute("burst_guard", "cooldown_window_ns", "1000000"),
            cooldown_limit: ctx.attribute("burst_guard", "cooldown_limit", "100"),
            rejected,
        }
    }

    fn controller(&mut self, key: u64) -> *mut BurstControl<16> {
        if let Some(ctl) = self.index.find(key) {
            return ctl;
        }
        self.arena.push(Box::new(BurstControl::new(
            self.heatup_window,
            self.heatup_limit,
            self.cooldown_window,
            self.cooldown_limit,
        )));
        let ptr: *mut BurstControl<16> = &mut **self.arena.last_mut().expect("just pushed");
        self.index
            .insert(key, ptr)
            .expect("guard index sized for the key universe");
        ptr
    }
}

impl Component<MarketSet> for BurstGuard {
    const INPUTS: &'static [u16] = inputs![MarketSet => Quote];

    fn process(&mut self, msg: MarketRef<'_>, cx: &mut Dispatch<MarketSet>) {
        if let MarketRef::Quote(quote) = msg {
            let ctl = self.controller(quote.key);
            let admitted = unsafe { (*ctl).evaluate(cx.now()) };
            if admitted {
                cx.publish(Admit {
                    key: quote.key,
                    origin_ns: quote.origin_ns,
                });
            } else {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Terminal stage: counts quotes and admissions, recording quote-to-admit
/// latency.
struct StatsSink {
    quotes: Arc<AtomicU64>,
    admits: Arc<AtomicU64>,
    latencies: Arc<Mutex<LatencyHistogram>>,
}

impl Component<MarketSet> for StatsSink {
    const INPUTS: &'static [u16] = inputs![MarketSet => Quote, Admit];

    fn process(&mut self, msg: MarketRef<'_>, _cx: &mut Dispatch<MarketSet>) {
        match msg {
            MarketRef::Quote(_) => {
                self.quotes.fetch_add(1, Ordering::Relaxed);
            }
            MarketRef::Admit(admit) => {
                self.admits.fetch_add(1, Ordering::Relaxed);
                let now = mono_time_ns();
                if now > admit.origin_ns {
                    self.latencies.lock().unwrap().record(now - admit.origin_ns);
                }
            }
        }
    }
}

/// A started assembly plus the counters shared with its components.
struct Pipeline {
    assembly: Assembly,
    ether: Arc<Ether<MarketSet>>,
    quotes: Arc<AtomicU64>,
    admits: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
    latencies: Arc<Mutex<LatencyHistogram>>,
}

impl Pipeline {
    fn build(
        ctx: Context,
        ether_fn: impl FnOnce(&mut Assembly) -> Result<Arc<Ether<MarketSet>>, AssemblyError>,
        core: Option<usize>,
    ) -> Self {
        let quotes = Arc::new(AtomicU64::new(0));
        let admits = Arc::new(AtomicU64::new(0));
        let rejected = Arc::new(AtomicU64::new(0));
        let latencies = Arc::new(Mutex::new(LatencyHistogram::new("quote-to-admit")));

        let mut assembly = Assembly::new(ctx);
        let ether = ether_fn(&mut assembly).expect("ether creation");

        let mut compartment = Compartment::new("market", ether.clone());
        compartment.add(Dispatcher::<MarketSet, _>::new(
            "market-worker",
            assembly.handle(),
            ether.clone(),
            (
                BurstGuard::new(assembly.context(), rejected.clone()),
                StatsSink {
                    quotes: quotes.clone(),
                    admits: admits.clone(),
                    latencies: latencies.clone(),
                },
            ),
            DispatcherOptions {
                core,
                ..DispatcherOptions::default()
            },
        ));
        assembly.install(compartment);

        Self {
            assembly,
            ether,
            quotes,
            admits,
            rejected,
            latencies,
        }
    }

    fn wait_for_quotes(&self, target: u64) {
        while self.quotes.load(Ordering::Relaxed) < target {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Waits until quotes have been seen and none arrive for two seconds.
    /// A cursor only sees publications after it attached, so a reader
    /// joining mid-stream cannot count toward a fixed target.
    fn wait_for_quiet(&self) {
        loop {
            let before = self.quotes.load(Ordering::Relaxed);
            std::thread::sleep(std::time::Duration::from_secs(2));
            let after = self.quotes.load(Ordering::Relaxed);
            if after > 0 && after == before {
                return;
            }
        }
    }

    fn finish(mut self) {
        self.assembly.stop().expect("assembly stop");
        println!(
            "quotes: {}, admitted: {}, rejected: {}",
            self.quotes.load(Ordering::Relaxed),
            self.admits.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        );
        self.latencies.lock().unwrap().report();
    }
}

fn feed(ether: &Ether<MarketSet>, events: u64, period: u64) {
    let mut publish_cost = LatencyHistogram::new("publish");
    for i in 0..events {
        let ts0 = mono_time_ns();
        ether.publish(Quote {
            key: i % KEYS,
            origin_ns: ts0,
            px: 100_000 + (i % 37),
        });
        publish_cost.record(mono_time_ns() - ts0);
        if period > 0 {
            busy_wait_until(ts0 + period);
        }
    }
    publish_cost.report();
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Commands::Run {
            events,
            period,
            core,
        } => {
            // Quotes plus their admissions never exceed twice the event
            // count, so this ring can never lap its reader.
            let capacity = (4 * events) as usize;
            let ctx = Context::new("pipeline-demo", Config::new());
            let mut pipeline =
                Pipeline::build(ctx, |a| a.create_ether(capacity, Storage::Private), core);
            pipeline.assembly.start().expect("assembly start");

            feed(&pipeline.ether, events, period);
            pipeline.wait_for_quotes(events);
            pipeline.finish();
        }

        Commands::Writer {
            output,
            events,
            period,
        } => {
            let mut config = Config::new();
            config.set_ether_path("MarketSet", &output);
            config.set_ether_reset("MarketSet", true);
            let mut assembly = Assembly::new(Context::new("pipeline-writer", config));
            let ether = assembly
                .create_ether::<MarketSet>(RING_CAPACITY, Storage::Shared)
                .expect("shared ether");

            println!("writer: {} events to '{}'", events, output);
            feed(&ether, events, period);
        }

        Commands::Reader { input, core } => {
            let mut config = Config::new();
            config.set_ether_path("MarketSet", &input);
            // Joining, not initializing: the writer resets the region and
            // must be started first.
            config.set_ether_reset("MarketSet", false);

            let ctx = Context::new("pipeline-reader", config);
            let mut pipeline =
                Pipeline::build(ctx, |a| a.create_ether(RING_CAPACITY, Storage::Shared), core);
            pipeline.assembly.start().expect("assembly start");

            println!("reader: consuming from '{}' until the feed goes quiet", input);
            pipeline.wait_for_quiet();
            pipeline.finish();
        }
    }
}
