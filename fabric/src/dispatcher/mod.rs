//! Delayed delivery of MADs across the fabric.
//!
//! Submitted MADs wait in a time-ordered store for a randomized delay (drawn from a
//! normal distribution around the configured average). A single timer thread moves
//! each item to a ready queue once it is due, and a fixed pool of worker threads routes
//! ready items through the fabric and hands them to the destination node's processors.
//! Anything the processors answer with is submitted again.
//!
//! A MAD that cannot be routed (or that the loss model drops) is discarded and never
//! retried.
//!
//! # Example
//!
//! ```rust
//! use ibsim_fabric::{
//!     dispatcher::{Config, Dispatcher},
//!     mad::{attribute, class, method, Mad},
//!     Random, Submitter, Topology,
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! let topology: Topology = "
//! nodes:
//!   - {name: h1, kind: ca, ports: 1, lid: 1}
//!   - {name: h2, kind: ca, ports: 1, lid: 2}
//! links:
//!   - [h1/1, h2/1]
//! ".parse().unwrap();
//! let random = Arc::new(Random::new(0));
//! let fabric = Arc::new(topology.build(random.clone()).unwrap());
//! fabric.populate();
//!
//! let dispatcher = Dispatcher::new(fabric.clone(), random, Config {
//!     workers: 2,
//!     delay_avg: Duration::from_micros(50),
//!     delay_stddev: Duration::from_micros(10),
//!     metrics: Default::default(),
//! }).unwrap();
//! let h1 = fabric.node("h1").unwrap().id();
//! let mad = Mad::new(class::SUBN_LID, method::GET, attribute::NODE_INFO, 0).with_dlid(2);
//! dispatcher.dispatch(h1, 1, mad);
//! dispatcher.shutdown();
//! ```

mod metrics;
pub mod routing;

pub use metrics::{Dropped, Metrics};

use crate::{
    mad::Mad,
    node::NodeId,
    random::Random,
    routing::{route_by_direct_route, route_by_lid, Traversal},
    Error, Fabric,
};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, trace};

/// How long the timer sleeps when nothing is pending.
const IDLE_POLL: Duration = Duration::from_secs(2);

/// Sink for MADs entering the fabric.
pub trait Submitter: Send + Sync {
    /// Queue `mad` as if sent from `port` of `origin`. Never blocks on delivery.
    fn dispatch(&self, origin: NodeId, port: u8, mad: Mad);
}

/// Configuration for a [Dispatcher].
#[derive(Clone)]
pub struct Config {
    /// Number of worker threads (at least one).
    pub workers: usize,
    /// Average delay before a MAD is routed.
    pub delay_avg: Duration,
    /// Standard deviation of that delay.
    pub delay_stddev: Duration,
    pub metrics: Metrics,
}

struct Item {
    origin: NodeId,
    port: u8,
    mad: Mad,
}

#[derive(Default)]
struct Pending {
    items: BTreeMap<(Instant, u64), Item>,
    sequence: u64,
}

struct Shared {
    fabric: Arc<Fabric>,
    random: Arc<Random>,
    delay_avg: AtomicU64,
    delay_stddev: AtomicU64,
    pending: Mutex<Pending>,
    timer: Condvar,
    ready: Mutex<VecDeque<Item>>,
    available: Condvar,
    shutdown: AtomicBool,
    metrics: Metrics,
}

impl Shared {
    fn draw_delay(&self) -> Duration {
        let avg = self.delay_avg.load(Ordering::Relaxed) as f64;
        let stddev = self.delay_stddev.load(Ordering::Relaxed) as f64;
        let micros = self.random.normal(avg, stddev).max(0.0);
        Duration::from_micros(micros.round() as u64)
    }

    fn run_timer(&self) {
        let mut pending = self.pending.lock().unwrap();
        while !self.shutdown.load(Ordering::Acquire) {
            let now = Instant::now();
            let next = pending.items.first_key_value().map(|((at, _), _)| *at);
            match next {
                Some(at) if at <= now => {
                    let Some((_, item)) = pending.items.pop_first() else {
                        continue;
                    };
                    let mut ready = self.ready.lock().unwrap();
                    ready.push_back(item);
                    self.available.notify_one();
                }
                Some(at) => {
                    trace!(wait = ?(at - now), "timer waiting for next mad");
                    pending = self.timer.wait_timeout(pending, at - now).unwrap().0;
                }
                None => {
                    pending = self.timer.wait_timeout(pending, IDLE_POLL).unwrap().0;
                }
            }
        }
        trace!("timer stopped");
    }

    fn run_worker(&self, index: usize) {
        loop {
            let item = {
                let mut ready = self.ready.lock().unwrap();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        trace!(worker = index, "worker stopped");
                        return;
                    }
                    if let Some(item) = ready.pop_front() {
                        break item;
                    }
                    ready = self.available.wait(ready).unwrap();
                }
            };
            self.deliver(item);
        }
    }

    fn deliver(&self, item: Item) {
        let Item {
            origin,
            port,
            mut mad,
        } = item;
        let routed = if mad.is_direct_routed() {
            route_by_direct_route(&self.fabric, origin, port, &mut mad, Traversal::Deliver)
        } else {
            route_by_lid(&self.fabric, origin, port, &mad, Traversal::Deliver)
        };
        let route = match routed {
            Ok(route) => route,
            Err(err) => {
                self.metrics.record_drop(err.reason());
                debug!(
                    origin = %origin,
                    port,
                    dlid = mad.address.dlid,
                    class = mad.header.mgmt_class,
                    attribute = mad.header.attribute_id,
                    reason = err.reason(),
                    %err,
                    "dropping mad"
                );
                return;
            }
        };
        let destination = route.destination;
        let Some(node) = self.fabric.get(destination.node) else {
            self.metrics.record_drop("unknown node");
            return;
        };
        self.metrics.delivered.inc();
        match node.process_mad(destination.port, &mad) {
            Ok(outgoing) => {
                debug!(
                    node = node.name(),
                    port = destination.port,
                    hops = route.hops(),
                    class = mad.header.mgmt_class,
                    method = mad.header.method,
                    attribute = mad.header.attribute_id,
                    replies = outgoing.len(),
                    "delivered mad"
                );
                for reply in outgoing {
                    self.dispatch(destination.node, reply.port, reply.mad);
                }
            }
            Err(err) => {
                debug!(node = node.name(), port = destination.port, %err, "mad not processed");
            }
        }
    }
}

impl Submitter for Shared {
    fn dispatch(&self, origin: NodeId, port: u8, mad: Mad) {
        if self.shutdown.load(Ordering::Acquire) {
            debug!(origin = %origin, port, "dispatcher stopped, dropping mad");
            return;
        }
        let wakeup = Instant::now() + self.draw_delay();
        self.metrics.dispatched.inc();
        let mut pending = self.pending.lock().unwrap();
        let sequence = pending.sequence;
        pending.sequence = sequence.wrapping_add(1);
        let earliest = pending.items.first_key_value().map(|((at, _), _)| *at);
        pending
            .items
            .insert((wakeup, sequence), Item { origin, port, mad });

        // The timer only needs to wake up if this MAD is now due first
        if earliest.map_or(true, |at| wakeup < at) {
            self.timer.notify_one();
        }
    }
}

/// Schedules, routes and delivers MADs on a pool of threads.
pub struct Dispatcher {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the timer and worker threads.
    pub fn new(fabric: Arc<Fabric>, random: Arc<Random>, cfg: Config) -> Result<Self, Error> {
        if cfg.workers == 0 {
            return Err(Error::InvalidArgument(
                "dispatcher needs at least one worker".into(),
            ));
        }
        let shared = Arc::new(Shared {
            fabric,
            random,
            delay_avg: AtomicU64::new(cfg.delay_avg.as_micros() as u64),
            delay_stddev: AtomicU64::new(cfg.delay_stddev.as_micros() as u64),
            pending: Mutex::new(Pending::default()),
            timer: Condvar::new(),
            ready: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            metrics: cfg.metrics,
        });

        // Dropping a partially started dispatcher stops what was spawned
        let dispatcher = Self {
            shared,
            handles: Mutex::new(Vec::with_capacity(cfg.workers + 1)),
        };
        let shared = dispatcher.shared.clone();
        dispatcher.spawn("mad-timer".into(), move || shared.run_timer())?;
        for index in 0..cfg.workers {
            let shared = dispatcher.shared.clone();
            dispatcher.spawn(format!("mad-worker-{index}"), move || {
                shared.run_worker(index)
            })?;
        }
        debug!(workers = cfg.workers, "dispatcher started");
        Ok(dispatcher)
    }

    fn spawn<F>(&self, name: String, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(f)
            .map_err(Error::Spawn)?;
        self.handles.lock().unwrap().push(handle);
        Ok(())
    }

    pub fn delay_avg(&self) -> Duration {
        Duration::from_micros(self.shared.delay_avg.load(Ordering::Relaxed))
    }

    pub fn delay_stddev(&self) -> Duration {
        Duration::from_micros(self.shared.delay_stddev.load(Ordering::Relaxed))
    }

    /// Change the average delay of MADs submitted from now on.
    pub fn set_delay_avg(&self, delay: Duration) {
        self.shared
            .delay_avg
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Change the delay standard deviation of MADs submitted from now on.
    pub fn set_delay_stddev(&self, delay: Duration) {
        self.shared
            .delay_stddev
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// MADs submitted but not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        let waiting = self.shared.pending.lock().unwrap().items.len();
        waiting + self.shared.ready.lock().unwrap().len()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Stop the timer and workers and wait for them to exit.
    ///
    /// MADs still waiting are discarded. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        {
            let _pending = self.shared.pending.lock().unwrap();
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.timer.notify_all();
        }
        {
            let _ready = self.shared.ready.lock().unwrap();
            self.shared.available.notify_all();
        }
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

impl Submitter for Dispatcher {
    fn dispatch(&self, origin: NodeId, port: u8, mad: Mad) {
        self.shared.dispatch(origin, port, mad);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
