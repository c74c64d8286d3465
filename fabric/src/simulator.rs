//! A running simulation: a fabric built from a topology plus the dispatcher that moves
//! MADs across it.
//!
//! The simulator can be reloaded from its topology source at any time. Reloading
//! replaces the fabric and dispatcher (dropping every attached client and in-flight
//! MAD) but keeps the random generator, the configured delays and the metrics.

use crate::{
    dispatcher::{self, Dispatcher, Metrics},
    mad::Mad,
    processor::Filter,
    random::Random,
    Error, Fabric, Submitter, Topology,
};
use futures::channel::mpsc;
use prometheus_client::registry::Registry;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tracing::info;

/// Where the topology comes from.
#[derive(Clone, Debug)]
pub enum Source {
    File(PathBuf),
    Inline(Topology),
}

impl Source {
    fn load(&self) -> Result<Topology, Error> {
        match self {
            Source::File(path) => Topology::from_file(path),
            Source::Inline(topology) => Ok(topology.clone()),
        }
    }
}

/// Configuration for a [Simulator].
#[derive(Clone)]
pub struct Config {
    pub topology: Source,
    /// Dispatcher worker threads.
    pub workers: usize,
    pub delay_avg: Duration,
    pub delay_stddev: Duration,
    /// Seed for the loss model and delays (taken from the OS when `None`).
    pub seed: Option<u64>,
    /// File that receives the assigned GUIDs every time the fabric is built.
    pub guid_dump: Option<PathBuf>,
    pub registry: Arc<Mutex<Registry>>,
}

struct Instance {
    fabric: Arc<Fabric>,
    dispatcher: Arc<Dispatcher>,
}

pub struct Simulator {
    config: Config,
    random: Arc<Random>,
    metrics: Metrics,
    instance: RwLock<Instance>,
}

impl Simulator {
    /// Build the fabric and start dispatching.
    pub fn new(config: Config) -> Result<Self, Error> {
        let random = Arc::new(match config.seed {
            Some(seed) => Random::new(seed),
            None => Random::from_entropy(),
        });
        let metrics = Metrics::new(&config.registry);
        let instance = Self::start(
            &config,
            &random,
            &metrics,
            config.delay_avg,
            config.delay_stddev,
        )?;
        Ok(Self {
            config,
            random,
            metrics,
            instance: RwLock::new(instance),
        })
    }

    fn start(
        config: &Config,
        random: &Arc<Random>,
        metrics: &Metrics,
        delay_avg: Duration,
        delay_stddev: Duration,
    ) -> Result<Instance, Error> {
        let topology = config.topology.load()?;
        let fabric = Arc::new(topology.build(random.clone())?);
        fabric.populate();
        if let Some(path) = &config.guid_dump {
            fabric.write_guid_dump(path)?;
        }
        let dispatcher = Dispatcher::new(
            fabric.clone(),
            random.clone(),
            dispatcher::Config {
                workers: config.workers,
                delay_avg,
                delay_stddev,
                metrics: metrics.clone(),
            },
        )?;
        Ok(Instance {
            fabric,
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn fabric(&self) -> Arc<Fabric> {
        self.instance.read().unwrap().fabric.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.instance.read().unwrap().dispatcher.clone()
    }

    pub fn random(&self) -> &Arc<Random> {
        &self.random
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Send `mad` from `port` of `node`, as a client attached there would.
    pub fn inject(&self, node: &str, port: u8, mad: Mad) -> Result<(), Error> {
        let instance = self.instance.read().unwrap();
        let node = instance.fabric.node(node)?;
        node.check_port(port)?;
        instance.dispatcher.dispatch(node.id(), port, mad);
        Ok(())
    }

    /// Bind a client to `port` of `node`. MADs matching `filter` that are delivered to
    /// that port (or to any port, for port 0) are forwarded to the returned receiver.
    pub fn attach_client(
        &self,
        node: &str,
        port: u8,
        filter: Filter,
    ) -> Result<mpsc::UnboundedReceiver<Mad>, Error> {
        let instance = self.instance.read().unwrap();
        instance.fabric.node(node)?.attach_client(port, filter)
    }

    /// Remove every client bound to `port` of `node`.
    pub fn detach_client(&self, node: &str, port: u8) -> Result<usize, Error> {
        let instance = self.instance.read().unwrap();
        let node = instance.fabric.node(node)?;
        node.check_port(port)?;
        let removed = node.detach_clients(port);
        info!(node = node.name(), port, removed, "client detached");
        Ok(removed)
    }

    /// Every client binding as `(node, port, filter)`.
    pub fn attached(&self) -> Vec<(String, u8, Filter)> {
        let instance = self.instance.read().unwrap();
        instance
            .fabric
            .nodes()
            .flat_map(|node| {
                node.clients()
                    .into_iter()
                    .map(|(port, filter)| (node.name().to_string(), port, filter))
            })
            .collect()
    }

    /// Rebuild the fabric from the topology source.
    ///
    /// On failure the running fabric is left untouched.
    pub fn reload(&self) -> Result<(), Error> {
        let current = self.dispatcher();
        let instance = Self::start(
            &self.config,
            &self.random,
            &self.metrics,
            current.delay_avg(),
            current.delay_stddev(),
        )?;
        let previous = std::mem::replace(&mut *self.instance.write().unwrap(), instance);
        previous.dispatcher.shutdown();
        info!(nodes = self.fabric().len(), "reloaded topology");
        Ok(())
    }

    /// Stop the dispatcher. Pending MADs are discarded.
    pub fn shutdown(&self) {
        self.dispatcher().shutdown();
    }
}
