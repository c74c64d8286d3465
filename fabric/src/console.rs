//! Administrative commands.
//!
//! Each line is one command; words are separated by whitespace and `#` starts a
//! comment. Ports are written `node/port`. Commands that change the fabric go through
//! the same paths as management traffic, so traps raised by them are dispatched.

use crate::{
    mad::{attribute, class, method, Mad},
    node::Transition,
    port::PortState,
    routing::{route_by_lid, Traversal},
    simulator::Simulator,
    Error, Fabric, PortRef,
};
use std::{
    fmt::Write as _,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{info, level_filters::LevelFilter};

const HELP: &str = "\
link <node/port> <node/port>         connect two free ports (both come up INIT)
unlink <node>[/port]                 disconnect a port, or every port of a node
relink <node>[/port]                 restore links removed by unlink
dump [node]                          list nodes, or describe one
route <from-lid> <to-lid>            trace a lid route without sending anything
error <node>[/port] <rate> [var [hold]]  set the packet drop model (hold 0: random)
baselid <node/port> <lid> [lmc]      set a port lid
guid [file]                          print (or write) the assigned guids
state <node/port> <state>            request a link state (down, init, armed, active)
delay [avg|stddev <usec>]            show or change the dispatch delay
verbose <level>                      change the log level (off, error, warn, info, debug, trace)
wait <msec>                          wait for pending mads to be delivered
attached                             list attached clients
disconnect <node/port>               detach the clients bound to a port
reload                               rebuild the fabric from its topology
quit                                 stop the simulator
help                                 show this text";

/// Which dispatch delay parameter to change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Knob {
    Average,
    StdDev,
}

/// A parsed console command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Link(String, String),
    Unlink(String, Option<u8>),
    Relink(String, Option<u8>),
    Dump(Option<String>),
    Route {
        from: u16,
        to: u16,
    },
    Error {
        node: String,
        port: Option<u8>,
        rate: f64,
        variance: f64,
        /// Fixed decision streak length (random when `None`).
        hold: Option<NonZeroU32>,
    },
    BaseLid {
        port: String,
        lid: u16,
        lmc: Option<u8>,
    },
    Guid(Option<PathBuf>),
    State(String, PortState),
    Delay(Option<(Knob, Duration)>),
    Verbose(LevelFilter),
    Wait(Duration),
    Attached,
    Disconnect(String),
    Reload,
    Quit,
    Help,
}

fn invalid(line: &str) -> Error {
    Error::InvalidCommand(line.trim().to_string())
}

fn number<T: FromStr>(word: &str) -> Result<T, Error> {
    let parsed = match word.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|value| value.to_string().parse().ok()),
        None => word.parse().ok(),
    };
    parsed.ok_or_else(|| Error::InvalidArgument(word.to_string()))
}

/// Split `node[/port]`.
fn target(word: &str) -> Result<(String, Option<u8>), Error> {
    match word.split_once('/') {
        Some((node, port)) => Ok((node.to_string(), Some(number(port)?))),
        None => Ok((word.to_string(), None)),
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line
            .split('#')
            .next()
            .unwrap_or_default()
            .split_whitespace()
            .collect();
        let Some((name, args)) = words.split_first() else {
            return Err(invalid(line));
        };
        let command = match (name.to_ascii_lowercase().as_str(), args) {
            ("link", [a, b]) => Command::Link(a.to_string(), b.to_string()),
            ("unlink", [node]) => {
                let (node, port) = target(node)?;
                Command::Unlink(node, port)
            }
            ("relink", [node]) => {
                let (node, port) = target(node)?;
                Command::Relink(node, port)
            }
            ("dump", []) => Command::Dump(None),
            ("dump", [node]) => Command::Dump(Some(node.to_string())),
            ("route", [from, to]) => Command::Route {
                from: number(from)?,
                to: number(to)?,
            },
            ("error", [node, rate, rest @ ..]) if rest.len() <= 2 => {
                let (node, port) = target(node)?;
                let rate = rate
                    .parse()
                    .map_err(|_| Error::InvalidArgument(rate.to_string()))?;
                let variance = match rest.first() {
                    Some(variance) => variance
                        .parse()
                        .map_err(|_| Error::InvalidArgument(variance.to_string()))?,
                    None => 0.0,
                };
                let hold = match rest.get(1) {
                    Some(hold) => NonZeroU32::new(number(hold)?),
                    None => None,
                };
                Command::Error {
                    node,
                    port,
                    rate,
                    variance,
                    hold,
                }
            }
            ("baselid", [port, lid, rest @ ..]) if rest.len() <= 1 => Command::BaseLid {
                port: port.to_string(),
                lid: number(lid)?,
                lmc: rest.first().map(|lmc| number(lmc)).transpose()?,
            },
            ("guid", []) => Command::Guid(None),
            ("guid", [path]) => Command::Guid(Some(PathBuf::from(*path))),
            ("state", [port, state]) => Command::State(port.to_string(), state.parse()?),
            ("delay", []) => Command::Delay(None),
            ("delay", [knob, usec]) => {
                let knob = match knob.to_ascii_lowercase().as_str() {
                    "avg" | "average" => Knob::Average,
                    "stddev" | "std" => Knob::StdDev,
                    _ => return Err(Error::InvalidArgument(knob.to_string())),
                };
                Command::Delay(Some((knob, Duration::from_micros(number(usec)?))))
            }
            ("verbose", [level]) => Command::Verbose(
                level
                    .parse()
                    .map_err(|_| Error::InvalidArgument(level.to_string()))?,
            ),
            ("wait", [msec]) => Command::Wait(Duration::from_millis(number(msec)?)),
            ("attached", []) => Command::Attached,
            ("disconnect", [port]) => Command::Disconnect(port.to_string()),
            ("reload", []) => Command::Reload,
            ("quit" | "exit", []) => Command::Quit,
            ("help" | "?", []) => Command::Help,
            _ => return Err(invalid(line)),
        };
        Ok(command)
    }
}

/// What the caller should do after a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Print the text (if any) and read the next command.
    Continue(String),
    Quit,
}

type Verbosity = Box<dyn Fn(LevelFilter) -> Result<(), Error> + Send + Sync>;

/// Executes commands against a [Simulator].
pub struct Console {
    simulator: Arc<Simulator>,
    verbosity: Option<Verbosity>,
}

impl Console {
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self {
            simulator,
            verbosity: None,
        }
    }

    /// Install the hook that applies `verbose` commands.
    pub fn with_verbosity<F>(mut self, verbosity: F) -> Self
    where
        F: Fn(LevelFilter) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.verbosity = Some(Box::new(verbosity));
        self
    }

    /// Parse and run one line. Blank lines and comments do nothing.
    pub fn execute(&self, line: &str) -> Result<Outcome, Error> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(Outcome::Continue(String::new()));
        }
        let command: Command = line.parse()?;
        self.run(command)
    }

    pub fn run(&self, command: Command) -> Result<Outcome, Error> {
        let fabric = self.simulator.fabric();
        let dispatcher = self.simulator.dispatcher();
        let output = match command {
            Command::Link(a, b) => {
                let (a, b) = (fabric.port_ref(&a)?, fabric.port_ref(&b)?);
                fabric.link(a, b, &*dispatcher)?;
                format!("linked {} - {}", fabric.port_name(a), fabric.port_name(b))
            }
            Command::Unlink(node, port) => {
                let node = fabric.node(&node)?.id();
                let pairs = fabric.unlink(node, port, &*dispatcher)?;
                describe(&fabric, "unlinked", &pairs)
            }
            Command::Relink(node, port) => {
                let node = fabric.node(&node)?.id();
                let pairs = fabric.relink(node, port, &*dispatcher)?;
                describe(&fabric, "relinked", &pairs)
            }
            Command::Dump(Some(node)) => fabric.dump(&node)?,
            Command::Dump(None) => {
                let mut out = String::new();
                for node in fabric.nodes() {
                    let _ = writeln!(
                        out,
                        "{} {} ports={}",
                        node.name(),
                        node.kind(),
                        node.num_ports()
                    );
                }
                out
            }
            Command::Route { from, to } => self.route(&fabric, from, to)?,
            Command::Error {
                node,
                port,
                rate,
                variance,
                hold,
            } => {
                let node = fabric.node(&node)?;
                let ports: Vec<u8> = match port {
                    Some(port) => vec![port],
                    None => node.ports().collect(),
                };
                for port in &ports {
                    node.set_error_rate(*port, rate, variance, hold)?;
                }
                info!(node = node.name(), ?ports, rate, variance, ?hold, "changed error model");
                let mut out = format!("{}: error rate {rate} variance {variance}", node.name());
                if let Some(hold) = hold {
                    let _ = write!(out, " hold {hold}");
                }
                let _ = write!(out, " on {} port(s)", ports.len());
                out
            }
            Command::BaseLid { port, lid, lmc } => {
                let port = fabric.port_ref(&port)?;
                let node = fabric
                    .get(port.node)
                    .ok_or_else(|| Error::UnknownNode(port.node.to_string()))?;
                node.set_lid(port.port, lid, lmc)?;
                let info = node.port_info(port.port)?;
                format!(
                    "{} lid={} lmc={}",
                    fabric.port_name(port),
                    info.base_lid,
                    info.lmc
                )
            }
            Command::Guid(None) => fabric.guid_dump(),
            Command::Guid(Some(path)) => {
                fabric.write_guid_dump(&path)?;
                format!("wrote {}", path.display())
            }
            Command::State(port, state) => {
                let port = fabric.port_ref(&port)?;
                let node = fabric
                    .get(port.node)
                    .ok_or_else(|| Error::UnknownNode(port.node.to_string()))?;
                match node.set_link_status(port.port, state, &*dispatcher)? {
                    Transition::Changed { from, to } => {
                        format!("{} {from} -> {to}", fabric.port_name(port))
                    }
                    Transition::NoChange => format!(
                        "{} unchanged ({})",
                        fabric.port_name(port),
                        node.link_status(port.port)?
                    ),
                }
            }
            Command::Delay(change) => {
                match change {
                    Some((Knob::Average, delay)) => dispatcher.set_delay_avg(delay),
                    Some((Knob::StdDev, delay)) => dispatcher.set_delay_stddev(delay),
                    None => {}
                }
                format!(
                    "delay avg={}us stddev={}us",
                    dispatcher.delay_avg().as_micros(),
                    dispatcher.delay_stddev().as_micros()
                )
            }
            Command::Verbose(level) => {
                let verbosity = self
                    .verbosity
                    .as_ref()
                    .ok_or_else(|| Error::InvalidCommand("verbose is not available".into()))?;
                verbosity(level)?;
                format!("log level {level}")
            }
            Command::Wait(timeout) => {
                let deadline = Instant::now() + timeout;
                while dispatcher.pending() > 0 && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
                format!("{} mad(s) pending", dispatcher.pending())
            }
            Command::Attached => {
                let mut out = String::new();
                for (node, port, filter) in self.simulator.attached() {
                    let _ = write!(out, "{node}/{port} class=0x{:02x}", filter.class);
                    if let Some(method) = filter.method {
                        let _ = write!(out, " method=0x{method:02x}");
                    }
                    if let Some(attribute) = filter.attribute {
                        let _ = write!(out, " attribute=0x{attribute:04x}");
                    }
                    out.push('\n');
                }
                out
            }
            Command::Disconnect(port) => {
                let (node, port) = match target(&port)? {
                    (node, Some(port)) => (node, port),
                    _ => return Err(Error::InvalidPortRef(port)),
                };
                let removed = self.simulator.detach_client(&node, port)?;
                format!("detached {removed} client binding(s) from {node}/{port}")
            }
            Command::Reload => {
                self.simulator.reload()?;
                format!("reloaded {} nodes", self.simulator.fabric().len())
            }
            Command::Quit => return Ok(Outcome::Quit),
            Command::Help => HELP.to_string(),
        };
        Ok(Outcome::Continue(output))
    }

    /// Walk a lid route without touching counters or the loss model.
    fn route(&self, fabric: &Fabric, from: u16, to: u16) -> Result<String, Error> {
        let origin = fabric
            .find_lid(from)
            .ok_or_else(|| Error::InvalidArgument(format!("no port has lid {from}")))?;
        let mad = Mad::new(class::PERF, method::GET, attribute::PORT_COUNTERS, 0)
            .with_slid(from)
            .with_dlid(to);
        let route = route_by_lid(fabric, origin.node, origin.port, &mad, Traversal::DryRun)?;
        let mut hops: Vec<String> = route
            .path
            .iter()
            .map(|id| {
                fabric
                    .get(*id)
                    .map(|node| node.name().to_string())
                    .unwrap_or_else(|| id.to_string())
            })
            .collect();
        if let Some(first) = hops.first_mut() {
            *first = fabric.port_name(origin);
        }
        if route.path.len() > 1 {
            if let Some(last) = hops.last_mut() {
                *last = fabric.port_name(route.destination);
            }
        }
        Ok(format!("{} ({} hops)", hops.join(" -> "), route.hops()))
    }
}

fn describe(fabric: &Fabric, verb: &str, pairs: &[(PortRef, PortRef)]) -> String {
    if pairs.is_empty() {
        return format!("nothing {verb}");
    }
    pairs
        .iter()
        .map(|(a, b)| {
            format!(
                "{verb} {} - {}",
                fabric.port_name(*a),
                fabric.port_name(*b)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
