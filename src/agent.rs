//! The subagent itself: registration tables, session lifecycle, updater
//! scheduling and trap sending.
//!
//! One worker thread per registered updater plus one dispatch thread for
//! inbound PDUs, all of them exiting when the stop channel closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, tick, unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handler::{RequestHandler, SetHandlerTable};
use crate::oid::Oid;
use crate::protocol::Protocol;
use crate::set_handler::{SetHandler, SetRegistration};
use crate::store::DataStore;
use crate::updater::{Snapshot, Updater};
use crate::value::{Value, VarBind};

/// snmpTrapOID.0, the sentinel naming the trap in every notification.
const SNMP_TRAP_OID: [u32; 11] = [1, 3, 6, 1, 6, 3, 1, 1, 4, 1, 0];

pub const DEFAULT_PRIORITY: u8 = 127;

/// How long the dispatch loop waits per receive poll.
const RECV_POLL: Duration = Duration::from_secs(1);
/// Idle time after which the master gets a keepalive Ping.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// Path of the master's UNIX socket, or `host:port` for
    /// AgentX-over-TCP.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Session timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Route response encoding through the batch encoder.
    #[serde(default)]
    pub parallel_encoding: bool,
    /// Size of the encoding pool; 0 leaves the pool at its own default.
    #[serde(default)]
    pub worker_threads: usize,
    /// Offload queue bound. Reserved; the in-process pool does not queue.
    #[serde(default)]
    pub queue_size: usize,
}

fn default_agent_id() -> String {
    "snmpkit".to_string()
}

fn default_socket_path() -> String {
    "/var/agentx/master".to_string()
}

fn default_timeout() -> u64 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            agent_id: default_agent_id(),
            socket_path: default_socket_path(),
            timeout: default_timeout(),
            parallel_encoding: false,
            worker_threads: 0,
            queue_size: 0,
        }
    }
}

type SharedUpdater = Arc<Mutex<Box<dyn Updater>>>;

/// Agent-side bookkeeping for one registered subtree.
#[derive(Clone)]
pub struct Registration {
    pub oid: Oid,
    pub freq: Duration,
    pub context: Option<String>,
    pub priority: u8,
    updater: Option<SharedUpdater>,
    /// Cleared on unregister so a live worker thread winds down.
    active: Arc<AtomicBool>,
}

fn registration_key(oid: &Oid, context: Option<&str>) -> String {
    format!("{}:{}", oid, context.unwrap_or(""))
}

/// State both the agent and the handles it gives out point at.
struct Shared {
    store: Arc<DataStore>,
    protocol: RwLock<Option<Arc<Protocol>>>,
}

impl Shared {
    fn send_trap(&self, trap_oid: &str, varbinds: Vec<VarBind>) -> Result<()> {
        let trap_oid: Oid = trap_oid.parse()?;
        let protocol = self
            .protocol
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Session("not connected".to_string()))?;

        debug!("send_trap: {} with {} varbinds", trap_oid, varbinds.len());
        let sentinel = Oid::from_parts(&SNMP_TRAP_OID).expect("trap sentinel OID is valid");
        let mut vbs = Vec::with_capacity(varbinds.len() + 1);
        vbs.push(VarBind::new(sentinel, Value::ObjectIdentifier(trap_oid)));
        vbs.extend(varbinds);
        protocol.send_notify(&vbs, None)
    }
}

/// Cheap handle passed to updaters and set handlers at registration. Holds
/// a weak reference: sending a trap through a handle whose agent is gone
/// fails with `NotBound`, without a live session with `Session`.
#[derive(Clone)]
pub struct AgentHandle {
    shared: Weak<Shared>,
}

impl AgentHandle {
    pub fn send_trap(&self, trap_oid: &str, varbinds: Vec<VarBind>) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(Error::NotBound)?;
        shared.send_trap(trap_oid, varbinds)
    }
}

pub struct Agent {
    config: AgentConfig,
    shared: Arc<Shared>,
    registrations: HashMap<String, Registration>,
    set_handlers: SetHandlerTable,
    threads: Vec<thread::JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
    stop_rx: Option<Receiver<()>>,
    running: bool,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Agent {
            config,
            shared: Arc::new(Shared {
                store: Arc::new(DataStore::new()),
                protocol: RwLock::new(None),
            }),
            registrations: HashMap::new(),
            set_handlers: Arc::new(Mutex::new(HashMap::new())),
            threads: Vec::new(),
            stop_tx: None,
            stop_rx: None,
            running: false,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register an updater-backed subtree. `freq` is the refresh interval;
    /// typical callers use 10 seconds and `DEFAULT_PRIORITY`. Registrations
    /// made before `start` are replayed with the master during start; later
    /// ones are wired up immediately.
    pub fn register(
        &mut self,
        oid: &str,
        updater: Box<dyn Updater>,
        freq: Duration,
        context: Option<&str>,
        priority: u8,
    ) -> Result<()> {
        let oid: Oid = oid.parse()?;
        let mut updater = updater;
        updater.attach(self.handle());
        self.shared.store.init_context(context);

        let reg = Registration {
            oid: oid.clone(),
            freq,
            context: context.map(str::to_string),
            priority,
            updater: Some(Arc::new(Mutex::new(updater))),
            active: Arc::new(AtomicBool::new(true)),
        };

        let key = registration_key(&oid, context);
        if self.running {
            // a set handler may already have claimed this subtree with the
            // master; a second Register would be rejected as a duplicate
            if !self.set_handlers.lock().unwrap().contains_key(&key) {
                self.live_protocol()?.register_oid(&oid, priority, context)?;
            }
            self.spawn_updater(&reg);
        }

        debug!("register: {} every {:?}", key, freq);
        self.registrations.insert(key, reg);
        Ok(())
    }

    /// Register a write handler for a subtree.
    pub fn register_set(
        &mut self,
        oid: &str,
        handler: Box<dyn SetHandler>,
        context: Option<&str>,
    ) -> Result<()> {
        let oid: Oid = oid.parse()?;
        let mut handler = handler;
        handler.attach(self.handle());
        self.shared.store.init_context(context);

        if self.running && !self.registrations.contains_key(&registration_key(&oid, context)) {
            self.live_protocol()?
                .register_oid(&oid, DEFAULT_PRIORITY, context)?;
        }

        let key = registration_key(&oid, context);
        debug!("register_set: {}", key);
        self.set_handlers
            .lock()
            .unwrap()
            .insert(key, SetRegistration::new(oid, context.map(str::to_string), handler));
        Ok(())
    }

    /// Remove a subtree from both tables. Silent when nothing is
    /// registered under the key.
    pub fn unregister(&mut self, oid: &str, context: Option<&str>) -> Result<()> {
        let oid: Oid = oid.parse()?;
        let key = registration_key(&oid, context);

        let mut priority = DEFAULT_PRIORITY;
        let mut removed = false;
        if let Some(reg) = self.registrations.remove(&key) {
            reg.active.store(false, Ordering::Relaxed);
            priority = reg.priority;
            removed = true;
        }
        if self.set_handlers.lock().unwrap().remove(&key).is_some() {
            removed = true;
        }

        if removed {
            debug!("unregister: {}", key);
            if self.running {
                if let Ok(protocol) = self.live_protocol() {
                    if let Err(e) = protocol.unregister_oid(&oid, priority, context) {
                        warn!("unregister: master refused release of {}: {}", oid, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Connect, open the session, replay all registrations, then spawn the
    /// worker threads. Any failure before the threads exist tears the
    /// session down again and surfaces the error.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }

        info!(
            "start: agent '{}' connecting to {}",
            self.config.agent_id, self.config.socket_path
        );
        let protocol = Arc::new(Protocol::new(
            &self.config.agent_id,
            &self.config.socket_path,
            Duration::from_secs(self.config.timeout),
            self.config.parallel_encoding,
        ));
        protocol.connect()?;
        protocol.open_session()?;

        if let Err(e) = self.register_all(&protocol) {
            if let Err(close_err) = protocol.close_session() {
                warn!("start: close after failed registration: {}", close_err);
            }
            protocol.disconnect();
            return Err(e);
        }

        self.configure_encoding_pool();
        *self.shared.protocol.write().unwrap() = Some(protocol.clone());

        let (stop_tx, stop_rx) = unbounded();
        self.stop_tx = Some(stop_tx);
        self.stop_rx = Some(stop_rx.clone());
        self.running = true;

        let regs: Vec<Registration> = self.registrations.values().cloned().collect();
        for reg in &regs {
            self.spawn_updater(reg);
        }

        let handler = RequestHandler::new(
            protocol.clone(),
            self.shared.store.clone(),
            self.set_handlers.clone(),
        );
        self.threads
            .push(thread::spawn(move || dispatch_loop(handler, protocol, stop_rx)));

        info!(
            "start: session {} up, {} subtree(s) registered",
            self.live_protocol().map(|p| p.session_id()).unwrap_or(0),
            self.registrations.len() + self.set_handlers.lock().unwrap().len()
        );
        Ok(())
    }

    /// Wind everything down: stop the workers, close the session, drop the
    /// connection. Registrations survive for a later restart. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        info!("stop: shutting down");
        self.running = false;
        // closing the channel is the stop signal
        self.stop_tx = None;
        self.stop_rx = None;

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("stop: worker thread panicked");
            }
        }

        let protocol = self.shared.protocol.write().unwrap().take();
        if let Some(protocol) = protocol {
            if let Err(e) = protocol.close_session() {
                warn!("stop: close_session failed: {}", e);
            }
            protocol.disconnect();
        }

        info!("stop: agent down");
        Ok(())
    }

    /// Push a notification. The trap OID rides in the leading
    /// snmpTrapOID.0 varbind; `varbinds` follow it.
    pub fn send_trap(&self, trap_oid: &str, varbinds: Vec<VarBind>) -> Result<()> {
        self.shared.send_trap(trap_oid, varbinds)
    }

    /// Probe the master over the live session.
    pub fn ping(&self) -> Result<()> {
        self.live_protocol()?.ping()
    }

    fn live_protocol(&self) -> Result<Arc<Protocol>> {
        self.shared
            .protocol
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Session("not connected".to_string()))
    }

    fn register_all(&self, protocol: &Protocol) -> Result<()> {
        for reg in self.registrations.values() {
            protocol.register_oid(&reg.oid, reg.priority, reg.context.as_deref())?;
        }

        let table = self.set_handlers.lock().unwrap();
        for sreg in table.values() {
            // a read registration may already have claimed this subtree
            let key = registration_key(sreg.base_oid(), sreg.context());
            if self.registrations.contains_key(&key) {
                continue;
            }
            protocol.register_oid(sreg.base_oid(), DEFAULT_PRIORITY, sreg.context())?;
        }
        Ok(())
    }

    fn spawn_updater(&mut self, reg: &Registration) {
        let updater = match reg.updater.clone() {
            Some(updater) => updater,
            None => return,
        };
        let stop_rx = match self.stop_rx.clone() {
            Some(rx) => rx,
            None => return,
        };

        let store = self.shared.store.clone();
        let base = reg.oid.clone();
        let context = reg.context.clone();
        let freq = reg.freq;
        let active = reg.active.clone();
        self.threads.push(thread::spawn(move || {
            updater_loop(updater, store, base, context, freq, active, stop_rx)
        }));
    }

    fn configure_encoding_pool(&self) {
        #[cfg(feature = "parallel")]
        if self.config.parallel_encoding && self.config.worker_threads > 0 {
            let result = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.worker_threads)
                .build_global();
            if let Err(e) = result {
                debug!("start: encoding pool already configured: {}", e);
            }
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("drop: stop failed: {}", e);
        }
    }
}

/// Refresh one subtree immediately, then on every tick, until the stop
/// channel closes or the registration is withdrawn.
fn updater_loop(
    updater: SharedUpdater,
    store: Arc<DataStore>,
    base: Oid,
    context: Option<String>,
    freq: Duration,
    active: Arc<AtomicBool>,
    stop_rx: Receiver<()>,
) {
    trace!("updater_loop: start for {}", base);
    let ticker = tick(freq);
    loop {
        if !active.load(Ordering::Relaxed) {
            break;
        }
        refresh_subtree(&updater, &store, &base, context.as_deref());
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {}
        }
    }
    trace!("updater_loop: exit for {}", base);
}

/// Run one `update()` and publish the snapshot as an atomic subtree
/// replacement. A failing updater keeps the previous subtree live.
fn refresh_subtree(updater: &SharedUpdater, store: &DataStore, base: &Oid, context: Option<&str>) {
    let mut snapshot = Snapshot::new();
    let result = match updater.lock() {
        Ok(mut updater) => updater.update(&mut snapshot),
        Err(e) => {
            error!("refresh_subtree: could not lock updater for {}: {}", base, e);
            return;
        }
    };

    match result {
        Ok(()) => {
            let varbinds = snapshot.varbinds(base);
            trace!(
                "refresh_subtree: publishing {} varbinds under {}",
                varbinds.len(),
                base
            );
            store.update(base, context, varbinds);
        }
        Err(e) => warn!("refresh_subtree: update for {} failed: {}", base, e),
    }
}

/// Serially dispatch inbound PDUs; ping the master after a stretch of
/// silence so a dead session is noticed between requests.
fn dispatch_loop(handler: RequestHandler, protocol: Arc<Protocol>, stop_rx: Receiver<()>) {
    trace!("dispatch_loop: start");
    let mut idle = Duration::from_secs(0);
    loop {
        match stop_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        match protocol.recv_pdu(RECV_POLL) {
            Ok(Some((header, body))) => {
                idle = Duration::from_secs(0);
                if let Err(e) = handler.dispatch(&header, &body) {
                    warn!("dispatch_loop: {:?} failed: {}", header.pdu_type, e);
                }
            }
            Ok(None) => {
                idle += RECV_POLL;
                if idle >= KEEPALIVE_IDLE {
                    idle = Duration::from_secs(0);
                    if let Err(e) = protocol.ping() {
                        error!("dispatch_loop: keepalive failed: {}", e);
                        break;
                    }
                    trace!("dispatch_loop: master answered keepalive");
                }
            }
            Err(e) => {
                error!("dispatch_loop: receive failed: {}", e);
                break;
            }
        }
    }
    trace!("dispatch_loop: exit");
}
