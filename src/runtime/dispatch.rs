//! The dispatch loop.
//!
//! `Bot` is the only consumer of the instruction channel and the only owner
//! of mutable bot state: config cache, link cache, connection, reconnect and
//! keepalive timers. Socket tasks, the scheduler, command tasks and the
//! control socket all talk to it by enqueueing instructions.

use crate::config::{Config, PrivatePolicy};
use crate::irc::connection::Connection;
use crate::irc::message::{format_line, split_command, Message, Prefix};
use crate::plugins::{self, Loader, RegistryHandle, SetupContext, ANY_MESSAGE, CONNECTED, FIRST_MESSAGE};
use crate::runtime::backoff::Backoff;
use crate::runtime::env::Env;
use crate::runtime::instruction::{ConnectionId, Instruction, InstructionReceiver, InstructionSender};
use crate::sandbox::{command_environment, Authoriser, CommandInvocation, Invoker, Sandbox};
use crate::scheduler::{SchedulerHandle, SchedulerMessage};
use crate::store::{pid_alive, PeriodicEntry, ScheduleEntry, SqliteStore};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;

const COMPONENT: &str = "connection";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Conditions after which the process must stop.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to bind control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("socket tasks for {0} did not stop within {1:?}")]
    TasksStuck(ConnectionId, Duration),
}

/// What the loop does after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Receiving,
    Sending,
    ReconnectPending,
}

pub struct Bot {
    config: Arc<Config>,
    store: SqliteStore,
    sandbox: Arc<dyn Sandbox>,
    scheduler: SchedulerHandle,
    loader: Loader,
    registry: RegistryHandle,
    tx: InstructionSender,
    rx: InstructionReceiver,
    authoriser: Authoriser,
    /// Lowercased nicks known to be identified to services
    identified: HashSet<String>,
    /// Last URL seen per channel
    links: HashMap<String, String>,
    /// Our own `nick!user@host`, once the server has shown it
    address: Option<String>,
    connection: Option<Connection>,
    next_id: u64,
    receiving_since: Option<Instant>,
    sending: bool,
    /// Set for each new connection, cleared by its first message
    first: bool,
    backoff: Backoff,
    reconnect_timer: Option<JoinHandle<()>>,
    discotimer: Option<JoinHandle<()>>,
    pid: u32,
}

impl Bot {
    pub fn new(
        config: Config,
        store: SqliteStore,
        sandbox: Arc<dyn Sandbox>,
        scheduler: SchedulerHandle,
        loader: Loader,
        channel: (InstructionSender, InstructionReceiver),
    ) -> Self {
        let runtime = &config.runtime;
        let backoff = Backoff::new(
            Duration::from_secs(runtime.reconnect_initial_secs),
            Duration::from_secs(runtime.reconnect_max_secs),
        );
        let authoriser = Authoriser::new(&config.client);
        let (tx, rx) = channel;
        Self {
            config: Arc::new(config),
            store,
            sandbox,
            scheduler,
            loader,
            registry: RegistryHandle::default(),
            tx,
            rx,
            authoriser,
            identified: HashSet::new(),
            links: HashMap::new(),
            address: None,
            connection: None,
            next_id: 0,
            receiving_since: None,
            sending: false,
            first: false,
            backoff,
            reconnect_timer: None,
            discotimer: None,
            pid: std::process::id(),
        }
    }

    /// Another producer handle onto the dispatch channel.
    pub fn sender(&self) -> InstructionSender {
        self.tx.clone()
    }

    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn link(&self, channel: &str) -> Option<&str> {
        self.links.get(channel).map(String::as_str)
    }

    pub fn own_address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        if self.reconnect_timer.is_some() {
            return ConnectionState::ReconnectPending;
        }
        match &self.connection {
            None => ConnectionState::Disconnected,
            Some(_) if self.receiving_since.is_some() => ConnectionState::Receiving,
            Some(_) if self.sending => ConnectionState::Sending,
            Some(conn) if conn.is_finished() => ConnectionState::Disconnected,
            Some(_) => ConnectionState::Connecting,
        }
    }

    /// Build a registry from the loader, run its setups, and swap it in.
    pub fn load(&self) -> Result<()> {
        let ctx = SetupContext {
            config: &self.config,
            store: &self.store,
            pid: self.pid,
            now: Utc::now().timestamp(),
        };
        let registry = plugins::load(&self.loader, &ctx)?;
        tracing::info!(
            "Loaded {} handlers, setups: {}",
            registry.handler_count(),
            registry.setups_run().join(", ")
        );
        self.registry.swap(registry);
        Ok(())
    }

    /// Process instructions until one asks to exit. Per-instruction errors
    /// are logged; only a [`FatalError`] ends the loop with an error.
    pub async fn run(mut self) -> Result<()> {
        while let Some(instruction) = self.rx.recv().await {
            let name = instruction.name().to_string();
            if !matches!(instruction, Instruction::Remote(_)) {
                tracing::debug!("handle: {name}");
            }
            match self.handle(instruction).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return Ok(()),
                Err(e) if e.is::<FatalError>() => {
                    crate::health::mark_component_error(COMPONENT, format!("{e:#}"));
                    return Err(e);
                }
                Err(e) => tracing::warn!("Instruction `{name}` failed: {e:#}"),
            }
        }
        Ok(())
    }

    pub async fn handle(&mut self, instruction: Instruction) -> Result<Flow> {
        match instruction {
            Instruction::Connect => self.connect().await,
            Instruction::Reconnect { force } => self.reconnect(force).await?,
            Instruction::Receiving(id) => self.on_receiving(id),
            Instruction::Sending(id) => {
                if self.is_current(id) {
                    self.sending = true;
                }
            }
            Instruction::Connected => self.on_connected(),
            Instruction::DiscoReceiving(id) => self.on_disco_receiving(id),
            Instruction::DiscoSending(id) => self.on_disco_sending(id),
            Instruction::Remote(octets) => self.on_remote(&octets),
            Instruction::Command {
                prefix,
                sender,
                cmd,
                arg,
            } => {
                let private = !sender.starts_with(['#', '&', '+', '!']);
                self.command(&prefix, &sender, &cmd, &arg, private);
            }
            Instruction::Join(channel) => self.join(&channel)?,
            Instruction::Part(channel) => self.part(&channel)?,
            Instruction::Link { channel, url } => {
                self.links.insert(channel, url);
            }
            Instruction::Schedule {
                unixtime,
                command,
                args,
            } => self
                .scheduler
                .send(SchedulerMessage::Schedule(ScheduleEntry {
                    unixtime,
                    command,
                    args,
                })),
            Instruction::Periodic {
                name,
                period,
                command,
                args,
            } => {
                if period == 0 {
                    bail!("Periodic entry `{name}` needs a positive period");
                }
                self.scheduler.send(SchedulerMessage::Periodic(PeriodicEntry {
                    name,
                    period,
                    last_run: Utc::now().timestamp(),
                    command,
                    args,
                }));
            }
            Instruction::Scheduled { cmd, arg, sender } => {
                self.command(&Prefix::default(), &sender, &cmd, &arg, false);
            }
            Instruction::Ping => self.ping(),
            Instruction::Quit => return Ok(self.quit(None).await),
            Instruction::Reload { destination } => self.reload(destination.as_deref())?,
            Instruction::Address(address) => self.address = Some(address),
            Instruction::Msg { destination, text } => {
                self.send(&["PRIVMSG", destination.as_str(), text.as_str()]);
            }
            Instruction::Send(args) => self.send(&args),
            Instruction::Message(text) => tracing::info!("Control message: {text}"),
            Instruction::Prefix(prefix) => {
                self.update_config(|config| config.client.prefix = prefix)?;
            }
            Instruction::Instances => return self.instances().await,
            Instruction::Identified(nick) => {
                self.identified.insert(nick.to_lowercase());
            }
            Instruction::Unknown(name) => tracing::warn!("Unknown instruction: {name}"),
        }
        Ok(Flow::Continue)
    }

    // ── connection lifecycle ─────────────────────────────────────

    fn is_current(&self, id: ConnectionId) -> bool {
        let current = self.connection.as_ref().is_some_and(|c| c.id() == id);
        if !current {
            tracing::debug!("Ignoring lifecycle report from superseded {id}");
        }
        current
    }

    async fn connect(&mut self) {
        if self.connection.as_ref().is_some_and(|c| !c.is_finished()) {
            tracing::warn!("Already connected; send `reconnect` to force a new connection");
            return;
        }
        self.open().await;
    }

    /// One connection attempt. Failure arms the backoff timer.
    async fn open(&mut self) {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let server = self.config.server.clone();
        let attempt = tokio::time::timeout(
            CONNECT_TIMEOUT,
            Connection::connect(
                id,
                &server,
                self.config.client.flood_protection,
                self.tx.clone(),
            ),
        )
        .await
        .unwrap_or_else(|_| {
            Err(anyhow!(
                "Timed out connecting to {}:{}",
                server.host,
                server.port
            ))
        });

        match attempt {
            Ok(conn) => {
                self.connection = Some(conn);
                self.first = true;
                self.identified.clear();
            }
            Err(e) => {
                crate::health::mark_component_error(COMPONENT, format!("{e:#}"));
                let delay = self.backoff.next_delay();
                tracing::warn!("{e:#}; retrying in {}s", delay.as_secs());
                self.schedule_reconnect(delay);
            }
        }
    }

    async fn reconnect(&mut self, force: bool) -> Result<()> {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if !force && (self.receiving_since.is_some() || self.sending) {
            tracing::debug!("Connection is live; ignoring reconnect");
            return Ok(());
        }
        self.cancel_discotimer();

        if let Some(conn) = self.connection.take() {
            let id = conn.id();
            conn.disconnect();
            let wait = Duration::from_secs(self.config.runtime.shutdown_wait_secs);
            if !conn.join(wait).await {
                return Err(FatalError::TasksStuck(id, wait).into());
            }
        }
        self.receiving_since = None;
        self.sending = false;
        self.scheduler.disconnected();

        crate::health::bump_component_restart(COMPONENT);
        tracing::info!("Reconnecting");
        self.open().await;
        Ok(())
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        if self.reconnect_timer.is_some() {
            return;
        }
        let tx = self.tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Instruction::Reconnect { force: false });
        }));
    }

    fn on_receiving(&mut self, id: ConnectionId) {
        if !self.is_current(id) {
            return;
        }
        self.receiving_since = Some(Instant::now());
        self.backoff.reset();
        crate::health::mark_component_ok(COMPONENT);
        // Before any queued 001 can send `Start`.
        self.scheduler.connected();
        let _ = self.tx.send(Instruction::Connected);
    }

    fn on_connected(&self) {
        let env = Env::empty(
            Arc::clone(&self.config),
            self.tx.clone(),
            Some(self.scheduler.clone()),
        );
        self.registry.current().dispatch(CONNECTED, &env);
    }

    fn on_disco_receiving(&mut self, id: ConnectionId) {
        if !self.is_current(id) {
            return;
        }
        tracing::info!("Receive side of {id} closed");
        self.receiving_since = None;
        self.cancel_discotimer();
        self.scheduler.disconnected();
        crate::health::mark_component_error(COMPONENT, "disconnected");

        if self.sending {
            if let Some(conn) = &self.connection {
                conn.close_sending();
            }
        } else {
            let delay = self.backoff.next_delay();
            self.schedule_reconnect(delay);
        }
    }

    fn on_disco_sending(&mut self, id: ConnectionId) {
        if !self.is_current(id) {
            return;
        }
        tracing::info!("Send side of {id} closed");
        self.sending = false;

        if self.receiving_since.is_some() {
            if let Some(conn) = &self.connection {
                conn.stop_receiving();
            }
        } else {
            let delay = self.backoff.next_delay();
            self.schedule_reconnect(delay);
        }
    }

    fn ping(&mut self) {
        let Some(since) = self.receiving_since else {
            return;
        };
        let grace = Duration::from_secs(self.config.runtime.ping_grace_secs);
        let wait = Duration::from_secs(self.config.runtime.pong_timeout_secs);
        if since.elapsed() < grace {
            return;
        }

        let nick = self.config.client.nick.clone();
        self.send(&["PING", nick.as_str()]);

        self.cancel_discotimer();
        let tx = self.tx.clone();
        self.discotimer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            tracing::warn!("No PONG within {}s; reconnecting", wait.as_secs());
            let _ = tx.send(Instruction::Reconnect { force: true });
        }));
    }

    fn cancel_discotimer(&mut self) -> bool {
        match self.discotimer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Send QUIT, close the socket and stop timers.
    async fn quit(&mut self, reason: Option<&str>) -> Flow {
        match reason {
            Some(reason) => self.send(&["QUIT", reason]),
            None => self.send(&["QUIT"]),
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.cancel_discotimer();

        if let Some(conn) = self.connection.take() {
            conn.disconnect();
            let wait = Duration::from_secs(self.config.runtime.shutdown_wait_secs);
            if !conn.join(wait).await {
                tracing::warn!("Socket tasks did not stop within {}s", wait.as_secs());
            }
        }
        self.scheduler.disconnected();
        if let Err(e) = self.store.unregister_instance(self.pid) {
            tracing::warn!("Failed to unregister instance: {e:#}");
        }
        Flow::Exit
    }

    async fn instances(&mut self) -> Result<Flow> {
        let ours = i64::from(self.pid);
        let live: Vec<i64> = self
            .store
            .instance_pids()?
            .into_iter()
            .filter(|pid| *pid == ours || pid_alive(*pid))
            .collect();

        match live.first() {
            Some(first) if *first != ours => {
                tracing::error!("Found another instance running: {live:?}");
                Ok(self.quit(Some("Another tern instance was detected")).await)
            }
            _ => {
                if !live.contains(&ours) {
                    self.store.register_instance(self.pid)?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    // ── messages and commands ────────────────────────────────────

    fn on_remote(&mut self, octets: &[u8]) {
        let message = Message::parse(octets);
        if message.command == "PONG" && self.cancel_discotimer() {
            tracing::debug!("Cancelled the disco timer");
        }

        let env = Env::new(
            Arc::clone(&self.config),
            message,
            self.address.as_deref(),
            self.tx.clone(),
            Some(self.scheduler.clone()),
        );

        if env.message.command == "PRIVMSG" {
            let blocked = match self.config.client.private {
                PrivatePolicy::Allow => false,
                PrivatePolicy::Deny => env.private,
                PrivatePolicy::Only => !env.private,
            };
            if blocked {
                return;
            }
            if let (Some(sender), Some(text)) = (&env.sender, &env.text) {
                if let Some((cmd, arg)) = split_command(text, &self.config.client.prefix) {
                    self.command(&env.message.prefix, sender, cmd, arg, env.private);
                }
            }
        }

        let registry = self.registry.current();
        if std::mem::take(&mut self.first) {
            registry.dispatch(FIRST_MESSAGE, &env);
        }
        registry.dispatch(&env.message.command, &env);
        registry.dispatch(ANY_MESSAGE, &env);
    }

    /// Start `cmd` on its own task; its output comes back as a `msg`.
    fn command(&self, prefix: &Prefix, sender: &str, cmd: &str, arg: &str, private: bool) {
        if !self.sandbox.has_command(cmd) {
            tracing::debug!("No command named `{cmd}`");
            return;
        }

        let address = prefix.address();
        let authorised = address
            .as_deref()
            .is_some_and(|a| self.authoriser.is_authorised(a, &prefix.nick, &self.identified));
        let invoker = Invoker {
            nick: &prefix.nick,
            sender,
            address: address.as_deref(),
            url: self.link(sender),
            authorised,
        };
        let runtime = &self.config.runtime;
        let timeout = if authorised && private {
            runtime.authorised_timeout_secs
        } else {
            runtime.command_timeout_secs
        };
        let invocation = CommandInvocation {
            command: cmd.to_string(),
            argument: arg.to_string(),
            environment: command_environment(&self.config, &invoker),
            timeout: Duration::from_secs(timeout),
        };

        let sandbox = Arc::clone(&self.sandbox);
        let tx = self.tx.clone();
        let destination = sender.to_string();
        tokio::spawn(async move {
            let text = match sandbox.execute(&invocation).await {
                Ok(output) => output,
                Err(e) if e.is_silent() => {
                    tracing::debug!("Command `{}` ignored: {e}", invocation.command);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Command `{}` failed: {e}", invocation.command);
                    e.to_string()
                }
            };
            if !text.is_empty() {
                let _ = tx.send(Instruction::Msg { destination, text });
            }
        });
    }

    /// Queue one protocol line on the current connection.
    fn send<S: AsRef<str>>(&self, args: &[S]) {
        let line = format_line(args);
        match &self.connection {
            Some(conn) => {
                if !conn.send(line) {
                    tracing::debug!("Send side is closed; line dropped");
                }
            }
            None => tracing::debug!(
                "Not connected; dropped {}",
                String::from_utf8_lossy(&line).trim_end()
            ),
        }
    }

    // ── config mutations ─────────────────────────────────────────

    /// Persist a changed config first, then swap the in-memory copy.
    fn update_config(&mut self, change: impl FnOnce(&mut Config)) -> Result<()> {
        let mut next = (*self.config).clone();
        change(&mut next);
        next.save().context("Failed to save config")?;
        self.authoriser = Authoriser::new(&next.client);
        self.config = Arc::new(next);
        Ok(())
    }

    fn join(&mut self, channel: &str) -> Result<()> {
        if self.config.client.channels.iter().any(|c| c == channel) {
            return Ok(());
        }
        self.update_config(|config| config.client.channels.push(channel.to_string()))?;
        self.send(&["JOIN", channel]);
        Ok(())
    }

    fn part(&mut self, channel: &str) -> Result<()> {
        if !self.config.client.channels.iter().any(|c| c == channel) {
            return Ok(());
        }
        self.update_config(|config| config.client.channels.retain(|c| c != channel))?;
        self.send(&["PART", channel]);
        Ok(())
    }

    /// Re-read the config file, rebuild the registry and swap both in.
    fn reload(&mut self, destination: Option<&str>) -> Result<()> {
        let started = Instant::now();
        match Config::load(&self.config.base_dir) {
            Ok(config) => {
                self.authoriser = Authoriser::new(&config.client);
                self.config = Arc::new(config);
            }
            Err(e) => tracing::warn!("Keeping the current config: {e:#}"),
        }
        self.load()?;

        let secs = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
        let text = format!("Reloaded in {secs} seconds");
        tracing::info!("{text}");
        if let Some(destination) = destination {
            self.send(&["PRIVMSG", destination, text.as_str()]);
        }
        Ok(())
    }
}
