//! Periodic and one-shot deferred instructions backed by the durable store.
//!
//! The scheduler never touches bot state. Due entries become instructions on
//! the dispatch channel; new entries arrive on the scheduler's own inbox.

use crate::runtime::instruction::{Instruction, InstructionSender};
use crate::store::{PeriodicEntry, ScheduleEntry, SqliteStore};
use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, MissedTickBehavior};

const COMPONENT: &str = "scheduler";

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerMessage {
    /// The connection is up; `Start` may now activate the scheduler.
    Connected,
    /// Registration finished. Ignored unless `Connected` came first.
    Start,
    Disconnected,
    Schedule(ScheduleEntry),
    Periodic(PeriodicEntry),
}

/// Cloneable sender side of the scheduler inbox.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
}

impl SchedulerHandle {
    pub fn send(&self, message: SchedulerMessage) {
        if self.tx.send(message).is_err() {
            tracing::warn!("Scheduler is not running; message dropped");
        }
    }

    pub fn connected(&self) {
        self.send(SchedulerMessage::Connected);
    }

    pub fn start(&self) {
        self.send(SchedulerMessage::Start);
    }

    pub fn disconnected(&self) {
        self.send(SchedulerMessage::Disconnected);
    }
}

pub struct Scheduler {
    store: SqliteStore,
    instructions: InstructionSender,
    inbox: mpsc::UnboundedReceiver<SchedulerMessage>,
    tick: Duration,
    connected: bool,
    active: bool,
}

impl Scheduler {
    pub fn new(
        store: SqliteStore,
        instructions: InstructionSender,
        tick: Duration,
    ) -> (Self, SchedulerHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let scheduler = Self {
            store,
            instructions,
            inbox,
            tick: tick.max(Duration::from_millis(10)),
            connected: false,
            active: false,
        };
        (scheduler, SchedulerHandle { tx })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Apply one inbox message. New entries are persisted whether or not the
    /// scheduler is active.
    pub fn handle(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::Connected => self.connected = true,
            SchedulerMessage::Start => {
                if self.connected && !self.active {
                    tracing::info!("Scheduler started");
                }
                self.active = self.connected;
            }
            SchedulerMessage::Disconnected => {
                if self.active {
                    tracing::info!("Scheduler paused until reconnection");
                }
                self.connected = false;
                self.active = false;
            }
            SchedulerMessage::Schedule(entry) => {
                if let Err(e) = self.store.insert_schedule(&entry) {
                    crate::health::mark_component_error(COMPONENT, e.to_string());
                    tracing::warn!("Failed to persist schedule entry `{}`: {e}", entry.command);
                }
            }
            SchedulerMessage::Periodic(entry) => {
                if let Err(e) = self.store.replace_periodic(&entry) {
                    crate::health::mark_component_error(COMPONENT, e.to_string());
                    tracing::warn!("Failed to persist periodic entry `{}`: {e}", entry.name);
                }
            }
        }
    }

    /// Take everything already waiting in the inbox without blocking.
    pub fn drain(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            self.handle(message);
        }
    }

    /// Emit every entry due at `now`. Returns how many instructions went out.
    ///
    /// A periodic entry's `last_run` becomes `now`, not its due instant. A
    /// one-shot entry is deleted after its instruction has been queued.
    pub fn tick(&mut self, now: i64) -> Result<usize> {
        if !self.active {
            return Ok(0);
        }
        let mut emitted = 0;

        for entry in self.store.periodic_entries()? {
            let Some(due) = entry.next_due() else {
                tracing::warn!("Periodic entry `{}` has a zero period; skipped", entry.name);
                continue;
            };
            if due > now {
                continue;
            }
            if self.emit(&entry.command, &entry.args) {
                emitted += 1;
            }
            if let Err(e) = self.store.touch_periodic(&entry.name, now) {
                crate::health::mark_component_error(COMPONENT, e.to_string());
                tracing::warn!("Failed to advance periodic entry `{}`: {e}", entry.name);
            }
        }

        for (id, entry) in self.store.due_schedule(now)? {
            if self.emit(&entry.command, &entry.args) {
                emitted += 1;
            }
            if let Err(e) = self.store.delete_schedule(id) {
                crate::health::mark_component_error(COMPONENT, e.to_string());
                tracing::warn!("Failed to remove schedule entry {id}: {e}");
            }
        }

        Ok(emitted)
    }

    fn emit(&self, command: &str, args: &[serde_json::Value]) -> bool {
        match Instruction::decode(command, args) {
            Ok(instruction) => {
                tracing::debug!("Scheduled instruction due: {}", instruction.name());
                self.instructions.send(instruction).is_ok()
            }
            Err(e) => {
                tracing::warn!("Dropping scheduled `{command}`: {e}");
                false
            }
        }
    }

    /// Tick until the inbox closes. Persistence errors are logged and retried
    /// on the next tick.
    pub async fn run(mut self) {
        let mut interval = time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        crate::health::mark_component_ok(COMPONENT);

        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = interval.tick() => {
                    self.drain();
                    match self.tick(Utc::now().timestamp()) {
                        Ok(_) => crate::health::mark_component_ok(COMPONENT),
                        Err(e) => {
                            crate::health::mark_component_error(COMPONENT, e.to_string());
                            tracing::warn!("Scheduler tick failed: {e}");
                        }
                    }
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
