//! Event handler and setup registry.
//!
//! Collaborators register handlers by event name (an IRC command, or one of
//! the markers below) and setups with dependencies. A registry is built once
//! per load, with its setups run in dependency order, then swapped in whole.

pub mod builtin;
pub mod order;

use crate::config::Config;
use crate::runtime::env::Env;
use crate::store::SqliteStore;
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Runs on the first message of every connection, before its own handlers.
pub const FIRST_MESSAGE: &str = ":1st";
/// Runs for every message, after the command's own handlers.
pub const ANY_MESSAGE: &str = "*";
/// Runs once the receive side of a new connection is up.
pub const CONNECTED: &str = ":connected";

/// Handler for one event name.
pub trait EventHandler: Send + Sync {
    /// Name used in logs when the handler fails
    fn name(&self) -> &str;

    fn handle(&self, env: &Env) -> Result<()>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Env) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, env: &Env) -> Result<()> {
        (self.f)(env)
    }
}

/// What a setup may touch while the registry is being built.
pub struct SetupContext<'a> {
    pub config: &'a Config,
    pub store: &'a SqliteStore,
    pub pid: u32,
    /// Unix time at which the load started
    pub now: i64,
}

type SetupFn = Box<dyn Fn(&SetupContext<'_>) -> Result<()> + Send + Sync>;

struct Setup {
    deps: Vec<String>,
    run: SetupFn,
}

/// Registers handlers and setups for one load.
pub type Loader = Arc<dyn Fn(&mut RegistryBuilder) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct RegistryBuilder {
    events: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    setups: BTreeMap<String, Setup>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, event: &str, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.events
            .entry(event.to_string())
            .or_default()
            .push(handler);
        self
    }

    /// Register a closure as the handler for `event`.
    pub fn on_fn<F>(&mut self, event: &str, name: &str, f: F) -> &mut Self
    where
        F: Fn(&Env) -> Result<()> + Send + Sync + 'static,
    {
        self.on(
            event,
            Arc::new(FnHandler {
                name: name.to_string(),
                f,
            }),
        )
    }

    /// Register a setup. A second setup with the same name replaces the first.
    pub fn setup<F>(&mut self, name: &str, deps: &[&str], f: F) -> &mut Self
    where
        F: Fn(&SetupContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.setups.insert(
            name.to_string(),
            Setup {
                deps: deps.iter().map(|d| (*d).to_string()).collect(),
                run: Box::new(f),
            },
        );
        self
    }

    /// Run every setup in dependency order and freeze the handlers.
    ///
    /// A failing setup is logged; the rest still run.
    pub fn build(self, ctx: &SetupContext<'_>) -> Registry {
        let graph: BTreeMap<String, Vec<String>> = self
            .setups
            .iter()
            .map(|(name, setup)| (name.clone(), setup.deps.clone()))
            .collect();
        let ordering = order::order(&graph);
        for cycle in &ordering.cycles {
            tracing::warn!("Setup dependency cycle: {}", cycle.join(" -> "));
        }
        for (name, dep) in &ordering.missing {
            tracing::warn!("Setup `{name}` depends on unknown setup `{dep}`; skipping it");
        }

        for name in &ordering.order {
            let Some(setup) = self.setups.get(name) else {
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| (setup.run)(ctx))) {
                Ok(Ok(())) => tracing::debug!("Setup `{name}` done"),
                Ok(Err(e)) => tracing::warn!("Setup `{name}` failed: {e:#}"),
                Err(_) => tracing::warn!("Setup `{name}` panicked"),
            }
        }

        Registry {
            events: self.events,
            setups_run: ordering.order,
        }
    }
}

/// Frozen handler table.
#[derive(Default)]
pub struct Registry {
    events: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    setups_run: Vec<String>,
}

impl Registry {
    pub fn handlers(&self, event: &str) -> &[Arc<dyn EventHandler>] {
        self.events.get(event).map(Vec::as_slice).unwrap_or_default()
    }

    /// Setup names in the order they ran.
    pub fn setups_run(&self) -> &[String] {
        &self.setups_run
    }

    pub fn handler_count(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    /// Run every handler for `event` in registration order. Each one is
    /// isolated: an error or panic is logged and the next handler runs.
    /// Returns how many failed.
    pub fn dispatch(&self, event: &str, env: &Env) -> usize {
        let mut failures = 0;
        for handler in self.handlers(event) {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(env))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!("Handler `{}` for `{event}` failed: {e:#}", handler.name());
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!("Handler `{}` for `{event}` panicked", handler.name());
                }
            }
        }
        failures
    }
}

/// Shared slot holding the current registry. Readers clone the `Arc` and
/// never see a half-built table.
#[derive(Clone, Default)]
pub struct RegistryHandle {
    current: Arc<RwLock<Arc<Registry>>>,
}

impl RegistryHandle {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn current(&self) -> Arc<Registry> {
        Arc::clone(&self.current.read())
    }

    pub fn swap(&self, registry: Registry) -> Arc<Registry> {
        std::mem::replace(&mut *self.current.write(), Arc::new(registry))
    }
}

/// Build a registry from `loader`, running its setups.
pub fn load(loader: &Loader, ctx: &SetupContext<'_>) -> Result<Registry> {
    let mut builder = RegistryBuilder::new();
    loader(&mut builder)?;
    Ok(builder.build(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::message::Message;
    use crate::runtime::env::Env;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        Config::new_default(tmp.path())
    }

    fn env(config: &Config) -> Env {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Env::new(
            Arc::new(config.clone()),
            Message::parse(b":n!u@h PRIVMSG #c :hello"),
            None,
            tx,
            None,
        )
    }

    #[test]
    fn failing_handlers_do_not_stop_the_rest() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let store = SqliteStore::new(tmp.path().join("db.sqlite3"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut builder = RegistryBuilder::new();
        let s1 = Arc::clone(&seen);
        builder.on_fn("PRIVMSG", "first", move |_| {
            s1.lock().push("first");
            anyhow::bail!("boom")
        });
        builder.on_fn("PRIVMSG", "second", |_| panic!("handler panic"));
        let s3 = Arc::clone(&seen);
        builder.on_fn("PRIVMSG", "third", move |env| {
            s3.lock().push("third");
            assert_eq!(env.text.as_deref(), Some("hello"));
            Ok(())
        });

        let registry = builder.build(&SetupContext {
            config: &config,
            store: &store,
            pid: 1,
            now: 0,
        });
        assert_eq!(registry.dispatch("PRIVMSG", &env(&config)), 2);
        assert_eq!(*seen.lock(), vec!["first", "third"]);
        assert_eq!(registry.dispatch("NOTICE", &env(&config)), 0);
    }

    #[test]
    fn setups_run_in_dependency_order() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let store = SqliteStore::new(tmp.path().join("db.sqlite3"));
        let ran = Arc::new(Mutex::new(Vec::new()));

        let mut builder = RegistryBuilder::new();
        for (name, deps) in [("A", vec!["B"]), ("B", vec!["C"]), ("C", vec![])] {
            let ran = Arc::clone(&ran);
            builder.setup(name, &deps, move |_| {
                ran.lock().push(name);
                Ok(())
            });
        }
        let registry = builder.build(&SetupContext {
            config: &config,
            store: &store,
            pid: 1,
            now: 0,
        });
        assert_eq!(*ran.lock(), vec!["C", "B", "A"]);
        assert_eq!(registry.setups_run(), ["C", "B", "A"]);
    }

    #[test]
    fn swap_replaces_the_whole_table() {
        let handle = RegistryHandle::new(Registry::default());
        let before = handle.current();
        assert_eq!(before.handler_count(), 0);

        let mut builder = RegistryBuilder::new();
        builder.on_fn("PING", "pong", |_| Ok(()));
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let store = SqliteStore::new(tmp.path().join("db.sqlite3"));
        let registry = builder.build(&SetupContext {
            config: &config,
            store: &store,
            pid: 1,
            now: 0,
        });

        let old = handle.swap(registry);
        assert_eq!(old.handler_count(), 0);
        assert_eq!(handle.current().handler_count(), 1);
        assert_eq!(before.handler_count(), 0);
    }
}
