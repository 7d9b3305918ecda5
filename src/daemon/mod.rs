use crate::config::Config;
use crate::control::{self, ControlServer};
use crate::plugins::{builtin, Loader};
use crate::runtime::{Bot, Instruction};
use crate::sandbox::{ProcessSandbox, Sandbox};
use crate::scheduler::Scheduler;
use crate::store::SqliteStore;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const STATUS_FLUSH_SECONDS: u64 = 5;

/// Run the bot until it quits, a fatal error occurs, or Ctrl+C.
pub async fn run(config: Config) -> Result<()> {
    run_with(config, Arc::new(builtin::register)).await
}

/// Like [`run`], with a custom handler loader.
pub async fn run_with(config: Config, loader: Loader) -> Result<()> {
    crate::health::mark_component_ok("daemon");

    let socket_path = config.control_socket_path();
    let control = ControlServer::bind(&socket_path).await?;

    let store = SqliteStore::new(config.database_path());
    store
        .init_schema()
        .with_context(|| format!("Failed to open {}", store.path().display()))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let tick = Duration::from_millis(config.runtime.tick_millis);
    let (scheduler, scheduler_handle) = Scheduler::new(store.clone(), tx.clone(), tick);
    let sandbox: Arc<dyn Sandbox> = Arc::new(ProcessSandbox::new(config.commands_dir()));

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_state_writer(state_file_path(&config))];
    let bot = Bot::new(config, store, sandbox, scheduler_handle, loader, (tx.clone(), rx));
    bot.load()?;

    handles.push(tokio::spawn(scheduler.run()));
    handles.push(control.spawn(tx.clone()));

    let _ = tx.send(Instruction::Connect);
    let mut bot_task = tokio::spawn(bot.run());

    println!("tern started");
    println!("   Control socket: {}", socket_path.display());
    println!("   Ctrl+C to stop");

    let outcome = tokio::select! {
        outcome = &mut bot_task => outcome,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            crate::health::mark_component_error("daemon", "shutdown requested");
            let _ = tx.send(Instruction::Quit);
            bot_task.await
        }
    };

    drop(tx);
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
    control::remove_socket(&socket_path);

    outcome.context("Dispatch loop panicked")?
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config.base_dir.join("daemon_state.json")
}

fn spawn_state_writer(path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_FLUSH_SECONDS));
        loop {
            interval.tick().await;
            let mut json = crate::health::snapshot_json();
            if let Some(obj) = json.as_object_mut() {
                obj.insert(
                    "written_at".into(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
            }
            let data = serde_json::to_vec_pretty(&json).unwrap_or_else(|_| b"{}".to_vec());
            let _ = tokio::fs::write(&path, data).await;
        }
    })
}
