//! Handlers and setups every bot needs: registration, keepalive replies,
//! scheduler start, NickServ identification, link capture and the durable
//! table setups.

use super::{RegistryBuilder, SetupContext, CONNECTED, FIRST_MESSAGE};
use crate::runtime::env::Env;
use crate::runtime::instruction::Instruction;
use crate::store::PeriodicEntry;
use anyhow::Result;
use regex::Regex;

pub const CHECK_CONNECTION: &str = "check connection";
pub const CHECK_UNIQUE: &str = "check unique";

/// Register the built-in handlers and setups on `builder`.
pub fn register(builder: &mut RegistryBuilder) -> Result<()> {
    builder
        .on_fn(FIRST_MESSAGE, "register", register_client)
        .on_fn("PING", "pong", pong)
        .on_fn("001", "start-scheduler", start_scheduler)
        .on_fn("001", "nickserv", nickserv)
        .on_fn("JOIN", "own-address", own_address)
        .on_fn(CONNECTED, "log-connected", |env| {
            tracing::info!("Connected as {}", env.config.client.nick);
            Ok(())
        });

    let links = Regex::new(r#"(https?://[^<> "\x01]+)[,.]?"#)?;
    builder.on_fn("PRIVMSG", "links", move |env| capture_link(&links, env));

    builder
        .setup("schema", &[], |ctx| ctx.store.init_schema())
        .setup("periodic", &["schema"], install_periodic)
        .setup("instances", &["schema"], |ctx| {
            ctx.store.register_instance(ctx.pid)
        });
    Ok(())
}

fn register_client(env: &Env) -> Result<()> {
    let nick = env.config.client.nick.as_str();
    env.send(&["NICK", nick]);
    env.send(&["USER", nick, "+iw", nick, "tern"]);
    for channel in &env.config.client.channels {
        env.send(&["JOIN", channel.as_str()]);
    }
    Ok(())
}

fn pong(env: &Env) -> Result<()> {
    let token = env
        .params()
        .last()
        .map_or(env.config.client.nick.as_str(), String::as_str);
    env.send(&["PONG", token]);
    Ok(())
}

fn start_scheduler(env: &Env) -> Result<()> {
    if let Some(scheduler) = env.scheduler() {
        scheduler.start();
    }
    Ok(())
}

fn nickserv(env: &Env) -> Result<()> {
    if let Some(password) = &env.config.client.nickserv {
        let nick = &env.config.client.nick;
        env.msg("NickServ", &format!("IDENTIFY {nick} {password}"));
    }
    Ok(())
}

/// Our own JOIN echo carries the address the server shows for us.
fn own_address(env: &Env) -> Result<()> {
    if !env.nick().eq_ignore_ascii_case(&env.config.client.nick) {
        return Ok(());
    }
    if let Some(address) = env.address() {
        env.client(Instruction::Address(address));
    }
    Ok(())
}

fn capture_link(pattern: &Regex, env: &Env) -> Result<()> {
    let (Some(sender), Some(text)) = (&env.sender, &env.text) else {
        return Ok(());
    };
    if !sender.starts_with('#') {
        return Ok(());
    }
    if let Some(found) = pattern.captures(text).and_then(|c| c.get(1)) {
        env.client(Instruction::Link {
            channel: sender.clone(),
            url: found.as_str().to_string(),
        });
    }
    Ok(())
}

/// Drop transient periodic entries, then (re)install the keepalive and
/// duplicate-instance checks.
fn install_periodic(ctx: &SetupContext<'_>) -> Result<()> {
    let purged = ctx.store.purge_transient_periodic()?;
    if purged > 0 {
        tracing::info!("Removed {purged} transient periodic entries");
    }
    let runtime = &ctx.config.runtime;
    for (name, period, command) in [
        (CHECK_CONNECTION, runtime.ping_interval_secs, "ping"),
        (CHECK_UNIQUE, runtime.instance_check_secs, "instances"),
    ] {
        ctx.store.replace_periodic(&PeriodicEntry {
            name: name.to_string(),
            period,
            last_run: ctx.now,
            command: command.to_string(),
            args: Vec::new(),
        })?;
    }
    Ok(())
}
