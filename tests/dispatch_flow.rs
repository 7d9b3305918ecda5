//! End-to-end runs of the dispatch loop against a fake IRC server.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tern::config::Config;
use tern::plugins::{builtin, Loader};
use tern::runtime::{Bot, Instruction, InstructionSender};
use tern::sandbox::{CommandInvocation, Sandbox, SandboxError};
use tern::scheduler::Scheduler;
use tern::store::SqliteStore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct EchoSandbox;

#[async_trait]
impl Sandbox for EchoSandbox {
    fn has_command(&self, name: &str) -> bool {
        name == "echo"
    }

    async fn execute(&self, invocation: &CommandInvocation) -> Result<String, SandboxError> {
        Ok(format!("echo: {}", invocation.argument))
    }
}

struct Running {
    _tmp: TempDir,
    listener: TcpListener,
    tx: InstructionSender,
    bot: JoinHandle<anyhow::Result<()>>,
    scheduler: JoinHandle<()>,
}

async fn start(tweak: impl FnOnce(&mut Config)) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let tmp = TempDir::new().unwrap();
    let mut config = Config::create(&tmp.path().join("bot")).unwrap();
    config.server.host = "127.0.0.1".into();
    config.server.port = port;
    config.client.nick = "tern".into();
    config.client.channels = vec!["#a".into()];
    config.client.flood_protection = false;
    config.runtime.reconnect_initial_secs = 0;
    tweak(&mut config);
    config.save().unwrap();

    let store = SqliteStore::new(config.database_path());
    let (tx, rx) = mpsc::unbounded_channel();
    let (scheduler, handle) = Scheduler::new(store.clone(), tx.clone(), Duration::from_millis(50));
    let loader: Loader = Arc::new(builtin::register);
    let bot = Bot::new(
        config,
        store,
        Arc::new(EchoSandbox),
        handle,
        loader,
        (tx.clone(), rx),
    );
    bot.load().unwrap();

    let scheduler = tokio::spawn(scheduler.run());
    let bot = tokio::spawn(bot.run());
    tx.send(Instruction::Connect).unwrap();

    Running {
        _tmp: tmp,
        listener,
        tx,
        bot,
        scheduler,
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Client {
    async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("bot connects in time")
            .unwrap();
        let (read, write) = socket.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn line(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("line in time")
            .unwrap()
            .expect("connection open")
    }

    async fn silent_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.lines.next_line()).await.is_err()
    }

    async fn say(&mut self, line: &str) {
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\r\n").await.unwrap();
    }

    async fn expect_registration(&mut self) {
        self.say(":server 001 tern :Welcome").await;
        assert_eq!(self.line().await, "NICK :tern");
        assert_eq!(self.line().await, "USER tern +iw tern :tern");
        assert_eq!(self.line().await, "JOIN :#a");
    }
}

#[tokio::test]
async fn registers_answers_commands_and_quits() {
    let running = start(|_| {}).await;
    let mut client = Client::accept(&running.listener).await;
    client.expect_registration().await;

    client.say(":n!u@h PRIVMSG #a :.echo hi there").await;
    assert_eq!(client.line().await, "PRIVMSG #a :echo: hi there");

    client.say("PING :token").await;
    assert_eq!(client.line().await, "PONG :token");

    client.say(":n!u@h PRIVMSG #a :.unknown").await;
    client.say(":n!u@h PRIVMSG #a :.echo again").await;
    assert_eq!(client.line().await, "PRIVMSG #a :echo: again");

    running.tx.send(Instruction::Quit).unwrap();
    assert_eq!(client.line().await, "QUIT");
    tokio::time::timeout(Duration::from_secs(10), running.bot)
        .await
        .expect("loop exits")
        .unwrap()
        .unwrap();
    running.scheduler.abort();
}

#[tokio::test]
async fn reconnects_after_server_closes() {
    let running = start(|_| {}).await;
    let mut first = Client::accept(&running.listener).await;
    first.expect_registration().await;
    drop(first);

    let mut second = Client::accept(&running.listener).await;
    second.expect_registration().await;

    running.tx.send(Instruction::Quit).unwrap();
    assert_eq!(second.line().await, "QUIT");
    running.bot.await.unwrap().unwrap();
    running.scheduler.abort();
}

#[tokio::test]
async fn missing_pong_forces_reconnect() {
    let running = start(|c| {
        c.runtime.ping_grace_secs = 0;
        c.runtime.pong_timeout_secs = 1;
        c.runtime.ping_interval_secs = 1_000_000;
    })
    .await;
    let mut first = Client::accept(&running.listener).await;
    first.expect_registration().await;

    running.tx.send(Instruction::Ping).unwrap();
    assert_eq!(first.line().await, "PING :tern");

    let mut second = Client::accept(&running.listener).await;
    second.expect_registration().await;

    running.tx.send(Instruction::Quit).unwrap();
    running.bot.await.unwrap().unwrap();
    running.scheduler.abort();
}

#[tokio::test]
async fn control_join_is_persisted_and_sent() {
    let running = start(|_| {}).await;
    let mut client = Client::accept(&running.listener).await;
    client.expect_registration().await;

    running.tx.send(Instruction::Join("#b".into())).unwrap();
    assert_eq!(client.line().await, "JOIN :#b");

    running.tx.send(Instruction::Quit).unwrap();
    running.bot.await.unwrap().unwrap();
    let config = Config::load(&running._tmp.path().join("bot")).unwrap();
    assert_eq!(config.client.channels, vec!["#a", "#b"]);
    running.scheduler.abort();
}

fn schedule_msg(text: &str) -> Instruction {
    Instruction::Schedule {
        unixtime: 0,
        command: "msg".into(),
        args: vec![serde_json::json!("#a"), serde_json::json!(text)],
    }
}

#[tokio::test]
async fn scheduled_message_goes_out_once_registered() {
    let running = start(|_| {}).await;
    let mut client = Client::accept(&running.listener).await;
    client.expect_registration().await;

    running.tx.send(schedule_msg("x")).unwrap();
    assert_eq!(client.line().await, "PRIVMSG #a :x");

    running.tx.send(Instruction::Quit).unwrap();
    running.bot.await.unwrap().unwrap();
    running.scheduler.abort();
}

#[tokio::test]
async fn scheduler_waits_for_welcome_after_reconnect() {
    let running = start(|_| {}).await;
    let mut first = Client::accept(&running.listener).await;
    first.expect_registration().await;
    drop(first);

    let mut second = Client::accept(&running.listener).await;
    second.say(":server NOTICE * :Looking up your hostname").await;
    assert_eq!(second.line().await, "NICK :tern");
    assert_eq!(second.line().await, "USER tern +iw tern :tern");
    assert_eq!(second.line().await, "JOIN :#a");

    running.tx.send(schedule_msg("y")).unwrap();
    assert!(second.silent_for(Duration::from_millis(600)).await);

    second.say(":server 001 tern :Welcome").await;
    assert_eq!(second.line().await, "PRIVMSG #a :y");

    running.tx.send(Instruction::Quit).unwrap();
    running.bot.await.unwrap().unwrap();
    running.scheduler.abort();
}
