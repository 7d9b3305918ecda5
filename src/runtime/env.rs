use crate::config::Config;
use crate::irc::message::Message;
use crate::runtime::instruction::{Instruction, InstructionSender};
use crate::scheduler::SchedulerHandle;
use std::path::Path;
use std::sync::Arc;

/// Bytes left for message text once `PRIVMSG <target> :` and the bot's own
/// prefix as relayed by the server are accounted for.
const LIMIT_BUDGET: usize = 493;

/// Everything a handler sees for one message. Cheap to build; handlers only
/// ever enqueue instructions through it.
#[derive(Clone)]
pub struct Env {
    pub config: Arc<Config>,
    pub message: Message,
    /// Channel, or the sending nick for private messages
    pub sender: Option<String>,
    pub text: Option<String>,
    pub private: bool,
    /// Text length that still fits in one line, once our own address is known
    pub limit: Option<usize>,
    instructions: InstructionSender,
    scheduler: Option<SchedulerHandle>,
}

impl Env {
    pub fn new(
        config: Arc<Config>,
        message: Message,
        own_address: Option<&str>,
        instructions: InstructionSender,
        scheduler: Option<SchedulerHandle>,
    ) -> Self {
        let mut sender = None;
        let mut text = None;
        let mut private = false;

        if let Some((target, body)) = message.privmsg() {
            private = target.eq_ignore_ascii_case(&config.client.nick);
            sender = Some(if private {
                message.prefix.nick.clone()
            } else {
                target.to_string()
            });
            text = Some(body.to_string());
        }

        let limit = match (&sender, own_address) {
            (Some(sender), Some(address)) => {
                Some(LIMIT_BUDGET.saturating_sub(sender.len() + address.len()))
            }
            _ => None,
        };

        Self {
            config,
            message,
            sender,
            text,
            private,
            limit,
            instructions,
            scheduler,
        }
    }

    /// Environment with no message, as `:connected` handlers get.
    pub fn empty(
        config: Arc<Config>,
        instructions: InstructionSender,
        scheduler: Option<SchedulerHandle>,
    ) -> Self {
        Self::new(config, Message::default(), None, instructions, scheduler)
    }

    pub fn base(&self) -> &Path {
        &self.config.base_dir
    }

    pub fn nick(&self) -> &str {
        &self.message.prefix.nick
    }

    pub fn user(&self) -> &str {
        &self.message.prefix.user
    }

    pub fn host(&self) -> &str {
        &self.message.prefix.host
    }

    /// `nick!user@host` when all three parts are present.
    pub fn address(&self) -> Option<String> {
        self.message.prefix.address()
    }

    pub fn command(&self) -> &str {
        &self.message.command
    }

    pub fn params(&self) -> &[String] {
        &self.message.params
    }

    /// A plugin-owned config section, e.g. `[weather]`.
    pub fn section(&self, name: &str) -> Option<&toml::Value> {
        self.config.extra.get(name)
    }

    pub fn scheduler(&self) -> Option<&SchedulerHandle> {
        self.scheduler.as_ref()
    }

    /// Queue a raw protocol line built from `args`.
    pub fn send<S: AsRef<str>>(&self, args: &[S]) {
        let args = args.iter().map(|a| a.as_ref().to_string()).collect();
        self.client(Instruction::Send(args));
    }

    pub fn msg(&self, destination: &str, text: &str) {
        self.client(Instruction::Msg {
            destination: destination.to_string(),
            text: text.to_string(),
        });
    }

    /// Message whoever this message came from. False when there is no sender.
    pub fn say(&self, text: &str) -> bool {
        match &self.sender {
            Some(sender) => {
                self.msg(sender, text);
                true
            }
            None => false,
        }
    }

    /// Like [`Env::say`], addressed to the sending nick.
    pub fn reply(&self, text: &str) -> bool {
        match &self.sender {
            Some(sender) if !self.nick().is_empty() => {
                self.msg(sender, &format!("{}: {text}", self.nick()));
                true
            }
            _ => false,
        }
    }

    /// Enqueue any instruction on the dispatch channel.
    pub fn client(&self, instruction: Instruction) {
        if self.instructions.send(instruction).is_err() {
            tracing::debug!("Dispatch channel closed; instruction dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn config(tmp: &TempDir) -> Arc<Config> {
        let mut config = Config::new_default(tmp.path());
        config.client.nick = "tern".into();
        Arc::new(config)
    }

    #[test]
    fn channel_message_fields() {
        let tmp = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let env = Env::new(
            config(&tmp),
            Message::parse(b":nick!user@host PRIVMSG #chan :.echo hi"),
            Some("tern!bot@example.org"),
            tx,
            None,
        );
        assert_eq!(env.sender.as_deref(), Some("#chan"));
        assert_eq!(env.text.as_deref(), Some(".echo hi"));
        assert!(!env.private);
        assert_eq!(env.address().as_deref(), Some("nick!user@host"));
        assert_eq!(env.limit, Some(493 - "#chan".len() - "tern!bot@example.org".len()));
    }

    #[test]
    fn private_message_replies_to_nick() {
        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let env = Env::new(
            config(&tmp),
            Message::parse(b":alice!a@h PRIVMSG tern :hello"),
            None,
            tx,
            None,
        );
        assert!(env.private);
        assert_eq!(env.sender.as_deref(), Some("alice"));
        assert_eq!(env.limit, None);

        assert!(env.reply("hi"));
        assert_eq!(
            rx.try_recv().unwrap(),
            Instruction::Msg {
                destination: "alice".into(),
                text: "alice: hi".into()
            }
        );
    }

    #[test]
    fn empty_env_cannot_say() {
        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let env = Env::empty(config(&tmp), tx, None);
        assert!(!env.say("nobody"));
        env.send(&["JOIN", "#c"]);
        assert_eq!(
            rx.try_recv().unwrap(),
            Instruction::Send(vec!["JOIN".into(), "#c".into()])
        );
    }
}
