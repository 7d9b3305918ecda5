//! Line protocol frames: lenient inbound parsing and bounded outbound lines.

use std::fmt;

/// Maximum body length of an outgoing line, before the `\r\n` terminator.
pub const MAX_LINE_BODY: usize = 510;

/// Source of a frame, `:nick!user@host`. Any part may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefix {
    pub nick: String,
    pub user: String,
    pub host: String,
}

impl Prefix {
    pub fn new(nick: impl Into<String>, user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            user: user.into(),
            host: host.into(),
        }
    }

    fn parse(raw: &str) -> Self {
        let (nick, rest) = match raw.split_once('!') {
            Some((nick, rest)) => (nick, Some(rest)),
            None => (raw, None),
        };
        let (user, host) = match rest {
            Some(rest) => rest.split_once('@').unwrap_or((rest, "")),
            None => ("", ""),
        };
        Self::new(nick, user, host)
    }

    pub fn is_empty(&self) -> bool {
        self.nick.is_empty() && self.user.is_empty() && self.host.is_empty()
    }

    /// Full `nick!user@host` address, only when every part is known.
    pub fn address(&self) -> Option<String> {
        if self.nick.is_empty() || self.user.is_empty() || self.host.is_empty() {
            return None;
        }
        Some(format!("{}!{}@{}", self.nick, self.user, self.host))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.nick)?;
        if !self.user.is_empty() || !self.host.is_empty() {
            write!(f, "!{}", self.user)?;
        }
        if !self.host.is_empty() {
            write!(f, "@{}", self.host)?;
        }
        Ok(())
    }
}

/// One parsed frame of the wire protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub prefix: Prefix,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(prefix: Prefix, command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix,
            command: command.into(),
            params,
        }
    }

    /// Parse one raw line. Never fails: invalid UTF-8 is replaced and a
    /// malformed line yields empty or partial fields.
    ///
    /// Format: `[:<prefix> ]<command> [<params>] [:<trailing>]`
    pub fn parse(octets: &[u8]) -> Self {
        let decoded = String::from_utf8_lossy(octets);
        let line = decoded.trim_end_matches(['\r', '\n']);

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(stripped) => match stripped.find(' ') {
                Some(space) => (Prefix::parse(&stripped[..space]), &stripped[space..]),
                None => (Prefix::parse(stripped), ""),
            },
            None => (Prefix::default(), line),
        };

        let mut tokens = Vec::new();
        let mut remaining = rest;
        loop {
            let trimmed = remaining.trim_start_matches(' ');
            if trimmed.is_empty() {
                break;
            }
            // A trailing parameter has to follow a space; the command itself
            // can never be one.
            let follows_space = trimmed.len() < remaining.len();
            if let Some(trailing) = trimmed.strip_prefix(':') {
                if follows_space && !tokens.is_empty() {
                    tokens.push(trailing.to_string());
                    break;
                }
                remaining = trailing;
                continue;
            }
            let end = trimmed.find(' ').unwrap_or(trimmed.len());
            tokens.push(trimmed[..end].to_string());
            remaining = &trimmed[end..];
        }

        let mut tokens = tokens.into_iter();
        let command = tokens.next().unwrap_or_default();
        Self {
            prefix,
            command,
            params: tokens.collect(),
        }
    }

    /// Target and text of a `PRIVMSG`-shaped frame.
    pub fn privmsg(&self) -> Option<(&str, &str)> {
        if self.command != "PRIVMSG" {
            return None;
        }
        let target = self.params.first()?;
        let text = self.params.get(1).map_or("", String::as_str);
        Some((target.as_str(), text))
    }

    /// Serialize back to wire form without the terminator.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if !self.prefix.is_empty() {
            out.push(':');
            out.push_str(&self.prefix.to_string());
            out.push(' ');
        }
        out.push_str(&self.command);
        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push_str(" :");
            out.push_str(last);
        }
        out
    }
}

/// Split `.cmd arg text` into `("cmd", "arg text")` when `text` starts with
/// the command prefix.
pub fn split_command<'a>(text: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    if prefix.is_empty() {
        return None;
    }
    let body = text.strip_prefix(prefix)?;
    Some(body.split_once(' ').unwrap_or((body, "")))
}

/// Build one outgoing line from protocol arguments.
///
/// Arguments are joined by spaces, the last one is sent as a trailing
/// parameter when there is more than one, CR/LF are removed, and the body is
/// cut to [`MAX_LINE_BODY`] bytes on a character boundary before `\r\n` is
/// appended.
pub fn format_line<S: AsRef<str>>(args: &[S]) -> Vec<u8> {
    let mut text = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            text.push(' ');
            if i == args.len() - 1 {
                text.push(':');
            }
        }
        text.push_str(arg.as_ref());
    }
    text.retain(|c| c != '\r' && c != '\n');

    let mut end = text.len().min(MAX_LINE_BODY);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);

    let mut octets = text.into_bytes();
    octets.extend_from_slice(b"\r\n");
    octets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_privmsg_with_full_prefix() {
        let msg = Message::parse(b":nick!user@host PRIVMSG #chan :.echo hi");
        assert_eq!(msg.prefix, Prefix::new("nick", "user", "host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", ".echo hi"]);
        assert_eq!(msg.privmsg(), Some(("#chan", ".echo hi")));
        assert_eq!(split_command(".echo hi", "."), Some(("echo", "hi")));
    }

    #[test]
    fn parse_server_prefix_has_only_nick() {
        let msg = Message::parse(b":irc.example.net 001 tern :Welcome to the network");
        assert_eq!(msg.prefix.nick, "irc.example.net");
        assert!(msg.prefix.user.is_empty());
        assert!(msg.prefix.address().is_none());
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["tern", "Welcome to the network"]);
    }

    #[test]
    fn parse_without_prefix() {
        let msg = Message::parse(b"PING :server.example.com\r\n");
        assert!(msg.prefix.is_empty());
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["server.example.com"]);
    }

    #[test]
    fn trailing_keeps_spaces_and_colons() {
        let msg = Message::parse(b":a!b@c PRIVMSG #x :  spaced :colon: text  ");
        assert_eq!(msg.params[1], "  spaced :colon: text  ");
    }

    #[test]
    fn middle_params_without_trailing() {
        let msg = Message::parse(b":server 433 * tern");
        assert_eq!(msg.command, "433");
        assert_eq!(msg.params, vec!["*", "tern"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let msg = Message::parse(b":a!b@c PRIVMSG #x :caf\xe9");
        assert_eq!(msg.params[1], "caf\u{fffd}");
    }

    #[test]
    fn empty_and_garbage_lines_degrade() {
        let empty = Message::parse(b"");
        assert!(empty.command.is_empty());
        assert!(empty.params.is_empty());

        let only_prefix = Message::parse(b":lonely!prefix@host");
        assert_eq!(only_prefix.prefix.nick, "lonely");
        assert!(only_prefix.command.is_empty());
    }

    #[test]
    fn empty_prefix_parts() {
        let msg = Message::parse(b":!@ NOTICE x :y");
        assert!(msg.prefix.is_empty());
        assert_eq!(msg.command, "NOTICE");
    }

    #[test]
    fn wire_round_trip() {
        let cases = [
            Message::new(
                Prefix::new("nick", "user", "host"),
                "PRIVMSG",
                vec!["#chan".into(), "hello  there :)".into()],
            ),
            Message::new(Prefix::default(), "PING", vec!["token".into()]),
            Message::new(Prefix::new("server", "", ""), "004", vec![]),
            Message::new(
                Prefix::new("n", "", "h"),
                "MODE",
                vec!["#c".into(), "+o".into(), "someone".into()],
            ),
        ];
        for msg in cases {
            assert_eq!(Message::parse(msg.to_wire().as_bytes()), msg);
        }
    }

    #[test]
    fn split_command_requires_prefix() {
        assert_eq!(split_command("echo hi", "."), None);
        assert_eq!(split_command(".seen", "."), Some(("seen", "")));
        assert_eq!(split_command("!!w x y", "!!"), Some(("w", "x y")));
        assert_eq!(split_command(".x", ""), None);
    }

    #[test]
    fn format_line_marks_trailing_parameter() {
        assert_eq!(format_line(&["PRIVMSG", "#c", "hi there"]), b"PRIVMSG #c :hi there\r\n");
        assert_eq!(format_line(&["QUIT"]), b"QUIT\r\n");
    }

    #[test]
    fn format_line_strips_line_breaks() {
        assert_eq!(format_line(&["PRIVMSG", "#c", "a\r\nJOIN #evil"]), b"PRIVMSG #c :aJOIN #evil\r\n");
    }

    #[test]
    fn format_line_never_exceeds_512_bytes() {
        for len in [0, 1, 400, 509, 510, 511, 1000, 4096] {
            let line = format_line(&["PRIVMSG", "#chan", "x".repeat(len).as_str()]);
            assert!(line.len() <= 512, "len {len} produced {} bytes", line.len());
            assert!(line.ends_with(b"\r\n"));
        }
        let wide = format_line(&["PRIVMSG", "#chan", "é".repeat(600).as_str()]);
        assert!(wide.len() <= 512);
        assert!(String::from_utf8(wide).is_ok());
    }
}
