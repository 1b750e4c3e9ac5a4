//! Typed view over the server-to-server command set.
//!
//! [`Command::parse`] checks parameter counts and numeric fields so handlers
//! can match on variants instead of indexing into raw parameter lists.
//! [`Command::to_message`] is the inverse and decides which parameter is
//! written in trailing form.

use crate::error::{ProtocolError, Result};
use crate::message::Message;

/// Fields of a `NICK` user introduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NickIntro {
    /// Creation timestamp of the user (their TS).
    pub age: i64,
    /// Nickname.
    pub nick: String,
    /// Real host.
    pub host: String,
    /// Displayed host.
    pub dhost: String,
    /// Ident (username).
    pub ident: String,
    /// User mode string including the leading `+`.
    pub modes: String,
    /// IP address as text.
    pub ip: String,
    /// Real name.
    pub gecos: String,
}

/// A parsed protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `CAPAB :mod1,mod2` capability list.
    Capab(Vec<String>),
    /// `PASS <password>`, accepted and ignored before authentication.
    Pass(String),
    /// `AES <servername>` transport activation.
    Aes(String),
    /// `SERVER <name> <password> <hops> :<description>`.
    Server {
        /// Introduced server name.
        name: String,
        /// Link password, `*` for remote introductions.
        password: String,
        /// Hopcount as sent by the peer.
        hops: u32,
        /// Free-form description.
        description: String,
    },
    /// `BURST [<unix time>]`.
    Burst(Option<i64>),
    /// `ENDBURST`.
    EndBurst,
    /// `NICK` with the full eight-field introduction.
    Nick(NickIntro),
    /// `:<old> NICK <new>` rename.
    NickChange(String),
    /// `FJOIN <channel> <ts> :<prefixed nick list>`.
    Fjoin {
        /// Channel name.
        channel: String,
        /// Sender's channel timestamp.
        ts: i64,
        /// Members as `(prefix symbols, nick)`.
        members: Vec<(String, String)>,
    },
    /// `FMODE <target> <ts> <modes> [args...]`.
    Fmode {
        /// Channel or nick.
        target: String,
        /// Sender's timestamp for the target.
        ts: i64,
        /// Mode string.
        modes: String,
        /// Mode parameters.
        args: Vec<String>,
    },
    /// `FTOPIC <channel> <ts> <setter> :<topic>`.
    Ftopic {
        /// Channel name.
        channel: String,
        /// Time the topic was set.
        ts: i64,
        /// Who set it.
        setter: String,
        /// Topic text.
        topic: String,
    },
    /// `KILL <nick> :<reason>`.
    Kill {
        /// Victim.
        nick: String,
        /// Reason text.
        reason: String,
    },
    /// `SQUIT <server> :<reason>`.
    Squit {
        /// Server being split off.
        server: String,
        /// Reason text.
        reason: String,
    },
    /// `ADDLINE <type> <mask> <source> <set time> <duration> :<reason>`.
    AddLine {
        /// Line type character.
        kind: char,
        /// Ban mask.
        mask: String,
        /// Who set it.
        source: String,
        /// Creation time.
        set_time: i64,
        /// Duration in seconds, 0 for permanent.
        duration: i64,
        /// Reason text.
        reason: String,
    },
    /// `DELLINE <type> <mask>`.
    DelLine {
        /// Line type character.
        kind: char,
        /// Ban mask.
        mask: String,
    },
    /// `METADATA <target> <key> :<value>`.
    Metadata {
        /// `*`, a channel or a nick.
        target: String,
        /// Key.
        key: String,
        /// Value, empty to delete.
        value: String,
    },
    /// `PING <origin> [<target>]`.
    Ping {
        /// Server the ping came from.
        origin: String,
        /// Server the ping is for, when relayed.
        target: Option<String>,
    },
    /// `PONG <origin> [<target>]`.
    Pong {
        /// Server answering.
        origin: String,
        /// Server the pong is for, when relayed.
        target: Option<String>,
    },
    /// `VERSION :<version string>`.
    Version(String),
    /// `OPERTYPE <type>`.
    OperType(String),
    /// `ERROR :<message>`.
    Error(String),
    /// `QUIT :<reason>`.
    Quit(String),
    /// `AWAY [:<message>]`; `None` clears.
    Away(Option<String>),
    /// `PART <channel> [:<reason>]`.
    Part {
        /// Channel name.
        channel: String,
        /// Optional reason.
        reason: Option<String>,
    },
    /// `KICK <channel> <nick> :<reason>`.
    Kick {
        /// Channel name.
        channel: String,
        /// Victim.
        nick: String,
        /// Reason text.
        reason: String,
    },
    /// `PRIVMSG <target> :<text>`.
    Privmsg {
        /// Nick or channel.
        target: String,
        /// Message body.
        text: String,
    },
    /// `NOTICE <target> :<text>`.
    Notice {
        /// Nick or channel.
        target: String,
        /// Message body.
        text: String,
    },
    /// `RCONNECT <mask> <target>`: ask `target` to connect to `mask`.
    Rconnect {
        /// Link name mask to connect.
        mask: String,
        /// Server mask that should initiate the connection.
        target: String,
    },
    /// `TIME <server> <nick> [<ts>]`: request without `ts`, reply with it.
    Time {
        /// Server the request or reply is addressed to.
        target: String,
        /// Nick that asked.
        nick: String,
        /// Remote clock, present in replies.
        ts: Option<i64>,
    },
    /// Anything else; kept as the raw line for relaying.
    Unknown(Message),
}

fn need(msg: &Message, expected: usize) -> Result<()> {
    if msg.params.len() < expected {
        return Err(ProtocolError::NeedMoreParams {
            command: msg.command.clone(),
            expected,
            got: msg.params.len(),
        });
    }
    Ok(())
}

fn number<T: std::str::FromStr>(msg: &Message, idx: usize) -> Result<T> {
    let raw = msg.arg(idx).unwrap_or_default();
    raw.parse().map_err(|_| ProtocolError::InvalidNumber {
        command: msg.command.clone(),
        value: raw.to_string(),
    })
}

/// A length of time in seconds; negative values are malformed.
fn duration(msg: &Message, idx: usize) -> Result<i64> {
    let value: i64 = number(msg, idx)?;
    if value < 0 {
        return Err(ProtocolError::InvalidNumber {
            command: msg.command.clone(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn text(msg: &Message, idx: usize) -> String {
    msg.arg(idx).unwrap_or_default().to_string()
}

fn line_kind(msg: &Message) -> Result<char> {
    let raw = msg.arg(0).unwrap_or_default();
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(ProtocolError::InvalidCommand(format!(
            "{} type {:?}",
            msg.command, raw
        ))),
    }
}

/// Split `@+nick` into `("@+", "nick")`.
pub fn split_member_prefix(token: &str) -> (String, String) {
    let idx = token
        .find(|c: char| !crate::mode::is_prefix_symbol(c))
        .unwrap_or(token.len());
    (token[..idx].to_string(), token[idx..].to_string())
}

impl Command {
    /// Interpret a tokenized line.
    pub fn parse(msg: &Message) -> Result<Self> {
        let cmd = match msg.command.as_str() {
            "CAPAB" => Command::Capab(
                msg.params
                    .iter()
                    .flat_map(|p| p.split([',', ' ']))
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            "PASS" => {
                need(msg, 1)?;
                Command::Pass(text(msg, 0))
            }
            "AES" => {
                need(msg, 1)?;
                Command::Aes(text(msg, 0))
            }
            "SERVER" => {
                need(msg, 4)?;
                Command::Server {
                    name: text(msg, 0),
                    password: text(msg, 1),
                    hops: number(msg, 2)?,
                    description: msg.params[3..].join(" "),
                }
            }
            "BURST" => match msg.arg(0) {
                Some(_) => Command::Burst(Some(number(msg, 0)?)),
                None => Command::Burst(None),
            },
            "ENDBURST" => Command::EndBurst,
            "NICK" => {
                if msg.params.len() >= 8 {
                    Command::Nick(NickIntro {
                        age: number(msg, 0)?,
                        nick: text(msg, 1),
                        host: text(msg, 2),
                        dhost: text(msg, 3),
                        ident: text(msg, 4),
                        modes: text(msg, 5),
                        ip: text(msg, 6),
                        gecos: text(msg, 7),
                    })
                } else if (1..=2).contains(&msg.params.len()) {
                    Command::NickChange(text(msg, 0))
                } else {
                    return Err(ProtocolError::NeedMoreParams {
                        command: msg.command.clone(),
                        expected: 8,
                        got: msg.params.len(),
                    });
                }
            }
            "FJOIN" => {
                need(msg, 2)?;
                Command::Fjoin {
                    channel: text(msg, 0),
                    ts: number(msg, 1)?,
                    members: msg.params[2..]
                        .iter()
                        .flat_map(|p| p.split(' '))
                        .filter(|s| !s.is_empty())
                        .map(split_member_prefix)
                        .filter(|(_, nick)| !nick.is_empty())
                        .collect(),
                }
            }
            "FMODE" => {
                need(msg, 3)?;
                Command::Fmode {
                    target: text(msg, 0),
                    ts: number(msg, 1)?,
                    modes: text(msg, 2),
                    args: msg.params[3..].to_vec(),
                }
            }
            "FTOPIC" => {
                need(msg, 4)?;
                Command::Ftopic {
                    channel: text(msg, 0),
                    ts: number(msg, 1)?,
                    setter: text(msg, 2),
                    topic: text(msg, 3),
                }
            }
            "KILL" => {
                need(msg, 1)?;
                Command::Kill {
                    nick: text(msg, 0),
                    reason: text(msg, 1),
                }
            }
            "SQUIT" => {
                need(msg, 1)?;
                Command::Squit {
                    server: text(msg, 0),
                    reason: text(msg, 1),
                }
            }
            "ADDLINE" => {
                need(msg, 6)?;
                Command::AddLine {
                    kind: line_kind(msg)?,
                    mask: text(msg, 1),
                    source: text(msg, 2),
                    set_time: number(msg, 3)?,
                    duration: duration(msg, 4)?,
                    reason: text(msg, 5),
                }
            }
            "DELLINE" => {
                need(msg, 2)?;
                Command::DelLine {
                    kind: line_kind(msg)?,
                    mask: text(msg, 1),
                }
            }
            "METADATA" => {
                need(msg, 2)?;
                Command::Metadata {
                    target: text(msg, 0),
                    key: text(msg, 1),
                    value: text(msg, 2),
                }
            }
            "PING" | "PONG" => {
                need(msg, 1)?;
                let origin = text(msg, 0);
                let target = msg.arg(1).map(str::to_string);
                if msg.command == "PING" {
                    Command::Ping { origin, target }
                } else {
                    Command::Pong { origin, target }
                }
            }
            "VERSION" => Command::Version(msg.params.join(" ")),
            "OPERTYPE" => {
                need(msg, 1)?;
                Command::OperType(text(msg, 0))
            }
            "ERROR" => Command::Error(msg.params.join(" ")),
            "QUIT" => Command::Quit(text(msg, 0)),
            "AWAY" => Command::Away(msg.arg(0).filter(|s| !s.is_empty()).map(str::to_string)),
            "PART" => {
                need(msg, 1)?;
                Command::Part {
                    channel: text(msg, 0),
                    reason: msg.arg(1).map(str::to_string),
                }
            }
            "KICK" => {
                need(msg, 2)?;
                Command::Kick {
                    channel: text(msg, 0),
                    nick: text(msg, 1),
                    reason: text(msg, 2),
                }
            }
            "PRIVMSG" | "NOTICE" => {
                need(msg, 2)?;
                let (target, body) = (text(msg, 0), text(msg, 1));
                if msg.command == "PRIVMSG" {
                    Command::Privmsg { target, text: body }
                } else {
                    Command::Notice { target, text: body }
                }
            }
            "RCONNECT" => {
                need(msg, 2)?;
                Command::Rconnect {
                    mask: text(msg, 0),
                    target: text(msg, 1),
                }
            }
            "TIME" => {
                need(msg, 2)?;
                Command::Time {
                    target: text(msg, 0),
                    nick: text(msg, 1),
                    ts: match msg.arg(2) {
                        Some(_) => Some(number(msg, 2)?),
                        None => None,
                    },
                }
            }
            _ => Command::Unknown(msg.clone()),
        };
        Ok(cmd)
    }

    /// Command token as it appears on the wire.
    pub fn name(&self) -> &str {
        match self {
            Command::Capab(_) => "CAPAB",
            Command::Pass(_) => "PASS",
            Command::Aes(_) => "AES",
            Command::Server { .. } => "SERVER",
            Command::Burst(_) => "BURST",
            Command::EndBurst => "ENDBURST",
            Command::Nick(_) | Command::NickChange(_) => "NICK",
            Command::Fjoin { .. } => "FJOIN",
            Command::Fmode { .. } => "FMODE",
            Command::Ftopic { .. } => "FTOPIC",
            Command::Kill { .. } => "KILL",
            Command::Squit { .. } => "SQUIT",
            Command::AddLine { .. } => "ADDLINE",
            Command::DelLine { .. } => "DELLINE",
            Command::Metadata { .. } => "METADATA",
            Command::Ping { .. } => "PING",
            Command::Pong { .. } => "PONG",
            Command::Version(_) => "VERSION",
            Command::OperType(_) => "OPERTYPE",
            Command::Error(_) => "ERROR",
            Command::Quit(_) => "QUIT",
            Command::Away(_) => "AWAY",
            Command::Part { .. } => "PART",
            Command::Kick { .. } => "KICK",
            Command::Privmsg { .. } => "PRIVMSG",
            Command::Notice { .. } => "NOTICE",
            Command::Rconnect { .. } => "RCONNECT",
            Command::Time { .. } => "TIME",
            Command::Unknown(m) => &m.command,
        }
    }

    /// Serialize with the given origin prefix.
    pub fn to_message(&self, prefix: Option<&str>) -> Message {
        let m = Message::new(self.name()).with_optional_prefix(prefix);
        match self {
            Command::Capab(mods) => m.trailing_param(mods.join(",")),
            Command::Pass(p) => m.param(p.as_str()),
            Command::Aes(name) => m.param(name.as_str()),
            Command::Server {
                name,
                password,
                hops,
                description,
            } => m
                .params([name.as_str(), password.as_str()])
                .param(hops.to_string())
                .trailing_param(description.as_str()),
            Command::Burst(Some(ts)) => m.param(ts.to_string()),
            Command::Burst(None) | Command::EndBurst => m,
            Command::Nick(n) => m
                .param(n.age.to_string())
                .params([
                    n.nick.as_str(),
                    n.host.as_str(),
                    n.dhost.as_str(),
                    n.ident.as_str(),
                    n.modes.as_str(),
                    n.ip.as_str(),
                ])
                .trailing_param(n.gecos.as_str()),
            Command::NickChange(new) => m.param(new.as_str()),
            Command::Fjoin {
                channel,
                ts,
                members,
            } => {
                let list = members
                    .iter()
                    .map(|(p, n)| format!("{}{}", p, n))
                    .collect::<Vec<_>>()
                    .join(" ");
                m.param(channel.as_str())
                    .param(ts.to_string())
                    .trailing_param(list)
            }
            Command::Fmode {
                target,
                ts,
                modes,
                args,
            } => m
                .param(target.as_str())
                .param(ts.to_string())
                .param(modes.as_str())
                .params(args.iter().map(String::as_str)),
            Command::Ftopic {
                channel,
                ts,
                setter,
                topic,
            } => m
                .param(channel.as_str())
                .param(ts.to_string())
                .param(setter.as_str())
                .trailing_param(topic.as_str()),
            Command::Kill { nick, reason } => m.param(nick.as_str()).trailing_param(reason.as_str()),
            Command::Squit { server, reason } => {
                m.param(server.as_str()).trailing_param(reason.as_str())
            }
            Command::AddLine {
                kind,
                mask,
                source,
                set_time,
                duration,
                reason,
            } => m
                .param(kind.to_string())
                .params([mask.as_str(), source.as_str()])
                .param(set_time.to_string())
                .param(duration.to_string())
                .trailing_param(reason.as_str()),
            Command::DelLine { kind, mask } => m.param(kind.to_string()).param(mask.as_str()),
            Command::Metadata { target, key, value } => m
                .params([target.as_str(), key.as_str()])
                .trailing_param(value.as_str()),
            Command::Ping { origin, target } | Command::Pong { origin, target } => {
                let m = m.param(origin.as_str());
                match target {
                    Some(t) => m.param(t.as_str()),
                    None => m,
                }
            }
            Command::Version(v) => m.trailing_param(v.as_str()),
            Command::OperType(t) => m.param(t.as_str()),
            Command::Error(e) => m.trailing_param(e.as_str()),
            Command::Quit(r) => m.trailing_param(r.as_str()),
            Command::Away(Some(a)) => m.trailing_param(a.as_str()),
            Command::Away(None) => m,
            Command::Part { channel, reason } => {
                let m = m.param(channel.as_str());
                match reason {
                    Some(r) => m.trailing_param(r.as_str()),
                    None => m,
                }
            }
            Command::Kick {
                channel,
                nick,
                reason,
            } => m
                .params([channel.as_str(), nick.as_str()])
                .trailing_param(reason.as_str()),
            Command::Privmsg { target, text } | Command::Notice { target, text } => {
                m.param(target.as_str()).trailing_param(text.as_str())
            }
            Command::Rconnect { mask, target } => m.params([mask.as_str(), target.as_str()]),
            Command::Time { target, nick, ts } => {
                let m = m.params([target.as_str(), nick.as_str()]);
                match ts {
                    Some(ts) => m.param(ts.to_string()),
                    None => m,
                }
            }
            Command::Unknown(raw) => {
                let mut raw = raw.clone();
                raw.prefix = prefix.map(str::to_string).or(raw.prefix.take());
                raw
            }
        }
    }
}
