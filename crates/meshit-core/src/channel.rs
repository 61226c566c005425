//! Channel service (C8): IRC-style channel membership, join/leave/send,
//! periodic announcement, and slash-command parsing.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use dashmap::DashMap;

use crate::error::ChannelError;

/// One channel's membership and metadata (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub password: Option<String>,
    pub member_fingerprints: HashSet<String>,
    pub member_names: HashMap<String, String>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub is_joined: bool,
}

impl Channel {
    fn new(name: String) -> Self {
        let now = Instant::now();
        Self {
            name,
            password: None,
            member_fingerprints: HashSet::new(),
            member_names: HashMap::new(),
            created_at: now,
            last_activity: now,
            is_joined: false,
        }
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.member_fingerprints.len()
    }
}

/// Normalize a channel name: trim, lowercase, ensure a leading `#`.
#[must_use]
pub fn normalize_channel_name(name: &str) -> String {
    let trimmed = name.trim().to_lowercase();
    if trimmed.starts_with('#') {
        trimmed
    } else {
        format!("#{trimmed}")
    }
}

/// Events the channel service publishes for the routing engine and UI
/// layers to act on.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The local node joined `channel`; broadcast a channel-join packet.
    Joined { channel: String, nickname: String },
    /// The local node left `channel`; broadcast a channel-leave packet.
    Left { channel: String, nickname: String },
    /// The local node wants to send `text` on `channel`; broadcast a
    /// channel-message packet.
    MessageReady { channel: String, text: String },
    /// Periodic announcement of a joined channel's member count.
    Announce { channel: String, member_count: usize },
}

/// The channel service (C8): `channelName -> Channel`.
#[derive(Default)]
pub struct ChannelService {
    channels: DashMap<String, Channel>,
}

impl ChannelService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn fetch_or_create(&self, name: &str) -> dashmap::mapref::one::RefMut<'_, String, Channel> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(name.to_string()))
    }

    /// Join `name` (creating it if it doesn't exist yet), optionally guarded
    /// by `password`. Fails `unauthorized` if the channel already has a
    /// stored password that does not match.
    pub fn join(
        &self,
        name: &str,
        password: Option<&str>,
        local_fingerprint: &str,
        nickname: &str,
    ) -> Result<ChannelEvent, ChannelError> {
        let name = normalize_channel_name(name);
        let mut channel = self.fetch_or_create(&name);

        if let Some(stored) = &channel.password {
            if password != Some(stored.as_str()) {
                return Err(ChannelError::Unauthorized);
            }
        } else if channel.password.is_none() && password.is_some() {
            channel.password = password.map(str::to_string);
        }

        channel.member_fingerprints.insert(local_fingerprint.to_string());
        channel
            .member_names
            .insert(local_fingerprint.to_string(), nickname.to_string());
        channel.is_joined = true;
        channel.last_activity = Instant::now();

        Ok(ChannelEvent::Joined {
            channel: name,
            nickname: nickname.to_string(),
        })
    }

    /// Leave `name`: remove local membership and fire a leave-broadcast
    /// event. A no-op (still returns the event) if the channel does not
    /// exist or was not joined.
    pub fn leave(&self, name: &str, local_fingerprint: &str, nickname: &str) -> ChannelEvent {
        let name = normalize_channel_name(name);
        if let Some(mut channel) = self.channels.get_mut(&name) {
            channel.member_fingerprints.remove(local_fingerprint);
            channel.member_names.remove(local_fingerprint);
            channel.is_joined = false;
            channel.last_activity = Instant::now();
        }
        ChannelEvent::Left {
            channel: name,
            nickname: nickname.to_string(),
        }
    }

    /// Send a text message on `name`. Requires local membership.
    pub fn send_message(&self, name: &str, text: &str) -> Result<ChannelEvent, ChannelError> {
        let name = normalize_channel_name(name);
        match self.channels.get(&name) {
            Some(channel) if channel.is_joined => Ok(ChannelEvent::MessageReady {
                channel: name,
                text: text.to_string(),
            }),
            _ => Err(ChannelError::NotJoined),
        }
    }

    /// Record a remote peer joining a channel, learned from an incoming
    /// channel-join packet.
    pub fn record_remote_join(&self, name: &str, fingerprint: &str, nickname: &str) {
        let name = normalize_channel_name(name);
        let mut channel = self.fetch_or_create(&name);
        channel.member_fingerprints.insert(fingerprint.to_string());
        channel.member_names.insert(fingerprint.to_string(), nickname.to_string());
        channel.last_activity = Instant::now();
    }

    /// Record a remote peer leaving a channel, learned from an incoming
    /// channel-leave packet.
    pub fn record_remote_leave(&self, name: &str, fingerprint: &str) {
        let name = normalize_channel_name(name);
        if let Some(mut channel) = self.channels.get_mut(&name) {
            channel.member_fingerprints.remove(fingerprint);
            channel.member_names.remove(fingerprint);
            channel.last_activity = Instant::now();
        }
    }

    /// Record an announced member count for a channel this node has not
    /// joined, populating `availableChannels` discovery.
    pub fn record_remote_announce(&self, name: &str) {
        let name = normalize_channel_name(name);
        let mut channel = self.fetch_or_create(&name);
        channel.last_activity = Instant::now();
    }

    /// All channels the local node has joined.
    #[must_use]
    pub fn joined_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|e| e.is_joined)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Channels observed remotely but not joined locally.
    #[must_use]
    pub fn available_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|e| !e.is_joined)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Build one [`ChannelEvent::Announce`] per joined channel, for the
    /// periodic `announceAll()` sweep.
    #[must_use]
    pub fn announce_all(&self) -> Vec<ChannelEvent> {
        self.channels
            .iter()
            .filter(|e| e.is_joined)
            .map(|e| ChannelEvent::Announce {
                channel: e.key().clone(),
                member_count: e.member_count(),
            })
            .collect()
    }

    /// Snapshot a channel's member nicknames, for `/who`.
    #[must_use]
    pub fn members(&self, name: &str) -> Vec<String> {
        let name = normalize_channel_name(name);
        self.channels
            .get(&name)
            .map(|c| c.member_names.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// A parsed slash command, or the raw text if it was not recognised as one
/// (`handled = false`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { channel: String, password: Option<String> },
    Leave { channel: String },
    ListChannels,
    Who { channel: Option<String> },
    DirectMessage { name: String, text: String },
    SendFile { name: String, path: String },
    Help,
    Unhandled(String),
}

/// Parse a line of user input into a [`Command`]. Anything not starting
/// with `/` is not a command at all (the caller should treat it as a plain
/// message and never call this function on it).
#[must_use]
pub fn parse_command(input: &str) -> Command {
    let input = input.trim();
    let mut parts = input.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match head {
        "/join" => {
            let mut args = rest.splitn(2, char::is_whitespace);
            let channel = args.next().unwrap_or("").to_string();
            let password = args.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
            Command::Join { channel, password }
        }
        "/leave" => Command::Leave {
            channel: rest.to_string(),
        },
        "/channels" | "/list" => Command::ListChannels,
        "/who" => Command::Who {
            channel: if rest.is_empty() { None } else { Some(rest.to_string()) },
        },
        "/msg" => {
            let mut args = rest.splitn(2, char::is_whitespace);
            let name = args.next().unwrap_or("").to_string();
            let text = args.next().unwrap_or("").to_string();
            Command::DirectMessage { name, text }
        }
        "/send" => {
            let mut args = rest.splitn(2, char::is_whitespace);
            let name = args.next().unwrap_or("").to_string();
            let path = args.next().unwrap_or("").to_string();
            Command::SendFile { name, path }
        }
        "/help" => Command::Help,
        _ => Command::Unhandled(input.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_lowercases_and_prefixes() {
        assert_eq!(normalize_channel_name("  General "), "#general");
        assert_eq!(normalize_channel_name("#General"), "#general");
    }

    #[test]
    fn join_then_send_succeeds() {
        let svc = ChannelService::new();
        svc.join("#general", None, "fp-a", "alice").unwrap();
        let event = svc.send_message("#general", "hi").unwrap();
        assert!(matches!(event, ChannelEvent::MessageReady { .. }));
    }

    #[test]
    fn send_without_join_is_not_joined_error() {
        let svc = ChannelService::new();
        let err = svc.send_message("#general", "hi").unwrap_err();
        assert!(matches!(err, ChannelError::NotJoined));
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        let svc = ChannelService::new();
        svc.join("#secret", Some("hunter2"), "fp-a", "alice").unwrap();
        let err = svc.join("#secret", Some("wrong"), "fp-b", "bob").unwrap_err();
        assert!(matches!(err, ChannelError::Unauthorized));
    }

    #[test]
    fn leave_then_send_fails() {
        let svc = ChannelService::new();
        svc.join("#general", None, "fp-a", "alice").unwrap();
        svc.leave("#general", "fp-a", "alice");
        assert!(svc.send_message("#general", "hi").is_err());
    }

    #[test]
    fn joined_and_available_partition_correctly() {
        let svc = ChannelService::new();
        svc.join("#general", None, "fp-a", "alice").unwrap();
        svc.record_remote_announce("#random");
        assert_eq!(svc.joined_channels(), vec!["#general".to_string()]);
        assert_eq!(svc.available_channels(), vec!["#random".to_string()]);
    }

    #[test]
    fn parses_known_commands() {
        assert_eq!(
            parse_command("/join #general pw"),
            Command::Join {
                channel: "#general".to_string(),
                password: Some("pw".to_string())
            }
        );
        assert_eq!(
            parse_command("/leave #general"),
            Command::Leave { channel: "#general".to_string() }
        );
        assert_eq!(parse_command("/channels"), Command::ListChannels);
        assert_eq!(parse_command("/list"), Command::ListChannels);
        assert_eq!(parse_command("/who #general"), Command::Who { channel: Some("#general".to_string()) });
        assert_eq!(parse_command("/who"), Command::Who { channel: None });
        assert_eq!(
            parse_command("/msg bob hey there"),
            Command::DirectMessage { name: "bob".to_string(), text: "hey there".to_string() }
        );
        assert_eq!(parse_command("/help"), Command::Help);
        assert_eq!(
            parse_command("/send bob /tmp/photo.png"),
            Command::SendFile { name: "bob".to_string(), path: "/tmp/photo.png".to_string() }
        );
    }

    #[test]
    fn unknown_slash_command_is_unhandled() {
        assert_eq!(parse_command("/nope"), Command::Unhandled("/nope".to_string()));
    }
}
