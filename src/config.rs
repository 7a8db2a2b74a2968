//! Configuration loading and validation.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::model::Source;

/// Root configuration, loaded from a YAML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub room: Vec<Room>,

    #[serde(default)]
    pub slack: SlackConfig,

    #[serde(default)]
    pub discord: DiscordConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub matrix: MatrixConfig,

    /// `"slackCode,otherCode"` emoji translation pairs.
    #[serde(default)]
    pub emoji: Vec<String>,
}

/// One bridged room: a set of platform channels mirroring each other.
#[derive(Debug, Clone, Deserialize)]
pub struct Room {
    pub name: String,
    #[serde(default)]
    pub chat: Vec<RoomChat>,
}

/// The channels one platform contributes to a room.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomChat {
    #[serde(rename = "type")]
    pub kind: Source,
    #[serde(rename = "chatID", default)]
    pub chat_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub token: String,
    #[serde(rename = "appLevelToken", default)]
    pub app_level_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatrixConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Fully-qualified Matrix id of the bridge account; when set it overrides
    /// the id reported by the login response.
    #[serde(default)]
    pub username: String,
    /// Directory where the client persists its sync position between runs.
    #[serde(rename = "storePath", alias = "cryptoStorePath", default)]
    pub store_path: String,
}

impl Config {
    /// Read and validate the configuration file. All errors here are fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(source),
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that credentials exist for every platform some room uses.
    pub fn validate(&self) -> Result<()> {
        if self.uses(Source::Slack)
            && (self.slack.token.is_empty() || self.slack.app_level_token.is_empty())
        {
            return Err(ConfigError::MissingCredentials("slack").into());
        }
        if self.uses(Source::Discord) && self.discord.token.is_empty() {
            return Err(ConfigError::MissingCredentials("discord").into());
        }
        if self.uses(Source::Telegram) && self.telegram.token.is_empty() {
            return Err(ConfigError::MissingCredentials("telegram").into());
        }
        if self.uses(Source::Matrix)
            && (self.matrix.host.is_empty()
                || self.matrix.user.is_empty()
                || self.matrix.password.is_empty())
        {
            return Err(ConfigError::MissingCredentials("matrix").into());
        }
        for room in &self.room {
            if room.name.is_empty() {
                return Err(ConfigError::Invalid("room with empty name".into()).into());
            }
        }
        Ok(())
    }

    /// Whether any configured room bridges the given platform.
    pub fn uses(&self, source: Source) -> bool {
        self.room
            .iter()
            .flat_map(|r| &r.chat)
            .any(|c| c.kind == source && !c.chat_ids.is_empty())
    }

    /// All channel ids configured for one platform, deduplicated, in
    /// declaration order. Used for the startup entity prefill.
    pub fn chat_ids(&self, source: Source) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut ids = Vec::new();
        for chat in self.room.iter().flat_map(|r| &r.chat) {
            if chat.kind != source {
                continue;
            }
            for id in &chat.chat_ids {
                if seen.insert(id.clone()) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const FULL: &str = indoc! {r#"
        room:
          - name: dev
            chat:
              - type: slack
                chatID: ["C0123"]
              - type: discord
                chatID: ["111", "222"]
          - name: ops
            chat:
              - type: discord
                chatID: ["222"]
        slack:
          token: xoxb-token
          appLevelToken: xapp-token
        discord:
          token: bot-token
        emoji:
          - "smile,:)"
    "#};

    #[test]
    fn parses_full_config() {
        let config: Config = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(config.room.len(), 2);
        assert_eq!(config.room[0].chat[0].kind, Source::Slack);
        assert_eq!(config.slack.app_level_token, "xapp-token");
        assert_eq!(config.emoji, vec!["smile,:)".to_string()]);
        config.validate().unwrap();
    }

    #[test]
    fn chat_ids_deduplicate_across_rooms() {
        let config: Config = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(config.chat_ids(Source::Discord), vec!["111", "222"]);
        assert_eq!(config.chat_ids(Source::Slack), vec!["C0123"]);
        assert!(config.chat_ids(Source::Matrix).is_empty());
    }

    #[test]
    fn missing_credentials_fail_validation() {
        let raw = indoc! {r#"
            room:
              - name: dev
                chat:
                  - type: telegram
                    chatID: ["-100200300"]
        "#};
        let config: Config = serde_yaml::from_str(raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("telegram"));
    }

    #[test]
    fn unused_platforms_need_no_credentials() {
        let raw = indoc! {r#"
            room:
              - name: dev
                chat:
                  - type: discord
                    chatID: ["111"]
            discord:
              token: bot-token
        "#};
        let config: Config = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn matrix_store_path_accepts_legacy_key() {
        let raw = indoc! {r#"
            matrix:
              host: https://matrix.example.org
              user: bridge
              password: hunter2
              cryptoStorePath: /var/lib/bridge
        "#};
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.matrix.store_path, "/var/lib/bridge");
    }

    #[test]
    fn unknown_platform_type_is_a_parse_error() {
        let raw = indoc! {r##"
            room:
              - name: dev
                chat:
                  - type: irc
                    chatID: ["#chan"]
        "##};
        assert!(serde_yaml::from_str::<Config>(raw).is_err());
    }
}
