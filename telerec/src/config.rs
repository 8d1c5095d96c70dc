//! Server configuration: tuners, channels and the capture command.
//!
//! The configuration file is the authoritative source for which tuners can
//! serve which channel, and on which transponder. Everything the allocator
//! and the plan builder know about the hardware comes from here; the
//! channel list itself is immutable once loaded.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::text;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate channel name: {0}")]
    DuplicateChannel(String),

    #[error("channel {channel} references unknown tuner {tuner}")]
    UnknownTuner { channel: String, tuner: String },
}

/// Kind of service a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Tv,
    Radio,
}

/// Kind of tuner hardware. Digital tuners are preferred over analog ones
/// when both can serve a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunerKind {
    #[default]
    Digital,
    Analog,
}

/// A physical tuner known to the server.
#[derive(Debug, Clone, Deserialize)]
pub struct TunerEntry {
    pub name: String,
    #[serde(default)]
    pub kind: TunerKind,
}

/// How one tuner receives one channel.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEntry {
    pub tuner: String,
    /// Transponder (multiplex) identifier; 0 means unknown.
    pub transponder: u64,
    pub service_id: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A configured channel with the feeds that can receive it.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    #[serde(default)]
    pub kind: ChannelKind,
    pub preset: u32,
    #[serde(default)]
    pub feeds: Vec<FeedEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    pub database: Option<PathBuf>,
    pub recording_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureSection {
    /// External command started per capture. Placeholders `{tuner}`,
    /// `{channel}`, `{transponder}`, `{service_id}` and `{file}` are
    /// substituted before spawning.
    pub command: Option<String>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub capture: CaptureSection,
    #[serde(default)]
    pub tuners: Vec<TunerEntry>,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            let raw = text::raw_name(&channel.name);
            if !seen.insert(raw) {
                return Err(ConfigError::DuplicateChannel(channel.name.clone()));
            }

            for feed in &channel.feeds {
                if !self.tuners.iter().any(|t| t.name == feed.tuner) {
                    return Err(ConfigError::UnknownTuner {
                        channel: channel.name.clone(),
                        tuner: feed.tuner.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A channel as seen by the scheduler: identity is the raw name.
#[derive(Debug, Clone)]
pub struct Channel {
    pub raw_name: String,
    pub display_name: String,
    pub kind: ChannelKind,
    pub preset: u32,
}

/// One usable (tuner, transponder, service id) triple for a channel,
/// already filtered to enabled feeds on known tuners.
#[derive(Debug, Clone)]
pub struct Feed {
    pub tuner: String,
    pub transponder: u64,
    pub service_id: u64,
}

/// Derived lookup structure over the configuration.
///
/// Answers the questions the allocator and plan builder keep asking:
/// which tuners can serve a channel (in preference order), which
/// transponder a channel uses on a given tuner, and whether two channels
/// share a transponder there.
#[derive(Debug)]
pub struct ChannelMap {
    channels: Vec<Channel>,
    /// Tuner names in preference order (digital first, then declaration
    /// order); index is the tuner's priority rank.
    ranked_tuners: Vec<String>,
    /// Feeds per raw channel name, ordered by tuner rank.
    feeds: HashMap<String, Vec<Feed>>,
}

impl ChannelMap {
    pub fn new(config: &Config) -> Self {
        let mut ranked_tuners: Vec<String> = Vec::with_capacity(config.tuners.len());
        for tuner in config.tuners.iter().filter(|t| t.kind == TunerKind::Digital) {
            ranked_tuners.push(tuner.name.clone());
        }
        for tuner in config.tuners.iter().filter(|t| t.kind == TunerKind::Analog) {
            ranked_tuners.push(tuner.name.clone());
        }

        let rank_of = |name: &str| ranked_tuners.iter().position(|t| t == name);

        let mut channels = Vec::with_capacity(config.channels.len());
        let mut feeds: HashMap<String, Vec<Feed>> = HashMap::new();

        for entry in &config.channels {
            let raw = text::raw_name(&entry.name);
            if raw.is_empty() {
                warn!("Ignoring channel with empty raw name: {:?}", entry.name);
                continue;
            }

            let mut channel_feeds: Vec<(usize, Feed)> = entry
                .feeds
                .iter()
                .filter(|f| f.enabled)
                .filter_map(|f| {
                    rank_of(&f.tuner).map(|rank| {
                        (
                            rank,
                            Feed {
                                tuner: f.tuner.clone(),
                                transponder: f.transponder,
                                service_id: f.service_id,
                            },
                        )
                    })
                })
                .collect();
            channel_feeds.sort_by_key(|(rank, _)| *rank);

            channels.push(Channel {
                raw_name: raw.clone(),
                display_name: entry.name.clone(),
                kind: entry.kind,
                preset: entry.preset,
            });
            feeds.insert(raw, channel_feeds.into_iter().map(|(_, f)| f).collect());
        }

        Self {
            channels,
            ranked_tuners,
            feeds,
        }
    }

    /// All configured channels.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Display name for a raw channel name, if configured.
    pub fn display_name(&self, raw_channel: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|c| c.raw_name == raw_channel)
            .map(|c| c.display_name.as_str())
    }

    /// Tuner names in preference order.
    pub fn ranked_tuners(&self) -> &[String] {
        &self.ranked_tuners
    }

    /// Preference rank of a tuner; lower is tried first.
    pub fn tuner_rank(&self, tuner: &str) -> Option<usize> {
        self.ranked_tuners.iter().position(|t| t == tuner)
    }

    /// Usable feeds for a channel, in tuner preference order.
    pub fn feeds_for(&self, raw_channel: &str) -> &[Feed] {
        self.feeds
            .get(raw_channel)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The transponder `raw_channel` uses on `tuner`, if that tuner can
    /// serve it.
    pub fn transponder_for(&self, raw_channel: &str, tuner: &str) -> Option<u64> {
        self.feeds_for(raw_channel)
            .iter()
            .find(|f| f.tuner == tuner)
            .map(|f| f.transponder)
    }

    /// True when both channels map to the same non-zero transponder on
    /// `tuner`, meaning one physical capture covers both.
    pub fn share_transponder(&self, ch_a: &str, ch_b: &str, tuner: &str) -> bool {
        match (
            self.transponder_for(ch_a, tuner),
            self.transponder_for(ch_b, tuner),
        ) {
            (Some(a), Some(b)) => a == b && a != 0,
            _ => false,
        }
    }

    /// Raw channel names a tuner can serve.
    pub fn channels_for(&self, tuner: &str) -> HashSet<&str> {
        self.feeds
            .iter()
            .filter(|(_, feeds)| feeds.iter().any(|f| f.tuner == tuner))
            .map(|(raw, _)| raw.as_str())
            .collect()
    }

    /// Tuner order for the plan builder: most-constrained tuner first
    /// (fewest capable channels), ties broken by preference rank. A tuner
    /// that can only serve one channel gets to claim it before a flexible
    /// tuner sweeps the candidate pool.
    pub fn plan_tuner_order(&self) -> Vec<String> {
        let mut order: Vec<(usize, usize, String)> = self
            .ranked_tuners
            .iter()
            .enumerate()
            .map(|(rank, name)| (self.channels_for(name).len(), rank, name.clone()))
            .collect();
        order.sort();
        order.into_iter().map(|(_, _, name)| name).collect()
    }
}
