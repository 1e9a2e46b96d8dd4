//! Configuration types for the CoAP observe server
//!
//! This module defines all configuration structures used throughout the crate.
//! Every field has a serde default, so a partial JSON document is enough.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::message::BlockOption;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the UDP socket to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// UDP port to bind to
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Confirmable-message retransmission settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    /// Blockwise transfer settings
    #[serde(default)]
    pub blockwise: BlockwiseConfig,

    /// Exchange correlation settings
    #[serde(default)]
    pub matcher: MatcherConfig,

    /// Server loop settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl ServerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            reliability: ReliabilityConfig::default(),
            blockwise: BlockwiseConfig::default(),
            matcher: MatcherConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Parse a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self, crate::Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.bind_host
            .parse::<IpAddr>()
            .map_err(|_| crate::Error::config(format!("bind_host '{}' is not an IP address", self.bind_host)))?;

        self.reliability.validate()?;
        self.blockwise.validate()?;

        if self.matcher.exchange_capacity == 0 {
            return Err(crate::Error::config("matcher.exchange_capacity must be > 0"));
        }
        if self.engine.event_channel_capacity == 0 {
            return Err(crate::Error::config("engine.event_channel_capacity must be > 0"));
        }

        Ok(())
    }

    /// Socket address to bind
    pub fn bind_addr(&self) -> Result<SocketAddr, crate::Error> {
        let ip: IpAddr = self
            .bind_host
            .parse()
            .map_err(|_| crate::Error::config(format!("bind_host '{}' is not an IP address", self.bind_host)))?;
        Ok(SocketAddr::new(ip, self.bind_port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Retransmission settings (RFC 7252 §4.8)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Initial acknowledgement timeout in milliseconds
    ///
    /// The timeout doubles after every retransmission.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Retransmissions before giving up on a confirmable message
    #[serde(default = "default_max_retransmit")]
    pub max_retransmit: u32,
}

impl ReliabilityConfig {
    /// Initial acknowledgement timeout
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.ack_timeout_ms == 0 {
            return Err(crate::Error::config("reliability.ack_timeout_ms must be > 0"));
        }
        if self.max_retransmit > 10 {
            return Err(crate::Error::config(format!(
                "reliability.max_retransmit must be at most 10, got {}",
                self.max_retransmit
            )));
        }
        Ok(())
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retransmit: default_max_retransmit(),
        }
    }
}

/// Blockwise transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockwiseConfig {
    /// Largest block the server sends, in bytes
    ///
    /// Must be a power of two between 16 and 1024.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    /// Largest request body accepted through Block1 reassembly, in bytes
    ///
    /// Larger uploads are refused with 4.13 Request Entity Too Large.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Block1 uploads reassembled at the same time
    ///
    /// The oldest upload is abandoned once the table is full.
    #[serde(default = "default_upload_capacity")]
    pub upload_capacity: usize,
}

impl BlockwiseConfig {
    /// Size exponent of `max_block_size`
    pub fn szx(&self) -> Option<u8> {
        BlockOption::szx_for(self.max_block_size)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.szx().is_none() {
            return Err(crate::Error::config(format!(
                "blockwise.max_block_size must be a power of two in 16..=1024, got {}",
                self.max_block_size
            )));
        }
        if self.max_body_size < self.max_block_size {
            return Err(crate::Error::config(format!(
                "blockwise.max_body_size must be at least max_block_size ({}), got {}",
                self.max_block_size, self.max_body_size
            )));
        }
        if self.upload_capacity == 0 {
            return Err(crate::Error::config("blockwise.upload_capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for BlockwiseConfig {
    fn default() -> Self {
        Self {
            max_block_size: default_max_block_size(),
            max_body_size: default_max_body_size(),
            upload_capacity: default_upload_capacity(),
        }
    }
}

/// Exchange correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Outbound exchanges remembered for ACK/RST correlation
    ///
    /// The oldest exchange is forgotten once the table is full.
    #[serde(default = "default_exchange_capacity")]
    pub exchange_capacity: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            exchange_capacity: default_exchange_capacity(),
        }
    }
}

/// Server loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the server event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    5683
}

fn default_ack_timeout_ms() -> u64 {
    2000
}

fn default_max_retransmit() -> u32 {
    4
}

fn default_max_block_size() -> usize {
    1024
}

fn default_max_body_size() -> usize {
    64 * 1024
}

fn default_upload_capacity() -> usize {
    64
}

fn default_exchange_capacity() -> usize {
    1024
}

fn default_event_channel_capacity() -> usize {
    1000
}
