//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`SPI_NEGO_*`)
//!
//! ```toml
//! [adapter]
//! host_id = 7
//! bus = "lvd"
//! max_rate = { period = 0x08, offset = 0x7f, wide = true, options = ["packetized", "dual-edge", "quick-arb"] }
//!
//! [negotiation]
//! enable_ppr = true
//! limit_u160_offset = false
//!
//! [[targets]]
//! id = 3
//! max_rate = { period = 0x0a, offset = 0x20, wide = true }
//! bus = "single-ended"
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{NegotiationError, Result};
use crate::protocol::{
    BusClass, CapabilityTable, DeviceCapability, NegotiationPolicy, PprSupport, ProtocolOptions,
    RateRecord, StandardClipper, DEFAULT_BUS_FREE_POLL_LIMIT, DEFAULT_MAX_MESSAGE_EXCHANGES,
    MAX_TARGETS,
};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Host adapter configuration
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Negotiation behaviour
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// Per-target overrides
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| NegotiationError::Config(format!("Failed to read config file: {e}")))?;

        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("SPI_NEGO_HOST_ID") {
            if let Ok(id) = id.parse() {
                config.adapter.host_id = id;
            }
        }
        if let Ok(bus) = std::env::var("SPI_NEGO_BUS") {
            if let Ok(bus) = bus.parse() {
                config.adapter.bus = bus;
            }
        }

        if let Ok(val) = std::env::var("SPI_NEGO_ENABLE_PPR") {
            if let Ok(val) = val.parse() {
                config.negotiation.enable_ppr = val;
            }
        }
        if let Ok(val) = std::env::var("SPI_NEGO_LIMIT_U160_OFFSET") {
            if let Ok(val) = val.parse() {
                config.negotiation.limit_u160_offset = val;
            }
        }
        if let Ok(val) = std::env::var("SPI_NEGO_BUS_FREE_POLL_LIMIT") {
            if let Ok(val) = val.parse() {
                config.negotiation.bus_free_poll_limit = val;
            }
        }
        if let Ok(val) = std::env::var("SPI_NEGO_MAX_MESSAGE_EXCHANGES") {
            if let Ok(val) = val.parse() {
                config.negotiation.max_message_exchanges = val;
            }
        }

        config
    }

    /// Default config file location (`<config dir>/spi-nego/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("spi-nego").join("config.toml"))
    }

    /// Load from `path`, or the default location if it exists, with
    /// environment overrides applied on top.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };
        let config = base.merge(Self::from_env());
        config.validate()?;
        Ok(config)
    }

    /// Merge with another config (other takes precedence where it differs
    /// from the defaults)
    pub fn merge(self, other: Self) -> Self {
        let adapter_default = AdapterConfig::default();
        let nego_default = NegotiationConfig::default();
        Self {
            adapter: AdapterConfig {
                host_id: if other.adapter.host_id != adapter_default.host_id {
                    other.adapter.host_id
                } else {
                    self.adapter.host_id
                },
                bus: if other.adapter.bus != adapter_default.bus {
                    other.adapter.bus
                } else {
                    self.adapter.bus
                },
                max_rate: if other.adapter.max_rate != adapter_default.max_rate {
                    other.adapter.max_rate
                } else {
                    self.adapter.max_rate
                },
            },
            negotiation: NegotiationConfig {
                enable_ppr: if other.negotiation.enable_ppr != nego_default.enable_ppr {
                    other.negotiation.enable_ppr
                } else {
                    self.negotiation.enable_ppr
                },
                limit_u160_offset: self.negotiation.limit_u160_offset
                    || other.negotiation.limit_u160_offset,
                bus_free_poll_limit: if other.negotiation.bus_free_poll_limit
                    != nego_default.bus_free_poll_limit
                {
                    other.negotiation.bus_free_poll_limit
                } else {
                    self.negotiation.bus_free_poll_limit
                },
                max_message_exchanges: if other.negotiation.max_message_exchanges
                    != nego_default.max_message_exchanges
                {
                    other.negotiation.max_message_exchanges
                } else {
                    self.negotiation.max_message_exchanges
                },
            },
            targets: if other.targets.is_empty() {
                self.targets
            } else {
                other.targets
            },
        }
    }

    /// Check ids and rates.
    pub fn validate(&self) -> Result<()> {
        let host = self.adapter.host_id;
        if host as usize >= MAX_TARGETS {
            return Err(NegotiationError::Config(format!(
                "Host id {host} out of range (0..{MAX_TARGETS})"
            )));
        }
        if !self.adapter.max_rate.is_valid() {
            return Err(NegotiationError::Config(format!(
                "Adapter max_rate {} is not a valid rate",
                self.adapter.max_rate
            )));
        }
        if self.negotiation.bus_free_poll_limit == 0 {
            return Err(NegotiationError::Config(
                "bus_free_poll_limit must be at least 1".to_string(),
            ));
        }
        if self.negotiation.max_message_exchanges == 0 {
            return Err(NegotiationError::Config(
                "max_message_exchanges must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.id as usize >= MAX_TARGETS {
                return Err(NegotiationError::InvalidTarget(target.id));
            }
            if target.id == host {
                return Err(NegotiationError::Config(format!(
                    "Target {} is the host adapter's own id",
                    target.id
                )));
            }
            if !seen.insert(target.id) {
                return Err(NegotiationError::Config(format!(
                    "Target {} configured twice",
                    target.id
                )));
            }
            if let Some(rate) = target.max_rate {
                if !rate.is_valid() {
                    return Err(NegotiationError::Config(format!(
                        "Target {} max_rate {} is not a valid rate",
                        target.id, rate
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the per-target capability table.
    pub fn to_capability_table(&self) -> Result<CapabilityTable> {
        self.validate()?;

        let ppr = if self.negotiation.enable_ppr {
            PprSupport::Configured
        } else {
            PprSupport::Disabled
        };
        let template = DeviceCapability::new(self.adapter.max_rate)
            .with_bus(self.adapter.bus)
            .with_ppr(ppr);
        let mut table = CapabilityTable::new(template).with_clipper(StandardClipper {
            limit_u160_offset: self.negotiation.limit_u160_offset,
        });

        let host = self.adapter.host_id;
        let own = table.get(host)?.clone().suppressed();
        table.set(host, own)?;

        for target in &self.targets {
            let mut device = table.get(target.id)?.clone();
            if let Some(rate) = target.max_rate {
                device = device.with_configured_default(rate);
            }
            if let Some(bus) = target.bus {
                device = device.with_bus(bus);
            }
            if target.disable_ppr {
                device = device.with_ppr(PprSupport::Disabled);
            }
            if target.suppress_negotiation {
                device = device.suppressed();
            }
            table.set(target.id, device)?;
        }
        Ok(table)
    }

    /// Limits for the negotiator
    pub fn policy(&self) -> NegotiationPolicy {
        NegotiationPolicy {
            bus_free_poll_limit: self.negotiation.bus_free_poll_limit,
            max_message_exchanges: self.negotiation.max_message_exchanges,
        }
    }
}

/// Host adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// The adapter's own SCSI id
    pub host_id: u8,

    /// Electrical class of the adapter's bus
    pub bus: BusClass,

    /// Fastest rate the adapter silicon supports
    pub max_rate: RateRecord,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            host_id: 7,
            bus: BusClass::Lvd,
            max_rate: ultra320(),
        }
    }
}

/// Ultra320: paced, packetized, wide, offset 127.
pub fn ultra320() -> RateRecord {
    RateRecord::sync(0x08, 0x7f, true).with_options(ProtocolOptions::from_bits(
        ProtocolOptions::PACKETIZED
            | ProtocolOptions::DUAL_EDGE
            | ProtocolOptions::QUICK_ARB
            | ProtocolOptions::WRITE_FLOW
            | ProtocolOptions::READ_STREAM
            | ProtocolOptions::RETAIN_TRAINING,
    ))
}

/// Negotiation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Try PPR before WDTR/SDTR
    pub enable_ppr: bool,

    /// Cap the offset at U160 for devices that choke on large offsets
    pub limit_u160_offset: bool,

    /// `is_bus_free` polls after a packetized mode switch
    pub bus_free_poll_limit: u32,

    /// Message phases serviced per connection
    pub max_message_exchanges: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            enable_ppr: true,
            limit_u160_offset: false,
            bus_free_poll_limit: DEFAULT_BUS_FREE_POLL_LIMIT,
            max_message_exchanges: DEFAULT_MAX_MESSAGE_EXCHANGES,
        }
    }
}

/// Per-target configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target id
    pub id: u8,

    /// Ceiling for this target; the adapter maximum if unset
    #[serde(default)]
    pub max_rate: Option<RateRecord>,

    /// Bus class if it differs from the adapter's
    #[serde(default)]
    pub bus: Option<BusClass>,

    /// Never negotiate, run async narrow
    #[serde(default)]
    pub suppress_negotiation: bool,

    /// Never send PPR to this target
    #[serde(default)]
    pub disable_ppr: bool,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.adapter.host_id, 7);
        assert_eq!(config.adapter.max_rate, ultra320());
        assert!(config.negotiation.enable_ppr);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [adapter]
            host_id = 7
            max_rate = { period = 0x09, offset = 0x3f, wide = true, options = ["dual-edge"] }

            [negotiation]
            enable_ppr = false
            bus_free_poll_limit = 100

            [[targets]]
            id = 2
            max_rate = { period = 0x0c, offset = 0x10 }
            bus = "single-ended"

            [[targets]]
            id = 5
            suppress_negotiation = true
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.adapter.max_rate.period, 0x09);
        assert!(config.adapter.max_rate.is_dual_edge());
        assert!(!config.negotiation.enable_ppr);
        assert_eq!(config.negotiation.bus_free_poll_limit, 100);
        assert_eq!(
            config.negotiation.max_message_exchanges,
            DEFAULT_MAX_MESSAGE_EXCHANGES
        );
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].bus, Some(BusClass::SingleEnded));

        let table = config.to_capability_table().unwrap();
        let t2 = table.get(2).unwrap();
        assert_eq!(t2.configured_default, RateRecord::sync(0x0c, 0x10, false));
        assert_eq!(t2.bus, BusClass::SingleEnded);
        assert_eq!(t2.ppr, PprSupport::Disabled);
        assert!(table.get(5).unwrap().suppress_negotiation);
        assert!(table.get(7).unwrap().suppress_negotiation);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[negotiation]\nlimit_u160_offset = true").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(config.negotiation.limit_u160_offset);
        assert_eq!(config.adapter, AdapterConfig::default());
    }

    #[test]
    fn test_config_from_missing_file() {
        let err = Config::from_file("/nonexistent/spi-nego.toml").unwrap_err();
        assert!(matches!(err, NegotiationError::Config(_)));
    }

    #[test]
    fn test_config_from_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[adapter\nhost_id = 7").unwrap();

        match Config::from_file(file.path()) {
            Err(NegotiationError::Config(reason)) => {
                assert!(reason.starts_with("Failed to parse config"))
            },
            other => panic!("Expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_bad_targets() {
        let mut config = Config::default();
        config.targets.push(TargetConfig {
            id: 16,
            max_rate: None,
            bus: None,
            suppress_negotiation: false,
            disable_ppr: false,
        });
        assert!(matches!(
            config.validate(),
            Err(NegotiationError::InvalidTarget(16))
        ));

        config.targets[0].id = 7;
        assert!(config.validate().is_err());

        config.targets[0].id = 1;
        config.targets.push(config.targets[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unnormalized_rate() {
        let mut config = Config::default();
        // DT without wide is not a valid record
        config.adapter.max_rate = RateRecord::sync(0x09, 0x20, false)
            .with_options(ProtocolOptions::from_bits(ProtocolOptions::DUAL_EDGE));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_prefers_non_default() {
        let mut base = Config::default();
        base.negotiation.bus_free_poll_limit = 10;
        let mut over = Config::default();
        over.adapter.host_id = 15;

        let merged = base.merge(over);
        assert_eq!(merged.adapter.host_id, 15);
        assert_eq!(merged.negotiation.bus_free_poll_limit, 10);
    }

    #[test]
    fn test_policy() {
        let mut config = Config::default();
        config.negotiation.max_message_exchanges = 4;
        assert_eq!(config.policy().max_message_exchanges, 4);
        assert_eq!(
            config.policy().bus_free_poll_limit,
            DEFAULT_BUS_FREE_POLL_LIMIT
        );
    }
}
