// vim: noet

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

// audio definitions
pub const DEFAULT_BLOCK_LEN: usize = 24;
pub const MAX_AMPLITUDE:     f64   = 32767.0;

// LED configuration
pub const DEFAULT_NUM_LEDS:  u16       = 300;
pub const DEFAULT_COLOR:     [u8; 3]   = [255, 0, 255];

// brightness control
pub const DEFAULT_DECAY_RATE:     f64 = 0.9;
pub const DEFAULT_MIN_BRIGHTNESS: u8  = 0;
pub const DEFAULT_MAX_BRIGHTNESS: u8  = 255;

// network configuration
pub const DEFAULT_CONTROLLER_ADDR: &str = "10.0.0.192";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64  = 1000;

#[derive(Error, Debug)]
pub enum ConfigError
{
	#[error("failed to read config file: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to parse config file: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Everything the control loop needs to know, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config
{
	/// Host (and optional port) of the WLED controller.
	pub controller:      String,
	pub num_leds:        u16,
	pub color:           [u8; 3],

	pub block_len:       usize,

	/// Fraction of `max_brightness` the brightness may fall per cycle.
	pub decay_rate:      f64,
	pub min_brightness:  u8,
	pub max_brightness:  u8,

	/// Blocks with a lower mean amplitude switch the LEDs off. 0 disables this.
	pub threshold:       f64,

	pub http_timeout_ms: u64,
	pub debug:           bool,
}

impl Default for Config
{
	fn default() -> Config
	{
		Config {
			controller:      DEFAULT_CONTROLLER_ADDR.to_string(),
			num_leds:        DEFAULT_NUM_LEDS,
			color:           DEFAULT_COLOR,
			block_len:       DEFAULT_BLOCK_LEN,
			decay_rate:      DEFAULT_DECAY_RATE,
			min_brightness:  DEFAULT_MIN_BRIGHTNESS,
			max_brightness:  DEFAULT_MAX_BRIGHTNESS,
			threshold:       0.0,
			http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
			debug:           false,
		}
	}
}

impl Config
{
	pub fn from_toml_str(s: &str) -> Result<Config, ConfigError>
	{
		let config: Config = toml::from_str(s)?;
		config.validate()?;
		Ok(config)
	}

	pub fn load(path: &Path) -> Result<Config, ConfigError>
	{
		let content = fs::read_to_string(path)?;
		Config::from_toml_str(&content)
	}

	pub fn validate(&self) -> Result<(), ConfigError>
	{
		if self.controller.trim().is_empty() {
			return Err(ConfigError::Invalid("controller address is empty".to_string()));
		}

		if self.block_len == 0 {
			return Err(ConfigError::Invalid("block_len must be at least 1".to_string()));
		}

		if !(0.0..=1.0).contains(&self.decay_rate) {
			return Err(ConfigError::Invalid(format!("decay_rate {} is outside [0, 1]", self.decay_rate)));
		}

		if self.min_brightness > self.max_brightness {
			return Err(ConfigError::Invalid(format!("min_brightness {} exceeds max_brightness {}",
				self.min_brightness, self.max_brightness)));
		}

		// the interpolation range [threshold, MAX_AMPLITUDE] must not collapse
		if !self.threshold.is_finite() || self.threshold < 0.0 || self.threshold >= MAX_AMPLITUDE {
			return Err(ConfigError::Invalid(format!("threshold {} is outside [0, {})", self.threshold, MAX_AMPLITUDE)));
		}

		Ok(())
	}

	pub fn state_url(&self) -> String
	{
		format!("http://{}/json/state", self.controller)
	}
}
