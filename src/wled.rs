// vim: noet

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum DispatchError
{
	#[error("request to controller failed: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("controller answered with HTTP {0}")]
	Status(u16),
}

/// Something that can push a brightness value to the LEDs.
pub trait Dispatcher
{
	fn send(&mut self, brightness: u8) -> Result<(), DispatchError>;
}

#[derive(Serialize, Debug, PartialEq)]
struct Segment<'a>
{
	start: u16,
	stop:  u16,
	col:   &'a [[u8; 3]],
}

/// Body of a WLED `/json/state` update: strip on, one segment over all LEDs in the base color.
#[derive(Serialize, Debug, PartialEq)]
struct StateUpdate<'a>
{
	on:  bool,
	bri: u8,
	seg: [Segment<'a>; 1],
}

pub struct WledClient
{
	client:   reqwest::blocking::Client,
	url:      String,
	num_leds: u16,
	colors:   [[u8; 3]; 1],
}

impl WledClient
{
	pub fn new(config: &Config) -> Result<WledClient, DispatchError>
	{
		// the controller lives on the local network, never route it through a proxy
		let client = reqwest::blocking::Client::builder()
			.no_proxy()
			.timeout(Duration::from_millis(config.http_timeout_ms))
			.build()?;

		Ok(WledClient {
			client,
			url: config.state_url(),
			num_leds: config.num_leds,
			colors: [config.color],
		})
	}

	pub fn url(&self) -> &str
	{
		&self.url
	}

	fn state_update(&self, brightness: u8) -> StateUpdate<'_>
	{
		StateUpdate {
			on: true,
			bri: brightness,
			seg: [Segment { start: 0, stop: self.num_leds, col: &self.colors }],
		}
	}
}

impl Dispatcher for WledClient
{
	fn send(&mut self, brightness: u8) -> Result<(), DispatchError>
	{
		let resp = self.client.post(&self.url)
		                      .json(&self.state_update(brightness))
		                      .send()?;

		let status = resp.status();
		if !status.is_success() {
			return Err(DispatchError::Status(status.as_u16()));
		}

		trace!("Set brightness to {}", brightness);
		Ok(())
	}
}
