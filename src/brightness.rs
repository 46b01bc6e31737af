// vim: noet

/*
 * The control law: map block amplitude to LED brightness. Brightness follows
 * rising amplitude instantly but may only fall by a fixed step per cycle.
 */

use crate::config::{self, Config};

/// Mean absolute sample value of a block. An empty block is silent.
pub fn amplitude(block: &[i16]) -> f64
{
	if block.is_empty() {
		return 0.0;
	}

	let sum: u64 = block.iter()
	                    .map(|&s| s.unsigned_abs().min(i16::MAX as u16) as u64)
	                    .sum();

	sum as f64 / block.len() as f64
}

/// Linear interpolation from `[in_lo, in_hi]` to `[out_lo, out_hi]`, clamped to the output
/// range instead of extrapolating.
pub fn linear_interp(x: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64
{
	if x <= in_lo {
		out_lo
	} else if x >= in_hi {
		out_hi
	} else {
		let slope = (out_hi - out_lo) / (in_hi - in_lo);
		slope * (x - in_lo) + out_lo
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrightnessLaw
{
	threshold:  f64,
	min:        u8,
	max:        u8,
	decay_step: i32,
}

impl BrightnessLaw
{
	pub fn new(threshold: f64, min: u8, max: u8, decay_rate: f64) -> BrightnessLaw
	{
		BrightnessLaw {
			threshold,
			min,
			max,
			decay_step: (decay_rate * max as f64).floor() as i32,
		}
	}

	pub fn from_config(config: &Config) -> BrightnessLaw
	{
		BrightnessLaw::new(config.threshold, config.min_brightness, config.max_brightness, config.decay_rate)
	}

	/// Largest drop in brightness allowed within one cycle.
	pub fn decay_step(&self) -> i32
	{
		self.decay_step
	}

	pub fn target(&self, amplitude: f64) -> u8
	{
		if amplitude < self.threshold {
			return 0;
		}

		let t = linear_interp(amplitude, self.threshold, config::MAX_AMPLITUDE,
		                      self.min as f64, self.max as f64);

		// truncate like an integer cast, the range is already clamped
		t as u8
	}

	pub fn next(&self, previous: u8, target: u8) -> u8
	{
		let decay_floor = previous as i32 - self.decay_step;
		let new = decay_floor.max(target as i32).max(0);

		new.min(u8::MAX as i32) as u8
	}

	/// One full cycle of the control law.
	pub fn step(&self, previous: u8, amplitude: f64) -> u8
	{
		self.next(previous, self.target(amplitude))
	}
}
