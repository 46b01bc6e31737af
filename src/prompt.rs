// vim: noet

/*
 * Startup questions to the operator. Answers are parsed strictly, anything unparsable aborts
 * instead of falling back to a default.
 */

use std::io::{BufRead, Write};
use std::time::Duration;

use thiserror::Error;

use crate::capture::DeviceInfo;

#[derive(Error, Debug)]
pub enum PromptError
{
	#[error("failed to read answer: {0}")]
	Io(#[from] std::io::Error),
	#[error("no answer given (end of input)")]
	NoAnswer,
	#[error("'{0}' is not a valid device index")]
	InvalidIndex(String),
	#[error("'{0}' is not a valid delay in seconds")]
	InvalidDelay(String),
}

pub fn print_devices<W: Write>(out: &mut W, devices: &[DeviceInfo]) -> std::io::Result<()>
{
	writeln!(out, "Available audio input devices:")?;
	for dev in devices {
		writeln!(out, "{}: {}", dev.index, dev.name)?;
	}
	Ok(())
}

fn ask<R: BufRead, W: Write>(input: &mut R, out: &mut W, question: &str) -> Result<String, PromptError>
{
	write!(out, "{}", question)?;
	out.flush()?;

	let mut line = String::new();
	if input.read_line(&mut line)? == 0 {
		return Err(PromptError::NoAnswer);
	}

	Ok(line.trim().to_string())
}

pub fn parse_device_index(s: &str) -> Result<usize, PromptError>
{
	s.trim().parse::<usize>().map_err(|_| PromptError::InvalidIndex(s.trim().to_string()))
}

pub fn parse_delay(s: &str) -> Result<Duration, PromptError>
{
	let secs = s.trim().parse::<f64>().map_err(|_| PromptError::InvalidDelay(s.trim().to_string()))?;

	Duration::try_from_secs_f64(secs).map_err(|_| PromptError::InvalidDelay(s.trim().to_string()))
}

pub fn ask_device_index<R: BufRead, W: Write>(input: &mut R, out: &mut W) -> Result<usize, PromptError>
{
	let answer = ask(input, out, "Enter the index of the microphone to use: ")?;
	parse_device_index(&answer)
}

pub fn ask_delay<R: BufRead, W: Write>(input: &mut R, out: &mut W) -> Result<Duration, PromptError>
{
	let answer = ask(input, out, "Enter delay between LED updates in seconds (e.g., 0.05): ")?;
	parse_delay(&answer)
}
