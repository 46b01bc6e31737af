// vim: noet

use std::io;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

mod brightness;
mod capture;
mod config;
mod controller;
mod logging;
mod prompt;
mod wled;

use crate::capture::{CaptureSource, DeviceCapture, RawPcmCapture};
use crate::config::Config;
use crate::controller::Controller;
use crate::wled::WledClient;

/// Drive the brightness of a WLED strip from live audio amplitude.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args
{
	/// Path to a TOML config file
	#[arg(long)]
	config: Option<PathBuf>,

	/// Controller address (host or host:port), overrides the config file
	#[arg(long)]
	controller: Option<String>,

	/// Input device index, skips the prompt
	#[arg(long)]
	device: Option<usize>,

	/// Delay between LED updates in seconds, skips the prompt
	#[arg(long, value_parser = parse_delay_arg)]
	delay: Option<Duration>,

	/// Read raw native-endian mono i16 samples at this rate from stdin instead of a device
	#[arg(long, value_name = "HZ")]
	stdin_rate: Option<u32>,

	/// List input devices and exit
	#[arg(long, default_value_t = false)]
	list_devices: bool,

	/// Verbose per-cycle logging
	#[arg(long, default_value_t = false)]
	debug: bool,
}

fn parse_delay_arg(s: &str) -> std::result::Result<Duration, String>
{
	prompt::parse_delay(s).map_err(|e| e.to_string())
}

fn load_config(args: &Args) -> Result<Config>
{
	let mut config = match &args.config {
		Some(path) => Config::load(path).with_context(|| format!("loading config from {}", path.display()))?,
		None       => Config::default(),
	};

	if let Some(controller) = &args.controller {
		config.controller = controller.clone();
	}
	config.debug |= args.debug;

	config.validate()?;
	Ok(config)
}

fn open_source(args: &Args, config: &Config) -> Result<(Box<dyn CaptureSource>, Duration)>
{
	let stdin = io::stdin();
	let mut stdout = io::stdout();

	if let Some(rate) = args.stdin_rate {
		// stdin carries the audio, so nothing can be asked interactively
		let delay = args.delay.unwrap_or(Duration::ZERO);
		info!("Reading raw PCM from stdin at {} Hz", rate);
		return Ok((Box::new(RawPcmCapture::new(stdin, rate)), delay));
	}

	let devices = capture::list_input_devices()?;
	prompt::print_devices(&mut stdout, &devices)?;

	let index = match args.device {
		Some(i) => i,
		None    => prompt::ask_device_index(&mut stdin.lock(), &mut stdout)?,
	};
	let delay = match args.delay {
		Some(d) => d,
		None    => prompt::ask_delay(&mut stdin.lock(), &mut stdout)?,
	};

	let source = DeviceCapture::open(index, config.block_len)
		.with_context(|| format!("opening input device {}", index))?;
	info!("Using input device {}: '{}' at {} Hz", index, source.name(), source.sample_rate());

	Ok((Box::new(source), delay))
}

/// From here on Ctrl-C only asks the control loop to stop, so the capture device is closed
/// before exiting.
fn install_stop_handler() -> Result<Arc<AtomicBool>>
{
	let stop = Arc::new(AtomicBool::new(false));
	let stop_for_handler = stop.clone();

	ctrlc::set_handler(move || {
		stop_for_handler.store(true, Ordering::SeqCst);
	}).context("installing Ctrl-C handler")?;

	Ok(stop)
}

fn run(args: Args) -> Result<()>
{
	let config = load_config(&args)?;
	logging::init(config.debug);

	if args.list_devices {
		let devices = capture::list_input_devices()?;
		prompt::print_devices(&mut io::stdout(), &devices)?;
		return Ok(());
	}

	// Ctrl-C keeps its default behaviour during the prompts and while the device opens
	let (mut source, delay) = open_source(&args, &config)?;

	let mut client = WledClient::new(&config)?;
	info!("Sending brightness to {} every {:?}", client.url(), delay);

	let stop = install_stop_handler()?;

	let mut ctrl = Controller::new(&config, delay, stop);
	ctrl.run(source.as_mut(), &mut client)?;
	debug!("Controller state: {:?}", ctrl.state());

	println!("\nExiting...");
	Ok(())
}

fn main()
{
	let args = Args::parse();

	if let Err(e) = run(args) {
		eprintln!("Error: {:#}", e);
		exit(1);
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn startup_flags_skip_prompts()
	{
		let args = Args::parse_from(["wledpulse", "--device", "2", "--delay", "0.05", "--controller", "wled.local"]);
		assert_eq!(args.device, Some(2));
		assert_eq!(args.delay, Some(Duration::from_millis(50)));

		let config = load_config(&args).unwrap();
		assert_eq!(config.controller, "wled.local");
	}

	#[test]
	fn bad_delay_flag_is_rejected()
	{
		assert!(Args::try_parse_from(["wledpulse", "--delay", "-1"]).is_err());
	}

	#[test]
	fn stop_handler_starts_unset()
	{
		let stop = install_stop_handler().unwrap();
		assert!(!stop.load(Ordering::SeqCst));
	}
}
