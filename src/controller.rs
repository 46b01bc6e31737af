// vim: noet

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::brightness::{self, BrightnessLaw};
use crate::capture::{CaptureError, CaptureSource};
use crate::config::Config;
use crate::wled::{DispatchError, Dispatcher};

// longest uninterrupted sleep, so a stop request is noticed even with long delays
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState
{
	Init,
	Running,
	Stopping,
	Terminated,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopStats
{
	pub cycles:            u64,
	pub short_reads:       u64,
	pub dispatch_failures: u64,
	pub overruns:          usize,
}

/// Result of a single pass through the control law and the dispatcher.
#[derive(Debug)]
pub struct Cycle
{
	pub amplitude:  f64,
	pub brightness: u8,
	pub dispatched: Result<(), DispatchError>,
}

pub struct Controller
{
	law:       BrightnessLaw,
	block_len: usize,
	delay:     Duration,
	stop:      Arc<AtomicBool>,
	state:     LoopState,
}

impl Controller
{
	pub fn new(config: &Config, delay: Duration, stop: Arc<AtomicBool>) -> Controller
	{
		Controller {
			law: BrightnessLaw::from_config(config),
			block_len: config.block_len,
			delay,
			stop,
			state: LoopState::Init,
		}
	}

	pub fn state(&self) -> LoopState
	{
		self.state
	}

	fn stop_requested(&self) -> bool
	{
		self.stop.load(Ordering::SeqCst)
	}

	/// Compute the new brightness for one block and push it out.
	pub fn cycle<D>(&self, previous: u8, block: &[i16], dispatcher: &mut D) -> Cycle
		where D: Dispatcher + ?Sized
	{
		let amplitude = brightness::amplitude(block);
		let brightness = self.law.step(previous, amplitude);

		Cycle {
			amplitude,
			brightness,
			dispatched: dispatcher.send(brightness),
		}
	}

	fn sleep(&self)
	{
		let deadline = Instant::now() + self.delay;

		loop {
			let now = Instant::now();
			if now >= deadline || self.stop_requested() {
				return;
			}
			thread::sleep((deadline - now).min(MAX_SLEEP_SLICE));
		}
	}

	/// Run until a stop is requested or the source ends. The source is closed on every exit
	/// path, including a failed read.
	pub fn run<S, D>(&mut self, source: &mut S, dispatcher: &mut D) -> Result<LoopStats, CaptureError>
		where S: CaptureSource + ?Sized, D: Dispatcher + ?Sized
	{
		let mut stats = LoopStats::default();
		let mut block = vec![0i16; self.block_len];
		let mut brightness = 0u8;

		self.state = LoopState::Running;
		debug!("Control loop running: block of {} samples, delay {:?}, max decay {} per cycle",
			self.block_len, self.delay, self.law.decay_step());

		let result = loop {
			if self.stop_requested() {
				info!("Stop requested, leaving control loop");
				break Ok(());
			}

			let n = match source.read_block(&mut block) {
				Ok(Some(n)) => n,
				Ok(None) => {
					info!("Audio input ended");
					break Ok(());
				},
				Err(e) => break Err(e),
			};

			// the interrupt may have arrived while blocked in the read
			if self.stop_requested() {
				info!("Stop requested, leaving control loop");
				break Ok(());
			}

			if n < block.len() {
				stats.short_reads += 1;
			}

			let cycle = self.cycle(brightness, &block[..n], dispatcher);
			brightness = cycle.brightness;

			if let Err(e) = cycle.dispatched {
				stats.dispatch_failures += 1;
				warn!("Error setting brightness: {}", e);
			}

			debug!("Amplitude: {:.1}, Brightness: {}", cycle.amplitude, brightness);
			stats.cycles += 1;

			self.sleep();
		};

		self.state = LoopState::Stopping;
		stats.overruns = source.overruns();
		source.close();
		self.state = LoopState::Terminated;

		info!("Control loop finished after {} cycles ({} failed updates, {} short reads, {} samples dropped)",
			stats.cycles, stats.dispatch_failures, stats.short_reads, stats.overruns);

		result.map(|()| stats)
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	use std::cell::Cell;
	use std::collections::VecDeque;
	use std::rc::Rc;

	struct MockSource
	{
		blocks:      VecDeque<Vec<i16>>,
		repeat:      Option<Vec<i16>>,
		reads:       usize,
		stop_after:  Option<(usize, Arc<AtomicBool>)>,
		fail_after:  Option<usize>,
		open:        bool,
		releases:    Rc<Cell<usize>>,
	}

	impl MockSource
	{
		fn new(blocks: Vec<Vec<i16>>, releases: Rc<Cell<usize>>) -> MockSource
		{
			MockSource {
				blocks: blocks.into(),
				repeat: None,
				reads: 0,
				stop_after: None,
				fail_after: None,
				open: true,
				releases,
			}
		}
	}

	impl CaptureSource for MockSource
	{
		fn sample_rate(&self) -> u32
		{
			48000
		}

		fn read_block(&mut self, block: &mut [i16]) -> Result<Option<usize>, CaptureError>
		{
			self.reads += 1;

			if let Some((n, stop)) = &self.stop_after {
				if self.reads > *n {
					stop.store(true, Ordering::SeqCst);
				}
			}

			if let Some(n) = self.fail_after {
				if self.reads > n {
					return Err(CaptureError::Io(std::io::Error::new(std::io::ErrorKind::Other, "device gone")));
				}
			}

			let next = self.blocks.pop_front().or_else(|| self.repeat.clone());
			match next {
				Some(data) => {
					let n = data.len().min(block.len());
					block[..n].copy_from_slice(&data[..n]);
					Ok(Some(n))
				},
				None => Ok(None),
			}
		}

		fn overruns(&self) -> usize
		{
			7
		}

		fn close(&mut self)
		{
			if self.open {
				self.open = false;
				self.releases.set(self.releases.get() + 1);
			}
		}
	}

	impl Drop for MockSource
	{
		fn drop(&mut self)
		{
			self.close();
		}
	}

	#[derive(Default)]
	struct MockDispatcher
	{
		sent:   Vec<u8>,
		failing: bool,
	}

	impl Dispatcher for MockDispatcher
	{
		fn send(&mut self, brightness: u8) -> Result<(), DispatchError>
		{
			self.sent.push(brightness);
			if self.failing {
				Err(DispatchError::Status(503))
			} else {
				Ok(())
			}
		}
	}

	fn controller(stop: &Arc<AtomicBool>) -> Controller
	{
		Controller::new(&Config::default(), Duration::ZERO, stop.clone())
	}

	#[test]
	fn loud_then_quiet_rises_instantly_and_decays()
	{
		let releases = Rc::new(Cell::new(0));
		let stop = Arc::new(AtomicBool::new(false));
		let mut source = MockSource::new(vec![vec![i16::MAX; 24], vec![0; 24], vec![0; 24]], releases.clone());
		let mut dispatcher = MockDispatcher::default();

		let mut ctrl = controller(&stop);
		assert_eq!(ctrl.state(), LoopState::Init);

		let stats = ctrl.run(&mut source, &mut dispatcher).unwrap();

		assert_eq!(dispatcher.sent, vec![255, 26, 0]);
		assert_eq!(stats.cycles, 3);
		assert_eq!(stats.dispatch_failures, 0);
		assert_eq!(stats.overruns, 7);
		assert_eq!(ctrl.state(), LoopState::Terminated);
		assert_eq!(releases.get(), 1);
	}

	#[test]
	fn dispatch_failures_do_not_stop_the_loop()
	{
		let releases = Rc::new(Cell::new(0));
		let stop = Arc::new(AtomicBool::new(false));
		let mut source = MockSource::new(vec![vec![1000; 24]; 5], releases.clone());
		let mut dispatcher = MockDispatcher { failing: true, ..Default::default() };

		let stats = controller(&stop).run(&mut source, &mut dispatcher).unwrap();

		assert_eq!(stats.cycles, 5);
		assert_eq!(stats.dispatch_failures, 5);
		assert_eq!(dispatcher.sent.len(), 5);
	}

	#[test]
	fn interrupt_releases_capture_exactly_once()
	{
		let releases = Rc::new(Cell::new(0));
		let stop = Arc::new(AtomicBool::new(false));

		{
			let mut source = MockSource::new(Vec::new(), releases.clone());
			source.repeat = Some(vec![20000; 24]);
			source.stop_after = Some((4, stop.clone()));

			let mut dispatcher = MockDispatcher::default();
			let mut ctrl = controller(&stop);
			let stats = ctrl.run(&mut source, &mut dispatcher).unwrap();

			assert_eq!(stats.cycles, 4);
			assert_eq!(ctrl.state(), LoopState::Terminated);
			assert_eq!(releases.get(), 1);
		}

		// dropping the closed source must not release it a second time
		assert_eq!(releases.get(), 1);
	}

	#[test]
	fn stop_before_start_runs_no_cycles()
	{
		let releases = Rc::new(Cell::new(0));
		let stop = Arc::new(AtomicBool::new(true));
		let mut source = MockSource::new(vec![vec![1; 24]], releases.clone());
		let mut dispatcher = MockDispatcher::default();

		let stats = controller(&stop).run(&mut source, &mut dispatcher).unwrap();

		assert_eq!(stats.cycles, 0);
		assert!(dispatcher.sent.is_empty());
		assert_eq!(releases.get(), 1);
	}

	#[test]
	fn read_error_propagates_after_cleanup()
	{
		let releases = Rc::new(Cell::new(0));
		let stop = Arc::new(AtomicBool::new(false));
		let mut source = MockSource::new(vec![vec![1; 24]; 10], releases.clone());
		source.fail_after = Some(2);
		let mut dispatcher = MockDispatcher::default();

		let mut ctrl = controller(&stop);
		let res = ctrl.run(&mut source, &mut dispatcher);

		assert!(matches!(res, Err(CaptureError::Io(_))));
		assert_eq!(dispatcher.sent.len(), 2);
		assert_eq!(ctrl.state(), LoopState::Terminated);
		assert_eq!(releases.get(), 1);
	}

	#[test]
	fn short_reads_are_counted_and_used()
	{
		let releases = Rc::new(Cell::new(0));
		let stop = Arc::new(AtomicBool::new(false));
		let mut source = MockSource::new(vec![vec![i16::MAX; 10], Vec::new()], releases.clone());
		let mut dispatcher = MockDispatcher::default();

		let stats = controller(&stop).run(&mut source, &mut dispatcher).unwrap();

		assert_eq!(stats.short_reads, 2);
		// an empty read counts as silence
		assert_eq!(dispatcher.sent, vec![255, 26]);
	}

	#[test]
	fn single_cycle_reports_dispatch_outcome()
	{
		let stop = Arc::new(AtomicBool::new(false));
		let ctrl = controller(&stop);
		let mut dispatcher = MockDispatcher { failing: true, ..Default::default() };

		let cycle = ctrl.cycle(200, &[16000; 24], &mut dispatcher);

		assert_eq!(cycle.amplitude, 16000.0);
		assert_eq!(cycle.brightness, 124);
		assert!(matches!(cycle.dispatched, Err(DispatchError::Status(503))));
	}

	#[test]
	fn sleep_honours_delay_and_stop()
	{
		let stop = Arc::new(AtomicBool::new(false));
		let ctrl = Controller::new(&Config::default(), Duration::from_millis(20), stop.clone());

		let start = Instant::now();
		ctrl.sleep();
		assert!(start.elapsed() >= Duration::from_millis(20));

		let long = Controller::new(&Config::default(), Duration::from_secs(60), stop.clone());
		stop.store(true, Ordering::SeqCst);
		let start = Instant::now();
		long.sleep();
		assert!(start.elapsed() < Duration::from_secs(1));
	}
}
