// vim: noet

/*
 * Audio capture sources. A source hands out fixed-size blocks of mono i16 samples and owns
 * whatever resource produces them; `close()` releases that resource and is safe to call more
 * than once, dropping the source closes it as well.
 */

use std::io::{BufReader, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{NativeEndian, ReadBytesExt};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use thiserror::Error;
use tracing::{debug, info, warn};

// how long a read waits beyond one block duration before giving up on a full block
const READ_GRACE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum CaptureError
{
	#[error("failed to enumerate audio input devices: {0}")]
	Devices(#[from] cpal::DevicesError),
	#[error("no input device with index {index} ({available} available)")]
	InvalidSelection { index: usize, available: usize },
	#[error("failed to query the device's input configuration: {0}")]
	DefaultConfig(#[from] cpal::DefaultStreamConfigError),
	#[error("unsupported sample format {0:?}")]
	UnsupportedFormat(SampleFormat),
	#[error("failed to open input stream: {0}")]
	BuildStream(#[from] cpal::BuildStreamError),
	#[error("failed to start input stream: {0}")]
	PlayStream(#[from] cpal::PlayStreamError),
	#[error("failed to read samples: {0}")]
	Io(#[from] std::io::Error),
}

pub trait CaptureSource
{
	fn sample_rate(&self) -> u32;

	/// Best-effort blocking read of one block.
	///
	/// Returns `Ok(Some(n))` with the number of samples written to the front of `block`. `n`
	/// is smaller than `block.len()` when the source could not deliver a full block in time;
	/// samples lost to an overrun are dropped without an error. `Ok(None)` signals the end of
	/// the stream.
	fn read_block(&mut self, block: &mut [i16]) -> Result<Option<usize>, CaptureError>;

	/// Number of samples dropped so far because the consumer was too slow.
	fn overruns(&self) -> usize
	{
		0
	}

	/// Release the underlying capture resource. Idempotent.
	fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo
{
	pub index: usize,
	pub name:  String,
}

/// Enumerate the input devices of the default host, in the order used for selection.
pub fn list_input_devices() -> Result<Vec<DeviceInfo>, CaptureError>
{
	let host = cpal::default_host();

	let infos = host.input_devices()?
		.enumerate()
		.map(|(index, device)| DeviceInfo {
			index,
			name: device.name().unwrap_or_else(|_| "<unnamed device>".to_string()),
		})
		.collect();

	Ok(infos)
}

fn select<T>(items: Vec<T>, index: usize) -> Result<T, CaptureError>
{
	let available = items.len();
	items.into_iter()
	     .nth(index)
	     .ok_or(CaptureError::InvalidSelection { index, available })
}

/// Average all channels of one interleaved frame into a single i16 sample.
fn downmix_frame<T>(frame: &[T]) -> i16
	where T: Sample, i16: FromSample<T>
{
	if frame.is_empty() {
		return 0;
	}

	let sum: i32 = frame.iter().map(|&s| i16::from_sample(s) as i32).sum();
	(sum / frame.len() as i32) as i16
}

/// Live capture from a cpal input device. The stream callback pushes downmixed samples into a
/// ring buffer which `read_block` drains from the control loop.
pub struct DeviceCapture
{
	name:          String,
	sample_rate:   u32,

	stream:        Option<Stream>,
	consumer:      HeapConsumer<i16>,

	overruns:      Arc<AtomicUsize>,
	stream_errors: Arc<AtomicUsize>,
}

impl DeviceCapture
{
	/// Open input device `index` (as numbered by `list_input_devices`) at its native sample
	/// rate and start capturing.
	pub fn open(index: usize, block_len: usize) -> Result<DeviceCapture, CaptureError>
	{
		let host = cpal::default_host();
		let device = select(host.input_devices()?.collect(), index)?;
		let name = device.name().unwrap_or_else(|_| "<unnamed device>".to_string());

		let supported = device.default_input_config()?;
		let sample_format = supported.sample_format();
		let sample_rate = supported.sample_rate().0;

		let mut config: StreamConfig = supported.into();
		config.buffer_size = BufferSize::Default;

		// a quarter second of audio, but always room for a few blocks
		let capacity = (sample_rate as usize / 4).max(4 * block_len);
		let (producer, consumer) = HeapRb::<i16>::new(capacity).split();

		let overruns = Arc::new(AtomicUsize::new(0));
		let stream_errors = Arc::new(AtomicUsize::new(0));

		let stream = match sample_format {
			SampleFormat::I16 => build_stream::<i16>(&device, &config, producer, overruns.clone(), stream_errors.clone())?,
			SampleFormat::U16 => build_stream::<u16>(&device, &config, producer, overruns.clone(), stream_errors.clone())?,
			SampleFormat::I32 => build_stream::<i32>(&device, &config, producer, overruns.clone(), stream_errors.clone())?,
			SampleFormat::F32 => build_stream::<f32>(&device, &config, producer, overruns.clone(), stream_errors.clone())?,
			SampleFormat::F64 => build_stream::<f64>(&device, &config, producer, overruns.clone(), stream_errors.clone())?,
			format => return Err(CaptureError::UnsupportedFormat(format)),
		};

		stream.play()?;

		info!("Capturing from '{}': {} Hz, {} channel(s), {:?}",
			name, sample_rate, config.channels, sample_format);

		Ok(DeviceCapture {
			name,
			sample_rate,
			stream: Some(stream),
			consumer,
			overruns,
			stream_errors,
		})
	}

	pub fn name(&self) -> &str
	{
		&self.name
	}

	fn block_duration(&self, block_len: usize) -> Duration
	{
		Duration::from_secs_f64(block_len as f64 / self.sample_rate.max(1) as f64)
	}
}

fn build_stream<T>(device: &cpal::Device, config: &StreamConfig, mut producer: HeapProducer<i16>,
                   overruns: Arc<AtomicUsize>, stream_errors: Arc<AtomicUsize>) -> Result<Stream, CaptureError>
	where T: SizedSample, i16: FromSample<T>
{
	let channels = (config.channels as usize).max(1);

	let stream = device.build_input_stream(
		config,
		move |data: &[T], _: &cpal::InputCallbackInfo| {
			let mut dropped = 0;

			for frame in data.chunks(channels) {
				// ring full: the control loop is behind, drop the sample
				if producer.push(downmix_frame(frame)).is_err() {
					dropped += 1;
				}
			}

			if dropped > 0 {
				overruns.fetch_add(dropped, Ordering::Relaxed);
			}
		},
		move |err| {
			stream_errors.fetch_add(1, Ordering::Relaxed);
			warn!("Audio input stream error: {}", err);
		},
		None,
	)?;

	Ok(stream)
}

/// Wait until a full block is queued and copy the most recent `block.len()` samples, dropping
/// anything older. At `deadline` take whatever is queued instead, which may be nothing.
fn drain_freshest(consumer: &mut HeapConsumer<i16>, block: &mut [i16], deadline: Instant) -> usize
{
	loop {
		let queued = consumer.len();

		if queued >= block.len() {
			consumer.skip(queued - block.len());
			return consumer.pop_slice(block);
		}

		if Instant::now() >= deadline {
			return consumer.pop_slice(&mut block[..queued]);
		}

		thread::sleep(POLL_INTERVAL);
	}
}

impl CaptureSource for DeviceCapture
{
	fn sample_rate(&self) -> u32
	{
		self.sample_rate
	}

	fn read_block(&mut self, block: &mut [i16]) -> Result<Option<usize>, CaptureError>
	{
		if self.stream.is_none() {
			return Ok(None);
		}

		let deadline = Instant::now() + self.block_duration(block.len()) + READ_GRACE;
		let n = drain_freshest(&mut self.consumer, block, deadline);

		if n < block.len() {
			debug!("Input device delivered only {} of {} samples (stream errors so far: {})",
				n, block.len(), self.stream_errors.load(Ordering::Relaxed));
		}

		Ok(Some(n))
	}

	fn overruns(&self) -> usize
	{
		self.overruns.load(Ordering::Relaxed)
	}

	fn close(&mut self)
	{
		if let Some(stream) = self.stream.take() {
			if let Err(e) = stream.pause() {
				debug!("Failed to pause input stream before closing: {}", e);
			}
			drop(stream);
			info!("Closed input device '{}'", self.name);
		}
	}
}

impl Drop for DeviceCapture
{
	fn drop(&mut self)
	{
		self.close();
	}
}

/// Raw native-endian mono i16 samples from any reader, usually stdin.
pub struct RawPcmCapture<R: Read>
{
	reader:      Option<BufReader<R>>,
	sample_rate: u32,
}

impl<R: Read> RawPcmCapture<R>
{
	pub fn new(reader: R, sample_rate: u32) -> RawPcmCapture<R>
	{
		RawPcmCapture {
			reader: Some(BufReader::new(reader)),
			sample_rate,
		}
	}
}

impl<R: Read> CaptureSource for RawPcmCapture<R>
{
	fn sample_rate(&self) -> u32
	{
		self.sample_rate
	}

	fn read_block(&mut self, block: &mut [i16]) -> Result<Option<usize>, CaptureError>
	{
		let reader = match self.reader.as_mut() {
			Some(r) => r,
			None    => return Ok(None),
		};

		let mut n = 0;
		let mut ended = false;
		while n < block.len() {
			match reader.read_i16::<NativeEndian>() {
				Ok(s) => {
					block[n] = s;
					n += 1;
				},
				Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
					debug!("End of input stream after {} samples of the last block", n);
					ended = true;
					break;
				},
				Err(e) => return Err(e.into()),
			}
		}

		if ended {
			self.close();
		}

		if n == 0 {
			Ok(None)
		} else {
			Ok(Some(n))
		}
	}

	fn close(&mut self)
	{
		if self.reader.take().is_some() {
			debug!("Closed raw PCM input");
		}
	}
}
