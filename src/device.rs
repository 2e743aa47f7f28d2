//! # Platform Audio Devices
//!
//! Microphone capture and speaker output on top of cpal, behind the `AudioBackend` seam
//! so the session can be driven by in-memory devices in tests.
//!
//! ## Threading:
//! cpal streams are not `Send`, so every stream is built, played and dropped on its own
//! OS thread. The thread parks until it is told to stop or the stream reports an error,
//! then drops the stream, which releases the device and closes the channels the stream
//! callbacks own:
//! - capture: the window channel ends, which the session reads as "microphone gone"
//! - playback: the ended-event channel ends
//!
//! ## Formats:
//! - **Capture**: the device is opened at the capture rate when it supports it, otherwise
//!   at its default rate, downmixed and converted with a band-limited FFT resampler
//! - **Playback**: the device default config; buffers are resampled to the device rate
//!   and mono is written to every channel

use crate::audio::buffer::WindowAccumulator;
use crate::audio::playback::{OutputDevice, PlaybackBuffer, SourceId};
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Opens the microphone and the speaker.
///
/// Both calls block while the device thread starts, so async callers should go through
/// `spawn_blocking`.
pub trait AudioBackend: Send + Sync {
    /// Start capturing mono windows of exactly `window` samples at `sample_rate`.
    fn open_capture(&self, sample_rate: u32, window: usize) -> AppResult<CaptureStream>;

    /// Open the speaker for buffers at `sample_rate`.
    fn open_playback(&self, sample_rate: u32) -> AppResult<PlaybackStream>;
}

/// A running microphone.
pub struct CaptureStream {
    /// Complete capture windows, in capture order. Ends when the device goes away.
    pub windows: mpsc::UnboundedReceiver<Vec<f32>>,
    thread: StreamThread,
}

impl CaptureStream {
    /// Stop capturing and release the microphone. Safe to call more than once.
    pub fn close(&mut self) {
        self.thread.close();
        self.windows.close();
    }
}

/// A running speaker.
pub struct PlaybackStream {
    /// Handed to the playback scheduler
    pub device: Box<dyn OutputDevice>,
    /// Ids of buffers that finished playing on their own
    pub ended: mpsc::UnboundedReceiver<SourceId>,
}

/// Owns the OS thread a cpal stream lives on.
struct StreamThread {
    label: &'static str,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl StreamThread {
    /// Build and play a stream on a new thread, returning once it is running.
    ///
    /// `build` receives a sender the stream's error callback can use to end the thread.
    fn spawn<F>(label: &'static str, build: F) -> AppResult<Self>
    where
        F: FnOnce(std_mpsc::Sender<()>) -> AppResult<cpal::Stream> + Send + 'static,
    {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<AppResult<()>>();
        let fault_tx = stop_tx.clone();

        let thread = std::thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                let stream = match build(fault_tx) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Returns on close, on a stream error, or when every sender is gone
                let _ = stop_rx.recv();
                drop(stream);
                debug!(stream = label, "audio stream released");
            })
            .map_err(|e| AppError::Internal(format!("failed to spawn {} thread: {}", label, e)))?;

        let mut handle = Self {
            label,
            stop: Some(stop_tx),
            thread: Some(thread),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(err)) => {
                handle.close();
                Err(err)
            }
            Err(_) => {
                handle.close();
                Err(AppError::Internal(format!("{} thread exited during startup", label)))
            }
        }
    }

    /// A handle with no thread behind it, for in-memory devices.
    #[cfg(test)]
    fn detached(label: &'static str) -> Self {
        Self {
            label,
            stop: None,
            thread: None,
        }
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(stream = self.label, "audio thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.close();
    }
}

/// The cpal default host.
#[derive(Debug, Default, Clone)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_capture(&self, sample_rate: u32, window: usize) -> AppResult<CaptureStream> {
        let (windows_tx, windows_rx) = mpsc::unbounded_channel();

        let thread = StreamThread::spawn("audio-capture", move |fault_tx| {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| AppError::PermissionDenied("no microphone available".to_string()))?;

            let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
            let (config, format, converter) = capture_config(&device, sample_rate)?;
            info!(
                device = %device_name,
                channels = config.channels,
                device_rate = config.sample_rate.0,
                sample_rate,
                "opening microphone"
            );

            let sink = CaptureSink {
                converter,
                accumulator: if config.sample_rate.0 == sample_rate {
                    WindowAccumulator::with_channels(window, config.channels as usize)
                } else {
                    WindowAccumulator::new(window)
                },
                converted: Vec::new(),
                windows: windows_tx,
            };

            let stream = match format {
                SampleFormat::I16 => build_input::<i16>(&device, &config, sink, fault_tx),
                SampleFormat::U16 => build_input::<u16>(&device, &config, sink, fault_tx),
                SampleFormat::F32 => build_input::<f32>(&device, &config, sink, fault_tx),
                other => {
                    return Err(AppError::PermissionDenied(format!(
                        "unsupported microphone sample format: {:?}",
                        other
                    )))
                }
            }
            .map_err(|e| AppError::PermissionDenied(format!("microphone access failed: {}", e)))?;

            stream
                .play()
                .map_err(|e| AppError::PermissionDenied(format!("microphone access failed: {}", e)))?;
            Ok(stream)
        })?;

        Ok(CaptureStream {
            windows: windows_rx,
            thread,
        })
    }

    fn open_playback(&self, sample_rate: u32) -> AppResult<PlaybackStream> {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let rejected_tx = ended_tx.downgrade();
        let (timeline_tx, timeline_rx) = std_mpsc::channel::<Arc<Mutex<Timeline>>>();

        let thread = StreamThread::spawn("audio-playback", move |fault_tx| {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| AppError::PermissionDenied("no speaker available".to_string()))?;

            let supported = device
                .default_output_config()
                .map_err(|e| AppError::PermissionDenied(format!("speaker access failed: {}", e)))?;
            let config: StreamConfig = supported.config();
            info!(
                device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
                channels = config.channels,
                device_rate = config.sample_rate.0,
                sample_rate,
                "opening speaker"
            );

            let timeline = Arc::new(Mutex::new(Timeline::new(config.sample_rate.0, config.channels as usize)));
            let _ = timeline_tx.send(timeline.clone());

            let stream = match supported.sample_format() {
                SampleFormat::I16 => build_output::<i16>(&device, &config, timeline, ended_tx, fault_tx),
                SampleFormat::U16 => build_output::<u16>(&device, &config, timeline, ended_tx, fault_tx),
                SampleFormat::F32 => build_output::<f32>(&device, &config, timeline, ended_tx, fault_tx),
                other => {
                    return Err(AppError::PermissionDenied(format!(
                        "unsupported speaker sample format: {:?}",
                        other
                    )))
                }
            }
            .map_err(|e| AppError::PermissionDenied(format!("speaker access failed: {}", e)))?;

            stream
                .play()
                .map_err(|e| AppError::PermissionDenied(format!("speaker access failed: {}", e)))?;
            Ok(stream)
        })?;

        let timeline = timeline_rx
            .try_recv()
            .map_err(|_| AppError::Internal("playback timeline was not created".to_string()))?;

        let device_rate = lock(&timeline).device_rate();
        Ok(PlaybackStream {
            device: Box::new(CpalOutput {
                timeline,
                device_rate,
                rejected_tx,
                thread,
            }),
            ended: ended_rx,
        })
    }
}

/// Pick the input config: the capture rate if the device offers it, else the default.
fn capture_config(
    device: &cpal::Device,
    sample_rate: u32,
) -> AppResult<(StreamConfig, SampleFormat, Option<RateConverter>)> {
    let native = device
        .supported_input_configs()
        .map_err(|e| AppError::PermissionDenied(format!("microphone access failed: {}", e)))?
        .filter(|range| {
            range.min_sample_rate().0 <= sample_rate && sample_rate <= range.max_sample_rate().0
        })
        .min_by_key(|range| range.channels())
        .map(|range| range.with_sample_rate(cpal::SampleRate(sample_rate)));

    if let Some(supported) = native {
        return Ok((supported.config(), supported.sample_format(), None));
    }

    let supported = device
        .default_input_config()
        .map_err(|e| AppError::PermissionDenied(format!("microphone access failed: {}", e)))?;
    let config: StreamConfig = supported.config();
    let converter = RateConverter::new(config.sample_rate.0, sample_rate, config.channels as usize)?;
    Ok((config, supported.sample_format(), Some(converter)))
}

/// State owned by the capture callback.
struct CaptureSink {
    converter: Option<RateConverter>,
    accumulator: WindowAccumulator,
    converted: Vec<f32>,
    windows: mpsc::UnboundedSender<Vec<f32>>,
}

impl CaptureSink {
    fn push(&mut self, data: &[f32]) {
        let windows = &self.windows;
        match &mut self.converter {
            Some(converter) => {
                self.converted.clear();
                converter.push(data, &mut self.converted);
                self.accumulator.push(&self.converted, |window| {
                    let _ = windows.send(window);
                });
            }
            None => self.accumulator.push(data, |window| {
                let _ = windows.send(window);
            }),
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut sink: CaptureSink,
    fault_tx: std_mpsc::Sender<()>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
            sink.push(&scratch);
        },
        move |err| {
            error!(error = %err, "microphone stream error");
            let _ = fault_tx.send(());
        },
        None,
    )
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
    ended_tx: mpsc::UnboundedSender<SourceId>,
    fault_tx: std_mpsc::Sender<()>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.clear();
            scratch.resize(data.len(), 0.0);
            let ended = lock(&timeline).render(&mut scratch);

            for (slot, &value) in data.iter_mut().zip(scratch.iter()) {
                *slot = T::from_sample(value);
            }
            for id in ended {
                let _ = ended_tx.send(id);
            }
        },
        move |err| {
            error!(error = %err, "speaker stream error");
            let _ = fault_tx.send(());
        },
        None,
    )
}

fn lock(timeline: &Mutex<Timeline>) -> MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Speaker handle the playback scheduler drives.
struct CpalOutput {
    timeline: Arc<Mutex<Timeline>>,
    device_rate: u32,
    /// Reports buffers that could not be converted as ended. Weak, so the ended
    /// channel still closes when the stream thread goes away.
    rejected_tx: mpsc::WeakUnboundedSender<SourceId>,
    thread: StreamThread,
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        lock(&self.timeline).now()
    }

    fn start(&mut self, id: SourceId, buffer: PlaybackBuffer, at: f64) {
        // Converted before taking the lock so the render callback never waits on it
        match resample(buffer.samples(), buffer.sample_rate(), self.device_rate) {
            Ok(samples) => lock(&self.timeline).add(id, samples, at),
            Err(err) => {
                error!(source = id, error = %err, "dropping buffer the speaker cannot play");
                if let Some(tx) = self.rejected_tx.upgrade() {
                    let _ = tx.send(id);
                }
            }
        }
    }

    fn stop(&mut self, id: SourceId) {
        lock(&self.timeline).remove(id);
    }

    fn close(&mut self) {
        lock(&self.timeline).clear();
        self.thread.close();
    }
}

/// Input frames per resampler chunk.
const CHUNK_FRAMES: usize = 1024;

/// Streaming sample-rate conversion with downmix.
///
/// Input is downmixed to mono and fed to the resampler in whole chunks; a partial
/// chunk waits for the next block, so output is independent of how input is split.
pub struct RateConverter {
    channels: usize,
    resampler: FftFixedIn<f32>,
    /// Mono input not yet consumed by the resampler
    pending: Vec<f32>,
}

impl RateConverter {
    pub fn new(from_rate: u32, to_rate: u32, channels: usize) -> AppResult<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(AppError::Internal(format!(
                "cannot convert {} Hz to {} Hz",
                from_rate, to_rate
            )));
        }
        let resampler = FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_FRAMES, 2, 1)?;
        Ok(Self {
            channels: channels.max(1),
            resampler,
            pending: Vec::with_capacity(CHUNK_FRAMES * 2),
        })
    }

    /// Convert a block of interleaved input, appending mono output to `out`.
    pub fn push(&mut self, interleaved: &[f32], out: &mut Vec<f32>) {
        let channels = self.channels;
        self.pending.extend(
            interleaved
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );

        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            match self.resampler.process(&[&self.pending[..needed]], None) {
                Ok(converted) => {
                    if let Some(mono) = converted.first() {
                        out.extend_from_slice(mono);
                    }
                }
                Err(err) => warn!(error = %err, "dropping capture chunk the resampler rejected"),
            }
            self.pending.drain(..needed);
        }
    }
}

/// Resample a whole mono buffer.
///
/// The tail is padded with silence to fill the last chunk, and the resampler delay is
/// trimmed so the output lines up with the input and has `len * to / from` samples.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> AppResult<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(AppError::Internal(format!(
            "cannot resample {} Hz to {} Hz",
            from_rate, to_rate
        )));
    }

    let mut resampler = FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_FRAMES, 2, 1)?;
    let expected = ((samples.len() as u64 * to_rate as u64 + from_rate as u64 / 2) / from_rate as u64) as usize;
    let delay = resampler.output_delay();

    let mut out = Vec::with_capacity(expected + delay + CHUNK_FRAMES);
    let mut chunk = Vec::with_capacity(CHUNK_FRAMES);
    let mut position = 0;
    while out.len() < expected + delay {
        let needed = resampler.input_frames_next();
        let end = (position + needed).min(samples.len());
        chunk.clear();
        chunk.extend_from_slice(&samples[position..end]);
        chunk.resize(needed, 0.0);
        position = end;

        let converted = resampler.process(&[chunk.as_slice()], None)?;
        if let Some(mono) = converted.first() {
            out.extend_from_slice(mono);
        }
    }

    out.drain(..delay);
    out.truncate(expected);
    Ok(out)
}

/// A scheduled buffer, already at the device rate.
#[derive(Debug)]
struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixing timeline shared between the scheduler and the render callback.
///
/// The clock is the number of frames rendered so far, so it only moves while the
/// device is pulling audio.
#[derive(Debug)]
pub struct Timeline {
    device_rate: u32,
    channels: usize,
    frames_played: u64,
    voices: Vec<Voice>,
}

impl Timeline {
    pub fn new(device_rate: u32, channels: usize) -> Self {
        Self {
            device_rate: device_rate.max(1),
            channels: channels.max(1),
            frames_played: 0,
            voices: Vec::new(),
        }
    }

    /// Device clock in seconds.
    pub fn now(&self) -> f64 {
        self.frames_played as f64 / self.device_rate as f64
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Schedule mono samples, already at the device rate, to start at `at` seconds.
    pub fn add(&mut self, id: SourceId, samples: Vec<f32>, at: f64) {
        let start_frame = (at.max(0.0) * self.device_rate as f64).round() as u64;
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
    }

    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|voice| voice.id != id);
        self.voices.len() != before
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Fill one interleaved device block and advance the clock.
    ///
    /// Returns the ids of buffers that finished within this block.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<SourceId> {
        let frames = out.len() / self.channels;

        for (offset, frame) in out.chunks_mut(self.channels).enumerate() {
            let position = self.frames_played + offset as u64;
            let mut mixed = 0.0f32;
            for voice in &self.voices {
                if position >= voice.start_frame && position < voice.end_frame() {
                    mixed += voice.samples[(position - voice.start_frame) as usize];
                }
            }
            frame.fill(mixed.clamp(-1.0, 1.0));
        }
        self.frames_played += frames as u64;

        let played = self.frames_played;
        let mut ended = Vec::new();
        self.voices.retain(|voice| {
            let done = voice.end_frame() <= played;
            if done {
                ended.push(voice.id);
            }
            !done
        });
        ended
    }
}
