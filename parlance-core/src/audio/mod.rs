//! Microphone capture and the recording state machine.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate, block on a lock, or perform I/O. It only writes
//! into the SPSC ring buffer producer, whose `push_slice` is wait-free.
//!
//! All real work happens on a dedicated drain thread: resampling to the wire
//! rate, PCM16 framing, pause discarding, and the frame callback. The drain
//! thread never touches network I/O — forwarding is a channel send.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). The stream is therefore created *and dropped* on the drain thread;
//! a sync channel propagates open success/failure back to `start()`.

pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::{
    buffering::{create_capture_ring, frame::PcmFrame, CaptureProducer, Consumer},
    error::{ParlanceError, Result},
    events::RecordingState,
};

use resample::WireResampler;

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;
/// Sleep when the ring is empty, to avoid burning a core.
const EMPTY_SLEEP_MS: u64 = 5;
/// Bounded wait for the drain thread to hand back the session buffer.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate the recognizer expects on the wire (Hz).
    pub wire_sample_rate: u32,
    /// Wire channel count. The recognizer only accepts mono; multi-channel
    /// devices are mixed down.
    pub channels: u16,
    /// Samples per emitted frame at the wire rate (480 = 30 ms at 16 kHz).
    pub frame_size: usize,
    /// Preferred input device name; `None` selects the system default.
    pub device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            wire_sample_rate: 16_000,
            channels: 1,
            frame_size: 480,
            device: None,
        }
    }
}

#[cfg(feature = "audio-cpal")]
type StreamHandle = cpal::Stream;
#[cfg(not(feature = "audio-cpal"))]
type StreamHandle = ();

/// Microphone capture with the Idle → Recording ⇄ Paused → Stopping → Idle
/// state machine.
pub struct AudioCapture {
    config: AudioConfig,
    state: Arc<Mutex<RecordingState>>,
    /// Cleared to stop both the callback and the drain loop.
    running: Arc<AtomicBool>,
    /// While set, the drain loop discards frames (stream stays open).
    paused: Arc<AtomicBool>,
    drain: Option<std::thread::JoinHandle<()>>,
    done_rx: Option<crossbeam_channel::Receiver<Vec<i16>>>,
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RecordingState::Idle)),
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            drain: None,
            done_rx: None,
        }
    }

    /// Current state (snapshot).
    pub fn state(&self) -> RecordingState {
        *self.state.lock()
    }

    /// Change the preferred input device. Only allowed while idle — the open
    /// stream is bound to its device.
    pub fn set_device(&mut self, device: Option<String>) -> Result<()> {
        if self.state() != RecordingState::Idle {
            return Err(ParlanceError::DeviceBusy);
        }
        info!(?device, "input device set");
        self.config.device = device;
        Ok(())
    }

    /// Open the device and start capturing. `on_frame` is invoked from the
    /// drain thread with fixed-length wire-rate PCM16 frames.
    ///
    /// Blocks until the device is confirmed open (or fails), then returns.
    ///
    /// # Errors
    /// - `ParlanceError::AlreadyRunning` if not idle.
    /// - `ParlanceError::NoDefaultInputDevice` / `AudioDevice` / `AudioStream`
    ///   on device problems — typed so callers can tell "no mic" from "mic
    ///   busy".
    pub fn start(&mut self, on_frame: impl Fn(PcmFrame) + Send + 'static) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != RecordingState::Idle {
                return Err(ParlanceError::AlreadyRunning);
            }
            *state = RecordingState::Recording;
        }

        if self.config.channels != 1 {
            warn!(
                channels = self.config.channels,
                "the recognizer takes mono; multi-channel capture is mixed down"
            );
        }

        self.running.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);

        let (producer, mut consumer) = create_capture_ring();
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<Vec<i16>>(1);

        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let paused = Arc::clone(&self.paused);

        let drain = std::thread::Builder::new()
            .name("parlance-capture".into())
            .spawn(move || {
                // Stream must be created on this thread (cpal::Stream is !Send).
                let opened = open_capture_stream(&config, producer, Arc::clone(&running));
                let (stream, capture_rate) = match opened {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };

                let mut resampler =
                    match WireResampler::new(capture_rate, config.wire_sample_rate) {
                        Ok(r) => r,
                        Err(e) => {
                            let _ = open_tx.send(Err(e));
                            running.store(false, Ordering::SeqCst);
                            return;
                        }
                    };

                let _ = open_tx.send(Ok(capture_rate));

                let frame_size = config.frame_size.max(1);
                let mut raw = vec![0f32; DRAIN_CHUNK];
                let mut pending: Vec<i16> = Vec::new();
                let mut accumulated: Vec<i16> = Vec::new();

                while running.load(Ordering::Relaxed) {
                    let n = consumer.pop_slice(&mut raw);
                    if n == 0 {
                        std::thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
                        continue;
                    }

                    let wire = resampler.process(&raw[..n]);
                    if wire.is_empty() {
                        continue;
                    }

                    // Pause discards at the consumer stage; the hardware
                    // stream stays open to avoid an expensive re-open.
                    if paused.load(Ordering::Relaxed) {
                        pending.clear();
                        continue;
                    }

                    pending.extend(wire);
                    while pending.len() >= frame_size {
                        let samples: Vec<i16> = pending.drain(..frame_size).collect();
                        accumulated.extend_from_slice(&samples);
                        on_frame(PcmFrame::new(samples, config.wire_sample_rate));
                    }
                }

                // Forward the sub-frame tail so the last syllable is not lost.
                if !pending.is_empty() && !paused.load(Ordering::Relaxed) {
                    accumulated.extend_from_slice(&pending);
                    on_frame(PcmFrame::new(
                        std::mem::take(&mut pending),
                        config.wire_sample_rate,
                    ));
                }

                // Releases the audio device on this thread.
                drop(stream);
                let _ = done_tx.send(accumulated);
            })
            .map_err(|e| ParlanceError::AudioStream(format!("spawn drain thread: {e}")))?;

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(capture_rate = rate, "audio capture started");
                self.drain = Some(drain);
                self.done_rx = Some(done_rx);
                Ok(())
            }
            Ok(Err(e)) => {
                *self.state.lock() = RecordingState::Idle;
                let _ = drain.join();
                Err(e)
            }
            Err(_) => {
                // Channel closed without a message — the drain thread panicked.
                self.running.store(false, Ordering::SeqCst);
                *self.state.lock() = RecordingState::Idle;
                Err(ParlanceError::AudioStream(
                    "capture thread died before confirming device open".into(),
                ))
            }
        }
    }

    /// Pause: frames are discarded until `resume()`.
    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != RecordingState::Recording {
            return Err(ParlanceError::NotRunning);
        }
        self.paused.store(true, Ordering::SeqCst);
        *state = RecordingState::Paused;
        info!("capture paused");
        Ok(())
    }

    /// Resume after `pause()`.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != RecordingState::Paused {
            return Err(ParlanceError::NotRunning);
        }
        self.paused.store(false, Ordering::SeqCst);
        *state = RecordingState::Recording;
        info!("capture resumed");
        Ok(())
    }

    /// Stop capturing: close the stream, join the drain thread with a bounded
    /// wait, return the accumulated wire-rate PCM16 buffer.
    pub fn stop(&mut self) -> Result<Vec<i16>> {
        {
            let mut state = self.state.lock();
            if *state == RecordingState::Idle {
                return Err(ParlanceError::NotRunning);
            }
            *state = RecordingState::Stopping;
        }

        self.running.store(false, Ordering::SeqCst);

        let (buffer, drained) = match self.done_rx.take() {
            Some(done_rx) => match done_rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(buffer) => (buffer, true),
                Err(_) => {
                    warn!("drain thread did not hand back the buffer in time");
                    (Vec::new(), false)
                }
            },
            None => (Vec::new(), false),
        };

        match self.drain.take() {
            // The buffer arrived as the thread's final act, so this join is
            // effectively immediate.
            Some(drain) if drained => {
                if drain.join().is_err() {
                    warn!("drain thread panicked during stop");
                }
            }
            Some(_) => warn!("drain thread detached after bounded wait expired"),
            None => {}
        }

        self.paused.store(false, Ordering::SeqCst);
        *self.state.lock() = RecordingState::Idle;
        info!(samples = buffer.len(), "audio capture stopped");
        Ok(buffer)
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if self.state() != RecordingState::Idle {
            let _ = self.stop();
        }
    }
}

/// Mix an interleaved multi-channel block down to mono f32 and push it into
/// the ring. Runs on the RT callback thread: `scratch` is reused, never grown
/// beyond the first allocation for a given block size.
#[cfg(feature = "audio-cpal")]
fn mix_and_push(
    samples: &[f32],
    channels: usize,
    scratch: &mut Vec<f32>,
    producer: &mut CaptureProducer,
) {
    use crate::buffering::Producer;

    let written = if channels <= 1 {
        producer.push_slice(samples)
    } else {
        let frames = samples.len() / channels;
        scratch.resize(frames, 0.0);
        for (f, out) in scratch.iter_mut().enumerate() {
            let base = f * channels;
            let sum: f32 = samples[base..base + channels].iter().sum();
            *out = sum / channels as f32;
        }
        producer.push_slice(&scratch[..frames])
    };

    let expected = if channels <= 1 {
        samples.len()
    } else {
        samples.len() / channels
    };
    if written < expected {
        warn!("capture ring full: dropped {} samples", expected - written);
    }
}

#[cfg(feature = "audio-cpal")]
fn open_capture_stream(
    config: &AudioConfig,
    mut producer: CaptureProducer,
    running: Arc<AtomicBool>,
) -> Result<(StreamHandle, u32)> {
    use cpal::traits::HostTrait;

    let host = cpal::default_host();

    let device = if let Some(preferred) = config.device.as_deref() {
        let found = host.input_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false))
        });
        match found {
            Some(d) => d,
            None => {
                warn!("preferred input device '{preferred}' not found, falling back to default");
                host.default_input_device()
                    .ok_or(ParlanceError::NoDefaultInputDevice)?
            }
        }
    } else {
        host.default_input_device()
            .ok_or(ParlanceError::NoDefaultInputDevice)?
    };

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    let supported = device
        .default_input_config()
        .map_err(|e| ParlanceError::AudioDevice(e.to_string()))?;

    let capture_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    info!(capture_rate, channels, "capture config selected");

    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: SampleRate(capture_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err: cpal::StreamError| error!("audio stream error: {err}");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    mix_and_push(data, channels, &mut scratch, &mut producer);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let mut convert: Vec<f32> = Vec::new();
            let mut scratch: Vec<f32> = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    convert.resize(data.len(), 0.0);
                    for (out, s) in convert.iter_mut().zip(data) {
                        *out = *s as f32 / 32768.0;
                    }
                    mix_and_push(&convert, channels, &mut scratch, &mut producer);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let mut convert: Vec<f32> = Vec::new();
            let mut scratch: Vec<f32> = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[u16], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    convert.resize(data.len(), 0.0);
                    for (out, s) in convert.iter_mut().zip(data) {
                        *out = (*s as f32 - 32768.0) / 32768.0;
                    }
                    mix_and_push(&convert, channels, &mut scratch, &mut producer);
                },
                err_fn,
                None,
            )
        }
        fmt => {
            return Err(ParlanceError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| ParlanceError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| ParlanceError::AudioStream(e.to_string()))?;

    Ok((stream, capture_rate))
}

#[cfg(not(feature = "audio-cpal"))]
fn open_capture_stream(
    _config: &AudioConfig,
    _producer: CaptureProducer,
    _running: Arc<AtomicBool>,
) -> Result<(StreamHandle, u32)> {
    Err(ParlanceError::AudioStream(
        "compiled without the audio-cpal feature".into(),
    ))
}
