//! Sound hardware
//!
//! - cpal: microphone input with an energy gate that finds where speech
//!   starts and stops
//! - rodio: blocking playback of synthesized audio files
//!
//! Both device handles are `!Send`, so they are opened on the thread that
//! uses them: the microphone inside the capture thread, the output stream
//! inside the playback worker.

use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::audio::{rms, AudioBuffer, SampleQueue};
use super::{AudioPlayer, CaptureError, Microphone};

/// Frames are 50ms long
const FRAMES_PER_SECOND: u32 = 20;

/// Trailing silence that ends a phrase
const PAUSE_THRESHOLD: Duration = Duration::from_millis(800);

/// Audio kept from before the speech onset
const PRE_ROLL_FRAMES: usize = 6;

/// Floor for the calibrated energy threshold
const MIN_ENERGY_THRESHOLD: f32 = 0.01;

/// Headroom applied to ambient energy during calibration
const ENERGY_MARGIN: f32 = 1.5;

/// Most audio held between reads: one full wait plus one full phrase
const MAX_BUFFERED: Duration = Duration::from_secs(15);

/// Slack on top of the nominal capture time before the stream counts as stalled
const STALL_GRACE: Duration = Duration::from_secs(1);

/// Default microphone with an energy gate
pub struct CpalMicrophone {
    _stream: cpal::Stream,
    samples: Arc<SampleQueue>,
    device_rate: u32,
    target_rate: u32,
    energy_threshold: f32,
}

impl CpalMicrophone {
    /// Open the default input device. Captured audio is downmixed to mono
    /// and resampled to `target_rate` on the way out.
    pub fn open(target_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("No input device available (microphone not found)")?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using input device: {}", device_name);

        let supported = device
            .default_input_config()
            .context("Failed to get default input config")?;
        let sample_format = supported.sample_format();
        let stream_config: cpal::StreamConfig = supported.into();
        let channels = stream_config.channels as usize;
        let device_rate = stream_config.sample_rate.0;

        let capacity = (MAX_BUFFERED.as_secs_f64() * device_rate as f64) as usize;
        let samples = Arc::new(SampleQueue::new(capacity));
        let err_fn = |err| error!("Audio input error: {}", err);

        let stream = match sample_format {
            cpal::SampleFormat::F32 => {
                let queue = samples.clone();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        queue.push_interleaved(data, channels);
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let queue = samples.clone();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let converted: Vec<f32> = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                        queue.push_interleaved(&converted, channels);
                    },
                    err_fn,
                    None,
                )?
            }
            format => bail!("Unsupported sample format: {:?}", format),
        };

        stream.play().context("Failed to start microphone stream")?;
        info!("Input config: {}Hz, {} channels, {:?}", device_rate, channels, sample_format);

        Ok(Self {
            _stream: stream,
            samples,
            device_rate,
            target_rate,
            energy_threshold: MIN_ENERGY_THRESHOLD,
        })
    }

    fn frame_len(&self) -> usize {
        (self.device_rate / FRAMES_PER_SECOND).max(1) as usize
    }

    fn frames_in(&self, duration: Duration) -> usize {
        (duration.as_secs_f64() * FRAMES_PER_SECOND as f64).ceil() as usize
    }

    /// Next full frame, or an error if the stream stopped delivering
    /// audio before `deadline`
    fn next_frame(&self, deadline: Instant) -> Result<Vec<f32>> {
        self.samples
            .wait_frame(self.frame_len(), deadline)
            .ok_or_else(|| anyhow!("Microphone stopped delivering audio"))
    }
}

impl Microphone for CpalMicrophone {
    fn adjust_for_ambient_noise(&mut self, duration: Duration) -> Result<()> {
        self.samples.clear();
        let deadline = Instant::now() + duration + STALL_GRACE;
        let frames = self.frames_in(duration).max(1);
        let mut ambient = Vec::with_capacity(frames * self.frame_len());
        for _ in 0..frames {
            ambient.extend(self.next_frame(deadline)?);
        }

        self.energy_threshold = (rms(&ambient) * ENERGY_MARGIN).max(MIN_ENERGY_THRESHOLD);
        debug!(threshold = self.energy_threshold, "Calibrated energy threshold");
        Ok(())
    }

    fn discard_pending(&mut self) {
        let dropped = self.samples.len();
        self.samples.clear();
        debug!(dropped, "Discarded buffered microphone audio");
    }

    fn listen(&mut self, timeout: Duration, phrase_limit: Duration) -> Result<AudioBuffer, CaptureError> {
        let wait_frames = self.frames_in(timeout);
        let limit_frames = self.frames_in(phrase_limit);
        let pause_frames = self.frames_in(PAUSE_THRESHOLD);
        let deadline = Instant::now() + timeout + phrase_limit + STALL_GRACE;

        // Wait for the energy to cross the threshold
        let mut pre_roll: VecDeque<Vec<f32>> = VecDeque::with_capacity(PRE_ROLL_FRAMES);
        let mut waited = 0;
        let onset = loop {
            if waited >= wait_frames {
                return Err(CaptureError::WaitTimeout);
            }
            let frame = self.next_frame(deadline)?;
            waited += 1;
            if rms(&frame) > self.energy_threshold {
                break frame;
            }
            if pre_roll.len() == PRE_ROLL_FRAMES {
                pre_roll.pop_front();
            }
            pre_roll.push_back(frame);
        };
        debug!(threshold = self.energy_threshold, "Speech onset");

        let mut phrase: Vec<f32> = pre_roll.into_iter().flatten().collect();
        phrase.extend(onset);

        // Record until a long enough pause or the phrase limit
        let mut recorded = 1;
        let mut silent = 0;
        while recorded < limit_frames && silent < pause_frames {
            let frame = self.next_frame(deadline)?;
            if rms(&frame) > self.energy_threshold {
                silent = 0;
            } else {
                silent += 1;
            }
            phrase.extend(frame);
            recorded += 1;
        }

        let buffer = AudioBuffer::from_samples(phrase, self.device_rate, 1);
        Ok(buffer.resample(self.target_rate))
    }
}

/// Plays audio files on the default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioPlayer;

impl AudioPlayer for RodioPlayer {
    fn play_file(&self, path: &Path) -> Result<()> {
        let (_stream, stream_handle) =
            rodio::OutputStream::try_default().context("Failed to create audio output stream")?;
        let sink = rodio::Sink::try_new(&stream_handle).context("Failed to create audio sink")?;

        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open audio file: {}", path.display()))?;
        let source = rodio::Decoder::new(std::io::BufReader::new(file))
            .context("Failed to decode audio file")?;

        sink.append(source);
        sink.sleep_until_end();
        debug!("Finished playing {}", path.display());
        Ok(())
    }
}
