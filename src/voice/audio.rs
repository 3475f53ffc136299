//! Captured audio
//!
//! [`AudioBuffer`] holds one utterance as mono-or-interleaved `f32` samples.
//! Recognition services want WAV, so the buffer knows how to encode itself
//! with `hound`.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default sample rate for audio processing
pub const DEFAULT_SAMPLE_RATE: u32 = 16000; // 16kHz - what Whisper expects

/// Default number of channels (mono for speech)
pub const DEFAULT_CHANNELS: u16 = 1;

/// Audio buffer for one captured utterance
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioBuffer {
    /// Create an empty buffer
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            channels,
        }
    }

    /// Create from raw samples
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Append samples
    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Get samples as i16 (for WAV export)
    pub fn samples_i16(&self) -> Vec<i16> {
        self.samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect()
    }

    /// Get buffer duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Downmix interleaved channels to mono
    pub fn to_mono(&self) -> Self {
        if self.channels <= 1 {
            return self.clone();
        }
        let channels = self.channels as usize;
        let samples = self
            .samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        Self::from_samples(samples, self.sample_rate, 1)
    }

    /// Resample to a different sample rate (simple linear interpolation)
    pub fn resample(&self, target_rate: u32) -> Self {
        if self.sample_rate == target_rate || self.samples.is_empty() {
            return Self::from_samples(self.samples.clone(), target_rate, self.channels);
        }

        let ratio = target_rate as f64 / self.sample_rate as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;
        let last = self.samples.len() - 1;

        let samples = (0..new_len)
            .map(|i| {
                let src_idx = i as f64 / ratio;
                let idx_floor = (src_idx.floor() as usize).min(last);
                let idx_ceil = (idx_floor + 1).min(last);
                let frac = (src_idx - idx_floor as f64) as f32;
                self.samples[idx_floor] * (1.0 - frac) + self.samples[idx_ceil] * frac
            })
            .collect();

        Self {
            samples,
            sample_rate: target_rate,
            channels: self.channels,
        }
    }

    /// Encode as a 16-bit PCM WAV file in memory
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer =
                hound::WavWriter::new(&mut cursor, spec).context("Failed to create WAV writer")?;
            for sample in self.samples_i16() {
                writer.write_sample(sample)?;
            }
            writer.finalize().context("Failed to finalize WAV data")?;
        }
        Ok(cursor.into_inner())
    }
}

/// Root-mean-square energy of a block of samples
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Poll interval while waiting for samples
const FRAME_POLL: Duration = Duration::from_millis(10);

/// Mono samples handed from an input callback to the capture thread.
/// Holds at most `capacity` samples; the oldest are dropped first.
#[derive(Debug)]
pub struct SampleQueue {
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append interleaved samples, averaging channels down to mono
    pub fn push_interleaved(&self, data: &[f32], channels: usize) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if channels <= 1 {
            samples.extend(data.iter().copied());
        } else {
            samples.extend(
                data.chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
            );
        }
        let excess = samples.len().saturating_sub(self.capacity);
        if excess > 0 {
            samples.drain(..excess);
        }
    }

    /// Drop everything captured so far
    pub fn clear(&self) {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Block until `len` samples are available, or return `None` once
    /// `deadline` has passed
    pub fn wait_frame(&self, len: usize, deadline: Instant) -> Option<Vec<f32>> {
        loop {
            {
                let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
                if samples.len() >= len {
                    return Some(samples.drain(..len).collect());
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(FRAME_POLL);
        }
    }
}
