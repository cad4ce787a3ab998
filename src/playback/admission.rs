//! # Admission Filter
//!
//! Rejects silent or near-silent clips before they take a queue slot.
//!
//! ## Decision:
//! A clip is admitted only when both checks pass:
//! 1. **Energy**: RMS of the whole clip exceeds `rms_floor` (normalized, 0.0-1.0)
//! 2. **Voice activity**: 10ms frames whose own RMS exceeds `vad_frame_floor` add up
//!    to at least `vad_threshold_secs`
//!
//! Loading failures (missing file, bad header, odd PCM length) reject the clip
//! and log why; they never propagate.

use crate::config::AdmissionConfig;
use crate::playback::item::{AudioItem, ContentType};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::Cursor;
use tracing::{debug, info, warn};

/// Decoded mono samples normalized to [-1.0, 1.0].
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSamples {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Energy measures computed for one clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioLevels {
    pub rms: f32,
    pub voiced_seconds: f64,
}

pub struct AdmissionFilter {
    config: AdmissionConfig,
}

impl AdmissionFilter {
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Compute RMS and the voiced duration estimate.
    pub fn analyze(&self, audio: &AudioSamples) -> AudioLevels {
        if audio.samples.is_empty() || audio.sample_rate == 0 {
            return AudioLevels {
                rms: 0.0,
                voiced_seconds: 0.0,
            };
        }

        let frame_len = (audio.sample_rate as usize / 100).max(1);
        let voiced_samples: usize = audio
            .samples
            .chunks(frame_len)
            .filter(|frame| rms(frame) > self.config.vad_frame_floor)
            .map(|frame| frame.len())
            .sum();

        AudioLevels {
            rms: rms(&audio.samples),
            voiced_seconds: voiced_samples as f64 / audio.sample_rate as f64,
        }
    }

    /// Decide whether `item` is worth queueing given its decoded samples.
    pub fn decide_admit(&self, item: &AudioItem, audio: &AudioSamples) -> bool {
        let levels = self.analyze(audio);
        let loud_enough = levels.rms > self.config.rms_floor;
        let voiced_enough = levels.voiced_seconds >= self.config.vad_threshold_secs;

        debug!(
            file = %item.file_name(),
            rms = levels.rms,
            voiced_seconds = levels.voiced_seconds,
            rms_floor = self.config.rms_floor,
            vad_threshold_secs = self.config.vad_threshold_secs,
            "Admission levels"
        );

        if loud_enough && voiced_enough {
            true
        } else {
            info!(
                file = %item.file_name(),
                rms = levels.rms,
                voiced_seconds = levels.voiced_seconds,
                "Rejecting silent audio before queueing"
            );
            false
        }
    }

    /// Load the item's audio from disk and run [`AdmissionFilter::decide_admit`].
    ///
    /// Blocking file IO: async callers should run this on the blocking pool.
    pub fn check_file(&self, item: &AudioItem) -> bool {
        if !self.config.enabled {
            return true;
        }

        match load_samples(item) {
            Ok(audio) => self.decide_admit(item, &audio),
            Err(err) => {
                warn!(file = %item.file_path, error = %err, "Admission check failed, dropping audio");
                false
            }
        }
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Decode an item's file into normalized mono samples.
pub fn load_samples(item: &AudioItem) -> Result<AudioSamples, String> {
    match item.content_type {
        ContentType::Raw => {
            let sample_rate = item
                .sample_rate
                .ok_or_else(|| "raw audio without sample rate".to_string())?;
            let data = std::fs::read(&item.file_path)
                .map_err(|e| format!("cannot read {}: {}", item.file_path, e))?;
            Ok(AudioSamples::new(pcm16_to_float(&data)?, sample_rate))
        }
        ContentType::Wave => {
            let mut file = File::open(&item.file_path)
                .map_err(|e| format!("cannot open {}: {}", item.file_path, e))?;
            let (header, data) =
                wav::read(&mut file).map_err(|e| format!("invalid wav {}: {}", item.file_path, e))?;
            let channels = header.channel_count.max(1) as usize;
            let interleaved = wav_to_float(data)?;
            Ok(AudioSamples::new(
                downmix(&interleaved, channels),
                header.sampling_rate,
            ))
        }
    }
}

/// Convert 16-bit little-endian PCM bytes to floats in [-1.0, 1.0].
pub fn pcm16_to_float(data: &[u8]) -> Result<Vec<f32>, String> {
    if data.is_empty() {
        return Err("audio data is empty".to_string());
    }
    if data.len() % 2 != 0 {
        return Err("audio data length must be even for 16-bit samples".to_string());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

fn wav_to_float(data: wav::BitDepth) -> Result<Vec<f32>, String> {
    match data {
        wav::BitDepth::Eight(samples) => Ok(samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect()),
        wav::BitDepth::Sixteen(samples) => {
            Ok(samples.into_iter().map(|s| s as f32 / 32768.0).collect())
        }
        wav::BitDepth::TwentyFour(samples) => Ok(samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect()),
        wav::BitDepth::ThirtyTwoFloat(samples) => Ok(samples),
        wav::BitDepth::Empty => Err("wav file has no samples".to_string()),
    }
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
