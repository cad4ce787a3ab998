//! Clip duration measurement.
//!
//! WAV files carry their own format, so their length is read from the file
//! itself. Raw PCM has no header; callers fall back to a size-based estimate.

use crate::playback::item::{AudioItem, ContentType};
use std::fs::File;
use tracing::debug;

/// Authoritative duration in seconds, or `None` when it can't be determined.
pub fn measure_duration(item: &AudioItem) -> Option<f64> {
    match item.content_type {
        ContentType::Raw => None,
        ContentType::Wave => {
            let mut file = File::open(&item.file_path).ok()?;
            let (header, data) = match wav::read(&mut file) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!(file = %item.file_path, error = %err, "WAV header unreadable");
                    return None;
                }
            };

            let total_samples = match &data {
                wav::BitDepth::Eight(samples) => samples.len(),
                wav::BitDepth::Sixteen(samples) => samples.len(),
                wav::BitDepth::TwentyFour(samples) => samples.len(),
                wav::BitDepth::ThirtyTwoFloat(samples) => samples.len(),
                wav::BitDepth::Empty => return None,
            };

            let channels = header.channel_count.max(1) as f64;
            if header.sampling_rate == 0 {
                return None;
            }
            Some(total_samples as f64 / channels / header.sampling_rate as f64)
        }
    }
}

/// Seconds of 16-bit mono PCM that fit in `file_size` bytes at `sample_rate`.
pub fn estimate_from_size(file_size: u64, sample_rate: u32) -> f64 {
    const BYTES_PER_SAMPLE: f64 = 2.0;
    const CHANNELS: f64 = 1.0;

    if sample_rate == 0 {
        return 0.0;
    }
    file_size as f64 / (sample_rate as f64 * BYTES_PER_SAMPLE * CHANNELS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::admission::tests::wav_bytes;

    #[test]
    fn test_wave_duration_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two_seconds.wav");
        std::fs::write(&path, wav_bytes(&vec![0.1; 32000], 16000, 1)).unwrap();

        let item = AudioItem::wave(path.to_string_lossy()).unwrap();
        let duration = measure_duration(&item).unwrap();
        assert!((duration - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_stereo_wave_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        // 16000 interleaved samples over 2 channels at 8kHz = 1 second
        std::fs::write(&path, wav_bytes(&vec![0.1; 16000], 8000, 2)).unwrap();

        let item = AudioItem::wave(path.to_string_lossy()).unwrap();
        assert!((measure_duration(&item).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_raw_and_missing_have_no_header_duration() {
        let raw = AudioItem::raw("/tmp/whatever.r16", 16000).unwrap();
        assert_eq!(measure_duration(&raw), None);

        let missing = AudioItem::wave("/nonexistent/x.wav").unwrap();
        assert_eq!(measure_duration(&missing), None);
    }

    #[test]
    fn test_estimate_from_size() {
        // 24kHz mono 16-bit: 48000 bytes per second
        assert_eq!(estimate_from_size(48_000, 24_000), 1.0);
        assert_eq!(estimate_from_size(16_000, 8_000), 1.0);
        assert_eq!(estimate_from_size(1000, 0), 0.0);
    }
}
