//! # Playback Items
//!
//! One playback request as it travels from a control event to the executor.
//! Items are immutable once queued; the worker only ever reads them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Encoding of the file behind an [`AudioItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Headerless 16-bit little-endian mono PCM; needs an explicit sample rate
    Raw,
    /// RIFF/WAVE file carrying its own format header
    #[serde(alias = "wav")]
    Wave,
}

impl ContentType {
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::Raw => "raw",
            ContentType::Wave => "wave",
        }
    }
}

/// A validated playback request.
#[derive(Debug, Clone)]
pub struct AudioItem {
    pub file_path: String,
    pub content_type: ContentType,
    /// Always set for raw items
    pub sample_rate: Option<u32>,
    pub text_content: Option<String>,
    /// Debugging only; queue position defines playback order
    pub enqueued_at: Instant,
}

/// Why a play request could not become an [`AudioItem`].
#[derive(Debug, Clone, PartialEq)]
pub enum ItemError {
    MissingFile,
    MissingSampleRate,
    InvalidSampleRate(u32),
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemError::MissingFile => write!(f, "file path is required"),
            ItemError::MissingSampleRate => write!(f, "sampleRate is required for raw audio"),
            ItemError::InvalidSampleRate(rate) => write!(f, "invalid sample rate: {}", rate),
        }
    }
}

impl std::error::Error for ItemError {}

impl AudioItem {
    /// Build an item, enforcing the raw-needs-a-rate rule.
    pub fn new(
        file_path: impl Into<String>,
        content_type: ContentType,
        sample_rate: Option<u32>,
        text_content: Option<String>,
    ) -> Result<Self, ItemError> {
        let file_path = file_path.into();
        if file_path.trim().is_empty() {
            return Err(ItemError::MissingFile);
        }

        match (content_type, sample_rate) {
            (_, Some(0)) => return Err(ItemError::InvalidSampleRate(0)),
            (ContentType::Raw, None) => return Err(ItemError::MissingSampleRate),
            _ => {}
        }

        Ok(Self {
            file_path,
            content_type,
            sample_rate,
            text_content: text_content.filter(|t| !t.is_empty()),
            enqueued_at: Instant::now(),
        })
    }

    pub fn raw(file_path: impl Into<String>, sample_rate: u32) -> Result<Self, ItemError> {
        Self::new(file_path, ContentType::Raw, Some(sample_rate), None)
    }

    pub fn wave(file_path: impl Into<String>) -> Result<Self, ItemError> {
        Self::new(file_path, ContentType::Wave, None, None)
    }

    /// File name without directories, for log lines.
    pub fn file_name(&self) -> &str {
        std::path::Path::new(&self.file_path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_requires_sample_rate() {
        let err = AudioItem::new("/tmp/a.r16", ContentType::Raw, None, None).unwrap_err();
        assert_eq!(err, ItemError::MissingSampleRate);
        assert!(AudioItem::raw("/tmp/a.r16", 16000).is_ok());
    }

    #[test]
    fn test_rejects_empty_path_and_zero_rate() {
        assert_eq!(AudioItem::wave("  ").unwrap_err(), ItemError::MissingFile);
        assert_eq!(
            AudioItem::raw("/tmp/a.r8", 0).unwrap_err(),
            ItemError::InvalidSampleRate(0)
        );
    }

    #[test]
    fn test_content_type_accepts_wav_alias() {
        let parsed: ContentType = serde_json::from_str("\"wav\"").unwrap();
        assert_eq!(parsed, ContentType::Wave);
        assert_eq!(ContentType::Raw.as_str(), "raw");
    }

    #[test]
    fn test_file_name() {
        let item = AudioItem::wave("/var/audio/prompt.wav").unwrap();
        assert_eq!(item.file_name(), "prompt.wav");
    }
}
