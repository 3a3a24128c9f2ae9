//! Cheap checks applied to a request before any job record exists.
//!
//! A request rejected here never reaches the store and never takes a processing slot.
use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use regex::Regex;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::{
    config::Config,
    job::{ErrorKind, JobInput},
    manager::JobRequest,
    services::FileProcessor,
};

static YOUTUBE_URLS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        r"(?i)^https?://(www\.)?youtube\.com/watch\?v=[\w-]+",
        r"(?i)^https?://(www\.)?youtu\.be/[\w-]+",
        r"(?i)^https?://(www\.)?youtube\.com/shorts/[\w-]+",
    ]
    .map(|pattern| Regex::new(pattern).unwrap())
});

/// How much of an upload is scanned for [`SUSPICIOUS_HEADERS`].
const HEADER_SCAN_BYTES: u64 = 1024;

/// Markers of scripts and archives that have no business inside an audio file.
const SUSPICIOUS_HEADERS: [&[u8]; 5] = [b"<%", b"<?php", b"<script", b"#!/", b"PK\x03\x04"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("No filename provided")]
    MissingFilename,
    #[error("Unsupported file format '{extension}'. Supported formats: {}", supported.join(", "))]
    UnsupportedFormat {
        extension: String,
        supported: Vec<String>,
    },
    #[error("Uploaded file is empty")]
    EmptyFile,
    #[error("File size ({size} bytes) exceeds maximum allowed ({max} bytes)")]
    FileTooLarge { size: u64, max: u64 },
    #[error("File contains potentially malicious content")]
    SuspiciousContent,
    #[error("Unable to read audio file: {0}")]
    UnreadableAudio(String),
    #[error("Audio duration ({duration_secs:.0}s) exceeds maximum allowed ({max_secs}s)")]
    DurationExceeded { duration_secs: f64, max_secs: u64 },
    #[error("Invalid YouTube URL: {0}")]
    InvalidUrl(String),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        ErrorKind::ValidationError.code()
    }

    pub fn suggested_action(&self) -> &'static str {
        ErrorKind::ValidationError.suggested_action()
    }
}

#[derive(Clone)]
pub(crate) struct RequestValidator {
    config: Arc<Config>,
    file_processor: Arc<dyn FileProcessor>,
}

impl RequestValidator {
    pub(crate) fn new(config: Arc<Config>, file_processor: Arc<dyn FileProcessor>) -> Self {
        Self {
            config,
            file_processor,
        }
    }

    pub(crate) async fn validate(&self, request: JobRequest) -> Result<JobInput, ValidationError> {
        match request {
            JobRequest::Upload { path, filename } => self.validate_upload(path, &filename).await,
            JobRequest::Youtube { url } => validate_url(&url).map(|url| JobInput::Youtube { url }),
        }
    }

    async fn validate_upload(
        &self,
        path: PathBuf,
        filename: &str,
    ) -> Result<JobInput, ValidationError> {
        let filename = Path::new(filename.trim())
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .ok_or(ValidationError::MissingFilename)?
            .to_owned();

        let extension = Path::new(&filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_lowercase();
        if !self.config.is_supported_format(&extension) {
            return Err(ValidationError::UnsupportedFormat {
                extension,
                supported: self.config.supported_formats.clone(),
            });
        }

        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|err| ValidationError::UnreadableAudio(err.to_string()))?
            .len();
        if size == 0 {
            return Err(ValidationError::EmptyFile);
        }
        if size > self.config.max_upload_bytes {
            return Err(ValidationError::FileTooLarge {
                size,
                max: self.config.max_upload_bytes,
            });
        }

        let header = read_header(&path)
            .await
            .map_err(|err| ValidationError::UnreadableAudio(err.to_string()))?;
        if SUSPICIOUS_HEADERS
            .iter()
            .any(|marker| header.windows(marker.len()).any(|window| window == *marker))
        {
            tracing::warn!(path = %path.display(), "Rejected upload with suspicious content");
            return Err(ValidationError::SuspiciousContent);
        }

        let info = self
            .file_processor
            .validate(&path)
            .await
            .map_err(|err| ValidationError::UnreadableAudio(err.message))?;
        match info.duration_secs {
            Some(duration_secs) if duration_secs > self.config.max_duration_secs as f64 => {
                Err(ValidationError::DurationExceeded {
                    duration_secs,
                    max_secs: self.config.max_duration_secs,
                })
            }
            _ => Ok(JobInput::Upload {
                path,
                filename,
                size,
            }),
        }
    }
}

async fn read_header(path: &Path) -> io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut header = Vec::with_capacity(HEADER_SCAN_BYTES as usize);
    file.take(HEADER_SCAN_BYTES).read_to_end(&mut header).await?;
    Ok(header)
}

/// Normalizes `url` to an absolute https URL and checks it against the known YouTube shapes.
pub(crate) fn validate_url(url: &str) -> Result<String, ValidationError> {
    let trimmed = url.trim();
    let lower = trimmed.to_lowercase();
    let url = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_owned()
    } else if ["www.", "youtube.", "youtu.be"]
        .iter()
        .any(|prefix| lower.starts_with(prefix))
    {
        format!("https://{trimmed}")
    } else {
        return Err(ValidationError::InvalidUrl(trimmed.to_owned()));
    };

    if YOUTUBE_URLS.iter().any(|pattern| pattern.is_match(&url)) {
        Ok(url)
    } else {
        Err(ValidationError::InvalidUrl(trimmed.to_owned()))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::services::{AudioInfo, MockFileProcessor, ServiceError};

    fn validator(duration_secs: Option<f64>) -> RequestValidator {
        let mut processor = MockFileProcessor::new();
        processor.expect_validate().returning(move |_| {
            Ok(AudioInfo {
                duration_secs,
                format: "mp3".to_owned(),
                ..Default::default()
            })
        });
        RequestValidator::new(Arc::new(Config::default()), Arc::new(processor))
    }

    async fn upload(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[test]
    fn accepts_known_youtube_shapes() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "http://youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "https://youtu.be/dQw4w9WgXcQ",
            "youtu.be/dQw4w9WgXcQ",
            "www.youtube.com/shorts/abc-DEF_123",
            "  HTTPS://WWW.YOUTUBE.COM/watch?v=x  ",
        ] {
            assert!(validate_url(url).is_ok(), "{url} should be accepted");
        }
        assert_eq!(
            validate_url("youtu.be/dQw4w9WgXcQ").unwrap(),
            "https://youtu.be/dQw4w9WgXcQ"
        );
    }

    #[test]
    fn rejects_other_urls() {
        for url in [
            "",
            "https://vimeo.com/12345",
            "javascript:alert(1)",
            "https://youtube.com/",
            "https://youtube.com.evil.io/watch?v=x",
            "ftp://youtube.com/watch?v=x",
        ] {
            assert_matches!(validate_url(url), Err(ValidationError::InvalidUrl(_)));
        }
    }

    #[tokio::test]
    async fn accepts_valid_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = upload(&dir, "in.bin", b"audio").await;

        let input = validator(Some(200.0))
            .validate(JobRequest::Upload {
                path: path.clone(),
                filename: "../../My Song.MP3".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(
            input,
            JobInput::Upload {
                path,
                filename: "My Song.MP3".to_owned(),
                size: 5,
            }
        );
    }

    #[tokio::test]
    async fn rejects_long_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = upload(&dir, "long.mp3", b"audio").await;

        let error = validator(Some(700.0))
            .validate(JobRequest::Upload {
                path,
                filename: "long.mp3".to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(
            error,
            ValidationError::DurationExceeded {
                duration_secs: 700.0,
                max_secs: 600
            }
        );
        assert_eq!(error.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn rejects_bad_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let audio = upload(&dir, "a.wav", b"audio").await;
        let empty = upload(&dir, "b.wav", b"").await;
        let validator = &validator(None);

        let check = move |path: &PathBuf, filename: &str| {
            validator.validate(JobRequest::Upload {
                path: path.clone(),
                filename: filename.to_owned(),
            })
        };

        assert_matches!(check(&audio, "").await, Err(ValidationError::MissingFilename));
        assert_matches!(
            check(&audio, "notes.txt").await,
            Err(ValidationError::UnsupportedFormat { extension, .. }) if extension == "txt"
        );
        assert_matches!(check(&empty, "b.wav").await, Err(ValidationError::EmptyFile));
        assert_matches!(
            check(&dir.path().join("gone.wav"), "gone.wav").await,
            Err(ValidationError::UnreadableAudio(_))
        );
    }

    #[tokio::test]
    async fn rejects_scripts_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let validator = validator(Some(60.0));
        let mut padded = vec![0u8; 900];
        padded.extend_from_slice(b"<?php system($_GET['c']); ?>");

        for (name, contents) in [
            ("run.mp3", b"#!/bin/sh\nrm -rf /".to_vec()),
            ("bundle.m4a", b"PK\x03\x04\x14\x00".to_vec()),
            ("page.wav", b"RIFF....<script>alert(1)</script>".to_vec()),
            ("late.flac", padded),
        ] {
            let path = upload(&dir, name, &contents).await;
            assert_matches!(
                validator
                    .validate(JobRequest::Upload {
                        path,
                        filename: name.to_owned(),
                    })
                    .await,
                Err(ValidationError::SuspiciousContent),
                "{name} should be rejected"
            );
        }

        let mut beyond_scan = vec![0u8; 2048];
        beyond_scan.extend_from_slice(b"#!/");
        let path = upload(&dir, "long.wav", &beyond_scan).await;
        assert!(validator
            .validate(JobRequest::Upload {
                path,
                filename: "long.wav".to_owned(),
            })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn rejects_oversized_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = upload(&dir, "big.flac", &[0u8; 2048]).await;
        let config = Config::default().with_max_upload_bytes(1024);
        let validator = RequestValidator::new(Arc::new(config), Arc::new(MockFileProcessor::new()));

        assert_matches!(
            validator
                .validate(JobRequest::Upload {
                    path,
                    filename: "big.flac".to_owned(),
                })
                .await,
            Err(ValidationError::FileTooLarge { size: 2048, max: 1024 })
        );
    }

    #[tokio::test]
    async fn rejects_unreadable_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = upload(&dir, "broken.m4a", b"garbage").await;
        let mut processor = MockFileProcessor::new();
        processor
            .expect_validate()
            .returning(|_| Err(ServiceError::new("moov atom not found")));
        let validator = RequestValidator::new(Arc::new(Config::default()), Arc::new(processor));

        assert_matches!(
            validator
                .validate(JobRequest::Upload {
                    path,
                    filename: "broken.m4a".to_owned(),
                })
                .await,
            Err(ValidationError::UnreadableAudio(message)) if message == "moov atom not found"
        );
    }
}
