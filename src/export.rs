//! Turning finished takes into files on disk

use crate::audio::decode::decode_audio;
use crate::audio::{BitDepth, encode_wav};
use crate::error::ExportError;
use crate::melody::Melody;
use crate::melody::synth::render_melody;
use crate::services::RecordingResult;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

const MAX_FILENAME_CHARS: usize = 200;
const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Container of an exported file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Webm,
    Wav,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Webm => "webm",
            ExportFormat::Wav => "wav",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Webm => "audio/webm",
            ExportFormat::Wav => "audio/wav",
        }
    }

    /// Match a MIME type, ignoring codec parameters (`audio/webm;codecs=opus`)
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "audio/webm" | "video/webm" => Some(ExportFormat::Webm),
            "audio/wav" | "audio/wave" | "audio/x-wav" | "audio/vnd.wave" => {
                Some(ExportFormat::Wav)
            }
            _ => None,
        }
    }
}

/// Strip characters that are illegal in file names, join words with single
/// hyphens and cap the length. The result carries no extension.
pub fn sanitize_filename(name: &str) -> String {
    let stripped: String = name
        .chars()
        .filter(|c| !FORBIDDEN_CHARS.contains(c))
        .collect();

    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect()
}

/// `{title-or-"recording"}[-take-N]-{YYYY-MM-DD}.{ext}`
pub fn generate_filename(
    title: Option<&str>,
    take: Option<u32>,
    format: ExportFormat,
    date: NaiveDate,
) -> String {
    let base = title
        .map(sanitize_filename)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "recording".to_string());

    let take = take.map(|n| format!("-take-{n}")).unwrap_or_default();

    format!(
        "{base}{take}-{}.{}",
        date.format("%Y-%m-%d"),
        format.extension()
    )
}

/// Re-encode a recorded take as WAV at the requested depth
pub fn convert_to_wav(recording: &RecordingResult, bit_depth: BitDepth) -> Result<Vec<u8>, ExportError> {
    let pcm = decode_audio(&recording.audio)?;
    Ok(encode_wav(&pcm, bit_depth)?)
}

/// Render the guide melody on its own, as a WAV file
pub fn render_guide_wav(
    melody: &Melody,
    sample_rate: u32,
    bit_depth: BitDepth,
) -> Result<Vec<u8>, ExportError> {
    let pcm = render_melody(melody, sample_rate);
    Ok(encode_wav(&pcm, bit_depth)?)
}

/// Write `bytes` to `dir/filename`, creating `dir` if needed
pub fn save_export(dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf, ExportError> {
    std::fs::create_dir_all(dir).map_err(|source| ExportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(filename);
    std::fs::write(&path, bytes).map_err(|source| ExportError::Io {
        path: path.clone(),
        source,
    })?;

    tracing::info!("Exported {} bytes to {:?}", bytes.len(), path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PcmBuffer;
    use crate::melody::{MelodyLine, Note};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    #[test]
    fn test_sanitize_strips_forbidden_characters() {
        assert_eq!(
            sanitize_filename(r#"My Song: "Live" <take1>"#),
            "My-Song-Live-take1"
        );
        assert_eq!(sanitize_filename(r"a/b\c|d?e*f"), "abcdef");
    }

    #[test]
    fn test_sanitize_collapses_whitespace() {
        assert_eq!(sanitize_filename("  two \t words\n"), "two-words");
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_filename(&long).chars().count(), 200);
    }

    #[test]
    fn test_generate_filename() {
        assert_eq!(
            generate_filename(Some("Morning Song"), Some(2), ExportFormat::Wav, date()),
            "Morning-Song-take-2-2024-03-09.wav"
        );
        assert_eq!(
            generate_filename(None, None, ExportFormat::Webm, date()),
            "recording-2024-03-09.webm"
        );
        // Nothing survives sanitizing
        assert_eq!(
            generate_filename(Some("???"), Some(1), ExportFormat::Wav, date()),
            "recording-take-1-2024-03-09.wav"
        );
    }

    #[test]
    fn test_format_from_mime() {
        assert_eq!(
            ExportFormat::from_mime("audio/webm;codecs=opus"),
            Some(ExportFormat::Webm)
        );
        assert_eq!(ExportFormat::from_mime("audio/wav"), Some(ExportFormat::Wav));
        assert_eq!(ExportFormat::from_mime("audio/ogg"), None);
        assert_eq!(ExportFormat::Wav.mime_type(), "audio/wav");
    }

    #[test]
    fn test_convert_to_wav_changes_depth() {
        let pcm = PcmBuffer::new(8000, vec![vec![0.5; 100]]);
        let recording = RecordingResult {
            audio: encode_wav(&pcm, BitDepth::Int16).unwrap(),
            mime_type: "audio/wav".into(),
            duration_seconds: 100.0 / 8000.0,
            frames: 100,
        };

        let wav = convert_to_wav(&recording, BitDepth::Int24).unwrap();
        assert_eq!(&wav[34..36], &24u16.to_le_bytes());
        assert_eq!(wav.len(), 44 + 100 * 3);
    }

    #[test]
    fn test_convert_rejects_garbage() {
        let recording = RecordingResult {
            audio: vec![1, 2, 3, 4, 5, 6, 7, 8],
            mime_type: "audio/webm".into(),
            duration_seconds: 0.0,
            frames: 0,
        };
        assert!(matches!(
            convert_to_wav(&recording, BitDepth::Int16),
            Err(ExportError::Decode(_))
        ));
    }

    #[test]
    fn test_render_guide_wav() {
        let melody = Melody::new(
            "guide",
            120.0,
            4,
            vec![MelodyLine {
                notes: vec![Note::sung(69, 2.0, "la")],
            }],
        );
        let wav = render_guide_wav(&melody, 8000, BitDepth::Int16).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert!(reader.duration() >= 8000);
    }

    #[test]
    fn test_save_export_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("takes").join("march");

        let path = save_export(&nested, "take.wav", b"RIFF").unwrap();
        assert_eq!(path, nested.join("take.wav"));
        assert_eq!(std::fs::read(&path).unwrap(), b"RIFF");
    }
}
