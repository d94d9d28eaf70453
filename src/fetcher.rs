//! Adapter around the external fetch/transcode engine.
//!
//! The engine is a black box: it gets a source URL and an output template,
//! reports progress through [`FetchEvent`]s and leaves one file behind.
//! [`YtDlp`] drives the `yt-dlp` binary (with ffmpeg for merging and audio
//! extraction) as a child process.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, warn};

use crate::error::FetchError;

const PROGRESS_MARKER: &str = "[mediagrab] ";
const DONE_MARKER: &str = "[mediagrab-done] ";

/// Output format requested by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaFormat {
    Video,
    Audio,
}

impl MediaFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" | "video" => Some(MediaFormat::Video),
            "mp3" | "audio" => Some(MediaFormat::Audio),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaFormat::Video => "mp4",
            MediaFormat::Audio => "mp3",
        }
    }

    /// Only the mp4 merge is gated up front. Audio extraction problems
    /// surface from the job itself.
    pub fn requires_transcoder(&self) -> bool {
        matches!(self, MediaFormat::Video)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchTarget {
    /// Best video+audio up to `max_height` pixels, merged into mp4.
    Video { max_height: u32 },
    /// Best audio, extracted to mp3.
    Audio,
}

impl FetchTarget {
    pub fn format(&self) -> MediaFormat {
        match self {
            FetchTarget::Video { .. } => MediaFormat::Video,
            FetchTarget::Audio => MediaFormat::Audio,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub source_url: String,
    pub target: FetchTarget,
    pub output_dir: PathBuf,
    /// File name without extension, e.g. `output_1700000000`.
    pub stem: String,
    pub cookie_file: PathBuf,
}

impl FetchRequest {
    pub fn output_template(&self) -> PathBuf {
        self.output_dir.join(format!("{}.%(ext)s", self.stem))
    }

    pub fn expected_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.stem, self.target.format().extension()))
    }

    pub fn with_target(&self, target: FetchTarget) -> Self {
        Self {
            target,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchEvent {
    Downloading { percent: f64 },
    Finished { title: Option<String>, ext: String },
    Error { message: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchOutcome {
    pub path: PathBuf,
    pub title: Option<String>,
    pub ext: String,
}

impl FetchOutcome {
    /// Name offered to the client for the attachment.
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.title.as_deref().unwrap_or("output"), self.ext)
    }
}

pub type EventSink<'a> = &'a (dyn Fn(FetchEvent) + Send + Sync);

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Whether the transcoding tool is present and executable.
    fn transcoder_available(&self) -> bool;

    /// Runs the engine to completion. Progress goes to `on_event`; a
    /// `Finished` event is emitted before a successful return.
    async fn fetch(
        &self,
        request: &FetchRequest,
        on_event: EventSink<'_>,
    ) -> Result<FetchOutcome, FetchError>;
}

pub struct YtDlp {
    binary: PathBuf,
    ffmpeg: PathBuf,
    audio_quality: String,
}

impl YtDlp {
    pub fn new(binary: PathBuf, ffmpeg: PathBuf, audio_quality: String) -> Self {
        Self {
            binary,
            ffmpeg,
            audio_quality,
        }
    }

    pub fn build_args(&self, request: &FetchRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--newline".into(),
            "--no-playlist".into(),
            "--progress".into(),
            "--progress-template".into(),
            format!("download:{}%(progress._percent_str)s", PROGRESS_MARKER),
            "--print".into(),
            format!("after_move:{}%(title)s\t%(filepath)s", DONE_MARKER),
            "--cookies".into(),
            request.cookie_file.to_string_lossy().into_owned(),
            "--ffmpeg-location".into(),
            self.ffmpeg.to_string_lossy().into_owned(),
            "-o".into(),
            request.output_template().to_string_lossy().into_owned(),
        ];

        match request.target {
            FetchTarget::Video { max_height } => {
                args.push("-f".into());
                args.push(format!(
                    "bestvideo[height<={}][ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best",
                    max_height
                ));
                args.extend(["--merge-output-format", "mp4", "--remux-video", "mp4"].map(String::from));
            }
            FetchTarget::Audio => {
                args.push("-f".into());
                args.push("bestaudio[ext=m4a]/bestaudio".into());
                args.extend(["-x", "--audio-format", "mp3", "--audio-quality"].map(String::from));
                args.push(audio_quality_arg(&self.audio_quality));
            }
        }

        args.push("--".into());
        args.push(request.source_url.clone());
        args
    }
}

/// A bare number above the VBR scale (0-10) is a bitrate in kbps.
fn audio_quality_arg(quality: &str) -> String {
    match quality.parse::<u32>() {
        Ok(q) if q > 10 => format!("{}K", q),
        _ => quality.to_string(),
    }
}

#[derive(Debug, PartialEq)]
pub enum OutputLine {
    Progress(f64),
    Done { title: Option<String>, path: PathBuf },
    Error(String),
    Other,
}

pub fn parse_line(line: &str) -> OutputLine {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix(PROGRESS_MARKER) {
        // Percent strings may carry padding and ANSI colour codes.
        let number: String = rest
            .split('%')
            .next()
            .unwrap_or("")
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        return match number.parse::<f64>() {
            Ok(pct) => OutputLine::Progress(pct),
            Err(_) => OutputLine::Other,
        };
    }
    if let Some(rest) = line.strip_prefix(DONE_MARKER) {
        let (title, path) = rest.split_once('\t').unwrap_or(("", rest));
        let title = match title.trim() {
            "" | "NA" => None,
            t => Some(t.to_string()),
        };
        return OutputLine::Done {
            title,
            path: PathBuf::from(path.trim()),
        };
    }
    if let Some(rest) = line.strip_prefix("ERROR:") {
        return OutputLine::Error(rest.trim().to_string());
    }
    OutputLine::Other
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
}

#[async_trait]
impl Fetcher for YtDlp {
    fn transcoder_available(&self) -> bool {
        which::which(&self.ffmpeg).is_ok()
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        on_event: EventSink<'_>,
    ) -> Result<FetchOutcome, FetchError> {
        let args = self.build_args(request);
        debug!("Running {:?} {:?}", self.binary, args);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FetchError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Tool("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Tool("stderr not captured".to_string()))?;

        // Raw byte lines: the tool may print titles or paths that are not
        // valid UTF-8.
        let mut lines = stream::select(
            SplitStream::new(BufReader::new(stdout).split(b'\n')),
            SplitStream::new(BufReader::new(stderr).split(b'\n')),
        );

        let mut done = None;
        let mut last_error = None;
        while let Some(line) = lines.next().await {
            let line = String::from_utf8_lossy(&line?).into_owned();
            match parse_line(&line) {
                OutputLine::Progress(percent) => on_event(FetchEvent::Downloading { percent }),
                OutputLine::Done { title, path } => done = Some((title, path)),
                OutputLine::Error(message) => {
                    warn!("yt-dlp: {}", message);
                    on_event(FetchEvent::Error {
                        message: message.clone(),
                    });
                    last_error = Some(message);
                }
                OutputLine::Other => debug!("yt-dlp: {}", line),
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(FetchError::Tool(
                last_error.unwrap_or_else(|| format!("yt-dlp exited with {}", status)),
            ));
        }

        let (title, reported) = done.unzip();
        let title = title.flatten();
        let path = reported
            .filter(|p| p.is_file())
            .or_else(|| Some(request.expected_path()).filter(|p| p.is_file()))
            .ok_or_else(|| {
                FetchError::Tool("yt-dlp finished without producing a file".to_string())
            })?;

        let ext = extension_of(&path)
            .unwrap_or_else(|| request.target.format().extension().to_string());
        on_event(FetchEvent::Finished {
            title: title.clone(),
            ext: ext.clone(),
        });

        Ok(FetchOutcome { path, title, ext })
    }
}
