use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

use crate::config::WorkerSection;
use crate::error::ErrorKind;

const SOURCE_SCHEMES: &[&str] = &["http", "https", "rtmp", "rtmps", "rtsp", "srt", "udp"];
const DESTINATION_SCHEMES: &[&str] = &["rtmp", "rtmps", "srt", "udp", "http", "https"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Program plus argument vector; never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
    progress_file: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn from_parts(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        progress_file: Option<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            progress_file,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// File ffmpeg rewrites with `-progress` output while it runs.
    pub fn progress_file(&self) -> Option<&Path> {
        self.progress_file.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerCommandBuilder<'a> {
    worker: &'a WorkerSection,
    source: Option<String>,
    destination: Option<String>,
    ingest_base: Option<String>,
    progress_file: Option<PathBuf>,
}

impl<'a> WorkerCommandBuilder<'a> {
    pub fn new(worker: &'a WorkerSection) -> Self {
        Self {
            worker,
            source: None,
            destination: None,
            ingest_base: None,
            progress_file: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Endpoint prepended to a destination that is a bare stream key.
    pub fn ingest_base(mut self, base: impl Into<String>) -> Self {
        self.ingest_base = Some(base.into());
        self
    }

    /// Ignored unless `worker.progress_heartbeat` is enabled.
    pub fn progress_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.progress_file = Some(path.into());
        self
    }

    pub fn build(self) -> Result<WorkerCommand, CommandError> {
        let source = self
            .source
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.worker.default_source.as_str());
        let source = validate_endpoint("source", source, SOURCE_SCHEMES)?;
        let destination = self
            .destination
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(CommandError::Missing("destination"))?;
        let destination = match self.ingest_base.as_deref() {
            Some(base) if is_bare_key(destination) => join_stream_key(base, destination)?,
            _ => destination.to_string(),
        };
        let destination = validate_endpoint("destination", &destination, DESTINATION_SCHEMES)?;

        let progress_file = self
            .progress_file
            .filter(|_| self.worker.progress_heartbeat);
        let transcode = &self.worker.transcode;
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into()];
        if let Some(path) = &progress_file {
            args.push("-progress".into());
            args.push(path.to_string_lossy().to_string());
        }
        // reconnect options only exist on ffmpeg's http protocol
        if self.worker.reconnect.enabled && matches!(source.scheme(), "http" | "https") {
            args.extend([
                "-reconnect".into(),
                "1".into(),
                "-reconnect_streamed".into(),
                "1".into(),
                "-reconnect_delay_max".into(),
                self.worker.reconnect.delay_max_seconds.to_string(),
            ]);
        }
        args.extend(["-i".into(), source.to_string()]);
        args.extend([
            "-c:v".into(),
            transcode.video_codec.clone(),
            "-preset".into(),
            transcode.preset.clone(),
        ]);
        if let Some(tune) = transcode.tune.as_ref().filter(|tune| !tune.is_empty()) {
            args.extend(["-tune".into(), tune.clone()]);
        }
        args.extend([
            "-b:v".into(),
            transcode.video_bitrate.clone(),
            "-maxrate".into(),
            transcode.maxrate.clone(),
            "-bufsize".into(),
            transcode.bufsize.clone(),
            "-pix_fmt".into(),
            transcode.pix_fmt.clone(),
            "-g".into(),
            transcode.gop.to_string(),
            "-keyint_min".into(),
            transcode.gop.to_string(),
            "-c:a".into(),
            transcode.audio_codec.clone(),
            "-b:a".into(),
            transcode.audio_bitrate.clone(),
            "-ar".into(),
            transcode.audio_rate.to_string(),
            "-ac".into(),
            transcode.audio_channels.to_string(),
            "-f".into(),
            transcode.output_format.clone(),
            destination.to_string(),
        ]);

        Ok(WorkerCommand {
            program: PathBuf::from(&self.worker.ffmpeg_binary),
            args,
            progress_file,
        })
    }
}

fn is_bare_key(value: &str) -> bool {
    matches!(Url::parse(value), Err(url::ParseError::RelativeUrlWithoutBase))
}

fn join_stream_key(base: &str, key: &str) -> Result<String, CommandError> {
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CommandError::Invalid {
            field: "destination",
            reason: "stream key contains whitespace".into(),
        });
    }
    Ok(format!(
        "{}/{}",
        base.trim().trim_end_matches('/'),
        key.trim_start_matches('/')
    ))
}

fn validate_endpoint(
    field: &'static str,
    value: &str,
    schemes: &[&str],
) -> Result<Url, CommandError> {
    if value.chars().any(char::is_control) {
        return Err(CommandError::Invalid {
            field,
            reason: "contains control characters".into(),
        });
    }
    let url = Url::parse(value).map_err(|err| CommandError::Invalid {
        field,
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(CommandError::Invalid {
            field,
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReconnectSection, TranscodeSection};

    fn worker() -> WorkerSection {
        WorkerSection {
            ffmpeg_binary: "ffmpeg".into(),
            default_source: "http://127.0.0.1:8080/live/default.ts".into(),
            progress_heartbeat: true,
            reconnect: ReconnectSection {
                enabled: true,
                delay_max_seconds: 10,
            },
            transcode: TranscodeSection {
                video_codec: "libx264".into(),
                preset: "ultrafast".into(),
                tune: Some("zerolatency".into()),
                video_bitrate: "3000k".into(),
                maxrate: "3500k".into(),
                bufsize: "6000k".into(),
                pix_fmt: "yuv420p".into(),
                gop: 60,
                audio_codec: "aac".into(),
                audio_bitrate: "128k".into(),
                audio_rate: 44100,
                audio_channels: 2,
                output_format: "flv".into(),
            },
        }
    }

    #[test]
    fn builds_full_argument_vector() {
        let worker = worker();
        let command = WorkerCommandBuilder::new(&worker)
            .source("http://cdn.example.com/live.m3u8")
            .destination("rtmps://live-api-s.example.com:443/rtmp/KEY-123")
            .progress_file("/tmp/relay_x.progress")
            .build()
            .unwrap();
        assert_eq!(command.program(), Path::new("ffmpeg"));
        assert_eq!(command.progress_file(), Some(Path::new("/tmp/relay_x.progress")));
        let args = command.args().join(" ");
        assert!(args.starts_with("-hide_banner -nostdin -progress /tmp/relay_x.progress"));
        assert!(args.contains(
            "-reconnect 1 -reconnect_streamed 1 -reconnect_delay_max 10 -i http://cdn.example.com/live.m3u8"
        ));
        assert!(args.contains("-c:v libx264 -preset ultrafast -tune zerolatency -b:v 3000k"));
        assert!(args.contains("-g 60 -keyint_min 60 -c:a aac -b:a 128k -ar 44100 -ac 2"));
        assert!(args.ends_with("-f flv rtmps://live-api-s.example.com:443/rtmp/KEY-123"));
    }

    #[test]
    fn falls_back_to_default_source() {
        let worker = worker();
        let command = WorkerCommandBuilder::new(&worker)
            .source("  ")
            .destination("rtmp://ingest.example.com/app/key")
            .build()
            .unwrap();
        assert!(command
            .args()
            .contains(&"http://127.0.0.1:8080/live/default.ts".to_string()));
        assert_eq!(command.progress_file(), None);
    }

    #[test]
    fn skips_reconnect_flags_for_non_http_sources() {
        let worker = worker();
        let command = WorkerCommandBuilder::new(&worker)
            .source("srt://10.0.0.5:9000")
            .destination("rtmp://ingest.example.com/app/key")
            .build()
            .unwrap();
        assert!(!command.args().iter().any(|arg| arg == "-reconnect"));
    }

    #[test]
    fn rejects_bad_endpoints() {
        let worker = worker();
        let missing = WorkerCommandBuilder::new(&worker).build().unwrap_err();
        assert_eq!(missing, CommandError::Missing("destination"));

        let not_a_url = WorkerCommandBuilder::new(&worker)
            .destination("just-a-stream-key")
            .build()
            .unwrap_err();
        assert!(matches!(not_a_url, CommandError::Invalid { field: "destination", .. }));

        let injected = WorkerCommandBuilder::new(&worker)
            .source("http://example.com/a.ts\n-f")
            .destination("rtmp://ingest.example.com/app/key")
            .build()
            .unwrap_err();
        assert!(matches!(injected, CommandError::Invalid { field: "source", .. }));

        let scheme = WorkerCommandBuilder::new(&worker)
            .source("file:///etc/passwd")
            .destination("rtmp://ingest.example.com/app/key")
            .build()
            .unwrap_err();
        assert_eq!(scheme.kind(), ErrorKind::Validation);
    }

    #[test]
    fn bare_stream_key_is_appended_to_ingest_base() {
        let worker = worker();
        let command = WorkerCommandBuilder::new(&worker)
            .destination("FB-1234567890123-0-AbCdEf")
            .ingest_base("rtmps://live-api-s.facebook.com:443/rtmp/")
            .build()
            .unwrap();
        assert_eq!(
            command.args().last().map(String::as_str),
            Some("rtmps://live-api-s.facebook.com:443/rtmp/FB-1234567890123-0-AbCdEf")
        );

        let full_url = WorkerCommandBuilder::new(&worker)
            .destination("rtmp://ingest.example.com/app/key")
            .ingest_base("rtmps://live-api-s.facebook.com:443/rtmp/")
            .build()
            .unwrap();
        assert_eq!(
            full_url.args().last().map(String::as_str),
            Some("rtmp://ingest.example.com/app/key")
        );

        let spaced = WorkerCommandBuilder::new(&worker)
            .destination("FB-123 -f mp4 /tmp/out")
            .ingest_base("rtmps://live-api-s.facebook.com:443/rtmp")
            .build()
            .unwrap_err();
        assert!(matches!(spaced, CommandError::Invalid { field: "destination", .. }));
    }
}
