use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use async_trait::async_trait;
use relay_core::extraction::{AttemptOutcome, ResolverStrategy};
use relay_core::{
    load_relay_config, CommandExecutor, ErrorKind, ExtractionPipeline, ExtractionRequest,
    ExtractionStrategy, RelayConfig, StreamFormat,
};
use tempfile::TempDir;
use tokio::process::Command;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COOKIES: &str = "# exported\nstel_ssid=abc123\n.t.me\tTRUE\t/\tTRUE\t0\tstel_token\txyz789\n";

enum Behaviour {
    Missing,
    Print(&'static str),
    Fail(String),
    Hang,
}

struct ResolverStub {
    behaviour: Behaviour,
    cookie_files: Mutex<Vec<(PathBuf, String)>>,
}

impl ResolverStub {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            cookie_files: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<(PathBuf, String)> {
        self.cookie_files.lock().unwrap().clone()
    }
}

fn finished(code: i32, stdout: &str, stderr: &str) -> io::Result<Output> {
    Ok(Output {
        status: std::process::ExitStatus::from_raw(code << 8),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    })
}

#[async_trait]
impl CommandExecutor for ResolverStub {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        let position = args.iter().position(|arg| arg == "--cookies").unwrap();
        let cookie_path = PathBuf::from(&args[position + 1]);
        let content = std::fs::read_to_string(&cookie_path).unwrap_or_default();
        self.cookie_files
            .lock()
            .unwrap()
            .push((cookie_path, content));
        assert_eq!(&args[position + 2..position + 5], ["--get-url", "-f", "best"]);

        match &self.behaviour {
            Behaviour::Missing => Err(io::Error::new(io::ErrorKind::NotFound, "yt-dlp")),
            Behaviour::Print(stdout) => finished(0, stdout, ""),
            Behaviour::Fail(stderr) => finished(1, "", stderr),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                finished(0, "", "")
            }
        }
    }
}

fn config_for(base: &Path, server: &str) -> RelayConfig {
    let fixture = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../configs/relay.toml");
    let mut config = load_relay_config(fixture).expect("fixture config");
    config.paths.base_dir = base.to_string_lossy().to_string();
    config.extraction.endpoints.entry_point = format!("{server}/k/");
    config.extraction.cdn.channel_pattern = r"/c/([^/?#]+)".into();
    config.extraction.cdn.templates = vec![
        format!("{server}/s{{shard}}/{{stream_id}}/master.m3u8"),
        format!("{server}/s{{shard}}/{{stream_id}}/index.m3u8"),
    ];
    config
}

fn scratch_is_empty(config: &RelayConfig) -> bool {
    match std::fs::read_dir(config.scratch_dir()) {
        Ok(entries) => entries.count() == 0,
        Err(_) => true,
    }
}

#[tokio::test]
async fn direct_fetch_wins_and_later_strategies_never_run() {
    let server = MockServer::start().await;
    let page = format!(
        r#"<html><script>var cfg = {{"src":"{uri}/hls/index.m3u8"}};</script>
           <video src="{uri}/hls/master.m3u8?token=1"></video></html>"#,
        uri = server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/c/news"))
        .and(header("cookie", "stel_ssid=abc123; stel_token=xyz789"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/hls/master.m3u8"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = ResolverStub::new(Behaviour::Print("https://never/used.m3u8"));
    let pipeline =
        ExtractionPipeline::standard(&config_for(dir.path(), &server.uri()), resolver.clone())
            .unwrap();
    let result = pipeline
        .extract(&ExtractionRequest::new(
            format!("{}/c/news", server.uri()),
            COOKIES,
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.stream_url.as_deref(),
        Some(format!("{}/hls/master.m3u8?token=1", server.uri()).as_str())
    );
    assert_eq!(result.method.as_deref(), Some("direct_fetch"));
    assert_eq!(result.format, Some(StreamFormat::Hls));
    assert_eq!(result.tried_methods.len(), 1);
    assert_eq!(result.tried_methods[0].outcome, AttemptOutcome::Succeeded);
    assert!(result.error.is_none());
    assert!(resolver.seen().is_empty());
}

#[tokio::test]
async fn cdn_guess_succeeds_after_direct_and_endpoint_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/c/news"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/k/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("fetch('/api/config'); fetch('/api/auth')"),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/s2/live42/index.m3u8"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = ResolverStub::new(Behaviour::Missing);
    let pipeline =
        ExtractionPipeline::standard(&config_for(dir.path(), &server.uri()), resolver.clone())
            .unwrap();
    let request =
        ExtractionRequest::new(format!("{}/c/news", server.uri()), COOKIES).with_stream_id("live42");
    let result = pipeline.extract(&request).await;

    assert!(result.success);
    assert_eq!(result.method.as_deref(), Some("cdn_patterns"));
    assert_eq!(
        result.stream_url,
        Some(format!("{}/s2/live42/index.m3u8", server.uri()))
    );
    let methods: Vec<&str> = result
        .tried_methods
        .iter()
        .map(|attempt| attempt.method.as_str())
        .collect();
    assert_eq!(methods, vec!["direct_fetch", "endpoint_probe", "cdn_patterns"]);
    assert_eq!(result.tried_methods[0].outcome, AttemptOutcome::Failed);
    assert_eq!(result.tried_methods[1].outcome, AttemptOutcome::NoResult);
    assert!(result.tried_methods[1].detail.contains("2 api paths"));
    assert!(resolver.seen().is_empty());
}

#[tokio::test]
async fn exhaustion_reports_every_attempt_and_the_manual_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/c/news"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>offline</html>"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path(), &server.uri());
    let resolver = ResolverStub::new(Behaviour::Missing);
    let pipeline = ExtractionPipeline::standard(&config, resolver.clone()).unwrap();
    let result = pipeline
        .extract(&ExtractionRequest::new(
            format!("{}/c/news", server.uri()),
            COOKIES,
        ))
        .await;

    assert!(!result.success);
    assert!(result.stream_url.is_none());
    let error = result.error.as_ref().expect("terminal error");
    assert_eq!(error.kind, ErrorKind::ExtractionFailure);
    assert!(error.message.contains(&config.extraction.manual_fallback_hint));
    assert_eq!(result.tried_methods.len(), 4);
    let resolver_attempt = &result.tried_methods[3];
    assert_eq!(resolver_attempt.method, "external_resolver");
    assert_eq!(resolver_attempt.error_kind, Some(ErrorKind::ToolUnavailable));
    assert!(result.tried_methods[2].detail.contains("stream id unresolved"));

    let seen = resolver.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].1.contains("stel_token\txyz789"));
    assert!(!seen[0].0.exists());
    assert!(scratch_is_empty(&config));
}

fn resolver_only(config: &RelayConfig, executor: Arc<ResolverStub>) -> ExtractionPipeline {
    let strategies: Vec<Box<dyn ExtractionStrategy>> = vec![Box::new(ResolverStrategy::new(
        &config.extraction.resolver,
        &config.extraction.cookie_domain,
        Some(config.scratch_dir()),
        executor,
    ))];
    ExtractionPipeline::new(config.extraction.clone(), strategies)
}

#[tokio::test]
async fn resolver_output_is_ranked_and_scratch_cookies_removed() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path(), "http://127.0.0.1:9");
    let resolver = ResolverStub::new(Behaviour::Print(
        "https://edge.example.com/a/index.m3u8\nhttps://edge.example.com/a/master.m3u8\n",
    ));
    let result = resolver_only(&config, resolver.clone())
        .extract(&ExtractionRequest::new("https://t.me/news", COOKIES))
        .await;

    assert!(result.success);
    assert_eq!(
        result.stream_url.as_deref(),
        Some("https://edge.example.com/a/master.m3u8")
    );
    assert_eq!(result.method.as_deref(), Some("external_resolver"));
    let seen = resolver.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].0.starts_with(config.scratch_dir()));
    assert!(seen[0].1.starts_with("# Netscape HTTP Cookie File"));
    assert!(!seen[0].0.exists());
}

#[tokio::test]
async fn resolver_failure_carries_truncated_stderr() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path(), "http://127.0.0.1:9");
    let resolver = ResolverStub::new(Behaviour::Fail(format!("ERROR: {}", "x".repeat(500))));
    let result = resolver_only(&config, resolver.clone())
        .extract(&ExtractionRequest::new("https://t.me/news", COOKIES))
        .await;

    assert!(!result.success);
    let attempt = &result.tried_methods[0];
    assert_eq!(attempt.outcome, AttemptOutcome::Failed);
    assert_eq!(attempt.error_kind, Some(ErrorKind::ExtractionFailure));
    assert!(attempt.detail.len() < 300);
    assert!(scratch_is_empty(&config));
}

#[tokio::test(start_paused = true)]
async fn resolver_timeout_still_removes_scratch_cookies() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path(), "http://127.0.0.1:9");
    let resolver = ResolverStub::new(Behaviour::Hang);
    let result = resolver_only(&config, resolver.clone())
        .extract(&ExtractionRequest::new("https://t.me/news", COOKIES))
        .await;

    assert!(!result.success);
    assert_eq!(result.tried_methods[0].error_kind, Some(ErrorKind::Timeout));
    let seen = resolver.seen();
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].0.exists());
    assert!(scratch_is_empty(&config));
}

#[tokio::test]
async fn invalid_requests_fail_before_any_strategy() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path(), "http://127.0.0.1:9");
    let resolver = ResolverStub::new(Behaviour::Print("https://x/master.m3u8"));
    let pipeline = resolver_only(&config, resolver.clone());

    for request in [
        ExtractionRequest::new("", COOKIES),
        ExtractionRequest::new("not a url", COOKIES),
        ExtractionRequest::new("https://t.me/news", "# only a comment\n\n"),
    ] {
        let result = pipeline.extract(&request).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
        assert!(result.tried_methods.is_empty());
    }
    assert!(resolver.seen().is_empty());
}
