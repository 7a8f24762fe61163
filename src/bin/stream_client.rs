//! # Stream Client
//!
//! Command-line client for the bidirectional streaming endpoint. Streams a
//! file (or a list of words) to the relay, or to any compatible endpoint,
//! and prints what comes back.
//!
//! ```text
//! stream-client --file audio.wav --param model=nova-3 --param language=en
//! stream-client --render log hello duplex world
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duplex_relay::client::{Endpoint, LoggingSink, StreamingSession, TranscriptSink};
use duplex_relay::config::AppConfig;
use duplex_relay::STREAM_PATH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Render {
    /// Parse JSON transcription results and print transcripts
    Transcript,
    /// Log every response as it arrives
    Log,
}

#[derive(Parser, Debug)]
#[command(name = "stream-client")]
#[command(about = "Stream chunks to a bidirectional streaming endpoint")]
#[command(version)]
struct Cli {
    /// Base URL of the endpoint (http/https are mapped to ws/wss)
    #[arg(long, env = "DUPLEX_URL", default_value = "ws://localhost:8080")]
    url: String,

    /// Invocation path on the endpoint
    #[arg(long, default_value = STREAM_PATH)]
    path: String,

    /// File to stream in fixed-size binary chunks
    #[arg(long, conflicts_with = "words")]
    file: Option<PathBuf>,

    /// Query parameter passed to the endpoint (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Seconds between chunks (overrides configuration)
    #[arg(long)]
    delay: Option<f64>,

    /// Send chunks 10 ms apart
    #[arg(long, conflicts_with = "delay")]
    fast: bool,

    /// Chunk size in bytes for --file (overrides configuration)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// How to show responses
    #[arg(long, value_enum, default_value_t = Render::Transcript)]
    render: Render,

    /// Seconds to keep listening after the last chunk before ending the session
    #[arg(long, default_value_t = 2.0)]
    linger: f64,

    /// Text chunks to send, one message per word
    words: Vec<String>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid --{} value {}", flag, value))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duplex_relay=info,stream_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    let cli = Cli::parse();
    if cli.file.is_none() && cli.words.is_empty() {
        bail!("nothing to send: pass --file or one or more words");
    }

    let mut config = AppConfig::load()?.session;
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    if cli.fast {
        config.chunk_cadence_ms = 10;
    } else if let Some(delay) = cli.delay {
        config.chunk_cadence_ms = seconds(delay, "delay")?.as_millis() as u64;
    }
    config.validate()?;
    let cadence = config.chunk_cadence();
    let linger = seconds(cli.linger, "linger")?;

    let mut session = match cli.render {
        Render::Transcript => StreamingSession::websocket(config, TranscriptSink::stdout()),
        Render::Log => StreamingSession::websocket(config, LoggingSink),
    };

    let endpoint = Endpoint::new(cli.url, cli.path);
    session.start(endpoint, &cli.params).await?;

    let streamed = match &cli.file {
        Some(path) => session.stream_file(path).await,
        None => session.stream_chunks(cli.words.iter().map(String::as_str), cadence).await,
    };
    let sent = match streamed {
        Ok(sent) => sent,
        Err(e) => {
            session.end().await;
            return Err(e.into());
        }
    };
    info!(chunks = sent, "Finished sending, waiting for remaining responses");

    if !linger.is_zero() {
        tokio::time::sleep(linger).await;
    }
    session.end().await;

    if let Some(report) = session.report() {
        info!(responses = report.total(), "Session complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("model=nova-3"),
            Ok(("model".to_string(), "nova-3".to_string()))
        );
        assert_eq!(
            parse_param("keywords=a=b"),
            Ok(("keywords".to_string(), "a=b".to_string()))
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cli_parses_words_and_params() {
        let cli = Cli::try_parse_from([
            "stream-client",
            "--param",
            "language=en",
            "--fast",
            "--render",
            "log",
            "a",
            "b",
        ])
        .unwrap();
        assert_eq!(cli.words, vec!["a", "b"]);
        assert_eq!(cli.params, vec![("language".to_string(), "en".to_string())]);
        assert!(cli.fast);
        assert_eq!(cli.render, Render::Log);
        assert_eq!(cli.path, STREAM_PATH);
    }

    #[test]
    fn test_file_conflicts_with_words() {
        assert!(Cli::try_parse_from(["stream-client", "--file", "x.wav", "word"]).is_err());
    }
}
