//! layerio command-line tool
//!
//! Drives file and stdio channels through the core runtime: concatenate,
//! count lines, copy (synchronously or on the event loop) and list options.

mod commands;
mod drivers;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use layerio_core::{Buffering, ChannelConfig, Runtime, Scope, StdStream};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::Session;
use crate::drivers::{Stdio, StdioDriver};

/// layerio - stackable, encoding-aware channel I/O
#[derive(Parser, Debug)]
#[command(name = "layerio")]
#[command(author = "layerio developers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Read, copy and inspect files through layerio channels", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// JSON file with channel options applied to every opened file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Character encoding of opened files
    #[arg(short, long, global = true)]
    encoding: Option<String>,

    /// End-of-line translation: one or two of auto, binary, cr, crlf, lf
    #[arg(short, long, global = true)]
    translation: Option<String>,

    /// Output buffering of opened files
    #[arg(long, global = true)]
    buffering: Option<Buffering>,

    /// Buffer size in bytes
    #[arg(long, global = true)]
    buffersize: Option<usize>,

    /// End-of-file character(s), `{}` for none
    #[arg(long, global = true)]
    eofchar: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print files to stdout
    Cat {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Count lines in a file
    Lines { file: PathBuf },
    /// Copy one file to another
    Copy {
        src: PathBuf,
        dst: PathBuf,
        /// Stop after this many bytes (or characters when re-encoding)
        #[arg(long)]
        limit: Option<u64>,
        /// Run the copy on the event loop
        #[arg(long, default_value = "false")]
        background: bool,
    },
    /// Print a file channel's options
    Options { file: PathBuf },
}

impl Args {
    /// Config file first, then the command-line overrides
    fn channel_config(&self) -> Result<ChannelConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => ChannelConfig::default(),
        };
        if let Some(encoding) = &self.encoding {
            config = config.with_encoding(encoding.clone());
        }
        if let Some(translation) = &self.translation {
            config = config.with_translation(translation.clone());
        }
        if let Some(buffering) = self.buffering {
            config = config.with_buffering(buffering);
        }
        if let Some(size) = self.buffersize {
            config = config.with_buffer_size(size);
        }
        if let Some(eof) = &self.eofchar {
            config = config.with_eof_char(eof.clone());
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level)?;

    info!("Starting layerio v{}", env!("CARGO_PKG_VERSION"));

    let config = args.channel_config()?;
    let runtime = Runtime::new();
    install_std_channels(&runtime)?;
    runtime.set_background_error_handler(|channel, err| {
        warn!(channel = %channel.name(), error = %err, "background error");
    });

    let session = Session {
        runtime: runtime.clone(),
        scope: Scope::new("main"),
        config,
    };

    let result = match &args.command {
        Command::Cat { files } => commands::cat(&session, files),
        Command::Lines { file } => commands::lines(&session, file).map(|_| ()),
        Command::Copy {
            src,
            dst,
            limit,
            background,
        } => commands::copy(&session, src, dst, *limit, *background).map(|_| ()),
        Command::Options { file } => commands::options(&session, file),
    };

    drop(session);
    runtime.finalize().context("Failed to close channels")?;
    result
}

fn install_std_channels(runtime: &Runtime) -> Result<()> {
    for (stream, which) in [
        (StdStream::Stdin, Stdio::In),
        (StdStream::Stdout, Stdio::Out),
        (StdStream::Stderr, Stdio::Err),
    ] {
        let driver = StdioDriver::new(which);
        let mode = driver.mode();
        let channel = runtime.create_channel(driver, stream.name(), mode);
        runtime.set_std_channel(stream, Some(channel))?;
    }
    Ok(())
}

fn setup_logging(level: &str) -> Result<()> {
    let log_level = level
        .parse::<Level>()
        .unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_copy_with_overrides() {
        let args = Args::try_parse_from([
            "layerio",
            "copy",
            "a.txt",
            "b.txt",
            "--limit",
            "10",
            "--encoding",
            "iso8859-1",
            "--buffering",
            "line",
        ])
        .unwrap();
        let config = args.channel_config().unwrap();
        assert_eq!(config.encoding.as_deref(), Some("iso8859-1"));
        assert_eq!(config.buffering, Some(Buffering::Line));
        match args.command {
            Command::Copy { limit, background, .. } => {
                assert_eq!(limit, Some(10));
                assert!(!background);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cat_requires_files() {
        assert!(Args::try_parse_from(["layerio", "cat"]).is_err());
    }
}
