//! xwd-screenshot: dump the X11 root window to a PNG file
//!
//! Runs `xwd -root`, decodes its output as it streams in, and writes a PNG.
//! With `--input`, converts an existing `.xwd` file instead.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use image_xwd::capture::{self, CaptureOptions};
use image_xwd::xwd;

#[derive(Debug, Parser)]
#[command(name = "xwd-screenshot")]
#[command(about = "Dump the X11 root window to a PNG file")]
struct Cli {
    /// Output PNG file
    #[arg(long, default_value = "screenshot.png")]
    out: PathBuf,

    /// X display to capture [default: :0]
    #[arg(long)]
    display: Option<String>,

    /// Give up if the capture takes longer than this many seconds
    #[arg(long, value_parser = parse_timeout)]
    timeout: Option<Duration>,

    /// Convert an existing XWD file instead of capturing
    #[arg(long)]
    input: Option<PathBuf>,
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("`{value}` is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = Cli::parse();
    log::debug!("{args:?}");

    let img = match &args.input {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
            xwd::decode(BufReader::new(file))
                .with_context(|| format!("Decoding {}", path.display()))?
        }
        None => {
            let mut options = CaptureOptions::new();
            if let Some(display) = &args.display {
                options = options.with_display(display.as_str());
            }
            if let Some(timeout) = args.timeout {
                options = options.with_timeout(timeout);
            }
            capture::capture(&options).context("Capturing the screen")?
        }
    };

    img.save_with_format(&args.out, image::ImageFormat::Png)
        .with_context(|| format!("Writing {}", args.out.display()))?;
    log::info!(
        "Wrote {}x{} screenshot to {}",
        img.width(),
        img.height(),
        args.out.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("xwd-screenshot").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.out, PathBuf::from("screenshot.png"));
        assert!(args.display.is_none());
        assert!(args.timeout.is_none());
        assert!(args.input.is_none());
    }

    #[test]
    fn all_options() {
        let args = parse(&[
            "--out", "shot.png", "--display", ":1", "--timeout", "2.5", "--input", "in.xwd",
        ])
        .unwrap();
        assert_eq!(args.out, PathBuf::from("shot.png"));
        assert_eq!(args.display.as_deref(), Some(":1"));
        assert_eq!(args.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(args.input, Some(PathBuf::from("in.xwd")));
    }

    #[test]
    fn help() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn bad_arguments() {
        assert!(parse(&["--out"]).is_err());
        assert!(parse(&["--timeout", "soon"]).is_err());
        assert!(parse(&["--timeout=-1"]).is_err());
        assert!(parse(&["--frobnicate"]).is_err());
    }

    #[test]
    fn command_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
