use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use motion_core::list_clips;

use crate::monitor::{self, MonitorConfig, RunArgs};

/// Motion-triggered camera recorder with a live MJPEG feed.
#[derive(Debug, Parser)]
#[command(name = "motion-cam", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Capture, detect motion, record clips and serve the web UI.
    Run(RunArgs),
    /// List recorded clips, newest first.
    Clips(ClipsArgs),
}

#[derive(Debug, Args)]
pub struct ClipsArgs {
    /// Directory holding recorded clips.
    #[arg(long = "output", short = 'o', value_name = "DIR", default_value = "output")]
    pub output: PathBuf,
    /// Print the listing as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn handle_commands(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = MonitorConfig::try_from(args)?;
            monitor::run(config)
        }
        Command::Clips(args) => print_clips(&args, &mut std::io::stdout().lock()),
    }
}

fn print_clips(args: &ClipsArgs, out: &mut impl Write) -> Result<()> {
    let clips = list_clips(&args.output)
        .with_context(|| format!("Failed to list clips in {}", args.output.display()))?;
    if args.json {
        serde_json::to_writer_pretty(&mut *out, &clips).context("Failed to encode clip list")?;
        writeln!(out)?;
        return Ok(());
    }
    if clips.is_empty() {
        writeln!(out, "no clips in {}", args.output.display())?;
    }
    for clip in &clips {
        writeln!(out, "{}  {}", clip.display, clip.path.display())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_clips_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["20240105-101010.clip", "20240106-000000.clip", "notes.clip"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let args = ClipsArgs {
            output: dir.path().to_path_buf(),
            json: false,
        };
        let mut out = Vec::new();
        print_clips(&args, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("06.01.2024 - 00:00:00"));
        assert!(lines[1].starts_with("05.01.2024 - 10:10:10"));
    }

    #[test]
    fn json_listing_omits_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240105-101010.clip"), b"").unwrap();
        let args = ClipsArgs {
            output: dir.path().to_path_buf(),
            json: true,
        };
        let mut out = Vec::new();
        print_clips(&args, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{"stem": "20240105-101010", "display": "05.01.2024 - 10:10:10"}])
        );
    }

    #[test]
    fn run_subcommand_parses() {
        let cli = Cli::try_parse_from(["motion-cam", "run", "--source", "clip.mp4", "-p", "9000"])
            .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.source, "clip.mp4");
        assert_eq!(args.port, 9000);
    }
}
