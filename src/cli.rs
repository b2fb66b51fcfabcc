//! Command-line surface.
//!
//! Flag-style modes rather than subcommands: exactly one of `--scan`,
//! `--generate` or `--reorder` drives a run, with `--reorder-output` as
//! the only cross-mode combination. A leading `@file` argument is
//! expanded into its whitespace-separated (optionally quoted) contents
//! before parsing.

use std::path::PathBuf;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;

use crate::audio;
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::generate::{GenerateConfig, Generator, Method};
use crate::m3u;
use crate::scan::{ScanConfig, Scanner};

#[derive(Parser, Debug)]
#[command(
    name = "mixweave",
    version,
    allow_negative_numbers = true,
    about = "Generate playlists from a scanned music library.\n\
             Scan once to build the similarity index, then generate or\n\
             reorder playlists from seed tracks in that library."
)]
struct Cli {
    /// Scan mode: music library root (repeatable).
    #[arg(long, value_name = "PATH")]
    scan: Vec<PathBuf>,

    /// Generate mode: 'append' grows the playlist from a lookback window
    /// over the tail, 'connect' bridges between consecutive inputs,
    /// 'cluster' grows it from the original inputs only.
    #[arg(long, value_name = "METHOD")]
    generate: Option<Method>,

    /// Reorder mode: rearrange the input tracks into a smoother listening
    /// order.
    #[arg(long)]
    reorder: bool,

    /// Input track path (repeatable).
    #[arg(short, long, value_name = "TRACK")]
    input: Vec<String>,

    /// Directory of cached vectors.
    #[arg(short = 'd', long, value_name = "DIR")]
    vec_dir: Option<PathBuf>,

    /// Path to the embedding model file (scan mode).
    #[arg(short, long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// External decoder binary used when native decoding fails (scan
    /// mode); probed at startup.
    #[arg(long, value_name = "PATH")]
    ffmpeg: Option<String>,

    /// Tracks aggregated per batch (scan mode).
    #[arg(short, long, value_name = "N", default_value_t = 100)]
    batch_size: usize,

    /// Cosine neighborhood radius for the aggregation weights (scan mode).
    #[arg(short, long, value_name = "E", default_value_t = 0.001)]
    epsilon: f32,

    /// Worker thread cap; -1 uses all hardware threads (scan mode).
    #[arg(short, long, value_name = "J", default_value_t = -1)]
    jobs: i32,

    /// Number of songs in the playlist (per connected pair in 'connect').
    #[arg(long, value_name = "N", default_value_t = 10)]
    nsongs: usize,

    /// How many trailing songs feed the next pick ('append' only).
    #[arg(short, long, value_name = "L", default_value_t = 3)]
    lookback: usize,

    /// Noise level; higher values wander further. Values between 0 and 1
    /// work best.
    #[arg(long, value_name = "SIGMA", default_value_t = 0.0)]
    noise: f32,

    /// Playlist file to write; printed to stdout when omitted.
    #[arg(short = 'o', long, value_name = "PATH")]
    m3u_out: Option<PathBuf>,

    /// Reorder the generated playlist before writing it.
    #[arg(long)]
    reorder_output: bool,

    /// Desired first song of the reordered playlist.
    #[arg(long, value_name = "TRACK")]
    first: Option<String>,
}

pub fn run() -> Result<()> {
    let argv = expand_arg_file(std::env::args().collect())?;
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return Ok(());
        }
        Err(err) => return Err(Error::Usage(err.to_string())),
    };
    dispatch(cli)
}

/// Expand a single leading `@file` argument into the arguments stored in
/// that file.
fn expand_arg_file(args: Vec<String>) -> Result<Vec<String>> {
    let Some(file) = args.get(1).and_then(|a| a.strip_prefix('@')) else {
        return Ok(args);
    };
    let text = std::fs::read_to_string(file)
        .map_err(|e| Error::Usage(format!("cannot read argument file {file}: {e}")))?;
    let mut argv = vec![args[0].clone()];
    argv.extend(split_args(&text));
    Ok(argv)
}

/// Split on whitespace, honouring single and double quotes.
fn split_args(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn dispatch(cli: Cli) -> Result<()> {
    let is_scan = !cli.scan.is_empty();
    let is_generate = cli.generate.is_some();

    if cli.reorder && is_generate {
        return Err(Error::Usage(
            "--reorder cannot be combined with --generate; use --reorder-output instead"
                .to_string(),
        ));
    }
    let modes = [is_scan, is_generate, cli.reorder]
        .iter()
        .filter(|&&m| m)
        .count();
    if modes == 0 {
        return Err(Error::Usage(
            "one of --scan, --generate or --reorder is required".to_string(),
        ));
    }
    if modes > 1 {
        return Err(Error::Usage(
            "--scan, --generate and --reorder are mutually exclusive".to_string(),
        ));
    }
    if cli.reorder_output && !is_generate {
        return Err(Error::Usage(
            "--reorder-output requires --generate".to_string(),
        ));
    }
    if cli.first.is_some() && !cli.reorder {
        return Err(Error::Usage("--first requires --reorder".to_string()));
    }

    if is_scan {
        run_scan(cli)
    } else if is_generate {
        run_generate(cli)
    } else {
        run_reorder(cli)
    }
}

fn require_vec_dir(cli: &Cli, mode: &str) -> Result<PathBuf> {
    cli.vec_dir
        .clone()
        .ok_or_else(|| Error::Usage(format!("{mode} requires --vec-dir")))
}

fn require_inputs(cli: &Cli, mode: &str) -> Result<()> {
    if cli.input.is_empty() {
        return Err(Error::Usage(format!("{mode} requires at least one --input")));
    }
    Ok(())
}

fn run_scan(cli: Cli) -> Result<()> {
    let vec_dir = require_vec_dir(&cli, "--scan")?;
    let model = cli
        .model
        .clone()
        .ok_or_else(|| Error::Usage("--scan requires --model".to_string()))?;
    if cli.batch_size < 1 {
        return Err(Error::Usage("--batch-size must be at least 1".to_string()));
    }
    if !(cli.epsilon > 0.0) {
        return Err(Error::Usage("--epsilon must be positive".to_string()));
    }
    if let Some(ffmpeg) = &cli.ffmpeg {
        audio::probe_decoder(ffmpeg)?;
    }

    let embedder = Arc::new(Embedder::load(&model)?);
    let config = ScanConfig {
        batch_size: cli.batch_size,
        epsilon: cli.epsilon,
        jobs: cli.jobs,
        shuffle_seed: None,
    };
    let scanner = Scanner::new(embedder, vec_dir, config, cli.ffmpeg);
    let stats = scanner.scan(&cli.scan)?;

    println!(
        "scan completed: {} files found, {} embedded, {} cached, {} failed, {} pruned, {} aggregated",
        stats.discovered, stats.embedded, stats.skipped, stats.failed, stats.pruned, stats.aggregated
    );
    Ok(())
}

fn run_generate(cli: Cli) -> Result<()> {
    let vec_dir = require_vec_dir(&cli, "--generate")?;
    require_inputs(&cli, "--generate")?;
    let Some(method) = cli.generate else {
        return Err(Error::Usage("--generate requires a method".to_string()));
    };
    if cli.nsongs < 1 {
        return Err(Error::Usage("--nsongs must be at least 1".to_string()));
    }
    if cli.lookback < 1 {
        return Err(Error::Usage("--lookback must be at least 1".to_string()));
    }
    if cli.noise < 0.0 {
        return Err(Error::Usage("--noise must not be negative".to_string()));
    }

    let generator = Generator::load(&vec_dir)?;
    let config = GenerateConfig {
        nsongs: cli.nsongs,
        lookback: cli.lookback,
        noise: cli.noise,
    };
    let mut playlist = generator.generate(method, &cli.input, &config);
    if cli.reorder_output {
        playlist = generator.reorder(&playlist, None);
    }
    emit(&playlist, cli.m3u_out.as_deref())
}

fn run_reorder(cli: Cli) -> Result<()> {
    let vec_dir = require_vec_dir(&cli, "--reorder")?;
    require_inputs(&cli, "--reorder")?;

    let generator = Generator::load(&vec_dir)?;
    let playlist = generator.reorder(&cli.input, cli.first.as_deref());
    emit(&playlist, cli.m3u_out.as_deref())
}

fn emit(playlist: &[String], m3u_out: Option<&std::path::Path>) -> Result<()> {
    match m3u_out {
        Some(path) => {
            let written = m3u::save(path, playlist)?;
            eprintln!("playlist written to {}", written.display());
        }
        None => {
            for track in playlist {
                println!("{track}");
            }
        }
    }
    Ok(())
}
