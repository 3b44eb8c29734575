//! convcache-tool: inspect cache files and drive converter processes.

use clap::{Parser, Subcommand};
use convcache::{CacheFile, ConverterConfig, ConverterProcess, Direction};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "convcache-tool")]
#[command(author = "Kaitu.io")]
#[command(version = "0.1.0")]
#[command(about = "Inspect conversion caches and run converter filters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the streams stored in a cache file
    Inspect {
        /// Cache file
        cache: PathBuf,
    },

    /// Print the converted chunks of one stream
    Dump {
        /// Cache file
        cache: PathBuf,

        /// Stream id
        #[arg(short, long)]
        stream: u64,

        /// Write chunk contents to stdout instead of a summary
        #[arg(short, long)]
        raw: bool,

        /// Only show chunks of one direction (client or server)
        #[arg(short, long)]
        direction: Option<Direction>,
    },

    /// Pipe stdin lines through a converter and print its output
    Run {
        /// Converter name used in log output
        #[arg(short, long, default_value = "converter")]
        name: String,

        /// Converter executable
        #[arg(short, long, conflicts_with = "config")]
        executable: Option<PathBuf>,

        /// Converter configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Remove every stream from a cache file
    Reset {
        /// Cache file
        cache: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Inspect { cache } => inspect(&cache),
        Commands::Dump {
            cache,
            stream,
            raw,
            direction,
        } => dump(&cache, stream, raw, direction),
        Commands::Run {
            name,
            executable,
            config,
        } => run(name, executable, config),
        Commands::Reset { cache } => reset(&cache),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn inspect(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let cache = CacheFile::open(path)?;
    let stats = cache.stats();
    println!(
        "{:?}: {} streams, {} bytes",
        cache.path(),
        stats.streams,
        stats.file_size
    );
    for id in cache.stream_ids() {
        if let Some(info) = cache.stream_info(id) {
            println!("{:>20}  offset {:>12}  size {:>10}", id, info.offset, info.size);
        }
    }
    Ok(())
}

fn dump(
    path: &Path,
    stream: u64,
    raw: bool,
    direction: Option<Direction>,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = CacheFile::open(path)?;
    if !cache.contains(stream) {
        return Err(format!("stream {} is not cached", stream).into());
    }
    let data = cache.data(stream)?;
    let selected = data
        .chunks
        .iter()
        .enumerate()
        .filter(|(_, chunk)| direction.map_or(true, |d| chunk.direction == d));

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if raw {
        for (_, chunk) in selected {
            out.write_all(&chunk.content)?;
        }
    } else {
        for (i, chunk) in selected {
            writeln!(out, "{:>6}  {:<16}  {} bytes", i, chunk.direction, chunk.len())?;
        }
        writeln!(
            out,
            "client: {} bytes, server: {} bytes",
            data.client_bytes, data.server_bytes
        )?;
    }
    out.flush()?;
    Ok(())
}

fn run(
    name: String,
    executable: Option<PathBuf>,
    config: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let process = match (executable, config) {
        (Some(executable), _) => ConverterProcess::new(&name, executable),
        (None, Some(config)) => ConverterProcess::from_config(&ConverterConfig::load(config)?),
        (None, None) => return Err("either --executable or --config is required".into()),
    };

    let name = process.name().to_string();
    let stdin = io::stdin();
    let payloads = stdin.lock().split(b'\n').map_while(|line| match line {
        Ok(mut line) => {
            line.push(b'\n');
            Some(line)
        }
        Err(e) => {
            log::warn!("Failed to read stdin: {}", e);
            None
        }
    });

    let lines = process.convert_all(payloads, |line| {
        let mut out = io::stdout().lock();
        out.write_all(line)?;
        out.write_all(b"\n")
    })?;
    log::info!("Converter {} produced {} lines", name, lines);
    Ok(())
}

fn reset(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let cache = CacheFile::open(path)?;
    let streams = cache.len();
    cache.reset()?;
    println!("Removed {} streams from {:?}", streams, path);
    Ok(())
}
