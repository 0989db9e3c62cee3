mod decode;
mod info;

use std::io::stderr;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use spackit::pipeline::DecodeOpts;
use spackit::spacepacket::Apid;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode spacepacket files into per-APID tables.
    ///
    /// Packet layouts are read from JSON layout files. Packets with APIDs that do not
    /// have a layout are skipped and reported in the diagnostics.
    Decode {
        /// JSON layout file. May be specified more than once; when more than one file
        /// provides a layout for the same APID the last one wins.
        #[arg(short, long = "layouts", value_name = "path", required = true)]
        layouts: Vec<PathBuf>,

        /// Only decode these apids or apid ranges.
        ///
        /// This accepts a CSV of APIDs as well as ranges of the format <start>-<end>
        /// where start and end are inclusive. For example, you can specify
        /// --include 0,1,2,3,4,5,10,20,30 or --include 0-5,10,20,30
        #[arg(short, long, value_name = "csv", value_delimiter = ',')]
        include: Vec<String>,

        /// Prefix each record with the primary header fields.
        #[arg(long, action)]
        primary_header: bool,

        /// Number of decode threads. 0 uses one thread per available CPU.
        #[arg(short = 'j', long, default_value_t = 1)]
        threads: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: decode::Format,

        /// Input spacepacket file
        input: PathBuf,
    },
    /// Show information about a spacepacket file
    Info {
        /// Input spacepacket file
        input: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: info::Format,
    },
}

fn parse_number_ranges(list: &[String]) -> Result<Vec<u32>> {
    let rx = regex::Regex::new(r"^(?:(\d+)|(\d+)-(\d+))$")?;
    let mut values = Vec::default();
    for (i, s) in list.iter().enumerate() {
        let Some(cap) = rx.captures(s) else {
            bail!("invalid number or range at {i}: {s}");
        };

        if cap.get(1).is_some() {
            let x = cap[1]
                .parse::<u32>()
                .map_err(|_| anyhow!("invalid number value"))?;
            values.push(x);
        } else {
            let start = cap[2]
                .parse::<u32>()
                .map_err(|_| anyhow!("invalid range value"))?;
            let end = cap[3]
                .parse::<u32>()
                .map_err(|_| anyhow!("invalid range value"))?;
            if start >= end {
                bail!("invalid range at {i}: {s}")
            }
            values.extend(start..=end);
        }
    }

    Ok(values)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("SPACKIT_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Decode {
            layouts,
            include,
            primary_header,
            threads,
            format,
            input,
        } => {
            let include = parse_number_ranges(include)?
                .iter()
                .filter_map(|v| Apid::try_from(*v).ok())
                .collect::<Vec<Apid>>();
            debug!("including apids {:?}", include);

            let opts = DecodeOpts::new()
                .with_primary_header(*primary_header)
                .with_num_threads(*threads);
            decode::decode(input, layouts, &include, &opts, format)
        }
        Commands::Info { input, format } => info::info(input, format),
    }
}
