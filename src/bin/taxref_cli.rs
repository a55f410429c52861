use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use taxref_lookups::{
    resolve_records, resolve_records_parallel, DatasetLookup, FileCache, NullValues, RawRecord,
    Result, Taxonomy,
};

#[derive(Parser)]
#[command(
    name = "taxref-lookups",
    version,
    about = "NCBI taxdump lookups for genome annotation pipeline selection"
)]
struct Cli {
    /// NCBI nodes.dmp file from taxdump
    #[arg(long)]
    nodes: PathBuf,

    /// NCBI names.dmp file from taxdump
    #[arg(long)]
    names: PathBuf,

    /// BUSCO placement file (gzip or tar.gz)
    #[arg(long)]
    taxids_to_busco_dataset_mapping: PathBuf,

    /// Two-column file mapping NCBI taxids to Augustus datasets
    #[arg(long)]
    taxids_to_augustus_dataset_mapping: PathBuf,

    /// Directory to cache the NCBI taxonomy after processing
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Rank to resolve records to
    #[arg(long, default_value = "species")]
    resolve_to_rank: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dataset and genetic-code lookups for explicit taxids
    Query {
        /// Taxids to look up
        #[arg(required = true)]
        taxids: Vec<u32>,

        /// Write the JSON result here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Resolve sample records and group them by taxon
    Batch {
        /// JSON array of records, each an object with an "id" plus
        /// free-text string fields
        input: PathBuf,

        /// Write the JSON result here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Write rejected record ids here, one per line
        #[arg(long)]
        rejected: Option<PathBuf>,

        /// Resolve records one at a time instead of in parallel
        #[arg(long)]
        serial: bool,
    },
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&[
                "⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏",
            ])
            .template("{spinner:.green} {msg}")
            .expect("Invalid spinner template"),
    );
    bar.set_message(message.to_string());
    bar
}

fn write_json<T: serde::Serialize>(value: &T, output: Option<&PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let cache_dir = cli.cache_dir.unwrap_or_else(FileCache::default_dir);
    let cache = FileCache::open(cache_dir)?;

    let bar = spinner("Loading reference data...");
    let taxonomy = Taxonomy::load(
        &cli.nodes,
        &cli.names,
        &cli.taxids_to_busco_dataset_mapping,
        &cli.taxids_to_augustus_dataset_mapping,
        &cache,
        &cli.resolve_to_rank,
    )?;
    bar.finish_with_message("Reference data ready.");

    match cli.command {
        Command::Query { taxids, output } => {
            let mut lookups: BTreeMap<u32, DatasetLookup> = BTreeMap::new();
            for taxid in taxids {
                lookups.insert(taxid, taxonomy.lookup_datasets(taxid)?);
            }
            write_json(&lookups, output.as_ref())?;
        }
        Command::Batch {
            input,
            output,
            rejected,
            serial,
        } => {
            let records: Vec<RawRecord> = serde_json::from_reader(File::open(&input)?)?;
            let null_values = NullValues::default();

            let bar = spinner(&format!("Resolving {} records...", records.len()));
            let results = if serial {
                resolve_records(&records, &taxonomy, &null_values)
            } else {
                resolve_records_parallel(&records, &taxonomy, &null_values)
            };
            bar.finish_with_message(format!(
                "Resolved {} records ({} grouped keys, {} rejected).",
                results.processed,
                results.grouped.len(),
                results.rejected.len()
            ));

            if let Some(path) = rejected {
                let mut f = File::create(path)?;
                for id in &results.rejected {
                    writeln!(f, "{id}")?;
                }
            }
            write_json(&results, output.as_ref())?;
        }
    }

    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run(Cli::parse()) {
        log::error!("{err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
