//! Operator CLI for ridbag directories.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use ridbag::config::RidbagConfig;
use ridbag::primitives::pager::{AtomicOperationsManager, Pager, Synchronous};
use ridbag::storage::btree::{BTreeOptions, EdgeKey, RangeIter, RidBagTree};
use ridbag::types::{Result as RidbagResult, RidbagError};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ridbag",
    version,
    about = "Inspect and edit rid-bag trees",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(value_name = "DIR", help = "Database directory")]
    dir: PathBuf,

    #[arg(long, global = true, env = "RIDBAG_CONFIG", help = "TOML config file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "ridbag", help = "Tree name")]
    tree: String,

    #[arg(long, global = true, value_enum, help = "Pager synchronous mode override")]
    synchronous: Option<SynchronousArg>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show pager counters and every tree's size
    Stats,
    /// Walk a tree and check its structure
    Verify,
    /// Print entries in key order
    Dump {
        #[arg(long, value_name = "BAG:CLUSTER:POS", help = "Lowest key, inclusive")]
        from: Option<EdgeKey>,
        #[arg(long, value_name = "BAG:CLUSTER:POS", help = "Highest key, inclusive")]
        to: Option<EdgeKey>,
        #[arg(long, help = "Descending order")]
        desc: bool,
        #[arg(long, help = "Stop after this many entries")]
        limit: Option<usize>,
    },
    /// Look up one edge
    Get {
        #[arg(value_name = "BAG:CLUSTER:POS")]
        key: EdgeKey,
    },
    /// Insert or replace one edge, creating the tree when missing
    Put {
        #[arg(value_name = "BAG:CLUSTER:POS")]
        key: EdgeKey,
        #[arg(allow_negative_numbers = true)]
        value: i32,
    },
    /// Remove one edge
    Remove {
        #[arg(value_name = "BAG:CLUSTER:POS")]
        key: EdgeKey,
    },
    /// Flush committed pages and truncate the WAL
    Checkpoint,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SynchronousArg {
    Full,
    Normal,
    Off,
}

impl From<SynchronousArg> for Synchronous {
    fn from(value: SynchronousArg) -> Self {
        match value {
            SynchronousArg::Full => Synchronous::Full,
            SynchronousArg::Normal => Synchronous::Normal,
            SynchronousArg::Off => Synchronous::Off,
        }
    }
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = RidbagConfig::load(cli.config.as_deref())?;
    if let Some(sync) = cli.synchronous {
        config.pager.synchronous = sync.into();
    }
    let pager = match cli.command {
        Command::Put { .. } => Pager::open_or_create(&cli.dir, config.pager.clone())?,
        _ => Pager::open(&cli.dir, config.pager.clone())?,
    };
    let manager = Arc::new(AtomicOperationsManager::new(Arc::new(pager)));
    let format = cli.format;

    match cli.command {
        Command::Stats => print_stats(&manager, &config.btree, format)?,
        Command::Verify => {
            let tree = RidBagTree::load(&manager, &cli.tree, config.btree)?;
            let report = tree.verify()?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => {
                    println!(
                        "{}: {} entries ({} recorded), {} leaves, {} internal, depth {}",
                        tree.name(),
                        report.entries,
                        report.recorded_size,
                        report.leaves,
                        report.internal_buckets,
                        report.depth
                    );
                    for error in &report.errors {
                        println!("  error: {error}");
                    }
                }
            }
            if !report.is_ok() {
                return Ok(ExitCode::from(2));
            }
        }
        Command::Dump {
            from,
            to,
            desc,
            limit,
        } => {
            let tree = RidBagTree::load(&manager, &cli.tree, config.btree)?;
            let ascending = !desc;
            let entries: RangeIter<'_, EdgeKey, i32> = match (from, to) {
                (Some(from), Some(to)) => {
                    tree.iterate_entries_between(&from, true, &to, true, ascending)
                }
                (Some(from), None) => tree.iterate_entries_major(&from, true, ascending),
                (None, Some(to)) => tree.iterate_entries_minor(&to, true, ascending),
                (None, None) if ascending => tree.iter(),
                (None, None) => tree.iter_rev(),
            };
            for entry in entries.take(limit.unwrap_or(usize::MAX)) {
                let (key, value) = entry?;
                print_entry(format, &key, Some(value));
            }
        }
        Command::Get { key } => {
            let tree = RidBagTree::load(&manager, &cli.tree, config.btree)?;
            print_entry(format, &key, tree.get(&key)?);
        }
        Command::Put { key, value } => {
            let tree = load_or_create(&manager, &cli.tree, config.btree)?;
            let inserted = tree.put(&key, &value)?;
            match format {
                OutputFormat::Json => println!("{}", json!({ "inserted": inserted })),
                OutputFormat::Text => {
                    println!("{}", if inserted { "inserted" } else { "updated" })
                }
            }
        }
        Command::Remove { key } => {
            let tree = RidBagTree::load(&manager, &cli.tree, config.btree)?;
            print_entry(format, &key, tree.remove(&key)?);
        }
        Command::Checkpoint => {
            manager.checkpoint()?;
            let stats = manager.pager().stats();
            match format {
                OutputFormat::Json => {
                    println!("{}", json!({ "checkpoints": stats.checkpoints }))
                }
                OutputFormat::Text => println!("checkpoint complete"),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load_or_create(
    manager: &Arc<AtomicOperationsManager>,
    name: &str,
    options: BTreeOptions,
) -> RidbagResult<RidBagTree> {
    match RidBagTree::load(manager, name, options.clone()) {
        Err(err) if matches!(err.root_cause(), RidbagError::NotFound) => {
            RidBagTree::create(manager, name, options)
        }
        other => other,
    }
}

fn print_entry(format: OutputFormat, key: &EdgeKey, value: Option<i32>) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "rid_bag_id": key.rid_bag_id,
                "target_cluster": key.target_cluster,
                "target_position": key.target_position,
                "value": value,
            })
        ),
        OutputFormat::Text => match value {
            Some(value) => println!("{key}\t{value}"),
            None => println!("{key}\t(absent)"),
        },
    }
}

fn print_stats(
    manager: &Arc<AtomicOperationsManager>,
    options: &BTreeOptions,
    format: OutputFormat,
) -> Result<(), Box<dyn Error>> {
    let pager = manager.pager();
    let mut trees = Vec::new();
    for (file, name) in pager.files() {
        let tree = RidBagTree::load(manager, &name, options.clone())?;
        trees.push(json!({
            "name": name,
            "file_id": file.0,
            "entries": tree.size()?,
            "first_key": tree.first_key()?.map(|key| key.to_string()),
            "last_key": tree.last_key()?.map(|key| key.to_string()),
        }));
    }
    pager.emit_tracing();
    let stats = pager.stats();
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "page_size": pager.page_size(),
                "next_lsn": pager.next_lsn().0,
                "pager": stats,
                "trees": trees,
            }))?
        ),
        OutputFormat::Text => {
            println!("page size:         {}", pager.page_size());
            println!("next lsn:          {}", pager.next_lsn().0);
            println!("recovered commits: {}", stats.recovered_commits);
            println!("cache hits/misses: {}/{}", stats.hits, stats.misses);
            for tree in &trees {
                println!(
                    "tree {}: {} entries, first {}, last {}",
                    tree["name"].as_str().unwrap_or_default(),
                    tree["entries"],
                    tree["first_key"],
                    tree["last_key"]
                );
            }
        }
    }
    Ok(())
}
