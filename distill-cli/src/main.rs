use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use distill_api::{Distill, DistillConfig, Resolution, UrlRequest, CONFIG_FILE_NAME};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod table;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Table format (default)
    Table,
    /// Pretty JSON
    Json,
    /// JSON Lines (one record per line)
    Jsonl,
    /// CSV rows in backup layout
    Csv,
}

#[derive(Parser)]
#[command(name = "distill")]
#[command(about = "Distill URL shortener", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Datastore directory, overriding the configuration
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Shorten a url
    Shorten {
        /// Target url
        url: String,
        /// Use this id instead of generating one
        #[arg(long)]
        id: Option<String>,
        /// Maximum number of resolutions (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_requests: u64,
        /// Seconds the url stays valid once active (0 = forever)
        #[arg(long, default_value = "0")]
        ttl: u64,
        /// Expiration date (RFC 3339)
        #[arg(long, value_parser = parse_timestamp)]
        expire_on: Option<DateTime<Utc>>,
        /// Activation date (RFC 3339)
        #[arg(long, value_parser = parse_timestamp)]
        active_from: Option<DateTime<Utc>>,
        /// Fallback once expired
        #[arg(long)]
        expired_url: Option<String>,
        /// Fallback once the request limit is reached
        #[arg(long)]
        exhausted_url: Option<String>,
        /// Fallback before activation
        #[arg(long)]
        inactive_url: Option<String>,
    },
    /// Resolve an id, counting the hit
    Resolve {
        id: String,
    },
    /// Show a record without counting a hit
    Info {
        id: String,
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// Delete a url
    Delete {
        id: String,
    },
    /// List every record
    List {
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// Show global statistics
    Stats {
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// Recompute statistics from the stored records
    ResetStats,
    /// Import urls from a CSV file (url,id,max_requests,ttl,expire_on)
    Import {
        file: PathBuf,
    },
    /// Write a backup (.bin or .csv)
    Backup {
        file: PathBuf,
    },
    /// Restore a backup (.bin or .csv)
    Restore {
        file: PathBuf,
    },
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {}", e))
}

fn load_config(cli: &Cli) -> Result<DistillConfig> {
    let mut config = if cli.config.exists() {
        DistillConfig::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        debug!("No {} found, using defaults", cli.config.display());
        DistillConfig::default()
    };
    if let Some(db) = &cli.db {
        config = config.with_path(db.clone());
    }
    Ok(config)
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::InitConfig { force } = cli.command {
        if force {
            DistillConfig::default()
                .write_to_file(&cli.config)
                .context("Failed to write configuration")?;
        } else if !DistillConfig::write_default_if_missing(&cli.config)
            .context("Failed to write configuration")?
        {
            bail!(
                "{} already exists (use --force to overwrite)",
                cli.config.display()
            );
        }
        println!("✓ Configuration written to {}", cli.config.display());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let distill = Distill::open(config).context("Failed to open datastore")?;

    match cli.command {
        Commands::InitConfig { .. } => {}

        Commands::Shorten {
            url,
            id,
            max_requests,
            ttl,
            expire_on,
            active_from,
            expired_url,
            exhausted_url,
            inactive_url,
        } => {
            let mut request = UrlRequest::new(url)
                .with_max_requests(max_requests)
                .with_ttl(ttl);
            if let Some(id) = id {
                request = request.with_id(id);
            }
            if let Some(at) = expire_on {
                request = request.with_expire_on(at);
            }
            if let Some(at) = active_from {
                request = request.with_active_from(at);
            }
            if let Some(url) = expired_url {
                request = request.with_expired_url(url);
            }
            if let Some(url) = exhausted_url {
                request = request.with_exhausted_url(url);
            }
            if let Some(url) = inactive_url {
                request = request.with_inactive_url(url);
            }
            let id = distill.upsert_url(request).context("Failed to shorten url")?;
            println!("{}", id);
        }

        Commands::Resolve { id } => {
            match distill.get_url_redirect(&id).context("Failed to resolve id")? {
                Resolution::Redirect(target) => println!("{}", target),
                Resolution::Fallback { verdict, target } => match target {
                    Some(target) => println!("{} ({})", target, verdict),
                    None => println!("✗ {}", verdict),
                },
            }
        }

        Commands::Info { id, output } => {
            let record = distill.get_url_info(&id).context("Failed to read record")?;
            print_records(std::slice::from_ref(&record), output, true)?;
        }

        Commands::Delete { id } => {
            distill.delete_url(&id).context("Failed to delete url")?;
            println!("✓ Deleted {}", id);
        }

        Commands::List { output } => {
            let records = distill.list_urls().context("Failed to list records")?;
            print_records(&records, output, false)?;
            if matches!(output, OutputFormat::Table) {
                println!();
                println!("Count: {}", records.len());
            }
        }

        Commands::Stats { output } => {
            let stats = distill.get_stats();
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Jsonl => println!("{}", serde_json::to_string(&stats)?),
                OutputFormat::Table | OutputFormat::Csv => {
                    println!("{}", table::format_stats_table(&stats))
                }
            }
        }

        Commands::ResetStats => {
            let stats = distill.reset_stats().context("Failed to reset statistics")?;
            println!("✓ {}", stats);
        }

        Commands::Import { file } => {
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?,
            );
            let count = distill.import_csv(reader).context("Import failed")?;
            println!("✓ Imported {} urls", count);
        }

        Commands::Backup { file } => {
            let count = distill.backup(&file).context("Backup failed")?;
            println!("✓ Backup of {} entries written to {}", count, file.display());
        }

        Commands::Restore { file } => {
            let count = distill.restore(&file).context("Restore failed")?;
            println!("✓ Restored {} entries from {}", count, file.display());
        }
    }

    distill.close().context("Failed to close datastore")?;
    Ok(())
}

fn print_records(
    records: &[distill_api::Record],
    output: OutputFormat,
    single: bool,
) -> Result<()> {
    match output {
        OutputFormat::Table if single => {
            for record in records {
                let verdict = distill_api::lifecycle::evaluate(record, Utc::now());
                println!("{}", table::format_record_table(record, verdict));
            }
        }
        OutputFormat::Table => println!("{}", table::format_records_table(records)),
        OutputFormat::Json if single => {
            for record in records {
                println!("{}", serde_json::to_string_pretty(record)?);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(records)?),
        OutputFormat::Jsonl => {
            for record in records {
                println!("{}", serde_json::to_string(record)?);
            }
        }
        OutputFormat::Csv => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            distill_api::csv::export_records(&mut lock, records, true)?;
        }
    }
    Ok(())
}
