use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Crypto portfolio ingestion: import transaction history from exchanges
/// and blockchains, normalize it, link cross-source transfers, and enrich
/// with historical prices.
#[derive(Parser)]
#[command(name = "exitbook", version, about)]
pub struct Cli {
    /// Data directory (defaults to EXITBOOK_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Emit the JSON response envelope instead of human output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import transaction history from a source
    Import {
        /// Source to import from (chain or exchange name)
        #[arg(long)]
        source: String,

        /// Blockchain address or extended public key
        #[arg(long)]
        address: Option<String>,

        /// Directory of CSV exports (repeatable)
        #[arg(long = "csv-dir")]
        csv_dirs: Vec<PathBuf>,

        /// Start of the import window (epoch milliseconds)
        #[arg(long)]
        since: Option<i64>,

        /// End of the import window (epoch milliseconds)
        #[arg(long)]
        until: Option<i64>,

        /// Run the full pipeline (process, link, enrich, overrides) after
        /// the import
        #[arg(long)]
        full: bool,
    },

    /// Transform stored records into canonical transactions
    Process {
        #[arg(long)]
        source: String,

        /// Addresses the import was scoped to (blockchain sources)
        #[arg(long)]
        address: Vec<String>,
    },

    /// Price enrichment
    #[command(subcommand)]
    Enrich(EnrichCommand),

    /// Cross-source transaction links
    #[command(subcommand)]
    Links(LinksCommand),

    /// Movement prices
    #[command(subcommand)]
    Prices(PricesCommand),

    /// Inspect stored state
    #[command(subcommand)]
    View(ViewCommand),

    /// Registered providers and their health
    #[command(subcommand)]
    Providers(ProvidersCommand),

    /// Recompute per-asset totals and compare against provider balances
    Verify {
        #[arg(long)]
        source: Option<String>,

        /// Address to fetch reported balances for
        #[arg(long)]
        address: Option<String>,
    },

    /// Export canonical transactions
    Export {
        /// Output format: json or csv
        #[arg(long, default_value = "json")]
        format: String,

        /// Restrict to one source
        #[arg(long)]
        source: Option<String>,

        /// Output file (stdout when omitted)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum EnrichCommand {
    /// Run the four-stage price enrichment pipeline
    Prices {
        /// Restrict to one asset symbol
        #[arg(long)]
        asset: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum LinksCommand {
    /// List links, optionally filtered
    View {
        /// Filter: suggested, confirmed, rejected, or gaps
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        min_confidence: Option<f64>,

        #[arg(long)]
        max_confidence: Option<f64>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        verbose: bool,
    },

    /// Run the matcher over the current transaction set
    Match,

    /// Confirm a suggested link
    Confirm { id: String },

    /// Reject a suggested link
    Reject { id: String },
}

#[derive(Subcommand)]
pub enum PricesCommand {
    /// List movement prices
    View {
        /// Only movements without a price
        #[arg(long)]
        missing_only: bool,
    },

    /// Record a manual price override for a movement
    Set {
        /// Transaction fingerprint
        #[arg(long)]
        fingerprint: String,

        #[arg(long)]
        asset: String,

        #[arg(long)]
        price: String,

        #[arg(long, default_value = "USD")]
        currency: String,
    },
}

#[derive(Subcommand)]
pub enum ViewCommand {
    /// Import sessions with cursor detail
    Sessions {
        #[arg(long)]
        source: Option<String>,
    },

    /// Canonical transactions
    Transactions {
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// All links
    Links,
}

#[derive(Subcommand)]
pub enum ProvidersCommand {
    /// List registered providers, including ones disabled by missing keys
    List,
}
