use clap::{Parser, Subcommand};
use crawler::pullrequest::{PullRequestFetcher, GITHUB_URL};
use crawler::{crawlers_from_config, CrawlerConfig, GithubGraphQl, GraphQlConfig};
use monocle::webapp::{self, AppState};
use monocle::{dump_prefix, write_dump};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::{
    wait_for_backend, ElasticBackend, ElasticConfig, MonocleDb, QueryArgs, QueryParams,
    SearchBackend, StoreError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "monocle")]
#[command(about = "Collect and query statistics about GitHub pull requests")]
struct Cli {
    /// Log level, used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "INFO")]
    loglevel: String,
    /// Seconds to wait for Elasticsearch to answer at startup
    #[arg(long, global = true, default_value_t = 10)]
    elastic_timeout: u64,
    /// Elasticsearch host:port
    #[arg(long, global = true, env = "ELASTIC_CONN", default_value = "localhost:9200")]
    elastic_conn: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the crawlers described in a configuration file
    Crawler {
        /// Path to the YAML configuration
        #[arg(long)]
        config: PathBuf,
    },
    /// Manage an index
    Dbmanage {
        /// The index name
        #[arg(long)]
        index: String,
        /// Delete every document of the repositories matching this regexp
        #[arg(long)]
        delete_repository: String,
    },
    /// Run a named query and print the result
    Dbquery {
        /// The index name
        #[arg(long)]
        index: String,
        /// The query name
        #[arg(long)]
        name: String,
        #[command(flatten)]
        args: QueryFlags,
    },
    /// Serve the query API over HTTP
    Webapp {
        #[arg(long, default_value = webapp::DEFAULT_HOST)]
        host: String,
        #[arg(long, default_value_t = webapp::DEFAULT_PORT)]
        port: u16,
        /// Value of the Access-Control-Allow-Origin header
        #[arg(long, env = "ALLOW_ORIGIN", default_value = "*")]
        allow_origin: String,
    },
    /// Fetch a single pull request and dump the raw and extracted data
    DumpPr {
        /// GitHub API token
        #[arg(long, env = "GITHUB_TOKEN")]
        token: String,
        #[arg(long)]
        org: String,
        #[arg(long)]
        repository: String,
        /// Pull request number
        #[arg(long)]
        id: u64,
        /// Write the dumps in this directory instead of printing them
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct QueryFlags {
    /// Repository regexps, comma separated
    #[arg(long, default_value = ".*")]
    repositories: String,
    /// Histogram interval (3h, 1d, 1w, ...)
    #[arg(long)]
    interval: Option<String>,
    /// Only documents created on or after this date (YYYY-MM-DD)
    #[arg(long)]
    gte: Option<String>,
    /// Only documents created on or before this date (YYYY-MM-DD)
    #[arg(long)]
    lte: Option<String>,
    /// Only events on changes created on or after this date
    #[arg(long = "on_cc_gte")]
    on_cc_gte: Option<String>,
    /// Only events on changes created on or before this date
    #[arg(long = "on_cc_lte")]
    on_cc_lte: Option<String>,
    /// Apply the gte/lte range to change creation dates too
    #[arg(long)]
    ec_same_date: bool,
    /// Document types, comma separated
    #[arg(long = "type")]
    etype: Option<String>,
    /// Change ids, comma separated
    #[arg(long)]
    change_ids: Option<String>,
    /// Authors, comma separated
    #[arg(long)]
    authors: Option<String>,
    /// Review approval value
    #[arg(long)]
    approval: Option<String>,
    /// Number of items to return
    #[arg(long)]
    size: Option<usize>,
    /// Offset of the first item to return
    #[arg(long)]
    from: Option<usize>,
    /// Authors to leave out, comma separated
    #[arg(long)]
    exclude_authors: Option<String>,
}

impl From<QueryFlags> for QueryArgs {
    fn from(flags: QueryFlags) -> Self {
        QueryArgs {
            repositories: Some(flags.repositories),
            gte: flags.gte,
            lte: flags.lte,
            on_cc_gte: flags.on_cc_gte,
            on_cc_lte: flags.on_cc_lte,
            ec_same_date: flags.ec_same_date.then_some(true),
            etype: flags.etype,
            change_ids: flags.change_ids,
            authors: flags.authors,
            exclude_authors: flags.exclude_authors,
            approval: flags.approval,
            interval: flags.interval,
            size: flags.size,
            from: flags.from,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.loglevel.to_lowercase()))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Crawler { config } => {
            let config = CrawlerConfig::from_file(&config)?;
            let backend = connect(&cli.elastic_conn, cli.elastic_timeout).await?;
            run_crawlers(&config, backend).await?;
        }
        Commands::Dbmanage {
            index,
            delete_repository,
        } => {
            let backend = connect(&cli.elastic_conn, cli.elastic_timeout).await?;
            let db = MonocleDb::new(backend, index);
            let deleted = db.delete_repository(&delete_repository).await?;
            info!(
                "Deleted {} documents of {} from {}",
                deleted,
                delete_repository,
                db.index()
            );
        }
        Commands::Dbquery { index, name, args } => {
            let backend = connect(&cli.elastic_conn, cli.elastic_timeout).await?;
            let db = MonocleDb::new(backend, index);
            let args = QueryArgs::from(args);
            let result = run_query(&db, &name, &args).await;
            if !print_query_result(&mut std::io::stdout().lock(), result)? {
                std::process::exit(1);
            }
        }
        Commands::Webapp {
            host,
            port,
            allow_origin,
        } => {
            let backend = connect(&cli.elastic_conn, cli.elastic_timeout).await?;
            webapp::serve(&host, port, AppState::new(backend), &allow_origin).await?;
        }
        Commands::DumpPr {
            token,
            org,
            repository,
            id,
            output_dir,
        } => {
            dump_pr(token, &org, &repository, id, output_dir).await?;
        }
    }

    Ok(())
}

async fn connect(
    conn: &str,
    timeout: u64,
) -> Result<Arc<dyn SearchBackend>, Box<dyn std::error::Error>> {
    let backend = ElasticBackend::new(ElasticConfig::from_conn(conn))?;
    wait_for_backend(&backend, Duration::from_secs(timeout)).await?;
    Ok(Arc::new(backend))
}

async fn run_query(
    db: &MonocleDb,
    name: &str,
    args: &QueryArgs,
) -> Result<serde_json::Value, StoreError> {
    let params = QueryParams::from_args(args)?;
    db.run_named_query(name, &args.repositories(), &params).await
}

/// Print a query result, or why the query was refused. Returns false when
/// the query was refused.
fn print_query_result(
    out: &mut impl Write,
    result: Result<serde_json::Value, StoreError>,
) -> Result<bool, Box<dyn std::error::Error>> {
    match result {
        Ok(value) => {
            writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
            Ok(true)
        }
        Err(e @ (StoreError::UnknownQuery { .. } | StoreError::InvalidParam { .. })) => {
            writeln!(out, "Unable to run query: {}", e)?;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_crawlers(
    config: &CrawlerConfig,
    backend: Arc<dyn SearchBackend>,
) -> Result<(), Box<dyn std::error::Error>> {
    let crawlers = crawlers_from_config(config, backend)?;
    if crawlers.is_empty() {
        warn!("No GitHub organization configured, nothing to crawl");
        return Ok(());
    }

    let handles: Vec<_> = crawlers
        .into_iter()
        .map(|crawler| {
            info!("Starting crawler for {}", crawler.name());
            tokio::spawn(async move { crawler.run().await })
        })
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("Stopping {} crawler(s)", handles.len());
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn dump_pr(
    token: String,
    org: &str,
    repository: &str,
    id: u64,
    output_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let graphql = GithubGraphQl::new(GraphQlConfig::new(token))?;
    let fetcher =
        PullRequestFetcher::new(Arc::new(graphql), GITHUB_URL, org, Some(repository.to_string()));
    let (raw, documents) = fetcher.get_one(org, repository, id).await?;

    match output_dir {
        Some(dir) => {
            let (raw_path, extracted_path) =
                write_dump(&dir, &dump_prefix(org, repository, id), &raw, &documents)?;
            info!("Wrote {} and {}", raw_path.display(), extracted_path.display());
        }
        None => {
            println!("{}", serde_json::to_string_pretty(&raw)?);
            println!("{}", serde_json::to_string_pretty(&documents)?);
        }
    }
    Ok(())
}
