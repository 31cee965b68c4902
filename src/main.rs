use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use warehouse_loader::runner::{
    DelimitedConfig, LoadArgs, MalformedRowPolicy, RunReport, WarehouseConfig,
    run_load_with_cancel,
};

#[derive(Parser, Clone)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Load every matching file in a directory into one warehouse table
    Load {
        /// Directory containing the source files
        #[arg(short, long)]
        source_dir: PathBuf,

        /// File extension to load (csv, tsv, ...)
        #[arg(short, long, default_value = "csv")]
        extension: String,

        /// Destination table, fully qualified: database.schema.table
        #[arg(short, long)]
        table: String,

        /// Field delimiter (single character, or \t)
        #[arg(long, default_value = ",")]
        delimiter: String,

        /// Quote character
        #[arg(long, default_value = "\"")]
        quote: String,

        /// Treat the first row as data rather than a header
        #[arg(long)]
        no_header: bool,

        /// Rows per upload batch
        #[arg(short, long, default_value = "10000")]
        chunk_size: usize,

        /// Concurrent batch uploads per file
        #[arg(long, default_value = "4")]
        upload_concurrency: usize,

        /// Files processed in parallel
        #[arg(long, default_value = "1")]
        file_concurrency: usize,

        /// Malformed-row policy: skip (count and continue) or fail (fail the file)
        #[arg(long, default_value = "skip")]
        on_malformed: String,

        /// Warehouse host (overrides WAREHOUSE_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Warehouse port (overrides WAREHOUSE_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Warehouse username (overrides WAREHOUSE_USER)
        #[arg(short, long)]
        username: Option<String>,

        /// Warehouse database (overrides WAREHOUSE_DATABASE)
        #[arg(long)]
        database: Option<String>,

        /// Quiet mode - minimal output, only the final summary
        #[arg(short, long)]
        quiet: bool,

        /// Emit the run report as JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Command::Load {
            source_dir,
            extension,
            table,
            delimiter,
            quote,
            no_header,
            chunk_size,
            upload_concurrency,
            file_concurrency,
            on_malformed,
            host,
            port,
            username,
            database,
            quiet,
            json,
        } => {
            run_loader(
                source_dir,
                extension,
                table,
                delimiter,
                quote,
                no_header,
                chunk_size,
                upload_concurrency,
                file_concurrency,
                on_malformed,
                host,
                port,
                username,
                database,
                quiet,
                json,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loader(
    source_dir: PathBuf,
    extension: String,
    table: String,
    delimiter: String,
    quote: String,
    no_header: bool,
    chunk_size: usize,
    upload_concurrency: usize,
    file_concurrency: usize,
    on_malformed: String,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    database: Option<String>,
    quiet: bool,
    json: bool,
) -> ExitCode {
    // Initialize tracing based on quiet mode
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if quiet {
        EnvFilter::new("warehouse_loader=warn,sqlx=off")
    } else {
        EnvFilter::new("warehouse_loader=info,sqlx=off")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if !quiet {
        println!("Warehouse Data Loader");
        println!("=====================");
        println!("Source: {} (*.{})", source_dir.display(), extension);
        println!("Table: {}", table);
        println!("Chunk size: {} rows", chunk_size);
        println!();
    }

    let report = match build_and_run(
        source_dir,
        extension,
        table,
        delimiter,
        quote,
        no_header,
        chunk_size,
        upload_concurrency,
        file_concurrency,
        on_malformed,
        host,
        port,
        username,
        database,
        quiet,
    )
    .await
    {
        Ok(report) => report,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    println!();
    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => {
                eprintln!("error: failed to serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        print!("{}", report);
    }

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[allow(clippy::too_many_arguments)]
async fn build_and_run(
    source_dir: PathBuf,
    extension: String,
    table: String,
    delimiter: String,
    quote: String,
    no_header: bool,
    chunk_size: usize,
    upload_concurrency: usize,
    file_concurrency: usize,
    on_malformed: String,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    database: Option<String>,
    quiet: bool,
) -> anyhow::Result<RunReport> {
    let warehouse = WarehouseConfig::resolve(host, port, username, database)?;
    let delimited = DelimitedConfig::from_flags(&delimiter, &quote, !no_header)?;
    let policy = MalformedRowPolicy::parse(&on_malformed)?;

    let load_args = LoadArgs {
        warehouse,
        source_dir,
        extension,
        target_table: table,
        delimited,
        chunk_size,
        upload_concurrency,
        file_concurrency,
        policy,
        quiet,
    };

    // Ctrl-C stops dispatching new work; in-flight uploads finish or time
    // out, and a partial report is still printed.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping dispatch");
                cancel.cancel();
            }
        });
    }

    run_load_with_cancel(load_args, cancel).await
}
