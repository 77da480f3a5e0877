use anyhow::Context;
use clap::Parser;
use serial_txn::{sqlite::SqliteStore, Options, TxnContext};
use std::path::PathBuf;

/// serial-txn applies key/value operations to a SQLite database,
/// through a single transaction owned by a dedicated thread.
#[derive(Debug, clap::Parser)]
#[clap(author, version, about)]
struct Args {
    /// Path of the SQLite database. An in-memory database is used if not set.
    #[clap(long, env = "SERIAL_TXN_DATABASE")]
    database: Option<PathBuf>,
    /// Tracing filter directives for logs written to stderr.
    #[clap(long, env = "SERIAL_TXN_LOG", default_value = "warn")]
    log: String,
    /// Format of logs written to stderr.
    #[clap(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Put each KEY=VALUE pair, and then commit.
    Put {
        #[clap(required = true, value_parser = parse_pair)]
        pairs: Vec<(String, String)>,
    },
    /// Print the value of each key.
    Get {
        #[clap(required = true)]
        keys: Vec<String>,
    },
    /// Delete each key, and then commit.
    Delete {
        #[clap(required = true)]
        keys: Vec<String>,
    },
    /// Print all keys and values.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log, args.log_format);

    let store = match &args.database {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_in_memory()?,
    };
    let options = Options::default().with_observer(|name, error| {
        tracing::error!(%name, error = %format!("{error:#}"), "transaction operation failed");
    });

    let ctx = TxnContext::new(store, options);
    ctx.start().await?;

    let result = run(&ctx, args.command).await;
    ctx.dispose().await;

    result
}

async fn run(ctx: &TxnContext<SqliteStore>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Put { pairs } => {
            let completions = pairs
                .into_iter()
                .map(|(key, value)| ctx.submit(move |txn| txn.put(&key, &value)))
                .collect::<Result<Vec<_>, _>>()?;

            futures::future::try_join_all(completions).await?;
            ctx.run(|txn| txn.commit()).await?;
        }
        Command::Get { keys } => {
            let values = ctx
                .run(move |txn| {
                    keys.into_iter()
                        .map(|key| Ok((txn.get(&key)?, key)))
                        .collect::<anyhow::Result<Vec<_>>>()
                })
                .await?;

            for (value, key) in values {
                match value {
                    Some(value) => println!("{key}\t{value}"),
                    None => tracing::warn!(%key, "key not found"),
                }
            }
        }
        Command::Delete { keys } => {
            let deleted = ctx
                .run(move |txn| {
                    let mut deleted = 0;
                    for key in keys {
                        if txn.delete(&key)? {
                            deleted += 1;
                        }
                    }
                    txn.commit()?;
                    Ok(deleted)
                })
                .await?;

            tracing::info!(deleted, "deleted keys");
        }
        Command::List => {
            for (key, value) in ctx.run(|txn| txn.list()).await? {
                println!("{key}\t{value}");
            }
        }
    }
    Ok(())
}

fn parse_pair(arg: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = arg
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, not {arg:?}"))?;

    Ok((key.to_string(), value.to_string()))
}

fn init_tracing(filter: &str, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339());

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .init(),
    }
}
