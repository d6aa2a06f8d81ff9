use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use exitbook::error::{Error, Result};
use exitbook::providers::Registry;
use exitbook::response::{Envelope, OutputMode};
use exitbook::{cli, commands};

fn main() {
    let cli = cli::Cli::parse();

    let filter = EnvFilter::try_from_env("EXITBOOK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let command_name = command_name(&cli.command);
    let started = Instant::now();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            let err = Error::Internal(format!("creating async runtime: {e}"));
            Envelope::err(&command_name, &err, started.elapsed().as_millis()).print(mode);
            std::process::exit(err.exit_code() as i32);
        }
    };

    let result = runtime.block_on(dispatch(cli));
    let duration = started.elapsed().as_millis();

    match result {
        Ok(data) => {
            Envelope::ok(&command_name, data, duration).print(mode);
        }
        Err(err) => {
            let code = err.exit_code() as i32;
            Envelope::err(&command_name, &err, duration).print(mode);
            std::process::exit(code);
        }
    }
}

async fn dispatch(cli: cli::Cli) -> Result<serde_json::Value> {
    // Adapters enroll here; the CLI itself ships none, so CSV imports work
    // out of the box and network imports need an embedding application.
    let registry = Registry::new();
    let ctx = commands::Context::new(cli.data_dir.as_deref(), registry)?;

    // Ctrl-C requests cooperative cancellation; the pipeline stops at the
    // next checkpoint with partial work committed.
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling at next checkpoint");
            cancel.cancel();
        }
    });

    match cli.command {
        cli::Command::Import {
            source,
            address,
            csv_dirs,
            since,
            until,
            full,
        } => {
            commands::import::run(&ctx, commands::import::ImportArgs {
                source,
                address,
                csv_dirs,
                since,
                until,
                full,
            })
            .await
        }
        cli::Command::Process { source, address } => {
            commands::import::process(&ctx, source, address).await
        }
        cli::Command::Enrich(cli::EnrichCommand::Prices { asset }) => {
            commands::enrich_prices(&ctx, asset).await
        }
        cli::Command::Links(command) => match command {
            cli::LinksCommand::View {
                status,
                min_confidence,
                max_confidence,
                limit,
                verbose,
            } => {
                commands::links::view(&ctx, commands::links::ViewArgs {
                    status,
                    min_confidence,
                    max_confidence,
                    limit,
                    verbose,
                })
                .await
            }
            cli::LinksCommand::Match => commands::links::run_matcher(&ctx).await,
            cli::LinksCommand::Confirm { id } => commands::links::review(&ctx, &id, true).await,
            cli::LinksCommand::Reject { id } => commands::links::review(&ctx, &id, false).await,
        },
        cli::Command::Prices(command) => match command {
            cli::PricesCommand::View { missing_only } => {
                commands::prices::view(&ctx, missing_only).await
            }
            cli::PricesCommand::Set {
                fingerprint,
                asset,
                price,
                currency,
            } => commands::prices::set(&ctx, fingerprint, asset, price, currency).await,
        },
        cli::Command::View(command) => match command {
            cli::ViewCommand::Sessions { source } => commands::view::sessions(&ctx, source).await,
            cli::ViewCommand::Transactions { source, limit } => {
                commands::view::transactions(&ctx, source, limit).await
            }
            cli::ViewCommand::Links => commands::view::links(&ctx).await,
        },
        cli::Command::Providers(cli::ProvidersCommand::List) => {
            commands::providers_list(&ctx).await
        }
        cli::Command::Verify { source, address } => {
            commands::verify(&ctx, source, address).await
        }
        cli::Command::Export {
            format,
            source,
            output,
        } => commands::export::run(&ctx, format, source, output).await,
    }
}

fn command_name(command: &cli::Command) -> String {
    match command {
        cli::Command::Import { .. } => "import",
        cli::Command::Process { .. } => "process",
        cli::Command::Enrich(_) => "enrich prices",
        cli::Command::Links(cli::LinksCommand::View { .. }) => "links view",
        cli::Command::Links(cli::LinksCommand::Match) => "links match",
        cli::Command::Links(cli::LinksCommand::Confirm { .. }) => "links confirm",
        cli::Command::Links(cli::LinksCommand::Reject { .. }) => "links reject",
        cli::Command::Prices(cli::PricesCommand::View { .. }) => "prices view",
        cli::Command::Prices(cli::PricesCommand::Set { .. }) => "prices set",
        cli::Command::View(cli::ViewCommand::Sessions { .. }) => "view sessions",
        cli::Command::View(cli::ViewCommand::Transactions { .. }) => "view transactions",
        cli::Command::View(cli::ViewCommand::Links) => "view links",
        cli::Command::Providers(_) => "providers list",
        cli::Command::Verify { .. } => "verify",
        cli::Command::Export { .. } => "export",
    }
    .to_string()
}
