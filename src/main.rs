use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod eid;
mod paths;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::{AppFactory, SearchBackend};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();
    let paths = AppFactory::get_paths()?;
    let config = AppFactory::create_config(&paths.base_path)?;

    match args.command {
        cli::Command::Serve { listen } => {
            let engine = AppFactory::create_engine(&config)?;
            web::start_daemon(engine, &config, listen)?;
        }

        cli::Command::CreateIndex { owner, collection } => {
            let backend = AppFactory::create_backend(&config)?;
            let outcome = backend.create_index(owner, collection)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        cli::Command::Embed {
            owner,
            collection,
            images,
        } => {
            let backend = AppFactory::create_backend(&config)?;
            let report = backend.append_vectors(owner, collection, &images)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        cli::Command::Search {
            query,
            top_k,
            targets,
        } => {
            let backend = AppFactory::create_backend(&config)?;
            let results = backend.search(&query, top_k, &targets)?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        cli::Command::DeleteIndex { owner, collection } => {
            let backend = AppFactory::create_backend(&config)?;
            backend.delete_index(owner, collection)?;
        }

        cli::Command::RetryFailed {} => {
            let backend = AppFactory::create_backend(&config)?;
            let summary = backend.retry_failed()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        cli::Command::Failed {} => {
            let journal = app::failed::FailedRequestJournal::new(
                storage::DataDir::new(config.base_path())?,
                config.retry.max_attempts,
            );
            let entries = journal.entries()?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    Ok(())
}
