use std::sync::Arc;

use log::info;
use miette::{IntoDiagnostic, miette};
use skein_model::SyncConnection;
use skein_sync::destinations::{MemoryDestination, QdrantDestination};
use skein_sync::orchestrate::ActivityContext;
use skein_sync::sources::{FilesystemSourceFactory, StaticSourceFactory};
use skein_sync::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "help".to_string());
    let root = args.next();

    let config = EngineConfig::load().into_diagnostic()?;

    let mut builder = Engine::builder(config.clone())
        .source(Arc::new(FilesystemSourceFactory))
        .source(Arc::new(StaticSourceFactory));
    builder = match std::env::var("SKEIN_QDRANT_URL") {
        Ok(url) => builder.destination(Arc::new(QdrantDestination::new(
            url,
            std::env::var("SKEIN_QDRANT_API_KEY").ok(),
            config.external_call_timeout(),
        ))),
        Err(_) => builder.destination(Arc::new(MemoryDestination::new())),
    };
    let engine = builder.build()?;
    engine.store().jobs().fail_stranded().into_diagnostic()?;

    match command.as_str() {
        "sync" => {
            let root = root.ok_or_else(|| miette!("usage: skein-syncd sync <directory>"))?;
            // Reuse the existing connection for this directory so reruns
            // stay incremental; the ledger is scoped to the connection id.
            let existing = engine
                .store()
                .connections()
                .list()
                .into_diagnostic()?
                .into_iter()
                .find(|connection| connection.name == format!("fs:{root}"));
            let connection = match existing {
                Some(connection) => connection,
                None => {
                    let connection = filesystem_connection(&root);
                    engine.create_connection(&connection)?;
                    connection
                }
            };
            engine.validate_connection(connection.id).await?;

            let job = engine
                .run_sync(connection.id, ActivityContext::new())
                .await?;
            info!("Job {} finished as {}", job.id, job.status);
            println!(
                "{}: inserted={} updated={} kept={} skipped={} deleted={} failed={}",
                job.status,
                job.counters.inserted,
                job.counters.updated,
                job.counters.kept,
                job.counters.skipped,
                job.counters.deleted,
                job.counters.failed,
            );
            Ok(())
        }
        "validate" => {
            let root = root.ok_or_else(|| miette!("usage: skein-syncd validate <directory>"))?;
            let connection = filesystem_connection(&root);
            engine.create_connection(&connection)?;
            engine.validate_connection(connection.id).await?;
            println!("ok");
            Ok(())
        }
        _ => {
            eprintln!("usage: skein-syncd <sync|validate> <directory>");
            Ok(())
        }
    }
}

fn filesystem_connection(root: &str) -> SyncConnection {
    let mut connection =
        SyncConnection::new("local", format!("fs:{root}"), "filesystem", "local-files");
    connection.config = serde_json::json!({ "root": root });
    connection
}
