use super::{Cli, Command};
use anyhow::{Context, Result};
use chrono::Local;
use std::path::Path;
use std::process::ExitCode;
use tender_lifecycle::{MemoryStageStore, Migrator, MigratorConfig, RunOptions, RunReport};
use tracing::{error, info};
use uuid::Uuid;

pub async fn execute(cli: Cli) -> Result<ExitCode> {
    let mut config = MigratorConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config = config.database_url(url);
    }

    match cli.command {
        Command::Run {
            force_backup,
            skip_backup,
            today,
            registry,
        } => {
            if let Some(registry) = registry {
                config = config.only_registry(registry);
            }
            let options = RunOptions {
                force_backup,
                skip_backup,
                today,
            };
            run(&config, cli.memory_store.as_deref(), options).await
        }
        Command::Plan { today, registry } => {
            if let Some(registry) = registry {
                config = config.only_registry(registry);
            }
            let (migrator, _) = open(&config, cli.memory_store.as_deref()).await?;
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let planned = migrator.plan(today).await.context("dry run failed")?;
            println!("{}", serde_json::to_string_pretty(&planned)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Backup { force } => {
            let (migrator, _) = open(&config, cli.memory_store.as_deref()).await?;
            match migrator.backup(force).await.context("backup failed")? {
                Some(path) => println!("{}", path.display()),
                None => info!("no snapshot due"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Locate { registry, id } => {
            let (migrator, _) = open(&config, cli.memory_store.as_deref()).await?;
            match migrator.locate(registry, id).await? {
                Some(stage) => {
                    println!("{}", stage.label());
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("contract {} not found in any {} table", id, registry);
                    Ok(ExitCode::from(2))
                }
            }
        }
    }
}

async fn run(config: &MigratorConfig, memory_store: Option<&Path>, options: RunOptions) -> Result<ExitCode> {
    let report = match open(config, memory_store).await {
        Ok((mut migrator, memory)) => {
            let report = migrator.run(options).await;
            if let (Some(store), Some(path)) = (memory, memory_store) {
                let rows = store
                    .save(path)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!(rows, path = %path.display(), "memory store saved");
            }
            report
        }
        Err(err) => {
            error!(error = %err, "cannot open store");
            let today = options.today.unwrap_or_else(|| Local::now().date_naive());
            let mut report = RunReport::new(Uuid::new_v4(), today);
            report.fail(format!("{:#}", err));
            report.finish();
            report
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn open(config: &MigratorConfig, memory_store: Option<&Path>) -> Result<(Migrator, Option<MemoryStageStore>)> {
    match memory_store {
        Some(path) => {
            let builder = MemoryStageStore::builder().lock_wait_timeout(config.lock_wait_timeout());
            let store = if path.exists() {
                builder
                    .restore(path)
                    .with_context(|| format!("failed to restore {}", path.display()))?
            } else {
                builder.build()
            };
            Ok((Migrator::in_memory(store.clone(), config), Some(store)))
        }
        None => {
            let migrator = Migrator::connect(config)
                .await
                .context("failed to connect to PostgreSQL")?;
            Ok((migrator, None))
        }
    }
}
