//! What each subcommand does.

use crate::cli::{Command, IndexArgs};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::TryStreamExt;
use lode_config::Config;
use lode_index::{Engine, EngineOptions};
use lode_mines::{Directory, Exclusions, Records, TarArchive};
use std::io::Write;
use tracing::{info, instrument};

pub async fn run(command: Command, config: &Config) -> Result<()> {
    let engine = open(config).await?;
    let result = match command {
        Command::Index(args) => index(&engine, args).await,
        Command::Query { sql } => query(&engine, sql).await,
        Command::Mines => mines(&engine).await,
    };
    engine.close().await;
    result
}

#[instrument(skip_all, fields(index = %config.index.display(), read_only = config.read_only))]
async fn open(config: &Config) -> Result<Engine> {
    TarArchive::set_cache_size(config.cache_size);
    Records::set_cache_size(config.cache_size);
    EngineOptions::new()
        .kinds(lode_mines::kinds())
        .read_only(config.read_only)
        .open(&config.index)
        .await
        .or_raise(|| ErrorKind::Open)
}

async fn index(engine: &Engine, args: IndexArgs) -> Result<()> {
    let exclusions =
        Exclusions::new(args.exclude_suffixes, args.exclude_regexes).or_raise(|| ErrorKind::Exclusions)?;
    let directory = Directory::new(args.root)
        .with_exclusions(exclusions)
        .with_relative(args.relative.into());
    let directory = engine.register(directory, args.force).await.or_raise(|| ErrorKind::Index)?;
    info!(root = %directory.root().display(), walked = directory.passes() > 0, "directory registered");
    if args.archives {
        engine
            .register(TarArchive::new(), args.force)
            .await
            .or_raise(|| ErrorKind::Index)?;
    }
    if args.records {
        engine
            .register(Records::new(), args.force)
            .await
            .or_raise(|| ErrorKind::Index)?;
    }
    let files = engine
        .query("SELECT COUNT(*) FROM files")
        .fetch_scalar()
        .await
        .or_raise(|| ErrorKind::Query)?
        .and_then(|count| count.as_i64())
        .unwrap_or_default();
    let mut out = std::io::stdout().lock();
    writeln!(out, "{files} files indexed").or_raise(|| ErrorKind::Output)
}

async fn query(engine: &Engine, sql: String) -> Result<()> {
    let mut rows = engine.query(sql).fetch();
    let mut out = std::io::stdout().lock();
    while let Some(row) = rows.try_next().await.or_raise(|| ErrorKind::Query)? {
        let line: Vec<String> = row.values().iter().map(ToString::to_string).collect();
        writeln!(out, "{}", line.join("\t")).or_raise(|| ErrorKind::Output)?;
    }
    Ok(())
}

async fn mines(engine: &Engine) -> Result<()> {
    let records = engine.mine_records().await.or_raise(|| ErrorKind::Query)?;
    let mut out = std::io::stdout().lock();
    for record in records {
        let indexed = record
            .last_indexed_at
            .map(|at| at.unix_timestamp().to_string())
            .unwrap_or_else(|| "never".to_string());
        writeln!(
            out,
            "{}\t{}\tv{}\t{}\t{}",
            record.id, record.config.kind, record.config.version, indexed, record.config.payload
        )
        .or_raise(|| ErrorKind::Output)?;
    }
    Ok(())
}
