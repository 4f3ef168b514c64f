use std::error::Error;
use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, Subcommand, error::ErrorKind};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::constants::pipeline::CONFIG_ENV_VAR;
use crate::errors::PipelineError;
use crate::pipeline::{MixSummary, Pipeline};
use crate::source::{LocalFileUpstream, UpstreamSource};

#[derive(Debug, Parser)]
#[command(
    name = "corpusmix",
    disable_help_subcommand = true,
    about = "Retrieve, normalize, mix, and shard a multi-source text corpus",
    long_about = "Build a training corpus from several upstream datasets: resumable retrieval into per-source JSONL, text normalization and tokenization, seeded ratio mixing, optional inspection, and fixed-size shards.",
    after_help = "The configuration file is resolved from --config, then the CORPUSMIX_CONFIG environment variable, then built-in defaults. Flags override the loaded configuration."
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "JSON configuration file"
    )]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Shuffle seed override")]
    seed: Option<u64>,
    #[arg(
        long = "shard-size",
        global = true,
        value_parser = parse_shard_size,
        help = "Maximum records per shard; 0 writes no shards"
    )]
    shard_size: Option<usize>,
    #[arg(
        long = "as-arrow",
        global = true,
        help = "Also write each shard as a parquet archive"
    )]
    as_arrow: bool,
    #[arg(long = "data-dir", global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,
    #[arg(long = "processed-dir", global = true, value_name = "DIR")]
    processed_dir: Option<PathBuf>,
    #[arg(long = "shard-dir", global = true, value_name = "DIR")]
    shard_dir: Option<PathBuf>,
    #[arg(
        long = "local-root",
        global = true,
        value_name = "PATH",
        help = "Read upstream datasets from local files instead of the hub"
    )]
    local_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Command {
    /// Pull configured datasets into per-source raw JSONL files.
    Retrieve,
    /// Clean, normalize, and tokenize retrieved files.
    Prepare,
    /// Mix processed files, inspect the mix, and write shards.
    Mix,
    /// Retrieve, prepare, and mix in one pass.
    Run,
}

/// Entry point of the `corpusmix` binary. `args` excludes the program name.
pub fn run<I>(args: I) -> Result<(), Box<dyn Error>>
where
    I: IntoIterator<Item = String>,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let Some(cli) = parse_cli::<Cli, _>(std::iter::once("corpusmix".to_string()).chain(args))?
    else {
        return Ok(());
    };

    let config_path = resolve_config_path(cli.config.clone(), std::env::var_os(CONFIG_ENV_VAR));
    let config = load_config(&cli, config_path)?;
    let pipeline = Pipeline::new(config)?;

    match cli.command {
        Command::Retrieve => {
            let upstream = build_upstream(&cli)?;
            for (name, outcome) in pipeline.retrieve(upstream.as_ref())? {
                println!(
                    "{name}: {} new records ({} bytes), checkpoint at {}",
                    outcome.count, outcome.total_bytes, outcome.last_index
                );
            }
        }
        Command::Prepare => {
            let normalizer = pipeline.build_normalizer()?;
            for (name, written) in pipeline.prepare(&normalizer)? {
                println!("{name}: {written} processed records");
            }
        }
        Command::Mix => {
            let summary = pipeline.mix(pipeline.processed_sources())?;
            print_mix_summary(&pipeline, &summary);
        }
        Command::Run => {
            let upstream = build_upstream(&cli)?;
            let normalizer = pipeline.build_normalizer()?;
            let summary = pipeline.run(upstream.as_ref(), &normalizer)?;
            for (name, outcome) in &summary.retrieved {
                println!("{name}: retrieved {} new records", outcome.count);
            }
            print_mix_summary(&pipeline, &summary.mix);
        }
    }
    Ok(())
}

/// `--config` wins over the environment variable.
fn resolve_config_path(flag: Option<PathBuf>, env: Option<OsString>) -> Option<PathBuf> {
    flag.or_else(|| env.filter(|value| !value.is_empty()).map(PathBuf::from))
}

fn load_config(cli: &Cli, path: Option<PathBuf>) -> Result<PipelineConfig, PipelineError> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.mixing.seed = seed;
    }
    if let Some(shard_size) = cli.shard_size {
        config.sharding.shard_size = shard_size;
    }
    if cli.as_arrow {
        config.sharding.as_arrow = true;
    }
    if let Some(dir) = &cli.data_dir {
        config.paths.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.processed_dir {
        config.paths.processed_dir = dir.clone();
    }
    if let Some(dir) = &cli.shard_dir {
        config.paths.shard_dir = dir.clone();
    }
    Ok(config)
}

fn build_upstream(cli: &Cli) -> Result<Box<dyn UpstreamSource>, PipelineError> {
    if let Some(root) = &cli.local_root {
        return Ok(Box::new(LocalFileUpstream::new("local", root.clone())));
    }
    hub_upstream()
}

#[cfg(feature = "huggingface")]
fn hub_upstream() -> Result<Box<dyn UpstreamSource>, PipelineError> {
    use crate::source::{HubDatasetConfig, HubDatasetUpstream};
    Ok(Box::new(HubDatasetUpstream::new(
        "hub",
        HubDatasetConfig::default(),
    )))
}

#[cfg(not(feature = "huggingface"))]
fn hub_upstream() -> Result<Box<dyn UpstreamSource>, PipelineError> {
    Err(PipelineError::Configuration(
        "built without the huggingface feature; pass --local-root".into(),
    ))
}

fn print_mix_summary(pipeline: &Pipeline, summary: &MixSummary) {
    println!(
        "Mixed {} examples into {} shard(s) under {}",
        summary.total_examples,
        summary.shards.len(),
        pipeline.config().paths.shard_dir.display()
    );
    if let Some(composition) = &summary.composition {
        for share in &composition.per_source {
            println!(
                "  {:<16} {:>8} ({:.1}%)",
                share.source,
                share.count,
                share.share * 100.0
            );
        }
    }
    if let Some(report) = &summary.report {
        println!(
            "Inspection: {} samples, average length {:.1} words",
            report.num_samples, report.avg_length
        );
        if let Some(duplicates) = report.duplicate_count {
            println!("  duplicates: {duplicates}");
        }
        if let Some(hits) = report.pii_hits {
            println!("  records with PII matches: {hits}");
        }
    }
}

fn parse_shard_size(raw: &str) -> Result<usize, String> {
    raw.parse::<usize>().map_err(|_| {
        format!(
            "Could not parse --shard-size value '{}' as a non-negative integer",
            raw
        )
    })
}

fn parse_cli<T, I>(args: I) -> Result<Option<T>, Box<dyn Error>>
where
    T: Parser,
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    match T::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                err.print()?;
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Record, read_records, write_records};
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("corpusmix").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_loaded_config() {
        let cli = parse(&[
            "mix",
            "--seed",
            "7",
            "--shard-size",
            "10",
            "--shard-dir",
            "/tmp/shards",
        ]);
        assert_eq!(cli.command, Command::Mix);
        let config = load_config(&cli, None).unwrap();
        assert_eq!(config.mixing.seed, 7);
        assert_eq!(config.sharding.shard_size, 10);
        assert_eq!(config.paths.shard_dir, PathBuf::from("/tmp/shards"));
        assert_eq!(config.paths.data_dir, PipelineConfig::default().paths.data_dir);
    }

    #[test]
    fn zero_shard_size_parses_and_negative_is_rejected() {
        let cli = parse(&["mix", "--shard-size", "0"]);
        assert_eq!(load_config(&cli, None).unwrap().sharding.shard_size, 0);
        let result = Cli::try_parse_from(["corpusmix", "mix", "--shard-size", "-1"]);
        assert!(result.is_err());
    }

    #[test]
    fn config_flag_wins_over_environment() {
        let resolved = resolve_config_path(
            Some(PathBuf::from("flag.json")),
            Some(OsString::from("env.json")),
        );
        assert_eq!(resolved, Some(PathBuf::from("flag.json")));
        assert_eq!(
            resolve_config_path(None, Some(OsString::from("env.json"))),
            Some(PathBuf::from("env.json"))
        );
        assert_eq!(resolve_config_path(None, Some(OsString::new())), None);
    }

    #[test]
    fn help_exits_cleanly() {
        assert!(run(vec!["--help".to_string()]).is_ok());
    }

    #[test]
    fn retrieve_prepare_mix_from_local_root() {
        let dir = tempdir().unwrap();
        let upstream_dir = dir.path().join("upstream");
        let rows: Vec<Record> = (0..4)
            .map(|idx| Record::new(format!("Line number {idx}")))
            .collect();
        write_records(&upstream_dir.join("train.jsonl"), &rows).unwrap();

        let config = serde_json::json!({
            "datasets": [{"name": "local", "dataset": "corpus"}],
            "paths": {
                "checkpoint_file": dir.path().join("checkpoint.json"),
            },
            "inspect": {"output_dir": dir.path().join("inspect")},
            "preprocessing": {"tokenizer_model": null},
        });
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, config.to_string()).unwrap();

        let common = |command: &str| {
            vec![
                command.to_string(),
                "--config".into(),
                config_path.display().to_string(),
                "--local-root".into(),
                upstream_dir.display().to_string(),
                "--data-dir".into(),
                dir.path().join("data").display().to_string(),
                "--processed-dir".into(),
                dir.path().join("processed").display().to_string(),
                "--shard-dir".into(),
                dir.path().join("shards").display().to_string(),
                "--shard-size".into(),
                "3".into(),
            ]
        };
        run(common("retrieve")).unwrap();
        run(common("prepare")).unwrap();
        run(common("mix")).unwrap();

        let first = read_records(&dir.path().join("shards").join("shard_000.jsonl")).unwrap();
        let second = read_records(&dir.path().join("shards").join("shard_001.jsonl")).unwrap();
        assert_eq!(first.len() + second.len(), 4);
        assert!(first.iter().all(|record| record.source.as_deref() == Some("local")));
    }
}
