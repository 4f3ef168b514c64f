use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use corpusmix::{
    DatasetSpec, InspectReport, LocalFileUpstream, MixRatioTable, Pipeline, PipelineConfig,
    ShardManifest, read_records,
};
use flate2::Compression;
use flate2::write::GzEncoder;
use parquet::file::reader::{FileReader, SerializedFileReader};
use tempfile::tempdir;

const TOKENIZER: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {"[PAD]": 0, "[UNK]": 1, "hello": 2, "world": 3, "again": 4},
        "unk_token": "[UNK]"
    }
}"#;

fn write_gz_lines(path: &Path, lines: &[String]) {
    let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    for line in lines {
        writeln!(encoder, "{line}").unwrap();
    }
    encoder.finish().unwrap();
}

fn upstream_fixture(root: &Path) {
    let pile = root.join("pile");
    fs::create_dir_all(&pile).unwrap();
    let mut lines = Vec::new();
    for idx in 0..8 {
        let (set, text) = if idx % 2 == 0 {
            ("PubMed Abstracts", "Hello   WORLD!!")
        } else {
            ("Wikipedia (en)", "hello again, mail me at someone@example.org")
        };
        lines.push(
            serde_json::json!({"text": text, "meta": {"pile_set_name": set, "idx": idx}}).to_string(),
        );
    }
    write_gz_lines(&pile.join("train-00000.jsonl.gz"), &lines);
}

fn config_in(root: &Path) -> PipelineConfig {
    let tokenizer_path = root.join("tokenizer.json");
    fs::write(&tokenizer_path, TOKENIZER).unwrap();

    let mut config = PipelineConfig::default();
    config.datasets = vec![
        DatasetSpec::new("pubmed", "pile").with_filter("pile_set_name", "PubMed Abstracts"),
        DatasetSpec::new("wikipedia", "pile").with_filter("pile_set_name", "Wikipedia (en)"),
    ];
    config.paths.data_dir = root.join("data");
    config.paths.processed_dir = root.join("processed");
    config.paths.shard_dir = root.join("shards");
    config.paths.checkpoint_file = root.join("config").join("checkpoint.json");
    config.mixing.ratios = Some(MixRatioTable::from_pairs([("pubmed", 1.0), ("wikipedia", 0.5)]));
    config.sharding.shard_size = 3;
    config.sharding.as_arrow = true;
    config.inspect.enabled = true;
    config.inspect.output_dir = root.join("reports");
    config.inspect.check_duplicates = true;
    config.inspect.check_pii = true;
    config.preprocessing.tokenizer_model = Some(tokenizer_path.display().to_string());
    config.preprocessing.max_length = 4;
    config.preprocessing.remove_punct = false;
    config
}

#[test]
fn full_run_from_local_files() {
    let dir = tempdir().unwrap();
    upstream_fixture(&dir.path().join("upstream"));
    let pipeline = Pipeline::new(config_in(dir.path())).unwrap();
    let upstream = LocalFileUpstream::new("local", dir.path().join("upstream"));
    let normalizer = pipeline.build_normalizer().unwrap();
    assert!(normalizer.has_tokenizer());

    let summary = pipeline.run(&upstream, &normalizer).unwrap();
    assert!(summary.retrieved.iter().all(|(_, outcome)| outcome.count == 4));
    assert_eq!(summary.mix.total_examples, 6);
    assert_eq!(summary.mix.shards.len(), 2);

    let processed = read_records(&pipeline.processed_path(&pipeline.config().datasets[0])).unwrap();
    assert_eq!(processed[0].text, "hello world!");
    assert_eq!(processed[0].input_ids.as_deref(), Some(&[2, 3, 1][..]));

    let shard_dir = dir.path().join("shards");
    for stem in ["shard_000", "shard_001"] {
        let records = read_records(&shard_dir.join(format!("{stem}.jsonl"))).unwrap();
        assert_eq!(records.len(), 3);
        let reader = SerializedFileReader::new(File::open(shard_dir.join(format!("{stem}.parquet"))).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 3);
    }
    let manifest = ShardManifest::load(&shard_dir).unwrap();
    assert_eq!(manifest.source_counts.get("pubmed"), Some(&4));
    assert_eq!(manifest.source_counts.get("wikipedia"), Some(&2));

    let report: InspectReport = serde_json::from_slice(
        &fs::read(dir.path().join("reports").join("inspect_report.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(report.num_samples, 6);
    assert_eq!(report.duplicate_count, Some(4));
    assert_eq!(report.pii_hits, Some(2));
    assert!(dir.path().join("reports").join("length_hist.json").exists());
    assert!(dir.path().join("reports").join("length_hist.svg").exists());
}

#[test]
fn rerun_appends_nothing_and_reshards_identically() {
    let dir = tempdir().unwrap();
    upstream_fixture(&dir.path().join("upstream"));
    let pipeline = Pipeline::new(config_in(dir.path())).unwrap();
    let upstream = LocalFileUpstream::new("local", dir.path().join("upstream"));
    let normalizer = pipeline.build_normalizer().unwrap();

    pipeline.run(&upstream, &normalizer).unwrap();
    let first = read_records(&dir.path().join("shards").join("shard_000.jsonl")).unwrap();
    let again = pipeline.run(&upstream, &normalizer).unwrap();
    assert!(again.retrieved.iter().all(|(_, outcome)| outcome.count == 0));
    let second = read_records(&dir.path().join("shards").join("shard_000.jsonl")).unwrap();
    assert_eq!(first, second);
}
