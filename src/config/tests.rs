use super::*;
use tempfile::TempDir;

#[test]
fn default_config_is_valid() {
    let config = Config::default();
    config.validate().expect("default config should validate");
}

#[test]
fn load_missing_file_yields_defaults() {
    let dir = TempDir::new().expect("create temp dir");
    let config = Config::load(dir.path()).expect("load should succeed");

    assert_eq!(config.embedding.dimension, 768);
    assert_eq!(config.base_dir, dir.path());
}

#[test]
fn save_and_reload_round_trips() {
    let dir = TempDir::new().expect("create temp dir");
    let mut config = Config::default();
    config.base_dir = dir.path().to_path_buf();
    config.embedding.dimension = 1536;
    config.fusion.rrf_k = 30.0;
    config.sparse_search.tokenizer = SparseTokenizer::Whitespace;
    config.save().expect("save should succeed");

    let reloaded = Config::load(dir.path()).expect("reload should succeed");
    assert_eq!(reloaded.embedding.dimension, 1536);
    assert_eq!(reloaded.fusion.rrf_k, 30.0);
    assert_eq!(reloaded.sparse_search.tokenizer, SparseTokenizer::Whitespace);
}

#[test]
fn rejects_invalid_dimension() {
    let mut config = Config::default();
    config.embedding.dimension = 7;

    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidEmbeddingDimension(7))
    ));
}

#[test]
fn rejects_overlap_larger_than_chunk_size() {
    let mut config = Config::default();
    config.chunker.chunk_size = 100;
    config.chunker.chunk_overlap = 100;

    assert!(matches!(
        config.validate(),
        Err(ConfigError::OverlapTooLarge(100, 100))
    ));
}

#[test]
fn rejects_all_zero_weights() {
    let mut config = Config::default();
    config.fusion.vector_weight = 0.0;
    config.fusion.sparse_weight = 0.0;
    config.fusion.graph_weight = 0.0;

    assert!(matches!(
        config.validate(),
        Err(ConfigError::AllWeightsZero)
    ));
}

#[test]
fn weight_sum_ignores_disabled_modalities() {
    let mut config = Config::default();
    config.graph_search.enabled = false;
    config.fusion.graph_weight = 5.0;

    assert_eq!(config.enabled_weight_sum(), 2.0);
}

#[test]
fn learned_mode_requires_adapter_path() {
    let mut config = Config::default();
    config.reranker.mode = RerankerMode::Learned;
    config.reranker.adapter_path = None;

    assert!(matches!(
        config.validate(),
        Err(ConfigError::MissingAdapterPath(_))
    ));
}

#[test]
fn cloud_mode_requires_endpoint() {
    let mut config = Config::default();
    config.reranker.mode = RerankerMode::Cloud;
    config.reranker.cloud_endpoint = String::new();

    assert!(matches!(
        config.validate(),
        Err(ConfigError::MissingCloudEndpoint)
    ));
}

#[test]
fn modality_deadline_bounded_by_overall() {
    let mut config = Config::default();
    config.search.deadline_ms = 1000;
    config.search.modality_deadline_ms = 2000;

    assert!(matches!(
        config.validate(),
        Err(ConfigError::ModalityDeadlineTooLarge(2000, 1000))
    ));
}

#[test]
fn malformed_toml_is_rejected() {
    let dir = TempDir::new().expect("create temp dir");
    std::fs::write(dir.path().join("config.toml"), "embedding = { dimension = \"nope\" }")
        .expect("write config");

    assert!(Config::load(dir.path()).is_err());
}
