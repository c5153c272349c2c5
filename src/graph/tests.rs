use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::chunker::Chunker;
use crate::config::{ChunkerConfig, GraphSearchConfig, SparseSearchConfig};
use crate::loader::SourceFile;
use crate::providers::StaticChatModel;
use crate::store::{EntityKind, GraphStore, MemoryStore, RelKind};

fn auth_file() -> SourceFile {
    SourceFile {
        path: "auth.py".to_string(),
        content: r#"import db

def login(user, password):
    record = db.connect()
    return check_credentials(user, password)

def check_credentials(user, digest):
    return True

class Session(BaseSession):
    def refresh(self):
        return login(self.user, self.token)
"#
        .to_string(),
        language: Some("python".to_string()),
    }
}

fn db_file() -> SourceFile {
    SourceFile {
        path: "db.py".to_string(),
        content: "def connect():\n    return Connection()\n\nclass BaseSession:\n    pass\n"
            .to_string(),
        language: Some("python".to_string()),
    }
}

fn chunks_for(file: &SourceFile) -> Vec<crate::chunker::Chunk> {
    Chunker::new(ChunkerConfig::default())
        .chunk_file("c", file)
        .chunks
}

async fn build_corpus(config: GraphSearchConfig, chat: Option<Arc<dyn crate::providers::ChatModel>>) -> (Arc<MemoryStore>, GraphBuildStats) {
    let store = Arc::new(MemoryStore::new(SparseSearchConfig::default()));
    let builder = GraphBuilder::new(store.clone(), chat, None, config);
    let files = vec![
        (db_file(), chunks_for(&db_file())),
        (auth_file(), chunks_for(&auth_file())),
    ];
    let stats = builder
        .build("c", &files, &CancellationToken::new())
        .await
        .expect("graph build succeeds");
    (store, stats)
}

#[tokio::test]
async fn extracts_structural_entities() {
    let (store, stats) = build_corpus(GraphSearchConfig::default(), None).await;
    assert!(stats.entities_written > 0);

    let entities = store.all_entities("c").await.expect("all entities");
    let names: Vec<(&str, EntityKind)> = entities
        .iter()
        .map(|e| (e.name.as_str(), e.kind))
        .collect();

    assert!(names.contains(&("login", EntityKind::Function)));
    assert!(names.contains(&("Session", EntityKind::Class)));
    assert!(names.contains(&("auth", EntityKind::Module)));
    assert!(names.contains(&("connect", EntityKind::Function)));
}

#[tokio::test]
async fn resolves_calls_and_contains_edges() {
    let (store, _) = build_corpus(GraphSearchConfig::default(), None).await;
    let relationships = store.all_relationships("c").await.expect("all rels");

    let entities = store.all_entities("c").await.expect("all entities");
    let id_of = |name: &str| {
        entities
            .iter()
            .find(|e| e.name == name && e.kind != EntityKind::Module)
            .map(|e| e.entity_id.clone())
            .unwrap_or_default()
    };

    // login calls check_credentials (same file) and connect (cross-file).
    assert!(relationships.iter().any(|r| r.kind == RelKind::Calls
        && r.source_entity_id == id_of("login")
        && r.target_entity_id == id_of("check_credentials")));
    assert!(relationships.iter().any(|r| r.kind == RelKind::Calls
        && r.source_entity_id == id_of("login")
        && r.target_entity_id == id_of("connect")));
    assert!(relationships.iter().any(|r| r.kind == RelKind::Contains));
}

#[tokio::test]
async fn resolves_inherits_and_imports() {
    let (store, _) = build_corpus(GraphSearchConfig::default(), None).await;
    let relationships = store.all_relationships("c").await.expect("all rels");
    let entities = store.all_entities("c").await.expect("all entities");

    let session = entities
        .iter()
        .find(|e| e.name == "Session")
        .expect("Session entity");
    let base = entities
        .iter()
        .find(|e| e.name == "BaseSession")
        .expect("BaseSession entity");
    assert!(relationships.iter().any(|r| r.kind == RelKind::Inherits
        && r.source_entity_id == session.entity_id
        && r.target_entity_id == base.entity_id));

    let auth_module = entities
        .iter()
        .find(|e| e.kind == EntityKind::Module && e.qualified_name == "auth.py")
        .expect("auth module");
    let db_module = entities
        .iter()
        .find(|e| e.kind == EntityKind::Module && e.qualified_name == "db.py")
        .expect("db module");
    assert!(relationships.iter().any(|r| r.kind == RelKind::Imports
        && r.source_entity_id == auth_module.entity_id
        && r.target_entity_id == db_module.entity_id));
}

#[tokio::test]
async fn semantic_extraction_accepts_strict_shape() {
    let chat = Arc::new(StaticChatModel::new(
        r#"[{"name": "authentication", "kind": "concept", "description": "login flow"},
            {"name": "sessions", "kind": "concept"}]"#,
    ));
    let mut config = GraphSearchConfig::default();
    config.semantic_entities = true;

    let (store, stats) = build_corpus(config, Some(chat)).await;
    assert_eq!(stats.semantic_rejections, 0);

    let entities = store.all_entities("c").await.expect("all entities");
    assert!(entities
        .iter()
        .any(|e| e.kind == EntityKind::Concept && e.name == "authentication"));

    // Co-occurring concepts in one chunk gain related_to edges.
    let relationships = store.all_relationships("c").await.expect("all rels");
    assert!(relationships.iter().any(|r| r.kind == RelKind::RelatedTo));
}

#[tokio::test]
async fn described_entities_get_description_embeddings() {
    use crate::config::EmbeddingConfig;
    use crate::embedder::Embedder;
    use crate::providers::HashEmbedding;
    use tempfile::TempDir;

    let cache = TempDir::new().expect("create temp dir");
    let embedder = Arc::new(Embedder::new(
        Arc::new(HashEmbedding::new(64)),
        cache.path().to_path_buf(),
        EmbeddingConfig {
            dimension: 64,
            ..EmbeddingConfig::default()
        },
    ));
    let chat = Arc::new(StaticChatModel::new(
        r#"[{"name": "authentication", "kind": "concept", "description": "login flow"}]"#,
    ));
    let mut config = GraphSearchConfig::default();
    config.semantic_entities = true;

    let store = Arc::new(MemoryStore::new(SparseSearchConfig::default()));
    let builder = GraphBuilder::new(store.clone(), Some(chat), Some(embedder), config);
    let file = auth_file();
    builder
        .build("c", &[(file.clone(), chunks_for(&file))], &CancellationToken::new())
        .await
        .expect("graph build succeeds");

    let entities = store.all_entities("c").await.expect("all entities");
    let concept = entities
        .iter()
        .find(|e| e.kind == EntityKind::Concept)
        .expect("concept extracted");
    let embedding = concept.embedding.as_ref().expect("description embedded");
    assert_eq!(embedding.len(), 64);
    // Entities without a description stay unembedded.
    let login = entities.iter().find(|e| e.name == "login").expect("login");
    assert!(login.embedding.is_none());
}

#[tokio::test]
async fn malformed_semantic_output_falls_back_to_structural() {
    let chat = Arc::new(StaticChatModel::new("sure! the concepts are auth and db"));
    let mut config = GraphSearchConfig::default();
    config.semantic_entities = true;

    let (store, stats) = build_corpus(config, Some(chat)).await;
    assert!(stats.semantic_rejections > 0);

    let entities = store.all_entities("c").await.expect("all entities");
    assert!(entities.iter().all(|e| e.kind != EntityKind::Concept));
    // Structural extraction still landed.
    assert!(entities.iter().any(|e| e.name == "login"));
}

#[tokio::test]
async fn rebuild_replaces_prior_file_contribution() {
    let store = Arc::new(MemoryStore::new(SparseSearchConfig::default()));
    let builder = GraphBuilder::new(store.clone(), None, None, GraphSearchConfig::default());

    let original = auth_file();
    builder
        .build(
            "c",
            &[(original.clone(), chunks_for(&original))],
            &CancellationToken::new(),
        )
        .await
        .expect("first build");

    let mut renamed = original;
    renamed.content = renamed.content.replace("def login", "def sign_in");
    builder
        .build(
            "c",
            &[(renamed.clone(), chunks_for(&renamed))],
            &CancellationToken::new(),
        )
        .await
        .expect("second build");

    let entities = store.all_entities("c").await.expect("all entities");
    assert!(entities.iter().any(|e| e.name == "sign_in"));
    assert!(entities.iter().all(|e| e.name != "login"));
}

#[tokio::test]
async fn cancellation_stops_the_build() {
    let store = Arc::new(MemoryStore::new(SparseSearchConfig::default()));
    let builder = GraphBuilder::new(store, None, None, GraphSearchConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let file = auth_file();
    let result = builder
        .build("c", &[(file.clone(), chunks_for(&file))], &cancel)
        .await;
    assert!(matches!(result, Err(crate::RagError::Cancelled)));
}

mod communities {
    use super::super::community::detect_communities;
    use crate::store::{Entity, EntityKind, RelKind, Relationship, compute_entity_id};

    fn entity(name: &str) -> Entity {
        Entity {
            entity_id: compute_entity_id("c", name, EntityKind::Function),
            corpus_id: "c".to_string(),
            name: name.to_string(),
            qualified_name: name.to_string(),
            kind: EntityKind::Function,
            file_path: None,
            start_line: None,
            description: None,
            embedding: None,
            properties: serde_json::Map::new(),
        }
    }

    fn edge(entities: &[Entity], a: usize, b: usize) -> Relationship {
        Relationship {
            source_entity_id: entities[a].entity_id.clone(),
            target_entity_id: entities[b].entity_id.clone(),
            kind: RelKind::Calls,
            weight: 1.0,
            properties: serde_json::Map::new(),
        }
    }

    #[test]
    fn two_cliques_become_two_communities() {
        let entities: Vec<Entity> =
            ["a1", "a2", "a3", "b1", "b2", "b3"].iter().map(|n| entity(n)).collect();
        let relationships = vec![
            edge(&entities, 0, 1),
            edge(&entities, 1, 2),
            edge(&entities, 0, 2),
            edge(&entities, 3, 4),
            edge(&entities, 4, 5),
            edge(&entities, 3, 5),
        ];

        let communities = detect_communities("c", &entities, &relationships);
        assert_eq!(communities.len(), 2);
        assert!(communities.iter().all(|c| c.member_ids.len() == 3));
    }

    #[test]
    fn detection_is_deterministic() {
        let entities: Vec<Entity> =
            ["x", "y", "z", "w"].iter().map(|n| entity(n)).collect();
        let relationships = vec![edge(&entities, 0, 1), edge(&entities, 2, 3)];

        let first = detect_communities("c", &entities, &relationships);
        let second = detect_communities("c", &entities, &relationships);
        assert_eq!(first, second);
    }

    #[test]
    fn isolated_entities_join_no_community() {
        let entities: Vec<Entity> = ["lonely", "a", "b"].iter().map(|n| entity(n)).collect();
        let relationships = vec![edge(&entities, 1, 2)];

        let communities = detect_communities("c", &entities, &relationships);
        let all_members: Vec<&String> =
            communities.iter().flat_map(|c| c.member_ids.iter()).collect();
        assert!(!all_members.contains(&&entities[0].entity_id));
    }

    #[test]
    fn empty_graph_has_no_communities() {
        assert!(detect_communities("c", &[], &[]).is_empty());
    }
}
