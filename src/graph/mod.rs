// Graph construction module
// Extracts entities and relationships from chunks and maintains communities

pub mod community;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunker::{Chunk, ast};
use crate::config::GraphSearchConfig;
use crate::embedder::Embedder;
use crate::loader::SourceFile;
use crate::providers::{ChatModel, GenerateOptions};
use crate::store::{
    Community, Entity, EntityKind, GraphStore, RelKind, Relationship, compute_entity_id,
};
use crate::{RagError, Result};

/// Two concept mentions inside one chunk link them with `related_to`.
const RELATED_TO_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, Default)]
pub struct GraphBuildStats {
    pub entities_written: usize,
    pub relationships_written: usize,
    pub relationships_dropped: usize,
    pub communities: usize,
    pub semantic_rejections: usize,
}

/// Strict output shape demanded from the semantic extraction model.
/// Anything that fails to parse into this is rejected wholesale.
#[derive(Debug, Deserialize)]
struct ExtractedConcept {
    name: String,
    kind: String,
    #[serde(default)]
    description: Option<String>,
}

pub struct GraphBuilder {
    store: Arc<dyn GraphStore>,
    chat: Option<Arc<dyn ChatModel>>,
    /// Embeds entity descriptions so the graph retriever can seed by
    /// similarity. Absent in description-free setups and some tests.
    embedder: Option<Arc<Embedder>>,
    config: GraphSearchConfig,
}

impl GraphBuilder {
    #[inline]
    pub fn new(
        store: Arc<dyn GraphStore>,
        chat: Option<Arc<dyn ChatModel>>,
        embedder: Option<Arc<Embedder>>,
        config: GraphSearchConfig,
    ) -> Self {
        Self {
            store,
            chat,
            embedder,
            config,
        }
    }

    /// Extract entities and relationships for the given (changed) files
    /// and refresh the corpus communities. Entities commit before
    /// relationships; edges whose endpoint never materialized are dropped
    /// by the store.
    pub async fn build(
        &self,
        corpus_id: &str,
        files: &[(SourceFile, Vec<Chunk>)],
        cancel: &CancellationToken,
    ) -> Result<GraphBuildStats> {
        let mut stats = GraphBuildStats::default();

        for (file, chunks) in files {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }

            // Re-extraction replaces whatever this file contributed before.
            self.store.delete_file_entities(corpus_id, &file.path).await?;

            let mut extraction = extract_structural(corpus_id, file);
            if self.config.semantic_entities {
                match self.extract_semantic(corpus_id, file, chunks).await {
                    Ok(mut semantic) => {
                        extraction.entities.append(&mut semantic.entities);
                        extraction.pending_edges.append(&mut semantic.pending_edges);
                    }
                    Err(e) => {
                        warn!(
                            "Semantic extraction failed for {}, keeping structural only: {}",
                            file.path, e
                        );
                        stats.semantic_rejections += 1;
                    }
                }
            }

            self.embed_descriptions(&mut extraction.entities, cancel).await?;
            self.store
                .upsert_entities(corpus_id, &extraction.entities)
                .await?;
            stats.entities_written += extraction.entities.len();

            // Name resolution runs against the whole corpus so edges can
            // reach entities declared in unchanged files.
            let known = self.store.all_entities(corpus_id).await?;
            let relationships =
                resolve_relationships(corpus_id, file, chunks, &extraction, &known);
            let attempted = relationships.len();
            let written = self
                .store
                .upsert_relationships(corpus_id, &relationships)
                .await?;
            stats.relationships_written += written;
            stats.relationships_dropped += attempted - written;
        }

        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }
        stats.communities = self.rebuild_communities(corpus_id).await?;
        Ok(stats)
    }

    /// Embed the descriptions of entities that carry one, in a single
    /// batch through the corpus embedder.
    async fn embed_descriptions(
        &self,
        entities: &mut [Entity],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };

        let described: Vec<usize> = entities
            .iter()
            .enumerate()
            .filter(|(_, e)| e.description.as_deref().is_some_and(|d| !d.trim().is_empty()))
            .map(|(i, _)| i)
            .collect();
        if described.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = described
            .iter()
            .map(|&i| {
                let entity = &entities[i];
                match &entity.description {
                    Some(description) => format!("{}: {}", entity.name, description),
                    None => entity.name.clone(),
                }
            })
            .collect();
        let vectors = embedder.embed(&texts, cancel).await?;
        for (&i, vector) in described.iter().zip(vectors.into_iter()) {
            entities[i].embedding = Some(vector);
        }
        Ok(())
    }

    /// Recompute communities over the full graph and regenerate their
    /// summaries from member names only.
    pub async fn rebuild_communities(&self, corpus_id: &str) -> Result<usize> {
        let entities = self.store.all_entities(corpus_id).await?;
        let relationships = self.store.all_relationships(corpus_id).await?;
        let mut communities =
            community::detect_communities(corpus_id, &entities, &relationships);

        if let Some(chat) = &self.chat {
            let name_of: HashMap<&str, &str> = entities
                .iter()
                .map(|e| (e.entity_id.as_str(), e.name.as_str()))
                .collect();
            for community in &mut communities {
                community.summary = self
                    .summarize_community(chat.as_ref(), community, &name_of)
                    .await;
            }
        }

        let count = communities.len();
        self.store.replace_communities(corpus_id, &communities).await?;
        debug!("Rebuilt {} communities for corpus {}", count, corpus_id);
        Ok(count)
    }

    async fn summarize_community(
        &self,
        chat: &dyn ChatModel,
        community: &Community,
        name_of: &HashMap<&str, &str>,
    ) -> Option<String> {
        let names: Vec<&str> = community
            .member_ids
            .iter()
            .filter_map(|id| name_of.get(id.as_str()).copied())
            .take(40)
            .collect();
        if names.is_empty() {
            return None;
        }

        let prompt = format!(
            "These code entities form one cluster: {}. \
             Describe the cluster's common purpose in one sentence.",
            names.join(", ")
        );
        match chat.generate(&prompt, &GenerateOptions::default()).await {
            Ok(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| text.to_string())
            }
            Err(e) => {
                warn!("Community summary generation failed: {}", e);
                None
            }
        }
    }

    /// LLM-backed concept extraction. The model must return a JSON array
    /// of `{name, kind, description}` objects with `kind == "concept"`;
    /// any other shape rejects the whole response.
    async fn extract_semantic(
        &self,
        corpus_id: &str,
        file: &SourceFile,
        chunks: &[Chunk],
    ) -> Result<Extraction> {
        let chat = self
            .chat
            .as_ref()
            .ok_or_else(|| RagError::Config("semantic extraction enabled without a chat model".to_string()))?;

        let mut extraction = Extraction::default();
        for chunk in chunks {
            let prompt = format!(
                "Extract the topical concepts named in comments and docstrings of this code. \
                 Respond with only a JSON array of objects {{\"name\", \"kind\", \"description\"}} \
                 where kind is always \"concept\". Respond [] if there are none.\n\n{}",
                chunk.content
            );
            let response = chat.generate(&prompt, &GenerateOptions::default()).await?;
            let concepts = parse_concepts(&response)?;

            let mut chunk_concepts = Vec::new();
            for concept in concepts {
                let qualified = format!("concept::{}", concept.name.to_lowercase());
                let entity_id = compute_entity_id(corpus_id, &qualified, EntityKind::Concept);
                chunk_concepts.push(entity_id.clone());
                extraction.entities.push(Entity {
                    entity_id,
                    corpus_id: corpus_id.to_string(),
                    name: concept.name,
                    qualified_name: qualified,
                    kind: EntityKind::Concept,
                    file_path: Some(file.path.clone()),
                    start_line: Some(chunk.start_line),
                    description: concept.description,
                    embedding: None,
                    properties: serde_json::Map::new(),
                });
            }

            // Concepts co-occurring inside one chunk relate to each other.
            chunk_concepts.sort();
            chunk_concepts.dedup();
            for (i, a) in chunk_concepts.iter().enumerate() {
                for b in chunk_concepts.iter().skip(i + 1) {
                    extraction.pending_edges.push(PendingEdge {
                        source: a.clone(),
                        target: b.clone(),
                        kind: RelKind::RelatedTo,
                        weight: RELATED_TO_WEIGHT,
                    });
                }
            }
        }
        Ok(extraction)
    }
}

fn parse_concepts(response: &str) -> Result<Vec<ExtractedConcept>> {
    // Tolerate surrounding prose by slicing to the outermost array.
    let trimmed = response.trim();
    let json = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(RagError::UpstreamFailure {
                component: "chat".to_string(),
                reason: "semantic extraction returned no JSON array".to_string(),
            });
        }
    };

    let concepts: Vec<ExtractedConcept> =
        serde_json::from_str(json).map_err(|e| RagError::UpstreamFailure {
            component: "chat".to_string(),
            reason: format!("malformed semantic extraction output: {e}"),
        })?;

    for concept in &concepts {
        if concept.kind != "concept" || concept.name.trim().is_empty() {
            return Err(RagError::UpstreamFailure {
                component: "chat".to_string(),
                reason: format!("unexpected concept kind '{}'", concept.kind),
            });
        }
    }
    Ok(concepts)
}

#[derive(Debug, Default)]
struct Extraction {
    entities: Vec<Entity>,
    /// Edges between entities this extraction created directly.
    pending_edges: Vec<PendingEdge>,
}

#[derive(Debug)]
struct PendingEdge {
    source: String,
    target: String,
    kind: RelKind,
    weight: f64,
}

/// Structural entities from the declaration scanner: one module entity
/// per file, one entity per declaration, `contains` nesting edges.
fn extract_structural(corpus_id: &str, file: &SourceFile) -> Extraction {
    let mut extraction = Extraction::default();

    let module_qualified = file.path.clone();
    let module_id = compute_entity_id(corpus_id, &module_qualified, EntityKind::Module);
    let module_name = file
        .path
        .rsplit('/')
        .next()
        .and_then(|n| n.split('.').next())
        .unwrap_or(&file.path)
        .to_string();
    extraction.entities.push(Entity {
        entity_id: module_id.clone(),
        corpus_id: corpus_id.to_string(),
        name: module_name,
        qualified_name: module_qualified,
        kind: EntityKind::Module,
        file_path: Some(file.path.clone()),
        start_line: Some(1),
        description: None,
        embedding: None,
        properties: serde_json::Map::new(),
    });

    let Some(language) = file.language.as_deref() else {
        return extraction;
    };
    let Some(declarations) = ast::scan_declarations(&file.content, language) else {
        return extraction;
    };

    let mut class_ids: HashMap<String, String> = HashMap::new();
    for decl in &declarations {
        let kind = match decl.kind {
            ast::DeclKind::Class => EntityKind::Class,
            ast::DeclKind::Module => EntityKind::Module,
            _ => EntityKind::Function,
        };
        let qualified = match &decl.parent {
            Some(parent) => format!("{}::{}.{}", file.path, parent, decl.name),
            None => format!("{}::{}", file.path, decl.name),
        };
        let entity_id = compute_entity_id(corpus_id, &qualified, kind);
        if kind == EntityKind::Class {
            class_ids.insert(decl.name.clone(), entity_id.clone());
        }

        extraction.entities.push(Entity {
            entity_id: entity_id.clone(),
            corpus_id: corpus_id.to_string(),
            name: decl.name.clone(),
            qualified_name: qualified,
            kind,
            file_path: Some(file.path.clone()),
            start_line: Some(decl.start_line),
            description: None,
            embedding: None,
            properties: serde_json::Map::new(),
        });

        // Nesting: class contains method, module contains the rest.
        let container = decl
            .parent
            .as_ref()
            .and_then(|p| class_ids.get(p))
            .unwrap_or(&module_id);
        extraction.pending_edges.push(PendingEdge {
            source: container.clone(),
            target: entity_id,
            kind: RelKind::Contains,
            weight: 1.0,
        });
    }
    extraction
}

/// Resolve name-based edges (`calls`, `imports`, `inherits`,
/// `references`) against the known entity set and merge in the
/// extraction's own pending edges.
fn resolve_relationships(
    corpus_id: &str,
    file: &SourceFile,
    chunks: &[Chunk],
    extraction: &Extraction,
    known: &[Entity],
) -> Vec<Relationship> {
    let mut edges: HashMap<(String, String, RelKind), Relationship> = HashMap::new();
    let mut push = |source: &str, target: &str, kind: RelKind, weight: f64| {
        if source == target {
            return;
        }
        edges
            .entry((source.to_string(), target.to_string(), kind))
            .or_insert_with(|| Relationship {
                source_entity_id: source.to_string(),
                target_entity_id: target.to_string(),
                kind,
                weight,
                properties: serde_json::Map::new(),
            });
    };

    for edge in &extraction.pending_edges {
        push(&edge.source, &edge.target, edge.kind, edge.weight);
    }

    // Name → entities over the whole corpus, cheapest-wins for ambiguity.
    let mut by_name: HashMap<&str, Vec<&Entity>> = HashMap::new();
    for entity in known {
        by_name.entry(entity.name.as_str()).or_default().push(entity);
    }
    let module_id = known
        .iter()
        .find(|e| e.kind == EntityKind::Module && e.qualified_name == file.path)
        .map(|e| e.entity_id.clone());

    let language = file.language.as_deref().unwrap_or("");
    let declarations = if language.is_empty() {
        Vec::new()
    } else {
        ast::scan_declarations(&file.content, language).unwrap_or_default()
    };
    let file_lines: Vec<&str> = file.content.lines().collect();

    // calls: declaration body → any known entity with that name.
    for decl in &declarations {
        let qualified = match &decl.parent {
            Some(parent) => format!("{}::{}.{}", file.path, parent, decl.name),
            None => format!("{}::{}", file.path, decl.name),
        };
        let kind = match decl.kind {
            ast::DeclKind::Class => EntityKind::Class,
            ast::DeclKind::Module => EntityKind::Module,
            _ => EntityKind::Function,
        };
        let source_id = compute_entity_id(corpus_id, &qualified, kind);
        let start = decl.start_line.saturating_sub(1);
        let end = decl.end_line.min(file_lines.len());
        if start >= end {
            continue;
        }
        let body = file_lines[start..end].join("\n");
        for target_name in ast::scan_call_targets(&body) {
            if target_name == decl.name {
                continue;
            }
            if let Some(candidates) = by_name.get(target_name.as_str()) {
                for target in candidates
                    .iter()
                    .filter(|e| e.kind == EntityKind::Function || e.kind == EntityKind::Class)
                {
                    push(&source_id, &target.entity_id, RelKind::Calls, 1.0);
                }
            }
        }
    }

    // imports: module → module whose name matches the imported token.
    if let Some(module_id) = &module_id {
        for import_line in ast::scan_imports(&file.content, language) {
            for token in import_line
                .split(|c: char| !c.is_alphanumeric() && c != '_')
                .filter(|t| !t.is_empty())
            {
                if let Some(candidates) = by_name.get(token) {
                    for target in candidates.iter().filter(|e| e.kind == EntityKind::Module) {
                        push(module_id, &target.entity_id, RelKind::Imports, 1.0);
                    }
                }
            }
        }

        // references: identifier use inside chunk text resolving to an
        // entity declared elsewhere in the corpus.
        for chunk in chunks {
            let tokens: HashSet<&str> = chunk
                .content
                .split(|c: char| !c.is_alphanumeric() && c != '_')
                .filter(|t| t.len() > 2)
                .collect();
            for token in tokens {
                if let Some(candidates) = by_name.get(token) {
                    for target in candidates
                        .iter()
                        .filter(|e| e.file_path.as_deref() != Some(file.path.as_str()))
                    {
                        push(module_id, &target.entity_id, RelKind::References, 0.5);
                    }
                }
            }
        }
    }

    // inherits: class bases resolving to known classes.
    for (class_name, base_name) in ast::scan_class_bases(&file.content, language) {
        let class_qualified = format!("{}::{}", file.path, class_name);
        let class_id = compute_entity_id(corpus_id, &class_qualified, EntityKind::Class);
        if let Some(candidates) = by_name.get(base_name.as_str()) {
            for target in candidates.iter().filter(|e| e.kind == EntityKind::Class) {
                push(&class_id, &target.entity_id, RelKind::Inherits, 1.0);
            }
        }
    }

    edges.into_values().collect()
}
