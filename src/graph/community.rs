//! Community detection over the entity graph.
//!
//! Synchronous-update label propagation on an undirected, weighted view
//! of the relationship graph. Deterministic: nodes are visited in sorted
//! entity-id order and label ties resolve to the smallest label, so the
//! same graph always produces the same communities.

use std::collections::HashMap;

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;

use crate::store::{Community, Entity, Relationship};

const MAX_ROUNDS: usize = 20;

/// Partition entities into communities by propagating labels along
/// weighted edges. Singleton communities are kept only when the entity
/// has at least one edge.
pub fn detect_communities(
    corpus_id: &str,
    entities: &[Entity],
    relationships: &[Relationship],
) -> Vec<Community> {
    if entities.is_empty() {
        return Vec::new();
    }

    let mut graph: UnGraph<usize, f64> = UnGraph::new_undirected();
    let mut sorted: Vec<&Entity> = entities.iter().collect();
    sorted.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

    let mut node_of: HashMap<&str, NodeIndex> = HashMap::new();
    for (i, entity) in sorted.iter().enumerate() {
        let node = graph.add_node(i);
        node_of.insert(entity.entity_id.as_str(), node);
    }
    for rel in relationships {
        if let (Some(&a), Some(&b)) = (
            node_of.get(rel.source_entity_id.as_str()),
            node_of.get(rel.target_entity_id.as_str()),
        ) {
            if a != b {
                graph.add_edge(a, b, rel.weight.max(f64::MIN_POSITIVE));
            }
        }
    }

    // labels[i] is the community label of sorted[i]; start singleton.
    let mut labels: Vec<usize> = (0..sorted.len()).collect();

    for _ in 0..MAX_ROUNDS {
        let mut changed = false;
        let mut next = labels.clone();

        for (i, entity) in sorted.iter().enumerate() {
            let node = node_of[entity.entity_id.as_str()];
            let mut weight_by_label: HashMap<usize, f64> = HashMap::new();
            for edge in graph.edges(node) {
                let peer = if edge.source() == node {
                    edge.target()
                } else {
                    edge.source()
                };
                let peer_label = labels[graph[peer]];
                *weight_by_label.entry(peer_label).or_insert(0.0) += *edge.weight();
            }
            if weight_by_label.is_empty() {
                continue;
            }

            let best = weight_by_label
                .into_iter()
                .max_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        // Heavier label wins; ties go to the smaller label.
                        .then_with(|| b.0.cmp(&a.0))
                })
                .map(|(label, _)| label)
                .unwrap_or(labels[i]);

            if best != labels[i] {
                next[i] = best;
                changed = true;
            }
        }

        labels = next;
        if !changed {
            break;
        }
    }

    // Group members per surviving label.
    let mut members_by_label: HashMap<usize, Vec<String>> = HashMap::new();
    for (i, entity) in sorted.iter().enumerate() {
        let node = node_of[entity.entity_id.as_str()];
        if graph.edges(node).next().is_none() {
            continue;
        }
        members_by_label
            .entry(labels[i])
            .or_default()
            .push(entity.entity_id.clone());
    }

    let mut groups: Vec<Vec<String>> = members_by_label.into_values().collect();
    for group in &mut groups {
        group.sort();
    }
    groups.sort();

    groups
        .into_iter()
        .enumerate()
        .map(|(n, member_ids)| Community {
            community_id: format!("comm-0-{n}"),
            corpus_id: corpus_id.to_string(),
            level: 0,
            member_ids,
            summary: None,
        })
        .collect()
}
