//! Graph persistence.
//!
//! A [`GraphSnapshot`] captures the topology and every operation description
//! as JSON. Textures are not stored: loading rebuilds every resource at the
//! current resolution, and random seeds start from a fresh field.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};
use crate::gpu::GpuBackend;
use crate::graph::{EdgeKind, NodeId};
use crate::operation::OperationDesc;
use crate::pipeline::Engine;
use crate::seed::SeedKind;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationEntry {
    pub id: NodeId,
    pub desc: OperationDesc,
}

/// How a seed is recreated. Image seeds are stored by path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SeedSource {
    ColorNoise,
    GrayscaleNoise,
    Image { path: PathBuf },
    Camera,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedEntry {
    pub id: NodeId,
    pub source: SeedSource,
    #[serde(default)]
    pub fixed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeEntry {
    pub source: NodeId,
    pub dest: NodeId,
    pub kind: EdgeKind,
    pub weight: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub operations: Vec<OperationEntry>,
    #[serde(default)]
    pub seeds: Vec<SeedEntry>,
    #[serde(default)]
    pub edges: Vec<EdgeEntry>,
    #[serde(default)]
    pub output: Option<NodeId>,
}

impl GraphSnapshot {
    pub fn to_json(&self) -> FeedResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> FeedResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl<B: GpuBackend> Engine<B> {
    /// Capture the current graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        let operations = self
            .operations()
            .map(|(id, op)| OperationEntry {
                id,
                desc: op.desc().clone(),
            })
            .collect();

        let mut seeds = Vec::new();
        for (id, seed) in self.seeds() {
            let source = match (seed.kind(), seed.path()) {
                (SeedKind::ColorNoise, _) => SeedSource::ColorNoise,
                (SeedKind::GrayscaleNoise, _) => SeedSource::GrayscaleNoise,
                (SeedKind::Image(_), Some(path)) => SeedSource::Image {
                    path: path.to_path_buf(),
                },
                (SeedKind::Image(_), None) => {
                    tracing::warn!(%id, "image seed without a source file left out of snapshot");
                    continue;
                }
                (SeedKind::Camera, _) => SeedSource::Camera,
            };
            seeds.push(SeedEntry {
                id,
                source,
                fixed: seed.is_fixed(),
            });
        }

        let edges = self
            .graph()
            .nodes()
            .flat_map(|node| {
                let dest = node.id();
                node.inputs().iter().map(move |(&source, edge)| EdgeEntry {
                    source,
                    dest,
                    kind: edge.kind,
                    weight: edge.blend,
                })
            })
            .collect();

        GraphSnapshot {
            operations,
            seeds,
            edges,
            output: self.output_node(),
        }
    }

    /// Replace the current graph with `snapshot`. Node ids are reassigned;
    /// the returned map translates stored ids to live ones.
    #[tracing::instrument(skip_all, fields(
        operations = snapshot.operations.len(),
        seeds = snapshot.seeds.len(),
        edges = snapshot.edges.len(),
    ))]
    pub fn load_snapshot(&mut self, snapshot: &GraphSnapshot) -> FeedResult<HashMap<NodeId, NodeId>> {
        self.clear();

        // Recreate in stored id order so relative ordering survives the reload.
        let mut entries: Vec<(NodeId, Option<&OperationEntry>, Option<&SeedEntry>)> = snapshot
            .operations
            .iter()
            .map(|op| (op.id, Some(op), None))
            .chain(snapshot.seeds.iter().map(|seed| (seed.id, None, Some(seed))))
            .collect();
        entries.sort_by_key(|(id, _, _)| *id);

        let mut ids = HashMap::new();
        for (stored, op, seed) in entries {
            let live = match (op, seed) {
                (Some(op), _) => self.add_operation(op.desc.clone()),
                (None, Some(seed)) => match &seed.source {
                    SeedSource::ColorNoise => self.add_seed(SeedKind::ColorNoise, seed.fixed),
                    SeedSource::GrayscaleNoise => {
                        self.add_seed(SeedKind::GrayscaleNoise, seed.fixed)
                    }
                    SeedSource::Image { path } => self.add_image_seed(path, seed.fixed)?,
                    SeedSource::Camera => self.add_seed(SeedKind::Camera, seed.fixed),
                },
                (None, None) => continue,
            };
            if ids.insert(stored, live).is_some() {
                return Err(FeedError::snapshot(format!("duplicate node id {stored}")));
            }
        }

        let resolve = |id: NodeId| {
            ids.get(&id)
                .copied()
                .ok_or_else(|| FeedError::snapshot(format!("edge references unknown node {id}")))
        };
        for edge in &snapshot.edges {
            let (source, dest) = (resolve(edge.source)?, resolve(edge.dest)?);
            if !self.connect(source, dest, edge.weight) {
                return Err(FeedError::snapshot(format!(
                    "edge {} -> {} rejected",
                    edge.source, edge.dest
                )));
            }
            if edge.kind == EdgeKind::Blit {
                self.set_edge_type(source, dest, EdgeKind::Blit);
            }
        }

        if let Some(output) = snapshot.output {
            self.set_output(Some(resolve(output)?));
        }
        tracing::info!(nodes = ids.len(), "snapshot loaded");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_source_is_tagged() {
        let entry = SeedEntry {
            id: NodeId(3),
            source: SeedSource::Image {
                path: PathBuf::from("in.png"),
            },
            fixed: true,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["source"]["type"], "image");
        assert_eq!(json["source"]["path"], "in.png");
        assert_eq!(json["id"], 3);
    }

    #[test]
    fn empty_document_parses() {
        let snapshot = GraphSnapshot::from_json("{}").unwrap();
        assert_eq!(snapshot, GraphSnapshot::default());
    }
}
