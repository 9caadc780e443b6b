use super::{Callback, RawBlockData, RawNodeData, RawRelationData, RawWayData, BLOCK_SIZE};
use crate::geom::GeoCoord;
use crate::records::{MemberKind, RelationMember};
use crate::{ImportError, Result};
use osmpbf::{Element, ElementReader};
use std::path::Path;

/// Streaming front-end for `.pbf` inputs; batches primitives into blocks and
/// pushes them into the preprocess callback in file order.
pub fn parse(path: &Path, callback: &mut Callback) -> Result<()> {
    let reader =
        ElementReader::from_path(path).map_err(|e| ImportError::format(path, e.to_string()))?;

    let mut block = RawBlockData::default();
    let mut sink_error: Option<anyhow::Error> = None;

    reader
        .for_each(|element| {
            if sink_error.is_some() {
                return;
            }

            match element {
                Element::Node(node) => {
                    block.nodes.push(RawNodeData {
                        id: node.id(),
                        coord: GeoCoord::new(node.lat(), node.lon()),
                        tags: node
                            .tags()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    });
                }
                Element::DenseNode(node) => {
                    block.nodes.push(RawNodeData {
                        id: node.id(),
                        coord: GeoCoord::new(node.lat(), node.lon()),
                        tags: node
                            .tags()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    });
                }
                Element::Way(way) => {
                    block.ways.push(RawWayData {
                        id: way.id(),
                        tags: way
                            .tags()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                        node_ids: way.refs().collect(),
                    });
                }
                Element::Relation(relation) => {
                    let members = relation
                        .members()
                        .map(|member| RelationMember {
                            kind: match member.member_type {
                                osmpbf::RelMemberType::Node => MemberKind::Node,
                                osmpbf::RelMemberType::Way => MemberKind::Way,
                                osmpbf::RelMemberType::Relation => MemberKind::Relation,
                            },
                            role: member
                                .role()
                                .map(|role| role.to_string())
                                .unwrap_or_default(),
                            id: member.member_id,
                        })
                        .collect();

                    block.relations.push(RawRelationData {
                        id: relation.id(),
                        tags: relation
                            .tags()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                        members,
                    });
                }
            }

            if block.len() >= BLOCK_SIZE {
                let full = std::mem::take(&mut block);
                if let Err(e) = callback.process_block(full) {
                    sink_error = Some(e);
                }
            }
        })
        .map_err(|e| ImportError::format(path, e.to_string()))?;

    if let Some(e) = sink_error {
        return Err(e);
    }

    if !block.is_empty() {
        callback.process_block(block)?;
    }

    Ok(())
}
