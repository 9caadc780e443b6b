use crate::config::{ImportParameter, Router};
use crate::fileio::{numeric_index::write_numeric_index, FileScanner, FileWriter};
use crate::geom::distance_meters;
use crate::records::{OsmId, TurnRestriction, Way};
use crate::stages::optimize_ids::{read_way_id_map, WAYIDMAP_TMP};
use crate::stages::sort_objects::WAYS_DAT;
use crate::stages::way_way::TURNRESTR_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// An edge of the routing graph, anchored at a route node
struct RouteEdge {
    target_node: OsmId,
    way_id: u64,
    distance_m: u32,
    /// bit 0: traversable in way direction, bit 1: against it
    flags: u8,
}

const EDGE_FORWARD: u8 = 1 << 0;
const EDGE_BACKWARD: u8 = 1 << 1;

/// Stage 22: build one routing graph per configured router
pub struct RouteDataStage;

impl Stage for RouteDataStage {
    fn describe(&self, parameter: &ImportParameter) -> StageDescription {
        let mut description =
            StageDescription::new("RouteData", "Generate routing graphs")
                .requires(WAYS_DAT)
                .requires(TURNRESTR_DAT)
                .requires(WAYIDMAP_TMP);

        for router in &parameter.routers {
            description = description
                .provides(router.data_filename())
                .provides(router.variant_filename())
                .provides(router.index_filename());
        }

        description
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        for router in &ctx.parameter.routers {
            ctx.check_aborted()?;
            build_router(ctx, router)?;
        }
        Ok(())
    }
}

fn build_router(ctx: &StageContext, router: &Router) -> Result<()> {
    let parameter = &ctx.parameter;

    ctx.progress.set_action(&format!(
        "Building routing graph '{}' (vehicle mask {:#04b})",
        router.filename_base, router.vehicle_mask
    ));

    // first pass: which nodes take part in more than one routable way
    let mut node_usage: FxHashMap<OsmId, u32> = FxHashMap::default();
    let mut routable_ways = 0u64;

    let mut scanner = FileScanner::open(
        parameter.file_in_destination(WAYS_DAT),
        parameter.way_data_memory_mapped,
    )?;
    let count = scanner.read_u32()?;

    for _ in 0..count {
        let way = Way::read_from(&mut scanner)?;
        if !is_routable(ctx, router, &way) {
            continue;
        }
        routable_ways += 1;

        for node in &way.nodes {
            *node_usage.entry(node.id).or_insert(0) += 1;
        }
    }

    ctx.progress.info(&format!(
        "{} routable ways, {} touched nodes",
        routable_ways,
        node_usage.len()
    ));

    // second pass: emit edges between consecutive route nodes of each way
    let mut route_nodes: BTreeMap<OsmId, Vec<RouteEdge>> = BTreeMap::new();

    let mut scanner = FileScanner::open(
        parameter.file_in_destination(WAYS_DAT),
        parameter.way_data_memory_mapped,
    )?;
    let count = scanner.read_u32()?;

    for _ in 0..count {
        ctx.check_aborted()?;

        let way = Way::read_from(&mut scanner)?;
        if !is_routable(ctx, router, &way) {
            continue;
        }

        collect_edges(&way, &node_usage, &mut route_nodes);
    }

    // write route nodes in blocks
    let mut writer = FileWriter::create(parameter.file_in_destination(&router.data_filename()))?;
    writer.write_count_placeholder()?;

    let mut index_entries: Vec<(i64, u64)> = Vec::with_capacity(route_nodes.len());
    let mut written = 0u32;

    let block_size = parameter.route_node_block_size.max(1);
    let nodes: Vec<(OsmId, Vec<RouteEdge>)> = route_nodes.into_iter().collect();

    for block in nodes.chunks(block_size) {
        ctx.check_aborted()?;

        for (node_id, edges) in block {
            index_entries.push((*node_id, writer.position()));

            writer.write_i64(*node_id)?;
            writer.write_unsigned(edges.len() as u64)?;
            for edge in edges {
                writer.write_signed(edge.target_node)?;
                writer.write_unsigned(edge.way_id)?;
                writer.write_u32(edge.distance_m)?;
                writer.write_u8(edge.flags)?;
            }
            written += 1;
        }
    }

    writer.finish_with_count(written)?;
    writer.close()?;

    write_restrictions(ctx, router)?;
    write_numeric_index(
        parameter.file_in_destination(&router.index_filename()),
        &index_entries,
    )?;

    ctx.progress
        .info(&format!("{} route nodes written", written));
    Ok(())
}

fn is_routable(ctx: &StageContext, router: &Router, way: &Way) -> bool {
    ctx.type_config.get(way.type_id).vehicle_mask & router.vehicle_mask != 0
}

/// A node is a route node when it joins ways or terminates one
fn is_route_node(way: &Way, index: usize, node_usage: &FxHashMap<OsmId, u32>) -> bool {
    index == 0
        || index == way.nodes.len() - 1
        || node_usage.get(&way.nodes[index].id).copied().unwrap_or(0) > 1
}

fn collect_edges(
    way: &Way,
    node_usage: &FxHashMap<OsmId, u32>,
    route_nodes: &mut BTreeMap<OsmId, Vec<RouteEdge>>,
) {
    let mut last_route_node: Option<usize> = None;

    for index in 0..way.nodes.len() {
        if !is_route_node(way, index, node_usage) {
            continue;
        }

        if let Some(previous) = last_route_node {
            let distance: f64 = (previous..index)
                .map(|i| distance_meters(way.nodes[i].coord, way.nodes[i + 1].coord))
                .sum();
            let distance_m = distance.round() as u32;

            let from = way.nodes[previous].id;
            let to = way.nodes[index].id;

            let forward_flags = if way.features.oneway {
                EDGE_FORWARD
            } else {
                EDGE_FORWARD | EDGE_BACKWARD
            };

            route_nodes.entry(from).or_default().push(RouteEdge {
                target_node: to,
                way_id: way.id,
                distance_m,
                flags: forward_flags,
            });

            // the reverse edge only exists when the way is traversable
            // against its direction
            if !way.features.oneway {
                route_nodes.entry(to).or_default().push(RouteEdge {
                    target_node: from,
                    way_id: way.id,
                    distance_m,
                    flags: EDGE_FORWARD | EDGE_BACKWARD,
                });
            } else {
                route_nodes.entry(to).or_default();
            }
        }

        last_route_node = Some(index);
    }
}

/// Turn restrictions rewritten to final way ids, per router
fn write_restrictions(ctx: &StageContext, router: &Router) -> Result<()> {
    let parameter = &ctx.parameter;

    let way_id_map = read_way_id_map(parameter)?;

    let mut scanner =
        FileScanner::open(parameter.file_in_destination(TURNRESTR_DAT), false)?;
    let count = scanner.read_u32()?;

    let mut writer =
        FileWriter::create(parameter.file_in_destination(&router.variant_filename()))?;
    writer.write_count_placeholder()?;

    let mut written = 0u32;
    for _ in 0..count {
        let restriction = TurnRestriction::read_from(&mut scanner)?;

        let (Some(from), Some(to)) = (
            way_id_map.get(&restriction.from_way),
            way_id_map.get(&restriction.to_way),
        ) else {
            ctx.progress.warning(&format!(
                "Turn restriction via node {} references vanished ways",
                restriction.via_node
            ));
            continue;
        };

        writer.write_u8(match restriction.kind {
            crate::records::RestrictionKind::Allow => 0,
            crate::records::RestrictionKind::Forbid => 1,
        })?;
        writer.write_signed(restriction.via_node)?;
        writer.write_unsigned(*from)?;
        writer.write_unsigned(*to)?;
        written += 1;
    }

    writer.finish_with_count(written)?;
    writer.close()?;

    ctx.progress.info(&format!(
        "{} turn restrictions written for '{}'",
        written, router.filename_base
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::GeoCoord;
    use crate::records::WayNode;
    use crate::types::FeatureValues;

    fn test_way(id: u64, node_ids: &[OsmId], oneway: bool) -> Way {
        Way {
            id,
            type_id: 1,
            features: FeatureValues {
                oneway,
                ..Default::default()
            },
            nodes: node_ids
                .iter()
                .enumerate()
                .map(|(i, id)| WayNode {
                    id: *id,
                    coord: GeoCoord::new(50.0, 10.0 + i as f64 * 0.001),
                })
                .collect(),
        }
    }

    #[test]
    fn interior_nodes_collapse_into_one_edge() {
        let way = test_way(1, &[1, 2, 3, 4], false);
        let usage: FxHashMap<OsmId, u32> =
            way.nodes.iter().map(|n| (n.id, 1)).collect();

        let mut route_nodes = BTreeMap::new();
        collect_edges(&way, &usage, &mut route_nodes);

        // only the endpoints are route nodes
        assert_eq!(route_nodes.len(), 2);
        let edges = &route_nodes[&1];
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_node, 4);
        assert!(edges[0].distance_m > 0);
    }

    #[test]
    fn junctions_split_ways_into_edges() {
        let way = test_way(1, &[1, 2, 3], false);
        let mut usage: FxHashMap<OsmId, u32> =
            way.nodes.iter().map(|n| (n.id, 1)).collect();
        usage.insert(2, 2); // node 2 is shared with another way

        let mut route_nodes = BTreeMap::new();
        collect_edges(&way, &usage, &mut route_nodes);

        assert_eq!(route_nodes.len(), 3);
        assert_eq!(route_nodes[&1][0].target_node, 2);
        assert_eq!(route_nodes[&2].len(), 2);
    }

    #[test]
    fn oneway_ways_get_no_reverse_edge() {
        let way = test_way(1, &[1, 2, 3], true);
        let usage: FxHashMap<OsmId, u32> =
            way.nodes.iter().map(|n| (n.id, 1)).collect();

        let mut route_nodes = BTreeMap::new();
        collect_edges(&way, &usage, &mut route_nodes);

        assert_eq!(route_nodes[&1].len(), 1);
        assert!(route_nodes[&3].is_empty());
    }
}
