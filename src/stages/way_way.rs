use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::progress::Progress;
use crate::records::{OsmId, RawWay, TurnRestriction, Way, WayNode};
use crate::stages::coord_data::{CoordStore, COORD_DAT};
use crate::stages::preprocess::{DISTRIBUTION_DAT, RAWTURNRESTR_DAT, RAWWAYS_DAT};
use crate::stages::type_data::TYPES_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::types::{TypeId, TYPE_IGNORE};
use crate::Result;
use rustc_hash::FxHashMap;

pub const WAYWAY_TMP: &str = "wayway.tmp";
pub const TURNRESTR_DAT: &str = "turnrestr.dat";

/// Stage 10: produce final way records, merging chains of compatible ways
/// and rewriting turn restrictions to the surviving ids
pub struct WayWayDataStage;

impl Stage for WayWayDataStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("WayWayData", "Generate way data, merging compatible ways")
            .requires(TYPES_DAT)
            .requires(RAWWAYS_DAT)
            .requires(DISTRIBUTION_DAT)
            .requires(RAWTURNRESTR_DAT)
            .requires(COORD_DAT)
            .provides_temporary(WAYWAY_TMP)
            .provides_temporary(TURNRESTR_DAT)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        ctx.type_config
            .verify_dat(parameter.file_in_destination(TYPES_DAT))?;

        ctx.progress.set_action("Reading turn restrictions");
        let mut restrictions = RestrictionTable::read(parameter)?;
        ctx.progress.info(&format!(
            "{} turn restrictions read",
            restrictions.restrictions.len()
        ));

        ctx.progress.set_action("Reading type distribution");
        let way_counts = read_way_distribution(ctx)?;

        let mut coord_store = CoordStore::open(parameter)?;

        let mut writer = FileWriter::create(parameter.file_in_destination(WAYWAY_TMP))?;
        writer.write_count_placeholder()?;

        let mut written: u32 = 0;
        let mut merged_total = 0u64;

        // process types in batches sized to fit the way block in memory
        let mut batch_types: Vec<TypeId> = Vec::new();
        let mut batch_load = 0u64;

        let flush = |batch: &mut Vec<TypeId>,
                     writer: &mut FileWriter,
                     restrictions: &mut RestrictionTable,
                     coord_store: &mut CoordStore,
                     written: &mut u32,
                     merged_total: &mut u64|
         -> Result<()> {
            if batch.is_empty() {
                return Ok(());
            }

            let (batch_written, merged) = process_type_batch(
                ctx,
                batch,
                restrictions,
                coord_store,
                writer,
            )?;
            *written += batch_written;
            *merged_total += merged;
            batch.clear();
            Ok(())
        };

        for (type_id, way_count) in way_counts.iter().enumerate() {
            let type_id = type_id as TypeId;
            if type_id == TYPE_IGNORE || *way_count == 0 {
                continue;
            }

            if batch_load + *way_count > parameter.raw_way_block_size as u64
                && !batch_types.is_empty()
            {
                flush(
                    &mut batch_types,
                    &mut writer,
                    &mut restrictions,
                    &mut coord_store,
                    &mut written,
                    &mut merged_total,
                )?;
                batch_load = 0;
            }

            batch_types.push(type_id);
            batch_load += *way_count;
        }

        flush(
            &mut batch_types,
            &mut writer,
            &mut restrictions,
            &mut coord_store,
            &mut written,
            &mut merged_total,
        )?;

        writer.finish_with_count(written)?;
        writer.close()?;

        ctx.progress.info(&format!(
            "{} ways written, {} merged away",
            written, merged_total
        ));

        restrictions.write(parameter)?;
        ctx.progress.info(&format!(
            "{} turn restrictions written",
            restrictions.restrictions.len()
        ));

        Ok(())
    }
}

/// Way counts per type from the preprocess distribution file
fn read_way_distribution(ctx: &StageContext) -> Result<Vec<u64>> {
    let mut scanner = FileScanner::open(
        ctx.parameter.file_in_destination(DISTRIBUTION_DAT),
        false,
    )?;

    let mut way_counts = Vec::with_capacity(ctx.type_config.type_count());
    for _ in 0..ctx.type_config.type_count() {
        let _nodes = scanner.read_u32()?;
        let ways = scanner.read_u32()?;
        let _areas = scanner.read_u32()?;
        way_counts.push(ways as u64);
    }

    Ok(way_counts)
}

fn process_type_batch(
    ctx: &StageContext,
    batch_types: &[TypeId],
    restrictions: &mut RestrictionTable,
    coord_store: &mut CoordStore,
    writer: &mut FileWriter,
) -> Result<(u32, u64)> {
    let parameter = &ctx.parameter;

    let type_names: Vec<&str> = batch_types
        .iter()
        .map(|t| ctx.type_config.get(*t).name.as_str())
        .collect();
    ctx.progress
        .set_action(&format!("Merging ways of types [{}]", type_names.join(", ")));

    // collect the batch's ways per type
    let mut scanner = FileScanner::open(
        parameter.file_in_destination(RAWWAYS_DAT),
        parameter.raw_way_data_memory_mapped,
    )?;
    let count = scanner.read_u32()?;

    let mut by_type: FxHashMap<TypeId, Vec<RawWay>> = FxHashMap::default();
    for _ in 0..count {
        ctx.check_aborted()?;

        let way = RawWay::read_from(&mut scanner)?;
        if way.is_area || !batch_types.contains(&way.type_id) {
            continue;
        }
        by_type.entry(way.type_id).or_default().push(way);
    }

    let mut written = 0u32;
    let mut merged_total = 0u64;

    for type_id in batch_types {
        let Some(ways) = by_type.remove(type_id) else {
            continue;
        };

        let before = ways.len();
        let merged = merge_ways(ways, restrictions);
        merged_total += (before - merged.len()) as u64;

        // chunked coordinate resolution keeps the lookup map bounded even
        // when a batch references more nodes than the configured block
        let mut chunk: Vec<RawWay> = Vec::new();
        let mut chunk_nodes = 0usize;

        for way in merged {
            chunk_nodes += way.node_ids.len();
            chunk.push(way);

            if chunk_nodes >= parameter.raw_coord_block_size {
                written += write_ways(ctx.progress.as_ref(), &mut chunk, coord_store, writer)?;
                chunk_nodes = 0;
            }
        }

        written += write_ways(ctx.progress.as_ref(), &mut chunk, coord_store, writer)?;
    }

    Ok((written, merged_total))
}

fn write_ways(
    progress: &dyn Progress,
    ways: &mut Vec<RawWay>,
    coord_store: &mut CoordStore,
    writer: &mut FileWriter,
) -> Result<u32> {
    if ways.is_empty() {
        return Ok(0);
    }

    let node_ids: Vec<OsmId> = ways
        .iter()
        .flat_map(|way| way.node_ids.iter().copied())
        .collect();
    let coords = coord_store.get_many(&node_ids)?;

    let mut written = 0;
    for way in ways.drain(..) {
        let resolved: Option<Vec<WayNode>> = way
            .node_ids
            .iter()
            .map(|id| {
                coords.get(id).map(|stored| WayNode {
                    id: *id,
                    coord: stored.coord,
                })
            })
            .collect();

        let Some(nodes) = resolved else {
            progress.warning(&format!(
                "Way {} references nodes without coordinates, dropping",
                way.id
            ));
            continue;
        };

        Way {
            id: way.id as u64,
            type_id: way.type_id,
            features: way.features,
            nodes,
        }
        .write_to(writer)?;
        written += 1;
    }

    Ok(written)
}

/// All turn restrictions, indexed under their from and to way ids
struct RestrictionTable {
    restrictions: Vec<TurnRestriction>,
    by_way: FxHashMap<OsmId, Vec<usize>>,
}

impl RestrictionTable {
    fn read(parameter: &ImportParameter) -> Result<Self> {
        let mut scanner =
            FileScanner::open(parameter.file_in_destination(RAWTURNRESTR_DAT), false)?;
        let count = scanner.read_u32()?;

        let mut table = Self {
            restrictions: Vec::with_capacity(count as usize),
            by_way: FxHashMap::default(),
        };

        for _ in 0..count {
            let restriction = TurnRestriction::read_from(&mut scanner)?;
            table.index(table.restrictions.len(), &restriction);
            table.restrictions.push(restriction);
        }

        Ok(table)
    }

    fn index(&mut self, position: usize, restriction: &TurnRestriction) {
        self.by_way
            .entry(restriction.from_way)
            .or_default()
            .push(position);
        if restriction.to_way != restriction.from_way {
            self.by_way
                .entry(restriction.to_way)
                .or_default()
                .push(position);
        }
    }

    /// A restriction pins `node_id` when the way takes part in a restriction
    /// whose via node it is; merging that node away would break the
    /// manoeuvre description
    fn is_restricted(&self, way_id: OsmId, node_id: OsmId) -> bool {
        self.by_way
            .get(&way_id)
            .map(|positions| {
                positions
                    .iter()
                    .any(|&p| self.restrictions[p].via_node == node_id)
            })
            .unwrap_or(false)
    }

    /// Point every reference to a merged-away way at its survivor
    fn rewrite(&mut self, old_id: OsmId, new_id: OsmId) {
        let Some(positions) = self.by_way.remove(&old_id) else {
            return;
        };

        for &position in &positions {
            let restriction = &mut self.restrictions[position];
            if restriction.from_way == old_id {
                restriction.from_way = new_id;
            }
            if restriction.to_way == old_id {
                restriction.to_way = new_id;
            }
        }

        self.by_way.entry(new_id).or_default().extend(positions);
    }

    fn write(&self, parameter: &ImportParameter) -> Result<()> {
        let mut writer = FileWriter::create(parameter.file_in_destination(TURNRESTR_DAT))?;
        writer.write_count_placeholder()?;

        for restriction in &self.restrictions {
            restriction.write_to(&mut writer)?;
        }

        writer.finish_with_count(self.restrictions.len() as u32)?;
        writer.close()
    }
}

fn add_endpoint(map: &mut FxHashMap<OsmId, Vec<usize>>, node: OsmId, index: usize) {
    let entry = map.entry(node).or_default();
    if !entry.contains(&index) {
        entry.push(index);
    }
}

fn remove_endpoint(map: &mut FxHashMap<OsmId, Vec<usize>>, node: OsmId, index: usize) {
    if let Some(entry) = map.get_mut(&node) {
        entry.retain(|&i| i != index);
        if entry.is_empty() {
            map.remove(&node);
        }
    }
}

/// Merge chains of ways sharing endpoints.
///
/// A merge is permitted iff the ways have equal feature values, the shared
/// node has exactly the two candidate ways incident on it, and no turn
/// restriction uses the node as its via point. Oneway ways are never
/// reversed.
fn merge_ways(ways: Vec<RawWay>, restrictions: &mut RestrictionTable) -> Vec<RawWay> {
    // preprocess never emits ways below two nodes; guard anyway so the
    // endpoint handling below cannot be tripped by a damaged file
    let mut slots: Vec<Option<RawWay>> = ways
        .into_iter()
        .filter(|way| way.node_ids.len() >= 2)
        .map(Some)
        .collect();

    let mut by_endpoint: FxHashMap<OsmId, Vec<usize>> = FxHashMap::default();
    for (index, slot) in slots.iter().enumerate() {
        let way = slot.as_ref().unwrap();
        add_endpoint(&mut by_endpoint, *way.node_ids.first().unwrap(), index);
        add_endpoint(&mut by_endpoint, *way.node_ids.last().unwrap(), index);
    }

    for index in 0..slots.len() {
        loop {
            if slots[index].is_none() {
                break;
            }

            if !try_merge_at_tail(index, &mut slots, &mut by_endpoint, restrictions) {
                break;
            }
        }
    }

    slots.into_iter().flatten().collect()
}

fn try_merge_at_tail(
    index: usize,
    slots: &mut [Option<RawWay>],
    by_endpoint: &mut FxHashMap<OsmId, Vec<usize>>,
    restrictions: &mut RestrictionTable,
) -> bool {
    let way = slots[index].as_ref().unwrap();
    let head = *way.node_ids.first().unwrap();
    let tail = *way.node_ids.last().unwrap();

    // a closed way has nothing to extend
    if head == tail {
        return false;
    }

    for node in [tail, head] {
        let Some(candidates) = by_endpoint.get(&node) else {
            continue;
        };

        // exactly two ways may be incident on the shared node
        if candidates.len() != 2 {
            continue;
        }

        let other_index = candidates[0] == index;
        let other_index = candidates[if other_index { 1 } else { 0 }];
        if other_index == index {
            continue;
        }

        let way = slots[index].as_ref().unwrap();
        let other = slots[other_index].as_ref().unwrap();

        if other.features != way.features {
            continue;
        }

        if restrictions.is_restricted(way.id, node) || restrictions.is_restricted(other.id, node) {
            continue;
        }

        let other_head = *other.node_ids.first().unwrap();
        let other_tail = *other.node_ids.last().unwrap();
        if other_head == other_tail {
            continue;
        }

        // orient the other way to continue from the shared node; a oneway
        // must keep its direction
        let oneway = way.features.oneway;
        let appended: Option<Vec<OsmId>> = if node == tail {
            if other_head == node {
                Some(other.node_ids[1..].to_vec())
            } else if other_tail == node && !oneway {
                Some(other.node_ids[..other.node_ids.len() - 1]
                    .iter()
                    .rev()
                    .copied()
                    .collect())
            } else {
                None
            }
        } else {
            // merging at the head: the other way must lead into us
            if other_tail == node {
                Some(other.node_ids[..other.node_ids.len() - 1].to_vec())
            } else if other_head == node && !oneway {
                Some(other.node_ids[1..].iter().rev().copied().collect())
            } else {
                None
            }
        };

        let Some(other_nodes) = appended else {
            continue;
        };

        let other = slots[other_index].take().unwrap();
        let way = slots[index].as_mut().unwrap();

        let (other_far, merged_nodes) = if node == tail {
            let far = *other_nodes.last().unwrap();
            let mut nodes = way.node_ids.clone();
            nodes.extend(other_nodes);
            (far, nodes)
        } else {
            let far = *other_nodes.first().unwrap();
            let mut nodes = other_nodes;
            nodes.extend(way.node_ids.iter().copied());
            (far, nodes)
        };

        // shared node becomes interior; the far endpoint transfers to us
        remove_endpoint(by_endpoint, node, index);
        remove_endpoint(by_endpoint, node, other_index);
        remove_endpoint(by_endpoint, *other.node_ids.first().unwrap(), other_index);
        remove_endpoint(by_endpoint, *other.node_ids.last().unwrap(), other_index);
        add_endpoint(by_endpoint, other_far, index);

        restrictions.rewrite(other.id, way.id);
        way.node_ids = merged_nodes;

        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RestrictionKind;
    use crate::types::FeatureValues;

    fn way(id: OsmId, node_ids: Vec<OsmId>) -> RawWay {
        RawWay {
            id,
            type_id: 1,
            is_area: false,
            features: FeatureValues::default(),
            node_ids,
        }
    }

    fn empty_restrictions() -> RestrictionTable {
        RestrictionTable {
            restrictions: Vec::new(),
            by_way: FxHashMap::default(),
        }
    }

    fn restriction_table(restrictions: Vec<TurnRestriction>) -> RestrictionTable {
        let mut table = empty_restrictions();
        for restriction in restrictions {
            table.index(table.restrictions.len(), &restriction);
            table.restrictions.push(restriction);
        }
        table
    }

    #[test]
    fn chains_sharing_an_endpoint_merge() {
        let mut restrictions = empty_restrictions();
        let merged = merge_ways(
            vec![way(1, vec![1, 2, 3]), way(2, vec![3, 4, 5])],
            &mut restrictions,
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, 1);
        assert_eq!(merged[0].node_ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn a_restriction_via_the_shared_node_refuses_the_merge() {
        let mut restrictions = restriction_table(vec![TurnRestriction {
            kind: RestrictionKind::Forbid,
            from_way: 1,
            via_node: 3,
            to_way: 2,
        }]);

        let merged = merge_ways(
            vec![way(1, vec![1, 2, 3]), way(2, vec![3, 4, 5])],
            &mut restrictions,
        );

        assert_eq!(merged.len(), 2);
        // the restriction is preserved verbatim
        assert_eq!(restrictions.restrictions[0].from_way, 1);
        assert_eq!(restrictions.restrictions[0].via_node, 3);
        assert_eq!(restrictions.restrictions[0].to_way, 2);
    }

    #[test]
    fn restrictions_elsewhere_are_rewritten_to_the_survivor() {
        // the restriction pivots on node 5, not on the merge node 3
        let mut restrictions = restriction_table(vec![TurnRestriction {
            kind: RestrictionKind::Forbid,
            from_way: 2,
            via_node: 5,
            to_way: 9,
        }]);

        let merged = merge_ways(
            vec![way(1, vec![1, 2, 3]), way(2, vec![3, 4, 5])],
            &mut restrictions,
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(restrictions.restrictions[0].from_way, 1);
        assert!(restrictions.is_restricted(1, 5));
    }

    #[test]
    fn a_third_incident_way_blocks_the_merge() {
        let mut restrictions = empty_restrictions();
        let merged = merge_ways(
            vec![
                way(1, vec![1, 2, 3]),
                way(2, vec![3, 4, 5]),
                way(3, vec![3, 9]),
            ],
            &mut restrictions,
        );

        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn differing_features_block_the_merge() {
        let mut restrictions = empty_restrictions();
        let mut second = way(2, vec![3, 4, 5]);
        second.features.name = Some("Am Kupfergraben".to_string());

        let merged = merge_ways(vec![way(1, vec![1, 2, 3]), second], &mut restrictions);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn reversed_fragments_merge_unless_oneway() {
        let mut restrictions = empty_restrictions();
        let merged = merge_ways(
            vec![way(1, vec![1, 2, 3]), way(2, vec![5, 4, 3])],
            &mut restrictions,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].node_ids, vec![1, 2, 3, 4, 5]);

        let mut restrictions = empty_restrictions();
        let mut first = way(1, vec![1, 2, 3]);
        let mut second = way(2, vec![5, 4, 3]);
        first.features.oneway = true;
        second.features.oneway = true;

        let merged = merge_ways(vec![first, second], &mut restrictions);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn chains_merge_transitively() {
        let mut restrictions = empty_restrictions();
        let merged = merge_ways(
            vec![
                way(1, vec![1, 2]),
                way(2, vec![2, 3]),
                way(3, vec![3, 4]),
                way(4, vec![4, 5]),
            ],
            &mut restrictions,
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].node_ids, vec![1, 2, 3, 4, 5]);
    }
}
