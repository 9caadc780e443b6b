use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter, NumericIndex};
use crate::records::{Area, MemberKind, OsmId, RawRelation, RawWay, Ring, RingRole};
use crate::stages::coord_data::{CoordStore, StoredCoord, COORD_DAT};
use crate::stages::preprocess::{RAWRELS_DAT, RAWWAYS_DAT};
use crate::stages::raw_index::{RAWRELS_IDX, RAWWAYS_IDX};
use crate::stages::type_data::TYPES_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::types::TYPE_IGNORE;
use crate::Result;
use rustc_hash::FxHashMap;

pub const RELAREA_TMP: &str = "relarea.tmp";

/// Relations nested deeper than this are treated as unresolvable
const MAX_RELATION_DEPTH: usize = 6;

/// Stage 6: derive area geometries from multipolygon relations
pub struct RelAreaDataStage;

impl Stage for RelAreaDataStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("RelAreaData", "Generate area data from relations")
            .requires(TYPES_DAT)
            .requires(RAWRELS_DAT)
            .requires(RAWRELS_IDX)
            .requires(RAWWAYS_DAT)
            .requires(RAWWAYS_IDX)
            .requires(COORD_DAT)
            .provides_temporary(RELAREA_TMP)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        ctx.type_config
            .verify_dat(parameter.file_in_destination(TYPES_DAT))?;

        let mut relation_scanner =
            FileScanner::open(parameter.file_in_destination(RAWRELS_DAT), false)?;
        let relation_count = relation_scanner.read_u32()?;

        let mut way_reader = RawWayReader::open(parameter)?;
        let mut relation_index = NumericIndex::open(
            parameter.file_in_destination(RAWRELS_IDX),
            false,
            parameter.numeric_index_page_size,
        )?;
        let mut coord_store = CoordStore::open(parameter)?;

        let mut writer = FileWriter::create(parameter.file_in_destination(RELAREA_TMP))?;
        writer.write_count_placeholder()?;

        ctx.progress
            .set_action(&format!("Assembling {} multipolygon relations", relation_count));
        ctx.progress.set_total(relation_count as u64);

        let mut written: u32 = 0;
        for index in 0..relation_count {
            ctx.check_aborted()?;
            ctx.progress.progress(index as u64 + 1);

            let relation = RawRelation::read_from(&mut relation_scanner)?;
            if relation.type_id == TYPE_IGNORE {
                continue;
            }

            let Some(area) = assemble_relation(
                ctx,
                &relation,
                &mut way_reader,
                &mut relation_index,
                &mut coord_store,
            )?
            else {
                continue;
            };

            area.write_to(&mut writer)?;
            written += 1;
        }

        writer.finish_with_count(written)?;
        writer.close()?;

        ctx.progress
            .info(&format!("{} relation areas written", written));
        Ok(())
    }
}

/// Random-access reader over the raw way file
struct RawWayReader {
    scanner: FileScanner,
    index: NumericIndex,
}

impl RawWayReader {
    fn open(parameter: &ImportParameter) -> Result<Self> {
        Ok(Self {
            scanner: FileScanner::open(
                parameter.file_in_destination(RAWWAYS_DAT),
                parameter.raw_way_data_memory_mapped,
            )?,
            index: NumericIndex::open(
                parameter.file_in_destination(RAWWAYS_IDX),
                parameter.raw_way_index_memory_mapped,
                parameter.raw_way_index_cache_size,
            )?,
        })
    }

    fn get(&mut self, id: OsmId) -> Result<Option<RawWay>> {
        let Some(offset) = self.index.offset_of(id)? else {
            return Ok(None);
        };
        self.scanner.set_pos(offset)?;
        Ok(Some(RawWay::read_from(&mut self.scanner)?))
    }
}

/// Member ways grouped by the ring role their relation assigns them
struct MemberWays {
    outer: Vec<RawWay>,
    inner: Vec<RawWay>,
}

fn collect_member_ways(
    ctx: &StageContext,
    relation: &RawRelation,
    way_reader: &mut RawWayReader,
    relation_index: &mut NumericIndex,
    depth: usize,
) -> Result<Option<MemberWays>> {
    if depth > MAX_RELATION_DEPTH {
        ctx.progress.warning(&format!(
            "Relation {} exceeds the supported member nesting depth",
            relation.id
        ));
        return Ok(None);
    }

    let mut ways = MemberWays {
        outer: Vec::new(),
        inner: Vec::new(),
    };

    for member in &relation.members {
        match member.kind {
            MemberKind::Node => {}
            MemberKind::Way => {
                let Some(way) = way_reader.get(member.id)? else {
                    ctx.progress.warning(&format!(
                        "Relation {} references way {} which is not available",
                        relation.id, member.id
                    ));
                    return Ok(None);
                };

                if member.role == "inner" {
                    ways.inner.push(way);
                } else {
                    ways.outer.push(way);
                }
            }
            MemberKind::Relation => {
                // resolve one nesting level and inherit that relation's roles
                let Some(offset) = relation_index.offset_of(member.id)? else {
                    ctx.progress.warning(&format!(
                        "Relation {} references relation {} which is not available",
                        relation.id, member.id
                    ));
                    return Ok(None);
                };

                let parameter = &ctx.parameter;
                let mut nested_scanner =
                    FileScanner::open(parameter.file_in_destination(RAWRELS_DAT), false)?;
                nested_scanner.set_pos(offset)?;
                let nested = RawRelation::read_from(&mut nested_scanner)?;

                let Some(nested_ways) =
                    collect_member_ways(ctx, &nested, way_reader, relation_index, depth + 1)?
                else {
                    return Ok(None);
                };

                ways.outer.extend(nested_ways.outer);
                ways.inner.extend(nested_ways.inner);
            }
        }
    }

    Ok(Some(ways))
}

fn assemble_relation(
    ctx: &StageContext,
    relation: &RawRelation,
    way_reader: &mut RawWayReader,
    relation_index: &mut NumericIndex,
    coord_store: &mut CoordStore,
) -> Result<Option<Area>> {
    let Some(members) = collect_member_ways(ctx, relation, way_reader, relation_index, 0)? else {
        return Ok(None);
    };

    if members.outer.is_empty() {
        ctx.progress.warning(&format!(
            "Relation {} has no outer ring members",
            relation.id
        ));
        return Ok(None);
    }

    let mut node_ids: Vec<OsmId> = Vec::new();
    for way in members.outer.iter().chain(members.inner.iter()) {
        node_ids.extend_from_slice(&way.node_ids);
    }
    let coords = coord_store.get_many(&node_ids)?;

    let mut rings = Vec::new();
    for (role, group) in [
        (RingRole::Outer, &members.outer),
        (RingRole::Inner, &members.inner),
    ] {
        let Some(id_rings) = join_rings(group) else {
            ctx.progress.warning(&format!(
                "Relation {} has unclosed {:?} rings",
                relation.id, role
            ));
            return Ok(None);
        };

        for id_ring in id_rings {
            let Some(ring) = resolve_ring(&id_ring, &coords) else {
                ctx.progress.warning(&format!(
                    "Relation {} references nodes without coordinates",
                    relation.id
                ));
                return Ok(None);
            };
            rings.push(Ring {
                role,
                coords: ring,
            });
        }
    }

    Ok(Some(Area {
        id: relation.id as u64,
        type_id: relation.type_id,
        features: relation.features.clone(),
        rings,
    }))
}

fn resolve_ring(
    ids: &[OsmId],
    coords: &FxHashMap<OsmId, StoredCoord>,
) -> Option<Vec<crate::geom::GeoCoord>> {
    ids.iter()
        .map(|id| coords.get(id).map(|stored| stored.coord))
        .collect()
}

/// Join open way fragments into closed rings by matching endpoints.
///
/// Ways already classified as areas arrive pre-closed (their duplicate
/// closing id stripped) and pass through as complete rings.
fn join_rings(ways: &[RawWay]) -> Option<Vec<Vec<OsmId>>> {
    let mut rings: Vec<Vec<OsmId>> = Vec::new();
    let mut segments: Vec<&[OsmId]> = Vec::new();

    for way in ways {
        if way.node_ids.len() < 2 {
            return None;
        }

        if way.is_area {
            rings.push(way.node_ids.clone());
        } else {
            segments.push(&way.node_ids);
        }
    }

    while let Some(first) = segments.pop() {
        let mut chain: Vec<OsmId> = first.to_vec();

        loop {
            if chain.len() > 3 && chain.first() == chain.last() {
                chain.pop();
                rings.push(chain);
                break;
            }

            let tail = *chain.last().unwrap();
            let position = segments.iter().position(|segment| {
                *segment.first().unwrap() == tail || *segment.last().unwrap() == tail
            })?;

            let segment = segments.swap_remove(position);
            if *segment.first().unwrap() == tail {
                chain.extend_from_slice(&segment[1..]);
            } else {
                chain.extend(segment[..segment.len() - 1].iter().rev());
            }
        }
    }

    Some(rings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureValues;

    fn open_way(id: OsmId, node_ids: Vec<OsmId>) -> RawWay {
        RawWay {
            id,
            type_id: TYPE_IGNORE,
            is_area: false,
            features: FeatureValues::default(),
            node_ids,
        }
    }

    #[test]
    fn fragments_join_into_a_closed_ring() {
        let ways = vec![
            open_way(1, vec![10, 11, 12]),
            open_way(2, vec![12, 13, 14]),
            open_way(3, vec![14, 15, 10]),
        ];

        let rings = join_rings(&ways).unwrap();
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0], vec![10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn reversed_fragments_join_too() {
        let ways = vec![
            open_way(1, vec![10, 11, 12]),
            // same segment as before, but drawn the other way round
            open_way(2, vec![14, 13, 12]),
            open_way(3, vec![14, 15, 10]),
        ];

        let rings = join_rings(&ways).unwrap();
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0], vec![10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn unclosed_fragments_fail() {
        let ways = vec![open_way(1, vec![10, 11, 12]), open_way(2, vec![12, 13, 14])];
        assert!(join_rings(&ways).is_none());
    }

    #[test]
    fn preclosed_area_ways_pass_through() {
        let mut way = open_way(1, vec![10, 11, 12, 13]);
        way.is_area = true;

        let rings = join_rings(&[way]).unwrap();
        assert_eq!(rings, vec![vec![10, 11, 12, 13]]);
    }
}
