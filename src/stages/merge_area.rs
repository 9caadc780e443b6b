use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::geom::GeoCoord;
use crate::records::{Area, Ring, RingRole};
use crate::stages::rel_area::RELAREA_TMP;
use crate::stages::way_area::WAYAREA_TMP;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::types::TypeId;
use crate::Result;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

pub const AREAS_TMP: &str = "areas.tmp";
pub const AREAS2_TMP: &str = "areas2.tmp";

/// Stage 8: concatenate the relation-derived and way-derived area streams
pub struct MergeAreaDataStage;

impl Stage for MergeAreaDataStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("MergeAreaData", "Merge relation and way area sources")
            .requires(RELAREA_TMP)
            .requires(WAYAREA_TMP)
            .provides_temporary(AREAS_TMP)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        let mut writer = FileWriter::create(parameter.file_in_destination(AREAS_TMP))?;
        writer.write_count_placeholder()?;

        let mut written: u32 = 0;
        for source in [RELAREA_TMP, WAYAREA_TMP] {
            ctx.progress.set_action(&format!("Copying '{}'", source));

            let mut scanner = FileScanner::open(parameter.file_in_destination(source), false)?;
            let count = scanner.read_u32()?;

            for _ in 0..count {
                ctx.check_aborted()?;
                let area = Area::read_from(&mut scanner)?;
                area.write_to(&mut writer)?;
                written += 1;
            }
        }

        writer.finish_with_count(written)?;
        writer.close()?;

        ctx.progress.info(&format!("{} areas collected", written));
        Ok(())
    }
}

/// Stage 9: merge same-type areas that share a complete boundary edge, so
/// objects split at data-block borders become one polygon again
pub struct MergeAreasStage;

impl Stage for MergeAreasStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("MergeAreas", "Merge touching areas of the same type")
            .requires(AREAS_TMP)
            .provides_temporary(AREAS2_TMP)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        let mut scanner = FileScanner::open(parameter.file_in_destination(AREAS_TMP), false)?;
        let count = scanner.read_u32()?;

        ctx.progress
            .set_action(&format!("Merging {} areas", count));

        // group per type; only types occur that actually have areas, so the
        // map stays small even for a rich catalogue
        let mut by_type: FxHashMap<TypeId, Vec<Area>> = FxHashMap::default();
        for _ in 0..count {
            ctx.check_aborted()?;
            let area = Area::read_from(&mut scanner)?;
            by_type.entry(area.type_id).or_default().push(area);
        }

        let mut groups: Vec<(TypeId, Vec<Area>)> = by_type.into_iter().collect();
        groups.sort_unstable_by_key(|(type_id, _)| *type_id);

        // types are independent, so the merge work fans out to the rayon
        // pool; collect keeps type order, the single writer below stays
        // deterministic, and the pool joins before the stage returns
        let merged_groups: Vec<(usize, Vec<Area>)> = groups
            .into_par_iter()
            .map(|(_, areas)| {
                let before = areas.len();
                let merged = merge_type_areas(areas);
                (before - merged.len(), merged)
            })
            .collect();

        let mut writer = FileWriter::create(parameter.file_in_destination(AREAS2_TMP))?;
        writer.write_count_placeholder()?;

        let mut written: u32 = 0;
        let mut merged_total = 0usize;
        for (merged_away, areas) in merged_groups {
            merged_total += merged_away;

            for area in areas {
                area.write_to(&mut writer)?;
                written += 1;
            }
        }

        writer.finish_with_count(written)?;
        writer.close()?;

        ctx.progress.info(&format!(
            "{} areas written, {} pairs merged",
            written, merged_total
        ));
        Ok(())
    }
}

type Edge = (u64, u64);

fn coord_key(coord: GeoCoord) -> u64 {
    let (lat, lon) = coord.encode();
    ((lat as u64) << 32) | lon as u64
}

/// Undirected edge key of two consecutive ring coordinates
fn edge_key(a: GeoCoord, b: GeoCoord) -> Edge {
    let (a, b) = (coord_key(a), coord_key(b));
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn outer_edges(area: &Area) -> Vec<Edge> {
    let Some(ring) = area.outer_ring() else {
        return Vec::new();
    };

    let coords = &ring.coords;
    (0..coords.len())
        .map(|i| edge_key(coords[i], coords[(i + 1) % coords.len()]))
        .collect()
}

/// Merge areas within one type until no pair shares an outer edge any more.
/// Only simple areas (single outer ring, equal features) are candidates.
fn merge_type_areas(areas: Vec<Area>) -> Vec<Area> {
    let mut areas: Vec<Option<Area>> = areas.into_iter().map(Some).collect();

    loop {
        let mut edge_owner: FxHashMap<Edge, usize> = FxHashMap::default();
        let mut merge_pair: Option<(usize, usize, Edge)> = None;

        'outer: for (index, slot) in areas.iter().enumerate() {
            let Some(area) = slot else { continue };
            if area.rings.iter().filter(|r| r.role == RingRole::Outer).count() != 1 {
                continue;
            }

            for edge in outer_edges(area) {
                if let Some(&other) = edge_owner.get(&edge) {
                    let other_area = areas[other].as_ref().unwrap();
                    if other_area.features == area.features {
                        merge_pair = Some((other, index, edge));
                        break 'outer;
                    }
                } else {
                    edge_owner.insert(edge, index);
                }
            }
        }

        let Some((left, right, edge)) = merge_pair else {
            break;
        };

        let right_area = areas[right].take().unwrap();
        let left_area = areas[left].as_mut().unwrap();

        let left_coords = left_area.outer_ring().unwrap().coords.clone();
        let mut right_coords = right_area.outer_ring().unwrap().coords.clone();

        // ring orientations may differ; retry with the right ring reversed
        let joined = splice_rings(&left_coords, &right_coords, edge).or_else(|| {
            right_coords.reverse();
            splice_rings(&left_coords, &right_coords, edge)
        });

        if let Some(joined) = joined {
            let mut rings = vec![Ring {
                role: RingRole::Outer,
                coords: joined,
            }];
            rings.extend(
                left_area
                    .rings
                    .iter()
                    .chain(right_area.rings.iter())
                    .filter(|r| r.role == RingRole::Inner)
                    .cloned(),
            );
            left_area.rings = rings;
        } else {
            // geometry did not line up after all; keep both
            areas[right] = Some(right_area);
            break;
        }
    }

    areas.into_iter().flatten().collect()
}

/// Join two rings sharing the undirected edge into one ring that walks
/// around both polygons, dropping the shared edge
fn splice_rings(left: &[GeoCoord], right: &[GeoCoord], edge: Edge) -> Option<Vec<GeoCoord>> {
    let left_at = (0..left.len()).find(|&i| {
        edge_key(left[i], left[(i + 1) % left.len()]) == edge
    })?;
    let right_at = (0..right.len()).find(|&i| {
        edge_key(right[i], right[(i + 1) % right.len()]) == edge
    })?;

    // walk the right ring from the far side of the shared edge back around
    let mut joined: Vec<GeoCoord> = Vec::with_capacity(left.len() + right.len() - 2);
    joined.extend_from_slice(&left[..=left_at]);

    let mut i = (right_at + 2) % right.len();
    loop {
        joined.push(right[i]);
        if i == right_at {
            break;
        }
        i = (i + 1) % right.len();
    }

    // the walk must end on the edge endpoint the left ring continues from
    let resumed = (left_at + 1) % left.len();
    let seam = joined.pop()?;
    if coord_key(seam) != coord_key(left[resumed]) {
        return None;
    }
    if resumed != 0 {
        joined.extend_from_slice(&left[resumed..]);
    }

    if joined.len() < 3 {
        return None;
    }
    Some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureValues;

    fn square(id: u64, coords: &[(f64, f64)]) -> Area {
        Area {
            id,
            type_id: 2,
            features: FeatureValues::default(),
            rings: vec![Ring {
                role: RingRole::Outer,
                coords: coords
                    .iter()
                    .map(|(lat, lon)| GeoCoord::new(*lat, *lon))
                    .collect(),
            }],
        }
    }

    #[test]
    fn adjacent_squares_merge_into_one_area() {
        // two unit squares sharing the edge (0,1)-(1,1)
        let left = square(1, &[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)]);
        let right = square(2, &[(0.0, 1.0), (0.0, 2.0), (1.0, 2.0), (1.0, 1.0)]);

        let merged = merge_type_areas(vec![left, right]);
        assert_eq!(merged.len(), 1);

        let ring = &merged[0].outer_ring().unwrap().coords;
        assert_eq!(ring.len(), 6);

        // the merged outline covers both squares
        let mut bbox = crate::geom::GeoBox::new();
        for coord in ring {
            bbox.include(*coord);
        }
        assert_eq!(bbox.min, GeoCoord::new(0.0, 0.0));
        assert_eq!(bbox.max, GeoCoord::new(1.0, 2.0));
    }

    #[test]
    fn disjoint_areas_stay_apart() {
        let a = square(1, &[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)]);
        let b = square(2, &[(5.0, 5.0), (5.0, 6.0), (6.0, 6.0), (6.0, 5.0)]);

        let merged = merge_type_areas(vec![a, b]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn differing_features_prevent_a_merge() {
        let a = square(1, &[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)]);
        let mut b = square(2, &[(0.0, 1.0), (0.0, 2.0), (1.0, 2.0), (1.0, 1.0)]);
        b.features.name = Some("Harbour Basin".to_string());

        let merged = merge_type_areas(vec![a, b]);
        assert_eq!(merged.len(), 2);
    }
}
