use crate::config::{ImportParameter, OptimizeMethod};
use crate::fileio::{FileScanner, FileWriter};
use crate::geom::{cell_width, GeoCoord};
use crate::records::{Area, RingRole, Way};
use crate::stages::sort_objects::{AREAS_DAT, WAYS_DAT};
use crate::stages::{Stage, StageContext, StageDescription};
use crate::types::TypeId;
use crate::Result;
use geo::{LineString, Simplify};
use rustc_hash::FxHashMap;

pub const WAYSOPT_DAT: &str = "waysopt.dat";
pub const AREASOPT_DAT: &str = "areasopt.dat";

/// Douglas-Peucker tolerance in degrees for one magnification; a fraction
/// of the cell size so simplification stays invisible at that zoom
fn tolerance(parameter: &ImportParameter, magnification: u32) -> f64 {
    let pixel = cell_width(magnification) / 256.0;
    match parameter.optimization_way_method {
        OptimizeMethod::Quality => pixel,
        OptimizeMethod::Fast => pixel * 4.0,
    }
}

fn simplify_line(coords: &[GeoCoord], epsilon: f64) -> Vec<GeoCoord> {
    let line: LineString<f64> = coords
        .iter()
        .map(|c| geo::coord! { x: c.lon, y: c.lat })
        .collect();

    line.simplify(&epsilon)
        .into_iter()
        .map(|c| GeoCoord::new(c.y, c.x))
        .collect()
}

/// Stage 20: pre-simplified way geometry for low zoom rendering
pub struct OptimizeWaysLowZoomStage;

impl Stage for OptimizeWaysLowZoomStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("OptimizeWaysLowZoom", "Generate low zoom way geometry")
            .requires(WAYS_DAT)
            .provides(WAYSOPT_DAT)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        let mut scanner = FileScanner::open(
            parameter.file_in_destination(WAYS_DAT),
            parameter.way_data_memory_mapped,
        )?;
        let count = scanner.read_u32()?;

        ctx.progress
            .set_action(&format!("Collecting optimizable ways out of {}", count));

        let mut by_type: FxHashMap<TypeId, Vec<Way>> = FxHashMap::default();
        for _ in 0..count {
            ctx.check_aborted()?;

            let way = Way::read_from(&mut scanner)?;
            if ctx.type_config.get(way.type_id).optimize_low_zoom {
                by_type.entry(way.type_id).or_default().push(way);
            }
        }

        let mut type_ids: Vec<TypeId> = by_type.keys().copied().collect();
        type_ids.sort_unstable();

        // drop types too large for the optimization pass
        type_ids.retain(|type_id| {
            let ways = &by_type[type_id];
            if ways.len() > parameter.optimization_max_way_count {
                ctx.progress.warning(&format!(
                    "Way type {} has {} ways, skipping low zoom optimization",
                    ctx.type_config.get(*type_id).name,
                    ways.len()
                ));
                false
            } else {
                true
            }
        });

        let mut writer = FileWriter::create(parameter.file_in_destination(WAYSOPT_DAT))?;
        writer.write_u32(type_ids.len() as u32)?;

        for type_id in type_ids {
            let ways = &by_type[&type_id];

            writer.write_u16(type_id)?;
            writer.write_u32(parameter.optimization_min_mag)?;
            writer.write_u32(parameter.optimization_max_mag)?;

            for magnification in parameter.optimization_min_mag..=parameter.optimization_max_mag
            {
                ctx.check_aborted()?;
                let epsilon = tolerance(parameter, magnification);

                let simplified: Vec<(u64, Vec<GeoCoord>)> = ways
                    .iter()
                    .filter_map(|way| {
                        let coords: Vec<GeoCoord> =
                            way.nodes.iter().map(|n| n.coord).collect();
                        let simplified = simplify_line(&coords, epsilon);
                        (simplified.len() >= 2).then_some((way.id, simplified))
                    })
                    .collect();

                writer.write_u32(simplified.len() as u32)?;
                for (id, coords) in &simplified {
                    writer.write_unsigned(*id)?;
                    writer.write_unsigned(coords.len() as u64)?;
                    for coord in coords {
                        writer.write_coord(*coord)?;
                    }
                }
            }

            ctx.progress.info(&format!(
                "Way type {}: {} ways optimized",
                ctx.type_config.get(type_id).name,
                ways.len()
            ));
        }

        writer.close()
    }
}

/// Stage 19: pre-simplified area geometry for low zoom rendering
pub struct OptimizeAreasLowZoomStage;

impl Stage for OptimizeAreasLowZoomStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("OptimizeAreasLowZoom", "Generate low zoom area geometry")
            .requires(AREAS_DAT)
            .provides(AREASOPT_DAT)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        let mut scanner = FileScanner::open(
            parameter.file_in_destination(AREAS_DAT),
            parameter.area_data_memory_mapped,
        )?;
        let count = scanner.read_u32()?;

        ctx.progress
            .set_action(&format!("Collecting optimizable areas out of {}", count));

        let mut by_type: FxHashMap<TypeId, Vec<Area>> = FxHashMap::default();
        for _ in 0..count {
            ctx.check_aborted()?;

            let area = Area::read_from(&mut scanner)?;
            if ctx.type_config.get(area.type_id).optimize_low_zoom {
                by_type.entry(area.type_id).or_default().push(area);
            }
        }

        let mut type_ids: Vec<TypeId> = by_type.keys().copied().collect();
        type_ids.sort_unstable();

        let mut writer = FileWriter::create(parameter.file_in_destination(AREASOPT_DAT))?;
        writer.write_u32(type_ids.len() as u32)?;

        for type_id in type_ids {
            let areas = &by_type[&type_id];

            writer.write_u16(type_id)?;
            writer.write_u32(parameter.optimization_min_mag)?;
            writer.write_u32(parameter.optimization_max_mag)?;

            for magnification in parameter.optimization_min_mag..=parameter.optimization_max_mag
            {
                ctx.check_aborted()?;
                let epsilon = tolerance(parameter, magnification);

                // simplify the outer ring; an area degenerating below a
                // triangle disappears at this magnification
                let simplified: Vec<(u64, Vec<GeoCoord>)> = areas
                    .iter()
                    .filter_map(|area| {
                        let ring = area
                            .rings
                            .iter()
                            .find(|r| r.role == RingRole::Outer)?;
                        let simplified = simplify_line(&ring.coords, epsilon);
                        (simplified.len() >= 3).then_some((area.id, simplified))
                    })
                    .collect();

                writer.write_u32(simplified.len() as u32)?;
                for (id, coords) in &simplified {
                    writer.write_unsigned(*id)?;
                    writer.write_unsigned(coords.len() as u64)?;
                    for coord in coords {
                        writer.write_coord(*coord)?;
                    }
                }
            }

            ctx.progress.info(&format!(
                "Area type {}: {} areas optimized",
                ctx.type_config.get(type_id).name,
                areas.len()
            ));
        }

        writer.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplification_removes_collinear_points() {
        let coords = vec![
            GeoCoord::new(0.0, 0.0),
            GeoCoord::new(0.0, 0.5),
            GeoCoord::new(0.0, 1.0),
            GeoCoord::new(1.0, 1.0),
        ];

        let simplified = simplify_line(&coords, 0.001);
        assert_eq!(simplified.len(), 3);
        assert_eq!(simplified[0], GeoCoord::new(0.0, 0.0));
        assert_eq!(simplified[2], GeoCoord::new(1.0, 1.0));
    }

    #[test]
    fn fast_method_uses_a_coarser_tolerance() {
        let quality = ImportParameter::default();
        let fast = ImportParameter {
            optimization_way_method: OptimizeMethod::Fast,
            ..Default::default()
        };

        assert!(tolerance(&fast, 8) > tolerance(&quality, 8));
    }
}
