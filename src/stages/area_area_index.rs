use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::geom::{tile_range, TileId};
use crate::records::Area;
use crate::stages::sort_objects::AREAS_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;
use std::collections::BTreeMap;

pub const AREAAREA_IDX: &str = "areaarea.idx";

/// Stage 17: quadtree-style index over the area file.
///
/// Each area is placed at the deepest level where its bounding box still
/// fits into a single grid cell, so queries descend exactly as far as the
/// object sizes require.
pub struct AreaAreaIndexStage;

impl Stage for AreaAreaIndexStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("AreaAreaIndex", "Generate area area index")
            .requires(AREAS_DAT)
            .provides(AREAAREA_IDX)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;
        let max_level = parameter.area_area_index_max_mag;

        let mut scanner = FileScanner::open(
            parameter.file_in_destination(AREAS_DAT),
            parameter.area_data_memory_mapped,
        )?;
        let count = scanner.read_u32()?;

        ctx.progress
            .set_action(&format!("Distributing {} areas over {} levels", count, max_level + 1));

        // per level: cell -> area offsets
        let mut levels: Vec<BTreeMap<TileId, Vec<u64>>> =
            vec![BTreeMap::new(); max_level as usize + 1];

        for _ in 0..count {
            ctx.check_aborted()?;

            let offset = scanner.position();
            let area = Area::read_from(&mut scanner)?;
            let bbox = area.bounding_box();
            if !bbox.is_valid() {
                continue;
            }

            let (level, tile) = placement(&bbox, max_level);
            levels[level as usize].entry(tile).or_default().push(offset);
        }

        let mut writer = FileWriter::create(parameter.file_in_destination(AREAAREA_IDX))?;
        writer.write_u32(max_level)?;

        for (level, cells) in levels.iter().enumerate() {
            writer.write_u32(cells.len() as u32)?;

            for (tile, offsets) in cells {
                writer.write_u32(tile.x)?;
                writer.write_u32(tile.y)?;
                writer.write_unsigned(offsets.len() as u64)?;

                let mut last = 0u64;
                for offset in offsets {
                    writer.write_unsigned(offset - last)?;
                    last = *offset;
                }
            }

            if !cells.is_empty() {
                ctx.progress.info(&format!(
                    "Level {}: {} cells, {} entries",
                    level,
                    cells.len(),
                    cells.values().map(Vec::len).sum::<usize>()
                ));
            }
        }

        writer.close()
    }
}

/// Deepest level at which the bounding box occupies one cell
fn placement(bbox: &crate::geom::GeoBox, max_level: u32) -> (u32, TileId) {
    for level in (0..=max_level).rev() {
        let (tile_min, tile_max) = tile_range(bbox, level);
        if tile_min == tile_max {
            return (level, tile_min);
        }
    }

    (0, TileId::new(0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{GeoBox, GeoCoord};

    fn bbox(min: (f64, f64), max: (f64, f64)) -> GeoBox {
        let mut bbox = GeoBox::new();
        bbox.include(GeoCoord::new(min.0, min.1));
        bbox.include(GeoCoord::new(max.0, max.1));
        bbox
    }

    #[test]
    fn small_areas_sink_to_the_deepest_level() {
        let tiny = bbox((50.0, 10.0), (50.0001, 10.0001));
        let (level, _) = placement(&tiny, 17);
        assert_eq!(level, 17);
    }

    #[test]
    fn larger_areas_live_higher_up() {
        let tiny = bbox((50.0, 10.0), (50.0001, 10.0001));
        let large = bbox((50.0, 10.0), (55.0, 20.0));

        let (tiny_level, _) = placement(&tiny, 17);
        let (large_level, _) = placement(&large, 17);
        assert!(large_level < tiny_level);
    }

    #[test]
    fn boundary_straddling_areas_move_up_until_they_fit() {
        // straddles the prime meridian, cannot fit a single cell until the
        // grid is coarse enough
        let straddling = bbox((50.0, -0.1), (50.1, 0.1));
        let (level, tile) = placement(&straddling, 17);

        let (tile_min, tile_max) = tile_range(&straddling, level);
        assert_eq!(tile_min, tile_max);
        assert_eq!(tile, tile_min);
    }
}
