use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::geom::{tile_range, TileId};
use crate::records::Way;
use crate::stages::sort_objects::WAYS_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::types::{TypeId, TYPE_IGNORE};
use crate::Result;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

pub const AREAWAY_IDX: &str = "areaway.idx";

/// Selected index magnification and cell statistics for one way type
#[derive(Debug, Clone)]
struct TypeData {
    type_id: TypeId,
    index_level: u32,
    index_cells: u64,
    index_entries: u64,
    tile_min: TileId,
    tile_max: TileId,
    /// position of the bitmap offset in the header, patched later
    index_offset: u64,
}

impl TypeData {
    fn has_entries(&self) -> bool {
        self.index_cells > 0 && self.index_entries > 0
    }
}

/// Per-cell fill counts of one type at one candidate level
#[derive(Default)]
struct CellFill {
    counts: FxHashMap<TileId, u64>,
}

impl CellFill {
    fn entries(&self) -> u64 {
        self.counts.values().sum()
    }

    fn max_cell(&self) -> u64 {
        self.counts.values().copied().max().unwrap_or(0)
    }

    fn average(&self) -> f64 {
        if self.counts.is_empty() {
            0.0
        } else {
            self.entries() as f64 / self.counts.len() as f64
        }
    }

    fn tile_bounds(&self) -> Option<(TileId, TileId)> {
        let mut min: Option<TileId> = None;
        let mut max: Option<TileId> = None;

        for tile in self.counts.keys() {
            min = Some(match min {
                None => *tile,
                Some(m) => TileId::new(m.x.min(tile.x), m.y.min(tile.y)),
            });
            max = Some(match max {
                None => *tile,
                Some(m) => TileId::new(m.x.max(tile.x), m.y.max(tile.y)),
            });
        }

        Some((min?, max?))
    }
}

/// A level fits when at least one cell is filled and either both cell-size
/// thresholds hold or everything lives in a single cell anyway.
/// The way index shares the cell-size tuning knobs with the node index.
fn fits_index_criteria(parameter: &ImportParameter, fill: &CellFill) -> bool {
    if fill.counts.is_empty() {
        return false;
    }

    if fill.counts.len() == 1 {
        return true;
    }

    fill.max_cell() <= parameter.area_node_index_cell_size_max as u64
        && fill.average() <= parameter.area_node_index_cell_size_average as f64
}

/// Stage 16: build the bitmap index from grid cells to the ways whose
/// bounding box intersects them, at a per-type selected magnification
pub struct AreaWayIndexStage;

impl Stage for AreaWayIndexStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("AreaWayIndex", "Generate area way index")
            .requires(WAYS_DAT)
            .provides(AREAWAY_IDX)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        // types that can occur in the way file
        let mut remaining: Vec<TypeId> = ctx
            .type_config
            .types()
            .filter(|info| info.can_be_way && info.index != TYPE_IGNORE)
            .map(|info| info.index)
            .collect();

        let mut selected: Vec<TypeData> = Vec::new();

        for level in parameter.area_way_min_mag..=parameter.area_way_index_max_level {
            if remaining.is_empty() {
                break;
            }
            ctx.check_aborted()?;
            ctx.progress
                .set_action(&format!("Scanning level {}", level));

            let fills = scan_level(ctx, &remaining, level)?;

            let at_max_level = level == parameter.area_way_index_max_level;
            remaining.retain(|type_id| {
                let fill = &fills[type_id];

                // a type without any way never gets a bitmap
                if fill.counts.is_empty() {
                    selected.push(TypeData {
                        type_id: *type_id,
                        index_level: level,
                        index_cells: 0,
                        index_entries: 0,
                        tile_min: TileId::new(0, 0),
                        tile_max: TileId::new(0, 0),
                        index_offset: 0,
                    });
                    return false;
                }

                if fits_index_criteria(parameter, fill) || at_max_level {
                    if at_max_level && !fits_index_criteria(parameter, fill) {
                        ctx.progress.warning(&format!(
                            "Way type {} does not fit index criteria at maximum level {}",
                            ctx.type_config.get(*type_id).name,
                            level
                        ));
                    }

                    let (tile_min, tile_max) = fill.tile_bounds().unwrap();
                    selected.push(TypeData {
                        type_id: *type_id,
                        index_level: level,
                        index_cells: fill.counts.len() as u64,
                        index_entries: fill.entries(),
                        tile_min,
                        tile_max,
                        index_offset: 0,
                    });
                    return false;
                }

                true
            });
        }

        for data in &selected {
            if data.has_entries() {
                ctx.progress.info(&format!(
                    "Way type {}: level {}, {} cells, {} entries",
                    ctx.type_config.get(data.type_id).name,
                    data.index_level,
                    data.index_cells,
                    data.index_entries
                ));
            }
        }

        write_index(ctx, &mut selected)?;
        Ok(())
    }
}

fn scan_level(
    ctx: &StageContext,
    remaining: &[TypeId],
    level: u32,
) -> Result<FxHashMap<TypeId, CellFill>> {
    let parameter = &ctx.parameter;

    let mut fills: FxHashMap<TypeId, CellFill> = remaining
        .iter()
        .map(|type_id| (*type_id, CellFill::default()))
        .collect();

    let mut scanner = FileScanner::open(
        parameter.file_in_destination(WAYS_DAT),
        parameter.way_data_memory_mapped,
    )?;
    let count = scanner.read_u32()?;

    for _ in 0..count {
        let way = Way::read_from(&mut scanner)?;
        let Some(fill) = fills.get_mut(&way.type_id) else {
            continue;
        };

        let bbox = way.bounding_box();
        if !bbox.is_valid() {
            continue;
        }

        let (tile_min, tile_max) = tile_range(&bbox, level);
        for y in tile_min.y..=tile_max.y {
            for x in tile_min.x..=tile_max.x {
                *fill.counts.entry(TileId::new(x, y)).or_insert(0) += 1;
            }
        }
    }

    Ok(fills)
}

fn write_index(ctx: &StageContext, selected: &mut [TypeData]) -> Result<()> {
    let parameter = &ctx.parameter;

    ctx.progress
        .set_action(&format!("Writing '{}'", AREAWAY_IDX));

    // collect per-cell way offsets for every type that got a bitmap
    let mut cell_offsets: FxHashMap<TypeId, BTreeMap<TileId, Vec<u64>>> = selected
        .iter()
        .filter(|data| data.has_entries())
        .map(|data| (data.type_id, BTreeMap::new()))
        .collect();
    let level_of: FxHashMap<TypeId, u32> = selected
        .iter()
        .map(|data| (data.type_id, data.index_level))
        .collect();

    let mut scanner = FileScanner::open(
        parameter.file_in_destination(WAYS_DAT),
        parameter.way_data_memory_mapped,
    )?;
    let count = scanner.read_u32()?;

    for _ in 0..count {
        let offset = scanner.position();
        let way = Way::read_from(&mut scanner)?;

        let Some(offsets) = cell_offsets.get_mut(&way.type_id) else {
            continue;
        };

        let bbox = way.bounding_box();
        if !bbox.is_valid() {
            continue;
        }

        let level = level_of[&way.type_id];
        let (tile_min, tile_max) = tile_range(&bbox, level);
        for y in tile_min.y..=tile_max.y {
            for x in tile_min.x..=tile_max.x {
                offsets.entry(TileId::new(x, y)).or_default().push(offset);
            }
        }
    }

    let mut writer = FileWriter::create(parameter.file_in_destination(AREAWAY_IDX))?;

    let indexed: Vec<usize> = (0..selected.len())
        .filter(|&i| selected[i].has_entries())
        .collect();
    writer.write_u32(indexed.len() as u32)?;

    // header: one entry per indexed type, bitmap offsets patched afterwards
    for &i in &indexed {
        let data = &mut selected[i];
        writer.write_u16(data.type_id)?;
        writer.write_u32(data.index_level)?;
        writer.write_u32(data.tile_min.x)?;
        writer.write_u32(data.tile_min.y)?;
        writer.write_u32(data.tile_max.x)?;
        writer.write_u32(data.tile_max.y)?;
        data.index_offset = writer.position();
        writer.write_file_offset(0)?;
    }

    for &i in &indexed {
        let data = &selected[i];
        let offsets = &cell_offsets[&data.type_id];

        let bitmap_start = writer.position();
        writer.patch_file_offset(data.index_offset, bitmap_start)?;

        write_bitmap(&mut writer, data, offsets)?;
    }

    writer.close()
}

/// Bitmap: one bit per cell of the tile rectangle, row-major, followed by
/// the offset lists of the filled cells in the same order
fn write_bitmap(
    writer: &mut FileWriter,
    data: &TypeData,
    offsets: &BTreeMap<TileId, Vec<u64>>,
) -> Result<()> {
    let width = (data.tile_max.x - data.tile_min.x + 1) as usize;
    let height = (data.tile_max.y - data.tile_min.y + 1) as usize;
    let row_bytes = (width + 7) / 8;

    let mut bitmap = vec![0u8; row_bytes * height];
    for tile in offsets.keys() {
        let x = (tile.x - data.tile_min.x) as usize;
        let y = (tile.y - data.tile_min.y) as usize;
        bitmap[y * row_bytes + x / 8] |= 1 << (x % 8);
    }
    writer.write_bytes(&bitmap)?;

    // filled cells in row-major order
    let mut cells: Vec<(&TileId, &Vec<u64>)> = offsets.iter().collect();
    cells.sort_by_key(|(tile, _)| ((tile.y as u64) << 32) | tile.x as u64);

    for (_, cell_offsets) in cells {
        writer.write_unsigned(cell_offsets.len() as u64)?;

        let mut last = 0u64;
        for offset in cell_offsets {
            writer.write_unsigned(offset - last)?;
            last = *offset;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_with(counts: &[(u32, u32, u64)]) -> CellFill {
        let mut fill = CellFill::default();
        for (x, y, count) in counts {
            fill.counts.insert(TileId::new(*x, *y), *count);
        }
        fill
    }

    #[test]
    fn empty_fill_never_fits() {
        let parameter = ImportParameter::default();
        assert!(!fits_index_criteria(&parameter, &CellFill::default()));
    }

    #[test]
    fn single_cell_always_fits() {
        let parameter = ImportParameter::default();
        let fill = fill_with(&[(3, 4, 100_000)]);
        assert!(fits_index_criteria(&parameter, &fill));
    }

    #[test]
    fn oversized_cells_do_not_fit() {
        let parameter = ImportParameter::default();
        let max = parameter.area_node_index_cell_size_max as u64;

        let fill = fill_with(&[(0, 0, max + 1), (1, 0, 1)]);
        assert!(!fits_index_criteria(&parameter, &fill));

        let fill = fill_with(&[(0, 0, 4), (1, 0, 2)]);
        assert!(fits_index_criteria(&parameter, &fill));
    }

    #[test]
    fn average_threshold_applies() {
        let parameter = ImportParameter::default();
        let average = parameter.area_node_index_cell_size_average as u64;

        // two cells, both below max but above the average threshold
        let fill = fill_with(&[(0, 0, average + 5), (1, 0, average + 5)]);
        assert!(!fits_index_criteria(&parameter, &fill));
    }
}
