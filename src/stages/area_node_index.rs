use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::geom::{tile_of, TileId};
use crate::records::Node;
use crate::stages::sort_objects::NODES_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::types::{TypeId, TYPE_IGNORE};
use crate::Result;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

pub const AREANODE_IDX: &str = "areanode.idx";

/// Node index levels are searched up to this magnification
const MAX_LEVEL: u32 = 18;

#[derive(Debug, Clone)]
struct TypeData {
    type_id: TypeId,
    index_level: u32,
    tile_min: TileId,
    tile_max: TileId,
    index_offset: u64,
    cells: u64,
    entries: u64,
}

impl TypeData {
    fn has_entries(&self) -> bool {
        self.cells > 0 && self.entries > 0
    }
}

/// Fill statistics of one node type at one candidate level
#[derive(Default)]
struct CellFill {
    counts: FxHashMap<TileId, u64>,
}

impl CellFill {
    fn entries(&self) -> u64 {
        self.counts.values().sum()
    }

    fn tile_bounds(&self) -> Option<(TileId, TileId)> {
        let mut iter = self.counts.keys();
        let first = *iter.next()?;
        let mut min = first;
        let mut max = first;

        for tile in iter {
            min = TileId::new(min.x.min(tile.x), min.y.min(tile.y));
            max = TileId::new(max.x.max(tile.x), max.y.max(tile.y));
        }

        Some((min, max))
    }

    /// Share of filled cells within the covered tile rectangle
    fn fill_rate(&self) -> f64 {
        let Some((min, max)) = self.tile_bounds() else {
            return 0.0;
        };

        let total = (max.x - min.x + 1) as u64 * (max.y - min.y + 1) as u64;
        self.counts.len() as f64 / total as f64
    }
}

fn fits_index_criteria(parameter: &ImportParameter, fill: &CellFill) -> bool {
    if fill.counts.is_empty() {
        return false;
    }

    if fill.counts.len() == 1 {
        return true;
    }

    let max_cell = fill.counts.values().copied().max().unwrap_or(0);
    let average = fill.entries() as f64 / fill.counts.len() as f64;

    fill.fill_rate() >= parameter.area_node_index_min_fill_rate
        && max_cell <= parameter.area_node_index_cell_size_max as u64
        && average <= parameter.area_node_index_cell_size_average as f64
}

/// Stage 15: build the bitmap index from grid cells to node file offsets
pub struct AreaNodeIndexStage;

impl Stage for AreaNodeIndexStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("AreaNodeIndex", "Generate area node index")
            .requires(NODES_DAT)
            .provides(AREANODE_IDX)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        let mut remaining: Vec<TypeId> = ctx
            .type_config
            .types()
            .filter(|info| info.can_be_node && info.index != TYPE_IGNORE)
            .map(|info| info.index)
            .collect();

        let mut selected: Vec<TypeData> = Vec::new();

        for level in parameter.area_node_min_mag..=MAX_LEVEL {
            if remaining.is_empty() {
                break;
            }
            ctx.check_aborted()?;
            ctx.progress
                .set_action(&format!("Scanning level {}", level));

            let fills = scan_level(ctx, &remaining, level)?;
            let at_max_level = level == MAX_LEVEL;

            remaining.retain(|type_id| {
                let fill = &fills[type_id];

                if fill.counts.is_empty() {
                    selected.push(TypeData {
                        type_id: *type_id,
                        index_level: level,
                        tile_min: TileId::new(0, 0),
                        tile_max: TileId::new(0, 0),
                        index_offset: 0,
                        cells: 0,
                        entries: 0,
                    });
                    return false;
                }

                if fits_index_criteria(parameter, fill) || at_max_level {
                    if at_max_level && !fits_index_criteria(parameter, fill) {
                        ctx.progress.warning(&format!(
                            "Node type {} does not fit index criteria at maximum level {}",
                            ctx.type_config.get(*type_id).name,
                            level
                        ));
                    }

                    let (tile_min, tile_max) = fill.tile_bounds().unwrap();
                    selected.push(TypeData {
                        type_id: *type_id,
                        index_level: level,
                        tile_min,
                        tile_max,
                        index_offset: 0,
                        cells: fill.counts.len() as u64,
                        entries: fill.entries(),
                    });
                    return false;
                }

                true
            });
        }

        for data in &selected {
            if data.has_entries() {
                ctx.progress.info(&format!(
                    "Node type {}: level {}, {} cells, {} entries",
                    ctx.type_config.get(data.type_id).name,
                    data.index_level,
                    data.cells,
                    data.entries
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

    let mut scanner =
        FileScanner::open(parameter.file_in_destination(NODES_DAT), false)?;
    let count = scanner.read_u32()?;

    for _ in 0..count {
        let node = Node::read_from(&mut scanner)?;
        if let Some(fill) = fills.get_mut(&node.type_id) {
            *fill
                .counts
                .entry(tile_of(node.coord, level))
                .or_insert(0) += 1;
        }
    }

    Ok(fills)
}

fn write_index(ctx: &StageContext, selected: &mut [TypeData]) -> Result<()> {
    let parameter = &ctx.parameter;

    ctx.progress
        .set_action(&format!("Writing '{}'", AREANODE_IDX));

    let mut cell_offsets: FxHashMap<TypeId, BTreeMap<TileId, Vec<u64>>> = selected
        .iter()
        .filter(|data| data.has_entries())
        .map(|data| (data.type_id, BTreeMap::new()))
        .collect();
    let level_of: FxHashMap<TypeId, u32> = selected
        .iter()
        .map(|data| (data.type_id, data.index_level))
        .collect();

    let mut scanner =
        FileScanner::open(parameter.file_in_destination(NODES_DAT), false)?;
    let count = scanner.read_u32()?;

    for _ in 0..count {
        let offset = scanner.position();
        let node = Node::read_from(&mut scanner)?;

        if let Some(offsets) = cell_offsets.get_mut(&node.type_id) {
            let tile = tile_of(node.coord, level_of[&node.type_id]);
            offsets.entry(tile).or_default().push(offset);
        }
    }

    let mut writer = FileWriter::create(parameter.file_in_destination(AREANODE_IDX))?;

    let indexed: Vec<usize> = (0..selected.len())
        .filter(|&i| selected[i].has_entries())
        .collect();
    writer.write_u32(indexed.len() as u32)?;

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

    #[test]
    fn fill_rate_counts_the_covered_rectangle() {
        let mut fill = CellFill::default();
        fill.counts.insert(TileId::new(0, 0), 3);
        fill.counts.insert(TileId::new(3, 0), 1);

        // 2 filled cells in a 4x1 rectangle
        assert!((fill.fill_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sparse_types_wait_for_a_denser_level() {
        let parameter = ImportParameter::default();

        let mut fill = CellFill::default();
        // 2 cells filled out of a 100x1 rectangle: fill rate 0.02 < 0.1
        fill.counts.insert(TileId::new(0, 0), 1);
        fill.counts.insert(TileId::new(99, 0), 1);

        assert!(!fits_index_criteria(&parameter, &fill));
    }
}
