use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::geom::{tile_of, tile_range, GeoBox, GeoCoord, TileId};
use crate::records::RawCoastline;
use crate::stages::coord_data::{CoordStore, COORD_DAT};
use crate::stages::preprocess::{BOUNDING_DAT, RAWCOASTLINE_DAT};
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;

pub const WATER_IDX: &str = "water.idx";

/// Sea/land state of one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TileState {
    Unknown = 0,
    Land = 1,
    Water = 2,
    Coast = 3,
}

/// Stage 18: classify tiles as land, water or coast from the coastline
/// records, for the configured magnification range
pub struct WaterIndexStage;

impl Stage for WaterIndexStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("WaterIndex", "Generate water index from coastlines")
            .requires(RAWCOASTLINE_DAT)
            .requires(BOUNDING_DAT)
            .requires(COORD_DAT)
            .provides(WATER_IDX)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        let bounding = read_bounding(parameter)?;
        let coastlines = read_coastlines(ctx)?;
        ctx.progress
            .info(&format!("{} coastlines read", coastlines.len()));

        let mut writer = FileWriter::create(parameter.file_in_destination(WATER_IDX))?;
        writer.write_u32(parameter.water_index_min_mag)?;
        writer.write_u32(parameter.water_index_max_mag)?;

        for level in parameter.water_index_min_mag..=parameter.water_index_max_mag {
            ctx.check_aborted()?;
            ctx.progress
                .set_action(&format!("Classifying tiles at level {}", level));

            write_level(ctx, &mut writer, &bounding, &coastlines, level)?;
        }

        writer.close()
    }
}

fn read_bounding(parameter: &ImportParameter) -> Result<GeoBox> {
    let mut scanner = FileScanner::open(parameter.file_in_destination(BOUNDING_DAT), false)?;
    let min = scanner.read_coord()?;
    let max = scanner.read_coord()?;

    let mut bounding = GeoBox::new();
    if min.lat <= max.lat && min.lon <= max.lon {
        bounding.include(min);
        bounding.include(max);
    }
    Ok(bounding)
}

fn read_coastlines(ctx: &StageContext) -> Result<Vec<Vec<GeoCoord>>> {
    let parameter = &ctx.parameter;

    let mut scanner =
        FileScanner::open(parameter.file_in_destination(RAWCOASTLINE_DAT), false)?;
    let count = scanner.read_u32()?;

    let mut coord_store = CoordStore::open(parameter)?;
    let mut coastlines = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let coastline = RawCoastline::read_from(&mut scanner)?;
        let coords = coord_store.get_many(&coastline.node_ids)?;

        let resolved: Option<Vec<GeoCoord>> = coastline
            .node_ids
            .iter()
            .map(|id| coords.get(id).map(|stored| stored.coord))
            .collect();

        match resolved {
            Some(mut line) => {
                // closed coastlines walk back to their start
                if coastline.is_area {
                    if let Some(first) = line.first().copied() {
                        line.push(first);
                    }
                }
                coastlines.push(line);
            }
            None => ctx.progress.warning(&format!(
                "Coastline {} references nodes without coordinates",
                coastline.id
            )),
        }
    }

    Ok(coastlines)
}

fn write_level(
    ctx: &StageContext,
    writer: &mut FileWriter,
    bounding: &GeoBox,
    coastlines: &[Vec<GeoCoord>],
    level: u32,
) -> Result<()> {
    let parameter = &ctx.parameter;

    let (tile_min, tile_max) = if bounding.is_valid() {
        tile_range(bounding, level)
    } else {
        (TileId::new(0, 0), TileId::new(0, 0))
    };

    let width = (tile_max.x - tile_min.x + 1) as usize;
    let height = (tile_max.y - tile_min.y + 1) as usize;
    let mut states = vec![TileState::Unknown; width * height];

    let index_of = |tile: TileId| -> Option<usize> {
        if tile.x < tile_min.x || tile.x > tile_max.x || tile.y < tile_min.y || tile.y > tile_max.y
        {
            return None;
        }
        Some((tile.y - tile_min.y) as usize * width + (tile.x - tile_min.x) as usize)
    };

    // mark every tile a coastline segment passes through
    for line in coastlines {
        for pair in line.windows(2) {
            let mut segment = GeoBox::new();
            segment.include(pair[0]);
            segment.include(pair[1]);

            let (seg_min, seg_max) = tile_range(&segment, level);
            for y in seg_min.y..=seg_max.y {
                for x in seg_min.x..=seg_max.x {
                    if let Some(i) = index_of(TileId::new(x, y)) {
                        states[i] = TileState::Coast;
                    }
                }
            }
        }

        for coord in line {
            if let Some(i) = index_of(tile_of(*coord, level)) {
                states[i] = TileState::Coast;
            }
        }
    }

    if parameter.assume_land {
        // trust the import region to be mostly land
        for state in states.iter_mut() {
            if *state == TileState::Unknown {
                *state = TileState::Land;
            }
        }
    } else {
        flood_border_water(&mut states, width, height);
        for state in states.iter_mut() {
            if *state == TileState::Unknown {
                *state = TileState::Land;
            }
        }
    }

    writer.write_u32(level)?;
    writer.write_u32(tile_min.x)?;
    writer.write_u32(tile_min.y)?;
    writer.write_u32(tile_max.x)?;
    writer.write_u32(tile_max.y)?;

    // 2 bits per tile, row-major
    let mut byte = 0u8;
    let mut filled = 0;
    for state in &states {
        byte |= (*state as u8) << (filled * 2);
        filled += 1;

        if filled == 4 {
            writer.write_u8(byte)?;
            byte = 0;
            filled = 0;
        }
    }
    if filled > 0 {
        writer.write_u8(byte)?;
    }

    let coast = states.iter().filter(|s| **s == TileState::Coast).count();
    let water = states.iter().filter(|s| **s == TileState::Water).count();
    ctx.progress.info(&format!(
        "Level {}: {} tiles, {} coast, {} water",
        level,
        states.len(),
        coast,
        water
    ));

    Ok(())
}

/// Tiles reachable from the border without crossing a coastline are open sea
fn flood_border_water(states: &mut [TileState], width: usize, height: usize) {
    let mut queue: Vec<usize> = Vec::new();

    for x in 0..width {
        queue.push(x);
        queue.push((height - 1) * width + x);
    }
    for y in 0..height {
        queue.push(y * width);
        queue.push(y * width + width - 1);
    }

    while let Some(index) = queue.pop() {
        if states[index] != TileState::Unknown {
            continue;
        }
        states[index] = TileState::Water;

        let x = index % width;
        let y = index / width;

        if x > 0 {
            queue.push(index - 1);
        }
        if x + 1 < width {
            queue.push(index + 1);
        }
        if y > 0 {
            queue.push(index - width);
        }
        if y + 1 < height {
            queue.push(index + width);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_flood_stops_at_the_coast() {
        // 5x5 grid with a vertical coastline wall in column 2
        let width = 5;
        let height = 5;
        let mut states = vec![TileState::Unknown; width * height];
        for y in 0..height {
            states[y * width + 2] = TileState::Coast;
        }

        flood_border_water(&mut states, width, height);

        // both sides of the wall flood from the border
        assert_eq!(states[0], TileState::Water);
        assert_eq!(states[4], TileState::Water);
        // the wall itself stays coast
        assert_eq!(states[2], TileState::Coast);
    }
}
