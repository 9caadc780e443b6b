use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::records::{Area, OsmId, RawWay, Ring, RingRole};
use crate::stages::coord_data::{CoordStore, COORD_DAT};
use crate::stages::preprocess::RAWWAYS_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::types::TYPE_IGNORE;
use crate::Result;

pub const WAYAREA_TMP: &str = "wayarea.tmp";

/// Stage 7: turn closed raw ways classified as areas into area geometries
pub struct WayAreaDataStage;

impl Stage for WayAreaDataStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("WayAreaData", "Generate area data from closed ways")
            .requires(RAWWAYS_DAT)
            .requires(COORD_DAT)
            .provides_temporary(WAYAREA_TMP)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        let mut scanner = FileScanner::open(
            parameter.file_in_destination(RAWWAYS_DAT),
            parameter.raw_way_data_memory_mapped,
        )?;
        let count = scanner.read_u32()?;

        let mut coord_store = CoordStore::open(parameter)?;

        let mut writer = FileWriter::create(parameter.file_in_destination(WAYAREA_TMP))?;
        writer.write_count_placeholder()?;

        ctx.progress
            .set_action(&format!("Resolving area ways out of {} raw ways", count));
        ctx.progress.set_total(count as u64);

        // resolve coords in batches to bound the lookup map
        let mut batch: Vec<RawWay> = Vec::new();
        let mut batch_nodes = 0usize;
        let mut written: u32 = 0;

        for index in 0..count {
            ctx.check_aborted()?;
            ctx.progress.progress(index as u64 + 1);

            let way = RawWay::read_from(&mut scanner)?;
            if !way.is_area || way.type_id == TYPE_IGNORE {
                continue;
            }
            if way.node_ids.len() < 3 {
                ctx.progress
                    .warning(&format!("Area {} has less than three nodes", way.id));
                continue;
            }

            batch_nodes += way.node_ids.len();
            batch.push(way);

            if batch_nodes >= ctx.parameter.raw_way_block_size {
                written += flush_batch(ctx, &mut batch, &mut coord_store, &mut writer)?;
                batch_nodes = 0;
            }
        }

        written += flush_batch(ctx, &mut batch, &mut coord_store, &mut writer)?;

        writer.finish_with_count(written)?;
        writer.close()?;

        ctx.progress.info(&format!("{} way areas written", written));
        Ok(())
    }
}

fn flush_batch(
    ctx: &StageContext,
    batch: &mut Vec<RawWay>,
    coord_store: &mut CoordStore,
    writer: &mut FileWriter,
) -> Result<u32> {
    if batch.is_empty() {
        return Ok(0);
    }

    let node_ids: Vec<OsmId> = batch
        .iter()
        .flat_map(|way| way.node_ids.iter().copied())
        .collect();
    let coords = coord_store.get_many(&node_ids)?;

    let mut written = 0;
    for way in batch.drain(..) {
        let resolved: Option<Vec<_>> = way
            .node_ids
            .iter()
            .map(|id| coords.get(id).map(|stored| stored.coord))
            .collect();

        let Some(ring_coords) = resolved else {
            ctx.progress.warning(&format!(
                "Area {} references nodes without coordinates, dropping",
                way.id
            ));
            continue;
        };

        let area = Area {
            id: way.id as u64,
            type_id: way.type_id,
            features: way.features,
            rings: vec![Ring {
                role: RingRole::Outer,
                coords: ring_coords,
            }],
        };

        area.write_to(writer)?;
        written += 1;
    }

    Ok(written)
}
