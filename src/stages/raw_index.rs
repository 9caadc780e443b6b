use crate::config::ImportParameter;
use crate::fileio::{numeric_index::write_numeric_index, FileScanner};
use crate::records::{RawRelation, RawWay};
use crate::stages::preprocess::{RAWRELS_DAT, RAWWAYS_DAT};
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;

pub const RAWWAYS_IDX: &str = "rawways.idx";
pub const RAWRELS_IDX: &str = "rawrels.idx";

fn build_index<T>(
    ctx: &StageContext,
    data_file: &str,
    index_file: &str,
    memory_mapped: bool,
    read: impl Fn(&mut FileScanner) -> Result<(i64, T)>,
) -> Result<()> {
    let parameter = &ctx.parameter;
    let mut scanner =
        FileScanner::open(parameter.file_in_destination(data_file), memory_mapped)?;
    let count = scanner.read_u32()?;

    ctx.progress
        .set_action(&format!("Indexing {} records of '{}'", count, data_file));

    let mut entries: Vec<(i64, u64)> = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ctx.check_aborted()?;

        let offset = scanner.position();
        let (id, _) = read(&mut scanner)?;
        entries.push((id, offset));
    }

    write_numeric_index(parameter.file_in_destination(index_file), &entries)?;
    ctx.progress
        .info(&format!("{} entries written to '{}'", entries.len(), index_file));
    Ok(())
}

/// Stage 4: index the temporary raw way file by OSM id
pub struct RawWayIndexStage;

impl Stage for RawWayIndexStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("RawWayIndex", "Generate id lookup index for raw ways")
            .requires(RAWWAYS_DAT)
            .provides_temporary(RAWWAYS_IDX)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        build_index(
            ctx,
            RAWWAYS_DAT,
            RAWWAYS_IDX,
            ctx.parameter.raw_way_data_memory_mapped,
            |scanner| {
                let way = RawWay::read_from(scanner)?;
                Ok((way.id, way))
            },
        )
    }
}

/// Stage 5: index the temporary raw relation file by OSM id
pub struct RawRelationIndexStage;

impl Stage for RawRelationIndexStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new(
            "RawRelationIndex",
            "Generate id lookup index for raw relations",
        )
        .requires(RAWRELS_DAT)
        .provides_temporary(RAWRELS_IDX)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        build_index(ctx, RAWRELS_DAT, RAWRELS_IDX, false, |scanner| {
            let relation = RawRelation::read_from(scanner)?;
            Ok((relation.id, relation))
        })
    }
}
