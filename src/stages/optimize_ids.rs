use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::records::{Area, Way};
use crate::stages::merge_area::AREAS2_TMP;
use crate::stages::way_way::WAYWAY_TMP;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;

pub const AREAS3_TMP: &str = "areas3.tmp";
pub const WAYS2_TMP: &str = "ways2.tmp";
pub const WAYIDMAP_TMP: &str = "wayidmap.tmp";

/// Stage 11: assign the final dense ids.
///
/// Ways and areas leave their OSM id space here; the way mapping is kept so
/// the routing stage can resolve turn-restriction references.
pub struct OptimizeAreaWayIdsStage;

impl Stage for OptimizeAreaWayIdsStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("OptimizeAreaWayIds", "Assign final area and way ids")
            .requires(AREAS2_TMP)
            .requires(WAYWAY_TMP)
            .provides_temporary(AREAS3_TMP)
            .provides_temporary(WAYS2_TMP)
            .provides_temporary(WAYIDMAP_TMP)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        ctx.progress.set_action("Renumbering areas");
        let mut scanner = FileScanner::open(parameter.file_in_destination(AREAS2_TMP), false)?;
        let count = scanner.read_u32()?;

        let mut writer = FileWriter::create(parameter.file_in_destination(AREAS3_TMP))?;
        writer.write_count_placeholder()?;

        for index in 0..count {
            ctx.check_aborted()?;

            let mut area = Area::read_from(&mut scanner)?;
            area.id = index as u64 + 1;
            area.write_to(&mut writer)?;
        }
        writer.finish_with_count(count)?;
        writer.close()?;
        ctx.progress.info(&format!("{} areas renumbered", count));

        ctx.progress.set_action("Renumbering ways");
        let mut scanner = FileScanner::open(parameter.file_in_destination(WAYWAY_TMP), false)?;
        let count = scanner.read_u32()?;

        let mut writer = FileWriter::create(parameter.file_in_destination(WAYS2_TMP))?;
        writer.write_count_placeholder()?;

        let mut idmap_writer =
            FileWriter::create(parameter.file_in_destination(WAYIDMAP_TMP))?;
        idmap_writer.write_count_placeholder()?;

        for index in 0..count {
            ctx.check_aborted()?;

            let mut way = Way::read_from(&mut scanner)?;
            let old_id = way.id;
            way.id = index as u64 + 1;

            idmap_writer.write_i64(old_id as i64)?;
            idmap_writer.write_u64(way.id)?;

            way.write_to(&mut writer)?;
        }
        writer.finish_with_count(count)?;
        writer.close()?;
        idmap_writer.finish_with_count(count)?;
        idmap_writer.close()?;

        ctx.progress.info(&format!("{} ways renumbered", count));
        Ok(())
    }
}

/// Mapping of original way ids to their final ids
pub fn read_way_id_map(
    parameter: &ImportParameter,
) -> Result<rustc_hash::FxHashMap<i64, u64>> {
    let mut scanner = FileScanner::open(parameter.file_in_destination(WAYIDMAP_TMP), false)?;
    let count = scanner.read_u32()?;

    let mut map = rustc_hash::FxHashMap::with_capacity_and_hasher(
        count as usize,
        Default::default(),
    );
    for _ in 0..count {
        let old_id = scanner.read_i64()?;
        let new_id = scanner.read_u64()?;
        map.insert(old_id, new_id);
    }

    Ok(map)
}
