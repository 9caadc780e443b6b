use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::records::{ObjectRef, OsmId, Way};
use crate::stages::sort_objects::WAYS_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;
use std::collections::BTreeMap;

pub const INTERSECTIONS_IDX: &str = "intersections.idx";

/// Stage 23: map every node shared by at least two ways to the objects
/// meeting there
pub struct IntersectionIndexStage;

impl Stage for IntersectionIndexStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("IntersectionIndex", "Generate intersection index")
            .requires(WAYS_DAT)
            .provides(INTERSECTIONS_IDX)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        let mut scanner = FileScanner::open(
            parameter.file_in_destination(WAYS_DAT),
            parameter.way_data_memory_mapped,
        )?;
        let count = scanner.read_u32()?;

        ctx.progress
            .set_action(&format!("Scanning {} ways for intersections", count));

        let mut node_objects: BTreeMap<OsmId, Vec<ObjectRef>> = BTreeMap::new();

        for _ in 0..count {
            ctx.check_aborted()?;
            let way = Way::read_from(&mut scanner)?;
            let object = ObjectRef::way(way.id);

            for node in &way.nodes {
                let entry = node_objects.entry(node.id).or_default();
                if entry.last() != Some(&object) {
                    entry.push(object);
                }
            }
        }

        let mut writer =
            FileWriter::create(parameter.file_in_destination(INTERSECTIONS_IDX))?;
        writer.write_count_placeholder()?;

        let mut written = 0u32;
        for (node_id, objects) in &node_objects {
            if objects.len() < 2 {
                continue;
            }

            writer.write_i64(*node_id)?;
            writer.write_unsigned(objects.len() as u64)?;
            for object in objects {
                object.write_to(&mut writer)?;
            }
            written += 1;
        }

        writer.finish_with_count(written)?;
        writer.close()?;

        ctx.progress
            .info(&format!("{} intersections written", written));
        Ok(())
    }
}
