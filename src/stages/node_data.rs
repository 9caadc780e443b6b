use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::records::{Node, RawNode};
use crate::stages::preprocess::RAWNODES_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;

pub const NODES_TMP: &str = "nodes.tmp";

/// Stage 12: turn typed raw nodes into final node records
pub struct NodeDataStage;

impl Stage for NodeDataStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("NodeData", "Generate node data")
            .requires(RAWNODES_DAT)
            .provides_temporary(NODES_TMP)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        let mut scanner = FileScanner::open(
            parameter.file_in_destination(RAWNODES_DAT),
            parameter.raw_node_data_memory_mapped,
        )?;
        let count = scanner.read_u32()?;

        let mut writer = FileWriter::create(parameter.file_in_destination(NODES_TMP))?;
        writer.write_count_placeholder()?;

        ctx.progress
            .set_action(&format!("Converting {} raw nodes", count));
        ctx.progress.set_total(count as u64);

        for index in 0..count {
            ctx.check_aborted()?;
            ctx.progress.progress(index as u64 + 1);

            let raw = RawNode::read_from(&mut scanner)?;
            Node {
                id: index as u64 + 1,
                type_id: raw.type_id,
                features: raw.features,
                coord: raw.coord,
            }
            .write_to(&mut writer)?;
        }

        writer.finish_with_count(count)?;
        writer.close()?;

        ctx.progress.info(&format!("{} nodes written", count));
        Ok(())
    }
}
