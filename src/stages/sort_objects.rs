use crate::config::ImportParameter;
use crate::fileio::{external_sort, sorter::SortableRecord, FileScanner, FileWriter};
use crate::geom::{tile_number, tile_of, GeoCoord};
use crate::records::{Area, Node, Way};
use crate::stages::node_data::NODES_TMP;
use crate::stages::optimize_ids::{AREAS3_TMP, WAYS2_TMP};
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;

pub const NODES_DAT: &str = "nodes.dat";
pub const WAYS_DAT: &str = "ways.dat";
pub const AREAS_DAT: &str = "areas.dat";

impl SortableRecord for Node {
    fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        Node::write_to(self, writer)
    }

    fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        Node::read_from(scanner)
    }
}

impl SortableRecord for Way {
    fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        Way::write_to(self, writer)
    }

    fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        Way::read_from(scanner)
    }
}

impl SortableRecord for Area {
    fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        Area::write_to(self, writer)
    }

    fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        Area::read_from(scanner)
    }
}

/// Spatial sort key: the linearised tile of an anchor coordinate at the
/// configured sort magnification, so objects of one map region end up
/// adjacent in the file
fn spatial_key(coord: GeoCoord, magnification: u32) -> u64 {
    tile_number(tile_of(coord, magnification), magnification)
}

fn sort_file<T: SortableRecord>(
    ctx: &StageContext,
    source: &str,
    target: &str,
    anchor: impl Fn(&T) -> GeoCoord + Copy,
) -> Result<()> {
    let parameter = &ctx.parameter;
    let magnification = parameter.sort_tile_magnification;

    let mut scanner = FileScanner::open(parameter.file_in_destination(source), false)?;
    let count = scanner.read_u32()?;

    let mut writer = FileWriter::create(parameter.file_in_destination(target))?;
    writer.write_count_placeholder()?;

    ctx.progress.set_action(&format!(
        "Sorting {} records of '{}' into '{}'",
        count, source, target
    ));

    let records = (0..count).map(|_| T::read_from(&mut scanner));

    if parameter.sort_objects {
        external_sort(
            &parameter.destination_directory,
            parameter.sort_block_size,
            records,
            |record: &T| spatial_key(anchor(record), magnification),
            |record| record.write_to(&mut writer),
        )?;
    } else {
        for record in records {
            record?.write_to(&mut writer)?;
        }
    }

    writer.finish_with_count(count)?;
    writer.close()
}

/// Stage 13: spatially sort the node records
pub struct SortNodeDataStage;

impl Stage for SortNodeDataStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("SortNodeData", "Sort nodes spatially")
            .requires(NODES_TMP)
            .provides(NODES_DAT)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        sort_file::<Node>(ctx, NODES_TMP, NODES_DAT, |node| node.coord)
    }
}

/// Stage 14: spatially sort the way and area records
pub struct SortWayDataStage;

impl Stage for SortWayDataStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("SortWayData", "Sort ways and areas spatially")
            .requires(WAYS2_TMP)
            .requires(AREAS3_TMP)
            .provides(WAYS_DAT)
            .provides(AREAS_DAT)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        sort_file::<Way>(ctx, WAYS2_TMP, WAYS_DAT, |way| {
            way.nodes
                .first()
                .map(|node| node.coord)
                .unwrap_or(GeoCoord::new(0.0, 0.0))
        })?;

        sort_file::<Area>(ctx, AREAS3_TMP, AREAS_DAT, |area| {
            area.outer_ring()
                .and_then(|ring| ring.coords.first().copied())
                .unwrap_or(GeoCoord::new(0.0, 0.0))
        })
    }
}
