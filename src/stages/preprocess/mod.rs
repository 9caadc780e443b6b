mod pbf;
mod xml;

use crate::config::ImportParameter;
use crate::fileio::FileWriter;
use crate::geom::{GeoBox, GeoCoord};
use crate::progress::{Breaker, Progress};
use crate::records::{
    OsmId, RawCoastline, RawCoord, RawNode, RawRelation, RawWay, RelationMember, RestrictionKind,
    TurnRestriction,
};
use crate::stages::{Stage, StageContext, StageDescription};
use crate::types::{tag_value, TypeConfig, TypeId, TYPE_IGNORE};
use crate::{ImportError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

pub const BOUNDING_DAT: &str = "bounding.dat";
pub const DISTRIBUTION_DAT: &str = "distribution.dat";
pub const RAWCOORDS_DAT: &str = "rawcoords.dat";
pub const RAWNODES_DAT: &str = "rawnodes.dat";
pub const RAWWAYS_DAT: &str = "rawways.dat";
pub const RAWRELS_DAT: &str = "rawrels.dat";
pub const RAWCOASTLINE_DAT: &str = "rawcoastline.dat";
pub const RAWTURNRESTR_DAT: &str = "rawturnrestr.dat";

/// Depth of the block-worker and writer queues; the producer blocks when
/// either is full, which bounds memory under a fast parser
const QUEUE_DEPTH: usize = 1000;

/// Primitives accumulated per block before handing over to the callback
const BLOCK_SIZE: usize = 10_000;

/// One parsed node as the front-ends deliver it
#[derive(Debug, Clone)]
pub struct RawNodeData {
    pub id: OsmId,
    pub coord: GeoCoord,
    pub tags: Vec<(String, String)>,
}

/// One parsed way as the front-ends deliver it
#[derive(Debug, Clone)]
pub struct RawWayData {
    pub id: OsmId,
    pub tags: Vec<(String, String)>,
    pub node_ids: Vec<OsmId>,
}

/// One parsed relation as the front-ends deliver it
#[derive(Debug, Clone)]
pub struct RawRelationData {
    pub id: OsmId,
    pub tags: Vec<(String, String)>,
    pub members: Vec<RelationMember>,
}

/// A batch of parsed primitives, pushed once per block by a front-end
#[derive(Debug, Clone, Default)]
pub struct RawBlockData {
    pub nodes: Vec<RawNodeData>,
    pub ways: Vec<RawWayData>,
    pub relations: Vec<RawRelationData>,
}

impl RawBlockData {
    pub fn len(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classified output of one block, produced by a block worker
#[derive(Default)]
struct ProcessedData {
    raw_coords: Vec<RawCoord>,
    raw_nodes: Vec<RawNode>,
    raw_ways: Vec<RawWay>,
    raw_coastlines: Vec<RawCoastline>,
    raw_relations: Vec<RawRelation>,
    turn_restrictions: Vec<TurnRestriction>,
}

struct BlockJob {
    data: RawBlockData,
    result_tx: Sender<ProcessedData>,
}

/// All file writes and statistics live on the single writer thread
struct WriterState {
    coord_writer: FileWriter,
    node_writer: FileWriter,
    way_writer: FileWriter,
    coastline_writer: FileWriter,
    turn_restriction_writer: FileWriter,
    multipolygon_writer: FileWriter,

    coord_count: u32,
    node_count: u32,
    way_count: u32,
    area_count: u32,
    coastline_count: u32,
    turn_restriction_count: u32,
    multipolygon_count: u32,

    node_stat: Vec<u64>,
    way_stat: Vec<u64>,
    area_stat: Vec<u64>,

    first_error: Option<anyhow::Error>,
}

impl WriterState {
    fn open(parameter: &ImportParameter, type_count: usize) -> Result<Self> {
        let mut writers: Vec<FileWriter> = Vec::new();

        for name in [
            RAWCOORDS_DAT,
            RAWNODES_DAT,
            RAWWAYS_DAT,
            RAWCOASTLINE_DAT,
            RAWTURNRESTR_DAT,
            RAWRELS_DAT,
        ] {
            let mut writer = match FileWriter::create(parameter.file_in_destination(name)) {
                Ok(writer) => writer,
                Err(e) => {
                    for mut open in writers {
                        open.close_failsafe();
                    }
                    return Err(e);
                }
            };

            if let Err(e) = writer.write_count_placeholder() {
                writer.close_failsafe();
                for mut open in writers {
                    open.close_failsafe();
                }
                return Err(e);
            }
            writers.push(writer);
        }

        let mut writers = writers.into_iter();

        Ok(Self {
            coord_writer: writers.next().unwrap(),
            node_writer: writers.next().unwrap(),
            way_writer: writers.next().unwrap(),
            coastline_writer: writers.next().unwrap(),
            turn_restriction_writer: writers.next().unwrap(),
            multipolygon_writer: writers.next().unwrap(),
            coord_count: 0,
            node_count: 0,
            way_count: 0,
            area_count: 0,
            coastline_count: 0,
            turn_restriction_count: 0,
            multipolygon_count: 0,
            node_stat: vec![0; type_count],
            way_stat: vec![0; type_count],
            area_stat: vec![0; type_count],
            first_error: None,
        })
    }

    fn write(&mut self, processed: &ProcessedData) -> Result<()> {
        for coastline in &processed.raw_coastlines {
            coastline.write_to(&mut self.coastline_writer)?;
            self.coastline_count += 1;
        }

        for coord in &processed.raw_coords {
            coord.write_to(&mut self.coord_writer)?;
            self.coord_count += 1;
        }

        for node in &processed.raw_nodes {
            node.write_to(&mut self.node_writer)?;
            self.node_stat[node.type_id as usize] += 1;
            self.node_count += 1;
        }

        for way in &processed.raw_ways {
            if way.is_area {
                self.area_stat[way.type_id as usize] += 1;
                self.area_count += 1;
            } else {
                self.way_stat[way.type_id as usize] += 1;
                self.way_count += 1;
            }
            way.write_to(&mut self.way_writer)?;
        }

        for relation in &processed.raw_relations {
            self.area_stat[relation.type_id as usize] += 1;
            relation.write_to(&mut self.multipolygon_writer)?;
            self.multipolygon_count += 1;
        }

        for restriction in &processed.turn_restrictions {
            restriction.write_to(&mut self.turn_restriction_writer)?;
            self.turn_restriction_count += 1;
        }

        Ok(())
    }

    fn close_failsafe(&mut self) {
        self.coord_writer.close_failsafe();
        self.node_writer.close_failsafe();
        self.way_writer.close_failsafe();
        self.coastline_writer.close_failsafe();
        self.turn_restriction_writer.close_failsafe();
        self.multipolygon_writer.close_failsafe();
    }

    fn finalize(&mut self) -> Result<()> {
        self.coord_writer.finish_with_count(self.coord_count)?;
        self.node_writer.finish_with_count(self.node_count)?;
        self.way_writer
            .finish_with_count(self.way_count + self.area_count)?;
        self.coastline_writer
            .finish_with_count(self.coastline_count)?;
        self.turn_restriction_writer
            .finish_with_count(self.turn_restriction_count)?;
        self.multipolygon_writer
            .finish_with_count(self.multipolygon_count)?;
        Ok(())
    }
}

/// Receives parsed blocks from a front-end, runs the synchronous bookkeeping
/// on the calling thread, and fans the per-record classification out to the
/// block workers while a single writer drains results in submission order.
pub struct Callback {
    type_config: Arc<TypeConfig>,
    progress: Arc<dyn Progress>,
    breaker: Breaker,
    destination_dir: std::path::PathBuf,

    block_tx: Option<Sender<BlockJob>>,
    write_tx: Option<Sender<Receiver<ProcessedData>>>,
    block_workers: Vec<JoinHandle<()>>,
    write_worker: Option<JoinHandle<WriterState>>,

    bounding: GeoBox,
    relation_count: u64,

    last_node_id: OsmId,
    last_way_id: OsmId,
    last_relation_id: OsmId,
    node_sorting_error: bool,
    way_sorting_error: bool,
    relation_sorting_error: bool,
}

impl Callback {
    pub fn new(
        type_config: Arc<TypeConfig>,
        parameter: &ImportParameter,
        progress: Arc<dyn Progress>,
        breaker: Breaker,
    ) -> Result<Self> {
        let state = WriterState::open(parameter, type_config.type_count())?;

        let (block_tx, block_rx) = bounded::<BlockJob>(QUEUE_DEPTH);
        let (write_tx, write_rx) = bounded::<Receiver<ProcessedData>>(QUEUE_DEPTH);

        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        progress.info(&format!("Using {} block worker threads", worker_count));

        let mut block_workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let block_rx = block_rx.clone();
            let type_config = Arc::clone(&type_config);
            let progress = Arc::clone(&progress);

            block_workers.push(std::thread::spawn(move || {
                for job in block_rx.iter() {
                    let processed = classify_block(&type_config, progress.as_ref(), &job.data);
                    // the writer drops out first only on shutdown
                    let _ = job.result_tx.send(processed);
                }
            }));
        }

        let write_worker = std::thread::spawn(move || {
            let mut state = state;
            for result_rx in write_rx.iter() {
                let Ok(processed) = result_rx.recv() else {
                    continue;
                };
                if state.first_error.is_none() {
                    if let Err(e) = state.write(&processed) {
                        state.first_error = Some(e);
                    }
                }
            }
            state
        });

        Ok(Self {
            type_config,
            progress,
            breaker,
            destination_dir: parameter.destination_directory.clone(),
            block_tx: Some(block_tx),
            write_tx: Some(write_tx),
            block_workers,
            write_worker: Some(write_worker),
            bounding: GeoBox::new(),
            relation_count: 0,
            last_node_id: OsmId::MIN,
            last_way_id: OsmId::MIN,
            last_relation_id: OsmId::MIN,
            node_sorting_error: false,
            way_sorting_error: false,
            relation_sorting_error: false,
        })
    }

    /// Front-end entry point, called once per parsed block on the
    /// orchestrator thread
    pub fn process_block(&mut self, data: RawBlockData) -> Result<()> {
        if self.breaker.is_aborted() {
            return Err(ImportError::Aborted.into());
        }

        // Synchronous phase: everything that touches shared state
        for node in &data.nodes {
            if node.id < self.last_node_id {
                self.node_sorting_error = true;
            }
            self.last_node_id = node.id;
            self.bounding.include(node.coord);
        }

        for way in &data.ways {
            if way.id < self.last_way_id {
                self.way_sorting_error = true;
            }
            self.last_way_id = way.id;
        }

        for relation in &data.relations {
            if relation.id < self.last_relation_id {
                self.relation_sorting_error = true;
            }
            self.last_relation_id = relation.id;
            self.relation_count += 1;
        }

        // Delegate classification to the worker pool; the write task is
        // enqueued immediately after the block task, so the writer observes
        // results in submission order.
        let (result_tx, result_rx) = bounded::<ProcessedData>(1);

        self.block_tx
            .as_ref()
            .expect("process_block after shutdown")
            .send(BlockJob { data, result_tx })
            .map_err(|_| anyhow::anyhow!("block worker pool shut down unexpectedly"))?;

        self.write_tx
            .as_ref()
            .expect("process_block after shutdown")
            .send(result_rx)
            .map_err(|_| anyhow::anyhow!("write worker shut down unexpectedly"))?;

        Ok(())
    }

    /// Drain the pipeline, back-patch counts, dump statistics, and enforce
    /// the id-ordering contract. `parse_ok` is the front-end result; data is
    /// finalised either way so a failed run leaves analysable files behind.
    pub fn finish(mut self, parse_ok: bool) -> Result<()> {
        self.progress.info("Waiting for block workers...");
        drop(self.block_tx.take());
        for worker in self.block_workers.drain(..) {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("block worker panicked"))?;
        }

        self.progress.info("Waiting for write worker...");
        drop(self.write_tx.take());
        let mut state = self
            .write_worker
            .take()
            .expect("finish called twice")
            .join()
            .map_err(|_| anyhow::anyhow!("write worker panicked"))?;

        if let Some(e) = state.first_error.take() {
            state.close_failsafe();
            return Err(e);
        }

        if let Err(e) = state.finalize() {
            state.close_failsafe();
            return Err(e);
        }

        if parse_ok {
            self.dump_statistics(&state);

            self.write_distribution(&state)?;
            self.write_bounding_box()?;
        }

        if self.node_sorting_error {
            self.progress.error("Nodes are not sorted by increasing id");
        }
        if self.way_sorting_error {
            self.progress.error("Ways are not sorted by increasing id");
        }
        if self.relation_sorting_error {
            self.progress
                .error("Relations are not sorted by increasing id");
        }

        if self.node_sorting_error || self.way_sorting_error || self.relation_sorting_error {
            return Err(ImportError::Ordering(
                "preprocess input ids are not monotonic".to_string(),
            )
            .into());
        }

        Ok(())
    }

    fn dump_statistics(&self, state: &WriterState) {
        self.progress.set_action("Dump statistics");

        self.progress
            .info(&format!("Coords:           {}", state.coord_count));
        self.progress
            .info(&format!("Nodes:            {}", state.node_count));
        self.progress.info(&format!(
            "Ways/Areas/Sum:   {} {} {}",
            state.way_count,
            state.area_count,
            state.way_count + state.area_count
        ));
        self.progress
            .info(&format!("Relations:        {}", self.relation_count));
        self.progress
            .info(&format!("Coastlines:       {}", state.coastline_count));
        self.progress.info(&format!(
            "Turnrestrictions: {}",
            state.turn_restriction_count
        ));
        self.progress
            .info(&format!("Multipolygons:    {}", state.multipolygon_count));

        for info in self.type_config.types() {
            let i = info.index as usize;
            let is_empty = (info.can_be_node && state.node_stat[i] == 0)
                || (info.can_be_area && state.area_stat[i] == 0)
                || (info.can_be_way && state.way_stat[i] == 0);
            let is_important = !info.ignore && !info.name.is_empty();

            let line = format!(
                "Type {}: {} node(s), {} area(s), {} way(s)",
                info.name, state.node_stat[i], state.area_stat[i], state.way_stat[i]
            );

            if is_empty && is_important {
                self.progress.warning(&line);
            } else {
                self.progress.info(&line);
            }
        }
    }

    fn write_distribution(&self, state: &WriterState) -> Result<()> {
        self.progress
            .set_action(&format!("Writing '{}'", DISTRIBUTION_DAT));

        let path = self.destination(DISTRIBUTION_DAT);
        let mut writer = FileWriter::create(&path)?;

        let result: Result<()> = (|| {
            for info in self.type_config.types() {
                let i = info.index as usize;
                writer.write_u32(state.node_stat[i] as u32)?;
                writer.write_u32(state.way_stat[i] as u32)?;
                writer.write_u32(state.area_stat[i] as u32)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => writer.close(),
            Err(e) => {
                writer.close_failsafe();
                Err(e)
            }
        }
    }

    fn write_bounding_box(&self) -> Result<()> {
        self.progress
            .set_action(&format!("Generating '{}'", BOUNDING_DAT));

        let path = self.destination(BOUNDING_DAT);
        let mut writer = FileWriter::create(&path)?;

        let result = writer
            .write_coord(self.bounding.min)
            .and_then(|_| writer.write_coord(self.bounding.max));

        match result {
            Ok(()) => writer.close(),
            Err(e) => {
                writer.close_failsafe();
                Err(e)
            }
        }
    }

    fn destination(&self, name: &str) -> std::path::PathBuf {
        self.destination_dir.join(name)
    }
}

fn classify_block(
    type_config: &TypeConfig,
    progress: &dyn Progress,
    data: &RawBlockData,
) -> ProcessedData {
    let mut processed = ProcessedData::default();

    for node in &data.nodes {
        node_sub_task(type_config, node, &mut processed);
    }
    for way in &data.ways {
        way_sub_task(type_config, progress, way, &mut processed);
    }
    for relation in &data.relations {
        relation_sub_task(type_config, progress, relation, &mut processed);
    }

    processed
}

fn node_sub_task(type_config: &TypeConfig, data: &RawNodeData, processed: &mut ProcessedData) {
    processed.raw_coords.push(RawCoord {
        id: data.id,
        coord: data.coord,
    });

    let type_id = type_config.node_type(&data.tags);
    if type_id != TYPE_IGNORE {
        processed.raw_nodes.push(RawNode {
            id: data.id,
            type_id,
            coord: data.coord,
            features: type_config.parse_features(&data.tags),
        });
    }
}

fn way_sub_task(
    type_config: &TypeConfig,
    progress: &dyn Progress,
    data: &RawWayData,
    processed: &mut ProcessedData,
) {
    if data.node_ids.len() < 2 {
        progress.warning(&format!("Way {} has less than two nodes!", data.id));
        return;
    }

    let is_coastline = tag_value(&data.tags, "natural") == Some("coastline");
    let is_closed_ring =
        data.node_ids.len() > 3 && data.node_ids.first() == data.node_ids.last();

    let (way_type, area_type) = type_config.way_area_types(&data.tags);

    // way/area decision, in order of precedence
    let is_area = match tag_value(&data.tags, "area") {
        Some("no") | Some("false") | Some("0") => false,
        Some(_) => true,
        None => {
            if tag_value(&data.tags, "junction") == Some("roundabout") {
                false
            } else if type_config.get(way_type).pin_way {
                false
            } else {
                is_closed_ring
            }
        }
    };

    let (type_id, node_ids) = if is_area {
        let type_id = if type_config.get(area_type).ignore {
            TYPE_IGNORE
        } else {
            area_type
        };

        // areas drop the duplicate closing id
        let node_ids = if is_closed_ring {
            data.node_ids[..data.node_ids.len() - 1].to_vec()
        } else {
            data.node_ids.clone()
        };

        (type_id, node_ids)
    } else {
        let type_id = if type_config.get(way_type).ignore {
            TYPE_IGNORE
        } else {
            way_type
        };

        (type_id, data.node_ids.clone())
    };

    if is_coastline {
        processed.raw_coastlines.push(RawCoastline {
            id: data.id,
            is_area: is_closed_ring,
            node_ids: node_ids.clone(),
        });
    }

    processed.raw_ways.push(RawWay {
        id: data.id,
        type_id,
        is_area,
        features: type_config.parse_features(&data.tags),
        node_ids,
    });
}

fn relation_sub_task(
    type_config: &TypeConfig,
    progress: &dyn Progress,
    data: &RawRelationData,
    processed: &mut ProcessedData,
) {
    if data.members.is_empty() {
        progress.warning(&format!("Relation {} does not have any members!", data.id));
        return;
    }

    if let Some(kind) = turn_restriction_kind(&data.tags) {
        if let Some(restriction) = extract_turn_restriction(&data.members, kind) {
            processed.turn_restrictions.push(restriction);
        }
    }

    if let Some(type_id) = multipolygon_type(type_config, &data.tags) {
        processed.raw_relations.push(RawRelation {
            id: data.id,
            type_id,
            features: type_config.parse_features(&data.tags),
            members: data.members.clone(),
        });
    }
}

/// Recognise a `type=restriction` relation and map the restriction value
fn turn_restriction_kind(tags: &[(String, String)]) -> Option<RestrictionKind> {
    if tag_value(tags, "type") != Some("restriction") {
        return None;
    }

    match tag_value(tags, "restriction")? {
        "only_left_turn" | "only_right_turn" | "only_straight_on" => Some(RestrictionKind::Allow),
        "no_left_turn" | "no_right_turn" | "no_straight_on" | "no_u_turn" => {
            Some(RestrictionKind::Forbid)
        }
        _ => None,
    }
}

/// A restriction needs exactly one way `from`, one node `via` and one way
/// `to`; the first complete triple wins
fn extract_turn_restriction(
    members: &[RelationMember],
    kind: RestrictionKind,
) -> Option<TurnRestriction> {
    let mut from = None;
    let mut via = None;
    let mut to = None;

    for member in members {
        match (member.kind, member.role.as_str()) {
            (crate::records::MemberKind::Way, "from") if from.is_none() => {
                from = Some(member.id);
            }
            (crate::records::MemberKind::Node, "via") if via.is_none() => {
                via = Some(member.id);
            }
            (crate::records::MemberKind::Way, "to") if to.is_none() => {
                to = Some(member.id);
            }
            _ => {}
        }

        if from.is_some() && via.is_some() && to.is_some() {
            break;
        }
    }

    Some(TurnRestriction {
        kind,
        from_way: from?,
        via_node: via?,
        to_way: to?,
    })
}

/// A relation is imported as a multipolygon when its resolved type is
/// multipolygon-capable, or when it carries an explicit `type=multipolygon`
fn multipolygon_type(type_config: &TypeConfig, tags: &[(String, String)]) -> Option<TypeId> {
    let type_id = type_config.relation_type(tags);
    let info = type_config.get(type_id);

    if type_id != TYPE_IGNORE && info.ignore {
        return None;
    }

    if type_id != TYPE_IGNORE && info.multipolygon {
        return Some(type_id);
    }

    if tag_value(tags, "type") == Some("multipolygon") {
        return Some(type_id);
    }

    None
}

/// Stage 2: parse the input files and emit the raw record files
pub struct PreprocessStage;

impl Stage for PreprocessStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("Preprocess", "Initial parsing of import file(s)")
            .provides(BOUNDING_DAT)
            .provides_temporary(DISTRIBUTION_DAT)
            .provides_temporary(RAWCOORDS_DAT)
            .provides_temporary(RAWNODES_DAT)
            .provides_temporary(RAWWAYS_DAT)
            .provides_temporary(RAWRELS_DAT)
            .provides_temporary(RAWCOASTLINE_DAT)
            .provides_temporary(RAWTURNRESTR_DAT)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let mut callback = Callback::new(
            Arc::clone(&ctx.type_config),
            &ctx.parameter,
            Arc::clone(&ctx.progress),
            ctx.breaker.clone(),
        )?;

        let parse_result = process_files(ctx, &mut callback);
        let cleanup_result = callback.finish(parse_result.is_ok());

        parse_result?;
        cleanup_result
    }
}

fn process_files(ctx: &StageContext, callback: &mut Callback) -> Result<()> {
    for path in &ctx.parameter.map_files {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        ctx.progress
            .set_action(&format!("Parsing '{}'", path.display()));

        match extension.as_str() {
            "osm" => xml::parse(path, ctx.progress.as_ref(), callback)?,
            "pbf" => pbf::parse(path, callback)?,
            _ => {
                return Err(ImportError::format(
                    path,
                    "unsupported input format, expected .osm or .pbf",
                )
                .into())
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use crate::types::test_support;

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn classify_way(node_ids: Vec<OsmId>, way_tags: Vec<(String, String)>) -> Option<RawWay> {
        let dir = tempfile::tempdir().unwrap();
        let (_, config) = test_support::load_test_config(dir.path());
        let progress = SilentProgress::default();

        let mut processed = ProcessedData::default();
        way_sub_task(
            &config,
            &progress,
            &RawWayData {
                id: 1,
                tags: way_tags,
                node_ids,
            },
            &mut processed,
        );

        processed.raw_ways.into_iter().next()
    }

    #[test]
    fn closed_three_node_ring_stays_a_way() {
        let way = classify_way(vec![1, 2, 1], tags(&[("natural", "water")])).unwrap();
        assert!(!way.is_area);
        assert_eq!(way.node_ids, vec![1, 2, 1]);
    }

    #[test]
    fn closed_four_node_ring_becomes_an_area() {
        let way = classify_way(vec![1, 2, 3, 1], tags(&[("natural", "water")])).unwrap();
        assert!(way.is_area);
        // the duplicate closing id is stripped
        assert_eq!(way.node_ids, vec![1, 2, 3]);
    }

    #[test]
    fn pin_way_types_never_become_areas() {
        let way = classify_way(vec![1, 2, 3, 4, 1], tags(&[("highway", "residential")])).unwrap();
        assert!(!way.is_area);
        assert_eq!(way.node_ids, vec![1, 2, 3, 4, 1]);
    }

    #[test]
    fn roundabouts_never_become_areas() {
        let way = classify_way(
            vec![1, 2, 3, 4, 1],
            tags(&[("natural", "water"), ("junction", "roundabout")]),
        )
        .unwrap();
        assert!(!way.is_area);
    }

    #[test]
    fn explicit_area_tag_overrides_the_ring_rule() {
        let way = classify_way(
            vec![1, 2, 3, 4, 1],
            tags(&[("natural", "water"), ("area", "no")]),
        )
        .unwrap();
        assert!(!way.is_area);
    }

    #[test]
    fn degenerate_ways_are_dropped_with_a_warning() {
        assert!(classify_way(vec![1], tags(&[("highway", "residential")])).is_none());
    }

    #[test]
    fn coastline_ways_also_emit_a_coastline_record() {
        let dir = tempfile::tempdir().unwrap();
        let (_, config) = test_support::load_test_config(dir.path());
        let progress = SilentProgress::default();

        let mut processed = ProcessedData::default();
        way_sub_task(
            &config,
            &progress,
            &RawWayData {
                id: 9,
                tags: tags(&[("natural", "coastline")]),
                node_ids: vec![1, 2, 3, 4, 1],
            },
            &mut processed,
        );

        assert_eq!(processed.raw_coastlines.len(), 1);
        assert!(processed.raw_coastlines[0].is_area);
        assert_eq!(processed.raw_ways.len(), 1);
    }

    #[test]
    fn turn_restrictions_need_a_complete_triple() {
        let members = vec![
            RelationMember {
                kind: crate::records::MemberKind::Way,
                role: "from".to_string(),
                id: 10,
            },
            RelationMember {
                kind: crate::records::MemberKind::Node,
                role: "via".to_string(),
                id: 20,
            },
            RelationMember {
                kind: crate::records::MemberKind::Way,
                role: "to".to_string(),
                id: 30,
            },
        ];

        let restriction =
            extract_turn_restriction(&members, RestrictionKind::Forbid).unwrap();
        assert_eq!(restriction.from_way, 10);
        assert_eq!(restriction.via_node, 20);
        assert_eq!(restriction.to_way, 30);

        // missing `to` member
        assert!(extract_turn_restriction(&members[..2], RestrictionKind::Forbid).is_none());
    }

    #[test]
    fn restriction_values_map_to_kinds() {
        assert_eq!(
            turn_restriction_kind(&tags(&[
                ("type", "restriction"),
                ("restriction", "no_left_turn")
            ])),
            Some(RestrictionKind::Forbid)
        );
        assert_eq!(
            turn_restriction_kind(&tags(&[
                ("type", "restriction"),
                ("restriction", "only_straight_on")
            ])),
            Some(RestrictionKind::Allow)
        );
        assert_eq!(
            turn_restriction_kind(&tags(&[("type", "restriction")])),
            None
        );
        assert_eq!(
            turn_restriction_kind(&tags(&[("restriction", "no_left_turn")])),
            None
        );
    }

    #[test]
    fn multipolygon_detection() {
        let dir = tempfile::tempdir().unwrap();
        let (_, config) = test_support::load_test_config(dir.path());

        // multipolygon-capable catalogue type
        assert!(multipolygon_type(&config, &tags(&[("natural", "water")])).is_some());

        // explicit tag without catalogue type
        let type_id =
            multipolygon_type(&config, &tags(&[("type", "multipolygon")])).unwrap();
        assert_eq!(type_id, TYPE_IGNORE);

        assert!(multipolygon_type(&config, &tags(&[("leisure", "park")])).is_none());
    }
}
