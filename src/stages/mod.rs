pub mod area_area_index;
pub mod area_node_index;
pub mod area_way_index;
pub mod coord_data;
pub mod intersection_index;
pub mod location_index;
pub mod low_zoom;
pub mod merge_area;
pub mod node_data;
pub mod optimize_ids;
pub mod preprocess;
pub mod raw_index;
pub mod rel_area;
pub mod route_data;
pub mod sort_objects;
pub mod text_index;
pub mod type_data;
pub mod water_index;
pub mod way_area;
pub mod way_way;

use crate::config::ImportParameter;
use crate::mem::{self, MemoryUsage};
use crate::progress::{Breaker, Progress};
use crate::types::TypeConfig;
use crate::{ImportError, Result};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Filenames a stage consumes and produces; the orchestrator validates the
/// whole pipeline against these descriptors and never introspects stage
/// internals.
#[derive(Debug, Clone, Default)]
pub struct StageDescription {
    pub name: String,
    pub description: String,
    pub required_files: Vec<String>,
    pub provided_files: Vec<String>,
    pub provided_optional_files: Vec<String>,
    pub provided_temporary_files: Vec<String>,
    pub provided_debugging_files: Vec<String>,
}

impl StageDescription {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }

    pub fn requires(mut self, file: impl Into<String>) -> Self {
        self.required_files.push(file.into());
        self
    }

    pub fn provides(mut self, file: impl Into<String>) -> Self {
        self.provided_files.push(file.into());
        self
    }

    pub fn provides_optional(mut self, file: impl Into<String>) -> Self {
        self.provided_optional_files.push(file.into());
        self
    }

    pub fn provides_temporary(mut self, file: impl Into<String>) -> Self {
        self.provided_temporary_files.push(file.into());
        self
    }

    pub fn provides_debugging(mut self, file: impl Into<String>) -> Self {
        self.provided_debugging_files.push(file.into());
        self
    }
}

/// Everything a stage may borrow while running
pub struct StageContext {
    pub type_config: Arc<TypeConfig>,
    pub parameter: Arc<ImportParameter>,
    pub progress: Arc<dyn Progress>,
    pub breaker: Breaker,
}

impl StageContext {
    /// Poll the cooperative cancellation handle
    pub fn check_aborted(&self) -> Result<()> {
        if self.breaker.is_aborted() {
            Err(ImportError::Aborted.into())
        } else {
            Ok(())
        }
    }
}

/// The two-method contract every import stage implements
pub trait Stage {
    fn describe(&self, parameter: &ImportParameter) -> StageDescription;
    fn run(&self, ctx: &StageContext) -> Result<()>;
}

/// The ordered stage list; order is the externally visible step numbering
fn stage_list() -> Vec<Box<dyn Stage>> {
    vec![
        /* 1 */ Box::new(type_data::TypeDataStage),
        /* 2 */ Box::new(preprocess::PreprocessStage),
        /* 3 */ Box::new(coord_data::CoordDataStage),
        /* 4 */ Box::new(raw_index::RawWayIndexStage),
        /* 5 */ Box::new(raw_index::RawRelationIndexStage),
        /* 6 */ Box::new(rel_area::RelAreaDataStage),
        /* 7 */ Box::new(way_area::WayAreaDataStage),
        /* 8 */ Box::new(merge_area::MergeAreaDataStage),
        /* 9 */ Box::new(merge_area::MergeAreasStage),
        /* 10 */ Box::new(way_way::WayWayDataStage),
        /* 11 */ Box::new(optimize_ids::OptimizeAreaWayIdsStage),
        /* 12 */ Box::new(node_data::NodeDataStage),
        /* 13 */ Box::new(sort_objects::SortNodeDataStage),
        /* 14 */ Box::new(sort_objects::SortWayDataStage),
        /* 15 */ Box::new(area_node_index::AreaNodeIndexStage),
        /* 16 */ Box::new(area_way_index::AreaWayIndexStage),
        /* 17 */ Box::new(area_area_index::AreaAreaIndexStage),
        /* 18 */ Box::new(water_index::WaterIndexStage),
        /* 19 */ Box::new(low_zoom::OptimizeAreasLowZoomStage),
        /* 20 */ Box::new(low_zoom::OptimizeWaysLowZoomStage),
        /* 21 */ Box::new(location_index::LocationIndexStage),
        /* 22 */ Box::new(route_data::RouteDataStage),
        /* 23 */ Box::new(intersection_index::IntersectionIndexStage),
        /* 24 */ Box::new(text_index::TextIndexStage),
    ]
}

/// Executes the ordered import stages against one parameter set
pub struct Importer {
    parameter: Arc<ImportParameter>,
    stages: Vec<Box<dyn Stage>>,
    descriptions: Vec<StageDescription>,
}

impl Importer {
    pub fn new(parameter: ImportParameter) -> Self {
        let stages = stage_list();
        let descriptions = stages
            .iter()
            .map(|stage| stage.describe(&parameter))
            .collect();

        Self {
            parameter: Arc::new(parameter),
            stages,
            descriptions,
        }
    }

    /// Union of all persistent files the selected pipeline produces
    pub fn provided_files(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .descriptions
            .iter()
            .flat_map(|d| d.provided_files.iter().cloned())
            .collect();
        set.into_iter().collect()
    }

    pub fn provided_optional_files(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .descriptions
            .iter()
            .flat_map(|d| d.provided_optional_files.iter().cloned())
            .collect();
        set.into_iter().collect()
    }

    /// Every temporary file must be required by some stage, otherwise the
    /// pipeline would produce data nobody consumes
    fn validate_descriptions(&self, progress: &dyn Progress) -> Result<()> {
        let required: HashSet<&String> = self
            .descriptions
            .iter()
            .flat_map(|d| d.required_files.iter())
            .collect();

        let mut success = true;
        for description in &self.descriptions {
            for file in &description.provided_temporary_files {
                if !required.contains(file) {
                    progress.error(&format!(
                        "Temporary file '{}' is not required by any import stage",
                        file
                    ));
                    success = false;
                }
            }
        }

        if success {
            Ok(())
        } else {
            Err(ImportError::Provenance("unconsumed temporary file".to_string()).into())
        }
    }

    /// Temporaries produced for stages up to and including `current_step`
    /// that no later stage requires any more
    fn cleanup_temporaries(&self, current_step: usize, progress: &dyn Progress) -> Result<()> {
        let all_temporaries: HashSet<&String> = self
            .descriptions
            .iter()
            .flat_map(|d| d.provided_temporary_files.iter())
            .collect();

        let required_up_to_now: HashSet<&String> = self.descriptions[..current_step]
            .iter()
            .flat_map(|d| d.required_files.iter())
            .filter(|f| all_temporaries.contains(f))
            .collect();

        let still_required: HashSet<&String> = self.descriptions[current_step..]
            .iter()
            .flat_map(|d| d.required_files.iter())
            .filter(|f| all_temporaries.contains(f))
            .collect();

        let mut removable: Vec<&&String> =
            required_up_to_now.difference(&still_required).collect();
        removable.sort();

        for file in removable {
            let path = self.parameter.file_in_destination(file);
            if !path.exists() {
                continue;
            }

            progress.info(&format!("Removing temporary file '{}'...", path.display()));
            std::fs::remove_file(&path).map_err(|e| ImportError::io(&path, e))?;
        }

        Ok(())
    }

    fn execute_stages(&self, ctx: &StageContext) -> Result<()> {
        let overall = Instant::now();
        let mut max_usage = MemoryUsage::default();

        for (index, stage) in self.stages.iter().enumerate() {
            let step = index + 1;
            if step < self.parameter.start_step || step > self.parameter.end_step {
                continue;
            }

            let description = &self.descriptions[index];
            ctx.progress
                .set_step(&format!("Step #{} - {}", step, description.name));
            ctx.progress
                .info(&format!("Stage description: {}", description.description));

            for file in &description.required_files {
                ctx.progress.info(&format!("Stage requires file '{}'", file));
            }
            for file in &description.provided_files {
                ctx.progress.info(&format!("Stage provides file '{}'", file));
            }
            for file in &description.provided_optional_files {
                ctx.progress
                    .info(&format!("Stage provides optional file '{}'", file));
            }
            for file in &description.provided_temporary_files {
                ctx.progress
                    .info(&format!("Stage provides temporary file '{}'", file));
            }
            for file in &description.provided_debugging_files {
                ctx.progress
                    .info(&format!("Stage provides debugging file '{}'", file));
            }

            let timer = Instant::now();
            let result = stage.run(ctx);
            let elapsed = timer.elapsed();

            let usage = mem::current_usage();
            max_usage = max_usage.max(usage);

            if usage.is_zero() {
                ctx.progress.info(&format!("=> {:.3}s", elapsed.as_secs_f64()));
            } else {
                ctx.progress.info(&format!(
                    "=> {:.3}s, RSS {}, VM {}",
                    elapsed.as_secs_f64(),
                    mem::byte_size_to_string(usage.resident),
                    mem::byte_size_to_string(usage.virtual_size)
                ));
            }

            if let Err(e) = result {
                ctx.progress
                    .error(&format!("Error while executing step '{}': {:#}", description.name, e));
                return Err(ImportError::Stage(description.name.clone()).into());
            }

            if self.parameter.eco {
                self.cleanup_temporaries(step, ctx.progress.as_ref())?;
            }
        }

        let usage_note = if max_usage.is_zero() {
            String::new()
        } else {
            format!(
                ", RSS {}, VM {}",
                mem::byte_size_to_string(max_usage.resident),
                mem::byte_size_to_string(max_usage.virtual_size)
            )
        };
        ctx.progress.info(&format!(
            "Overall {:.3}s{}",
            overall.elapsed().as_secs_f64(),
            usage_note
        ));

        Ok(())
    }

    /// Run the selected stages; succeeds only if every one of them succeeds
    pub fn run(&self, progress: Arc<dyn Progress>, breaker: Breaker) -> Result<()> {
        self.validate_descriptions(progress.as_ref())?;
        self.parameter.validate()?;

        progress.set_step("Loading type catalogue");
        let type_config = Arc::new(TypeConfig::load(&self.parameter)?);
        progress.info(&format!("Number of types: {}", type_config.type_count()));

        let ctx = StageContext {
            type_config,
            parameter: Arc::clone(&self.parameter),
            progress,
            breaker,
        };

        self.execute_stages(&ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;

    #[test]
    fn every_temporary_file_is_consumed() {
        let importer = Importer::new(ImportParameter::default());
        let progress = SilentProgress::default();
        importer.validate_descriptions(&progress).unwrap();
        assert_eq!(progress.error_count(), 0);
    }

    #[test]
    fn provided_files_cover_the_database() {
        let importer = Importer::new(ImportParameter::default());
        let provided = importer.provided_files();

        for expected in [
            "bounding.dat",
            "types.dat",
            "nodes.dat",
            "ways.dat",
            "areas.dat",
            "areanode.idx",
            "areaway.idx",
            "areaarea.idx",
            "water.idx",
            "location.idx",
            "intersections.idx",
        ] {
            assert!(
                provided.iter().any(|f| f == expected),
                "missing provided file {}",
                expected
            );
        }
    }

    #[test]
    fn debugging_files_are_declared() {
        let importer = Importer::new(ImportParameter::default());
        let location = importer
            .descriptions
            .iter()
            .find(|d| d.name == "LocationIndex")
            .unwrap();

        assert_eq!(
            location.provided_debugging_files,
            vec![location_index::LOCATION_REGION_TXT.to_string()]
        );
    }

    #[test]
    fn step_numbering_matches_the_documented_order() {
        let importer = Importer::new(ImportParameter::default());
        assert_eq!(importer.stages.len(), crate::config::DEFAULT_END_STEP);
        assert_eq!(importer.descriptions[0].name, "TypeData");
        assert_eq!(importer.descriptions[1].name, "Preprocess");
        assert_eq!(importer.descriptions[9].name, "WayWayData");
        assert_eq!(importer.descriptions[23].name, "TextIndex");
    }
}
