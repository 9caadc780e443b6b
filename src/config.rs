use crate::{ImportError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_START_STEP: usize = 1;
pub const DEFAULT_END_STEP: usize = 24;

/// Vehicle bits combined into a router's vehicle mask
pub const VEHICLE_FOOT: u8 = 1 << 0;
pub const VEHICLE_BICYCLE: u8 = 1 << 1;
pub const VEHICLE_CAR: u8 = 1 << 2;

/// Definition of one routing graph to generate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Router {
    pub vehicle_mask: u8,
    pub filename_base: String,
}

impl Router {
    pub fn new(vehicle_mask: u8, filename_base: impl Into<String>) -> Self {
        Self {
            vehicle_mask,
            filename_base: filename_base.into(),
        }
    }

    pub fn data_filename(&self) -> String {
        format!("{}.dat", self.filename_base)
    }

    pub fn variant_filename(&self) -> String {
        format!("{}2.dat", self.filename_base)
    }

    pub fn index_filename(&self) -> String {
        format!("{}.idx", self.filename_base)
    }
}

/// Method used when simplifying way geometry for low zoom levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizeMethod {
    /// Coarse tolerance, fewer points
    Fast,
    /// Tight tolerance, better fidelity
    Quality,
}

/// Collects all parameters that have influence on the import
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportParameter {
    /// Ordered list of input files, either *.osm or *.pbf
    pub map_files: Vec<PathBuf>,
    /// Path of the type catalogue file
    pub type_file: PathBuf,
    /// Directory all output files are written to
    pub destination_directory: PathBuf,

    /// First stage to execute, 1-based inclusive
    pub start_step: usize,
    /// Last stage to execute, 1-based inclusive
    pub end_step: usize,
    /// Delete temporary files as soon as no remaining stage requires them
    pub eco: bool,

    pub routers: Vec<Router>,

    pub sort_objects: bool,
    /// Number of records loaded per external-sort block
    pub sort_block_size: usize,
    /// Magnification of the tile grid used as spatial sort key
    pub sort_tile_magnification: u32,

    /// Entries of a numeric index kept in memory per reader
    pub numeric_index_page_size: usize,

    /// Raw coordinates processed per block during coord store construction
    pub raw_coord_block_size: usize,
    /// Ways loaded per batch until their nodes get resolved
    pub raw_way_block_size: usize,

    pub raw_node_data_memory_mapped: bool,
    pub raw_way_index_memory_mapped: bool,
    pub raw_way_data_memory_mapped: bool,
    pub raw_way_index_cache_size: usize,

    pub coord_data_memory_mapped: bool,
    pub coord_index_cache_size: usize,

    pub area_data_memory_mapped: bool,
    pub area_data_cache_size: usize,
    pub way_data_memory_mapped: bool,
    pub way_data_cache_size: usize,

    pub area_area_index_max_mag: u32,

    pub area_node_min_mag: u32,
    pub area_node_index_min_fill_rate: f64,
    pub area_node_index_cell_size_average: usize,
    pub area_node_index_cell_size_max: usize,

    pub area_way_min_mag: u32,
    pub area_way_index_max_level: u32,

    pub water_index_min_mag: u32,
    pub water_index_max_mag: u32,
    /// Trust coastlines only, or assume unknown border tiles are land
    pub assume_land: bool,

    pub optimization_max_way_count: usize,
    pub optimization_max_mag: u32,
    pub optimization_min_mag: u32,
    pub optimization_cell_size_average: usize,
    pub optimization_cell_size_max: usize,
    pub optimization_way_method: OptimizeMethod,

    /// Route nodes written per block during routing graph construction
    pub route_node_block_size: usize,

    /// Language preference for name tags; "#" denotes the untagged default
    pub lang_order: Vec<String>,
    pub alt_lang_order: Vec<String>,

    /// Generate the optional full-text index over names
    pub text_index: bool,
}

impl Default for ImportParameter {
    fn default() -> Self {
        Self {
            map_files: Vec::new(),
            type_file: PathBuf::from("map.ost"),
            destination_directory: PathBuf::from("."),
            start_step: DEFAULT_START_STEP,
            end_step: DEFAULT_END_STEP,
            eco: false,
            routers: vec![Router::new(VEHICLE_CAR, "router")],
            sort_objects: true,
            sort_block_size: 40_000_000,
            sort_tile_magnification: 14,
            numeric_index_page_size: 1024,
            raw_coord_block_size: 60_000_000,
            raw_way_block_size: 500_000,
            raw_node_data_memory_mapped: false,
            raw_way_index_memory_mapped: true,
            raw_way_data_memory_mapped: false,
            raw_way_index_cache_size: 10_000,
            coord_data_memory_mapped: false,
            coord_index_cache_size: 1_000_000,
            area_data_memory_mapped: false,
            area_data_cache_size: 0,
            way_data_memory_mapped: false,
            way_data_cache_size: 0,
            area_area_index_max_mag: 17,
            area_node_min_mag: 8,
            area_node_index_min_fill_rate: 0.1,
            area_node_index_cell_size_average: 16,
            area_node_index_cell_size_max: 256,
            area_way_min_mag: 11,
            area_way_index_max_level: 13,
            water_index_min_mag: 6,
            water_index_max_mag: 14,
            assume_land: true,
            optimization_max_way_count: 1_000_000,
            optimization_max_mag: 10,
            optimization_min_mag: 0,
            optimization_cell_size_average: 64,
            optimization_cell_size_max: 255,
            optimization_way_method: OptimizeMethod::Quality,
            route_node_block_size: 500_000,
            lang_order: vec!["#".to_string()],
            alt_lang_order: Vec::new(),
            text_index: false,
        }
    }
}

impl ImportParameter {
    /// Load parameters from a JSON file, with defaults for absent fields
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ImportError::io(path.as_ref(), e))?;
        let parameter: ImportParameter = serde_json::from_str(&contents)
            .map_err(|e| ImportError::format(path.as_ref(), e.to_string()))?;
        Ok(parameter)
    }

    /// Validate the numeric configuration before any stage runs
    pub fn validate(&self) -> Result<()> {
        if self.start_step < DEFAULT_START_STEP || self.end_step > DEFAULT_END_STEP {
            return Err(ImportError::Config(format!(
                "Step range {}..{} is outside {}..{}",
                self.start_step, self.end_step, DEFAULT_START_STEP, DEFAULT_END_STEP
            ))
            .into());
        }

        if self.start_step > self.end_step {
            return Err(ImportError::Config(format!(
                "Start step {} is after end step {}",
                self.start_step, self.end_step
            ))
            .into());
        }

        if self.area_way_min_mag <= self.optimization_max_mag {
            return Err(ImportError::Config(
                "Area way index minimum magnification is <= optimization max magnification"
                    .to_string(),
            )
            .into());
        }

        if self.eco
            && (self.start_step != DEFAULT_START_STEP || self.end_step != DEFAULT_END_STEP)
        {
            return Err(ImportError::Config(
                "Eco mode requires running all import steps".to_string(),
            )
            .into());
        }

        if self.water_index_min_mag > self.water_index_max_mag {
            return Err(ImportError::Config(
                "Water index minimum magnification is above its maximum".to_string(),
            )
            .into());
        }

        if self.sort_block_size == 0 || self.raw_way_block_size == 0 {
            return Err(ImportError::Config("Block sizes must be greater than 0".to_string()).into());
        }

        Ok(())
    }

    /// Resolve a database filename inside the destination directory
    pub fn file_in_destination(&self, name: &str) -> PathBuf {
        self.destination_directory.join(name)
    }
}
