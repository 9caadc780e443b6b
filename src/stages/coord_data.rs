use crate::config::ImportParameter;
use crate::fileio::{external_sort, FileScanner, FileWriter, sorter::SortableRecord};
use crate::geom::GeoCoord;
use crate::records::{OsmId, RawCoord};
use crate::stages::preprocess::RAWCOORDS_DAT;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::{ImportError, Result};
use rustc_hash::FxHashMap;
use std::path::Path;

pub const COORD_DAT: &str = "coord.dat";

/// Fixed-width record in coord.dat: id, the two coordinate encodings, and
/// the serial disambiguating identical positions
const RECORD_SIZE: u64 = 21;

impl SortableRecord for RawCoord {
    fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        RawCoord::write_to(self, writer)
    }

    fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        RawCoord::read_from(scanner)
    }
}

#[derive(Debug, Clone, Copy)]
struct SerialCoord {
    id: OsmId,
    lat: u32,
    lon: u32,
    serial: u8,
}

impl SortableRecord for SerialCoord {
    fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_i64(self.id)?;
        writer.write_u32(self.lat)?;
        writer.write_u32(self.lon)?;
        writer.write_u8(self.serial)
    }

    fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        Ok(Self {
            id: scanner.read_i64()?,
            lat: scanner.read_u32()?,
            lon: scanner.read_u32()?,
            serial: scanner.read_u8()?,
        })
    }
}

/// Order-preserving mapping of a signed id onto the u64 sort-key space
fn id_sort_key(id: OsmId) -> u64 {
    (id as u64) ^ (1u64 << 63)
}

fn position_sort_key(lat: u32, lon: u32) -> u64 {
    ((lat as u64) << 32) | lon as u64
}

/// A coordinate as stored for one OSM node id
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredCoord {
    pub coord: GeoCoord,
    pub serial: u8,
}

impl StoredCoord {
    pub fn object_id(&self) -> u64 {
        self.coord.object_id(self.serial)
    }
}

/// Stage 3: build the coordinate store keyed by OSM node id.
///
/// Two external sort passes keep memory bounded: the first groups identical
/// quantised positions so each occupant gets a distinct serial, the second
/// restores id order for binary-searchable storage.
pub struct CoordDataStage;

impl Stage for CoordDataStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("CoordData", "Generate coord data file")
            .requires(RAWCOORDS_DAT)
            .provides_temporary(COORD_DAT)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;
        let dir = &parameter.destination_directory;

        let mut scanner = FileScanner::open(
            parameter.file_in_destination(RAWCOORDS_DAT),
            parameter.raw_node_data_memory_mapped,
        )?;
        let count = scanner.read_u32()?;

        ctx.progress
            .set_action(&format!("Assigning serials to {} raw coords", count));

        // block size in records, not bytes
        let block_size = (parameter.raw_coord_block_size / 24).max(1024);

        // Pass 1: group by position, hand out serials per identical position
        let by_position = dir.join("coordpos.tmp");
        {
            let mut writer = FileWriter::create(&by_position)?;
            writer.write_count_placeholder()?;

            let mut last_position: Option<u64> = None;
            let mut serial: u16 = 0;
            let mut clamped = false;
            let mut written: u32 = 0;

            let records = (0..count).map(|_| RawCoord::read_from(&mut scanner));

            external_sort(
                dir,
                block_size,
                records,
                |coord: &RawCoord| {
                    let (lat, lon) = coord.coord.encode();
                    position_sort_key(lat, lon)
                },
                |coord| {
                    let (lat, lon) = coord.coord.encode();
                    let position = position_sort_key(lat, lon);

                    if last_position == Some(position) {
                        serial = serial.saturating_add(1);
                    } else {
                        last_position = Some(position);
                        serial = 1;
                    }

                    if serial > u8::MAX as u16 && !clamped {
                        ctx.progress.warning(
                            "More than 255 nodes on one quantised position, clamping serials",
                        );
                        clamped = true;
                    }

                    SerialCoord {
                        id: coord.id,
                        lat,
                        lon,
                        serial: serial.min(u8::MAX as u16) as u8,
                    }
                    .write_to(&mut writer)?;
                    written += 1;
                    Ok(())
                },
            )?;

            writer.finish_with_count(written)?;
            writer.close()?;
        }

        ctx.check_aborted()?;
        ctx.progress
            .set_action(&format!("Writing '{}' sorted by id", COORD_DAT));

        // Pass 2: restore id order
        let mut position_scanner = FileScanner::open(&by_position, false)?;
        let sorted_count = position_scanner.read_u32()?;

        let mut writer = FileWriter::create(parameter.file_in_destination(COORD_DAT))?;
        writer.write_count_placeholder()?;

        let records = (0..sorted_count).map(|_| SerialCoord::read_from(&mut position_scanner));

        let mut written: u32 = 0;
        external_sort(
            dir,
            block_size,
            records,
            |record: &SerialCoord| id_sort_key(record.id),
            |record| {
                record.write_to(&mut writer)?;
                written += 1;
                Ok(())
            },
        )?;

        writer.finish_with_count(written)?;
        writer.close()?;

        std::fs::remove_file(&by_position).map_err(|e| ImportError::io(&by_position, e))?;

        ctx.progress
            .info(&format!("{} coords stored", written));
        Ok(())
    }
}

/// Binary-searchable reader over coord.dat supporting bulk lookup.
///
/// Stores that fit into the configured cache are pulled into memory; larger
/// ones are searched on the file or the mapping.
pub struct CoordStore {
    scanner: Option<FileScanner>,
    cached: Option<Vec<(OsmId, StoredCoord)>>,
    count: u64,
}

impl CoordStore {
    pub fn open(parameter: &ImportParameter) -> Result<Self> {
        Self::open_path(
            parameter.file_in_destination(COORD_DAT),
            parameter.coord_data_memory_mapped,
            parameter.coord_index_cache_size,
        )
    }

    pub fn open_path<P: AsRef<Path>>(
        path: P,
        memory_mapped: bool,
        cache_size: usize,
    ) -> Result<Self> {
        let mut scanner = FileScanner::open(path.as_ref(), memory_mapped)?;
        let count = scanner.read_u32()? as u64;

        let expected = 4 + count * RECORD_SIZE;
        if scanner.len() < expected {
            return Err(ImportError::format(
                path.as_ref(),
                format!("coord store truncated: {} < {} bytes", scanner.len(), expected),
            )
            .into());
        }

        if count as usize <= cache_size {
            let mut cached = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let record = SerialCoord::read_from(&mut scanner)?;
                cached.push((
                    record.id,
                    StoredCoord {
                        coord: GeoCoord::decode(record.lat, record.lon),
                        serial: record.serial,
                    },
                ));
            }

            Ok(Self {
                scanner: None,
                cached: Some(cached),
                count,
            })
        } else {
            Ok(Self {
                scanner: Some(scanner),
                cached: None,
                count,
            })
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&mut self, id: OsmId) -> Result<Option<StoredCoord>> {
        if let Some(cached) = &self.cached {
            return Ok(cached
                .binary_search_by_key(&id, |entry| entry.0)
                .ok()
                .map(|i| cached[i].1));
        }

        let scanner = self.scanner.as_mut().unwrap();
        let mut low = 0u64;
        let mut high = self.count;

        while low < high {
            let mid = (low + high) / 2;
            scanner.set_pos(4 + mid * RECORD_SIZE)?;
            let record_id = scanner.read_i64()?;

            if record_id == id {
                let lat = scanner.read_u32()?;
                let lon = scanner.read_u32()?;
                let serial = scanner.read_u8()?;
                return Ok(Some(StoredCoord {
                    coord: GeoCoord::decode(lat, lon),
                    serial,
                }));
            } else if record_id < id {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        Ok(None)
    }

    /// Bulk lookup; absent ids are simply missing from the result map
    pub fn get_many(&mut self, ids: &[OsmId]) -> Result<FxHashMap<OsmId, StoredCoord>> {
        let mut sorted: Vec<OsmId> = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut result =
            FxHashMap::with_capacity_and_hasher(sorted.len(), Default::default());
        for id in sorted {
            if let Some(stored) = self.get(id)? {
                result.insert(id, stored);
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{Breaker, SilentProgress};
    use crate::stages::StageContext;
    use crate::types::test_support;
    use std::sync::Arc;

    fn write_raw_coords(dir: &Path, coords: &[(OsmId, f64, f64)]) {
        let mut writer = FileWriter::create(dir.join(RAWCOORDS_DAT)).unwrap();
        writer.write_count_placeholder().unwrap();
        for (id, lat, lon) in coords {
            RawCoord {
                id: *id,
                coord: GeoCoord::new(*lat, *lon),
            }
            .write_to(&mut writer)
            .unwrap();
        }
        writer.finish_with_count(coords.len() as u32).unwrap();
        writer.close().unwrap();
    }

    fn run_stage(dir: &Path) -> StageContext {
        let (parameter, config) = test_support::load_test_config(dir);
        let ctx = StageContext {
            type_config: Arc::new(config),
            parameter: Arc::new(parameter),
            progress: Arc::new(SilentProgress::default()),
            breaker: Breaker::new(),
        };
        CoordDataStage.run(&ctx).unwrap();
        ctx
    }

    #[test]
    fn store_resolves_ids_and_misses() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_coords(
            dir.path(),
            &[(5, 51.0, 13.0), (9, 48.0, 11.0), (12, 52.0, 9.0)],
        );
        let ctx = run_stage(dir.path());

        // cached and file-backed lookup behave the same
        for cache_size in [1000, 0] {
            let mut store = CoordStore::open_path(
                ctx.parameter.file_in_destination(COORD_DAT),
                false,
                cache_size,
            )
            .unwrap();
            assert_eq!(store.len(), 3);

            let stored = store.get(9).unwrap().unwrap();
            assert!((stored.coord.lat - 48.0).abs() < 1e-6);
            assert_eq!(stored.serial, 1);

            assert!(store.get(7).unwrap().is_none());

            let many = store.get_many(&[5, 7, 12, 5]).unwrap();
            assert_eq!(many.len(), 2);
            assert!(many.contains_key(&5));
            assert!(many.contains_key(&12));
        }
    }

    #[test]
    fn identical_positions_get_distinct_serials() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_coords(
            dir.path(),
            &[(1, 50.0, 10.0), (2, 50.0, 10.0), (3, 50.0, 10.0), (4, 51.0, 10.0)],
        );
        let ctx = run_stage(dir.path());

        let mut store = CoordStore::open(&ctx.parameter).unwrap();
        let serials: Vec<u8> = (1..=3)
            .map(|id| store.get(id).unwrap().unwrap().serial)
            .collect();
        assert_eq!(serials, vec![1, 2, 3]);
        assert_eq!(store.get(4).unwrap().unwrap().serial, 1);

        // distinct serials yield distinct object ids on the shared position
        let a = store.get(1).unwrap().unwrap().object_id();
        let b = store.get(2).unwrap().unwrap().object_id();
        assert_ne!(a, b);
    }
}
