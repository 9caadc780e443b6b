use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::geom::{point_in_ring, GeoBox, GeoCoord};
use crate::records::{Area, Node, ObjectRef, RingRole, Way};
use crate::stages::sort_objects::{AREAS_DAT, NODES_DAT, WAYS_DAT};
use crate::stages::{Stage, StageContext, StageDescription};
use crate::{ImportError, Result};
use std::collections::BTreeMap;

pub const LOCATION_IDX: &str = "location.idx";
pub const LOCATION_REGION_TXT: &str = "location_region.txt";

/// An admin region collected from the area file
struct Region {
    name: String,
    admin_level: u8,
    bbox: GeoBox,
    outer_rings: Vec<Vec<GeoCoord>>,
    parent: Option<usize>,
}

impl Region {
    fn contains(&self, coord: GeoCoord) -> bool {
        self.bbox.contains(coord)
            && self
                .outer_rings
                .iter()
                .any(|ring| point_in_ring(coord, ring))
    }
}

/// A named object inside a region, with its addresses
#[derive(Default)]
struct Location {
    refs: Vec<ObjectRef>,
    addresses: Vec<(String, ObjectRef)>,
}

/// Stage 21: build the hierarchical admin-region / location / address index
pub struct LocationIndexStage;

impl Stage for LocationIndexStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("LocationIndex", "Generate location and address index")
            .requires(NODES_DAT)
            .requires(WAYS_DAT)
            .requires(AREAS_DAT)
            .provides(LOCATION_IDX)
            .provides_debugging(LOCATION_REGION_TXT)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        ctx.progress.set_action("Collecting admin regions");
        let mut regions = collect_regions(ctx)?;
        link_region_parents(&mut regions);
        ctx.progress
            .info(&format!("{} admin regions found", regions.len()));

        write_region_dump(parameter, &regions)?;

        ctx.progress.set_action("Assigning named objects to regions");
        // per region: location name -> refs and addresses
        let mut locations: Vec<BTreeMap<String, Location>> =
            (0..regions.len()).map(|_| BTreeMap::new()).collect();

        index_nodes(ctx, &regions, &mut locations)?;
        index_ways(ctx, &regions, &mut locations)?;

        ctx.progress
            .set_action(&format!("Writing '{}'", LOCATION_IDX));
        write_index(parameter, &regions, &locations)?;

        let location_count: usize = locations.iter().map(BTreeMap::len).sum();
        ctx.progress
            .info(&format!("{} locations indexed", location_count));
        Ok(())
    }
}

fn collect_regions(ctx: &StageContext) -> Result<Vec<Region>> {
    let parameter = &ctx.parameter;

    let mut scanner = FileScanner::open(
        parameter.file_in_destination(AREAS_DAT),
        parameter.area_data_memory_mapped,
    )?;
    let count = scanner.read_u32()?;

    let mut regions = Vec::new();
    for _ in 0..count {
        ctx.check_aborted()?;

        let area = Area::read_from(&mut scanner)?;
        if !ctx.type_config.get(area.type_id).admin_region {
            continue;
        }
        let Some(name) = area.features.name.clone() else {
            continue;
        };

        let outer_rings: Vec<Vec<GeoCoord>> = area
            .rings
            .iter()
            .filter(|ring| ring.role == RingRole::Outer)
            .map(|ring| ring.coords.clone())
            .collect();
        if outer_rings.is_empty() {
            continue;
        }

        regions.push(Region {
            name,
            admin_level: area.features.admin_level.unwrap_or(0),
            bbox: area.bounding_box(),
            outer_rings,
            parent: None,
        });
    }

    Ok(regions)
}

/// Human-readable dump of the resolved region tree, kept next to the index
/// for post-import inspection
fn write_region_dump(parameter: &ImportParameter, regions: &[Region]) -> Result<()> {
    let path = parameter.file_in_destination(LOCATION_REGION_TXT);
    let mut dump = String::new();

    for region in regions {
        let parent = region
            .parent
            .map(|p| regions[p].name.as_str())
            .unwrap_or("-");
        dump.push_str(&format!(
            "level {} '{}' (parent: {})\n",
            region.admin_level, region.name, parent
        ));
    }

    std::fs::write(&path, dump).map_err(|e| ImportError::io(&path, e).into())
}

/// Parent: the smallest enclosing region with a lower admin level
fn link_region_parents(regions: &mut [Region]) {
    let boxes: Vec<GeoBox> = regions.iter().map(|r| r.bbox).collect();
    let levels: Vec<u8> = regions.iter().map(|r| r.admin_level).collect();

    for index in 0..regions.len() {
        let mut best: Option<usize> = None;

        for candidate in 0..regions.len() {
            if candidate == index
                || levels[candidate] >= levels[index]
                || !boxes[candidate].contains_box(&boxes[index])
            {
                continue;
            }

            best = match best {
                None => Some(candidate),
                Some(current) => {
                    // prefer the deepest enclosing level
                    if levels[candidate] > levels[current] {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        regions[index].parent = best;
    }
}

/// Smallest region containing the coordinate
fn region_of(regions: &[Region], coord: GeoCoord) -> Option<usize> {
    let mut best: Option<usize> = None;

    for (index, region) in regions.iter().enumerate() {
        if !region.contains(coord) {
            continue;
        }

        best = match best {
            None => Some(index),
            Some(current) => {
                if region.admin_level > regions[current].admin_level {
                    Some(index)
                } else {
                    Some(current)
                }
            }
        };
    }

    best
}

fn add_named_object(
    regions: &[Region],
    locations: &mut [BTreeMap<String, Location>],
    coord: GeoCoord,
    name: Option<&str>,
    street: Option<&str>,
    housenumber: Option<&str>,
    object: ObjectRef,
) {
    let Some(region) = region_of(regions, coord) else {
        return;
    };

    if let Some(name) = name {
        locations[region]
            .entry(name.to_string())
            .or_default()
            .refs
            .push(object);
    }

    // an address files under its street's location entry
    if let (Some(street), Some(housenumber)) = (street, housenumber) {
        locations[region]
            .entry(street.to_string())
            .or_default()
            .addresses
            .push((housenumber.to_string(), object));
    }
}

fn index_nodes(
    ctx: &StageContext,
    regions: &[Region],
    locations: &mut [BTreeMap<String, Location>],
) -> Result<()> {
    let parameter = &ctx.parameter;

    let mut scanner =
        FileScanner::open(parameter.file_in_destination(NODES_DAT), false)?;
    let count = scanner.read_u32()?;

    for _ in 0..count {
        ctx.check_aborted()?;
        let node = Node::read_from(&mut scanner)?;

        add_named_object(
            regions,
            locations,
            node.coord,
            node.features.name.as_deref(),
            node.features.address_street.as_deref(),
            node.features.address_number.as_deref(),
            ObjectRef::node(node.id),
        );
    }

    Ok(())
}

fn index_ways(
    ctx: &StageContext,
    regions: &[Region],
    locations: &mut [BTreeMap<String, Location>],
) -> Result<()> {
    let parameter = &ctx.parameter;

    let mut scanner = FileScanner::open(
        parameter.file_in_destination(WAYS_DAT),
        parameter.way_data_memory_mapped,
    )?;
    let count = scanner.read_u32()?;

    for _ in 0..count {
        ctx.check_aborted()?;
        let way = Way::read_from(&mut scanner)?;

        let Some(anchor) = way.nodes.first().map(|n| n.coord) else {
            continue;
        };

        add_named_object(
            regions,
            locations,
            anchor,
            way.features.name.as_deref(),
            way.features.address_street.as_deref(),
            way.features.address_number.as_deref(),
            ObjectRef::way(way.id),
        );
    }

    Ok(())
}

fn write_index(
    parameter: &ImportParameter,
    regions: &[Region],
    locations: &[BTreeMap<String, Location>],
) -> Result<()> {
    let mut writer = FileWriter::create(parameter.file_in_destination(LOCATION_IDX))?;

    writer.write_u32(regions.len() as u32)?;
    for region in regions {
        writer.write_string(&region.name)?;
        writer.write_u8(region.admin_level)?;
        writer.write_u32(region.parent.map(|p| p as u32).unwrap_or(u32::MAX))?;
        writer.write_coord(region.bbox.min)?;
        writer.write_coord(region.bbox.max)?;
    }

    for region_locations in locations {
        writer.write_u32(region_locations.len() as u32)?;

        for (name, location) in region_locations {
            writer.write_string(name)?;

            writer.write_unsigned(location.refs.len() as u64)?;
            for object in &location.refs {
                object.write_to(&mut writer)?;
            }

            writer.write_unsigned(location.addresses.len() as u64)?;
            for (housenumber, object) in &location.addresses {
                writer.write_string(housenumber)?;
                object.write_to(&mut writer)?;
            }
        }
    }

    writer.close()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str, level: u8, min: (f64, f64), max: (f64, f64)) -> Region {
        let ring = vec![
            GeoCoord::new(min.0, min.1),
            GeoCoord::new(min.0, max.1),
            GeoCoord::new(max.0, max.1),
            GeoCoord::new(max.0, min.1),
        ];
        let mut bbox = GeoBox::new();
        for coord in &ring {
            bbox.include(*coord);
        }

        Region {
            name: name.to_string(),
            admin_level: level,
            bbox,
            outer_rings: vec![ring],
            parent: None,
        }
    }

    #[test]
    fn parents_link_to_the_deepest_enclosing_region() {
        let mut regions = vec![
            region("Country", 2, (0.0, 0.0), (10.0, 10.0)),
            region("State", 4, (1.0, 1.0), (9.0, 9.0)),
            region("City", 8, (2.0, 2.0), (3.0, 3.0)),
        ];
        link_region_parents(&mut regions);

        assert_eq!(regions[0].parent, None);
        assert_eq!(regions[1].parent, Some(0));
        assert_eq!(regions[2].parent, Some(1));
    }

    #[test]
    fn objects_land_in_the_smallest_region() {
        let regions = vec![
            region("Country", 2, (0.0, 0.0), (10.0, 10.0)),
            region("City", 8, (2.0, 2.0), (3.0, 3.0)),
        ];

        assert_eq!(region_of(&regions, GeoCoord::new(2.5, 2.5)), Some(1));
        assert_eq!(region_of(&regions, GeoCoord::new(5.0, 5.0)), Some(0));
        assert_eq!(region_of(&regions, GeoCoord::new(50.0, 50.0)), None);
    }
}
