use osmatlas_import::config::ImportParameter;
use osmatlas_import::progress::{Breaker, SilentProgress};
use osmatlas_import::Importer;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Minimal but realistic type catalogue, the way a production run loads it
fn write_catalogue(dir: &Path) -> PathBuf {
    let path = dir.join("map.ost");
    let catalogue = serde_json::json!({
        "types": [
            {
                "name": "highway_residential",
                "conditions": [{"key": "highway", "values": ["residential"]}],
                "can_be_way": true,
                "pin_way": true,
                "optimize_low_zoom": true,
                "routes": ["car", "bicycle", "foot"]
            },
            {
                "name": "natural_water",
                "conditions": [{"key": "natural", "values": ["water"]}],
                "can_be_area": true,
                "multipolygon": true
            },
            {
                "name": "amenity_cafe",
                "conditions": [{"key": "amenity", "values": ["cafe"]}],
                "can_be_node": true
            }
        ]
    });
    std::fs::write(&path, serde_json::to_string_pretty(&catalogue).unwrap()).unwrap();
    path
}

fn write_osm(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("input.osm");
    let contents = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<osm>\n{}\n</osm>\n", body);
    std::fs::write(&path, contents).unwrap();
    path
}

fn parameter_for(dir: &Path, input: PathBuf) -> ImportParameter {
    ImportParameter {
        map_files: vec![input],
        type_file: write_catalogue(dir),
        destination_directory: dir.to_path_buf(),
        ..Default::default()
    }
}

fn run(parameter: ImportParameter) -> osmatlas_import::Result<()> {
    let importer = Importer::new(parameter);
    importer.run(Arc::new(SilentProgress::default()), Breaker::new())
}

/// Leading record count of a record-oriented database file
fn record_count(path: &Path) -> u32 {
    let bytes = std::fs::read(path).unwrap();
    u32::from_le_bytes(bytes[..4].try_into().unwrap())
}

#[test]
fn empty_input_produces_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_osm(dir.path(), "");

    run(parameter_for(dir.path(), input)).unwrap();

    for file in [
        "rawcoords.dat",
        "rawnodes.dat",
        "rawways.dat",
        "rawrels.dat",
        "rawcoastline.dat",
        "rawturnrestr.dat",
        "nodes.dat",
        "ways.dat",
        "areas.dat",
    ] {
        assert_eq!(record_count(&dir.path().join(file)), 0, "{}", file);
    }

    // the bounding box never saw a coordinate: min stays above max
    let bounding = std::fs::read(dir.path().join("bounding.dat")).unwrap();
    let min_lat = u32::from_le_bytes(bounding[0..4].try_into().unwrap());
    let max_lat = u32::from_le_bytes(bounding[8..12].try_into().unwrap());
    assert!(min_lat > max_lat);
}

#[test]
fn single_node_import() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_osm(
        dir.path(),
        r#"  <node id="1" lat="51.5" lon="-0.1">
    <tag k="amenity" v="cafe"/>
    <tag k="name" v="Corner Cafe"/>
  </node>"#,
    );

    run(parameter_for(dir.path(), input)).unwrap();

    assert_eq!(record_count(&dir.path().join("rawcoords.dat")), 1);
    assert_eq!(record_count(&dir.path().join("rawnodes.dat")), 1);
    assert_eq!(record_count(&dir.path().join("nodes.dat")), 1);

    // bounding box degenerates to the node position
    let expected_lat = ((51.5f64 + 90.0) * (134_217_727.0 / 180.0)).round() as u32;
    let expected_lon = ((-0.1f64 + 180.0) * (134_217_727.0 / 360.0)).round() as u32;

    let bounding = std::fs::read(dir.path().join("bounding.dat")).unwrap();
    for offset in [0, 8] {
        let lat = u32::from_le_bytes(bounding[offset..offset + 4].try_into().unwrap());
        let lon = u32::from_le_bytes(bounding[offset + 4..offset + 8].try_into().unwrap());
        assert_eq!(lat, expected_lat);
        assert_eq!(lon, expected_lon);
    }

    // exactly one distribution bucket is filled
    let distribution = std::fs::read(dir.path().join("distribution.dat")).unwrap();
    let total: u32 = distribution
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .sum();
    assert_eq!(total, 1);
}

fn road_nodes() -> &'static str {
    r#"  <node id="1" lat="51.0" lon="10.000"/>
  <node id="2" lat="51.0" lon="10.001"/>
  <node id="3" lat="51.0" lon="10.002"/>
  <node id="4" lat="51.0" lon="10.003"/>
  <node id="5" lat="51.0" lon="10.004"/>"#
}

#[test]
fn ways_sharing_an_endpoint_merge() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_osm(
        dir.path(),
        &format!(
            r#"{}
  <way id="10">
    <nd ref="1"/><nd ref="2"/><nd ref="3"/>
    <tag k="highway" v="residential"/>
  </way>
  <way id="11">
    <nd ref="3"/><nd ref="4"/><nd ref="5"/>
    <tag k="highway" v="residential"/>
  </way>"#,
            road_nodes()
        ),
    );

    run(parameter_for(dir.path(), input)).unwrap();

    assert_eq!(record_count(&dir.path().join("rawways.dat")), 2);
    assert_eq!(record_count(&dir.path().join("ways.dat")), 1);
}

#[test]
fn a_restriction_on_the_shared_node_prevents_the_merge() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_osm(
        dir.path(),
        &format!(
            r#"{}
  <way id="10">
    <nd ref="1"/><nd ref="2"/><nd ref="3"/>
    <tag k="highway" v="residential"/>
  </way>
  <way id="11">
    <nd ref="3"/><nd ref="4"/><nd ref="5"/>
    <tag k="highway" v="residential"/>
  </way>
  <relation id="100">
    <member type="way" ref="10" role="from"/>
    <member type="node" ref="3" role="via"/>
    <member type="way" ref="11" role="to"/>
    <tag k="type" v="restriction"/>
    <tag k="restriction" v="no_left_turn"/>
  </relation>"#,
            road_nodes()
        ),
    );

    run(parameter_for(dir.path(), input)).unwrap();

    assert_eq!(record_count(&dir.path().join("rawturnrestr.dat")), 1);
    assert_eq!(record_count(&dir.path().join("ways.dat")), 2);

    // the restriction survives into the router's variant file
    assert_eq!(record_count(&dir.path().join("router2.dat")), 1);
}

#[test]
fn a_closed_residential_ring_stays_a_way() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_osm(
        dir.path(),
        r#"  <node id="1" lat="51.0" lon="10.000"/>
  <node id="2" lat="51.0" lon="10.001"/>
  <node id="3" lat="51.001" lon="10.001"/>
  <node id="4" lat="51.001" lon="10.000"/>
  <way id="10">
    <nd ref="1"/><nd ref="2"/><nd ref="3"/><nd ref="4"/><nd ref="1"/>
    <tag k="highway" v="residential"/>
  </way>"#,
    );

    run(parameter_for(dir.path(), input)).unwrap();

    assert_eq!(record_count(&dir.path().join("ways.dat")), 1);
    assert_eq!(record_count(&dir.path().join("areas.dat")), 0);
}

#[test]
fn a_closed_water_ring_becomes_an_area() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_osm(
        dir.path(),
        r#"  <node id="1" lat="51.0" lon="10.000"/>
  <node id="2" lat="51.0" lon="10.001"/>
  <node id="3" lat="51.001" lon="10.001"/>
  <node id="4" lat="51.001" lon="10.000"/>
  <way id="10">
    <nd ref="1"/><nd ref="2"/><nd ref="3"/><nd ref="4"/><nd ref="1"/>
    <tag k="natural" v="water"/>
  </way>"#,
    );

    run(parameter_for(dir.path(), input)).unwrap();

    assert_eq!(record_count(&dir.path().join("areas.dat")), 1);
    assert_eq!(record_count(&dir.path().join("ways.dat")), 0);
}

#[test]
fn repeated_runs_are_byte_identical() {
    let body = format!(
        r#"{}
  <node id="6" lat="51.5" lon="10.5">
    <tag k="amenity" v="cafe"/>
    <tag k="name" v="Brew"/>
  </node>
  <way id="10">
    <nd ref="1"/><nd ref="2"/><nd ref="3"/>
    <tag k="highway" v="residential"/>
    <tag k="name" v="Main Street"/>
  </way>
  <way id="11">
    <nd ref="3"/><nd ref="4"/><nd ref="5"/>
    <tag k="highway" v="residential"/>
  </way>"#,
        road_nodes()
    );

    let first = tempfile::tempdir().unwrap();
    let input = write_osm(first.path(), &body);
    run(parameter_for(first.path(), input)).unwrap();

    let second = tempfile::tempdir().unwrap();
    let input = write_osm(second.path(), &body);
    run(parameter_for(second.path(), input)).unwrap();

    for file in [
        "rawcoords.dat",
        "rawnodes.dat",
        "rawways.dat",
        "bounding.dat",
        "distribution.dat",
        "coord.dat",
        "nodes.dat",
        "ways.dat",
        "areas.dat",
        "areaway.idx",
        "areanode.idx",
        "router.dat",
    ] {
        let a = std::fs::read(first.path().join(file)).unwrap();
        let b = std::fs::read(second.path().join(file)).unwrap();
        assert_eq!(a, b, "{} differs between runs", file);
    }
}

#[test]
fn unsorted_ids_fail_after_emitting_all_data() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_osm(
        dir.path(),
        r#"  <node id="2" lat="51.0" lon="10.0"/>
  <node id="1" lat="51.1" lon="10.1"/>"#,
    );

    let parameter = ImportParameter {
        end_step: 2,
        ..parameter_for(dir.path(), input)
    };

    assert!(run(parameter).is_err());

    // the data was still written before the failure was reported
    assert_eq!(record_count(&dir.path().join("rawcoords.dat")), 2);
}

#[test]
fn eco_mode_reclaims_temporaries() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_osm(
        dir.path(),
        &format!(
            r#"{}
  <way id="10">
    <nd ref="1"/><nd ref="2"/><nd ref="3"/>
    <tag k="highway" v="residential"/>
  </way>"#,
            road_nodes()
        ),
    );

    let parameter = ImportParameter {
        eco: true,
        ..parameter_for(dir.path(), input)
    };
    run(parameter).unwrap();

    for temporary in [
        "rawcoords.dat",
        "rawnodes.dat",
        "rawways.dat",
        "rawrels.dat",
        "rawcoastline.dat",
        "rawturnrestr.dat",
        "distribution.dat",
        "coord.dat",
        "rawways.idx",
        "rawrels.idx",
        "relarea.tmp",
        "wayarea.tmp",
        "areas.tmp",
        "areas2.tmp",
        "areas3.tmp",
        "wayway.tmp",
        "ways2.tmp",
        "wayidmap.tmp",
        "nodes.tmp",
        "turnrestr.dat",
    ] {
        assert!(
            !dir.path().join(temporary).exists(),
            "{} should have been reclaimed",
            temporary
        );
    }

    for persistent in ["bounding.dat", "types.dat", "nodes.dat", "ways.dat", "areas.dat"] {
        assert!(dir.path().join(persistent).exists(), "{}", persistent);
    }

    // debugging files are not temporaries and survive eco mode
    assert!(dir.path().join("location_region.txt").exists());
}

#[test]
fn partial_step_ranges_execute_only_their_stages() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_osm(dir.path(), r#"  <node id="1" lat="51.0" lon="10.0"/>"#);

    let parameter = ImportParameter {
        end_step: 2,
        ..parameter_for(dir.path(), input)
    };
    run(parameter).unwrap();

    assert!(dir.path().join("rawcoords.dat").exists());
    assert!(!dir.path().join("coord.dat").exists());
    assert!(!dir.path().join("nodes.dat").exists());
}
