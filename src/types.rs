use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter, FORMAT_VERSION};
use crate::{ImportError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Dense index of a type inside the catalogue; 0 is the ignore type
pub type TypeId = u16;

pub const TYPE_IGNORE: TypeId = 0;

/// Tag predicate: key must be present, and when `values` is non-empty the
/// tag value must be one of them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCondition {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl TagCondition {
    fn matches(&self, tags: &[(String, String)]) -> bool {
        match tag_value(tags, &self.key) {
            None => false,
            Some(value) => self.values.is_empty() || self.values.iter().any(|v| v == value),
        }
    }
}

/// One entry of the type catalogue file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct TypeDef {
    name: String,
    conditions: Vec<TagCondition>,
    can_be_node: bool,
    can_be_way: bool,
    can_be_area: bool,
    can_be_relation: bool,
    pin_way: bool,
    multipolygon: bool,
    ignore: bool,
    admin_region: bool,
    optimize_low_zoom: bool,
    routes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogueFile {
    types: Vec<TypeDef>,
}

/// Immutable description of one object type
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: String,
    pub index: TypeId,
    conditions: Vec<TagCondition>,
    pub can_be_node: bool,
    pub can_be_way: bool,
    pub can_be_area: bool,
    pub can_be_relation: bool,
    /// Members are always modelled as ways, never auto-promoted to areas
    pub pin_way: bool,
    pub multipolygon: bool,
    pub ignore: bool,
    pub admin_region: bool,
    pub optimize_low_zoom: bool,
    pub vehicle_mask: u8,
}

impl TypeInfo {
    fn matches(&self, tags: &[(String, String)]) -> bool {
        !self.conditions.is_empty() && self.conditions.iter().all(|c| c.matches(tags))
    }

    pub fn is_routable(&self) -> bool {
        self.vehicle_mask != 0
    }
}

/// Feature values extracted from the tags of a classified object.
///
/// Two ways merge only when their feature values are fully equal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureValues {
    pub name: Option<String>,
    pub name_alt: Option<String>,
    pub reference: Option<String>,
    pub address_street: Option<String>,
    pub address_number: Option<String>,
    pub admin_level: Option<u8>,
    pub max_speed: Option<u8>,
    pub layer: i8,
    pub oneway: bool,
    pub roundabout: bool,
    pub bridge: bool,
    pub tunnel: bool,
    pub access_restricted: bool,
}

const HAS_NAME: u16 = 1 << 0;
const HAS_NAME_ALT: u16 = 1 << 1;
const HAS_REFERENCE: u16 = 1 << 2;
const HAS_STREET: u16 = 1 << 3;
const HAS_NUMBER: u16 = 1 << 4;
const HAS_ADMIN_LEVEL: u16 = 1 << 5;
const HAS_MAX_SPEED: u16 = 1 << 6;
const HAS_LAYER: u16 = 1 << 7;
const FLAG_ONEWAY: u16 = 1 << 8;
const FLAG_ROUNDABOUT: u16 = 1 << 9;
const FLAG_BRIDGE: u16 = 1 << 10;
const FLAG_TUNNEL: u16 = 1 << 11;
const FLAG_ACCESS_RESTRICTED: u16 = 1 << 12;

impl FeatureValues {
    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        let mut flags = 0u16;

        if self.name.is_some() {
            flags |= HAS_NAME;
        }
        if self.name_alt.is_some() {
            flags |= HAS_NAME_ALT;
        }
        if self.reference.is_some() {
            flags |= HAS_REFERENCE;
        }
        if self.address_street.is_some() {
            flags |= HAS_STREET;
        }
        if self.address_number.is_some() {
            flags |= HAS_NUMBER;
        }
        if self.admin_level.is_some() {
            flags |= HAS_ADMIN_LEVEL;
        }
        if self.max_speed.is_some() {
            flags |= HAS_MAX_SPEED;
        }
        if self.layer != 0 {
            flags |= HAS_LAYER;
        }
        if self.oneway {
            flags |= FLAG_ONEWAY;
        }
        if self.roundabout {
            flags |= FLAG_ROUNDABOUT;
        }
        if self.bridge {
            flags |= FLAG_BRIDGE;
        }
        if self.tunnel {
            flags |= FLAG_TUNNEL;
        }
        if self.access_restricted {
            flags |= FLAG_ACCESS_RESTRICTED;
        }

        writer.write_u16(flags)?;

        if let Some(name) = &self.name {
            writer.write_string(name)?;
        }
        if let Some(name_alt) = &self.name_alt {
            writer.write_string(name_alt)?;
        }
        if let Some(reference) = &self.reference {
            writer.write_string(reference)?;
        }
        if let Some(street) = &self.address_street {
            writer.write_string(street)?;
        }
        if let Some(number) = &self.address_number {
            writer.write_string(number)?;
        }
        if let Some(level) = self.admin_level {
            writer.write_u8(level)?;
        }
        if let Some(speed) = self.max_speed {
            writer.write_u8(speed)?;
        }
        if self.layer != 0 {
            writer.write_u8(self.layer as u8)?;
        }

        Ok(())
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        let flags = scanner.read_u16()?;
        let mut values = FeatureValues::default();

        if flags & HAS_NAME != 0 {
            values.name = Some(scanner.read_string()?);
        }
        if flags & HAS_NAME_ALT != 0 {
            values.name_alt = Some(scanner.read_string()?);
        }
        if flags & HAS_REFERENCE != 0 {
            values.reference = Some(scanner.read_string()?);
        }
        if flags & HAS_STREET != 0 {
            values.address_street = Some(scanner.read_string()?);
        }
        if flags & HAS_NUMBER != 0 {
            values.address_number = Some(scanner.read_string()?);
        }
        if flags & HAS_ADMIN_LEVEL != 0 {
            values.admin_level = Some(scanner.read_u8()?);
        }
        if flags & HAS_MAX_SPEED != 0 {
            values.max_speed = Some(scanner.read_u8()?);
        }
        if flags & HAS_LAYER != 0 {
            values.layer = scanner.read_u8()? as i8;
        }

        values.oneway = flags & FLAG_ONEWAY != 0;
        values.roundabout = flags & FLAG_ROUNDABOUT != 0;
        values.bridge = flags & FLAG_BRIDGE != 0;
        values.tunnel = flags & FLAG_TUNNEL != 0;
        values.access_restricted = flags & FLAG_ACCESS_RESTRICTED != 0;

        Ok(values)
    }
}

/// The parsed type catalogue plus the registered name-tag preference.
///
/// Types live in a dense vector; everything else refers to them by
/// [`TypeId`], so no reference cycles can form.
pub struct TypeConfig {
    types: Vec<TypeInfo>,
    name_tags: Vec<String>,
    name_alt_tags: Vec<String>,
}

impl TypeConfig {
    /// Load the catalogue file and register name tags per the configured
    /// language order ("#" denotes the untagged default)
    pub fn load(parameter: &ImportParameter) -> Result<Self> {
        let path = &parameter.type_file;
        let contents =
            std::fs::read_to_string(path).map_err(|e| ImportError::io(path, e))?;
        let file: CatalogueFile = serde_json::from_str(&contents)
            .map_err(|e| ImportError::format(path, e.to_string()))?;

        let mut types = Vec::with_capacity(file.types.len() + 1);
        types.push(TypeInfo {
            name: String::new(),
            index: TYPE_IGNORE,
            conditions: Vec::new(),
            can_be_node: false,
            can_be_way: false,
            can_be_area: false,
            can_be_relation: false,
            pin_way: false,
            multipolygon: false,
            ignore: true,
            admin_region: false,
            optimize_low_zoom: false,
            vehicle_mask: 0,
        });

        for def in file.types {
            let mut vehicle_mask = 0u8;
            for route in &def.routes {
                vehicle_mask |= match route.as_str() {
                    "foot" => crate::config::VEHICLE_FOOT,
                    "bicycle" => crate::config::VEHICLE_BICYCLE,
                    "car" => crate::config::VEHICLE_CAR,
                    other => {
                        return Err(ImportError::format(
                            path,
                            format!("unknown vehicle '{}' for type '{}'", other, def.name),
                        )
                        .into())
                    }
                };
            }

            let index = types.len() as TypeId;
            types.push(TypeInfo {
                name: def.name,
                index,
                conditions: def.conditions,
                can_be_node: def.can_be_node,
                can_be_way: def.can_be_way,
                can_be_area: def.can_be_area,
                can_be_relation: def.can_be_relation,
                pin_way: def.pin_way,
                multipolygon: def.multipolygon,
                ignore: def.ignore,
                admin_region: def.admin_region,
                optimize_low_zoom: def.optimize_low_zoom,
                vehicle_mask,
            });
        }

        let mut name_tags = Vec::new();
        let mut name_alt_tags = Vec::new();
        register_name_tags(&parameter.lang_order, &mut name_tags);
        register_name_tags(&parameter.alt_lang_order, &mut name_alt_tags);

        Ok(Self {
            types,
            name_tags,
            name_alt_tags,
        })
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn get(&self, id: TypeId) -> &TypeInfo {
        &self.types[id as usize]
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeInfo> {
        self.types.iter()
    }

    /// Resolve the type of a node from its tags
    pub fn node_type(&self, tags: &[(String, String)]) -> TypeId {
        self.first_matching(tags, |t| t.can_be_node)
    }

    /// Resolve both the way and the area interpretation of a way's tags
    pub fn way_area_types(&self, tags: &[(String, String)]) -> (TypeId, TypeId) {
        (
            self.first_matching(tags, |t| t.can_be_way),
            self.first_matching(tags, |t| t.can_be_area),
        )
    }

    /// Resolve the type of a relation from its tags
    pub fn relation_type(&self, tags: &[(String, String)]) -> TypeId {
        self.first_matching(tags, |t| t.can_be_relation || t.can_be_area)
    }

    fn first_matching(
        &self,
        tags: &[(String, String)],
        accept: impl Fn(&TypeInfo) -> bool,
    ) -> TypeId {
        self.types
            .iter()
            .skip(1)
            .find(|t| accept(t) && t.matches(tags))
            .map(|t| t.index)
            .unwrap_or(TYPE_IGNORE)
    }

    /// Extract feature values from tags, honouring the name-tag preference
    pub fn parse_features(&self, tags: &[(String, String)]) -> FeatureValues {
        let mut values = FeatureValues::default();

        values.name = self
            .name_tags
            .iter()
            .find_map(|tag| tag_value(tags, tag).map(str::to_string));
        values.name_alt = self
            .name_alt_tags
            .iter()
            .find_map(|tag| tag_value(tags, tag).map(str::to_string));
        values.reference = tag_value(tags, "ref").map(str::to_string);
        values.address_street = tag_value(tags, "addr:street").map(str::to_string);
        values.address_number = tag_value(tags, "addr:housenumber").map(str::to_string);
        values.admin_level = tag_value(tags, "admin_level").and_then(|v| v.parse().ok());
        values.max_speed = tag_value(tags, "maxspeed").and_then(parse_max_speed);
        values.layer = tag_value(tags, "layer")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        values.oneway = matches!(tag_value(tags, "oneway"), Some("yes") | Some("true") | Some("1"));
        values.roundabout = tag_value(tags, "junction") == Some("roundabout");
        values.bridge = matches!(tag_value(tags, "bridge"), Some(v) if v != "no");
        values.tunnel = matches!(tag_value(tags, "tunnel"), Some(v) if v != "no");
        values.access_restricted =
            matches!(tag_value(tags, "access"), Some("no") | Some("private"));

        values
    }

    /// Serialise the catalogue so every later stage can verify it is working
    /// against the same type indices and format generation
    pub fn write_dat<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = FileWriter::create(path)?;

        writer.write_u8(FORMAT_VERSION)?;
        writer.write_u32(self.types.len() as u32)?;

        for info in &self.types {
            writer.write_string(&info.name)?;

            let mut flags = 0u16;
            if info.can_be_node {
                flags |= 1 << 0;
            }
            if info.can_be_way {
                flags |= 1 << 1;
            }
            if info.can_be_area {
                flags |= 1 << 2;
            }
            if info.can_be_relation {
                flags |= 1 << 3;
            }
            if info.pin_way {
                flags |= 1 << 4;
            }
            if info.multipolygon {
                flags |= 1 << 5;
            }
            if info.ignore {
                flags |= 1 << 6;
            }
            if info.admin_region {
                flags |= 1 << 7;
            }
            if info.optimize_low_zoom {
                flags |= 1 << 8;
            }

            writer.write_u16(flags)?;
            writer.write_u8(info.vehicle_mask)?;
        }

        writer.close()
    }

    /// Check that a types.dat written earlier matches this catalogue
    pub fn verify_dat<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut scanner = FileScanner::open(path, false)?;

        let version = scanner.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(ImportError::format(
                path,
                format!("format version {} does not match {}", version, FORMAT_VERSION),
            )
            .into());
        }

        let count = scanner.read_u32()? as usize;
        if count != self.types.len() {
            return Err(ImportError::format(
                path,
                format!("catalogue has {} types, expected {}", count, self.types.len()),
            )
            .into());
        }

        for info in &self.types {
            let name = scanner.read_string()?;
            if name != info.name {
                return Err(ImportError::format(
                    path,
                    format!("type '{}' does not match catalogue entry '{}'", name, info.name),
                )
                .into());
            }
            scanner.read_u16()?;
            scanner.read_u8()?;
        }

        Ok(())
    }
}

fn register_name_tags(lang_order: &[String], target: &mut Vec<String>) {
    for lang in lang_order {
        if lang == "#" {
            target.push("name".to_string());
            target.push("place_name".to_string());
        } else {
            target.push(format!("name:{}", lang));
            target.push(format!("place_name:{}", lang));
        }
    }
}

/// Value of the first tag with the given key
pub fn tag_value<'a>(tags: &'a [(String, String)], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn parse_max_speed(value: &str) -> Option<u8> {
    // "50", "50 km/h" and "30 mph" all occur in the wild
    let trimmed = value.trim();

    if let Some(mph) = trimmed.strip_suffix("mph") {
        let speed: f64 = mph.trim().parse().ok()?;
        return Some((speed * 1.609).round().min(255.0) as u8);
    }

    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    let speed: u64 = digits.parse().ok()?;
    Some(speed.min(255) as u8)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::ImportParameter;
    use std::path::Path;

    /// Catalogue with a handful of representative types, written as JSON the
    /// way a real run would load it
    pub fn write_test_catalogue(path: &Path) {
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
                },
                {
                    "name": "boundary_administrative",
                    "conditions": [{"key": "boundary", "values": ["administrative"]}],
                    "can_be_area": true,
                    "can_be_relation": true,
                    "multipolygon": true,
                    "admin_region": true
                }
            ]
        });
        std::fs::write(path, serde_json::to_string_pretty(&catalogue).unwrap()).unwrap();
    }

    pub fn load_test_config(dir: &Path) -> (ImportParameter, TypeConfig) {
        let type_file = dir.join("map.ost");
        write_test_catalogue(&type_file);

        let parameter = ImportParameter {
            type_file,
            destination_directory: dir.to_path_buf(),
            ..Default::default()
        };
        let config = TypeConfig::load(&parameter).unwrap();
        (parameter, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn types_resolve_by_tag_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let (_, config) = test_support::load_test_config(dir.path());

        let node_type = config.node_type(&tags(&[("amenity", "cafe")]));
        assert_eq!(config.get(node_type).name, "amenity_cafe");

        let (way_type, area_type) =
            config.way_area_types(&tags(&[("highway", "residential")]));
        assert_eq!(config.get(way_type).name, "highway_residential");
        assert_eq!(area_type, TYPE_IGNORE);

        let (way_type, area_type) = config.way_area_types(&tags(&[("natural", "water")]));
        assert_eq!(way_type, TYPE_IGNORE);
        assert_eq!(config.get(area_type).name, "natural_water");

        assert_eq!(config.node_type(&tags(&[("foo", "bar")])), TYPE_IGNORE);
    }

    #[test]
    fn features_parse_from_tags() {
        let dir = tempfile::tempdir().unwrap();
        let (_, config) = test_support::load_test_config(dir.path());

        let values = config.parse_features(&tags(&[
            ("name", "High Street"),
            ("maxspeed", "30"),
            ("oneway", "yes"),
            ("layer", "-1"),
        ]));

        assert_eq!(values.name.as_deref(), Some("High Street"));
        assert_eq!(values.max_speed, Some(30));
        assert!(values.oneway);
        assert_eq!(values.layer, -1);
    }

    #[test]
    fn max_speed_units() {
        assert_eq!(parse_max_speed("50"), Some(50));
        assert_eq!(parse_max_speed("50 km/h"), Some(50));
        assert_eq!(parse_max_speed("30 mph"), Some(48));
        assert_eq!(parse_max_speed("none"), None);
    }

    #[test]
    fn feature_values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.dat");

        let values = FeatureValues {
            name: Some("Ringstrasse".to_string()),
            max_speed: Some(50),
            layer: 1,
            oneway: true,
            bridge: true,
            ..Default::default()
        };

        let mut writer = FileWriter::create(&path).unwrap();
        values.write_to(&mut writer).unwrap();
        FeatureValues::default().write_to(&mut writer).unwrap();
        writer.close().unwrap();

        let mut scanner = FileScanner::open(&path, false).unwrap();
        assert_eq!(FeatureValues::read_from(&mut scanner).unwrap(), values);
        assert_eq!(
            FeatureValues::read_from(&mut scanner).unwrap(),
            FeatureValues::default()
        );
    }

    #[test]
    fn catalogue_dat_round_trips_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let (_, config) = test_support::load_test_config(dir.path());
        let path = dir.path().join("types.dat");

        config.write_dat(&path).unwrap();
        config.verify_dat(&path).unwrap();

        // corrupting the version byte must be detected
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = 99;
        std::fs::write(&path, bytes).unwrap();
        assert!(config.verify_dat(&path).is_err());
    }
}
