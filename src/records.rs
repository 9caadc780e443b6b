use crate::fileio::{FileScanner, FileWriter};
use crate::geom::GeoCoord;
use crate::types::{FeatureValues, TypeId};
use crate::{ImportError, Result};

/// Identifier of a primitive inside the OSM input; unique per primitive kind
pub type OsmId = i64;

/// Raw coordinate emitted for every input node
#[derive(Debug, Clone, PartialEq)]
pub struct RawCoord {
    pub id: OsmId,
    pub coord: GeoCoord,
}

impl RawCoord {
    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_signed(self.id)?;
        writer.write_coord(self.coord)
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        Ok(Self {
            id: scanner.read_signed()?,
            coord: scanner.read_coord()?,
        })
    }
}

/// Typed node that survived classification
#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub id: OsmId,
    pub type_id: TypeId,
    pub coord: GeoCoord,
    pub features: FeatureValues,
}

impl RawNode {
    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_signed(self.id)?;
        writer.write_unsigned(self.type_id as u64)?;
        writer.write_coord(self.coord)?;
        self.features.write_to(writer)
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        Ok(Self {
            id: scanner.read_signed()?,
            type_id: scanner.read_unsigned()? as TypeId,
            coord: scanner.read_coord()?,
            features: FeatureValues::read_from(scanner)?,
        })
    }
}

/// Classified way or area; both share the raw way file
#[derive(Debug, Clone, PartialEq)]
pub struct RawWay {
    pub id: OsmId,
    pub type_id: TypeId,
    pub is_area: bool,
    pub features: FeatureValues,
    pub node_ids: Vec<OsmId>,
}

impl RawWay {
    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_signed(self.id)?;
        writer.write_unsigned(self.type_id as u64)?;
        writer.write_u8(self.is_area as u8)?;
        self.features.write_to(writer)?;
        write_id_list(writer, &self.node_ids)
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        Ok(Self {
            id: scanner.read_signed()?,
            type_id: scanner.read_unsigned()? as TypeId,
            is_area: scanner.read_u8()? != 0,
            features: FeatureValues::read_from(scanner)?,
            node_ids: read_id_list(scanner)?,
        })
    }
}

/// Kind of a relation member reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Node,
    Way,
    Relation,
}

impl MemberKind {
    fn to_u8(self) -> u8 {
        match self {
            MemberKind::Node => 0,
            MemberKind::Way => 1,
            MemberKind::Relation => 2,
        }
    }

    fn from_u8(value: u8, path: &std::path::Path) -> Result<Self> {
        match value {
            0 => Ok(MemberKind::Node),
            1 => Ok(MemberKind::Way),
            2 => Ok(MemberKind::Relation),
            other => {
                Err(ImportError::format(path, format!("invalid member kind {}", other)).into())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMember {
    pub kind: MemberKind,
    pub role: String,
    pub id: OsmId,
}

/// Relation emitted for multipolygon processing
#[derive(Debug, Clone, PartialEq)]
pub struct RawRelation {
    pub id: OsmId,
    pub type_id: TypeId,
    pub features: FeatureValues,
    pub members: Vec<RelationMember>,
}

impl RawRelation {
    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_signed(self.id)?;
        writer.write_unsigned(self.type_id as u64)?;
        self.features.write_to(writer)?;
        writer.write_unsigned(self.members.len() as u64)?;

        for member in &self.members {
            writer.write_u8(member.kind.to_u8())?;
            writer.write_string(&member.role)?;
            writer.write_signed(member.id)?;
        }

        Ok(())
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        let id = scanner.read_signed()?;
        let type_id = scanner.read_unsigned()? as TypeId;
        let features = FeatureValues::read_from(scanner)?;
        let count = scanner.read_unsigned()? as usize;

        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = MemberKind::from_u8(scanner.read_u8()?, scanner.path())?;
            let role = scanner.read_string()?;
            let member_id = scanner.read_signed()?;
            members.push(RelationMember {
                kind,
                role,
                id: member_id,
            });
        }

        Ok(Self {
            id,
            type_id,
            features,
            members,
        })
    }
}

/// Coastline projection of a way tagged natural=coastline
#[derive(Debug, Clone, PartialEq)]
pub struct RawCoastline {
    pub id: OsmId,
    pub is_area: bool,
    pub node_ids: Vec<OsmId>,
}

impl RawCoastline {
    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_signed(self.id)?;
        writer.write_u8(self.is_area as u8)?;
        write_id_list(writer, &self.node_ids)
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        Ok(Self {
            id: scanner.read_signed()?,
            is_area: scanner.read_u8()? != 0,
            node_ids: read_id_list(scanner)?,
        })
    }
}

/// Whether a restriction mandates or forbids the from-via-to manoeuvre
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionKind {
    Allow,
    Forbid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnRestriction {
    pub kind: RestrictionKind,
    pub from_way: OsmId,
    pub via_node: OsmId,
    pub to_way: OsmId,
}

impl TurnRestriction {
    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_u8(match self.kind {
            RestrictionKind::Allow => 0,
            RestrictionKind::Forbid => 1,
        })?;
        writer.write_signed(self.from_way)?;
        writer.write_signed(self.via_node)?;
        writer.write_signed(self.to_way)
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        let kind = match scanner.read_u8()? {
            0 => RestrictionKind::Allow,
            1 => RestrictionKind::Forbid,
            other => {
                return Err(ImportError::format(
                    scanner.path(),
                    format!("invalid restriction kind {}", other),
                )
                .into())
            }
        };

        Ok(Self {
            kind,
            from_way: scanner.read_signed()?,
            via_node: scanner.read_signed()?,
            to_way: scanner.read_signed()?,
        })
    }
}

/// A node of a final way, keeping its OSM id for junction detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WayNode {
    pub id: OsmId,
    pub coord: GeoCoord,
}

/// Final way with resolved geometry
#[derive(Debug, Clone, PartialEq)]
pub struct Way {
    pub id: u64,
    pub type_id: TypeId,
    pub features: FeatureValues,
    pub nodes: Vec<WayNode>,
}

impl Way {
    pub fn bounding_box(&self) -> crate::geom::GeoBox {
        let mut bbox = crate::geom::GeoBox::new();
        for node in &self.nodes {
            bbox.include(node.coord);
        }
        bbox
    }

    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_unsigned(self.id)?;
        writer.write_unsigned(self.type_id as u64)?;
        self.features.write_to(writer)?;
        writer.write_unsigned(self.nodes.len() as u64)?;

        let mut last_id = 0;
        for node in &self.nodes {
            writer.write_signed(node.id - last_id)?;
            writer.write_coord(node.coord)?;
            last_id = node.id;
        }

        Ok(())
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        let id = scanner.read_unsigned()?;
        let type_id = scanner.read_unsigned()? as TypeId;
        let features = FeatureValues::read_from(scanner)?;
        let count = scanner.read_unsigned()? as usize;

        let mut nodes = Vec::with_capacity(count);
        let mut last_id = 0;
        for _ in 0..count {
            let node_id = last_id + scanner.read_signed()?;
            let coord = scanner.read_coord()?;
            nodes.push(WayNode {
                id: node_id,
                coord,
            });
            last_id = node_id;
        }

        Ok(Self {
            id,
            type_id,
            features,
            nodes,
        })
    }
}

/// Role of a ring inside an area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRole {
    Outer,
    Inner,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ring {
    pub role: RingRole,
    pub coords: Vec<GeoCoord>,
}

/// Final area as a polygon with optional holes
#[derive(Debug, Clone, PartialEq)]
pub struct Area {
    pub id: u64,
    pub type_id: TypeId,
    pub features: FeatureValues,
    pub rings: Vec<Ring>,
}

impl Area {
    pub fn outer_ring(&self) -> Option<&Ring> {
        self.rings.iter().find(|r| r.role == RingRole::Outer)
    }

    pub fn bounding_box(&self) -> crate::geom::GeoBox {
        let mut bbox = crate::geom::GeoBox::new();
        for ring in &self.rings {
            for coord in &ring.coords {
                bbox.include(*coord);
            }
        }
        bbox
    }

    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_unsigned(self.id)?;
        writer.write_unsigned(self.type_id as u64)?;
        self.features.write_to(writer)?;
        writer.write_unsigned(self.rings.len() as u64)?;

        for ring in &self.rings {
            writer.write_u8(match ring.role {
                RingRole::Outer => 0,
                RingRole::Inner => 1,
            })?;
            writer.write_unsigned(ring.coords.len() as u64)?;
            for coord in &ring.coords {
                writer.write_coord(*coord)?;
            }
        }

        Ok(())
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        let id = scanner.read_unsigned()?;
        let type_id = scanner.read_unsigned()? as TypeId;
        let features = FeatureValues::read_from(scanner)?;
        let ring_count = scanner.read_unsigned()? as usize;

        let mut rings = Vec::with_capacity(ring_count);
        for _ in 0..ring_count {
            let role = match scanner.read_u8()? {
                0 => RingRole::Outer,
                1 => RingRole::Inner,
                other => {
                    return Err(ImportError::format(
                        scanner.path(),
                        format!("invalid ring role {}", other),
                    )
                    .into())
                }
            };
            let count = scanner.read_unsigned()? as usize;
            let mut coords = Vec::with_capacity(count);
            for _ in 0..count {
                coords.push(scanner.read_coord()?);
            }
            rings.push(Ring { role, coords });
        }

        Ok(Self {
            id,
            type_id,
            features,
            rings,
        })
    }
}

/// Final typed node
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: u64,
    pub type_id: TypeId,
    pub features: FeatureValues,
    pub coord: GeoCoord,
}

impl Node {
    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_unsigned(self.id)?;
        writer.write_unsigned(self.type_id as u64)?;
        self.features.write_to(writer)?;
        writer.write_coord(self.coord)
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        Ok(Self {
            id: scanner.read_unsigned()?,
            type_id: scanner.read_unsigned()? as TypeId,
            features: FeatureValues::read_from(scanner)?,
            coord: scanner.read_coord()?,
        })
    }
}

/// Kind+id reference into the final object files
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Node,
    Way,
    Area,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: u64,
}

impl ObjectRef {
    pub fn node(id: u64) -> Self {
        Self {
            kind: ObjectKind::Node,
            id,
        }
    }

    pub fn way(id: u64) -> Self {
        Self {
            kind: ObjectKind::Way,
            id,
        }
    }

    pub fn area(id: u64) -> Self {
        Self {
            kind: ObjectKind::Area,
            id,
        }
    }

    pub fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
        writer.write_u8(match self.kind {
            ObjectKind::Node => 0,
            ObjectKind::Way => 1,
            ObjectKind::Area => 2,
        })?;
        writer.write_unsigned(self.id)
    }

    pub fn read_from(scanner: &mut FileScanner) -> Result<Self> {
        let kind = match scanner.read_u8()? {
            0 => ObjectKind::Node,
            1 => ObjectKind::Way,
            2 => ObjectKind::Area,
            other => {
                return Err(ImportError::format(
                    scanner.path(),
                    format!("invalid object kind {}", other),
                )
                .into())
            }
        };
        Ok(Self {
            kind,
            id: scanner.read_unsigned()?,
        })
    }
}

fn write_id_list(writer: &mut FileWriter, ids: &[OsmId]) -> Result<()> {
    writer.write_unsigned(ids.len() as u64)?;

    // delta encoding keeps consecutive node references small
    let mut last = 0;
    for id in ids {
        writer.write_signed(id - last)?;
        last = *id;
    }

    Ok(())
}

fn read_id_list(scanner: &mut FileScanner) -> Result<Vec<OsmId>> {
    let count = scanner.read_unsigned()? as usize;
    let mut ids = Vec::with_capacity(count);

    let mut last = 0;
    for _ in 0..count {
        let id = last + scanner.read_signed()?;
        ids.push(id);
        last = id;
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_read<T>(
        value: &T,
        write: impl Fn(&T, &mut FileWriter) -> Result<()>,
        read: impl Fn(&mut FileScanner) -> Result<T>,
    ) -> T {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.dat");

        let mut writer = FileWriter::create(&path).unwrap();
        write(value, &mut writer).unwrap();
        writer.close().unwrap();

        let mut scanner = FileScanner::open(&path, false).unwrap();
        let result = read(&mut scanner).unwrap();
        assert!(scanner.is_eof());
        result
    }

    #[test]
    fn raw_way_round_trips() {
        let way = RawWay {
            id: 4711,
            type_id: 3,
            is_area: false,
            features: FeatureValues {
                name: Some("Kastanienallee".to_string()),
                oneway: true,
                ..Default::default()
            },
            node_ids: vec![100, 101, 99, 250],
        };

        let read = write_read(&way, RawWay::write_to, RawWay::read_from);
        assert_eq!(read, way);
    }

    #[test]
    fn raw_relation_round_trips() {
        let relation = RawRelation {
            id: -12,
            type_id: 2,
            features: FeatureValues::default(),
            members: vec![
                RelationMember {
                    kind: MemberKind::Way,
                    role: "outer".to_string(),
                    id: 7,
                },
                RelationMember {
                    kind: MemberKind::Node,
                    role: "admin_centre".to_string(),
                    id: 5,
                },
            ],
        };

        let read = write_read(&relation, RawRelation::write_to, RawRelation::read_from);
        assert_eq!(read, relation);
    }

    #[test]
    fn turn_restriction_round_trips() {
        let restriction = TurnRestriction {
            kind: RestrictionKind::Forbid,
            from_way: 1,
            via_node: 2,
            to_way: 3,
        };

        let read = write_read(
            &restriction,
            TurnRestriction::write_to,
            TurnRestriction::read_from,
        );
        assert_eq!(read, restriction);
    }

    #[test]
    fn area_round_trips_with_rings() {
        let area = Area {
            id: 9,
            type_id: 2,
            features: FeatureValues::default(),
            rings: vec![
                Ring {
                    role: RingRole::Outer,
                    coords: vec![
                        GeoCoord::new(0.0, 0.0),
                        GeoCoord::new(0.0, 1.0),
                        GeoCoord::new(1.0, 1.0),
                    ],
                },
                Ring {
                    role: RingRole::Inner,
                    coords: vec![
                        GeoCoord::new(0.2, 0.2),
                        GeoCoord::new(0.2, 0.4),
                        GeoCoord::new(0.4, 0.4),
                    ],
                },
            ],
        };

        let read = write_read(&area, Area::write_to, Area::read_from);
        assert_eq!(read.rings.len(), 2);
        assert_eq!(read.rings[0].role, RingRole::Outer);
        assert_eq!(read.id, area.id);
    }
}
