use super::{Callback, RawBlockData, RawNodeData, RawRelationData, RawWayData, BLOCK_SIZE};
use crate::geom::GeoCoord;
use crate::progress::Progress;
use crate::records::{MemberKind, OsmId, RelationMember};
use crate::{ImportError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;

/// Streaming front-end for `.osm` XML inputs.
///
/// Primitives with unparsable attributes are reported and dropped; broken
/// XML structure is fatal.
pub fn parse(path: &Path, progress: &dyn Progress, callback: &mut Callback) -> Result<()> {
    let mut reader = Reader::from_file(path)
        .map_err(|e| ImportError::format(path, e.to_string()))?;

    let mut parser = XmlParser {
        progress,
        block: RawBlockData::default(),
        current: Current::None,
    };

    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            ImportError::format(
                path,
                format!("XML error at byte {}: {}", reader.buffer_position(), e),
            )
        })?;

        match event {
            Event::Start(e) => parser.handle_element(&e, false, callback)?,
            Event::Empty(e) => parser.handle_element(&e, true, callback)?,
            Event::End(e) => parser.handle_end(e.name().as_ref(), callback)?,
            Event::Eof => break,
            _ => {}
        }

        buf.clear();
    }

    parser.finish(callback)
}

enum Current {
    None,
    Node(RawNodeData),
    Way(RawWayData),
    Relation(RawRelationData),
    /// A primitive with broken attributes; children are ignored until its end
    Skip,
}

struct XmlParser<'a> {
    progress: &'a dyn Progress,
    block: RawBlockData,
    current: Current,
}

impl<'a> XmlParser<'a> {
    fn handle_element(
        &mut self,
        element: &BytesStart,
        self_closing: bool,
        callback: &mut Callback,
    ) -> Result<()> {
        match element.name().as_ref() {
            b"node" => {
                match self.parse_node(element) {
                    Some(node) => {
                        if self_closing {
                            self.block.nodes.push(node);
                            self.flush_if_full(callback)?;
                        } else {
                            self.current = Current::Node(node);
                        }
                    }
                    None => {
                        self.progress
                            .warning("Dropping node without valid id/lat/lon");
                        if !self_closing {
                            self.current = Current::Skip;
                        }
                    }
                }
            }
            b"way" => match self.parse_id(element) {
                Some(id) => {
                    let way = RawWayData {
                        id,
                        tags: Vec::new(),
                        node_ids: Vec::new(),
                    };
                    if self_closing {
                        self.block.ways.push(way);
                        self.flush_if_full(callback)?;
                    } else {
                        self.current = Current::Way(way);
                    }
                }
                None => {
                    self.progress.warning("Dropping way without valid id");
                    if !self_closing {
                        self.current = Current::Skip;
                    }
                }
            },
            b"relation" => match self.parse_id(element) {
                Some(id) => {
                    let relation = RawRelationData {
                        id,
                        tags: Vec::new(),
                        members: Vec::new(),
                    };
                    if self_closing {
                        self.block.relations.push(relation);
                        self.flush_if_full(callback)?;
                    } else {
                        self.current = Current::Relation(relation);
                    }
                }
                None => {
                    self.progress.warning("Dropping relation without valid id");
                    if !self_closing {
                        self.current = Current::Skip;
                    }
                }
            },
            b"tag" => {
                if let Some((key, value)) = self.parse_tag(element) {
                    match &mut self.current {
                        Current::Node(node) => node.tags.push((key, value)),
                        Current::Way(way) => way.tags.push((key, value)),
                        Current::Relation(relation) => relation.tags.push((key, value)),
                        _ => {}
                    }
                }
            }
            b"nd" => {
                let node_ref = self.attribute_i64(element, b"ref");
                if let Current::Way(way) = &mut self.current {
                    match node_ref {
                        Some(node_id) => way.node_ids.push(node_id),
                        None => self
                            .progress
                            .warning(&format!("Way {} references an invalid node", way.id)),
                    }
                }
            }
            b"member" => {
                if let Current::Relation(relation) = &mut self.current {
                    match Self::parse_member(element) {
                        Some(member) => relation.members.push(member),
                        None => self.progress.warning(&format!(
                            "Relation {} has a member without valid type/ref",
                            relation.id
                        )),
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn handle_end(&mut self, name: &[u8], callback: &mut Callback) -> Result<()> {
        if !matches!(name, b"node" | b"way" | b"relation") {
            return Ok(());
        }

        match std::mem::replace(&mut self.current, Current::None) {
            Current::Node(node) => self.block.nodes.push(node),
            Current::Way(way) => self.block.ways.push(way),
            Current::Relation(relation) => self.block.relations.push(relation),
            Current::None | Current::Skip => return Ok(()),
        }

        self.flush_if_full(callback)
    }

    fn flush_if_full(&mut self, callback: &mut Callback) -> Result<()> {
        if self.block.len() >= BLOCK_SIZE {
            let block = std::mem::take(&mut self.block);
            callback.process_block(block)?;
        }
        Ok(())
    }

    fn finish(mut self, callback: &mut Callback) -> Result<()> {
        if !self.block.is_empty() {
            let block = std::mem::take(&mut self.block);
            callback.process_block(block)?;
        }
        Ok(())
    }

    fn attribute(&self, element: &BytesStart, name: &[u8]) -> Option<String> {
        for attr in element.attributes() {
            let attr = attr.ok()?;
            if attr.key.as_ref() == name {
                return attr.unescape_value().ok().map(|v| v.into_owned());
            }
        }
        None
    }

    fn attribute_i64(&self, element: &BytesStart, name: &[u8]) -> Option<i64> {
        self.attribute(element, name)?.parse().ok()
    }

    fn attribute_f64(&self, element: &BytesStart, name: &[u8]) -> Option<f64> {
        self.attribute(element, name)?.parse().ok()
    }

    fn parse_id(&self, element: &BytesStart) -> Option<OsmId> {
        self.attribute_i64(element, b"id")
    }

    fn parse_node(&self, element: &BytesStart) -> Option<RawNodeData> {
        Some(RawNodeData {
            id: self.attribute_i64(element, b"id")?,
            coord: GeoCoord::new(
                self.attribute_f64(element, b"lat")?,
                self.attribute_f64(element, b"lon")?,
            ),
            tags: Vec::new(),
        })
    }

    fn parse_tag(&self, element: &BytesStart) -> Option<(String, String)> {
        Some((
            self.attribute(element, b"k")?,
            self.attribute(element, b"v")?,
        ))
    }

    fn parse_member(element: &BytesStart) -> Option<RelationMember> {
        let mut kind = None;
        let mut id = None;
        let mut role = String::new();

        for attr in element.attributes() {
            let attr = attr.ok()?;
            match attr.key.as_ref() {
                b"type" => {
                    kind = match attr.unescape_value().ok()?.as_ref() {
                        "node" => Some(MemberKind::Node),
                        "way" => Some(MemberKind::Way),
                        "relation" => Some(MemberKind::Relation),
                        _ => None,
                    };
                }
                b"ref" => {
                    id = attr.unescape_value().ok()?.parse().ok();
                }
                b"role" => {
                    role = attr.unescape_value().ok()?.into_owned();
                }
                _ => {}
            }
        }

        Some(RelationMember {
            kind: kind?,
            role,
            id: id?,
        })
    }
}
