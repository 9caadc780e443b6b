use crate::config::ImportParameter;
use crate::fileio::{FileScanner, FileWriter};
use crate::records::{Area, Node, ObjectRef, Way};
use crate::stages::sort_objects::{AREAS_DAT, NODES_DAT, WAYS_DAT};
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};

pub const TEXTLOC_IDX: &str = "textloc.idx";

/// Stage 24 (optional): full-text index over object names, keyed by
/// lowercased tokens
pub struct TextIndexStage;

impl Stage for TextIndexStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("TextIndex", "Generate full-text index over names")
            .requires(NODES_DAT)
            .requires(WAYS_DAT)
            .requires(AREAS_DAT)
            .provides_optional(TEXTLOC_IDX)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        let parameter = &ctx.parameter;

        if !parameter.text_index {
            ctx.progress
                .info("Text index generation is disabled, skipping");
            return Ok(());
        }

        let mut tokens: BTreeMap<String, BTreeSet<ObjectRef>> = BTreeMap::new();

        ctx.progress.set_action("Tokenizing node names");
        let mut scanner =
            FileScanner::open(parameter.file_in_destination(NODES_DAT), false)?;
        let count = scanner.read_u32()?;
        for _ in 0..count {
            ctx.check_aborted()?;
            let node = Node::read_from(&mut scanner)?;
            index_names(
                &mut tokens,
                ObjectRef::node(node.id),
                [node.features.name.as_deref(), node.features.name_alt.as_deref()],
            );
        }

        ctx.progress.set_action("Tokenizing way names");
        let mut scanner = FileScanner::open(
            parameter.file_in_destination(WAYS_DAT),
            parameter.way_data_memory_mapped,
        )?;
        let count = scanner.read_u32()?;
        for _ in 0..count {
            ctx.check_aborted()?;
            let way = Way::read_from(&mut scanner)?;
            index_names(
                &mut tokens,
                ObjectRef::way(way.id),
                [way.features.name.as_deref(), way.features.name_alt.as_deref()],
            );
        }

        ctx.progress.set_action("Tokenizing area names");
        let mut scanner = FileScanner::open(
            parameter.file_in_destination(AREAS_DAT),
            parameter.area_data_memory_mapped,
        )?;
        let count = scanner.read_u32()?;
        for _ in 0..count {
            ctx.check_aborted()?;
            let area = Area::read_from(&mut scanner)?;
            index_names(
                &mut tokens,
                ObjectRef::area(area.id),
                [area.features.name.as_deref(), area.features.name_alt.as_deref()],
            );
        }

        ctx.progress
            .set_action(&format!("Writing '{}'", TEXTLOC_IDX));

        let mut writer = FileWriter::create(parameter.file_in_destination(TEXTLOC_IDX))?;
        writer.write_u32(tokens.len() as u32)?;

        for (token, refs) in &tokens {
            writer.write_string(token)?;
            writer.write_unsigned(refs.len() as u64)?;
            for object in refs {
                object.write_to(&mut writer)?;
            }
        }

        writer.close()?;

        ctx.progress
            .info(&format!("{} name tokens indexed", tokens.len()));
        Ok(())
    }
}

fn index_names<'a>(
    tokens: &mut BTreeMap<String, BTreeSet<ObjectRef>>,
    object: ObjectRef,
    names: impl IntoIterator<Item = Option<&'a str>>,
) {
    for name in names.into_iter().flatten() {
        for token in name.split_whitespace() {
            let token = token.to_lowercase();
            if token.is_empty() {
                continue;
            }
            tokens.entry(token).or_default().insert(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_split_into_lowercased_tokens() {
        let mut tokens = BTreeMap::new();
        index_names(
            &mut tokens,
            ObjectRef::way(7),
            [Some("Unter den Linden"), None],
        );

        assert_eq!(tokens.len(), 3);
        assert!(tokens.contains_key("unter"));
        assert!(tokens.contains_key("den"));
        assert!(tokens["linden"].contains(&ObjectRef::way(7)));
    }
}
