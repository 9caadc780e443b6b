use crate::config::ImportParameter;
use crate::stages::{Stage, StageContext, StageDescription};
use crate::Result;

pub const TYPES_DAT: &str = "types.dat";

/// Stage 1: serialise the parsed type catalogue.
///
/// Every later stage that reads typed records verifies this file, so a
/// partial re-run against files from an incompatible format generation
/// fails fast instead of producing garbage.
pub struct TypeDataStage;

impl Stage for TypeDataStage {
    fn describe(&self, _parameter: &ImportParameter) -> StageDescription {
        StageDescription::new("TypeData", "Serialize the type catalogue")
            .provides(TYPES_DAT)
    }

    fn run(&self, ctx: &StageContext) -> Result<()> {
        ctx.progress
            .set_action(&format!("Writing '{}'", TYPES_DAT));

        ctx.type_config
            .write_dat(ctx.parameter.file_in_destination(TYPES_DAT))?;

        ctx.progress.info(&format!(
            "{} types written",
            ctx.type_config.type_count()
        ));
        Ok(())
    }
}
