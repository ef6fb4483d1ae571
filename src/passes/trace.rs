use anyhow::Result;
use rand::rngs::StdRng;
use tracing::debug;

use super::{ClassScope, FinishContext, Pass, PassContext, PassKind, PassStats};
use crate::classfile::ClassFile;

/// Logs what the pipeline visits and leaves every class untouched.
#[derive(Debug, Default)]
pub struct TracePass;

impl Pass for TracePass {
    fn kind(&self) -> PassKind {
        PassKind::Trace
    }

    fn init(&mut self, ctx: &PassContext<'_>, _rng: &mut StdRng) -> Result<()> {
        debug!(
            classes = ctx.classes.len(),
            main_class = ctx.main_class.unwrap_or("-"),
            "trace: init"
        );
        Ok(())
    }

    fn transform(&self, class: &mut ClassFile, scope: &mut ClassScope) -> Result<PassStats> {
        debug!(
            index = scope.index,
            class = %scope.class_name,
            methods = class.methods.len(),
            fields = class.fields.len(),
            "trace: visit"
        );
        Ok(PassStats::default())
    }

    fn finish(&mut self, ctx: &FinishContext<'_>) -> Result<()> {
        debug!(classes = ctx.classes, stats = ?ctx.stats, "trace: finish");
        Ok(())
    }
}
