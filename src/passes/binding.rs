use anyhow::{Context, Result};
use rand::rngs::StdRng;
use tracing::info;

use super::{prepend_to_main, require_main_class, ClassScope, Pass, PassContext, PassKind, PassStats};
use crate::classfile::ClassFile;
use crate::runtime::{self, CHECK_LAUNCH_DIR, CHECK_MACHINE, CHECK_STRING_DESCRIPTOR, GUARD_CLASS};

/// Ties the application to one machine fingerprint and/or one launch directory.
#[derive(Debug, Clone, Default)]
pub struct BindingPass {
    expected_hash: Option<String>,
    expected_dir: Option<String>,
    main_class: String,
    guard: String,
}

impl BindingPass {
    pub fn new(expected_hash: Option<String>, expected_dir: Option<String>) -> Self {
        Self {
            expected_hash: expected_hash.map(|h| h.trim().to_ascii_lowercase()),
            expected_dir,
            ..Default::default()
        }
    }
}

impl Pass for BindingPass {
    fn kind(&self) -> PassKind {
        PassKind::Binding
    }

    fn init(&mut self, ctx: &PassContext<'_>, _rng: &mut StdRng) -> Result<()> {
        if self.expected_hash.is_none() && self.expected_dir.is_none() {
            anyhow::bail!("Binding needs a machine hash or a launch directory");
        }
        if let Some(hash) = &self.expected_hash
            && (hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()))
        {
            anyhow::bail!("Machine hash must be 64 hex characters: {hash}");
        }
        self.main_class = require_main_class(ctx, self.kind())?;
        self.guard = runtime::runtime_class_name(ctx.runtime_package, GUARD_CLASS);
        info!(main_class = %self.main_class, "binding checks go into main");
        Ok(())
    }

    fn transform(&self, class: &mut ClassFile, _scope: &mut ClassScope) -> Result<PassStats> {
        let guarded = prepend_to_main(class, &self.main_class, 1, |e| {
            if let Some(hash) = &self.expected_hash {
                e.string(hash)?
                    .invoke_static(&self.guard, CHECK_MACHINE, CHECK_STRING_DESCRIPTOR)?;
            }
            if let Some(dir) = &self.expected_dir {
                e.string(dir)?
                    .invoke_static(&self.guard, CHECK_LAUNCH_DIR, CHECK_STRING_DESCRIPTOR)?;
            }
            Ok(())
        })
        .with_context(|| format!("Failed to add binding checks to {}", self.main_class))?;
        Ok(PassStats {
            guarded_entry_points: usize::from(guarded),
            ..Default::default()
        })
    }

    fn runtime_classes(&self) -> Result<Vec<ClassFile>> {
        if self.guard.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![runtime::guard(&self.guard)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{op, Insn};
    use crate::passes::testing::app_class;
    use rand::SeedableRng;

    const HASH: &str = "ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12";

    fn init(pass: &mut BindingPass, classes: &[ClassFile], main: Option<&str>) -> Result<()> {
        let ctx = PassContext {
            classes,
            main_class: main,
            runtime_package: "rt",
        };
        pass.init(&ctx, &mut StdRng::seed_from_u64(0))
    }

    #[test]
    fn checks_are_prepended_to_main_only() -> Result<()> {
        let mut app = app_class("demo/App")?;
        let mut other = app_class("demo/Other")?;
        let mut pass = BindingPass::new(Some(HASH.to_uppercase()), Some("/opt/app".into()));
        init(&mut pass, &[app.clone(), other.clone()], Some("demo/App"))?;

        let mut scope = ClassScope {
            index: 0,
            class_name: "demo/App".into(),
            rng: StdRng::seed_from_u64(0),
        };
        assert_eq!(pass.transform(&mut app, &mut scope)?.guarded_entry_points, 1);
        assert_eq!(pass.transform(&mut other, &mut scope)?.guarded_entry_points, 0);

        let idx = app.find_method("main", "([Ljava/lang/String;)V").unwrap();
        let insns = &app.methods[idx].code.as_ref().unwrap().insns;
        let calls: Vec<String> = insns
            .iter()
            .filter_map(|i| match i {
                Insn::Invoke { opcode: op::INVOKESTATIC, index } => app.pool.member_ref(*index).ok(),
                _ => None,
            })
            .map(|m| format!("{}.{}", m.owner, m.name))
            .collect();
        assert_eq!(calls, ["rt/Guard.checkMachine", "rt/Guard.checkLaunchDir"]);
        let Insn::Ldc { index } = insns[0] else {
            panic!("expected the hash literal first");
        };
        assert_eq!(
            app.pool.utf8(app.pool.string_utf8_index(index)?)?,
            HASH,
            "hash is normalized to lowercase"
        );

        let runtime = pass.runtime_classes()?;
        assert_eq!(runtime[0].this_name()?, "rt/Guard");
        Ok(())
    }

    #[test]
    fn init_rejects_bad_setups() -> Result<()> {
        let classes = vec![app_class("demo/App")?];
        let mut none = BindingPass::new(None, None);
        assert!(init(&mut none, &classes, Some("demo/App")).is_err());

        let mut short = BindingPass::new(Some("abc".into()), None);
        assert!(init(&mut short, &classes, Some("demo/App")).is_err());

        let mut no_main = BindingPass::new(None, Some("/opt".into()));
        assert!(init(&mut no_main, &classes, None).is_err());
        Ok(())
    }
}
