use anyhow::{Context, Result};
use rand::rngs::StdRng;

use super::{prepend_to_main, require_main_class, ClassScope, Pass, PassContext, PassKind, PassStats};
use crate::classfile::ClassFile;
use crate::crypto::{self, SaltedHash};
use crate::runtime::{self, CHECK_PASSWORD, CHECK_PASSWORD_DESCRIPTOR, GUARD_CLASS};

/// Asks for a password on the console before `main` runs.
#[derive(Debug, Clone, Default)]
pub struct PasswordPass {
    password: String,
    stored: Option<SaltedHash>,
    main_class: String,
    guard: String,
}

impl PasswordPass {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn stored(&self) -> Option<&SaltedHash> {
        self.stored.as_ref()
    }
}

impl Pass for PasswordPass {
    fn kind(&self) -> PassKind {
        PassKind::Password
    }

    fn init(&mut self, ctx: &PassContext<'_>, rng: &mut StdRng) -> Result<()> {
        if self.password.is_empty() {
            anyhow::bail!("Password must not be empty");
        }
        self.main_class = require_main_class(ctx, self.kind())?;
        self.guard = runtime::runtime_class_name(ctx.runtime_package, GUARD_CLASS);
        self.stored = Some(crypto::salted_hash(&self.password, rng));
        Ok(())
    }

    fn transform(&self, class: &mut ClassFile, _scope: &mut ClassScope) -> Result<PassStats> {
        let stored = self.stored.as_ref().context("Password pass used before init")?;
        let guarded = prepend_to_main(class, &self.main_class, 2, |e| {
            e.string(&stored.salt)?
                .string(&stored.hash)?
                .invoke_static(&self.guard, CHECK_PASSWORD, CHECK_PASSWORD_DESCRIPTOR)?;
            Ok(())
        })
        .with_context(|| format!("Failed to add the password check to {}", self.main_class))?;
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
    use crate::bytecode::Insn;
    use crate::passes::testing::app_class;
    use rand::SeedableRng;

    #[test]
    fn embeds_a_hash_that_verifies_the_password() -> Result<()> {
        let mut app = app_class("demo/App")?;
        let mut pass = PasswordPass::new("s3cret");
        let ctx = PassContext {
            classes: std::slice::from_ref(&app),
            main_class: Some("demo/App"),
            runtime_package: "",
        };
        pass.init(&ctx, &mut StdRng::seed_from_u64(4))?;
        let mut scope = ClassScope {
            index: 0,
            class_name: "demo/App".into(),
            rng: StdRng::seed_from_u64(0),
        };
        assert_eq!(pass.transform(&mut app, &mut scope)?.guarded_entry_points, 1);

        let stored = pass.stored().unwrap().clone();
        assert!(crypto::verify_password("s3cret", &stored)?);

        let idx = app.find_method("main", "([Ljava/lang/String;)V").unwrap();
        let code = app.methods[idx].code.as_ref().unwrap();
        assert!(code.max_stack >= 2);
        let literals: Vec<String> = code.insns[..2]
            .iter()
            .map(|i| match i {
                Insn::Ldc { index } => app.pool.utf8(app.pool.string_utf8_index(*index)?),
                other => panic!("unexpected {other:?}"),
            })
            .collect::<crate::error::ClassResult<_>>()?;
        assert_eq!(literals, [stored.salt.clone(), stored.hash.clone()]);
        assert_eq!(pass.runtime_classes()?[0].this_name()?, "Guard");
        Ok(())
    }

    #[test]
    fn empty_password_is_rejected() -> Result<()> {
        let classes = vec![app_class("demo/App")?];
        let ctx = PassContext {
            classes: &classes,
            main_class: Some("demo/App"),
            runtime_package: "rt",
        };
        assert!(PasswordPass::new("").init(&ctx, &mut StdRng::seed_from_u64(0)).is_err());
        Ok(())
    }
}
