use anyhow::Result;

use super::{for_each_code, ClassScope, Pass, PassKind, PassStats};
use crate::bytecode::op;
use crate::classfile::ClassFile;
use crate::runtime::Emitter;

pub const DEFAULT_MARKER: &str = "-agentlib:jdwp";

/// Makes every method throw when the JVM was started with a debugger agent.
#[derive(Debug, Clone)]
pub struct AntiDebugPass {
    marker: String,
}

impl AntiDebugPass {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl Default for AntiDebugPass {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER)
    }
}

impl Pass for AntiDebugPass {
    fn kind(&self) -> PassKind {
        PassKind::AntiDebug
    }

    fn transform(&self, class: &mut ClassFile, _scope: &mut ClassScope) -> Result<PassStats> {
        let mut guarded = 0;
        for_each_code(class, |_sig, code, pool| {
            let insns = {
                let mut e = Emitter::new(pool, code);
                let ok = e.new_label();
                e.invoke_static(
                    "java/lang/management/ManagementFactory",
                    "getRuntimeMXBean",
                    "()Ljava/lang/management/RuntimeMXBean;",
                )?
                .invoke_interface(
                    "java/lang/management/RuntimeMXBean",
                    "getInputArguments",
                    "()Ljava/util/List;",
                )?
                .invoke_interface("java/util/List", "toString", "()Ljava/lang/String;")?
                .string(&self.marker)?
                .invoke_virtual("java/lang/String", "contains", "(Ljava/lang/CharSequence;)Z")?
                .jump(op::IFEQ, ok)
                .new_object("java/lang/RuntimeException")?
                .op(op::DUP)
                .string("Debug detected")?
                .invoke_special("java/lang/RuntimeException", "<init>", "(Ljava/lang/String;)V")?
                .op(op::ATHROW)
                .label(ok);
                e.finish()
            };
            code.insert(0, insns);
            code.max_stack = code.max_stack.max(3);
            guarded += 1;
            Ok(())
        })?;
        Ok(PassStats {
            guarded_methods: guarded,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Insn;
    use crate::frames::VType;
    use crate::passes::testing::app_class;
    use crate::pool::Constant;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn every_method_is_guarded_with_the_marker() -> Result<()> {
        let mut class = app_class("demo/App")?;
        let mut scope = ClassScope {
            index: 0,
            class_name: "demo/App".into(),
            rng: StdRng::seed_from_u64(0),
        };
        let stats = AntiDebugPass::new("-Xrunjdwp").transform(&mut class, &mut scope)?;
        assert_eq!(stats.guarded_methods, 2);

        for m in &class.methods {
            let code = m.code.as_ref().unwrap();
            assert!(code.max_stack >= 3);
            let marker = code.insns.iter().find_map(|i| match i {
                Insn::Ldc { index } => match class.pool.get(*index).ok()? {
                    Constant::String(u) => class.pool.utf8(*u).ok(),
                    _ => None,
                },
                _ => None,
            });
            assert_eq!(marker.as_deref(), Some("-Xrunjdwp"));
        }

        let bytes = class.to_bytes()?;
        let parsed = ClassFile::parse(&bytes)?;
        let idx = parsed.find_method("greet", "(I)I").unwrap();
        let code = parsed.methods[idx].code.as_ref().unwrap();
        // the continuation after the check starts from the entry state
        assert!(code
            .frames
            .values()
            .any(|f| f.locals == vec![VType::Integer] && f.stack.is_empty()));
        Ok(())
    }
}
