use anyhow::Result;
use rand::seq::SliceRandom;
use tracing::debug;

use super::{for_each_code, ClassScope, Pass, PassKind, PassStats};
use crate::bytecode::{op, Insn};
use crate::classfile::ClassFile;
use crate::frames;

pub const DEFAULT_DEAD_BRANCHES: usize = 3;

/// Inserts never-taken branches (`iconst_0; ifne L; iconst_1; pop; L:`) before random
/// instructions.
#[derive(Debug, Clone)]
pub struct FlowPass {
    dead_branches: usize,
}

impl FlowPass {
    pub fn new(dead_branches: usize) -> Self {
        Self { dead_branches }
    }
}

impl Default for FlowPass {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_BRANCHES)
    }
}

fn can_anchor(insn: &Insn) -> bool {
    match insn {
        Insn::Label(_) => false,
        // the label before a `new` names its uninitialized value
        Insn::Type { opcode: op::NEW, .. } => false,
        Insn::Simple(op::RETURN) => false,
        i => !i.is_branch(),
    }
}

impl Pass for FlowPass {
    fn kind(&self) -> PassKind {
        PassKind::Flow
    }

    fn transform(&self, class: &mut ClassFile, scope: &mut ClassScope) -> Result<PassStats> {
        if self.dead_branches == 0 {
            return Ok(PassStats::default());
        }
        let mut inserted = 0;
        for_each_code(class, |sig, code, pool| {
            let analysis = match frames::analyze(code, sig, pool) {
                Ok(a) => a,
                Err(err) => {
                    debug!(method = sig.name, %err, "no type states, method skipped");
                    return Ok(());
                }
            };
            let mut candidates: Vec<(usize, usize)> = code
                .insns
                .iter()
                .enumerate()
                .filter(|(_, insn)| can_anchor(insn))
                .filter_map(|(i, _)| analysis.states[i].as_ref().map(|s| (i, s.stack_depth())))
                .collect();
            candidates.shuffle(&mut scope.rng);
            candidates.truncate(self.dead_branches);
            // back to front so earlier indices stay valid
            candidates.sort_by(|a, b| b.0.cmp(&a.0));

            for (at, depth) in candidates {
                let skip = code.new_label();
                code.insert(
                    at,
                    vec![
                        Insn::Simple(op::ICONST_0),
                        Insn::Jump {
                            opcode: op::IFNE,
                            target: skip,
                        },
                        Insn::Simple(op::ICONST_1),
                        Insn::Simple(op::POP),
                        Insn::Label(skip),
                    ],
                );
                let needed = u16::try_from(depth + 1).unwrap_or(u16::MAX);
                code.max_stack = code.max_stack.max(needed);
                inserted += 1;
            }
            Ok(())
        })?;
        Ok(PassStats {
            dead_branches: inserted,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::testing::app_class;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scope(seed: u64) -> ClassScope {
        ClassScope {
            index: 0,
            class_name: "demo/App".into(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn dead_branch_count(insns: &[Insn]) -> usize {
        insns
            .windows(2)
            .filter(|w| {
                w[0] == Insn::Simple(op::ICONST_0)
                    && matches!(w[1], Insn::Jump { opcode: op::IFNE, .. })
            })
            .count()
    }

    #[test]
    fn inserts_at_most_the_configured_number_per_method() -> Result<()> {
        let mut class = app_class("demo/App")?;
        let stats = FlowPass::new(2).transform(&mut class, &mut scope(11))?;
        // main has 3 anchors, greet has 5
        assert_eq!(stats.dead_branches, 4);
        for m in &class.methods {
            assert_eq!(dead_branch_count(&m.code.as_ref().unwrap().insns), 2);
        }
        Ok(())
    }

    #[test]
    fn max_stack_covers_the_anchor_depth() -> Result<()> {
        let mut class = app_class("demo/App")?;
        FlowPass::new(10).transform(&mut class, &mut scope(3))?;
        let idx = class.find_method("main", "([Ljava/lang/String;)V").unwrap();
        // the invokevirtual anchor runs with two values on the stack
        assert_eq!(class.methods[idx].code.as_ref().unwrap().max_stack, 3);
        Ok(())
    }

    #[test]
    fn rewritten_methods_get_frames_at_the_skip_labels() -> Result<()> {
        let mut class = app_class("demo/App")?;
        let stats = FlowPass::default().transform(&mut class, &mut scope(7))?;
        let bytes = class.to_bytes()?;
        let parsed = ClassFile::parse(&bytes)?;
        let frames: usize = parsed
            .methods
            .iter()
            .map(|m| m.code.as_ref().unwrap().frames.len())
            .sum();
        // greet already had one branch target
        assert!(frames >= stats.dead_branches);
        Ok(())
    }

    #[test]
    fn same_seed_gives_same_output() -> Result<()> {
        let mut a = app_class("demo/App")?;
        let mut b = app_class("demo/App")?;
        FlowPass::default().transform(&mut a, &mut scope(42))?;
        FlowPass::default().transform(&mut b, &mut scope(42))?;
        assert_eq!(a.to_bytes()?, b.to_bytes()?);
        Ok(())
    }
}
