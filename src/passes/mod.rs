//! Class transformations and the order they run in.

pub mod antidebug;
pub mod binding;
pub mod flow;
pub mod password;
pub mod rename;
pub mod strings;
pub mod trace;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use serde::Serialize;

use crate::bytecode::{Code, MethodSig};
use crate::classfile::{ClassFile, ACC_STATIC};
use crate::pool::ConstantPool;

pub use antidebug::AntiDebugPass;
pub use binding::BindingPass;
pub use flow::FlowPass;
pub use password::PasswordPass;
pub use rename::RenamePass;
pub use strings::StringsPass;
pub use trace::TracePass;

/// Descriptor of `public static void main(String[])`.
pub const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// Passes in the order they are applied. Sorting by kind gives the pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassKind {
    Trace,
    Binding,
    Password,
    AntiDebug,
    Flow,
    Strings,
    Rename,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PassKind::Trace => "trace",
            PassKind::Binding => "binding",
            PassKind::Password => "password",
            PassKind::AntiDebug => "anti-debug",
            PassKind::Flow => "flow",
            PassKind::Strings => "strings",
            PassKind::Rename => "rename",
        })
    }
}

/// What every pass sees before transformation starts.
pub struct PassContext<'a> {
    /// Parsed input classes in archive order.
    pub classes: &'a [ClassFile],
    /// Internal name of the manifest's `Main-Class`.
    pub main_class: Option<&'a str>,
    /// Package (internal form) the support classes are generated in.
    pub runtime_package: &'a str,
}

/// Per-class state handed to `Pass::transform`.
pub struct ClassScope {
    pub index: usize,
    pub class_name: String,
    pub rng: StdRng,
}

pub struct FinishContext<'a> {
    pub stats: &'a PassStats,
    pub classes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub renamed_classes: usize,
    pub encrypted_strings: usize,
    pub dead_branches: usize,
    pub guarded_methods: usize,
    pub guarded_entry_points: usize,
}

impl AddAssign for PassStats {
    fn add_assign(&mut self, o: Self) {
        self.renamed_classes += o.renamed_classes;
        self.encrypted_strings += o.encrypted_strings;
        self.dead_branches += o.dead_branches;
        self.guarded_methods += o.guarded_methods;
        self.guarded_entry_points += o.guarded_entry_points;
    }
}

pub trait Pass: Send + Sync {
    fn kind(&self) -> PassKind;

    /// Runs once before any class is transformed.
    fn init(&mut self, _ctx: &PassContext<'_>, _rng: &mut StdRng) -> Result<()> {
        Ok(())
    }

    /// Runs for every input class, possibly on several threads at once.
    fn transform(&self, class: &mut ClassFile, scope: &mut ClassScope) -> Result<PassStats>;

    fn finish(&mut self, _ctx: &FinishContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Support classes to add to the output. They are written as they are.
    fn runtime_classes(&self) -> Result<Vec<ClassFile>> {
        Ok(Vec::new())
    }

    /// Old to new internal names, for passes that rename classes.
    fn class_mapping(&self) -> Option<&BTreeMap<String, String>> {
        None
    }
}

/// Puts passes into pipeline order.
pub fn order_passes(passes: &mut [Box<dyn Pass>]) {
    passes.sort_by_key(|p| p.kind());
}

/// Calls `f` with every method that has a code body.
pub(crate) fn for_each_code(
    class: &mut ClassFile,
    mut f: impl FnMut(&MethodSig<'_>, &mut Code, &mut ConstantPool) -> Result<()>,
) -> Result<()> {
    let class_name = class.this_name()?;
    let ClassFile { pool, methods, .. } = class;
    for method in methods.iter_mut() {
        let Some(code) = method.code.as_mut() else {
            continue;
        };
        let name = pool.utf8(method.name)?;
        let descriptor = pool.utf8(method.descriptor)?;
        let sig = MethodSig {
            class_name: &class_name,
            name: &name,
            descriptor: &descriptor,
            is_static: method.access & ACC_STATIC != 0,
        };
        f(&sig, code, pool).with_context(|| format!("In method {class_name}.{name}{descriptor}"))?;
    }
    Ok(())
}

/// Checks that the manifest names a main class and that it declares `main(String[])`.
pub(crate) fn require_main_class(ctx: &PassContext<'_>, kind: PassKind) -> Result<String> {
    let main = ctx
        .main_class
        .with_context(|| format!("The {kind} pass needs a Main-Class in the manifest"))?;
    let class = ctx
        .classes
        .iter()
        .find(|c| c.this_name().is_ok_and(|n| n == main))
        .with_context(|| format!("Main-Class {main} is not in the jar"))?;
    let has_main = class
        .find_method("main", MAIN_DESCRIPTOR)
        .is_some_and(|i| class.methods[i].is_static() && class.methods[i].code.is_some());
    if !has_main {
        anyhow::bail!("Main-Class {main} has no static main(String[]) method");
    }
    Ok(main.to_string())
}

/// Prepends `snippet` to `main(String[])` when `class` is `main_class`. Returns whether it did.
pub(crate) fn prepend_to_main(
    class: &mut ClassFile,
    main_class: &str,
    max_stack: u16,
    snippet: impl FnOnce(&mut crate::runtime::Emitter<'_>) -> Result<()>,
) -> Result<bool> {
    if class.this_name()? != main_class {
        return Ok(false);
    }
    let Some(idx) = class.find_method("main", MAIN_DESCRIPTOR) else {
        return Ok(false);
    };
    let ClassFile { pool, methods, .. } = class;
    let Some(code) = methods[idx].code.as_mut() else {
        return Ok(false);
    };
    let insns = {
        let mut e = crate::runtime::Emitter::new(pool, code);
        snippet(&mut e)?;
        e.finish()
    };
    code.insert(0, insns);
    code.max_stack = code.max_stack.max(max_stack);
    Ok(true)
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::bytecode::{op, Code, Insn};
    use crate::classfile::{ClassFile, Member, ACC_PUBLIC, ACC_STATIC, ACC_SUPER};
    use crate::error::ClassResult;

    /// `demo/App` with `main` printing a literal and a static `greet(I)` with a branch.
    pub fn app_class(name: &str) -> ClassResult<ClassFile> {
        let mut class = ClassFile::new(name, "java/lang/Object", ACC_PUBLIC | ACC_SUPER, 52)?;

        let out = class
            .pool
            .intern_field_ref("java/lang/System", "out", "Ljava/io/PrintStream;")?;
        let hello = class.pool.intern_string("hello")?;
        let println =
            class
                .pool
                .intern_method_ref("java/io/PrintStream", "println", "(Ljava/lang/String;)V", false)?;
        let mut main = Code::new(2, 1);
        main.insns = vec![
            Insn::Field { opcode: op::GETSTATIC, index: out },
            Insn::Ldc { index: hello },
            Insn::Invoke { opcode: op::INVOKEVIRTUAL, index: println },
            Insn::Simple(op::RETURN),
        ];
        add_method(&mut class, "main", "([Ljava/lang/String;)V", main)?;

        let mut greet = Code::new(1, 1);
        let zero = greet.new_label();
        greet.insns = vec![
            Insn::Var { opcode: op::ILOAD, index: 0 },
            Insn::Jump { opcode: op::IFEQ, target: zero },
            Insn::Push { opcode: op::BIPUSH, value: 7 },
            Insn::Simple(op::IRETURN),
            Insn::Label(zero),
            Insn::Simple(op::ICONST_0),
            Insn::Simple(op::IRETURN),
        ];
        add_method(&mut class, "greet", "(I)I", greet)?;
        Ok(class)
    }

    pub fn add_method(class: &mut ClassFile, name: &str, descriptor: &str, code: Code) -> ClassResult<()> {
        let name = class.pool.intern_utf8(name)?;
        let descriptor = class.pool.intern_utf8(descriptor)?;
        class.methods.push(Member {
            access: ACC_PUBLIC | ACC_STATIC,
            name,
            descriptor,
            attributes: Vec::new(),
            code: Some(code),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(PassKind);

    impl Pass for Named {
        fn kind(&self) -> PassKind {
            self.0
        }

        fn transform(&self, _class: &mut ClassFile, _scope: &mut ClassScope) -> Result<PassStats> {
            Ok(PassStats::default())
        }
    }

    #[test]
    fn passes_are_ordered_regardless_of_how_they_were_listed() {
        let mut passes: Vec<Box<dyn Pass>> = vec![
            Box::new(Named(PassKind::Rename)),
            Box::new(Named(PassKind::Strings)),
            Box::new(Named(PassKind::Binding)),
            Box::new(Named(PassKind::Flow)),
            Box::new(Named(PassKind::AntiDebug)),
            Box::new(Named(PassKind::Password)),
        ];
        order_passes(&mut passes);
        let names: Vec<String> = passes.iter().map(|p| p.kind().to_string()).collect();
        assert_eq!(
            names,
            ["binding", "password", "anti-debug", "flow", "strings", "rename"]
        );
    }

    #[test]
    fn main_class_is_required() -> Result<()> {
        let classes = vec![testing::app_class("demo/App")?];
        let ctx = PassContext {
            classes: &classes,
            main_class: None,
            runtime_package: "rt",
        };
        assert!(require_main_class(&ctx, PassKind::Binding).is_err());

        let ctx = PassContext {
            main_class: Some("demo/Missing"),
            ..ctx
        };
        assert!(require_main_class(&ctx, PassKind::Binding).is_err());

        let ctx = PassContext {
            main_class: Some("demo/App"),
            ..ctx
        };
        assert_eq!(require_main_class(&ctx, PassKind::Binding)?, "demo/App");
        Ok(())
    }

    #[test]
    fn stats_add_up() {
        let mut total = PassStats::default();
        total += PassStats {
            encrypted_strings: 2,
            ..Default::default()
        };
        total += PassStats {
            encrypted_strings: 1,
            dead_branches: 3,
            ..Default::default()
        };
        assert_eq!(total.encrypted_strings, 3);
        assert_eq!(total.dead_branches, 3);
    }
}
