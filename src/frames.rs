//! Verification types, the linear type interpreter and the StackMapTable codec.
//!
//! Frames hold locals slot by slot (a `long` or `double` is followed by an explicit `Top`)
//! and the operand stack entry by entry. The StackMapTable form, where wide types take a
//! single entry, is only used at the codec boundary.

use std::collections::{HashMap, HashSet};

use crate::bytecode::{op, Code, Insn, Label, MethodSig};
use crate::classfile::Reader;
use crate::descriptor::{self, FieldType};
use crate::error::{ClassFileError, ClassResult};
use crate::pool::{Constant, ConstantPool};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Internal name, or array descriptor for arrays.
    Object(String),
    /// Result of the `new` at this label, before its constructor ran.
    Uninitialized(Label),
}

impl VType {
    pub fn is_wide(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }

    fn size(&self) -> usize {
        if self.is_wide() { 2 } else { 1 }
    }

    fn of(ty: &FieldType) -> VType {
        match ty {
            FieldType::Boolean
            | FieldType::Byte
            | FieldType::Char
            | FieldType::Short
            | FieldType::Int => VType::Integer,
            FieldType::Float => VType::Float,
            FieldType::Long => VType::Long,
            FieldType::Double => VType::Double,
            FieldType::Object(name) => VType::Object(name.clone()),
            FieldType::Array(desc) => VType::Object(desc.clone()),
        }
    }

    fn object(name: &str) -> VType {
        VType::Object(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub locals: Vec<VType>,
    pub stack: Vec<VType>,
}

impl Frame {
    /// Operand stack depth in slots.
    pub fn stack_depth(&self) -> usize {
        self.stack.iter().map(VType::size).sum()
    }

    fn set_local(&mut self, index: usize, ty: VType) {
        let needed = index + ty.size();
        if self.locals.len() < needed {
            self.locals.resize(needed, VType::Top);
        }
        if index > 0 && self.locals[index - 1].is_wide() {
            self.locals[index - 1] = VType::Top;
        }
        let wide = ty.is_wide();
        self.locals[index] = ty;
        if wide {
            self.locals[index + 1] = VType::Top;
        }
    }

    fn push(&mut self, ty: VType) {
        self.stack.push(ty);
    }

    fn push_field(&mut self, ty: &FieldType) {
        self.stack.push(VType::of(ty));
    }
}

/// Locals in StackMapTable form: wide types take one entry, trailing `Top`s dropped.
fn compress(slots: &[VType]) -> Vec<VType> {
    let mut out = Vec::with_capacity(slots.len());
    let mut i = 0;
    while i < slots.len() {
        out.push(slots[i].clone());
        i += slots[i].size();
    }
    while out.last() == Some(&VType::Top) {
        out.pop();
    }
    out
}

fn expand(entries: &[VType]) -> Vec<VType> {
    let mut out = Vec::with_capacity(entries.len() + 2);
    for t in entries {
        out.push(t.clone());
        if t.is_wide() {
            out.push(VType::Top);
        }
    }
    out
}

/// Frame at method entry, derived from the descriptor.
pub fn entry_frame(sig: &MethodSig<'_>, max_locals: u16) -> ClassResult<Frame> {
    let mut locals = Vec::with_capacity(max_locals as usize);
    if !sig.is_static {
        locals.push(if sig.name == "<init>" && sig.class_name != "java/lang/Object" {
            VType::UninitializedThis
        } else {
            VType::object(sig.class_name)
        });
    }
    let (args, _) = descriptor::parse_method(sig.descriptor)?;
    for arg in &args {
        let t = VType::of(arg);
        let wide = t.is_wide();
        locals.push(t);
        if wide {
            locals.push(VType::Top);
        }
    }
    Ok(Frame {
        locals,
        stack: Vec::new(),
    })
}

/// Result of running the linear interpreter over a code body.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// State before each entry of `Code::insns`, when known.
    pub states: Vec<Option<Frame>>,
    pub max_stack: usize,
    pub max_locals: usize,
}

/// Simulates the code from its entry frame and from every explicit frame. States at forward
/// jump targets are remembered and resume flow after unconditional instructions.
pub fn analyze(code: &Code, sig: &MethodSig<'_>, pool: &ConstantPool) -> ClassResult<Analysis> {
    let entry = entry_frame(sig, code.max_locals)?;
    let new_types = new_sites(code, pool)?;
    let handler_starts: HashMap<Label, Vec<usize>> =
        code.handlers.iter().enumerate().fold(HashMap::new(), |mut m, (i, h)| {
            m.entry(h.start).or_default().push(i);
            m
        });
    let handler_ends: HashMap<Label, Vec<usize>> =
        code.handlers.iter().enumerate().fold(HashMap::new(), |mut m, (i, h)| {
            m.entry(h.end).or_default().push(i);
            m
        });

    let interp = Interpreter {
        pool,
        class_name: sig.class_name,
        new_types: &new_types,
    };

    let mut pending: HashMap<Label, Frame> = HashMap::new();
    let mut active: HashSet<usize> = HashSet::new();
    let mut state = Some(entry.clone());
    let mut states = Vec::with_capacity(code.insns.len());
    let mut current_label: Option<Label> = None;
    let mut max_stack = 0usize;
    let mut max_locals = entry.locals.len();

    for (index, insn) in code.insns.iter().enumerate() {
        if let Insn::Label(label) = insn {
            if let Some(frame) = code.frames.get(label) {
                state = Some(frame.clone());
            } else if state.is_none() {
                state = pending.get(label).cloned();
            }
            for &h in handler_ends.get(label).into_iter().flatten() {
                active.remove(&h);
            }
            for &h in handler_starts.get(label).into_iter().flatten() {
                active.insert(h);
            }
            current_label = Some(*label);
            states.push(state.clone());
            continue;
        }
        states.push(state.clone());
        let Some(frame) = state.as_mut() else {
            current_label = None;
            continue;
        };

        for &h in &active {
            let handler = &code.handlers[h];
            if code.frames.contains_key(&handler.handler) {
                continue;
            }
            let caught = if handler.catch_type == 0 {
                "java/lang/Throwable".to_string()
            } else {
                pool.class_name(handler.catch_type)?
            };
            let incoming = Frame {
                locals: frame.locals.clone(),
                stack: vec![VType::Object(caught)],
            };
            pending
                .entry(handler.handler)
                .and_modify(|f| f.locals = merge_locals(&f.locals, &incoming.locals))
                .or_insert(incoming);
        }

        interp.execute(index, insn, frame, current_label)?;
        max_stack = max_stack.max(frame.stack_depth());
        max_locals = max_locals.max(frame.locals.len());

        for target in insn.targets() {
            if !code.frames.contains_key(&target) {
                pending.entry(target).or_insert_with(|| frame.clone());
            }
        }
        if insn.ends_flow() {
            state = None;
        }
        current_label = None;
    }

    Ok(Analysis {
        states,
        max_stack,
        max_locals,
    })
}

fn merge_locals(a: &[VType], b: &[VType]) -> Vec<VType> {
    let len = a.len().min(b.len());
    (0..len)
        .map(|i| if a[i] == b[i] { a[i].clone() } else { VType::Top })
        .collect()
}

/// Class created by each `new`, keyed by the label that precedes it.
fn new_sites(code: &Code, pool: &ConstantPool) -> ClassResult<HashMap<Label, String>> {
    let mut sites = HashMap::new();
    let mut labels: Vec<Label> = Vec::new();
    for insn in &code.insns {
        match insn {
            Insn::Label(l) => labels.push(*l),
            Insn::Type { opcode: op::NEW, index } => {
                let name = pool.class_name(*index)?;
                for l in labels.drain(..) {
                    sites.insert(l, name.clone());
                }
            }
            _ => labels.clear(),
        }
    }
    Ok(sites)
}

/// Adds a frame at every branch, switch and handler target that has none. Existing frames
/// are kept as they are.
pub fn recompute(code: &mut Code, sig: &MethodSig<'_>, pool: &ConstantPool) -> ClassResult<()> {
    let missing: HashSet<Label> = code
        .frame_targets()
        .into_iter()
        .filter(|l| !code.frames.contains_key(l))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    let analysis = analyze(code, sig, pool)?;
    let mut found = Vec::new();
    for (i, insn) in code.insns.iter().enumerate() {
        if let Insn::Label(l) = insn
            && missing.contains(l)
        {
            let frame = analysis.states[i]
                .clone()
                .ok_or(ClassFileError::FrameUnavailable(l.0))?;
            found.push((*l, frame));
        }
    }
    if found.len() != missing.len() {
        let placed: HashSet<Label> = found.iter().map(|(l, _)| *l).collect();
        if let Some(l) = missing.iter().find(|l| !placed.contains(l)) {
            return Err(ClassFileError::FrameUnavailable(l.0));
        }
    }
    code.frames.extend(found);
    Ok(())
}

struct Interpreter<'a> {
    pool: &'a ConstantPool,
    class_name: &'a str,
    new_types: &'a HashMap<Label, String>,
}

impl Interpreter<'_> {
    fn execute(
        &self,
        index: usize,
        insn: &Insn,
        f: &mut Frame,
        label: Option<Label>,
    ) -> ClassResult<()> {
        let err = |reason: &str| ClassFileError::Verify {
            index,
            reason: reason.to_string(),
        };
        let pop = |f: &mut Frame| f.stack.pop().ok_or_else(|| err("stack underflow"));
        let pop_n = |f: &mut Frame, n: usize| -> ClassResult<()> {
            for _ in 0..n {
                f.stack.pop().ok_or_else(|| err("stack underflow"))?;
            }
            Ok(())
        };

        match insn {
            Insn::Label(_) => {}
            Insn::Simple(opcode) => {
                let opcode = *opcode;
                match opcode {
                    op::NOP => {}
                    op::ACONST_NULL => f.push(VType::Null),
                    op::ICONST_M1..=op::ICONST_5 => f.push(VType::Integer),
                    op::LCONST_0 | op::LCONST_1 => f.push(VType::Long),
                    op::FCONST_0..=op::FCONST_2 => f.push(VType::Float),
                    op::DCONST_0 | op::DCONST_1 => f.push(VType::Double),
                    op::IALOAD | op::BALOAD | op::CALOAD | op::SALOAD => {
                        pop_n(f, 2)?;
                        f.push(VType::Integer);
                    }
                    op::LALOAD => {
                        pop_n(f, 2)?;
                        f.push(VType::Long);
                    }
                    op::FALOAD => {
                        pop_n(f, 2)?;
                        f.push(VType::Float);
                    }
                    op::DALOAD => {
                        pop_n(f, 2)?;
                        f.push(VType::Double);
                    }
                    op::AALOAD => {
                        pop(f)?;
                        let array = pop(f)?;
                        f.push(element_type(&array));
                    }
                    op::IASTORE..=op::SASTORE => pop_n(f, 3)?,
                    op::POP => {
                        pop(f)?;
                    }
                    op::POP2 => {
                        if !pop(f)?.is_wide() {
                            pop(f)?;
                        }
                    }
                    op::DUP => {
                        let v = f.stack.last().cloned().ok_or_else(|| err("stack underflow"))?;
                        f.push(v);
                    }
                    op::DUP_X1 => {
                        let v1 = pop(f)?;
                        let v2 = pop(f)?;
                        f.stack.extend([v1.clone(), v2, v1]);
                    }
                    op::DUP_X2 => {
                        let v1 = pop(f)?;
                        let v2 = pop(f)?;
                        if v2.is_wide() {
                            f.stack.extend([v1.clone(), v2, v1]);
                        } else {
                            let v3 = pop(f)?;
                            f.stack.extend([v1.clone(), v3, v2, v1]);
                        }
                    }
                    op::DUP2 => {
                        let v1 = pop(f)?;
                        if v1.is_wide() {
                            f.stack.extend([v1.clone(), v1]);
                        } else {
                            let v2 = pop(f)?;
                            f.stack.extend([v2.clone(), v1.clone(), v2, v1]);
                        }
                    }
                    op::DUP2_X1 => {
                        let v1 = pop(f)?;
                        if v1.is_wide() {
                            let v2 = pop(f)?;
                            f.stack.extend([v1.clone(), v2, v1]);
                        } else {
                            let v2 = pop(f)?;
                            let v3 = pop(f)?;
                            f.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                        }
                    }
                    op::DUP2_X2 => {
                        let v1 = pop(f)?;
                        if v1.is_wide() {
                            let v2 = pop(f)?;
                            if v2.is_wide() {
                                f.stack.extend([v1.clone(), v2, v1]);
                            } else {
                                let v3 = pop(f)?;
                                f.stack.extend([v1.clone(), v3, v2, v1]);
                            }
                        } else {
                            let v2 = pop(f)?;
                            let v3 = pop(f)?;
                            if v3.is_wide() {
                                f.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                            } else {
                                let v4 = pop(f)?;
                                f.stack.extend([v2.clone(), v1.clone(), v4, v3, v2, v1]);
                            }
                        }
                    }
                    op::SWAP => {
                        let v1 = pop(f)?;
                        let v2 = pop(f)?;
                        f.stack.extend([v1, v2]);
                    }
                    op::IADD..=op::DNEG => {
                        // add, sub, mul, div, rem, neg cycle through I, L, F, D
                        let kind = (opcode - op::IADD) % 4;
                        let operands = if opcode >= 0x74 { 1 } else { 2 };
                        pop_n(f, operands)?;
                        f.push(match kind {
                            0 => VType::Integer,
                            1 => VType::Long,
                            2 => VType::Float,
                            _ => VType::Double,
                        });
                    }
                    op::ISHL..=op::LXOR => {
                        pop_n(f, 2)?;
                        f.push(if (opcode - op::ISHL) % 2 == 0 {
                            VType::Integer
                        } else {
                            VType::Long
                        });
                    }
                    op::I2L..=op::I2S => {
                        pop(f)?;
                        f.push(match opcode {
                            op::I2L | op::F2L | op::D2L => VType::Long,
                            op::I2F | op::L2F | op::D2F => VType::Float,
                            op::I2D | op::L2D | op::F2D => VType::Double,
                            _ => VType::Integer,
                        });
                    }
                    op::LCMP..=op::DCMPG => {
                        pop_n(f, 2)?;
                        f.push(VType::Integer);
                    }
                    op::IRETURN..=op::ARETURN => {
                        pop(f)?;
                    }
                    op::RETURN => {}
                    op::ARRAYLENGTH => {
                        pop(f)?;
                        f.push(VType::Integer);
                    }
                    op::ATHROW | op::MONITORENTER | op::MONITOREXIT => {
                        pop(f)?;
                    }
                    _ => return Err(err("unsupported opcode")),
                }
            }
            Insn::Var { opcode, index: slot } => {
                let slot = *slot as usize;
                match *opcode {
                    op::ILOAD => f.push(VType::Integer),
                    op::LLOAD => f.push(VType::Long),
                    op::FLOAD => f.push(VType::Float),
                    op::DLOAD => f.push(VType::Double),
                    op::ALOAD => {
                        let v = f
                            .locals
                            .get(slot)
                            .cloned()
                            .ok_or_else(|| err("load from undefined local"))?;
                        f.push(v);
                    }
                    op::ISTORE | op::LSTORE | op::FSTORE | op::DSTORE | op::ASTORE => {
                        let v = pop(f)?;
                        f.set_local(slot, v);
                    }
                    _ => return Err(err("jsr/ret subroutines are not supported")),
                }
            }
            Insn::Iinc { .. } => {}
            Insn::Push { .. } => f.push(VType::Integer),
            Insn::Ldc { index } | Insn::Ldc2 { index } => {
                let t = match self.pool.get(*index)? {
                    Constant::Integer(_) => VType::Integer,
                    Constant::Float(_) => VType::Float,
                    Constant::Long(_) => VType::Long,
                    Constant::Double(_) => VType::Double,
                    Constant::String(_) => VType::object("java/lang/String"),
                    Constant::Class(_) => VType::object("java/lang/Class"),
                    Constant::MethodType(_) => VType::object("java/lang/invoke/MethodType"),
                    Constant::MethodHandle { .. } => VType::object("java/lang/invoke/MethodHandle"),
                    Constant::Dynamic { .. } => {
                        VType::of(&descriptor::parse_field(&self.pool.dynamic_descriptor(*index)?)?)
                    }
                    _ => return Err(err("ldc of a non-loadable constant")),
                };
                f.push(t);
            }
            Insn::Field { opcode, index } => {
                let member = self.pool.member_ref(*index)?;
                let ty = descriptor::parse_field(&member.descriptor)?;
                match *opcode {
                    op::GETSTATIC => f.push_field(&ty),
                    op::PUTSTATIC => {
                        pop(f)?;
                    }
                    op::GETFIELD => {
                        pop(f)?;
                        f.push_field(&ty);
                    }
                    _ => pop_n(f, 2)?,
                }
            }
            Insn::Invoke { opcode, index } => {
                let member = self.pool.member_ref(*index)?;
                let (args, ret) = descriptor::parse_method(&member.descriptor)?;
                pop_n(f, args.len())?;
                if *opcode != op::INVOKESTATIC {
                    let receiver = pop(f)?;
                    if *opcode == op::INVOKESPECIAL && member.name == "<init>" {
                        let initialized = match &receiver {
                            VType::UninitializedThis => VType::object(self.class_name),
                            VType::Uninitialized(l) => VType::object(
                                self.new_types
                                    .get(l)
                                    .ok_or_else(|| err("constructor call on unknown new"))?,
                            ),
                            _ => receiver.clone(),
                        };
                        for slot in f.locals.iter_mut().chain(f.stack.iter_mut()) {
                            if *slot == receiver {
                                *slot = initialized.clone();
                            }
                        }
                    }
                }
                if let Some(ret) = ret {
                    f.push_field(&ret);
                }
            }
            Insn::InvokeInterface { index, .. } => {
                let member = self.pool.member_ref(*index)?;
                let (args, ret) = descriptor::parse_method(&member.descriptor)?;
                pop_n(f, args.len() + 1)?;
                if let Some(ret) = ret {
                    f.push_field(&ret);
                }
            }
            Insn::InvokeDynamic { index } => {
                let (args, ret) = descriptor::parse_method(&self.pool.dynamic_descriptor(*index)?)?;
                pop_n(f, args.len())?;
                if let Some(ret) = ret {
                    f.push_field(&ret);
                }
            }
            Insn::Type { opcode, index } => {
                let name = self.pool.class_name(*index)?;
                match *opcode {
                    op::NEW => {
                        let label = label.ok_or_else(|| err("new without a label"))?;
                        f.push(VType::Uninitialized(label));
                    }
                    op::ANEWARRAY => {
                        pop(f)?;
                        f.push(VType::Object(if name.starts_with('[') {
                            format!("[{name}")
                        } else {
                            format!("[L{name};")
                        }));
                    }
                    op::CHECKCAST => {
                        pop(f)?;
                        f.push(VType::Object(name));
                    }
                    _ => {
                        pop(f)?;
                        f.push(VType::Integer);
                    }
                }
            }
            Insn::NewArray { atype } => {
                pop(f)?;
                let elem = match atype {
                    4 => 'Z',
                    5 => 'C',
                    6 => 'F',
                    7 => 'D',
                    8 => 'B',
                    9 => 'S',
                    10 => 'I',
                    11 => 'J',
                    _ => return Err(err("bad newarray type")),
                };
                f.push(VType::Object(format!("[{elem}")));
            }
            Insn::MultiANewArray { index, dims } => {
                pop_n(f, *dims as usize)?;
                f.push(VType::Object(self.pool.class_name(*index)?));
            }
            Insn::Jump { opcode, .. } => match *opcode {
                op::IFEQ..=op::IFLE | op::IFNULL | op::IFNONNULL => {
                    pop(f)?;
                }
                op::IF_ICMPEQ..=op::IF_ACMPNE => pop_n(f, 2)?,
                op::GOTO => {}
                _ => return Err(err("jsr/ret subroutines are not supported")),
            },
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
                pop(f)?;
            }
        }
        Ok(())
    }
}

fn element_type(array: &VType) -> VType {
    match array {
        VType::Object(desc) if desc.starts_with('[') => match descriptor::parse_field(&desc[1..]) {
            Ok(ty) => VType::of(&ty),
            Err(_) => VType::object("java/lang/Object"),
        },
        VType::Null => VType::Null,
        _ => VType::object("java/lang/Object"),
    }
}

const SAME_EXTENDED: u8 = 251;
const FULL_FRAME: u8 = 255;

/// Decodes a StackMapTable body into frames at labels.
pub fn decode_stack_map(
    data: &[u8],
    pool: &ConstantPool,
    entry: &Frame,
    label_at: &mut dyn FnMut(usize) -> ClassResult<Label>,
) -> ClassResult<Vec<(Label, Frame)>> {
    let mut r = Reader::new(data);
    let count = r.u16()?;
    let mut locals = compress(&entry.locals);
    let mut offset: Option<usize> = None;
    let mut out = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let kind = r.u8()?;
        let (delta, stack) = match kind {
            0..=63 => (kind as usize, Vec::new()),
            64..=127 => ((kind - 64) as usize, vec![read_vtype(&mut r, pool, label_at)?]),
            247 => {
                let delta = r.u16()? as usize;
                (delta, vec![read_vtype(&mut r, pool, label_at)?])
            }
            248..=250 => {
                let delta = r.u16()? as usize;
                let chop = (251 - kind) as usize;
                if chop > locals.len() {
                    return Err(ClassFileError::BadStackMap("chop below zero locals".into()));
                }
                locals.truncate(locals.len() - chop);
                (delta, Vec::new())
            }
            SAME_EXTENDED => (r.u16()? as usize, Vec::new()),
            252..=254 => {
                let delta = r.u16()? as usize;
                for _ in 0..(kind - 251) {
                    locals.push(read_vtype(&mut r, pool, label_at)?);
                }
                (delta, Vec::new())
            }
            FULL_FRAME => {
                let delta = r.u16()? as usize;
                let n = r.u16()?;
                locals = (0..n)
                    .map(|_| read_vtype(&mut r, pool, label_at))
                    .collect::<ClassResult<_>>()?;
                let n = r.u16()?;
                let stack = (0..n)
                    .map(|_| read_vtype(&mut r, pool, label_at))
                    .collect::<ClassResult<_>>()?;
                (delta, stack)
            }
            _ => {
                return Err(ClassFileError::BadStackMap(format!("reserved frame type {kind}")));
            }
        };
        let at = match offset {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        offset = Some(at);
        out.push((
            label_at(at)?,
            Frame {
                locals: expand(&locals),
                stack,
            },
        ));
    }
    Ok(out)
}

fn read_vtype(
    r: &mut Reader<'_>,
    pool: &ConstantPool,
    label_at: &mut dyn FnMut(usize) -> ClassResult<Label>,
) -> ClassResult<VType> {
    Ok(match r.u8()? {
        0 => VType::Top,
        1 => VType::Integer,
        2 => VType::Float,
        3 => VType::Double,
        4 => VType::Long,
        5 => VType::Null,
        6 => VType::UninitializedThis,
        7 => VType::Object(pool.class_name(r.u16()?)?),
        8 => VType::Uninitialized(label_at(r.u16()? as usize)?),
        tag => {
            return Err(ClassFileError::BadStackMap(format!(
                "unknown verification type {tag}"
            )));
        }
    })
}

/// Encodes frames sorted by offset; a frame repeated at the same offset is written once.
pub fn encode_stack_map(
    frames: &mut Vec<(usize, &Frame)>,
    entry: &Frame,
    pool: &mut ConstantPool,
    labels: &HashMap<Label, usize>,
) -> ClassResult<Vec<u8>> {
    frames.sort_by_key(|(offset, _)| *offset);
    frames.dedup_by_key(|(offset, _)| *offset);

    let mut body = Vec::new();
    let mut prev_locals = compress(&entry.locals);
    let mut prev_offset: Option<usize> = None;
    for (offset, frame) in frames.iter() {
        let delta = match prev_offset {
            None => *offset,
            Some(prev) => offset - prev - 1,
        };
        let delta = u16::try_from(delta)
            .map_err(|_| ClassFileError::BadStackMap("frame offset overflow".into()))?;
        let locals = compress(&frame.locals);
        if frame.stack.is_empty() && locals == prev_locals {
            if delta < 64 {
                body.push(delta as u8);
            } else {
                body.push(SAME_EXTENDED);
                body.extend_from_slice(&delta.to_be_bytes());
            }
        } else {
            body.push(FULL_FRAME);
            body.extend_from_slice(&delta.to_be_bytes());
            body.extend_from_slice(&(locals.len() as u16).to_be_bytes());
            for t in &locals {
                write_vtype(t, pool, labels, &mut body)?;
            }
            body.extend_from_slice(&(frame.stack.len() as u16).to_be_bytes());
            for t in &frame.stack {
                write_vtype(t, pool, labels, &mut body)?;
            }
        }
        prev_locals = locals;
        prev_offset = Some(*offset);
    }

    let mut out = Vec::with_capacity(body.len() + 2);
    out.extend_from_slice(&(frames.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn write_vtype(
    t: &VType,
    pool: &mut ConstantPool,
    labels: &HashMap<Label, usize>,
    out: &mut Vec<u8>,
) -> ClassResult<()> {
    match t {
        VType::Top => out.push(0),
        VType::Integer => out.push(1),
        VType::Float => out.push(2),
        VType::Double => out.push(3),
        VType::Long => out.push(4),
        VType::Null => out.push(5),
        VType::UninitializedThis => out.push(6),
        VType::Object(name) => {
            out.push(7);
            out.extend_from_slice(&pool.intern_class(name)?.to_be_bytes());
        }
        VType::Uninitialized(label) => {
            let offset = labels
                .get(label)
                .ok_or(ClassFileError::UnboundLabel(label.0))?;
            out.push(8);
            out.extend_from_slice(&(*offset as u16).to_be_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig<'a>(descriptor: &'a str, is_static: bool) -> MethodSig<'a> {
        MethodSig {
            class_name: "demo/A",
            name: "run",
            descriptor,
            is_static,
        }
    }

    #[test]
    fn entry_frame_expands_wide_arguments() -> ClassResult<()> {
        let f = entry_frame(&sig("(JLjava/lang/String;D)V", false), 6)?;
        assert_eq!(
            f.locals,
            vec![
                VType::object("demo/A"),
                VType::Long,
                VType::Top,
                VType::object("java/lang/String"),
                VType::Double,
                VType::Top,
            ]
        );
        assert!(f.stack.is_empty());

        let ctor = MethodSig {
            name: "<init>",
            ..sig("()V", false)
        };
        assert_eq!(entry_frame(&ctor, 1)?.locals, vec![VType::UninitializedThis]);
        Ok(())
    }

    #[test]
    fn interpreter_tracks_stack_and_locals() -> ClassResult<()> {
        let mut pool = ConstantPool::new();
        let length = pool.intern_method_ref("java/lang/String", "length", "()I", false)?;
        let mut code = Code::new(0, 0);
        code.insns = vec![
            Insn::Var { opcode: op::ALOAD, index: 0 },
            Insn::Invoke { opcode: op::INVOKEVIRTUAL, index: length },
            Insn::Simple(op::I2L),
            Insn::Var { opcode: op::LSTORE, index: 1 },
            Insn::Var { opcode: op::LLOAD, index: 1 },
            Insn::Simple(op::LRETURN),
        ];
        let a = analyze(&code, &sig("(Ljava/lang/String;)J", true), &pool)?;
        assert_eq!(a.max_stack, 2);
        assert_eq!(a.max_locals, 3);
        let before_return = a.states[5].as_ref().unwrap();
        assert_eq!(before_return.stack, vec![VType::Long]);
        assert_eq!(before_return.locals[1], VType::Long);
        Ok(())
    }

    #[test]
    fn constructor_call_initializes_new_value() -> ClassResult<()> {
        let mut pool = ConstantPool::new();
        let cls = pool.intern_class("java/lang/StringBuilder")?;
        let init = pool.intern_method_ref("java/lang/StringBuilder", "<init>", "()V", false)?;
        let mut code = Code::new(0, 0);
        let at_new = code.new_label();
        code.insns = vec![
            Insn::Label(at_new),
            Insn::Type { opcode: op::NEW, index: cls },
            Insn::Simple(op::DUP),
            Insn::Invoke { opcode: op::INVOKESPECIAL, index: init },
            Insn::Simple(op::ARETURN),
        ];
        let a = analyze(&code, &sig("()Ljava/lang/Object;", true), &pool)?;
        assert_eq!(
            a.states[3].as_ref().unwrap().stack,
            vec![VType::Uninitialized(at_new), VType::Uninitialized(at_new)]
        );
        assert_eq!(
            a.states[4].as_ref().unwrap().stack,
            vec![VType::object("java/lang/StringBuilder")]
        );
        Ok(())
    }

    #[test]
    fn recompute_uses_forward_jump_state_after_goto() -> ClassResult<()> {
        let pool = ConstantPool::new();
        let mut code = Code::new(1, 1);
        let skip = code.new_label();
        let join = code.new_label();
        code.insns = vec![
            Insn::Var { opcode: op::ILOAD, index: 0 },
            Insn::Jump { opcode: op::IFEQ, target: skip },
            Insn::Simple(op::ICONST_1),
            Insn::Jump { opcode: op::GOTO, target: join },
            Insn::Label(skip),
            Insn::Simple(op::ICONST_0),
            Insn::Label(join),
            Insn::Simple(op::IRETURN),
        ];
        recompute(&mut code, &sig("(I)I", true), &pool)?;
        assert_eq!(code.frames[&skip].stack, Vec::<VType>::new());
        assert_eq!(code.frames[&join].stack, vec![VType::Integer]);
        Ok(())
    }

    #[test]
    fn unreachable_target_without_state_is_an_error() {
        let pool = ConstantPool::new();
        let mut code = Code::new(1, 1);
        let back = code.new_label();
        code.insns = vec![
            Insn::Simple(op::RETURN),
            Insn::Label(back),
            Insn::Jump { opcode: op::GOTO, target: back },
        ];
        let err = recompute(&mut code, &sig("()V", true), &pool).unwrap_err();
        assert!(matches!(err, ClassFileError::FrameUnavailable(_)));
    }

    #[test]
    fn stack_map_codec_round_trips() -> ClassResult<()> {
        let mut pool = ConstantPool::new();
        let entry = entry_frame(&sig("(J)V", true), 3)?;
        let same = Frame {
            locals: entry.locals.clone(),
            stack: Vec::new(),
        };
        let full = Frame {
            locals: vec![VType::Long, VType::Top, VType::object("java/lang/String")],
            stack: vec![VType::Integer],
        };
        let l0 = Label(0);
        let l1 = Label(1);
        let labels = HashMap::from([(l0, 5usize), (l1, 100usize)]);
        let mut frames = vec![(100usize, &full), (5usize, &same), (5usize, &same)];
        let encoded = encode_stack_map(&mut frames, &entry, &mut pool, &labels)?;
        assert_eq!(&encoded[..3], &[0, 2, 5]);

        let by_offset = HashMap::from([(5usize, l0), (100usize, l1)]);
        let decoded = decode_stack_map(&encoded, &pool, &entry, &mut |off| {
            by_offset
                .get(&off)
                .copied()
                .ok_or(ClassFileError::BadStackMap("unexpected offset".into()))
        })?;
        assert_eq!(decoded, vec![(l0, same.clone()), (l1, full.clone())]);
        Ok(())
    }
}
