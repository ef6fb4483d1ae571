//! Method bytecode as an editable instruction list.
//!
//! Branch targets, exception ranges, frame positions and `new` sites are symbolic
//! [`Label`]s, so instructions can be inserted anywhere and the code re-assembled with
//! fresh offsets.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::classfile::Reader;
use crate::error::{ClassFileError, ClassResult};
use crate::frames::{self, Frame};
use crate::pool::ConstantPool;

pub mod op {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_M1: u8 = 0x02;
    pub const ICONST_0: u8 = 0x03;
    pub const ICONST_1: u8 = 0x04;
    pub const ICONST_2: u8 = 0x05;
    pub const ICONST_5: u8 = 0x08;
    pub const LCONST_0: u8 = 0x09;
    pub const LCONST_1: u8 = 0x0A;
    pub const FCONST_0: u8 = 0x0B;
    pub const FCONST_2: u8 = 0x0D;
    pub const DCONST_0: u8 = 0x0E;
    pub const DCONST_1: u8 = 0x0F;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1A;
    pub const ALOAD_3: u8 = 0x2D;
    pub const IALOAD: u8 = 0x2E;
    pub const LALOAD: u8 = 0x2F;
    pub const FALOAD: u8 = 0x30;
    pub const DALOAD: u8 = 0x31;
    pub const AALOAD: u8 = 0x32;
    pub const BALOAD: u8 = 0x33;
    pub const CALOAD: u8 = 0x34;
    pub const SALOAD: u8 = 0x35;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const FSTORE: u8 = 0x38;
    pub const DSTORE: u8 = 0x39;
    pub const ASTORE: u8 = 0x3A;
    pub const ISTORE_0: u8 = 0x3B;
    pub const ASTORE_3: u8 = 0x4E;
    pub const IASTORE: u8 = 0x4F;
    pub const LASTORE: u8 = 0x50;
    pub const FASTORE: u8 = 0x51;
    pub const DASTORE: u8 = 0x52;
    pub const AASTORE: u8 = 0x53;
    pub const BASTORE: u8 = 0x54;
    pub const CASTORE: u8 = 0x55;
    pub const SASTORE: u8 = 0x56;
    pub const POP: u8 = 0x57;
    pub const POP2: u8 = 0x58;
    pub const DUP: u8 = 0x59;
    pub const DUP_X1: u8 = 0x5A;
    pub const DUP_X2: u8 = 0x5B;
    pub const DUP2: u8 = 0x5C;
    pub const DUP2_X1: u8 = 0x5D;
    pub const DUP2_X2: u8 = 0x5E;
    pub const SWAP: u8 = 0x5F;
    pub const IADD: u8 = 0x60;
    pub const DNEG: u8 = 0x77;
    pub const ISHL: u8 = 0x78;
    pub const LXOR: u8 = 0x83;
    pub const IINC: u8 = 0x84;
    pub const I2L: u8 = 0x85;
    pub const I2F: u8 = 0x86;
    pub const I2D: u8 = 0x87;
    pub const L2I: u8 = 0x88;
    pub const L2F: u8 = 0x89;
    pub const L2D: u8 = 0x8A;
    pub const F2I: u8 = 0x8B;
    pub const F2L: u8 = 0x8C;
    pub const F2D: u8 = 0x8D;
    pub const D2I: u8 = 0x8E;
    pub const D2L: u8 = 0x8F;
    pub const D2F: u8 = 0x90;
    pub const I2B: u8 = 0x91;
    pub const I2C: u8 = 0x92;
    pub const I2S: u8 = 0x93;
    pub const LCMP: u8 = 0x94;
    pub const FCMPL: u8 = 0x95;
    pub const FCMPG: u8 = 0x96;
    pub const DCMPL: u8 = 0x97;
    pub const DCMPG: u8 = 0x98;
    pub const IFEQ: u8 = 0x99;
    pub const IFNE: u8 = 0x9A;
    pub const IFLT: u8 = 0x9B;
    pub const IFGE: u8 = 0x9C;
    pub const IFGT: u8 = 0x9D;
    pub const IFLE: u8 = 0x9E;
    pub const IF_ICMPEQ: u8 = 0x9F;
    pub const IF_ICMPLE: u8 = 0xA4;
    pub const IF_ACMPEQ: u8 = 0xA5;
    pub const IF_ACMPNE: u8 = 0xA6;
    pub const GOTO: u8 = 0xA7;
    pub const JSR: u8 = 0xA8;
    pub const RET: u8 = 0xA9;
    pub const TABLESWITCH: u8 = 0xAA;
    pub const LOOKUPSWITCH: u8 = 0xAB;
    pub const IRETURN: u8 = 0xAC;
    pub const LRETURN: u8 = 0xAD;
    pub const FRETURN: u8 = 0xAE;
    pub const DRETURN: u8 = 0xAF;
    pub const ARETURN: u8 = 0xB0;
    pub const RETURN: u8 = 0xB1;
    pub const GETSTATIC: u8 = 0xB2;
    pub const PUTSTATIC: u8 = 0xB3;
    pub const GETFIELD: u8 = 0xB4;
    pub const PUTFIELD: u8 = 0xB5;
    pub const INVOKEVIRTUAL: u8 = 0xB6;
    pub const INVOKESPECIAL: u8 = 0xB7;
    pub const INVOKESTATIC: u8 = 0xB8;
    pub const INVOKEINTERFACE: u8 = 0xB9;
    pub const INVOKEDYNAMIC: u8 = 0xBA;
    pub const NEW: u8 = 0xBB;
    pub const NEWARRAY: u8 = 0xBC;
    pub const ANEWARRAY: u8 = 0xBD;
    pub const ARRAYLENGTH: u8 = 0xBE;
    pub const ATHROW: u8 = 0xBF;
    pub const CHECKCAST: u8 = 0xC0;
    pub const INSTANCEOF: u8 = 0xC1;
    pub const MONITORENTER: u8 = 0xC2;
    pub const MONITOREXIT: u8 = 0xC3;
    pub const WIDE: u8 = 0xC4;
    pub const MULTIANEWARRAY: u8 = 0xC5;
    pub const IFNULL: u8 = 0xC6;
    pub const IFNONNULL: u8 = 0xC7;
    pub const GOTO_W: u8 = 0xC8;
    pub const JSR_W: u8 = 0xC9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    Label(Label),
    /// Any opcode without operands.
    Simple(u8),
    /// `xload`/`xstore`/`ret` in long form; short and wide forms are chosen when encoding.
    Var { opcode: u8, index: u16 },
    Iinc { index: u16, delta: i16 },
    /// `bipush` or `sipush`.
    Push { opcode: u8, value: i16 },
    /// `ldc` or `ldc_w`, whichever fits the index.
    Ldc { index: u16 },
    Ldc2 { index: u16 },
    Field { opcode: u8, index: u16 },
    /// `invokevirtual`, `invokespecial` or `invokestatic`.
    Invoke { opcode: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    /// `new`, `anewarray`, `checkcast` or `instanceof`.
    Type { opcode: u8, index: u16 },
    NewArray { atype: u8 },
    MultiANewArray { index: u16, dims: u8 },
    /// Conditional branches, `goto` and `jsr`; the `_w` forms are chosen when encoding.
    Jump { opcode: u8, target: Label },
    TableSwitch { default: Label, low: i32, targets: Vec<Label> },
    LookupSwitch { default: Label, pairs: Vec<(i32, Label)> },
}

impl Insn {
    pub fn opcode(&self) -> Option<u8> {
        Some(match self {
            Insn::Label(_) => return None,
            Insn::Simple(op) => *op,
            Insn::Var { opcode, .. }
            | Insn::Push { opcode, .. }
            | Insn::Field { opcode, .. }
            | Insn::Invoke { opcode, .. }
            | Insn::Type { opcode, .. }
            | Insn::Jump { opcode, .. } => *opcode,
            Insn::Iinc { .. } => op::IINC,
            Insn::Ldc { .. } => op::LDC,
            Insn::Ldc2 { .. } => op::LDC2_W,
            Insn::InvokeInterface { .. } => op::INVOKEINTERFACE,
            Insn::InvokeDynamic { .. } => op::INVOKEDYNAMIC,
            Insn::NewArray { .. } => op::NEWARRAY,
            Insn::MultiANewArray { .. } => op::MULTIANEWARRAY,
            Insn::TableSwitch { .. } => op::TABLESWITCH,
            Insn::LookupSwitch { .. } => op::LOOKUPSWITCH,
        })
    }

    /// Labels this instruction may transfer control to.
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Insn::Jump { target, .. } => vec![*target],
            Insn::TableSwitch { default, targets, .. } => {
                let mut all = vec![*default];
                all.extend(targets.iter().copied());
                all
            }
            Insn::LookupSwitch { default, pairs } => {
                let mut all = vec![*default];
                all.extend(pairs.iter().map(|(_, l)| *l));
                all
            }
            _ => Vec::new(),
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Insn::Jump { .. } | Insn::TableSwitch { .. } | Insn::LookupSwitch { .. }
        )
    }

    /// True when execution never falls through to the next instruction.
    pub fn ends_flow(&self) -> bool {
        match self {
            Insn::Jump { opcode, .. } => *opcode == op::GOTO,
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => true,
            Insn::Var { opcode, .. } => *opcode == op::RET,
            Insn::Simple(opcode) => {
                matches!(*opcode, op::IRETURN..=op::RETURN | op::ATHROW)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// Class constant of the caught type, 0 for `finally`.
    pub catch_type: u16,
}

/// Identity of the method a code body belongs to; needed to derive its entry frame.
#[derive(Debug, Clone)]
pub struct MethodSig<'a> {
    pub class_name: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
    pub is_static: bool,
}

/// Byte positions of a code body under one encoding.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Offset of each entry in `Code::insns`.
    pub offsets: Vec<usize>,
    pub labels: HashMap<Label, usize>,
    pub len: usize,
    wide_jumps: HashSet<usize>,
}

#[derive(Debug, Clone)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub insns: Vec<Insn>,
    pub handlers: Vec<Handler>,
    pub frames: HashMap<Label, Frame>,
    next_label: usize,
}

impl Code {
    pub fn new(max_stack: u16, max_locals: u16) -> Self {
        Self {
            max_stack,
            max_locals,
            insns: Vec::new(),
            handlers: Vec::new(),
            frames: HashMap::new(),
            next_label: 0,
        }
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Decodes the body of a `Code` attribute.
    pub fn parse(data: &[u8], pool: &ConstantPool, sig: &MethodSig<'_>) -> ClassResult<Self> {
        let mut r = Reader::new(data);
        let max_stack = r.u16()?;
        let max_locals = r.u16()?;
        let code_len = r.u32()? as usize;
        let bytecode = r.bytes(code_len)?;

        let mut labels: BTreeMap<usize, Label> = BTreeMap::new();
        let mut next_label = 0usize;
        let mut label_at = |offset: usize, labels: &mut BTreeMap<usize, Label>| -> Label {
            *labels.entry(offset).or_insert_with(|| {
                let l = Label(next_label);
                next_label += 1;
                l
            })
        };

        let mut decoded: Vec<(usize, Insn)> = Vec::new();
        let mut boundaries: HashSet<usize> = HashSet::new();
        let mut pos = 0usize;
        while pos < code_len {
            boundaries.insert(pos);
            let (insn, size) = decode_one(bytecode, pos, &mut |target: i64| {
                if target < 0 || target as usize >= code_len {
                    return Err(ClassFileError::BadBranchTarget {
                        target,
                        len: code_len,
                    });
                }
                Ok(label_at(target as usize, &mut labels))
            })?;
            if matches!(insn, Insn::Type { opcode: op::NEW, .. }) {
                label_at(pos, &mut labels);
            }
            decoded.push((pos, insn));
            pos += size;
        }
        boundaries.insert(code_len);

        let mut handlers = Vec::new();
        let handler_count = r.u16()?;
        for _ in 0..handler_count {
            let start = r.u16()? as usize;
            let end = r.u16()? as usize;
            let handler = r.u16()? as usize;
            let catch_type = r.u16()?;
            for off in [start, end, handler] {
                if !boundaries.contains(&off) {
                    return Err(ClassFileError::BadBranchTarget {
                        target: off as i64,
                        len: code_len,
                    });
                }
            }
            handlers.push(Handler {
                start: label_at(start, &mut labels),
                end: label_at(end, &mut labels),
                handler: label_at(handler, &mut labels),
                catch_type,
            });
        }

        let mut frames = HashMap::new();
        let attr_count = r.u16()?;
        for _ in 0..attr_count {
            let name_index = r.u16()?;
            let len = r.u32()? as usize;
            let body = r.bytes(len)?;
            if pool.utf8(name_index)? == "StackMapTable" {
                let entry = frames::entry_frame(sig, max_locals)?;
                let decoded = frames::decode_stack_map(body, pool, &entry, &mut |off| {
                    if !boundaries.contains(&off) || off >= code_len {
                        return Err(ClassFileError::BadStackMap(format!(
                            "offset {off} is not an instruction"
                        )));
                    }
                    Ok(label_at(off, &mut labels))
                })?;
                frames.extend(decoded);
            }
        }

        for off in labels.keys() {
            if !boundaries.contains(off) {
                return Err(ClassFileError::BadBranchTarget {
                    target: *off as i64,
                    len: code_len,
                });
            }
        }

        let mut insns = Vec::with_capacity(decoded.len() + labels.len());
        for (offset, insn) in decoded {
            if let Some(label) = labels.get(&offset) {
                insns.push(Insn::Label(*label));
            }
            insns.push(insn);
        }
        if let Some(label) = labels.get(&code_len) {
            insns.push(Insn::Label(*label));
        }

        Ok(Self {
            max_stack,
            max_locals,
            insns,
            handlers,
            frames,
            next_label,
        })
    }

    /// Assigns byte offsets, widening `goto`/`jsr` until every branch fits.
    pub fn layout(&self) -> ClassResult<Layout> {
        let mut wide_jumps: HashSet<usize> = HashSet::new();
        loop {
            let mut offsets = Vec::with_capacity(self.insns.len());
            let mut label_offsets = HashMap::new();
            let mut pos = 0usize;
            for (i, insn) in self.insns.iter().enumerate() {
                offsets.push(pos);
                if let Insn::Label(l) = insn {
                    label_offsets.insert(*l, pos);
                }
                pos += insn_size(insn, pos, wide_jumps.contains(&i));
            }

            let mut changed = false;
            for (i, insn) in self.insns.iter().enumerate() {
                let Insn::Jump { opcode, target } = insn else {
                    continue;
                };
                if wide_jumps.contains(&i) {
                    continue;
                }
                let to = *label_offsets
                    .get(target)
                    .ok_or(ClassFileError::UnboundLabel(target.0))?;
                let delta = to as i64 - offsets[i] as i64;
                if i16::try_from(delta).is_err() {
                    if *opcode == op::GOTO || *opcode == op::JSR {
                        wide_jumps.insert(i);
                        changed = true;
                    } else {
                        return Err(ClassFileError::BranchOutOfRange(delta));
                    }
                }
            }
            if !changed {
                if pos > u16::MAX as usize {
                    return Err(ClassFileError::CodeTooLarge(pos));
                }
                return Ok(Layout {
                    offsets,
                    labels: label_offsets,
                    len: pos,
                    wide_jumps,
                });
            }
        }
    }

    /// Re-encodes the body of the `Code` attribute. Frames are emitted for class
    /// versions that carry a StackMapTable.
    pub fn assemble(
        &self,
        pool: &mut ConstantPool,
        sig: &MethodSig<'_>,
        with_frames: bool,
    ) -> ClassResult<Vec<u8>> {
        let Layout {
            offsets,
            labels: label_offsets,
            len: code_len,
            wide_jumps,
        } = self.layout()?;

        let mut bytecode = Vec::with_capacity(code_len);
        for (i, insn) in self.insns.iter().enumerate() {
            let at = offsets[i];
            debug_assert_eq!(bytecode.len(), at);
            encode_one(insn, at, wide_jumps.contains(&i), &label_offsets, &mut bytecode)?;
        }

        let mut out = Vec::with_capacity(code_len + 32);
        out.extend_from_slice(&self.max_stack.to_be_bytes());
        out.extend_from_slice(&self.max_locals.to_be_bytes());
        out.extend_from_slice(&(code_len as u32).to_be_bytes());
        out.extend_from_slice(&bytecode);

        let resolve = |l: &Label| -> ClassResult<usize> {
            label_offsets
                .get(l)
                .copied()
                .ok_or(ClassFileError::UnboundLabel(l.0))
        };
        let mut table = Vec::new();
        for h in &self.handlers {
            let start = resolve(&h.start)?;
            let end = resolve(&h.end)?;
            if start >= end {
                continue;
            }
            table.push((start, end, resolve(&h.handler)?, h.catch_type));
        }
        out.extend_from_slice(&(table.len() as u16).to_be_bytes());
        for (start, end, handler, catch_type) in table {
            out.extend_from_slice(&(start as u16).to_be_bytes());
            out.extend_from_slice(&(end as u16).to_be_bytes());
            out.extend_from_slice(&(handler as u16).to_be_bytes());
            out.extend_from_slice(&catch_type.to_be_bytes());
        }

        // When several labels share an offset, the frame of the last one describes the
        // instruction there.
        let mut by_offset: BTreeMap<usize, &Frame> = BTreeMap::new();
        if with_frames {
            for insn in &self.insns {
                if let Insn::Label(label) = insn
                    && let Some(frame) = self.frames.get(label)
                {
                    let offset = resolve(label)?;
                    if offset < code_len {
                        by_offset.insert(offset, frame);
                    }
                }
            }
        }
        let mut positioned: Vec<(usize, &Frame)> = by_offset.into_iter().collect();
        if positioned.is_empty() {
            out.extend_from_slice(&0u16.to_be_bytes());
        } else {
            let entry = frames::entry_frame(sig, self.max_locals)?;
            let body = frames::encode_stack_map(&mut positioned, &entry, pool, &label_offsets)?;
            let name = pool.intern_utf8("StackMapTable")?;
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&name.to_be_bytes());
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            out.extend_from_slice(&body);
        }
        Ok(out)
    }

    /// Index of the first real instruction at or after `from`.
    pub fn next_real(&self, from: usize) -> Option<usize> {
        (from..self.insns.len()).find(|&i| !matches!(self.insns[i], Insn::Label(_)))
    }

    pub fn insert(&mut self, at: usize, insns: Vec<Insn>) {
        self.insns.splice(at..at, insns);
    }

    /// Labels that need a frame: branch targets and exception handlers.
    pub fn frame_targets(&self) -> HashSet<Label> {
        let mut targets: HashSet<Label> = self
            .insns
            .iter()
            .flat_map(|i| i.targets())
            .collect();
        targets.extend(self.handlers.iter().map(|h| h.handler));
        targets
    }
}

fn short_var_base(opcode: u8) -> Option<u8> {
    match opcode {
        op::ILOAD..=op::ALOAD => Some(op::ILOAD_0 + (opcode - op::ILOAD) * 4),
        op::ISTORE..=op::ASTORE => Some(op::ISTORE_0 + (opcode - op::ISTORE) * 4),
        _ => None,
    }
}

fn switch_padding(at: usize) -> usize {
    (4 - (at + 1) % 4) % 4
}

fn insn_size(insn: &Insn, at: usize, wide_jump: bool) -> usize {
    match insn {
        Insn::Label(_) => 0,
        Insn::Simple(_) => 1,
        Insn::Var { opcode, index } => {
            if *index <= 3 && short_var_base(*opcode).is_some() {
                1
            } else if *index <= 0xFF {
                2
            } else {
                4
            }
        }
        Insn::Iinc { index, delta } => {
            if *index <= 0xFF && i8::try_from(*delta).is_ok() {
                3
            } else {
                6
            }
        }
        Insn::Push { opcode, .. } => {
            if *opcode == op::BIPUSH {
                2
            } else {
                3
            }
        }
        Insn::Ldc { index } => {
            if *index <= 0xFF {
                2
            } else {
                3
            }
        }
        Insn::Ldc2 { .. } | Insn::Field { .. } | Insn::Invoke { .. } | Insn::Type { .. } => 3,
        Insn::InvokeInterface { .. } | Insn::InvokeDynamic { .. } => 5,
        Insn::NewArray { .. } => 2,
        Insn::MultiANewArray { .. } => 4,
        Insn::Jump { .. } => {
            if wide_jump {
                5
            } else {
                3
            }
        }
        Insn::TableSwitch { targets, .. } => 1 + switch_padding(at) + 12 + 4 * targets.len(),
        Insn::LookupSwitch { pairs, .. } => 1 + switch_padding(at) + 8 + 8 * pairs.len(),
    }
}

fn decode_one(
    code: &[u8],
    at: usize,
    target: &mut dyn FnMut(i64) -> ClassResult<Label>,
) -> ClassResult<(Insn, usize)> {
    let mut r = Reader::at(code, at);
    let opcode = r.u8()?;
    let rel = |delta: i64| at as i64 + delta;
    let insn = match opcode {
        op::NOP..=op::DCONST_1
        | op::IALOAD..=op::SALOAD
        | op::IASTORE..=op::LXOR
        | op::I2L..=op::DCMPG
        | op::IRETURN..=op::RETURN
        | op::ARRAYLENGTH
        | op::ATHROW
        | op::MONITORENTER
        | op::MONITOREXIT => Insn::Simple(opcode),
        op::BIPUSH => Insn::Push {
            opcode,
            value: r.u8()? as i8 as i16,
        },
        op::SIPUSH => Insn::Push {
            opcode,
            value: r.u16()? as i16,
        },
        op::LDC => Insn::Ldc { index: r.u8()? as u16 },
        op::LDC_W => Insn::Ldc { index: r.u16()? },
        op::LDC2_W => Insn::Ldc2 { index: r.u16()? },
        op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE | op::RET => Insn::Var {
            opcode,
            index: r.u8()? as u16,
        },
        op::ILOAD_0..=op::ALOAD_3 => Insn::Var {
            opcode: op::ILOAD + (opcode - op::ILOAD_0) / 4,
            index: ((opcode - op::ILOAD_0) % 4) as u16,
        },
        op::ISTORE_0..=op::ASTORE_3 => Insn::Var {
            opcode: op::ISTORE + (opcode - op::ISTORE_0) / 4,
            index: ((opcode - op::ISTORE_0) % 4) as u16,
        },
        op::IINC => Insn::Iinc {
            index: r.u8()? as u16,
            delta: r.u8()? as i8 as i16,
        },
        op::IFEQ..=op::JSR | op::IFNULL | op::IFNONNULL => {
            let delta = r.u16()? as i16 as i64;
            Insn::Jump {
                opcode,
                target: target(rel(delta))?,
            }
        }
        op::GOTO_W | op::JSR_W => {
            let delta = r.u32()? as i32 as i64;
            Insn::Jump {
                opcode: if opcode == op::GOTO_W { op::GOTO } else { op::JSR },
                target: target(rel(delta))?,
            }
        }
        op::TABLESWITCH => {
            r.skip(switch_padding(at))?;
            let default = target(rel(r.u32()? as i32 as i64))?;
            let low = r.u32()? as i32;
            let high = r.u32()? as i32;
            if high < low {
                return Err(ClassFileError::UnknownOpcode { opcode, offset: at });
            }
            let mut targets = Vec::with_capacity((high as i64 - low as i64 + 1) as usize);
            for _ in low as i64..=high as i64 {
                targets.push(target(rel(r.u32()? as i32 as i64))?);
            }
            Insn::TableSwitch {
                default,
                low,
                targets,
            }
        }
        op::LOOKUPSWITCH => {
            r.skip(switch_padding(at))?;
            let default = target(rel(r.u32()? as i32 as i64))?;
            let npairs = r.u32()? as i32;
            if npairs < 0 {
                return Err(ClassFileError::UnknownOpcode { opcode, offset: at });
            }
            let mut pairs = Vec::with_capacity(npairs as usize);
            for _ in 0..npairs {
                let key = r.u32()? as i32;
                pairs.push((key, target(rel(r.u32()? as i32 as i64))?));
            }
            Insn::LookupSwitch { default, pairs }
        }
        op::GETSTATIC..=op::PUTFIELD => Insn::Field {
            opcode,
            index: r.u16()?,
        },
        op::INVOKEVIRTUAL..=op::INVOKESTATIC => Insn::Invoke {
            opcode,
            index: r.u16()?,
        },
        op::INVOKEINTERFACE => {
            let index = r.u16()?;
            let count = r.u8()?;
            r.u8()?;
            Insn::InvokeInterface { index, count }
        }
        op::INVOKEDYNAMIC => {
            let index = r.u16()?;
            r.u16()?;
            Insn::InvokeDynamic { index }
        }
        op::NEW | op::ANEWARRAY | op::CHECKCAST | op::INSTANCEOF => Insn::Type {
            opcode,
            index: r.u16()?,
        },
        op::NEWARRAY => Insn::NewArray { atype: r.u8()? },
        op::MULTIANEWARRAY => Insn::MultiANewArray {
            index: r.u16()?,
            dims: r.u8()?,
        },
        op::WIDE => {
            let inner = r.u8()?;
            match inner {
                op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE | op::RET => Insn::Var {
                    opcode: inner,
                    index: r.u16()?,
                },
                op::IINC => Insn::Iinc {
                    index: r.u16()?,
                    delta: r.u16()? as i16,
                },
                _ => {
                    return Err(ClassFileError::UnknownOpcode {
                        opcode: inner,
                        offset: at + 1,
                    });
                }
            }
        }
        _ => return Err(ClassFileError::UnknownOpcode { opcode, offset: at }),
    };
    Ok((insn, r.position() - at))
}

fn encode_one(
    insn: &Insn,
    at: usize,
    wide_jump: bool,
    labels: &HashMap<Label, usize>,
    out: &mut Vec<u8>,
) -> ClassResult<()> {
    let offset_of = |l: &Label| -> ClassResult<i64> {
        labels
            .get(l)
            .map(|o| *o as i64 - at as i64)
            .ok_or(ClassFileError::UnboundLabel(l.0))
    };
    match insn {
        Insn::Label(_) => {}
        Insn::Simple(opcode) => out.push(*opcode),
        Insn::Var { opcode, index } => match short_var_base(*opcode) {
            Some(base) if *index <= 3 => out.push(base + *index as u8),
            _ if *index <= 0xFF => {
                out.push(*opcode);
                out.push(*index as u8);
            }
            _ => {
                out.push(op::WIDE);
                out.push(*opcode);
                out.extend_from_slice(&index.to_be_bytes());
            }
        },
        Insn::Iinc { index, delta } => {
            if *index <= 0xFF && i8::try_from(*delta).is_ok() {
                out.push(op::IINC);
                out.push(*index as u8);
                out.push(*delta as i8 as u8);
            } else {
                out.push(op::WIDE);
                out.push(op::IINC);
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&delta.to_be_bytes());
            }
        }
        Insn::Push { opcode, value } => {
            out.push(*opcode);
            if *opcode == op::BIPUSH {
                out.push(*value as i8 as u8);
            } else {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
        Insn::Ldc { index } => {
            if *index <= 0xFF {
                out.push(op::LDC);
                out.push(*index as u8);
            } else {
                out.push(op::LDC_W);
                out.extend_from_slice(&index.to_be_bytes());
            }
        }
        Insn::Ldc2 { index } => {
            out.push(op::LDC2_W);
            out.extend_from_slice(&index.to_be_bytes());
        }
        Insn::Field { opcode, index }
        | Insn::Invoke { opcode, index }
        | Insn::Type { opcode, index } => {
            out.push(*opcode);
            out.extend_from_slice(&index.to_be_bytes());
        }
        Insn::InvokeInterface { index, count } => {
            out.push(op::INVOKEINTERFACE);
            out.extend_from_slice(&index.to_be_bytes());
            out.push(*count);
            out.push(0);
        }
        Insn::InvokeDynamic { index } => {
            out.push(op::INVOKEDYNAMIC);
            out.extend_from_slice(&index.to_be_bytes());
            out.extend_from_slice(&[0, 0]);
        }
        Insn::NewArray { atype } => {
            out.push(op::NEWARRAY);
            out.push(*atype);
        }
        Insn::MultiANewArray { index, dims } => {
            out.push(op::MULTIANEWARRAY);
            out.extend_from_slice(&index.to_be_bytes());
            out.push(*dims);
        }
        Insn::Jump { opcode, target } => {
            let delta = offset_of(target)?;
            if wide_jump {
                out.push(if *opcode == op::GOTO { op::GOTO_W } else { op::JSR_W });
                out.extend_from_slice(&(delta as i32).to_be_bytes());
            } else {
                let short = i16::try_from(delta).map_err(|_| ClassFileError::BranchOutOfRange(delta))?;
                out.push(*opcode);
                out.extend_from_slice(&short.to_be_bytes());
            }
        }
        Insn::TableSwitch {
            default,
            low,
            targets,
        } => {
            out.push(op::TABLESWITCH);
            out.extend(std::iter::repeat_n(0u8, switch_padding(at)));
            out.extend_from_slice(&(offset_of(default)? as i32).to_be_bytes());
            out.extend_from_slice(&low.to_be_bytes());
            let high = *low as i64 + targets.len() as i64 - 1;
            out.extend_from_slice(&(high as i32).to_be_bytes());
            for t in targets {
                out.extend_from_slice(&(offset_of(t)? as i32).to_be_bytes());
            }
        }
        Insn::LookupSwitch { default, pairs } => {
            out.push(op::LOOKUPSWITCH);
            out.extend(std::iter::repeat_n(0u8, switch_padding(at)));
            out.extend_from_slice(&(offset_of(default)? as i32).to_be_bytes());
            out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
            for (key, t) in pairs {
                out.extend_from_slice(&key.to_be_bytes());
                out.extend_from_slice(&(offset_of(t)? as i32).to_be_bytes());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig() -> MethodSig<'static> {
        MethodSig {
            class_name: "demo/A",
            name: "run",
            descriptor: "(I)I",
            is_static: true,
        }
    }

    fn code_attr(max_stack: u16, max_locals: u16, bytecode: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&max_stack.to_be_bytes());
        data.extend_from_slice(&max_locals.to_be_bytes());
        data.extend_from_slice(&(bytecode.len() as u32).to_be_bytes());
        data.extend_from_slice(bytecode);
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data
    }

    #[test]
    fn decode_normalizes_short_forms_and_reencodes_identically() -> ClassResult<()> {
        // iload_0; iconst_1; iadd; istore_0; iload_0; ireturn
        let bytecode = [0x1A, 0x04, 0x60, 0x3B, 0x1A, 0xAC];
        let pool = ConstantPool::new();
        let code = Code::parse(&code_attr(2, 1, &bytecode), &pool, &sig())?;
        assert_eq!(code.insns[0], Insn::Var { opcode: op::ILOAD, index: 0 });
        assert_eq!(code.insns[3], Insn::Var { opcode: op::ISTORE, index: 0 });

        let mut pool = pool;
        let out = code.assemble(&mut pool, &sig(), false)?;
        assert_eq!(out, code_attr(2, 1, &bytecode));
        Ok(())
    }

    #[test]
    fn branches_become_labels_and_survive_insertion() -> ClassResult<()> {
        // 0: iload_0; 1: ifeq +5 (-> 6); 4: iconst_1; 5: ireturn; 6: iconst_0; 7: ireturn
        let bytecode = [0x1A, 0x99, 0x00, 0x05, 0x04, 0xAC, 0x03, 0xAC];
        let pool = ConstantPool::new();
        let mut code = Code::parse(&code_attr(1, 1, &bytecode), &pool, &sig())?;

        let jump_target = code
            .insns
            .iter()
            .find_map(|i| match i {
                Insn::Jump { target, .. } => Some(*target),
                _ => None,
            })
            .unwrap();
        code.insert(0, vec![Insn::Simple(op::NOP), Insn::Simple(op::NOP)]);

        let layout = code.layout()?;
        let len = layout.len;
        assert_eq!(len, bytecode.len() + 2);
        assert_eq!(layout.labels[&jump_target], 8);

        let mut pool = pool;
        let out = code.assemble(&mut pool, &sig(), false)?;
        let body = &out[8..8 + len];
        assert_eq!(&body[..5], &[0x00, 0x00, 0x1A, 0x99, 0x00]);
        assert_eq!(body[5], 0x05);
        Ok(())
    }

    #[test]
    fn wide_locals_use_the_wide_prefix() -> ClassResult<()> {
        let mut code = Code::new(1, 300);
        code.insns.push(Insn::Var { opcode: op::ILOAD, index: 299 });
        code.insns.push(Insn::Iinc { index: 299, delta: 1000 });
        code.insns.push(Insn::Simple(op::IRETURN));
        let mut pool = ConstantPool::new();
        let out = code.assemble(&mut pool, &sig(), false)?;
        let reparsed = Code::parse(&out, &pool, &sig())?;
        assert_eq!(reparsed.insns, code.insns);
        Ok(())
    }

    #[test]
    fn tableswitch_padding_follows_offset() -> ClassResult<()> {
        let mut code = Code::new(1, 1);
        let a = code.new_label();
        let b = code.new_label();
        code.insns = vec![
            Insn::Var { opcode: op::ILOAD, index: 0 },
            Insn::TableSwitch { default: b, low: 0, targets: vec![a, b] },
            Insn::Label(a),
            Insn::Simple(op::ICONST_1),
            Insn::Simple(op::IRETURN),
            Insn::Label(b),
            Insn::Simple(op::ICONST_0),
            Insn::Simple(op::IRETURN),
        ];
        let layout = code.layout()?;
        // switch at 1 pads 2 bytes to reach 4.
        assert_eq!(layout.offsets[2], 1 + 1 + 2 + 12 + 8);
        assert_eq!(layout.len, layout.offsets[2] + 4);

        let mut pool = ConstantPool::new();
        let out = code.assemble(&mut pool, &sig(), false)?;
        let reparsed = Code::parse(&out, &pool, &sig())?;
        assert!(matches!(reparsed.insns[1], Insn::TableSwitch { low: 0, .. }));
        Ok(())
    }

    #[test]
    fn far_goto_is_widened() -> ClassResult<()> {
        let mut code = Code::new(0, 1);
        let end = code.new_label();
        code.insns.push(Insn::Jump { opcode: op::GOTO, target: end });
        code.insns.extend(std::iter::repeat_n(Insn::Simple(op::NOP), 40_000));
        code.insns.push(Insn::Label(end));
        code.insns.push(Insn::Simple(op::RETURN));

        let out = code.assemble(&mut ConstantPool::new(), &sig(), false)?;
        let bytecode = &out[8..];
        assert_eq!(bytecode[0], op::GOTO_W);
        assert_eq!(i32::from_be_bytes([bytecode[1], bytecode[2], bytecode[3], bytecode[4]]), 40_005);
        assert_eq!(bytecode[40_005], op::RETURN);

        let parsed = Code::parse(&out, &ConstantPool::new(), &sig())?;
        assert!(matches!(parsed.insns[0], Insn::Jump { opcode: op::GOTO, .. }));
        Ok(())
    }

    #[test]
    fn far_conditional_branch_is_rejected() {
        let mut code = Code::new(1, 1);
        let end = code.new_label();
        code.insns.push(Insn::Simple(op::ICONST_0));
        code.insns.push(Insn::Jump { opcode: op::IFEQ, target: end });
        code.insns.extend(std::iter::repeat_n(Insn::Simple(op::NOP), 40_000));
        code.insns.push(Insn::Label(end));
        code.insns.push(Insn::Simple(op::RETURN));

        let err = code.layout().unwrap_err();
        assert!(matches!(err, ClassFileError::BranchOutOfRange(40_003)));
    }

    #[test]
    fn oversized_code_is_rejected() {
        let mut code = Code::new(0, 1);
        code.insns.extend(std::iter::repeat_n(Insn::Simple(op::NOP), 70_000));
        code.insns.push(Insn::Simple(op::RETURN));
        let err = code.assemble(&mut ConstantPool::new(), &sig(), false).unwrap_err();
        assert!(matches!(err, ClassFileError::CodeTooLarge(70_001)));
    }

    #[test]
    fn jump_to_a_label_that_is_not_placed_is_reported() {
        let mut code = Code::new(0, 1);
        let nowhere = code.new_label();
        code.insns.push(Insn::Jump { opcode: op::GOTO, target: nowhere });
        let err = code.layout().unwrap_err();
        assert!(matches!(err, ClassFileError::UnboundLabel(_)));
    }

    #[test]
    fn branch_outside_code_is_rejected() {
        let bytecode = [0xA7, 0x00, 0x10];
        let pool = ConstantPool::new();
        let err = Code::parse(&code_attr(0, 1, &bytecode), &pool, &sig()).unwrap_err();
        assert!(matches!(err, ClassFileError::BadBranchTarget { .. }));
    }
}
