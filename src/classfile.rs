//! Class-file model: read with debug information stripped, written back with code
//! reassembled and frames recomputed.

use crate::bytecode::{Code, MethodSig};
use crate::error::{ClassFileError, ClassResult};
use crate::frames;
use crate::pool::ConstantPool;

pub const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_MODULE: u16 = 0x8000;

/// First class-file version whose methods carry a StackMapTable.
pub const FRAMES_VERSION: u16 = 50;

const CLASS_DEBUG_ATTRIBUTES: &[&str] = &["SourceFile", "SourceDebugExtension"];
const METHOD_DEBUG_ATTRIBUTES: &[&str] = &["MethodParameters"];

/// Big-endian cursor over class-file data.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn bytes(&mut self, len: usize) -> ClassResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(ClassFileError::UnexpectedEof(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> ClassResult<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> ClassResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> ClassResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> ClassResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> ClassResult<u64> {
        let hi = self.u32()? as u64;
        let lo = self.u32()? as u64;
        Ok((hi << 32) | lo)
    }
}

/// An attribute kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: u16,
    pub data: Vec<u8>,
}

/// A field or a method. Only methods carry `code`.
#[derive(Debug, Clone)]
pub struct Member {
    pub access: u16,
    pub name: u16,
    pub descriptor: u16,
    pub attributes: Vec<Attribute>,
    pub code: Option<Code>,
}

impl Member {
    pub fn is_static(&self) -> bool {
        self.access & ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.access & ACC_NATIVE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access & ACC_ABSTRACT != 0
    }
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor: u16,
    pub major: u16,
    pub pool: ConstantPool,
    pub access: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Member>,
    pub methods: Vec<Member>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// An empty class extending `super_name`.
    pub fn new(name: &str, super_name: &str, access: u16, major: u16) -> ClassResult<Self> {
        let mut pool = ConstantPool::new();
        let this_class = pool.intern_class(name)?;
        let super_class = pool.intern_class(super_name)?;
        Ok(Self {
            minor: 0,
            major,
            pool,
            access,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub fn parse(data: &[u8]) -> ClassResult<Self> {
        let mut r = Reader::new(data);
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let minor = r.u16()?;
        let major = r.u16()?;
        let pool = ConstantPool::parse(&mut r)?;
        let access = r.u16()?;
        let this_class = r.u16()?;
        let super_class = r.u16()?;
        let this_name = pool.class_name(this_class)?;
        if super_class != 0 {
            pool.class_name(super_class)?;
        }

        let interface_count = r.u16()?;
        let interfaces = (0..interface_count)
            .map(|_| r.u16())
            .collect::<ClassResult<Vec<_>>>()?;

        let field_count = r.u16()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let access = r.u16()?;
            let name = r.u16()?;
            let descriptor = r.u16()?;
            let attributes = read_attributes(&mut r, &pool, &[])?;
            fields.push(Member {
                access,
                name,
                descriptor,
                attributes,
                code: None,
            });
        }

        let method_count = r.u16()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            let access = r.u16()?;
            let name = r.u16()?;
            let descriptor = r.u16()?;
            let mut attributes = read_attributes(&mut r, &pool, METHOD_DEBUG_ATTRIBUTES)?;
            let mut code = None;
            if let Some(pos) = attributes
                .iter()
                .position(|a| pool.utf8_bytes(a.name).is_ok_and(|n| n == b"Code"))
            {
                let raw = attributes.remove(pos);
                let method_name = pool.utf8(name)?;
                let method_descriptor = pool.utf8(descriptor)?;
                let sig = MethodSig {
                    class_name: &this_name,
                    name: &method_name,
                    descriptor: &method_descriptor,
                    is_static: access & ACC_STATIC != 0,
                };
                code = Some(Code::parse(&raw.data, &pool, &sig)?);
            }
            methods.push(Member {
                access,
                name,
                descriptor,
                attributes,
                code,
            });
        }

        let attributes = read_attributes(&mut r, &pool, CLASS_DEBUG_ATTRIBUTES)?;
        if r.remaining() != 0 {
            return Err(ClassFileError::BadAttribute {
                name: "ClassFile".into(),
                reason: format!("{} trailing bytes", r.remaining()),
            });
        }

        Ok(Self {
            minor,
            major,
            pool,
            access,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    /// Serializes the class. Frames are recomputed for versions that carry them, so `code`
    /// bodies may be edited freely beforehand.
    pub fn to_bytes(&mut self) -> ClassResult<Vec<u8>> {
        let this_name = self.this_name()?;
        let with_frames = self.major >= FRAMES_VERSION;
        let mut code_attrs: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.methods.len());
        for method in &mut self.methods {
            let Some(code) = method.code.as_mut() else {
                code_attrs.push(None);
                continue;
            };
            let name = self.pool.utf8(method.name)?;
            let descriptor = self.pool.utf8(method.descriptor)?;
            let sig = MethodSig {
                class_name: &this_name,
                name: &name,
                descriptor: &descriptor,
                is_static: method.access & ACC_STATIC != 0,
            };
            if with_frames {
                frames::recompute(code, &sig, &self.pool)?;
            }
            code_attrs.push(Some(code.assemble(&mut self.pool, &sig, with_frames)?));
        }
        let code_name = if code_attrs.iter().any(Option::is_some) {
            self.pool.intern_utf8("Code")?
        } else {
            0
        };

        let mut out = Vec::with_capacity(4096);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&self.minor.to_be_bytes());
        out.extend_from_slice(&self.major.to_be_bytes());
        self.pool.write(&mut out)?;
        out.extend_from_slice(&self.access.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        write_u16_list(&mut out, &self.interfaces);

        out.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for field in &self.fields {
            write_member_header(&mut out, field);
            write_attributes(&mut out, None, &field.attributes)?;
        }

        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for (method, code) in self.methods.iter().zip(&code_attrs) {
            write_member_header(&mut out, method);
            let code = code.as_ref().map(|data| (code_name, data.as_slice()));
            write_attributes(&mut out, code, &method.attributes)?;
        }

        write_attributes(&mut out, None, &self.attributes)?;
        Ok(out)
    }

    pub fn this_name(&self) -> ClassResult<String> {
        self.pool.class_name(self.this_class)
    }

    pub fn super_name(&self) -> ClassResult<Option<String>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.pool.class_name(self.super_class).map(Some)
    }

    pub fn member_name(&self, member: &Member) -> ClassResult<String> {
        self.pool.utf8(member.name)
    }

    pub fn member_descriptor(&self, member: &Member) -> ClassResult<String> {
        self.pool.utf8(member.descriptor)
    }

    pub fn attribute_name(&self, attr: &Attribute) -> ClassResult<String> {
        self.pool.utf8(attr.name)
    }

    pub fn has_native_methods(&self) -> bool {
        self.methods.iter().any(Member::is_native)
    }

    pub fn is_module(&self) -> bool {
        self.access & ACC_MODULE != 0
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods.iter().position(|m| {
            self.pool.utf8_bytes(m.name).is_ok_and(|n| n == name.as_bytes())
                && self
                    .pool
                    .utf8_bytes(m.descriptor)
                    .is_ok_and(|d| d == descriptor.as_bytes())
        })
    }
}

fn read_attributes(
    r: &mut Reader<'_>,
    pool: &ConstantPool,
    strip: &[&str],
) -> ClassResult<Vec<Attribute>> {
    let count = r.u16()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = r.u16()?;
        let len = r.u32()? as usize;
        let data = r.bytes(len)?;
        let attr_name = pool.utf8(name)?;
        if strip.contains(&attr_name.as_str()) {
            continue;
        }
        attributes.push(Attribute {
            name,
            data: data.to_vec(),
        });
    }
    Ok(attributes)
}

fn write_member_header(out: &mut Vec<u8>, member: &Member) {
    out.extend_from_slice(&member.access.to_be_bytes());
    out.extend_from_slice(&member.name.to_be_bytes());
    out.extend_from_slice(&member.descriptor.to_be_bytes());
}

fn write_attributes(
    out: &mut Vec<u8>,
    code: Option<(u16, &[u8])>,
    attributes: &[Attribute],
) -> ClassResult<()> {
    let count = attributes.len() + usize::from(code.is_some());
    out.extend_from_slice(&(count as u16).to_be_bytes());
    let all = code
        .into_iter()
        .chain(attributes.iter().map(|a| (a.name, a.data.as_slice())));
    for (name, data) in all {
        let len = u32::try_from(data.len()).map_err(|_| ClassFileError::BadAttribute {
            name: format!("#{name}"),
            reason: "attribute larger than 4 GiB".into(),
        })?;
        out.extend_from_slice(&name.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(data);
    }
    Ok(())
}

fn write_u16_list(out: &mut Vec<u8>, values: &[u16]) {
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for v in values {
        out.extend_from_slice(&v.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{op, Insn};

    fn sample() -> ClassResult<ClassFile> {
        let mut class = ClassFile::new("demo/Sample", "java/lang/Object", ACC_PUBLIC | ACC_SUPER, 52)?;
        let name = class.pool.intern_utf8("answer")?;
        let descriptor = class.pool.intern_utf8("(I)I")?;
        let mut code = Code::new(1, 1);
        let zero = code.new_label();
        code.insns = vec![
            Insn::Var { opcode: op::ILOAD, index: 0 },
            Insn::Jump { opcode: op::IFEQ, target: zero },
            Insn::Push { opcode: op::BIPUSH, value: 42 },
            Insn::Simple(op::IRETURN),
            Insn::Label(zero),
            Insn::Simple(op::ICONST_0),
            Insn::Simple(op::IRETURN),
        ];
        class.methods.push(Member {
            access: ACC_PUBLIC | ACC_STATIC,
            name,
            descriptor,
            attributes: Vec::new(),
            code: Some(code),
        });
        let source_file = class.pool.intern_utf8("SourceFile")?;
        let file_name = class.pool.intern_utf8("Sample.java")?;
        class.attributes.push(Attribute {
            name: source_file,
            data: file_name.to_be_bytes().to_vec(),
        });
        Ok(class)
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = ClassFile::parse(&[0xCA, 0xFE, 0xBA, 0xBF, 0, 0, 0, 52]).unwrap_err();
        assert!(matches!(err, ClassFileError::BadMagic(0xCAFE_BABF)));
    }

    #[test]
    fn truncated_data_is_rejected() {
        let err = ClassFile::parse(&[0xCA, 0xFE, 0xBA, 0xBE, 0]).unwrap_err();
        assert!(matches!(err, ClassFileError::UnexpectedEof(_)));
    }

    #[test]
    fn write_then_parse_strips_debug_info_and_adds_frames() -> ClassResult<()> {
        let mut class = sample()?;
        let bytes = class.to_bytes()?;
        let mut parsed = ClassFile::parse(&bytes)?;

        assert_eq!(parsed.this_name()?, "demo/Sample");
        assert_eq!(parsed.super_name()?.as_deref(), Some("java/lang/Object"));
        assert!(parsed.attributes.is_empty(), "SourceFile must be dropped");

        let idx = parsed.find_method("answer", "(I)I").unwrap();
        let code = parsed.methods[idx].code.as_ref().unwrap();
        assert_eq!(code.frames.len(), 1);
        let real: Vec<_> = code
            .insns
            .iter()
            .filter(|i| !matches!(i, Insn::Label(_)))
            .cloned()
            .collect();
        assert_eq!(real.len(), 6);

        // Once stripped, a class is stable under another read and write.
        let again = parsed.to_bytes()?;
        let once_more = ClassFile::parse(&again)?.to_bytes()?;
        assert_eq!(once_more, again);
        Ok(())
    }

    #[test]
    fn old_versions_get_no_stack_map() -> ClassResult<()> {
        let mut class = sample()?;
        class.major = 49;
        let bytes = class.to_bytes()?;
        let parsed = ClassFile::parse(&bytes)?;
        let idx = parsed.find_method("answer", "(I)I").unwrap();
        assert!(parsed.methods[idx].code.as_ref().unwrap().frames.is_empty());
        Ok(())
    }
}
