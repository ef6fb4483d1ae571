//! Constant pool of a class file.
//!
//! Entries keep their original slot numbers; new constants are only ever appended, so
//! indices held by instructions and raw attributes stay valid across edits.

use std::collections::HashMap;

use crate::classfile::Reader;
use crate::error::{ClassFileError, ClassResult};
use crate::mutf8;

pub const TAG_UTF8: u8 = 1;
pub const TAG_INTEGER: u8 = 3;
pub const TAG_FLOAT: u8 = 4;
pub const TAG_LONG: u8 = 5;
pub const TAG_DOUBLE: u8 = 6;
pub const TAG_CLASS: u8 = 7;
pub const TAG_STRING: u8 = 8;
pub const TAG_FIELDREF: u8 = 9;
pub const TAG_METHODREF: u8 = 10;
pub const TAG_INTERFACE_METHODREF: u8 = 11;
pub const TAG_NAME_AND_TYPE: u8 = 12;
pub const TAG_METHOD_HANDLE: u8 = 15;
pub const TAG_METHOD_TYPE: u8 = 16;
pub const TAG_DYNAMIC: u8 = 17;
pub const TAG_INVOKE_DYNAMIC: u8 = 18;
pub const TAG_MODULE: u8 = 19;
pub const TAG_PACKAGE: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Utf8(Vec<u8>),
    Integer(i32),
    /// Raw IEEE-754 bits, so that NaN payloads survive and the enum stays `Eq`.
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref { class: u16, name_and_type: u16 },
    Methodref { class: u16, name_and_type: u16 },
    InterfaceMethodref { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Slot 0 and the slot following a Long or Double.
    Unusable,
}

impl Constant {
    fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            Constant::Utf8(_) => "Utf8",
            Constant::Integer(_) => "Integer",
            Constant::Float(_) => "Float",
            Constant::Long(_) => "Long",
            Constant::Double(_) => "Double",
            Constant::Class(_) => "Class",
            Constant::String(_) => "String",
            Constant::Fieldref { .. } => "Fieldref",
            Constant::Methodref { .. } => "Methodref",
            Constant::InterfaceMethodref { .. } => "InterfaceMethodref",
            Constant::NameAndType { .. } => "NameAndType",
            Constant::MethodHandle { .. } => "MethodHandle",
            Constant::MethodType(_) => "MethodType",
            Constant::Dynamic { .. } => "Dynamic",
            Constant::InvokeDynamic { .. } => "InvokeDynamic",
            Constant::Module(_) => "Module",
            Constant::Package(_) => "Package",
            Constant::Unusable => "unusable slot",
        }
    }
}

/// A resolved field or method reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub interface: bool,
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    lookup: HashMap<Constant, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
            lookup: HashMap::new(),
        }
    }

    pub fn parse(r: &mut Reader<'_>) -> ClassResult<Self> {
        let count = r.u16()?;
        let mut pool = Self::new();
        let mut index = 1u16;
        while index < count {
            let tag = r.u8()?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = r.u16()? as usize;
                    Constant::Utf8(r.bytes(len)?.to_vec())
                }
                TAG_INTEGER => Constant::Integer(r.u32()? as i32),
                TAG_FLOAT => Constant::Float(r.u32()?),
                TAG_LONG => Constant::Long(r.u64()? as i64),
                TAG_DOUBLE => Constant::Double(r.u64()?),
                TAG_CLASS => Constant::Class(r.u16()?),
                TAG_STRING => Constant::String(r.u16()?),
                TAG_FIELDREF => Constant::Fieldref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_METHODREF => Constant::Methodref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_INTERFACE_METHODREF => Constant::InterfaceMethodref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_NAME_AND_TYPE => Constant::NameAndType {
                    name: r.u16()?,
                    descriptor: r.u16()?,
                },
                TAG_METHOD_HANDLE => Constant::MethodHandle {
                    kind: r.u8()?,
                    reference: r.u16()?,
                },
                TAG_METHOD_TYPE => Constant::MethodType(r.u16()?),
                TAG_DYNAMIC => Constant::Dynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_MODULE => Constant::Module(r.u16()?),
                TAG_PACKAGE => Constant::Package(r.u16()?),
                _ => return Err(ClassFileError::UnknownConstantTag { tag, index }),
            };
            let wide = constant.is_wide();
            pool.lookup.entry(constant.clone()).or_insert(index);
            pool.entries.push(constant);
            index += 1;
            if wide {
                pool.entries.push(Constant::Unusable);
                index += 1;
            }
        }
        Ok(pool)
    }

    pub fn write(&self, out: &mut Vec<u8>) -> ClassResult<()> {
        let count = u16::try_from(self.entries.len()).map_err(|_| ClassFileError::PoolOverflow)?;
        out.extend_from_slice(&count.to_be_bytes());
        for constant in self.entries.iter().skip(1) {
            match constant {
                Constant::Unusable => {}
                Constant::Utf8(bytes) => {
                    out.push(TAG_UTF8);
                    let len = u16::try_from(bytes.len())
                        .map_err(|_| ClassFileError::Utf8TooLong(bytes.len()))?;
                    out.extend_from_slice(&len.to_be_bytes());
                    out.extend_from_slice(bytes);
                }
                Constant::Integer(v) => {
                    out.push(TAG_INTEGER);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Float(bits) => {
                    out.push(TAG_FLOAT);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Constant::Long(v) => {
                    out.push(TAG_LONG);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Double(bits) => {
                    out.push(TAG_DOUBLE);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Constant::Class(i) => push_tag_u16(out, TAG_CLASS, *i),
                Constant::String(i) => push_tag_u16(out, TAG_STRING, *i),
                Constant::MethodType(i) => push_tag_u16(out, TAG_METHOD_TYPE, *i),
                Constant::Module(i) => push_tag_u16(out, TAG_MODULE, *i),
                Constant::Package(i) => push_tag_u16(out, TAG_PACKAGE, *i),
                Constant::Fieldref { class, name_and_type } => {
                    push_tag_u16_u16(out, TAG_FIELDREF, *class, *name_and_type)
                }
                Constant::Methodref { class, name_and_type } => {
                    push_tag_u16_u16(out, TAG_METHODREF, *class, *name_and_type)
                }
                Constant::InterfaceMethodref { class, name_and_type } => {
                    push_tag_u16_u16(out, TAG_INTERFACE_METHODREF, *class, *name_and_type)
                }
                Constant::NameAndType { name, descriptor } => {
                    push_tag_u16_u16(out, TAG_NAME_AND_TYPE, *name, *descriptor)
                }
                Constant::Dynamic { bootstrap, name_and_type } => {
                    push_tag_u16_u16(out, TAG_DYNAMIC, *bootstrap, *name_and_type)
                }
                Constant::InvokeDynamic { bootstrap, name_and_type } => {
                    push_tag_u16_u16(out, TAG_INVOKE_DYNAMIC, *bootstrap, *name_and_type)
                }
                Constant::MethodHandle { kind, reference } => {
                    out.push(TAG_METHOD_HANDLE);
                    out.push(*kind);
                    out.extend_from_slice(&reference.to_be_bytes());
                }
            }
        }
        Ok(())
    }

    /// Number of slots, including slot 0.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, c)| !matches!(c, Constant::Unusable))
            .map(|(i, c)| (i as u16, c))
    }

    pub fn get(&self, index: u16) -> ClassResult<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(ClassFileError::BadConstantIndex(index)),
            Some(c) => Ok(c),
        }
    }

    pub fn utf8_bytes(&self, index: u16) -> ClassResult<&[u8]> {
        match self.get(index)? {
            Constant::Utf8(bytes) => Ok(bytes),
            _ => Err(unexpected(index, "Utf8")),
        }
    }

    pub fn utf8(&self, index: u16) -> ClassResult<String> {
        mutf8::decode(self.utf8_bytes(index)?)
    }

    pub fn class_name(&self, index: u16) -> ClassResult<String> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            _ => Err(unexpected(index, "Class")),
        }
    }

    /// Utf8 index behind a `CONSTANT_String`.
    pub fn string_utf8_index(&self, index: u16) -> ClassResult<u16> {
        match self.get(index)? {
            Constant::String(utf8) => Ok(*utf8),
            _ => Err(unexpected(index, "String")),
        }
    }

    pub fn name_and_type(&self, index: u16) -> ClassResult<(String, String)> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(unexpected(index, "NameAndType")),
        }
    }

    pub fn member_ref(&self, index: u16) -> ClassResult<MemberRef> {
        let (class, nat, interface) = match self.get(index)? {
            Constant::Fieldref { class, name_and_type }
            | Constant::Methodref { class, name_and_type } => (*class, *name_and_type, false),
            Constant::InterfaceMethodref { class, name_and_type } => {
                (*class, *name_and_type, true)
            }
            _ => return Err(unexpected(index, "member reference")),
        };
        let (name, descriptor) = self.name_and_type(nat)?;
        Ok(MemberRef {
            owner: self.class_name(class)?,
            name,
            descriptor,
            interface,
        })
    }

    /// Descriptor of the NameAndType behind an InvokeDynamic or Dynamic constant.
    pub fn dynamic_descriptor(&self, index: u16) -> ClassResult<String> {
        match self.get(index)? {
            Constant::InvokeDynamic { name_and_type, .. }
            | Constant::Dynamic { name_and_type, .. } => Ok(self.name_and_type(*name_and_type)?.1),
            _ => Err(unexpected(index, "dynamic constant")),
        }
    }

    pub fn intern(&mut self, constant: Constant) -> ClassResult<u16> {
        if let Some(&index) = self.lookup.get(&constant) {
            return Ok(index);
        }
        let wide = constant.is_wide();
        let needed = self.entries.len() + if wide { 2 } else { 1 };
        if needed > u16::MAX as usize {
            return Err(ClassFileError::PoolOverflow);
        }
        let index = self.entries.len() as u16;
        self.lookup.insert(constant.clone(), index);
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    pub fn intern_utf8(&mut self, s: &str) -> ClassResult<u16> {
        self.intern(Constant::Utf8(encode_utf8(s)?))
    }

    pub fn intern_class(&mut self, name: &str) -> ClassResult<u16> {
        let utf8 = self.intern_utf8(name)?;
        self.intern(Constant::Class(utf8))
    }

    pub fn intern_string(&mut self, s: &str) -> ClassResult<u16> {
        let utf8 = self.intern_utf8(s)?;
        self.intern(Constant::String(utf8))
    }

    pub fn intern_integer(&mut self, v: i32) -> ClassResult<u16> {
        self.intern(Constant::Integer(v))
    }

    pub fn intern_name_and_type(&mut self, name: &str, descriptor: &str) -> ClassResult<u16> {
        let name = self.intern_utf8(name)?;
        let descriptor = self.intern_utf8(descriptor)?;
        self.intern(Constant::NameAndType { name, descriptor })
    }

    pub fn intern_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> ClassResult<u16> {
        let class = self.intern_class(owner)?;
        let name_and_type = self.intern_name_and_type(name, descriptor)?;
        self.intern(Constant::Fieldref { class, name_and_type })
    }

    pub fn intern_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> ClassResult<u16> {
        let class = self.intern_class(owner)?;
        let name_and_type = self.intern_name_and_type(name, descriptor)?;
        if interface {
            self.intern(Constant::InterfaceMethodref { class, name_and_type })
        } else {
            self.intern(Constant::Methodref { class, name_and_type })
        }
    }

    /// Overwrites a Utf8 entry in place. Every site pointing at `index` sees the new text.
    pub fn set_utf8(&mut self, index: u16, s: &str) -> ClassResult<()> {
        let slot = self
            .entries
            .get_mut(index as usize)
            .ok_or(ClassFileError::BadConstantIndex(index))?;
        let Constant::Utf8(_) = slot else {
            return Err(unexpected(index, "Utf8"));
        };
        let old = std::mem::replace(slot, Constant::Utf8(encode_utf8(s)?));
        let new = slot.clone();
        if self.lookup.get(&old) == Some(&index) {
            self.lookup.remove(&old);
        }
        self.lookup.entry(new).or_insert(index);
        Ok(())
    }

    pub fn set(&mut self, index: u16, constant: Constant) -> ClassResult<()> {
        let slot = self
            .entries
            .get_mut(index as usize)
            .ok_or(ClassFileError::BadConstantIndex(index))?;
        if matches!(slot, Constant::Unusable) || slot.is_wide() != constant.is_wide() {
            return Err(unexpected(index, constant.kind()));
        }
        let old = std::mem::replace(slot, constant.clone());
        if self.lookup.get(&old) == Some(&index) {
            self.lookup.remove(&old);
        }
        self.lookup.entry(constant).or_insert(index);
        Ok(())
    }
}

/// Encodes `s` as modified UTF-8, refusing text a class file cannot hold.
fn encode_utf8(s: &str) -> ClassResult<Vec<u8>> {
    let bytes = mutf8::encode(s);
    if bytes.len() > u16::MAX as usize {
        return Err(ClassFileError::Utf8TooLong(bytes.len()));
    }
    Ok(bytes)
}

fn unexpected(index: u16, expected: &'static str) -> ClassFileError {
    ClassFileError::UnexpectedConstant { index, expected }
}

fn push_tag_u16(out: &mut Vec<u8>, tag: u8, v: u16) {
    out.push(tag);
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_tag_u16_u16(out: &mut Vec<u8>, tag: u8, a: u16, b: u16) {
    out.push(tag);
    out.extend_from_slice(&a.to_be_bytes());
    out.extend_from_slice(&b.to_be_bytes());
}
