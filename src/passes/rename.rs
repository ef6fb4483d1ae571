//! Class renaming. Every input class gets a short name and every reference to it, from
//! constants, descriptors, generic signatures, annotations, records and frames, follows.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use tracing::info;

use super::{ClassScope, FinishContext, Pass, PassContext, PassKind, PassStats};
use crate::classfile::{Attribute, ClassFile, Member, Reader};
use crate::descriptor::{remap_class_name, remap_descriptor, remap_signature, SignatureKind};
use crate::error::{ClassFileError, ClassResult};
use crate::frames::VType;
use crate::pool::{Constant, ConstantPool};

pub const DEFAULT_PREFIX: &str = "C";

#[derive(Debug, Clone)]
pub struct RenamePass {
    prefix: String,
    keep: Vec<String>,
    mapping_path: Option<PathBuf>,
    mapping: BTreeMap<String, String>,
    lookup: HashMap<String, String>,
}

impl RenamePass {
    /// `keep` holds package or class prefixes, dotted or slashed.
    pub fn new(prefix: impl Into<String>, keep: Vec<String>, mapping_path: Option<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            keep: keep.iter().map(|k| k.replace('.', "/")).collect(),
            mapping_path,
            mapping: BTreeMap::new(),
            lookup: HashMap::new(),
        }
    }

    fn kept(&self, class: &ClassFile, name: &str) -> bool {
        self.keep.iter().any(|k| name.starts_with(k.as_str()))
            || class.has_native_methods()
            || class.is_module()
            || name.ends_with("package-info")
    }
}

impl Default for RenamePass {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, Vec::new(), None)
    }
}

impl Pass for RenamePass {
    fn kind(&self) -> PassKind {
        PassKind::Rename
    }

    fn init(&mut self, ctx: &PassContext<'_>, _rng: &mut StdRng) -> Result<()> {
        let names = ctx
            .classes
            .iter()
            .map(ClassFile::this_name)
            .collect::<ClassResult<Vec<_>>>()?;
        let existing: HashSet<&str> = names.iter().map(String::as_str).collect();
        // Package-private access only works within one package, so classes sharing a
        // package with a kept class stay in it.
        let pinned: HashSet<&str> = ctx
            .classes
            .iter()
            .zip(&names)
            .filter(|(class, name)| self.kept(class, name))
            .map(|(_, name)| package_of(name))
            .collect();

        let mut counter = 0usize;
        for (class, name) in ctx.classes.iter().zip(&names) {
            if self.kept(class, name) {
                continue;
            }
            let package = package_of(name);
            let new_name = loop {
                let candidate = if !package.is_empty() && pinned.contains(package) {
                    format!("{package}/{}{counter}", self.prefix)
                } else {
                    format!("{}{counter}", self.prefix)
                };
                counter += 1;
                if !existing.contains(candidate.as_str()) {
                    break candidate;
                }
            };
            self.mapping.insert(name.clone(), new_name);
        }
        self.lookup = self.mapping.clone().into_iter().collect();
        info!(
            renamed = self.mapping.len(),
            kept = names.len() - self.mapping.len(),
            "rename mapping built"
        );
        Ok(())
    }

    fn transform(&self, class: &mut ClassFile, _scope: &mut ClassScope) -> Result<PassStats> {
        let old = class.this_name()?;
        remap_class(class, &self.lookup).with_context(|| format!("Failed to rename references in {old}"))?;
        Ok(PassStats {
            renamed_classes: usize::from(self.lookup.contains_key(&old)),
            ..Default::default()
        })
    }

    fn finish(&mut self, _ctx: &FinishContext<'_>) -> Result<()> {
        let Some(path) = &self.mapping_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.mapping)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write mapping: {}", path.display()))?;
        info!(path = %path.display(), "mapping written");
        Ok(())
    }

    fn class_mapping(&self) -> Option<&BTreeMap<String, String>> {
        Some(&self.mapping)
    }
}

/// `a/b/C` -> `a/b`, and `""` for the default package.
fn package_of(name: &str) -> &str {
    name.rsplit_once('/').map_or("", |(package, _)| package)
}

/// Rewrites every class name in `class` through `map`.
///
/// Runs twice over the class: the first walk records Utf8 entries that are also used as
/// plain text (literals, member and attribute names, annotation values), the second one
/// rewrites. Entries used only as names are edited in place; shared ones are left alone and
/// the rewritten site points at a new entry.
pub fn remap_class(class: &mut ClassFile, map: &HashMap<String, String>) -> ClassResult<()> {
    let mut r = Remapper {
        map,
        mode: Mode::Collect,
        protected: HashSet::new(),
        referenced: HashSet::new(),
        done: HashMap::new(),
    };
    walk_class(&mut r, class)?;
    r.mode = Mode::Rewrite;
    walk_class(&mut r, class)
}

/// Every Utf8 entry reachable from the pool, the members and the attributes this module
/// understands.
pub(crate) fn utf8_references(class: &mut ClassFile) -> ClassResult<HashSet<u16>> {
    let map = HashMap::new();
    let mut r = Remapper {
        map: &map,
        mode: Mode::Collect,
        protected: HashSet::new(),
        referenced: HashSet::new(),
        done: HashMap::new(),
    };
    walk_class(&mut r, class)?;
    Ok(r.referenced)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Collect,
    Rewrite,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    /// Text that must not change.
    Text,
    ClassName,
    Descriptor,
    Signature(SignatureKind),
}

struct Remapper<'m> {
    map: &'m HashMap<String, String>,
    mode: Mode,
    protected: HashSet<u16>,
    referenced: HashSet<u16>,
    done: HashMap<u16, u16>,
}

impl Remapper<'_> {
    /// Returns the Utf8 index the site should point at from now on.
    fn visit(&mut self, pool: &mut ConstantPool, index: u16, role: Role) -> ClassResult<u16> {
        if self.mode == Mode::Collect {
            self.referenced.insert(index);
        }
        match (self.mode, role) {
            (Mode::Collect, Role::Text) => {
                self.protected.insert(index);
                return Ok(index);
            }
            (Mode::Collect, _) | (Mode::Rewrite, Role::Text) => return Ok(index),
            (Mode::Rewrite, _) => {}
        }
        if let Some(&to) = self.done.get(&index) {
            return Ok(to);
        }
        let old = pool.utf8(index)?;
        let new = match role {
            Role::ClassName => remap_class_name(&old, self.map)?,
            Role::Descriptor => Some(remap_descriptor(&old, self.map)?),
            Role::Signature(kind) => Some(remap_signature(&old, kind, self.map)?),
            Role::Text => None,
        };
        let to = match new {
            Some(new) if new != old => {
                if self.protected.contains(&index) {
                    pool.intern_utf8(&new)?
                } else {
                    pool.set_utf8(index, &new)?;
                    index
                }
            }
            _ => index,
        };
        self.done.insert(index, to);
        Ok(to)
    }

    fn vtype(&self, t: &mut VType) -> ClassResult<()> {
        if let VType::Object(name) = t
            && let Some(new) = remap_class_name(name, self.map)?
        {
            *name = new;
        }
        Ok(())
    }
}

fn walk_class(r: &mut Remapper<'_>, class: &mut ClassFile) -> ClassResult<()> {
    let ClassFile {
        pool,
        fields,
        methods,
        attributes,
        ..
    } = class;

    let constants: Vec<(u16, Constant)> = pool.iter().map(|(i, c)| (i, c.clone())).collect();
    for (index, constant) in constants {
        match constant {
            Constant::Class(name) => {
                let to = r.visit(pool, name, Role::ClassName)?;
                if to != name {
                    pool.set(index, Constant::Class(to))?;
                }
            }
            Constant::NameAndType { name, descriptor } => {
                r.visit(pool, name, Role::Text)?;
                let to = r.visit(pool, descriptor, Role::Descriptor)?;
                if to != descriptor {
                    pool.set(index, Constant::NameAndType { name, descriptor: to })?;
                }
            }
            Constant::MethodType(descriptor) => {
                let to = r.visit(pool, descriptor, Role::Descriptor)?;
                if to != descriptor {
                    pool.set(index, Constant::MethodType(to))?;
                }
            }
            Constant::String(text) | Constant::Module(text) | Constant::Package(text) => {
                r.visit(pool, text, Role::Text)?;
            }
            _ => {}
        }
    }

    for field in fields.iter_mut() {
        walk_member(r, pool, field, SignatureKind::Field)?;
    }
    for method in methods.iter_mut() {
        walk_member(r, pool, method, SignatureKind::Method)?;
        if r.mode == Mode::Rewrite
            && let Some(code) = method.code.as_mut()
        {
            for frame in code.frames.values_mut() {
                for t in frame.locals.iter_mut().chain(frame.stack.iter_mut()) {
                    r.vtype(t)?;
                }
            }
        }
    }
    walk_attributes(r, pool, attributes, SignatureKind::Class)
}

fn walk_member(
    r: &mut Remapper<'_>,
    pool: &mut ConstantPool,
    member: &mut Member,
    kind: SignatureKind,
) -> ClassResult<()> {
    r.visit(pool, member.name, Role::Text)?;
    member.descriptor = r.visit(pool, member.descriptor, Role::Descriptor)?;
    walk_attributes(r, pool, &mut member.attributes, kind)
}

fn walk_attributes(
    r: &mut Remapper<'_>,
    pool: &mut ConstantPool,
    attributes: &mut Vec<Attribute>,
    kind: SignatureKind,
) -> ClassResult<()> {
    let mut kept = Vec::with_capacity(attributes.len());
    for mut attr in std::mem::take(attributes) {
        r.visit(pool, attr.name, Role::Text)?;
        let name = pool.utf8(attr.name)?;
        let mut w = Walker::new(&attr.data);
        let keep = match name.as_str() {
            "Signature" => {
                w.index(r, pool, Role::Signature(kind))?;
                true
            }
            "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                let count = w.u16()?;
                for _ in 0..count {
                    w.annotation(r, pool)?;
                }
                true
            }
            "RuntimeVisibleParameterAnnotations" | "RuntimeInvisibleParameterAnnotations" => {
                let params = w.u8()?;
                for _ in 0..params {
                    let count = w.u16()?;
                    for _ in 0..count {
                        w.annotation(r, pool)?;
                    }
                }
                true
            }
            "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                let count = w.u16()?;
                let mut known = true;
                for _ in 0..count {
                    if !w.type_annotation(r, pool)? {
                        known = false;
                        break;
                    }
                }
                known
            }
            "AnnotationDefault" => {
                w.element_value(r, pool)?;
                true
            }
            "InnerClasses" => {
                let count = w.u16()?;
                for _ in 0..count {
                    w.copy(4)?;
                    let inner_name = w.r.u16()?;
                    if inner_name != 0 {
                        w.push_u16(r.visit(pool, inner_name, Role::Text)?);
                    } else {
                        w.push_u16(0);
                    }
                    w.copy(2)?;
                }
                true
            }
            "Record" => {
                let count = w.u16()?;
                for _ in 0..count {
                    w.index(r, pool, Role::Text)?;
                    w.index(r, pool, Role::Descriptor)?;
                    let mut nested = read_raw_attributes(&mut w.r)?;
                    walk_attributes(r, pool, &mut nested, SignatureKind::Field)?;
                    w.push_u16(nested.len() as u16);
                    for a in &nested {
                        w.push_u16(a.name);
                        w.out.extend_from_slice(&(a.data.len() as u32).to_be_bytes());
                        w.out.extend_from_slice(&a.data);
                    }
                }
                true
            }
            _ => {
                let len = attr.data.len();
                w.copy(len)?;
                true
            }
        };
        if keep {
            attr.data = w.finish(&name)?;
            kept.push(attr);
        }
    }
    *attributes = kept;
    Ok(())
}

fn read_raw_attributes(r: &mut Reader<'_>) -> ClassResult<Vec<Attribute>> {
    let count = r.u16()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = r.u16()?;
        let len = r.u32()? as usize;
        out.push(Attribute {
            name,
            data: r.bytes(len)?.to_vec(),
        });
    }
    Ok(out)
}

/// Copies attribute bytes while letting constant indices be replaced.
struct Walker<'d> {
    r: Reader<'d>,
    out: Vec<u8>,
}

impl<'d> Walker<'d> {
    fn new(data: &'d [u8]) -> Self {
        Self {
            r: Reader::new(data),
            out: Vec::with_capacity(data.len()),
        }
    }

    fn finish(self, attribute: &str) -> ClassResult<Vec<u8>> {
        if self.r.remaining() != 0 {
            return Err(ClassFileError::BadAttribute {
                name: attribute.to_string(),
                reason: format!("{} trailing bytes", self.r.remaining()),
            });
        }
        Ok(self.out)
    }

    fn push_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn copy(&mut self, len: usize) -> ClassResult<()> {
        let bytes = self.r.bytes(len)?;
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn u8(&mut self) -> ClassResult<u8> {
        let v = self.r.u8()?;
        self.out.push(v);
        Ok(v)
    }

    fn u16(&mut self) -> ClassResult<u16> {
        let v = self.r.u16()?;
        self.push_u16(v);
        Ok(v)
    }

    fn index(&mut self, r: &mut Remapper<'_>, pool: &mut ConstantPool, role: Role) -> ClassResult<()> {
        let index = self.r.u16()?;
        let to = r.visit(pool, index, role)?;
        self.push_u16(to);
        Ok(())
    }

    fn annotation(&mut self, r: &mut Remapper<'_>, pool: &mut ConstantPool) -> ClassResult<()> {
        self.index(r, pool, Role::Descriptor)?;
        let pairs = self.u16()?;
        for _ in 0..pairs {
            self.index(r, pool, Role::Text)?;
            self.element_value(r, pool)?;
        }
        Ok(())
    }

    fn element_value(&mut self, r: &mut Remapper<'_>, pool: &mut ConstantPool) -> ClassResult<()> {
        match self.u8()? {
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => self.copy(2),
            b's' => self.index(r, pool, Role::Text),
            b'e' => {
                self.index(r, pool, Role::Descriptor)?;
                self.index(r, pool, Role::Text)
            }
            b'c' => self.index(r, pool, Role::Descriptor),
            b'@' => self.annotation(r, pool),
            b'[' => {
                let count = self.u16()?;
                for _ in 0..count {
                    self.element_value(r, pool)?;
                }
                Ok(())
            }
            tag => Err(ClassFileError::BadAttribute {
                name: "annotation".into(),
                reason: format!("unknown element value tag {tag:#04x}"),
            }),
        }
    }

    /// False when the target type is unknown; the attribute is then dropped.
    fn type_annotation(&mut self, r: &mut Remapper<'_>, pool: &mut ConstantPool) -> ClassResult<bool> {
        match self.u8()? {
            0x13..=0x15 => {}
            0x00 | 0x01 | 0x16 => self.copy(1)?,
            0x10 | 0x11 | 0x12 | 0x17 | 0x42..=0x46 => self.copy(2)?,
            0x47..=0x4B => self.copy(3)?,
            0x40 | 0x41 => {
                let entries = self.u16()?;
                self.copy(entries as usize * 6)?;
            }
            _ => return Ok(false),
        }
        let path = self.u8()?;
        self.copy(path as usize * 2)?;
        self.annotation(r, pool)?;
        Ok(true)
    }
}
