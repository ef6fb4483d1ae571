//! Field/method descriptors and generic signatures.

use std::collections::HashMap;

use crate::error::{ClassFileError, ClassResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    /// Internal name, e.g. `java/lang/String`.
    Object(String),
    /// Full array descriptor, e.g. `[[I`.
    Array(String),
}

impl FieldType {
    pub fn is_wide(&self) -> bool {
        matches!(self, FieldType::Long | FieldType::Double)
    }
}

pub fn parse_field(desc: &str) -> ClassResult<FieldType> {
    let (ty, rest) = field_prefix(desc).ok_or_else(|| bad(desc))?;
    if !rest.is_empty() {
        return Err(bad(desc));
    }
    Ok(ty)
}

/// Argument types and return type (`None` for `V`).
pub fn parse_method(desc: &str) -> ClassResult<(Vec<FieldType>, Option<FieldType>)> {
    let mut rest = desc.strip_prefix('(').ok_or_else(|| bad(desc))?;
    let mut args = Vec::new();
    while !rest.starts_with(')') {
        let (ty, tail) = field_prefix(rest).ok_or_else(|| bad(desc))?;
        args.push(ty);
        rest = tail;
    }
    let ret = &rest[1..];
    if ret == "V" {
        return Ok((args, None));
    }
    Ok((args, Some(parse_field(ret).map_err(|_| bad(desc))?)))
}

fn field_prefix(s: &str) -> Option<(FieldType, &str)> {
    let first = s.chars().next()?;
    let rest = &s[first.len_utf8()..];
    let ty = match first {
        'Z' => FieldType::Boolean,
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'S' => FieldType::Short,
        'I' => FieldType::Int,
        'F' => FieldType::Float,
        'J' => FieldType::Long,
        'D' => FieldType::Double,
        'L' => {
            let end = rest.find(';')?;
            if end == 0 {
                return None;
            }
            return Some((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]));
        }
        '[' => {
            let (_, tail) = field_prefix(rest)?;
            let consumed = s.len() - tail.len();
            return Some((FieldType::Array(s[..consumed].to_string()), tail));
        }
        _ => return None,
    };
    Some((ty, rest))
}

fn bad(desc: &str) -> ClassFileError {
    ClassFileError::BadDescriptor(desc.to_string())
}

/// Rewrites every `L<name>;` in a field or method descriptor.
pub fn remap_descriptor(desc: &str, mapping: &HashMap<String, String>) -> ClassResult<String> {
    let mut out = String::with_capacity(desc.len());
    let mut rest = desc;
    while let Some(pos) = rest.find('L') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let end = after.find(';').ok_or_else(|| bad(desc))?;
        let name = &after[..end];
        out.push('L');
        out.push_str(mapping.get(name).map(String::as_str).unwrap_or(name));
        out.push(';');
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Maps the name stored in a `CONSTANT_Class`: a plain internal name or an array descriptor.
pub fn remap_class_name(name: &str, mapping: &HashMap<String, String>) -> ClassResult<Option<String>> {
    let mapped = if name.starts_with('[') {
        remap_descriptor(name, mapping)?
    } else {
        match mapping.get(name) {
            Some(m) => m.clone(),
            None => return Ok(None),
        }
    };
    Ok((mapped != name).then_some(mapped))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    Class,
    Method,
    Field,
}

pub fn remap_signature(
    sig: &str,
    kind: SignatureKind,
    mapping: &HashMap<String, String>,
) -> ClassResult<String> {
    let mut p = SigRemapper {
        src: sig,
        pos: 0,
        out: String::with_capacity(sig.len()),
        mapping,
    };
    match kind {
        SignatureKind::Class => {
            if p.peek() == Some('<') {
                p.type_params()?;
            }
            p.class_type()?;
            while !p.at_end() {
                p.class_type()?;
            }
        }
        SignatureKind::Method => {
            if p.peek() == Some('<') {
                p.type_params()?;
            }
            p.expect('(')?;
            while p.peek() != Some(')') {
                p.java_type()?;
            }
            p.expect(')')?;
            if p.peek() == Some('V') {
                p.copy_char()?;
            } else {
                p.java_type()?;
            }
            while p.peek() == Some('^') {
                p.copy_char()?;
                if p.peek() == Some('T') {
                    p.type_var()?;
                } else {
                    p.class_type()?;
                }
            }
        }
        SignatureKind::Field => p.reference_type()?,
    }
    if !p.at_end() {
        return Err(p.error());
    }
    Ok(p.out)
}

struct SigRemapper<'a> {
    src: &'a str,
    pos: usize,
    out: String,
    mapping: &'a HashMap<String, String>,
}

impl SigRemapper<'_> {
    fn error(&self) -> ClassFileError {
        ClassFileError::BadSignature(self.src.to_string())
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn copy_char(&mut self) -> ClassResult<char> {
        let c = self.peek().ok_or_else(|| self.error())?;
        self.pos += c.len_utf8();
        self.out.push(c);
        Ok(c)
    }

    fn expect(&mut self, want: char) -> ClassResult<()> {
        if self.copy_char()? != want {
            return Err(self.error());
        }
        Ok(())
    }

    /// Consumes characters up to (not including) any of `stops`.
    fn take_until(&mut self, stops: &[char]) -> ClassResult<&str> {
        let rest = &self.src[self.pos..];
        let end = rest.find(|c| stops.contains(&c)).ok_or_else(|| self.error())?;
        if end == 0 {
            return Err(self.error());
        }
        self.pos += end;
        Ok(&rest[..end])
    }

    fn type_params(&mut self) -> ClassResult<()> {
        self.expect('<')?;
        while self.peek() != Some('>') {
            let ident = self.take_until(&[':'])?.to_string();
            self.out.push_str(&ident);
            self.expect(':')?;
            if matches!(self.peek(), Some('L' | 'T' | '[')) {
                self.reference_type()?;
            }
            while self.peek() == Some(':') {
                self.copy_char()?;
                self.reference_type()?;
            }
        }
        self.expect('>')
    }

    fn java_type(&mut self) -> ClassResult<()> {
        match self.peek() {
            Some('B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z') => {
                self.copy_char()?;
                Ok(())
            }
            _ => self.reference_type(),
        }
    }

    fn reference_type(&mut self) -> ClassResult<()> {
        match self.peek() {
            Some('L') => self.class_type(),
            Some('T') => self.type_var(),
            Some('[') => {
                self.copy_char()?;
                self.java_type()
            }
            _ => Err(self.error()),
        }
    }

    fn type_var(&mut self) -> ClassResult<()> {
        self.expect('T')?;
        let ident = self.take_until(&[';'])?.to_string();
        self.out.push_str(&ident);
        self.expect(';')
    }

    fn class_type(&mut self) -> ClassResult<()> {
        self.expect('L')?;
        let name = self.take_until(&['<', '.', ';'])?.to_string();
        let mut remapped = self.mapping.get(&name).cloned().unwrap_or_else(|| name.clone());
        self.out.push_str(&remapped);
        let mut full = name;
        if self.peek() == Some('<') {
            self.type_args()?;
        }
        while self.peek() == Some('.') {
            self.copy_char()?;
            let simple = self.take_until(&['<', '.', ';'])?.to_string();
            let inner = format!("{full}${simple}");
            let inner_remapped = self.mapping.get(&inner).cloned().unwrap_or_else(|| inner.clone());
            let outer_prefix = format!("{remapped}$");
            let suffix = match inner_remapped.strip_prefix(&outer_prefix) {
                Some(s) => s,
                None => match inner_remapped.rfind('$') {
                    Some(i) => &inner_remapped[i + 1..],
                    None => inner_remapped.as_str(),
                },
            };
            self.out.push_str(suffix);
            full = inner;
            remapped = inner_remapped;
            if self.peek() == Some('<') {
                self.type_args()?;
            }
        }
        self.expect(';')
    }

    fn type_args(&mut self) -> ClassResult<()> {
        self.expect('<')?;
        while self.peek() != Some('>') {
            match self.peek() {
                Some('*') => {
                    self.copy_char()?;
                }
                Some('+' | '-') => {
                    self.copy_char()?;
                    self.reference_type()?;
                }
                _ => self.reference_type()?,
            }
        }
        self.expect('>')
    }
}
