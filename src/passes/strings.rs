use anyhow::{Context, Result};
use rand::rngs::StdRng;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::rename::utf8_references;
use super::{for_each_code, ClassScope, Pass, PassContext, PassKind, PassStats};
use crate::bytecode::{op, Insn};
use crate::classfile::{ClassFile, Reader};
use crate::error::ClassResult;
use crate::crypto::{self, AesKey};
use crate::mutf8;
use crate::pool::Constant;
use crate::runtime::{self, DECRYPTOR_CLASS, DECRYPT_DESCRIPTOR, DECRYPT_METHOD};

/// Replaces string literals with their encrypted form and a call to the generated decryptor.
#[derive(Debug, Default)]
pub struct StringsPass {
    key: Option<AesKey>,
    decryptor: String,
}

impl StringsPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Internal name of the generated decryptor class.
    pub fn decryptor(&self) -> &str {
        &self.decryptor
    }
}

impl Pass for StringsPass {
    fn kind(&self) -> PassKind {
        PassKind::Strings
    }

    fn init(&mut self, ctx: &PassContext<'_>, rng: &mut StdRng) -> Result<()> {
        self.key = Some(crypto::generate_key(rng));
        self.decryptor = runtime::runtime_class_name(ctx.runtime_package, DECRYPTOR_CLASS);
        Ok(())
    }

    fn transform(&self, class: &mut ClassFile, scope: &mut ClassScope) -> Result<PassStats> {
        let key = self.key.as_ref().context("String encryption used before init")?;
        let mut encrypted = 0;
        let mut skipped = 0;
        let mut replaced = BTreeMap::new();
        for_each_code(class, |_sig, code, pool| {
            let mut decrypt = None;
            let insns = std::mem::take(&mut code.insns);
            let mut out = Vec::with_capacity(insns.len());
            for insn in insns {
                let literal = match &insn {
                    Insn::Ldc { index } => match pool.get(*index)? {
                        Constant::String(utf8) => Some(*utf8),
                        _ => None,
                    },
                    _ => None,
                };
                let Some(utf8) = literal else {
                    out.push(insn);
                    continue;
                };
                let Ok(plain) = mutf8::decode(pool.utf8_bytes(utf8)?) else {
                    skipped += 1;
                    out.push(insn);
                    continue;
                };
                // Base64 grows the text by a third; it must still fit one Utf8 constant.
                let sealed = crypto::encrypt_string(key, &plain);
                if sealed.len() > u16::MAX as usize {
                    skipped += 1;
                    out.push(insn);
                    continue;
                }

                if let Insn::Ldc { index } = insn {
                    replaced.insert(index, utf8);
                }
                let index = pool.intern_string(&sealed)?;
                let method = match decrypt {
                    Some(m) => m,
                    None => {
                        let m = pool.intern_method_ref(
                            &self.decryptor,
                            DECRYPT_METHOD,
                            DECRYPT_DESCRIPTOR,
                            false,
                        )?;
                        decrypt = Some(m);
                        m
                    }
                };
                out.push(Insn::Ldc { index });
                out.push(Insn::Invoke {
                    opcode: op::INVOKESTATIC,
                    index: method,
                });
                encrypted += 1;
            }
            code.insns = out;
            Ok(())
        })?;
        if skipped > 0 {
            debug!(class = %scope.class_name, skipped, "literals left as they are");
        }
        let scrubbed = scrub_plaintext(class, &replaced)?;
        debug!(class = %scope.class_name, encrypted, scrubbed, "literals encrypted");
        Ok(PassStats {
            encrypted_strings: encrypted,
            ..Default::default()
        })
    }

    fn runtime_classes(&self) -> Result<Vec<ClassFile>> {
        let Some(key) = self.key.as_ref() else {
            return Ok(Vec::new());
        };
        let class = runtime::string_decryptor(&self.decryptor, &crypto::encode_base64(key))?;
        Ok(vec![class])
    }
}

/// Blanks the text of replaced literals nothing else refers to, so the plaintext does not
/// ride along in the constant pool. Returns the number of entries blanked.
fn scrub_plaintext(class: &mut ClassFile, replaced: &BTreeMap<u16, u16>) -> ClassResult<usize> {
    let mut live: HashSet<u16> = HashSet::new();
    for code in class.methods.iter().filter_map(|m| m.code.as_ref()) {
        for insn in &code.insns {
            if let Insn::Ldc { index } = insn {
                live.insert(*index);
            }
        }
    }
    for attr in class.fields.iter().flat_map(|f| &f.attributes) {
        if attr.data.len() == 2 && class.pool.utf8(attr.name)? == "ConstantValue" {
            live.insert(u16::from_be_bytes([attr.data[0], attr.data[1]]));
        }
    }
    for attr in &class.attributes {
        if class.pool.utf8(attr.name)? == "BootstrapMethods" {
            live.extend(bootstrap_arguments(&attr.data)?);
        }
    }

    let dead: Vec<(u16, u16)> = replaced
        .iter()
        .filter(|(string, _)| !live.contains(string))
        .map(|(&string, &utf8)| (string, utf8))
        .collect();
    if dead.is_empty() {
        return Ok(0);
    }
    let empty = class.pool.intern_utf8("")?;
    for &(string, _) in &dead {
        class.pool.set(string, Constant::String(empty))?;
    }
    let referenced = utf8_references(class)?;
    let mut scrubbed = 0;
    for &(_, utf8) in &dead {
        if utf8 != empty && !referenced.contains(&utf8) {
            class.pool.set_utf8(utf8, "")?;
            scrubbed += 1;
        }
    }
    Ok(scrubbed)
}

fn bootstrap_arguments(data: &[u8]) -> ClassResult<Vec<u16>> {
    let mut r = Reader::new(data);
    let mut out = Vec::new();
    for _ in 0..r.u16()? {
        r.skip(2)?;
        for _ in 0..r.u16()? {
            out.push(r.u16()?);
        }
    }
    Ok(out)
}
