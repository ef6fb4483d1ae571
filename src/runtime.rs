//! Support classes injected into obfuscated jars, and the instruction emitter the passes
//! use to splice code into existing methods.

use crate::bytecode::{op, Code, Insn, Label, MethodSig};
use crate::classfile::{ClassFile, Member, ACC_FINAL, ACC_PUBLIC, ACC_STATIC, ACC_SUPER};
use crate::error::ClassResult;
use crate::frames;
use crate::pool::Constant;
use crate::pool::ConstantPool;

/// Version of generated classes (Java 8).
pub const RUNTIME_CLASS_VERSION: u16 = 52;

pub const DECRYPTOR_CLASS: &str = "StringDecryptor";
pub const DECRYPT_METHOD: &str = "decryptBase64";
pub const DECRYPT_DESCRIPTOR: &str = "(Ljava/lang/String;)Ljava/lang/String;";

pub const GUARD_CLASS: &str = "Guard";
pub const CHECK_MACHINE: &str = "checkMachine";
pub const CHECK_LAUNCH_DIR: &str = "checkLaunchDir";
pub const CHECK_STRING_DESCRIPTOR: &str = "(Ljava/lang/String;)V";
pub const CHECK_PASSWORD: &str = "checkPassword";
pub const CHECK_PASSWORD_DESCRIPTOR: &str = "(Ljava/lang/String;Ljava/lang/String;)V";

const STRING: &str = "java/lang/String";
const STRING_BUILDER: &str = "java/lang/StringBuilder";
const APPEND: &str = "(Ljava/lang/String;)Ljava/lang/StringBuilder;";
const BASE64: &str = "java/util/Base64";
const BASE64_DECODER: &str = "java/util/Base64$Decoder";
const GET_DECODER: &str = "()Ljava/util/Base64$Decoder;";
const DECODE: &str = "(Ljava/lang/String;)[B";
const PRINT_STREAM: &str = "Ljava/io/PrintStream;";
const PRINTLN: &str = "(Ljava/lang/String;)V";

/// Internal name of a runtime class inside `package` (`a/b` or empty).
pub fn runtime_class_name(package: &str, simple: &str) -> String {
    let package = package.trim_matches('/');
    if package.is_empty() {
        simple.to_string()
    } else {
        format!("{package}/{simple}")
    }
}

/// Appends instructions, interning the constants they need into the class's pool.
pub struct Emitter<'a> {
    pool: &'a mut ConstantPool,
    code: &'a mut Code,
    insns: Vec<Insn>,
}

impl<'a> Emitter<'a> {
    pub fn new(pool: &'a mut ConstantPool, code: &'a mut Code) -> Self {
        Self {
            pool,
            code,
            insns: Vec::new(),
        }
    }

    pub fn finish(self) -> Vec<Insn> {
        self.insns
    }

    pub fn new_label(&mut self) -> Label {
        self.code.new_label()
    }

    pub fn label(&mut self, label: Label) -> &mut Self {
        self.insns.push(Insn::Label(label));
        self
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.insns.push(Insn::Simple(opcode));
        self
    }

    pub fn var(&mut self, opcode: u8, index: u16) -> &mut Self {
        self.insns.push(Insn::Var { opcode, index });
        self
    }

    pub fn jump(&mut self, opcode: u8, target: Label) -> &mut Self {
        self.insns.push(Insn::Jump { opcode, target });
        self
    }

    pub fn int(&mut self, value: i32) -> ClassResult<&mut Self> {
        let insn = match value {
            -1..=5 => Insn::Simple((op::ICONST_0 as i32 + value) as u8),
            v if i8::try_from(v).is_ok() => Insn::Push {
                opcode: op::BIPUSH,
                value: v as i16,
            },
            v if i16::try_from(v).is_ok() => Insn::Push {
                opcode: op::SIPUSH,
                value: v as i16,
            },
            v => Insn::Ldc {
                index: self.pool.intern(Constant::Integer(v))?,
            },
        };
        self.insns.push(insn);
        Ok(self)
    }

    pub fn string(&mut self, s: &str) -> ClassResult<&mut Self> {
        let index = self.pool.intern_string(s)?;
        self.insns.push(Insn::Ldc { index });
        Ok(self)
    }

    pub fn get_static(&mut self, owner: &str, name: &str, descriptor: &str) -> ClassResult<&mut Self> {
        let index = self.pool.intern_field_ref(owner, name, descriptor)?;
        self.insns.push(Insn::Field {
            opcode: op::GETSTATIC,
            index,
        });
        Ok(self)
    }

    fn invoke(&mut self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> ClassResult<&mut Self> {
        let index = self.pool.intern_method_ref(owner, name, descriptor, false)?;
        self.insns.push(Insn::Invoke { opcode, index });
        Ok(self)
    }

    pub fn invoke_static(&mut self, owner: &str, name: &str, descriptor: &str) -> ClassResult<&mut Self> {
        self.invoke(op::INVOKESTATIC, owner, name, descriptor)
    }

    pub fn invoke_virtual(&mut self, owner: &str, name: &str, descriptor: &str) -> ClassResult<&mut Self> {
        self.invoke(op::INVOKEVIRTUAL, owner, name, descriptor)
    }

    pub fn invoke_special(&mut self, owner: &str, name: &str, descriptor: &str) -> ClassResult<&mut Self> {
        self.invoke(op::INVOKESPECIAL, owner, name, descriptor)
    }

    pub fn invoke_interface(&mut self, owner: &str, name: &str, descriptor: &str) -> ClassResult<&mut Self> {
        let index = self.pool.intern_method_ref(owner, name, descriptor, true)?;
        let (args, _) = crate::descriptor::parse_method(descriptor)?;
        let slots: usize = 1 + args.iter().map(|a| if a.is_wide() { 2 } else { 1 }).sum::<usize>();
        self.insns.push(Insn::InvokeInterface {
            index,
            count: slots as u8,
        });
        Ok(self)
    }

    /// `new` preceded by the label its uninitialized type refers to.
    pub fn new_object(&mut self, class: &str) -> ClassResult<&mut Self> {
        let label = self.new_label();
        let index = self.pool.intern_class(class)?;
        self.insns.push(Insn::Label(label));
        self.insns.push(Insn::Type {
            opcode: op::NEW,
            index,
        });
        Ok(self)
    }

    pub fn type_insn(&mut self, opcode: u8, class: &str) -> ClassResult<&mut Self> {
        let index = self.pool.intern_class(class)?;
        self.insns.push(Insn::Type { opcode, index });
        Ok(self)
    }

    /// `System.err.println(message); System.exit(1);`
    pub fn fail_and_exit(&mut self, message: &str) -> ClassResult<&mut Self> {
        self.get_static("java/lang/System", "err", PRINT_STREAM)?
            .string(message)?
            .invoke_virtual("java/io/PrintStream", "println", PRINTLN)?
            .op(op::ICONST_1)
            .invoke_static("java/lang/System", "exit", "(I)V")
    }
}

/// Assembles a public final class of static methods.
pub struct ClassBuilder {
    name: String,
    class: ClassFile,
}

impl ClassBuilder {
    pub fn new(name: &str) -> ClassResult<Self> {
        Ok(Self {
            name: name.to_string(),
            class: ClassFile::new(
                name,
                "java/lang/Object",
                ACC_PUBLIC | ACC_FINAL | ACC_SUPER,
                RUNTIME_CLASS_VERSION,
            )?,
        })
    }

    /// Adds `public static name(descriptor)`. Stack and locals sizes come from the
    /// interpreter.
    pub fn static_method(
        &mut self,
        name: &str,
        descriptor: &str,
        body: impl FnOnce(&mut Emitter<'_>) -> ClassResult<()>,
    ) -> ClassResult<&mut Self> {
        let mut code = Code::new(0, 0);
        let insns = {
            let mut e = Emitter::new(&mut self.class.pool, &mut code);
            body(&mut e)?;
            e.finish()
        };
        code.insns = insns;
        let sig = MethodSig {
            class_name: &self.name,
            name,
            descriptor,
            is_static: true,
        };
        let analysis = frames::analyze(&code, &sig, &self.class.pool)?;
        code.max_stack = analysis.max_stack as u16;
        code.max_locals = analysis.max_locals as u16;

        let name_index = self.class.pool.intern_utf8(name)?;
        let descriptor_index = self.class.pool.intern_utf8(descriptor)?;
        self.class.methods.push(Member {
            access: ACC_PUBLIC | ACC_STATIC,
            name: name_index,
            descriptor: descriptor_index,
            attributes: Vec::new(),
            code: Some(code),
        });
        Ok(self)
    }

    pub fn finish(self) -> ClassFile {
        self.class
    }
}

/// `decryptBase64(String)`: Base64-decodes, then AES/ECB/PKCS5 decrypts with the embedded key.
pub fn string_decryptor(name: &str, key_b64: &str) -> ClassResult<ClassFile> {
    let mut b = ClassBuilder::new(name)?;
    b.static_method(DECRYPT_METHOD, DECRYPT_DESCRIPTOR, |e| {
        e.invoke_static(BASE64, "getDecoder", GET_DECODER)?
            .var(op::ALOAD, 0)
            .invoke_virtual(BASE64_DECODER, "decode", DECODE)?
            .var(op::ASTORE, 1)
            .string("AES/ECB/PKCS5Padding")?
            .invoke_static("javax/crypto/Cipher", "getInstance", "(Ljava/lang/String;)Ljavax/crypto/Cipher;")?
            .var(op::ASTORE, 2)
            .var(op::ALOAD, 2)
            // Cipher.DECRYPT_MODE
            .op(op::ICONST_2)
            .new_object("javax/crypto/spec/SecretKeySpec")?
            .op(op::DUP)
            .invoke_static(BASE64, "getDecoder", GET_DECODER)?
            .string(key_b64)?
            .invoke_virtual(BASE64_DECODER, "decode", DECODE)?
            .string("AES")?
            .invoke_special("javax/crypto/spec/SecretKeySpec", "<init>", "([BLjava/lang/String;)V")?
            .invoke_virtual("javax/crypto/Cipher", "init", "(ILjava/security/Key;)V")?
            .new_object(STRING)?
            .op(op::DUP)
            .var(op::ALOAD, 2)
            .var(op::ALOAD, 1)
            .invoke_virtual("javax/crypto/Cipher", "doFinal", "([B)[B")?
            .get_static("java/nio/charset/StandardCharsets", "UTF_8", "Ljava/nio/charset/Charset;")?
            .invoke_special(STRING, "<init>", "([BLjava/nio/charset/Charset;)V")?
            .op(op::ARETURN);
        Ok(())
    })?;
    Ok(b.finish())
}

/// Launch guard: machine fingerprint, launch-directory and password checks, and a `main`
/// that prints the values to configure.
pub fn guard(name: &str) -> ClassResult<ClassFile> {
    let mut b = ClassBuilder::new(name)?;
    let owner = name.to_string();

    b.static_method("fingerprint", "()Ljava/lang/String;", |e| {
        e.new_object(STRING_BUILDER)?
            .op(op::DUP)
            .invoke_special(STRING_BUILDER, "<init>", "()V")?;
        for (label, property) in [("user:", "user.name"), (";os:", "os.name"), (";arch:", "os.arch")] {
            e.string(label)?
                .invoke_virtual(STRING_BUILDER, "append", APPEND)?
                .string(property)?
                .invoke_static("java/lang/System", "getProperty", "(Ljava/lang/String;)Ljava/lang/String;")?
                .invoke_virtual(STRING_BUILDER, "append", APPEND)?;
        }
        e.invoke_virtual(STRING_BUILDER, "toString", "()Ljava/lang/String;")?
            .var(op::ASTORE, 0)
            .string("SHA-256")?
            .invoke_static(
                "java/security/MessageDigest",
                "getInstance",
                "(Ljava/lang/String;)Ljava/security/MessageDigest;",
            )?
            .var(op::ALOAD, 0)
            .get_static("java/nio/charset/StandardCharsets", "UTF_8", "Ljava/nio/charset/Charset;")?
            .invoke_virtual(STRING, "getBytes", "(Ljava/nio/charset/Charset;)[B")?
            .invoke_virtual("java/security/MessageDigest", "digest", "([B)[B")?
            .var(op::ASTORE, 1)
            .string("%064x")?
            .op(op::ICONST_1)
            .type_insn(op::ANEWARRAY, "java/lang/Object")?
            .op(op::DUP)
            .op(op::ICONST_0)
            .new_object("java/math/BigInteger")?
            .op(op::DUP)
            .op(op::ICONST_1)
            .var(op::ALOAD, 1)
            .invoke_special("java/math/BigInteger", "<init>", "(I[B)V")?
            .op(op::AASTORE)
            .invoke_static(STRING, "format", "(Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/String;")?
            .op(op::ARETURN);
        Ok(())
    })?;

    b.static_method(CHECK_MACHINE, CHECK_STRING_DESCRIPTOR, |e| {
        let ok = e.new_label();
        e.var(op::ALOAD, 0)
            .invoke_static(&owner, "fingerprint", "()Ljava/lang/String;")?
            .invoke_virtual(STRING, "equals", "(Ljava/lang/Object;)Z")?
            .jump(op::IFNE, ok)
            .fail_and_exit("Unauthorized machine")?
            .label(ok)
            .op(op::RETURN);
        Ok(())
    })?;

    b.static_method(CHECK_LAUNCH_DIR, CHECK_STRING_DESCRIPTOR, |e| {
        let ok = e.new_label();
        push_canonical_cwd(e)?
            .var(op::ALOAD, 0)
            .invoke_virtual(STRING, "equals", "(Ljava/lang/Object;)Z")?
            .jump(op::IFNE, ok)
            .fail_and_exit("Wrong launch folder")?
            .label(ok)
            .op(op::RETURN);
        Ok(())
    })?;

    b.static_method(CHECK_PASSWORD, CHECK_PASSWORD_DESCRIPTOR, |e| {
        let have_console = e.new_label();
        let fail = e.new_label();
        e.invoke_static("java/lang/System", "console", "()Ljava/io/Console;")?
            .var(op::ASTORE, 2)
            .var(op::ALOAD, 2)
            .jump(op::IFNONNULL, have_console)
            .fail_and_exit("No console")?
            .op(op::RETURN)
            .label(have_console)
            .var(op::ALOAD, 2)
            .string("Enter application password: ")?
            .op(op::ICONST_0)
            .type_insn(op::ANEWARRAY, "java/lang/Object")?
            .invoke_virtual("java/io/Console", "readPassword", "(Ljava/lang/String;[Ljava/lang/Object;)[C")?
            .var(op::ASTORE, 3)
            .var(op::ALOAD, 3)
            .jump(op::IFNULL, fail)
            .invoke_static(BASE64, "getDecoder", GET_DECODER)?
            .var(op::ALOAD, 0)
            .invoke_virtual(BASE64_DECODER, "decode", DECODE)?
            .var(op::ASTORE, 4)
            .new_object("javax/crypto/spec/PBEKeySpec")?
            .op(op::DUP)
            .var(op::ALOAD, 3)
            .var(op::ALOAD, 4)
            .int(crate::crypto::PBKDF2_ITERATIONS as i32)?
            .int((crate::crypto::HASH_LEN * 8) as i32)?
            .invoke_special("javax/crypto/spec/PBEKeySpec", "<init>", "([C[BII)V")?
            .var(op::ASTORE, 5)
            .string("PBKDF2WithHmacSHA256")?
            .invoke_static(
                "javax/crypto/SecretKeyFactory",
                "getInstance",
                "(Ljava/lang/String;)Ljavax/crypto/SecretKeyFactory;",
            )?
            .var(op::ALOAD, 5)
            .invoke_virtual(
                "javax/crypto/SecretKeyFactory",
                "generateSecret",
                "(Ljava/security/spec/KeySpec;)Ljavax/crypto/SecretKey;",
            )?
            .invoke_interface("javax/crypto/SecretKey", "getEncoded", "()[B")?
            .invoke_static(BASE64, "getDecoder", GET_DECODER)?
            .var(op::ALOAD, 1)
            .invoke_virtual(BASE64_DECODER, "decode", DECODE)?
            .invoke_static("java/security/MessageDigest", "isEqual", "([B[B)Z")?
            .jump(op::IFEQ, fail)
            .op(op::RETURN)
            // reached only by jumps; the frame is the state of the first one
            .label(fail)
            .fail_and_exit("Wrong password. Exiting.")?
            .op(op::RETURN);
        Ok(())
    })?;

    b.static_method("main", "([Ljava/lang/String;)V", |e| {
        e.get_static("java/lang/System", "out", PRINT_STREAM)?
            .new_object(STRING_BUILDER)?
            .op(op::DUP)
            .invoke_special(STRING_BUILDER, "<init>", "()V")?
            .string("CURRENT_HASH=")?
            .invoke_virtual(STRING_BUILDER, "append", APPEND)?
            .invoke_static(&owner, "fingerprint", "()Ljava/lang/String;")?
            .invoke_virtual(STRING_BUILDER, "append", APPEND)?
            .invoke_virtual(STRING_BUILDER, "toString", "()Ljava/lang/String;")?
            .invoke_virtual("java/io/PrintStream", "println", PRINTLN)?
            .get_static("java/lang/System", "out", PRINT_STREAM)?
            .new_object(STRING_BUILDER)?
            .op(op::DUP)
            .invoke_special(STRING_BUILDER, "<init>", "()V")?
            .string("CURRENT_DIR=")?
            .invoke_virtual(STRING_BUILDER, "append", APPEND)?;
        push_canonical_cwd(e)?
            .invoke_virtual(STRING_BUILDER, "append", APPEND)?
            .invoke_virtual(STRING_BUILDER, "toString", "()Ljava/lang/String;")?
            .invoke_virtual("java/io/PrintStream", "println", PRINTLN)?
            .op(op::RETURN);
        Ok(())
    })?;

    Ok(b.finish())
}

/// `new File(".").getCanonicalPath()`
fn push_canonical_cwd<'e, 'a>(e: &'e mut Emitter<'a>) -> ClassResult<&'e mut Emitter<'a>> {
    e.new_object("java/io/File")?
        .op(op::DUP)
        .string(".")?
        .invoke_special("java/io/File", "<init>", "(Ljava/lang/String;)V")?
        .invoke_virtual("java/io/File", "getCanonicalPath", "()Ljava/lang/String;")
}
