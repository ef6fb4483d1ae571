//! # jar-obfuscator
//!
//! Obfuscates Java applications by rewriting the class files inside their JARs.
//!
//! ## Architecture
//!
//! - **classfile**: class-file model, reader and writer
//! - **pool**: constant pool with interning and modified UTF-8 (**mutf8**) strings
//! - **bytecode**: label-based instruction list, decoded from and assembled to `Code`
//! - **frames**: StackMapTable decoding, the linear type interpreter and frame recomputation
//! - **descriptor**: descriptor and generic-signature parsing and class-name remapping
//! - **jar**: JAR reading and writing, manifest handling
//! - **scan**: JAR discovery for directory inputs
//! - **crypto**: AES string encryption and PBKDF2 password hashing
//! - **runtime**: generated support classes (`StringDecryptor`, `Guard`)
//! - **passes**: the transformations and their fixed ordering
//! - **pipeline**: read, transform and write one JAR, and report on it
//! - **cli** / **config**: command line and TOML configuration

pub mod bytecode;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod descriptor;
pub mod error;
pub mod frames;
pub mod jar;
pub mod mutf8;
pub mod passes;
pub mod pipeline;
pub mod pool;
pub mod runtime;
pub mod scan;
