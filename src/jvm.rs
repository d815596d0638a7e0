//! Lightweight implementation of a parser and decoder for JVM bytecode
//! class files.
//!
//! Only the structures the runtime consumes are modeled: the constant
//! pool (seven tags), and per-method `Code` attributes. Interfaces,
//! fields and all other attributes are decoded structurally and skipped.
//! Every multi-byte quantity in a class file is big-endian.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};

type Result<T> = std::result::Result<T, ParseError>;

/// Magic number opening every class file.
const CLASS_FILE_MAGIC: u32 = 0xCAFE_BABE;

mod constant_tags {
    pub const CONSTANT_UTF8: u8 = 1;
    pub const CONSTANT_INTEGER: u8 = 3;
    pub const CONSTANT_CLASS: u8 = 7;
    pub const CONSTANT_STRING: u8 = 8;
    pub const CONSTANT_FIELDREF: u8 = 9;
    pub const CONSTANT_METHODREF: u8 = 10;
    pub const CONSTANT_NAMEANDTYPE: u8 = 12;
}

/// `ParseError` represents the ways a class file can fail to load,
/// covering both the binary decode in this module and the model-building
/// checks in `program`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The file does not start with `0xCAFEBABE`.
    BadMagic { magic: u32 },
    /// A read ran past the end of the input.
    UnexpectedEof,
    /// A constant-pool tag outside the supported set.
    UnsupportedConstant { tag: u8 },
    /// A Utf8 constant whose payload is not valid UTF-8.
    BadUtf8,
    /// A constant-pool reference that resolves to nothing usable.
    BadConstantIndex { index: u16 },
    /// A method with no `Code` attribute.
    MissingCode { method: String },
    /// A method descriptor that does not follow the descriptor grammar.
    BadDescriptor { descriptor: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadMagic { magic } => {
                write!(f, "not a class file (magic {magic:#010x})")
            }
            Self::UnexpectedEof => write!(f, "class file ends prematurely"),
            Self::UnsupportedConstant { tag } => {
                write!(f, "unsupported constant pool tag {tag}")
            }
            Self::BadUtf8 => write!(f, "constant pool holds invalid UTF-8"),
            Self::BadConstantIndex { index } => {
                write!(f, "dangling constant pool index {index}")
            }
            Self::MissingCode { method } => {
                write!(f, "method {method} has no Code attribute")
            }
            Self::BadDescriptor { descriptor } => {
                write!(f, "malformed method descriptor {descriptor}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Entries of the constant pool. Indices stored inside entries are
/// 1-based, exactly as encoded in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CPInfo {
    ConstantUtf8 { bytes: String },
    ConstantInteger { bytes: i32 },
    ConstantClass { name_index: u16 },
    ConstantString { string_index: u16 },
    ConstantFieldRef { class_index: u16, name_and_type_index: u16 },
    ConstantMethodRef { class_index: u16, name_and_type_index: u16 },
    ConstantNameAndType { name_index: u16, descriptor_index: u16 },
}

/// Method attributes the runtime cares about. Anything else is skipped
/// at parse time and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeInfo {
    CodeAttribute {
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    },
}

/// Raw method entry as encoded in the class file, before the program
/// model resolves its name and descriptor strings.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    attributes: HashMap<String, AttributeInfo>,
}

impl MethodInfo {
    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn name_index(&self) -> u16 {
        self.name_index
    }

    pub fn descriptor_index(&self) -> u16 {
        self.descriptor_index
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeInfo> {
        &self.attributes
    }
}

/// A parsed class file.
#[derive(Debug, Clone)]
pub struct JVMClassFile {
    minor_version: u16,
    major_version: u16,
    constant_pool: Vec<CPInfo>,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    methods: Vec<MethodInfo>,
}

impl JVMClassFile {
    pub fn minor_version(&self) -> u16 {
        self.minor_version
    }

    pub fn major_version(&self) -> u16 {
        self.major_version
    }

    pub fn constant_pool(&self) -> &[CPInfo] {
        &self.constant_pool
    }

    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn this_class(&self) -> u16 {
        self.this_class
    }

    pub fn super_class(&self) -> u16 {
        self.super_class
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }
}

/// Resolves a 1-based constant-pool index to a Utf8 string.
pub(crate) fn utf8_constant(pool: &[CPInfo], index: u16) -> Result<&str> {
    match index
        .checked_sub(1)
        .and_then(|index| pool.get(index as usize))
    {
        Some(CPInfo::ConstantUtf8 { bytes }) => Ok(bytes),
        _ => Err(ParseError::BadConstantIndex { index }),
    }
}

/// Parser for the class-file subset.
pub struct JVMParser;

impl JVMParser {
    /// Parses a class file out of raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<JVMClassFile> {
        let mut reader = ClassReader::new(bytes);
        let magic = reader.read_u32()?;
        if magic != CLASS_FILE_MAGIC {
            return Err(ParseError::BadMagic { magic });
        }
        let minor_version = reader.read_u16()?;
        let major_version = reader.read_u16()?;
        let constant_pool = Self::parse_constant_pool(&mut reader)?;
        let access_flags = reader.read_u16()?;
        let this_class = reader.read_u16()?;
        let super_class = reader.read_u16()?;
        let interfaces_count = reader.read_u16()?;
        reader.skip(interfaces_count as usize * 2)?;
        Self::skip_fields(&mut reader)?;
        let methods = Self::parse_methods(&mut reader, &constant_pool)?;
        // Class-level attributes (SourceFile and friends) are skipped.
        Self::skip_attributes(&mut reader)?;
        Ok(JVMClassFile {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            methods,
        })
    }

    fn parse_constant_pool(reader: &mut ClassReader) -> Result<Vec<CPInfo>> {
        use constant_tags::*;

        let count = reader.read_u16()?;
        let mut pool = Vec::with_capacity(count.saturating_sub(1) as usize);
        // The pool holds count - 1 entries, indexed from 1.
        for _ in 1..count {
            let tag = reader.read_u8()?;
            let info = match tag {
                CONSTANT_UTF8 => {
                    let length = reader.read_u16()?;
                    let bytes = reader.read_bytes(length as usize)?;
                    let bytes = String::from_utf8(bytes)
                        .map_err(|_| ParseError::BadUtf8)?;
                    CPInfo::ConstantUtf8 { bytes }
                }
                CONSTANT_INTEGER => CPInfo::ConstantInteger {
                    bytes: reader.read_i32()?,
                },
                CONSTANT_CLASS => CPInfo::ConstantClass {
                    name_index: reader.read_u16()?,
                },
                CONSTANT_STRING => CPInfo::ConstantString {
                    string_index: reader.read_u16()?,
                },
                CONSTANT_FIELDREF => CPInfo::ConstantFieldRef {
                    class_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                CONSTANT_METHODREF => CPInfo::ConstantMethodRef {
                    class_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                CONSTANT_NAMEANDTYPE => CPInfo::ConstantNameAndType {
                    name_index: reader.read_u16()?,
                    descriptor_index: reader.read_u16()?,
                },
                _ => return Err(ParseError::UnsupportedConstant { tag }),
            };
            pool.push(info);
        }
        Ok(pool)
    }

    fn parse_methods(
        reader: &mut ClassReader,
        pool: &[CPInfo],
    ) -> Result<Vec<MethodInfo>> {
        let count = reader.read_u16()?;
        let mut methods = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let access_flags = reader.read_u16()?;
            let name_index = reader.read_u16()?;
            let descriptor_index = reader.read_u16()?;
            let attributes = Self::parse_attributes(reader, pool)?;
            methods.push(MethodInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }
        Ok(methods)
    }

    fn parse_attributes(
        reader: &mut ClassReader,
        pool: &[CPInfo],
    ) -> Result<HashMap<String, AttributeInfo>> {
        let count = reader.read_u16()?;
        let mut attributes = HashMap::new();
        for _ in 0..count {
            let name_index = reader.read_u16()?;
            let length = reader.read_u32()?;
            let name = utf8_constant(pool, name_index)?;
            if name == "Code" {
                let max_stack = reader.read_u16()?;
                let max_locals = reader.read_u16()?;
                let code_length = reader.read_u32()?;
                let code = reader.read_bytes(code_length as usize)?;
                let exception_table_length = reader.read_u16()?;
                reader.skip(exception_table_length as usize * 8)?;
                Self::skip_attributes(reader)?;
                attributes.insert(
                    name.to_string(),
                    AttributeInfo::CodeAttribute {
                        max_stack,
                        max_locals,
                        code,
                    },
                );
            } else {
                reader.skip(length as usize)?;
            }
        }
        Ok(attributes)
    }

    /// Skips an attribute table without interpreting it.
    fn skip_attributes(reader: &mut ClassReader) -> Result<()> {
        let count = reader.read_u16()?;
        for _ in 0..count {
            reader.skip(2)?;
            let length = reader.read_u32()?;
            reader.skip(length as usize)?;
        }
        Ok(())
    }

    /// Skips the field table; the subset has no field access.
    fn skip_fields(reader: &mut ClassReader) -> Result<()> {
        let count = reader.read_u16()?;
        for _ in 0..count {
            // access_flags, name_index and descriptor_index.
            reader.skip(6)?;
            Self::skip_attributes(reader)?;
        }
        Ok(())
    }
}

/// Big-endian reader over the raw class-file bytes. Every accessor turns
/// running out of input into `ParseError::UnexpectedEof`.
struct ClassReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ClassReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        len.saturating_sub(self.cursor.position()) as usize
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(|_| ParseError::UnexpectedEof)
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.cursor
            .read_u16::<BigEndian>()
            .map_err(|_| ParseError::UnexpectedEof)
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| ParseError::UnexpectedEof)
    }

    fn read_i32(&mut self) -> Result<i32> {
        self.cursor
            .read_i32::<BigEndian>()
            .map_err(|_| ParseError::UnexpectedEof)
    }

    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        if self.remaining() < count {
            return Err(ParseError::UnexpectedEof);
        }
        let mut buf = vec![0; count];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| ParseError::UnexpectedEof)?;
        Ok(buf)
    }

    fn skip(&mut self, count: usize) -> Result<()> {
        // A cursor happily seeks past the end, so check before moving.
        if self.remaining() < count {
            return Err(ParseError::UnexpectedEof);
        }
        let position = self.cursor.position();
        self.cursor.set_position(position + count as u64);
        Ok(())
    }
}

/// Reads a class file into memory.
pub fn read_class_file(path: &Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}
