//! Abstract representation of a Java program.
use crate::jvm::{
    utf8_constant, AttributeInfo, CPInfo, JVMClassFile, ParseError,
};

use regex::Regex;

type Result<T> = std::result::Result<T, ParseError>;

/// Name javac gives the entry point.
pub const MAIN_METHOD: &str = "main";
/// Descriptor of `public static void main(String[] args)`.
pub const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// Representation of Java programs that we want to run.
#[derive(Debug, Clone)]
pub struct Program {
    // Constant pool.
    pub constant_pool: Vec<CPInfo>,
    // Methods, in class-file order.
    pub methods: Vec<Method>,
}

/// Java class method representation for the interpreter.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub descriptor: String,
    pub parameter_count: usize,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
}

impl Program {
    /// Build a new program from a parsed class file, resolving every
    /// method's name and descriptor against the constant pool.
    pub fn new(class_file: &JVMClassFile) -> Result<Self> {
        let pool = class_file.constant_pool();
        let mut methods = Vec::with_capacity(class_file.methods().len());
        for method_info in class_file.methods() {
            let name =
                utf8_constant(pool, method_info.name_index())?.to_string();
            let descriptor =
                utf8_constant(pool, method_info.descriptor_index())?
                    .to_string();
            let Some(AttributeInfo::CodeAttribute {
                max_stack,
                max_locals,
                code,
            }) = method_info.attributes().get("Code")
            else {
                return Err(ParseError::MissingCode { method: name });
            };
            let parameter_count = parameter_count(&descriptor)?;
            methods.push(Method {
                name,
                descriptor,
                parameter_count,
                max_stack: *max_stack,
                max_locals: *max_locals,
                code: code.clone(),
            });
        }
        Ok(Self {
            // Keep a copy of the constant pool for ldc and call
            // resolution at run time.
            constant_pool: pool.to_vec(),
            methods,
        })
    }

    /// Looks up a constant by its 1-based pool index.
    pub fn constant(&self, index: u16) -> Option<&CPInfo> {
        index
            .checked_sub(1)
            .and_then(|index| self.constant_pool.get(index as usize))
    }

    /// The integer behind an `ldc` pool index, if that is what it names.
    pub fn integer_constant(&self, index: u16) -> Option<i32> {
        match self.constant(index) {
            Some(CPInfo::ConstantInteger { bytes }) => Some(*bytes),
            _ => None,
        }
    }

    /// Resolves an `invokestatic` operand: Methodref, then NameAndType,
    /// then the Utf8 name and descriptor, down to a method of this
    /// class.
    pub fn resolve_static(&self, index: u16) -> Option<&Method> {
        let name_and_type_index = match self.constant(index)? {
            CPInfo::ConstantMethodRef {
                name_and_type_index,
                ..
            } => *name_and_type_index,
            _ => return None,
        };
        let (name_index, descriptor_index) =
            match self.constant(name_and_type_index)? {
                CPInfo::ConstantNameAndType {
                    name_index,
                    descriptor_index,
                } => (*name_index, *descriptor_index),
                _ => return None,
            };
        let name = self.utf8(name_index)?;
        let descriptor = self.utf8(descriptor_index)?;
        self.find_method(name, descriptor)
    }

    /// Finds a method by exact name and descriptor.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    // Returns the program entry point, the static main method javac
    // emits for `public static void main(String[] args)`.
    pub fn entry_point(&self) -> Option<&Method> {
        self.find_method(MAIN_METHOD, MAIN_DESCRIPTOR)
    }

    fn utf8(&self, index: u16) -> Option<&str> {
        match self.constant(index) {
            Some(CPInfo::ConstantUtf8 { bytes }) => Some(bytes),
            _ => None,
        }
    }
}

// Counts the parameters in a method descriptor, one per type token.
fn parameter_count(descriptor: &str) -> Result<usize> {
    let re = Regex::new(r"\(([^\)]*)\)([^$]+)").unwrap();
    let caps = re.captures(descriptor).ok_or_else(|| {
        ParseError::BadDescriptor {
            descriptor: descriptor.to_string(),
        }
    })?;
    let mut parameters = caps.get(1).map_or("", |m| m.as_str());
    let mut count = 0;
    while !parameters.is_empty() {
        let length = type_token_length(parameters).ok_or_else(|| {
            ParseError::BadDescriptor {
                descriptor: descriptor.to_string(),
            }
        })?;
        parameters = &parameters[length..];
        count += 1;
    }
    Ok(count)
}

// Length of the leading type token: one byte for base types, `L...;`
// up to the semicolon for class names, and `[` folding into whatever
// element type follows.
fn type_token_length(s: &str) -> Option<usize> {
    match s.as_bytes().first()? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => Some(1),
        b'L' => s.find(';').map(|end| end + 1),
        b'[' => type_token_length(&s[1..]).map(|length| length + 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::jvm::JVMParser;
    use crate::testutil::ClassFileBuilder;

    fn sample_program() -> Program {
        let bytes = ClassFileBuilder::new()
            .utf8("Code")
            .utf8("main")
            .utf8(MAIN_DESCRIPTOR)
            .utf8("fact")
            .utf8("(I)I")
            .name_and_type(4, 5)
            .method_ref(8, 6)
            .class(9)
            .utf8("Fact")
            .integer(1_000_000)
            .method(2, 3, 2, 1, vec![0x10, 0x05, 0xb8, 0x00, 0x07, 0xb1])
            .method(4, 5, 2, 1, vec![0x1a, 0xac])
            .build();
        let class_file = JVMParser::parse(&bytes).unwrap();
        Program::new(&class_file).unwrap()
    }

    #[test]
    fn builds_resolved_methods() {
        let program = sample_program();
        assert_eq!(program.methods.len(), 2);

        let main = &program.methods[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.descriptor, MAIN_DESCRIPTOR);
        assert_eq!(main.parameter_count, 1);
        assert_eq!(main.max_stack, 2);

        let fact = &program.methods[1];
        assert_eq!(fact.name, "fact");
        assert_eq!(fact.parameter_count, 1);
        assert_eq!(fact.code, vec![0x1a, 0xac]);
    }

    #[test]
    fn entry_point_wants_the_exact_main_signature() {
        let program = sample_program();
        assert_eq!(program.entry_point().unwrap().name, "main");

        // A main with the wrong descriptor is just another method.
        let bytes = ClassFileBuilder::new()
            .utf8("Code")
            .utf8("main")
            .utf8("()V")
            .method(2, 3, 1, 1, vec![0xb1])
            .build();
        let class_file = JVMParser::parse(&bytes).unwrap();
        let program = Program::new(&class_file).unwrap();
        assert!(program.entry_point().is_none());
    }

    #[test]
    fn find_method_matches_name_and_descriptor() {
        let program = sample_program();
        assert!(program.find_method("fact", "(I)I").is_some());
        assert!(program.find_method("fact", "(II)I").is_none());
        assert!(program.find_method("fib", "(I)I").is_none());
    }

    #[test]
    fn resolve_static_follows_the_reference_chain() {
        let program = sample_program();
        let fact = program.resolve_static(7).unwrap();
        assert_eq!(fact.name, "fact");

        // Entries of the wrong shape and dangling indices resolve to
        // nothing.
        assert!(program.resolve_static(6).is_none());
        assert!(program.resolve_static(8).is_none());
        assert!(program.resolve_static(0).is_none());
        assert!(program.resolve_static(99).is_none());
    }

    #[test]
    fn integer_constants_resolve_by_pool_index() {
        let program = sample_program();
        assert_eq!(program.integer_constant(10), Some(1_000_000));
        assert_eq!(program.integer_constant(1), None);
        assert_eq!(program.integer_constant(0), None);
    }

    #[test]
    fn missing_code_attribute_is_an_error() {
        let bytes = ClassFileBuilder::new()
            .utf8("f")
            .utf8("()V")
            .method_without_code(1, 2)
            .build();
        let class_file = JVMParser::parse(&bytes).unwrap();
        let err = Program::new(&class_file).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingCode {
                method: "f".to_string()
            }
        );
    }

    #[test]
    fn counts_descriptor_parameters() {
        assert_eq!(parameter_count("()V").unwrap(), 0);
        assert_eq!(parameter_count("(II)I").unwrap(), 2);
        assert_eq!(parameter_count("([Ljava/lang/String;)V").unwrap(), 1);
        assert_eq!(parameter_count("([I)I").unwrap(), 1);
        assert_eq!(parameter_count("(I[II)I").unwrap(), 3);
        assert_eq!(parameter_count("([[I[J)V").unwrap(), 2);
        assert_eq!(parameter_count("(Ljava/util/List;I)V").unwrap(), 2);
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        for descriptor in ["", "main", "(I", "()", "(X)V", "(L)V", "([)V"] {
            assert_eq!(
                parameter_count(descriptor),
                Err(ParseError::BadDescriptor {
                    descriptor: descriptor.to_string()
                }),
                "descriptor {descriptor:?}"
            );
        }
    }
}
