//! Test helper for assembling synthetic class files byte by byte,
//! so parser and pipeline tests do not depend on a Java toolchain.

use byteorder::{BigEndian, WriteBytesExt};

const ACC_STATIC: u16 = 0x0008;
const ACC_PUBLIC_STATIC: u16 = 0x0009;

enum Constant {
    Utf8(String),
    Integer(i32),
    Class(u16),
    MethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    Raw(u8, Vec<u8>),
}

enum AttributeSpec {
    Code {
        // Resolved against the Utf8 "Code" entry when absent.
        name_index: Option<u16>,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    },
    Foreign { name_index: u16, payload: Vec<u8> },
}

struct MethodSpec {
    name_index: u16,
    descriptor_index: u16,
    attributes: Vec<AttributeSpec>,
}

/// Builds class-file images with a chosen constant pool, interface,
/// field and method tables. Indices handed to the builder are 1-based,
/// as everywhere else in the format.
pub(crate) struct ClassFileBuilder {
    constants: Vec<Constant>,
    interfaces: Vec<u16>,
    fields: Vec<(u16, u16)>,
    methods: Vec<MethodSpec>,
}

impl ClassFileBuilder {
    pub(crate) fn new() -> Self {
        Self {
            constants: Vec::new(),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub(crate) fn utf8(mut self, value: &str) -> Self {
        self.constants.push(Constant::Utf8(value.to_string()));
        self
    }

    pub(crate) fn integer(mut self, value: i32) -> Self {
        self.constants.push(Constant::Integer(value));
        self
    }

    pub(crate) fn class(mut self, name_index: u16) -> Self {
        self.constants.push(Constant::Class(name_index));
        self
    }

    pub(crate) fn method_ref(
        mut self,
        class_index: u16,
        name_and_type_index: u16,
    ) -> Self {
        self.constants.push(Constant::MethodRef {
            class_index,
            name_and_type_index,
        });
        self
    }

    pub(crate) fn name_and_type(
        mut self,
        name_index: u16,
        descriptor_index: u16,
    ) -> Self {
        self.constants.push(Constant::NameAndType {
            name_index,
            descriptor_index,
        });
        self
    }

    /// Emits an arbitrary pool entry, valid or not.
    pub(crate) fn raw_constant(mut self, tag: u8, payload: &[u8]) -> Self {
        self.constants.push(Constant::Raw(tag, payload.to_vec()));
        self
    }

    pub(crate) fn interface(mut self, index: u16) -> Self {
        self.interfaces.push(index);
        self
    }

    pub(crate) fn field(mut self, name_index: u16, descriptor_index: u16) -> Self {
        self.fields.push((name_index, descriptor_index));
        self
    }

    pub(crate) fn method(
        mut self,
        name_index: u16,
        descriptor_index: u16,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> Self {
        self.methods.push(MethodSpec {
            name_index,
            descriptor_index,
            attributes: vec![AttributeSpec::Code {
                name_index: None,
                max_stack,
                max_locals,
                code,
            }],
        });
        self
    }

    /// A method carrying a foreign attribute ahead of its `Code`.
    pub(crate) fn method_with_extra_attribute(
        mut self,
        name_index: u16,
        descriptor_index: u16,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        extra_name_index: u16,
    ) -> Self {
        self.methods.push(MethodSpec {
            name_index,
            descriptor_index,
            attributes: vec![
                AttributeSpec::Foreign {
                    name_index: extra_name_index,
                    payload: vec![0, 0, 0, 1, 0, 3, 0, 1],
                },
                AttributeSpec::Code {
                    name_index: None,
                    max_stack,
                    max_locals,
                    code,
                },
            ],
        });
        self
    }

    /// A method whose single attribute names an explicit pool index,
    /// dangling or otherwise.
    pub(crate) fn method_with_attribute_name_index(
        mut self,
        name_index: u16,
        descriptor_index: u16,
        attribute_name_index: u16,
        code: Vec<u8>,
    ) -> Self {
        self.methods.push(MethodSpec {
            name_index,
            descriptor_index,
            attributes: vec![AttributeSpec::Code {
                name_index: Some(attribute_name_index),
                max_stack: 1,
                max_locals: 1,
                code,
            }],
        });
        self
    }

    /// A method with no attributes at all.
    pub(crate) fn method_without_code(
        mut self,
        name_index: u16,
        descriptor_index: u16,
    ) -> Self {
        self.methods.push(MethodSpec {
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
        self
    }

    fn utf8_index(&self, value: &str) -> u16 {
        self.constants
            .iter()
            .position(|constant| {
                matches!(constant, Constant::Utf8(bytes) if bytes == value)
            })
            .map(|position| position as u16 + 1)
            .unwrap_or_else(|| panic!("no Utf8 entry for {value:?}"))
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(0xCAFE_BABE).unwrap();
        out.write_u16::<BigEndian>(0).unwrap();
        // Java 11 class-file version.
        out.write_u16::<BigEndian>(55).unwrap();

        out.write_u16::<BigEndian>(self.constants.len() as u16 + 1)
            .unwrap();
        for constant in &self.constants {
            match constant {
                Constant::Utf8(value) => {
                    out.write_u8(1).unwrap();
                    out.write_u16::<BigEndian>(value.len() as u16).unwrap();
                    out.extend_from_slice(value.as_bytes());
                }
                Constant::Integer(value) => {
                    out.write_u8(3).unwrap();
                    out.write_i32::<BigEndian>(*value).unwrap();
                }
                Constant::Class(name_index) => {
                    out.write_u8(7).unwrap();
                    out.write_u16::<BigEndian>(*name_index).unwrap();
                }
                Constant::MethodRef {
                    class_index,
                    name_and_type_index,
                } => {
                    out.write_u8(10).unwrap();
                    out.write_u16::<BigEndian>(*class_index).unwrap();
                    out.write_u16::<BigEndian>(*name_and_type_index).unwrap();
                }
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    out.write_u8(12).unwrap();
                    out.write_u16::<BigEndian>(*name_index).unwrap();
                    out.write_u16::<BigEndian>(*descriptor_index).unwrap();
                }
                Constant::Raw(tag, payload) => {
                    out.write_u8(*tag).unwrap();
                    out.extend_from_slice(payload);
                }
            }
        }

        // ACC_PUBLIC | ACC_SUPER, then this_class and super_class.
        out.write_u16::<BigEndian>(0x0021).unwrap();
        out.write_u16::<BigEndian>(0).unwrap();
        out.write_u16::<BigEndian>(0).unwrap();

        out.write_u16::<BigEndian>(self.interfaces.len() as u16)
            .unwrap();
        for index in &self.interfaces {
            out.write_u16::<BigEndian>(*index).unwrap();
        }

        out.write_u16::<BigEndian>(self.fields.len() as u16).unwrap();
        for (name_index, descriptor_index) in &self.fields {
            out.write_u16::<BigEndian>(ACC_STATIC).unwrap();
            out.write_u16::<BigEndian>(*name_index).unwrap();
            out.write_u16::<BigEndian>(*descriptor_index).unwrap();
            out.write_u16::<BigEndian>(0).unwrap();
        }

        out.write_u16::<BigEndian>(self.methods.len() as u16)
            .unwrap();
        for method in &self.methods {
            out.write_u16::<BigEndian>(ACC_PUBLIC_STATIC).unwrap();
            out.write_u16::<BigEndian>(method.name_index).unwrap();
            out.write_u16::<BigEndian>(method.descriptor_index).unwrap();
            out.write_u16::<BigEndian>(method.attributes.len() as u16)
                .unwrap();
            for attribute in &method.attributes {
                match attribute {
                    AttributeSpec::Code {
                        name_index,
                        max_stack,
                        max_locals,
                        code,
                    } => {
                        let name_index =
                            name_index.unwrap_or_else(|| self.utf8_index("Code"));
                        let mut body = Vec::new();
                        body.write_u16::<BigEndian>(*max_stack).unwrap();
                        body.write_u16::<BigEndian>(*max_locals).unwrap();
                        body.write_u32::<BigEndian>(code.len() as u32).unwrap();
                        body.extend_from_slice(code);
                        // Empty exception table, no nested attributes.
                        body.write_u16::<BigEndian>(0).unwrap();
                        body.write_u16::<BigEndian>(0).unwrap();

                        out.write_u16::<BigEndian>(name_index).unwrap();
                        out.write_u32::<BigEndian>(body.len() as u32).unwrap();
                        out.extend_from_slice(&body);
                    }
                    AttributeSpec::Foreign { name_index, payload } => {
                        out.write_u16::<BigEndian>(*name_index).unwrap();
                        out.write_u32::<BigEndian>(payload.len() as u32).unwrap();
                        out.extend_from_slice(payload);
                    }
                }
            }
        }

        // No class-level attributes.
        out.write_u16::<BigEndian>(0).unwrap();
        out
    }
}
