//! A miniature JVM for a restricted bytecode subset: a class-file
//! parser, a resolved program model and a stack-machine interpreter
//! with heap-backed int arrays.
pub mod bytecode;
pub mod heap;
pub mod jvm;
pub mod program;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testutil;
