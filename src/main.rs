use std::env;
use std::path::Path;
use std::process;

use ristretto::jvm::{read_class_file, JVMParser};
use ristretto::program::Program;
use ristretto::runtime::Runtime;

fn fail(message: &str) -> ! {
    eprintln!("{message}");
    process::exit(1);
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let path = match args.as_slice() {
        [_, path] => Path::new(path),
        _ => {
            let name = args.first().map_or("ristretto", String::as_str);
            fail(&format!("USAGE: {name} <class file>"));
        }
    };

    let class_file_bytes = match read_class_file(path) {
        Ok(bytes) => bytes,
        Err(err) => fail(&format!("{}: {err}", path.display())),
    };
    let class_file = match JVMParser::parse(&class_file_bytes) {
        Ok(class_file) => class_file,
        Err(err) => fail(&format!("{}: {err}", path.display())),
    };
    let program = match Program::new(&class_file) {
        Ok(program) => program,
        Err(err) => fail(&format!("{}: {err}", path.display())),
    };

    let mut runtime = Runtime::new(program);
    if let Err(err) = runtime.run() {
        fail(&format!("{err}"));
    }
}
