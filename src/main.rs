// Rill: a small statically-typed language and its stack machine.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

use std::env::args;
use std::fs;
use std::io::stdout;
use std::path::Path;
use std::process;

use rill::config::{Config, SETTINGS_PATH};
use rill::ir::{self, IrModule};
use rill::lexer;
use rill::parser;
use rill::typechecker;
use rill::vm::StackMachine;


fn main() {
    let path = match args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: rill <source-file>");
            process::exit(1);
        }
    };
    let config = Config::load(Path::new(SETTINGS_PATH));
    if let Err(message) = compile_and_run(&path, config) {
        eprintln!("{}", message);
        process::exit(1);
    }
}

// One shot: lex, parse, check, lower, run.
fn compile_and_run(path: &str, config: Config) -> Result<(), String> {
    let source = fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e))?;

    let tokens = lexer::tokenize(&source).map_err(|e| format!("lexical error: {}", e))?;
    if config.debug {
        eprintln!("{:?}", tokens);
    }

    let program = parser::parse(tokens).map_err(|e| format!("parse error: {}", e))?;
    if config.debug {
        eprintln!("{:#?}", program);
    }

    typechecker::check_program(&program).map_err(|e| format!("semantic error: {}", e))?;

    let module = ir::lower(&program);
    if config.debug {
        eprint!("{}", module.dump());
    }
    if config.generate_output_file {
        write_ir_dump(path, &module)?;
    }

    let mut machine = StackMachine::new(&module).map_err(|e| format!("load error: {}", e))?;
    machine.set_debug(config.debug);
    machine.run(&mut stdout()).map_err(|e| {
        let (function, pc) = machine.position();
        format!("runtime error in '{}' at pc {}: {}", function, pc, e)
    })
}

// Persist the IR text dump under output/<stem>/<stem>.ir.
fn write_ir_dump(path: &str, module: &IrModule) -> Result<(), String> {
    let stem = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("program");
    let dir = Path::new("output").join(stem);
    fs::create_dir_all(&dir).map_err(|e| format!("{}: {}", dir.display(), e))?;
    let file = dir.join(format!("{}.ir", stem));
    fs::write(&file, module.dump()).map_err(|e| format!("{}: {}", file.display(), e))
}
