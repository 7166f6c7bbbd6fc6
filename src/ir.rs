// The intermediate representation and its lowering pass.
//
// The IR is a flat, per-function sequence of stack-machine opcodes.
// There are two machine types, 32-bit integers (I) and 32-bit floats
// (F); bool and char are lowered onto I. Control flow is structured:
// IF/ELSE/ENDIF and LOOP/CBREAK/CONTINUE/ENDLOOP are block markers
// whose jump targets are recovered by bracket matching, not explicit
// offsets.
//
// The opcode format is designed to make illegal operations impossible
// to represent: every operand is carried inside its variant, so an
// ill-formed instruction stream cannot be constructed.
//
// All code lives in a function. Statements appearing at the top level
// of a program are collected into a synthetic function named `main`;
// a user-defined `main` is renamed `_actual_main` and called from the
// synthetic one. Variables declared while lowering the synthetic main
// are module globals; everywhere else they are locals.

use crate::ast::*;
use std::fmt;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrType {
    I,
    F,
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IrType::I => f.write_str("I"),
            IrType::F => f.write_str("F"),
        }
    }
}

pub fn ir_type(ty: Type) -> IrType {
    match ty {
        Type::Float => IrType::F,
        Type::Int | Type::Bool | Type::Char => IrType::I,
    }
}

// Byte width of a memory element of the given source type.
pub fn elem_size(ty: Type) -> i32 {
    match ty {
        Type::Char => 1,
        Type::Int | Type::Bool | Type::Float => 4,
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum Opcode {
    // Constants
    ConstI(i32),
    ConstF(f32),

    // Integer arithmetic and comparison
    AddI,
    SubI,
    MulI,
    DivI,
    LtI,
    LeI,
    GtI,
    GeI,
    EqI,
    NeI,

    // Float arithmetic and comparison
    AddF,
    SubF,
    MulF,
    DivF,
    LtF,
    LeF,
    GtF,
    GeF,
    EqF,
    NeF,

    // Bitwise
    AndI,
    OrI,

    // Conversions
    Itof,
    Ftoi,

    // Output
    PrintI,
    PrintF,
    PrintB,

    // Linear memory
    PeekI,
    PokeI,
    PeekF,
    PokeF,
    PeekB,
    PokeB,
    Grow,

    // Variables
    LocalGet(String),
    LocalSet(String),
    GlobalGet(String),
    GlobalSet(String),

    // Calls
    Call(String),
    Ret,

    // Structured control flow
    If,
    Else,
    EndIf,
    Loop,
    CBreak,
    Continue,
    EndLoop,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Opcode::*;
        match self {
            ConstI(v) => write!(f, "CONSTI {}", v),
            ConstF(v) => write!(f, "CONSTF {}", v),
            AddI => f.write_str("ADDI"),
            SubI => f.write_str("SUBI"),
            MulI => f.write_str("MULI"),
            DivI => f.write_str("DIVI"),
            LtI => f.write_str("LTI"),
            LeI => f.write_str("LEI"),
            GtI => f.write_str("GTI"),
            GeI => f.write_str("GEI"),
            EqI => f.write_str("EQI"),
            NeI => f.write_str("NEI"),
            AddF => f.write_str("ADDF"),
            SubF => f.write_str("SUBF"),
            MulF => f.write_str("MULF"),
            DivF => f.write_str("DIVF"),
            LtF => f.write_str("LTF"),
            LeF => f.write_str("LEF"),
            GtF => f.write_str("GTF"),
            GeF => f.write_str("GEF"),
            EqF => f.write_str("EQF"),
            NeF => f.write_str("NEF"),
            AndI => f.write_str("ANDI"),
            OrI => f.write_str("ORI"),
            Itof => f.write_str("ITOF"),
            Ftoi => f.write_str("FTOI"),
            PrintI => f.write_str("PRINTI"),
            PrintF => f.write_str("PRINTF"),
            PrintB => f.write_str("PRINTB"),
            PeekI => f.write_str("PEEKI"),
            PokeI => f.write_str("POKEI"),
            PeekF => f.write_str("PEEKF"),
            PokeF => f.write_str("POKEF"),
            PeekB => f.write_str("PEEKB"),
            PokeB => f.write_str("POKEB"),
            Grow => f.write_str("GROW"),
            LocalGet(name) => write!(f, "LOCAL_GET {}", name),
            LocalSet(name) => write!(f, "LOCAL_SET {}", name),
            GlobalGet(name) => write!(f, "GLOBAL_GET {}", name),
            GlobalSet(name) => write!(f, "GLOBAL_SET {}", name),
            Call(name) => write!(f, "CALL {}", name),
            Ret => f.write_str("RET"),
            If => f.write_str("IF"),
            Else => f.write_str("ELSE"),
            EndIf => f.write_str("ENDIF"),
            Loop => f.write_str("LOOP"),
            CBreak => f.write_str("CBREAK"),
            Continue => f.write_str("CONTINUE"),
            EndLoop => f.write_str("ENDLOOP"),
        }
    }
}


#[derive(Clone, Debug)]
pub struct IrGlobal {
    pub name: String,
    pub ty: IrType,
    pub source: Type,
}


#[derive(Clone, Debug)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<(String, IrType)>,
    pub ret: IrType,
    pub ret_source: Option<Type>,
    pub imported: bool,
    // Locals in declaration order, parameters first. The parallel
    // source-type list drives type dispatch while lowering.
    pub locals: Vec<(String, IrType)>,
    pub locals_source: Vec<(String, Type)>,
    pub code: Vec<Opcode>,
}

impl IrFunction {
    fn new(name: &str, ret_source: Option<Type>, imported: bool) -> IrFunction {
        IrFunction {
            name: name.to_string(),
            params: Vec::new(),
            ret: ret_source.map(ir_type).unwrap_or(IrType::I),
            ret_source,
            imported,
            locals: Vec::new(),
            locals_source: Vec::new(),
            code: Vec::new(),
        }
    }

    fn new_local(&mut self, name: &str, ty: Type) {
        self.locals.push((name.to_string(), ir_type(ty)));
        self.locals_source.push((name.to_string(), ty));
    }

    fn local_source(&self, name: &str) -> Option<Type> {
        self.locals_source
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| *ty)
    }
}


#[derive(Clone, Debug)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
    pub globals: Vec<IrGlobal>,
}

impl IrModule {
    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&IrGlobal> {
        self.globals.iter().find(|g| g.name == name)
    }

    // One logical line per element, suitable for the Debug setting and
    // the generated .ir artifact.
    pub fn dump(&self) -> String {
        let mut text = String::from("MODULE:::\n");
        for global in &self.globals {
            text.push_str(&format!("GLOBAL::: {}: {}\n", global.name, global.ty));
        }
        for func in &self.functions {
            let params: Vec<&str> = func.params.iter().map(|(n, _)| n.as_str()).collect();
            let types: Vec<String> = func.params.iter().map(|(_, t)| t.to_string()).collect();
            text.push_str(&format!(
                "FUNCTION::: {}, [{}], [{}] {}\n",
                func.name,
                params.join(", "),
                types.join(", "),
                func.ret
            ));
            let locals: Vec<String> = func
                .locals
                .iter()
                .map(|(n, t)| format!("{}: {}", n, t))
                .collect();
            text.push_str(&format!("locals: {{{}}}\n", locals.join(", ")));
            for op in &func.code {
                text.push_str(&format!("{}\n", op));
            }
        }
        text
    }
}


// ----------------------------------------------------------------------
// Lowering
// ----------------------------------------------------------------------

// Lower a checked program. Lowering is total on programs that passed
// the checker; the expectations below document that contract.
pub fn lower(program: &Program) -> IrModule {
    let mut lowerer = Lowerer {
        module: IrModule { functions: Vec::new(), globals: Vec::new() },
        cur: 0,
    };
    lowerer
        .module
        .functions
        .push(IrFunction::new("main", Some(Type::Int), false));
    for stmt in &program.stmts {
        lowerer.lower_stmt(stmt);
    }
    if lowerer.module.function("_actual_main").is_some() {
        lowerer.emit(Opcode::Call(String::from("_actual_main")));
    } else {
        lowerer.emit(Opcode::ConstI(0));
    }
    lowerer.emit(Opcode::Ret);
    lowerer.module
}


fn typed(ty: Option<Type>) -> Type {
    ty.expect("expression was typed by the checker")
}

// Pick the I- or F-family opcode for an ordinary binary operator.
fn binop_opcode(op: BinOp, operand: Type) -> Opcode {
    use Opcode::*;
    match (ir_type(operand), op) {
        (IrType::I, BinOp::Add) => AddI,
        (IrType::I, BinOp::Sub) => SubI,
        (IrType::I, BinOp::Mul) => MulI,
        (IrType::I, BinOp::Div) => DivI,
        (IrType::I, BinOp::Lt) => LtI,
        (IrType::I, BinOp::Le) => LeI,
        (IrType::I, BinOp::Gt) => GtI,
        (IrType::I, BinOp::Ge) => GeI,
        (IrType::I, BinOp::Eq) => EqI,
        (IrType::I, BinOp::Ne) => NeI,
        (IrType::F, BinOp::Add) => AddF,
        (IrType::F, BinOp::Sub) => SubF,
        (IrType::F, BinOp::Mul) => MulF,
        (IrType::F, BinOp::Div) => DivF,
        (IrType::F, BinOp::Lt) => LtF,
        (IrType::F, BinOp::Le) => LeF,
        (IrType::F, BinOp::Gt) => GtF,
        (IrType::F, BinOp::Ge) => GeF,
        (IrType::F, BinOp::Eq) => EqF,
        (IrType::F, BinOp::Ne) => NeF,
        (_, op) => panic!("operator '{}' has no direct opcode", op.symbol()),
    }
}


struct Lowerer {
    module: IrModule,
    // Index of the function currently receiving code.
    cur: usize,
}

impl Lowerer {
    fn emit(&mut self, op: Opcode) {
        self.module.functions[self.cur].code.push(op);
    }

    fn current(&self) -> &IrFunction {
        &self.module.functions[self.cur]
    }

    // Variables declared in the synthetic top-level function become
    // module globals.
    fn at_top_level(&self) -> bool {
        self.cur == 0
    }

    fn mangled(&self, name: &str) -> String {
        if name == "main" {
            String::from("_actual_main")
        } else {
            name.to_string()
        }
    }

    fn lower_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign(target, value) => self.lower_assignment(target, value),
            Stmt::Print(expr) => {
                let ty = typed(self.eval(expr));
                match ty {
                    Type::Int | Type::Bool => self.emit(Opcode::PrintI),
                    Type::Float => self.emit(Opcode::PrintF),
                    Type::Char => self.emit(Opcode::PrintB),
                }
            }
            Stmt::If(cond, then_block, else_block) => {
                self.eval(cond);
                self.emit(Opcode::If);
                for stmt in then_block {
                    self.lower_stmt(stmt);
                }
                self.emit(Opcode::Else);
                for stmt in else_block {
                    self.lower_stmt(stmt);
                }
                self.emit(Opcode::EndIf);
            }
            Stmt::While(cond, body) => {
                // 1 - cond is nonzero exactly when the condition is
                // false, which is what CBREAK breaks on.
                self.emit(Opcode::Loop);
                self.emit(Opcode::ConstI(1));
                self.eval(cond);
                self.emit(Opcode::SubI);
                self.emit(Opcode::CBreak);
                for stmt in body {
                    self.lower_stmt(stmt);
                }
                self.emit(Opcode::EndLoop);
            }
            Stmt::Break => {
                self.emit(Opcode::ConstI(1));
                self.emit(Opcode::CBreak);
            }
            Stmt::Continue => {
                self.emit(Opcode::Continue);
            }
            Stmt::Return(expr) => {
                match expr {
                    Some(expr) => {
                        self.eval(expr);
                    }
                    None => self.emit(Opcode::ConstI(0)),
                }
                self.emit(Opcode::Ret);
            }
            Stmt::Var(decl) => self.lower_vardecl(decl),
            Stmt::Func(decl) => self.lower_funcdecl(decl),
            Stmt::Call(name, args) => {
                // The discarded return value stays on the operand
                // stack; there is no POP opcode.
                self.lower_call(name, args);
            }
        }
    }

    fn lower_assignment(&mut self, target: &Expr, value: &Expr) {
        match target {
            Expr::Name(name) => {
                self.eval(value);
                if self.current().local_source(name).is_some() {
                    self.emit(Opcode::LocalSet(name.clone()));
                } else {
                    self.emit(Opcode::GlobalSet(name.clone()));
                }
            }
            Expr::Deref(addr) => {
                self.lower_address(addr, Type::Int);
                let value_type = typed(self.eval(value));
                if ir_type(value_type) == IrType::F {
                    self.emit(Opcode::Ftoi);
                }
                self.emit(Opcode::PokeI);
            }
            other => panic!("assignment target {:?} is not a location", other),
        }
    }

    fn lower_vardecl(&mut self, decl: &VarDecl) {
        let init_type = decl.init.as_ref().map(|init| self.eval(init));
        let ty = decl
            .ty
            .or_else(|| init_type.clone().flatten())
            .expect("declaration was typed by the checker");
        if self.at_top_level() {
            self.module.globals.push(IrGlobal {
                name: decl.name.clone(),
                ty: ir_type(ty),
                source: ty,
            });
            if init_type.is_some() {
                self.emit(Opcode::GlobalSet(decl.name.clone()));
            }
        } else {
            self.module.functions[self.cur].new_local(&decl.name, ty);
            if init_type.is_some() {
                self.emit(Opcode::LocalSet(decl.name.clone()));
            }
        }
    }

    fn lower_funcdecl(&mut self, decl: &FuncDecl) {
        let name = self.mangled(&decl.name);
        let mut func = IrFunction::new(&name, decl.ret, decl.imported);
        for param in &decl.params {
            func.params.push((param.name.clone(), ir_type(param.ty)));
            func.new_local(&param.name, param.ty);
        }
        self.module.functions.push(func);

        if !decl.imported {
            let saved = self.cur;
            self.cur = self.module.functions.len() - 1;
            for stmt in &decl.body {
                self.lower_stmt(stmt);
            }
            // Every function ends in RET, even if the source fell off
            // the end; void functions return 0.
            if self.current().code.last() != Some(&Opcode::Ret) {
                self.emit(Opcode::ConstI(0));
                self.emit(Opcode::Ret);
            }
            self.cur = saved;
        }
    }

    fn lower_call(&mut self, name: &str, args: &Seq<Expr>) -> Option<Type> {
        for arg in args {
            self.eval(arg);
        }
        let target = self.mangled(name);
        self.emit(Opcode::Call(target.clone()));
        self.module
            .function(&target)
            .expect("call target was resolved by the checker")
            .ret_source
    }

    // Emit the address computation for a memory access. When the
    // address is written base + index, the index is scaled by the
    // element's byte width; anything else is used as-is.
    fn lower_address(&mut self, addr: &Expr, elem: Type) {
        if let Expr::BinOp(BinOp::Add, base, index) = addr {
            self.eval(base);
            self.eval(index);
            let size = elem_size(elem);
            if size > 1 {
                self.emit(Opcode::ConstI(size));
                self.emit(Opcode::MulI);
            }
            self.emit(Opcode::AddI);
        } else {
            self.eval(addr);
        }
    }

    // Lower an expression, leaving its value on the operand stack, and
    // report its source type (None only for calls to void functions).
    fn eval(&mut self, expr: &Expr) -> Option<Type> {
        match expr {
            Expr::Int(v) => {
                self.emit(Opcode::ConstI(*v));
                Some(Type::Int)
            }
            Expr::Float(v) => {
                self.emit(Opcode::ConstF(*v));
                Some(Type::Float)
            }
            Expr::Char(c) => {
                self.emit(Opcode::ConstI(*c as i32));
                Some(Type::Char)
            }
            Expr::Bool(b) => {
                self.emit(Opcode::ConstI(if *b { 1 } else { 0 }));
                Some(Type::Bool)
            }
            Expr::BinOp(BinOp::And, left, right) => {
                // Short-circuit: the right side only runs when the
                // left was truthy.
                self.eval(left);
                self.emit(Opcode::If);
                self.eval(right);
                self.emit(Opcode::Else);
                self.emit(Opcode::ConstI(0));
                self.emit(Opcode::EndIf);
                Some(Type::Bool)
            }
            Expr::BinOp(BinOp::Or, left, right) => {
                self.eval(left);
                self.emit(Opcode::If);
                self.emit(Opcode::ConstI(1));
                self.emit(Opcode::Else);
                self.eval(right);
                self.emit(Opcode::EndIf);
                Some(Type::Bool)
            }
            Expr::BinOp(op, left, right) => {
                let left_type = typed(self.eval(left));
                self.eval(right);
                self.emit(binop_opcode(*op, left_type));
                match op {
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => Some(left_type),
                    _ => Some(Type::Bool),
                }
            }
            Expr::UnOp(UnOp::Pos, operand) => self.eval(operand),
            Expr::UnOp(UnOp::Neg, operand) => {
                let ty = typed(self.eval(operand));
                if ir_type(ty) == IrType::F {
                    self.emit(Opcode::ConstF(-1.0));
                    self.emit(Opcode::MulF);
                } else {
                    self.emit(Opcode::ConstI(-1));
                    self.emit(Opcode::MulI);
                }
                Some(ty)
            }
            Expr::UnOp(UnOp::Not, operand) => {
                self.eval(operand);
                self.emit(Opcode::ConstI(0));
                self.emit(Opcode::EqI);
                Some(Type::Bool)
            }
            Expr::UnOp(UnOp::Grow, operand) => {
                // ^n allocates n integer slots; GROW takes a byte
                // count and returns the old memory size, which is the
                // base address of the new block.
                self.eval(operand);
                self.emit(Opcode::ConstI(elem_size(Type::Int)));
                self.emit(Opcode::MulI);
                self.emit(Opcode::Grow);
                Some(Type::Int)
            }
            Expr::Cast(to, operand) => {
                let from = typed(self.eval(operand));
                match (ir_type(from), ir_type(*to)) {
                    (IrType::I, IrType::F) => self.emit(Opcode::Itof),
                    (IrType::F, IrType::I) => self.emit(Opcode::Ftoi),
                    _ => {}
                }
                Some(*to)
            }
            Expr::Call(name, args) => self.lower_call(name, args),
            Expr::Name(name) => {
                if let Some(ty) = self.current().local_source(name) {
                    self.emit(Opcode::LocalGet(name.clone()));
                    return Some(ty);
                }
                let ty = self
                    .module
                    .global(name)
                    .map(|g| g.source)
                    .expect("name was resolved by the checker");
                self.emit(Opcode::GlobalGet(name.clone()));
                Some(ty)
            }
            Expr::Deref(addr) => {
                self.lower_address(addr, Type::Int);
                self.emit(Opcode::PeekI);
                Some(Type::Int)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::Opcode::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use crate::typechecker::check_program;

    fn lower_text(text: &str) -> IrModule {
        let program = parse(tokenize(text).unwrap()).unwrap();
        check_program(&program).unwrap();
        lower(&program)
    }

    fn main_code(module: &IrModule) -> &[Opcode] {
        &module.function("main").unwrap().code
    }

    #[test]
    fn test_expression_lowering() {
        let module = lower_text("print 2 + 3 * 4 - 5;");
        assert_eq!(
            main_code(&module),
            &[
                ConstI(2),
                ConstI(3),
                ConstI(4),
                MulI,
                AddI,
                ConstI(5),
                SubI,
                PrintI,
                ConstI(0),
                Ret
            ]
        );
    }

    #[test]
    fn test_while_shape() {
        let module = lower_text("var x int = 0; while x < 3 { x = x + 1; }");
        assert_eq!(
            main_code(&module),
            &[
                ConstI(0),
                GlobalSet("x".into()),
                Loop,
                ConstI(1),
                GlobalGet("x".into()),
                ConstI(3),
                LtI,
                SubI,
                CBreak,
                GlobalGet("x".into()),
                ConstI(1),
                AddI,
                GlobalSet("x".into()),
                EndLoop,
                ConstI(0),
                Ret
            ]
        );
    }

    #[test]
    fn test_short_circuit_shapes() {
        let module = lower_text("print true && false;");
        assert_eq!(
            main_code(&module)[..6],
            [ConstI(1), If, ConstI(0), Else, ConstI(0), EndIf]
        );

        let module = lower_text("print false || true;");
        assert_eq!(
            main_code(&module)[..6],
            [ConstI(0), If, ConstI(1), Else, ConstI(1), EndIf]
        );
    }

    #[test]
    fn test_unary_lowering() {
        let module = lower_text("print -3;");
        assert_eq!(main_code(&module)[..3], [ConstI(3), ConstI(-1), MulI]);

        let module = lower_text("print !true;");
        assert_eq!(main_code(&module)[..3], [ConstI(1), ConstI(0), EqI]);

        let module = lower_text("print ^ 4;");
        assert_eq!(
            main_code(&module)[..4],
            [ConstI(4), ConstI(4), MulI, Grow]
        );
    }

    #[test]
    fn test_cast_lowering() {
        let module = lower_text("print float(2);");
        assert_eq!(main_code(&module)[..2], [ConstI(2), Itof]);

        let module = lower_text("print int(2.5);");
        assert_eq!(main_code(&module)[..2], [ConstF(2.5), Ftoi]);

        // Same machine class: no conversion emitted.
        let module = lower_text("print int('a');");
        assert_eq!(main_code(&module)[..2], [ConstI(97), PrintI]);
    }

    #[test]
    fn test_print_dispatch() {
        let module = lower_text("print 'a';");
        assert_eq!(main_code(&module)[..2], [ConstI(97), PrintB]);

        let module = lower_text("print true;");
        assert_eq!(main_code(&module)[..2], [ConstI(1), PrintI]);

        let module = lower_text("print 1.5;");
        assert_eq!(main_code(&module)[..2], [ConstF(1.5), PrintF]);
    }

    #[test]
    fn test_user_main_is_renamed() {
        let module = lower_text("func main() int { return 7; } ");
        assert!(module.function("_actual_main").is_some());
        assert_eq!(
            main_code(&module),
            &[Call("_actual_main".into()), Ret]
        );
    }

    #[test]
    fn test_top_level_without_main_pushes_zero() {
        let module = lower_text("print 1;");
        assert_eq!(&main_code(&module)[2..], &[ConstI(0), Ret]);
    }

    #[test]
    fn test_globals_and_locals() {
        let module = lower_text(
            "var g int = 1; \
             func f() int { var l int = 2; return l + g; }",
        );
        assert!(module.global("g").is_some());
        assert!(module.global("l").is_none());

        let f = module.function("f").unwrap();
        assert_eq!(f.locals, vec![("l".into(), IrType::I)]);
        assert_eq!(
            f.code,
            vec![
                ConstI(2),
                LocalSet("l".into()),
                LocalGet("l".into()),
                GlobalGet("g".into()),
                AddI,
                Ret
            ]
        );
    }

    #[test]
    fn test_params_are_locals() {
        let module = lower_text("func add(a int, b float) float { return b; }");
        let f = module.function("add").unwrap();
        assert_eq!(
            f.params,
            vec![("a".into(), IrType::I), ("b".into(), IrType::F)]
        );
        assert_eq!(
            f.locals,
            vec![("a".into(), IrType::I), ("b".into(), IrType::F)]
        );
        assert_eq!(f.ret, IrType::F);
    }

    #[test]
    fn test_indexed_deref_scales_by_element_size() {
        let module = lower_text("var p int = ^ 2; print `p + 1;");
        let code = main_code(&module);
        let tail = &code[code.len() - 9..];
        assert_eq!(
            tail,
            &[
                GlobalGet("p".into()),
                ConstI(1),
                ConstI(4),
                MulI,
                AddI,
                PeekI,
                PrintI,
                ConstI(0),
                Ret
            ]
        );
    }

    #[test]
    fn test_plain_deref_unscaled() {
        let module = lower_text("var p int = ^ 1; `p = 7;");
        let code = main_code(&module);
        assert_eq!(
            &code[code.len() - 6..],
            &[
                GlobalGet("p".into()),
                ConstI(7),
                PokeI,
                ConstI(0),
                Ret
            ]
        );
    }

    #[test]
    fn test_float_poke_converts() {
        let module = lower_text("var p int = ^ 1; `p = 2.5;");
        let code = main_code(&module);
        assert_eq!(
            &code[code.len() - 6..],
            &[
                GlobalGet("p".into()),
                ConstF(2.5),
                Ftoi,
                PokeI,
                ConstI(0),
                Ret
            ]
        );
    }

    #[test]
    fn test_imported_function() {
        let module = lower_text("import func host_rand() int; print host_rand();");
        let f = module.function("host_rand").unwrap();
        assert!(f.imported);
        assert!(f.code.is_empty());
    }

    #[test]
    fn test_void_function_gets_ret() {
        let module = lower_text("func shout() { print 1; }");
        let f = module.function("shout").unwrap();
        assert_eq!(&f.code[f.code.len() - 2..], &[ConstI(0), Ret]);
    }

    // Every function's code ends with RET, and the structured
    // control-flow markers are properly bracketed.
    #[test]
    fn test_module_invariants() {
        let module = lower_text(
            "var total int = 0; \
             var i int = 0; \
             func weigh(x int) int { \
               if x > 10 { return x * 2; } else { return x; } \
             } \
             while i < 6 { \
               if i == 4 { break; } \
               total = total + weigh(i); \
               i = i + 1; \
             } \
             print total;",
        );
        for func in &module.functions {
            assert_eq!(func.code.last(), Some(&Ret), "in {}", func.name);

            let mut ifs = 0i32;
            let mut loops = 0i32;
            for op in &func.code {
                match op {
                    If => ifs += 1,
                    Else => assert!(ifs > 0, "ELSE without IF in {}", func.name),
                    EndIf => {
                        ifs -= 1;
                        assert!(ifs >= 0, "unmatched ENDIF in {}", func.name);
                    }
                    Loop => loops += 1,
                    EndLoop => {
                        loops -= 1;
                        assert!(loops >= 0, "unmatched ENDLOOP in {}", func.name);
                    }
                    _ => {}
                }
            }
            assert_eq!(ifs, 0, "open IF in {}", func.name);
            assert_eq!(loops, 0, "open LOOP in {}", func.name);
        }
    }

    #[test]
    fn test_dump_format() {
        let module = lower_text("var x int = 3; print x;");
        let dump = module.dump();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "MODULE:::");
        assert_eq!(lines[1], "GLOBAL::: x: I");
        assert_eq!(lines[2], "FUNCTION::: main, [], [] I");
        assert_eq!(lines[3], "locals: {}");
        assert_eq!(lines[4], "CONSTI 3");
        assert_eq!(lines[5], "GLOBAL_SET x");
        assert!(dump.ends_with("RET\n"));
    }
}
