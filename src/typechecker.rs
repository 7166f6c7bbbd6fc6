// Semantic analysis for Rill.
//
// A single pass over the AST that builds the scope tree, resolves every
// name, and types every expression against the operator result tables.
// The pass stops at the first error; nothing downstream runs on a
// program that failed here.

use crate::ast::*;
use crate::env::{Owner, Scope, Symbol};
use std::collections::HashMap;
use std::fmt;


#[derive(Clone, Debug, PartialEq)]
pub enum CheckError {
    // Name errors
    Undefined(String),
    UndefinedFunction(String),
    Redefined(String),
    NotAFunction(String),
    NotAVariable(String),

    // Type errors
    ReadOnly(String),
    BinOpMismatch(BinOp, Type, Type),
    UnOpMismatch(UnOp, Type),
    AssignMismatch(String, Type, Type),
    VarInitMismatch(String, Type, Type),
    CondNotBool(Type),
    AddressNotInt(Type),
    ArgCount { name: String, expected: usize, got: usize },
    ArgType { name: String, expected: Type, got: Type },
    ReturnMismatch { expected: Option<Type>, got: Type },
    VoidValue(String),
    Uninferable(String),

    // Structural errors
    BreakOutsideLoop,
    ContinueOutsideLoop,
    ReturnOutsideFunction,
    NestedFunction(String),
    MissingReturn(String),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CheckError::*;
        match self {
            Undefined(name) => write!(f, "'{}' is not defined", name),
            UndefinedFunction(name) => write!(f, "function '{}' is not defined", name),
            Redefined(name) => write!(f, "'{}' is already defined in this scope", name),
            NotAFunction(name) => write!(f, "'{}' is not a function", name),
            NotAVariable(name) => write!(f, "'{}' is not a variable", name),
            ReadOnly(name) => write!(f, "'{}' is a constant and cannot be assigned", name),
            BinOpMismatch(op, l, r) => {
                write!(f, "operator '{}' is not defined for '{}' and '{}'", op.symbol(), l, r)
            }
            UnOpMismatch(op, t) => {
                write!(f, "unary operator '{}' is not defined for '{}'", op.symbol(), t)
            }
            AssignMismatch(name, want, got) => {
                write!(f, "cannot assign '{}' to '{}' of type '{}'", got, name, want)
            }
            VarInitMismatch(name, want, got) => {
                write!(f, "'{}' is declared '{}' but initialized with '{}'", name, want, got)
            }
            CondNotBool(t) => write!(f, "condition must be 'bool', got '{}'", t),
            AddressNotInt(t) => write!(f, "memory address must be 'int', got '{}'", t),
            ArgCount { name, expected, got } => {
                write!(f, "'{}' expects {} argument(s), got {}", name, expected, got)
            }
            ArgType { name, expected, got } => {
                write!(f, "argument of '{}' expects '{}', got '{}'", name, expected, got)
            }
            ReturnMismatch { expected: Some(want), got } => {
                write!(f, "return type mismatch: expected '{}', got '{}'", want, got)
            }
            ReturnMismatch { expected: None, got } => {
                write!(f, "function has no return type but returns '{}'", got)
            }
            VoidValue(name) => {
                write!(f, "call to '{}' has no value", name)
            }
            Uninferable(name) => {
                write!(f, "'{}' needs a type or an initializer", name)
            }
            BreakOutsideLoop => write!(f, "'break' outside of a while loop"),
            ContinueOutsideLoop => write!(f, "'continue' outside of a while loop"),
            ReturnOutsideFunction => write!(f, "'return' outside of a function"),
            NestedFunction(name) => {
                write!(f, "function '{}' cannot be declared inside another block", name)
            }
            MissingReturn(name) => {
                write!(f, "function '{}' does not return on every path", name)
            }
        }
    }
}

type Check<T> = Result<T, CheckError>;


// ----------------------------------------------------------------------
// Operator result typing
// ----------------------------------------------------------------------

lazy_static! {
    static ref BINOP_TABLE: HashMap<(BinOp, Type, Type), Type> = {
        use BinOp::*;
        use Type::*;
        let mut table = HashMap::new();
        for &ty in &[Int, Float] {
            for &op in &[Add, Sub, Mul, Div] {
                table.insert((op, ty, ty), ty);
            }
        }
        for &ty in &[Int, Float, Char] {
            for &op in &[Lt, Le, Gt, Ge, Eq, Ne] {
                table.insert((op, ty, ty), Bool);
            }
        }
        for &op in &[Eq, Ne, And, Or] {
            table.insert((op, Bool, Bool), Bool);
        }
        for &ty in &[Int, Float, Char, Bool] {
            table.insert((Assign, ty, ty), ty);
        }
        table
    };

    static ref UNOP_TABLE: HashMap<(UnOp, Type), Type> = {
        use Type::*;
        use UnOp::*;
        let mut table = HashMap::new();
        table.insert((Pos, Int), Int);
        table.insert((Pos, Float), Float);
        table.insert((Neg, Int), Int);
        table.insert((Neg, Float), Float);
        table.insert((Not, Bool), Bool);
        // ^n grows memory by n integer slots and yields the old size,
        // which is the base address of the fresh block.
        table.insert((Grow, Int), Int);
        table
    };
}

pub fn check_binop(op: BinOp, left: Type, right: Type) -> Option<Type> {
    BINOP_TABLE.get(&(op, left, right)).copied()
}

pub fn check_unaryop(op: UnOp, operand: Type) -> Option<Type> {
    UNOP_TABLE.get(&(op, operand)).copied()
}


// ----------------------------------------------------------------------
// The checking pass
// ----------------------------------------------------------------------

// Check a whole program against a fresh root scope. On success the
// populated root is returned; the lowerer re-derives what it needs, so
// most callers drop it.
pub fn check_program(program: &Program) -> Check<Node<Scope>> {
    let root = Scope::root();
    for stmt in &program.stmts {
        check_statement(stmt, &root)?;
    }
    Ok(root)
}

fn check_statement(stmt: &Stmt, env: &Node<Scope>) -> Check<()> {
    match stmt {
        Stmt::Assign(target, value) => check_assignment(target, value, env),
        Stmt::Print(expr) => {
            // Every base type prints; only a void call has no value.
            eval_expr(expr, env).map(|_| ())
        }
        Stmt::If(cond, then_block, else_block) => {
            let cond_type = eval_expr(cond, env)?;
            if cond_type != Type::Bool {
                return Err(CheckError::CondNotBool(cond_type));
            }
            let then_env = Scope::chain(env, "if_then", Owner::Block);
            for stmt in then_block {
                check_statement(stmt, &then_env)?;
            }
            let else_env = Scope::chain(env, "if_else", Owner::Block);
            for stmt in else_block {
                check_statement(stmt, &else_env)?;
            }
            Ok(())
        }
        Stmt::While(cond, body) => {
            let cond_type = eval_expr(cond, env)?;
            if cond_type != Type::Bool {
                return Err(CheckError::CondNotBool(cond_type));
            }
            let body_env = Scope::chain(env, "while_body", Owner::Block);
            for stmt in body {
                check_statement(stmt, &body_env)?;
            }
            Ok(())
        }
        Stmt::Break => {
            if env.inside_loop() {
                Ok(())
            } else {
                Err(CheckError::BreakOutsideLoop)
            }
        }
        Stmt::Continue => {
            if env.inside_loop() {
                Ok(())
            } else {
                Err(CheckError::ContinueOutsideLoop)
            }
        }
        Stmt::Return(expr) => {
            let func = match env.enclosing_function() {
                Some(func) => func,
                None => return Err(CheckError::ReturnOutsideFunction),
            };
            if let Some(expr) = expr {
                let got = eval_expr(expr, env)?;
                if func.ret != Some(got) {
                    return Err(CheckError::ReturnMismatch { expected: func.ret, got });
                }
            }
            Ok(())
        }
        Stmt::Var(decl) => check_vardecl(decl, env),
        Stmt::Func(decl) => check_funcdecl(decl, env),
        Stmt::Call(name, args) => {
            // A call statement is a call expression whose value is
            // discarded, so a void target is fine here.
            check_call(name, args, env).map(|_| ())
        }
    }
}

fn check_assignment(target: &Expr, value: &Expr, env: &Node<Scope>) -> Check<()> {
    if let Expr::Deref(addr) = target {
        let addr_type = eval_expr(addr, env)?;
        if addr_type != Type::Int {
            return Err(CheckError::AddressNotInt(addr_type));
        }
        // Memory holds integers at the source level; float values are
        // converted during lowering.
        eval_expr(value, env)?;
        return Ok(());
    }
    let name = match target {
        Expr::Name(name) => name,
        // The parser only builds Name or Deref targets.
        _ => return Err(CheckError::NotAVariable(String::from("<location>"))),
    };
    let symbol = env.get(name).ok_or_else(|| CheckError::Undefined(name.clone()))?;
    if let Symbol::Var { read_only: true, .. } = symbol.as_ref() {
        return Err(CheckError::ReadOnly(name.clone()));
    }
    let declared = symbol
        .value_type()
        .ok_or_else(|| CheckError::NotAVariable(name.clone()))?;
    let value_type = eval_expr(value, env)?;
    match check_binop(BinOp::Assign, declared, value_type) {
        Some(_) => Ok(()),
        None => Err(CheckError::AssignMismatch(name.clone(), declared, value_type)),
    }
}

fn check_vardecl(decl: &VarDecl, env: &Node<Scope>) -> Check<()> {
    if env.get_local(&decl.name).is_some() {
        return Err(CheckError::Redefined(decl.name.clone()));
    }
    let ty = match (&decl.init, decl.ty) {
        (Some(init), declared) => {
            let init_type = eval_expr(init, env)?;
            if let Some(declared) = declared {
                if declared != init_type {
                    return Err(CheckError::VarInitMismatch(
                        decl.name.clone(),
                        declared,
                        init_type,
                    ));
                }
            }
            init_type
        }
        (None, Some(declared)) => declared,
        (None, None) => return Err(CheckError::Uninferable(decl.name.clone())),
    };
    env.define(&decl.name, Symbol::Var { ty, read_only: decl.is_const });
    Ok(())
}

fn check_funcdecl(decl: &Node<FuncDecl>, env: &Node<Scope>) -> Check<()> {
    if env.get_local(&decl.name).is_some() {
        return Err(CheckError::Redefined(decl.name.clone()));
    }
    if env.owner().is_some() {
        return Err(CheckError::NestedFunction(decl.name.clone()));
    }
    env.define(&decl.name, Symbol::Func(decl.clone()));

    let func_env = Scope::chain(env, &decl.name, Owner::Func(decl.clone()));
    for param in &decl.params {
        if func_env.get_local(&param.name).is_some() {
            return Err(CheckError::Redefined(param.name.clone()));
        }
        func_env.define(&param.name, Symbol::Param { ty: param.ty });
    }
    for stmt in &decl.body {
        check_statement(stmt, &func_env)?;
    }
    if decl.ret.is_some() && !decl.imported && !returns_on_all_paths(&decl.body) {
        return Err(CheckError::MissingReturn(decl.name.clone()));
    }
    Ok(())
}

// Conservative static analysis: a block returns if it contains a
// Return, or an If whose arms both return. A While contributes nothing
// since its body may never run.
fn returns_on_all_paths(stmts: &Seq<Stmt>) -> bool {
    for stmt in stmts {
        match stmt.as_ref() {
            Stmt::Return(_) => return true,
            Stmt::If(_, then_block, else_block) => {
                if returns_on_all_paths(then_block) && returns_on_all_paths(else_block) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

fn check_call(name: &str, args: &Seq<Expr>, env: &Node<Scope>) -> Check<Option<Type>> {
    let symbol = env
        .get(name)
        .ok_or_else(|| CheckError::UndefinedFunction(name.to_string()))?;
    let func = match symbol.as_ref() {
        Symbol::Func(func) => func.clone(),
        _ => return Err(CheckError::NotAFunction(name.to_string())),
    };
    if args.len() != func.params.len() {
        return Err(CheckError::ArgCount {
            name: name.to_string(),
            expected: func.params.len(),
            got: args.len(),
        });
    }
    for (arg, param) in args.iter().zip(&func.params) {
        let arg_type = eval_expr(arg, env)?;
        if arg_type != param.ty {
            return Err(CheckError::ArgType {
                name: name.to_string(),
                expected: param.ty,
                got: arg_type,
            });
        }
    }
    Ok(func.ret)
}

// Type an expression. Expressions always have one of the base types;
// a call to a function without a return type is an error in value
// position.
fn eval_expr(expr: &Expr, env: &Node<Scope>) -> Check<Type> {
    match expr {
        Expr::Int(_) => Ok(Type::Int),
        Expr::Float(_) => Ok(Type::Float),
        Expr::Char(_) => Ok(Type::Char),
        Expr::Bool(_) => Ok(Type::Bool),
        Expr::BinOp(op, left, right) => {
            let left_type = eval_expr(left, env)?;
            let right_type = eval_expr(right, env)?;
            check_binop(*op, left_type, right_type)
                .ok_or(CheckError::BinOpMismatch(*op, left_type, right_type))
        }
        Expr::UnOp(op, operand) => {
            let operand_type = eval_expr(operand, env)?;
            check_unaryop(*op, operand_type)
                .ok_or(CheckError::UnOpMismatch(*op, operand_type))
        }
        Expr::Cast(to, operand) => {
            // Both sides of a cast are base types by construction.
            eval_expr(operand, env)?;
            Ok(*to)
        }
        Expr::Call(name, args) => match check_call(name, args, env)? {
            Some(ty) => Ok(ty),
            None => Err(CheckError::VoidValue(name.clone())),
        },
        Expr::Name(name) => {
            let symbol = env.get(name).ok_or_else(|| CheckError::Undefined(name.clone()))?;
            symbol
                .value_type()
                .ok_or_else(|| CheckError::NotAVariable(name.clone()))
        }
        Expr::Deref(addr) => {
            let addr_type = eval_expr(addr, env)?;
            if addr_type != Type::Int {
                return Err(CheckError::AddressNotInt(addr_type));
            }
            // Dereferences read integer memory at the source level.
            Ok(Type::Int)
        }
    }
}
