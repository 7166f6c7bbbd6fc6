use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;


// Abstract over various memory management strategies.
pub type Node<T> = Rc<T>;
pub type Seq<T> = Vec<Node<T>>;
pub type Map<T> = HashMap<String, Node<T>>;


// Binary operators. Assign is never produced by the parser; it exists
// so that assignability can live in the same result-typing table as the
// ordinary operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Assign,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Assign => "=",
        }
    }
}


#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnOp {
    Pos,
    Neg,
    Not,
    Grow,
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Pos => "+",
            UnOp::Neg => "-",
            UnOp::Not => "!",
            UnOp::Grow => "^",
        }
    }
}


// The base types of the language. Everything the checker reasons about
// is one of these; `void` shows up only as the absence of a declared
// return type, and is modeled as Option<Type> at the use sites.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Float,
    Char,
    Bool,
}

impl Type {
    pub fn from_keyword(word: &str) -> Option<Type> {
        match word {
            "int" => Some(Type::Int),
            "float" => Some(Type::Float),
            "char" => Some(Type::Char),
            "bool" => Some(Type::Bool),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::Int => "int",
            Type::Float => "float",
            Type::Char => "char",
            Type::Bool => "bool",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}


// ADT for expressions.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Int(i32),
    Float(f32),
    Char(char),
    Bool(bool),
    BinOp(BinOp, Node<Expr>, Node<Expr>),
    UnOp(UnOp, Node<Expr>),
    Cast(Type, Node<Expr>),
    Call(String, Seq<Expr>),
    Name(String),
    Deref(Node<Expr>),
}


#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}


#[derive(Clone, Debug, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub ty: Option<Type>,
    pub init: Option<Node<Expr>>,
    pub is_const: bool,
}


#[derive(Clone, Debug, PartialEq)]
pub struct FuncDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Option<Type>,
    pub body: Seq<Stmt>,
    pub imported: bool,
}


// ADT for statements. An assignment target is always Expr::Name or
// Expr::Deref; the parser guarantees this.
#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Assign(Node<Expr>, Node<Expr>),
    Print(Node<Expr>),
    If(Node<Expr>, Seq<Stmt>, Seq<Stmt>),
    While(Node<Expr>, Seq<Stmt>),
    Break,
    Continue,
    Return(Option<Node<Expr>>),
    Var(VarDecl),
    Func(Node<FuncDecl>),
    Call(String, Seq<Expr>),
}


// ADT for programs: an ordered list of top-level statements.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub stmts: Seq<Stmt>,
}
