use crate::ast::{FuncDecl, Map, Node, Type};
use std::cell::RefCell;


// What a name in scope resolves to.
#[derive(Clone, Debug, PartialEq)]
pub enum Symbol {
    Var { ty: Type, read_only: bool },
    Param { ty: Type },
    Func(Node<FuncDecl>),
}

impl Symbol {
    // The declared type of a variable-like symbol; None for functions.
    pub fn value_type(&self) -> Option<Type> {
        match self {
            Symbol::Var { ty, .. } => Some(*ty),
            Symbol::Param { ty } => Some(*ty),
            Symbol::Func(_) => None,
        }
    }
}


// The construct that introduced a scope. The root scope has no owner;
// block scopes (if arms, while bodies) are owned by their statement,
// which is all the checker needs to forbid nested functions.
#[derive(Clone, Debug)]
pub enum Owner {
    Func(Node<FuncDecl>),
    Block,
}


// Datastructure to manage lexical scoping. Scopes form a tree; lookup
// walks parent links toward the root.
#[derive(Debug)]
pub struct Scope {
    name: String,
    owner: Option<Owner>,
    entries: RefCell<Map<Symbol>>,
    parent: Option<Node<Scope>>,
}

impl Scope {
    fn new(name: &str, owner: Option<Owner>, parent: Option<Node<Scope>>) -> Node<Scope> {
        Node::new(Scope {
            name: name.to_string(),
            owner,
            entries: RefCell::new(Map::new()),
            parent,
        })
    }

    pub fn root() -> Node<Scope> {
        Self::new("", None, None)
    }

    pub fn chain(parent: &Node<Scope>, name: &str, owner: Owner) -> Node<Scope> {
        Self::new(name, Some(owner), Some(parent.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<Owner> {
        self.owner.clone()
    }

    // Look up an identifier from anywhere in our scope chain.
    pub fn get(&self, key: &str) -> Option<Node<Symbol>> {
        if let Some(value) = self.entries.borrow().get(key) {
            Some(value.clone())
        } else if let Some(parent) = &self.parent {
            parent.get(key)
        } else {
            None
        }
    }

    // Look up an identifier in this scope only; redefinition checks use
    // this so that shadowing an outer binding stays legal.
    pub fn get_local(&self, key: &str) -> Option<Node<Symbol>> {
        self.entries.borrow().get(key).cloned()
    }

    // Insert a symbol in the current scope.
    pub fn define(&self, key: &str, value: Symbol) {
        self.entries.borrow_mut().insert(key.to_string(), Node::new(value));
    }

    // The function whose body (transitively) contains this scope.
    pub fn enclosing_function(&self) -> Option<Node<FuncDecl>> {
        if let Some(Owner::Func(f)) = &self.owner {
            return Some(f.clone());
        }
        self.parent.as_ref().and_then(|p| p.enclosing_function())
    }

    // Whether this scope sits inside a while body, which is what makes
    // break and continue legal.
    pub fn inside_loop(&self) -> bool {
        if self.name.starts_with("while_body") {
            return true;
        }
        self.parent.as_ref().map_or(false, |p| p.inside_loop())
    }
}
