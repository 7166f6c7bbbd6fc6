// Recursive-descent parser for Rill.
//
// The grammar is PEG-ish: each statement form is selected by its first
// token, and expression parsing is a fixed precedence ladder
// (|| over && over relational over additive over multiplicative over
// unary prefix over primary). The parser is total on well-formed token
// sequences and halts on the first mismatch.
//
// program    = {statement} EOF
// statement  = assignment | call ";" | vardecl | funcdecl
//            | if | while | "break" ";" | "continue" ";"
//            | "return" expr ";" | "print" expr ";"
// assignment = location "=" expr ";"
// vardecl    = ("var"|"const") ID [TYPE] ["=" expr] ";"
// funcdecl   = ["import"] "func" ID "(" [params] ")" [TYPE] (block | ";")
// location   = ID | "`" expr

use crate::ast::*;
use crate::lexer::{decode_char, Token, TokenKind};
use std::fmt;


#[derive(Clone, Debug, PartialEq)]
pub enum ParseError {
    Unexpected {
        expected: &'static str,
        found: String,
        line: usize,
    },
    BadLiteral {
        lexeme: String,
        line: usize,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::Unexpected { expected, found, line } => {
                write!(f, "line {}: expected {}, found {:?}", line, expected, found)
            }
            ParseError::BadLiteral { lexeme, line } => {
                write!(f, "line {}: malformed literal {:?}", line, lexeme)
            }
        }
    }
}

type Parse<T> = Result<T, ParseError>;


pub fn parse(tokens: Vec<Token>) -> Parse<Program> {
    Parser { tokens, pos: 0 }.program()
}


struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        // tokenize always appends Eof, so the last token is a backstop.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn matches(&mut self, kind: TokenKind) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            None
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Parse<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &'static str) -> ParseError {
        let token = self.peek();
        let found = if token.kind == TokenKind::Eof {
            "end of input".to_string()
        } else {
            token.lexeme.clone()
        };
        ParseError::Unexpected { expected, found, line: token.line }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn program(&mut self) -> Parse<Program> {
        let mut stmts = Seq::new();
        while !self.check(TokenKind::Eof) {
            stmts.push(Node::new(self.statement()?));
        }
        Ok(Program { stmts })
    }

    fn statement(&mut self) -> Parse<Stmt> {
        match self.peek().kind {
            TokenKind::Ident | TokenKind::Backtick => self.assignment_or_call(),
            TokenKind::Var | TokenKind::Const => self.vardecl(),
            TokenKind::Import | TokenKind::Func => self.funcdecl(),
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::Break => {
                self.advance();
                self.expect(TokenKind::Semi, "';' after 'break'")?;
                Ok(Stmt::Break)
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(TokenKind::Semi, "';' after 'continue'")?;
                Ok(Stmt::Continue)
            }
            TokenKind::Return => {
                self.advance();
                let expr = self.expression()?;
                self.expect(TokenKind::Semi, "';' after return value")?;
                Ok(Stmt::Return(Some(Node::new(expr))))
            }
            TokenKind::Print => {
                self.advance();
                let expr = self.expression()?;
                self.expect(TokenKind::Semi, "';' after print value")?;
                Ok(Stmt::Print(Node::new(expr)))
            }
            _ => Err(self.unexpected("a statement")),
        }
    }

    // A statement starting with an identifier or backtick parses a
    // location first; a following '(' turns a named location into a
    // call statement, anything else must be an assignment.
    fn assignment_or_call(&mut self) -> Parse<Stmt> {
        let loc = self.location()?;
        if self.check(TokenKind::LParen) {
            let name = match loc {
                Expr::Name(name) => name,
                _ => return Err(self.unexpected("'=' after memory location")),
            };
            self.advance();
            let args = self.arguments()?;
            self.expect(TokenKind::Semi, "';' after call")?;
            return Ok(Stmt::Call(name, args));
        }
        self.expect(TokenKind::Assign, "'=' in assignment")?;
        let expr = self.expression()?;
        self.expect(TokenKind::Semi, "';' after assignment")?;
        Ok(Stmt::Assign(Node::new(loc), Node::new(expr)))
    }

    fn vardecl(&mut self) -> Parse<Stmt> {
        let is_const = self.matches(TokenKind::Const).is_some();
        if !is_const {
            self.expect(TokenKind::Var, "'var' or 'const'")?;
        }
        let name = self.expect(TokenKind::Ident, "a variable name")?.lexeme;
        let ty = match self.matches(TokenKind::Type) {
            Some(token) => Type::from_keyword(&token.lexeme),
            None => None,
        };
        let init = match self.matches(TokenKind::Assign) {
            Some(_) => Some(Node::new(self.expression()?)),
            None => None,
        };
        self.expect(TokenKind::Semi, "';' after variable declaration")?;
        Ok(Stmt::Var(VarDecl { name, ty, init, is_const }))
    }

    fn funcdecl(&mut self) -> Parse<Stmt> {
        let imported = self.matches(TokenKind::Import).is_some();
        self.expect(TokenKind::Func, "'func'")?;
        let name = self.expect(TokenKind::Ident, "a function name")?.lexeme;
        self.expect(TokenKind::LParen, "'(' after function name")?;
        let params = self.parameters()?;
        self.expect(TokenKind::RParen, "')' after parameters")?;
        let ret = match self.matches(TokenKind::Type) {
            Some(token) => Type::from_keyword(&token.lexeme),
            None => None,
        };
        let body = if imported {
            self.expect(TokenKind::Semi, "';' after imported function")?;
            Seq::new()
        } else {
            self.block()?
        };
        Ok(Stmt::Func(Node::new(FuncDecl { name, params, ret, body, imported })))
    }

    fn if_stmt(&mut self) -> Parse<Stmt> {
        self.advance();
        let cond = self.expression()?;
        let then_block = self.block()?;
        let else_block = if self.matches(TokenKind::Else).is_some() {
            self.block()?
        } else {
            Seq::new()
        };
        Ok(Stmt::If(Node::new(cond), then_block, else_block))
    }

    fn while_stmt(&mut self) -> Parse<Stmt> {
        self.advance();
        let cond = self.expression()?;
        let body = self.block()?;
        Ok(Stmt::While(Node::new(cond), body))
    }

    fn block(&mut self) -> Parse<Seq<Stmt>> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut stmts = Seq::new();
        while !self.check(TokenKind::RBrace) {
            if self.check(TokenKind::Eof) {
                return Err(self.unexpected("'}'"));
            }
            stmts.push(Node::new(self.statement()?));
        }
        self.advance();
        Ok(stmts)
    }

    fn parameters(&mut self) -> Parse<Vec<Param>> {
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let name = self.expect(TokenKind::Ident, "a parameter name")?.lexeme;
                let token = self.expect(TokenKind::Type, "a parameter type")?;
                let ty = match Type::from_keyword(&token.lexeme) {
                    Some(ty) => ty,
                    None => return Err(self.unexpected("a parameter type")),
                };
                params.push(Param { name, ty });
                if self.matches(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        Ok(params)
    }

    // Arguments up to, and consuming, the closing ')'.
    fn arguments(&mut self) -> Parse<Seq<Expr>> {
        let mut args = Seq::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(Node::new(self.expression()?));
                if self.matches(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')' after arguments")?;
        Ok(args)
    }

    fn location(&mut self) -> Parse<Expr> {
        if let Some(token) = self.matches(TokenKind::Ident) {
            Ok(Expr::Name(token.lexeme))
        } else if self.matches(TokenKind::Backtick).is_some() {
            Ok(Expr::Deref(Node::new(self.expression()?)))
        } else {
            Err(self.unexpected("a variable or '`' address"))
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) -> Parse<Expr> {
        self.or_expr()
    }

    fn binary(
        &mut self,
        ops: &[(TokenKind, BinOp)],
        next: fn(&mut Parser) -> Parse<Expr>,
    ) -> Parse<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for &(kind, op) in ops {
                if self.matches(kind).is_some() {
                    let right = next(self)?;
                    left = Expr::BinOp(op, Node::new(left), Node::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn or_expr(&mut self) -> Parse<Expr> {
        self.binary(&[(TokenKind::OrOr, BinOp::Or)], Parser::and_expr)
    }

    fn and_expr(&mut self) -> Parse<Expr> {
        self.binary(&[(TokenKind::AndAnd, BinOp::And)], Parser::rel_expr)
    }

    fn rel_expr(&mut self) -> Parse<Expr> {
        self.binary(
            &[
                (TokenKind::Lt, BinOp::Lt),
                (TokenKind::Le, BinOp::Le),
                (TokenKind::Gt, BinOp::Gt),
                (TokenKind::Ge, BinOp::Ge),
                (TokenKind::EqEq, BinOp::Eq),
                (TokenKind::Ne, BinOp::Ne),
            ],
            Parser::add_expr,
        )
    }

    fn add_expr(&mut self) -> Parse<Expr> {
        self.binary(
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
            Parser::mul_expr,
        )
    }

    fn mul_expr(&mut self) -> Parse<Expr> {
        self.binary(
            &[(TokenKind::Star, BinOp::Mul), (TokenKind::Slash, BinOp::Div)],
            Parser::factor,
        )
    }

    fn factor(&mut self) -> Parse<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Integer => {
                self.advance();
                match token.lexeme.parse::<i32>() {
                    Ok(v) => Ok(Expr::Int(v)),
                    Err(_) => Err(ParseError::BadLiteral {
                        lexeme: token.lexeme,
                        line: token.line,
                    }),
                }
            }
            TokenKind::Float => {
                self.advance();
                match token.lexeme.parse::<f32>() {
                    Ok(v) => Ok(Expr::Float(v)),
                    Err(_) => Err(ParseError::BadLiteral {
                        lexeme: token.lexeme,
                        line: token.line,
                    }),
                }
            }
            TokenKind::Char => {
                self.advance();
                match decode_char(&token.lexeme) {
                    Some(c) => Ok(Expr::Char(c)),
                    None => Err(ParseError::BadLiteral {
                        lexeme: token.lexeme,
                        line: token.line,
                    }),
                }
            }
            TokenKind::Bool => {
                self.advance();
                Ok(Expr::Bool(token.lexeme == "true"))
            }
            TokenKind::Plus | TokenKind::Minus | TokenKind::Caret | TokenKind::Bang => {
                self.advance();
                let op = match token.kind {
                    TokenKind::Plus => UnOp::Pos,
                    TokenKind::Minus => UnOp::Neg,
                    TokenKind::Caret => UnOp::Grow,
                    _ => UnOp::Not,
                };
                Ok(Expr::UnOp(op, Node::new(self.factor()?)))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(TokenKind::RParen, "')' after expression")?;
                Ok(expr)
            }
            TokenKind::Type => {
                self.advance();
                let ty = match Type::from_keyword(&token.lexeme) {
                    Some(ty) => ty,
                    None => return Err(self.unexpected("a type name")),
                };
                self.expect(TokenKind::LParen, "'(' after type name")?;
                let expr = self.expression()?;
                self.expect(TokenKind::RParen, "')' after cast")?;
                Ok(Expr::Cast(ty, Node::new(expr)))
            }
            TokenKind::Ident => {
                self.advance();
                if self.matches(TokenKind::LParen).is_some() {
                    let args = self.arguments()?;
                    Ok(Expr::Call(token.lexeme, args))
                } else {
                    Ok(Expr::Name(token.lexeme))
                }
            }
            TokenKind::Backtick => self.location(),
            _ => Err(self.unexpected("an expression")),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_text(text: &str) -> Program {
        parse(tokenize(text).unwrap()).unwrap()
    }

    fn parse_expr(text: &str) -> Expr {
        let program = parse_text(&format!("print {};", text));
        match program.stmts[0].as_ref() {
            Stmt::Print(e) => e.as_ref().clone(),
            other => panic!("expected print statement, got {:?}", other),
        }
    }

    fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
        Expr::BinOp(op, Node::new(l), Node::new(r))
    }

    #[test]
    fn test_terms() {
        assert_eq!(parse_expr("42"), Expr::Int(42));
        assert_eq!(parse_expr("42.0"), Expr::Float(42.0));
        assert_eq!(parse_expr("(42)"), Expr::Int(42));
        assert_eq!(parse_expr("foo"), Expr::Name(String::from("foo")));
        assert_eq!(parse_expr("'a'"), Expr::Char('a'));
        assert_eq!(parse_expr("true"), Expr::Bool(true));
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            parse_expr("2 + 3 * 4"),
            bin(
                BinOp::Add,
                Expr::Int(2),
                bin(BinOp::Mul, Expr::Int(3), Expr::Int(4))
            )
        );
        assert_eq!(
            parse_expr("3 + 4 < 3 * 4"),
            bin(
                BinOp::Lt,
                bin(BinOp::Add, Expr::Int(3), Expr::Int(4)),
                bin(BinOp::Mul, Expr::Int(3), Expr::Int(4))
            )
        );
        assert_eq!(
            parse_expr("a < b && c < d || e < f"),
            bin(
                BinOp::Or,
                bin(
                    BinOp::And,
                    bin(BinOp::Lt, Expr::Name("a".into()), Expr::Name("b".into())),
                    bin(BinOp::Lt, Expr::Name("c".into()), Expr::Name("d".into()))
                ),
                bin(BinOp::Lt, Expr::Name("e".into()), Expr::Name("f".into()))
            )
        );
    }

    #[test]
    fn test_unary() {
        assert_eq!(
            parse_expr("-x"),
            Expr::UnOp(UnOp::Neg, Node::new(Expr::Name("x".into())))
        );
        assert_eq!(
            parse_expr("!done"),
            Expr::UnOp(UnOp::Not, Node::new(Expr::Name("done".into())))
        );
        assert_eq!(
            parse_expr("^ 4"),
            Expr::UnOp(UnOp::Grow, Node::new(Expr::Int(4)))
        );
        // The prefix operator takes a factor, not a full product.
        assert_eq!(
            parse_expr("-x * y"),
            bin(
                BinOp::Mul,
                Expr::UnOp(UnOp::Neg, Node::new(Expr::Name("x".into()))),
                Expr::Name("y".into())
            )
        );
    }

    #[test]
    fn test_cast_and_call() {
        assert_eq!(
            parse_expr("float(2)"),
            Expr::Cast(Type::Float, Node::new(Expr::Int(2)))
        );
        assert_eq!(
            parse_expr("add(2, 40)"),
            Expr::Call(
                "add".into(),
                vec![Node::new(Expr::Int(2)), Node::new(Expr::Int(40))]
            )
        );
    }

    #[test]
    fn test_deref_spans_expression() {
        // The backtick takes the whole following expression as the
        // address.
        assert_eq!(
            parse_expr("`base + 8"),
            Expr::Deref(Node::new(bin(
                BinOp::Add,
                Expr::Name("base".into()),
                Expr::Int(8)
            )))
        );
    }

    #[test]
    fn test_vardecl_forms() {
        let program = parse_text("var x int = 0; const pi = 3.14; var y float;");
        assert_eq!(program.stmts.len(), 3);
        match program.stmts[0].as_ref() {
            Stmt::Var(v) => {
                assert_eq!(v.name, "x");
                assert_eq!(v.ty, Some(Type::Int));
                assert!(v.init.is_some());
                assert!(!v.is_const);
            }
            other => panic!("unexpected {:?}", other),
        }
        match program.stmts[1].as_ref() {
            Stmt::Var(v) => {
                assert!(v.is_const);
                assert_eq!(v.ty, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_funcdecl() {
        let program = parse_text("func add(a int, b int) int { return a + b; }");
        match program.stmts[0].as_ref() {
            Stmt::Func(f) => {
                assert_eq!(f.name, "add");
                assert_eq!(f.params.len(), 2);
                assert_eq!(f.ret, Some(Type::Int));
                assert_eq!(f.body.len(), 1);
                assert!(!f.imported);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_imported_funcdecl() {
        let program = parse_text("import func putc(c char);");
        match program.stmts[0].as_ref() {
            Stmt::Func(f) => {
                assert!(f.imported);
                assert!(f.body.is_empty());
                assert_eq!(f.ret, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call_statement_and_assignment() {
        let program = parse_text("tick(); x = x + 1; `p = 7;");
        assert!(matches!(program.stmts[0].as_ref(), Stmt::Call(name, args)
            if name == "tick" && args.is_empty()));
        assert!(matches!(program.stmts[1].as_ref(), Stmt::Assign(..)));
        match program.stmts[2].as_ref() {
            Stmt::Assign(target, _) => {
                assert!(matches!(target.as_ref(), Expr::Deref(_)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_if_else() {
        let program = parse_text("if x < 3 { print x; } else { print 0; }");
        match program.stmts[0].as_ref() {
            Stmt::If(_, then_block, else_block) => {
                assert_eq!(then_block.len(), 1);
                assert_eq!(else_block.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_determinism() {
        let text = "var i int = 0; while i < 5 { if i == 3 { break; } i = i + 1; }";
        assert_eq!(parse_text(text), parse_text(text));
    }

    #[test]
    fn test_errors_carry_line() {
        let tokens = tokenize("var x int =\n;").unwrap();
        match parse(tokens) {
            Err(ParseError::Unexpected { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call_on_memory_location_rejected() {
        let tokens = tokenize("`p();").unwrap();
        assert!(parse(tokens).is_err());
    }
}
