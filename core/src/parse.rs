//! The recursive-descent parser: token list in, syntax tree out. Each
//! `parse_*` method consumes exactly the tokens of its construct and returns
//! the arena id of the node it built.

use crate::{
    ast::{
        AssignOp, Ast, AstBuilder, BinaryOp, Literal, NodeId, NodeKind,
        Primitive, Qualifiers, UnaryOp,
    },
    consts::{
        MAX_ARGUMENTS, MAX_ENUM_VALUES, MAX_FIELDS, MAX_PARAMETERS,
        MAX_SEQ_EXPRESSIONS,
    },
    error::{ParseError, SourceErrorWrapper, WithSource},
    token::{Token, TokenKind, TokenValue},
    util::Span,
    Compiler,
};
use std::iter;

type ParseResult<T> = Result<T, (ParseError, Span)>;

/// A `(byte offset, line)` pair marking where a construct started.
type Mark = (usize, usize);

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    builder: AstBuilder,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            builder: AstBuilder::default(),
        }
    }

    // ===== Token cursor =====

    fn peek(&self) -> &Token {
        // the token list always ends with EOF, which is never consumed
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn kind_at(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn at_punct(&self, byte: u8) -> bool {
        self.at(TokenKind::Punct(byte))
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_punct(&mut self, byte: u8) -> bool {
        self.eat(TokenKind::Punct(byte))
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.expected(&kind.to_string()))
        }
    }

    fn expect_punct(&mut self, byte: u8) -> ParseResult<Token> {
        self.expect(TokenKind::Punct(byte))
    }

    fn expected(&self, what: &str) -> (ParseError, Span) {
        let token = self.peek();
        (
            ParseError::ExpectedToken {
                expected: what.to_string(),
                found: token.to_string(),
            },
            token.span(),
        )
    }

    fn unexpected(&self) -> (ParseError, Span) {
        let token = self.peek();
        (
            ParseError::UnexpectedToken(token.to_string()),
            token.span(),
        )
    }

    // ===== Node construction =====

    fn mark(&self) -> Mark {
        let token = self.peek();
        (token.character_start, token.line)
    }

    /// End position of the most recently consumed token.
    fn prev_end(&self) -> usize {
        if self.pos == 0 {
            0
        } else {
            self.tokens[self.pos - 1].end
        }
    }

    /// Creates a node spanning from `mark` to the last consumed token, and
    /// records it as the parent of all `children`.
    fn node(
        &mut self,
        kind: NodeKind,
        mark: Mark,
        children: &[NodeId],
    ) -> NodeId {
        let span = Span {
            start: mark.0,
            end: self.prev_end(),
            line: mark.1,
        };
        let id = self.builder.push(kind, span);
        for &child in children {
            self.builder.adopt(id, child);
        }
        id
    }

    fn rvalue(&mut self, id: NodeId) -> NodeId {
        self.builder.mark_rvalue(id);
        id
    }

    /// Creates an identifier node from an already-consumed identifier token.
    fn identifier_node(&mut self, token: &Token) -> NodeId {
        let name = token.value.text().unwrap_or_default().to_string();
        self.builder.push(
            NodeKind::Identifier { name },
            token.span(),
        )
    }

    // ===== Declarations =====

    fn parse_program(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        let mut body = Vec::new();
        while self.kind() != TokenKind::Eof {
            body.push(self.parse_external_declaration()?);
        }
        let children = body.clone();
        Ok(self.node(NodeKind::Program { body }, mark, &children))
    }

    fn parse_external_declaration(&mut self) -> ParseResult<NodeId> {
        match self.kind() {
            TokenKind::Typedef => self.parse_typedef(),
            TokenKind::Struct | TokenKind::Union => self.parse_struct(),
            TokenKind::Enum => self.parse_enum(),
            _ if self.at_type_start() => {
                let mark = self.mark();
                let base = self.parse_base_type()?;
                let (name_token, data_type) = self.parse_declarator(base)?;
                if self.at_punct(b'(') {
                    self.parse_function(mark, &name_token, data_type)
                } else {
                    let decl = self.parse_variable_rest(
                        mark,
                        &name_token,
                        data_type,
                    )?;
                    self.expect_punct(b';')?;
                    Ok(decl)
                }
            }
            _ => Err(self.unexpected()),
        }
    }

    fn at_type_start(&self) -> bool {
        matches!(
            self.kind(),
            TokenKind::Const
                | TokenKind::Unsigned
                | TokenKind::CharType
                | TokenKind::ShortType
                | TokenKind::IntType
                | TokenKind::LongType
                | TokenKind::FloatType
                | TokenKind::DoubleType
                | TokenKind::VoidType
        )
    }

    /// Parses qualifiers plus a primitive type name into a primitive type
    /// node. A bare `unsigned` defaults the primitive to `int`.
    fn parse_base_type(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        let mut qualifiers = Qualifiers::empty();
        loop {
            match self.kind() {
                TokenKind::Const => {
                    self.pos += 1;
                    qualifiers |= Qualifiers::CONST;
                }
                TokenKind::Unsigned => {
                    self.pos += 1;
                    qualifiers |= Qualifiers::UNSIGNED;
                }
                _ => break,
            }
        }
        let primitive = match self.kind() {
            TokenKind::CharType => Primitive::Char,
            TokenKind::ShortType => Primitive::Short,
            TokenKind::IntType => Primitive::Int,
            TokenKind::LongType => Primitive::Long,
            TokenKind::FloatType => Primitive::Float,
            TokenKind::DoubleType => Primitive::Double,
            TokenKind::VoidType => Primitive::Void,
            _ if qualifiers.contains(Qualifiers::UNSIGNED) => {
                // `unsigned x;` means `unsigned int x;`
                return Ok(self.node(
                    NodeKind::PrimitiveType {
                        primitive: Primitive::Int,
                        qualifiers,
                    },
                    mark,
                    &[],
                ));
            }
            _ => return Err(self.expected("type name")),
        };
        self.pos += 1;
        Ok(self.node(
            NodeKind::PrimitiveType {
                primitive,
                qualifiers,
            },
            mark,
            &[],
        ))
    }

    /// Parses `*`s, the declared name, and `[N]` suffixes around a base
    /// type. Returns the name token and the resulting full type node.
    fn parse_declarator(
        &mut self,
        base: NodeId,
    ) -> ParseResult<(Token, NodeId)> {
        let mark = self.mark();
        let mut data_type = base;
        while self.eat_punct(b'*') {
            data_type = self.node(
                NodeKind::PointerType { inner: data_type },
                mark,
                &[data_type],
            );
        }
        let name_token = self.expect(TokenKind::Ident)?;
        while self.at_punct(b'[') {
            self.pos += 1;
            let size_token = self.expect(TokenKind::Integer)?;
            let size = match size_token.value {
                TokenValue::Integer(n) => n,
                _ => 0,
            };
            if size <= 0 {
                return Err((
                    ParseError::InvalidArraySize(size),
                    size_token.span(),
                ));
            }
            self.expect_punct(b']')?;
            data_type = self.node(
                NodeKind::ArrayType {
                    inner: data_type,
                    size,
                },
                mark,
                &[data_type],
            );
        }
        Ok((name_token, data_type))
    }

    /// A type name with no declared identifier, as used by `sizeof` and
    /// casts: base type plus pointer stars.
    fn parse_type_name(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        let mut data_type = self.parse_base_type()?;
        while self.eat_punct(b'*') {
            data_type = self.node(
                NodeKind::PointerType { inner: data_type },
                mark,
                &[data_type],
            );
        }
        Ok(data_type)
    }

    fn parse_variable_rest(
        &mut self,
        mark: Mark,
        name_token: &Token,
        data_type: NodeId,
    ) -> ParseResult<NodeId> {
        let id = self.identifier_node(name_token);
        let initializer = if self.eat_punct(b'=') {
            let init = self.parse_assignment()?;
            Some(self.rvalue(init))
        } else {
            None
        };
        let mut children = vec![id, data_type];
        children.extend(initializer);
        Ok(self.node(
            NodeKind::VariableDecl {
                id,
                data_type,
                initializer,
            },
            mark,
            &children,
        ))
    }

    fn parse_function(
        &mut self,
        mark: Mark,
        name_token: &Token,
        return_type: NodeId,
    ) -> ParseResult<NodeId> {
        let id = self.identifier_node(name_token);
        self.expect_punct(b'(')?;

        let mut parameters = Vec::new();
        let mut variadic = false;
        if self.at(TokenKind::VoidType) && self.kind_at(1) == TokenKind::Punct(b')')
        {
            // `(void)` is an empty parameter list
            self.pos += 1;
        } else if !self.at_punct(b')') {
            loop {
                if self.eat(TokenKind::Ellipsis) {
                    variadic = true;
                    break;
                }
                let param_mark = self.mark();
                let base = self.parse_base_type()?;
                let (param_name, param_type) = self.parse_declarator(base)?;
                let param_id = self.identifier_node(&param_name);
                let param = self.node(
                    NodeKind::VariableDecl {
                        id: param_id,
                        data_type: param_type,
                        initializer: None,
                    },
                    param_mark,
                    &[param_id, param_type],
                );
                if parameters.len() >= MAX_PARAMETERS {
                    return Err((
                        ParseError::TooManyParameters,
                        param_name.span(),
                    ));
                }
                parameters.push(param);
                if !self.eat_punct(b',') {
                    break;
                }
            }
        }
        self.expect_punct(b')')?;

        let body = if self.eat_punct(b';') {
            // no body means this is just a prototype
            None
        } else {
            Some(self.parse_block()?)
        };

        let mut children = vec![id];
        children.extend(&parameters);
        children.push(return_type);
        children.extend(body);
        Ok(self.node(
            NodeKind::FunctionDecl {
                id,
                parameters,
                variadic,
                return_type,
                body,
            },
            mark,
            &children,
        ))
    }

    fn parse_struct(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        self.pos += 1; // struct or union
        let name_token = self.expect(TokenKind::Ident)?;
        let name = name_token.value.text().unwrap_or_default().to_string();
        self.expect_punct(b'{')?;
        let mut fields = Vec::new();
        while !self.at_punct(b'}') {
            let field_mark = self.mark();
            let base = self.parse_base_type()?;
            let (field_name, field_type) = self.parse_declarator(base)?;
            self.expect_punct(b';')?;
            let field_id = self.identifier_node(&field_name);
            let field = self.node(
                NodeKind::VariableDecl {
                    id: field_id,
                    data_type: field_type,
                    initializer: None,
                },
                field_mark,
                &[field_id, field_type],
            );
            if fields.len() >= MAX_FIELDS {
                return Err((ParseError::TooManyFields, field_name.span()));
            }
            fields.push(field);
        }
        self.expect_punct(b'}')?;
        self.expect_punct(b';')?;
        let children = fields.clone();
        Ok(self.node(
            NodeKind::StructDecl { name, fields },
            mark,
            &children,
        ))
    }

    fn parse_enum(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        self.pos += 1; // enum
        let name_token = self.expect(TokenKind::Ident)?;
        let name = name_token.value.text().unwrap_or_default().to_string();
        self.expect_punct(b'{')?;
        let mut values = Vec::new();
        loop {
            let value_token = self.expect(TokenKind::Ident)?;
            if values.len() >= MAX_ENUM_VALUES {
                return Err((
                    ParseError::TooManyEnumValues,
                    value_token.span(),
                ));
            }
            let value = self.builder.push(
                NodeKind::EnumValue {
                    name: value_token
                        .value
                        .text()
                        .unwrap_or_default()
                        .to_string(),
                    // enumerators take their declaration index as value
                    value: values.len() as i32,
                },
                value_token.span(),
            );
            values.push(value);
            if !self.eat_punct(b',') {
                break;
            }
        }
        self.expect_punct(b'}')?;
        self.expect_punct(b';')?;
        let children = values.clone();
        Ok(self.node(NodeKind::Enum { name, values }, mark, &children))
    }

    fn parse_typedef(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        self.pos += 1; // typedef
        let base = self.parse_base_type()?;
        let (name_token, data_type) = self.parse_declarator(base)?;
        self.expect_punct(b';')?;
        let name = name_token.value.text().unwrap_or_default().to_string();
        Ok(self.node(
            NodeKind::Typedef { name, data_type },
            mark,
            &[data_type],
        ))
    }

    // ===== Statements =====

    fn parse_block(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        self.expect_punct(b'{')?;
        let mut body = Vec::new();
        while !self.at_punct(b'}') && self.kind() != TokenKind::Eof {
            body.push(self.parse_statement()?);
        }
        self.expect_punct(b'}')?;
        let children = body.clone();
        Ok(self.node(NodeKind::BlockStmt { body }, mark, &children))
    }

    fn parse_statement(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        match self.kind() {
            TokenKind::Punct(b'{') => self.parse_block(),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::While => self.parse_while(),
            TokenKind::Do => self.parse_do_while(),
            TokenKind::Return => {
                self.pos += 1;
                let argument = if self.at_punct(b';') {
                    None
                } else {
                    let arg = self.parse_expression()?;
                    Some(self.rvalue(arg))
                };
                self.expect_punct(b';')?;
                let children: Vec<_> = argument.into_iter().collect();
                Ok(self.node(
                    NodeKind::ReturnStmt { argument },
                    mark,
                    &children,
                ))
            }
            TokenKind::Break => {
                self.pos += 1;
                self.expect_punct(b';')?;
                Ok(self.node(NodeKind::BreakStmt, mark, &[]))
            }
            TokenKind::Emit => {
                self.pos += 1;
                let opcode_token = self.expect(TokenKind::Integer)?;
                let opcode = match opcode_token.value {
                    TokenValue::Integer(n) => (n & 0xff) as u8,
                    _ => 0,
                };
                self.expect_punct(b';')?;
                Ok(self.node(NodeKind::Emit { opcode }, mark, &[]))
            }
            TokenKind::Punct(b';') => {
                self.pos += 1;
                Ok(self.node(NodeKind::Empty, mark, &[]))
            }
            _ if self.at_type_start() => {
                let decl = self.parse_declaration()?;
                self.expect_punct(b';')?;
                Ok(decl)
            }
            _ => {
                let expr = self.parse_expression()?;
                self.expect_punct(b';')?;
                Ok(self.node(NodeKind::ExprStmt { expr }, mark, &[expr]))
            }
        }
    }

    /// A local variable declaration, without the trailing `;` (the `for`
    /// initializer shares this).
    fn parse_declaration(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        let base = self.parse_base_type()?;
        let (name_token, data_type) = self.parse_declarator(base)?;
        self.parse_variable_rest(mark, &name_token, data_type)
    }

    fn parse_if(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        self.pos += 1; // if
        self.expect_punct(b'(')?;
        let test = self.parse_expression()?;
        self.rvalue(test);
        self.expect_punct(b')')?;
        let consequent = self.parse_statement()?;
        let alternative = if self.eat(TokenKind::Else) {
            Some(self.parse_statement()?)
        } else {
            None
        };
        let mut children = vec![test, consequent];
        children.extend(alternative);
        Ok(self.node(
            NodeKind::IfStmt {
                test,
                consequent,
                alternative,
            },
            mark,
            &children,
        ))
    }

    fn parse_for(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        self.pos += 1; // for
        self.expect_punct(b'(')?;

        let init = if self.at_punct(b';') {
            self.node(NodeKind::Empty, mark, &[])
        } else if self.at_type_start() {
            self.parse_declaration()?
        } else {
            self.parse_expression()?
        };
        self.expect_punct(b';')?;

        let test = if self.at_punct(b';') {
            self.node(NodeKind::Empty, mark, &[])
        } else {
            let test = self.parse_expression()?;
            self.rvalue(test)
        };
        self.expect_punct(b';')?;

        let update = if self.at_punct(b')') {
            self.node(NodeKind::Empty, mark, &[])
        } else {
            self.parse_expression()?
        };
        self.expect_punct(b')')?;

        let body = self.parse_statement()?;
        Ok(self.node(
            NodeKind::ForStmt {
                init,
                test,
                update,
                body,
            },
            mark,
            &[init, test, update, body],
        ))
    }

    fn parse_while(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        self.pos += 1; // while
        self.expect_punct(b'(')?;
        let test = self.parse_expression()?;
        self.rvalue(test);
        self.expect_punct(b')')?;
        let body = self.parse_statement()?;
        Ok(self.node(
            NodeKind::WhileStmt { test, body },
            mark,
            &[test, body],
        ))
    }

    fn parse_do_while(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        self.pos += 1; // do
        let body = self.parse_statement()?;
        self.expect(TokenKind::While)?;
        self.expect_punct(b'(')?;
        let test = self.parse_expression()?;
        self.rvalue(test);
        self.expect_punct(b')')?;
        self.expect_punct(b';')?;
        Ok(self.node(
            NodeKind::DoWhileStmt { test, body },
            mark,
            &[test, body],
        ))
    }

    // ===== Expressions =====

    /// Lowest precedence: the comma sequence.
    fn parse_expression(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        let first = self.parse_assignment()?;
        if !self.at_punct(b',') {
            return Ok(first);
        }
        let mut expressions = vec![self.rvalue(first)];
        while self.eat_punct(b',') {
            if expressions.len() >= MAX_SEQ_EXPRESSIONS {
                return Err((
                    ParseError::TooManyExpressions,
                    self.peek().span(),
                ));
            }
            let expr = self.parse_assignment()?;
            expressions.push(self.rvalue(expr));
        }
        let children = expressions.clone();
        Ok(self.node(NodeKind::SeqExpr { expressions }, mark, &children))
    }

    fn parse_assignment(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        let lhs = self.parse_ternary()?;
        let op = match self.kind() {
            TokenKind::Punct(b'=') => AssignOp::Assign,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            TokenKind::MulAssign => AssignOp::Mul,
            TokenKind::DivAssign => AssignOp::Div,
            TokenKind::ModAssign => AssignOp::Mod,
            TokenKind::XorAssign => AssignOp::Xor,
            TokenKind::OrAssign => AssignOp::Or,
            TokenKind::AndAssign => AssignOp::And,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_assignment()?;
        self.rvalue(rhs);
        Ok(self.node(
            NodeKind::AssignmentExpr { op, lhs, rhs },
            mark,
            &[lhs, rhs],
        ))
    }

    fn parse_ternary(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        let condition = self.parse_binary(0)?;
        if !self.eat_punct(b'?') {
            return Ok(condition);
        }
        self.rvalue(condition);
        let consequent = self.parse_assignment()?;
        self.rvalue(consequent);
        self.expect_punct(b':')?;
        let alternative = self.parse_assignment()?;
        self.rvalue(alternative);
        Ok(self.node(
            NodeKind::TernaryExpr {
                condition,
                consequent,
                alternative,
            },
            mark,
            &[condition, consequent, alternative],
        ))
    }

    /// The binary operator at the cursor, with its precedence level.
    fn binary_op(&self) -> Option<(BinaryOp, u8)> {
        Some(match self.kind() {
            TokenKind::Punct(b'|') => (BinaryOp::BitOr, 1),
            TokenKind::Punct(b'^') => (BinaryOp::BitXor, 2),
            TokenKind::Punct(b'&') => (BinaryOp::BitAnd, 3),
            TokenKind::Equal => (BinaryOp::Equal, 4),
            TokenKind::NotEqual => (BinaryOp::NotEqual, 4),
            TokenKind::Punct(b'<') => (BinaryOp::Less, 5),
            TokenKind::Punct(b'>') => (BinaryOp::Greater, 5),
            TokenKind::LessEqual => (BinaryOp::LessEqual, 5),
            TokenKind::GreaterEqual => (BinaryOp::GreaterEqual, 5),
            TokenKind::Shl => (BinaryOp::Shl, 6),
            TokenKind::Shr => (BinaryOp::Shr, 6),
            TokenKind::Punct(b'+') => (BinaryOp::Add, 7),
            TokenKind::Punct(b'-') => (BinaryOp::Sub, 7),
            TokenKind::Punct(b'*') => (BinaryOp::Mul, 8),
            TokenKind::Punct(b'/') => (BinaryOp::Div, 8),
            TokenKind::Punct(b'%') => (BinaryOp::Mod, 8),
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> ParseResult<NodeId> {
        let mark = self.mark();
        let mut lhs = self.parse_unary()?;
        while let Some((op, prec)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_binary(prec + 1)?;
            self.rvalue(lhs);
            self.rvalue(rhs);
            lhs = self.node(
                NodeKind::BinExpr { op, lhs, rhs },
                mark,
                &[lhs, rhs],
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        let op = match self.kind() {
            TokenKind::Punct(b'-') => Some(UnaryOp::Minus),
            TokenKind::Punct(b'+') => Some(UnaryOp::Plus),
            TokenKind::Punct(b'!') => Some(UnaryOp::Not),
            TokenKind::Punct(b'~') => Some(UnaryOp::BitNot),
            TokenKind::PlusPlus => Some(UnaryOp::Increment),
            TokenKind::MinusMinus => Some(UnaryOp::Decrement),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let argument = self.parse_unary()?;
            self.rvalue(argument);
            return Ok(self.node(
                NodeKind::UnaryExpr {
                    op,
                    argument,
                    prefix: true,
                },
                mark,
                &[argument],
            ));
        }

        match self.kind() {
            TokenKind::Punct(b'*') => {
                self.pos += 1;
                let value = self.parse_unary()?;
                Ok(self.node(
                    NodeKind::Dereference { value },
                    mark,
                    &[value],
                ))
            }
            TokenKind::Punct(b'&') => {
                self.pos += 1;
                let value = self.parse_unary()?;
                Ok(self.node(NodeKind::AddressOf { value }, mark, &[value]))
            }
            TokenKind::Sizeof => {
                self.pos += 1;
                let subject = if self.at_punct(b'(')
                    && self.type_starts_at(1)
                {
                    self.pos += 1;
                    let ty = self.parse_type_name()?;
                    self.expect_punct(b')')?;
                    ty
                } else {
                    self.parse_unary()?
                };
                Ok(self.node(
                    NodeKind::Sizeof { subject },
                    mark,
                    &[subject],
                ))
            }
            TokenKind::Punct(b'(') if self.type_starts_at(1) => {
                self.pos += 1;
                let data_type = self.parse_type_name()?;
                self.expect_punct(b')')?;
                let expr = self.parse_unary()?;
                self.rvalue(expr);
                Ok(self.node(
                    NodeKind::Cast { data_type, expr },
                    mark,
                    &[data_type, expr],
                ))
            }
            _ => self.parse_postfix(),
        }
    }

    fn type_starts_at(&self, offset: usize) -> bool {
        matches!(
            self.kind_at(offset),
            TokenKind::Const
                | TokenKind::Unsigned
                | TokenKind::CharType
                | TokenKind::ShortType
                | TokenKind::IntType
                | TokenKind::LongType
                | TokenKind::FloatType
                | TokenKind::DoubleType
                | TokenKind::VoidType
        )
    }

    fn parse_postfix(&mut self) -> ParseResult<NodeId> {
        let mark = self.mark();
        let mut expr = self.parse_primary()?;
        loop {
            expr = match self.kind() {
                TokenKind::Punct(b'(') => {
                    self.pos += 1;
                    let mut arguments = Vec::new();
                    if !self.at_punct(b')') {
                        loop {
                            if arguments.len() >= MAX_ARGUMENTS {
                                return Err((
                                    ParseError::TooManyArguments,
                                    self.peek().span(),
                                ));
                            }
                            let arg = self.parse_assignment()?;
                            arguments.push(self.rvalue(arg));
                            if !self.eat_punct(b',') {
                                break;
                            }
                        }
                    }
                    self.expect_punct(b')')?;
                    let mut children = vec![expr];
                    children.extend(&arguments);
                    self.node(
                        NodeKind::FunctionCallExpr {
                            callee: expr,
                            arguments,
                        },
                        mark,
                        &children,
                    )
                }
                TokenKind::Punct(b'[') => {
                    self.pos += 1;
                    let property = self.parse_expression()?;
                    self.rvalue(property);
                    self.expect_punct(b']')?;
                    self.node(
                        NodeKind::MemberExpr {
                            object: expr,
                            property,
                            computed: true,
                            as_pointer: false,
                        },
                        mark,
                        &[expr, property],
                    )
                }
                TokenKind::Punct(b'.') | TokenKind::Arrow => {
                    let as_pointer = self.kind() == TokenKind::Arrow;
                    self.pos += 1;
                    let name_token = self.expect(TokenKind::Ident)?;
                    let property = self.identifier_node(&name_token);
                    self.node(
                        NodeKind::MemberExpr {
                            object: expr,
                            property,
                            computed: false,
                            as_pointer,
                        },
                        mark,
                        &[expr, property],
                    )
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let op = if self.kind() == TokenKind::PlusPlus {
                        UnaryOp::Increment
                    } else {
                        UnaryOp::Decrement
                    };
                    self.pos += 1;
                    self.node(
                        NodeKind::UnaryExpr {
                            op,
                            argument: expr,
                            prefix: false,
                        },
                        mark,
                        &[expr],
                    )
                }
                _ => return Ok(expr),
            };
        }
    }

    fn parse_primary(&mut self) -> ParseResult<NodeId> {
        match self.kind() {
            TokenKind::Integer => {
                let token = self.advance();
                let value = match token.value {
                    TokenValue::Integer(n) => n,
                    _ => 0,
                };
                Ok(self.builder.push(
                    NodeKind::Literal(Literal::Integer(value)),
                    token.span(),
                ))
            }
            TokenKind::Float => {
                let token = self.advance();
                let value = match token.value {
                    TokenValue::Float(x) => x,
                    _ => 0.0,
                };
                Ok(self.builder.push(
                    NodeKind::Literal(Literal::Float(value)),
                    token.span(),
                ))
            }
            TokenKind::Str => {
                let token = self.advance();
                let value =
                    token.value.text().unwrap_or_default().to_string();
                Ok(self.builder.push(
                    NodeKind::Literal(Literal::Str(value)),
                    token.span(),
                ))
            }
            TokenKind::Ident => {
                let token = self.advance();
                Ok(self.identifier_node(&token))
            }
            TokenKind::Punct(b'(') => {
                self.pos += 1;
                let expr = self.parse_expression()?;
                self.expect_punct(b')')?;
                Ok(expr)
            }
            _ => Err(self.unexpected()),
        }
    }
}

impl Compiler<Vec<Token>> {
    /// Builds the syntax tree from the token list.
    pub fn parse(self) -> Result<Compiler<Ast>, WithSource<ParseError>> {
        let Compiler {
            source,
            flags,
            options,
            stage: tokens,
        } = self;
        let mut parser = Parser::new(&tokens);
        match parser.parse_program() {
            Ok(root) => Ok(Compiler {
                source,
                flags,
                options,
                stage: parser.builder.finish(root),
            }),
            Err((error, span)) => Err(WithSource::new(
                iter::once(SourceErrorWrapper::new(error, span, &source)),
                source,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::{tokenize, LexFlags};

    fn parse(src: &str) -> Ast {
        let tokens = tokenize(src, LexFlags::empty()).unwrap();
        let mut parser = Parser::new(&tokens);
        let root = parser.parse_program().unwrap();
        parser.builder.finish(root)
    }

    fn parse_err(src: &str) -> ParseError {
        let tokens = tokenize(src, LexFlags::empty()).unwrap();
        let mut parser = Parser::new(&tokens);
        parser.parse_program().unwrap_err().0
    }

    /// The single statement of `fn_body`'s first function.
    fn first_statement(ast: &Ast) -> NodeId {
        let program = match &ast[ast.root()].kind {
            NodeKind::Program { body } => body[0],
            kind => panic!("expected program, got {:?}", kind),
        };
        let body = match &ast[program].kind {
            NodeKind::FunctionDecl { body: Some(b), .. } => *b,
            kind => panic!("expected function, got {:?}", kind),
        };
        match &ast[body].kind {
            NodeKind::BlockStmt { body } => body[0],
            kind => panic!("expected block, got {:?}", kind),
        }
    }

    #[test]
    fn test_function_shape() {
        let ast = parse("int f(int a, char b) { return a; }");
        let func = match &ast[ast.root()].kind {
            NodeKind::Program { body } => body[0],
            _ => unreachable!(),
        };
        match &ast[func].kind {
            NodeKind::FunctionDecl {
                id,
                parameters,
                variadic,
                body,
                ..
            } => {
                assert_eq!(
                    ast[*id].kind,
                    NodeKind::Identifier {
                        name: "f".to_string()
                    }
                );
                assert_eq!(parameters.len(), 2);
                assert!(!*variadic);
                assert!(body.is_some());
            }
            kind => panic!("expected function decl, got {:?}", kind),
        }
    }

    #[test]
    fn test_prototype_has_no_body() {
        let ast = parse("int f(int a);");
        let func = match &ast[ast.root()].kind {
            NodeKind::Program { body } => body[0],
            _ => unreachable!(),
        };
        match &ast[func].kind {
            NodeKind::FunctionDecl { body, .. } => assert!(body.is_none()),
            kind => panic!("expected function decl, got {:?}", kind),
        }
    }

    #[test]
    fn test_variadic_function() {
        let ast = parse("int f(int a, ...);");
        let func = match &ast[ast.root()].kind {
            NodeKind::Program { body } => body[0],
            _ => unreachable!(),
        };
        match &ast[func].kind {
            NodeKind::FunctionDecl {
                variadic,
                parameters,
                ..
            } => {
                assert!(*variadic);
                assert_eq!(parameters.len(), 1);
            }
            kind => panic!("expected function decl, got {:?}", kind),
        }
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let ast = parse("int f() { return 1 + 2 * 3; }");
        let ret = first_statement(&ast);
        let arg = match &ast[ret].kind {
            NodeKind::ReturnStmt {
                argument: Some(arg),
            } => *arg,
            kind => panic!("expected return, got {:?}", kind),
        };
        match &ast[arg].kind {
            NodeKind::BinExpr { op, lhs, rhs } => {
                assert_eq!(*op, BinaryOp::Add);
                assert_eq!(
                    ast[*lhs].kind,
                    NodeKind::Literal(Literal::Integer(1))
                );
                match &ast[*rhs].kind {
                    NodeKind::BinExpr { op, .. } => {
                        assert_eq!(*op, BinaryOp::Mul)
                    }
                    kind => panic!("expected bin expr, got {:?}", kind),
                }
            }
            kind => panic!("expected bin expr, got {:?}", kind),
        }
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let ast = parse("int f() { a = b = 1; }");
        let stmt = first_statement(&ast);
        let expr = match &ast[stmt].kind {
            NodeKind::ExprStmt { expr } => *expr,
            kind => panic!("expected expr stmt, got {:?}", kind),
        };
        match &ast[expr].kind {
            NodeKind::AssignmentExpr { op, rhs, .. } => {
                assert_eq!(*op, AssignOp::Assign);
                assert!(matches!(
                    ast[*rhs].kind,
                    NodeKind::AssignmentExpr { .. }
                ));
                assert!(ast[*rhs].rvalue);
            }
            kind => panic!("expected assignment, got {:?}", kind),
        }
    }

    #[test]
    fn test_member_forms() {
        let ast = parse("int f() { a[1] = b.x + c->y; }");
        let stmt = first_statement(&ast);
        let (lhs, rhs) = match &ast[stmt].kind {
            NodeKind::ExprStmt { expr } => match &ast[*expr].kind {
                NodeKind::AssignmentExpr { lhs, rhs, .. } => (*lhs, *rhs),
                kind => panic!("expected assignment, got {:?}", kind),
            },
            kind => panic!("expected expr stmt, got {:?}", kind),
        };
        match &ast[lhs].kind {
            NodeKind::MemberExpr {
                computed,
                as_pointer,
                ..
            } => {
                assert!(*computed);
                assert!(!*as_pointer);
            }
            kind => panic!("expected member expr, got {:?}", kind),
        }
        match &ast[rhs].kind {
            NodeKind::BinExpr { lhs, rhs, .. } => {
                assert!(matches!(
                    ast[*lhs].kind,
                    NodeKind::MemberExpr {
                        computed: false,
                        as_pointer: false,
                        ..
                    }
                ));
                assert!(matches!(
                    ast[*rhs].kind,
                    NodeKind::MemberExpr {
                        computed: false,
                        as_pointer: true,
                        ..
                    }
                ));
            }
            kind => panic!("expected bin expr, got {:?}", kind),
        }
    }

    #[test]
    fn test_declarator_types() {
        let ast = parse("int f() { char *p; int a[4]; }");
        let program_fn = first_statement(&ast);
        match &ast[program_fn].kind {
            NodeKind::VariableDecl { data_type, .. } => {
                assert!(matches!(
                    ast[*data_type].kind,
                    NodeKind::PointerType { .. }
                ));
            }
            kind => panic!("expected variable decl, got {:?}", kind),
        }
    }

    #[test]
    fn test_array_size_must_be_positive() {
        assert_eq!(
            parse_err("int f() { int a[0]; }"),
            ParseError::InvalidArraySize(0)
        );
    }

    #[test]
    fn test_emit_statement() {
        let ast = parse("int f() { __emit 0x90; }");
        let stmt = first_statement(&ast);
        assert_eq!(ast[stmt].kind, NodeKind::Emit { opcode: 0x90 });
    }

    #[test]
    fn test_struct_enum_typedef() {
        let ast = parse(
            "struct point { int x; int y; };
             enum color { red, green, blue };
             typedef int number;",
        );
        let body = match &ast[ast.root()].kind {
            NodeKind::Program { body } => body.clone(),
            _ => unreachable!(),
        };
        assert!(
            matches!(&ast[body[0]].kind, NodeKind::StructDecl { name, fields }
                if name == "point" && fields.len() == 2)
        );
        match &ast[body[1]].kind {
            NodeKind::Enum { name, values } => {
                assert_eq!(name, "color");
                assert_eq!(
                    ast[values[2]].kind,
                    NodeKind::EnumValue {
                        name: "blue".to_string(),
                        value: 2
                    }
                );
            }
            kind => panic!("expected enum, got {:?}", kind),
        }
        assert!(
            matches!(&ast[body[2]].kind, NodeKind::Typedef { name, .. }
                if name == "number")
        );
    }

    #[test]
    fn test_too_many_arguments() {
        let args = (0..33).map(|i| i.to_string()).collect::<Vec<_>>();
        let src = format!("int f() {{ g({}); }}", args.join(", "));
        assert_eq!(parse_err(&src), ParseError::TooManyArguments);
    }

    #[test]
    fn test_parent_back_references() {
        let ast = parse(
            "int add(int a, int b) { return a + b; }
             int main() { return add(20, 22); }",
        );
        // every non-root node's parent is the unique node that references it
        for (id, node) in ast.iter() {
            for child in node.kind.children() {
                assert_eq!(
                    ast[child].parent,
                    Some(id),
                    "child {:?} of {:?} has wrong parent",
                    child,
                    id
                );
            }
        }
        assert_eq!(ast[ast.root()].parent, None);
    }

    #[test]
    fn test_unexpected_token() {
        assert!(matches!(
            parse_err("int f() { return +; }"),
            ParseError::UnexpectedToken(_)
        ));
    }
}
