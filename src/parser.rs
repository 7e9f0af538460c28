use crate::ast::{AssignTarget, BinaryOp, Expr, LogicalOp, Program, Stmt, UnaryOp};
use crate::error::{AtmarkError, Span};
use crate::lexer::{Token, TokenType};
use crate::value::Value;

/// Recursive-descent parser for embedded host code.
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    pub fn parse(&mut self) -> Result<Program, AtmarkError> {
        let mut statements = Vec::new();

        while !self.is_at_end() {
            statements.push(self.statement()?);
        }

        Ok(Program { statements })
    }

    /// Parse the entire token stream as a single expression.
    pub fn parse_expression(&mut self) -> Result<Expr, AtmarkError> {
        let expr = self.expression()?;
        if !self.is_at_end() {
            let token = self.peek().clone();
            return Err(AtmarkError::syntax(
                token.span,
                format!("Unexpected token after expression: '{}'", token.lexeme),
            ));
        }
        Ok(expr)
    }

    fn statement(&mut self) -> Result<Stmt, AtmarkError> {
        if self.check(&TokenType::LeftBrace) {
            // Look ahead to determine whether this is a dictionary literal
            // or a block statement
            if self.is_dictionary_literal() {
                self.expression_statement()
            } else {
                self.advance(); // consume the '{'
                Ok(Stmt::Block {
                    statements: self.block()?,
                    span: self.previous().span.clone(),
                })
            }
        } else if self.match_types(&[TokenType::If]) {
            self.if_statement()
        } else if self.match_types(&[TokenType::While]) {
            self.while_statement()
        } else if self.match_types(&[TokenType::For]) {
            self.for_statement()
        } else {
            self.expression_statement()
        }
    }

    fn is_dictionary_literal(&self) -> bool {
        // '{}' is an empty dict; '{ <literal> : ...' is a dict entry.  A
        // block never starts with a colon-followed literal.
        match self.tokens.get(self.current + 1) {
            Some(next) if next.token_type == TokenType::RightBrace => true,
            Some(next)
                if matches!(
                    next.token_type,
                    TokenType::String | TokenType::Integer | TokenType::Identifier
                ) =>
            {
                matches!(
                    self.tokens.get(self.current + 2),
                    Some(after) if after.token_type == TokenType::Colon
                )
            }
            _ => false,
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>, AtmarkError> {
        let mut statements = Vec::new();

        while !self.check(&TokenType::RightBrace) && !self.is_at_end() {
            statements.push(self.statement()?);
        }

        self.consume_with_help(
            TokenType::RightBrace,
            "Expected '}' after block",
            "Block statements must be closed with '}' after the opening '{'.".to_string(),
        )?;
        Ok(statements)
    }

    fn if_statement(&mut self) -> Result<Stmt, AtmarkError> {
        let start_span = self.previous().span.start;

        self.consume_with_help(
            TokenType::LeftParen,
            "Expected '(' after 'if'",
            "If statements require parentheses around the condition: if (condition) { ... }"
                .to_string(),
        )?;
        let condition = self.expression()?;
        self.consume_with_help(
            TokenType::RightParen,
            "Expected ')' after if condition",
            "If conditions must be enclosed in parentheses: if (condition) { ... }".to_string(),
        )?;

        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.match_types(&[TokenType::Else]) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };

        let end_span = if let Some(ref else_stmt) = else_branch {
            else_stmt.span().end
        } else {
            then_branch.span().end
        };

        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            span: Span::new(start_span, end_span),
        })
    }

    fn while_statement(&mut self) -> Result<Stmt, AtmarkError> {
        let start_span = self.previous().span.start;

        self.consume(TokenType::LeftParen, "Expected '(' after 'while'")?;
        let condition = self.expression()?;
        self.consume(TokenType::RightParen, "Expected ')' after while condition")?;

        let body = Box::new(self.statement()?);
        let end_span = body.span().end;

        Ok(Stmt::While {
            condition,
            body,
            span: Span::new(start_span, end_span),
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, AtmarkError> {
        let start_span = self.previous().span.start;

        self.consume(TokenType::LeftParen, "Expected '(' after 'for'")?;

        let initializer = if self.match_types(&[TokenType::Semicolon]) {
            None
        } else {
            Some(Box::new(self.expression_statement()?))
        };

        let condition = if !self.check(&TokenType::Semicolon) {
            Some(self.expression()?)
        } else {
            None
        };
        self.consume(TokenType::Semicolon, "Expected ';' after loop condition")?;

        let increment = if !self.check(&TokenType::RightParen) {
            Some(self.expression()?)
        } else {
            None
        };
        self.consume(TokenType::RightParen, "Expected ')' after for clauses")?;

        let body = Box::new(self.statement()?);
        let end_span = body.span().end;

        Ok(Stmt::For {
            initializer,
            condition,
            increment,
            body,
            span: Span::new(start_span, end_span),
        })
    }

    fn expression_statement(&mut self) -> Result<Stmt, AtmarkError> {
        let expr = self.statement_expression()?;
        self.match_types(&[TokenType::Semicolon]);
        let span = expr.span().clone();
        Ok(Stmt::Expression { expr, span })
    }

    /// At statement level a comma-separated target list begins a
    /// destructuring assignment: a, b, c = expr
    fn statement_expression(&mut self) -> Result<Expr, AtmarkError> {
        if self.check(&TokenType::Identifier)
            && matches!(
                self.tokens.get(self.current + 1),
                Some(next) if next.token_type == TokenType::Comma
            )
        {
            return self.multi_assignment();
        }
        self.expression()
    }

    fn multi_assignment(&mut self) -> Result<Expr, AtmarkError> {
        let start_span = self.peek().span.start;
        let mut targets = Vec::new();

        loop {
            let token = self
                .consume(TokenType::Identifier, "Expected assignment target")?
                .clone();
            if token.lexeme == "_" {
                targets.push(AssignTarget::Ignore { span: token.span });
            } else {
                targets.push(AssignTarget::Variable {
                    name: token.lexeme,
                    span: token.span,
                });
            }
            if !self.match_types(&[TokenType::Comma]) {
                break;
            }
        }

        self.consume_with_help(
            TokenType::Equal,
            "Expected '=' after assignment targets",
            "Destructuring assignments look like: a, b = expr".to_string(),
        )?;
        let value = self.expression()?;
        let end_span = value.span().end;

        Ok(Expr::MultiAssign {
            targets,
            value: Box::new(value),
            span: Span::new(start_span, end_span),
        })
    }

    fn expression(&mut self) -> Result<Expr, AtmarkError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, AtmarkError> {
        let expr = self.logical_or()?;

        if self.match_types(&[TokenType::Equal]) {
            let equals_span = self.previous().span.clone();
            let value = self.assignment()?;

            if let Expr::Variable { name, span } = expr {
                let end_span = value.span().end;
                return Ok(Expr::Assign {
                    name,
                    value: Box::new(value),
                    span: Span::new(span.start, end_span),
                });
            }

            return Err(AtmarkError::syntax_with_help(
                equals_span,
                "Invalid assignment target".to_string(),
                "Only plain variables can be assigned to.".to_string(),
            ));
        }

        Ok(expr)
    }

    fn logical_or(&mut self) -> Result<Expr, AtmarkError> {
        let mut expr = self.logical_and()?;

        while self.match_types(&[TokenType::Or]) {
            let right = self.logical_and()?;
            let span = Span::new(expr.span().start, right.span().end);
            expr = Expr::Logical {
                left: Box::new(expr),
                operator: LogicalOp::Or,
                right: Box::new(right),
                span,
            };
        }

        Ok(expr)
    }

    fn logical_and(&mut self) -> Result<Expr, AtmarkError> {
        let mut expr = self.equality()?;

        while self.match_types(&[TokenType::And]) {
            let right = self.equality()?;
            let span = Span::new(expr.span().start, right.span().end);
            expr = Expr::Logical {
                left: Box::new(expr),
                operator: LogicalOp::And,
                right: Box::new(right),
                span,
            };
        }

        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr, AtmarkError> {
        let mut expr = self.comparison()?;

        while self.match_types(&[TokenType::EqualEqual, TokenType::BangEqual]) {
            let operator = match self.previous().token_type {
                TokenType::EqualEqual => BinaryOp::Equal,
                _ => BinaryOp::NotEqual,
            };
            let right = self.comparison()?;
            let span = Span::new(expr.span().start, right.span().end);
            expr = Expr::Binary {
                left: Box::new(expr),
                operator,
                right: Box::new(right),
                span,
            };
        }

        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, AtmarkError> {
        let mut expr = self.term()?;

        while self.match_types(&[
            TokenType::Less,
            TokenType::LessEqual,
            TokenType::Greater,
            TokenType::GreaterEqual,
            TokenType::In,
        ]) {
            let operator = match self.previous().token_type {
                TokenType::Less => BinaryOp::Less,
                TokenType::LessEqual => BinaryOp::LessEqual,
                TokenType::Greater => BinaryOp::Greater,
                TokenType::GreaterEqual => BinaryOp::GreaterEqual,
                _ => BinaryOp::In,
            };
            let right = self.term()?;
            let span = Span::new(expr.span().start, right.span().end);
            expr = Expr::Binary {
                left: Box::new(expr),
                operator,
                right: Box::new(right),
                span,
            };
        }

        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr, AtmarkError> {
        let mut expr = self.factor()?;

        while self.match_types(&[TokenType::Plus, TokenType::Minus]) {
            let operator = match self.previous().token_type {
                TokenType::Plus => BinaryOp::Add,
                _ => BinaryOp::Subtract,
            };
            let right = self.factor()?;
            let span = Span::new(expr.span().start, right.span().end);
            expr = Expr::Binary {
                left: Box::new(expr),
                operator,
                right: Box::new(right),
                span,
            };
        }

        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr, AtmarkError> {
        let mut expr = self.unary()?;

        while self.match_types(&[TokenType::Star, TokenType::Slash]) {
            let operator = match self.previous().token_type {
                TokenType::Star => BinaryOp::Multiply,
                _ => BinaryOp::Divide,
            };
            let right = self.unary()?;
            let span = Span::new(expr.span().start, right.span().end);
            expr = Expr::Binary {
                left: Box::new(expr),
                operator,
                right: Box::new(right),
                span,
            };
        }

        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, AtmarkError> {
        if self.match_types(&[TokenType::Bang, TokenType::Not, TokenType::Minus]) {
            let start_span = self.previous().span.start;
            let operator = match self.previous().token_type {
                TokenType::Minus => UnaryOp::Negate,
                _ => UnaryOp::Not,
            };
            let operand = self.unary()?;
            let span = Span::new(start_span, operand.span().end);
            return Ok(Expr::Unary {
                operator,
                operand: Box::new(operand),
                span,
            });
        }

        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, AtmarkError> {
        let mut expr = self.primary()?;

        loop {
            if self.match_types(&[TokenType::LeftParen]) {
                expr = self.finish_call(expr)?;
            } else if self.match_types(&[TokenType::Dot]) {
                let name = self
                    .consume(TokenType::Identifier, "Expected property name after '.'")?
                    .clone();
                let span = Span::new(expr.span().start, name.span.end);
                expr = Expr::PropertyAccess {
                    object: Box::new(expr),
                    property: name.lexeme,
                    span,
                };
            } else if self.match_types(&[TokenType::LeftBracket]) {
                let index = self.expression()?;
                let close =
                    self.consume(TokenType::RightBracket, "Expected ']' after index")?;
                let span = Span::new(expr.span().start, close.span.end);
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    span,
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn finish_call(&mut self, callee: Expr) -> Result<Expr, AtmarkError> {
        let mut args = Vec::new();

        if !self.check(&TokenType::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.match_types(&[TokenType::Comma]) {
                    break;
                }
            }
        }

        let close = self.consume(TokenType::RightParen, "Expected ')' after arguments")?;
        let span = Span::new(callee.span().start, close.span.end);

        Ok(Expr::Call {
            callee: Box::new(callee),
            args,
            span,
        })
    }

    fn primary(&mut self) -> Result<Expr, AtmarkError> {
        let token = self.peek().clone();

        match token.token_type {
            TokenType::Nil => {
                self.advance();
                Ok(Expr::Literal {
                    value: Value::Nil,
                    span: token.span,
                })
            }
            TokenType::True => {
                self.advance();
                Ok(Expr::Literal {
                    value: Value::Bool(true),
                    span: token.span,
                })
            }
            TokenType::False => {
                self.advance();
                Ok(Expr::Literal {
                    value: Value::Bool(false),
                    span: token.span,
                })
            }
            TokenType::Integer => {
                self.advance();
                let value = token.lexeme.parse::<i64>().map_err(|_| {
                    AtmarkError::syntax(
                        token.span.clone(),
                        format!("Invalid integer: {}", token.lexeme),
                    )
                })?;
                Ok(Expr::Literal {
                    value: Value::Int(value),
                    span: token.span,
                })
            }
            TokenType::Double => {
                self.advance();
                let value = token.lexeme.parse::<f64>().map_err(|_| {
                    AtmarkError::syntax(
                        token.span.clone(),
                        format!("Invalid double: {}", token.lexeme),
                    )
                })?;
                Ok(Expr::Literal {
                    value: Value::Double(value),
                    span: token.span,
                })
            }
            TokenType::String => {
                self.advance();
                Ok(Expr::Literal {
                    value: Value::String(token.lexeme),
                    span: token.span,
                })
            }
            TokenType::Identifier => {
                self.advance();
                Ok(Expr::Variable {
                    name: token.lexeme,
                    span: token.span,
                })
            }
            TokenType::LeftParen => {
                self.advance();
                if self.check(&TokenType::RightParen) {
                    return Err(AtmarkError::syntax_with_help(
                        token.span,
                        "Empty parentheses are not allowed".to_string(),
                        "Parentheses must contain an expression: (1 + 2)".to_string(),
                    ));
                }
                let expr = self.expression()?;
                let close = self.consume(TokenType::RightParen, "Expected ')' after expression")?;
                let span = Span::new(token.span.start, close.span.end);
                Ok(Expr::Grouping {
                    expr: Box::new(expr),
                    span,
                })
            }
            TokenType::LeftBracket => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check(&TokenType::RightBracket) {
                    loop {
                        elements.push(self.expression()?);
                        if !self.match_types(&[TokenType::Comma]) {
                            break;
                        }
                    }
                }
                let close =
                    self.consume(TokenType::RightBracket, "Expected ']' after list elements")?;
                let span = Span::new(token.span.start, close.span.end);
                Ok(Expr::List { elements, span })
            }
            TokenType::LeftBrace => {
                self.advance();
                let mut pairs = Vec::new();
                if !self.check(&TokenType::RightBrace) {
                    loop {
                        let key = self.expression()?;
                        self.consume(TokenType::Colon, "Expected ':' after dictionary key")?;
                        let value = self.expression()?;
                        pairs.push((key, value));
                        if !self.match_types(&[TokenType::Comma]) {
                            break;
                        }
                    }
                }
                let close = self.consume(
                    TokenType::RightBrace,
                    "Expected '}' after dictionary entries",
                )?;
                let span = Span::new(token.span.start, close.span.end);
                Ok(Expr::Dict { pairs, span })
            }
            TokenType::Eof => Err(AtmarkError::syntax(
                token.span,
                "Unexpected end of expression".to_string(),
            )),
            _ => Err(AtmarkError::syntax(
                token.span,
                format!("Expected expression, found '{}'", token.lexeme),
            )),
        }
    }

    fn match_types(&mut self, types: &[TokenType]) -> bool {
        for token_type in types {
            if self.check(token_type) {
                self.advance();
                return true;
            }
        }
        false
    }

    fn check(&self, token_type: &TokenType) -> bool {
        self.peek().token_type == *token_type
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn is_at_end(&self) -> bool {
        self.peek().token_type == TokenType::Eof
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn consume(&mut self, token_type: TokenType, message: &str) -> Result<&Token, AtmarkError> {
        if self.check(&token_type) {
            return Ok(self.advance());
        }
        let token = self.peek();
        Err(AtmarkError::syntax(
            token.span.clone(),
            format!("{}, found '{}'", message, self.describe(token)),
        ))
    }

    fn consume_with_help(
        &mut self,
        token_type: TokenType,
        message: &str,
        help: String,
    ) -> Result<&Token, AtmarkError> {
        if self.check(&token_type) {
            return Ok(self.advance());
        }
        let token = self.peek();
        Err(AtmarkError::syntax_with_help(
            token.span.clone(),
            format!("{}, found '{}'", message, self.describe(token)),
            help,
        ))
    }

    fn describe(&self, token: &Token) -> String {
        if token.token_type == TokenType::Eof {
            "end of input".to_string()
        } else {
            token.lexeme.clone()
        }
    }
}
