//! Expression grammar.
//!
//! Precedence, loosest first:
//!
//! | Level    | Operators                      |
//! |----------|--------------------------------|
//! | or       | `or`                           |
//! | and      | `and`                          |
//! | not      | `not`                          |
//! | compare  | `== != < <= > >= in`, `not in` |
//! | math1    | `+ -`                          |
//! | concat   | `~`                            |
//! | math2    | `* / // %`                     |
//! | pow      | `**`                           |
//! | unary    | `-x +x`, then postfix, filters |

use crate::ast::{BinOp, Expr, ExprNode, Keyword, Literal, UnaryOp};
use crate::parser::Parser;
use crate::syntax::TokenKind;
use crate::TemplateError;

type ExprResult = Result<ExprNode, TemplateError>;

fn binary(op: BinOp, left: ExprNode, right: ExprNode) -> ExprNode {
    let line = left.line;
    ExprNode::new(
        Expr::Binary {
            op,
            left: left.boxed(),
            right: right.boxed(),
        },
        line,
    )
}

impl Parser<'_> {
    /// Parses a full expression.
    pub fn parse_expression(&mut self) -> ExprResult {
        self.parse_or()
    }

    fn parse_or(&mut self) -> ExprResult {
        let mut left = self.parse_and()?;
        while self.stream().skip_if("name:or")? {
            let right = self.parse_and()?;
            left = binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ExprResult {
        let mut left = self.parse_not()?;
        while self.stream().skip_if("name:and")? {
            let right = self.parse_not()?;
            left = binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ExprResult {
        if let Some(token) = self.stream().next_if("name:not")? {
            let operand = self.parse_not()?;
            return Ok(ExprNode::new(
                Expr::Unary {
                    op: UnaryOp::Not,
                    operand: operand.boxed(),
                },
                token.line,
            ));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> ExprResult {
        let mut left = self.parse_math1()?;
        loop {
            let current = self.stream().current().clone();
            let op = match current.kind {
                TokenKind::Eq => BinOp::Eq,
                TokenKind::Ne => BinOp::Ne,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::LtEq => BinOp::LtEq,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::GtEq => BinOp::GtEq,
                _ if current.is_name("in") => BinOp::In,
                _ if current.is_name("not") && self.stream().look()?.is_name("in") => {
                    self.stream().next_token()?;
                    BinOp::NotIn
                }
                _ => break,
            };
            self.stream().next_token()?;
            let right = self.parse_math1()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_math1(&mut self) -> ExprResult {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.stream().current().kind {
                TokenKind::Add => BinOp::Add,
                TokenKind::Sub => BinOp::Sub,
                _ => break,
            };
            self.stream().next_token()?;
            let right = self.parse_concat()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> ExprResult {
        let mut left = self.parse_math2()?;
        while self.stream().skip_if("tilde")? {
            let right = self.parse_math2()?;
            left = binary(BinOp::Concat, left, right);
        }
        Ok(left)
    }

    fn parse_math2(&mut self) -> ExprResult {
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.stream().current().kind {
                TokenKind::Mul => BinOp::Mul,
                TokenKind::Div => BinOp::Div,
                TokenKind::FloorDiv => BinOp::FloorDiv,
                TokenKind::Mod => BinOp::Mod,
                _ => break,
            };
            self.stream().next_token()?;
            let right = self.parse_pow()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_pow(&mut self) -> ExprResult {
        let mut left = self.parse_unary()?;
        while self.stream().skip_if("pow")? {
            let right = self.parse_unary()?;
            left = binary(BinOp::Pow, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ExprResult {
        let token = self.stream().current().clone();
        let op = match token.kind {
            TokenKind::Sub => Some(UnaryOp::Neg),
            TokenKind::Add => Some(UnaryOp::Pos),
            _ => None,
        };
        let node = match op {
            Some(op) => {
                self.stream().next_token()?;
                let operand = self.parse_unary()?;
                ExprNode::new(
                    Expr::Unary {
                        op,
                        operand: operand.boxed(),
                    },
                    token.line,
                )
            }
            None => {
                let primary = self.parse_primary()?;
                self.parse_postfix(primary)?
            }
        };
        self.parse_filters(node)
    }

    fn parse_primary(&mut self) -> ExprResult {
        let token = self.stream().next_token()?;
        let line = token.line;
        let expr = match token.kind {
            TokenKind::Name => match token.value_str() {
                "true" | "True" => Expr::Literal(Literal::Bool(true)),
                "false" | "False" => Expr::Literal(Literal::Bool(false)),
                "none" | "None" => Expr::Literal(Literal::None),
                name => Expr::Name(name.to_string()),
            },
            TokenKind::String => {
                let mut value = token.value.unwrap_or_default();
                while self.stream().current().kind == TokenKind::String {
                    value.push_str(self.stream().next_token()?.value_str());
                }
                Expr::Literal(Literal::Str(value))
            }
            TokenKind::Integer | TokenKind::Float => {
                let number = token.value_str().parse::<f64>().map_err(|_| {
                    self.fail(format!("invalid number literal '{}'", token.value_str()), line)
                })?;
                Expr::Literal(Literal::Number(number))
            }
            TokenKind::LParen => {
                let inner = self.parse_expression()?;
                self.stream().expect("rparen")?;
                return Ok(inner);
            }
            TokenKind::LBracket => Expr::List(self.parse_list_items()?),
            TokenKind::LBrace => Expr::Map(self.parse_map_items()?),
            TokenKind::Eof => {
                return Err(self.fail("unexpected end of template, expected an expression", line))
            }
            _ => return Err(self.fail(format!("unexpected {}", token.describe()), line)),
        };
        Ok(ExprNode::new(expr, line))
    }

    fn parse_list_items(&mut self) -> Result<Vec<ExprNode>, TemplateError> {
        let mut items = Vec::new();
        while self.stream().current().kind != TokenKind::RBracket {
            if !items.is_empty() {
                self.stream().expect("comma")?;
                if self.stream().current().kind == TokenKind::RBracket {
                    break;
                }
            }
            items.push(self.parse_expression()?);
        }
        self.stream().expect("rbracket")?;
        Ok(items)
    }

    fn parse_map_items(&mut self) -> Result<Vec<(ExprNode, ExprNode)>, TemplateError> {
        let mut items = Vec::new();
        while self.stream().current().kind != TokenKind::RBrace {
            if !items.is_empty() {
                self.stream().expect("comma")?;
                if self.stream().current().kind == TokenKind::RBrace {
                    break;
                }
            }
            let key = self.parse_expression()?;
            self.stream().expect("colon")?;
            let value = self.parse_expression()?;
            items.push((key, value));
        }
        self.stream().expect("rbrace")?;
        Ok(items)
    }

    fn parse_postfix(&mut self, mut node: ExprNode) -> ExprResult {
        loop {
            let token = self.stream().current().clone();
            node = match token.kind {
                TokenKind::Dot => {
                    self.stream().next_token()?;
                    let attr = self.stream().current().clone();
                    match attr.kind {
                        TokenKind::Name => {
                            self.stream().next_token()?;
                            ExprNode::new(
                                Expr::GetAttr {
                                    target: node.boxed(),
                                    attr: attr.value.unwrap_or_default(),
                                },
                                token.line,
                            )
                        }
                        TokenKind::Integer => {
                            self.stream().next_token()?;
                            let index = attr.value_str().parse::<f64>().unwrap_or_default();
                            ExprNode::new(
                                Expr::GetItem {
                                    target: node.boxed(),
                                    index: ExprNode::new(
                                        Expr::Literal(Literal::Number(index)),
                                        attr.line,
                                    )
                                    .boxed(),
                                },
                                token.line,
                            )
                        }
                        _ => {
                            return Err(self.fail(
                                format!("expected name after '.', got {}", attr.describe()),
                                attr.line,
                            ))
                        }
                    }
                }
                TokenKind::LBracket => {
                    self.stream().next_token()?;
                    let index = self.parse_expression()?;
                    self.stream().expect("rbracket")?;
                    ExprNode::new(
                        Expr::GetItem {
                            target: node.boxed(),
                            index: index.boxed(),
                        },
                        token.line,
                    )
                }
                TokenKind::LParen => {
                    self.stream().next_token()?;
                    let (args, kwargs) = self.parse_call_args()?;
                    let line = node.line;
                    ExprNode::new(
                        Expr::Call {
                            func: node.boxed(),
                            args,
                            kwargs,
                        },
                        line,
                    )
                }
                _ => return Ok(node),
            };
        }
    }

    fn parse_filters(&mut self, mut node: ExprNode) -> ExprResult {
        while let Some(pipe) = self.stream().next_if("pipe")? {
            let name = self.stream().expect("name")?;
            let args = if self.stream().skip_if("lparen")? {
                let (args, kwargs) = self.parse_call_args()?;
                if let Some(keyword) = kwargs.first() {
                    return Err(self.fail(
                        format!("filter '{}' does not take keyword arguments", name.value_str()),
                        keyword.value.line,
                    ));
                }
                args
            } else {
                Vec::new()
            };
            node = ExprNode::new(
                Expr::Filter {
                    target: node.boxed(),
                    name: name.value.unwrap_or_default(),
                    args,
                },
                pipe.line,
            );
        }
        Ok(node)
    }

    /// Parses call arguments after the opening parenthesis, through the
    /// closing one.
    pub fn parse_call_args(&mut self) -> Result<(Vec<ExprNode>, Vec<Keyword>), TemplateError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<Keyword> = Vec::new();
        while self.stream().current().kind != TokenKind::RParen {
            if !args.is_empty() || !kwargs.is_empty() {
                self.stream().expect("comma")?;
                if self.stream().current().kind == TokenKind::RParen {
                    break;
                }
            }
            let is_keyword = self.stream().current().kind == TokenKind::Name
                && self.stream().look()?.kind == TokenKind::Assign;
            if is_keyword {
                let name = self.stream().next_token()?;
                self.stream().next_token()?;
                let value = self.parse_expression()?;
                kwargs.push(Keyword {
                    name: name.value.unwrap_or_default(),
                    value,
                });
            } else {
                let line = self.stream().current().line;
                if !kwargs.is_empty() {
                    return Err(self.fail("positional argument follows keyword argument", line));
                }
                args.push(self.parse_expression()?);
            }
        }
        self.stream().expect("rparen")?;
        Ok((args, kwargs))
    }
}
