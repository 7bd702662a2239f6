//! REM-SQL: the extended dialect with LOOKUP, SEARCH, TRAVERSE and SELECT.
//!
//! The grammar has no JOINs; relationships are expressed with TRAVERSE.
//!
//! ```text
//! statement := lookup | search | traverse | select
//! lookup    := LOOKUP string ("," string)*
//! search    := SEARCH string IN ident [WHERE pred] [LIMIT num]
//! traverse  := TRAVERSE FROM string DEPTH num DIRECTION (in|out|both)
//!              [TYPE string]
//! select    := SELECT ("*" | ident ("," ident)*) FROM ident
//!              [WHERE pred] [ORDER BY ident [ASC|DESC]]
//!              [LIMIT num] [OFFSET num]
//! pred      := and_expr (OR and_expr)*
//! and_expr  := unary (AND unary)*
//! unary     := NOT unary | "(" pred ")" | comparison
//! comparison:= ident op literal
//!            | ident IN "(" literal ("," literal)* ")"
//!            | ident CONTAINS string
//! op        := "=" | "!=" | "<>" | ">" | ">=" | "<" | "<="
//! literal   := string | number | TRUE | FALSE | NULL
//! ```
//!
//! `Statement`'s `Display` renders the canonical form, and
//! `parse(statement.to_string())` reproduces the same AST; the planner and
//! builder rely on that round trip.

use std::fmt;

use serde_json::Value;

use crate::entity::Direction;
use crate::error::{QueryError, Result};
use crate::query::predicate::{Order, Predicate};

/// Field projection of a SELECT.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectFields {
    /// `SELECT *`
    All,
    /// An explicit field list.
    Some(Vec<String>),
}

/// A parsed REM-SQL statement.
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    /// `LOOKUP 'k1', 'k2'` — key lookups across all schemas.
    Lookup {
        /// The keys to resolve.
        keys: Vec<String>,
    },
    /// `SEARCH 'text' IN schema [WHERE ...] [LIMIT n]`.
    Search {
        /// Query text to embed.
        text: String,
        /// Schema whose vector index is searched.
        schema: String,
        /// Post-ANN filter.
        predicate: Option<Predicate>,
        /// Result budget.
        limit: Option<usize>,
    },
    /// `TRAVERSE FROM 'start' DEPTH n DIRECTION d [TYPE 'rel']`.
    Traverse {
        /// Start key: an entity id or a derived key.
        start: String,
        /// Maximum hops from the start.
        depth: usize,
        /// Edge direction filter.
        direction: Direction,
        /// Optional relationship type filter.
        rel_type: Option<String>,
    },
    /// `SELECT fields FROM schema [WHERE ...] [ORDER BY ...] [LIMIT n]
    /// [OFFSET n]`.
    Select {
        /// Projection.
        fields: SelectFields,
        /// Schema to scan.
        schema: String,
        /// Row filter.
        predicate: Option<Predicate>,
        /// Sort key and direction.
        order_by: Option<(String, Order)>,
        /// Result budget.
        limit: Option<usize>,
        /// Rows to skip.
        offset: Option<usize>,
    },
}

impl Statement {
    /// Parses a REM-SQL statement.
    pub fn parse(input: &str) -> Result<Statement> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let statement = parser.statement()?;
        parser.expect_eof()?;
        Ok(statement)
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(Value),
    Symbol(&'static str),
}

struct Spanned {
    token: Token,
    position: usize,
}

fn lex(input: &str) -> Result<Vec<Spanned>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '\'' => {
                let start = i;
                i += 1;
                let mut raw: Vec<u8> = Vec::new();
                loop {
                    match bytes.get(i) {
                        Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => {
                            raw.push(b'\'');
                            i += 2;
                        }
                        Some(b'\'') => {
                            i += 1;
                            break;
                        }
                        Some(&b) => {
                            raw.push(b);
                            i += 1;
                        }
                        None => {
                            return Err(QueryError::parse(start, "unterminated string").into())
                        }
                    }
                }
                let value = String::from_utf8(raw)
                    .map_err(|_| QueryError::parse(start, "string is not valid UTF-8"))?;
                tokens.push(Spanned {
                    token: Token::Str(value),
                    position: start,
                });
            }
            '(' => {
                tokens.push(Spanned { token: Token::Symbol("("), position: i });
                i += 1;
            }
            ')' => {
                tokens.push(Spanned { token: Token::Symbol(")"), position: i });
                i += 1;
            }
            ',' => {
                tokens.push(Spanned { token: Token::Symbol(","), position: i });
                i += 1;
            }
            '*' => {
                tokens.push(Spanned { token: Token::Symbol("*"), position: i });
                i += 1;
            }
            '=' => {
                tokens.push(Spanned { token: Token::Symbol("="), position: i });
                i += 1;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Spanned { token: Token::Symbol("!="), position: i });
                i += 2;
            }
            '<' if bytes.get(i + 1) == Some(&b'>') => {
                tokens.push(Spanned { token: Token::Symbol("!="), position: i });
                i += 2;
            }
            '<' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Spanned { token: Token::Symbol("<="), position: i });
                i += 2;
            }
            '<' => {
                tokens.push(Spanned { token: Token::Symbol("<"), position: i });
                i += 1;
            }
            '>' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Spanned { token: Token::Symbol(">="), position: i });
                i += 2;
            }
            '>' => {
                tokens.push(Spanned { token: Token::Symbol(">"), position: i });
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let literal = &input[start..i];
                let number = if literal.contains('.') {
                    literal
                        .parse::<f64>()
                        .ok()
                        .and_then(|f| serde_json::Number::from_f64(f))
                        .map(Value::Number)
                } else {
                    literal.parse::<i64>().ok().map(Value::from)
                };
                let number = number
                    .ok_or_else(|| QueryError::parse(start, format!("bad number '{}'", literal)))?;
                tokens.push(Spanned {
                    token: Token::Number(number),
                    position: start,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'.')
                {
                    i += 1;
                }
                tokens.push(Spanned {
                    token: Token::Ident(input[start..i].to_string()),
                    position: start,
                });
            }
            other => {
                return Err(QueryError::parse(i, format!("unexpected character '{}'", other)).into())
            }
        }
    }

    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn statement(&mut self) -> Result<Statement> {
        let keyword = self.keyword()?;
        match keyword.as_str() {
            "LOOKUP" => self.lookup(),
            "SEARCH" => self.search(),
            "TRAVERSE" => self.traverse(),
            "SELECT" => self.select(),
            other => Err(QueryError::parse(
                self.previous_position(),
                format!("expected LOOKUP, SEARCH, TRAVERSE or SELECT, found '{}'", other),
            )
            .into()),
        }
    }

    fn lookup(&mut self) -> Result<Statement> {
        let mut keys = vec![self.string()?];
        while self.eat_symbol(",") {
            keys.push(self.string()?);
        }
        Ok(Statement::Lookup { keys })
    }

    fn search(&mut self) -> Result<Statement> {
        let text = self.string()?;
        self.expect_keyword("IN")?;
        let schema = self.ident()?;
        let predicate = if self.eat_keyword("WHERE") {
            Some(self.predicate()?)
        } else {
            None
        };
        let limit = if self.eat_keyword("LIMIT") {
            Some(self.usize_literal()?)
        } else {
            None
        };
        Ok(Statement::Search {
            text,
            schema,
            predicate,
            limit,
        })
    }

    fn traverse(&mut self) -> Result<Statement> {
        self.expect_keyword("FROM")?;
        let start = self.string_or_ident()?;
        self.expect_keyword("DEPTH")?;
        let depth = self.usize_literal()?;
        self.expect_keyword("DIRECTION")?;
        let direction_word = self.ident()?;
        let direction = Direction::parse(&direction_word).ok_or_else(|| {
            QueryError::parse(
                self.previous_position(),
                format!("direction must be in, out or both, found '{}'", direction_word),
            )
        })?;
        let rel_type = if self.eat_keyword("TYPE") {
            Some(self.string()?)
        } else {
            None
        };
        Ok(Statement::Traverse {
            start,
            depth,
            direction,
            rel_type,
        })
    }

    fn select(&mut self) -> Result<Statement> {
        let fields = if self.eat_symbol("*") {
            SelectFields::All
        } else {
            let mut fields = vec![self.ident()?];
            while self.eat_symbol(",") {
                fields.push(self.ident()?);
            }
            SelectFields::Some(fields)
        };
        self.expect_keyword("FROM")?;
        let schema = self.ident()?;

        let predicate = if self.eat_keyword("WHERE") {
            Some(self.predicate()?)
        } else {
            None
        };

        let order_by = if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            let field = self.ident()?;
            let order = if self.eat_keyword("DESC") {
                Order::Desc
            } else {
                // ASC is the default and may be omitted
                self.eat_keyword("ASC");
                Order::Asc
            };
            Some((field, order))
        } else {
            None
        };

        let limit = if self.eat_keyword("LIMIT") {
            Some(self.usize_literal()?)
        } else {
            None
        };
        let offset = if self.eat_keyword("OFFSET") {
            Some(self.usize_literal()?)
        } else {
            None
        };

        Ok(Statement::Select {
            fields,
            schema,
            predicate,
            order_by,
            limit,
            offset,
        })
    }

    // ---- predicates ----

    fn predicate(&mut self) -> Result<Predicate> {
        let mut terms = vec![self.and_expr()?];
        while self.eat_keyword("OR") {
            terms.push(self.and_expr()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Predicate::Or(terms)
        })
    }

    fn and_expr(&mut self) -> Result<Predicate> {
        let mut terms = vec![self.unary()?];
        while self.eat_keyword("AND") {
            terms.push(self.unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Predicate::And(terms)
        })
    }

    fn unary(&mut self) -> Result<Predicate> {
        if self.eat_keyword("NOT") {
            return Ok(Predicate::Not(Box::new(self.unary()?)));
        }
        if self.eat_symbol("(") {
            let inner = self.predicate()?;
            self.expect_symbol(")")?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Predicate> {
        let field = self.ident()?;

        if self.eat_keyword("IN") {
            self.expect_symbol("(")?;
            let mut values = vec![self.literal()?];
            while self.eat_symbol(",") {
                values.push(self.literal()?);
            }
            self.expect_symbol(")")?;
            return Ok(Predicate::In(field, values));
        }
        if self.eat_keyword("CONTAINS") {
            let needle = self.string()?;
            return Ok(Predicate::Contains(field, needle));
        }

        let position = self.position();
        let op = match self.next()? {
            Token::Symbol(op) => *op,
            other => {
                return Err(QueryError::parse(
                    position,
                    format!("expected comparison operator, found {:?}", other),
                )
                .into())
            }
        };
        let value = self.literal()?;
        Ok(match op {
            "=" => Predicate::Eq(field, value),
            "!=" => Predicate::Ne(field, value),
            ">" => Predicate::Gt(field, value),
            ">=" => Predicate::Gte(field, value),
            "<" => Predicate::Lt(field, value),
            "<=" => Predicate::Lte(field, value),
            other => {
                return Err(
                    QueryError::parse(position, format!("unsupported operator '{}'", other)).into(),
                )
            }
        })
    }

    fn literal(&mut self) -> Result<Value> {
        let position = self.position();
        match self.next()? {
            Token::Str(s) => Ok(Value::String(s.clone())),
            Token::Number(n) => Ok(n.clone()),
            Token::Ident(word) => match word.to_ascii_uppercase().as_str() {
                "TRUE" => Ok(Value::Bool(true)),
                "FALSE" => Ok(Value::Bool(false)),
                "NULL" => Ok(Value::Null),
                other => {
                    Err(QueryError::parse(position, format!("unexpected literal '{}'", other))
                        .into())
                }
            },
            other => {
                Err(QueryError::parse(position, format!("expected literal, found {:?}", other))
                    .into())
            }
        }
    }

    // ---- token helpers ----

    fn next(&mut self) -> Result<&Token> {
        let spanned = self.tokens.get(self.pos).ok_or_else(|| {
            QueryError::parse(usize::MAX, "unexpected end of input".to_string())
        })?;
        self.pos += 1;
        Ok(&spanned.token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|s| s.position).unwrap_or(0)
    }

    fn previous_position(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map(|s| s.position)
            .unwrap_or(0)
    }

    fn keyword(&mut self) -> Result<String> {
        let position = self.position();
        match self.next()? {
            Token::Ident(word) => Ok(word.to_ascii_uppercase()),
            other => {
                Err(QueryError::parse(position, format!("expected keyword, found {:?}", other))
                    .into())
            }
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        let position = self.position();
        let word = self.keyword()?;
        if word == keyword {
            Ok(())
        } else {
            Err(QueryError::parse(position, format!("expected {}, found '{}'", keyword, word))
                .into())
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if let Some(Spanned {
            token: Token::Ident(word),
            ..
        }) = self.tokens.get(self.pos)
        {
            if word.eq_ignore_ascii_case(keyword) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if let Some(Spanned {
            token: Token::Symbol(s),
            ..
        }) = self.tokens.get(self.pos)
        {
            if *s == symbol {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_symbol(&mut self, symbol: &'static str) -> Result<()> {
        let position = self.position();
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(QueryError::parse(position, format!("expected '{}'", symbol)).into())
        }
    }

    fn ident(&mut self) -> Result<String> {
        let position = self.position();
        match self.next()? {
            Token::Ident(word) => Ok(word.clone()),
            other => Err(QueryError::parse(
                position,
                format!("expected identifier, found {:?}", other),
            )
            .into()),
        }
    }

    fn string(&mut self) -> Result<String> {
        let position = self.position();
        match self.next()? {
            Token::Str(s) => Ok(s.clone()),
            other => {
                Err(QueryError::parse(position, format!("expected string, found {:?}", other))
                    .into())
            }
        }
    }

    fn string_or_ident(&mut self) -> Result<String> {
        let position = self.position();
        match self.next()? {
            Token::Str(s) => Ok(s.clone()),
            Token::Ident(word) => Ok(word.clone()),
            other => Err(QueryError::parse(
                position,
                format!("expected string or identifier, found {:?}", other),
            )
            .into()),
        }
    }

    fn usize_literal(&mut self) -> Result<usize> {
        let position = self.position();
        match self.next()? {
            Token::Number(n) => n
                .as_u64()
                .map(|v| v as usize)
                .ok_or_else(|| {
                    QueryError::parse(position, "expected a non-negative integer".to_string())
                        .into()
                }),
            other => {
                Err(QueryError::parse(position, format!("expected number, found {:?}", other))
                    .into())
            }
        }
    }

    fn expect_eof(&mut self) -> Result<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(QueryError::parse(
                self.position(),
                "unexpected trailing input".to_string(),
            )
            .into())
        }
    }
}

// ============================================================================
// Canonical rendering
// ============================================================================

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Lookup { keys } => {
                let rendered: Vec<String> = keys.iter().map(|k| quote(k)).collect();
                write!(f, "LOOKUP {}", rendered.join(", "))
            }
            Statement::Search {
                text,
                schema,
                predicate,
                limit,
            } => {
                write!(f, "SEARCH {} IN {}", quote(text), schema)?;
                if let Some(predicate) = predicate {
                    write!(f, " WHERE {}", predicate)?;
                }
                if let Some(limit) = limit {
                    write!(f, " LIMIT {}", limit)?;
                }
                Ok(())
            }
            Statement::Traverse {
                start,
                depth,
                direction,
                rel_type,
            } => {
                write!(
                    f,
                    "TRAVERSE FROM {} DEPTH {} DIRECTION {}",
                    quote(start),
                    depth,
                    direction
                )?;
                if let Some(rel_type) = rel_type {
                    write!(f, " TYPE {}", quote(rel_type))?;
                }
                Ok(())
            }
            Statement::Select {
                fields,
                schema,
                predicate,
                order_by,
                limit,
                offset,
            } => {
                let projection = match fields {
                    SelectFields::All => "*".to_string(),
                    SelectFields::Some(fields) => fields.join(", "),
                };
                write!(f, "SELECT {} FROM {}", projection, schema)?;
                if let Some(predicate) = predicate {
                    write!(f, " WHERE {}", predicate)?;
                }
                if let Some((field, order)) = order_by {
                    write!(f, " ORDER BY {} {}", field, order.as_str())?;
                }
                if let Some(limit) = limit {
                    write!(f, " LIMIT {}", limit)?;
                }
                if let Some(offset) = offset {
                    write!(f, " OFFSET {}", offset)?;
                }
                Ok(())
            }
        }
    }
}
