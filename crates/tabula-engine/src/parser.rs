//! Formula text -> postfix token stream.
//!
//! The parser builds a small expression tree and flattens it to the
//! binary token layout, including the control-flow lowering the VM
//! depends on: `IF` and `CHOOSE` become attribute tokens with byte-
//! distance jumps, a one-argument `SUM` becomes the sum-shorthand
//! attribute, and parenthesized unions get a leading `MemFunc` region
//! marker.

use thiserror::Error;

use tabula_model::{name_to_col, ErrorValue};

use crate::functions::{self, idx};
use crate::token::{
    AreaToken, ArrayElement, ArrayLiteral, Attr, RefToken, SkipKind, Token,
    FUNCTION_INDEX_EXTERNAL,
};
use crate::workbook::ParsingWorkbook;

/// What kind of surface a formula was parsed for. The evaluation
/// boundary consults [`is_single_value`](FormulaType::is_single_value)
/// to decide whether the final value is dereferenced to one scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaType {
    Cell,
    ArrayFormula,
    DataValidationList,
    NamedRange,
}

impl FormulaType {
    pub fn is_single_value(self) -> bool {
        matches!(self, FormulaType::Cell)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    #[error("unexpected {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of formula")]
    UnexpectedEof,
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("name {0:?} is not defined")]
    UnknownName(String),
    #[error("sheet {0:?} is not defined")]
    UnknownSheet(String),
    #[error("wrong number of arguments to {name}: {got}")]
    BadArgCount { name: String, got: usize },
    #[error("reference {0} is outside this spreadsheet version's limits")]
    RefOutOfBounds(String),
    #[error("array constants are not allowed in data-validation formulas")]
    ArrayConstantNotAllowed,
    #[error("malformed array constant")]
    BadArrayConstant,
    #[error("formula too long to encode")]
    TooLong,
}

/// Parse `formula` (with an optional leading `=`) against `workbook`.
///
/// `sheet_ix` is the sheet the formula belongs to (`-1` for workbook
/// scope); it scopes defined-name lookups.
pub fn parse(
    formula: &str,
    workbook: &dyn ParsingWorkbook,
    formula_type: FormulaType,
    sheet_ix: i32,
) -> Result<Vec<Token>, ParseError> {
    let lexed = Lexer::new(formula).tokenize()?;
    let mut parser = Parser {
        tokens: lexed,
        pos: 0,
        workbook,
        formula_type,
        sheet_ix,
    };
    let root = parser.parse_compare()?;
    parser.expect_end()?;

    let mut collector = TokenCollector::default();
    root.collect_into(&mut collector)?;
    Ok(collector.out)
}

// ---- lexer ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Lex {
    Num(f64),
    Str(String),
    Ident(String),
    QuotedSheet(String),
    ErrLit(ErrorValue),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Colon,
    Bang,
    Percent,
    Caret,
    Star,
    Slash,
    Plus,
    Minus,
    Amp,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    End,
}

impl Lex {
    fn describe(&self) -> String {
        match self {
            Lex::Num(n) => format!("number {n}"),
            Lex::Str(_) => "string literal".to_string(),
            Lex::Ident(s) => format!("identifier {s:?}"),
            Lex::QuotedSheet(s) => format!("sheet name {s:?}"),
            Lex::ErrLit(e) => format!("error literal {e}"),
            Lex::End => "end of formula".to_string(),
            other => format!("{other:?}"),
        }
    }
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        let mut pos = 0;
        while let Some(ch) = input[pos..].chars().next() {
            if ch.is_whitespace() {
                pos += ch.len_utf8();
            } else {
                break;
            }
        }
        if input[pos..].starts_with('=') {
            pos += 1;
        }
        Self { input, pos }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn tokenize(mut self) -> Result<Vec<Lex>, ParseError> {
        let mut out = Vec::new();
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.pos += ch.len_utf8();
                continue;
            }
            let token = match ch {
                '(' => self.one(Lex::LParen),
                ')' => self.one(Lex::RParen),
                '{' => self.one(Lex::LBrace),
                '}' => self.one(Lex::RBrace),
                ',' => self.one(Lex::Comma),
                ';' => self.one(Lex::Semi),
                ':' => self.one(Lex::Colon),
                '!' => self.one(Lex::Bang),
                '%' => self.one(Lex::Percent),
                '^' => self.one(Lex::Caret),
                '*' => self.one(Lex::Star),
                '/' => self.one(Lex::Slash),
                '+' => self.one(Lex::Plus),
                '-' => self.one(Lex::Minus),
                '&' => self.one(Lex::Amp),
                '=' => self.one(Lex::Eq),
                '<' => {
                    if self.input[self.pos..].starts_with("<=") {
                        self.pos += 2;
                        Lex::Le
                    } else if self.input[self.pos..].starts_with("<>") {
                        self.pos += 2;
                        Lex::Ne
                    } else {
                        self.one(Lex::Lt)
                    }
                }
                '>' => {
                    if self.input[self.pos..].starts_with(">=") {
                        self.pos += 2;
                        Lex::Ge
                    } else {
                        self.one(Lex::Gt)
                    }
                }
                '"' => self.lex_string()?,
                '\'' => self.lex_quoted_sheet()?,
                '#' => self.lex_error_literal()?,
                '0'..='9' => self.lex_number()?,
                '.' => {
                    let next_is_digit = self.input[self.pos + 1..]
                        .chars()
                        .next()
                        .is_some_and(|c| c.is_ascii_digit());
                    if next_is_digit {
                        self.lex_number()?
                    } else {
                        return Err(ParseError::UnexpectedChar('.'));
                    }
                }
                _ if is_ident_start(ch) => self.lex_ident(),
                other => return Err(ParseError::UnexpectedChar(other)),
            };
            out.push(token);
        }
        out.push(Lex::End);
        Ok(out)
    }

    fn one(&mut self, token: Lex) -> Lex {
        self.pos += 1;
        token
    }

    fn lex_number(&mut self) -> Result<Lex, ParseError> {
        let start = self.pos;
        let mut saw_dot = false;
        while let Some(ch) = self.peek_char() {
            match ch {
                '0'..='9' => self.pos += 1,
                '.' if !saw_dot => {
                    saw_dot = true;
                    self.pos += 1;
                }
                'E' | 'e' => {
                    self.pos += 1;
                    if matches!(self.peek_char(), Some('+') | Some('-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let raw = &self.input[start..self.pos];
        raw.parse::<f64>()
            .map(Lex::Num)
            .map_err(|_| ParseError::UnexpectedToken(format!("number literal {raw:?}")))
    }

    fn lex_string(&mut self) -> Result<Lex, ParseError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.peek_char() {
                Some('"') => {
                    if self.input[self.pos..].starts_with("\"\"") {
                        out.push('"');
                        self.pos += 2;
                        continue;
                    }
                    self.pos += 1;
                    break;
                }
                Some(ch) => {
                    out.push(ch);
                    self.pos += ch.len_utf8();
                }
                None => return Err(ParseError::UnexpectedEof),
            }
        }
        Ok(Lex::Str(out))
    }

    fn lex_quoted_sheet(&mut self) -> Result<Lex, ParseError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.peek_char() {
                Some('\'') => {
                    if self.input[self.pos..].starts_with("''") {
                        out.push('\'');
                        self.pos += 2;
                        continue;
                    }
                    self.pos += 1;
                    break;
                }
                Some(ch) => {
                    out.push(ch);
                    self.pos += ch.len_utf8();
                }
                None => return Err(ParseError::UnexpectedEof),
            }
        }
        Ok(Lex::QuotedSheet(out))
    }

    fn lex_error_literal(&mut self) -> Result<Lex, ParseError> {
        let start = self.pos;
        self.pos += 1; // '#'
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '/' | '.') {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
        if matches!(self.peek_char(), Some('!' | '?')) {
            self.pos += 1;
        }
        let raw = &self.input[start..self.pos];
        match ErrorValue::from_code(raw) {
            Some(e) => Ok(Lex::ErrLit(e)),
            None => Err(ParseError::UnexpectedToken(format!(
                "error literal {raw:?}"
            ))),
        }
    }

    /// Identifiers cover names, function names and A1 references; an
    /// external workbook prefix (`[Book2]Sheet1`) is consumed as part of
    /// the identifier.
    fn lex_ident(&mut self) -> Lex {
        let start = self.pos;
        if self.peek_char() == Some('[') {
            while let Some(ch) = self.peek_char() {
                self.pos += ch.len_utf8();
                if ch == ']' {
                    break;
                }
            }
        }
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '$') {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
        Lex::Ident(self.input[start..self.pos].to_string())
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || matches!(ch, '_' | '$' | '[')
}

// ---- expression tree ---------------------------------------------------

/// One node of the parsed expression: the output token plus its operand
/// subtrees, flattened to postfix at the end.
struct ParseNode {
    token: Token,
    children: Vec<ParseNode>,
}

impl ParseNode {
    fn leaf(token: Token) -> Self {
        Self {
            token,
            children: Vec::new(),
        }
    }

    fn unary(token: Token, operand: ParseNode) -> Self {
        Self {
            token,
            children: vec![operand],
        }
    }

    fn binary(token: Token, left: ParseNode, right: ParseNode) -> Self {
        Self {
            token,
            children: vec![left, right],
        }
    }

    fn collect_into(&self, c: &mut TokenCollector) -> Result<(), ParseError> {
        match &self.token {
            Token::FuncVar { func_ix, .. } if *func_ix == idx::IF => self.collect_if(c),
            Token::FuncVar { func_ix, .. } if *func_ix == idx::CHOOSE => self.collect_choose(c),
            Token::FuncVar { func_ix, arity: 1 } if *func_ix == idx::SUM => {
                // Single-argument SUM is encoded as the sum-shorthand
                // attribute.
                self.children[0].collect_into(c)?;
                c.add(Token::Attr(Attr::Sum));
                Ok(())
            }
            Token::MemFunc { .. } => {
                // Prefix region marker: token first, length patched once
                // the operand bytes are known.
                let placeholder = c.create_placeholder();
                for child in &self.children {
                    child.collect_into(c)?;
                }
                let len = to_u16(c.sum_token_sizes(placeholder + 1, c.len()))?;
                c.set_placeholder(placeholder, Token::MemFunc { len });
                Ok(())
            }
            token => {
                for child in &self.children {
                    child.collect_into(c)?;
                }
                c.add(token.clone());
                Ok(())
            }
        }
    }

    /// `IF` layout: predicate, `tAttrIf`, true branch, `tAttrSkip`
    /// [, false branch, `tAttrSkip`], `tFuncVar(IF)`.
    ///
    /// The `tAttrIf` distance points at the token after the first skip
    /// attribute; each skip attribute's encoded distance is one less
    /// than the bytes it jumps.
    fn collect_if(&self, c: &mut TokenCollector) -> Result<(), ParseError> {
        let n_args = self.children.len() as u8;
        self.children[0].collect_into(c)?;
        let if_attr = c.create_placeholder();
        self.children[1].collect_into(c)?;
        let skip_after_true = c.create_placeholder();
        let true_size = c.sum_token_sizes(if_attr + 1, skip_after_true);

        // Distance to the start of the false branch (or the call token):
        // the true branch plus the 4-byte skip attribute behind it.
        let attr_if = Attr::If {
            dist: to_u16(true_size + 4)?,
        };

        if n_args > 2 {
            self.children[2].collect_into(c)?;
            let skip_after_false = c.create_placeholder();
            let false_size = c.sum_token_sizes(skip_after_true + 1, skip_after_false);
            c.set_placeholder(
                skip_after_true,
                Token::Attr(Attr::Skip {
                    // One less than the bytes to the end of the call
                    // token: false branch + trailing skip + call.
                    dist: to_u16(false_size + 4 + 4 - 1)?,
                    kind: SkipKind::IfBranch,
                }),
            );
            c.set_placeholder(
                skip_after_false,
                Token::Attr(Attr::Skip {
                    dist: 4 - 1,
                    kind: SkipKind::IfBranch,
                }),
            );
        } else {
            c.set_placeholder(
                skip_after_true,
                Token::Attr(Attr::Skip {
                    dist: 4 - 1,
                    kind: SkipKind::IfBranch,
                }),
            );
        }
        c.set_placeholder(if_attr, Token::Attr(attr_if));
        c.add(Token::FuncVar {
            func_ix: idx::IF,
            arity: n_args,
        });
        Ok(())
    }

    /// `CHOOSE` layout: selector, `tAttrChoose` with jump table, then
    /// each choice followed by a skip attribute, then `tFuncVar(CHOOSE)`.
    /// Encoded distances include the jump-table bytes.
    fn collect_choose(&self, c: &mut TokenCollector) -> Result<(), ParseError> {
        let n_choices = self.children.len() - 1;
        self.children[0].collect_into(c)?;
        let attr_ix = c.create_placeholder();
        let base = attr_ix + 1;
        let table_bytes = 2 * (n_choices + 1);

        let mut choice_starts = Vec::with_capacity(n_choices);
        let mut skip_placeholders = Vec::with_capacity(n_choices);
        for choice in &self.children[1..] {
            choice_starts.push(c.len());
            choice.collect_into(c)?;
            skip_placeholders.push(c.create_placeholder());
        }

        // Patch the per-choice skips back to front: each jumps over the
        // remaining choices (with their skips) and the call token.
        let mut tail = 4usize;
        for k in (0..n_choices).rev() {
            c.set_placeholder(
                skip_placeholders[k],
                Token::Attr(Attr::Skip {
                    dist: to_u16(tail - 1)?,
                    kind: SkipKind::Choice,
                }),
            );
            tail += c.sum_token_sizes(choice_starts[k], skip_placeholders[k]) + 4;
        }

        let jump_table = choice_starts
            .iter()
            .map(|&start| to_u16(table_bytes + c.sum_token_sizes(base, start)))
            .collect::<Result<Vec<u16>, _>>()?;
        let choose_func_offset = to_u16(table_bytes + c.sum_token_sizes(base, c.len()))?;
        c.set_placeholder(
            attr_ix,
            Token::Attr(Attr::Choose {
                jump_table,
                choose_func_offset,
            }),
        );
        c.add(Token::FuncVar {
            func_ix: idx::CHOOSE,
            arity: (n_choices + 1) as u8,
        });
        Ok(())
    }
}

fn to_u16(value: usize) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::TooLong)
}

#[derive(Default)]
struct TokenCollector {
    out: Vec<Token>,
}

impl TokenCollector {
    fn add(&mut self, token: Token) {
        self.out.push(token);
    }

    fn len(&self) -> usize {
        self.out.len()
    }

    /// Reserve a slot for an attribute whose distances depend on tokens
    /// collected later.
    fn create_placeholder(&mut self) -> usize {
        self.out.push(Token::Unknown(0));
        self.out.len() - 1
    }

    fn set_placeholder(&mut self, index: usize, token: Token) {
        debug_assert!(matches!(self.out[index], Token::Unknown(_)));
        self.out[index] = token;
    }

    /// Byte size of `out[from..to]`. Only valid once every placeholder
    /// in the range has been patched.
    fn sum_token_sizes(&self, from: usize, to: usize) -> usize {
        self.out[from..to].iter().map(Token::size).sum()
    }
}

// ---- parser ------------------------------------------------------------

struct Parser<'a> {
    tokens: Vec<Lex>,
    pos: usize,
    workbook: &'a dyn ParsingWorkbook,
    formula_type: FormulaType,
    sheet_ix: i32,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Lex {
        self.tokens.get(self.pos).unwrap_or(&Lex::End)
    }

    fn peek_n(&self, n: usize) -> &Lex {
        self.tokens.get(self.pos + n).unwrap_or(&Lex::End)
    }

    fn next(&mut self) -> Lex {
        let token = self.tokens.get(self.pos).cloned().unwrap_or(Lex::End);
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Lex) -> Result<(), ParseError> {
        let got = self.next();
        if got == expected {
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken(got.describe()))
        }
    }

    fn expect_end(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            Lex::End => Ok(()),
            other => Err(ParseError::UnexpectedToken(other.describe())),
        }
    }

    fn parse_compare(&mut self) -> Result<ParseNode, ParseError> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.peek() {
                Lex::Eq => Token::Eq,
                Lex::Ne => Token::Ne,
                Lex::Lt => Token::Lt,
                Lex::Le => Token::Le,
                Lex::Gt => Token::Gt,
                Lex::Ge => Token::Ge,
                _ => break,
            };
            self.next();
            let right = self.parse_concat()?;
            left = ParseNode::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<ParseNode, ParseError> {
        let mut left = self.parse_add_sub()?;
        while matches!(self.peek(), Lex::Amp) {
            self.next();
            let right = self.parse_add_sub()?;
            left = ParseNode::binary(Token::Concat, left, right);
        }
        Ok(left)
    }

    fn parse_add_sub(&mut self) -> Result<ParseNode, ParseError> {
        let mut left = self.parse_mul_div()?;
        loop {
            let op = match self.peek() {
                Lex::Plus => Token::Add,
                Lex::Minus => Token::Sub,
                _ => break,
            };
            self.next();
            let right = self.parse_mul_div()?;
            left = ParseNode::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_mul_div(&mut self) -> Result<ParseNode, ParseError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Lex::Star => Token::Mul,
                Lex::Slash => Token::Div,
                _ => break,
            };
            self.next();
            let right = self.parse_power()?;
            left = ParseNode::binary(op, left, right);
        }
        Ok(left)
    }

    /// Exponentiation is right-associative; unary sign binds tighter
    /// (`-2^2` squares negative two).
    fn parse_power(&mut self) -> Result<ParseNode, ParseError> {
        let left = self.parse_unary()?;
        if matches!(self.peek(), Lex::Caret) {
            self.next();
            let right = self.parse_power()?;
            return Ok(ParseNode::binary(Token::Pow, left, right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<ParseNode, ParseError> {
        match self.peek() {
            Lex::Plus => {
                self.next();
                Ok(ParseNode::unary(Token::UnaryPlus, self.parse_unary()?))
            }
            Lex::Minus => {
                self.next();
                Ok(ParseNode::unary(Token::UnaryMinus, self.parse_unary()?))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<ParseNode, ParseError> {
        let mut node = self.parse_primary()?;
        while matches!(self.peek(), Lex::Percent) {
            self.next();
            node = ParseNode::unary(Token::Percent, node);
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<ParseNode, ParseError> {
        match self.next() {
            Lex::Num(n) => Ok(ParseNode::leaf(number_token(n))),
            Lex::Str(s) => Ok(ParseNode::leaf(Token::Str(s))),
            Lex::ErrLit(e) => Ok(ParseNode::leaf(Token::Err(e))),
            Lex::LBrace => self.parse_array_literal(),
            Lex::LParen => self.parse_paren_or_union(),
            Lex::QuotedSheet(name) => self.parse_sheet_qualified(name),
            Lex::Ident(id) => self.parse_ident(id),
            other => Err(ParseError::UnexpectedToken(other.describe())),
        }
    }

    fn parse_paren_or_union(&mut self) -> Result<ParseNode, ParseError> {
        let first = self.parse_compare()?;
        if !matches!(self.peek(), Lex::Comma) {
            self.expect(Lex::RParen)?;
            return Ok(ParseNode::unary(Token::Paren, first));
        }
        // `(ref1, ref2, ...)`: a reference union, marked with a MemFunc
        // region token so the byte layout matches the file formats.
        let mut union = first;
        while matches!(self.peek(), Lex::Comma) {
            self.next();
            let next = self.parse_compare()?;
            union = ParseNode::binary(Token::Union, union, next);
        }
        self.expect(Lex::RParen)?;
        let mem = ParseNode::unary(Token::MemFunc { len: 0 }, union);
        Ok(ParseNode::unary(Token::Paren, mem))
    }

    fn parse_array_literal(&mut self) -> Result<ParseNode, ParseError> {
        if self.formula_type == FormulaType::DataValidationList {
            return Err(ParseError::ArrayConstantNotAllowed);
        }
        let mut rows: Vec<Vec<ArrayElement>> = vec![Vec::new()];
        loop {
            let element = match self.next() {
                Lex::Num(n) => ArrayElement::Number(n),
                Lex::Minus => match self.next() {
                    Lex::Num(n) => ArrayElement::Number(-n),
                    _ => return Err(ParseError::BadArrayConstant),
                },
                Lex::Str(s) => ArrayElement::Text(s),
                Lex::ErrLit(e) => ArrayElement::Error(e),
                Lex::Ident(id) if id.eq_ignore_ascii_case("TRUE") => ArrayElement::Bool(true),
                Lex::Ident(id) if id.eq_ignore_ascii_case("FALSE") => ArrayElement::Bool(false),
                _ => return Err(ParseError::BadArrayConstant),
            };
            rows.last_mut().expect("rows starts non-empty").push(element);
            match self.next() {
                Lex::Comma => {}
                Lex::Semi => rows.push(Vec::new()),
                Lex::RBrace => break,
                _ => return Err(ParseError::BadArrayConstant),
            }
        }
        let cols = rows[0].len();
        if cols == 0 || rows.iter().any(|r| r.len() != cols) {
            return Err(ParseError::BadArrayConstant);
        }
        let n_rows = rows.len();
        let values = rows.into_iter().flatten().collect();
        Ok(ParseNode::leaf(Token::Array(ArrayLiteral {
            rows: n_rows,
            cols,
            values,
        })))
    }

    fn parse_ident(&mut self, id: String) -> Result<ParseNode, ParseError> {
        if matches!(self.peek(), Lex::Bang) {
            return self.parse_sheet_qualified(id);
        }
        if matches!(self.peek(), Lex::LParen) {
            return self.parse_function_call(&id);
        }
        if id.eq_ignore_ascii_case("TRUE") {
            return Ok(ParseNode::leaf(Token::Bool(true)));
        }
        if id.eq_ignore_ascii_case("FALSE") {
            return Ok(ParseNode::leaf(Token::Bool(false)));
        }
        if let Some(first) = self.parse_ref_ident(&id)? {
            if matches!(self.peek(), Lex::Colon) && matches!(self.peek_n(1), Lex::Ident(_)) {
                self.next(); // ':'
                let Lex::Ident(second_id) = self.next() else {
                    unreachable!("peeked identifier");
                };
                let Some(second) = self.parse_ref_ident(&second_id)? else {
                    return Err(ParseError::UnexpectedToken(format!(
                        "identifier {second_id:?} after range operator"
                    )));
                };
                return Ok(ParseNode::leaf(Token::Area(area_token(first, second))));
            }
            return Ok(ParseNode::leaf(Token::Ref(first)));
        }
        match self.workbook.name_index(&id, self.sheet_ix) {
            Some(name_ix) => Ok(ParseNode::leaf(Token::Name { name_ix })),
            None => Err(ParseError::UnknownName(id)),
        }
    }

    /// A sheet-qualified operand: `Sheet1!A1`, `'My Sheet'!A1:B2`,
    /// `[Book2]Sheet1!C3`, or a sheet-scoped defined name.
    fn parse_sheet_qualified(&mut self, raw: String) -> Result<ParseNode, ParseError> {
        self.expect(Lex::Bang)?;
        let (book, sheet) = split_workbook_prefix(&raw);
        let local_sheet_ix = if book.is_none() {
            match self.workbook.sheet_index(sheet) {
                Some(ix) => Some(ix),
                None => return Err(ParseError::UnknownSheet(sheet.to_string())),
            }
        } else {
            None
        };
        let extern_sheet = self.workbook.extern_sheet_index(book, sheet);

        let Lex::Ident(id) = self.next() else {
            return Err(ParseError::UnexpectedToken(
                "sheet qualifier without a reference".to_string(),
            ));
        };
        if let Some(first) = self.parse_ref_ident(&id)? {
            if matches!(self.peek(), Lex::Colon) && matches!(self.peek_n(1), Lex::Ident(_)) {
                self.next(); // ':'
                let Lex::Ident(second_id) = self.next() else {
                    unreachable!("peeked identifier");
                };
                let Some(second) = self.parse_ref_ident(&second_id)? else {
                    return Err(ParseError::UnexpectedToken(format!(
                        "identifier {second_id:?} after range operator"
                    )));
                };
                return Ok(ParseNode::leaf(Token::Area3d {
                    extern_sheet,
                    area: area_token(first, second),
                }));
            }
            return Ok(ParseNode::leaf(Token::Ref3d {
                extern_sheet,
                cell: first,
            }));
        }
        // A sheet-scoped defined name (same workbook only).
        if let Some(sheet_ix) = local_sheet_ix {
            if let Some(name_ix) = self.workbook.name_index(&id, sheet_ix as i32) {
                return Ok(ParseNode::leaf(Token::Name { name_ix }));
            }
        }
        Err(ParseError::UnknownName(id))
    }

    fn parse_function_call(&mut self, name: &str) -> Result<ParseNode, ParseError> {
        let args = self.parse_function_args()?;
        let n_args = args.len();
        let max_args = self.workbook.spreadsheet_version().max_function_args();

        if let Some(meta) = functions::by_name(name) {
            let within = n_args >= usize::from(meta.min_args)
                && n_args <= usize::from(meta.max_args.min(max_args));
            if !within {
                return Err(ParseError::BadArgCount {
                    name: meta.name.to_string(),
                    got: n_args,
                });
            }
            let token = if meta.min_args == meta.max_args
                && meta.index != idx::IF
                && meta.index != idx::CHOOSE
            {
                Token::Func {
                    func_ix: meta.index,
                    arity: meta.min_args,
                }
            } else {
                Token::FuncVar {
                    func_ix: meta.index,
                    arity: n_args as u8,
                }
            };
            return Ok(ParseNode {
                token,
                children: args,
            });
        }

        // Not a built-in: add-in and user functions go through an extern
        // name operand plus the external-call function index.
        let Some(name_ix) = self.workbook.extern_name_index(name) else {
            return Err(ParseError::UnknownFunction(name.to_string()));
        };
        if n_args + 1 > usize::from(max_args) {
            return Err(ParseError::BadArgCount {
                name: name.to_string(),
                got: n_args,
            });
        }
        let mut children = vec![ParseNode::leaf(Token::NameX { name_ix })];
        children.extend(args);
        Ok(ParseNode {
            token: Token::FuncVar {
                func_ix: FUNCTION_INDEX_EXTERNAL,
                arity: (n_args + 1) as u8,
            },
            children,
        })
    }

    fn parse_function_args(&mut self) -> Result<Vec<ParseNode>, ParseError> {
        self.expect(Lex::LParen)?;
        let mut args = Vec::new();
        if matches!(self.peek(), Lex::RParen) {
            self.next();
            return Ok(args);
        }
        loop {
            if matches!(self.peek(), Lex::Comma | Lex::RParen) {
                args.push(ParseNode::leaf(Token::MissingArg));
            } else {
                args.push(self.parse_compare()?);
            }
            match self.next() {
                Lex::Comma => {}
                Lex::RParen => break,
                other => return Err(ParseError::UnexpectedToken(other.describe())),
            }
        }
        Ok(args)
    }

    /// Try to read `id` as an A1 reference with optional `$` markers.
    /// `Ok(None)` when the identifier is not reference-shaped; an error
    /// when it is but exceeds the version limits.
    fn parse_ref_ident(&self, id: &str) -> Result<Option<RefToken>, ParseError> {
        let bytes = id.as_bytes();
        let mut pos = 0usize;
        let col_absolute = bytes.first() == Some(&b'$');
        if col_absolute {
            pos += 1;
        }
        let col_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
            pos += 1;
        }
        if pos == col_start {
            return Ok(None);
        }
        let col_name = &id[col_start..pos];
        let row_absolute = bytes.get(pos) == Some(&b'$');
        if row_absolute {
            pos += 1;
        }
        let row_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == row_start || pos != bytes.len() {
            return Ok(None);
        }

        let Some(col) = name_to_col(col_name) else {
            return Ok(None);
        };
        let Ok(row_1_based) = id[row_start..pos].parse::<u64>() else {
            return Ok(None);
        };
        if row_1_based == 0 {
            return Ok(None);
        }
        let row = (row_1_based - 1) as u32;

        let version = self.workbook.spreadsheet_version();
        if row > version.last_row_index() || col > version.last_column_index() {
            return Err(ParseError::RefOutOfBounds(id.to_string()));
        }
        Ok(Some(RefToken {
            row,
            col,
            row_relative: !row_absolute,
            col_relative: !col_absolute,
        }))
    }
}

fn number_token(n: f64) -> Token {
    if n.fract() == 0.0 && (0.0..=65_535.0).contains(&n) {
        Token::Int(n as u16)
    } else {
        Token::Num(n)
    }
}

fn area_token(a: RefToken, b: RefToken) -> AreaToken {
    AreaToken {
        first_row: a.row.min(b.row),
        first_col: a.col.min(b.col),
        last_row: a.row.max(b.row),
        last_col: a.col.max(b.col),
        first_row_relative: a.row_relative,
        first_col_relative: a.col_relative,
        last_row_relative: b.row_relative,
        last_col_relative: b.col_relative,
    }
}

/// Split `[Book2]Sheet1` into workbook and sheet parts.
fn split_workbook_prefix(raw: &str) -> (Option<&str>, &str) {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            return (Some(&rest[..close]), &rest[close + 1..]);
        }
    }
    (None, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::encoded_size;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use tabula_model::SpreadsheetVersion;

    /// Minimal parsing workbook: two sheets, one defined name, an
    /// extern table grown on demand, ATP names recognized.
    struct TestBook {
        extern_sheets: RefCell<Vec<(Option<String>, String)>>,
        extern_names: RefCell<Vec<String>>,
    }

    impl TestBook {
        fn new() -> Self {
            Self {
                extern_sheets: RefCell::new(Vec::new()),
                extern_names: RefCell::new(Vec::new()),
            }
        }
    }

    impl ParsingWorkbook for TestBook {
        fn sheet_index(&self, name: &str) -> Option<u32> {
            match name.to_ascii_lowercase().as_str() {
                "sheet1" => Some(0),
                "data" => Some(1),
                _ => None,
            }
        }

        fn extern_sheet_index(&self, workbook: Option<&str>, sheet: &str) -> u16 {
            let key = (workbook.map(str::to_string), sheet.to_string());
            let mut table = self.extern_sheets.borrow_mut();
            if let Some(ix) = table.iter().position(|e| *e == key) {
                return ix as u16;
            }
            table.push(key);
            (table.len() - 1) as u16
        }

        fn name_index(&self, name: &str, _sheet_ix: i32) -> Option<u32> {
            name.eq_ignore_ascii_case("TAXRATE").then_some(0)
        }

        fn extern_name_index(&self, name: &str) -> Option<u32> {
            if !crate::functions::atp::AnalysisToolPak::is_known_name(name) {
                return None;
            }
            let mut table = self.extern_names.borrow_mut();
            if let Some(ix) = table.iter().position(|n| n.eq_ignore_ascii_case(name)) {
                return Some(ix as u32);
            }
            table.push(name.to_ascii_uppercase());
            Some((table.len() - 1) as u32)
        }

        fn spreadsheet_version(&self) -> SpreadsheetVersion {
            SpreadsheetVersion::Excel2007
        }
    }

    fn parse_ok(formula: &str) -> Vec<Token> {
        parse(formula, &TestBook::new(), FormulaType::Cell, 0).unwrap()
    }

    fn rel_ref(row: u32, col: u32) -> Token {
        Token::Ref(RefToken {
            row,
            col,
            row_relative: true,
            col_relative: true,
        })
    }

    #[test]
    fn simple_arithmetic_is_postfix() {
        assert_eq!(
            parse_ok("=1+2*3"),
            vec![
                Token::Int(1),
                Token::Int(2),
                Token::Int(3),
                Token::Mul,
                Token::Add,
            ]
        );
    }

    #[test]
    fn power_is_right_associative_and_unary_binds_tighter() {
        assert_eq!(
            parse_ok("=-2^2"),
            vec![Token::Int(2), Token::UnaryMinus, Token::Int(2), Token::Pow]
        );
        assert_eq!(
            parse_ok("=2^3^2"),
            vec![
                Token::Int(2),
                Token::Int(3),
                Token::Int(2),
                Token::Pow,
                Token::Pow,
            ]
        );
    }

    #[test]
    fn references_and_ranges() {
        assert_eq!(parse_ok("=A1"), vec![rel_ref(0, 0)]);
        assert_eq!(
            parse_ok("=$B$2"),
            vec![Token::Ref(RefToken {
                row: 1,
                col: 1,
                row_relative: false,
                col_relative: false,
            })]
        );
        assert_eq!(
            parse_ok("=A1:B3"),
            vec![Token::Area(AreaToken {
                first_row: 0,
                first_col: 0,
                last_row: 2,
                last_col: 1,
                first_row_relative: true,
                first_col_relative: true,
                last_row_relative: true,
                last_col_relative: true,
            })]
        );
    }

    #[test]
    fn sheet_qualified_references_use_the_extern_table() {
        let book = TestBook::new();
        let tokens = parse("=Data!A1+[Budget]Data!B2", &book, FormulaType::Cell, 0).unwrap();
        assert_eq!(
            tokens[0],
            Token::Ref3d {
                extern_sheet: 0,
                cell: RefToken {
                    row: 0,
                    col: 0,
                    row_relative: true,
                    col_relative: true,
                },
            }
        );
        assert_eq!(
            tokens[1],
            Token::Ref3d {
                extern_sheet: 1,
                cell: RefToken {
                    row: 1,
                    col: 1,
                    row_relative: true,
                    col_relative: true,
                },
            }
        );
        let table = book.extern_sheets.borrow();
        assert_eq!(table[0], (None, "Data".to_string()));
        assert_eq!(table[1], (Some("Budget".to_string()), "Data".to_string()));
    }

    #[test]
    fn unknown_sheet_is_a_parse_error() {
        assert_eq!(
            parse("=Nope!A1", &TestBook::new(), FormulaType::Cell, 0),
            Err(ParseError::UnknownSheet("Nope".to_string()))
        );
    }

    #[test]
    fn named_ranges_resolve_through_the_workbook() {
        assert_eq!(parse_ok("=TaxRate"), vec![Token::Name { name_ix: 0 }]);
        assert_eq!(
            parse("=NoSuchName", &TestBook::new(), FormulaType::Cell, 0),
            Err(ParseError::UnknownName("NoSuchName".to_string()))
        );
    }

    #[test]
    fn fixed_arity_functions_use_the_fixed_call_token() {
        assert_eq!(
            parse_ok("=ABS(-3)"),
            vec![
                Token::Int(3),
                Token::UnaryMinus,
                Token::Func {
                    func_ix: 24,
                    arity: 1,
                },
            ]
        );
    }

    #[test]
    fn multi_arg_sum_is_a_funcvar_but_single_arg_sum_is_the_shorthand() {
        assert_eq!(
            parse_ok("=SUM(A1,B1)"),
            vec![
                rel_ref(0, 0),
                rel_ref(0, 1),
                Token::FuncVar {
                    func_ix: idx::SUM,
                    arity: 2,
                },
            ]
        );
        assert_eq!(
            parse_ok("=SUM(A1:A3)"),
            vec![
                Token::Area(AreaToken {
                    first_row: 0,
                    first_col: 0,
                    last_row: 2,
                    last_col: 0,
                    first_row_relative: true,
                    first_col_relative: true,
                    last_row_relative: true,
                    last_col_relative: true,
                }),
                Token::Attr(Attr::Sum),
            ]
        );
    }

    #[test]
    fn three_argument_if_layout_and_distances() {
        let tokens = parse_ok("=IF(A1,2,3)");
        assert_eq!(
            tokens,
            vec![
                rel_ref(0, 0),
                Token::Attr(Attr::If { dist: 3 + 4 }),
                Token::Int(2),
                Token::Attr(Attr::Skip {
                    dist: 3 + 4 + 4 - 1,
                    kind: SkipKind::IfBranch,
                }),
                Token::Int(3),
                Token::Attr(Attr::Skip {
                    dist: 3,
                    kind: SkipKind::IfBranch,
                }),
                Token::FuncVar {
                    func_ix: idx::IF,
                    arity: 3,
                },
            ]
        );
    }

    #[test]
    fn two_argument_if_has_no_false_branch() {
        assert_eq!(
            parse_ok("=IF(A1,2)"),
            vec![
                rel_ref(0, 0),
                Token::Attr(Attr::If { dist: 3 + 4 }),
                Token::Int(2),
                Token::Attr(Attr::Skip {
                    dist: 3,
                    kind: SkipKind::IfBranch,
                }),
                Token::FuncVar {
                    func_ix: idx::IF,
                    arity: 2,
                },
            ]
        );
    }

    #[test]
    fn choose_layout_tables_and_offsets() {
        let tokens = parse_ok(r#"=CHOOSE(A1,"a",7)"#);
        // Layout: selector, attr, "a"(4), skip(4), 7(3), skip(4), call.
        let Token::Attr(Attr::Choose {
            jump_table,
            choose_func_offset,
        }) = &tokens[1]
        else {
            panic!("expected a choose attribute, got {:?}", tokens[1]);
        };
        let table_bytes: u16 = 2 * (2 + 1);
        assert_eq!(jump_table, &vec![table_bytes, table_bytes + 4 + 4]);
        assert_eq!(*choose_func_offset, table_bytes + 4 + 4 + 3 + 4);
        assert_eq!(
            tokens[3],
            Token::Attr(Attr::Skip {
                dist: 3 + 4 + 4 - 1,
                kind: SkipKind::Choice,
            })
        );
        assert_eq!(
            tokens[5],
            Token::Attr(Attr::Skip {
                dist: 3,
                kind: SkipKind::Choice,
            })
        );
        assert_eq!(
            tokens[6],
            Token::FuncVar {
                func_ix: idx::CHOOSE,
                arity: 3,
            }
        );
    }

    #[test]
    fn union_gets_a_mem_func_region_marker() {
        let tokens = parse_ok("=SUM((A1,B2))");
        assert_eq!(
            tokens,
            vec![
                Token::MemFunc { len: 11 },
                rel_ref(0, 0),
                rel_ref(1, 1),
                Token::Union,
                Token::Paren,
                Token::Attr(Attr::Sum),
            ]
        );
        // The region length covers the two refs and the union token.
        assert_eq!(encoded_size(&tokens[1..4]), 11);
    }

    #[test]
    fn missing_arguments_become_placeholders() {
        let tokens = parse_ok("=IF(A1,,2)");
        assert_eq!(tokens[2], Token::MissingArg);
    }

    #[test]
    fn array_literals_parse_row_major() {
        let tokens = parse_ok("={1,2;3,4}");
        let Token::Array(literal) = &tokens[0] else {
            panic!("expected an array literal");
        };
        assert_eq!((literal.rows, literal.cols), (2, 2));
        assert_eq!(literal.values[3], ArrayElement::Number(4.0));
        assert!(matches!(
            parse("={1,2;3}", &TestBook::new(), FormulaType::Cell, 0),
            Err(ParseError::BadArrayConstant)
        ));
    }

    #[test]
    fn array_literals_are_rejected_in_validation_lists() {
        assert_eq!(
            parse(
                "={1,2}",
                &TestBook::new(),
                FormulaType::DataValidationList,
                0
            ),
            Err(ParseError::ArrayConstantNotAllowed)
        );
    }

    #[test]
    fn addin_functions_route_through_extern_names() {
        let tokens = parse_ok("=ISEVEN(A1)");
        assert_eq!(tokens[0], Token::NameX { name_ix: 0 });
        assert_eq!(tokens[1], rel_ref(0, 0));
        assert_eq!(
            tokens[2],
            Token::FuncVar {
                func_ix: FUNCTION_INDEX_EXTERNAL,
                arity: 2,
            }
        );
        assert_eq!(
            parse("=FROBNICATE(1)", &TestBook::new(), FormulaType::Cell, 0),
            Err(ParseError::UnknownFunction("FROBNICATE".to_string()))
        );
    }

    #[test]
    fn argument_counts_are_validated() {
        assert!(matches!(
            parse("=ABS(1,2)", &TestBook::new(), FormulaType::Cell, 0),
            Err(ParseError::BadArgCount { .. })
        ));
        assert!(matches!(
            parse("=IF(1)", &TestBook::new(), FormulaType::Cell, 0),
            Err(ParseError::BadArgCount { .. })
        ));
    }

    #[test]
    fn out_of_bounds_references_are_rejected_at_parse_time() {
        // XFD1048576 is the last valid cell; one row further is not.
        assert!(parse("=XFD1048576", &TestBook::new(), FormulaType::Cell, 0).is_ok());
        assert_eq!(
            parse("=XFD1048577", &TestBook::new(), FormulaType::Cell, 0),
            Err(ParseError::RefOutOfBounds("XFD1048577".to_string()))
        );
    }

    #[test]
    fn percent_binds_tightest() {
        assert_eq!(
            parse_ok("=50%+1"),
            vec![Token::Int(50), Token::Percent, Token::Int(1), Token::Add]
        );
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(parse("=1 2", &TestBook::new(), FormulaType::Cell, 0).is_err());
    }
}
