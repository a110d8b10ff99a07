//! # Template Resolution and Expression Evaluation
//!
//! Flows reference context values through `{{ ... }}` templates:
//!
//! - `{{ inputs.level }}` - a declared input
//! - `{{ steps.roll_stats.result.total }}` - a step result
//! - `{{ result.total * 2 }}` - arithmetic over the current step alias
//! - `{{ entry|title }}` - filters
//! - `{{ 'veteran' if inputs.level > 5 else 'novice' }}` - inline conditionals
//!
//! A template that consists of exactly one expression yields the expression's
//! native value, so `"{{ 2 + 2 }}"` resolves to the integer `4`. Templates
//! mixing text and expressions render to a string. Strings without `{{` pass
//! through untouched, which keeps resolution idempotent for plain text.
//!
//! ## Usage
//!
//! ```rust
//! use grimoire_engine::resolve::{ExpressionResolver, TemplateResolver};
//! use serde_json::json;
//!
//! let scope = json!({"inputs": {"name": "ada", "level": 3}});
//! let resolver = ExpressionResolver;
//!
//! assert_eq!(resolver.resolve("{{ inputs.level + 1 }}", &scope).unwrap(), json!(4));
//! assert_eq!(resolver.resolve("Hail {{ inputs.name|title }}!", &scope).unwrap(), json!("Hail Ada!"));
//! assert_eq!(resolver.resolve("plain text", &scope).unwrap(), json!("plain text"));
//! ```

use serde_json::{Map as JsonMap, Number, Value};

use crate::error::TemplateError;
use crate::field_paths::{child, lookup_in_value};

/// Read access to named values for template evaluation.
pub trait Scope {
    /// Returns the value at `path` (first segment is a root name), or `None`
    /// when any segment is undefined.
    fn lookup(&self, path: &[String]) -> Option<Value>;
}

impl Scope for Value {
    fn lookup(&self, path: &[String]) -> Option<Value> {
        lookup_in_value(self, path).cloned()
    }
}

impl Scope for JsonMap<String, Value> {
    fn lookup(&self, path: &[String]) -> Option<Value> {
        let (root, rest) = path.split_first()?;
        lookup_in_value(self.get(root)?, rest).cloned()
    }
}

/// Evaluates template strings against a scope.
///
/// Implementations must be pure: resolving the same template against the same
/// scope yields the same value.
pub trait TemplateResolver: Send + Sync {
    fn resolve(&self, template: &str, scope: &dyn Scope) -> Result<Value, TemplateError>;
}

/// Default resolver implementing the Jinja-flavoured expression language.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionResolver;

impl TemplateResolver for ExpressionResolver {
    fn resolve(&self, template: &str, scope: &dyn Scope) -> Result<Value, TemplateError> {
        if !has_template_markers(template) {
            return Ok(Value::String(template.to_string()));
        }
        let segments = split_segments(template).map_err(|message| TemplateError::new(template, message))?;
        let evaluate_source = |source: &str| {
            parse_expression(source)
                .and_then(|expression| evaluate(&expression, scope))
                .map_err(|message| TemplateError::new(template, message))
        };

        let mut significant = segments
            .iter()
            .filter(|segment| !matches!(segment, Segment::Text(text) if text.trim().is_empty()));
        if let (Some(Segment::Expression(source)), None) = (significant.next(), significant.next()) {
            return evaluate_source(*source);
        }

        let mut rendered = String::with_capacity(template.len());
        for segment in &segments {
            match segment {
                Segment::Text(text) => rendered.push_str(text),
                Segment::Expression(source) => rendered.push_str(&render_text(&evaluate_source(*source)?)),
            }
        }
        Ok(Value::String(rendered))
    }
}

/// Returns true when `text` contains an expression opener.
pub fn has_template_markers(text: &str) -> bool {
    text.contains("{{")
}

/// Resolves a guard expression to a boolean.
///
/// Guards may be written as templates (`{{ x > 1 }}`) or bare expressions
/// (`x > 1`). String results such as `"false"` or `"none"` count as false.
pub fn evaluate_condition(resolver: &dyn TemplateResolver, condition: &str, scope: &dyn Scope) -> Result<bool, TemplateError> {
    let value = if has_template_markers(condition) {
        resolver.resolve(condition, scope)?
    } else {
        resolver.resolve(&format!("{{{{ {condition} }}}}"), scope)?
    };
    Ok(match &value {
        Value::String(text) => {
            let lowered = text.trim().to_ascii_lowercase();
            !matches!(lowered.as_str(), "" | "false" | "none" | "null" | "0")
        }
        other => is_truthy(other),
    })
}

/// Jinja truthiness: null, false, zero, and empty containers are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|float| float != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Renders a value the way it appears inside mixed text.
pub fn render_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expression(&'a str),
}

fn split_segments(template: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut cursor = 0usize;

    while let Some(relative_open) = template[cursor..].find("{{") {
        let open = cursor + relative_open;
        if open > cursor {
            segments.push(Segment::Text(&template[cursor..open]));
        }
        let body_start = open + 2;
        let close = find_closing_braces(&template[body_start..]).ok_or_else(|| "unclosed '{{'".to_string())?;
        segments.push(Segment::Expression(&template[body_start..body_start + close]));
        cursor = body_start + close + 2;
    }
    if cursor < template.len() {
        segments.push(Segment::Text(&template[cursor..]));
    }
    Ok(segments)
}

fn find_closing_braces(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (index, character) in body.char_indices() {
        if let Some(open_quote) = quote {
            if escaped {
                escaped = false;
            } else if character == '\\' {
                escaped = true;
            } else if character == open_quote {
                quote = None;
            }
            continue;
        }
        match character {
            '\'' | '"' => quote = Some(character),
            '}' if body[index..].starts_with("}}") => return Some(index),
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Symbol(&'static str),
}

const SYMBOLS: [&str; 24] = [
    "//", "==", "!=", "<=", ">=", "&&", "||", "(", ")", "[", "]", ",", ".", "|", "+", "-", "*", "/", "%", "~", "<", ">", "!", "=",
];

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let characters: Vec<char> = source.chars().collect();
    let mut position = 0usize;

    while position < characters.len() {
        let character = characters[position];
        if character.is_whitespace() {
            position += 1;
            continue;
        }

        if character.is_ascii_digit() {
            let start = position;
            while position < characters.len() && characters[position].is_ascii_digit() {
                position += 1;
            }
            let is_float = position + 1 < characters.len() && characters[position] == '.' && characters[position + 1].is_ascii_digit();
            if is_float {
                position += 1;
                while position < characters.len() && characters[position].is_ascii_digit() {
                    position += 1;
                }
            }
            let text: String = characters[start..position].iter().collect();
            let token = if is_float {
                Token::Float(text.parse().map_err(|_| format!("invalid number '{text}'"))?)
            } else {
                match text.parse::<i64>() {
                    Ok(integer) => Token::Int(integer),
                    Err(_) => Token::Float(text.parse().map_err(|_| format!("invalid number '{text}'"))?),
                }
            };
            tokens.push(token);
            continue;
        }

        if character.is_alphabetic() || character == '_' {
            let start = position;
            while position < characters.len() && (characters[position].is_alphanumeric() || characters[position] == '_') {
                position += 1;
            }
            tokens.push(Token::Ident(characters[start..position].iter().collect()));
            continue;
        }

        if character == '\'' || character == '"' {
            let (text, next) = read_string_literal(&characters, position)?;
            tokens.push(Token::Str(text));
            position = next;
            continue;
        }

        let remaining: String = characters[position..characters.len().min(position + 2)].iter().collect();
        let Some(symbol) = SYMBOLS.iter().find(|symbol| remaining.starts_with(**symbol)) else {
            return Err(format!("unexpected character '{character}'"));
        };
        tokens.push(Token::Symbol(*symbol));
        position += symbol.len();
    }

    Ok(tokens)
}

fn read_string_literal(characters: &[char], start: usize) -> Result<(String, usize), String> {
    let quote = characters[start];
    let mut text = String::new();
    let mut position = start + 1;
    while position < characters.len() {
        let character = characters[position];
        if character == quote {
            return Ok((text, position + 1));
        }
        if character == '\\' && position + 1 < characters.len() {
            position += 1;
            text.push(match characters[position] {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
        } else {
            text.push(character);
        }
        position += 1;
    }
    Err("unterminated string literal".to_string())
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Concat,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Variable(String),
    Attribute(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Filter { target: Box<Expr>, name: String, arguments: Vec<Expr> },
    Not(Box<Expr>),
    Negate(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional { value: Box<Expr>, condition: Box<Expr>, otherwise: Option<Box<Expr>> },
}

fn parse_expression(source: &str) -> Result<Expr, String> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, position: 0 };
    let expression = parser.parse_conditional()?;
    if let Some(token) = parser.peek() {
        return Err(format!("unexpected token {}", describe(token)));
    }
    Ok(expression)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Int(integer) => integer.to_string(),
        Token::Float(float) => float.to_string(),
        Token::Str(text) => format!("'{text}'"),
        Token::Ident(name) => format!("'{name}'"),
        Token::Symbol(symbol) => format!("'{symbol}'"),
    }
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.position + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn at_symbol(&self, symbol: &str) -> bool {
        matches!(self.peek(), Some(Token::Symbol(current)) if *current == symbol)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == keyword)
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        let matched = self.at_symbol(symbol);
        if matched {
            self.position += 1;
        }
        matched
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let matched = self.at_keyword(keyword);
        if matched {
            self.position += 1;
        }
        matched
    }

    fn expect_symbol(&mut self, symbol: &str) -> Result<(), String> {
        if self.eat_symbol(symbol) {
            return Ok(());
        }
        match self.peek() {
            Some(token) => Err(format!("expected '{symbol}', found {}", describe(token))),
            None => Err(format!("expected '{symbol}', found end of expression")),
        }
    }

    fn parse_conditional(&mut self) -> Result<Expr, String> {
        let value = self.parse_or()?;
        if !self.eat_keyword("if") {
            return Ok(value);
        }
        let condition = self.parse_or()?;
        let otherwise = if self.eat_keyword("else") {
            Some(Box::new(self.parse_conditional()?))
        } else {
            None
        };
        Ok(Expr::Conditional {
            value: Box::new(value),
            condition: Box::new(condition),
            otherwise,
        })
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") || self.eat_symbol("||") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") || self.eat_symbol("&&") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.eat_keyword("not") || self.eat_symbol("!") {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_concat()?;
        loop {
            let operator = match self.peek() {
                Some(Token::Symbol("==")) => BinaryOp::Equal,
                Some(Token::Symbol("!=")) => BinaryOp::NotEqual,
                Some(Token::Symbol("<")) => BinaryOp::Less,
                Some(Token::Symbol("<=")) => BinaryOp::LessEqual,
                Some(Token::Symbol(">")) => BinaryOp::Greater,
                Some(Token::Symbol(">=")) => BinaryOp::GreaterEqual,
                Some(Token::Ident(name)) if name == "in" => BinaryOp::In,
                Some(Token::Ident(name)) if name == "not" && matches!(self.peek_at(1), Some(Token::Ident(next)) if next == "in") => {
                    BinaryOp::NotIn
                }
                _ => return Ok(left),
            };
            self.position += if operator == BinaryOp::NotIn { 2 } else { 1 };
            let right = self.parse_concat()?;
            left = Expr::Binary(operator, Box::new(left), Box::new(right));
        }
    }

    fn parse_concat(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_additive()?;
        while self.eat_symbol("~") {
            let right = self.parse_additive()?;
            left = Expr::Binary(BinaryOp::Concat, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_term()?;
        loop {
            let operator = if self.eat_symbol("+") {
                BinaryOp::Add
            } else if self.eat_symbol("-") {
                BinaryOp::Subtract
            } else {
                return Ok(left);
            };
            let right = self.parse_term()?;
            left = Expr::Binary(operator, Box::new(left), Box::new(right));
        }
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let operator = if self.eat_symbol("*") {
                BinaryOp::Multiply
            } else if self.eat_symbol("//") {
                BinaryOp::FloorDivide
            } else if self.eat_symbol("/") {
                BinaryOp::Divide
            } else if self.eat_symbol("%") {
                BinaryOp::Modulo
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            left = Expr::Binary(operator, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat_symbol("-") {
            return Ok(Expr::Negate(Box::new(self.parse_unary()?)));
        }
        if self.eat_symbol("+") {
            return self.parse_unary();
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, String> {
        let mut expression = self.parse_primary()?;
        loop {
            if self.eat_symbol(".") {
                let name = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    Some(Token::Int(index)) => index.to_string(),
                    Some(token) => return Err(format!("expected attribute name after '.', found {}", describe(&token))),
                    None => return Err("expected attribute name after '.'".to_string()),
                };
                expression = Expr::Attribute(Box::new(expression), name);
            } else if self.eat_symbol("[") {
                let index = self.parse_conditional()?;
                self.expect_symbol("]")?;
                expression = Expr::Index(Box::new(expression), Box::new(index));
            } else if self.eat_symbol("|") {
                let Some(Token::Ident(name)) = self.advance() else {
                    return Err("expected filter name after '|'".to_string());
                };
                let arguments = if self.eat_symbol("(") { self.parse_arguments(")")? } else { Vec::new() };
                expression = Expr::Filter {
                    target: Box::new(expression),
                    name,
                    arguments,
                };
            } else {
                return Ok(expression);
            }
        }
    }

    fn parse_arguments(&mut self, closing: &str) -> Result<Vec<Expr>, String> {
        let mut arguments = Vec::new();
        if self.eat_symbol(closing) {
            return Ok(arguments);
        }
        loop {
            // Keyword arguments (`default(0, boolean=true)`) are accepted positionally.
            if matches!(self.peek(), Some(Token::Ident(_))) && matches!(self.peek_at(1), Some(Token::Symbol("="))) {
                self.position += 2;
            }
            arguments.push(self.parse_conditional()?);
            if self.eat_symbol(closing) {
                return Ok(arguments);
            }
            self.expect_symbol(",")?;
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Int(integer)) => Ok(Expr::Literal(Value::from(integer))),
            Some(Token::Float(float)) => Ok(Expr::Literal(float_value(float))),
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Symbol("(")) => {
                let inner = self.parse_conditional()?;
                self.expect_symbol(")")?;
                Ok(inner)
            }
            Some(Token::Symbol("[")) => Ok(Expr::List(self.parse_arguments("]")?)),
            Some(Token::Ident(name)) => Ok(match name.to_ascii_lowercase().as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "none" | "null" => Expr::Literal(Value::Null),
                _ => Expr::Variable(name),
            }),
            Some(token) => Err(format!("unexpected token {}", describe(&token))),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn evaluate(expression: &Expr, scope: &dyn Scope) -> Result<Value, String> {
    match expression {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Variable(_) | Expr::Attribute(..) | Expr::Index(..) => evaluate_access(expression, scope),
        Expr::Filter { target, name, arguments } => {
            let value = evaluate(target, scope)?;
            let arguments = arguments
                .iter()
                .map(|argument| evaluate(argument, scope))
                .collect::<Result<Vec<_>, _>>()?;
            apply_filter(name, value, &arguments)
        }
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&evaluate(inner, scope)?))),
        Expr::Negate(inner) => match as_number(&evaluate(inner, scope)?) {
            Some(Numeric::Int(integer)) => Ok(integer.checked_neg().map(Value::from).unwrap_or_else(|| float_value(-(integer as f64)))),
            Some(Numeric::Float(float)) => Ok(float_value(-float)),
            None => Err("unary '-' requires a number".to_string()),
        },
        Expr::And(left, right) => {
            let left = evaluate(left, scope)?;
            if is_truthy(&left) { evaluate(right, scope) } else { Ok(left) }
        }
        Expr::Or(left, right) => {
            let left = evaluate(left, scope)?;
            if is_truthy(&left) { Ok(left) } else { evaluate(right, scope) }
        }
        Expr::Binary(operator, left, right) => {
            let left = evaluate(left, scope)?;
            let right = evaluate(right, scope)?;
            apply_binary(*operator, &left, &right)
        }
        Expr::Conditional { value, condition, otherwise } => {
            if is_truthy(&evaluate(condition, scope)?) {
                evaluate(value, scope)
            } else {
                match otherwise {
                    Some(otherwise) => evaluate(otherwise, scope),
                    None => Ok(Value::Null),
                }
            }
        }
    }
}

/// Resolves variable, attribute, and index chains. Static chains are looked up
/// in one pass so the scope only clones the leaf.
fn evaluate_access(expression: &Expr, scope: &dyn Scope) -> Result<Value, String> {
    let mut segments = Vec::new();
    if collect_static_path(expression, &mut segments) {
        return Ok(scope.lookup(&segments).unwrap_or(Value::Null));
    }
    match expression {
        Expr::Attribute(base, name) => Ok(child(&evaluate(base, scope)?, name).cloned().unwrap_or(Value::Null)),
        Expr::Index(base, index) => {
            let base = evaluate(base, scope)?;
            let index = evaluate(index, scope)?;
            Ok(index_value(&base, &index).unwrap_or(Value::Null))
        }
        other => evaluate(other, scope),
    }
}

fn collect_static_path(expression: &Expr, segments: &mut Vec<String>) -> bool {
    match expression {
        Expr::Variable(name) => {
            segments.push(name.clone());
            true
        }
        Expr::Attribute(base, name) => {
            if !collect_static_path(base, segments) {
                return false;
            }
            segments.push(name.clone());
            true
        }
        Expr::Index(base, index) => {
            let segment = match index.as_ref() {
                Expr::Literal(Value::String(key)) => key.clone(),
                Expr::Literal(Value::Number(number)) if number.as_u64().is_some() => number.to_string(),
                _ => return false,
            };
            if !collect_static_path(base, segments) {
                return false;
            }
            segments.push(segment);
            true
        }
        _ => false,
    }
}

fn index_value(base: &Value, index: &Value) -> Option<Value> {
    match (base, index) {
        (Value::Array(items), Value::Number(number)) => {
            let position = number.as_i64()?;
            let resolved = if position < 0 { items.len() as i64 + position } else { position };
            usize::try_from(resolved).ok().and_then(|position| items.get(position)).cloned()
        }
        (Value::String(text), Value::Number(number)) => {
            let position = usize::try_from(number.as_i64()?).ok()?;
            text.chars().nth(position).map(|character| Value::String(character.to_string()))
        }
        (_, Value::String(key)) => child(base, key).cloned(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(integer) => integer as f64,
            Numeric::Float(float) => float,
        }
    }
}

fn as_number(value: &Value) -> Option<Numeric> {
    match value {
        Value::Number(number) => match number.as_i64() {
            Some(integer) => Some(Numeric::Int(integer)),
            None => number.as_f64().map(Numeric::Float),
        },
        Value::Bool(flag) => Some(Numeric::Int(i64::from(*flag))),
        _ => None,
    }
}

fn float_value(float: f64) -> Value {
    Number::from_f64(float).map(Value::Number).unwrap_or(Value::Null)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "none",
        Value::Bool(_) => "bool",
        Value::Number(number) if number.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

fn apply_binary(operator: BinaryOp, left: &Value, right: &Value) -> Result<Value, String> {
    match operator {
        BinaryOp::Add => add(left, right),
        BinaryOp::Subtract => arithmetic(operator, left, right, i64::checked_sub, |a, b| a - b),
        BinaryOp::Multiply => multiply(left, right),
        BinaryOp::Divide => {
            let (dividend, divisor) = numeric_pair(operator, left, right)?;
            if divisor.as_f64() == 0.0 {
                return Err("division by zero".to_string());
            }
            Ok(float_value(dividend.as_f64() / divisor.as_f64()))
        }
        BinaryOp::FloorDivide => match numeric_pair(operator, left, right)? {
            (_, divisor) if divisor.as_f64() == 0.0 => Err("division by zero".to_string()),
            (Numeric::Int(dividend), Numeric::Int(divisor)) => Ok(floor_divide(dividend, divisor)
                .map(Value::from)
                .unwrap_or_else(|| float_value((dividend as f64 / divisor as f64).floor()))),
            (dividend, divisor) => Ok(float_value((dividend.as_f64() / divisor.as_f64()).floor())),
        },
        BinaryOp::Modulo => match numeric_pair(operator, left, right)? {
            (_, divisor) if divisor.as_f64() == 0.0 => Err("modulo by zero".to_string()),
            (Numeric::Int(dividend), Numeric::Int(divisor)) => Ok(Value::from(floor_modulo(dividend, divisor))),
            (dividend, divisor) => {
                let (dividend, divisor) = (dividend.as_f64(), divisor.as_f64());
                Ok(float_value(dividend - divisor * (dividend / divisor).floor()))
            }
        },
        BinaryOp::Concat => Ok(Value::String(format!("{}{}", render_text(left), render_text(right)))),
        BinaryOp::Equal => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::NotEqual => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
            let ordering = compare(left, right)?;
            Ok(Value::Bool(match operator {
                BinaryOp::Less => ordering.is_lt(),
                BinaryOp::LessEqual => ordering.is_le(),
                BinaryOp::Greater => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::In => contains(right, left).map(Value::Bool),
        BinaryOp::NotIn => contains(right, left).map(|found| Value::Bool(!found)),
    }
}

/// `None` when the quotient overflows (`i64::MIN // -1`).
fn floor_divide(dividend: i64, divisor: i64) -> Option<i64> {
    let quotient = dividend.checked_div(divisor)?;
    let remainder = dividend.checked_rem(divisor)?;
    Some(if remainder != 0 && ((remainder < 0) != (divisor < 0)) { quotient - 1 } else { quotient })
}

/// Remainder with the sign of the divisor.
fn floor_modulo(dividend: i64, divisor: i64) -> i64 {
    match dividend.checked_rem(divisor) {
        Some(remainder) if remainder != 0 && ((remainder < 0) != (divisor < 0)) => remainder + divisor,
        Some(remainder) => remainder,
        // i64::MIN % -1
        None => 0,
    }
}

fn numeric_pair(operator: BinaryOp, left: &Value, right: &Value) -> Result<(Numeric, Numeric), String> {
    match (as_number(left), as_number(right)) {
        (Some(left), Some(right)) => Ok((left, right)),
        _ => Err(format!(
            "unsupported operand types for {operator:?}: {} and {}",
            type_name(left),
            type_name(right)
        )),
    }
}

fn arithmetic(
    operator: BinaryOp,
    left: &Value,
    right: &Value,
    integer_operation: fn(i64, i64) -> Option<i64>,
    float_operation: fn(f64, f64) -> f64,
) -> Result<Value, String> {
    match numeric_pair(operator, left, right)? {
        (Numeric::Int(a), Numeric::Int(b)) => Ok(integer_operation(a, b)
            .map(Value::from)
            .unwrap_or_else(|| float_value(float_operation(a as f64, b as f64)))),
        (a, b) => Ok(float_value(float_operation(a.as_f64(), b.as_f64()))),
    }
}

fn add(left: &Value, right: &Value) -> Result<Value, String> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect())),
        _ => arithmetic(BinaryOp::Add, left, right, i64::checked_add, |a, b| a + b),
    }
}

/// Upper bound on the text produced by `'abc' * n`.
const MAX_REPEAT_BYTES: usize = 1 << 20;

fn multiply(left: &Value, right: &Value) -> Result<Value, String> {
    match (left, right) {
        (Value::String(text), Value::Number(count)) | (Value::Number(count), Value::String(text)) if count.is_i64() => {
            let times = usize::try_from(count.as_i64().unwrap_or(0)).unwrap_or(0);
            match text.len().checked_mul(times) {
                Some(length) if length <= MAX_REPEAT_BYTES => Ok(Value::String(text.repeat(times))),
                _ => Err("string repetition too large".to_string()),
            }
        }
        _ => arithmetic(BinaryOp::Multiply, left, right, i64::checked_mul, |a, b| a * b),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => match (as_number(left), as_number(right)) {
            (Some(Numeric::Int(a)), Some(Numeric::Int(b))) => a == b,
            (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
            _ => false,
        },
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, String> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => match (as_number(left), as_number(right)) {
            (Some(Numeric::Int(a)), Some(Numeric::Int(b))) => Ok(a.cmp(&b)),
            (Some(a), Some(b)) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .ok_or_else(|| "cannot order NaN".to_string()),
            _ => Err(format!("cannot compare {} with {}", type_name(left), type_name(right))),
        },
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, String> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::String(text) => Ok(text.contains(&render_text(needle))),
        Value::Object(map) => Ok(map.contains_key(&render_text(needle))),
        Value::Null => Ok(false),
        other => Err(format!("'in' requires a list, string, or mapping, found {}", type_name(other))),
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

fn apply_filter(name: &str, value: Value, arguments: &[Value]) -> Result<Value, String> {
    let argument = |index: usize| arguments.get(index).cloned();
    match name {
        "upper" => Ok(Value::String(render_text(&value).to_uppercase())),
        "lower" => Ok(Value::String(render_text(&value).to_lowercase())),
        "title" => Ok(Value::String(title_case(&render_text(&value)))),
        "capitalize" => Ok(Value::String(capitalize(&render_text(&value)))),
        "trim" => Ok(Value::String(render_text(&value).trim().to_string())),
        "length" | "count" => match &value {
            Value::String(text) => Ok(Value::from(text.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(format!("length of {} is undefined", type_name(other))),
        },
        "default" | "d" => {
            let falsy_counts = argument(1).is_some_and(|flag| is_truthy(&flag));
            let missing = value.is_null() || (falsy_counts && !is_truthy(&value));
            Ok(if missing { argument(0).unwrap_or_else(|| Value::String(String::new())) } else { value })
        }
        "int" => Ok(to_integer(&value).map(Value::from).unwrap_or_else(|| argument(0).unwrap_or(Value::from(0)))),
        "float" => Ok(to_float(&value).map(float_value).unwrap_or_else(|| argument(0).unwrap_or(float_value(0.0)))),
        "string" => Ok(Value::String(render_text(&value))),
        "bool" => Ok(Value::Bool(match &value {
            Value::String(text) => matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1" | "on"),
            other => is_truthy(other),
        })),
        "round" => {
            let precision = argument(0).and_then(|precision| precision.as_i64()).unwrap_or(0);
            let float = to_float(&value).ok_or_else(|| format!("cannot round {}", type_name(&value)))?;
            let factor = 10f64.powi(i32::try_from(precision).unwrap_or(0));
            Ok(float_value((float * factor).round() / factor))
        }
        "abs" => match as_number(&value) {
            Some(Numeric::Int(integer)) => Ok(Value::from(integer.saturating_abs())),
            Some(Numeric::Float(float)) => Ok(float_value(float.abs())),
            None => Err(format!("abs requires a number, found {}", type_name(&value))),
        },
        "join" => {
            let separator = argument(0).map(|separator| render_text(&separator)).unwrap_or_default();
            match &value {
                Value::Array(items) => Ok(Value::String(items.iter().map(render_text).collect::<Vec<_>>().join(&separator))),
                other => Ok(Value::String(render_text(other))),
            }
        }
        "first" => Ok(match &value {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            Value::String(text) => text.chars().next().map(|character| Value::String(character.to_string())).unwrap_or(Value::Null),
            _ => Value::Null,
        }),
        "last" => Ok(match &value {
            Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
            Value::String(text) => text.chars().last().map(|character| Value::String(character.to_string())).unwrap_or(Value::Null),
            _ => Value::Null,
        }),
        "replace" => {
            let (Some(from), Some(to)) = (argument(0), argument(1)) else {
                return Err("replace requires two arguments".to_string());
            };
            Ok(Value::String(render_text(&value).replace(&render_text(&from), &render_text(&to))))
        }
        other => Err(format!("unknown filter '{other}'")),
    }
}

fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| number.as_f64().map(|float| float.trunc() as i64)),
        Value::Bool(flag) => Some(i64::from(*flag)),
        Value::String(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|float| float.trunc() as i64))
        }
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn capitalize(text: &str) -> String {
    let mut characters = text.chars();
    match characters.next() {
        Some(first) => first.to_uppercase().chain(characters.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn title_case(text: &str) -> String {
    let mut titled = String::with_capacity(text.len());
    let mut at_word_start = true;
    for character in text.chars() {
        if character.is_alphanumeric() {
            if at_word_start {
                titled.extend(character.to_uppercase());
            } else {
                titled.extend(character.to_lowercase());
            }
            at_word_start = false;
        } else {
            titled.push(character);
            at_word_start = true;
        }
    }
    titled
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(template: &str, scope: &Value) -> Value {
        ExpressionResolver.resolve(template, scope).expect("template resolves")
    }

    fn scope() -> Value {
        json!({
            "inputs": {"n": 21, "name": "ada lovelace", "tags": ["brave", "clever"]},
            "variables": {"counter": 0, "ratio": 2.5, "empty": ""},
            "result": {"total": 7, "detail": "3+4"},
            "steps": {"pick": {"results": [{"id": "x"}, {"id": "y"}]}}
        })
    }

    #[test]
    fn single_expression_returns_native_values() {
        let scope = scope();
        assert_eq!(resolve("{{ inputs.n * 2 }}", &scope), json!(42));
        assert_eq!(resolve("{{ 2 + 2 }}", &scope), json!(4));
        assert_eq!(resolve("  {{ variables.ratio }} ", &scope), json!(2.5));
        assert_eq!(resolve("{{ inputs.tags }}", &scope), json!(["brave", "clever"]));
        assert_eq!(resolve("{{ variables.counter == 0 }}", &scope), json!(true));
        assert_eq!(resolve("{{ missing.path }}", &scope), Value::Null);
    }

    #[test]
    fn mixed_templates_render_text() {
        let scope = scope();
        assert_eq!(resolve("Rolled {{ result.total }} ({{ result.detail }})", &scope), json!("Rolled 7 (3+4)"));
        assert_eq!(resolve("[{{ missing }}]", &scope), json!("[]"));
        assert_eq!(resolve("{{ 'a' }}{{ 'b' }}", &scope), json!("ab"));
    }

    #[test]
    fn plain_strings_pass_through_unchanged_and_idempotently() {
        let scope = scope();
        let once = resolve("no markers here", &scope);
        assert_eq!(once, json!("no markers here"));
        let twice = resolve(once.as_str().unwrap(), &scope);
        assert_eq!(once, twice);
    }

    #[test]
    fn arithmetic_follows_integer_and_float_rules() {
        let scope = scope();
        assert_eq!(resolve("{{ 7 / 2 }}", &scope), json!(3.5));
        assert_eq!(resolve("{{ 7 // 2 }}", &scope), json!(3));
        assert_eq!(resolve("{{ -7 // 2 }}", &scope), json!(-4));
        assert_eq!(resolve("{{ -7 % 3 }}", &scope), json!(2));
        assert_eq!(resolve("{{ (result.total - 10) // 2 }}", &scope), json!(-2));
        assert_eq!(resolve("{{ 1 + 2 * 3 }}", &scope), json!(7));
        assert_eq!(resolve("{{ variables.ratio * 2 }}", &scope), json!(5.0));
        assert_eq!(resolve("{{ 'ab' ~ 3 }}", &scope), json!("ab3"));
    }

    #[test]
    fn boolean_logic_and_membership() {
        let scope = scope();
        assert_eq!(resolve("{{ 'brave' in inputs.tags }}", &scope), json!(true));
        assert_eq!(resolve("{{ 'shy' not in inputs.tags }}", &scope), json!(true));
        assert_eq!(resolve("{{ not variables.empty and inputs.n > 20 }}", &scope), json!(true));
        assert_eq!(resolve("{{ variables.counter || 'fallback' }}", &scope), json!("fallback"));
        assert_eq!(resolve("{{ 'hi' if inputs.n > 5 else 'lo' }}", &scope), json!("hi"));
        assert_eq!(resolve("{{ 'hi' if inputs.n > 50 }}", &scope), Value::Null);
    }

    #[test]
    fn indexing_and_filters() {
        let scope = scope();
        assert_eq!(resolve("{{ steps.pick.results[1].id }}", &scope), json!("y"));
        assert_eq!(resolve("{{ inputs.tags[-1] }}", &scope), json!("clever"));
        assert_eq!(resolve("{{ inputs['name']|title }}", &scope), json!("Ada Lovelace"));
        assert_eq!(resolve("{{ inputs.name|upper }}", &scope), json!("ADA LOVELACE"));
        assert_eq!(resolve("{{ inputs.tags|join(', ') }}", &scope), json!("brave, clever"));
        assert_eq!(resolve("{{ inputs.tags|length }}", &scope), json!(2));
        assert_eq!(resolve("{{ missing|default(5) }}", &scope), json!(5));
        assert_eq!(resolve("{{ '12'|int + 1 }}", &scope), json!(13));
        assert_eq!(resolve("{{ 2.567|round(2) }}", &scope), json!(2.57));
        assert_eq!(resolve("{{ -3|abs }}", &scope), json!(-3));
        assert_eq!(resolve("{{ (-3)|abs }}", &scope), json!(3));
        assert_eq!(resolve("{{ inputs.tags|first|capitalize }}", &scope), json!("Brave"));
        assert_eq!(resolve("{{ 'yes'|bool }}", &scope), json!(true));
    }

    #[test]
    fn malformed_expressions_are_template_errors() {
        let scope = scope();
        for template in ["{{ 1 + }}", "{{ inputs.n", "{{ }}", "{{ 'open }}", "{{ x|nope }}", "{{ 1 / 0 }}"] {
            let error = ExpressionResolver.resolve(template, &scope).expect_err(template);
            assert_eq!(error.template, template);
        }
    }

    #[test]
    fn string_repetition_is_capped() {
        let scope = json!({"inputs": {"width": i64::MAX, "small": 3}});
        assert_eq!(resolve("{{ '-' * inputs.small }}", &scope), json!("---"));
        assert_eq!(resolve("{{ 2 * 'ab' }}", &scope), json!("abab"));
        assert_eq!(resolve("{{ 'ab' * -4 }}", &scope), json!(""));

        for template in ["{{ 'ab' * inputs.width }}", "{{ '-' * 2000000 }}"] {
            let error = ExpressionResolver.resolve(template, &scope).expect_err(template);
            assert!(error.to_string().contains("string repetition too large"), "{error}");
        }
    }

    #[test]
    fn integer_division_at_the_minimum_does_not_overflow() {
        let scope = json!({"inputs": {"n": i64::MIN}});
        assert_eq!(resolve("{{ inputs.n % -1 }}", &scope), json!(0));
        assert_eq!(resolve("{{ inputs.n // -1 }}", &scope), json!(-(i64::MIN as f64)));
        assert_eq!(resolve("{{ inputs.n // 2 }}", &scope), json!(i64::MIN / 2));
        assert_eq!(resolve("{{ 7 % -3 }}", &scope), json!(-2));
    }

    #[test]
    fn closing_braces_inside_string_literals_do_not_end_the_expression() {
        let scope = scope();
        assert_eq!(resolve("{{ '}}' ~ 'x' }}", &scope), json!("}}x"));
    }

    #[test]
    fn conditions_accept_bare_expressions_and_falsy_strings() {
        let scope = scope();
        let resolver = ExpressionResolver;
        assert!(evaluate_condition(&resolver, "inputs.n > 20", &scope).unwrap());
        assert!(!evaluate_condition(&resolver, "{{ variables.counter }}", &scope).unwrap());
        assert!(!evaluate_condition(&resolver, "{{ 'fal' }}se", &scope).unwrap());
        assert!(!evaluate_condition(&resolver, "{{ 'False' }}", &scope).unwrap());
    }

    #[test]
    fn truthiness_matches_jinja() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!("false")));
        assert!(is_truthy(&json!([0])));
    }
}
