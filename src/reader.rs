// HostCL Reader - S-Expression Parser
//
// Implements the standard reader syntax for the value types the runtime
// has. Lists are proper; a consing dot is a syntax error.

use num_bigint::BigInt;
use thiserror::Error;

use crate::symbol::{PackageError, PackageId, ReadCase, SymbolId, SymbolTable, COMMON_LISP, CL_USER, KEYWORD};
use crate::types::Value;

/// Reader error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReaderError {
    #[error("unexpected end of input")]
    EndOfStream,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unbalanced close parenthesis")]
    UnbalancedParen,
    #[error("dotted lists are not supported")]
    DottedList,
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("unknown character name: {0}")]
    InvalidChar(String),
    #[error("undefined dispatch macro #{0}")]
    UnknownDispatch(char),
    #[error("a token consisting only of dots cannot be read")]
    DotToken,
    #[error(transparent)]
    Package(#[from] PackageError),
}

pub type ReaderResult = Result<Value, ReaderError>;

/// Where symbols are interned and how their names are folded.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub package: PackageId,
    pub case: ReadCase,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            package: CL_USER,
            case: ReadCase::Upcase,
        }
    }
}

/// Features `#+` and `#-` test against.
const FEATURES: &[&str] = &["HOSTCL", "COMMON-LISP", "IEEE-FLOATING-POINT"];

const CHAR_NAMES: &[(&str, char)] = &[
    ("SPACE", ' '),
    ("NEWLINE", '\n'),
    ("LINEFEED", '\n'),
    ("TAB", '\t'),
    ("RETURN", '\r'),
    ("PAGE", '\x0c'),
    ("BACKSPACE", '\x08'),
    ("RUBOUT", '\x7f'),
    ("NUL", '\0'),
    ("NULL", '\0'),
    ("ESCAPE", '\x1b'),
];

/// The preferred name of a character that needs one, as printed by `#\`.
pub fn char_name(c: char) -> Option<&'static str> {
    match c {
        ' ' => Some("Space"),
        '\n' => Some("Newline"),
        '\t' => Some("Tab"),
        '\r' => Some("Return"),
        '\x0c' => Some("Page"),
        '\x08' => Some("Backspace"),
        '\x7f' => Some("Rubout"),
        '\0' => Some("Nul"),
        '\x1b' => Some("Escape"),
        _ => None,
    }
}

fn is_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0c')
}

/// Terminating characters end a token.
pub fn is_delimiter(c: char) -> bool {
    is_whitespace(c) || matches!(c, '(' | ')' | '"' | ';' | '\'' | '`' | ',')
}

pub struct Reader<'a> {
    chars: &'a [char],
    index: usize,
    symbols: &'a mut SymbolTable,
    options: ReaderOptions,
}

impl<'a> Reader<'a> {
    pub fn new(chars: &'a [char], symbols: &'a mut SymbolTable, options: ReaderOptions) -> Self {
        Self {
            chars,
            index: 0,
            symbols,
            options,
        }
    }

    /// Resume reading at a character offset.
    pub fn at(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn position(&self) -> usize {
        self.index
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.index += 1;
        Some(c)
    }

    /// Reads the next object. `None` means the input ended cleanly.
    pub fn read(&mut self) -> Result<Option<Value>, ReaderError> {
        self.skip_whitespace()?;
        if self.peek().is_none() {
            return Ok(None);
        }
        self.read_object().map(Some)
    }

    /// Reads an object that must be present.
    fn read_required(&mut self) -> ReaderResult {
        self.skip_whitespace()?;
        match self.peek() {
            None => Err(ReaderError::EndOfStream),
            Some(')') => Err(ReaderError::UnexpectedChar(')')),
            Some(_) => self.read_object(),
        }
    }

    fn skip_whitespace(&mut self) -> Result<(), ReaderError> {
        loop {
            match self.peek() {
                Some(c) if is_whitespace(c) => {
                    self.index += 1;
                }
                Some(';') => {
                    while let Some(c) = self.next() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('#') if self.chars.get(self.index + 1) == Some(&'|') => {
                    self.index += 2;
                    self.skip_block_comment()?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// `#| ... |#`, nesting allowed.
    fn skip_block_comment(&mut self) -> Result<(), ReaderError> {
        let mut depth = 1;
        while depth > 0 {
            match self.next() {
                None => return Err(ReaderError::EndOfStream),
                Some('|') if self.peek() == Some('#') => {
                    self.index += 1;
                    depth -= 1;
                }
                Some('#') if self.peek() == Some('|') => {
                    self.index += 1;
                    depth += 1;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn read_object(&mut self) -> ReaderResult {
        let c = self.peek().ok_or(ReaderError::EndOfStream)?;
        match c {
            '(' => {
                self.index += 1;
                self.read_list(')').map(Value::list)
            }
            ')' => {
                self.index += 1;
                Err(ReaderError::UnbalancedParen)
            }
            '\'' => self.read_wrapped("QUOTE"),
            '`' => self.read_wrapped("QUASIQUOTE"),
            ',' => {
                self.index += 1;
                if self.peek() == Some('@') {
                    self.index += 1;
                    let form = self.read_required()?;
                    Ok(self.wrap("UNQUOTE-SPLICING", form))
                } else {
                    let form = self.read_required()?;
                    Ok(self.wrap("UNQUOTE", form))
                }
            }
            '"' => {
                self.index += 1;
                self.read_string()
            }
            '#' => {
                self.index += 1;
                self.read_dispatch()
            }
            _ => self.read_atom(),
        }
    }

    fn wrap(&mut self, name: &str, form: Value) -> Value {
        let head = self.symbols.intern_in(name, COMMON_LISP);
        Value::list(vec![Value::Symbol(head), form])
    }

    fn read_wrapped(&mut self, name: &str) -> ReaderResult {
        self.index += 1;
        let form = self.read_required()?;
        Ok(self.wrap(name, form))
    }

    /// Elements up to `close`, which is consumed.
    fn read_list(&mut self, close: char) -> Result<Vec<Value>, ReaderError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace()?;
            match self.peek() {
                None => return Err(ReaderError::EndOfStream),
                Some(c) if c == close => {
                    self.index += 1;
                    return Ok(items);
                }
                Some('.') if self.is_lone_dot() => return Err(ReaderError::DottedList),
                Some(_) => items.push(self.read_object()?),
            }
        }
    }

    fn is_lone_dot(&self) -> bool {
        match self.chars.get(self.index + 1) {
            None => true,
            Some(&c) => is_delimiter(c),
        }
    }

    fn read_string(&mut self) -> ReaderResult {
        let mut s = String::new();
        loop {
            match self.next() {
                None => return Err(ReaderError::EndOfStream),
                Some('"') => return Ok(Value::string(&s)),
                Some('\\') => match self.next() {
                    None => return Err(ReaderError::EndOfStream),
                    Some(c) => s.push(c),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn read_dispatch(&mut self) -> ReaderResult {
        let mut arg = String::new();
        while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
            arg.push(c);
            self.index += 1;
        }
        let c = self.next().ok_or(ReaderError::EndOfStream)?;
        match c.to_ascii_lowercase() {
            '\'' => {
                let form = self.read_required()?;
                Ok(self.wrap("FUNCTION", form))
            }
            '\\' => self.read_character(),
            '(' => Ok(Value::vector(self.read_list(')')?)),
            ':' => {
                let (name, _) = self.read_token(Some(self.options.case))?;
                let name: String = name.into_iter().map(|(c, _)| c).collect();
                Ok(Value::Symbol(self.symbols.make_symbol(&name)))
            }
            'x' => self.read_radix(16),
            'o' => self.read_radix(8),
            'b' => self.read_radix(2),
            'r' => {
                let radix: u32 = arg.parse().map_err(|_| ReaderError::InvalidNumber(arg.clone()))?;
                if !(2..=36).contains(&radix) {
                    return Err(ReaderError::InvalidNumber(format!("#{}r", radix)));
                }
                self.read_radix(radix)
            }
            '+' | '-' => {
                let feature = self.read_required()?;
                let wanted = c == '+';
                if self.feature_present(&feature) == wanted {
                    self.read_required()
                } else {
                    self.read_required()?;
                    match self.read()? {
                        Some(v) => Ok(v),
                        None => Err(ReaderError::EndOfStream),
                    }
                }
            }
            other => Err(ReaderError::UnknownDispatch(other)),
        }
    }

    fn feature_present(&self, feature: &Value) -> bool {
        match feature {
            Value::Symbol(s) => self
                .symbols
                .symbol_name(*s)
                .map(|n| FEATURES.contains(&n))
                .unwrap_or(false),
            Value::List(items) => {
                let op = items[0]
                    .as_symbol()
                    .and_then(|s| self.symbols.symbol_name(s))
                    .unwrap_or("");
                let rest = &items[1..];
                match op {
                    "AND" => rest.iter().all(|f| self.feature_present(f)),
                    "OR" => rest.iter().any(|f| self.feature_present(f)),
                    "NOT" => !rest.iter().any(|f| self.feature_present(f)),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    fn read_character(&mut self) -> ReaderResult {
        let first = self.next().ok_or(ReaderError::EndOfStream)?;
        let mut name = String::new();
        name.push(first);
        while let Some(c) = self.peek().filter(|c| !is_delimiter(*c)) {
            name.push(c);
            self.index += 1;
        }
        if name.chars().count() == 1 {
            return Ok(Value::Char(first));
        }
        let upper = name.to_ascii_uppercase();
        CHAR_NAMES
            .iter()
            .find(|(n, _)| *n == upper)
            .map(|(_, c)| Value::Char(*c))
            .ok_or(ReaderError::InvalidChar(name))
    }

    fn read_radix(&mut self, radix: u32) -> ReaderResult {
        let (token, _) = self.read_token(None)?;
        let text: String = token.into_iter().map(|(c, _)| c).collect();
        parse_integer(&text, radix).ok_or(ReaderError::InvalidNumber(text))
    }

    /// Collects a token with per-character escape flags, folding the
    /// case of unescaped characters when `case` is given.
    fn read_token(&mut self, case: Option<ReadCase>) -> Result<(Vec<(char, bool)>, bool), ReaderError> {
        let mut chars: Vec<(char, bool)> = Vec::new();
        let mut in_multi_escape = false;
        let mut saw_escape = false;

        while let Some(c) = self.peek() {
            if in_multi_escape {
                self.index += 1;
                match c {
                    '|' => in_multi_escape = false,
                    '\\' => chars.push((self.next().ok_or(ReaderError::EndOfStream)?, true)),
                    _ => chars.push((c, true)),
                }
                continue;
            }
            match c {
                '\\' => {
                    self.index += 1;
                    saw_escape = true;
                    chars.push((self.next().ok_or(ReaderError::EndOfStream)?, true));
                }
                '|' => {
                    self.index += 1;
                    saw_escape = true;
                    in_multi_escape = true;
                }
                c if is_delimiter(c) => break,
                _ => {
                    self.index += 1;
                    chars.push((c, false));
                }
            }
        }
        if in_multi_escape {
            return Err(ReaderError::EndOfStream);
        }

        if let Some(case) = case {
            let unescaped: String = chars.iter().filter(|(_, e)| !e).map(|(c, _)| *c).collect();
            let folded = case.apply(&unescaped);
            if folded.chars().count() == unescaped.chars().count() {
                let mut folded = folded.chars();
                for (c, escaped) in chars.iter_mut() {
                    if !*escaped {
                        if let Some(f) = folded.next() {
                            *c = f;
                        }
                    }
                }
            }
        }
        Ok((chars, saw_escape))
    }

    fn read_atom(&mut self) -> ReaderResult {
        let (token, escaped) = self.read_token(Some(self.options.case))?;
        let text: String = token.iter().map(|(c, _)| *c).collect();

        if !escaped {
            if !text.is_empty() && text.chars().all(|c| c == '.') {
                return Err(ReaderError::DotToken);
            }
            if let Some(number) = parse_number(&text) {
                return Ok(number);
            }
        }

        // Package markers are the unescaped colons.
        let colons: Vec<usize> = token
            .iter()
            .enumerate()
            .filter(|(_, (c, e))| *c == ':' && !e)
            .map(|(i, _)| i)
            .collect();
        let name_from = |start: usize| -> String { token[start..].iter().map(|(c, _)| *c).collect() };

        match colons.as_slice() {
            [] => self.resolve(&text, self.options.package),
            [0] => Ok(Value::Symbol(self.symbols.intern_keyword(&name_from(1)))),
            [0, 1] => Ok(Value::Symbol(self.symbols.intern_keyword(&name_from(2)))),
            [i] => {
                let package: String = token[..*i].iter().map(|(c, _)| *c).collect();
                let name = name_from(i + 1);
                let pkg = self.symbols.require_package(&package)?;
                if pkg == KEYWORD {
                    return Ok(Value::Symbol(self.symbols.intern_keyword(&name)));
                }
                match self.symbols.find_symbol(&name, pkg) {
                    Some((sym, crate::symbol::Visibility::External)) => Ok(self.symbol_value(sym)),
                    _ => Err(PackageError::NotAccessible {
                        symbol: name,
                        package,
                    }
                    .into()),
                }
            }
            [i, j] if *j == i + 1 => {
                let package: String = token[..*i].iter().map(|(c, _)| *c).collect();
                let pkg = self.symbols.require_package(&package)?;
                self.resolve(&name_from(j + 1), pkg)
            }
            _ => Err(ReaderError::UnexpectedChar(':')),
        }
    }

    /// Interns `name` in `pkg`; the symbol NIL of COMMON-LISP reads as ().
    fn resolve(&mut self, name: &str, pkg: PackageId) -> ReaderResult {
        if name == "NIL" && self.symbols.find_symbol(name, pkg).is_none() {
            return Ok(Value::Nil);
        }
        let sym = self.symbols.intern_in(name, pkg);
        Ok(self.symbol_value(sym))
    }

    fn symbol_value(&self, sym: SymbolId) -> Value {
        if self.symbols.symbol_name(sym) == Some("NIL")
            && self.symbols.symbol_package(sym) == Some(COMMON_LISP)
        {
            Value::Nil
        } else {
            Value::Symbol(sym)
        }
    }
}

fn split_sign(s: &str) -> (bool, &str) {
    if let Some(rest) = s.strip_prefix('-') {
        (true, rest)
    } else if let Some(rest) = s.strip_prefix('+') {
        (false, rest)
    } else {
        (false, s)
    }
}

/// Integer in `radix` with an optional sign.
pub fn parse_integer(s: &str, radix: u32) -> Option<Value> {
    let (neg, digits) = split_sign(s);
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let mut n = BigInt::parse_bytes(digits.to_ascii_lowercase().as_bytes(), radix)?;
    if neg {
        n = -n;
    }
    Some(Value::from_bigint(n))
}

/// Parses a token as a number, if it is one. A trailing dot marks a
/// decimal integer.
pub fn parse_number(s: &str) -> Option<Value> {
    if let Some(body) = s.strip_suffix('.') {
        if let Some(v) = parse_integer(body, 10) {
            return Some(v);
        }
    }
    if let Some(v) = parse_integer(s, 10) {
        return Some(v);
    }
    parse_float(s).map(Value::Float)
}

fn parse_float(s: &str) -> Option<f64> {
    let (neg, rest) = split_sign(s);
    let marker = rest.find(|c: char| matches!(c, 'e' | 'E' | 'd' | 'D' | 'f' | 'F' | 's' | 'S' | 'l' | 'L'));
    let (mantissa, exponent) = match marker {
        Some(i) => (&rest[..i], Some(&rest[i + 1..])),
        None => (rest, None),
    };

    let mut saw_digit = false;
    let mut saw_dot = false;
    for c in mantissa.chars() {
        match c {
            '.' if !saw_dot => saw_dot = true,
            c if c.is_ascii_digit() => saw_digit = true,
            _ => return None,
        }
    }
    // An exponent-less float needs a fraction: "1." is an integer.
    if !saw_digit || (exponent.is_none() && (!saw_dot || mantissa.ends_with('.'))) {
        return None;
    }

    let mut normalized = String::new();
    if neg {
        normalized.push('-');
    }
    normalized.push_str(mantissa);
    if let Some(exp) = exponent {
        let (exp_neg, digits) = split_sign(exp);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        normalized.push('e');
        if exp_neg {
            normalized.push('-');
        }
        normalized.push_str(digits);
    }
    normalized.parse::<f64>().ok()
}

/// Reads the first object of `input`.
pub fn read_from_string(input: &str, symbols: &mut SymbolTable, options: &ReaderOptions) -> ReaderResult {
    let chars: Vec<char> = input.chars().collect();
    let mut reader = Reader::new(&chars, symbols, *options);
    reader.read()?.ok_or(ReaderError::EndOfStream)
}

/// Reads every object of `input`.
pub fn read_all(input: &str, symbols: &mut SymbolTable, options: &ReaderOptions) -> Result<Vec<Value>, ReaderError> {
    let chars: Vec<char> = input.chars().collect();
    let mut reader = Reader::new(&chars, symbols, *options);
    let mut forms = Vec::new();
    while let Some(form) = reader.read()? {
        forms.push(form);
    }
    Ok(forms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(table: &mut SymbolTable, text: &str) -> Value {
        read_from_string(text, table, &ReaderOptions::default()).unwrap()
    }

    fn name(table: &SymbolTable, v: &Value) -> String {
        table.symbol_name(v.as_symbol().unwrap()).unwrap().to_string()
    }

    #[test]
    fn test_read_integers() {
        let mut table = SymbolTable::new();
        assert_eq!(read(&mut table, "42"), Value::Integer(42));
        assert_eq!(read(&mut table, "-17"), Value::Integer(-17));
        assert_eq!(read(&mut table, "+5"), Value::Integer(5));
        assert_eq!(read(&mut table, "10."), Value::Integer(10));
        assert_eq!(read(&mut table, "#xFF"), Value::Integer(255));
        assert_eq!(read(&mut table, "#b-101"), Value::Integer(-5));
        assert_eq!(read(&mut table, "#o17"), Value::Integer(15));
        assert_eq!(read(&mut table, "#36rZ"), Value::Integer(35));
        let big = read(&mut table, "123456789012345678901234567890");
        assert!(matches!(big, Value::BigInt(_)));
    }

    #[test]
    fn test_read_floats() {
        let mut table = SymbolTable::new();
        assert_eq!(read(&mut table, "1.5"), Value::Float(1.5));
        assert_eq!(read(&mut table, "-.5"), Value::Float(-0.5));
        assert_eq!(read(&mut table, "1e3"), Value::Float(1000.0));
        assert_eq!(read(&mut table, "2.5d-1"), Value::Float(0.25));
        // Not numbers
        assert!(matches!(read(&mut table, "1+"), Value::Symbol(_)));
        assert!(matches!(read(&mut table, "-"), Value::Symbol(_)));
    }

    #[test]
    fn test_read_symbols_and_case() {
        let mut table = SymbolTable::new();
        let v = read(&mut table, "hello");
        assert_eq!(name(&table, &v), "HELLO");
        let v = read(&mut table, "|Mixed Case|");
        assert_eq!(name(&table, &v), "Mixed Case");
        let v = read(&mut table, "ab\\c");
        assert_eq!(name(&table, &v), "ABc");

        let options = ReaderOptions { case: ReadCase::Preserve, ..ReaderOptions::default() };
        let v = read_from_string("Hello", &mut table, &options).unwrap();
        assert_eq!(name(&table, &v), "Hello");
    }

    #[test]
    fn test_read_keywords_and_packages() {
        let mut table = SymbolTable::new();
        let k = read(&mut table, ":test");
        assert!(table.is_keyword(k.as_symbol().unwrap()));

        let u = read(&mut table, "#:temp");
        assert_eq!(table.symbol_package(u.as_symbol().unwrap()), None);

        let internal = read(&mut table, "cl-user::secret");
        assert_eq!(table.symbol_package(internal.as_symbol().unwrap()), Some(CL_USER));
        let err = read_from_string("cl-user:secret", &mut table, &ReaderOptions::default()).unwrap_err();
        assert!(matches!(err, ReaderError::Package(PackageError::NotAccessible { .. })));
        let err = read_from_string("nowhere:x", &mut table, &ReaderOptions::default()).unwrap_err();
        assert!(matches!(err, ReaderError::Package(PackageError::NoSuchPackage(_))));
    }

    #[test]
    fn test_read_lists_and_quote() {
        let mut table = SymbolTable::new();
        let v = read(&mut table, "(a (b c) ())");
        let items = v.as_list().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].as_list().unwrap().len(), 2);
        assert!(items[2].is_nil());

        let q = read(&mut table, "'x");
        let items = q.as_list().unwrap();
        assert_eq!(name(&table, &items[0]), "QUOTE");

        let f = read(&mut table, "#'car");
        assert_eq!(name(&table, &f.as_list().unwrap()[0]), "FUNCTION");

        let qq = read(&mut table, "`(a ,b ,@c)");
        let items = qq.as_list().unwrap();
        assert_eq!(name(&table, &items[0]), "QUASIQUOTE");
        let inner = items[1].as_list().unwrap();
        assert_eq!(name(&table, &inner[1].as_list().unwrap()[0]), "UNQUOTE");
        assert_eq!(name(&table, &inner[2].as_list().unwrap()[0]), "UNQUOTE-SPLICING");
    }

    #[test]
    fn test_read_nil_and_strings_and_chars() {
        let mut table = SymbolTable::new();
        assert!(read(&mut table, "nil").is_nil());
        assert!(read(&mut table, "()").is_nil());
        assert_eq!(read(&mut table, "\"a\\\"b\""), Value::string("a\"b"));
        assert_eq!(read(&mut table, "#\\a"), Value::Char('a'));
        assert_eq!(read(&mut table, "#\\Space"), Value::Char(' '));
        assert_eq!(read(&mut table, "#\\newline"), Value::Char('\n'));
        assert_eq!(read(&mut table, "#\\("), Value::Char('('));
        assert!(matches!(
            read_from_string("#\\Bogus", &mut table, &ReaderOptions::default()),
            Err(ReaderError::InvalidChar(_))
        ));
    }

    #[test]
    fn test_read_vector_and_comments() {
        let mut table = SymbolTable::new();
        let v = read(&mut table, "; line\n #| block #| nested |# |# #(1 2 3)");
        assert_eq!(v.as_sequence().map(|s| s.len()), Some(3));
        assert!(matches!(v, Value::Vector(_)));
    }

    #[test]
    fn test_read_errors() {
        let mut table = SymbolTable::new();
        let opts = ReaderOptions::default();
        assert_eq!(read_from_string("(a . b)", &mut table, &opts), Err(ReaderError::DottedList));
        assert_eq!(read_from_string("(a b", &mut table, &opts), Err(ReaderError::EndOfStream));
        assert_eq!(read_from_string(")", &mut table, &opts), Err(ReaderError::UnbalancedParen));
        assert_eq!(read_from_string("   ", &mut table, &opts), Err(ReaderError::EndOfStream));
        assert_eq!(read_from_string("\"abc", &mut table, &opts), Err(ReaderError::EndOfStream));
    }

    #[test]
    fn test_read_features() {
        let mut table = SymbolTable::new();
        let forms = read_all("#+hostcl 1 #-hostcl 2 #+(or nothing hostcl) 3", &mut table, &ReaderOptions::default()).unwrap();
        assert_eq!(forms, vec![Value::Integer(1), Value::Integer(3)]);
    }

    #[test]
    fn test_read_all_positions() {
        let mut table = SymbolTable::new();
        let chars: Vec<char> = "a b".chars().collect();
        let mut reader = Reader::new(&chars, &mut table, ReaderOptions::default());
        assert!(reader.read().unwrap().is_some());
        let pos = reader.position();
        let mut reader = Reader::new(&chars, &mut table, ReaderOptions::default()).at(pos);
        assert!(reader.read().unwrap().is_some());
        assert!(reader.read().unwrap().is_none());
    }
}
