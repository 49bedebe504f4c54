// HostCL Printer - Value Output
//
// Implements the PRIN1/PRINC/PRINT family and a FORMAT subset. Printer
// control comes from the *PRINT-...* special variables, read into a
// PrintOptions at each printing call.

use num_bigint::BigInt;
use thiserror::Error;

use crate::clos::ClassTable;
use crate::eval::Interpreter;
use crate::reader::{char_name, parse_number};
use crate::symbol::{PackageId, PrintCase, SymbolId, SymbolTable, COMMON_LISP, CL_USER};
use crate::types::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrintError {
    #[error("{0} cannot be printed readably")]
    NotReadable(String),
    #[error("unknown format directive ~{0}")]
    BadDirective(char),
    #[error("not enough arguments for the format control string")]
    MissingArgument,
    #[error("unterminated format directive")]
    Unterminated,
}

/// Print options
#[derive(Debug, Clone)]
pub struct PrintOptions {
    /// Print vectors as #(...)
    pub array: bool,
    /// Radix for integers
    pub base: u32,
    pub case: PrintCase,
    /// Accepted for completeness; shared structure is not detected
    pub circle: bool,
    /// Print readably (escape special chars)
    pub escape: bool,
    /// Prefix uninterned symbols with #:
    pub gensym: bool,
    /// Maximum list length to print
    pub length: Option<usize>,
    /// Maximum depth to print
    pub level: Option<usize>,
    /// Pretty print
    pub pretty: bool,
    /// Print a radix marker on integers
    pub radix: bool,
    pub readably: bool,
    pub right_margin: usize,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            array: true,
            base: 10,
            case: PrintCase::Upcase,
            circle: false,
            escape: true,
            gensym: true,
            length: None,
            level: None,
            pretty: false,
            radix: false,
            readably: false,
            right_margin: 80,
        }
    }
}

impl PrintOptions {
    /// For prin1 (readable)
    pub fn prin1() -> Self {
        Self::default()
    }

    /// For princ (human-readable)
    pub fn princ() -> Self {
        Self {
            escape: false,
            ..Self::default()
        }
    }

    /// READABLY overrides the options that would lose information.
    pub fn normalized(mut self) -> Self {
        if self.readably {
            self.escape = true;
            self.array = true;
            self.gensym = true;
            self.length = None;
            self.level = None;
        }
        self
    }

    /// Current settings of the printer variables.
    pub fn from_specials(interp: &Interpreter<'_>) -> Self {
        let vars = &interp.globals.print_vars;
        let flag = |sym: SymbolId, default: bool| {
            interp.special_value(sym).map(|v| v.is_true()).unwrap_or(default)
        };
        let limit = |sym: SymbolId| {
            interp
                .special_value(sym)
                .and_then(|v| v.as_integer())
                .and_then(|n| usize::try_from(n).ok())
        };
        let defaults = Self::default();
        let case = interp
            .special_value(vars.case)
            .and_then(|v| v.as_symbol())
            .and_then(|s| PrintCase::from_name(&interp.symbol_name(s)))
            .unwrap_or(defaults.case);
        let base = interp
            .special_value(vars.base)
            .and_then(|v| v.as_integer())
            .filter(|b| (2..=36).contains(b))
            .map(|b| b as u32)
            .unwrap_or(defaults.base);
        Self {
            array: flag(vars.array, defaults.array),
            base,
            case,
            circle: flag(vars.circle, defaults.circle),
            escape: flag(vars.escape, defaults.escape),
            gensym: flag(vars.gensym, defaults.gensym),
            length: limit(vars.length),
            level: limit(vars.level),
            pretty: flag(vars.pretty, defaults.pretty),
            radix: flag(vars.radix, defaults.radix),
            readably: flag(vars.readably, defaults.readably),
            right_margin: limit(vars.right_margin).unwrap_or(defaults.right_margin),
        }
        .normalized()
    }
}

/// The printer control variables.
#[derive(Debug, Clone, Copy)]
pub struct PrintVariables {
    pub array: SymbolId,
    pub base: SymbolId,
    pub case: SymbolId,
    pub circle: SymbolId,
    pub escape: SymbolId,
    pub gensym: SymbolId,
    pub length: SymbolId,
    pub level: SymbolId,
    pub pretty: SymbolId,
    pub radix: SymbolId,
    pub readably: SymbolId,
    pub right_margin: SymbolId,
}

impl PrintVariables {
    /// Interns the variables in COMMON-LISP with their default values.
    pub fn intern(table: &mut SymbolTable, t: SymbolId) -> Self {
        let upcase = Value::Symbol(table.intern_keyword("UPCASE"));
        let mut var = |name: &str, value: Value| {
            let sym = table.intern_exported(name, COMMON_LISP);
            table.set_symbol_value(sym, value);
            sym
        };
        Self {
            array: var("*PRINT-ARRAY*", Value::Symbol(t)),
            base: var("*PRINT-BASE*", Value::Integer(10)),
            case: var("*PRINT-CASE*", upcase),
            circle: var("*PRINT-CIRCLE*", Value::Nil),
            escape: var("*PRINT-ESCAPE*", Value::Symbol(t)),
            gensym: var("*PRINT-GENSYM*", Value::Symbol(t)),
            length: var("*PRINT-LENGTH*", Value::Nil),
            level: var("*PRINT-LEVEL*", Value::Nil),
            pretty: var("*PRINT-PRETTY*", Value::Nil),
            radix: var("*PRINT-RADIX*", Value::Nil),
            readably: var("*PRINT-READABLY*", Value::Nil),
            right_margin: var("*PRINT-RIGHT-MARGIN*", Value::Nil),
        }
    }

    pub fn all(&self) -> [SymbolId; 12] {
        [
            self.array,
            self.base,
            self.case,
            self.circle,
            self.escape,
            self.gensym,
            self.length,
            self.level,
            self.pretty,
            self.radix,
            self.readably,
            self.right_margin,
        ]
    }
}

/// The HostCL Printer
pub struct Printer<'a> {
    symbols: &'a SymbolTable,
    classes: Option<&'a ClassTable>,
    package: PackageId,
    options: PrintOptions,
    abbreviations: Vec<(SymbolId, &'static str)>,
}

impl<'a> Printer<'a> {
    pub fn new(symbols: &'a SymbolTable, options: PrintOptions) -> Self {
        let abbreviations = [
            ("QUOTE", "'"),
            ("FUNCTION", "#'"),
            ("QUASIQUOTE", "`"),
            ("UNQUOTE", ","),
            ("UNQUOTE-SPLICING", ",@"),
        ]
        .iter()
        .filter_map(|(name, prefix)| {
            let sym = symbols.get_package(COMMON_LISP)?.accessible(name)?;
            Some((sym, *prefix))
        })
        .collect();
        Self {
            symbols,
            classes: None,
            package: CL_USER,
            options: options.normalized(),
            abbreviations,
        }
    }

    /// Symbols accessible in `package` print without a prefix.
    pub fn with_package(mut self, package: PackageId) -> Self {
        self.package = package;
        self
    }

    pub fn with_classes(mut self, classes: &'a ClassTable) -> Self {
        self.classes = Some(classes);
        self
    }

    /// Print a value to a string
    pub fn print(&self, value: &Value) -> Result<String, PrintError> {
        if self.options.pretty {
            self.layout(value, 0, 0)
        } else {
            let mut out = String::new();
            self.write_value(&mut out, value, 0)?;
            Ok(out)
        }
    }

    fn unreadable(&self, out: &mut String, text: String) -> Result<(), PrintError> {
        if self.options.readably {
            return Err(PrintError::NotReadable(text));
        }
        out.push_str(&text);
        Ok(())
    }

    fn write_value(&self, out: &mut String, value: &Value, depth: usize) -> Result<(), PrintError> {
        match value {
            Value::Nil => out.push_str(&self.options.case.apply("NIL")),
            Value::Integer(n) => self.write_integer(out, &BigInt::from(*n)),
            Value::BigInt(n) => self.write_integer(out, n),
            Value::Float(f) => {
                if !f.is_finite() {
                    return self.unreadable(out, format!("#<FLOAT {}>", f));
                }
                out.push_str(&float_text(*f));
            }
            Value::Char(c) => {
                if self.options.escape {
                    out.push_str("#\\");
                    match char_name(*c) {
                        Some(name) => out.push_str(name),
                        None => out.push(*c),
                    }
                } else {
                    out.push(*c);
                }
            }
            Value::String(s) => {
                if self.options.escape {
                    out.push('"');
                    for c in s.chars() {
                        if c == '"' || c == '\\' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                } else {
                    out.push_str(s);
                }
            }
            Value::Symbol(s) => self.write_symbol(out, *s),
            Value::List(items) => self.write_list(out, items, depth)?,
            Value::Vector(items) => {
                if !self.options.array {
                    return self.unreadable(out, format!("#<VECTOR {}>", items.len()));
                }
                out.push('#');
                self.write_list(out, items, depth)?;
            }
            Value::Package(p) => {
                let text = format!("#<PACKAGE {}>", self.symbols.package_name(*p));
                return self.unreadable(out, text);
            }
            Value::Function(f) => {
                return self.unreadable(out, format!("#<FUNCTION {}>", f.display_name()));
            }
            Value::Condition(c) => {
                let text = format!("#<CONDITION {}>", self.class_label(c.class));
                return self.unreadable(out, text);
            }
            Value::Restart(r) => {
                let name = r
                    .name
                    .and_then(|n| self.symbols.symbol_name(n))
                    .unwrap_or("anonymous");
                return self.unreadable(out, format!("#<RESTART {}>", name));
            }
            Value::Instance(i) => {
                let text = format!("#<{} instance>", self.class_label(i.class));
                return self.unreadable(out, text);
            }
            Value::Class(c) => {
                let text = format!("#<CLASS {}>", self.class_label(*c));
                return self.unreadable(out, text);
            }
            Value::Unbound => return self.unreadable(out, "#<UNBOUND>".to_string()),
        }
        Ok(())
    }

    fn class_label(&self, class: crate::clos::ClassId) -> String {
        match self.classes {
            Some(classes) => self
                .symbols
                .symbol_name(classes.class_name(class))
                .unwrap_or("?")
                .to_string(),
            None => format!("class-{}", class.0),
        }
    }

    fn write_integer(&self, out: &mut String, n: &BigInt) {
        let base = self.options.base;
        if self.options.radix {
            match base {
                2 => out.push_str("#b"),
                8 => out.push_str("#o"),
                16 => out.push_str("#x"),
                10 => {}
                _ => out.push_str(&format!("#{}r", base)),
            }
        }
        out.push_str(&n.to_str_radix(base).to_uppercase());
        if self.options.radix && base == 10 {
            out.push('.');
        }
    }

    fn write_symbol(&self, out: &mut String, sym: SymbolId) {
        let Some(symbol) = self.symbols.get_symbol(sym) else {
            out.push_str("#<invalid symbol>");
            return;
        };
        if !self.options.escape {
            out.push_str(&self.options.case.apply(&symbol.name));
            return;
        }
        match symbol.package {
            Some(_) if symbol.is_keyword() => out.push(':'),
            Some(home) => {
                if self.symbols.find_symbol(&symbol.name, self.package).map(|(s, _)| s) != Some(sym) {
                    out.push_str(&self.escaped_name(self.symbols.package_name(home)));
                    let external = self
                        .symbols
                        .get_package(home)
                        .map(|p| p.is_external(sym))
                        .unwrap_or(false);
                    out.push_str(if external { ":" } else { "::" });
                }
            }
            None => {
                if self.options.gensym {
                    out.push_str("#:");
                }
            }
        }
        out.push_str(&self.escaped_name(&symbol.name));
    }

    fn escaped_name(&self, name: &str) -> String {
        if !needs_bars(name) {
            return self.options.case.apply(name);
        }
        let mut s = String::with_capacity(name.len() + 2);
        s.push('|');
        for c in name.chars() {
            if c == '|' || c == '\\' {
                s.push('\\');
            }
            s.push(c);
        }
        s.push('|');
        s
    }

    fn abbreviation(&self, items: &[Value]) -> Option<&'static str> {
        if items.len() != 2 {
            return None;
        }
        let head = items[0].as_symbol()?;
        self.abbreviations.iter().find(|(s, _)| *s == head).map(|(_, p)| *p)
    }

    fn write_list(&self, out: &mut String, items: &[Value], depth: usize) -> Result<(), PrintError> {
        if let Some(limit) = self.options.level {
            if depth >= limit {
                out.push('#');
                return Ok(());
            }
        }
        if let Some(prefix) = self.abbreviation(items) {
            out.push_str(prefix);
            return self.write_value(out, &items[1], depth);
        }
        out.push('(');
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            if self.options.length.is_some_and(|limit| i >= limit) {
                out.push_str("...");
                break;
            }
            self.write_value(out, item, depth + 1)?;
        }
        out.push(')');
        Ok(())
    }

    /// Pretty layout: a list that does not fit in the remaining width
    /// puts each argument on its own line under the first one.
    fn layout(&self, value: &Value, column: usize, depth: usize) -> Result<String, PrintError> {
        let mut flat = String::new();
        self.write_value(&mut flat, value, depth)?;
        let items = match value {
            Value::List(items) if self.abbreviation(items).is_none() => items,
            _ => return Ok(flat),
        };
        if column + flat.chars().count() <= self.options.right_margin || items.len() < 2 {
            return Ok(flat);
        }
        if self.options.level.is_some_and(|limit| depth >= limit) {
            return Ok(flat);
        }

        let mut out = String::from("(");
        let head = self.layout(&items[0], column + 1, depth + 1)?;
        let indent = if matches!(items[0], Value::Symbol(_)) {
            column + 2
        } else {
            column + 1
        };
        out.push_str(&head);
        for (i, item) in items.iter().enumerate().skip(1) {
            out.push('\n');
            out.push_str(&" ".repeat(indent));
            if self.options.length.is_some_and(|limit| i >= limit) {
                out.push_str("...");
                break;
            }
            out.push_str(&self.layout(item, indent, depth + 1)?);
        }
        out.push(')');
        Ok(out)
    }
}

/// Names that would not read back as the same symbol need |bars|.
fn needs_bars(name: &str) -> bool {
    name.is_empty()
        || name.starts_with('#')
        || name.chars().all(|c| c == '.')
        || name.chars().any(|c| {
            c.is_lowercase()
                || c.is_whitespace()
                || matches!(c, '(' | ')' | '\'' | '"' | ';' | '|' | '\\' | ',' | '`' | ':')
        })
        || parse_number(name).is_some()
}

/// Shortest round-tripping text, always with a decimal point.
fn float_text(f: f64) -> String {
    let text = format!("{:?}", f);
    match text.find('e') {
        Some(i) if !text[..i].contains('.') => format!("{}.0{}", &text[..i], &text[i..]),
        _ => text,
    }
}

/// PRIN1 output with default options, for diagnostics.
pub fn show(symbols: &SymbolTable, value: &Value) -> String {
    Printer::new(symbols, PrintOptions::prin1())
        .print(value)
        .unwrap_or_else(|e| e.to_string())
}

/// Prints `value` with the current printer variables; `escape` selects
/// PRIN1 or PRINC behaviour.
pub fn print_to_string(interp: &Interpreter<'_>, value: &Value, escape: bool) -> Result<String, PrintError> {
    let mut options = PrintOptions::from_specials(interp);
    if !options.readably {
        options.escape = escape;
    }
    let package = interp.current_package();
    let symbols = interp.globals.symbols();
    let classes = interp.globals.classes();
    Printer::new(&symbols, options)
        .with_package(package)
        .with_classes(&classes)
        .print(value)
}

/// FORMAT with a nil destination.
pub fn format(interp: &Interpreter<'_>, control: &str, args: &[Value]) -> Result<String, PrintError> {
    let control: Vec<char> = control.chars().collect();
    let mut out = String::new();
    let mut next = 0;
    format_into(interp, &mut out, &control, args, &mut next)?;
    Ok(out)
}

struct Directive {
    params: Vec<Option<i64>>,
    colon: bool,
    at: bool,
    op: char,
}

fn parse_directive(control: &[char], i: &mut usize) -> Result<Directive, PrintError> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut any = false;
    loop {
        match control.get(*i) {
            Some(&d) if d.is_ascii_digit() || (d == '-' && current.is_empty()) => {
                current.push(d);
                any = true;
                *i += 1;
            }
            Some(',') => {
                params.push(current.parse().ok());
                current.clear();
                any = true;
                *i += 1;
            }
            _ => break,
        }
    }
    if any {
        params.push(current.parse().ok());
    }
    let (mut colon, mut at) = (false, false);
    loop {
        match control.get(*i) {
            Some(':') => colon = true,
            Some('@') => at = true,
            _ => break,
        }
        *i += 1;
    }
    let op = *control.get(*i).ok_or(PrintError::Unterminated)?;
    *i += 1;
    Ok(Directive { params, colon, at, op })
}

/// Index of the `~}` closing the iteration whose body starts at `start`.
fn matching_close(control: &[char], start: usize) -> Result<usize, PrintError> {
    let mut depth = 0;
    let mut i = start;
    while i < control.len() {
        if control[i] == '~' {
            let at = i;
            i += 1;
            let d = parse_directive(control, &mut i)?;
            match d.op {
                '{' => depth += 1,
                '}' if depth == 0 => return Ok(at),
                '}' => depth -= 1,
                _ => {}
            }
        } else {
            i += 1;
        }
    }
    Err(PrintError::Unterminated)
}

fn pad(text: String, mincol: Option<i64>, left: bool) -> String {
    let width = mincol.unwrap_or(0).max(0) as usize;
    let len = text.chars().count();
    if len >= width {
        return text;
    }
    let fill = " ".repeat(width - len);
    if left {
        fill + &text
    } else {
        text + &fill
    }
}

/// Runs `control` against `args` from `next`. Returns true when `~^`
/// ended the pass early.
fn format_into(
    interp: &Interpreter<'_>,
    out: &mut String,
    control: &[char],
    args: &[Value],
    next: &mut usize,
) -> Result<bool, PrintError> {
    let mut take = |next: &mut usize| -> Result<Value, PrintError> {
        let v = args.get(*next).cloned().ok_or(PrintError::MissingArgument)?;
        *next += 1;
        Ok(v)
    };
    let mut i = 0;
    while i < control.len() {
        let c = control[i];
        i += 1;
        if c != '~' {
            out.push(c);
            continue;
        }
        let d = parse_directive(control, &mut i)?;
        let mincol = d.params.first().copied().flatten();
        match d.op.to_ascii_uppercase() {
            'A' => {
                let arg = take(next)?;
                let text = match &arg {
                    Value::Condition(c) => crate::conditions::describe_condition(interp, c),
                    Value::Nil if d.colon => "()".to_string(),
                    other => print_to_string(interp, other, false)?,
                };
                out.push_str(&pad(text, mincol, d.at));
            }
            'S' => {
                let arg = take(next)?;
                out.push_str(&pad(print_to_string(interp, &arg, true)?, mincol, d.at));
            }
            op @ ('D' | 'B' | 'O' | 'X') => {
                let arg = take(next)?;
                let base = match op {
                    'B' => 2,
                    'O' => 8,
                    'X' => 16,
                    _ => 10,
                };
                let text = match &arg {
                    Value::Integer(n) => {
                        let s = BigInt::from(*n).to_str_radix(base).to_uppercase();
                        if d.at && *n >= 0 { format!("+{}", s) } else { s }
                    }
                    Value::BigInt(n) => n.to_str_radix(base).to_uppercase(),
                    other => print_to_string(interp, other, false)?,
                };
                out.push_str(&pad(text, mincol, true));
            }
            'F' => {
                let arg = take(next)?;
                let x = match &arg {
                    Value::Float(f) => Some(*f),
                    Value::Integer(n) => Some(*n as f64),
                    _ => None,
                };
                let text = match (x, d.params.get(1).copied().flatten()) {
                    (Some(x), Some(digits)) => format!("{:.*}", digits.max(0) as usize, x),
                    (Some(x), None) => float_text(x),
                    (None, _) => print_to_string(interp, &arg, false)?,
                };
                out.push_str(&pad(text, mincol, true));
            }
            'C' => match take(next)? {
                Value::Char(c) if d.colon => match char_name(c) {
                    Some(name) => out.push_str(name),
                    None => out.push(c),
                },
                Value::Char(c) => out.push(c),
                other => out.push_str(&print_to_string(interp, &other, false)?),
            },
            'P' => {
                if d.colon {
                    *next = next.saturating_sub(1);
                }
                let arg = take(next)?;
                let plural = !matches!(arg, Value::Integer(1));
                match (d.at, plural) {
                    (true, true) => out.push_str("ies"),
                    (true, false) => out.push('y'),
                    (false, true) => out.push('s'),
                    (false, false) => {}
                }
            }
            '%' => {
                for _ in 0..mincol.unwrap_or(1).max(1) {
                    out.push('\n');
                }
            }
            '&' => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            '~' => out.push('~'),
            '*' => {
                if d.colon {
                    *next = next.saturating_sub(1);
                } else {
                    take(next)?;
                }
            }
            '\n' => {
                while control.get(i).is_some_and(|c| c.is_whitespace()) {
                    i += 1;
                }
            }
            '^' => {
                if *next >= args.len() {
                    return Ok(true);
                }
            }
            '{' => {
                let close = matching_close(control, i)?;
                let body = &control[i..close];
                let list = take(next)?;
                let items = list.as_list().unwrap_or(&[]);
                let mut inner = 0;
                while inner < items.len() {
                    let before = inner;
                    if format_into(interp, out, body, items, &mut inner)? || inner == before {
                        break;
                    }
                }
                // Skip the closing directive.
                i = close + 1;
                parse_directive(control, &mut i)?;
            }
            other => return Err(PrintError::BadDirective(other)),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{read_from_string, ReaderOptions};
    use crate::symbol::ReadCase;

    fn read(table: &mut SymbolTable, text: &str) -> Value {
        read_from_string(text, table, &ReaderOptions::default()).unwrap()
    }

    fn prin1(table: &SymbolTable, v: &Value) -> String {
        Printer::new(table, PrintOptions::prin1()).print(v).unwrap()
    }

    #[test]
    fn test_print_atoms() {
        let table = SymbolTable::new();
        assert_eq!(prin1(&table, &Value::Nil), "NIL");
        assert_eq!(prin1(&table, &Value::Integer(-42)), "-42");
        assert_eq!(prin1(&table, &Value::Float(1.5)), "1.5");
        assert_eq!(prin1(&table, &Value::Float(1e300)), "1.0e300");
        assert_eq!(prin1(&table, &Value::Float(2.0)), "2.0");
        assert_eq!(prin1(&table, &Value::string("a\"b")), "\"a\\\"b\"");
        assert_eq!(prin1(&table, &Value::Char(' ')), "#\\Space");
        assert_eq!(prin1(&table, &Value::Char('x')), "#\\x");
        let princ = Printer::new(&table, PrintOptions::princ());
        assert_eq!(princ.print(&Value::string("hi")).unwrap(), "hi");
        assert_eq!(princ.print(&Value::Char('x')).unwrap(), "x");
    }

    #[test]
    fn test_print_symbols() {
        let mut table = SymbolTable::new();
        let v = read(&mut table, "(foo :key |Mixed| #:gen |12| cl-user::bar)");
        assert_eq!(prin1(&table, &v), "(FOO :KEY |Mixed| #:GEN |12| BAR)");

        let other = table.create_package("OTHER", &[]).unwrap();
        let hidden = table.intern_in("HIDDEN", other);
        let shown = table.intern_in("SHOWN", other);
        table.export(&[shown], other).unwrap();
        let v = Value::list(vec![Value::Symbol(hidden), Value::Symbol(shown)]);
        assert_eq!(prin1(&table, &v), "(OTHER::HIDDEN OTHER:SHOWN)");

        let options = PrintOptions { case: PrintCase::Downcase, ..PrintOptions::prin1() };
        let v = read(&mut table, "(hello |World|)");
        assert_eq!(Printer::new(&table, options).print(&v).unwrap(), "(hello |World|)");
    }

    #[test]
    fn test_print_abbreviations_and_vectors() {
        let mut table = SymbolTable::new();
        let v = read(&mut table, "('a #'b `(c ,d ,@e) #(1 2))");
        assert_eq!(prin1(&table, &v), "('A #'B `(C ,D ,@E) #(1 2))");
    }

    #[test]
    fn test_length_and_level() {
        let mut table = SymbolTable::new();
        let v = read(&mut table, "(1 (2 (3 (4))) 5 6)");
        let options = PrintOptions { length: Some(3), level: Some(2), ..PrintOptions::prin1() };
        assert_eq!(Printer::new(&table, options).print(&v).unwrap(), "(1 (2 #) 5 ...)");
    }

    #[test]
    fn test_radix() {
        let table = SymbolTable::new();
        let options = PrintOptions { base: 16, radix: true, ..PrintOptions::prin1() };
        assert_eq!(Printer::new(&table, options).print(&Value::Integer(255)).unwrap(), "#xFF");
        let options = PrintOptions { radix: true, ..PrintOptions::prin1() };
        assert_eq!(Printer::new(&table, options).print(&Value::Integer(7)).unwrap(), "7.");
    }

    #[test]
    fn test_readably_rejects_unreadable() {
        let table = SymbolTable::new();
        let options = PrintOptions { readably: true, escape: false, ..PrintOptions::default() };
        let printer = Printer::new(&table, options);
        assert!(matches!(
            printer.print(&Value::native("F", |_, _| Ok(Value::Nil))),
            Err(PrintError::NotReadable(_))
        ));
        assert!(matches!(printer.print(&Value::Float(f64::NAN)), Err(PrintError::NotReadable(_))));
        // escape was forced back on
        assert_eq!(printer.print(&Value::string("s")).unwrap(), "\"s\"");
        let lenient = Printer::new(&table, PrintOptions::prin1());
        assert_eq!(lenient.print(&Value::Unbound).unwrap(), "#<UNBOUND>");
    }

    #[test]
    fn test_pretty_breaks_long_lists() {
        let mut table = SymbolTable::new();
        let v = read(&mut table, "(defun long-name (alpha beta) (combine alpha beta gamma))");
        let options = PrintOptions { pretty: true, right_margin: 30, ..PrintOptions::prin1() };
        let text = Printer::new(&table, options).print(&v).unwrap();
        assert!(text.lines().count() > 1);
        assert!(text.lines().all(|l| l.len() <= 40));
        let reread = read(&mut table, &text);
        assert_eq!(reread, v);
    }

    #[test]
    fn test_round_trip_under_preserve() {
        let mut table = SymbolTable::new();
        let v = read(&mut table, "(a \"s\" #\\Tab 1.25 -3 |x y|)");
        let text = prin1(&table, &v);
        let options = ReaderOptions { case: ReadCase::Upcase, ..ReaderOptions::default() };
        let again = read_from_string(&text, &mut table, &options).unwrap();
        assert_eq!(again, v);
    }
}
