// HostCL Lambda Lists
//
// Parses ordinary, macro and specialized lambda lists into a
// ParsedLambdaList. Malformed lists are rejected with a typed error.

use std::collections::HashSet;

use thiserror::Error;

use crate::printer;
use crate::symbol::{SymbolId, SymbolTable, COMMON_LISP};
use crate::types::Value;

/// The lambda-list keyword symbols.
#[derive(Debug, Clone, Copy)]
pub struct LambdaListKeywords {
    pub optional: SymbolId,
    pub rest: SymbolId,
    pub body: SymbolId,
    pub key: SymbolId,
    pub allow_other_keys: SymbolId,
    pub aux: SymbolId,
}

impl LambdaListKeywords {
    pub fn intern(table: &mut SymbolTable) -> Self {
        Self {
            optional: table.intern_exported("&OPTIONAL", COMMON_LISP),
            rest: table.intern_exported("&REST", COMMON_LISP),
            body: table.intern_exported("&BODY", COMMON_LISP),
            key: table.intern_exported("&KEY", COMMON_LISP),
            allow_other_keys: table.intern_exported("&ALLOW-OTHER-KEYS", COMMON_LISP),
            aux: table.intern_exported("&AUX", COMMON_LISP),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LambdaListError {
    #[error("the lambda list {0} is not a proper list")]
    NotAList(String),
    #[error("{keyword} is out of place in the lambda list {list}")]
    Misplaced { keyword: String, list: String },
    #[error("{keyword} must be followed by exactly one variable in {list}")]
    RestArity { keyword: String, list: String },
    #[error("the variable {0} occurs more than once in the lambda list")]
    Duplicate(String),
    #[error("malformed parameter specifier {0}")]
    BadParameter(String),
    #[error("{0} cannot be used as a variable")]
    NotAVariable(String),
}

#[derive(Debug, Clone)]
pub struct OptionalParam {
    pub var: SymbolId,
    pub init: Option<Value>,
    pub supplied_p: Option<SymbolId>,
}

#[derive(Debug, Clone)]
pub struct KeyParam {
    pub keyword: SymbolId,
    pub var: SymbolId,
    pub init: Option<Value>,
    pub supplied_p: Option<SymbolId>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedLambdaList {
    /// Required parameters: symbols, or nested patterns in macro lambda lists
    pub req: Vec<Value>,
    pub opt: Vec<OptionalParam>,
    pub rest: Option<SymbolId>,
    /// The rest parameter was introduced by &BODY
    pub body: bool,
    /// &KEY appeared, even with no parameters after it
    pub key_present: bool,
    pub key: Vec<KeyParam>,
    pub aux: Vec<(SymbolId, Option<Value>)>,
    /// &allow-other-keys present
    pub allow_other_keys: bool,
}

/// The parts of a lambda list that congruence rules compare.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LambdaShape {
    pub required: usize,
    pub optional: usize,
    pub rest: bool,
    /// None when there is no &KEY section
    pub keys: Option<Vec<SymbolId>>,
    pub allow_other_keys: bool,
}

impl LambdaShape {
    pub fn accepts_variable(&self) -> bool {
        self.rest || self.keys.is_some()
    }
}

impl ParsedLambdaList {
    pub fn shape(&self) -> LambdaShape {
        LambdaShape {
            required: self.req.len(),
            optional: self.opt.len(),
            rest: self.rest.is_some(),
            keys: if self.key_present {
                Some(self.key.iter().map(|k| k.keyword).collect())
            } else {
                None
            },
            allow_other_keys: self.allow_other_keys,
        }
    }

    /// True when every parameter is required and a plain symbol.
    pub fn is_simple(&self) -> bool {
        self.opt.is_empty()
            && self.rest.is_none()
            && !self.key_present
            && self.aux.is_empty()
            && self.req.iter().all(|r| matches!(r, Value::Symbol(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LambdaListMode {
    Req,
    Opt,
    Rest,
    Key,
    Aux,
}

struct Parser<'a> {
    kw: &'a LambdaListKeywords,
    table: &'a mut SymbolTable,
    list_text: String,
    seen: HashSet<SymbolId>,
}

impl Parser<'_> {
    fn name(&self, sym: SymbolId) -> String {
        self.table.symbol_name(sym).unwrap_or("").to_string()
    }

    fn misplaced(&self, keyword: SymbolId) -> LambdaListError {
        LambdaListError::Misplaced {
            keyword: self.name(keyword),
            list: self.list_text.clone(),
        }
    }

    fn rest_arity(&self, keyword: SymbolId) -> LambdaListError {
        LambdaListError::RestArity {
            keyword: self.name(keyword),
            list: self.list_text.clone(),
        }
    }

    fn variable(&mut self, v: &Value) -> Result<SymbolId, LambdaListError> {
        let sym = match v {
            Value::Symbol(s) => *s,
            Value::Nil => return Err(LambdaListError::NotAVariable("NIL".to_string())),
            other => return Err(LambdaListError::BadParameter(printer::show(self.table, other))),
        };
        if self.table.is_constant(sym) {
            return Err(LambdaListError::NotAVariable(self.name(sym)));
        }
        if !self.seen.insert(sym) {
            return Err(LambdaListError::Duplicate(self.name(sym)));
        }
        Ok(sym)
    }

    /// Required parameter; nested lists are accepted when destructuring.
    fn pattern(&mut self, v: &Value, destructuring: bool) -> Result<Value, LambdaListError> {
        match v {
            Value::List(items) if destructuring => {
                for item in items.iter() {
                    if let Some(s) = item.as_symbol() {
                        if self.is_lambda_keyword(s) {
                            continue;
                        }
                    }
                    self.pattern(item, true)?;
                }
                Ok(v.clone())
            }
            _ => Ok(Value::Symbol(self.variable(v)?)),
        }
    }

    fn is_lambda_keyword(&self, s: SymbolId) -> bool {
        let k = self.kw;
        [k.optional, k.rest, k.body, k.key, k.allow_other_keys, k.aux].contains(&s)
    }

    /// `var`, `(var)`, `(var init)` or `(var init supplied-p)`.
    fn optional_spec(
        &mut self,
        v: &Value,
    ) -> Result<(Value, Option<Value>, Option<SymbolId>), LambdaListError> {
        match v {
            Value::List(parts) if !parts.is_empty() && parts.len() <= 3 => {
                let init = parts.get(1).cloned();
                let supplied = match parts.get(2) {
                    Some(sp) => Some(self.variable(sp)?),
                    None => None,
                };
                Ok((parts[0].clone(), init, supplied))
            }
            Value::List(_) => Err(LambdaListError::BadParameter(printer::show(self.table, v))),
            _ => Ok((v.clone(), None, None)),
        }
    }
}

/// Parses an ordinary (or, with `destructuring`, macro) lambda list.
pub fn parse(
    list: &Value,
    kw: &LambdaListKeywords,
    table: &mut SymbolTable,
    destructuring: bool,
) -> Result<ParsedLambdaList, LambdaListError> {
    let list_text = printer::show(table, list);
    let items = list
        .as_list()
        .ok_or_else(|| LambdaListError::NotAList(list_text.clone()))?;
    let mut p = Parser {
        kw,
        table,
        list_text,
        seen: HashSet::new(),
    };
    let mut parsed = ParsedLambdaList::default();
    let mut mode = LambdaListMode::Req;
    let mut rest_keyword: Option<SymbolId> = None;

    for item in items {
        if let Some(s) = item.as_symbol() {
            if p.is_lambda_keyword(s) {
                if let Some(pending) = rest_keyword.filter(|_| parsed.rest.is_none()) {
                    return Err(p.rest_arity(pending));
                }
                if s == kw.optional {
                    if mode >= LambdaListMode::Opt {
                        return Err(p.misplaced(s));
                    }
                    mode = LambdaListMode::Opt;
                } else if s == kw.rest || s == kw.body {
                    if mode >= LambdaListMode::Rest {
                        return Err(p.misplaced(s));
                    }
                    mode = LambdaListMode::Rest;
                    parsed.body = s == kw.body;
                    rest_keyword = Some(s);
                } else if s == kw.key {
                    if mode >= LambdaListMode::Key {
                        return Err(p.misplaced(s));
                    }
                    mode = LambdaListMode::Key;
                    parsed.key_present = true;
                } else if s == kw.allow_other_keys {
                    if mode != LambdaListMode::Key || parsed.allow_other_keys {
                        return Err(p.misplaced(s));
                    }
                    parsed.allow_other_keys = true;
                } else if s == kw.aux {
                    if mode >= LambdaListMode::Aux {
                        return Err(p.misplaced(s));
                    }
                    mode = LambdaListMode::Aux;
                }
                continue;
            }
        }

        if parsed.allow_other_keys && mode == LambdaListMode::Key {
            return Err(LambdaListError::BadParameter(printer::show(p.table, item)));
        }

        match mode {
            LambdaListMode::Req => {
                let pattern = p.pattern(item, destructuring)?;
                parsed.req.push(pattern);
            }
            LambdaListMode::Opt => {
                let (var, init, supplied_p) = p.optional_spec(item)?;
                let var = p.variable(&var)?;
                parsed.opt.push(OptionalParam { var, init, supplied_p });
            }
            LambdaListMode::Rest => {
                let keyword = rest_keyword.unwrap_or(kw.rest);
                if parsed.rest.is_some() {
                    return Err(p.rest_arity(keyword));
                }
                parsed.rest = Some(p.variable(item)?);
            }
            LambdaListMode::Key => {
                let (spec, init, supplied_p) = p.optional_spec(item)?;
                let (keyword, var) = match &spec {
                    Value::List(pair) if pair.len() == 2 => {
                        let keyword = pair[0]
                            .as_symbol()
                            .ok_or_else(|| LambdaListError::BadParameter(printer::show(p.table, &spec)))?;
                        (keyword, p.variable(&pair[1])?)
                    }
                    _ => {
                        let var = p.variable(&spec)?;
                        let name = p.name(var);
                        (p.table.intern_keyword(&name), var)
                    }
                };
                parsed.key.push(KeyParam { keyword, var, init, supplied_p });
            }
            LambdaListMode::Aux => {
                let (var, init, supplied) = p.optional_spec(item)?;
                if supplied.is_some() {
                    return Err(LambdaListError::BadParameter(printer::show(p.table, item)));
                }
                let var = p.variable(&var)?;
                parsed.aux.push((var, init));
            }
        }
    }

    if let Some(pending) = rest_keyword {
        if parsed.rest.is_none() {
            return Err(p.rest_arity(pending));
        }
    }
    Ok(parsed)
}

/// Splits a specialized lambda list. Returns the plain lambda list and
/// one specializer form per required parameter (NIL when unspecialized).
pub fn parse_specialized(
    list: &Value,
    kw: &LambdaListKeywords,
    table: &mut SymbolTable,
) -> Result<(ParsedLambdaList, Vec<Value>), LambdaListError> {
    let items = list
        .as_list()
        .ok_or_else(|| LambdaListError::NotAList(printer::show(table, list)))?;
    let mut plain = Vec::with_capacity(items.len());
    let mut specializers = Vec::new();
    let mut required = true;
    for item in items {
        if let Some(s) = item.as_symbol() {
            if [kw.optional, kw.rest, kw.body, kw.key, kw.aux, kw.allow_other_keys].contains(&s) {
                required = false;
            }
        }
        match item {
            Value::List(parts) if required => {
                if parts.len() != 2 {
                    return Err(LambdaListError::BadParameter(printer::show(table, item)));
                }
                plain.push(parts[0].clone());
                specializers.push(parts[1].clone());
            }
            _ => {
                if required {
                    specializers.push(Value::Nil);
                }
                plain.push(item.clone());
            }
        }
    }
    let parsed = parse(&Value::list(plain), kw, table, false)?;
    Ok((parsed, specializers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{read_from_string, ReaderOptions};

    fn setup() -> (SymbolTable, LambdaListKeywords) {
        let mut table = SymbolTable::new();
        let kw = LambdaListKeywords::intern(&mut table);
        (table, kw)
    }

    fn read(table: &mut SymbolTable, text: &str) -> Value {
        read_from_string(text, table, &ReaderOptions::default()).unwrap()
    }

    #[test]
    fn test_full_lambda_list() {
        let (mut table, kw) = setup();
        let list = read(&mut table, "(a b &optional (c 3 c-p) d &rest r &key e ((:flag f) nil) &aux (z 1))");
        let parsed = parse(&list, &kw, &mut table, false).unwrap();
        assert_eq!(parsed.req.len(), 2);
        assert_eq!(parsed.opt.len(), 2);
        assert!(parsed.opt[0].supplied_p.is_some());
        assert_eq!(parsed.opt[0].init, Some(Value::Integer(3)));
        assert!(parsed.rest.is_some());
        assert_eq!(parsed.key.len(), 2);
        assert_eq!(table.symbol_name(parsed.key[0].keyword), Some("E"));
        assert!(table.is_keyword(parsed.key[0].keyword));
        assert_eq!(table.symbol_name(parsed.key[1].keyword), Some("FLAG"));
        assert_eq!(parsed.aux.len(), 1);

        let shape = parsed.shape();
        assert_eq!(shape.required, 2);
        assert_eq!(shape.optional, 2);
        assert!(shape.rest);
        assert_eq!(shape.keys.map(|k| k.len()), Some(2));
    }

    #[test]
    fn test_keyword_out_of_order() {
        let (mut table, kw) = setup();
        let list = read(&mut table, "(a &key b &optional c)");
        let err = parse(&list, &kw, &mut table, false).unwrap_err();
        assert!(matches!(err, LambdaListError::Misplaced { ref keyword, .. } if keyword == "&OPTIONAL"));

        let list = read(&mut table, "(a &allow-other-keys)");
        assert!(matches!(
            parse(&list, &kw, &mut table, false),
            Err(LambdaListError::Misplaced { .. })
        ));
    }

    #[test]
    fn test_rest_needs_one_variable() {
        let (mut table, kw) = setup();
        for text in ["(&rest)", "(&rest a b)", "(&rest &key a)"] {
            let list = read(&mut table, text);
            assert!(
                matches!(parse(&list, &kw, &mut table, false), Err(LambdaListError::RestArity { .. })),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_duplicates_and_constants() {
        let (mut table, kw) = setup();
        let list = read(&mut table, "(a &optional a)");
        assert!(matches!(parse(&list, &kw, &mut table, false), Err(LambdaListError::Duplicate(_))));
        let list = read(&mut table, "(:k)");
        assert!(matches!(parse(&list, &kw, &mut table, false), Err(LambdaListError::NotAVariable(_))));
    }

    #[test]
    fn test_destructuring_only_for_macros() {
        let (mut table, kw) = setup();
        let list = read(&mut table, "((var list) &body body)");
        assert!(parse(&list, &kw, &mut table, false).is_err());
        let parsed = parse(&list, &kw, &mut table, true).unwrap();
        assert!(parsed.body);
        assert!(!parsed.is_simple());
    }

    #[test]
    fn test_specialized() {
        let (mut table, kw) = setup();
        let list = read(&mut table, "((x integer) y &optional z)");
        let (parsed, specs) = parse_specialized(&list, &kw, &mut table).unwrap();
        assert_eq!(parsed.req.len(), 2);
        assert_eq!(specs.len(), 2);
        assert!(specs[0].as_symbol().is_some());
        assert!(specs[1].is_nil());
    }
}
