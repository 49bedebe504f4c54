// HostCL Symbol Table and Package System
//
// Implements ANSI CL symbol/package semantics with O(1) comparison.
// Every package keeps an `accessible` map with exactly one symbol per
// name; conflicting operations are rejected before anything changes.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::types::Value;

/// Unique identifier for a symbol (index into symbol table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

/// Unique identifier for a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(pub u32);

pub const KEYWORD: PackageId = PackageId(0);
pub const COMMON_LISP: PackageId = PackageId(1);
pub const CL_USER: PackageId = PackageId(2);

/// A Common Lisp symbol. The value and function cells form the global frame.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// The symbol's name (e.g., "CAR", "MY-VAR")
    pub name: String,
    /// The home package (None for uninterned symbols)
    pub package: Option<PackageId>,
    /// Global value, None when unbound
    pub value: Option<Value>,
    /// Global function, None when fbound is false
    pub function: Option<Value>,
    /// Constants and keywords cannot be assigned or rebound
    pub is_constant: bool,
}

impl Symbol {
    pub fn new(name: String, package: Option<PackageId>) -> Self {
        Self {
            name,
            package,
            value: None,
            function: None,
            is_constant: false,
        }
    }

    /// Check if symbol is a keyword
    pub fn is_keyword(&self) -> bool {
        self.package == Some(KEYWORD)
    }
}

/// How a symbol is accessible in a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Internal,
    External,
    Inherited,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackageError {
    #[error("the package {0} does not exist")]
    NoSuchPackage(String),
    #[error("a package named {0} already exists")]
    PackageExists(String),
    #[error("name conflict in package {package}: {name} would refer to two different symbols")]
    NameConflict { package: String, name: String },
    #[error("the symbol {symbol} is not accessible in package {package}")]
    NotAccessible { symbol: String, package: String },
    #[error("the symbol {0} is a constant and cannot be modified")]
    Constant(String),
}

/// A Common Lisp package
#[derive(Debug, Clone)]
pub struct Package {
    /// Package name (e.g., "COMMON-LISP", "KEYWORD")
    pub name: String,
    /// Nicknames for the package
    pub nicknames: Vec<String>,
    /// Symbols whose home is this package
    own: HashSet<SymbolId>,
    /// Symbols made present by IMPORT
    imported: HashSet<SymbolId>,
    /// Inherited symbols and the used packages that supply them
    inherited: HashMap<SymbolId, HashSet<PackageId>>,
    /// Name -> the one symbol visible under that name
    accessible: HashMap<String, SymbolId>,
    external: HashSet<SymbolId>,
    shadowing: HashSet<SymbolId>,
    /// Packages this one uses, in order
    use_list: Vec<PackageId>,
    used_by: HashSet<PackageId>,
}

impl Package {
    pub fn new(name: &str, nicknames: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            nicknames,
            own: HashSet::new(),
            imported: HashSet::new(),
            inherited: HashMap::new(),
            accessible: HashMap::new(),
            external: HashSet::new(),
            shadowing: HashSet::new(),
            use_list: Vec::new(),
            used_by: HashSet::new(),
        }
    }

    fn is_present(&self, sym: SymbolId) -> bool {
        self.own.contains(&sym) || self.imported.contains(&sym)
    }

    pub fn use_list(&self) -> &[PackageId] {
        &self.use_list
    }

    pub fn is_external(&self, sym: SymbolId) -> bool {
        self.external.contains(&sym)
    }

    pub fn is_shadowing(&self, sym: SymbolId) -> bool {
        self.shadowing.contains(&sym)
    }

    /// The symbol visible under `name`, if any.
    pub fn accessible(&self, name: &str) -> Option<SymbolId> {
        self.accessible.get(name).copied()
    }

    pub fn accessible_count(&self) -> usize {
        self.accessible.len()
    }

    pub fn external_symbols(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.external.iter().copied()
    }
}

/// The global symbol table
#[derive(Debug)]
pub struct SymbolTable {
    /// All symbols indexed by SymbolId
    symbols: Vec<Symbol>,
    /// All packages indexed by PackageId
    packages: Vec<Package>,
    /// Package name or nickname -> PackageId lookup
    package_names: HashMap<String, PackageId>,
    gensym_counter: u64,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = Self {
            symbols: Vec::new(),
            packages: Vec::new(),
            package_names: HashMap::new(),
            gensym_counter: 0,
        };
        table.init();
        table
    }

    /// Creates the standard packages. KEYWORD, COMMON-LISP (nickname CL)
    /// and CL-USER, which uses COMMON-LISP.
    fn init(&mut self) {
        let standard = [
            ("KEYWORD", vec![]),
            ("COMMON-LISP", vec!["CL".to_string()]),
            ("COMMON-LISP-USER", vec!["CL-USER".to_string()]),
        ];
        for (name, nicknames) in standard {
            let id = PackageId(self.packages.len() as u32);
            for nick in &nicknames {
                self.package_names.insert(nick.clone(), id);
            }
            self.package_names.insert(name.to_string(), id);
            self.packages.push(Package::new(name, nicknames));
        }
        self.packages[CL_USER.0 as usize].use_list.push(COMMON_LISP);
        self.packages[COMMON_LISP.0 as usize].used_by.insert(CL_USER);
    }

    /// Drops every symbol and package and rebuilds the standard ones.
    pub fn reset(&mut self) {
        self.symbols.clear();
        self.packages.clear();
        self.package_names.clear();
        self.gensym_counter = 0;
        self.init();
    }

    /// Create a new package
    pub fn create_package(
        &mut self,
        name: &str,
        nicknames: &[&str],
    ) -> Result<PackageId, PackageError> {
        for n in std::iter::once(&name).chain(nicknames.iter()) {
            if self.package_names.contains_key(*n) {
                return Err(PackageError::PackageExists(n.to_string()));
            }
        }
        let id = PackageId(self.packages.len() as u32);
        let nicknames: Vec<String> = nicknames.iter().map(|n| n.to_string()).collect();
        self.package_names.insert(name.to_string(), id);
        for nick in &nicknames {
            self.package_names.insert(nick.clone(), id);
        }
        self.packages.push(Package::new(name, nicknames));
        log::debug!("created package {}", name);
        Ok(id)
    }

    /// Find a package by name or nickname
    pub fn find_package(&self, name: &str) -> Option<PackageId> {
        self.package_names.get(name).copied()
    }

    pub fn require_package(&self, name: &str) -> Result<PackageId, PackageError> {
        self.find_package(name)
            .ok_or_else(|| PackageError::NoSuchPackage(name.to_string()))
    }

    /// Get a package by ID
    pub fn get_package(&self, id: PackageId) -> Option<&Package> {
        self.packages.get(id.0 as usize)
    }

    pub fn package_name(&self, id: PackageId) -> &str {
        self.get_package(id).map(|p| p.name.as_str()).unwrap_or("")
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Get a symbol by ID
    pub fn get_symbol(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.0 as usize)
    }

    pub fn get_symbol_mut(&mut self, id: SymbolId) -> Option<&mut Symbol> {
        self.symbols.get_mut(id.0 as usize)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Get the name of a symbol
    pub fn symbol_name(&self, id: SymbolId) -> Option<&str> {
        self.get_symbol(id).map(|s| s.name.as_str())
    }

    /// Get the home package of a symbol
    pub fn symbol_package(&self, id: SymbolId) -> Option<PackageId> {
        self.get_symbol(id).and_then(|s| s.package)
    }

    pub fn is_keyword(&self, id: SymbolId) -> bool {
        self.get_symbol(id).map(|s| s.is_keyword()).unwrap_or(false)
    }

    pub fn is_constant(&self, id: SymbolId) -> bool {
        self.get_symbol(id).map(|s| s.is_constant).unwrap_or(false)
    }

    pub fn mark_constant(&mut self, id: SymbolId) {
        if let Some(sym) = self.get_symbol_mut(id) {
            sym.is_constant = true;
        }
    }

    /// Looks `name` up in `pkg` without creating anything.
    pub fn find_symbol(&self, name: &str, pkg: PackageId) -> Option<(SymbolId, Visibility)> {
        let package = self.get_package(pkg)?;
        let sym = package.accessible(name)?;
        let visibility = if package.external.contains(&sym) {
            Visibility::External
        } else if package.is_present(sym) {
            Visibility::Internal
        } else {
            Visibility::Inherited
        };
        Some((sym, visibility))
    }

    /// Interns `name` in `pkg`. Returns the symbol and, when it already
    /// existed, how it was accessible.
    pub fn intern(&mut self, name: &str, pkg: PackageId) -> (SymbolId, Option<Visibility>) {
        if let Some((sym, visibility)) = self.find_symbol(name, pkg) {
            return (sym, Some(visibility));
        }

        let sym_id = SymbolId(self.symbols.len() as u32);
        let mut symbol = Symbol::new(name.to_string(), Some(pkg));
        if pkg == KEYWORD {
            symbol.value = Some(Value::Symbol(sym_id));
            symbol.is_constant = true;
        }
        self.symbols.push(symbol);

        if let Some(package) = self.packages.get_mut(pkg.0 as usize) {
            package.own.insert(sym_id);
            package.accessible.insert(name.to_string(), sym_id);
            if pkg == KEYWORD {
                package.external.insert(sym_id);
            }
        }
        (sym_id, None)
    }

    /// Intern and return only the symbol.
    pub fn intern_in(&mut self, name: &str, pkg: PackageId) -> SymbolId {
        self.intern(name, pkg).0
    }

    /// Intern a keyword (in KEYWORD package)
    pub fn intern_keyword(&mut self, name: &str) -> SymbolId {
        self.intern_in(name, KEYWORD)
    }

    /// Intern in COMMON-LISP and export.
    pub fn intern_exported(&mut self, name: &str, pkg: PackageId) -> SymbolId {
        let sym = self.intern_in(name, pkg);
        // A fresh symbol in its home package cannot conflict in itself;
        // users that already see another symbol of the same name keep it.
        if self.export(&[sym], pkg).is_err() {
            log::warn!("could not export {} from {}", name, self.package_name(pkg));
        }
        sym
    }

    /// Create an uninterned symbol
    pub fn make_symbol(&mut self, name: &str) -> SymbolId {
        let sym_id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol::new(name.to_string(), None));
        sym_id
    }

    /// Uninterned symbol named prefix plus a counter.
    pub fn gensym(&mut self, prefix: &str) -> SymbolId {
        let name = format!("{}{}", prefix, self.gensym_counter);
        self.gensym_counter += 1;
        self.make_symbol(&name)
    }

    fn conflict(&self, pkg: PackageId, name: &str) -> PackageError {
        PackageError::NameConflict {
            package: self.package_name(pkg).to_string(),
            name: name.to_string(),
        }
    }

    fn name_of(&self, sym: SymbolId) -> String {
        self.symbol_name(sym).unwrap_or("").to_string()
    }

    fn package_ref(&self, pkg: PackageId) -> Result<&Package, PackageError> {
        self.get_package(pkg)
            .ok_or_else(|| PackageError::NoSuchPackage(format!("#{}", pkg.0)))
    }

    /// Makes the external symbols of `src` accessible in `dest`.
    pub fn use_package(&mut self, dest: PackageId, src: PackageId) -> Result<(), PackageError> {
        let dest_pkg = self.package_ref(dest)?;
        let src_pkg = self.package_ref(src)?;
        if dest_pkg.use_list.contains(&src) {
            return Ok(());
        }

        for &sym in &src_pkg.external {
            let name = self.name_of(sym);
            if let Some(existing) = dest_pkg.accessible(&name) {
                if existing != sym && !dest_pkg.shadowing.contains(&existing) {
                    return Err(self.conflict(dest, &name));
                }
            }
        }

        let exported: Vec<(SymbolId, String)> = src_pkg
            .external
            .iter()
            .map(|&s| (s, self.name_of(s)))
            .collect();
        let dest_pkg = &mut self.packages[dest.0 as usize];
        dest_pkg.use_list.push(src);
        for (sym, name) in exported {
            match dest_pkg.accessible.get(&name) {
                Some(&existing) if existing != sym => continue,
                Some(_) => {}
                None => {
                    dest_pkg.accessible.insert(name, sym);
                }
            }
            if !dest_pkg.is_present(sym) {
                dest_pkg.inherited.entry(sym).or_default().insert(src);
            }
        }
        self.packages[src.0 as usize].used_by.insert(dest);
        Ok(())
    }

    /// Exports symbols from `pkg`, propagating them to every package
    /// that uses it.
    pub fn export(&mut self, syms: &[SymbolId], pkg: PackageId) -> Result<(), PackageError> {
        let package = self.package_ref(pkg)?;
        for &sym in syms {
            let name = self.name_of(sym);
            if package.accessible(&name) != Some(sym) {
                return Err(PackageError::NotAccessible {
                    symbol: name,
                    package: package.name.clone(),
                });
            }
            for &user in &package.used_by {
                let user_pkg = self.package_ref(user)?;
                if let Some(existing) = user_pkg.accessible(&name) {
                    if existing != sym && !user_pkg.shadowing.contains(&existing) {
                        return Err(self.conflict(user, &name));
                    }
                }
            }
        }

        let users: Vec<PackageId> = package.used_by.iter().copied().collect();
        for &sym in syms {
            let name = self.name_of(sym);
            let package = &mut self.packages[pkg.0 as usize];
            if !package.is_present(sym) {
                // Exporting an inherited symbol imports it first.
                package.inherited.remove(&sym);
                package.imported.insert(sym);
            }
            package.external.insert(sym);
            for &user in &users {
                let user_pkg = &mut self.packages[user.0 as usize];
                match user_pkg.accessible.get(&name) {
                    Some(&existing) if existing != sym => continue,
                    Some(_) => {}
                    None => {
                        user_pkg.accessible.insert(name.clone(), sym);
                    }
                }
                if !user_pkg.is_present(sym) {
                    user_pkg.inherited.entry(sym).or_default().insert(pkg);
                }
            }
        }
        Ok(())
    }

    /// Withdraws symbols from the external set of `pkg`.
    pub fn unexport(&mut self, syms: &[SymbolId], pkg: PackageId) -> Result<(), PackageError> {
        let package = self.package_ref(pkg)?;
        for &sym in syms {
            let name = self.name_of(sym);
            if package.accessible(&name) != Some(sym) {
                return Err(PackageError::NotAccessible {
                    symbol: name,
                    package: package.name.clone(),
                });
            }
        }
        let users: Vec<PackageId> = package.used_by.iter().copied().collect();
        for &sym in syms {
            let name = self.name_of(sym);
            self.packages[pkg.0 as usize].external.remove(&sym);
            for &user in &users {
                let user_pkg = &mut self.packages[user.0 as usize];
                let now_empty = match user_pkg.inherited.get_mut(&sym) {
                    Some(sources) => {
                        sources.remove(&pkg);
                        sources.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    user_pkg.inherited.remove(&sym);
                    if user_pkg.accessible.get(&name) == Some(&sym) {
                        user_pkg.accessible.remove(&name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Makes foreign symbols present in `pkg`.
    pub fn import(&mut self, syms: &[SymbolId], pkg: PackageId) -> Result<(), PackageError> {
        let package = self.package_ref(pkg)?;
        for &sym in syms {
            let name = self.name_of(sym);
            if let Some(existing) = package.accessible(&name) {
                if existing != sym {
                    return Err(self.conflict(pkg, &name));
                }
            }
        }
        for &sym in syms {
            let name = self.name_of(sym);
            let package = &mut self.packages[pkg.0 as usize];
            if package.is_present(sym) {
                continue;
            }
            package.inherited.remove(&sym);
            package.imported.insert(sym);
            package.accessible.insert(name, sym);
            if let Some(symbol) = self.symbols.get_mut(sym.0 as usize) {
                if symbol.package.is_none() {
                    symbol.package = Some(pkg);
                }
            }
        }
        Ok(())
    }

    /// Ensures a present symbol named `name` in `pkg` that wins over any
    /// inherited symbol of the same name.
    pub fn shadow(&mut self, names: &[&str], pkg: PackageId) -> Result<(), PackageError> {
        self.package_ref(pkg)?;
        for name in names {
            let present = {
                let package = &self.packages[pkg.0 as usize];
                package.accessible(name).filter(|s| package.is_present(*s))
            };
            let sym = match present {
                Some(sym) => sym,
                None => {
                    let sym = SymbolId(self.symbols.len() as u32);
                    self.symbols.push(Symbol::new(name.to_string(), Some(pkg)));
                    let package = &mut self.packages[pkg.0 as usize];
                    if let Some(old) = package.accessible.insert(name.to_string(), sym) {
                        package.inherited.remove(&old);
                    }
                    package.own.insert(sym);
                    sym
                }
            };
            self.packages[pkg.0 as usize].shadowing.insert(sym);
        }
        Ok(())
    }

    /// Global value cell.
    pub fn symbol_value(&self, id: SymbolId) -> Option<&Value> {
        self.get_symbol(id).and_then(|s| s.value.as_ref())
    }

    pub fn set_symbol_value(&mut self, id: SymbolId, value: Value) {
        if let Some(sym) = self.get_symbol_mut(id) {
            sym.value = Some(value);
        }
    }

    pub fn makunbound(&mut self, id: SymbolId) {
        if let Some(sym) = self.get_symbol_mut(id) {
            sym.value = None;
        }
    }

    pub fn symbol_function(&self, id: SymbolId) -> Option<&Value> {
        self.get_symbol(id).and_then(|s| s.function.as_ref())
    }

    pub fn set_symbol_function(&mut self, id: SymbolId, function: Value) {
        if let Some(sym) = self.get_symbol_mut(id) {
            sym.function = Some(function);
        }
    }

    pub fn fmakunbound(&mut self, id: SymbolId) {
        if let Some(sym) = self.get_symbol_mut(id) {
            sym.function = None;
        }
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// How the reader folds the case of unescaped symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadCase {
    #[default]
    Upcase,
    Downcase,
    Preserve,
    /// All-lowercase or all-uppercase tokens flip, mixed tokens are kept
    Invert,
}

impl ReadCase {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "UPCASE" => Some(ReadCase::Upcase),
            "DOWNCASE" => Some(ReadCase::Downcase),
            "PRESERVE" => Some(ReadCase::Preserve),
            "INVERT" => Some(ReadCase::Invert),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReadCase::Upcase => "UPCASE",
            ReadCase::Downcase => "DOWNCASE",
            ReadCase::Preserve => "PRESERVE",
            ReadCase::Invert => "INVERT",
        }
    }

    pub fn apply(self, token: &str) -> String {
        match self {
            ReadCase::Upcase => token.to_uppercase(),
            ReadCase::Downcase => token.to_lowercase(),
            ReadCase::Preserve => token.to_string(),
            ReadCase::Invert => invert_case(token),
        }
    }
}

/// How the printer renders symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintCase {
    #[default]
    Upcase,
    Downcase,
    Capitalize,
}

impl PrintCase {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "UPCASE" => Some(PrintCase::Upcase),
            "DOWNCASE" => Some(PrintCase::Downcase),
            "CAPITALIZE" => Some(PrintCase::Capitalize),
            _ => None,
        }
    }

    /// Only uppercase characters are affected; lowercase characters in a
    /// name were escaped when read and must stay as they are.
    pub fn apply(self, name: &str) -> String {
        match self {
            PrintCase::Upcase => name.to_string(),
            PrintCase::Downcase => name
                .chars()
                .map(|c| if c.is_uppercase() { c.to_ascii_lowercase() } else { c })
                .collect(),
            PrintCase::Capitalize => {
                let mut out = String::with_capacity(name.len());
                let mut word_start = true;
                for c in name.chars() {
                    if c.is_alphanumeric() {
                        if word_start {
                            out.push(c);
                        } else if c.is_uppercase() {
                            out.push(c.to_ascii_lowercase());
                        } else {
                            out.push(c);
                        }
                        word_start = false;
                    } else {
                        out.push(c);
                        word_start = true;
                    }
                }
                out
            }
        }
    }
}

fn invert_case(token: &str) -> String {
    let has_upper = token.chars().any(|c| c.is_uppercase());
    let has_lower = token.chars().any(|c| c.is_lowercase());
    match (has_upper, has_lower) {
        (true, false) => token.to_lowercase(),
        (false, true) => token.to_uppercase(),
        _ => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_package() {
        let table = SymbolTable::new();
        let pkg = table.find_package("COMMON-LISP");
        assert!(pkg.is_some());
        assert_eq!(table.find_package("CL"), pkg); // Nickname
        assert_eq!(table.find_package("CL-USER"), Some(CL_USER));
    }

    #[test]
    fn test_duplicate_package() {
        let mut table = SymbolTable::new();
        table.create_package("APP", &["A"]).unwrap();
        assert_eq!(
            table.create_package("A", &[]),
            Err(PackageError::PackageExists("A".to_string()))
        );
    }

    #[test]
    fn test_intern_symbol() {
        let mut table = SymbolTable::new();
        let (sym1, status1) = table.intern("FOO", CL_USER);
        let (sym2, status2) = table.intern("FOO", CL_USER);
        assert_eq!(sym1, sym2); // Same symbol
        assert_eq!(status1, None);
        assert_eq!(status2, Some(Visibility::Internal));

        let sym3 = table.intern_in("BAR", CL_USER);
        assert_ne!(sym1, sym3); // Different symbols
    }

    #[test]
    fn test_keyword() {
        let mut table = SymbolTable::new();
        let kw = table.intern_keyword("TEST");
        let sym = table.get_symbol(kw).unwrap();
        assert!(sym.is_keyword());
        assert!(sym.is_constant);
        assert!(matches!(table.symbol_value(kw), Some(Value::Symbol(s)) if *s == kw));
        assert_eq!(table.find_symbol("TEST", KEYWORD), Some((kw, Visibility::External)));
    }

    #[test]
    fn test_uninterned() {
        let mut table = SymbolTable::new();
        let sym = table.make_symbol("G123");
        assert!(table.get_symbol(sym).unwrap().package.is_none());
        let g1 = table.gensym("G");
        let g2 = table.gensym("G");
        assert_ne!(table.symbol_name(g1), table.symbol_name(g2));
    }

    #[test]
    fn test_inheritance() {
        let mut table = SymbolTable::new();
        let foo_cl = table.intern_in("FOO", COMMON_LISP);
        table.export(&[foo_cl], COMMON_LISP).unwrap();

        let (foo_user, status) = table.intern("FOO", CL_USER);
        assert_eq!(foo_cl, foo_user, "FOO should be inherited from CL");
        assert_eq!(status, Some(Visibility::Inherited));
    }

    #[test]
    fn test_export_after_use_propagates() {
        let mut table = SymbolTable::new();
        let lib = table.create_package("LIB", &[]).unwrap();
        let app = table.create_package("APP", &[]).unwrap();
        table.use_package(app, lib).unwrap();

        let helper = table.intern_in("HELPER", lib);
        assert_eq!(table.find_symbol("HELPER", app), None);
        table.export(&[helper], lib).unwrap();
        assert_eq!(table.find_symbol("HELPER", app), Some((helper, Visibility::Inherited)));

        table.unexport(&[helper], lib).unwrap();
        assert_eq!(table.find_symbol("HELPER", app), None);
    }

    #[test]
    fn test_use_package_conflict_leaves_package_unchanged() {
        let mut table = SymbolTable::new();
        let a = table.create_package("A", &[]).unwrap();
        let b = table.create_package("B", &[]).unwrap();
        let x_a = table.intern_in("X", a);
        table.export(&[x_a], a).unwrap();
        let x_b = table.intern_in("X", b);

        let before = table.get_package(b).unwrap().accessible_count();
        let err = table.use_package(b, a).unwrap_err();
        assert!(matches!(err, PackageError::NameConflict { .. }));
        assert_eq!(table.get_package(b).unwrap().accessible_count(), before);
        assert_eq!(table.find_symbol("X", b), Some((x_b, Visibility::Internal)));
        assert!(table.get_package(b).unwrap().use_list().is_empty());
    }

    #[test]
    fn test_shadow_resolves_conflict() {
        let mut table = SymbolTable::new();
        let a = table.create_package("A", &[]).unwrap();
        let b = table.create_package("B", &[]).unwrap();
        let x_a = table.intern_in("X", a);
        table.export(&[x_a], a).unwrap();
        table.shadow(&["X"], b).unwrap();
        table.use_package(b, a).unwrap();

        let (x_b, vis) = table.find_symbol("X", b).unwrap();
        assert_ne!(x_a, x_b);
        assert_eq!(vis, Visibility::Internal);
        assert!(table.get_package(b).unwrap().is_shadowing(x_b));
    }

    #[test]
    fn test_import_conflict_and_success() {
        let mut table = SymbolTable::new();
        let a = table.create_package("A", &[]).unwrap();
        let b = table.create_package("B", &[]).unwrap();
        let y_a = table.intern_in("Y", a);
        table.import(&[y_a], b).unwrap();
        assert_eq!(table.find_symbol("Y", b), Some((y_a, Visibility::Internal)));

        let z_a = table.intern_in("Z", a);
        table.intern_in("Z", b);
        assert!(table.import(&[z_a], b).is_err());
    }

    #[test]
    fn test_reset_restores_standard_packages() {
        let mut table = SymbolTable::new();
        table.create_package("SCRATCH", &[]).unwrap();
        table.intern_in("FOO", CL_USER);
        table.reset();
        assert_eq!(table.find_package("SCRATCH"), None);
        assert_eq!(table.package_count(), 3);
        assert_eq!(table.symbol_count(), 0);
    }

    #[test]
    fn test_read_case_invert() {
        assert_eq!(ReadCase::Invert.apply("foo"), "FOO");
        assert_eq!(ReadCase::Invert.apply("FOO"), "foo");
        assert_eq!(ReadCase::Invert.apply("Foo"), "Foo");
        assert_eq!(PrintCase::Capitalize.apply("HELLO-WORLD"), "Hello-World");
        assert_eq!(PrintCase::Downcase.apply("CAR"), "car");
    }
}
