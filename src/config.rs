// HostCL Config - Runtime Options
//
// Limits and switches read once at startup. Every option has a default
// and can be overridden through a HOSTCL_* environment variable.

use std::env;

use crate::symbol::ReadCase;

pub const DEFAULT_MAX_FIXPOINT: usize = 16;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Passes the compiler may spend growing the escaping-name set
    pub max_fixpoint_iterations: usize,
    /// Nested closure calls before CALL-DEPTH-EXCEEDED is signalled
    pub max_call_depth: usize,
    /// Initial value of *READ-CASE*
    pub read_case: ReadCase,
    /// Log a JSON backtrace whenever an error reaches the debugger
    pub backtrace_on_error: bool,
    pub load_prelude: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_fixpoint_iterations: DEFAULT_MAX_FIXPOINT,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            read_case: ReadCase::Upcase,
            backtrace_on_error: false,
            load_prelude: true,
        }
    }
}

impl RuntimeOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds options from any key lookup. Unparsable values are logged
    /// and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: usize| match lookup(key) {
            None => default,
            Some(text) => match text.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    log::warn!("ignoring {}={:?}: expected a positive integer", key, text);
                    default
                }
            },
        };
        let flag = |key: &str, default: bool| match lookup(key) {
            None => default,
            Some(text) => parse_flag(&text).unwrap_or_else(|| {
                log::warn!("ignoring {}={:?}: expected a boolean", key, text);
                default
            }),
        };
        let read_case = match lookup("HOSTCL_READ_CASE") {
            None => defaults.read_case,
            Some(text) => ReadCase::from_name(text.trim()).unwrap_or_else(|| {
                log::warn!("ignoring HOSTCL_READ_CASE={:?}", text);
                defaults.read_case
            }),
        };
        Self {
            max_fixpoint_iterations: number("HOSTCL_MAX_FIXPOINT", defaults.max_fixpoint_iterations),
            max_call_depth: number("HOSTCL_MAX_CALL_DEPTH", defaults.max_call_depth),
            read_case,
            backtrace_on_error: flag("HOSTCL_BACKTRACE", defaults.backtrace_on_error),
            load_prelude: flag("HOSTCL_PRELUDE", defaults.load_prelude),
        }
    }

    pub fn with_max_fixpoint_iterations(mut self, n: usize) -> Self {
        self.max_fixpoint_iterations = n;
        self
    }

    pub fn with_max_call_depth(mut self, n: usize) -> Self {
        self.max_call_depth = n;
        self
    }
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn options(pairs: &[(&str, &str)]) -> RuntimeOptions {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        RuntimeOptions::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let opts = options(&[]);
        assert_eq!(opts.max_fixpoint_iterations, DEFAULT_MAX_FIXPOINT);
        assert_eq!(opts.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert_eq!(opts.read_case, ReadCase::Upcase);
        assert!(!opts.backtrace_on_error);
        assert!(opts.load_prelude);
    }

    #[test]
    fn test_overrides() {
        let opts = options(&[
            ("HOSTCL_MAX_FIXPOINT", "3"),
            ("HOSTCL_READ_CASE", "preserve"),
            ("HOSTCL_BACKTRACE", "yes"),
            ("HOSTCL_PRELUDE", "0"),
        ]);
        assert_eq!(opts.max_fixpoint_iterations, 3);
        assert_eq!(opts.read_case, ReadCase::Preserve);
        assert!(opts.backtrace_on_error);
        assert!(!opts.load_prelude);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let opts = options(&[("HOSTCL_MAX_CALL_DEPTH", "-4"), ("HOSTCL_BACKTRACE", "maybe")]);
        assert_eq!(opts.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert!(!opts.backtrace_on_error);
    }
}
