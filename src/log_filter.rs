//! Debug log filter
//!
//! A process-wide filter choosing which commands emit debug logs. Every
//! replacement of the filter bumps a generation counter; command log
//! contexts cache their decision together with the generation they saw and
//! only re-evaluate the filter once the generation moves on.
//!
//! ## Syntax
//! Whitespace-separated `field=pattern` terms, all of which must match.
//! Fields: `command`, `dict`, `user`, `key`. A pattern ending in `*` is a
//! prefix match.
//!
//! ```text
//! command=LOOKUP user=alice key=priv/*
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DictError, Result};

static GLOBAL_FILTER: RwLock<Option<Arc<DebugFilter>>> = parking_lot::const_rwlock(None);
static FILTER_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterField {
    Command,
    Dict,
    User,
    Key,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterTerm {
    field: FilterField,
    pattern: String,
}

impl FilterTerm {
    fn matches(&self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self.pattern.strip_suffix('*') {
            Some(prefix) => value.starts_with(prefix),
            None => value == self.pattern,
        }
    }
}

/// The attributes of a command that a filter can match on
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterInput<'a> {
    pub command: Option<&'a str>,
    pub dict: Option<&'a str>,
    pub user: Option<&'a str>,
    pub key: Option<&'a str>,
}

/// A parsed debug filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugFilter {
    terms: Vec<FilterTerm>,
}

impl DebugFilter {
    /// Parse a filter expression
    pub fn parse(expr: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for token in expr.split_whitespace() {
            let (name, pattern) = token
                .split_once('=')
                .ok_or_else(|| DictError::Config(format!("Debug filter term without '=': {token}")))?;
            let field = match name {
                "command" => FilterField::Command,
                "dict" => FilterField::Dict,
                "user" => FilterField::User,
                "key" => FilterField::Key,
                other => {
                    return Err(DictError::Config(format!("Unknown debug filter field: {other}")))
                }
            };
            terms.push(FilterTerm {
                field,
                pattern: pattern.to_string(),
            });
        }
        if terms.is_empty() {
            return Err(DictError::Config("Empty debug filter".to_string()));
        }
        Ok(Self { terms })
    }

    pub fn matches(&self, input: &FilterInput<'_>) -> bool {
        self.terms.iter().all(|term| {
            let value = match term.field {
                FilterField::Command => input.command,
                FilterField::Dict => input.dict,
                FilterField::User => input.user,
                FilterField::Key => input.key,
            };
            term.matches(value)
        })
    }
}

/// Install a new process-wide debug filter
pub fn set_global_debug_filter(filter: DebugFilter) {
    *GLOBAL_FILTER.write() = Some(Arc::new(filter));
    FILTER_GENERATION.fetch_add(1, Ordering::Release);
}

/// Remove the process-wide debug filter; debug logging is then unfiltered
pub fn unset_global_debug_filter() {
    *GLOBAL_FILTER.write() = None;
    FILTER_GENERATION.fetch_add(1, Ordering::Release);
}

/// The current generation of the global filter
pub fn filter_generation() -> u64 {
    FILTER_GENERATION.load(Ordering::Acquire)
}

/// Evaluate the global filter for `input`; no filter means enabled
pub fn debug_enabled(input: &FilterInput<'_>) -> bool {
    match GLOBAL_FILTER.read().as_ref() {
        Some(filter) => filter.matches(input),
        None => true,
    }
}

/// A debug decision memoized against the filter generation
#[derive(Debug, Clone, Copy, Default)]
pub struct CachedDecision {
    generation: u64,
    enabled: bool,
}

impl CachedDecision {
    /// Return the cached decision, recomputing it if the filter changed
    pub fn get(&mut self, compute: impl FnOnce() -> bool) -> bool {
        let current = filter_generation();
        if self.generation != current {
            self.enabled = compute();
            self.generation = current;
        }
        self.enabled
    }

    /// Forget the cached decision (e.g. after the matched fields change)
    pub fn invalidate(&mut self) {
        self.generation = 0;
    }
}
