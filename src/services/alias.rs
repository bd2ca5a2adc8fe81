//! Canonical item names.
//!
//! Invoices and checkouts spell the same physical item in different ways.
//! Every name is normalized (lowercased, internal whitespace collapsed)
//! before lookup; names without an alias entry are their own canonical form.

use std::collections::HashMap;

pub trait AliasResolver: Send + Sync {
    fn resolve(&self, raw_name: &str) -> String;
}

pub fn normalize(raw_name: &str) -> String {
    raw_name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Many-to-one alias map. Lookups are a single hop.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: HashMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, A, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, C)>,
        A: AsRef<str>,
        C: AsRef<str>,
    {
        let mut table = Self::new();
        for (alias, canonical) in pairs {
            table.insert(alias.as_ref(), canonical.as_ref());
        }
        table
    }

    pub fn insert(&mut self, alias: &str, canonical_name: &str) {
        let alias = normalize(alias);
        let canonical = normalize(canonical_name);
        if alias.is_empty() || canonical.is_empty() || alias == canonical {
            return;
        }
        self.aliases.insert(alias, canonical);
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

impl AliasResolver for AliasTable {
    fn resolve(&self, raw_name: &str) -> String {
        let key = normalize(raw_name);
        match self.aliases.get(&key) {
            Some(canonical) => canonical.clone(),
            None => key,
        }
    }
}
