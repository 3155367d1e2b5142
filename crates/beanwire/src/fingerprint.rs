//! # Method Fingerprints
//!
//! A method is identified across a process boundary by a 64-bit fingerprint:
//! the first eight bytes of SHA-256 over its name followed by its canonical
//! descriptor, e.g. `add(s64,s64)s64`. Two parties holding structurally
//! identical interfaces resolve calls without exchanging full signatures.
//!
//! ## Invariants
//!
//! - The fingerprint depends only on name, parameter types, and return type.
//! - A `FingerprintTable` never maps one fingerprint to two signatures.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::Error;
use crate::error::Result;

/// Stable hash of a method name and descriptor.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Placeholder for replies to frames whose method could not be read.
    pub const UNKNOWN: Fingerprint = Fingerprint(0);

    pub fn of(name: &str, descriptor: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(descriptor.as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(prefix))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Name and type descriptor of one business method.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<String>,
    pub returns: String,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, params: &[&str], returns: &str) -> Self {
        Self {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            returns: returns.to_string(),
        }
    }

    /// Canonical descriptor, `(p1,p2)ret`.
    pub fn descriptor(&self) -> String {
        format!("({}){}", self.params.join(","), self.returns)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.name, &self.descriptor())
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl std::fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor())
    }
}

/// A named set of business methods exposed by a component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub methods: Vec<MethodSignature>,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, name: &str, params: &[&str], returns: &str) -> Self {
        self.methods.push(MethodSignature::new(name, params, returns));
        self
    }

    pub fn find(&self, name: &str) -> Option<&MethodSignature> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Builds the lookup table for this interface.
    pub fn table(&self) -> Result<FingerprintTable> {
        FingerprintTable::build(self.methods.iter().cloned())
    }
}

/// Fingerprint → signature index, built once per interface.
#[derive(Clone, Debug, Default)]
pub struct FingerprintTable {
    by_fingerprint: HashMap<Fingerprint, Arc<MethodSignature>>,
    by_name: HashMap<String, Vec<Fingerprint>>,
}

impl FingerprintTable {
    pub fn build(signatures: impl IntoIterator<Item = MethodSignature>) -> Result<Self> {
        let mut table = Self::default();

        for sig in signatures {
            let fp = sig.fingerprint();
            if let Some(existing) = table.by_fingerprint.get(&fp) {
                if **existing == sig {
                    return Err(Error::DuplicateMethod(sig.to_string()));
                }
                return Err(Error::FingerprintCollision {
                    first: existing.to_string(),
                    second: sig.to_string(),
                });
            }

            table.by_name.entry(sig.name.clone()).or_default().push(fp);
            table.by_fingerprint.insert(fp, Arc::new(sig));
        }

        Ok(table)
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<&Arc<MethodSignature>> {
        self.by_fingerprint.get(&fingerprint)
    }

    /// All overloads sharing a method name.
    pub fn overloads(&self, name: &str) -> &[Fingerprint] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.by_fingerprint.contains_key(&fingerprint)
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}
