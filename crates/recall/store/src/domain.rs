//! Domain names and the registries that provision them.
//!
//! Domain names end up inside storage identifiers (table names, index
//! partitions), so [`DomainName::parse`] is the only way to build one and it
//! rejects anything outside `[A-Za-z0-9_]`.

use crate::traits::DomainRegistry;
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::RwLock;

/// Domain used when a request names none.
pub const DEFAULT_DOMAIN: &str = "default";

/// Longest accepted name. Leaves room for table suffixes under the
/// Postgres 63-byte identifier limit.
pub const MAX_DOMAIN_LEN: usize = 48;

/// Validated namespace identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainName(String);

impl DomainName {
    pub fn parse(raw: &str) -> StoreResult<Self> {
        if raw.is_empty() {
            return Err(StoreError::invalid("domain name must not be empty"));
        }
        if raw.len() > MAX_DOMAIN_LEN {
            return Err(StoreError::invalid(format!(
                "domain name longer than {MAX_DOMAIN_LEN} characters"
            )));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(StoreError::invalid(format!(
                "domain name {raw:?} contains invalid character {bad:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn default_domain() -> Self {
        Self(DEFAULT_DOMAIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DomainName {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DomainName> for String {
    fn from(value: DomainName) -> Self {
        value.0
    }
}

/// Registry for the simple backend: one implicit domain, every request maps
/// onto it.
#[derive(Debug, Clone)]
pub struct SingleDomainRegistry {
    domain: DomainName,
}

impl SingleDomainRegistry {
    pub fn new(domain: DomainName) -> Self {
        Self { domain }
    }
}

impl Default for SingleDomainRegistry {
    fn default() -> Self {
        Self::new(DomainName::default_domain())
    }
}

#[async_trait]
impl DomainRegistry for SingleDomainRegistry {
    async fn ensure(&self, name: &str) -> StoreResult<DomainName> {
        // The name is still validated so bad input fails the same way on
        // every backend.
        DomainName::parse(name)?;
        Ok(self.domain.clone())
    }

    async fn resolve(&self, name: &str) -> StoreResult<Option<DomainName>> {
        DomainName::parse(name)?;
        Ok(Some(self.domain.clone()))
    }

    async fn list(&self) -> StoreResult<Vec<DomainName>> {
        Err(StoreError::Unsupported(
            "list_domains requires a multi-domain backend".to_string(),
        ))
    }

    fn is_multi_domain(&self) -> bool {
        false
    }
}

/// Multi-domain registry that only tracks names. Pairs with backends whose
/// partitions materialise lazily (in-memory stores, the file index).
#[derive(Debug, Default)]
pub struct InMemoryDomainRegistry {
    known: RwLock<BTreeSet<DomainName>>,
}

impl InMemoryDomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DomainRegistry for InMemoryDomainRegistry {
    async fn ensure(&self, name: &str) -> StoreResult<DomainName> {
        let domain = DomainName::parse(name)?;
        let mut known = self
            .known
            .write()
            .map_err(|_| StoreError::Backend("domain registry lock poisoned".to_string()))?;
        if known.insert(domain.clone()) {
            tracing::info!(domain = %domain, "Provisioned memory domain");
        }
        Ok(domain)
    }

    async fn resolve(&self, name: &str) -> StoreResult<Option<DomainName>> {
        let domain = DomainName::parse(name)?;
        let known = self
            .known
            .read()
            .map_err(|_| StoreError::Backend("domain registry lock poisoned".to_string()))?;
        Ok(known.contains(&domain).then_some(domain))
    }

    async fn list(&self) -> StoreResult<Vec<DomainName>> {
        let known = self
            .known
            .read()
            .map_err(|_| StoreError::Backend("domain registry lock poisoned".to_string()))?;
        Ok(known.iter().cloned().collect())
    }

    fn is_multi_domain(&self) -> bool {
        true
    }
}
