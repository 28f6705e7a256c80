use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;

use crate::error::Result;
use crate::traits::CredentialResolver;

/// Resolver that knows no credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialResolver for NoCredentials {
    fn get_credential(&self, _key: &str) -> BoxFuture<'_, Result<Option<HashMap<String, String>>>> {
        Box::pin(async { Ok(None) })
    }
}

/// Resolver backed by a fixed map, typically the `[credentials.*]` config tables.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    entries: HashMap<String, HashMap<String, String>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(tables: &BTreeMap<String, BTreeMap<String, String>>) -> Self {
        let entries = tables
            .iter()
            .map(|(key, fields)| {
                let fields = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (key.clone(), fields)
            })
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, key: impl Into<String>, fields: HashMap<String, String>) {
        self.entries.insert(key.into(), fields);
    }
}

impl CredentialResolver for StaticCredentials {
    fn get_credential(&self, key: &str) -> BoxFuture<'_, Result<Option<HashMap<String, String>>>> {
        let found = self.entries.get(key).cloned();
        Box::pin(async move { Ok(found) })
    }
}
