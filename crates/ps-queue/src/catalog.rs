use dashmap::DashMap;

use crate::plugin::PluginDefinition;

/// Plugin definitions available to connections, by plugin id.
#[derive(Debug, Default)]
pub struct PluginCatalog {
    plugins: DashMap<String, PluginDefinition>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any previous one with the same id.
    pub fn register(&self, plugin: PluginDefinition) -> Option<PluginDefinition> {
        self.plugins.insert(plugin.id().to_string(), plugin)
    }

    pub fn unregister(&self, id: &str) -> Option<PluginDefinition> {
        self.plugins.remove(id).map(|(_, p)| p)
    }

    pub fn get(&self, id: &str) -> Option<PluginDefinition> {
        self.plugins.get(id).map(|p| p.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
