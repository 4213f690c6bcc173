//! Broker registry: maps adapter names to running adapters.

use crate::api::{SharedStock, StockApi};
use crate::proc::ProcBroker;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct StockSelector {
    stocks: BTreeMap<String, SharedStock>,
}

impl StockSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the registry from the `[brokers]` config section.
    /// Adapters spawn lazily on first use.
    pub fn load(&mut self, brokers: &BTreeMap<String, String>) {
        let mut stocks = BTreeMap::new();
        for (name, cmdline) in brokers {
            info!(broker = %name, "registering broker");
            let api: Box<dyn StockApi> = Box::new(ProcBroker::new(name.clone(), cmdline.clone()));
            stocks.insert(name.clone(), Arc::new(Mutex::new(api)) as SharedStock);
        }
        self.stocks = stocks;
    }

    pub fn insert(&mut self, name: impl Into<String>, api: Box<dyn StockApi>) {
        self.stocks.insert(name.into(), Arc::new(Mutex::new(api)));
    }

    pub fn get(&self, name: &str) -> Option<SharedStock> {
        self.stocks.get(name).cloned()
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &SharedStock)) {
        for (name, api) in &self.stocks {
            f(name, api);
        }
    }

    pub fn clear(&mut self) {
        self.stocks.clear();
    }

    pub fn len(&self) -> usize {
        self.stocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_iteration_order() {
        let mut sel = StockSelector::new();
        let mut brokers = BTreeMap::new();
        brokers.insert("kraken".to_string(), "kraken-broker".to_string());
        brokers.insert("binance".to_string(), "binance-broker".to_string());
        sel.load(&brokers);

        assert!(sel.get("kraken").is_some());
        assert!(sel.get("nope").is_none());

        let mut names = Vec::new();
        sel.for_each(|name, _| names.push(name.to_string()));
        assert_eq!(names, vec!["binance", "kraken"]);

        sel.clear();
        assert!(sel.is_empty());
    }
}
