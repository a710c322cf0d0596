//! Prefix export towards the BGP speaker.

use crate::Result;
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

pub trait BgpSpeaker: Send + Sync {
    fn add_prefix(&self, prefix: IpNet, next_hop: Option<IpAddr>, owner: &str) -> Result<()>;
    /// Withdraw every prefix advertised under `owner`.
    fn remove_prefix_by_owner(&self, owner: &str) -> Result<()>;
}

pub fn network_owner(network_id: i64) -> String {
    format!("network_{}", network_id)
}

pub fn forward_owner(network_id: i64) -> String {
    format!("network_{}_forward", network_id)
}

/// In-process prefix table.
#[derive(Default)]
pub struct PrefixTable {
    prefixes: Mutex<BTreeMap<String, Vec<(IpNet, Option<IpAddr>)>>>,
}

impl PrefixTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefixes(&self, owner: &str) -> Vec<IpNet> {
        self.prefixes
            .lock()
            .map(|table| {
                table
                    .get(owner)
                    .map(|entries| entries.iter().map(|(prefix, _)| *prefix).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl BgpSpeaker for PrefixTable {
    fn add_prefix(&self, prefix: IpNet, next_hop: Option<IpAddr>, owner: &str) -> Result<()> {
        let mut table = self
            .prefixes
            .lock()
            .map_err(|_| crate::NovaError::Os("BGP prefix table lock poisoned".to_string()))?;
        let entries = table.entry(owner.to_string()).or_default();
        if !entries.iter().any(|(existing, _)| *existing == prefix) {
            entries.push((prefix, next_hop));
        }
        Ok(())
    }

    fn remove_prefix_by_owner(&self, owner: &str) -> Result<()> {
        let mut table = self
            .prefixes
            .lock()
            .map_err(|_| crate::NovaError::Os("BGP prefix table lock poisoned".to_string()))?;
        table.remove(owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owners_are_independent() {
        let table = PrefixTable::new();
        table.add_prefix("10.0.0.0/24".parse().unwrap(), None, &network_owner(1)).unwrap();
        table.add_prefix("192.0.2.1/32".parse().unwrap(), None, &forward_owner(1)).unwrap();
        table.add_prefix("192.0.2.1/32".parse().unwrap(), None, &forward_owner(1)).unwrap();

        assert_eq!(table.prefixes("network_1_forward").len(), 1);
        table.remove_prefix_by_owner(&forward_owner(1)).unwrap();
        assert!(table.prefixes("network_1_forward").is_empty());
        assert_eq!(table.prefixes("network_1").len(), 1);
    }
}
