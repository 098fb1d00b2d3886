use std::collections::HashMap;
use std::net::Ipv4Addr;

use super::classify::Category;
use super::FlowRate;

/// Link-level aggregation key: address pair and protocol, ports ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NicKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
}

/// Summed throughput of all flows sharing a [`NicKey`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NicRate {
    pub rate: FlowRate,
    /// Category of the most recently added flow.
    pub category: Category,
}

/// Per-tick NIC aggregate.
#[derive(Debug, Default)]
pub struct NicRates {
    rates: HashMap<NicKey, NicRate>,
}

impl NicRates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one flow's rate to its address-pair bucket.
    pub fn add(&mut self, key: NicKey, rate: FlowRate, category: Category) {
        self.rates
            .entry(key)
            .and_modify(|e| {
                e.rate.bytes_per_sec += rate.bytes_per_sec;
                e.rate.bits_per_sec += rate.bits_per_sec;
                e.category = category;
            })
            .or_insert(NicRate { rate, category });
    }

    pub fn get(&self, key: &NicKey) -> Option<&NicRate> {
        self.rates.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NicKey, &NicRate)> {
        self.rates.iter()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn clear(&mut self) {
        self.rates.clear();
    }
}
