//! Named counters for the update pipeline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Counter {
    UpdatesTotal,
    UpdatesIgnored,
    UpdatesNoChange,
    UpdatesFailed,
    VerifyFailures,
    InstallFailures,
    MetadataFetches,
    DatabaseFetches,
}

impl Counter {
    const ALL: [Counter; 8] = [
        Counter::UpdatesTotal,
        Counter::UpdatesIgnored,
        Counter::UpdatesNoChange,
        Counter::UpdatesFailed,
        Counter::VerifyFailures,
        Counter::InstallFailures,
        Counter::MetadataFetches,
        Counter::DatabaseFetches,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::UpdatesTotal => "updates.total",
            Counter::UpdatesIgnored => "updates.ignored",
            Counter::UpdatesNoChange => "updates.nochange",
            Counter::UpdatesFailed => "updates.failed",
            Counter::VerifyFailures => "updates.verified",
            Counter::InstallFailures => "updates.installed",
            Counter::MetadataFetches => "fetches.metadata",
            Counter::DatabaseFetches => "fetches.database",
        }
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    values: [AtomicU64; 8],
}

impl Counters {
    pub fn increment(&self, counter: Counter) {
        self.values[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Counter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect()
    }
}
