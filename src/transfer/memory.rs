use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use super::exchange::RemoteRegionDescriptor;
use crate::rdma::{LKey, MemoryHandle, RKey};
use crate::utils::sync::lock;
use crate::{Error, Result};

/// A registered local memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub key: String,
    pub base_address: u64,
    pub length: u64,
    pub local_key: LKey,
    pub remote_key: RKey,
}

impl MemoryRegion {
    /// Describe this region for the peer.
    #[inline]
    pub fn descriptor(&self) -> RemoteRegionDescriptor {
        RemoteRegionDescriptor {
            address: self.base_address,
            offset: 0,
            remote_key: self.remote_key,
        }
    }

    /// Whether `offset..offset + len` lies in this region.
    #[inline]
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.length)
    }
}

struct Registered {
    region: MemoryRegion,
    _handle: Box<dyn MemoryHandle>,
}

#[derive(Default)]
struct Tables {
    local: HashMap<String, Registered>,
    remote: HashMap<String, RemoteRegionDescriptor>,
}

/// Keyed tables of the local regions a connection registered and of the
/// peer's regions it may read from.
#[derive(Default)]
pub(crate) struct MemoryRegistry {
    tables: Mutex<Tables>,
}

impl fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = lock(&self.tables);
        f.debug_struct("MemoryRegistry")
            .field("local", &tables.local.len())
            .field("remote", &tables.remote.len())
            .finish()
    }
}

impl MemoryRegistry {
    /// Register a local region under `key` using `pin`, which is only called
    /// if the key is free.
    pub fn register(
        &self,
        key: &str,
        pin: impl FnOnce() -> Result<(MemoryRegion, Box<dyn MemoryHandle>)>,
    ) -> Result<MemoryRegion> {
        let mut tables = lock(&self.tables);
        if tables.local.contains_key(key) {
            return Err(Error::DuplicateKey(key.to_owned()));
        }
        let (region, handle) = pin()?;
        tables.local.insert(
            key.to_owned(),
            Registered {
                region: region.clone(),
                _handle: handle,
            },
        );
        Ok(region)
    }

    /// Store the peer's descriptor of `key`, returning the one it replaces.
    pub fn insert_remote(
        &self,
        key: &str,
        desc: RemoteRegionDescriptor,
    ) -> Option<RemoteRegionDescriptor> {
        lock(&self.tables).remote.insert(key.to_owned(), desc)
    }

    pub fn local(&self, key: &str) -> Option<MemoryRegion> {
        lock(&self.tables)
            .local
            .get(key)
            .map(|r| r.region.clone())
    }

    pub fn remote(&self, key: &str) -> Option<RemoteRegionDescriptor> {
        lock(&self.tables).remote.get(key).copied()
    }

    /// Look up both sides of `key` for a read.
    pub fn resolve(&self, key: &str) -> Result<(MemoryRegion, RemoteRegionDescriptor)> {
        let tables = lock(&self.tables);
        let local = tables
            .local
            .get(key)
            .ok_or_else(|| Error::UnknownKey(key.to_owned()))?;
        let remote = tables.remote.get(key).ok_or_else(|| {
            Error::InvalidAssignment(format!("no remote descriptor for region `{}`", key))
        })?;
        Ok((local.region.clone(), *remote))
    }

    /// Descriptors of all local regions, for the peer.
    pub fn descriptors(&self) -> BTreeMap<String, RemoteRegionDescriptor> {
        lock(&self.tables)
            .local
            .iter()
            .map(|(key, r)| (key.clone(), r.region.descriptor()))
            .collect()
    }

    /// All local regions.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        lock(&self.tables)
            .local
            .values()
            .map(|r| r.region.clone())
            .collect()
    }

    /// Deregister every local region and forget every remote descriptor.
    pub fn clear(&self) {
        let mut tables = lock(&self.tables);
        tables.local.clear();
        tables.remote.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountedMr(Arc<AtomicUsize>);

    impl MemoryHandle for CountedMr {
        fn lkey(&self) -> LKey {
            1
        }

        fn rkey(&self) -> RKey {
            2
        }
    }

    impl Drop for CountedMr {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn pin(
        key: &str,
        live: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> Result<(MemoryRegion, Box<dyn MemoryHandle>)> {
        let key = key.to_owned();
        let live = live.clone();
        move || {
            live.fetch_add(1, Ordering::SeqCst);
            let region = MemoryRegion {
                key,
                base_address: 0x1000,
                length: 256,
                local_key: 1,
                remote_key: 2,
            };
            Ok((region, Box::new(CountedMr(live)) as Box<dyn MemoryHandle>))
        }
    }

    #[test]
    fn duplicate_key_keeps_first() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = MemoryRegistry::default();
        registry.register("kv", pin("kv", &live)).unwrap();
        assert!(matches!(
            registry.register("kv", pin("kv", &live)),
            Err(Error::DuplicateKey(k)) if k == "kv"
        ));
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(registry.local("kv").unwrap().base_address, 0x1000);
    }

    #[test]
    fn resolve_needs_both_sides() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = MemoryRegistry::default();
        assert!(matches!(registry.resolve("kv"), Err(Error::UnknownKey(_))));

        registry.register("kv", pin("kv", &live)).unwrap();
        assert!(matches!(
            registry.resolve("kv"),
            Err(Error::InvalidAssignment(_))
        ));

        let desc = RemoteRegionDescriptor {
            address: 0x9000,
            offset: 0,
            remote_key: 7,
        };
        assert_eq!(registry.insert_remote("kv", desc), None);
        let newer = RemoteRegionDescriptor {
            remote_key: 8,
            ..desc
        };
        assert_eq!(registry.insert_remote("kv", newer), Some(desc));

        let (local, remote) = registry.resolve("kv").unwrap();
        assert_eq!(local.remote_key, 2);
        assert_eq!(remote, newer);
    }

    #[test]
    fn clear_deregisters() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = MemoryRegistry::default();
        registry.register("a", pin("a", &live)).unwrap();
        registry.register("b", pin("b", &live)).unwrap();
        assert_eq!(registry.descriptors().len(), 2);
        assert_eq!(live.load(Ordering::SeqCst), 2);

        registry.clear();
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(registry.regions().is_empty());
    }

    #[test]
    fn region_bounds() {
        let region = MemoryRegion {
            key: "kv".into(),
            base_address: 0,
            length: 100,
            local_key: 0,
            remote_key: 0,
        };
        assert!(region.contains(0, 100));
        assert!(region.contains(99, 1));
        assert!(!region.contains(99, 2));
        assert!(!region.contains(u64::MAX, 2));
    }
}
