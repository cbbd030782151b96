//! `libibverbs` provider.
//!
//! Only the verbs needed by one-sided READs over RC queue pairs are wrapped.
//! All handles keep their parents alive through `Arc`s, so dropping them in
//! any order is sound.

mod bindings;
mod context;
mod qp;

use std::io;

use self::context::{DeviceList, VerbsContext};
use super::*;
use crate::Result;

/// Provider backed by the RDMA devices of this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerbsProvider;

impl VerbsProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Provider for VerbsProvider {
    fn device_names(&self) -> io::Result<Vec<String>> {
        let list = DeviceList::new()?;
        Ok(list.iter().map(context::device_name).collect())
    }

    fn open(
        &self,
        dev_name: &str,
        port_num: PortNum,
        link_type: LinkType,
    ) -> Result<Box<dyn DeviceContext>> {
        Ok(Box::new(VerbsContext::open(dev_name, port_num, link_type)?))
    }
}
