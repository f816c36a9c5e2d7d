//! In-memory interception layer
//!
//! Keeps every slot in process memory. Used for userspace-only runs, where
//! links are declared statically in the configuration, and by tests, which can
//! also inject the failures a kernel backend produces.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::*;

#[derive(Debug, Default)]
struct MemoryState {
    loaded: bool,
    load_attempts: usize,
    incompatible: Vec<String>,
    always_incompatible: Option<String>,
    removed: Vec<String>,
    params: HashMap<ParamKey, u32>,
    links: HashMap<String, LinkInfo>,
    link_ips: HashMap<u32, IfIpRecord>,
    hooks: HashSet<(u32, HookPoint)>,
    failing_uninstall: HashSet<HookPoint>,
}

/// Interception layer backed by plain maps
#[derive(Debug, Default)]
pub struct MemoryInterception {
    state: Mutex<MemoryState>,
}

impl MemoryInterception {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a link
    pub fn with_link(self, name: impl Into<String>, index: u32, addrs: Vec<IpAddr>) -> Self {
        let name = name.into();
        self.state().links.insert(
            name.clone(),
            LinkInfo {
                name,
                index,
                addrs,
            },
        );
        self
    }

    /// Pre-set a parameter slot, as left behind by a previous run
    pub fn with_param(self, key: ParamKey, value: u32) -> Self {
        self.state().params.insert(key, value);
        self
    }

    /// Pre-install a hook, as left behind by a previous run
    pub fn with_hook(self, ifindex: u32, hook: HookPoint) -> Self {
        self.state().hooks.insert((ifindex, hook));
        self
    }

    /// Make the next load fail once with an incompatible `object`
    pub fn with_incompatible(self, object: impl Into<String>) -> Self {
        self.state().incompatible.push(object.into());
        self
    }

    /// Make every load fail, however often the object is removed
    pub fn with_persistent_incompatibility(self, object: impl Into<String>) -> Self {
        self.state().always_incompatible = Some(object.into());
        self
    }

    /// Make uninstalling `hook` fail
    pub fn with_failing_uninstall(self, hook: HookPoint) -> Self {
        self.state().failing_uninstall.insert(hook);
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.state().loaded
    }

    pub fn load_attempts(&self) -> usize {
        self.state().load_attempts
    }

    /// Pinned objects removed so far, in order
    pub fn removed_objects(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn param(&self, key: ParamKey) -> Option<u32> {
        self.state().params.get(&key).copied()
    }

    pub fn link_ip(&self, ifindex: u32) -> Option<IfIpRecord> {
        self.state().link_ips.get(&ifindex).copied()
    }

    pub fn has_hook(&self, ifindex: u32, hook: HookPoint) -> bool {
        self.state().hooks.contains(&(ifindex, hook))
    }

    pub fn hook_count(&self) -> usize {
        self.state().hooks.len()
    }
}

impl InterceptionLayer for MemoryInterception {
    fn load_objects(&self) -> Result<(), InterceptionError> {
        let mut state = self.state();
        state.load_attempts += 1;

        if let Some(object) = state.always_incompatible.clone() {
            return Err(InterceptionError::Incompatible { object });
        }
        if !state.incompatible.is_empty() {
            let object = state.incompatible.remove(0);
            return Err(InterceptionError::Incompatible { object });
        }

        state.loaded = true;
        debug!("Interception objects loaded");
        Ok(())
    }

    fn remove_pinned(&self, object: &str) -> Result<(), InterceptionError> {
        self.state().removed.push(object.to_string());
        Ok(())
    }

    fn unload(&self) -> Result<(), InterceptionError> {
        let mut state = self.state();
        if !state.loaded {
            return Err(InterceptionError::NotLoaded);
        }
        state.loaded = false;
        state.link_ips.clear();
        Ok(())
    }

    fn update_param(&self, key: ParamKey, value: u32) -> Result<(), InterceptionError> {
        let mut state = self.state();
        if !state.loaded {
            return Err(InterceptionError::NotLoaded);
        }
        state.params.insert(key, value);
        Ok(())
    }

    fn lookup_param(&self, key: ParamKey) -> Result<Option<u32>, InterceptionError> {
        let state = self.state();
        if !state.loaded {
            return Err(InterceptionError::NotLoaded);
        }
        Ok(state.params.get(&key).copied())
    }

    fn link(&self, ifname: &str) -> Result<LinkInfo, InterceptionError> {
        self.state()
            .links
            .get(ifname)
            .cloned()
            .ok_or_else(|| InterceptionError::LinkNotFound(ifname.to_string()))
    }

    fn update_link_ip(&self, ifindex: u32, record: IfIpRecord) -> Result<(), InterceptionError> {
        let mut state = self.state();
        if !state.loaded {
            return Err(InterceptionError::NotLoaded);
        }
        state.link_ips.insert(ifindex, record);
        Ok(())
    }

    fn install_hook(&self, ifindex: u32, hook: HookPoint) -> Result<(), InterceptionError> {
        let mut state = self.state();
        if !state.hooks.insert((ifindex, hook)) {
            return Err(InterceptionError::AlreadyExists { ifindex, hook });
        }
        Ok(())
    }

    fn uninstall_hook(&self, ifindex: u32, hook: HookPoint) -> Result<(), InterceptionError> {
        let mut state = self.state();
        if state.failing_uninstall.contains(&hook) {
            return Err(InterceptionError::Other(format!(
                "cannot remove {} hook from link {}",
                hook, ifindex
            )));
        }
        if !state.hooks.remove(&(ifindex, hook)) {
            return Err(InterceptionError::Other(format!(
                "no {} hook on link {}",
                hook, ifindex
            )));
        }
        Ok(())
    }
}
