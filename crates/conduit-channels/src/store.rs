use std::sync::{Arc, Mutex, MutexGuard};

use conduit_config::ChannelConfig;
use conduit_core::{ChannelId, ChannelStatus};
use dashmap::DashMap;

use crate::channel::Channel;
use crate::error::{ChannelStoreError, KeyError};
use crate::multi_key::{KeyPage, KeyPool, SelectedKey};

/// One channel behind its own lock
///
/// The lock guards metadata only and is never held across an await point.
#[derive(Debug)]
pub struct ChannelEntry {
    id: ChannelId,
    channel: Mutex<Channel>,
}

impl ChannelEntry {
    pub fn new(channel: Channel) -> Self {
        Self {
            id: channel.id,
            channel: Mutex::new(channel),
        }
    }

    pub const fn id(&self) -> ChannelId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current channel state
    pub fn snapshot(&self) -> Channel {
        self.lock().clone()
    }

    /// Rotate to the next usable credential
    pub fn next_key(&self) -> Result<SelectedKey, KeyError> {
        self.lock().keys.next_enabled_key()
    }

    /// Mutate the credential pool of a multi-key channel, then reconcile the channel status
    pub fn update_keys<T>(&self, f: impl FnOnce(&mut KeyPool) -> Result<T, KeyError>) -> Result<T, KeyError> {
        let mut channel = self.lock();

        if !channel.is_multi_key() {
            return Err(KeyError::NotMultiKey);
        }

        let enabled_before = channel.keys.enabled_count();
        let result = f(&mut channel.keys)?;
        channel.reconcile_key_status(enabled_before);

        Ok(result)
    }

    pub fn list_keys(&self, page: usize, page_size: usize, status: Option<ChannelStatus>) -> Result<KeyPage, KeyError> {
        let channel = self.lock();

        if !channel.is_multi_key() {
            return Err(KeyError::NotMultiKey);
        }

        Ok(channel.keys.list(page, page_size, status))
    }
}

/// Registry of every configured channel
#[derive(Debug, Default)]
pub struct ChannelStore {
    channels: DashMap<ChannelId, Arc<ChannelEntry>>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ChannelConfig]) -> Self {
        let store = Self::new();

        for config in configs {
            store.insert(Channel::from_config(config));
        }

        store
    }

    pub fn insert(&self, channel: Channel) {
        self.channels.insert(channel.id, Arc::new(ChannelEntry::new(channel)));
    }

    pub fn get(&self, id: ChannelId) -> Result<Arc<ChannelEntry>, ChannelStoreError> {
        self.channels
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ChannelStoreError::NotFound(id))
    }

    /// Every channel, ordered by id
    pub fn all(&self) -> Vec<Arc<ChannelEntry>> {
        let mut entries: Vec<_> = self.channels.iter().map(|entry| Arc::clone(entry.value())).collect();
        entries.sort_by_key(|entry| entry.id());
        entries
    }

    /// Channels sharing a tag, ordered by id
    pub fn tagged(&self, tag: &str) -> Vec<Arc<ChannelEntry>> {
        self.all()
            .into_iter()
            .filter(|entry| entry.lock().tag.as_deref() == Some(tag))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use conduit_config::Config;

    use super::*;

    fn store() -> ChannelStore {
        let config = Config::from_toml(
            r#"
            [[channels]]
            id = 2
            name = "pool"
            base_url = "https://a.example.com"
            keys = ["sk-a", "sk-b"]
            multi_key = "polling"
            tag = "east"
            models = ["gpt-4o"]

            [[channels]]
            id = 1
            name = "single"
            base_url = "https://b.example.com"
            keys = ["sk-c"]
            tag = "east"
            models = ["gpt-4o"]

            [[channels]]
            id = 3
            name = "other"
            base_url = "https://c.example.com"
            keys = ["sk-d"]
            models = ["gpt-4o"]
            "#,
        )
        .unwrap();

        ChannelStore::from_configs(&config.channels)
    }

    #[test]
    fn all_is_ordered_by_id() {
        let ids: Vec<_> = store().all().iter().map(|entry| entry.id()).collect();
        assert_eq!(ids, [1, 2, 3]);
    }

    #[test]
    fn tagged_channels() {
        let ids: Vec<_> = store().tagged("east").iter().map(|entry| entry.id()).collect();
        assert_eq!(ids, [1, 2]);
        assert!(store().tagged("west").is_empty());
    }

    #[test]
    fn missing_channel() {
        assert_eq!(store().get(42).unwrap_err(), ChannelStoreError::NotFound(42));
    }

    #[test]
    fn key_operations_require_multi_key() {
        let store = store();
        let single = store.get(1).unwrap();
        assert_eq!(single.update_keys(|keys| keys.enable(0)).unwrap_err(), KeyError::NotMultiKey);
        assert_eq!(single.list_keys(1, 10, None).unwrap_err(), KeyError::NotMultiKey);
    }

    #[test]
    fn disabling_every_slot_through_the_entry_disables_the_channel() {
        let store = store();
        let pool = store.get(2).unwrap();

        pool.update_keys(|keys| keys.disable(0, ChannelStatus::AutoDisabled, "401"))
            .unwrap();
        assert!(pool.lock().is_selectable());

        pool.update_keys(|keys| keys.disable(1, ChannelStatus::AutoDisabled, "401"))
            .unwrap();
        let channel = pool.snapshot();
        assert_eq!(channel.status, ChannelStatus::AutoDisabled);
        assert!(!channel.is_selectable());

        pool.update_keys(|keys| Ok(keys.enable_all())).unwrap();
        assert_eq!(pool.lock().status, ChannelStatus::Enabled);
    }
}
