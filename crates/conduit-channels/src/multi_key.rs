//! Credential pool of a channel
//!
//! A multi-key channel carries several credentials for the same backend.
//! Each slot has its own status so a revoked key can be taken out of
//! rotation without disabling the whole channel. Slots come back only
//! through an explicit enable.

use conduit_config::MultiKeyMode;
use conduit_core::{ChannelStatus, now_secs};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::error::KeyError;

const DEFAULT_PAGE_SIZE: usize = 10;
const MAX_PAGE_SIZE: usize = 100;
const PREVIEW_CHARS: usize = 8;

/// One credential and its rotation state
#[derive(Debug, Clone)]
pub struct KeySlot {
    pub key: SecretString,
    pub status: ChannelStatus,
    pub disabled_at: Option<i64>,
    pub disabled_reason: Option<String>,
}

impl KeySlot {
    fn new(key: SecretString) -> Self {
        Self {
            key,
            status: ChannelStatus::Enabled,
            disabled_at: None,
            disabled_reason: None,
        }
    }

    fn enable(&mut self) -> bool {
        if self.status.is_enabled() {
            return false;
        }

        self.status = ChannelStatus::Enabled;
        self.disabled_at = None;
        self.disabled_reason = None;
        true
    }

    fn disable(&mut self, status: ChannelStatus, reason: &str) -> bool {
        // an automatic failure never overrides an operator decision
        if self.status == ChannelStatus::ManuallyDisabled && status == ChannelStatus::AutoDisabled {
            return false;
        }

        if self.status == status {
            return false;
        }

        self.status = status;
        self.disabled_at = Some(now_secs());
        self.disabled_reason = Some(reason.to_owned());
        true
    }

    fn preview(&self) -> String {
        let key = self.key.expose_secret();
        let head: String = key.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}

/// Credential handed to the adaptor for one attempt
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub index: usize,
    pub key: SecretString,
}

/// Ordered credential slots plus the rotation cursor
#[derive(Debug, Clone)]
pub struct KeyPool {
    slots: Vec<KeySlot>,
    mode: Option<MultiKeyMode>,
    polling_index: usize,
}

impl KeyPool {
    pub fn new(keys: Vec<SecretString>, mode: Option<MultiKeyMode>) -> Self {
        Self {
            slots: keys.into_iter().map(KeySlot::new).collect(),
            mode,
            polling_index: 0,
        }
    }

    /// Whether slots are rotated and tracked individually
    pub const fn is_multi_key(&self) -> bool {
        self.mode.is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[KeySlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&KeySlot> {
        self.slots.get(index)
    }

    pub fn enabled_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.status.is_enabled()).count()
    }

    /// Whether a request could be served with one of these credentials
    pub fn has_usable_key(&self) -> bool {
        if self.is_multi_key() {
            self.enabled_count() > 0
        } else {
            !self.slots.is_empty()
        }
    }

    /// Pick the credential for the next attempt
    pub fn next_enabled_key(&mut self) -> Result<SelectedKey, KeyError> {
        let Some(mode) = self.mode else {
            return self
                .slots
                .first()
                .map(|slot| SelectedKey {
                    index: 0,
                    key: slot.key.clone(),
                })
                .ok_or(KeyError::NoEnabledKey);
        };

        let index = match mode {
            MultiKeyMode::Random => {
                let enabled: Vec<usize> = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.status.is_enabled())
                    .map(|(index, _)| index)
                    .collect();

                if enabled.is_empty() {
                    return Err(KeyError::NoEnabledKey);
                }

                enabled[rand::rng().random_range(0..enabled.len())]
            }
            MultiKeyMode::Polling => {
                let len = self.slots.len();
                let start = self.polling_index % len.max(1);

                let found = (0..len)
                    .map(|offset| (start + offset) % len)
                    .find(|&index| self.slots[index].status.is_enabled())
                    .ok_or(KeyError::NoEnabledKey)?;

                self.polling_index = (found + 1) % len;
                found
            }
        };

        Ok(SelectedKey {
            index,
            key: self.slots[index].key.clone(),
        })
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut KeySlot, KeyError> {
        let len = self.slots.len();
        self.slots.get_mut(index).ok_or(KeyError::IndexOutOfRange { index, len })
    }

    /// Take one slot out of rotation
    ///
    /// Returns whether the slot changed.
    pub fn disable(&mut self, index: usize, status: ChannelStatus, reason: &str) -> Result<bool, KeyError> {
        Ok(self.slot_mut(index)?.disable(status, reason))
    }

    /// Put one slot back into rotation
    pub fn enable(&mut self, index: usize) -> Result<bool, KeyError> {
        Ok(self.slot_mut(index)?.enable())
    }

    /// Enable every disabled slot, returning how many changed
    pub fn enable_all(&mut self) -> usize {
        self.slots.iter_mut().map(KeySlot::enable).filter(|changed| *changed).count()
    }

    /// Manually disable every enabled slot, returning how many changed
    pub fn disable_all(&mut self, reason: &str) -> usize {
        self.slots
            .iter_mut()
            .filter(|slot| slot.status.is_enabled())
            .map(|slot| slot.disable(ChannelStatus::ManuallyDisabled, reason))
            .filter(|changed| *changed)
            .count()
    }

    /// Remove one slot, shifting later slots (and their state) down by one
    pub fn delete(&mut self, index: usize) -> Result<(), KeyError> {
        let len = self.slots.len();

        if index >= len {
            return Err(KeyError::IndexOutOfRange { index, len });
        }

        if len == 1 {
            return Err(KeyError::LastKey);
        }

        self.slots.remove(index);

        if self.polling_index > index {
            self.polling_index -= 1;
        }
        self.polling_index %= self.slots.len();

        Ok(())
    }

    /// Remove every auto-disabled slot, returning how many were removed
    pub fn delete_auto_disabled(&mut self) -> Result<usize, KeyError> {
        let doomed = self
            .slots
            .iter()
            .filter(|slot| slot.status == ChannelStatus::AutoDisabled)
            .count();

        if doomed == 0 {
            return Ok(0);
        }

        if doomed == self.slots.len() {
            return Err(KeyError::WouldDeleteAll);
        }

        self.slots.retain(|slot| slot.status != ChannelStatus::AutoDisabled);
        self.polling_index = 0;

        Ok(doomed)
    }

    /// One page of slot metadata, optionally filtered by status
    pub fn list(&self, page: usize, page_size: usize, status: Option<ChannelStatus>) -> KeyPage {
        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };

        let matching: Vec<KeyInfo> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| status.is_none_or(|status| slot.status == status))
            .map(|(index, slot)| KeyInfo {
                index,
                status: slot.status,
                disabled_reason: slot.disabled_reason.clone(),
                disabled_at: slot.disabled_at,
                key_preview: slot.preview(),
            })
            .collect();

        let total = matching.len();
        let total_pages = total.div_ceil(page_size);
        let page = page.clamp(1, total_pages.max(1));

        let keys = matching
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        let count = |status: ChannelStatus| self.slots.iter().filter(|slot| slot.status == status).count();

        KeyPage {
            keys,
            total,
            page,
            page_size,
            total_pages,
            enabled_count: count(ChannelStatus::Enabled),
            manual_disabled_count: count(ChannelStatus::ManuallyDisabled),
            auto_disabled_count: count(ChannelStatus::AutoDisabled),
        }
    }
}

/// Slot metadata safe to show an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub index: usize,
    pub status: ChannelStatus,
    pub disabled_reason: Option<String>,
    pub disabled_at: Option<i64>,
    pub key_preview: String,
}

/// Paginated key listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyPage {
    pub keys: Vec<KeyInfo>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub enabled_count: usize,
    pub manual_disabled_count: usize,
    pub auto_disabled_count: usize,
}
