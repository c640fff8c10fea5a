//! Characteristic bindings for the current connection.

use crate::infrastructure::bluetooth::protocol::{self, CharacteristicRole};
use std::collections::HashMap;
use uuid::Uuid;

/// Maps discovered characteristics to roles. Cleared on every disconnect.
#[derive(Debug, Default)]
pub struct CharacteristicRegistry {
    by_uuid: HashMap<Uuid, CharacteristicRole>,
    by_role: HashMap<CharacteristicRole, Uuid>,
}

impl CharacteristicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `uuid` if it has a known role. Rebinding the same UUID is a no-op.
    pub fn bind(&mut self, uuid: Uuid) -> Option<CharacteristicRole> {
        let role = protocol::role_for_uuid(uuid)?;
        self.by_uuid.insert(uuid, role);
        self.by_role.insert(role, uuid);
        Some(role)
    }

    pub fn role_of(&self, uuid: &Uuid) -> Option<CharacteristicRole> {
        self.by_uuid.get(uuid).copied()
    }

    pub fn characteristic_for(&self, role: CharacteristicRole) -> Option<Uuid> {
        self.by_role.get(&role).copied()
    }

    pub fn has(&self, role: CharacteristicRole) -> bool {
        self.by_role.contains_key(&role)
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_uuid.clear();
        self.by_role.clear();
    }
}
