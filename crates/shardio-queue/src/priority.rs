//! Priority classes: named, share-weighted admission lanes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

static NEXT_REGISTRY_ID: AtomicU32 = AtomicU32::new(1);

/// Stable handle of a registered priority class.
///
/// A handle is only meaningful to the registry (and so the capacity group)
/// that issued it; lookups with a foreign handle find nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId {
    registry: u32,
    index: u32,
}

impl ClassId {
    pub(crate) fn new(registry: u32, index: u32) -> Self {
        Self { registry, index }
    }

    /// Identity of the registry that issued this handle.
    #[inline]
    pub fn registry(&self) -> u32 {
        self.registry
    }

    /// Position of the class in registration order.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.index)
    }
}

/// A registered priority class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityClass {
    /// Handle returned to callers.
    pub id: ClassId,
    /// Name, unique within the owning capacity group.
    pub name: String,
    /// Relative share weight (always positive).
    pub shares: u32,
}

/// Name-unique table of priority classes.
#[derive(Debug)]
pub struct ClassRegistry {
    id: u32,
    classes: Vec<PriorityClass>,
    by_name: HashMap<String, ClassId>,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    /// Creates an empty registry with a fresh identity.
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            classes: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Identity stamped into every handle this registry issues.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    fn slot(&self, id: ClassId) -> Option<usize> {
        (id.registry == self.id && (id.index as usize) < self.classes.len())
            .then_some(id.index as usize)
    }

    fn check_shares(shares: u32) -> QueueResult<()> {
        if shares == 0 {
            return Err(QueueError::InvalidConfig {
                reason: "priority class shares must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Registers `name` with `shares`. Registering an existing name updates its
    /// shares and returns the existing handle.
    pub fn register(&mut self, name: &str, shares: u32) -> QueueResult<ClassId> {
        Self::check_shares(shares)?;

        if let Some(&id) = self.by_name.get(name) {
            self.classes[id.index as usize].shares = shares;
            return Ok(id);
        }

        let id = ClassId::new(self.id, self.classes.len() as u32);
        self.classes.push(PriorityClass {
            id,
            name: name.to_string(),
            shares,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Changes the shares of a registered class.
    pub fn update_shares(&mut self, id: ClassId, shares: u32) -> QueueResult<()> {
        Self::check_shares(shares)?;
        let slot = self.slot(id).ok_or(QueueError::UnknownClass { class: id })?;
        let class = &mut self.classes[slot];
        class.shares = shares;
        Ok(())
    }

    /// Renames a registered class. Fails if the new name belongs to another class.
    pub fn rename(&mut self, id: ClassId, name: &str) -> QueueResult<()> {
        match self.by_name.get(name) {
            Some(&owner) if owner == id => return Ok(()),
            Some(_) => {
                return Err(QueueError::InvalidConfig {
                    reason: format!("priority class name '{}' already registered", name),
                })
            }
            None => {}
        }

        let slot = self.slot(id).ok_or(QueueError::UnknownClass { class: id })?;
        let class = &mut self.classes[slot];
        self.by_name.remove(&class.name);
        class.name = name.to_string();
        self.by_name.insert(name.to_string(), id);
        Ok(())
    }

    /// Looks up a class by handle.
    #[inline]
    pub fn get(&self, id: ClassId) -> Option<&PriorityClass> {
        self.slot(id).map(|slot| &self.classes[slot])
    }

    /// Looks up a class by name.
    pub fn by_name(&self, name: &str) -> Option<&PriorityClass> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    /// Number of registered classes.
    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// True when no class has been registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Iterates over registered classes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &PriorityClass> {
        self.classes.iter()
    }
}
