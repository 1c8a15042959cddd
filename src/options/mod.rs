//! Type-indexed launch configuration
//!
//! An [`Options`] bag holds at most one value per option type. Each option type
//! declares its own default through [`LaunchOption::default_value`] and how a
//! later value combines with an earlier one through [`LaunchOption::compose`].

pub mod common;

pub use common::{
    Arguments, ClusterName, ClusterPort, DisplayName, Discriminator, EnvironmentVariables,
    Executable, GracePeriod, WorkingDirectory,
};

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A typed configuration value that can be placed in an [`Options`] bag
pub trait LaunchOption: Any + Send + Sync + fmt::Debug + Clone {
    /// Value used when the option is absent from a bag
    fn default_value() -> Option<Self> {
        None
    }

    /// Combine this (earlier) value with a later one.
    ///
    /// The later value replaces the earlier one unless the option overrides this.
    fn compose(&self, later: &Self) -> Self {
        later.clone()
    }
}

trait ErasedOption: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn compose_erased(&self, later: &dyn ErasedOption) -> Arc<dyn ErasedOption>;
}

impl<T: LaunchOption> ErasedOption for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn compose_erased(&self, later: &dyn ErasedOption) -> Arc<dyn ErasedOption> {
        match later.as_any().downcast_ref::<T>() {
            Some(later) => Arc::new(self.compose(later)),
            None => Arc::new(self.clone()),
        }
    }
}

/// An immutable-per-snapshot bag of launch options indexed by type
#[derive(Clone, Default)]
pub struct Options {
    entries: HashMap<TypeId, Arc<dyn ErasedOption>>,
}

impl Options {
    /// Create an empty bag
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add an option, returning the bag (builder style)
    pub fn with<T: LaunchOption>(mut self, option: T) -> Self {
        self.add(option);
        self
    }

    /// Add an option, composing it with any existing value of the same type
    pub fn add<T: LaunchOption>(&mut self, option: T) -> &mut Self {
        let id = TypeId::of::<T>();
        let composed: Arc<dyn ErasedOption> = match self.entries.get(&id) {
            Some(existing) => existing.compose_erased(&option),
            None => Arc::new(option),
        };
        self.entries.insert(id, composed);
        self
    }

    /// Add an option only when no value of its type is present
    pub fn add_if_absent<T: LaunchOption>(&mut self, option: T) -> &mut Self {
        self.entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(option));
        self
    }

    /// Replace any existing value of the option's type without composing
    pub fn set<T: LaunchOption>(&mut self, option: T) -> &mut Self {
        self.entries.insert(TypeId::of::<T>(), Arc::new(option));
        self
    }

    /// Compose every option of `other` into this bag, `other` taking precedence
    pub fn add_all(&mut self, other: &Options) -> &mut Self {
        for (id, later) in &other.entries {
            let composed = match self.entries.get(id) {
                Some(existing) => existing.compose_erased(&**later),
                None => Arc::clone(later),
            };
            self.entries.insert(*id, composed);
        }
        self
    }

    /// Return a new bag made of this one composed with `other`
    pub fn merged(&self, other: &Options) -> Options {
        let mut merged = self.clone();
        merged.add_all(other);
        merged
    }

    /// Get an option, falling back to the type's declared default
    pub fn get<T: LaunchOption>(&self) -> Option<T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|value| value.as_any().downcast_ref::<T>())
            .cloned()
            .or_else(T::default_value)
    }

    /// Get an option or the supplied fallback
    pub fn get_or<T: LaunchOption>(&self, fallback: T) -> T {
        self.get::<T>().unwrap_or(fallback)
    }

    /// Whether a value of the type was explicitly added
    pub fn contains<T: LaunchOption>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Remove the value of the type, returning whether one was present
    pub fn remove<T: LaunchOption>(&mut self) -> bool {
        self.entries.remove(&TypeId::of::<T>()).is_some()
    }

    /// Number of explicitly added options
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bag is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rendered: Vec<String> = self.entries.values().map(|v| format!("{:?}", v)).collect();
        rendered.sort();
        f.debug_list().entries(rendered).finish()
    }
}
