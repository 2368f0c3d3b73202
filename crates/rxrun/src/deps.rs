//! # Dependency Set
//!
//! A type-keyed bag of shared resources, built once before services are
//! constructed and read-only afterwards. Each service constructor receives it
//! by reference and clones out what it needs.

use anymap::any::Any;

/// Missing entries, reported by `require`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Missing(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(name) => write!(f, "missing dependency: {}", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One value per type.
pub struct DependencySet {
    values: anymap::Map<dyn Any + Send + Sync>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self { values: anymap::Map::new() }
    }

    /// Builder-style `insert`.
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Stores `value`, returning the one it replaced.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get::<T>()
    }

    pub fn require<T: Send + Sync + 'static>(&self) -> Result<&T> {
        self.get::<T>().ok_or(Error::Missing(std::any::type_name::<T>()))
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.values.contains::<T>()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for DependencySet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencySet").field("len", &self.len()).finish()
    }
}
