use std::collections::BTreeMap;
use std::sync::Arc;

use upshift_common::{Error, Result};

use super::step::MigrationStep;

/// Builds a fresh step instance for one attempted application.
pub type StepFactory = Arc<dyn Fn() -> Box<dyn MigrationStep> + Send + Sync>;

/// Maps a "from" version to the factory of the step that upgrades from it.
///
/// A miss is not an error by itself: the engine decides whether it means
/// "already at the target" or "no known path".
#[derive(Clone, Default)]
pub struct StepRegistry {
    factories: BTreeMap<u32, StepFactory>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under the `from_version` of the step it builds.
    pub fn register<F>(&mut self, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn MigrationStep> + Send + Sync + 'static,
    {
        let sample = factory();
        let from = sample.from_version();
        if let Some(existing) = self.factories.get(&from) {
            return Err(Error::Upgrade(format!(
                "duplicate step for version {from}: '{}' and '{}'",
                existing().title(),
                sample.title()
            )));
        }
        self.factories.insert(from, Arc::new(factory));
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, factory: F) -> Result<Self>
    where
        F: Fn() -> Box<dyn MigrationStep> + Send + Sync + 'static,
    {
        self.register(factory)?;
        Ok(self)
    }

    pub fn lookup(&self, version: u32) -> Option<Box<dyn MigrationStep>> {
        self.factories.get(&version).map(|factory| factory())
    }

    pub fn contains(&self, version: u32) -> bool {
        self.factories.contains_key(&version)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Versions that have a registered step, ascending.
    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.factories.keys().copied()
    }

    /// Highest version any registered step upgrades to.
    pub fn latest_version(&self) -> Option<u32> {
        self.factories.values().map(|factory| factory().to_version()).max()
    }

    /// Whether following registered steps from `from` lands exactly on `target`.
    pub fn reaches(&self, from: u32, target: u32) -> bool {
        let mut current = from;
        while current < target {
            match self.lookup(current) {
                Some(step) if step.to_version() > current => current = step.to_version(),
                _ => return false,
            }
        }
        current == target
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("versions", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
