//! Schema migrations for stored values
//!
//! Every stored envelope records the global `schema_version` it was written at.
//! On read, [`MigrationEngine::migrate`] walks the migrations registered for each
//! version from the stored one up to [`MigrationEngine::current_version`], feeding
//! each step the data and type name produced by the previous one.
//!
//! Migrations must be pure: concurrent readers may run the same chain on the same
//! input and must reach the same result. A step that fails (returns an error or
//! panics) is logged and skipped, and the chain continues with the data as it was
//! before that step. Reads degrade instead of failing, so callers can observe data
//! at an intermediate version while a migration is broken.
//!
//! The engine is built once from an explicit list and never mutated afterwards.

use crate::error::MigrationStepError;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// One upgrade step from `applies_to()` to `applies_to() + 1`
pub trait Migration: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Schema version this migration upgrades from
    fn applies_to(&self) -> u32;

    /// Transform data, and optionally rename its type
    fn migrate(&self, data: Value, type_name: &str) -> Result<(Value, String), MigrationStepError>;
}

/// Migration backed by a closure
pub struct FnMigration<F> {
    name: String,
    applies_to: u32,
    f: F,
}

impl<F> FnMigration<F>
where
    F: Fn(Value, &str) -> Result<(Value, String), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, applies_to: u32, f: F) -> Self {
        Self {
            name: name.into(),
            applies_to,
            f,
        }
    }
}

impl<F> Migration for FnMigration<F>
where
    F: Fn(Value, &str) -> Result<(Value, String), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self) -> u32 {
        self.applies_to
    }

    fn migrate(&self, data: Value, type_name: &str) -> Result<(Value, String), MigrationStepError> {
        (self.f)(data, type_name)
            .map_err(|message| MigrationStepError::new(&self.name, self.applies_to, message))
    }
}

/// Result of running the migration chain
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOutcome {
    pub data: Value,
    pub type_name: String,
    pub from_version: u32,
    pub to_version: u32,
    /// The data went through at least one version slot
    pub was_migrated: bool,
    /// Steps that failed and were skipped
    pub failed_steps: Vec<MigrationStepError>,
}

impl MigrationOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

/// Ordered, immutable migration chain
#[derive(Clone, Default)]
pub struct MigrationEngine {
    migrations: Vec<Arc<dyn Migration>>,
    current_version: u32,
}

impl MigrationEngine {
    /// Engine whose current version is one past the highest registered slot
    pub fn new(migrations: Vec<Arc<dyn Migration>>) -> Self {
        Self::with_current_version(migrations, 0)
    }

    /// Engine with an explicit floor for the current version
    pub fn with_current_version(mut migrations: Vec<Arc<dyn Migration>>, version: u32) -> Self {
        // stable: registration order is kept within a slot
        migrations.sort_by_key(|m| m.applies_to());
        let derived = migrations
            .iter()
            .map(|m| m.applies_to() + 1)
            .max()
            .unwrap_or(0);
        Self {
            migrations,
            current_version: derived.max(version),
        }
    }

    /// Engine without migrations at schema version zero
    pub fn none() -> Self {
        Self::default()
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Bring `data` from `from_version` up to the current version
    pub fn migrate(&self, data: Value, type_name: &str, from_version: u32) -> MigrationOutcome {
        let mut data = data;
        let mut type_name = type_name.to_string();
        let mut failed_steps = Vec::new();

        if from_version > self.current_version {
            debug!(
                from_version,
                current_version = self.current_version,
                "Stored schema is newer than this engine, leaving data untouched"
            );
        }

        for version in from_version..self.current_version {
            for migration in self.migrations.iter().filter(|m| m.applies_to() == version) {
                let input = data.clone();
                let step = panic::catch_unwind(AssertUnwindSafe(|| {
                    migration.migrate(input, &type_name)
                }));

                match step {
                    Ok(Ok((next_data, next_type))) => {
                        if next_type != type_name {
                            debug!(
                                migration = migration.name(),
                                from_type = %type_name,
                                to_type = %next_type,
                                "Migration renamed type"
                            );
                        }
                        data = next_data;
                        type_name = next_type;
                    }
                    Ok(Err(err)) => {
                        warn!(
                            migration = migration.name(),
                            version,
                            error = %err,
                            "Migration step failed, continuing with pre-step data"
                        );
                        failed_steps.push(err);
                    }
                    Err(_) => {
                        let err = MigrationStepError::new(
                            migration.name(),
                            version,
                            "migration panicked",
                        );
                        warn!(
                            migration = migration.name(),
                            version,
                            "Migration step panicked, continuing with pre-step data"
                        );
                        failed_steps.push(err);
                    }
                }
            }
        }

        MigrationOutcome {
            data,
            type_name,
            from_version,
            to_version: from_version.max(self.current_version),
            was_migrated: from_version < self.current_version,
            failed_steps,
        }
    }
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<(u32, &str)> = self
            .migrations
            .iter()
            .map(|m| (m.applies_to(), m.name()))
            .collect();
        f.debug_struct("MigrationEngine")
            .field("current_version", &self.current_version)
            .field("migrations", &names)
            .finish()
    }
}
