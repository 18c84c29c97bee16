//! Copy every namespace from one backend to another.
//!
//! Each `(namespace, instance_id)` the source lists is exported category by
//! category and re-imported on the destination, split into documents by the
//! category's arity. The first failed destination write aborts the run.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, instrument};

use crate::backend::Backend;
use crate::error::Result;

/// Custom group arities, keyed by namespace.
pub type CustomGroups = HashMap<String, HashMap<String, usize>>;

/// Summary of a finished migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `(namespace, instance_id)` pairs copied
    pub owners: Vec<(String, String)>,
    /// Non-empty categories copied, over all owners
    pub categories: usize,
}

impl MigrationReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub struct Migrator<'a> {
    source: &'a Backend,
    destination: &'a Backend,
    custom_groups: CustomGroups,
}

impl<'a> Migrator<'a> {
    pub fn new(source: &'a Backend, destination: &'a Backend) -> Self {
        Self {
            source,
            destination,
            custom_groups: CustomGroups::new(),
        }
    }

    /// Also copy the custom groups of `namespace`.
    pub fn with_custom_groups(mut self, namespace: impl Into<String>, groups: HashMap<String, usize>) -> Self {
        self.custom_groups.entry(namespace.into()).or_default().extend(groups);
        self
    }

    pub fn with_all_custom_groups(mut self, groups: CustomGroups) -> Self {
        for (namespace, groups) in groups {
            self = self.with_custom_groups(namespace, groups);
        }
        self
    }

    /// Run the migration.
    ///
    /// # Errors
    ///
    /// `StoreError::MigrationFailure` for the first destination write that
    /// fails; source read errors propagate unchanged.
    #[instrument(skip(self), fields(from = %self.source.kind(), to = %self.destination.kind()))]
    pub async fn run(&self) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let owners: Vec<(String, String)> = self.source.iterate_namespaces().try_collect().await?;
        let no_custom = HashMap::new();
        let mut categories = 0;

        for (namespace, instance_id) in &owners {
            let custom = self.custom_groups.get(namespace).unwrap_or(&no_custom);
            let source = self.source.raw_driver(namespace, instance_id).await?;
            let destination = self.destination.raw_driver(namespace, instance_id).await?;

            let data = source.export_data(custom).await?;
            categories += data.len();
            destination.import_data(data, custom).await?;
            info!(namespace, instance_id, "Migrated namespace");
        }

        // Destination writes bypassed its cache.
        if let Some(cache) = self.destination.cache() {
            cache.clear();
        }

        let report = MigrationReport {
            started_at,
            finished_at: Utc::now(),
            owners,
            categories,
        };
        info!(
            owners = report.owners.len(),
            categories = report.categories,
            elapsed_ms = report.elapsed().num_milliseconds(),
            "Migration complete"
        );
        Ok(report)
    }
}
