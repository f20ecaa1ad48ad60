//! Declarative, FK-aware export and import of one owner's rows.
//!
//! Nothing in here names a table. The caller's [`BackupSchemaSet`] says
//! which tables exist, how rows are identified across environments (slug
//! plus owner), and which columns point at which parents.

pub mod export;
pub mod model;
pub mod restore;
pub mod snapshot;
pub mod validator;

pub use export::{backup_database, build_snapshot, BackupOptions};
pub use model::{BackupSchemaSet, ForeignKey, TableDefinition};
pub use restore::{
    restore_database, restore_snapshot, IdentityMap, RestoreError, RestoreMode, RestoreSummary,
    TableRestoreCounts,
};
pub use snapshot::{Snapshot, SnapshotMetadata, FORMAT_VERSION};
pub use validator::{validate_backup, BackupValidation};
