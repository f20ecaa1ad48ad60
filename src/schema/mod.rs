//! Schema drift detection and repair.

pub mod compare;
pub mod ddl;
pub mod deps;
pub mod fix;
pub mod introspect;

pub use compare::{validate_schema, ColumnDiff, ColumnSets, SchemaValidationResult};
pub use ddl::{parse_column_definitions, parse_expected_columns, DdlError, SchemaSource};
pub use deps::{dependencies_from_definitions, topo_order, DependencyGraph, TableOrder};
pub use fix::{
    apply_fixes, generate_fix_plan, generate_fix_plan_from_file, ColumnFix, FixError, FixHooks,
    FixPlan, FixResult, TableFix,
};
pub use introspect::sqlite_column_sets;
