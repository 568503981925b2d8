//! Streaming xlsx generation for typed record collections.
//!
//! A record type declares its columns once through [`Record`]; the descriptors
//! are cached per type and drive everything else: one shared style table,
//! per-column data validations, dropdowns backed by a "Static Data" sheet and
//! expression-based conditional formatting. The package is written in a single
//! forward pass so memory stays bounded regardless of row count.
//!
//! ```no_run
//! use recordsheet::{
//!     export_to_path, CancellationToken, CellValue, ColumnSpec, FieldType, Record, SheetConfig,
//! };
//!
//! struct Employee {
//!     name: String,
//!     age: i64,
//! }
//!
//! impl Record for Employee {
//!     fn columns() -> Vec<ColumnSpec<Self>> {
//!         vec![
//!             ColumnSpec::new("name", FieldType::Text, |e: &Employee| {
//!                 Some(CellValue::from(e.name.as_str()))
//!             })
//!             .header("Name")
//!             .color("#90EE90"),
//!             ColumnSpec::new("age", FieldType::Integer, |e: &Employee| Some(CellValue::from(e.age)))
//!                 .order(1),
//!         ]
//!     }
//! }
//!
//! let staff = vec![Employee {
//!     name: "Ada".into(),
//!     age: 36,
//! }];
//! let token = CancellationToken::new();
//! export_to_path("staff.xlsx", &SheetConfig::new("Staff"), &staff, &token)?;
//! # Ok::<(), recordsheet::ExportError>(())
//! ```

pub mod columns;
pub mod conditional;
pub mod pool;
pub mod sheet;
pub mod static_data;
pub mod styles;
pub mod types;
pub mod validation;
pub mod writer;
pub mod xml;

pub use columns::{
    column_name, descriptors, normalize_color, ColumnDescriptor, ColumnIndexMap, ColumnSpec,
    Descriptors, Record,
};
pub use conditional::{ComparisonOperator, ConditionalRule, RuleAction};
pub use pool::BufferPool;
pub use static_data::{OptionList, STATIC_SHEET_NAME};
pub use types::{
    CancellationToken, CellValue, ExportError, ExtractErrorPolicy, FieldError, FieldType, Result,
};
pub use writer::{export_to_path, generate, ExportOptions, SheetConfig, DEFAULT_SHEET_NAME};
