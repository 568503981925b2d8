use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// A single typed value extracted from a record field.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// Time of day, written as a fraction of a day.
    Time(NaiveTime),
    Duration(TimeDelta),
    /// Any other value, rendered through its `Display` impl.
    Other(String),
}

impl CellValue {
    pub fn display(value: &impl std::fmt::Display) -> Self {
        CellValue::Other(value.to_string())
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for CellValue {
            fn from(n: $t) -> Self {
                CellValue::Integer(n as i64)
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for CellValue {
    fn from(n: f32) -> Self {
        CellValue::Float(n as f64)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Float(n)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(d: NaiveDate) -> Self {
        CellValue::Date(d)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(dt: NaiveDateTime) -> Self {
        CellValue::DateTime(dt)
    }
}

impl From<NaiveTime> for CellValue {
    fn from(t: NaiveTime) -> Self {
        CellValue::Time(t)
    }
}

impl From<TimeDelta> for CellValue {
    fn from(d: TimeDelta) -> Self {
        CellValue::Duration(d)
    }
}

/// Declared (underlying) type of a column, with any nullable wrapper removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Decimal,
    Bool,
    Date,
    DateTime,
    Time,
    Duration,
    Other,
}

impl FieldType {
    pub fn is_date_like(self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime)
    }

    pub fn is_time_like(self) -> bool {
        matches!(self, FieldType::Time | FieldType::Duration)
    }
}

/// What to do when a field's extraction function fails for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractErrorPolicy {
    /// Leave the cell blank (style only) and keep going.
    #[default]
    SkipCell,
    /// Fail the whole export on the first fault.
    Abort,
}

/// Fault raised by a column's extraction function.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct FieldError(pub String);

impl FieldError {
    pub fn new(msg: impl Into<String>) -> Self {
        FieldError(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("type `{type_name}` declares no exportable columns")]
    NoMappedColumns { type_name: &'static str },

    #[error("export canceled")]
    Canceled,

    #[error("generation failed: {context}")]
    GenerationFailed {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ExportError {
    pub fn failed(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ExportError::GenerationFailed {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ExportError::Canceled)
    }
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        ExportError::failed("I/O error", e)
    }
}

impl From<zip::result::ZipError> for ExportError {
    fn from(e: zip::result::ZipError) -> Self {
        ExportError::failed("zip container error", e)
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;

/// Cooperative cancellation flag shared between the caller and a running export.
///
/// The engine polls it at batch boundaries, so cancellation latency is bounded
/// by the configured batch size.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(ExportError::Canceled)
        } else {
            Ok(())
        }
    }
}
