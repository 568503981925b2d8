//! Column metadata: record declarations, the per-type descriptor cache, and
//! the column-letter and color caches shared by every export.

use crate::types::{CellValue, ExportError, FieldError, FieldType, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_COLUMN_WIDTH: f64 = 15.0;

/// Excel's column ceiling (XFD).
pub const MAX_COLUMNS: u32 = 16_384;

pub type Extractor<T> =
    Arc<dyn Fn(&T) -> std::result::Result<Option<CellValue>, FieldError> + Send + Sync>;

/// A record type that can be exported as one row per instance.
pub trait Record: Send + Sync + 'static {
    fn columns() -> Vec<ColumnSpec<Self>>
    where
        Self: Sized;
}

/// Declaration of one exported field, turned into a [`ColumnDescriptor`] once per type.
pub struct ColumnSpec<T> {
    field: &'static str,
    header: Option<String>,
    order: i32,
    color: Option<String>,
    width: Option<f64>,
    field_type: FieldType,
    nullable: bool,
    read_only: bool,
    extractor: Extractor<T>,
}

impl<T> ColumnSpec<T> {
    pub fn new<F>(field: &'static str, field_type: FieldType, extract: F) -> Self
    where
        F: Fn(&T) -> Option<CellValue> + Send + Sync + 'static,
    {
        Self::try_new(field, field_type, move |r| Ok(extract(r)))
    }

    pub fn try_new<F>(field: &'static str, field_type: FieldType, extract: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<Option<CellValue>, FieldError> + Send + Sync + 'static,
    {
        Self {
            field,
            header: None,
            order: 0,
            color: None,
            width: None,
            field_type,
            nullable: false,
            read_only: false,
            extractor: Arc::new(extract),
        }
    }

    pub fn header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn width(mut self, width: f64) -> Self {
        self.width = Some(width);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Compiled, immutable metadata plus accessor for one exported field.
pub struct ColumnDescriptor<T> {
    pub field: &'static str,
    pub name: String,
    pub order: i32,
    pub color: Option<String>,
    pub width: f64,
    pub field_type: FieldType,
    pub nullable: bool,
    pub read_only: bool,
    extractor: Extractor<T>,
}

impl<T> ColumnDescriptor<T> {
    fn from_spec(spec: ColumnSpec<T>) -> Self {
        let width = match spec.width {
            Some(w) if w > 0.0 && w.is_finite() => w,
            _ => DEFAULT_COLUMN_WIDTH,
        };
        Self {
            field: spec.field,
            name: spec.header.unwrap_or_else(|| spec.field.to_string()),
            order: spec.order,
            color: normalize_color(spec.color.as_deref()),
            width,
            field_type: spec.field_type,
            nullable: spec.nullable,
            read_only: spec.read_only,
            extractor: spec.extractor,
        }
    }

    #[inline]
    pub fn extract(&self, record: &T) -> std::result::Result<Option<CellValue>, FieldError> {
        (self.extractor)(record)
    }
}

impl<T> std::fmt::Debug for ColumnDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnDescriptor")
            .field("field", &self.field)
            .field("name", &self.name)
            .field("order", &self.order)
            .field("color", &self.color)
            .field("width", &self.width)
            .field("field_type", &self.field_type)
            .field("nullable", &self.nullable)
            .field("read_only", &self.read_only)
            .finish()
    }
}

pub type Descriptors<T> = Arc<Vec<ColumnDescriptor<T>>>;

static DESCRIPTOR_CACHE: Lazy<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Ordered column descriptors for `T`, built on first use and shared afterwards.
///
/// Every call for the same type returns the same `Arc`. A type with no
/// columns yields an empty list; [`require_descriptors`] turns that into an error.
pub fn descriptors<T: Record>() -> Descriptors<T> {
    let key = TypeId::of::<T>();

    if let Some(cached) = DESCRIPTOR_CACHE.read().get(&key).cloned() {
        if let Ok(hit) = cached.downcast::<Vec<ColumnDescriptor<T>>>() {
            return hit;
        }
    }

    let built = Arc::new(build_descriptors::<T>());
    let mut cache = DESCRIPTOR_CACHE.write();
    let entry = cache
        .entry(key)
        .or_insert_with(|| built.clone() as Arc<dyn Any + Send + Sync>)
        .clone();
    // Another thread may have won the race; hand back whatever is stored.
    entry.downcast::<Vec<ColumnDescriptor<T>>>().unwrap_or(built)
}

pub fn require_descriptors<T: Record>() -> Result<Descriptors<T>> {
    let descriptors = descriptors::<T>();
    if descriptors.is_empty() {
        return Err(ExportError::NoMappedColumns {
            type_name: std::any::type_name::<T>(),
        });
    }
    if descriptors.len() > MAX_COLUMNS as usize {
        return Err(ExportError::InvalidInput(format!(
            "type `{}` declares {} columns, more than the {} a sheet can hold",
            std::any::type_name::<T>(),
            descriptors.len(),
            MAX_COLUMNS
        )));
    }
    Ok(descriptors)
}

fn build_descriptors<T: Record>() -> Vec<ColumnDescriptor<T>> {
    let mut columns: Vec<ColumnDescriptor<T>> = T::columns()
        .into_iter()
        .map(ColumnDescriptor::from_spec)
        .collect();
    columns.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.field.cmp(b.field)));
    log::debug!(
        "built {} column descriptors for {}",
        columns.len(),
        std::any::type_name::<T>()
    );
    columns
}

static COLUMN_NAMES: Lazy<RwLock<HashMap<u32, String>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Letter name of a 1-based column number (1 -> A, 27 -> AA, 16384 -> XFD).
///
/// # Panics
///
/// Panics if `n` is zero.
pub fn column_name(n: u32) -> String {
    assert!(n > 0, "column numbers are 1-based");

    if let Some(name) = COLUMN_NAMES.read().get(&n) {
        return name.clone();
    }

    let mut buf = [0u8; 8];
    let len = write_col_letters(n, &mut buf);
    let name = String::from_utf8_lossy(&buf[..len]).into_owned();
    COLUMN_NAMES.write().entry(n).or_insert_with(|| name.clone());
    name
}

/// Bijective base-26 letters for a 1-based column, high-order first. Returns length written.
#[inline]
pub(crate) fn write_col_letters(n: u32, buf: &mut [u8; 8]) -> usize {
    let mut stack = [0u8; 8];
    let mut len = 0;
    let mut n = n;

    while n > 0 {
        let digit = (n - 1) % 26;
        stack[len] = b'A' + digit as u8;
        len += 1;
        n = (n - 1) / 26;
    }

    for i in 0..len {
        buf[i] = stack[len - 1 - i];
    }
    len
}

static NORMALIZED_COLORS: Lazy<RwLock<HashMap<String, String>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Canonical uppercase hex for a color, with any leading `#` removed.
///
/// Returns `None` for missing or empty input. The hex digits themselves are not
/// checked here; see [`is_valid_hex_color`].
pub fn normalize_color(input: Option<&str>) -> Option<String> {
    let raw = input?;
    if raw.is_empty() {
        return None;
    }

    if let Some(hit) = NORMALIZED_COLORS.read().get(raw) {
        return Some(hit.clone());
    }

    let normalized = raw.trim_start_matches('#').to_ascii_uppercase();
    NORMALIZED_COLORS
        .write()
        .entry(raw.to_string())
        .or_insert_with(|| normalized.clone());
    Some(normalized)
}

pub fn is_valid_hex_color(color: &str) -> bool {
    color.len() == 6 && color.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Field or display name -> 1-based column number, for one write.
#[derive(Debug, Clone, Default)]
pub struct ColumnIndexMap {
    by_name: HashMap<String, u32>,
}

impl ColumnIndexMap {
    pub fn from_descriptors<T>(descriptors: &[ColumnDescriptor<T>]) -> Self {
        let mut by_name = HashMap::with_capacity(descriptors.len() * 2);
        for (idx, d) in descriptors.iter().enumerate() {
            let col = idx as u32 + 1;
            by_name.entry(d.name.clone()).or_insert(col);
            // Field names win over display names that happen to collide.
            by_name.insert(d.field.to_string(), col);
        }
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn letter(&self, name: &str) -> Option<String> {
        self.get(name).map(column_name)
    }
}
