//! Sheet-name checks and the per-column data validation compiler.
use crate::columns::{ColumnDescriptor, ColumnIndexMap};
use crate::conditional::{condition_formula, ConditionalRule, RuleAction};
use crate::static_data::{OptionList, StaticDataLayout};
use crate::types::{ExportError, FieldType, Result};
use crate::xml::{column_range, xml_escape_simd};
use std::collections::HashSet;

// Excel hard limits
pub const MAX_ROWS: usize = 1_048_576;
const MAX_SHEET_NAME_LEN: usize = 31;
const INVALID_SHEET_CHARS: &str = "[]:*?/\\";

const DATE_LOWER: &str = "DATE(1900,1,1)";
const DATE_UPPER: &str = "DATE(2100,12,31)";
const TIME_LOWER: &str = "TIME(0,0,0)";
const TIME_UPPER: &str = "TIME(23,59,59)";

/// Escape sheet names for use in formulas.
/// Example: "Sheet1" -> "Sheet1"
///          "Static Data" -> "'Static Data'"
///          "Quote's" -> "'Quote''s'"
pub fn quote_sheet_name(name: &str) -> String {
    let needs_quoting = name.chars().any(|c| !c.is_alphanumeric() && c != '_');
    if needs_quoting {
        format!("'{}'", name.replace('\'', "''"))
    } else {
        name.to_string()
    }
}

/// Validate sheet name meets the format's requirements.
pub fn validate_sheet_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ExportError::InvalidInput("sheet name cannot be empty".into()));
    }

    let len = name.chars().count();
    if len > MAX_SHEET_NAME_LEN {
        return Err(ExportError::InvalidInput(format!(
            "sheet name '{name}' exceeds {MAX_SHEET_NAME_LEN} characters (has {len})"
        )));
    }

    if let Some(c) = name.chars().find(|c| INVALID_SHEET_CHARS.contains(*c)) {
        return Err(ExportError::InvalidInput(format!(
            "sheet name '{name}' contains invalid character '{c}'"
        )));
    }

    if name.chars().any(char::is_control) {
        return Err(ExportError::InvalidInput(format!(
            "sheet name '{name}' contains control characters"
        )));
    }

    if name.starts_with('\'') || name.ends_with('\'') {
        return Err(ExportError::InvalidInput(format!(
            "sheet name '{name}' cannot start or end with an apostrophe"
        )));
    }

    Ok(())
}

/// Validate all sheet names in a workbook; duplicates compare case-insensitively.
pub fn validate_sheet_names(names: &[&str]) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        validate_sheet_name(name)?;
        if !seen.insert(name.to_lowercase()) {
            return Err(ExportError::InvalidInput(format!(
                "duplicate sheet name '{name}' (sheet names are case-insensitive)"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    WholeNumber,
    Decimal,
    List,
    Date,
    Time,
    Custom,
}

impl ValidationKind {
    fn as_str(self) -> &'static str {
        match self {
            ValidationKind::WholeNumber => "whole",
            ValidationKind::Decimal => "decimal",
            ValidationKind::List => "list",
            ValidationKind::Date => "date",
            ValidationKind::Time => "time",
            ValidationKind::Custom => "custom",
        }
    }

    fn is_ranged(self) -> bool {
        !matches!(self, ValidationKind::List | ValidationKind::Custom)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRule {
    pub sqref: String,
    pub kind: ValidationKind,
    pub formula1: String,
    pub formula2: Option<String>,
    pub error_title: String,
    pub error_message: String,
    pub allow_blank: bool,
}

impl ValidationRule {
    fn between(
        sqref: String,
        kind: ValidationKind,
        lower: &str,
        upper: &str,
        allow_blank: bool,
        message: &str,
    ) -> Self {
        Self {
            sqref,
            kind,
            formula1: lower.to_string(),
            formula2: Some(upper.to_string()),
            error_title: "Invalid value".to_string(),
            error_message: message.to_string(),
            allow_blank,
        }
    }

    fn type_rule(sqref: String, field_type: FieldType, allow_blank: bool) -> Option<Self> {
        let rule = match field_type {
            FieldType::Integer => Self::between(
                sqref,
                ValidationKind::WholeNumber,
                "-2147483648",
                "2147483647",
                allow_blank,
                "Enter a whole number.",
            ),
            FieldType::Float | FieldType::Decimal => Self::between(
                sqref,
                ValidationKind::Decimal,
                "-1E+300",
                "1E+300",
                allow_blank,
                "Enter a number.",
            ),
            FieldType::Date | FieldType::DateTime => Self::between(
                sqref,
                ValidationKind::Date,
                DATE_LOWER,
                DATE_UPPER,
                allow_blank,
                "Enter a date between 01/01/1900 and 31/12/2100.",
            ),
            FieldType::Time => Self::between(
                sqref,
                ValidationKind::Time,
                TIME_LOWER,
                TIME_UPPER,
                allow_blank,
                "Enter a time of day.",
            ),
            FieldType::Duration => Self::between(
                sqref,
                ValidationKind::Decimal,
                "0",
                "999",
                allow_blank,
                "Enter a duration between 0 and 999 days.",
            ),
            FieldType::Text | FieldType::Bool | FieldType::Other => return None,
        };
        Some(rule)
    }
}

/// Compile the validation rules for the primary sheet.
///
/// Dropdown bindings are resolved first and cover their column. Conditional
/// read-only rules then claim uncovered targets with a custom rule. Every
/// remaining column gets a rule derived from its field type, if it has one.
pub fn compile<T>(
    descriptors: &[ColumnDescriptor<T>],
    columns: &ColumnIndexMap,
    last_row: usize,
    option_lists: &[OptionList],
    layout: Option<&StaticDataLayout>,
    rules: &[ConditionalRule],
) -> Vec<ValidationRule> {
    let mut out = Vec::new();
    let mut covered: HashSet<u32> = HashSet::new();

    if let Some(layout) = layout {
        for list in option_lists {
            let Some(default_ref) = layout.formula_reference(&list.label) else {
                continue;
            };
            for field in &list.bound_fields {
                let Some(col) = columns.get(field) else {
                    log::warn!("option list `{}` bound to unknown field `{field}`", list.label);
                    continue;
                };
                if !covered.insert(col) {
                    log::warn!("field `{field}` already has a dropdown; `{}` ignored", list.label);
                    continue;
                }
                out.push(ValidationRule {
                    sqref: column_range(col, 2, last_row),
                    kind: ValidationKind::List,
                    formula1: list_formula(col, default_ref.clone(), columns, layout, rules),
                    formula2: None,
                    error_title: "Invalid selection".to_string(),
                    error_message: "Pick a value from the list.".to_string(),
                    allow_blank: true,
                });
            }
        }
    }

    let mut locks: Vec<(u32, Vec<String>)> = Vec::new();
    for rule in rules
        .iter()
        .filter(|r| r.actions.contains(&RuleAction::SetReadOnly))
    {
        let Some(col) = columns.get(&rule.target) else {
            log::warn!("read-only rule targets unknown column `{}`", rule.target);
            continue;
        };
        if covered.contains(&col) {
            continue;
        }
        let Some(condition) = condition_formula(rule, columns, 2) else {
            log::warn!("read-only rule on `{}` has no usable condition; skipped", rule.target);
            continue;
        };
        match locks.iter_mut().find(|(c, _)| *c == col) {
            Some((_, conditions)) => conditions.push(condition),
            None => locks.push((col, vec![condition])),
        }
    }
    for (col, conditions) in locks {
        covered.insert(col);
        let any = if conditions.len() == 1 {
            conditions.concat()
        } else {
            format!("OR({})", conditions.join(","))
        };
        out.push(ValidationRule {
            sqref: column_range(col, 2, last_row),
            kind: ValidationKind::Custom,
            formula1: format!("NOT({any})"),
            formula2: None,
            error_title: "Read-only".to_string(),
            error_message: "This cell cannot be edited in its current state.".to_string(),
            allow_blank: true,
        });
    }

    for (idx, desc) in descriptors.iter().enumerate() {
        let col = idx as u32 + 1;
        if covered.contains(&col) {
            continue;
        }
        if let Some(rule) = ValidationRule::type_rule(
            column_range(col, 2, last_row),
            desc.field_type,
            desc.nullable,
        ) {
            out.push(rule);
        }
    }

    log::debug!("compiled {} validation rules", out.len());
    out
}

/// Wrap the default list reference in one `IF` per swap rule targeting `col`,
/// earliest rule outermost.
fn list_formula(
    col: u32,
    default_ref: String,
    columns: &ColumnIndexMap,
    layout: &StaticDataLayout,
    rules: &[ConditionalRule],
) -> String {
    let mut swaps: Vec<(String, String)> = Vec::new();
    for rule in rules {
        if columns.get(&rule.target) != Some(col) {
            continue;
        }
        for action in &rule.actions {
            let RuleAction::SwapDropdown(label) = action else { continue };
            let Some(swap_ref) = layout.formula_reference(label) else {
                log::warn!("dropdown swap references unknown option list `{label}`");
                continue;
            };
            if let Some(condition) = condition_formula(rule, columns, 2) {
                swaps.push((condition, swap_ref));
            }
        }
    }

    swaps
        .into_iter()
        .rev()
        .fold(default_ref, |otherwise, (condition, swap_ref)| {
            format!("IF({condition},{swap_ref},{otherwise})")
        })
}

pub fn write_data_validations(buf: &mut Vec<u8>, rules: &[ValidationRule]) {
    if rules.is_empty() {
        return;
    }

    buf.extend_from_slice(b"<dataValidations count=\"");
    buf.extend_from_slice(itoa::Buffer::new().format(rules.len()).as_bytes());
    buf.extend_from_slice(b"\">");

    for rule in rules {
        buf.extend_from_slice(b"<dataValidation type=\"");
        buf.extend_from_slice(rule.kind.as_str().as_bytes());
        buf.push(b'"');
        if rule.kind.is_ranged() {
            buf.extend_from_slice(b" operator=\"between\"");
        }
        buf.extend_from_slice(b" allowBlank=\"");
        buf.push(if rule.allow_blank { b'1' } else { b'0' });
        buf.extend_from_slice(b"\" showErrorMessage=\"1\" errorTitle=\"");
        xml_escape_simd(rule.error_title.as_bytes(), buf);
        buf.extend_from_slice(b"\" error=\"");
        xml_escape_simd(rule.error_message.as_bytes(), buf);
        buf.extend_from_slice(b"\" sqref=\"");
        buf.extend_from_slice(rule.sqref.as_bytes());
        buf.extend_from_slice(b"\"><formula1>");
        xml_escape_simd(rule.formula1.as_bytes(), buf);
        buf.extend_from_slice(b"</formula1>");
        if let Some(f2) = &rule.formula2 {
            buf.extend_from_slice(b"<formula2>");
            xml_escape_simd(f2.as_bytes(), buf);
            buf.extend_from_slice(b"</formula2>");
        }
        buf.extend_from_slice(b"</dataValidation>");
    }

    buf.extend_from_slice(b"</dataValidations>");
}
