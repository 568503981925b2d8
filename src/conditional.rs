//! Declarative "when source matches, style target" rules compiled into
//! expression-based conditional formatting.

use crate::columns::{column_name, is_valid_hex_color, normalize_color, ColumnIndexMap};
use crate::styles::{DxfStyle, StyleTable};
use crate::types::ExportError;
use crate::xml::{column_range, xml_escape_simd};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Contains,
    NotContains,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Between,
}

impl FromStr for ComparisonOperator {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_ascii_lowercase().as_str() {
            "equal" | "equals" | "eq" | "=" | "==" => ComparisonOperator::Equal,
            "not_equal" | "notequal" | "ne" | "!=" | "<>" => ComparisonOperator::NotEqual,
            "contains" => ComparisonOperator::Contains,
            "not_contains" | "notcontains" => ComparisonOperator::NotContains,
            "greater_than" | "greaterthan" | "gt" | ">" => ComparisonOperator::GreaterThan,
            "greater_than_or_equal" | "greaterthanorequal" | "ge" | ">=" => {
                ComparisonOperator::GreaterThanOrEqual
            }
            "less_than" | "lessthan" | "lt" | "<" => ComparisonOperator::LessThan,
            "less_than_or_equal" | "lessthanorequal" | "le" | "<=" => {
                ComparisonOperator::LessThanOrEqual
            }
            "between" => ComparisonOperator::Between,
            other => {
                return Err(ExportError::InvalidInput(format!(
                    "unsupported comparison operator `{other}`"
                )))
            }
        };
        Ok(op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    SetBackground(String),
    SetFontColor(String),
    SetBold,
    SetReadOnly,
    /// Offer a different option list (by label) while the condition holds.
    SwapDropdown(String),
}

impl RuleAction {
    pub fn is_visual(&self) -> bool {
        matches!(
            self,
            RuleAction::SetBackground(_) | RuleAction::SetFontColor(_) | RuleAction::SetBold
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalRule {
    pub source: String,
    pub operator: ComparisonOperator,
    pub values: Vec<String>,
    pub target: String,
    pub actions: Vec<RuleAction>,
}

impl ConditionalRule {
    pub fn new<I, S>(
        source: impl Into<String>,
        operator: ComparisonOperator,
        values: I,
        target: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
            target: target.into(),
            actions: Vec::new(),
        }
    }

    pub fn action(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn background(self, color: impl Into<String>) -> Self {
        self.action(RuleAction::SetBackground(color.into()))
    }

    pub fn font_color(self, color: impl Into<String>) -> Self {
        self.action(RuleAction::SetFontColor(color.into()))
    }

    pub fn bold(self) -> Self {
        self.action(RuleAction::SetBold)
    }

    pub fn read_only(self) -> Self {
        self.action(RuleAction::SetReadOnly)
    }

    pub fn swap_dropdown(self, label: impl Into<String>) -> Self {
        self.action(RuleAction::SwapDropdown(label.into()))
    }

    pub fn is_visual(&self) -> bool {
        self.actions.iter().any(RuleAction::is_visual)
    }

    /// Differential format described by the visual actions. Malformed colors are ignored.
    pub fn dxf_style(&self) -> DxfStyle {
        let mut style = DxfStyle::default();
        for action in &self.actions {
            match action {
                RuleAction::SetBackground(c) => style.fill = valid_color(c).or(style.fill),
                RuleAction::SetFontColor(c) => {
                    style.font_color = valid_color(c).or(style.font_color)
                }
                RuleAction::SetBold => style.bold = true,
                RuleAction::SetReadOnly | RuleAction::SwapDropdown(_) => {}
            }
        }
        style
    }
}

fn valid_color(raw: &str) -> Option<String> {
    let color = normalize_color(Some(raw))?;
    if is_valid_hex_color(&color) {
        Some(color)
    } else {
        log::warn!("ignoring malformed rule color `{raw}`");
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormattingEntry {
    pub formula: String,
    pub style: DxfStyle,
    pub priority: u32,
}

/// All conditional entries targeting one column.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattingBlock {
    pub target_column: u32,
    pub sqref: String,
    pub entries: Vec<FormattingEntry>,
}

fn quote_literal(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn comparison_literal(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() => trimmed.to_string(),
        _ => quote_literal(value),
    }
}

fn join_call(func: &str, parts: Vec<String>) -> String {
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("{func}({})", parts.join(","))
    }
}

/// Spreadsheet formula for a rule's condition, relative to `first_row` of the target range.
///
/// Returns `None` when the source column is unknown or the operator has no usable values.
pub fn condition_formula(
    rule: &ConditionalRule,
    columns: &ColumnIndexMap,
    first_row: usize,
) -> Option<String> {
    let src_col = columns.get(&rule.source)?;
    let src = format!("${}{}", column_name(src_col), first_row);
    let values = &rule.values;
    if values.is_empty() {
        return None;
    }

    let formula = match rule.operator {
        ComparisonOperator::Equal => join_call(
            "OR",
            values.iter().map(|v| format!("{src}={}", quote_literal(v))).collect(),
        ),
        ComparisonOperator::NotEqual => join_call(
            "AND",
            values.iter().map(|v| format!("{src}<>{}", quote_literal(v))).collect(),
        ),
        ComparisonOperator::Contains => join_call(
            "OR",
            values
                .iter()
                .map(|v| format!("ISNUMBER(FIND({},{src}))", quote_literal(v)))
                .collect(),
        ),
        ComparisonOperator::NotContains => {
            let any = join_call(
                "OR",
                values
                    .iter()
                    .map(|v| format!("ISNUMBER(FIND({},{src}))", quote_literal(v)))
                    .collect(),
            );
            format!("NOT({any})")
        }
        ComparisonOperator::GreaterThan => format!("{src}>{}", comparison_literal(&values[0])),
        ComparisonOperator::GreaterThanOrEqual => {
            format!("{src}>={}", comparison_literal(&values[0]))
        }
        ComparisonOperator::LessThan => format!("{src}<{}", comparison_literal(&values[0])),
        ComparisonOperator::LessThanOrEqual => format!("{src}<={}", comparison_literal(&values[0])),
        ComparisonOperator::Between => {
            if values.len() < 2 {
                return None;
            }
            format!(
                "AND({src}>={},{src}<={})",
                comparison_literal(&values[0]),
                comparison_literal(&values[1])
            )
        }
    };
    Some(formula)
}

/// Group visual rules by target column into one block per column.
///
/// Non-visual rules, rules naming unknown columns and rules whose condition
/// cannot be expressed are skipped. Priorities run from 1 across all blocks in
/// first-seen target order.
pub fn compile(
    rules: &[ConditionalRule],
    columns: &ColumnIndexMap,
    last_row: usize,
) -> Vec<FormattingBlock> {
    let mut blocks: Vec<FormattingBlock> = Vec::new();

    for rule in rules.iter().filter(|r| r.is_visual()) {
        let Some(target_col) = columns.get(&rule.target) else {
            log::warn!("conditional rule targets unknown column `{}`", rule.target);
            continue;
        };
        let Some(formula) = condition_formula(rule, columns, 2) else {
            log::warn!(
                "conditional rule on `{}` -> `{}` has no usable condition; skipped",
                rule.source,
                rule.target
            );
            continue;
        };
        let style = rule.dxf_style();
        if style.is_empty() {
            continue;
        }

        let entry = FormattingEntry { formula, style, priority: 0 };
        match blocks.iter_mut().find(|b| b.target_column == target_col) {
            Some(block) => block.entries.push(entry),
            None => blocks.push(FormattingBlock {
                target_column: target_col,
                sqref: column_range(target_col, 2, last_row),
                entries: vec![entry],
            }),
        }
    }

    let mut priority = 1;
    for entry in blocks.iter_mut().flat_map(|b| b.entries.iter_mut()) {
        entry.priority = priority;
        priority += 1;
    }
    blocks
}

/// Differential formats referenced by the blocks, for the style table.
pub fn dxf_styles(blocks: &[FormattingBlock]) -> Vec<DxfStyle> {
    blocks
        .iter()
        .flat_map(|b| b.entries.iter().map(|e| e.style.clone()))
        .collect()
}

pub fn write_conditional_formatting(
    buf: &mut Vec<u8>,
    blocks: &[FormattingBlock],
    styles: &StyleTable,
) {
    for block in blocks {
        buf.extend_from_slice(b"<conditionalFormatting sqref=\"");
        buf.extend_from_slice(block.sqref.as_bytes());
        buf.extend_from_slice(b"\">");

        for entry in &block.entries {
            buf.extend_from_slice(b"<cfRule type=\"expression\"");
            if let Some(dxf_id) = styles.dxf_id(&entry.style) {
                buf.extend_from_slice(b" dxfId=\"");
                buf.extend_from_slice(itoa::Buffer::new().format(dxf_id).as_bytes());
                buf.push(b'"');
            }
            buf.extend_from_slice(b" priority=\"");
            buf.extend_from_slice(itoa::Buffer::new().format(entry.priority).as_bytes());
            buf.extend_from_slice(b"\"><formula>");
            xml_escape_simd(entry.formula.as_bytes(), buf);
            buf.extend_from_slice(b"</formula></cfRule>");
        }

        buf.extend_from_slice(b"</conditionalFormatting>");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{descriptors, ColumnSpec, Record};
    use crate::types::FieldType;
    use pretty_assertions::assert_eq;

    struct Account;

    impl Record for Account {
        fn columns() -> Vec<ColumnSpec<Self>> {
            vec![
                ColumnSpec::new("status", FieldType::Text, |_: &Account| None)
                    .order(1)
                    .header("Status"),
                ColumnSpec::new("name", FieldType::Text, |_: &Account| None)
                    .order(2)
                    .header("Name"),
                ColumnSpec::new("balance", FieldType::Float, |_: &Account| None).order(3),
            ]
        }
    }

    fn columns() -> ColumnIndexMap {
        ColumnIndexMap::from_descriptors(&descriptors::<Account>())
    }

    fn formula(rule: ConditionalRule) -> Option<String> {
        condition_formula(&rule, &columns(), 2)
    }

    #[test]
    fn test_equal_formulas() {
        let one = ConditionalRule::new("Status", ComparisonOperator::Equal, ["Active"], "Name");
        assert_eq!(formula(one).as_deref(), Some("$A2=\"Active\""));

        let many = ConditionalRule::new("status", ComparisonOperator::Equal, ["a", "b"], "name");
        assert_eq!(formula(many).as_deref(), Some("OR($A2=\"a\",$A2=\"b\")"));

        let quoted =
            ConditionalRule::new("status", ComparisonOperator::NotEqual, ["say \"hi\""], "name");
        assert_eq!(formula(quoted).as_deref(), Some("$A2<>\"say \"\"hi\"\"\""));
    }

    #[test]
    fn test_search_and_comparison_formulas() {
        let contains = ConditionalRule::new("name", ComparisonOperator::Contains, ["Ltd"], "name");
        assert_eq!(formula(contains).as_deref(), Some("ISNUMBER(FIND(\"Ltd\",$B2))"));

        let not_contains =
            ConditionalRule::new("name", ComparisonOperator::NotContains, ["x"], "name");
        assert_eq!(
            formula(not_contains).as_deref(),
            Some("NOT(ISNUMBER(FIND(\"x\",$B2)))")
        );

        let numeric =
            ConditionalRule::new("balance", ComparisonOperator::GreaterThan, ["100"], "name");
        assert_eq!(formula(numeric).as_deref(), Some("$C2>100"));

        let textual =
            ConditionalRule::new("name", ComparisonOperator::LessThanOrEqual, ["M"], "name");
        assert_eq!(formula(textual).as_deref(), Some("$B2<=\"M\""));

        let between =
            ConditionalRule::new("balance", ComparisonOperator::Between, ["1", "5"], "name");
        assert_eq!(formula(between).as_deref(), Some("AND($C2>=1,$C2<=5)"));
    }

    #[test]
    fn test_unusable_conditions() {
        let no_values = ConditionalRule::new(
            "status",
            ComparisonOperator::Equal,
            Vec::<String>::new(),
            "name",
        );
        assert_eq!(formula(no_values), None);
        let half_between =
            ConditionalRule::new("balance", ComparisonOperator::Between, ["1"], "name");
        assert_eq!(formula(half_between), None);
        let unknown = ConditionalRule::new("nope", ComparisonOperator::Equal, ["x"], "name");
        assert_eq!(formula(unknown), None);
        assert!("like".parse::<ComparisonOperator>().is_err());
        assert_eq!(
            "greater_than".parse::<ComparisonOperator>().unwrap(),
            ComparisonOperator::GreaterThan
        );
    }

    #[test]
    fn test_rules_group_by_target() {
        let rules = vec![
            ConditionalRule::new("Status", ComparisonOperator::Equal, ["Active"], "Name")
                .background("#90EE90"),
            ConditionalRule::new("balance", ComparisonOperator::LessThan, ["0"], "Name")
                .font_color("FF0000")
                .bold(),
            ConditionalRule::new("status", ComparisonOperator::Equal, ["Closed"], "balance").bold(),
            ConditionalRule::new("status", ComparisonOperator::Equal, ["Locked"], "balance")
                .read_only(),
            ConditionalRule::new("ghost", ComparisonOperator::Equal, ["x"], "Name").bold(),
        ];
        let blocks = compile(&rules, &columns(), 6);

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].sqref, "B2:B6");
        assert_eq!(blocks[0].entries.len(), 2);
        assert_eq!(blocks[0].entries[0].style.fill.as_deref(), Some("90EE90"));
        assert_eq!(blocks[0].entries[1].priority, 2);
        assert_eq!(blocks[1].sqref, "C2:C6");
        assert_eq!(blocks[1].entries[0].priority, 3);
    }

    #[test]
    fn test_written_blocks_reference_dxfs() {
        let rules = vec![ConditionalRule::new("status", ComparisonOperator::Equal, ["A"], "name")
            .background("00FF00")];
        let blocks = compile(&rules, &columns(), 3);
        let table = StyleTable::build(
            &descriptors::<Account>(),
            &dxf_styles(&blocks),
            &crate::types::CancellationToken::new(),
        )
        .unwrap();
        let mut buf = Vec::new();
        write_conditional_formatting(&mut buf, &blocks, &table);
        let xml = String::from_utf8(buf).unwrap();
        assert_eq!(
            xml,
            "<conditionalFormatting sqref=\"B2:B3\"><cfRule type=\"expression\" dxfId=\"0\" priority=\"1\">\
<formula>$A2=&quot;A&quot;</formula></cfRule></conditionalFormatting>"
        );
    }
}
