//! Side sheet holding the option lists that back dropdown validations.

use crate::columns::column_name;
use crate::pool::BufferPool;
use crate::styles::STYLE_HEADER;
use crate::types::{CancellationToken, Result};
use crate::validation::quote_sheet_name;
use crate::xml::{strip_invalid_xml_chars, write_cell_ref, write_inline_text, XML_DECL};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;

pub const STATIC_SHEET_NAME: &str = "Static Data";

const STATIC_COLUMN_WIDTH: f64 = 24.0;

/// Caller-supplied candidate values for a dropdown, bound to fields of the record type.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionList {
    pub label: String,
    pub values: Vec<String>,
    pub bound_fields: Vec<String>,
}

impl OptionList {
    pub fn new<I, S>(label: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            values: values.into_iter().map(Into::into).collect(),
            bound_fields: Vec::new(),
        }
    }

    pub fn bind(mut self, field: impl Into<String>) -> Self {
        self.bound_fields.push(field.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedList {
    pub label: String,
    pub column: u32,
    /// Deduplicated, sorted values as they appear on the sheet.
    pub values: Vec<String>,
}

impl PlannedList {
    /// Last sheet row holding a value; row 2 for an empty list so the reference stays valid.
    pub fn last_row(&self) -> usize {
        (self.values.len() + 1).max(2)
    }

    pub fn range(&self) -> String {
        let col = column_name(self.column);
        format!("${col}$2:${col}${}", self.last_row())
    }
}

/// Layout of the static sheet, fixed before any sheet is streamed so the main
/// sheet's validations can reference it.
#[derive(Debug, Clone, Default)]
pub struct StaticDataLayout {
    lists: Vec<PlannedList>,
}

/// What the static sheet materialized, keyed by option-list label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticSheetOutput {
    pub values: HashMap<String, Vec<String>>,
    pub ranges: HashMap<String, String>,
    pub rows_written: usize,
}

impl StaticDataLayout {
    /// Plan one column per list, with a blank separator column between lists.
    pub fn plan(option_lists: &[OptionList]) -> Option<Self> {
        if option_lists.is_empty() {
            return None;
        }

        let mut labels = HashSet::new();
        let mut lists = Vec::with_capacity(option_lists.len());
        for list in option_lists {
            if !labels.insert(list.label.as_str()) {
                log::warn!("duplicate option list `{}` ignored", list.label);
                continue;
            }
            // Dedup on the text that lands in the sheet.
            let sorted: BTreeSet<String> = list
                .values
                .iter()
                .map(|v| strip_invalid_xml_chars(v).into_owned())
                .collect();
            lists.push(PlannedList {
                label: list.label.clone(),
                column: (lists.len() as u32) * 2 + 1,
                values: sorted.into_iter().collect(),
            });
        }
        Some(Self { lists })
    }

    pub fn lists(&self) -> &[PlannedList] {
        &self.lists
    }

    pub fn get(&self, label: &str) -> Option<&PlannedList> {
        self.lists.iter().find(|l| l.label == label)
    }

    pub fn values(&self, label: &str) -> Option<&[String]> {
        self.get(label).map(|l| l.values.as_slice())
    }

    pub fn range(&self, label: &str) -> Option<String> {
        self.get(label).map(PlannedList::range)
    }

    /// Sheet-qualified reference usable in a validation formula.
    pub fn formula_reference(&self, label: &str) -> Option<String> {
        self.range(label)
            .map(|range| format!("{}!{}", quote_sheet_name(STATIC_SHEET_NAME), range))
    }

    fn max_len(&self) -> usize {
        self.lists.iter().map(|l| l.values.len()).max().unwrap_or(0)
    }

    /// Stream the sheet: one bold header per list, then rows up to the longest list.
    /// Shorter lists simply stop contributing cells.
    pub fn write<W: Write>(
        &self,
        out: &mut W,
        pool: &BufferPool,
        poll_rows: usize,
        cancel: &CancellationToken,
    ) -> Result<StaticSheetOutput> {
        cancel.check()?;

        let max_len = self.max_len();
        let last_col = self.lists.last().map(|l| l.column).unwrap_or(1);

        let mut buf = pool.rent();
        buf.extend_from_slice(XML_DECL);
        buf.extend_from_slice(
            b"<worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" \
xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">",
        );
        buf.extend_from_slice(b"<dimension ref=\"A1:");
        write_cell_ref(last_col, max_len + 1, &mut buf);
        buf.extend_from_slice(b"\"/><sheetViews><sheetView workbookViewId=\"0\"/></sheetViews>");
        buf.extend_from_slice(b"<sheetFormatPr defaultRowHeight=\"15\"/><cols>");
        for list in &self.lists {
            let col = itoa::Buffer::new().format(list.column).to_string();
            buf.extend_from_slice(b"<col min=\"");
            buf.extend_from_slice(col.as_bytes());
            buf.extend_from_slice(b"\" max=\"");
            buf.extend_from_slice(col.as_bytes());
            buf.extend_from_slice(b"\" width=\"");
            buf.extend_from_slice(ryu::Buffer::new().format(STATIC_COLUMN_WIDTH).as_bytes());
            buf.extend_from_slice(b"\" customWidth=\"1\"/>");
        }
        buf.extend_from_slice(b"</cols><sheetData><row r=\"1\">");
        for list in &self.lists {
            buf.extend_from_slice(b"<c r=\"");
            write_cell_ref(list.column, 1, &mut buf);
            buf.extend_from_slice(b"\" s=\"");
            buf.extend_from_slice(itoa::Buffer::new().format(STYLE_HEADER).as_bytes());
            buf.extend_from_slice(b"\" t=\"inlineStr\">");
            write_inline_text(&strip_invalid_xml_chars(&list.label), &mut buf);
            buf.extend_from_slice(b"</c>");
        }
        buf.extend_from_slice(b"</row>");
        out.write_all(&buf)?;

        let mut rows_written = 1;
        for idx in 0..max_len {
            if poll_rows > 0 && idx % poll_rows == 0 {
                cancel.check()?;
            }
            let row = idx + 2;
            buf.clear();
            buf.extend_from_slice(b"<row r=\"");
            buf.extend_from_slice(itoa::Buffer::new().format(row).as_bytes());
            buf.extend_from_slice(b"\">");
            for list in &self.lists {
                let Some(value) = list.values.get(idx) else { continue };
                buf.extend_from_slice(b"<c r=\"");
                write_cell_ref(list.column, row, &mut buf);
                buf.extend_from_slice(b"\" t=\"inlineStr\">");
                write_inline_text(value, &mut buf);
                buf.extend_from_slice(b"</c>");
            }
            buf.extend_from_slice(b"</row>");
            out.write_all(&buf)?;
            rows_written += 1;
        }

        buf.clear();
        buf.extend_from_slice(
            b"</sheetData><pageMargins left=\"0.7\" right=\"0.7\" top=\"0.75\" bottom=\"0.75\" \
header=\"0.3\" footer=\"0.3\"/></worksheet>",
        );
        out.write_all(&buf)?;
        pool.give_back(buf);

        log::debug!(
            "static sheet: {} lists, {} rows",
            self.lists.len(),
            rows_written
        );

        Ok(StaticSheetOutput {
            values: self
                .lists
                .iter()
                .map(|l| (l.label.clone(), l.values.clone()))
                .collect(),
            ranges: self.lists.iter().map(|l| (l.label.clone(), l.range())).collect(),
            rows_written,
        })
    }
}
