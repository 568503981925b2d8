//! Forward-only writer for the primary worksheet.
//!
//! Everything the sheet references (styles, validations, conditional blocks)
//! is computed before the first byte goes out; rows are then streamed in
//! batches through pooled buffers and never revisited.

use crate::columns::{write_col_letters, ColumnDescriptor};
use crate::conditional::{write_conditional_formatting, FormattingBlock};
use crate::pool::BufferPool;
use crate::styles::{ColumnStyles, StyleTable};
use crate::types::{CancellationToken, CellValue, ExportError, ExtractErrorPolicy, Result};
use crate::validation::{write_data_validations, ValidationRule};
use crate::writer::ExportOptions;
use crate::xml::{
    date_to_excel_serial, datetime_to_excel_serial, duration_to_days, sanitize_text,
    strip_invalid_xml_chars, time_to_day_fraction, write_cell_ref, write_inline_text, XML_DECL,
};
use std::io::Write;

const FLUSH_THRESHOLD: usize = 32 * 1024;
const WORKSHEET_OPEN: &[u8] =
    b"<worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" \
xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">";
const PAGE_MARGINS: &[u8] =
    b"<pageMargins left=\"0.7\" right=\"0.7\" top=\"0.75\" bottom=\"0.75\" header=\"0.3\" footer=\"0.3\"/>";

/// Style indices a single value may need; which one applies depends on the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellStyleSet {
    pub plain: u32,
    pub date: u32,
    pub time: u32,
}

/// Encodes one value as a `<c>` element.
#[derive(Default)]
pub struct CellValueWriter {
    ryu_buf: ryu::Buffer,
    int_buf: itoa::Buffer,
}

impl CellValueWriter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn open(buf: &mut Vec<u8>, cell_ref: &[u8], style: u32) {
        buf.extend_from_slice(b"<c r=\"");
        buf.extend_from_slice(cell_ref);
        buf.push(b'"');
        if style != 0 {
            buf.extend_from_slice(b" s=\"");
            buf.extend_from_slice(itoa::Buffer::new().format(style).as_bytes());
            buf.push(b'"');
        }
    }

    /// Empty cell that only carries a style; nothing at all for the default style.
    #[inline]
    pub fn write_blank(buf: &mut Vec<u8>, cell_ref: &[u8], style: u32) {
        if style == 0 {
            return;
        }
        Self::open(buf, cell_ref, style);
        buf.extend_from_slice(b"/>");
    }

    /// Inline string cell. The caller decides which sanitization `text` went through.
    pub fn write_text(buf: &mut Vec<u8>, cell_ref: &[u8], text: &str, style: u32) {
        Self::open(buf, cell_ref, style);
        buf.extend_from_slice(b" t=\"inlineStr\">");
        write_inline_text(text, buf);
        buf.extend_from_slice(b"</c>");
    }

    #[inline]
    fn write_number(&mut self, buf: &mut Vec<u8>, cell_ref: &[u8], n: f64, style: u32) {
        if !n.is_finite() {
            Self::write_blank(buf, cell_ref, style);
            return;
        }
        Self::open(buf, cell_ref, style);
        buf.extend_from_slice(b"><v>");
        let abs = n.abs();
        if n.fract() == 0.0 && abs < 9007199254740992.0 {
            buf.extend_from_slice(self.int_buf.format(n as i64).as_bytes());
        } else {
            buf.extend_from_slice(self.ryu_buf.format(n).as_bytes());
        }
        buf.extend_from_slice(b"</v></c>");
    }

    pub fn write(
        &mut self,
        buf: &mut Vec<u8>,
        cell_ref: &[u8],
        value: &CellValue,
        styles: CellStyleSet,
    ) {
        match value {
            CellValue::Text(s) | CellValue::Other(s) => {
                let text = sanitize_text(Some(s));
                if text.is_empty() {
                    Self::write_blank(buf, cell_ref, styles.plain);
                } else {
                    Self::write_text(buf, cell_ref, &text, styles.plain);
                }
            }
            CellValue::Integer(n) => {
                Self::open(buf, cell_ref, styles.plain);
                buf.extend_from_slice(b"><v>");
                buf.extend_from_slice(self.int_buf.format(*n).as_bytes());
                buf.extend_from_slice(b"</v></c>");
            }
            CellValue::Float(n) => self.write_number(buf, cell_ref, *n, styles.plain),
            CellValue::Bool(b) => {
                Self::open(buf, cell_ref, styles.plain);
                buf.extend_from_slice(b" t=\"b\"><v>");
                buf.push(if *b { b'1' } else { b'0' });
                buf.extend_from_slice(b"</v></c>");
            }
            CellValue::Date(d) => {
                self.write_number(buf, cell_ref, date_to_excel_serial(d), styles.date)
            }
            CellValue::DateTime(dt) => {
                self.write_number(buf, cell_ref, datetime_to_excel_serial(dt), styles.date)
            }
            CellValue::Time(t) => {
                self.write_number(buf, cell_ref, time_to_day_fraction(t), styles.time)
            }
            CellValue::Duration(d) => {
                self.write_number(buf, cell_ref, duration_to_days(d), styles.time)
            }
        }
    }
}

/// Structures the primary sheet references, all computed before streaming starts.
pub struct SheetParts<'a, T> {
    pub descriptors: &'a [ColumnDescriptor<T>],
    pub styles: &'a StyleTable,
    pub validations: &'a [ValidationRule],
    pub formatting: &'a [FormattingBlock],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SheetSummary {
    /// Logical rows including the header.
    pub rows_written: usize,
    pub skipped_cells: usize,
}

pub struct RowStreamWriter<'a, T> {
    parts: SheetParts<'a, T>,
    column_styles: ColumnStyles,
    col_letters: Vec<([u8; 8], usize)>,
    options: &'a ExportOptions,
    pool: &'a BufferPool,
}

impl<'a, T> RowStreamWriter<'a, T> {
    pub fn new(parts: SheetParts<'a, T>, options: &'a ExportOptions, pool: &'a BufferPool) -> Self {
        let column_styles = ColumnStyles::resolve(parts.styles, parts.descriptors);
        let col_letters = (1..=parts.descriptors.len() as u32)
            .map(|col| {
                let mut letters = [0u8; 8];
                let len = write_col_letters(col, &mut letters);
                (letters, len)
            })
            .collect();
        Self {
            parts,
            column_styles,
            col_letters,
            options,
            pool,
        }
    }

    fn last_col(&self) -> u32 {
        self.parts.descriptors.len().max(1) as u32
    }

    #[inline]
    fn cell_ref(&self, col: usize, row: usize, out: &mut Vec<u8>) {
        out.clear();
        let (letters, len) = &self.col_letters[col];
        out.extend_from_slice(&letters[..*len]);
        out.extend_from_slice(itoa::Buffer::new().format(row).as_bytes());
    }

    /// Stream the whole worksheet part. Cancellation is polled before the
    /// header and at every batch boundary.
    pub fn write<W: Write>(
        &self,
        out: &mut W,
        records: &[T],
        cancel: &CancellationToken,
    ) -> Result<SheetSummary> {
        cancel.check()?;

        let batch_size = self.options.batch_size.max(1);
        let mut summary = SheetSummary::default();
        let mut warned = vec![false; self.parts.descriptors.len()];
        let mut cells = CellValueWriter::new();

        let mut buf = self.pool.rent();
        self.write_prologue(&mut buf, records.len());
        self.write_header_row(&mut buf);
        out.write_all(&buf)?;
        self.pool.give_back(buf);
        summary.rows_written = 1;

        for (batch_idx, batch) in records.chunks(batch_size).enumerate() {
            cancel.check()?;
            let first_row = batch_idx * batch_size + 2;
            let mut buf = self.pool.rent();
            for (offset, record) in batch.iter().enumerate() {
                self.write_row(
                    &mut buf,
                    first_row + offset,
                    record,
                    &mut cells,
                    &mut warned,
                    &mut summary,
                )?;
                if buf.len() >= FLUSH_THRESHOLD {
                    out.write_all(&buf)?;
                    buf.clear();
                }
            }
            out.write_all(&buf)?;
            self.pool.give_back(buf);
            summary.rows_written += batch.len();
            log::debug!("streamed batch {} ({} rows)", batch_idx + 1, batch.len());
        }

        let mut buf = self.pool.rent();
        self.write_epilogue(&mut buf, records.len());
        out.write_all(&buf)?;
        self.pool.give_back(buf);

        Ok(summary)
    }

    fn write_prologue(&self, buf: &mut Vec<u8>, record_count: usize) {
        buf.extend_from_slice(XML_DECL);
        buf.extend_from_slice(WORKSHEET_OPEN);

        buf.extend_from_slice(b"<dimension ref=\"A1:");
        write_cell_ref(self.last_col(), record_count + 1, buf);
        buf.extend_from_slice(b"\"/>");

        buf.extend_from_slice(b"<sheetViews><sheetView tabSelected=\"1\" workbookViewId=\"0\"");
        if self.options.freeze_header {
            buf.extend_from_slice(
                b"><pane ySplit=\"1\" topLeftCell=\"A2\" activePane=\"bottomLeft\" state=\"frozen\"/>\
<selection pane=\"bottomLeft\" activeCell=\"A2\" sqref=\"A2\"/></sheetView></sheetViews>",
            );
        } else {
            buf.extend_from_slice(b"/></sheetViews>");
        }
        buf.extend_from_slice(b"<sheetFormatPr defaultRowHeight=\"15\"/>");

        if !self.parts.descriptors.is_empty() {
            buf.extend_from_slice(b"<cols>");
            let mut ryu_buf = ryu::Buffer::new();
            for (idx, desc) in self.parts.descriptors.iter().enumerate() {
                let col = itoa::Buffer::new().format(idx + 1).to_string();
                buf.extend_from_slice(b"<col min=\"");
                buf.extend_from_slice(col.as_bytes());
                buf.extend_from_slice(b"\" max=\"");
                buf.extend_from_slice(col.as_bytes());
                buf.extend_from_slice(b"\" width=\"");
                buf.extend_from_slice(ryu_buf.format(desc.width).as_bytes());
                buf.extend_from_slice(b"\" customWidth=\"1\"/>");
            }
            buf.extend_from_slice(b"</cols>");
        }

        buf.extend_from_slice(b"<sheetData>");
    }

    /// Header cells are always inline text; no formula guard is applied to display names.
    fn write_header_row(&self, buf: &mut Vec<u8>) {
        let mut cell_ref = Vec::with_capacity(16);
        buf.extend_from_slice(b"<row r=\"1\">");
        for (idx, desc) in self.parts.descriptors.iter().enumerate() {
            self.cell_ref(idx, 1, &mut cell_ref);
            CellValueWriter::write_text(
                buf,
                &cell_ref,
                &strip_invalid_xml_chars(&desc.name),
                self.column_styles.header[idx],
            );
        }
        buf.extend_from_slice(b"</row>");
    }

    fn write_row(
        &self,
        buf: &mut Vec<u8>,
        row: usize,
        record: &T,
        cells: &mut CellValueWriter,
        warned: &mut [bool],
        summary: &mut SheetSummary,
    ) -> Result<()> {
        let mut cell_ref = Vec::with_capacity(16);
        buf.extend_from_slice(b"<row r=\"");
        buf.extend_from_slice(itoa::Buffer::new().format(row).as_bytes());
        buf.extend_from_slice(b"\">");

        for (idx, desc) in self.parts.descriptors.iter().enumerate() {
            self.cell_ref(idx, row, &mut cell_ref);
            match desc.extract(record) {
                Ok(Some(value)) => {
                    let styles = CellStyleSet {
                        plain: self.column_styles.plain[idx],
                        date: self.column_styles.date[idx],
                        time: self.column_styles.time[idx],
                    };
                    cells.write(buf, &cell_ref, &value, styles);
                }
                Ok(None) => {
                    let style = self.column_styles.blank(idx, desc.field_type);
                    CellValueWriter::write_blank(buf, &cell_ref, style);
                }
                Err(e) => match self.options.on_extract_error {
                    ExtractErrorPolicy::Abort => {
                        return Err(ExportError::failed(
                            format!("extracting `{}` for row {row}", desc.field),
                            e,
                        ));
                    }
                    ExtractErrorPolicy::SkipCell => {
                        if !warned[idx] {
                            log::warn!(
                                "field `{}` failed at row {row}: {e}; leaving cells blank",
                                desc.field
                            );
                            warned[idx] = true;
                        }
                        summary.skipped_cells += 1;
                        let style = self.column_styles.blank(idx, desc.field_type);
                        CellValueWriter::write_blank(buf, &cell_ref, style);
                    }
                },
            }
        }

        buf.extend_from_slice(b"</row>");
        Ok(())
    }

    fn write_epilogue(&self, buf: &mut Vec<u8>, record_count: usize) {
        buf.extend_from_slice(b"</sheetData>");

        if self.parts.descriptors.iter().any(|d| d.read_only) {
            buf.extend_from_slice(
                b"<sheetProtection sheet=\"1\" objects=\"1\" scenarios=\"1\" formatColumns=\"0\" \
formatRows=\"0\" sort=\"0\" autoFilter=\"0\"/>",
            );
        }

        if self.options.auto_filter && !self.parts.descriptors.is_empty() {
            buf.extend_from_slice(b"<autoFilter ref=\"A1:");
            write_cell_ref(self.last_col(), record_count + 1, buf);
            buf.extend_from_slice(b"\"/>");
        }

        write_conditional_formatting(buf, self.parts.formatting, self.parts.styles);
        write_data_validations(buf, self.parts.validations);

        buf.extend_from_slice(PAGE_MARGINS);
        buf.extend_from_slice(b"</worksheet>");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{descriptors, ColumnSpec, Record};
    use crate::types::{FieldError, FieldType};
    use chrono::{NaiveDate, NaiveTime, TimeDelta};
    use pretty_assertions::assert_eq;

    struct Entry {
        label: String,
        qty: i64,
        price: f64,
        due: Option<NaiveDate>,
        at: NaiveTime,
        took: TimeDelta,
        ok: bool,
    }

    impl Record for Entry {
        fn columns() -> Vec<ColumnSpec<Self>> {
            vec![
                ColumnSpec::new("label", FieldType::Text, |e: &Entry| {
                    Some(CellValue::from(e.label.as_str()))
                })
                .order(1)
                .header("Label"),
                ColumnSpec::new("qty", FieldType::Integer, |e: &Entry| Some(CellValue::from(e.qty)))
                    .order(2),
                ColumnSpec::new("price", FieldType::Float, |e: &Entry| {
                    Some(CellValue::from(e.price))
                })
                .order(3),
                ColumnSpec::new("due", FieldType::Date, |e: &Entry| e.due.map(CellValue::from))
                    .order(4),
                ColumnSpec::new("at", FieldType::Time, |e: &Entry| Some(CellValue::from(e.at)))
                    .order(5),
                ColumnSpec::new("took", FieldType::Duration, |e: &Entry| {
                    Some(CellValue::from(e.took))
                })
                .order(6),
                ColumnSpec::new("ok", FieldType::Bool, |e: &Entry| Some(CellValue::from(e.ok)))
                    .order(7),
            ]
        }
    }

    struct Flaky(u32);

    impl Record for Flaky {
        fn columns() -> Vec<ColumnSpec<Self>> {
            vec![
                ColumnSpec::new("id", FieldType::Integer, |f: &Flaky| Some(CellValue::from(f.0))),
                ColumnSpec::try_new("odd", FieldType::Text, |f: &Flaky| {
                    if f.0 % 2 == 1 {
                        Err(FieldError::new("odd rows are broken"))
                    } else {
                        Ok(Some(CellValue::from("even")))
                    }
                })
                .order(1),
            ]
        }
    }

    fn entry(i: i64) -> Entry {
        Entry {
            label: format!("=cmd{i}"),
            qty: i,
            price: 2.5,
            due: NaiveDate::from_ymd_opt(2024, 1, 1),
            at: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            took: TimeDelta::hours(36),
            ok: i % 2 == 0,
        }
    }

    fn render<T: Record>(records: &[T], options: &ExportOptions) -> Result<(String, SheetSummary)> {
        let descs = descriptors::<T>();
        let styles = StyleTable::build(&descs, &[], &CancellationToken::new())?;
        let parts = SheetParts {
            descriptors: &descs,
            styles: &styles,
            validations: &[],
            formatting: &[],
        };
        let pool = BufferPool::default();
        let writer = RowStreamWriter::new(parts, options, &pool);
        let mut out = Vec::new();
        let summary = writer.write(&mut out, records, &CancellationToken::new())?;
        Ok((String::from_utf8(out).unwrap(), summary))
    }

    #[test]
    fn test_cell_value_encodings() {
        let (xml, summary) = render(&[entry(4)], &ExportOptions::default()).unwrap();
        assert_eq!(summary.rows_written, 2);

        assert!(xml.contains("<c r=\"A1\" s=\"1\" t=\"inlineStr\"><is><t>Label</t></is></c>"));
        assert!(xml.contains("<c r=\"A2\" t=\"inlineStr\"><is><t>&apos;=cmd4</t></is></c>"));
        assert!(xml.contains("<c r=\"B2\"><v>4</v></c>"));
        assert!(xml.contains("<c r=\"C2\"><v>2.5</v></c>"));
        assert!(xml.contains("<c r=\"D2\" s=\"2\"><v>45292</v></c>"));
        assert!(xml.contains("<c r=\"E2\" s=\"3\"><v>0.5</v></c>"));
        assert!(xml.contains("<c r=\"F2\" s=\"3\"><v>1.5</v></c>"));
        assert!(xml.contains("<c r=\"G2\" t=\"b\"><v>1</v></c>"));
        assert!(roxmltree::Document::parse(&xml).is_ok());
    }

    #[test]
    fn test_absent_date_keeps_its_style() {
        let mut e = entry(1);
        e.due = None;
        let (xml, _) = render(&[e], &ExportOptions::default()).unwrap();
        assert!(xml.contains("<c r=\"D2\" s=\"2\"/>"));
    }

    #[test]
    fn test_non_finite_floats_become_blank() {
        let mut buf = Vec::new();
        let styles = CellStyleSet {
            plain: 0,
            date: 2,
            time: 3,
        };
        CellValueWriter::new().write(&mut buf, b"A1", &CellValue::Float(f64::NAN), styles);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_row_count_spans_batches() {
        let records: Vec<Entry> = (0..25).map(entry).collect();
        let options = ExportOptions {
            batch_size: 10,
            ..ExportOptions::default()
        };
        let (xml, summary) = render(&records, &options).unwrap();
        assert_eq!(summary.rows_written, 26);

        let doc = roxmltree::Document::parse(&xml).unwrap();
        let rows: Vec<&str> = doc
            .descendants()
            .filter(|n| n.has_tag_name("row"))
            .filter_map(|n| n.attribute("r"))
            .collect();
        assert_eq!(rows.len(), 26);
        assert_eq!(rows.last(), Some(&"26"));
        assert!(xml.contains("<dimension ref=\"A1:G26\"/>"));
        assert!(xml.contains("state=\"frozen\""));
    }

    #[test]
    fn test_auto_filter_covers_header_and_rows() {
        let records: Vec<Entry> = (0..3).map(entry).collect();
        let (plain, _) = render(&records, &ExportOptions::default()).unwrap();
        assert!(!plain.contains("<autoFilter"));

        let options = ExportOptions {
            auto_filter: true,
            ..ExportOptions::default()
        };
        let (xml, _) = render(&records, &options).unwrap();
        assert!(xml.contains("</sheetData><autoFilter ref=\"A1:G4\"/>"));
    }

    #[test]
    fn test_extraction_faults_follow_policy() {
        let records: Vec<Flaky> = (0..4).map(Flaky).collect();
        let (xml, summary) = render(&records, &ExportOptions::default()).unwrap();
        assert_eq!(summary.skipped_cells, 2);
        assert_eq!(xml.matches("even").count(), 2);

        let strict = ExportOptions {
            on_extract_error: ExtractErrorPolicy::Abort,
            ..ExportOptions::default()
        };
        let err = render(&records, &strict).unwrap_err();
        assert!(matches!(
            err,
            ExportError::GenerationFailed { ref context, .. } if context.contains("`odd`")
        ));
    }

    #[test]
    fn test_cancellation_stops_before_rows() {
        let descs = descriptors::<Entry>();
        let styles = StyleTable::build(&descs, &[], &CancellationToken::new()).unwrap();
        let parts = SheetParts {
            descriptors: &descs,
            styles: &styles,
            validations: &[],
            formatting: &[],
        };
        let options = ExportOptions::default();
        let pool = BufferPool::default();
        let token = CancellationToken::new();
        token.cancel();
        let mut out = Vec::new();
        let err = RowStreamWriter::new(parts, &options, &pool)
            .write(&mut out, &[entry(1)], &token)
            .unwrap_err();
        assert!(err.is_canceled());
        assert!(out.is_empty());
    }
}
