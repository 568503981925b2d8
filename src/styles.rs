//! Shared style table for one package.
//!
//! Base formats sit at fixed indices; every distinct column color then appends
//! its own fills and formats, so the table only grows with colors actually used.

use crate::columns::{is_valid_hex_color, ColumnDescriptor};
use crate::types::{CancellationToken, FieldType, Result};
use crate::xml::xml_escape;
use std::collections::{HashMap, HashSet};

pub const STYLE_DEFAULT: u32 = 0;
pub const STYLE_HEADER: u32 = 1;
pub const STYLE_DATE: u32 = 2;
pub const STYLE_TIME: u32 = 3;

pub const DATE_FORMAT_CODE: &str = "dd/mm/yyyy";
pub const DURATION_FORMAT_CODE: &str = "[h]:mm:ss";

const NUM_FMT_GENERAL: u32 = 0;
const NUM_FMT_DATE: u32 = 164;
const NUM_FMT_DURATION: u32 = 165;

const FONT_DEFAULT: u32 = 0;
const FONT_BOLD: u32 = 1;

const FILL_NONE: u32 = 0;

const BORDER_NONE: u32 = 0;
const BORDER_GRID: u32 = 1;
const BORDER_HEADER: u32 = 2;

const GRID_COLOR: &str = "FFD9D9D9";
const HEADER_RULE_COLOR: &str = "FF808080";

#[derive(Debug, Clone, PartialEq)]
enum Fill {
    None,
    Gray125,
    Solid(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CellXf {
    num_fmt_id: u32,
    font_id: u32,
    fill_id: u32,
    border_id: u32,
    locked: bool,
}

/// Differential format applied by a conditional formatting entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DxfStyle {
    pub fill: Option<String>,
    pub font_color: Option<String>,
    pub bold: bool,
}

impl DxfStyle {
    pub fn is_empty(&self) -> bool {
        self.fill.is_none() && self.font_color.is_none() && !self.bold
    }
}

/// Style key for a color-specific format, or the base key when no color applies.
pub fn style_key(prefix: &str, color: Option<&str>) -> String {
    match color {
        Some(c) => format!("{prefix}_{c}"),
        None => prefix.to_string(),
    }
}

/// Immutable name -> index table plus everything needed to render `styles.xml`.
#[derive(Debug, Clone)]
pub struct StyleTable {
    keys: HashMap<String, u32>,
    fills: Vec<Fill>,
    cell_xfs: Vec<CellXf>,
    dxfs: Vec<DxfStyle>,
}

impl StyleTable {
    /// Build the table for one write from the columns' colors and the
    /// conditional formats that will reference it.
    pub fn build<T>(
        descriptors: &[ColumnDescriptor<T>],
        dxfs: &[DxfStyle],
        cancel: &CancellationToken,
    ) -> Result<Self> {
        cancel.check()?;

        let mut table = Self::base();

        // Pass 1: distinct colors in first-encounter order.
        let mut seen = HashSet::new();
        let mut colors: Vec<&str> = Vec::new();
        for d in descriptors {
            let Some(color) = d.color.as_deref() else { continue };
            if !seen.insert(color) {
                continue;
            }
            if is_valid_hex_color(color) {
                colors.push(color);
            } else {
                log::warn!(
                    "column `{}` has malformed color `{}`; using default styles",
                    d.field,
                    color
                );
            }
        }

        // Pass 2: per-color fills and formats.
        for color in &colors {
            table.push_color(color);
        }

        // Locked variants only exist for read-only columns.
        for d in descriptors.iter().filter(|d| d.read_only) {
            let color = d.color.as_deref().filter(|c| colors.contains(c));
            table.push_locked(color);
        }

        for dxf in dxfs {
            if !dxf.is_empty() && !table.dxfs.contains(dxf) {
                table.dxfs.push(dxf.clone());
            }
        }

        log::debug!(
            "style table: {} colors, {} cell formats, {} differential formats",
            colors.len(),
            table.cell_xfs.len(),
            table.dxfs.len()
        );
        Ok(table)
    }

    fn base() -> Self {
        let cell_xfs = vec![
            CellXf {
                num_fmt_id: NUM_FMT_GENERAL,
                font_id: FONT_DEFAULT,
                fill_id: FILL_NONE,
                border_id: BORDER_NONE,
                locked: false,
            },
            CellXf {
                num_fmt_id: NUM_FMT_GENERAL,
                font_id: FONT_BOLD,
                fill_id: FILL_NONE,
                border_id: BORDER_HEADER,
                locked: true,
            },
            CellXf {
                num_fmt_id: NUM_FMT_DATE,
                font_id: FONT_DEFAULT,
                fill_id: FILL_NONE,
                border_id: BORDER_NONE,
                locked: false,
            },
            CellXf {
                num_fmt_id: NUM_FMT_DURATION,
                font_id: FONT_DEFAULT,
                fill_id: FILL_NONE,
                border_id: BORDER_NONE,
                locked: false,
            },
        ];
        let keys = HashMap::from([
            ("cell".to_string(), STYLE_DEFAULT),
            ("header".to_string(), STYLE_HEADER),
            ("cell_date".to_string(), STYLE_DATE),
            ("cell_time".to_string(), STYLE_TIME),
        ]);
        Self {
            keys,
            fills: vec![Fill::None, Fill::Gray125],
            cell_xfs,
            dxfs: Vec::new(),
        }
    }

    fn push_fill(&mut self, color: &str) -> u32 {
        self.fills.push(Fill::Solid(color.to_string()));
        (self.fills.len() - 1) as u32
    }

    fn push_xf(&mut self, key: String, xf: CellXf) -> u32 {
        self.cell_xfs.push(xf);
        let idx = (self.cell_xfs.len() - 1) as u32;
        self.keys.insert(key, idx);
        idx
    }

    fn push_color(&mut self, color: &str) {
        let header_fill = self.push_fill(color);
        let cell_fill = self.push_fill(color);
        self.keys.insert(style_key("fill_header", Some(color)), header_fill);
        self.keys.insert(style_key("fill_cell", Some(color)), cell_fill);

        self.push_xf(
            style_key("header", Some(color)),
            CellXf {
                num_fmt_id: NUM_FMT_GENERAL,
                font_id: FONT_BOLD,
                fill_id: header_fill,
                border_id: BORDER_HEADER,
                locked: true,
            },
        );
        self.push_xf(
            style_key("cell", Some(color)),
            CellXf {
                num_fmt_id: NUM_FMT_GENERAL,
                font_id: FONT_DEFAULT,
                fill_id: cell_fill,
                border_id: BORDER_GRID,
                locked: false,
            },
        );
        self.push_xf(
            style_key("cell_date", Some(color)),
            CellXf {
                num_fmt_id: NUM_FMT_DATE,
                font_id: FONT_DEFAULT,
                fill_id: cell_fill,
                border_id: BORDER_GRID,
                locked: false,
            },
        );
        self.push_xf(
            style_key("cell_time", Some(color)),
            CellXf {
                num_fmt_id: NUM_FMT_DURATION,
                font_id: FONT_DEFAULT,
                fill_id: cell_fill,
                border_id: BORDER_GRID,
                locked: false,
            },
        );
    }

    fn push_locked(&mut self, color: Option<&str>) {
        for prefix in ["cell", "cell_date", "cell_time"] {
            let locked_key = style_key(&format!("locked_{prefix}"), color);
            if self.keys.contains_key(&locked_key) {
                continue;
            }
            let source = self.index_or(&style_key(prefix, color), STYLE_DEFAULT);
            let mut xf = self.cell_xfs[source as usize];
            xf.locked = true;
            self.push_xf(locked_key, xf);
        }
    }

    pub fn get(&self, key: &str) -> Option<u32> {
        self.keys.get(key).copied()
    }

    pub fn index_or(&self, key: &str, fallback: u32) -> u32 {
        self.get(key).unwrap_or(fallback)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn cell_format_count(&self) -> usize {
        self.cell_xfs.len()
    }

    pub fn fill_count(&self) -> usize {
        self.fills.len()
    }

    pub fn dxf_id(&self, dxf: &DxfStyle) -> Option<u32> {
        self.dxfs.iter().position(|d| d == dxf).map(|i| i as u32)
    }

    /// Header style for a column, colored when the color is known.
    pub fn header_style(&self, color: Option<&str>) -> u32 {
        color
            .and_then(|c| self.get(&style_key("header", Some(c))))
            .unwrap_or(STYLE_HEADER)
    }

    fn cell_style(&self, prefix: &str, color: Option<&str>, read_only: bool) -> u32 {
        let prefix = if read_only {
            format!("locked_{prefix}")
        } else {
            prefix.to_string()
        };
        color
            .and_then(|c| self.get(&style_key(&prefix, Some(c))))
            .or_else(|| self.get(&prefix))
            .unwrap_or(match prefix.trim_start_matches("locked_") {
                "cell_date" => STYLE_DATE,
                "cell_time" => STYLE_TIME,
                _ => STYLE_DEFAULT,
            })
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::with_capacity(2000 + self.cell_xfs.len() * 160);

        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
        xml.push_str(
            "<styleSheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">",
        );

        xml.push_str("<numFmts count=\"2\">");
        xml.push_str(&format!(
            "<numFmt numFmtId=\"{}\" formatCode=\"{}\"/>",
            NUM_FMT_DATE,
            xml_escape(DATE_FORMAT_CODE)
        ));
        xml.push_str(&format!(
            "<numFmt numFmtId=\"{}\" formatCode=\"{}\"/>",
            NUM_FMT_DURATION,
            xml_escape(DURATION_FORMAT_CODE)
        ));
        xml.push_str("</numFmts>");

        xml.push_str("<fonts count=\"2\">");
        xml.push_str("<font><sz val=\"11\"/><name val=\"Calibri\"/><family val=\"2\"/></font>");
        xml.push_str("<font><b/><sz val=\"11\"/><name val=\"Calibri\"/><family val=\"2\"/></font>");
        xml.push_str("</fonts>");

        xml.push_str(&format!("<fills count=\"{}\">", self.fills.len()));
        for fill in &self.fills {
            match fill {
                Fill::None => xml.push_str("<fill><patternFill patternType=\"none\"/></fill>"),
                Fill::Gray125 => {
                    xml.push_str("<fill><patternFill patternType=\"gray125\"/></fill>")
                }
                Fill::Solid(color) => xml.push_str(&format!(
                    "<fill><patternFill patternType=\"solid\"><fgColor rgb=\"FF{color}\"/><bgColor indexed=\"64\"/></patternFill></fill>"
                )),
            }
        }
        xml.push_str("</fills>");

        xml.push_str("<borders count=\"3\">");
        xml.push_str("<border><left/><right/><top/><bottom/><diagonal/></border>");
        xml.push_str("<border>");
        for side in ["left", "right", "top", "bottom"] {
            write_border_side(&mut xml, side, "thin", GRID_COLOR);
        }
        xml.push_str("<diagonal/></border>");
        xml.push_str("<border>");
        for side in ["left", "right", "top"] {
            write_border_side(&mut xml, side, "thin", GRID_COLOR);
        }
        write_border_side(&mut xml, "bottom", "medium", HEADER_RULE_COLOR);
        xml.push_str("<diagonal/></border>");
        xml.push_str("</borders>");

        xml.push_str("<cellStyleXfs count=\"1\">");
        xml.push_str("<xf numFmtId=\"0\" fontId=\"0\" fillId=\"0\" borderId=\"0\"/>");
        xml.push_str("</cellStyleXfs>");

        xml.push_str(&format!("<cellXfs count=\"{}\">", self.cell_xfs.len()));
        for xf in &self.cell_xfs {
            xml.push_str(&format!(
                "<xf numFmtId=\"{}\" fontId=\"{}\" fillId=\"{}\" borderId=\"{}\" xfId=\"0\"",
                xf.num_fmt_id, xf.font_id, xf.fill_id, xf.border_id
            ));
            if xf.num_fmt_id > 0 {
                xml.push_str(" applyNumberFormat=\"1\"");
            }
            if xf.font_id > 0 {
                xml.push_str(" applyFont=\"1\"");
            }
            if xf.fill_id > 0 {
                xml.push_str(" applyFill=\"1\"");
            }
            if xf.border_id > 0 {
                xml.push_str(" applyBorder=\"1\"");
            }
            if xf.locked {
                xml.push_str("/>");
            } else {
                xml.push_str(" applyProtection=\"1\"><protection locked=\"0\"/></xf>");
            }
        }
        xml.push_str("</cellXfs>");

        xml.push_str("<cellStyles count=\"1\">");
        xml.push_str("<cellStyle name=\"Normal\" xfId=\"0\" builtinId=\"0\"/>");
        xml.push_str("</cellStyles>");

        xml.push_str(&format!("<dxfs count=\"{}\">", self.dxfs.len()));
        for dxf in &self.dxfs {
            xml.push_str("<dxf>");
            // schema order: font, numFmt, fill
            if dxf.bold || dxf.font_color.is_some() {
                xml.push_str("<font>");
                if dxf.bold {
                    xml.push_str("<b/>");
                }
                if let Some(color) = &dxf.font_color {
                    xml.push_str(&format!("<color rgb=\"FF{color}\"/>"));
                }
                xml.push_str("</font>");
            }
            if let Some(color) = &dxf.fill {
                xml.push_str(&format!(
                    "<fill><patternFill patternType=\"solid\"><fgColor rgb=\"FF{color}\"/><bgColor rgb=\"FF{color}\"/></patternFill></fill>"
                ));
            }
            xml.push_str("</dxf>");
        }
        xml.push_str("</dxfs>");

        xml.push_str(
            "<tableStyles count=\"0\" defaultTableStyle=\"TableStyleMedium2\" \
defaultPivotStyle=\"PivotStyleLight16\"/>",
        );
        xml.push_str("</styleSheet>");
        xml
    }
}

fn write_border_side(xml: &mut String, side: &str, style: &str, color: &str) {
    xml.push_str(&format!("<{side} style=\"{style}\"><color rgb=\"{color}\"/></{side}>"));
}

/// Per-column style indices resolved once per write, so the row loop never
/// touches the key map.
#[derive(Debug, Clone, Default)]
pub struct ColumnStyles {
    pub header: Vec<u32>,
    pub plain: Vec<u32>,
    pub date: Vec<u32>,
    pub time: Vec<u32>,
}

impl ColumnStyles {
    pub fn resolve<T>(table: &StyleTable, descriptors: &[ColumnDescriptor<T>]) -> Self {
        let mut styles = Self {
            header: Vec::with_capacity(descriptors.len()),
            plain: Vec::with_capacity(descriptors.len()),
            date: Vec::with_capacity(descriptors.len()),
            time: Vec::with_capacity(descriptors.len()),
        };
        for d in descriptors {
            let color = d.color.as_deref();
            styles.header.push(table.header_style(color));
            styles.plain.push(table.cell_style("cell", color, d.read_only));
            styles.date.push(table.cell_style("cell_date", color, d.read_only));
            styles.time.push(table.cell_style("cell_time", color, d.read_only));
        }
        styles
    }

    /// Style for a blank cell, chosen by the column's declared type.
    pub fn blank(&self, col: usize, field_type: FieldType) -> u32 {
        if field_type.is_date_like() {
            self.date[col]
        } else if field_type.is_time_like() {
            self.time[col]
        } else {
            self.plain[col]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{descriptors, ColumnSpec, Record};
    use pretty_assertions::assert_eq;

    struct Tinted;

    impl Record for Tinted {
        fn columns() -> Vec<ColumnSpec<Self>> {
            vec![
                ColumnSpec::new("a", FieldType::Text, |_: &Tinted| None).order(1).color("#ff0000"),
                ColumnSpec::new("b", FieldType::Date, |_: &Tinted| None).order(2).color("FF0000"),
                ColumnSpec::new("c", FieldType::Text, |_: &Tinted| None).order(3).color("ff0000"),
                ColumnSpec::new("d", FieldType::Duration, |_: &Tinted| None)
                    .order(4)
                    .color("#00ff00")
                    .read_only(),
                ColumnSpec::new("e", FieldType::Text, |_: &Tinted| None).order(5).color("nothex"),
                ColumnSpec::new("f", FieldType::Integer, |_: &Tinted| None).order(6),
            ]
        }
    }

    struct Plain;

    impl Record for Plain {
        fn columns() -> Vec<ColumnSpec<Self>> {
            vec![ColumnSpec::new("x", FieldType::Text, |_: &Plain| None)]
        }
    }

    fn table_for<T: Record>() -> StyleTable {
        StyleTable::build(&descriptors::<T>(), &[], &CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_base_indices_without_colors() {
        let table = table_for::<Plain>();
        assert_eq!(table.cell_format_count(), 4);
        assert_eq!(table.fill_count(), 2);
        assert_eq!(table.get("header"), Some(STYLE_HEADER));
        assert_eq!(table.get("cell_date"), Some(STYLE_DATE));
        assert_eq!(table.get("cell_time"), Some(STYLE_TIME));
    }

    #[test]
    fn test_color_variants_deduplicate() {
        let table = table_for::<Tinted>();
        for prefix in ["fill_header", "fill_cell", "header", "cell", "cell_date", "cell_time"] {
            assert!(table.contains_key(&format!("{prefix}_FF0000")), "{prefix}");
            assert!(table.contains_key(&format!("{prefix}_00FF00")), "{prefix}");
        }
        let red_keys = table.keys().filter(|k| k.ends_with("_FF0000")).count();
        assert_eq!(red_keys, 6);
        // 4 base + 4 per color (two colors) + 3 locked for the read-only green column
        assert_eq!(table.cell_format_count(), 4 + 8 + 3);
        assert_eq!(table.fill_count(), 2 + 4);
        assert_eq!(table.get("header_FF0000"), Some(4));
        assert_eq!(table.get("cell_time_00FF00"), Some(11));
        assert!(table.contains_key("locked_cell_time_00FF00"));
        assert!(!table.keys().any(|k| k.contains("NOTHEX")));
    }

    #[test]
    fn test_column_styles_resolution() {
        let d = descriptors::<Tinted>();
        let table = table_for::<Tinted>();
        let styles = ColumnStyles::resolve(&table, &d);
        assert_eq!(styles.header[0], table.get("header_FF0000").unwrap());
        assert_eq!(styles.date[1], table.get("cell_date_FF0000").unwrap());
        assert_eq!(styles.time[3], table.get("locked_cell_time_00FF00").unwrap());
        assert_eq!(styles.plain[4], STYLE_DEFAULT);
        assert_eq!(styles.header[5], STYLE_HEADER);
        assert_eq!(styles.blank(1, FieldType::Date), styles.date[1]);
    }

    #[test]
    fn test_dxfs_deduplicate() {
        let red = DxfStyle {
            fill: Some("FF0000".into()),
            ..Default::default()
        };
        let bold = DxfStyle {
            bold: true,
            ..Default::default()
        };
        let table = StyleTable::build(
            &descriptors::<Plain>(),
            &[red.clone(), bold.clone(), red.clone(), DxfStyle::default()],
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(table.dxf_id(&red), Some(0));
        assert_eq!(table.dxf_id(&bold), Some(1));
        assert!(table.to_xml().contains("<dxfs count=\"2\">"));
    }

    #[test]
    fn test_xml_parses_and_counts_match() {
        let xml = table_for::<Tinted>().to_xml();
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let xfs = doc.descendants().find(|n| n.has_tag_name("cellXfs")).unwrap();
        assert_eq!(xfs.attribute("count"), Some("15"));
        assert_eq!(xfs.children().filter(|n| n.is_element()).count(), 15);
        assert!(xml.contains("formatCode=\"dd/mm/yyyy\""));
        assert!(xml.contains("formatCode=\"[h]:mm:ss\""));
    }

    #[test]
    fn test_build_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let err = StyleTable::build(&descriptors::<Plain>(), &[], &token).unwrap_err();
        assert!(err.is_canceled());
    }
}
