use crate::columns::write_col_letters;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use std::borrow::Cow;

pub const XML_DECL: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n";

const SECONDS_PER_DAY: f64 = 86_400.0;

pub fn generate_app_xml(sheet_names: &[&str]) -> String {
    let mut titles = Vec::new();
    for name in sheet_names {
        titles.extend_from_slice(b"<vt:lpstr>");
        xml_escape_simd(name.as_bytes(), &mut titles);
        titles.extend_from_slice(b"</vt:lpstr>");
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Properties xmlns=\"http://schemas.openxmlformats.org/officeDocument/2006/extended-properties\" \
xmlns:vt=\"http://schemas.openxmlformats.org/officeDocument/2006/docPropsVTypes\">\
<Application>recordsheet</Application>\
<DocSecurity>0</DocSecurity>\
<ScaleCrop>false</ScaleCrop>\
<HeadingPairs><vt:vector size=\"2\" baseType=\"variant\">\
<vt:variant><vt:lpstr>Worksheets</vt:lpstr></vt:variant>\
<vt:variant><vt:i4>{}</vt:i4></vt:variant>\
</vt:vector></HeadingPairs>\
<TitlesOfParts><vt:vector size=\"{}\" baseType=\"lpstr\">{}</vt:vector></TitlesOfParts>\
<LinksUpToDate>false</LinksUpToDate>\
<SharedDoc>false</SharedDoc>\
</Properties>",
        sheet_names.len(),
        sheet_names.len(),
        String::from_utf8_lossy(&titles)
    )
}

pub fn generate_core_xml(created: &NaiveDateTime) -> String {
    let stamp = created.format("%Y-%m-%dT%H:%M:%SZ");
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<cp:coreProperties xmlns:cp=\"http://schemas.openxmlformats.org/package/2006/metadata/core-properties\" \
xmlns:dc=\"http://purl.org/dc/elements/1.1/\" \
xmlns:dcterms=\"http://purl.org/dc/terms/\" \
xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\
<dc:creator>recordsheet</dc:creator>\
<cp:lastModifiedBy>recordsheet</cp:lastModifiedBy>\
<dcterms:created xsi:type=\"dcterms:W3CDTF\">{stamp}</dcterms:created>\
<dcterms:modified xsi:type=\"dcterms:W3CDTF\">{stamp}</dcterms:modified>\
</cp:coreProperties>"
    )
}

/// Write a cell reference such as `B12` (1-based column and row) to the buffer.
#[inline(always)]
pub fn write_cell_ref(col: u32, row: usize, buf: &mut Vec<u8>) {
    let mut col_buf = [0u8; 8];
    let col_len = write_col_letters(col, &mut col_buf);
    buf.extend_from_slice(&col_buf[..col_len]);
    buf.extend_from_slice(itoa::Buffer::new().format(row).as_bytes());
}

/// `A2:A<last>`-style column range for one data column.
pub fn column_range(col: u32, first_row: usize, last_row: usize) -> String {
    let mut buf = Vec::with_capacity(16);
    write_cell_ref(col, first_row, &mut buf);
    buf.push(b':');
    write_cell_ref(col, last_row, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn excel_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or_default()
}

/// Serial 60 is the phantom 1900-02-29; earlier dates sit one day lower.
fn leap_bug_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 3, 1).unwrap_or_default()
}

#[inline]
pub fn date_to_excel_serial(d: &NaiveDate) -> f64 {
    let days = (*d - excel_epoch()).num_days();
    if *d < leap_bug_cutoff() {
        (days - 1) as f64
    } else {
        days as f64
    }
}

#[inline]
pub fn datetime_to_excel_serial(dt: &NaiveDateTime) -> f64 {
    date_to_excel_serial(&dt.date()) + time_to_day_fraction(&dt.time())
}

#[inline]
pub fn time_to_day_fraction(t: &NaiveTime) -> f64 {
    let secs = t.num_seconds_from_midnight() as f64 + t.nanosecond() as f64 / 1e9;
    secs / SECONDS_PER_DAY
}

#[inline]
pub fn duration_to_days(d: &TimeDelta) -> f64 {
    d.num_milliseconds() as f64 / (SECONDS_PER_DAY * 1000.0)
}

/// SIMD-accelerated XML escaping
#[inline(always)]
pub fn xml_escape_simd(input: &[u8], output: &mut Vec<u8>) {
    let needs_escape = memchr::memchr3(b'&', b'<', b'>', input).is_some()
        || memchr::memchr2(b'"', b'\'', input).is_some();

    if !needs_escape {
        output.extend_from_slice(input);
        return;
    }

    let mut last = 0;
    for (pos, &byte) in input.iter().enumerate() {
        let escape: &[u8] = match byte {
            b'&' => b"&amp;",
            b'<' => b"&lt;",
            b'>' => b"&gt;",
            b'"' => b"&quot;",
            b'\'' => b"&apos;",
            _ => continue,
        };
        output.extend_from_slice(&input[last..pos]);
        output.extend_from_slice(escape);
        last = pos + 1;
    }

    if last < input.len() {
        output.extend_from_slice(&input[last..]);
    }
}

pub fn xml_escape(input: &str) -> String {
    let mut out = Vec::with_capacity(input.len() + 8);
    xml_escape_simd(input.as_bytes(), &mut out);
    String::from_utf8_lossy(&out).into_owned()
}

/// Prefix an apostrophe to text a spreadsheet would otherwise read as a formula.
pub fn guard_formula(input: Option<&str>) -> Cow<'_, str> {
    match input {
        None | Some("") => Cow::Borrowed(""),
        Some(s) if s.starts_with(['=', '+', '-', '@']) => Cow::Owned(format!("'{s}")),
        Some(s) => Cow::Borrowed(s),
    }
}

#[inline]
fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

/// Drop characters that XML 1.0 cannot carry.
pub fn strip_invalid_xml_chars(input: &str) -> Cow<'_, str> {
    if input.chars().all(is_xml_char) {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(input.chars().filter(|&c| is_xml_char(c)).collect())
    }
}

/// Full pipeline for user text cells: formula guard first, then character stripping.
pub fn sanitize_text(input: Option<&str>) -> Cow<'_, str> {
    match guard_formula(input) {
        Cow::Borrowed(s) => strip_invalid_xml_chars(s),
        Cow::Owned(s) => Cow::Owned(strip_invalid_xml_chars(&s).into_owned()),
    }
}

/// Write `<is><t>..</t></is>` for inline text, preserving edge whitespace.
#[inline]
pub fn write_inline_text(text: &str, buf: &mut Vec<u8>) {
    let preserve = text.starts_with(char::is_whitespace) || text.ends_with(char::is_whitespace);
    if preserve {
        buf.extend_from_slice(b"<is><t xml:space=\"preserve\">");
    } else {
        buf.extend_from_slice(b"<is><t>");
    }
    xml_escape_simd(text.as_bytes(), buf);
    buf.extend_from_slice(b"</t></is>");
}

pub fn generate_content_types(sheet_count: usize) -> String {
    let mut xml = String::with_capacity(800 + sheet_count * 150);
    xml.push_str(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">\
<Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/>\
<Default Extension=\"xml\" ContentType=\"application/xml\"/>\
<Override PartName=\"/xl/workbook.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml\"/>\
<Override PartName=\"/xl/styles.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml\"/>\
<Override PartName=\"/docProps/core.xml\" ContentType=\"application/vnd.openxmlformats-package.core-properties+xml\"/>\
<Override PartName=\"/docProps/app.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.extended-properties+xml\"/>",
    );

    for i in 1..=sheet_count {
        xml.push_str("<Override PartName=\"/xl/worksheets/sheet");
        xml.push_str(&i.to_string());
        xml.push_str(
            ".xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml\"/>",
        );
    }

    xml.push_str("</Types>");
    xml
}

pub fn generate_rels() -> &'static str {
    "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
<Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" Target=\"xl/workbook.xml\"/>\
<Relationship Id=\"rId2\" Type=\"http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties\" Target=\"docProps/core.xml\"/>\
<Relationship Id=\"rId3\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/extended-properties\" Target=\"docProps/app.xml\"/>\
</Relationships>"
}

/// Top-level manifest: sheets in write order with sequential ids.
pub fn generate_workbook(sheet_names: &[&str]) -> String {
    let mut xml = Vec::with_capacity(500 + sheet_names.len() * 80);
    xml.extend_from_slice(
        b"<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" \
xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">\
<workbookPr/>\
<bookViews><workbookView xWindow=\"0\" yWindow=\"0\" windowWidth=\"28800\" windowHeight=\"12600\"/></bookViews>\
<sheets>",
    );

    for (i, name) in sheet_names.iter().enumerate() {
        let id = itoa::Buffer::new().format(i + 1).to_string();
        xml.extend_from_slice(b"<sheet name=\"");
        xml_escape_simd(name.as_bytes(), &mut xml);
        xml.extend_from_slice(b"\" sheetId=\"");
        xml.extend_from_slice(id.as_bytes());
        xml.extend_from_slice(b"\" r:id=\"rId");
        xml.extend_from_slice(id.as_bytes());
        xml.extend_from_slice(b"\"/>");
    }

    xml.extend_from_slice(b"</sheets><calcPr calcId=\"191029\"/></workbook>");
    String::from_utf8_lossy(&xml).into_owned()
}

pub fn generate_workbook_rels(num_sheets: usize) -> String {
    let mut xml = String::with_capacity(300 + num_sheets * 150);
    xml.push_str(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
<Relationship Id=\"rId100\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles\" Target=\"styles.xml\"/>",
    );

    for i in 1..=num_sheets {
        xml.push_str("<Relationship Id=\"rId");
        xml.push_str(&i.to_string());
        xml.push_str(
            "\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" \
Target=\"worksheets/sheet",
        );
        xml.push_str(&i.to_string());
        xml.push_str(".xml\"/>");
    }

    xml.push_str("</Relationships>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_formula_guard() {
        assert_eq!(guard_formula(Some("=SUM(A1)")), "'=SUM(A1)");
        assert_eq!(guard_formula(Some("+1")), "'+1");
        assert_eq!(guard_formula(Some("-1")), "'-1");
        assert_eq!(guard_formula(Some("@cmd")), "'@cmd");
        assert_eq!(guard_formula(Some("plain")), "plain");
        assert_eq!(guard_formula(Some("")), "");
        assert_eq!(guard_formula(None), "");
    }

    #[test]
    fn test_sanitize_strips_after_guard() {
        assert_eq!(sanitize_text(Some("=A1\u{1}")), "'=A1");
        assert_eq!(sanitize_text(Some("tab\tok\u{FFFF}")), "tab\tok");
        assert_eq!(sanitize_text(Some("\u{B}")), "");
    }

    #[test]
    fn test_escape() {
        let mut out = Vec::new();
        xml_escape_simd(b"a<b & \"c\"", &mut out);
        assert_eq!(out, b"a&lt;b &amp; &quot;c&quot;".to_vec());
        assert_eq!(xml_escape("it's"), "it&apos;s");
    }

    #[test]
    fn test_serials() {
        let d = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap();
        assert_eq!(date_to_excel_serial(&d), 1.0);
        let d = NaiveDate::from_ymd_opt(1900, 2, 28).unwrap();
        assert_eq!(date_to_excel_serial(&d), 59.0);
        let d = NaiveDate::from_ymd_opt(1900, 3, 1).unwrap();
        assert_eq!(date_to_excel_serial(&d), 61.0);
        let dt = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap().and_hms_opt(6, 0, 0).unwrap();
        assert_eq!(datetime_to_excel_serial(&dt), 1.25);
        let dt = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(datetime_to_excel_serial(&dt), 45292.5);
        assert_eq!(duration_to_days(&TimeDelta::hours(36)), 1.5);
        let t = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert_eq!(time_to_day_fraction(&t), 0.25);
    }

    #[test]
    fn test_cell_refs() {
        let mut buf = Vec::new();
        write_cell_ref(28, 10, &mut buf);
        assert_eq!(buf, b"AB10".to_vec());
        assert_eq!(column_range(2, 2, 6), "B2:B6");
    }

    #[test]
    fn test_workbook_escapes_names() {
        let xml = generate_workbook(&["A&B", "Static Data"]);
        assert!(xml.contains("name=\"A&amp;B\" sheetId=\"1\" r:id=\"rId1\""));
        assert!(xml.contains("name=\"Static Data\" sheetId=\"2\" r:id=\"rId2\""));
    }

    proptest! {
        #[test]
        fn prop_guard_prefixes_only_formula_starts(s in "\\PC{1,20}") {
            let out = guard_formula(Some(&s));
            if s.starts_with(['=', '+', '-', '@']) {
                let expected = format!("'{s}");
                prop_assert_eq!(&*out, expected.as_str());
            } else {
                prop_assert_eq!(&*out, s.as_str());
            }
        }
    }
}
