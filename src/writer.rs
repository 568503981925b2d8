use crate::columns::{require_descriptors, ColumnIndexMap, Record};
use crate::conditional::{self, ConditionalRule};
use crate::pool::BufferPool;
use crate::sheet::{RowStreamWriter, SheetParts, SheetSummary};
use crate::static_data::{OptionList, StaticDataLayout, STATIC_SHEET_NAME};
use crate::styles::StyleTable;
use crate::types::{CancellationToken, ExportError, ExtractErrorPolicy, Result};
use crate::validation::{self, validate_sheet_names, MAX_ROWS};
use crate::xml;
use std::fs;
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const DEFAULT_SHEET_NAME: &str = "Sheet1";
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_STATIC_POLL_ROWS: usize = 100;

const FILE_BUFFER_CAPACITY: usize = 256 * 1024;

/// Tuning knobs for one export.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Rows streamed between cancellation checks.
    pub batch_size: usize,
    /// Static-sheet rows between cancellation checks.
    pub static_sheet_poll_rows: usize,
    pub on_extract_error: ExtractErrorPolicy,
    /// Freeze the header row.
    pub freeze_header: bool,
    pub auto_filter: bool,
    /// Deflate level; `None` uses the zip crate default.
    pub compression_level: Option<i64>,
    /// Pool for row buffers; the process-wide pool when `None`.
    pub buffer_pool: Option<Arc<BufferPool>>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            static_sheet_poll_rows: DEFAULT_STATIC_POLL_ROWS,
            on_extract_error: ExtractErrorPolicy::default(),
            freeze_header: true,
            auto_filter: false,
            compression_level: None,
            buffer_pool: None,
        }
    }
}

/// Immutable description of one workbook: the data sheet's name, its dropdown
/// option lists, its conditional rules and the export options.
#[derive(Debug, Clone)]
pub struct SheetConfig {
    pub sheet_name: String,
    pub option_lists: Vec<OptionList>,
    pub rules: Vec<ConditionalRule>,
    pub options: ExportOptions,
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SHEET_NAME)
    }
}

impl SheetConfig {
    pub fn new(sheet_name: impl Into<String>) -> Self {
        Self {
            sheet_name: sheet_name.into(),
            option_lists: Vec::new(),
            rules: Vec::new(),
            options: ExportOptions::default(),
        }
    }

    pub fn option_list(mut self, list: OptionList) -> Self {
        self.option_lists.push(list);
        self
    }

    pub fn rule(mut self, rule: ConditionalRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn options(mut self, options: ExportOptions) -> Self {
        self.options = options;
        self
    }

    fn sheet_names(&self) -> Vec<&str> {
        let mut names = vec![self.sheet_name.as_str()];
        if !self.option_lists.is_empty() {
            names.push(STATIC_SHEET_NAME);
        }
        names
    }

    fn validate(&self) -> Result<()> {
        if self.options.batch_size == 0 {
            return Err(ExportError::InvalidInput("batch size must be at least 1".into()));
        }
        if let Some(level) = self.options.compression_level {
            if !(0..=9).contains(&level) {
                return Err(ExportError::InvalidInput(format!(
                    "compression level {level} is outside 0-9"
                )));
            }
        }
        validate_sheet_names(&self.sheet_names())
    }
}

fn start_part<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    options: SimpleFileOptions,
) -> Result<()> {
    zip.start_file(name, options)
        .map_err(|e| ExportError::failed(format!("starting part {name}"), e))
}

fn write_part<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    options: SimpleFileOptions,
    content: &[u8],
) -> Result<()> {
    start_part(zip, name, options)?;
    zip.write_all(content)
        .map_err(|e| ExportError::failed(format!("writing part {name}"), e))
}

/// Stream a complete package for `records` into `sink`, returning the bytes written.
///
/// Styles, validations and conditional blocks are all computed before the first
/// part is opened. Parts then go out in a fixed order: styles, data sheet, the
/// optional static sheet, then the workbook manifest and package metadata.
///
/// On `Err` the sink contents are unspecified. Parts already started are dropped
/// from the archive directory, so a reader sees no partial sheet, but stale bytes
/// may remain past the directory. Use [`export_to_path`] when the target must
/// never hold a partial package.
pub fn generate<W, T>(
    sink: &mut W,
    config: &SheetConfig,
    records: &[T],
    cancel: &CancellationToken,
) -> Result<u64>
where
    W: Write + Seek,
    T: Record,
{
    config.validate()?;
    let descriptors = require_descriptors::<T>()?;
    if records.len() + 1 > MAX_ROWS {
        log::warn!(
            "{} records exceed the {MAX_ROWS}-row sheet limit; readers may truncate",
            records.len()
        );
    }

    let started = Instant::now();
    let options = &config.options;
    let columns = ColumnIndexMap::from_descriptors(&descriptors);
    let last_row = (records.len() + 1).max(2);

    let blocks = conditional::compile(&config.rules, &columns, last_row);
    let layout = StaticDataLayout::plan(&config.option_lists);
    let validations = validation::compile(
        &descriptors,
        &columns,
        last_row,
        &config.option_lists,
        layout.as_ref(),
        &config.rules,
    );
    let styles = StyleTable::build(&descriptors, &conditional::dxf_styles(&blocks), cancel)?;
    log::debug!(
        "prepared {} cell formats, {} validations, {} formatting blocks",
        styles.cell_format_count(),
        validations.len(),
        blocks.len()
    );

    let pool = options.buffer_pool.clone().unwrap_or_else(BufferPool::shared);
    let part_options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(options.compression_level);

    let start = sink.stream_position()?;
    let mut zip = ZipWriter::new(&mut *sink);

    let written = (|| -> Result<SheetSummary> {
        write_part(&mut zip, "xl/styles.xml", part_options, styles.to_xml().as_bytes())?;

        start_part(&mut zip, "xl/worksheets/sheet1.xml", part_options)?;
        let summary = RowStreamWriter::new(
            SheetParts {
                descriptors: &descriptors,
                styles: &styles,
                validations: &validations,
                formatting: &blocks,
            },
            options,
            &pool,
        )
        .write(&mut zip, records, cancel)?;

        if let Some(layout) = &layout {
            start_part(&mut zip, "xl/worksheets/sheet2.xml", part_options)?;
            layout.write(&mut zip, &pool, options.static_sheet_poll_rows, cancel)?;
        }

        cancel.check()?;
        let sheet_names = config.sheet_names();
        write_part(
            &mut zip,
            "xl/workbook.xml",
            part_options,
            xml::generate_workbook(&sheet_names).as_bytes(),
        )?;
        write_part(
            &mut zip,
            "xl/_rels/workbook.xml.rels",
            part_options,
            xml::generate_workbook_rels(sheet_names.len()).as_bytes(),
        )?;
        write_part(
            &mut zip,
            "[Content_Types].xml",
            part_options,
            xml::generate_content_types(sheet_names.len()).as_bytes(),
        )?;
        write_part(&mut zip, "_rels/.rels", part_options, xml::generate_rels().as_bytes())?;
        write_part(
            &mut zip,
            "docProps/app.xml",
            part_options,
            xml::generate_app_xml(&sheet_names).as_bytes(),
        )?;
        write_part(
            &mut zip,
            "docProps/core.xml",
            part_options,
            xml::generate_core_xml(&chrono::Utc::now().naive_utc()).as_bytes(),
        )?;
        Ok(summary)
    })();
    let summary = match written {
        Ok(summary) => summary,
        Err(e) => {
            discard_parts(&mut zip);
            return Err(e);
        }
    };

    let sink = zip.finish()?;
    let bytes = sink.stream_position()? - start;

    log::info!(
        "exported {} rows ({} skipped cells) to {} bytes in {:?}",
        summary.rows_written,
        summary.skipped_cells,
        bytes,
        started.elapsed()
    );
    Ok(bytes)
}

/// Unlist every part written so far, rewinding the sink to the first header.
fn discard_parts<W: Write + Seek>(zip: &mut ZipWriter<W>) {
    while zip.abort_file().is_ok() {}
}

/// Generate a package at `path`. Missing parent directories are created and the
/// target only appears once the package is complete.
pub fn export_to_path<T: Record>(
    path: impl AsRef<Path>,
    config: &SheetConfig,
    records: &[T],
    cancel: &CancellationToken,
) -> Result<u64> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(ExportError::InvalidInput("output path cannot be empty".into()));
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                ExportError::failed(format!("creating directory {}", parent.display()), e)
            })?;
        }
    }

    write_file_atomic(path, |out| generate(out, config, records, cancel))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".tmp.{}", std::process::id()));
    PathBuf::from(name)
}

/// Write through a sibling temp file, renaming on success and removing it on any error.
fn write_file_atomic<F>(path: &Path, write_fn: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<fs::File>) -> Result<u64>,
{
    let temp_path = temp_path_for(path);

    let write_result = (|| -> Result<u64> {
        let file = fs::File::create(&temp_path).map_err(|e| {
            ExportError::failed(format!("creating {}", temp_path.display()), e)
        })?;
        let mut out = BufWriter::with_capacity(FILE_BUFFER_CAPACITY, file);
        let bytes = write_fn(&mut out)?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(bytes)
    })();

    match write_result {
        Ok(bytes) => {
            fs::rename(&temp_path, path).map_err(|e| {
                let _ = fs::remove_file(&temp_path);
                ExportError::failed(format!("renaming into {}", path.display()), e)
            })?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::ColumnSpec;
    use crate::types::{CellValue, FieldType};
    use std::io::{Cursor, Read};

    struct Row(i64);

    impl Record for Row {
        fn columns() -> Vec<ColumnSpec<Self>> {
            vec![ColumnSpec::new("n", FieldType::Integer, |r: &Row| Some(CellValue::from(r.0)))]
        }
    }

    struct Nothing;

    impl Record for Nothing {
        fn columns() -> Vec<ColumnSpec<Self>> {
            Vec::new()
        }
    }

    fn part_names(bytes: Vec<u8>) -> Vec<String> {
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    struct Tripwire {
        token: CancellationToken,
        n: i64,
    }

    impl Record for Tripwire {
        fn columns() -> Vec<ColumnSpec<Self>> {
            vec![ColumnSpec::new("n", FieldType::Integer, |t: &Tripwire| {
                if t.n == 3 {
                    t.token.cancel();
                }
                Some(CellValue::from(t.n))
            })]
        }
    }

    #[test]
    fn test_generate_writes_all_parts() {
        let mut sink = Cursor::new(Vec::new());
        let token = CancellationToken::new();
        let bytes =
            generate(&mut sink, &SheetConfig::default(), &[Row(1), Row(2)], &token).unwrap();
        let data = sink.into_inner();
        assert_eq!(bytes as usize, data.len());

        let mut names = part_names(data);
        names.sort();
        assert_eq!(
            names,
            vec![
                "[Content_Types].xml",
                "_rels/.rels",
                "docProps/app.xml",
                "docProps/core.xml",
                "xl/_rels/workbook.xml.rels",
                "xl/styles.xml",
                "xl/workbook.xml",
                "xl/worksheets/sheet1.xml",
            ]
        );
    }

    #[test]
    fn test_static_sheet_is_second() {
        let config = SheetConfig::new("Data")
            .option_list(OptionList::new("Numbers", ["1", "2"]).bind("n"));
        let mut sink = Cursor::new(Vec::new());
        generate(&mut sink, &config, &[Row(1)], &CancellationToken::new()).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(sink.into_inner())).unwrap();
        let mut workbook = String::new();
        archive
            .by_name("xl/workbook.xml")
            .unwrap()
            .read_to_string(&mut workbook)
            .unwrap();
        assert!(workbook.contains("<sheet name=\"Data\" sheetId=\"1\" r:id=\"rId1\"/>"));
        assert!(workbook.contains("<sheet name=\"Static Data\" sheetId=\"2\" r:id=\"rId2\"/>"));
        assert!(archive.by_name("xl/worksheets/sheet2.xml").is_ok());
    }

    #[test]
    fn test_invalid_configurations() {
        let mut sink = Cursor::new(Vec::new());
        let token = CancellationToken::new();

        let zero_batch = SheetConfig::default().options(ExportOptions {
            batch_size: 0,
            ..ExportOptions::default()
        });
        assert!(matches!(
            generate(&mut sink, &zero_batch, &[Row(1)], &token),
            Err(ExportError::InvalidInput(_))
        ));

        let clash = SheetConfig::new("static data").option_list(OptionList::new("L", ["x"]));
        assert!(matches!(
            generate(&mut sink, &clash, &[Row(1)], &token),
            Err(ExportError::InvalidInput(_))
        ));

        assert!(matches!(
            generate(&mut sink, &SheetConfig::new("bad/name"), &[Row(1)], &token),
            Err(ExportError::InvalidInput(_))
        ));

        assert!(matches!(
            generate(&mut sink, &SheetConfig::default(), &[Nothing], &token),
            Err(ExportError::NoMappedColumns { .. })
        ));

        for level in [-1, 10] {
            let config = SheetConfig::default().options(ExportOptions {
                compression_level: Some(level),
                ..ExportOptions::default()
            });
            assert!(matches!(
                generate(&mut sink, &config, &[Row(1)], &token),
                Err(ExportError::InvalidInput(_))
            ));
        }
        assert!(sink.get_ref().is_empty());
    }

    #[test]
    fn test_explicit_compression_level() {
        let config = SheetConfig::default().options(ExportOptions {
            compression_level: Some(9),
            ..ExportOptions::default()
        });
        let mut sink = Cursor::new(Vec::new());
        generate(&mut sink, &config, &[Row(1)], &CancellationToken::new()).unwrap();
        assert_eq!(part_names(sink.into_inner()).len(), 8);
    }

    #[test]
    fn test_cancel_mid_sheet_unlists_partial_parts() {
        let token = CancellationToken::new();
        let records: Vec<Tripwire> = (0..20)
            .map(|n| Tripwire {
                token: token.clone(),
                n,
            })
            .collect();
        let config = SheetConfig::default().options(ExportOptions {
            batch_size: 2,
            ..ExportOptions::default()
        });

        let mut sink = Cursor::new(Vec::new());
        let err = generate(&mut sink, &config, &records, &token).unwrap_err();
        assert!(err.is_canceled());

        if let Ok(archive) = zip::ZipArchive::new(Cursor::new(sink.into_inner())) {
            assert_eq!(archive.len(), 0);
        }
    }

    #[test]
    fn test_temp_path_is_a_sibling() {
        let temp = temp_path_for(Path::new("out/report.xlsx"));
        assert_eq!(temp.parent(), Some(Path::new("out")));
        assert!(temp.to_string_lossy().starts_with("out/report.xlsx.tmp."));
    }

    #[test]
    fn test_export_rejects_empty_path() {
        let err = export_to_path("", &SheetConfig::default(), &[Row(1)], &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ExportError::InvalidInput(_)));
    }
}
