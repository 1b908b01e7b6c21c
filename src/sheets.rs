//! ==============================================================================
//! sheets.rs - Sheet Storage Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for the tabular store the ingest path
//!     writes into. a "workbook" holds named sheets; each sheet is a list of
//!     rows. the ingest path only ever needs four things from it: look a sheet
//!     up by name, count its rows, append one row, and copy a sheet under a
//!     new name.
//!
//! implementations:
//!     - MemoryWorkbook: everything in a mutex-guarded map. used by tests and
//!       by `backend = "memory"` for dry runs.
//!     - CsvWorkbook: one `<sheet name>.csv` file per sheet in a data
//!       directory. durable, and readable by any spreadsheet tool.
//!
//! relationships:
//!     - used by: provision.rs (template lookup, copy-with-rename)
//!     - used by: ingest.rs (row count, append)
//!     - renders: domain::CellValue via Display
//!
//! ==============================================================================

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tempfile::NamedTempFile;

use crate::domain::CellValue;
use crate::error::StoreError;

pub trait SheetStore: Send + Sync {
    /// named lookup
    fn has_sheet(&self, name: &str) -> Result<bool, StoreError>;
    /// number of rows including header rows; NotFound if the sheet is absent
    fn row_count(&self, name: &str) -> Result<usize, StoreError>;
    /// append exactly one row; atomic per call
    fn append_row(&self, name: &str, row: &[CellValue]) -> Result<(), StoreError>;
    /// copy `source` (rows included) into a new sheet called `new_name`
    fn duplicate_sheet(&self, source: &str, new_name: &str) -> Result<(), StoreError>;
    /// create a new sheet holding just `header`
    fn create_sheet(&self, name: &str, header: &[&str]) -> Result<(), StoreError>;
    /// every sheet name, sorted
    fn sheet_names(&self) -> Result<Vec<String>, StoreError>;
}

fn render(row: &[CellValue]) -> Vec<String> {
    row.iter().map(|cell| cell.to_string()).collect()
}

// ==============================================================================================
// MEMORY IMPLEMENTATION
// ==============================================================================================

#[derive(Default)]
pub struct MemoryWorkbook {
    sheets: Mutex<BTreeMap<String, Vec<Vec<String>>>>,
}

impl MemoryWorkbook {
    pub fn new() -> Self {
        tracing::info!("Using MEMORY workbook (nothing is persisted)");
        Self::default()
    }

    fn sheets(&self) -> MutexGuard<'_, BTreeMap<String, Vec<Vec<String>>>> {
        // rows are plain data; a panic mid-append leaves nothing half-written
        self.sheets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// rendered rows of a sheet, for inspection
    pub fn rows(&self, name: &str) -> Option<Vec<Vec<String>>> {
        self.sheets().get(name).cloned()
    }
}

impl SheetStore for MemoryWorkbook {
    fn has_sheet(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.sheets().contains_key(name))
    }

    fn row_count(&self, name: &str) -> Result<usize, StoreError> {
        self.sheets()
            .get(name)
            .map(Vec::len)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn append_row(&self, name: &str, row: &[CellValue]) -> Result<(), StoreError> {
        let mut sheets = self.sheets();
        let rows = sheets
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        rows.push(render(row));
        tracing::debug!(sheet = %name, rows = rows.len(), "[MEMORY] appended row");
        Ok(())
    }

    fn duplicate_sheet(&self, source: &str, new_name: &str) -> Result<(), StoreError> {
        let mut sheets = self.sheets();
        if sheets.contains_key(new_name) {
            return Err(StoreError::AlreadyExists(new_name.to_string()));
        }
        let rows = sheets
            .get(source)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(source.to_string()))?;
        sheets.insert(new_name.to_string(), rows);
        Ok(())
    }

    fn create_sheet(&self, name: &str, header: &[&str]) -> Result<(), StoreError> {
        let mut sheets = self.sheets();
        if sheets.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let header = header.iter().map(|h| h.to_string()).collect();
        sheets.insert(name.to_string(), vec![header]);
        Ok(())
    }

    fn sheet_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.sheets().keys().cloned().collect())
    }
}

// ==============================================================================================
// CSV IMPLEMENTATION
// ==============================================================================================

pub struct CsvWorkbook {
    dir: PathBuf,
    // serializes writers inside this process so appends never interleave
    write_lock: Mutex<()>,
}

impl CsvWorkbook {
    /// open (creating if needed) a workbook directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        tracing::info!(dir = %dir.display(), "Using CSV workbook");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// map a sheet name onto its file, refusing anything that could escape
    /// the data directory
    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.trim().is_empty()
            && !name.starts_with('.')
            && !name.chars().any(|c| matches!(c, '/' | '\\' | ':') || c.is_control());
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{}.csv", name)))
    }

    fn writing(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_new(&self, path: &Path, header: &[&str]) -> Result<(), StoreError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer
            .write_record(header)
            .map_err(|e| StoreError::csv(path, e))?;
        writer.flush().map_err(|e| StoreError::io(path, e))
    }
}

impl SheetStore for CsvWorkbook {
    fn has_sheet(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(name)?.is_file())
    }

    fn row_count(&self, name: &str) -> Result<usize, StoreError> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| StoreError::csv(&path, e))?;

        let mut count = 0;
        for record in reader.records() {
            record.map_err(|e| StoreError::csv(&path, e))?;
            count += 1;
        }
        Ok(count)
    }

    fn append_row(&self, name: &str, row: &[CellValue]) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        let _guard = self.writing();

        // append never creates: a missing sheet is the caller's problem
        let file = OpenOptions::new().append(true).open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(name.to_string())
            } else {
                StoreError::io(&path, e)
            }
        })?;

        // one buffered record, one flush: the row lands in a single write
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer
            .write_record(render(row))
            .map_err(|e| StoreError::csv(&path, e))?;
        writer.flush().map_err(|e| StoreError::io(&path, e))?;

        tracing::debug!(sheet = %name, "[CSV] appended row");
        Ok(())
    }

    fn duplicate_sheet(&self, source: &str, new_name: &str) -> Result<(), StoreError> {
        let from = self.path_for(source)?;
        let to = self.path_for(new_name)?;
        let _guard = self.writing();

        if to.exists() {
            return Err(StoreError::AlreadyExists(new_name.to_string()));
        }
        if !from.is_file() {
            return Err(StoreError::NotFound(source.to_string()));
        }

        // copy into a uniquely named temp file beside the target, then
        // persist without clobbering: a half-copied sheet is never visible
        // under its final name, and a sheet created meanwhile is kept
        let mut source_file = File::open(&from).map_err(|e| StoreError::io(&from, e))?;
        let mut temp = NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        io::copy(&mut source_file, temp.as_file_mut())
            .map_err(|e| StoreError::io(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(temp.path(), e))?;

        temp.persist_noclobber(&to).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                StoreError::AlreadyExists(new_name.to_string())
            } else {
                StoreError::io(&to, e.error)
            }
        })?;
        Ok(())
    }

    fn create_sheet(&self, name: &str, header: &[&str]) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        let _guard = self.writing();
        if path.exists() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        self.write_new(&path, header)
    }

    fn sheet_names(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
