//! File-level plumbing shared by every stage.
//!
//! Text inputs (name lists, case orders, delimited numeric tables) are parsed here,
//! and every binary artifact the pipeline produces goes through the
//! `save_*`/`load_*` pairs at the bottom of this module.

use crate::types::{LabeledMatrix, ShapeMismatch};
use log::debug;
use natord::compare;
use ndarray::Array2;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension given to every binary artifact.
pub const ARTIFACT_EXTENSION: &str = "bin";

#[derive(Error, Debug)]
pub enum FileError {
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read delimited file '{}': {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("'{}' line {line}: could not parse '{value}' as a number", .path.display())]
    Parse {
        path: PathBuf,
        line: u64,
        value: String,
    },
    #[error("'{}' line {line}: expected {expected} fields but found {found}", .path.display())]
    RaggedRow {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("Failed to serialize artifact '{}': {message}", .path.display())]
    Encode { path: PathBuf, message: String },
    #[error("Failed to deserialize artifact '{}': {message}", .path.display())]
    Decode { path: PathBuf, message: String },
    #[error("Artifact pair '{}' is inconsistent: {source}", .stem.display())]
    Shape {
        stem: PathBuf,
        #[source]
        source: ShapeMismatch,
    },
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> FileError + '_ {
    move |source| FileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads a newline-delimited list, dropping trailing whitespace and blank lines.
pub fn load_list(path: &Path) -> Result<Vec<String>, FileError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut items = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_error(path))?;
        let trimmed = line.trim_end();
        if !trimmed.is_empty() {
            items.push(trimmed.to_string());
        }
    }
    Ok(items)
}

/// Lists the regular files of a directory in natural order (`f2` before `f10`).
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, FileError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        let file_type = entry.file_type().map_err(io_error(dir))?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    files.sort_by(|a, b| {
        let a_name = a.file_name().map(|s| s.to_string_lossy()).unwrap_or_default();
        let b_name = b.file_name().map(|s| s.to_string_lossy()).unwrap_or_default();
        compare(&a_name, &b_name)
    });
    Ok(files)
}

/// The file name without its final extension, as used in column labels.
pub fn file_stem_string(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reads a headerless delimited table of numbers. Empty cells become `NaN`.
///
/// Every row must carry the same number of fields as the first one.
pub fn read_numeric_table(path: &Path, delimiter: u8) -> Result<Array2<f64>, FileError> {
    let csv_error = |source| FileError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .map_err(csv_error)?;

    let mut values = Vec::new();
    let mut ncols: Option<usize> = None;
    let mut nrows = 0usize;
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        let line = record.position().map_or(0, |p| p.line());
        match ncols {
            None => ncols = Some(record.len()),
            Some(expected) if expected != record.len() => {
                return Err(FileError::RaggedRow {
                    path: path.to_path_buf(),
                    line,
                    expected,
                    found: record.len(),
                });
            }
            Some(_) => {}
        }
        for field in record.iter() {
            values.push(parse_cell(field).ok_or_else(|| FileError::Parse {
                path: path.to_path_buf(),
                line,
                value: field.to_string(),
            })?);
        }
        nrows += 1;
    }

    let ncols = ncols.unwrap_or(0);
    debug!("Read {nrows}x{ncols} table from '{}'", path.display());
    Array2::from_shape_vec((nrows, ncols), values).map_err(|e| FileError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn parse_cell(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.is_empty() || field.eq_ignore_ascii_case("nan") {
        return Some(f64::NAN);
    }
    field.parse::<f64>().ok()
}

/// Appends `suffix` to the final path component: `dir/full` + `_names` -> `dir/full_names`.
pub fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(suffix);
    stem.with_file_name(name)
}

/// The on-disk file backing an artifact stem.
pub fn artifact_path(stem: &Path) -> PathBuf {
    with_suffix(stem, &format!(".{ARTIFACT_EXTENSION}"))
}

fn ensure_parent(path: &Path) -> Result<(), FileError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
    }
    Ok(())
}

/// Creates (or truncates) a text output file, making its parent directories.
pub fn create_text_file(path: &Path) -> Result<BufWriter<File>, FileError> {
    ensure_parent(path)?;
    let file = File::create(path).map_err(io_error(path))?;
    Ok(BufWriter::new(file))
}

/// Serializes any value to an opaque bincode blob at `path`.
pub fn save_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<(), FileError> {
    ensure_parent(path)?;
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = BufWriter::new(file);
    bincode::serde::encode_into_std_write(value, &mut writer, bincode::config::standard())
        .map_err(|e| FileError::Encode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    writer.flush().map_err(io_error(path))
}

/// Reads back a blob written by [`save_snapshot`].
pub fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<T, FileError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut reader = BufReader::new(file);
    bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard()).map_err(|e| {
        FileError::Decode {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })
}

/// Persists a matrix and its names as the pair `<stem>.bin` / `<stem>_names.bin`.
pub fn save_matrix_artifact(stem: &Path, matrix: &LabeledMatrix) -> Result<(), FileError> {
    save_snapshot(&artifact_path(stem), &matrix.data())?;
    save_snapshot(&artifact_path(&with_suffix(stem, "_names")), &matrix.names())?;
    debug!(
        "Saved artifact '{}' with shape {:?}",
        stem.display(),
        matrix.shape()
    );
    Ok(())
}

/// Loads a matrix written by [`save_matrix_artifact`], re-checking its shape.
pub fn load_matrix_artifact(stem: &Path) -> Result<LabeledMatrix, FileError> {
    let data: Array2<f64> = load_snapshot(&artifact_path(stem))?;
    let names: Vec<String> = load_snapshot(&artifact_path(&with_suffix(stem, "_names")))?;
    LabeledMatrix::new(data, names).map_err(|source| FileError::Shape {
        stem: stem.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn write_file(path: &Path, content: &str) {
        let mut file = File::create(path).unwrap();
        write!(file, "{content}").unwrap();
    }

    #[test]
    fn load_list_skips_blank_lines_and_trailing_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("list.txt");
        write_file(&path, "a  \n\nb\r\nc\n\n");
        assert_eq!(load_list(&path).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn list_files_uses_natural_order() {
        let dir = tempdir().unwrap();
        for name in ["f10.csv", "f2.csv", "f1.csv"] {
            write_file(&dir.path().join(name), "1\n");
        }
        fs::create_dir(dir.path().join("nested")).unwrap();
        let names: Vec<String> = list_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| file_stem_string(p))
            .collect();
        assert_eq!(names, vec!["f1", "f2", "f10"]);
    }

    #[test]
    fn numeric_table_maps_empty_cells_to_nan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        write_file(&path, "1,,3\n4,5,6\n");
        let table = read_numeric_table(&path, b',').unwrap();
        assert_eq!(table.shape(), &[2, 3]);
        assert!(table[[0, 1]].is_nan());
        assert_eq!(table[[1, 2]], 6.0);
    }

    #[test]
    fn numeric_table_reads_single_column_as_one_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("single.txt");
        write_file(&path, "1\nnan\n3\n");
        let table = read_numeric_table(&path, b',').unwrap();
        assert_eq!(table.shape(), &[3, 1]);
        assert!(table[[1, 0]].is_nan());
    }

    #[test]
    fn numeric_table_rejects_ragged_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ragged.csv");
        write_file(&path, "1,2\n3\n");
        match read_numeric_table(&path, b',') {
            Err(FileError::RaggedRow {
                expected, found, ..
            }) => {
                assert_eq!(expected, 2);
                assert_eq!(found, 1);
            }
            other => panic!("expected RaggedRow, got {other:?}"),
        }
    }

    #[test]
    fn numeric_table_rejects_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        write_file(&path, "1,abc\n");
        assert!(matches!(
            read_numeric_table(&path, b','),
            Err(FileError::Parse { .. })
        ));
    }

    #[test]
    fn matrix_artifact_pair_shares_a_stem() {
        let dir = tempdir().unwrap();
        let stem = dir.path().join("out").join("full");
        let matrix = LabeledMatrix::new(
            array![[1.0, f64::NAN], [3.0, 4.0]],
            vec!["x_a".to_string(), "y_a".to_string()],
        )
        .unwrap();
        save_matrix_artifact(&stem, &matrix).unwrap();
        assert!(dir.path().join("out/full.bin").exists());
        assert!(dir.path().join("out/full_names.bin").exists());

        let loaded = load_matrix_artifact(&stem).unwrap();
        assert_eq!(loaded.names(), matrix.names());
        assert_eq!(loaded.data()[[1, 1]], 4.0);
        assert!(loaded.data()[[0, 1]].is_nan());
    }
}
