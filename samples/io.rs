//! Reading and writing the three tab-delimited sample-index files.
//!
//! Each record line is `matrix_name, target_index, target_name, fold_type,
//! idx0 .. idxN`, tab separated. Lines starting with `#` are comments.

use super::{SampleIndexConfig, SampleIndexError, SampleRecord};
use crate::shared::files::{self, FileError, io_error};
use crate::types::{FoldType, SampleKey};
use itertools::Itertools;
use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::io::Write;
use std::path::Path;

const FEATURE_HEADER: &str = "#feature_matrix_name, target_id, target_name, fold_type, row_indices";
const TARGET_HEADER: &str = "#target_matrix_name, target_id, target_name, fold_type, row_indices";
const CASE_HEADER: &str = "#target_matrix_name, target_id, target_name, fold_type, case_ids";

/// Writes the feature-row, target-row and case-id files in lockstep.
pub fn write_sample_files(
    config: &SampleIndexConfig,
    records: &[SampleRecord],
) -> Result<(), FileError> {
    write_index_file(
        &config.feature_samples_out,
        FEATURE_HEADER,
        &config.feature_matrix_name,
        records,
        |r| r.feature_rows.iter().join("\t"),
    )?;
    write_index_file(
        &config.target_samples_out,
        TARGET_HEADER,
        &config.target_matrix_name,
        records,
        |r| r.target_rows.iter().join("\t"),
    )?;
    write_index_file(
        &config.feat_targ_samples_out,
        CASE_HEADER,
        &config.target_matrix_name,
        records,
        |r| r.case_ids.iter().join("\t"),
    )
}

fn write_index_file(
    path: &Path,
    header: &str,
    matrix_name: &str,
    records: &[SampleRecord],
    values: impl Fn(&SampleRecord) -> String,
) -> Result<(), FileError> {
    let mut writer = files::create_text_file(path)?;
    let mut write = || -> std::io::Result<()> {
        writeln!(writer, "{header}")?;
        for record in records {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}",
                matrix_name,
                record.key.target_index,
                record.target_name,
                record.key.fold_type,
                values(record)
            )?;
        }
        writer.flush()
    };
    write().map_err(io_error(path))
}

/// Parses a row-index file (feature or target space) keyed by `SampleKey`.
pub fn load_sample_index(path: &Path) -> Result<BTreeMap<SampleKey, Vec<usize>>, SampleIndexError> {
    parse_index_file(path, |field, line| {
        field.parse::<usize>().map_err(|_| SampleIndexError::Malformed {
            path: path.to_path_buf(),
            line,
            message: format!("'{field}' is not a row index"),
        })
    })
}

/// Parses the case-id file keyed by `SampleKey`.
pub fn load_case_index(path: &Path) -> Result<BTreeMap<SampleKey, Vec<String>>, SampleIndexError> {
    parse_index_file(path, |field, _| Ok(field.to_string()))
}

// Reported line numbers count non-blank lines only.
fn parse_index_file<T>(
    path: &Path,
    parse: impl Fn(&str, usize) -> Result<T, SampleIndexError>,
) -> Result<BTreeMap<SampleKey, Vec<T>>, SampleIndexError> {
    let malformed = |line: usize, message: String| SampleIndexError::Malformed {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut index = BTreeMap::new();
    for (idx, raw) in files::load_list(path)?.iter().enumerate() {
        if raw.starts_with('#') {
            continue;
        }
        let line = idx + 1;
        let fields: Vec<&str> = raw.split('\t').collect();
        if fields.len() < 4 {
            return Err(malformed(line, format!("expected at least 4 fields, found {}", fields.len())));
        }
        let target_index = fields[1]
            .trim()
            .parse::<usize>()
            .map_err(|_| malformed(line, format!("'{}' is not a target index", fields[1])))?;
        let fold_type = fields[3]
            .trim()
            .parse::<FoldType>()
            .map_err(|e| malformed(line, e.to_string()))?;
        let values = fields[4..]
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(|f| parse(f, line))
            .collect::<Result<Vec<T>, _>>()?;
        let key = SampleKey {
            target_index,
            fold_type,
        };
        if index.insert(key, values).is_some() {
            return Err(malformed(line, format!("duplicate record for key {key}")));
        }
    }
    Ok(index)
}

/// For every fold key, the full list minus that fold's entries (order preserved).
/// `full` keys map to themselves. This is the training side of a held-out fold.
pub fn inverse_samples<T>(
    index: &BTreeMap<SampleKey, Vec<T>>,
) -> Result<BTreeMap<SampleKey, Vec<T>>, SampleIndexError>
where
    T: Clone + Eq + Hash,
{
    let mut inverse = BTreeMap::new();
    for (key, values) in index {
        if key.fold_type.is_full() {
            inverse.insert(*key, values.clone());
            continue;
        }
        let full = index
            .get(&SampleKey::full(key.target_index))
            .ok_or(SampleIndexError::MissingFullRecord(key.target_index))?;
        let held_out: HashSet<&T> = values.iter().collect();
        let remaining = full.iter().filter(|v| !held_out.contains(v)).cloned().collect();
        inverse.insert(*key, remaining);
    }
    Ok(inverse)
}
