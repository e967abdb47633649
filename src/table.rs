use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use serde::{Deserialize, Serialize};

/// One cell of the source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Infers a typed cell from raw CSV text.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return FieldValue::Null;
        }
        // Only the lowercase spellings, so a Bool always prints back as its source text.
        match trimmed {
            "true" => return FieldValue::Bool(true),
            "false" => return FieldValue::Bool(false),
            _ => {}
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            return FieldValue::Int(n);
        }
        // f64 parsing also accepts "nan", "-inf" and overflowing literals.
        if let Ok(f) = trimmed.parse::<f64>()
            && f.is_finite()
        {
            return FieldValue::Float(f);
        }
        FieldValue::Text(trimmed.to_string())
    }

    fn float(f: f64) -> Self {
        if f.is_finite() {
            FieldValue::Float(f)
        } else {
            FieldValue::Text(f.to_string())
        }
    }
}

/// Denormalized source table: named columns over an ordered row sequence.
#[derive(Debug, Clone, Default)]
pub struct RowTable {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<FieldValue>>,
}

impl RowTable {
    pub fn new(columns: Vec<String>) -> Self {
        let index = columns
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        Self {
            columns,
            index,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<FieldValue>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(anyhow!(
                "record {} has {} fields, header has {}",
                self.rows.len() + 1,
                row.len(),
                self.columns.len()
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[FieldValue]> {
        self.rows.iter().map(|row| row.as_slice())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&FieldValue> {
        let col = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(col))
    }
}

pub fn read_table(path: &Path) -> Result<RowTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => read_csv(path),
        "parquet" => read_parquet(path),
        _ => Err(anyhow!(
            "unsupported source table format for {} (expected .csv or .parquet)",
            path.display()
        )),
    }
}

pub fn read_csv(path: &Path) -> Result<RowTable> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    read_csv_from(file).with_context(|| format!("read csv {}", path.display()))
}

pub fn read_csv_from<R: Read>(reader: R) -> Result<RowTable> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = csv_reader
        .headers()
        .context("read csv header")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();

    let mut table = RowTable::new(headers);
    for record in csv_reader.records() {
        let record = record.context("decode csv record")?;
        let row = record.iter().map(FieldValue::parse).collect();
        table.push_row(row)?;
    }
    Ok(table)
}

pub fn read_parquet(path: &Path) -> Result<RowTable> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(file).context("open parquet reader")?;
    let columns = reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect::<Vec<_>>();

    let mut table = RowTable::new(columns);
    let iter = reader.get_row_iter(None).context("iterate parquet rows")?;
    for row in iter {
        let row = row.context("decode parquet row")?;
        let values = row
            .get_column_iter()
            .map(|(_, field)| parquet_field_value(field))
            .collect();
        table.push_row(values)?;
    }
    Ok(table)
}

fn parquet_field_value(field: &Field) -> FieldValue {
    match field {
        Field::Null => FieldValue::Null,
        Field::Bool(b) => FieldValue::Bool(*b),
        Field::Byte(n) => FieldValue::Int(i64::from(*n)),
        Field::Short(n) => FieldValue::Int(i64::from(*n)),
        Field::Int(n) => FieldValue::Int(i64::from(*n)),
        Field::Long(n) => FieldValue::Int(*n),
        Field::UByte(n) => FieldValue::Int(i64::from(*n)),
        Field::UShort(n) => FieldValue::Int(i64::from(*n)),
        Field::UInt(n) => FieldValue::Int(i64::from(*n)),
        Field::ULong(n) => match i64::try_from(*n) {
            Ok(v) => FieldValue::Int(v),
            Err(_) => FieldValue::Text(n.to_string()),
        },
        Field::Float(f) => FieldValue::float(f64::from(*f)),
        Field::Double(f) => FieldValue::float(*f),
        Field::Str(s) => FieldValue::Text(s.clone()),
        other => FieldValue::Text(other.to_string()),
    }
}
