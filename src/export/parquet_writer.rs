//! Parquet writer for generated equilibrium datasets.
//!
//! One Parquet row per output store row. Element symbols and concentrations
//! are split into scalar columns; the variable-length phase lists are stored
//! as JSON strings. When a label encoder is supplied, three integer phase
//! columns are appended.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Float64Builder, StringArray, StringBuilder, UInt32Builder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::error::ExportError;
use crate::labels::{LabelEncoder, PHASE_SLOTS};
use crate::storage::ResultRecord;

/// Rows per Arrow batch / Parquet row group.
pub const DEFAULT_BATCH_ROWS: usize = 65_536;

/// Schema of exported datasets.
pub fn dataset_schema(encoded: bool) -> Schema {
    let mut fields = vec![
        Field::new("temperature", DataType::Float64, false),
        Field::new("primary", DataType::Utf8, false),
        Field::new("solute_a", DataType::Utf8, false),
        Field::new("solute_b", DataType::Utf8, false),
        Field::new("w_a", DataType::Float64, false),
        Field::new("w_b", DataType::Float64, false),
        Field::new("gibbs_energy", DataType::Float64, true),
        Field::new("phase_fractions", DataType::Utf8, false),
        Field::new("phase_labels", DataType::Utf8, false),
    ];
    if encoded {
        for slot in 1..=PHASE_SLOTS {
            fields.push(Field::new(format!("enc_phase_{}", slot), DataType::UInt32, false));
        }
    }
    Schema::new(fields)
}

/// Convert rows into an Arrow RecordBatch.
pub fn records_to_record_batch(
    records: &[ResultRecord],
    encoder: Option<&LabelEncoder>,
) -> Result<RecordBatch, ExportError> {
    let schema = Arc::new(dataset_schema(encoder.is_some()));

    let mut temperature = Float64Builder::new();
    let mut primary = StringBuilder::new();
    let mut solute_a = StringBuilder::new();
    let mut solute_b = StringBuilder::new();
    let mut w_a = Float64Builder::new();
    let mut w_b = Float64Builder::new();
    let mut gibbs_energy = Float64Builder::new();
    let mut phase_fractions = StringBuilder::new();
    let mut phase_labels = StringBuilder::new();
    let mut encoded: Vec<UInt32Builder> = (0..PHASE_SLOTS).map(|_| UInt32Builder::new()).collect();

    for record in records {
        temperature.append_value(record.temperature);
        let [p, a, b] = &record.elements;
        primary.append_value(p);
        solute_a.append_value(a);
        solute_b.append_value(b);
        w_a.append_value(record.concentration[0]);
        w_b.append_value(record.concentration[1]);
        gibbs_energy.append_option(record.gibbs_energy);
        phase_fractions.append_value(serde_json::to_string(&record.phase_fractions)?);
        phase_labels.append_value(serde_json::to_string(&record.phase_labels)?);

        if let Some(encoder) = encoder {
            let codes = encoder.transform_padded(&record.phase_labels)?;
            for (builder, code) in encoded.iter_mut().zip(codes) {
                builder.append_value(code as u32);
            }
        }
    }

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(temperature.finish()),
        Arc::new(primary.finish()),
        Arc::new(solute_a.finish()),
        Arc::new(solute_b.finish()),
        Arc::new(w_a.finish()),
        Arc::new(w_b.finish()),
        Arc::new(gibbs_energy.finish()),
        Arc::new(phase_fractions.finish()),
        Arc::new(phase_labels.finish()),
    ];
    if encoder.is_some() {
        columns.extend(encoded.iter_mut().map(|b| Arc::new(b.finish()) as ArrayRef));
    }

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Drops rows whose `(elements, concentration, temperature)` key was already seen.
///
/// Keeps the first occurrence. Returns how many rows were removed.
pub fn dedup_records(records: &mut Vec<ResultRecord>) -> usize {
    let before = records.len();
    let mut seen = HashSet::new();
    records.retain(|r| {
        seen.insert((
            r.elements.clone(),
            r.concentration[0].to_bits(),
            r.concentration[1].to_bits(),
            r.temperature.to_bits(),
        ))
    });
    before - records.len()
}

/// Write rows to a ZSTD-compressed Parquet file on disk.
pub fn write_parquet(
    records: &[ResultRecord],
    encoder: Option<&LabelEncoder>,
    output_path: &Path,
    batch_rows: usize,
) -> Result<(), ExportError> {
    if records.is_empty() {
        return Err(ExportError::NoRows);
    }

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::File::create(output_path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .set_max_row_group_size(batch_rows.max(1))
        .build();

    let schema = Arc::new(dataset_schema(encoder.is_some()));
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    for chunk in records.chunks(batch_rows.max(1)) {
        let batch = records_to_record_batch(chunk, encoder)?;
        writer.write(&batch)?;
    }
    writer.close()?;

    tracing::info!(
        path = %output_path.display(),
        rows = records.len(),
        "Parquet file written"
    );

    Ok(())
}

/// Read rows back from an exported Parquet file.
pub fn read_parquet(input_path: &Path) -> Result<Vec<ResultRecord>, ExportError> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let file = std::fs::File::open(input_path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut records = Vec::new();
    for batch_result in reader {
        let batch = batch_result?;

        let temperature = float_column(&batch, "temperature")?;
        let primary = string_column(&batch, "primary")?;
        let solute_a = string_column(&batch, "solute_a")?;
        let solute_b = string_column(&batch, "solute_b")?;
        let w_a = float_column(&batch, "w_a")?;
        let w_b = float_column(&batch, "w_b")?;
        let gibbs_energy = float_column(&batch, "gibbs_energy")?;
        let phase_fractions = string_column(&batch, "phase_fractions")?;
        let phase_labels = string_column(&batch, "phase_labels")?;

        for i in 0..batch.num_rows() {
            records.push(ResultRecord {
                temperature: temperature.value(i),
                elements: [
                    primary.value(i).to_string(),
                    solute_a.value(i).to_string(),
                    solute_b.value(i).to_string(),
                ],
                concentration: [w_a.value(i), w_b.value(i)],
                gibbs_energy: (!gibbs_energy.is_null(i)).then(|| gibbs_energy.value(i)),
                phase_fractions: serde_json::from_str(phase_fractions.value(i))?,
                phase_labels: serde_json::from_str(phase_labels.value(i))?,
            });
        }
    }

    tracing::info!(
        path = %input_path.display(),
        rows = records.len(),
        "Parquet file loaded"
    );

    Ok(records)
}

fn float_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array, ExportError> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<Float64Array>())
        .ok_or_else(|| missing_column(name))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, ExportError> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| missing_column(name))
}

fn missing_column(name: &str) -> ExportError {
    ExportError::Arrow(arrow::error::ArrowError::SchemaError(format!(
        "missing or mistyped column '{}'",
        name
    )))
}
