//! Reading and writing `.idv` training-row files.
//!
//! An `.idv` file is a flat stream of bincode-encoded records with no header
//! or footer; end of file is end of data. Writers always produce fresh files
//! (written to a `.tmp` sibling and renamed into place on finish) and readers
//! are lazy and forward-only, so both sides run in memory bounded by a single
//! row regardless of file size.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use bincode::config::Configuration;
use bincode::{Decode, Encode};

/// File extension used for training-row data files.
pub const DATA_EXTENSION: &str = "idv";

fn codec_config() -> Configuration {
    bincode::config::standard()
}

/// Marker for row types storable in `.idv` files.
///
/// Blanket-implemented; rows only need the bincode derives plus `Copy`.
pub trait Row: Copy + Encode + Decode<()> + Send + 'static {}

impl<T: Copy + Encode + Decode<()> + Send + 'static> Row for T {}

/// Streaming writer that produces a fresh `.idv` file.
///
/// Rows are buffered through a [`BufWriter`] into a temporary sibling path;
/// the final path only appears once [`RowWriter::finish`] succeeds, so a
/// crash mid-write never leaves a truncated file under the final name.
pub struct RowWriter<T> {
    writer: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    rows_written: u64,
    _marker: PhantomData<T>,
}

impl<T: Row> RowWriter<T> {
    /// Open a writer targeting `path`, creating parent directories as needed.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp_path = tmp_path_for(path);
        let file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            tmp_path,
            final_path: path.to_path_buf(),
            rows_written: 0,
            _marker: PhantomData,
        })
    }

    /// Append a single row.
    pub fn write(&mut self, row: &T) -> Result<()> {
        bincode::encode_into_std_write(row, &mut self.writer, codec_config())
            .with_context(|| format!("failed to encode row for {}", self.final_path.display()))?;
        self.rows_written += 1;
        Ok(())
    }

    /// Append a slice of rows.
    pub fn write_all(&mut self, rows: &[T]) -> Result<()> {
        for row in rows {
            self.write(row)?;
        }
        Ok(())
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Flush and move the file into its final place. Returns the row count.
    pub fn finish(mut self) -> Result<u64> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.tmp_path.display()))?;
        fs::rename(&self.tmp_path, &self.final_path).with_context(|| {
            format!(
                "failed to rename {} -> {}",
                self.tmp_path.display(),
                self.final_path.display()
            )
        })?;
        Ok(self.rows_written)
    }
}

/// Lazy forward-only reader over an `.idv` file.
///
/// Iterates `Result<T>`; a clean end of file ends the iteration while a
/// partial trailing record surfaces as an error.
pub struct RowReader<T> {
    reader: BufReader<File>,
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Row> RowReader<T> {
    /// Open `path` for streaming reads.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            _marker: PhantomData,
        })
    }

    /// Path this reader was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Row> Iterator for RowReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        // Peek so a clean EOF at a record boundary ends the stream instead of
        // surfacing as a decode error.
        match self.reader.fill_buf() {
            Ok(buf) if buf.is_empty() => return None,
            Ok(_) => {}
            Err(err) => {
                return Some(Err(
                    anyhow!(err).context(format!("failed to read {}", self.path.display()))
                ));
            }
        }
        let decoded = bincode::decode_from_std_read::<T, _, _>(&mut self.reader, codec_config());
        Some(
            decoded.map_err(|err| anyhow!("{}: failed to decode row: {err}", self.path.display())),
        )
    }
}

/// Write all `rows` to a fresh file at `path`. Returns the row count.
pub fn save_rows<T: Row>(rows: &[T], path: &Path) -> Result<u64> {
    let mut writer = RowWriter::create(path)?;
    writer.write_all(rows)?;
    writer.finish()
}

/// Open a lazy forward-only stream over the rows in `path`.
pub fn stream_rows<T: Row>(path: &Path) -> Result<RowReader<T>> {
    RowReader::open(path)
}

/// Load every row from `path` into memory. Intended for small files and tests;
/// large files should go through [`stream_rows`].
pub fn load_rows<T: Row>(path: &Path) -> Result<Vec<T>> {
    stream_rows(path)?.collect()
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Clone, Copy, Debug, PartialEq, bincode::Encode, bincode::Decode)]
    struct TestRow {
        id: u32,
        values: [f32; 4],
    }

    fn row(id: u32) -> TestRow {
        TestRow {
            id,
            values: [id as f32; 4],
        }
    }

    #[test]
    fn roundtrip_preserves_rows_and_order() {
        let td = tempdir().unwrap();
        let path = td.path().join("rows.idv");
        let rows: Vec<TestRow> = (0..100).map(row).collect();
        let written = save_rows(&rows, &path).unwrap();
        assert_eq!(written, 100);

        let back = load_rows::<TestRow>(&path).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn empty_file_yields_no_rows() {
        let td = tempdir().unwrap();
        let path = td.path().join("empty.idv");
        let written = save_rows::<TestRow>(&[], &path).unwrap();
        assert_eq!(written, 0);
        assert!(path.exists());
        assert!(load_rows::<TestRow>(&path).unwrap().is_empty());
    }

    #[test]
    fn final_path_only_appears_after_finish() {
        let td = tempdir().unwrap();
        let path = td.path().join("rows.idv");
        let mut writer = RowWriter::<TestRow>::create(&path).unwrap();
        writer.write(&row(1)).unwrap();
        assert!(!path.exists());
        writer.finish().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn missing_file_is_an_error() {
        let td = tempdir().unwrap();
        let err = stream_rows::<TestRow>(&td.path().join("absent.idv"))
            .err()
            .expect("open should fail");
        assert!(format!("{err:#}").contains("absent.idv"));
    }

    #[test]
    fn truncated_trailing_record_surfaces_as_error() {
        let td = tempdir().unwrap();
        let path = td.path().join("rows.idv");
        save_rows(&[row(1), row(2)], &path).unwrap();
        let len = fs::metadata(&path).unwrap().len();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..len as usize - 3]).unwrap();

        let results: Vec<_> = stream_rows::<TestRow>(&path).unwrap().collect();
        assert!(results[0].is_ok());
        assert!(results.last().unwrap().is_err());
    }
}
