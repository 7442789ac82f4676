//! Plain-text files: reference line lists, identified line pairs, traces and
//! extracted spectra.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::aperture::Trace;
use crate::calibrate::{LineList, LinePair};
use crate::extract::{ExtractionResult, Spectrum};

/// Parse a single list record; the wavelength is the first column.
fn parse_line_record(record: &str) -> Option<f64> {
    record
        .split(|c: char| c.is_whitespace() || c == ',')
        .find(|t| !t.is_empty())?
        .parse()
        .ok()
}

/// Parse a reference line list from an in-memory string.
///
/// The first line is a header and is skipped, as are lines whose first
/// column is not a number.
pub fn parse_line_list(data: &str) -> LineList {
    LineList::new(data.lines().skip(1).filter_map(parse_line_record).collect())
}

/// Read a reference line list from disk.
pub fn read_line_list<P: AsRef<Path>>(path: P) -> anyhow::Result<LineList> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read line list: {}", path.display()))?;
    let lines = parse_line_list(&data);
    info!("Loaded {} reference lines from {}", lines.len(), path.display());
    Ok(lines)
}

fn reader_for(path: &Path, delimiter: u8) -> anyhow::Result<csv::Reader<File>> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn writer_for(path: &Path, header: &str, delimiter: u8) -> anyhow::Result<csv::Writer<File>> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    for line in header.lines() {
        writeln!(file, "# {}", line)?;
    }
    Ok(csv::WriterBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .from_writer(file))
}

/// Read every record of a delimited numeric file into rows of `columns` values.
fn read_columns(path: &Path, delimiter: u8, columns: usize) -> anyhow::Result<Vec<Vec<f64>>> {
    let mut rdr = reader_for(path, delimiter)?;
    rdr.records()
        .enumerate()
        .map(|(i, result)| {
            let record = result.with_context(|| format!("{}: record {}", path.display(), i + 1))?;
            let row = record
                .iter()
                .filter(|field| !field.is_empty())
                .take(columns)
                .map(|field| {
                    field.parse::<f64>().with_context(|| {
                        format!("{}: record {}: bad number '{}'", path.display(), i + 1, field)
                    })
                })
                .collect::<anyhow::Result<Vec<f64>>>()?;
            anyhow::ensure!(
                row.len() == columns,
                "{}: record {} has {} columns, expected {}",
                path.display(),
                i + 1,
                row.len(),
                columns
            );
            Ok(row)
        })
        .collect()
}

/// Write identified `(pixel, wavelength)` pairs under a `#` header naming `label`.
pub fn write_line_pairs<P: AsRef<Path>>(
    path: P,
    pairs: &[LinePair],
    label: &str,
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut wtr = writer_for(path, &format!("{label} lines\npixel, wavelength"), b',')?;
    for p in pairs {
        wtr.write_record([p.pixel.to_string(), format!(" {}", p.wavelength)])?;
    }
    wtr.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Saved {} {} lines to {}", pairs.len(), label, path.display());
    Ok(())
}

/// Read pairs written by [`write_line_pairs`].
pub fn read_line_pairs<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<LinePair>> {
    let path = path.as_ref();
    let pairs: Vec<LinePair> = read_columns(path, b',', 2)?
        .into_iter()
        .enumerate()
        .filter_map(|(i, row)| {
            if row[0].is_finite() && row[1].is_finite() {
                Some(LinePair {
                    pixel: row[0],
                    wavelength: row[1],
                })
            } else {
                warn!(
                    "{}: skipping non-finite line pair at record {}",
                    path.display(),
                    i + 1
                );
                None
            }
        })
        .collect();
    debug!("Read {} line pairs from {}", pairs.len(), path.display());
    Ok(pairs)
}

/// Write a trace as `index, position` records.
pub fn write_trace<P: AsRef<Path>>(path: P, trace: &Trace) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut wtr = writer_for(path, "index, position", b',')?;
    for (i, pos) in trace.iter().enumerate() {
        wtr.write_record([i.to_string(), format!(" {}", pos)])?;
    }
    wtr.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Saved trace ({} columns) to {}", trace.len(), path.display());
    Ok(())
}

/// Read a trace written by [`write_trace`]. Records must be in index order.
pub fn read_trace<P: AsRef<Path>>(path: P) -> anyhow::Result<Trace> {
    let path = path.as_ref();
    let rows = read_columns(path, b',', 2)?;
    for (i, row) in rows.iter().enumerate() {
        anyhow::ensure!(
            row[0] as usize == i,
            "{}: trace index {} out of order at record {}",
            path.display(),
            row[0],
            i + 1
        );
    }
    Ok(Trace::new(rows.into_iter().map(|row| row[1]).collect()))
}

/// Write `wavelength flux error` records, space separated.
///
/// The flux column is sky subtracted.
pub fn write_spectrum<P: AsRef<Path>>(path: P, spectrum: &Spectrum) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut wtr = writer_for(path, "wavelength flux error", b' ')?;
    for ((w, f), e) in spectrum
        .wavelength
        .iter()
        .zip(spectrum.sky_subtracted())
        .zip(&spectrum.flux_err)
    {
        wtr.write_record([w.to_string(), f.to_string(), e.to_string()])?;
    }
    wtr.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Saved spectrum ({} points) to {}", spectrum.len(), path.display());
    Ok(())
}

/// Read a spectrum written by [`write_spectrum`].
///
/// The file holds sky-subtracted flux only, so the returned sky is zero.
pub fn read_spectrum<P: AsRef<Path>>(path: P) -> anyhow::Result<Spectrum> {
    let path = path.as_ref();
    let rows = read_columns(path, b' ', 3)?;
    let wavelength = rows.iter().map(|r| r[0]).collect();
    let extraction = ExtractionResult {
        flux: rows.iter().map(|r| r[1]).collect(),
        sky: vec![0.0; rows.len()],
        flux_err: rows.iter().map(|r| r[2]).collect(),
    };
    Ok(Spectrum::new(wavelength, extraction)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_list_skips_header() {
        let data = "wavelength  element\n7032.41 Ne\n5852.49 Ne\n\nnot-a-line\n6402.25, Ne\n";
        let lines = parse_line_list(data);
        assert_eq!(lines.as_slice(), &[5852.49, 6402.25, 7032.41]);
    }

    #[test]
    fn test_line_pairs_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arc.lines");
        let pairs = vec![
            LinePair { pixel: 101.25, wavelength: 5852.4878 },
            LinePair { pixel: 402.0, wavelength: 6402.246 },
        ];
        write_line_pairs(&path, &pairs, "first pass").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# first pass lines\n# pixel, wavelength\n"));
        assert_eq!(read_line_pairs(&path).unwrap(), pairs);
    }

    #[test]
    fn test_non_finite_line_pairs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arc.lines");
        std::fs::write(
            &path,
            "# first pass lines\n# pixel, wavelength\n101.5, 5852.49\nNaN, 6030.0\n402.0, inf\n450.0, 6402.25\n",
        )
        .unwrap();
        let pairs = read_line_pairs(&path).unwrap();
        assert_eq!(
            pairs,
            vec![
                LinePair { pixel: 101.5, wavelength: 5852.49 },
                LinePair { pixel: 450.0, wavelength: 6402.25 },
            ]
        );
    }

    #[test]
    fn test_trace_file_feeds_recenter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        let trace = Trace::new((0..30).map(|i| 50.0 + 0.1 * i as f64).collect());
        write_trace(&path, &trace).unwrap();
        let back = read_trace(&path).unwrap();
        assert_eq!(back, trace);
    }

    #[test]
    fn test_spectrum_file_holds_sky_subtracted_flux() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.txt");
        let spectrum = Spectrum::new(
            vec![5000.0, 5001.5],
            ExtractionResult {
                flux: vec![30.0, 40.0],
                sky: vec![10.0, 5.0],
                flux_err: vec![2.0, 3.0],
            },
        )
        .unwrap();
        write_spectrum(&path, &spectrum).unwrap();
        let back = read_spectrum(&path).unwrap();
        assert_eq!(back.wavelength, spectrum.wavelength);
        assert_eq!(back.flux, vec![20.0, 35.0]);
        assert_eq!(back.flux_err, spectrum.flux_err);
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = read_line_list("/nonexistent/lines.dat").unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read line list"));
    }
}
