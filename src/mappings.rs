//! Readers for the taxid -> dataset assignment tables.
//!
//! The BUSCO placement file is two-column text with a header row,
//! shipped gzipped or as a `.tar.gz` archive; the Augustus table is a
//! plain two-column TSV. Iteration order of a [`DatasetMapping`] is
//! file order, which is the documented tie-break order for the
//! nearest-node search.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use indexmap::IndexMap;
use tar::Archive;

use crate::errors::{Error, Result};

pub type DatasetMapping = IndexMap<u32, String>;

/// Lines of every regular, non-hidden member of a gzipped tarball.
fn tar_member_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let mut archive = Archive::new(MultiGzDecoder::new(file));

    let mut lines = Vec::new();
    let mut members = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let hidden = {
            let member_path = entry.path()?;
            member_path
                .file_name()
                .map_or(true, |n| n.to_string_lossy().starts_with('.'))
        };
        if hidden {
            continue;
        }
        members += 1;
        let mut text = Vec::new();
        entry.read_to_end(&mut text)?;
        lines.extend(
            String::from_utf8_lossy(&text)
                .lines()
                .map(str::to_string),
        );
    }

    if members == 0 {
        return Err(Error::EmptyArchive(path.to_path_buf()));
    }
    Ok(lines)
}

/// Lines of a gzipped text file, or of a `.tar.gz`/`.tgz` archive's
/// members. Any line with an embedded NUL byte is a fatal
/// malformed-input error.
fn read_compressed_lines(path: &Path) -> Result<Vec<String>> {
    let name = path.to_string_lossy();
    let lines = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        tar_member_lines(path)?
    } else {
        let file = File::open(path)?;
        let reader = BufReader::new(MultiGzDecoder::new(file));
        reader.lines().collect::<std::io::Result<Vec<String>>>()?
    };

    for (i, line) in lines.iter().enumerate() {
        if line.contains('\0') {
            return Err(Error::NullBytes {
                path: path.to_path_buf(),
                line: i + 1,
            });
        }
    }
    Ok(lines)
}

/// Splits a mapping row into taxid and dataset name.
fn parse_mapping_row(path: &Path, lineno: usize, line: &str) -> Result<(u32, String)> {
    let malformed = |reason: &str| Error::MalformedLine {
        path: path.to_path_buf(),
        line: lineno,
        reason: reason.to_string(),
    };

    let mut parts = line.splitn(2, char::is_whitespace);
    let taxid = parts
        .next()
        .and_then(|t| t.parse::<u32>().ok())
        .ok_or_else(|| malformed("expected a numeric taxid"))?;
    let dataset = parts
        .next()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| malformed("expected a dataset name"))?;

    Ok((taxid, dataset.to_string()))
}

fn collect_mapping(
    path: &Path,
    lines: impl IntoIterator<Item = String>,
    skip_header: bool,
) -> Result<DatasetMapping> {
    let mut mapping = DatasetMapping::new();
    for (i, line) in lines.into_iter().enumerate() {
        if skip_header && i == 0 {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (taxid, dataset) = parse_mapping_row(path, i + 1, trimmed)?;
        mapping.insert(taxid, dataset);
    }
    log::debug!("{mapping:?}");
    Ok(mapping)
}

/// Reads the BUSCO placement file (compressed, header row skipped).
pub fn read_busco_mapping<P: AsRef<Path>>(path: P) -> Result<DatasetMapping> {
    let path = path.as_ref();
    let lines = read_compressed_lines(path)?;
    collect_mapping(path, lines, true)
}

/// Reads the Augustus dataset table (plain two-column text, no header).
pub fn read_augustus_mapping<P: AsRef<Path>>(path: P) -> Result<DatasetMapping> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let lines = reader.lines().collect::<std::io::Result<Vec<String>>>()?;
    collect_mapping(path, lines, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_gz(path: &Path, text: &str) {
        let file = File::create(path).unwrap();
        let mut gz = GzEncoder::new(file, Compression::default());
        gz.write_all(text.as_bytes()).unwrap();
        gz.finish().unwrap();
    }

    fn write_tar_gz(path: &Path, member: &str, text: &str) {
        let file = File::create(path).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut tar = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_size(text.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, member, text.as_bytes())
            .unwrap();
        tar.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn augustus_mapping_keeps_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("augustus.tsv");
        std::fs::write(&path, "7227\tfly\n9606\thuman\n4932\tsaccharomyces\n").unwrap();

        let mapping = read_augustus_mapping(&path).unwrap();
        let keys: Vec<u32> = mapping.keys().copied().collect();
        assert_eq!(keys, vec![7227, 9606, 4932]);
        assert_eq!(mapping.get(&9606).unwrap(), "human");
    }

    #[test]
    fn busco_mapping_skips_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placements.txt.gz");
        write_gz(&path, "taxid\tdataset\n7227\tdiptera_odb10\n50557\tinsecta_odb10\n");

        let mapping = read_busco_mapping(&path).unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.get(&7227).unwrap(), "diptera_odb10");
    }

    #[test]
    fn busco_mapping_reads_tarball_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placements.tar.gz");
        write_tar_gz(
            &path,
            "mapping_taxids.txt",
            "taxid\tdataset\n33208\tmetazoa_odb10\n",
        );

        let mapping = read_busco_mapping(&path).unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get(&33208).unwrap(), "metazoa_odb10");
    }

    #[test]
    fn null_bytes_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placements.txt.gz");
        write_gz(&path, "taxid\tdataset\n7227\tdip\0tera\n");

        match read_busco_mapping(&path) {
            Err(Error::NullBytes { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected NullBytes, got {other:?}"),
        }
    }

    #[test]
    fn malformed_rows_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("augustus.tsv");
        std::fs::write(&path, "7227\n").unwrap();

        assert!(matches!(
            read_augustus_mapping(&path),
            Err(Error::MalformedLine { line: 1, .. })
        ));
    }
}
