//! Parsers for the NCBI taxdump flat files (`nodes.dmp`, `names.dmp`).
//!
//! Fields are separated by `\t|\t` and lines end with `\t|`. For
//! example:
//! ```text
//! 9606\t|\t9605\t|\tspecies\t|\t...
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub type ParentMap = AHashMap<u32, u32>;
pub type RankMap = AHashMap<u32, String>;
pub type NameMap = AHashMap<u32, String>;

/// Splits one taxdump row into its fields.
fn split_dmp_line(line: &str) -> Vec<&str> {
    line.trim_end_matches("\t|").split("\t|\t").collect()
}

/// The slim per-taxon view of `nodes.dmp`: parent links and ranks.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SlimTaxonTable {
    pub parents: ParentMap,
    pub ranks: RankMap,
}

impl SlimTaxonTable {
    pub fn contains(&self, taxid: u32) -> bool {
        self.parents.contains_key(&taxid)
    }

    pub fn rank(&self, taxid: u32) -> Option<&str> {
        self.ranks.get(&taxid).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Translation table ids for a taxon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneticCodes {
    pub genetic_code_id: u32,
    pub mitochondrial_genetic_code_id: u32,
}

/// The full per-taxon view of `nodes.dmp`, exposing the genetic-code
/// columns the slim table drops.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FullTaxonTable {
    codes: AHashMap<u32, GeneticCodes>,
}

impl FullTaxonTable {
    pub fn genetic_codes(&self, taxid: u32) -> Option<GeneticCodes> {
        self.codes.get(&taxid).copied()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }
}

/// Per-taxon name lookups built from `names.dmp`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NameTable {
    pub scientific: NameMap,
    pub common: NameMap,
    pub authority: NameMap,
    /// Lowercased scientific name text -> taxids, in file order.
    pub binomial_index: AHashMap<String, Vec<u32>>,
}

/// Parses `nodes.dmp` into the slim table.
///
/// Expects at least 3 fields per row: taxid, parent taxid, rank.
/// Malformed rows are skipped.
pub fn parse_nodes_slim<P: AsRef<Path>>(filepath: P) -> Result<SlimTaxonTable> {
    let file = File::open(filepath)?;
    let reader = BufReader::new(file);

    let mut table = SlimTaxonTable::default();

    for line_result in reader.lines() {
        let line = line_result?;
        let parts = split_dmp_line(&line);
        if parts.len() < 3 {
            continue;
        }

        let taxid: u32 = parts[0].trim().parse().unwrap_or(0);
        let parentid: u32 = parts[1].trim().parse().unwrap_or(0);
        let rank = parts[2].trim();

        if taxid != 0 {
            table.parents.insert(taxid, parentid);
            table.ranks.insert(taxid, rank.to_string());
        }
    }
    Ok(table)
}

/// Parses `nodes.dmp` again for the genetic-code columns (fields 6
/// and 8).
pub fn parse_nodes_full<P: AsRef<Path>>(filepath: P) -> Result<FullTaxonTable> {
    let file = File::open(filepath)?;
    let reader = BufReader::new(file);

    let mut table = FullTaxonTable::default();

    for line_result in reader.lines() {
        let line = line_result?;
        let parts = split_dmp_line(&line);
        if parts.len() < 9 {
            continue;
        }

        let taxid: u32 = parts[0].trim().parse().unwrap_or(0);
        let genetic_code_id: u32 = parts[6].trim().parse().unwrap_or(0);
        let mitochondrial_genetic_code_id: u32 = parts[8].trim().parse().unwrap_or(0);

        if taxid != 0 {
            table.codes.insert(
                taxid,
                GeneticCodes {
                    genetic_code_id,
                    mitochondrial_genetic_code_id,
                },
            );
        }
    }
    Ok(table)
}

/// Parses `names.dmp` into the name lookups.
///
/// A taxon has at most one scientific name. The common-name lookup
/// prefers `genbank common name` over `common name` when both exist.
pub fn parse_names<P: AsRef<Path>>(filepath: P) -> Result<NameTable> {
    let file = File::open(filepath)?;
    let reader = BufReader::new(file);

    let mut table = NameTable::default();
    let mut genbank_common: NameMap = AHashMap::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let parts = split_dmp_line(&line);
        if parts.len() < 4 {
            continue;
        }

        let taxid: u32 = parts[0].trim().parse().unwrap_or(0);
        if taxid == 0 {
            continue;
        }
        let name_txt = parts[1].trim();
        let name_class = parts[3].trim();

        match name_class {
            "scientific name" => {
                table
                    .binomial_index
                    .entry(name_txt.to_lowercase())
                    .or_default()
                    .push(taxid);
                table.scientific.insert(taxid, name_txt.to_string());
            }
            "genbank common name" => {
                genbank_common.insert(taxid, name_txt.to_string());
            }
            "common name" => {
                table.common.entry(taxid).or_insert_with(|| name_txt.to_string());
            }
            "authority" => {
                table.authority.insert(taxid, name_txt.to_string());
            }
            _ => {}
        }
    }

    // genbank common names override plain common names
    for (taxid, name) in genbank_common {
        table.common.insert(taxid, name);
    }

    Ok(table)
}
