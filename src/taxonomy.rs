//! The assembled taxonomy reference: taxon tables, name lookups, the
//! tree, and both dataset mappings, built once through the cache and
//! read-only afterwards.

use std::path::Path;

use serde::Serialize;

use crate::cache::{file_digest, FileCache};
use crate::errors::{Error, Result};
use crate::mappings::{read_augustus_mapping, read_busco_mapping, DatasetMapping};
use crate::taxdump::{
    parse_names, parse_nodes_full, parse_nodes_slim, FullTaxonTable, GeneticCodes, NameTable,
    SlimTaxonTable,
};
use crate::tree::TaxonomyTree;

/// Per-query dataset assignment plus genetic codes.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetLookup {
    pub busco_dataset_name: Option<String>,
    pub augustus_dataset_name: Option<String>,
    pub genetic_code_id: u32,
    pub mitochondrial_genetic_code_id: u32,
}

pub struct Taxonomy {
    slim: SlimTaxonTable,
    full: FullTaxonTable,
    names: NameTable,
    tree: TaxonomyTree,
    resolve_to_rank: String,
    accepted_ranks: Vec<String>,
    busco_mapping: DatasetMapping,
    augustus_mapping: DatasetMapping,
    augustus_tree: TaxonomyTree,
    augustus_leaf_names: Vec<String>,
}

impl Taxonomy {
    /// Loads all reference data, reusing cached artifacts whose source
    /// digests are unchanged. Must complete before records are resolved
    /// concurrently; afterwards the taxonomy is read-only.
    pub fn load(
        nodes_file: &Path,
        names_file: &Path,
        busco_file: &Path,
        augustus_file: &Path,
        cache: &FileCache,
        resolve_to_rank: &str,
    ) -> Result<Self> {
        log::info!("Reading NCBI taxonomy from {}", nodes_file.display());
        let nodes_digest = file_digest(nodes_file)?;
        let (slim, slim_rebuilt) =
            cache.fetch_or_build_keyed("nodes_slim", &nodes_digest, || {
                parse_nodes_slim(nodes_file)
            })?;
        let (full, _) = cache.fetch_or_build_keyed("nodes_full", &nodes_digest, || {
            parse_nodes_full(nodes_file)
        })?;

        log::info!("Reading NCBI taxon names from {}", names_file.display());
        let names_digest = file_digest(names_file)?;
        let (names, names_rebuilt) =
            cache.fetch_or_build_keyed("names", &names_digest, || parse_names(names_file))?;

        // either source changing invalidates the tree
        let tree_digest = format!("{nodes_digest}:{names_digest}");
        let build_tree = || {
            log::info!("Generating taxonomy tree");
            TaxonomyTree::from_slim(&slim)
        };
        let (tree, tree_rebuilt) = if slim_rebuilt || names_rebuilt {
            cache.rebuild_keyed("tree", &tree_digest, build_tree)?
        } else {
            cache.fetch_or_build_keyed("tree", &tree_digest, build_tree)?
        };

        log::info!("Traversing the tree for rank information");
        let accepted_ranks = tree.ranks_at_or_below(resolve_to_rank);
        log::debug!("Accepted ranks including and below {resolve_to_rank}: {accepted_ranks:?}");

        log::info!("Reading BUSCO dataset mapping from {}", busco_file.display());
        let busco_mapping = read_busco_mapping(busco_file)?;
        log::info!(
            "    ... found {} datasets in BUSCO mapping file",
            busco_mapping.len()
        );

        log::info!(
            "Reading Augustus dataset mapping from {}",
            augustus_file.display()
        );
        let augustus_mapping = read_augustus_mapping(augustus_file)?;
        log::info!(
            "    ... found {} datasets in Augustus mapping file",
            augustus_mapping.len()
        );

        let augustus_digest = format!("{tree_digest}:{}", file_digest(augustus_file)?);
        let mapped_taxids: Vec<u32> = augustus_mapping.keys().copied().collect();
        let build_subtree = || {
            log::info!("Pruning tree for Augustus datasets");
            let before = tree.count();
            let pruned = tree.shear_to(&mapped_taxids);
            log::debug!("    ... NCBI tree had {before} nodes.");
            log::debug!("    ... Removed {} nodes.", before - pruned.count());
            log::debug!("    ... Augustus tree has {} nodes.", pruned.count());
            let leaf_names = pruned.leaf_names();
            Ok((pruned, leaf_names))
        };
        let ((augustus_tree, augustus_leaf_names), _) = if tree_rebuilt {
            cache.rebuild_keyed("augustus_tree", &augustus_digest, build_subtree)?
        } else {
            cache.fetch_or_build_keyed("augustus_tree", &augustus_digest, build_subtree)?
        };

        Ok(Self {
            slim,
            full,
            names,
            tree,
            resolve_to_rank: resolve_to_rank.to_string(),
            accepted_ranks,
            busco_mapping,
            augustus_mapping,
            augustus_tree,
            augustus_leaf_names,
        })
    }

    pub fn resolve_to_rank(&self) -> &str {
        &self.resolve_to_rank
    }

    pub fn accepted_ranks(&self) -> &[String] {
        &self.accepted_ranks
    }

    pub fn is_accepted_rank(&self, rank: &str) -> bool {
        self.accepted_ranks
            .binary_search_by(|r| r.as_str().cmp(rank))
            .is_ok()
    }

    pub fn augustus_leaf_names(&self) -> &[String] {
        &self.augustus_leaf_names
    }

    pub fn contains_taxid(&self, taxid: u32) -> bool {
        self.slim.contains(taxid)
    }

    pub fn rank(&self, taxid: u32) -> Option<&str> {
        self.slim.rank(taxid)
    }

    pub fn scientific_name(&self, taxid: u32) -> Option<&str> {
        self.names.scientific.get(&taxid).map(String::as_str)
    }

    pub fn common_name(&self, taxid: u32) -> Option<&str> {
        self.names.common.get(&taxid).map(String::as_str)
    }

    pub fn authority(&self, taxid: u32) -> Option<&str> {
        self.names.authority.get(&taxid).map(String::as_str)
    }

    /// Translation table ids for a taxid already known to the caller.
    /// Unknown ids are a hard not-found error, no fallback.
    pub fn genetic_codes(&self, taxid: u32) -> Result<GeneticCodes> {
        self.full
            .genetic_codes(taxid)
            .ok_or(Error::TaxidNotFound(taxid))
    }

    /// Exact, case-insensitive binomial search. Returns a taxid only
    /// when exactly one candidate sits at an accepted rank.
    pub fn search_by_binomial_name(&self, genus: &str, species: &str) -> Option<u32> {
        let search_string = format!("{genus} {species}");
        log::debug!("Searching for {search_string}");

        let Some(candidates) = self.names.binomial_index.get(&search_string.to_lowercase())
        else {
            log::debug!("No results found for {search_string}");
            return None;
        };

        let accepted: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|&taxid| {
                self.rank(taxid)
                    .is_some_and(|rank| self.is_accepted_rank(rank))
            })
            .collect();

        if accepted.len() == 1 {
            Some(accepted[0])
        } else {
            log::debug!("Didn't find a single taxid for {search_string}: {accepted:?}");
            None
        }
    }

    /// Ancestor taxids of `taxid`, nearest-first up to the root.
    pub fn ancestor_taxids(&self, taxid: u32) -> Vec<u32> {
        log::debug!("Looking up ancestors for taxid {taxid}");
        self.tree.ancestor_taxids(taxid)
    }

    /// Root-first `"; "`-joined lineage of scientific names, dropping
    /// unnamed taxa and the literal root placeholder.
    pub fn taxonomy_string(&self, ancestor_taxids: &[u32]) -> Option<String> {
        let names: Vec<&str> = ancestor_taxids
            .iter()
            .filter_map(|&taxid| self.scientific_name(taxid))
            .filter(|name| *name != "root")
            .collect();

        if names.is_empty() {
            None
        } else {
            let root_first: Vec<&str> = names.into_iter().rev().collect();
            Some(root_first.join("; "))
        }
    }

    /// Scans the chain nearest-first for the family and order names.
    /// The scan stops as soon as an order is recorded, so a family
    /// farther out than the order is not reported.
    pub fn order_and_family(
        &self,
        ancestor_taxids: &[u32],
    ) -> (Option<String>, Option<String>) {
        let mut order = None;
        let mut family = None;

        for &taxid in ancestor_taxids {
            match self.rank(taxid) {
                Some("family") => family = self.scientific_name(taxid).map(str::to_string),
                Some("order") => order = self.scientific_name(taxid).map(str::to_string),
                _ => {}
            }
            if order.is_some() {
                break;
            }
        }

        (order, family)
    }

    /// Nearest mapped ancestor in the BUSCO table, query taxon
    /// included.
    pub fn busco_lineage(&self, taxid: u32, ancestor_taxids: &[u32]) -> Option<&str> {
        log::debug!("Looking up BUSCO dataset name for taxid {taxid}");
        std::iter::once(taxid)
            .chain(ancestor_taxids.iter().copied())
            .find_map(|t| self.busco_mapping.get(&t).map(String::as_str))
    }

    /// Nearest mapped node in the pruned Augustus tree by topological
    /// distance from the anchor (the first of query + ancestors present
    /// in the subtree). Equidistant candidates resolve to the one
    /// earliest in the mapping file.
    pub fn augustus_lineage(&self, taxid: u32, ancestor_taxids: &[u32]) -> Option<&str> {
        log::debug!("Looking up Augustus dataset name for taxid {taxid}");

        let anchor = std::iter::once(taxid)
            .chain(ancestor_taxids.iter().copied())
            .find_map(|t| self.augustus_tree.find(t))?;
        log::debug!(
            "Found closest node in Augustus tree: {}",
            self.augustus_tree.node(anchor).name
        );

        let mut closest: Option<(&str, u32)> = None;
        for (&mapped, dataset) in &self.augustus_mapping {
            let Some(dest) = self.augustus_tree.find(mapped) else {
                log::debug!("{mapped} not in Augustus tree");
                continue;
            };
            let dist = self.augustus_tree.distance(anchor, dest);
            log::debug!("    ... distance to {mapped} is {dist}");
            if closest.map_or(true, |(_, best)| dist < best) {
                closest = Some((dataset.as_str(), dist));
            }
        }

        closest.map(|(dataset, _)| dataset)
    }

    /// Combined per-query lookup: both dataset names plus the genetic
    /// codes. Fails when the taxid is not in the taxonomy.
    pub fn lookup_datasets(&self, taxid: u32) -> Result<DatasetLookup> {
        let codes = self.genetic_codes(taxid)?;
        let chain = self.ancestor_taxids(taxid);
        Ok(DatasetLookup {
            busco_dataset_name: self.busco_lineage(taxid, &chain).map(str::to_string),
            augustus_dataset_name: self.augustus_lineage(taxid, &chain).map(str::to_string),
            genetic_code_id: codes.genetic_code_id,
            mitochondrial_genetic_code_id: codes.mitochondrial_genetic_code_id,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;

    fn dmp_node(taxid: u32, parent: u32, rank: &str, gc: u32, mito: u32) -> String {
        format!(
            "{taxid}\t|\t{parent}\t|\t{rank}\t|\t\t|\t8\t|\t0\t|\t{gc}\t|\t0\t|\t{mito}\t|\t0\t|\t0\t|\t0\t|\t\t|"
        )
    }

    fn dmp_name(taxid: u32, text: &str, class: &str) -> String {
        format!("{taxid}\t|\t{text}\t|\t\t|\t{class}\t|")
    }

    /// Small reference set:
    /// 1 root -> 2 Primates (order) -> 3 Hominidae (family) -> 4 Homo sapiens (species)
    ///                                                         -> 5 H. s. ssp. (subspecies)
    ///                              -> 6 Felidae (family) -> 7 Felis catus (species)
    ///        -> 8 (class, off the mapped branches)
    pub(crate) fn write_reference(dir: &Path) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
        let nodes = dir.join("nodes.dmp");
        let mut f = File::create(&nodes).unwrap();
        for row in [
            dmp_node(1, 1, "no rank", 1, 0),
            dmp_node(2, 1, "order", 1, 2),
            dmp_node(3, 2, "family", 1, 2),
            dmp_node(4, 3, "species", 1, 5),
            dmp_node(5, 4, "subspecies", 1, 5),
            dmp_node(6, 2, "family", 1, 2),
            dmp_node(7, 6, "species", 1, 4),
            dmp_node(8, 1, "class", 1, 0),
        ] {
            writeln!(f, "{row}").unwrap();
        }

        let names = dir.join("names.dmp");
        let mut f = File::create(&names).unwrap();
        for row in [
            dmp_name(1, "root", "scientific name"),
            dmp_name(2, "Primates", "scientific name"),
            dmp_name(3, "Hominidae", "scientific name"),
            dmp_name(4, "Homo sapiens", "scientific name"),
            dmp_name(4, "human", "genbank common name"),
            dmp_name(4, "Homo sapiens Linnaeus, 1758", "authority"),
            dmp_name(5, "Homo sapiens neanderthalensis", "scientific name"),
            dmp_name(6, "Felidae", "scientific name"),
            dmp_name(7, "Felis catus", "scientific name"),
            dmp_name(7, "cat", "common name"),
        ] {
            writeln!(f, "{row}").unwrap();
        }

        let busco = dir.join("placements.txt.gz");
        let file = File::create(&busco).unwrap();
        let mut gz = GzEncoder::new(file, Compression::default());
        gz.write_all(b"taxid\tdataset\n3\tfamily_odb10\n2\torder_odb10\n")
            .unwrap();
        gz.finish().unwrap();

        let augustus = dir.join("augustus.tsv");
        std::fs::write(&augustus, "3\thominidae_ds\n6\tfelidae_ds\n").unwrap();

        (nodes, names, busco, augustus)
    }

    pub(crate) fn load(dir: &Path) -> Taxonomy {
        let (nodes, names, busco, augustus) = write_reference(dir);
        let cache = FileCache::open(dir.join("cache")).unwrap();
        Taxonomy::load(&nodes, &names, &busco, &augustus, &cache, "species").unwrap()
    }
}
