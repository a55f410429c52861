//! Resolution of raw sample metadata to a taxon.
//!
//! Works through four stages per record: identity check against the
//! taxonomy, free-text binomial fallback, subspecies classification,
//! and lineage/grouping. The resolver accumulates into a private draft
//! and hands back an immutable [`OrganismRecord`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::taxonomy::Taxonomy;

/// Strips a string down to alphanumerics and single spaces.
pub fn sanitise_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        } else if ch.is_whitespace() {
            pending_space = true;
        }
    }
    out
}

/// Collapses every non-alphanumeric run to a single underscore.
pub fn squash_to_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Tokens that mean "no information provided", compared
/// case-insensitively. A missing field is treated the same way.
#[derive(Debug, Clone)]
pub struct NullValues {
    tokens: Vec<String>,
}

impl Default for NullValues {
    fn default() -> Self {
        Self::new(&["", "NA", "N/A", "NAN", "NONE", "NULL", "UNKNOWN"])
    }
}

impl NullValues {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_uppercase()).collect(),
        }
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        match value {
            None => true,
            Some(v) => {
                let upper = v.trim().to_uppercase();
                self.tokens.iter().any(|t| *t == upper)
            }
        }
    }
}

/// Splits free text into (genus, species), or `None` when the text is
/// a null token, does not split into exactly two parts, or either part
/// is a null token.
pub fn split_scientific_name(raw: &str, null_values: &NullValues) -> Option<(String, String)> {
    let name = sanitise_string(raw);
    if null_values.matches(Some(name.as_str())) {
        log::debug!("{name} matched null_values");
        return None;
    }

    let parts: Vec<&str> = name.split(' ').collect();
    if parts.len() != 2 {
        log::debug!("Length of {parts:?} is not 2");
        return None;
    }
    if parts.iter().any(|part| null_values.matches(Some(*part))) {
        log::debug!("A name part matched null_values");
        return None;
    }

    log::debug!("Parsed {parts:?} from {raw}");
    Some((parts[0].to_string(), parts[1].to_string()))
}

/// One raw input sample: an id plus free-form string fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: HashMap<String, String>,
}

impl RawRecord {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NameSource {
    Ncbi,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubspeciesSource {
    Ncbi,
    Parsed,
    None,
}

/// The resolved organism. Immutable once returned by the resolver.
#[derive(Debug, Clone, Serialize)]
pub struct OrganismRecord {
    pub record_id: String,
    pub taxon_id: Option<u32>,
    pub rank: Option<String>,
    pub scientific_name: Option<String>,
    pub scientific_name_source: NameSource,
    pub common_name: Option<String>,
    pub authority: Option<String>,
    pub has_taxid_at_accepted_level: bool,
    pub taxid_retrieved_from_metadata: bool,
    pub has_subspecies_information: bool,
    pub subspecies_source: SubspeciesSource,
    pub lineage_string: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub busco_dataset_name: Option<String>,
    pub augustus_dataset_name: Option<String>,
    pub grouping_key: Option<String>,
}

/// Deterministic cluster key for records sharing a resolved taxon.
pub fn grouping_key_for(scientific_name: &str, taxid: u32) -> String {
    format!("{}_{taxid}", squash_to_key(scientific_name))
}

struct Draft {
    record_id: String,
    taxon_id: Option<u32>,
    rank: Option<String>,
    scientific_name: Option<String>,
    scientific_name_source: NameSource,
    common_name: Option<String>,
    authority: Option<String>,
    has_taxid_at_accepted_level: bool,
    taxid_retrieved_from_metadata: bool,
    has_subspecies_information: bool,
    subspecies_source: SubspeciesSource,
    lineage_string: Option<String>,
    order: Option<String>,
    family: Option<String>,
    busco_dataset_name: Option<String>,
    augustus_dataset_name: Option<String>,
    grouping_key: Option<String>,
}

impl Draft {
    fn new(record_id: String) -> Self {
        Self {
            record_id,
            taxon_id: None,
            rank: None,
            scientific_name: None,
            scientific_name_source: NameSource::None,
            common_name: None,
            authority: None,
            has_taxid_at_accepted_level: false,
            taxid_retrieved_from_metadata: false,
            has_subspecies_information: false,
            subspecies_source: SubspeciesSource::None,
            lineage_string: None,
            order: None,
            family: None,
            busco_dataset_name: None,
            augustus_dataset_name: None,
            grouping_key: None,
        }
    }

    /// Identity check: adopt NCBI naming when the explicit taxid is a
    /// known taxon, clear everything otherwise.
    fn adopt_ncbi_identity(&mut self, taxonomy: &Taxonomy) {
        match self.taxon_id {
            Some(taxid) if taxonomy.contains_taxid(taxid) => {
                self.rank = taxonomy.rank(taxid).map(str::to_string);
                self.scientific_name = taxonomy.scientific_name(taxid).map(str::to_string);
                self.scientific_name_source = NameSource::Ncbi;
                self.common_name = taxonomy.common_name(taxid).map(str::to_string);
                self.authority = taxonomy.authority(taxid).map(str::to_string);
            }
            _ => {
                self.rank = None;
                self.scientific_name = None;
                self.scientific_name_source = NameSource::None;
                self.common_name = None;
                self.authority = None;
            }
        }

        self.has_taxid_at_accepted_level = self
            .rank
            .as_deref()
            .is_some_and(|rank| taxonomy.is_accepted_rank(rank));
    }

    /// Free-text fallback: try the scientific-name field, then the
    /// separate genus/species fields.
    fn search_metadata_for_species(
        &mut self,
        record: &RawRecord,
        taxonomy: &Taxonomy,
        null_values: &NullValues,
    ) {
        let raw_name = record.field("scientific_name").unwrap_or_default();
        log::debug!("Attempting to parse scientific name {raw_name}");

        let mut retrieved = split_scientific_name(raw_name, null_values)
            .and_then(|(genus, species)| taxonomy.search_by_binomial_name(&genus, &species));

        if retrieved.is_none() {
            let genus = sanitise_string(record.field("genus").unwrap_or_default());
            let species = sanitise_string(record.field("species").unwrap_or_default());
            if !null_values.matches(Some(genus.as_str()))
                && !null_values.matches(Some(species.as_str()))
            {
                log::debug!("Attempting separate genus {genus} and species {species}");
                retrieved = taxonomy.search_by_binomial_name(&genus, &species);
            }
        }

        match retrieved {
            Some(taxid) => {
                log::debug!("Found single taxid at accepted level {taxid}");
                self.taxon_id = Some(taxid);
                self.taxid_retrieved_from_metadata = true;
                self.adopt_ncbi_identity(taxonomy);
            }
            None => log::debug!(
                "Could not match metadata to taxid at accepted level for record {}",
                self.record_id
            ),
        }
    }

    /// Subspecies classification: taxids resolving below the target
    /// rank win; otherwise an infraspecific epithet records provenance
    /// only (the epithet text is never appended to a name).
    fn classify_subspecies(
        &mut self,
        record: &RawRecord,
        taxonomy: &Taxonomy,
        null_values: &NullValues,
    ) {
        if self.has_taxid_at_accepted_level
            && self.rank.as_deref() != Some(taxonomy.resolve_to_rank())
        {
            self.has_subspecies_information = true;
            self.subspecies_source = SubspeciesSource::Ncbi;
            return;
        }

        if !null_values.matches(record.field("infraspecific_epithet")) {
            self.has_subspecies_information = true;
            self.subspecies_source = SubspeciesSource::Parsed;
            return;
        }

        self.has_subspecies_information = false;
        self.subspecies_source = SubspeciesSource::None;
    }

    /// Lineage and grouping, only for reference-backed records at an
    /// accepted rank.
    fn attach_lineage(&mut self, taxonomy: &Taxonomy) {
        if !(self.has_taxid_at_accepted_level
            && self.scientific_name_source == NameSource::Ncbi)
        {
            self.grouping_key = None;
            return;
        }
        let Some(taxid) = self.taxon_id else {
            self.grouping_key = None;
            return;
        };

        let chain = taxonomy.ancestor_taxids(taxid);

        let tail = self.authority.clone().or_else(|| self.scientific_name.clone());
        self.lineage_string = match (taxonomy.taxonomy_string(&chain), tail) {
            (Some(lineage), Some(tail)) => Some(format!("{lineage}; {tail}")),
            (lineage, None) => lineage,
            (None, tail) => tail,
        };

        let (order, family) = taxonomy.order_and_family(&chain);
        self.order = order;
        self.family = family;

        self.busco_dataset_name = taxonomy.busco_lineage(taxid, &chain).map(str::to_string);
        log::debug!("Found BUSCO dataset {:?}", self.busco_dataset_name);
        self.augustus_dataset_name = taxonomy.augustus_lineage(taxid, &chain).map(str::to_string);
        log::debug!("Found Augustus dataset {:?}", self.augustus_dataset_name);

        self.grouping_key = self
            .scientific_name
            .as_deref()
            .map(|name| grouping_key_for(name, taxid));
    }

    fn finish(self) -> OrganismRecord {
        OrganismRecord {
            record_id: self.record_id,
            taxon_id: self.taxon_id,
            rank: self.rank,
            scientific_name: self.scientific_name,
            scientific_name_source: self.scientific_name_source,
            common_name: self.common_name,
            authority: self.authority,
            has_taxid_at_accepted_level: self.has_taxid_at_accepted_level,
            taxid_retrieved_from_metadata: self.taxid_retrieved_from_metadata,
            has_subspecies_information: self.has_subspecies_information,
            subspecies_source: self.subspecies_source,
            lineage_string: self.lineage_string,
            order: self.order,
            family: self.family,
            busco_dataset_name: self.busco_dataset_name,
            augustus_dataset_name: self.augustus_dataset_name,
            grouping_key: self.grouping_key,
        }
    }
}

/// Resolves one record against the taxonomy.
pub fn resolve_organism(
    record: &RawRecord,
    taxonomy: &Taxonomy,
    null_values: &NullValues,
) -> OrganismRecord {
    let mut draft = Draft::new(record.id.clone());

    draft.taxon_id = record
        .field("taxon_id")
        .and_then(|value| value.trim().parse().ok());
    draft.adopt_ncbi_identity(taxonomy);

    if draft.scientific_name.is_none() {
        draft.search_metadata_for_species(record, taxonomy, null_values);
    }

    draft.classify_subspecies(record, taxonomy, null_values);
    draft.attach_lineage(taxonomy);

    draft.finish()
}
