//! Inner join of listings and details on company id.

use std::collections::BTreeMap;

use bizreg_core::{CompanyDetail, CompanyId, CompanyListing, CompanyRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// One record per id present on both sides, in id order.
    pub records: Vec<CompanyRecord>,
    pub listings_without_detail: Vec<CompanyId>,
    pub details_without_listing: Vec<CompanyId>,
}

/// Joins the two tables and truncates agent and owner at their first line
/// break. When several details share an id, the last one in `details` wins.
pub fn merge_records(listings: &[CompanyListing], details: &[CompanyDetail]) -> MergeOutcome {
    let listings: BTreeMap<CompanyId, &CompanyListing> =
        listings.iter().map(|l| (l.id, l)).collect();
    let details: BTreeMap<CompanyId, &CompanyDetail> = details.iter().map(|d| (d.id, d)).collect();

    let mut outcome = MergeOutcome::default();
    for (id, listing) in &listings {
        match details.get(id) {
            Some(detail) => outcome.records.push(CompanyRecord {
                id: *id,
                name: listing.name.clone(),
                agent: detail.agent.first_line(),
                owner: detail.owner.first_line(),
            }),
            None => outcome.listings_without_detail.push(*id),
        }
    }
    outcome.details_without_listing = details
        .keys()
        .filter(|id| !listings.contains_key(id))
        .copied()
        .collect();
    outcome
}
