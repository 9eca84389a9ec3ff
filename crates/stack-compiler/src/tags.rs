//! Cross-cutting labels, applied once over a finished deployment.

use std::collections::BTreeMap;

use common::ResourceId;

use crate::plan::Deployment;

pub type Tags = BTreeMap<String, String>;
pub type TagSet = BTreeMap<ResourceId, Tags>;

const NAME_KEY: &str = "Name";
const MANAGED_BY_KEY: &str = "ManagedBy";
const MANAGED_BY: &str = "stackc";

/// Label every resource of `deployment` with `tags`.
///
/// Each resource also gets `Name` (its id, unless `tags` sets one) and
/// `ManagedBy`, which always wins.
pub fn decorate(deployment: &Deployment, tags: &Tags) -> TagSet {
    deployment
        .resource_ids()
        .into_iter()
        .map(|id| {
            let mut labels = tags.clone();
            labels
                .entry(NAME_KEY.to_string())
                .or_insert_with(|| id.to_string());
            labels.insert(MANAGED_BY_KEY.to_string(), MANAGED_BY.to_string());
            (id, labels)
        })
        .collect()
}
