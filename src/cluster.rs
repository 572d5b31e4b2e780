//! Grouping of register addresses into contiguous read spans.

use crate::catalog::Catalog;
use crate::modbus::MAX_SAFE_READ_COUNT;
use crate::registers::{RegisterDescriptor, RegisterKey};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub struct ClusterMember {
    pub address: u16,
    /// Word offset of this register from the start of the cluster.
    pub offset: u16,
    pub descriptor: Arc<RegisterDescriptor>,
}

/// A contiguous span of registers fetched in a single round trip.
#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    pub start: u16,
    pub length: u16,
    pub members: Vec<ClusterMember>,
}

impl Cluster {
    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.length)
    }
}

pub struct ClusterPlanner {
    catalog: Arc<Catalog>,
    max_span: u16,
    cache: HashMap<Box<[u16]>, Arc<[Cluster]>>,
}

impl ClusterPlanner {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self::with_max_span(catalog, MAX_SAFE_READ_COUNT)
    }

    pub fn with_max_span(catalog: Arc<Catalog>, max_span: u16) -> Self {
        Self {
            catalog,
            max_span: max_span.max(1),
            cache: HashMap::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Plan the read spans for `keys`.
    ///
    /// Pseudo-registers are ignored. Touching or overlapping registers share a span unless that
    /// would make the span longer than a single request may read; any gap starts a new span.
    /// Results are memoized by the sorted address list.
    pub fn plan(&mut self, keys: &[RegisterKey]) -> Arc<[Cluster]> {
        let mut addresses = keys
            .iter()
            .filter_map(|k| match k {
                RegisterKey::Address(a) => Some(*a),
                RegisterKey::Derived(_) => None,
            })
            .collect::<Vec<_>>();
        addresses.sort_unstable();
        addresses.dedup();
        if let Some(clusters) = self.cache.get(addresses.as_slice()) {
            return Arc::clone(clusters);
        }
        let clusters: Arc<[Cluster]> = self.generate(&addresses).into();
        tracing::debug!(
            addresses = addresses.len(),
            clusters = clusters.len(),
            "planned register clusters"
        );
        self.cache
            .insert(addresses.into_boxed_slice(), Arc::clone(&clusters));
        clusters
    }

    fn generate(&self, addresses: &[u16]) -> Vec<Cluster> {
        let mut clusters = Vec::<Cluster>::new();
        for &address in addresses {
            let Some(descriptor) = self.catalog.by_address(address) else {
                tracing::warn!(register.address = address, "unknown register, skipping");
                continue;
            };
            let length = descriptor.length.max(1);
            let end = u32::from(address) + u32::from(length);
            if let Some(current) = clusters.last_mut() {
                let merged_end = end.max(current.end());
                if u32::from(address) <= current.end()
                    && merged_end - u32::from(current.start) <= u32::from(self.max_span)
                {
                    current.length = (merged_end - u32::from(current.start)) as u16;
                    current.members.push(ClusterMember {
                        address,
                        offset: address - current.start,
                        descriptor: Arc::clone(descriptor),
                    });
                    continue;
                }
            }
            clusters.push(Cluster {
                start: address,
                length,
                members: vec![ClusterMember {
                    address,
                    offset: 0,
                    descriptor: Arc::clone(descriptor),
                }],
            });
        }
        clusters
    }

    pub fn cached_plans(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived::Derived;
    use crate::registers::{FieldType, RegisterGroup};

    fn catalog(entries: &[(u16, Option<FieldType>, u16)]) -> Arc<Catalog> {
        let catalog = Catalog::new(entries.iter().map(|&(address, ty, length)| {
            (
                RegisterKey::Address(address),
                RegisterDescriptor::new(&format!("r{address}"), ty, length),
            )
        }));
        Arc::new(catalog.expect("valid catalog"))
    }

    fn addresses(keys: &[u16]) -> Vec<RegisterKey> {
        keys.iter().copied().map(RegisterKey::Address).collect()
    }

    fn spans(clusters: &[Cluster]) -> Vec<(u16, u16, Vec<u16>)> {
        clusters
            .iter()
            .map(|c| (c.start, c.length, c.members.iter().map(|m| m.address).collect()))
            .collect()
    }

    #[test]
    fn gaps_split_clusters() {
        let catalog = catalog(&[
            (100, Some(FieldType::U32), 2),
            (102, Some(FieldType::U16), 1),
            (110, Some(FieldType::U16), 1),
        ]);
        let mut planner = ClusterPlanner::new(catalog);
        let clusters = planner.plan(&addresses(&[110, 102, 100]));
        assert_eq!(
            spans(&clusters),
            vec![(100, 3, vec![100, 102]), (110, 1, vec![110])]
        );
        assert_eq!(clusters[0].members[1].offset, 2);
    }

    #[test]
    fn fillers_bridge_spans() {
        let catalog = catalog(&[
            (10, Some(FieldType::U16), 1),
            (11, None, 2),
            (13, Some(FieldType::I32), 2),
        ]);
        let mut planner = ClusterPlanner::new(catalog);
        let clusters = planner.plan(&addresses(&[10, 11, 13]));
        assert_eq!(spans(&clusters), vec![(10, 5, vec![10, 11, 13])]);
        assert_eq!(clusters[0].length, clusters[0].members.iter().map(|m| m.descriptor.length).sum::<u16>());
    }

    #[test]
    fn pseudo_registers_and_unknown_addresses_are_skipped() {
        let catalog = catalog(&[(1, Some(FieldType::U16), 1)]);
        let mut planner = ClusterPlanner::new(catalog);
        let mut keys = addresses(&[1, 2]);
        keys.push(RegisterKey::Derived(Derived::Consumption));
        assert_eq!(spans(&planner.plan(&keys)), vec![(1, 1, vec![1])]);
        assert!(planner.plan(&[]).is_empty());
    }

    #[test]
    fn span_cap_splits_contiguous_runs() {
        let catalog = catalog(&[
            (0, Some(FieldType::U32), 2),
            (2, Some(FieldType::U32), 2),
            (4, Some(FieldType::U32), 2),
        ]);
        let mut planner = ClusterPlanner::with_max_span(catalog, 4);
        let clusters = planner.plan(&addresses(&[0, 2, 4]));
        assert_eq!(spans(&clusters), vec![(0, 4, vec![0, 2]), (4, 2, vec![4])]);
    }

    #[test]
    fn plans_are_memoized_by_address_set() {
        let catalog = catalog(&[(1, Some(FieldType::U16), 1), (5, Some(FieldType::U16), 1)]);
        let mut planner = ClusterPlanner::new(catalog);
        let first = planner.plan(&addresses(&[5, 1]));
        let second = planner.plan(&addresses(&[1, 5, 5]));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(planner.cached_plans(), 1);
        planner.plan(&addresses(&[1]));
        assert_eq!(planner.cached_plans(), 2);
    }

    #[test]
    fn builtin_groups_plan_into_ordered_disjoint_spans() {
        let catalog = Arc::new(Catalog::builtin());
        let mut planner = ClusterPlanner::new(Arc::clone(&catalog));
        for group in <RegisterGroup as strum::VariantArray>::VARIANTS {
            let clusters = planner.plan(&catalog.group_keys(*group));
            for pair in clusters.windows(2) {
                assert!(pair[0].end() < u32::from(pair[1].start), "{group}: {pair:?}");
            }
            for cluster in clusters.iter() {
                assert!(cluster.length <= MAX_SAFE_READ_COUNT);
                for member in &cluster.members {
                    assert!(member.offset + member.descriptor.length <= cluster.length);
                }
            }
        }
        let backup = planner.plan(&catalog.group_keys(RegisterGroup::Backup));
        assert_eq!(backup.len(), 1);
        assert_eq!((backup[0].start, backup[0].length), (30230, 18));
    }
}
