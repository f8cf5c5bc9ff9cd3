//! Availability-zone placement for one instance group.
//!
//! Existing instances in AZs the group still lists are kept, balanced
//! across zones, up to the desired count. New instances go to whichever
//! zone currently holds the fewest, ties broken by manifest order.

use std::collections::{BTreeMap, BTreeSet};

use director_state::Instance;
use tracing::debug;

/// Where one desired instance lands.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    /// Existing instance being kept, `None` for a new one.
    pub existing: Option<Instance>,
    pub index: u32,
    pub az: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupPlacement {
    pub placements: Vec<Placement>,
    /// Existing instances no longer wanted.
    pub obsolete: Vec<Instance>,
}

pub fn place(azs: &[String], desired: u32, mut existing: Vec<Instance>) -> GroupPlacement {
    existing.sort_by_key(|i| i.index);
    let zones: Vec<Option<String>> = if azs.is_empty() {
        vec![None]
    } else {
        azs.iter().cloned().map(Some).collect()
    };

    let mut per_zone: BTreeMap<Option<String>, u32> = zones.iter().map(|z| (z.clone(), 0)).collect();
    let (mut candidates, mut obsolete): (Vec<Instance>, Vec<Instance>) =
        existing.into_iter().partition(|i| per_zone.contains_key(&i.az));

    let mut placements = Vec::new();
    while (placements.len() as u32) < desired && !candidates.is_empty() {
        let mut best = 0;
        for (pos, candidate) in candidates.iter().enumerate() {
            if per_zone[&candidate.az] < per_zone[&candidates[best].az] {
                best = pos;
            }
        }
        let kept = candidates.remove(best);
        if let Some(count) = per_zone.get_mut(&kept.az) {
            *count += 1;
        }
        placements.push(Placement {
            index: kept.index,
            az: kept.az.clone(),
            existing: Some(kept),
        });
    }
    obsolete.extend(candidates);

    let mut used: BTreeSet<u32> = placements.iter().map(|p| p.index).collect();
    used.extend(obsolete.iter().map(|i| i.index));
    let mut next_index = 0;
    while (placements.len() as u32) < desired {
        while used.contains(&next_index) {
            next_index += 1;
        }
        used.insert(next_index);

        let mut zone = &zones[0];
        for candidate in &zones {
            if per_zone[candidate] < per_zone[zone] {
                zone = candidate;
            }
        }
        if let Some(count) = per_zone.get_mut(zone) {
            *count += 1;
        }
        debug!(index = next_index, az = ?zone, "placing new instance");
        placements.push(Placement {
            existing: None,
            index: next_index,
            az: zone.clone(),
        });
    }

    placements.sort_by_key(|p| p.index);
    GroupPlacement { placements, obsolete }
}

#[cfg(test)]
mod tests {
    use super::*;
    use director_core::InstanceState;
    use serde_json::json;

    fn instance(index: u32, az: Option<&str>) -> Instance {
        Instance {
            uuid: format!("uuid-{index}"),
            deployment: "dep".into(),
            job: "dea".into(),
            index,
            state: InstanceState::Started,
            az: az.map(str::to_string),
            spec: json!({}),
            variable_set_id: None,
            bootstrap: index == 0,
            resurrection_paused: false,
            ignore: false,
            created_at: 0,
        }
    }

    fn zones(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn grows_without_touching_existing_instances() {
        let existing = vec![instance(0, Some("z1")), instance(1, Some("z2")), instance(2, Some("z1"))];
        let placed = place(&zones(&["z1", "z2"]), 5, existing);
        assert!(placed.obsolete.is_empty());
        assert_eq!(placed.placements.iter().filter(|p| p.existing.is_none()).count(), 2);
        let azs: Vec<_> = placed.placements.iter().map(|p| p.az.as_deref().unwrap()).collect();
        assert_eq!(azs, vec!["z1", "z2", "z1", "z2", "z1"]);
        let indexes: Vec<u32> = placed.placements.iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn shrinking_keeps_zones_balanced() {
        let existing = vec![
            instance(0, Some("z1")),
            instance(1, Some("z1")),
            instance(2, Some("z1")),
            instance(3, Some("z2")),
        ];
        let placed = place(&zones(&["z1", "z2"]), 2, existing);
        let kept: Vec<u32> = placed.placements.iter().map(|p| p.index).collect();
        assert_eq!(kept, vec![0, 3]);
        let gone: Vec<u32> = placed.obsolete.iter().map(|i| i.index).collect();
        assert_eq!(gone, vec![1, 2]);
    }

    #[test]
    fn instances_in_removed_zones_are_obsolete() {
        let existing = vec![instance(0, Some("z1")), instance(1, Some("z3"))];
        let placed = place(&zones(&["z1", "z2"]), 2, existing);
        assert_eq!(placed.obsolete.len(), 1);
        assert_eq!(placed.obsolete[0].index, 1);
        let new = placed.placements.iter().find(|p| p.existing.is_none()).unwrap();
        assert_eq!(new.az.as_deref(), Some("z2"));
        assert_eq!(new.index, 2);
    }

    #[test]
    fn groups_without_zones() {
        let placed = place(&[], 2, vec![instance(0, None)]);
        assert_eq!(placed.placements.len(), 2);
        assert!(placed.placements.iter().all(|p| p.az.is_none()));
    }
}
