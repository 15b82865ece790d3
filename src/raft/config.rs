use super::{Index, ServerId};
use crate::encoding;

use serde_derive::{Deserialize, Serialize};
use std::collections::HashSet;

/// A cluster member: a server id and its transport endpoints as a
/// comma-separated address list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: ServerId,
    pub addresses: String,
}

/// A single set of voting members.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimpleConfiguration {
    pub members: Vec<Member>,
}

impl SimpleConfiguration {
    /// Creates a configuration from the given members.
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    /// Iterates over the member ids.
    pub fn ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.members.iter().map(|m| m.id)
    }

    /// Whether the given server is a member.
    pub fn contains(&self, id: ServerId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// The quorum size (strict majority).
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Whether the given servers form a quorum.
    pub fn has_quorum(&self, ids: &HashSet<ServerId>) -> bool {
        self.ids().filter(|id| ids.contains(id)).count() >= self.quorum_size()
    }

    /// Returns the quorum value of the members as given by f: the largest
    /// value v such that at least a quorum of members have a value ≥ v.
    pub fn quorum_value<T: Ord + Copy>(&self, f: impl Fn(ServerId) -> T) -> T {
        assert!(!self.members.is_empty(), "empty configuration");
        let mut values: Vec<T> = self.ids().map(f).collect();
        let quorum = self.quorum_size();
        *values.select_nth_unstable_by(quorum - 1, |a, b| a.cmp(b).reverse()).1
    }
}

/// A membership configuration, carried in Configuration log entries. A
/// transitional configuration is the joint-consensus stage of a membership
/// change: any decision requires a quorum in both the old and new sets.
///
/// Configurations take effect as soon as they are appended to the log,
/// regardless of commit status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Configuration {
    Simple(SimpleConfiguration),
    Transitional { old: SimpleConfiguration, new: SimpleConfiguration },
}

impl encoding::Value for Configuration {}

impl Configuration {
    /// The member sets whose quorums decide elections and commits.
    pub fn groups(&self) -> Vec<&SimpleConfiguration> {
        match self {
            Configuration::Simple(members) => vec![members],
            Configuration::Transitional { old, new } => vec![old, new],
        }
    }

    /// All members, deduplicated by id.
    pub fn members(&self) -> Vec<&Member> {
        let mut seen = HashSet::new();
        self.groups()
            .into_iter()
            .flat_map(|g| g.members.iter())
            .filter(|m| seen.insert(m.id))
            .collect()
    }

    /// Whether the given server is a member of any set.
    pub fn contains(&self, id: ServerId) -> bool {
        self.groups().iter().any(|g| g.contains(id))
    }

    /// Whether the given servers form a quorum in every set.
    pub fn has_quorum(&self, ids: &HashSet<ServerId>) -> bool {
        self.groups().iter().all(|g| g.has_quorum(ids))
    }

    /// Returns the joint quorum value as given by f: the minimum of each
    /// set's quorum value, i.e. the largest value every set has quorum for.
    pub fn quorum_value<T: Ord + Copy>(&self, f: impl Fn(ServerId) -> T) -> T {
        self.groups().iter().map(|g| g.quorum_value(&f)).min().expect("empty configuration")
    }
}

/// The configurations currently described by the log: the snapshot's base
/// configuration plus every Configuration entry, in index order. The engine
/// keeps this in sync with the log and derives the active and stable views
/// from it.
#[derive(Clone, Debug, Default)]
pub(super) struct Configs {
    /// (index, configuration) pairs, ascending by index.
    entries: Vec<(Index, Configuration)>,
}

impl Configs {
    /// Rebuilds the view from a snapshot base and a scan of configuration
    /// entries in the log.
    pub fn new(
        base: Option<(Index, Configuration)>,
        entries: Vec<(Index, Configuration)>,
    ) -> Self {
        let mut all = Vec::new();
        if let Some(base) = base {
            all.push(base);
        }
        for (index, config) in entries {
            assert!(all.last().map(|(i, _)| *i < index).unwrap_or(true), "config order");
            all.push((index, config));
        }
        Self { entries: all }
    }

    /// The active configuration: the latest one at any index.
    pub fn active(&self) -> Option<&(Index, Configuration)> {
        self.entries.last()
    }

    /// The stable configuration: the latest committed simple one, with its
    /// index (the configuration id).
    pub fn stable(&self, commit_index: Index) -> Option<(Index, &SimpleConfiguration)> {
        self.entries
            .iter()
            .rev()
            .filter(|(index, _)| *index <= commit_index)
            .find_map(|(index, config)| match config {
                Configuration::Simple(members) => Some((*index, members)),
                Configuration::Transitional { .. } => None,
            })
    }

    /// The latest configuration at or below the given index, e.g. for a
    /// snapshot header.
    pub fn at(&self, index: Index) -> Option<&(Index, Configuration)> {
        self.entries.iter().rev().find(|(i, _)| *i <= index)
    }

    /// Records a newly appended configuration entry.
    pub fn push(&mut self, index: Index, config: Configuration) {
        assert!(self.entries.last().map(|(i, _)| *i < index).unwrap_or(true), "config order");
        self.entries.push((index, config));
    }

    /// Drops configuration entries above the given index, after log
    /// truncation. Never drops the snapshot base.
    pub fn truncate(&mut self, last_index: Index) {
        self.entries.retain(|(index, _)| *index <= last_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn members(ids: &[ServerId]) -> SimpleConfiguration {
        SimpleConfiguration::new(
            ids.iter().map(|id| Member { id: *id, addresses: format!("127.0.0.1:{id}") }).collect(),
        )
    }

    #[test_case(&[1] => 1)]
    #[test_case(&[1, 2] => 2)]
    #[test_case(&[1, 2, 3] => 2)]
    #[test_case(&[1, 2, 3, 4] => 3)]
    #[test_case(&[1, 2, 3, 4, 5] => 3)]
    fn quorum_size(ids: &[ServerId]) -> usize {
        members(ids).quorum_size()
    }

    #[test_case(&[1, 2, 3], &[1] => false)]
    #[test_case(&[1, 2, 3], &[1, 3] => true)]
    #[test_case(&[1, 2, 3], &[4, 5] => false)]
    #[test_case(&[1], &[1] => true)]
    fn simple_has_quorum(ids: &[ServerId], votes: &[ServerId]) -> bool {
        members(ids).has_quorum(&votes.iter().copied().collect())
    }

    /// A transitional configuration requires quorums in both sets.
    #[test]
    fn transitional_has_quorum() {
        let config = Configuration::Transitional {
            old: members(&[1, 2, 3]),
            new: members(&[3, 4, 5]),
        };
        // Quorum in old only.
        assert!(!config.has_quorum(&[1, 2].into_iter().collect()));
        // Quorum in new only.
        assert!(!config.has_quorum(&[4, 5].into_iter().collect()));
        // Quorum in both.
        assert!(config.has_quorum(&[2, 3, 4].into_iter().collect()));
        assert!(config.has_quorum(&[1, 2, 3, 4, 5].into_iter().collect()));
    }

    #[test_case(&[1, 2, 3], &[(1, 5), (2, 3), (3, 1)] => 3)]
    #[test_case(&[1, 2, 3], &[(1, 5), (2, 0), (3, 0)] => 0)]
    #[test_case(&[1], &[(1, 7)] => 7)]
    #[test_case(&[1, 2, 3, 4, 5], &[(1, 9), (2, 8), (3, 7), (4, 1), (5, 0)] => 7)]
    fn quorum_value(ids: &[ServerId], values: &[(ServerId, u64)]) -> u64 {
        let values: std::collections::HashMap<ServerId, u64> = values.iter().copied().collect();
        members(ids).quorum_value(|id| values[&id])
    }

    /// The joint quorum value is the minimum across both sets.
    #[test]
    fn transitional_quorum_value() {
        let config = Configuration::Transitional {
            old: members(&[1, 2, 3]),
            new: members(&[4, 5, 6]),
        };
        let values: std::collections::HashMap<ServerId, u64> =
            [(1, 9), (2, 9), (3, 9), (4, 2), (5, 1), (6, 0)].into_iter().collect();
        assert_eq!(config.quorum_value(|id| values[&id]), 1);
    }

    /// Active and stable views over a sequence of configuration entries.
    #[test]
    fn configs_views() {
        let simple1 = Configuration::Simple(members(&[1]));
        let joint = Configuration::Transitional { old: members(&[1]), new: members(&[1, 2]) };
        let simple2 = Configuration::Simple(members(&[1, 2]));

        let mut configs = Configs::new(None, vec![(1, simple1.clone())]);
        assert_eq!(configs.active(), Some(&(1, simple1.clone())));
        assert_eq!(configs.stable(0), None);
        assert_eq!(configs.stable(1).map(|(i, _)| i), Some(1));

        configs.push(5, joint.clone());
        assert_eq!(configs.active(), Some(&(5, joint.clone())));
        // The transitional entry is active but never stable.
        assert_eq!(configs.stable(5).map(|(i, _)| i), Some(1));

        configs.push(7, simple2.clone());
        assert_eq!(configs.stable(6).map(|(i, _)| i), Some(1));
        assert_eq!(configs.stable(7).map(|(i, _)| i), Some(7));
        assert_eq!(configs.at(6), Some(&(5, joint.clone())));

        // Truncation falls back to the previous configuration.
        configs.truncate(6);
        assert_eq!(configs.active(), Some(&(5, joint)));
    }
}
