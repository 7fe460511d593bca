//! Federated matching of pseudonymized records across sites.
//!
//! The matcher only ever sees record Bloom filters, never plaintext
//! identities. Two filters built with the same study configuration from the
//! same underlying person overlap in most positions; the matcher scores that
//! overlap with the Dice coefficient and groups filters whose score clears a
//! threshold into one matched person. The distinct count of a cohort is the
//! number of matched persons.
//!
//! Matching is deterministic for fixed inputs: the largest site's records
//! seed the matched set, the remaining sites are folded in input order, and
//! within a site records are matched in row order.

use crate::{bloomfilter::RecordBloomFilter, OrganizationIdentifier};

/// The default score above which two records are considered the same person.
pub const DEFAULT_POSITIVE_MATCH_THRESHOLD: f64 = 0.8;

/// One site's pseudonymized record, as visible to the trusted third party.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LinkageRecord {
    pub organization: OrganizationIdentifier,
    pub filter: RecordBloomFilter,
}

impl LinkageRecord {
    pub fn new(organization: impl Into<OrganizationIdentifier>, filter: RecordBloomFilter) -> Self {
        Self {
            organization: organization.into(),
            filter,
        }
    }

    /// The Dice coefficient of the two filters' set bits.
    pub fn similarity(&self, other: &Self) -> f64 {
        let ones = self.filter.bits().count_ones() + other.filter.bits().count_ones();
        if ones == 0 {
            return 0.0;
        }
        let intersection = self.filter.bits().intersection_count(other.filter.bits());
        2.0 * intersection as f64 / ones as f64
    }
}

/// How a candidate record is scored against the members already grouped into
/// a matched person.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MatchStrategy {
    /// Score against the first member.
    First,
    /// Score against the most recently added member.
    Last,
    /// The best member score.
    Max,
    /// The worst member score.
    Min,
    /// The average member score.
    Average,
}

impl MatchStrategy {
    fn score(self, members: &[LinkageRecord], candidate: &LinkageRecord) -> f64 {
        debug_assert!(!members.is_empty(), "matched person without members");
        match self {
            MatchStrategy::First => members[0].similarity(candidate),
            MatchStrategy::Last => members[members.len() - 1].similarity(candidate),
            MatchStrategy::Max => members
                .iter()
                .map(|member| member.similarity(candidate))
                .fold(f64::MIN, f64::max),
            MatchStrategy::Min => members
                .iter()
                .map(|member| member.similarity(candidate))
                .fold(f64::MAX, f64::min),
            MatchStrategy::Average => {
                members
                    .iter()
                    .map(|member| member.similarity(candidate))
                    .sum::<f64>()
                    / members.len() as f64
            }
        }
    }
}

/// A group of records across sites considered to be one physical person.
#[derive(Clone, Debug)]
pub struct MatchedPerson {
    members: Vec<LinkageRecord>,
}

impl MatchedPerson {
    fn new(record: LinkageRecord) -> Self {
        Self {
            members: vec![record],
        }
    }

    fn add(&mut self, record: LinkageRecord) {
        self.members.push(record);
    }

    pub fn members(&self) -> &[LinkageRecord] {
        &self.members
    }
}

/// Matches record Bloom filters from multiple sites into distinct persons.
///
/// Expects records to be unique within a site; duplicates across sites are
/// the signal this matcher exists to find.
#[derive(Clone, Copy, Debug)]
pub struct FederatedMatcher {
    strategy: MatchStrategy,
    threshold: f64,
}

impl Default for FederatedMatcher {
    fn default() -> Self {
        Self {
            strategy: MatchStrategy::Min,
            threshold: DEFAULT_POSITIVE_MATCH_THRESHOLD,
        }
    }
}

impl FederatedMatcher {
    pub fn new(strategy: MatchStrategy, threshold: f64) -> Self {
        Self {
            strategy,
            threshold,
        }
    }

    /// Matches one site list of records against all others.
    ///
    /// Returns one [`MatchedPerson`] per distinct person; an empty input
    /// yields an empty output, a single site's records are returned
    /// unmatched.
    pub fn match_records(&self, mut site_lists: Vec<Vec<LinkageRecord>>) -> Vec<MatchedPerson> {
        if site_lists.is_empty() {
            return Vec::new();
        }
        if site_lists.len() == 1 {
            return site_lists
                .remove(0)
                .into_iter()
                .map(MatchedPerson::new)
                .collect();
        }

        // the largest list seeds the matched set; on ties the first wins so
        // that results stay reproducible
        let largest = site_lists
            .iter()
            .enumerate()
            .max_by(|(a_idx, a), (b_idx, b)| a.len().cmp(&b.len()).then(b_idx.cmp(a_idx)))
            .map(|(index, _)| index)
            .unwrap_or(0);
        let seed_list = site_lists.remove(largest);

        let mut matched: Vec<MatchedPerson> = seed_list.into_iter().map(MatchedPerson::new).collect();
        for site_list in site_lists {
            for record in site_list {
                self.match_one(record, &mut matched);
            }
        }
        matched
    }

    fn match_one(&self, record: LinkageRecord, matched: &mut Vec<MatchedPerson>) {
        let mut best: Option<(usize, f64)> = None;
        for (index, person) in matched.iter().enumerate() {
            let score = self.strategy.score(person.members(), &record);
            if score < self.threshold {
                continue;
            }
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((index, score)),
            }
        }
        match best {
            Some((index, _)) => matched[index].add(record),
            None => matched.push(MatchedPerson::new(record)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloomfilter::{
        BloomFilterConfig,
        FieldLengths,
        FieldWeights,
        IdentityRecord,
        RecordBloomFilterGenerator,
        DEFAULT_RECORD_FILTER_LENGTH,
    };

    /// Identity data derived from a seed: equal seeds give equal records,
    /// different seeds differ in every field.
    fn patient(seed: &str) -> IdentityRecord {
        IdentityRecord {
            first_name: format!("first-{}", seed),
            last_name: format!("last-{}", seed),
            birthday: format!("birthday-{}", seed),
            sex: format!("sex-{}", seed),
            street: format!("street-{}", seed),
            zip_code: format!("zip-{}", seed),
            city: format!("city-{}", seed),
            country: format!("country-{}", seed),
            insurance_number: format!("insurance-{}", seed),
        }
    }

    fn generator(config: &BloomFilterConfig) -> RecordBloomFilterGenerator<
        crate::bloomfilter::HmacSha256HmacSha512Hasher,
    > {
        RecordBloomFilterGenerator::from_config(
            config,
            DEFAULT_RECORD_FILTER_LENGTH,
            FieldWeights::default(),
            FieldLengths::default(),
        )
    }

    #[test]
    fn test_identical_records_across_two_sites_link_to_one_person() {
        let config = BloomFilterConfig::generate();
        let site_a = generator(&config);
        let site_b = generator(&config);

        let person = patient("erika-mueller");
        let records_a = vec![LinkageRecord::new("Site/A", site_a.generate(&person))];
        let records_b = vec![LinkageRecord::new("Site/B", site_b.generate(&person))];

        let matched = FederatedMatcher::default().match_records(vec![records_a, records_b]);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].members().len(), 2);
    }

    #[test]
    fn test_distinct_persons_stay_distinct() {
        let config = BloomFilterConfig::generate();
        let site_a = generator(&config);
        let site_b = generator(&config);

        let records_a = vec![LinkageRecord::new(
            "Site/A",
            site_a.generate(&patient("erika-mueller")),
        )];
        let records_b = vec![LinkageRecord::new(
            "Site/B",
            site_b.generate(&patient("friedrich-schulze")),
        )];

        let matched = FederatedMatcher::default().match_records(vec![records_a, records_b]);
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_duplicates_across_three_sites_are_deduplicated() {
        let config = BloomFilterConfig::generate();

        let shared_one = patient("erika-mueller");
        let shared_two = patient("hans-meier");

        let mut lists = Vec::new();
        for &(site, unique_prefix) in [("Site/A", "a"), ("Site/B", "b"), ("Site/C", "c")].iter() {
            let generator = generator(&config);
            let mut records: Vec<LinkageRecord> = (0..8)
                .map(|index| {
                    let unique = patient(&format!("{}-{}", unique_prefix, index));
                    LinkageRecord::new(site, generator.generate(&unique))
                })
                .collect();
            // two persons exist at two sites each
            if site != "Site/C" {
                records.push(LinkageRecord::new(site, generator.generate(&shared_one)));
            }
            if site != "Site/A" {
                records.push(LinkageRecord::new(site, generator.generate(&shared_two)));
            }
            lists.push(records);
        }

        // 28 records, 2 persons present at two sites each: 26 distinct
        let matched = FederatedMatcher::default().match_records(lists);
        assert_eq!(matched.len(), 26);
    }

    #[test]
    fn test_single_site_is_returned_unmatched() {
        let config = BloomFilterConfig::generate();
        let site = generator(&config);
        let records = vec![
            LinkageRecord::new("Site/A", site.generate(&patient("erika-mueller"))),
            LinkageRecord::new("Site/A", site.generate(&patient("hans-meier"))),
        ];
        let matched = FederatedMatcher::default().match_records(vec![records]);
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_empty_input_yields_empty_output() {
        assert!(FederatedMatcher::default()
            .match_records(Vec::new())
            .is_empty());
    }
}
