use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use tracing_subscriber::*;

use crate::{
    executor::{CohortRepository, RepositoryError},
    organizations::OrganizationProvider,
    settings::{BatchSettings, LinkageSettings},
    state_machine::{
        events::{DispatchSet, DispatchUpdate, EventSubscriber, OutcomeUpdate},
        batch::BatchOutcome,
        Services,
    },
};
use fedquery_core::{
    bloomfilter::IdentityRecord,
    result::ResultSet,
    study::{Cohort, OrganizationRef, StudyDefinition},
    translation::{IdentityResolver, TranslationError},
    OrganizationIdentifier,
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

/// An organization provider resolving `Organization/<name>` references to
/// `<name>` identifiers.
pub struct StubOrganizations {
    local: OrganizationIdentifier,
}

impl StubOrganizations {
    pub fn with_local(local: &str) -> Self {
        Self {
            local: OrganizationIdentifier::from(local),
        }
    }
}

impl OrganizationProvider for StubOrganizations {
    fn resolve(&self, reference: &OrganizationRef) -> Option<OrganizationIdentifier> {
        reference
            .as_str()
            .strip_prefix("Organization/")
            .map(OrganizationIdentifier::from)
    }

    fn local_identifier(&self) -> OrganizationIdentifier {
        self.local.clone()
    }
}

/// A repository answering from programmed per-query responses.
#[derive(Default)]
pub struct StubRepository {
    counts: HashMap<String, u64>,
    rows: HashMap<String, ResultSet>,
}

impl StubRepository {
    pub fn with_counts(counts: &[(&str, u64)]) -> Self {
        Self {
            counts: counts
                .iter()
                .map(|(query, count)| (query.to_string(), *count))
                .collect(),
            rows: HashMap::new(),
        }
    }

    pub fn with_rows(rows: Vec<(String, ResultSet)>) -> Self {
        Self {
            counts: HashMap::new(),
            rows: rows.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CohortRepository for StubRepository {
    async fn count(&self, query: &str) -> Result<u64, RepositoryError> {
        self.counts
            .get(query)
            .copied()
            .ok_or_else(|| RepositoryError::Unreachable("no such cohort".to_string()))
    }

    async fn rows(&self, query: &str) -> Result<ResultSet, RepositoryError> {
        self.rows
            .get(query)
            .cloned()
            .ok_or_else(|| RepositoryError::Unreachable("no such cohort".to_string()))
    }
}

/// A patient index answering from a programmed identifier map.
pub struct StubIdentities(pub HashMap<String, IdentityRecord>);

impl IdentityResolver for StubIdentities {
    fn resolve(&self, ehr_id: &str) -> Result<IdentityRecord, TranslationError> {
        self.0
            .get(ehr_id)
            .cloned()
            .ok_or_else(|| TranslationError::UnknownIdentity(ehr_id.to_string()))
    }
}

pub fn batch_settings() -> BatchSettings {
    BatchSettings::default()
}

pub fn linkage_settings() -> LinkageSettings {
    LinkageSettings::default()
}

pub fn study(cohorts: Vec<Cohort>, medics: &[&str], needs_record_linkage: bool) -> StudyDefinition {
    StudyDefinition {
        id: "ResearchStudy/test".to_string(),
        cohorts,
        participating_medics: medics
            .iter()
            .map(|name| OrganizationRef::new(format!("Organization/{}", name)))
            .collect(),
        participating_ttp: if needs_record_linkage {
            Some(OrganizationRef::new("Organization/ttp"))
        } else {
            None
        },
        needs_record_linkage,
    }
}

pub fn services(
    organizations: StubOrganizations,
    repository: StubRepository,
    identities: Option<StubIdentities>,
) -> Services {
    Services {
        organizations: Arc::new(organizations),
        repository: Arc::new(repository),
        identities: identities
            .map(|identities| Arc::new(identities) as Arc<dyn IdentityResolver + Send + Sync>),
    }
}

/// Waits for the batch's dispatch orders.
pub async fn await_dispatch(subscriber: &EventSubscriber) -> Arc<DispatchSet> {
    let mut listener = subscriber.dispatch_listener();
    if let DispatchUpdate::New(set) = listener.get_latest().event {
        return set;
    }
    loop {
        match listener.next().await.expect("event publisher dropped").event {
            DispatchUpdate::New(set) => return set,
            DispatchUpdate::Invalidate => continue,
        }
    }
}

/// Waits for the batch outcome.
pub async fn await_outcome(subscriber: &EventSubscriber) -> Arc<BatchOutcome> {
    let mut listener = subscriber.outcome_listener();
    if let OutcomeUpdate::New(outcome) = listener.get_latest().event {
        return outcome;
    }
    loop {
        match listener.next().await.expect("event publisher dropped").event {
            OutcomeUpdate::New(outcome) => return outcome,
            OutcomeUpdate::Invalidate => continue,
        }
    }
}

/// Identity data derived from a seed: equal seeds give equal records,
/// different seeds differ in every field.
pub fn identity(seed: &str) -> IdentityRecord {
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
