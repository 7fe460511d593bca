use std::collections::HashMap;

use tracing::Span;

use crate::{
    settings::LinkageSettings,
    state_machine::{
        events::DispatchOrder,
        tests::utils::*,
        BatchInitializer,
    },
};
use fedquery_core::{
    bloomfilter::{IdentityRecord, RecordBloomFilterGenerator},
    result::{Column, ResultSet, SiteResult},
    study::Cohort,
    translation::{self, EHR_ID_COLUMN},
    OrganizationIdentifier,
};

const QUERY: &str = "select count(e/ehr_id/value) from ehr e";
const ID_QUERY: &str = "select e/ehr_id/value as EHRID from ehr e";

/// Builds the identifier result set a site's repository would return.
fn id_result_set(patient_count: usize) -> ResultSet {
    ResultSet::new(
        vec![Column::new(EHR_ID_COLUMN, "/ehr_id/value")],
        (0..patient_count).map(|id| vec![id.to_string()]).collect(),
    )
}

/// Maps sequential identifiers to the given patients.
fn identity_map(patients: &[IdentityRecord]) -> HashMap<String, IdentityRecord> {
    patients
        .iter()
        .enumerate()
        .map(|(id, patient)| (id.to_string(), patient.clone()))
        .collect()
}

/// Pseudonymizes a remote site's patients with the dispatched secrets, the
/// way the site-side engine would before submitting.
fn pseudonymized_results(
    order: &DispatchOrder,
    linkage: &LinkageSettings,
    patients: &[IdentityRecord],
) -> Vec<SiteResult> {
    let config = order
        .bloom_filter_config
        .as_ref()
        .expect("no linkage secrets dispatched");
    let generator = RecordBloomFilterGenerator::from_config(
        config,
        linkage.record_filter_length,
        linkage.field_weights,
        linkage.field_lengths,
    );
    let resolver = StubIdentities(identity_map(patients));
    let (translated, dropped) =
        translation::pseudonymize(&id_result_set(patients.len()), &generator, &resolver).unwrap();
    assert!(dropped.is_empty());

    order
        .queries
        .iter()
        .map(|(cohort_id, _)| {
            SiteResult::rows(order.organization.clone(), cohort_id.clone(), translated.clone())
        })
        .collect()
}

fn unique_patients(prefix: &str, count: usize) -> Vec<IdentityRecord> {
    (0..count)
        .map(|index| identity(&format!("{}-{}", prefix, index)))
        .collect()
}

#[tokio::test]
async fn test_identifier_batch_yields_deduplicated_distinct_count() {
    enable_logging();

    let shared_one = identity("erika-mueller");
    let shared_two = identity("hans-meier");

    // 10 patients per site; one person exists at sites a and b, another at
    // sites b and c: 30 records, 28 distinct persons
    let mut patients_a = unique_patients("a", 9);
    patients_a.push(shared_one.clone());
    let mut patients_b = unique_patients("b", 8);
    patients_b.push(shared_one);
    patients_b.push(shared_two.clone());
    let mut patients_c = unique_patients("c", 9);
    patients_c.push(shared_two);

    let study = study(
        vec![Cohort::new("Group/link", QUERY)],
        &["a", "b", "c"],
        true,
    );
    let services = services(
        StubOrganizations::with_local("a"),
        StubRepository::with_rows(vec![(ID_QUERY.to_string(), id_result_set(10))]),
        Some(StubIdentities(identity_map(&patients_a))),
    );

    let (state_machine, request_tx, subscriber) =
        BatchInitializer::new(batch_settings(), linkage_settings(), study, services)
            .init()
            .unwrap();
    let handle = tokio::spawn(state_machine.run());

    let dispatch = await_dispatch(&subscriber).await;
    assert_eq!(
        dispatch.ttp.as_ref().map(|ttp| ttp.organization.clone()),
        Some(OrganizationIdentifier::from("ttp")),
    );
    // the count projection was rewritten before dispatch
    assert_eq!(dispatch.orders[0].queries[0].1, ID_QUERY);

    for &(site, patients) in &[("b", &patients_b), ("c", &patients_c)] {
        let order = dispatch
            .orders
            .iter()
            .find(|order| order.organization == OrganizationIdentifier::from(site))
            .unwrap();
        request_tx
            .record(
                order.correlation_key,
                pseudonymized_results(order, &linkage_settings(), patients),
                Span::none(),
            )
            .await
            .unwrap();
    }

    handle.await.unwrap();
    let outcome = await_outcome(&subscriber).await;

    assert!(!outcome.hard_failure);
    assert_eq!(outcome.cohorts.len(), 1);
    assert_eq!(outcome.cohorts[0].participant_count, 3);
    assert_eq!(outcome.cohorts[0].value, 28);
}

#[tokio::test]
async fn test_record_linkage_without_a_ttp_reference_fails_before_dispatch() {
    enable_logging();

    let mut study = study(
        vec![Cohort::new("Group/link", QUERY)],
        &["a", "b", "c"],
        true,
    );
    study.participating_ttp = None;

    let services = services(
        StubOrganizations::with_local("a"),
        StubRepository::default(),
        Some(StubIdentities(HashMap::new())),
    );

    let (state_machine, _request_tx, subscriber) =
        BatchInitializer::new(batch_settings(), linkage_settings(), study, services)
            .init()
            .unwrap();
    state_machine.run().await;

    let outcome = await_outcome(&subscriber).await;
    assert!(outcome.hard_failure);
    assert!(outcome
        .errors
        .iter()
        .any(|entry| entry.contains("no trusted third party")));
}

#[tokio::test]
async fn test_unresolvable_local_rows_are_dropped_with_an_audit_entry() {
    enable_logging();

    let patients_a = unique_patients("a", 3);
    let patients_b = unique_patients("b", 3);
    let patients_c = unique_patients("c", 3);

    // the local patient index knows only two of the three queried ids
    let mut local_identities = identity_map(&patients_a);
    local_identities.remove("2");

    let study = study(
        vec![Cohort::new("Group/link", QUERY)],
        &["a", "b", "c"],
        true,
    );
    let services = services(
        StubOrganizations::with_local("a"),
        StubRepository::with_rows(vec![(ID_QUERY.to_string(), id_result_set(3))]),
        Some(StubIdentities(local_identities)),
    );

    let (state_machine, request_tx, subscriber) =
        BatchInitializer::new(batch_settings(), linkage_settings(), study, services)
            .init()
            .unwrap();
    let handle = tokio::spawn(state_machine.run());

    let dispatch = await_dispatch(&subscriber).await;
    for &(site, patients) in &[("b", &patients_b), ("c", &patients_c)] {
        let order = dispatch
            .orders
            .iter()
            .find(|order| order.organization == OrganizationIdentifier::from(site))
            .unwrap();
        request_tx
            .record(
                order.correlation_key,
                pseudonymized_results(order, &linkage_settings(), patients),
                Span::none(),
            )
            .await
            .unwrap();
    }

    handle.await.unwrap();
    let outcome = await_outcome(&subscriber).await;

    // 2 + 3 + 3 all-distinct records survive
    assert!(!outcome.hard_failure);
    assert_eq!(outcome.cohorts[0].participant_count, 3);
    assert_eq!(outcome.cohorts[0].value, 8);
    assert!(outcome
        .errors
        .iter()
        .any(|entry| entry.contains("pseudonymization")));
}
