//! Resolution of organization references to known identifiers.

use fedquery_core::{study::OrganizationRef, OrganizationIdentifier};

/// Resolves the organization references listed in a study definition.
///
/// Upstream validation is expected to have rejected studies referencing
/// unknown organizations, so an unresolvable reference at batch time is
/// treated as a programming-invariant violation, not a user error.
pub trait OrganizationProvider {
    /// The identifier the given reference resolves to, if it is known.
    fn resolve(&self, reference: &OrganizationRef) -> Option<OrganizationIdentifier>;

    /// The identifier of the organization this engine runs at.
    fn local_identifier(&self) -> OrganizationIdentifier;
}
