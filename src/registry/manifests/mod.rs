use crate::{error::RegistryError, manifests::Reference};

pub(crate) mod delete;
pub(crate) mod get;
pub(crate) mod head;
pub(crate) mod put;

/// Pull-side lookups treat a malformed reference as a missing manifest.
fn lookup_reference(reference: &str) -> Result<Reference, RegistryError> {
    reference
        .parse()
        .map_err(|_| RegistryError::ManifestNotFound {})
}
