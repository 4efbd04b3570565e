use fetchq_core::OwnerId;

/// Owner context for a request.
///
/// Supplied by the upstream identity layer and immutable for the request's
/// lifetime. Must be present for all job routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    owner_id: OwnerId,
}

impl OwnerContext {
    pub fn new(owner_id: OwnerId) -> Self {
        Self { owner_id }
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }
}
