use crate::error::ConstructionError;

/// Opens the storage handle for a table.
///
/// Called with the slot already claimed, so it is never invoked twice
/// concurrently for the same slot. Closing a handle for real is dropping it.
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    fn open(&self, name: &str) -> Result<Self::Resource, ConstructionError>;

    /// Bring a warm reader up to date before it is handed out again.
    fn refresh(&self, _name: &str, _resource: &mut Self::Resource) {}
}
