use uuid::Uuid;

/// Source of globally-unique opaque identifiers for graph entities.
pub trait IdentityGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// 128 random bits rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdentityGenerator for RandomIds {
    fn next_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}
