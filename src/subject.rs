//! Schedulable game objects and the narrow collaborator interfaces the
//! schedulers call into.

/// World object identifier, unique among live objects
pub type ObjectId = u32;

/// Anything that can sit in a scheduler
pub trait Subject: Send + Sync + 'static {
    fn object_id(&self) -> ObjectId;
}

/// Behavior controller attached to a creature
pub trait AiController: Send + Sync {
    /// Re-evaluate intentions
    fn think(&self);

    /// The owner reached the end of its movement path
    fn notify_arrived(&self);
}
