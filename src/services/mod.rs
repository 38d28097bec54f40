pub mod comfy;
pub mod composition;
pub mod executor;
pub mod memorial_card;
pub mod orchestrator;
pub mod recovery;
pub mod script;
pub mod transform;
pub mod worker;
