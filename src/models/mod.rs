pub mod composition;
pub mod events;
pub mod game_result;
pub mod job;
