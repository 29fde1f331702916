pub mod normalizer;
pub mod records;
pub mod serializer;
pub mod turn;
pub mod worker;

pub use serializer::UserSerializer;
pub use turn::{TurnError, TurnOrchestrator, TurnOutcome};
pub use worker::{OutputQueue, OutputTask, OutputWorker, SubmitError};
