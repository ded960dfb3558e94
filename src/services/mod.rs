pub mod context;
pub mod isolator;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod sampling;
pub mod setup;
pub mod source;
pub mod workflow;
