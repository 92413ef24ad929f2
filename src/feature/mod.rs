pub mod aws;
pub mod discovery;
pub mod emitter;
pub mod notes;
pub mod release;
pub mod retrieval;
pub mod scanner;

#[cfg(test)]
mod fake;
