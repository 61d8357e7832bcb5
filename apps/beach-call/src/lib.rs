pub mod api;
pub mod config;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod tests;
