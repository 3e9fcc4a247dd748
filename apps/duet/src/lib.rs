pub mod call;
pub mod channel;
pub mod config;
pub mod content;
pub mod game;
pub mod media;
pub mod participant;
pub mod persistence;
pub mod presence;
pub mod supervisor;
pub mod telemetry;
pub mod timers;

pub use participant::{spawn, Command, Event, ParticipantConfig, ParticipantHandle, Services};
