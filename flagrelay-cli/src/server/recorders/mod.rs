pub mod events;
pub mod impressions;
pub mod telemetry;
