pub mod dedup;
pub mod dispatcher;
pub mod journal;
pub mod maintenance;
pub mod pipeline;
pub mod position_monitor;
pub mod rules;
pub mod sizing;
pub mod stealth;

#[cfg(test)]
mod maintenance_tests;
#[cfg(test)]
mod stealth_tests;
