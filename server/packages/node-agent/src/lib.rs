//! Node agent: authenticated command channel, script execution and PTY sessions.

pub mod agent;
pub mod agent_logs;
pub mod auth;
pub mod cli;
pub mod config;
pub mod executor;
pub mod policy;
pub mod protocol;
pub mod pty;
pub mod report;
pub mod router;
pub mod transport;
