// End-to-end HTTP test suite for the relay, organized by feature area.
// All modules share common::test_client for app lifecycle management.

mod common;

mod agents;
mod auth;
mod groups;
mod messages;
mod system;
