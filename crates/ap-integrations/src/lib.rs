//! Issue-tracker integrations. Linear is the only tracker today: a GraphQL
//! client implementing [`ap_core::tracker::IssueTracker`] and the mapping
//! from Linear webhook payloads to queue tasks.

pub mod linear;
