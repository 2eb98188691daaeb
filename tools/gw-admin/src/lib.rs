//! GW-Admin: Stream Gateway administration
//!
//! Declares the platform streams, inspects their state, publishes ad-hoc
//! events and pull-subscribes for debugging.
//!
//! ```text
//! gw-admin streams setup | list | info <name> | delete <name> --yes
//! gw-admin publish <subject> <json>
//! gw-admin subscribe <pattern>
//! gw-admin check
//! ```

pub mod commands;
pub mod format;
