//! Shared test backend for skiff integration tests.
//!
//! [`MockProvisioner`] is an in-process stand-in for the provisioning
//! control plane: it stores resources in memory, walks them through their
//! state machines on a short timer, and delivers state-change events and
//! lifecycle webhooks to whatever subscriptions and webhooks are
//! registered, exactly like the real API does. Tests drive the ordinary
//! `skiff-client` surface against it.

mod copier;
mod server;
mod state;

pub use copier::FixtureFileCopier;
pub use server::MockProvisioner;
pub use state::MockOptions;

/// Multitenant database new installations are placed on.
pub const SOURCE_DB_ID: &str = "rds-multitenant-source01";
/// Second seeded multitenant database, free to migrate onto.
pub const DESTINATION_DB_ID: &str = "rds-multitenant-destination01";

/// A plausible bulk-export dump: 1 team, 2 channels, 2 users, 3 posts,
/// 1 direct channel, 2 direct posts.
pub const SAMPLE_EXPORT: &str = concat!(
    r#"{"type":"version","version":1}"#, "\n",
    r#"{"type":"team","name":"ops"}"#, "\n",
    r#"{"type":"channel","team":"ops","name":"town-square"}"#, "\n",
    r#"{"type":"channel","team":"ops","name":"incidents"}"#, "\n",
    r#"{"type":"user","username":"alice"}"#, "\n",
    r#"{"type":"user","username":"bob"}"#, "\n",
    r#"{"type":"post","channel":"town-square","message":"hello"}"#, "\n",
    r#"{"type":"post","channel":"town-square","message":"world"}"#, "\n",
    r#"{"type":"post","channel":"incidents","message":"all clear"}"#, "\n",
    r#"{"type":"direct_channel","members":["alice","bob"]}"#, "\n",
    r#"{"type":"direct_post","message":"psst"}"#, "\n",
    r#"{"type":"direct_post","message":"yes?"}"#, "\n",
);
