//! Database entity models for the proxy session store.
//!
//! The store is owned by the external proxy process. These definitions only
//! describe its layout so the panel can read and patch it through Sea-ORM.

/// Session entity model for Sea-ORM database interaction.
pub mod session;
