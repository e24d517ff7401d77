//! Session entity model for Sea-ORM database interaction.
//!
//! This module defines the table layout of the proxy's session store. The
//! proxy owns the file and writes to it continuously; the panel only reads
//! the snapshot copy and, during a revoke, rewrites a single row.

use sea_orm::entity::prelude::*;

/// Name of the single table ("bucket") holding session records.
pub const SESSIONS_TABLE: &str = "sessions";

/// Sea-ORM entity model representing one key/value pair of the session store.
///
/// # Database Schema
///
/// | Column | Type               | Description                          |
/// |--------|--------------------|--------------------------------------|
/// | id     | TEXT (Primary Key) | Session ID, the key of the record    |
/// | data   | BLOB               | JSON-encoded [`SessionRecord`]       |
///
/// Rows are always read in ascending `id` order, which is the native key
/// order of the store.
///
/// [`SessionRecord`]: crate::sessions::SessionRecord
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    /// The opaque session identifier.
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    /// The JSON bytes of the session record, exactly as the proxy wrote them.
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
