//! Embedded migration sets for the relational backends.

use crate::migrate::SqlMigration;

pub const METADATA_MIGRATIONS: &[SqlMigration] = &[SqlMigration {
    version: 1,
    name: "registry",
    sql: include_str!("migrations/meta_v1_registry.sql"),
}];

pub const RELATIONAL_NAMESPACE_MIGRATIONS: &[SqlMigration] = &[
    SqlMigration {
        version: 1,
        name: "messages",
        sql: include_str!("migrations/ns_relational_v1_messages.sql"),
    },
    SqlMigration {
        version: 2,
        name: "write-message",
        sql: include_str!("migrations/ns_relational_v2_write_message.sql"),
    },
    SqlMigration {
        version: 3,
        name: "read-functions",
        sql: include_str!("migrations/ns_shared_v3_read_functions.sql"),
    },
];

pub const PARTITIONED_NAMESPACE_MIGRATIONS: &[SqlMigration] = &[
    SqlMigration {
        version: 1,
        name: "hypertable",
        sql: include_str!("migrations/ns_partitioned_v1_hypertable.sql"),
    },
    SqlMigration {
        version: 2,
        name: "write-message",
        sql: include_str!("migrations/ns_partitioned_v2_write_message.sql"),
    },
    SqlMigration {
        version: 3,
        name: "read-functions",
        sql: include_str!("migrations/ns_shared_v3_read_functions.sql"),
    },
];
