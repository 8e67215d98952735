use diesel::dsl::insert_into;
use diesel::prelude::*;

use crate::models::{NewSshKey, SshKey};
use crate::schema::ssh_key;
use crate::DbConnection;

impl SshKey {
    /// Look up an enabled binding by fingerprint. Disabled rows are
    /// invisible here.
    pub fn find_by_fingerprint(
        conn: &mut DbConnection,
        fingerprint: &str,
    ) -> QueryResult<Option<Self>> {
        ssh_key::table
            .filter(ssh_key::fingerprint.eq(fingerprint))
            .filter(ssh_key::enabled.eq(true))
            .first::<Self>(conn)
            .optional()
    }

    /// Look up a binding by fingerprint regardless of its enabled state.
    pub fn find_by_fingerprint_any(
        conn: &mut DbConnection,
        fingerprint: &str,
    ) -> QueryResult<Option<Self>> {
        ssh_key::table
            .filter(ssh_key::fingerprint.eq(fingerprint))
            .first::<Self>(conn)
            .optional()
    }

    /// Add a new binding to the database
    pub fn add_key(conn: &mut DbConnection, new_key: &NewSshKey) -> QueryResult<usize> {
        insert_into(ssh_key::table)
            .values(new_key.clone())
            .execute(conn)
    }

    pub fn get_all_keys(conn: &mut DbConnection) -> QueryResult<Vec<Self>> {
        ssh_key::table.load::<Self>(conn)
    }
}
