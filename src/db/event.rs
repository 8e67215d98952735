use diesel::dsl::insert_into;
use diesel::prelude::*;

use crate::models::{ConnectionLog, NewConnectionLog};
use crate::schema::connection_log;
use crate::DbConnection;

impl ConnectionLog {
    /// Append one event. Rows are never updated or deleted.
    pub fn record(conn: &mut DbConnection, event: &NewConnectionLog) -> QueryResult<usize> {
        insert_into(connection_log::table)
            .values(event.clone())
            .execute(conn)
    }
}
