use duckdb::{AccessMode, Config, Connection};
use r2d2::ManageConnection;

/// Connection manager that opens the analytics store read-only. The pipeline
/// never needs write access; even SQL that slips past validation cannot
/// mutate anything through these connections.
pub struct ReadOnlyDuckDbManager {
    connection_string: String,
}

impl ReadOnlyDuckDbManager {
    pub fn new(connection_string: String) -> Self {
        Self { connection_string }
    }
}

impl ManageConnection for ReadOnlyDuckDbManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let config = Config::default().access_mode(AccessMode::ReadOnly)?;
        Connection::open_with_flags(&self.connection_string, config)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
