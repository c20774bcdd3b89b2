use skein_model::{ConnectionId, Cursor, SyncConnection};

use crate::{StoreError, StoreResult};

/// Sync connections plus the last committed cursor per connection. Cursors
/// live in their own tree so that committing one is a single atomic write
/// independent of connection config edits.
#[derive(Clone)]
pub struct ConnectionStore {
    connections: sled::Tree,
    cursors: sled::Tree,
}

impl ConnectionStore {
    pub(crate) fn new(connections: sled::Tree, cursors: sled::Tree) -> Self {
        Self {
            connections,
            cursors,
        }
    }

    pub fn upsert(&self, connection: &SyncConnection) -> StoreResult<()> {
        self.connections
            .insert(connection.id.as_bytes(), rmp_serde::to_vec(connection)?)?;
        Ok(())
    }

    pub fn get(&self, connection_id: ConnectionId) -> StoreResult<SyncConnection> {
        match self.connections.get(connection_id.as_bytes())? {
            Some(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
            None => Err(StoreError::ConnectionNotFound(connection_id)),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<SyncConnection>> {
        let mut connections = Vec::new();
        for item in self.connections.iter() {
            let (_, bytes) = item?;
            connections.push(rmp_serde::from_slice(&bytes)?);
        }
        Ok(connections)
    }

    pub fn remove(&self, connection_id: ConnectionId) -> StoreResult<()> {
        self.connections.remove(connection_id.as_bytes())?;
        self.cursors.remove(connection_id.as_bytes())?;
        Ok(())
    }

    pub fn cursor(&self, connection_id: ConnectionId) -> StoreResult<Option<Cursor>> {
        match self.cursors.get(connection_id.as_bytes())? {
            Some(bytes) => Ok(Some(Cursor::new(String::from_utf8_lossy(&bytes)))),
            None => Ok(None),
        }
    }

    pub fn commit_cursor(&self, connection_id: ConnectionId, cursor: &Cursor) -> StoreResult<()> {
        self.cursors
            .insert(connection_id.as_bytes(), cursor.as_str().as_bytes())?;
        Ok(())
    }
}
