//! Short-lived access scopes.
//!
//! A session protects the objects it touches by refreshing their lease
//! timestamps; GC leaves leased objects alone even at zero references.
//! Sessions hold no persistent state, so closing one is just dropping it.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::name::Name;
use crate::writer::ObjectWriter;
use crate::{Result, StoreError, StoreInner};

pub struct Session {
    store: Arc<StoreInner>,
}

impl Session {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Session { store }
    }

    /// Resolve a label to an object name, refreshing the target's lease.
    pub fn get_label(&self, namespace: &str, label: &str) -> Result<Option<Name>> {
        match self.store.meta().get_label(namespace, label)? {
            Some((id, name)) => {
                self.store.meta().touch_lease(id, self.store.lease_deadline())?;
                Ok(Some(name))
            }
            None => Ok(None),
        }
    }

    /// Point `namespace:label` at an object, or delete the label with `None`.
    pub fn set_label(&self, namespace: &str, label: &str, name: Option<&Name>) -> Result<()> {
        self.store.meta().set_label(namespace, label, name)
    }

    /// Open the named object read-only, refreshing its lease.
    pub fn object_open(&self, name: &Name) -> Result<File> {
        let path = self.object_path(name)?;
        File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(name.to_hex()),
            _ => StoreError::Io(err),
        })
    }

    /// Path of the named object's blob, with its lease refreshed. The path
    /// is only protected from GC for the session's lease window.
    pub fn object_path(&self, name: &Name) -> Result<PathBuf> {
        let id = self
            .store
            .meta()
            .find_object_id(name)?
            .ok_or_else(|| StoreError::NotFound(name.to_hex()))?;
        self.store.meta().touch_lease(id, self.store.lease_deadline())?;
        Ok(self.store.data_file_path(name).1)
    }

    /// Create an object from a full in-memory buffer.
    pub fn create_object(&self, data: &[u8], deps: &[Name]) -> Result<Name> {
        let mut writer = self.stream_object(deps);
        writer.write_all(data)?;
        writer.commit()
    }

    /// Stream a new object; dependencies must already exist by commit time.
    pub fn stream_object(&self, deps: &[Name]) -> ObjectWriter {
        ObjectWriter::new(self.store.clone(), deps)
    }
}
