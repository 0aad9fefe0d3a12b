use std::sync::Arc;

use parking_lot::RwLock;

use super::{Backend, Bucket, StoreError};

/// In-memory backend; writes are staged on a copy and swapped in on success
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Bucket>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryStore {
    fn view(
        &self,
        f: &mut dyn FnMut(&Bucket) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let inner = self.inner.read();
        f(&inner)
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut Bucket) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let mut staged = inner.clone();
        f(&mut staged)?;
        *inner = staged;
        Ok(())
    }
}
