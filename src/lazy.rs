//! Values resolved once on first use and shared by every holder
//!
//! A [`LazySharedValue`] is cloned into the configuration of several roles (for
//! example one cluster-wide port). The first launch that asks for it resolves
//! it; every later launch sees the same value.

use crate::error::{EnsembleError, Result};
use std::fmt;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

type Supplier<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

struct LazyInner<T> {
    value: Mutex<Option<T>>,
    supplier: Supplier<T>,
}

/// A lazily resolved, cached value shared between clones
pub struct LazySharedValue<T> {
    inner: Arc<LazyInner<T>>,
}

impl<T: Clone + Send + 'static> LazySharedValue<T> {
    /// Create a value resolved by `supplier` on first use
    pub fn new<F>(supplier: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(LazyInner {
                value: Mutex::new(None),
                supplier: Box::new(supplier),
            }),
        }
    }

    /// Create an already resolved value
    pub fn resolved(value: T) -> Self {
        let shared = Self::new(|| Err(EnsembleError::Internal("value was pre-resolved".to_string())));
        if let Ok(mut slot) = shared.inner.value.lock() {
            *slot = Some(value);
        }
        shared
    }

    /// Resolve the value, running the supplier only the first time.
    ///
    /// A failed resolution is not cached; the next call retries the supplier.
    pub fn get(&self) -> Result<T> {
        let mut slot = self
            .inner
            .value
            .lock()
            .map_err(|_| EnsembleError::Lock("Failed to acquire lazy value lock".to_string()))?;

        if let Some(ref value) = *slot {
            return Ok(value.clone());
        }

        let value = (self.inner.supplier)()?;
        *slot = Some(value.clone());
        Ok(value)
    }

    /// Whether the value has been resolved
    pub fn is_resolved(&self) -> bool {
        self.inner
            .value
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }
}

impl LazySharedValue<u16> {
    /// A free local TCP port, chosen on first use
    pub fn available_port() -> Self {
        Self::new(available_port)
    }
}

impl<T> Clone for LazySharedValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LazySharedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.value.try_lock() {
            Ok(slot) => match slot.as_ref() {
                Some(value) => write!(f, "LazySharedValue({:?})", value),
                None => write!(f, "LazySharedValue(<unresolved>)"),
            },
            Err(_) => write!(f, "LazySharedValue(<resolving>)"),
        }
    }
}

/// Ask the operating system for a free local TCP port
pub fn available_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}
