//! Emergency memory reserve.
//!
//! A pre-allocated buffer that can be released when the process runs into
//! allocation pressure. Registered listeners are asked to shed caches when
//! the parachute opens. Not part of any correctness contract.

use std::sync::Mutex;

pub trait PressureListener: Send {
    /// Called once when the reserve is released; implementations should
    /// drop caches and other reclaimable memory.
    fn on_memory_pressure(&self);
}

pub struct MemoryParachute {
    inner: Mutex<Inner>,
}

struct Inner {
    reserve: Option<Vec<u8>>,
    listeners: Vec<Box<dyn PressureListener>>,
}

impl MemoryParachute {
    pub fn new(reserve_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                reserve: Some(vec![0u8; reserve_size]),
                listeners: Vec::new(),
            }),
        }
    }

    pub fn register(&self, listener: Box<dyn PressureListener>) {
        self.inner.lock().unwrap().listeners.push(listener);
    }

    /// Drop the reserve and notify all listeners. Returns false if the
    /// parachute was already opened.
    pub fn open(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.reserve.take().is_none() {
            return false;
        }
        log::warn!("memory parachute released, asking listeners to shed caches");
        for listener in &inner.listeners {
            listener.on_memory_pressure();
        }
        true
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().reserve.is_none()
    }
}
