use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crate::error::{Error, Result};

type Constructor<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;
type Destructor<T> = Box<dyn Fn(T) + Send + Sync>;

/// A pool of reusable objects that are expensive to create.
///
/// [`ObjectPool::get`] hands out an exclusive [`Pooled`] guard which returns the object on drop.
/// Objects still in the pool are destroyed when the pool is disposed.
pub struct ObjectPool<T> {
    constructor: Constructor<T>,
    destructor: Destructor<T>,
    free: Mutex<Vec<T>>,
    created: AtomicUsize,
    disposed: AtomicBool,
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("free", &self.free_len())
            .field("created", &self.created())
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> ObjectPool<T> {
    /// Creates a pool and fills it with `initial` objects.
    pub fn new(
        initial: usize,
        constructor: impl Fn() -> Result<T> + Send + Sync + 'static,
        destructor: impl Fn(T) + Send + Sync + 'static,
    ) -> Result<Self> {
        let pool = Self {
            constructor: Box::new(constructor),
            destructor: Box::new(destructor),
            free: Mutex::new(Vec::with_capacity(initial)),
            created: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        };
        for _ in 0..initial {
            let value = pool.create()?;
            pool.free.lock().expect("failed to lock").push(value);
        }
        Ok(pool)
    }

    fn create(&self) -> Result<T> {
        let value = (self.constructor)()?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    /// Takes a free object, or constructs a new one if none is free.
    pub fn get(&self) -> Result<Pooled<'_, T>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Resource("object pool has been disposed"));
        }
        let value = self.free.lock().expect("failed to lock").pop();
        let value = match value {
            Some(value) => value,
            None => self.create()?,
        };
        Ok(Pooled {
            pool: self,
            value: Some(value),
        })
    }

    fn put(&self, value: T) {
        // dispose flips the flag under the same lock
        let mut free = self.free.lock().expect("failed to lock");
        match self.disposed.load(Ordering::Acquire) {
            true => {
                drop(free);
                (self.destructor)(value)
            }
            false => free.push(value),
        }
    }

    /// Number of objects waiting in the pool.
    pub fn free_len(&self) -> usize {
        self.free.lock().expect("failed to lock").len()
    }

    /// Number of objects constructed over the pool's lifetime.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Destroys all free objects. Objects still leased are destroyed when returned.
    pub fn dispose(&self) -> Result<()> {
        let free = {
            let mut free = self.free.lock().expect("failed to lock");
            if self.disposed.swap(true, Ordering::AcqRel) {
                return Err(Error::Resource("object pool is already disposed"));
            }
            std::mem::take(&mut *free)
        };
        free.into_iter().for_each(|value| (self.destructor)(value));
        Ok(())
    }
}

impl<T> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            _ = self.dispose();
        }
    }
}

/// An object leased from an [`ObjectPool`].
pub struct Pooled<'a, T> {
    pool: &'a ObjectPool<T>,
    value: Option<T>,
}

impl<T: fmt::Debug> fmt::Debug for Pooled<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value is present until drop")
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value is present until drop")
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put(value);
        }
    }
}
