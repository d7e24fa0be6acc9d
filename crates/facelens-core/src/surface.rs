//! Drawing surfaces and the bounded pool they are recycled through.

use crate::types::Geometry;
use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Maximum number of idle surfaces retained by a pool.
pub const SURFACE_POOL_CAPACITY: usize = 10;

/// A 2D drawing target the renderer paints overlays onto.
pub trait Surface: Send {
    /// Identity of the underlying resource, stable across pool round-trips.
    fn id(&self) -> u64;

    /// Size the surface to the display geometry. A no-op when already sized.
    fn attach(&mut self, geometry: Geometry);

    fn dimensions(&self) -> Geometry;

    /// Reset a rectangle to fully transparent.
    fn clear_rect(&mut self, x: i32, y: i32, width: u32, height: u32);

    fn clear(&mut self) {
        let Geometry { width, height } = self.dimensions();
        self.clear_rect(0, 0, width, height);
    }

    fn stroke_rect(&mut self, x: i32, y: i32, width: u32, height: u32, color: Rgba<u8>, thickness: u32);

    fn fill_rect(&mut self, x: i32, y: i32, width: u32, height: u32, color: Rgba<u8>);

    /// Draw a single line of text with its top-left corner at (x, y).
    fn draw_text(&mut self, x: i32, y: i32, text: &str, color: Rgba<u8>);

    /// Copy of the current pixels, for surfaces that keep them in memory.
    fn snapshot(&self) -> Option<RgbaImage> {
        None
    }

    /// Release the underlying resource. The surface must not be used afterwards.
    fn destroy(self: Box<Self>);
}

/// Builds fresh surfaces when the pool has none to hand out.
pub trait SurfaceFactory: Send + Sync {
    fn create(&self) -> Box<dyn Surface>;
}

impl<F> SurfaceFactory for F
where
    F: Fn() -> Box<dyn Surface> + Send + Sync,
{
    fn create(&self) -> Box<dyn Surface> {
        self()
    }
}

/// Fixed-capacity LIFO pool of idle surfaces, shareable across pipelines.
pub struct SurfacePool {
    idle: Mutex<Vec<Box<dyn Surface>>>,
    capacity: usize,
    factory: Box<dyn SurfaceFactory>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl SurfacePool {
    pub fn new(factory: impl SurfaceFactory + 'static) -> Self {
        Self::with_capacity(SURFACE_POOL_CAPACITY, factory)
    }

    pub fn with_capacity(capacity: usize, factory: impl SurfaceFactory + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            factory: Box::new(factory),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Hand out the most recently released surface, or build a new one.
    pub fn acquire(&self) -> Box<dyn Surface> {
        let reused = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match reused {
            Some(surface) => {
                tracing::debug!(surface = surface.id(), "reusing pooled surface");
                surface
            }
            None => {
                let surface = self.factory.create();
                self.created.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(surface = surface.id(), "created surface");
                surface
            }
        }
    }

    /// Return a surface. Destroys it instead when the pool is full.
    pub fn release(&self, surface: Box<dyn Surface>) {
        let overflow = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.capacity {
                idle.push(surface);
                None
            } else {
                Some(surface)
            }
        };

        if let Some(surface) = overflow {
            tracing::debug!(surface = surface.id(), capacity = self.capacity, "pool full, destroying surface");
            surface.destroy();
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Number of idle surfaces currently held.
    pub fn len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Surfaces built by the factory so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Surfaces destroyed on overflow so far.
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::RasterSurface;

    fn pool() -> SurfacePool {
        SurfacePool::new(|| Box::new(RasterSurface::new()) as Box<dyn Surface>)
    }

    #[test]
    fn test_acquire_from_empty_pool_creates() {
        let pool = pool();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.created(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = pool();
        let a = pool.acquire();
        let b = pool.acquire();
        let (a_id, b_id) = (a.id(), b.id());
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.acquire().id(), b_id);
        assert_eq!(pool.acquire().id(), a_id);
        assert_eq!(pool.created(), 2);
    }

    #[test]
    fn test_pool_never_exceeds_capacity() {
        let pool = pool();
        let surfaces: Vec<_> = (0..25).map(|_| pool.acquire()).collect();
        for (i, s) in surfaces.into_iter().enumerate() {
            pool.release(s);
            assert!(pool.len() <= SURFACE_POOL_CAPACITY, "step {i}");
        }
        assert_eq!(pool.len(), SURFACE_POOL_CAPACITY);
        assert_eq!(pool.destroyed(), 25 - SURFACE_POOL_CAPACITY);
    }

    #[test]
    fn test_interleaved_operations_stay_bounded() {
        let pool = SurfacePool::with_capacity(3, || Box::new(RasterSurface::new()) as Box<dyn Surface>);
        let mut held = Vec::new();
        for step in 0..40 {
            if step % 3 == 0 {
                if let Some(s) = held.pop() {
                    pool.release(s);
                }
            } else {
                held.push(pool.acquire());
            }
            assert!(pool.len() <= 3);
        }
        for s in held {
            pool.release(s);
        }
        assert_eq!(pool.len(), 3);
    }
}
