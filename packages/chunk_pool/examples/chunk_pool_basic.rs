//! Basic usage of `ChunkPool`: allocating, using and freeing fixed-size elements.
//!
//! This example stores particle records in pool memory and shows how the pool grows by whole
//! chunks and shrinks back to a single chunk once everything is freed.

use std::num::NonZero;
use std::ptr::NonNull;

use chunk_pool::ChunkPool;

#[derive(Clone, Copy, Debug)]
struct Particle {
    position: [f32; 3],
    velocity: [f32; 3],
}

fn main() {
    println!("=== ChunkPool Basic Example ===");
    println!();

    let mut pool = ChunkPool::builder()
        .element_size_of::<Particle>()
        .elements_per_chunk(NonZero::new(64).unwrap())
        .build();

    println!("Created pool:");
    println!("  Element size: {} bytes", pool.element_size());
    println!("  Elements per chunk: {}", pool.elements_per_chunk());
    println!("  Chunk size: {} bytes", pool.chunk_byte_size());
    println!("  Chunks: {}", pool.chunk_count());
    println!();

    let mut particles: Vec<NonNull<u8>> = Vec::new();

    for index in 0..200_u16 {
        let element = pool.allocate();
        let offset = f32::from(index);

        // SAFETY: The element is live and at least size_of::<Particle>() bytes long. Pool
        // elements are not aligned for Particle, so we use unaligned access.
        unsafe {
            element.cast::<Particle>().write_unaligned(Particle {
                position: [offset, 0.0, 0.0],
                velocity: [0.0, 1.0, 0.0],
            });
        }

        particles.push(element);
    }

    println!("Allocated {} particles:", pool.len());
    println!("  Chunks: {}", pool.chunk_count());
    println!("  Capacity: {}", pool.capacity());
    println!();

    // Advance every particle by one step.
    for element in &particles {
        // SAFETY: The element is live and holds a Particle written above.
        let mut particle = unsafe { element.cast::<Particle>().read_unaligned() };

        for (position, velocity) in particle.position.iter_mut().zip(particle.velocity) {
            *position += velocity;
        }

        // SAFETY: As above.
        unsafe {
            element.cast::<Particle>().write_unaligned(particle);
        }
    }

    if let Some(last) = particles.last() {
        // SAFETY: The element is live and holds a Particle.
        let particle = unsafe { last.cast::<Particle>().read_unaligned() };
        println!("Last particle after one step: {particle:?}");
        println!();
    }

    // Free half of the particles. The pool keeps its chunks while anything is live.
    for element in particles.drain(..100) {
        // SAFETY: Each element came from this pool and is freed exactly once.
        unsafe {
            pool.free(element);
        }
    }

    println!("After freeing 100 particles:");
    println!("  Live: {}", pool.len());
    println!("  Chunks: {}", pool.chunk_count());
    println!();

    // Freed memory is reused before the pool asks for more.
    let reused = pool.allocate();
    println!("Reused freed memory: {}", pool.contains(reused));
    particles.push(reused);

    for element in particles {
        // SAFETY: Each element came from this pool and is freed exactly once.
        unsafe {
            pool.free(element);
        }
    }

    println!();
    println!("After freeing everything:");
    println!("  Live: {}", pool.len());
    println!("  Chunks: {}", pool.chunk_count());
}
