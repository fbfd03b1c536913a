//! Demonstrates iteration, lookup by index and bulk export on a `ChunkPool`.
//!
//! Pools created with `PoolFlags::ALLOW_ITERATION` can enumerate their live elements without
//! any bookkeeping outside the pool memory itself.

use chunk_pool::{ChunkPool, PoolFlags};

const RECORD_SIZE: usize = 24;

fn main() {
    println!("=== ChunkPool Iteration and Export Example ===");
    println!();

    let mut pool = ChunkPool::builder()
        .element_size(RECORD_SIZE)
        .initial_elements(16)
        .flags(PoolFlags::ALLOW_ITERATION)
        .build();

    let mut records = Vec::new();

    for id in 0..10_u8 {
        let element = pool.allocate();

        // SAFETY: The element is live and RECORD_SIZE bytes long.
        unsafe {
            element.as_ptr().write_bytes(id, RECORD_SIZE);
        }

        records.push(element);
    }

    // Release every odd record.
    for element in records.iter().skip(1).step_by(2) {
        // SAFETY: Each element came from this pool and is freed exactly once.
        unsafe {
            pool.free(*element);
        }
    }

    println!("Live records: {}", pool.len());

    for (position, element) in pool.iter().enumerate() {
        // SAFETY: Iteration only yields live elements, each RECORD_SIZE bytes long.
        let id = unsafe { element.as_ptr().read() };
        println!("  #{position}: record {id} at {element:p}");
    }

    println!();

    if let Some(third) = pool.find(2) {
        // SAFETY: find() only returns live elements.
        let id = unsafe { third.as_ptr().read() };
        println!("Third live record is {id}");
    }

    let table = pool.to_table();
    println!("Pointer table has {} entries", table.len());

    let bytes = pool.to_array();
    println!(
        "Exported {} bytes ({} records of {} bytes)",
        bytes.len(),
        pool.len(),
        pool.element_size()
    );

    let ids: Vec<u8> = bytes
        .chunks_exact(pool.element_size())
        .filter_map(|record| record.first().copied())
        .collect();
    println!("Exported record ids: {ids:?}");

    pool.clear();

    println!();
    println!("After clear: {} live, {} chunk(s)", pool.len(), pool.chunk_count());
}
