// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Port Allocator (C4): a process-wide monotonic allocator handing out
//! non-overlapping port ranges to concurrent batches.
//!
//! Encapsulated behind a handle rather than ambient global state, so
//! tests can construct independent allocators. A real process normally
//! holds one `PortAllocator` shared (via `Arc`) across every batch.

use std::sync::Mutex;

const RANGE_START: u16 = 10000;
const RANGE_END: u16 = 60000;

/// Hands out base ports for batches under a mutex held only for the
/// counter read-and-advance — never across an await point.
pub struct PortAllocator {
    counter: Mutex<u32>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            counter: Mutex::new(RANGE_START as u32),
        }
    }

    /// Reserves `batch_size + slack` consecutive ports and returns the
    /// base. Wraps back to `RANGE_START` when the counter would exceed
    /// `RANGE_END`. The slack absorbs mid-batch compile-rejections
    /// without risking collisions with the next batch.
    pub fn next_base_port(&self, batch_size: usize, slack: u16) -> u16 {
        let mut counter = self.counter.lock().unwrap();
        let port = *counter as u16;
        *counter += batch_size as u32 + slack as u32;
        if *counter > RANGE_END as u32 {
            *counter = RANGE_START as u32;
        }
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sequential_calls_do_not_overlap() {
        let alloc = PortAllocator::new();
        let a = alloc.next_base_port(100, 10);
        let b = alloc.next_base_port(50, 10);
        assert_eq!(a, 10000);
        assert_eq!(b, 10110);
    }

    #[test]
    fn wraps_when_exceeding_range_end() {
        let alloc = PortAllocator::new();
        for _ in 0..500 {
            alloc.next_base_port(100, 10);
        }
        let port = alloc.next_base_port(100, 10);
        assert!((RANGE_START..RANGE_END).contains(&port));
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let alloc = Arc::new(PortAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                thread::spawn(move || alloc.next_base_port(20, 10))
            })
            .collect();
        let mut bases: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        bases.sort_unstable();
        for window in bases.windows(2) {
            assert!(window[1] - window[0] >= 20, "batches must not overlap: {window:?}");
        }
    }
}
