use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

use proptest::prelude::*;
use rgcat::{AllocError, Allocator, ArenaConfig, HEADER_SIZE, Released};

#[derive(Clone, Debug)]
enum Op {
  Alloc(usize),
  AcquireStrong(usize),
  AcquireWeak(usize),
  ReleaseStrong(usize),
  ReleaseWeak(usize),
}

fn op() -> impl Strategy<Value = Op> {
  prop_oneof![
    4 => (0usize..600).prop_map(Op::Alloc),
    1 => any::<usize>().prop_map(Op::AcquireStrong),
    1 => any::<usize>().prop_map(Op::AcquireWeak),
    3 => any::<usize>().prop_map(Op::ReleaseStrong),
    1 => any::<usize>().prop_map(Op::ReleaseWeak),
  ]
}

/// What the test expects a live block to look like.
struct Live {
  ptr: *mut u8,
  size: usize,
  fill: u8,
  strong: u32,
  weak: u32,
}

fn assert_intact(live: &[Live]) {
  for block in live {
    let bytes = unsafe { std::slice::from_raw_parts(block.ptr, block.size) };
    assert!(bytes.iter().all(|&b| b == block.fill), "payload at {:p} was overwritten", block.ptr);
  }
}

fn assert_disjoint(
  allocator: &Allocator,
  live: &[Live],
) {
  let mut ranges: Vec<(usize, usize)> = live
    .iter()
    .map(|block| {
      let start = block.ptr as usize;
      (start, start + allocator.payload_size(block.ptr).unwrap())
    })
    .collect();
  ranges.sort_unstable();
  for pair in ranges.windows(2) {
    assert!(pair[0].1 + HEADER_SIZE <= pair[1].0);
  }
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(64))]

  #[test]
  fn random_operations_keep_heap_consistent(ops in prop::collection::vec(op(), 1..200)) {
    let mut allocator = Allocator::with_config(ArenaConfig::new().with_growth_unit(16 * 1024));

    let finalized = Arc::new(AtomicUsize::new(0));
    let mut live: Vec<Live> = Vec::new();
    let mut reclaimed = 0;
    let mut next_fill = 1u8;

    for op in ops {
      match op {
        Op::Alloc(size) => {
          let seen = finalized.clone();
          let ptr = allocator
            .allocate_with(size, move |_, _| {
              seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
            .as_ptr();
          unsafe { ptr.write_bytes(next_fill, size) };
          live.push(Live { ptr, size, fill: next_fill, strong: 1, weak: 0 });
          next_fill = next_fill.wrapping_add(1).max(1);
        }
        Op::AcquireStrong(i) if !live.is_empty() => {
          let i = i % live.len();
          allocator.acquire_strong(live[i].ptr).unwrap();
          live[i].strong += 1;
        }
        Op::AcquireWeak(i) if !live.is_empty() => {
          let i = i % live.len();
          allocator.acquire_weak(live[i].ptr).unwrap();
          live[i].weak += 1;
        }
        Op::ReleaseStrong(i) if !live.is_empty() => {
          let i = i % live.len();
          let result = allocator.release_strong(live[i].ptr);
          if live[i].strong == 0 {
            prop_assert!(matches!(result, Err(AllocError::StrongUnderflow { .. })), "expected StrongUnderflow, got {:?}", result);
          } else {
            live[i].strong -= 1;
            if live[i].strong + live[i].weak == 0 {
              prop_assert_eq!(result.unwrap(), Released::Reclaimed);
              live.swap_remove(i);
              reclaimed += 1;
            } else {
              prop_assert_eq!(result.unwrap(), Released::Retained);
            }
          }
        }
        Op::ReleaseWeak(i) if !live.is_empty() => {
          let i = i % live.len();
          let result = allocator.release_weak(live[i].ptr);
          if live[i].weak == 0 {
            prop_assert!(matches!(result, Err(AllocError::WeakUnderflow { .. })), "expected WeakUnderflow, got {:?}", result);
          } else {
            live[i].weak -= 1;
            if live[i].strong + live[i].weak == 0 {
              prop_assert_eq!(result.unwrap(), Released::Reclaimed);
              live.swap_remove(i);
              reclaimed += 1;
            } else {
              prop_assert_eq!(result.unwrap(), Released::Retained);
            }
          }
        }
        _ => {}
      }

      prop_assert_eq!(allocator.check(), Ok(()));
      prop_assert_eq!(finalized.load(Ordering::SeqCst), reclaimed);
      for block in &live {
        prop_assert_eq!(allocator.strong_count(block.ptr), Some(block.strong));
        prop_assert_eq!(allocator.total_count(block.ptr), Some(block.strong + block.weak));
      }
      assert_intact(&live);
      assert_disjoint(&allocator, &live);
    }

    prop_assert_eq!(allocator.stats().used_blocks, live.len());
  }

  #[test]
  fn releasing_everything_leaves_one_free_block(
    (sizes, order) in prop::collection::vec(0usize..400, 1..48).prop_flat_map(|sizes| {
      let indices: Vec<usize> = (0..sizes.len()).collect();
      (Just(sizes), Just(indices).prop_shuffle())
    })
  ) {
    let mut allocator = Allocator::new();
    let ptrs: Vec<*mut u8> = sizes
      .iter()
      .map(|&size| allocator.allocate(size, None).unwrap().as_ptr())
      .collect();

    for i in order {
      prop_assert_eq!(allocator.release_strong(ptrs[i]).unwrap(), Released::Reclaimed);
      prop_assert_eq!(allocator.check(), Ok(()));
    }

    let stats = allocator.stats();
    prop_assert_eq!(stats.used_blocks, 0);
    prop_assert_eq!(stats.free_blocks, 1);
    prop_assert_eq!(stats.free_bytes, stats.capacity - HEADER_SIZE);
  }

  #[test]
  fn bounds_check_matches_payload_size(size in 0usize..1024, index in -64isize..1100) {
    let mut allocator = Allocator::new();
    let ptr = allocator.allocate(size, None).unwrap().as_ptr();
    let payload = allocator.payload_size(ptr).unwrap();

    let result = allocator.bounds_checked_access(ptr, index, 0, 0);
    if index >= 0 && (index as usize) < payload {
      prop_assert_eq!(result, Some(ptr.wrapping_add(index as usize)));
    } else {
      prop_assert_eq!(result, None);
    }
  }
}
