//! Chunk planning and handle partitioning

use std::ops::Range;

use crate::handle::TrackedHandle;

/// Split `len` items into consecutive ranges of at most `max_concurrency`
///
/// Items are only split when the cap is below `len`; otherwise everything runs
/// as one chunk. A cap of zero is treated as one.
pub fn plan_chunks(len: usize, max_concurrency: Option<usize>) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }

    let size = match max_concurrency {
        Some(limit) if limit < len => limit.max(1),
        _ => len,
    };

    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Separate failed handles from the ones that may commit, keeping order
pub fn partition_failed<H>(
    handles: Vec<TrackedHandle<H>>,
) -> (Vec<TrackedHandle<H>>, Vec<TrackedHandle<H>>)
where
    H: crate::handle::TransactionalHandle,
{
    handles.into_iter().partition(|handle| handle.is_failed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleProvider, MemoryHandleProvider};
    use proptest::prelude::*;

    #[test]
    fn test_plan_chunks_examples() {
        assert!(plan_chunks(0, Some(3)).is_empty());
        assert_eq!(plan_chunks(5, None), vec![0..5]);
        assert_eq!(plan_chunks(5, Some(5)), vec![0..5]);
        assert_eq!(plan_chunks(5, Some(8)), vec![0..5]);
        assert_eq!(plan_chunks(10, Some(3)), vec![0..3, 3..6, 6..9, 9..10]);
        assert_eq!(plan_chunks(4, Some(1)), vec![0..1, 1..2, 2..3, 3..4]);
    }

    #[tokio::test]
    async fn test_partition_failed_keeps_creation_order() {
        let provider = MemoryHandleProvider::new();
        let mut handles: Vec<_> = (0..5)
            .map(|i| TrackedHandle::new(i, provider.create_handle()))
            .collect();
        handles[1].mark_failed();
        handles[3].mark_failed();

        let (failed, ok) = partition_failed(handles);
        let failed_idx: Vec<_> = failed.iter().map(|h| h.index()).collect();
        let ok_idx: Vec<_> = ok.iter().map(|h| h.index()).collect();
        assert_eq!(failed_idx, vec![1, 3]);
        assert_eq!(ok_idx, vec![0, 2, 4]);

        for mut handle in failed.into_iter().chain(ok) {
            handle.release().await.unwrap();
        }
    }

    proptest! {
        #[test]
        fn prop_chunks_are_contiguous_and_bounded(len in 0usize..200, limit in 1usize..50) {
            let chunks = plan_chunks(len, Some(limit));

            let mut next = 0;
            for chunk in &chunks {
                prop_assert_eq!(chunk.start, next);
                prop_assert!(!chunk.is_empty());
                prop_assert!(chunk.len() <= limit);
                next = chunk.end;
            }
            prop_assert_eq!(next, len);

            let flattened: Vec<usize> = chunks.into_iter().flatten().collect();
            prop_assert_eq!(flattened, (0..len).collect::<Vec<_>>());
        }
    }
}
