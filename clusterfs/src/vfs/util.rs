//! Splitting of file byte ranges into per-block pieces.

/// The part of a file range that falls inside one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub index: u64,
    pub offset: usize,
    pub len: usize,
}

/// Split `[offset, offset + len)` into block-local ranges.
pub fn split_range_into_blocks(block_size: u32, mut offset: u64, len: usize) -> Vec<BlockSpan> {
    let block_size = u64::from(block_size);
    let mut remaining = len as u64;
    let mut out = Vec::new();
    while remaining > 0 {
        let index = offset / block_size;
        let within = offset % block_size;
        let take = (block_size - within).min(remaining);
        out.push(BlockSpan {
            index,
            offset: within as usize,
            len: take as usize,
        });
        offset += take;
        remaining -= take;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_within_single_block() {
        let spans = split_range_into_blocks(4096, 123, 100);
        assert_eq!(
            spans,
            vec![BlockSpan {
                index: 0,
                offset: 123,
                len: 100
            }]
        );
    }

    #[test]
    fn test_split_across_two_blocks() {
        let spans = split_range_into_blocks(4096, 4091, 10);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0], BlockSpan { index: 0, offset: 4091, len: 5 });
        assert_eq!(spans[1], BlockSpan { index: 1, offset: 0, len: 5 });
    }

    #[test]
    fn test_split_aligned_full_blocks() {
        let spans = split_range_into_blocks(512, 1024, 1024);
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.offset == 0 && s.len == 512));
        assert_eq!(spans[1].index, 3);
    }

    #[test]
    fn test_zero_len() {
        assert!(split_range_into_blocks(4096, 0, 0).is_empty());
    }
}
