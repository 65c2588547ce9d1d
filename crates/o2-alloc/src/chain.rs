//! Chain iteration: walk every group descriptor linked from an allocator
//! inode's chain list.

use o2_block::BlockDevice;
use o2_error::{O2Error, Result};
use o2_ondisk::{ChainList, GroupDesc};
use o2_types::BlockNumber;
use std::ops::ControlFlow;
use tracing::trace;

/// A group descriptor together with the raw block it was decoded from.
#[derive(Debug, Clone)]
pub struct LoadedGroup {
    pub desc: GroupDesc,
    pub raw: Vec<u8>,
}

/// Read and validate one group descriptor.
///
/// `chain` is the chain index the caller reached it through.
pub fn read_group_desc(dev: &dyn BlockDevice, blkno: u64, chain: usize) -> Result<LoadedGroup> {
    let buf = dev.read_block(BlockNumber(blkno))?;
    let desc = GroupDesc::parse(buf.as_slice()).map_err(|err| O2Error::Corruption {
        block: blkno,
        detail: err.to_string(),
    })?;
    if desc.blkno != blkno {
        return Err(O2Error::Corruption {
            block: blkno,
            detail: format!("group descriptor claims to live at block {}", desc.blkno),
        });
    }
    if usize::from(desc.chain) != chain {
        return Err(O2Error::Corruption {
            block: blkno,
            detail: format!(
                "group descriptor on chain {chain} records chain {}",
                desc.chain
            ),
        });
    }
    trace!(block = blkno, chain, free = desc.free_bits_count, "group_desc");
    Ok(LoadedGroup {
        desc,
        raw: buf.into_inner(),
    })
}

/// Visit every group of every chain, in chain-array order and then
/// next-group order.
///
/// The walk is bounded by the device's block count so a cyclic chain is
/// reported as corruption of `owner` instead of looping.
pub fn chain_iterate<F>(
    dev: &dyn BlockDevice,
    chains: &ChainList,
    owner: u64,
    mut visitor: F,
) -> Result<ControlFlow<()>>
where
    F: FnMut(usize, LoadedGroup) -> Result<ControlFlow<()>>,
{
    let limit = dev.block_count();
    for (chain, rec) in chains.recs.iter().enumerate() {
        let mut next = rec.blkno;
        let mut steps = 0_u64;
        while next != 0 {
            steps += 1;
            if steps > limit {
                return Err(O2Error::Corruption {
                    block: owner,
                    detail: format!("chain {chain} does not terminate"),
                });
            }
            let group = read_group_desc(dev, next, chain)?;
            next = group.desc.next_group;
            if visitor(chain, group)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
    }
    Ok(ControlFlow::Continue(()))
}
