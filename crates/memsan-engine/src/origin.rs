//! Provenance records and origin chaining.
//!
//! Every origin handle names a record in the [`StackDepot`]. Records are
//! tagged frame lists: the first word carries a magic tag plus a small
//! payload, the remaining words are record specific.
//!
//! A chain link remembers where poisoned data was stored and points at the
//! previous origin. Chains are capped at [`MAX_CHAIN_DEPTH`] links; linking
//! onto a full chain folds its oldest link into a `Summary` record that keeps
//! the root origin and a count of elided links.

use serde::{Deserialize, Serialize};

use crate::config::MAX_CHAIN_DEPTH;
use crate::depot::{OriginHandle, StackDepot};

const MAGIC_MASK: u64 = 0xffff_ffff_ffff_0000;
const PAYLOAD_MASK: u64 = 0xffff;

const STACK_MAGIC: u64 = 0x6d73_616e_0001_0000;
const CHAIN_MAGIC: u64 = 0x6d73_616e_0002_0000;
const FRAME_MAGIC: u64 = 0x6d73_616e_0003_0000;
const ALLOCA_MAGIC: u64 = 0x6d73_616e_0004_0000;
const SUMMARY_MAGIC: u64 = 0x6d73_616e_0005_0000;

const MAX_DESCR_BYTES: usize = 256;

/// Why a stack record was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginCause {
    #[default]
    Unspecified,
    /// Page or object allocation without zero fill.
    Allocation,
    /// Explicit poison request.
    Poison,
    /// Memory poisoned because it was freed.
    ObjectFree,
    /// Plain stack saved as the "stored at" site of a chain link.
    Store,
}

impl OriginCause {
    const fn to_payload(self) -> u64 {
        match self {
            Self::Unspecified => 0,
            Self::Allocation => 1,
            Self::Poison => 2,
            Self::ObjectFree => 3,
            Self::Store => 4,
        }
    }

    const fn from_payload(v: u64) -> Self {
        match v {
            1 => Self::Allocation,
            2 => Self::Poison,
            3 => Self::ObjectFree,
            4 => Self::Store,
            _ => Self::Unspecified,
        }
    }
}

/// Decoded provenance record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginRecord {
    /// Root origin: the stack that created the uninitialized value.
    Stack { cause: OriginCause, frames: Vec<u64> },
    /// Chain link with a full stack of the store site.
    Chain {
        depth: u32,
        stored_at: OriginHandle,
        prev: OriginHandle,
    },
    /// Chain link that only remembers the storing instruction.
    FrameChain {
        depth: u32,
        pc: u64,
        prev: OriginHandle,
    },
    /// Uninitialized local variable.
    Alloca { descr: String, pc1: u64, pc2: u64 },
    /// Stand-in for chain links dropped by the depth cap.
    Summary { elided: u32, origin: OriginHandle },
}

impl OriginRecord {
    /// Encode into depot frames.
    #[must_use]
    pub fn encode(&self) -> Vec<u64> {
        match self {
            Self::Stack { cause, frames } => {
                let mut out = Vec::with_capacity(frames.len() + 1);
                out.push(STACK_MAGIC | cause.to_payload());
                out.extend_from_slice(frames);
                out
            }
            Self::Chain {
                depth,
                stored_at,
                prev,
            } => vec![
                CHAIN_MAGIC | u64::from(*depth),
                u64::from(stored_at.raw()),
                u64::from(prev.raw()),
            ],
            Self::FrameChain { depth, pc, prev } => vec![
                FRAME_MAGIC | u64::from(*depth),
                *pc,
                u64::from(prev.raw()),
            ],
            Self::Alloca { descr, pc1, pc2 } => {
                let bytes = &descr.as_bytes()[..descr.len().min(MAX_DESCR_BYTES)];
                let mut out = Vec::with_capacity(3 + bytes.len().div_ceil(8));
                out.push(ALLOCA_MAGIC | bytes.len() as u64);
                out.push(*pc1);
                out.push(*pc2);
                for chunk in bytes.chunks(8) {
                    let mut word = [0u8; 8];
                    word[..chunk.len()].copy_from_slice(chunk);
                    out.push(u64::from_le_bytes(word));
                }
                out
            }
            Self::Summary { elided, origin } => vec![
                SUMMARY_MAGIC,
                u64::from(*elided),
                u64::from(origin.raw()),
            ],
        }
    }

    /// Decode depot frames; `None` for frames that are not a record.
    #[must_use]
    pub fn decode(frames: &[u64]) -> Option<Self> {
        let (&head, rest) = frames.split_first()?;
        let payload = head & PAYLOAD_MASK;
        let handle = |w: u64| OriginHandle::from_raw(w as u32);
        match head & MAGIC_MASK {
            STACK_MAGIC => Some(Self::Stack {
                cause: OriginCause::from_payload(payload),
                frames: rest.to_vec(),
            }),
            CHAIN_MAGIC if rest.len() == 2 => Some(Self::Chain {
                depth: payload as u32,
                stored_at: handle(rest[0]),
                prev: handle(rest[1]),
            }),
            FRAME_MAGIC if rest.len() == 2 => Some(Self::FrameChain {
                depth: payload as u32,
                pc: rest[0],
                prev: handle(rest[1]),
            }),
            ALLOCA_MAGIC if rest.len() >= 2 => {
                let len = payload as usize;
                let mut bytes: Vec<u8> = rest[2..].iter().flat_map(|w| w.to_le_bytes()).collect();
                if bytes.len() < len {
                    return None;
                }
                bytes.truncate(len);
                Some(Self::Alloca {
                    descr: String::from_utf8_lossy(&bytes).into_owned(),
                    pc1: rest[0],
                    pc2: rest[1],
                })
            }
            SUMMARY_MAGIC if rest.len() == 2 => Some(Self::Summary {
                elided: rest[0] as u32,
                origin: handle(rest[1]),
            }),
            _ => None,
        }
    }

    /// Position of a chain link above the root; 0 for non-links.
    #[must_use]
    pub const fn depth(&self) -> u32 {
        match self {
            Self::Chain { depth, .. } | Self::FrameChain { depth, .. } => *depth,
            _ => 0,
        }
    }

    /// Previous origin for chain links.
    #[must_use]
    pub const fn prev(&self) -> Option<OriginHandle> {
        match self {
            Self::Chain { prev, .. } | Self::FrameChain { prev, .. } => Some(*prev),
            _ => None,
        }
    }
}

/// Where the new chain link was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSite {
    /// Handle of a saved stack.
    Stack(OriginHandle),
    /// Single instruction address.
    Frame(u64),
}

impl LinkSite {
    fn link(self, depth: u32, prev: OriginHandle) -> OriginRecord {
        match self {
            Self::Stack(stored_at) => OriginRecord::Chain {
                depth,
                stored_at,
                prev,
            },
            Self::Frame(pc) => OriginRecord::FrameChain { depth, pc, prev },
        }
    }

    fn of(record: &OriginRecord) -> Option<Self> {
        match record {
            OriginRecord::Chain { stored_at, .. } => Some(Self::Stack(*stored_at)),
            OriginRecord::FrameChain { pc, .. } => Some(Self::Frame(*pc)),
            _ => None,
        }
    }
}

/// Result of [`chain_origin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// A new link was added on top of the previous origin.
    Linked(OriginHandle),
    /// The chain was full; its oldest link was folded into a summary.
    Summarized(OriginHandle),
    /// Nothing to chain (no origin) or the depot is full.
    Unchanged(OriginHandle),
}

impl ChainOutcome {
    #[must_use]
    pub const fn handle(self) -> OriginHandle {
        match self {
            Self::Linked(h) | Self::Summarized(h) | Self::Unchanged(h) => h,
        }
    }
}

/// Fetch and decode the record behind `handle`.
#[must_use]
pub fn load(depot: &dyn StackDepot, handle: OriginHandle) -> Option<OriginRecord> {
    depot
        .fetch(handle)
        .and_then(|frames| OriginRecord::decode(&frames))
}

/// Save `record`, returning its handle.
pub fn store(depot: &dyn StackDepot, record: &OriginRecord) -> Option<OriginHandle> {
    depot.save(&record.encode())
}

/// Link `site` on top of `prev`. Extra bits of `prev` carry over to the
/// returned handle.
pub fn chain_origin(depot: &dyn StackDepot, prev: OriginHandle, site: LinkSite) -> ChainOutcome {
    if prev.is_none() {
        return ChainOutcome::Unchanged(prev);
    }
    let extra = prev.extra();
    let base = prev.without_extra();
    let depth = load(depot, base).map_or(0, |r| r.depth());

    if depth < MAX_CHAIN_DEPTH {
        return match store(depot, &site.link(depth + 1, base)) {
            Some(h) => ChainOutcome::Linked(h.with_extra(extra)),
            None => ChainOutcome::Unchanged(prev),
        };
    }

    // Collect the full chain, newest link first.
    let mut sites = Vec::with_capacity(MAX_CHAIN_DEPTH as usize);
    let mut cursor = base;
    while sites.len() < MAX_CHAIN_DEPTH as usize {
        let Some(record) = load(depot, cursor) else {
            break;
        };
        let (Some(site), Some(next)) = (LinkSite::of(&record), record.prev()) else {
            break;
        };
        sites.push(site);
        cursor = next;
    }
    let root = cursor;
    let summary = match load(depot, root) {
        Some(OriginRecord::Summary { elided, origin }) => OriginRecord::Summary {
            elided: elided.saturating_add(1),
            origin,
        },
        _ => OriginRecord::Summary {
            elided: 1,
            origin: root,
        },
    };
    let Some(mut head) = store(depot, &summary) else {
        return ChainOutcome::Unchanged(prev);
    };

    // Drop the oldest link, rebuild the rest on top of the summary.
    sites.pop();
    let mut depth = 0;
    for kept in sites.iter().rev() {
        depth += 1;
        match store(depot, &kept.link(depth, head)) {
            Some(h) => head = h,
            None => return ChainOutcome::Unchanged(prev),
        }
    }
    match store(depot, &site.link(depth + 1, head)) {
        Some(h) => ChainOutcome::Summarized(h.with_extra(extra)),
        None => ChainOutcome::Unchanged(prev),
    }
}

/// Records reachable from `handle`, newest first, ending at the root.
/// Bounded even if the depot holds a malformed cycle.
#[must_use]
pub fn walk(depot: &dyn StackDepot, handle: OriginHandle) -> Vec<(OriginHandle, OriginRecord)> {
    let limit = MAX_CHAIN_DEPTH as usize + 2;
    let mut out = Vec::new();
    let mut cursor = handle.without_extra();
    while out.len() < limit && cursor.is_some() {
        let Some(record) = load(depot, cursor) else {
            break;
        };
        let next = match &record {
            OriginRecord::Chain { prev, .. } | OriginRecord::FrameChain { prev, .. } => Some(*prev),
            OriginRecord::Summary { origin, .. } => Some(*origin),
            _ => None,
        };
        out.push((cursor, record));
        match next {
            Some(n) => cursor = n.without_extra(),
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depot::InMemoryDepot;

    fn root(depot: &InMemoryDepot) -> OriginHandle {
        store(
            depot,
            &OriginRecord::Stack {
                cause: OriginCause::Allocation,
                frames: vec![0x1000, 0x2000],
            },
        )
        .unwrap()
    }

    fn stack_site(depot: &InMemoryDepot, pc: u64) -> LinkSite {
        let h = store(
            depot,
            &OriginRecord::Stack {
                cause: OriginCause::Store,
                frames: vec![pc],
            },
        )
        .unwrap();
        LinkSite::Stack(h)
    }

    #[test]
    fn records_decode_to_themselves() {
        let records = [
            OriginRecord::Stack {
                cause: OriginCause::Poison,
                frames: vec![1, 2, 3],
            },
            OriginRecord::Chain {
                depth: 3,
                stored_at: OriginHandle::from_raw(5),
                prev: OriginHandle::from_raw(9),
            },
            OriginRecord::FrameChain {
                depth: 1,
                pc: 0xdead,
                prev: OriginHandle::from_raw(2),
            },
            OriginRecord::Alloca {
                descr: "----buf@do_ioctl".to_string(),
                pc1: 10,
                pc2: 20,
            },
            OriginRecord::Summary {
                elided: 4,
                origin: OriginHandle::from_raw(1),
            },
        ];
        for record in records {
            assert_eq!(OriginRecord::decode(&record.encode()), Some(record));
        }
    }

    #[test]
    fn foreign_frames_do_not_decode() {
        assert_eq!(OriginRecord::decode(&[]), None);
        assert_eq!(OriginRecord::decode(&[0x1234, 5]), None);
        assert_eq!(OriginRecord::decode(&[CHAIN_MAGIC | 1]), None);
    }

    #[test]
    fn chaining_none_is_a_noop() {
        let depot = InMemoryDepot::new(64);
        let out = chain_origin(&depot, OriginHandle::NONE, LinkSite::Frame(1));
        assert_eq!(out, ChainOutcome::Unchanged(OriginHandle::NONE));
    }

    #[test]
    fn chain_links_point_back() {
        let depot = InMemoryDepot::new(64);
        let r = root(&depot);
        let site = stack_site(&depot, 0xaaa);
        let ChainOutcome::Linked(h) = chain_origin(&depot, r, site) else {
            panic!("expected a link");
        };
        match load(&depot, h).unwrap() {
            OriginRecord::Chain { depth, prev, .. } => {
                assert_eq!(depth, 1);
                assert_eq!(prev, r);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn chain_depth_is_capped_and_oldest_link_summarized() {
        let depot = InMemoryDepot::new(1024);
        let r = root(&depot);
        let mut h = r;
        for i in 0..MAX_CHAIN_DEPTH {
            h = chain_origin(&depot, h, LinkSite::Frame(0x100 + u64::from(i))).handle();
        }
        assert_eq!(load(&depot, h).unwrap().depth(), MAX_CHAIN_DEPTH);

        let out = chain_origin(&depot, h, LinkSite::Frame(0x999));
        let ChainOutcome::Summarized(next) = out else {
            panic!("expected summarization, got {out:?}");
        };
        let chain = walk(&depot, next);
        // 7 links, one summary, the root.
        assert_eq!(chain.len(), MAX_CHAIN_DEPTH as usize + 2);
        assert_eq!(
            chain[0].1,
            OriginRecord::FrameChain {
                depth: MAX_CHAIN_DEPTH,
                pc: 0x999,
                prev: chain[1].0
            }
        );
        match &chain[MAX_CHAIN_DEPTH as usize].1 {
            OriginRecord::Summary { elided, origin } => {
                assert_eq!(*elided, 1);
                assert_eq!(*origin, r);
            }
            other => panic!("expected summary, got {other:?}"),
        }
        // The oldest link (pc 0x100) is gone, the next oldest survives at depth 1.
        assert_eq!(
            chain[MAX_CHAIN_DEPTH as usize - 1].1,
            OriginRecord::FrameChain {
                depth: 1,
                pc: 0x101,
                prev: chain[MAX_CHAIN_DEPTH as usize].0
            }
        );
    }

    #[test]
    fn summaries_accumulate() {
        let depot = InMemoryDepot::new(4096);
        let r = root(&depot);
        let mut h = r;
        for i in 0..(MAX_CHAIN_DEPTH + 5) {
            h = chain_origin(&depot, h, LinkSite::Frame(u64::from(i))).handle();
        }
        let chain = walk(&depot, h);
        assert_eq!(chain.len(), MAX_CHAIN_DEPTH as usize + 2);
        match &chain[MAX_CHAIN_DEPTH as usize].1 {
            OriginRecord::Summary { elided, origin } => {
                assert_eq!(*elided, 5);
                assert_eq!(*origin, r);
            }
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[test]
    fn extra_bits_survive_chaining() {
        let depot = InMemoryDepot::new(64);
        let r = root(&depot).with_extra(OriginHandle::EXTRA_AFTER_FREE);
        let h = chain_origin(&depot, r, LinkSite::Frame(7)).handle();
        assert!(h.is_after_free());
        assert_eq!(walk(&depot, h).len(), 2);
    }
}
