// src/stream.rs

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

use crate::packet_buffer::{FrameShapes, PacketBuffer, HEADER_LEN};

/// Direction-sensitive TCP flow identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}:{}", self.src_ip, self.src_port, self.dst_ip, self.dst_port)
    }
}

/// One TCP segment as seen on the wire, borrowed from the captured frame.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub flow: FlowKey,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: &'a [u8],
    pub ts_ms: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub retransmitted: u64,
    pub out_of_order: u64,
    pub gaps_abandoned: u64,
    pub flows_reset: u64,
}

#[derive(Debug)]
struct FlowState {
    next_seq: Option<u32>,
    pending: BTreeMap<u32, Vec<u8>>,
    pending_bytes: usize,
    gap_since_ms: Option<u64>,
    last_seen_ms: u64,
    finished: bool,
    framer: PacketBuffer,
}

impl FlowState {
    fn new(framer: PacketBuffer, now_ms: u64) -> Self {
        Self {
            next_seq: None,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            gap_since_ms: None,
            last_seen_ms: now_ms,
            finished: false,
            framer,
        }
    }

    fn append(&mut self, data: &[u8], ts_ms: u64) {
        self.framer.add(data, ts_ms);
        if let Some(next) = self.next_seq.as_mut() {
            *next = next.wrapping_add(data.len() as u32);
        }
    }

    // Buffers a segment that cannot be appended yet, keeping the longer copy
    // when the same sequence number arrives twice.
    fn hold(&mut self, seq: u32, data: &[u8]) {
        if self.pending.get(&seq).is_some_and(|existing| existing.len() >= data.len()) {
            return;
        }
        if let Some(old) = self.pending.insert(seq, data.to_vec()) {
            self.pending_bytes -= old.len();
        }
        self.pending_bytes += data.len();
    }

    // Held segments in sequence order, compared relative to one of them so
    // the order survives wraparound.
    fn held_in_order(&self) -> Vec<u32> {
        let Some(&pivot) = self.pending.keys().next() else { return Vec::new() };
        let mut seqs: Vec<u32> = self.pending.keys().copied().collect();
        seqs.sort_by_key(|&seq| seq.wrapping_sub(pivot) as i32);
        seqs
    }

    // First held segment that starts on a message header, reading across
    // contiguous segments when the header is split.
    fn find_anchor(&self) -> Option<u32> {
        self.held_in_order().into_iter().find(|&start| {
            let mut head = Vec::with_capacity(HEADER_LEN);
            let mut at = start;
            while head.len() < HEADER_LEN {
                let Some(chunk) = self.pending.get(&at) else { break };
                let take = chunk.len().min(HEADER_LEN - head.len());
                head.extend_from_slice(&chunk[..take]);
                at = at.wrapping_add(chunk.len() as u32);
            }
            self.framer.shapes().is_header(&head)
        })
    }

    // Moves every buffered segment that is now contiguous into the framer.
    fn drain_pending(&mut self, ts_ms: u64) -> bool {
        let mut delivered = false;
        while let Some(next) = self.next_seq {
            let ready = self.pending.keys().copied().find(|&seq| !seq_after(seq, next));
            let Some(seq) = ready else { break };
            let Some(data) = self.pending.remove(&seq) else { break };
            self.pending_bytes -= data.len();

            let overlap = next.wrapping_sub(seq) as usize;
            if overlap < data.len() {
                self.append(&data[overlap..], ts_ms);
                delivered = true;
            }
        }
        if self.pending.is_empty() {
            self.gap_since_ms = None;
        }
        delivered
    }

    // Gives up on the missing range and continues from the earliest buffered
    // segment. The partial message in the framer cannot complete any more.
    // On a flow that never anchored, the earliest held segment becomes the
    // anchor and the framer scans for the first header.
    fn skip_gap(&mut self, ts_ms: u64) -> bool {
        let earliest = match self.next_seq {
            Some(next) => self.pending.keys().copied().min_by_key(|&seq| seq.wrapping_sub(next)),
            None => self.held_in_order().first().copied(),
        };
        let Some(earliest) = earliest else { return false };

        self.framer.clear();
        self.framer.begin_resync();
        self.next_seq = Some(earliest);
        self.gap_since_ms = None;
        self.drain_pending(ts_ms)
    }
}

/// `a` comes strictly after `b` in sequence space (RFC 1982 style).
fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Per-flow TCP reassembly feeding one [`PacketBuffer`] per flow.
pub struct TcpReassembler {
    flows: HashMap<FlowKey, FlowState>,
    shapes: FrameShapes,
    stall_timeout_ms: u64,
    max_pending_bytes: usize,
    stats: ReassemblyStats,
}

impl TcpReassembler {
    pub fn new(shapes: FrameShapes, stall_timeout_ms: u64, max_pending_bytes: usize) -> Self {
        Self {
            flows: HashMap::new(),
            shapes,
            stall_timeout_ms,
            max_pending_bytes,
            stats: ReassemblyStats::default(),
        }
    }

    /// Feeds one segment. Returns the flow's framer when new contiguous bytes
    /// were appended to it, so the caller can pull complete messages.
    pub fn push(&mut self, seg: &Segment<'_>) -> Option<&mut PacketBuffer> {
        if seg.rst {
            if self.flows.remove(&seg.flow).is_some() {
                log::debug!("[Stream] RST on {}, dropping flow", seg.flow);
            }
            return None;
        }

        let (shapes, stall) = (&self.shapes, self.stall_timeout_ms);
        let state = self
            .flows
            .entry(seg.flow)
            .or_insert_with(|| FlowState::new(PacketBuffer::new(shapes.clone(), stall), seg.ts_ms));
        state.last_seen_ms = seg.ts_ms;
        if seg.fin {
            state.finished = true;
        }

        if seg.syn {
            // New connection on a reused tuple: forget whatever came before.
            state.pending.clear();
            state.pending_bytes = 0;
            state.gap_since_ms = None;
            state.framer.clear();
            state.next_seq = Some(seg.seq.wrapping_add(1));
            return None; // Game data never rides on the handshake
        }
        if seg.payload.is_empty() {
            return None;
        }

        let Some(next) = state.next_seq else {
            // Joined mid-stream without a SYN: hold segments until one starts
            // on a message header, so a first half that arrives late still
            // lands in front of its second half.
            state.hold(seg.seq, seg.payload);
            let gap_since = *state.gap_since_ms.get_or_insert(seg.ts_ms);
            let waited = seg.ts_ms.saturating_sub(gap_since);

            let delivered = if let Some(anchor) = state.find_anchor() {
                log::debug!("[Stream] Anchored {} at seq={}", seg.flow, anchor);
                state.next_seq = Some(anchor);
                state.drain_pending(seg.ts_ms)
            } else if state.pending_bytes > self.max_pending_bytes || waited > self.stall_timeout_ms {
                log::warn!(
                    "[Stream] No message header on {} ({} bytes held, waited {} ms). Anchoring at earliest segment.",
                    seg.flow,
                    state.pending_bytes,
                    waited
                );
                state.skip_gap(seg.ts_ms)
            } else {
                false
            };
            if !delivered {
                return None;
            }
            return self.flows.get_mut(&seg.flow).map(|state| &mut state.framer);
        };
        let mut seq = seg.seq;
        let mut data = seg.payload;

        // Retransmission: trim bytes already delivered.
        if seq_after(next, seq) {
            let overlap = next.wrapping_sub(seq) as usize;
            if overlap >= data.len() {
                self.stats.retransmitted += 1;
                log::trace!("[Stream] Duplicate segment seq={} on {}", seg.seq, seg.flow);
                return None;
            }
            data = &data[overlap..];
            seq = next;
        }

        let delivered = if seq == next {
            state.append(data, seg.ts_ms);
            state.drain_pending(seg.ts_ms);
            true
        } else {
            self.stats.out_of_order += 1;
            state.hold(seq, data);
            let gap_since = *state.gap_since_ms.get_or_insert(seg.ts_ms);

            let overflow = state.pending_bytes > self.max_pending_bytes;
            let stale = seg.ts_ms.saturating_sub(gap_since) > self.stall_timeout_ms;
            if overflow || stale {
                log::warn!(
                    "[Stream] Abandoning gap at seq={} on {} ({} bytes buffered, waited {} ms)",
                    next,
                    seg.flow,
                    state.pending_bytes,
                    seg.ts_ms.saturating_sub(gap_since)
                );
                self.stats.gaps_abandoned += 1;
                state.skip_gap(seg.ts_ms)
            } else {
                false
            }
        };

        if delivered {
            self.flows.get_mut(&seg.flow).map(|state| &mut state.framer)
        } else {
            None
        }
    }

    /// Drops a flow that has seen FIN once its remaining bytes were consumed.
    pub fn close_if_finished(&mut self, flow: &FlowKey) {
        if self.flows.get(flow).is_some_and(|state| state.finished) {
            self.flows.remove(flow);
            log::debug!("[Stream] FIN on {}, flow closed", flow);
        }
    }

    /// Drops flows with no traffic for `idle_ms`.
    pub fn prune_idle(&mut self, now_ms: u64, idle_ms: u64) {
        let before = self.flows.len();
        self.flows.retain(|_, state| now_ms.saturating_sub(state.last_seen_ms) <= idle_ms);
        let removed = before - self.flows.len();
        if removed > 0 {
            log::debug!("[Stream] Pruned {} idle flows", removed);
        }
    }

    /// Forgets every flow (server switch, device switch).
    pub fn reset(&mut self) {
        if !self.flows.is_empty() {
            self.stats.flows_reset += self.flows.len() as u64;
            self.flows.clear();
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }
}
