// src/services/sniffer.rs

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;

use crate::capture::{Frame, FrameSink};
use crate::config::AppConfig;
use crate::protocol::parser::Decoder;
use crate::protocol::types::{Event, TimedEvent};
use crate::packet_buffer::FrameShapes;
use crate::stream::TcpReassembler;

const PREVIEW_BYTES: usize = 32;
const PRUNE_EVERY_MS: u64 = 60_000;
const FLOW_IDLE_MS: u64 = 300_000;

/// Shared counters, readable while the capture thread runs.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    frames: AtomicU64,
    segments: AtomicU64,
    messages: AtomicU64,
    events: AtomicU64,
    unknown_opcodes: AtomicU64,
    decode_errors: AtomicU64,
    resyncs: AtomicU64,
    queue_drops: AtomicU64,
    server_switches: AtomicU64,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub frames: u64,
    pub segments: u64,
    pub messages: u64,
    pub events: u64,
    pub unknown_opcodes: u64,
    pub decode_errors: u64,
    pub resyncs: u64,
    pub queue_drops: u64,
    pub server_switches: u64,
}

impl PipelineCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            segments: self.segments.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            unknown_opcodes: self.unknown_opcodes.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            server_switches: self.server_switches.load(Ordering::Relaxed),
        }
    }
}

type Endpoint = (IpAddr, u16);

#[derive(Debug, PartialEq, Eq)]
enum ServerCheck {
    Current,
    Foreign,
    Switched,
}

/// Locks onto one game server endpoint and follows it when the client moves
/// to another server (zone change, reconnect).
#[derive(Debug)]
struct ServerTracker {
    current: Option<Endpoint>,
    candidate: Option<Endpoint>,
    streak: u32,
    threshold: u32,
}

impl ServerTracker {
    fn new(threshold: u32) -> Self {
        Self { current: None, candidate: None, streak: 0, threshold }
    }

    fn check(&mut self, endpoint: Endpoint, has_payload: bool) -> ServerCheck {
        let Some(current) = self.current else {
            if !has_payload {
                return ServerCheck::Foreign;
            }
            log::info!("[Sniffer] Game server identified: {}:{}", endpoint.0, endpoint.1);
            self.current = Some(endpoint);
            return ServerCheck::Current;
        };

        if current == endpoint {
            self.candidate = None;
            self.streak = 0;
            return ServerCheck::Current;
        }
        if !has_payload {
            return ServerCheck::Foreign;
        }

        if self.candidate == Some(endpoint) {
            self.streak += 1;
        } else {
            self.candidate = Some(endpoint);
            self.streak = 1;
        }
        if self.streak >= self.threshold {
            log::info!(
                "[Sniffer] Server switch {}:{} -> {}:{}",
                current.0,
                current.1,
                endpoint.0,
                endpoint.1
            );
            self.current = Some(endpoint);
            self.candidate = None;
            self.streak = 0;
            return ServerCheck::Switched;
        }
        ServerCheck::Foreign
    }
}

/// Runs on the capture thread: frame -> TCP segment -> reassembly -> framing
/// -> decode -> bounded queue. Never blocks.
pub struct PacketPipeline {
    server_ports: HashSet<u16>,
    reassembler: TcpReassembler,
    decoder: Decoder,
    server: ServerTracker,
    tx: Sender<TimedEvent>,
    counters: Arc<PipelineCounters>,
    last_prune_ms: u64,
}

impl PacketPipeline {
    pub fn new(config: &AppConfig, tx: Sender<TimedEvent>, counters: Arc<PipelineCounters>) -> Self {
        let shapes = FrameShapes::new(&config.opcodes, config.max_message_len);
        Self {
            server_ports: config.server_ports.iter().copied().collect(),
            reassembler: TcpReassembler::new(shapes, config.stall_timeout_ms, config.max_pending_bytes),
            decoder: Decoder::new(&config.opcodes, &config.boss_ids),
            server: ServerTracker::new(config.server_switch_threshold),
            tx,
            counters,
            last_prune_ms: 0,
        }
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.counters.clone()
    }

    fn handle_frame(&mut self, frame: &Frame<'_>) {
        PipelineCounters::bump(&self.counters.frames);
        let Some(segment) = frame.tcp_segment() else {
            return;
        };
        // Only the server -> client direction carries combat data
        if !self.server_ports.contains(&segment.flow.src_port) {
            return;
        }

        let endpoint = (segment.flow.src_ip, segment.flow.src_port);
        match self.server.check(endpoint, !segment.payload.is_empty()) {
            ServerCheck::Current => {}
            ServerCheck::Foreign => return,
            ServerCheck::Switched => {
                PipelineCounters::bump(&self.counters.server_switches);
                self.reassembler.reset();
                let boundary = TimedEvent::new(frame.ts_ms, Event::SessionBoundary { new_start_time: frame.ts_ms });
                enqueue(&self.tx, &self.counters, boundary);
            }
        }
        log::trace!("[Sniffer] {} seq={} len={}", segment.flow, segment.seq, segment.payload.len());
        PipelineCounters::bump(&self.counters.segments);

        if let Some(framer) = self.reassembler.push(&segment) {
            let decoder = &self.decoder;
            let resyncs_before = framer.resyncs();

            while let Some(message) = framer.next() {
                PipelineCounters::bump(&self.counters.messages);
                match decoder.decode(&message) {
                    Ok(Some(event)) => {
                        PipelineCounters::bump(&self.counters.events);
                        log::debug!("[Sniffer] Decoded {:?}", event);
                        enqueue(&self.tx, &self.counters, TimedEvent::new(segment.ts_ms, event));
                    }
                    Ok(None) => PipelineCounters::bump(&self.counters.unknown_opcodes),
                    Err(e) => {
                        PipelineCounters::bump(&self.counters.decode_errors);
                        log::warn!(
                            "[Sniffer] Dropping corrupt message on {}: {} (head={})",
                            segment.flow,
                            e,
                            hex::encode(&message[..message.len().min(PREVIEW_BYTES)])
                        );
                        // Its length field is suspect too; rescan its bytes
                        framer.reject();
                    }
                }
            }

            let resyncs = framer.resyncs() - resyncs_before;
            if resyncs > 0 {
                self.counters.resyncs.fetch_add(resyncs, Ordering::Relaxed);
            }
        }
        self.reassembler.close_if_finished(&segment.flow);

        if frame.ts_ms.saturating_sub(self.last_prune_ms) >= PRUNE_EVERY_MS {
            self.reassembler.prune_idle(frame.ts_ms, FLOW_IDLE_MS);
            self.last_prune_ms = frame.ts_ms;
        }
    }
}

impl FrameSink for PacketPipeline {
    fn on_frame(&mut self, frame: &Frame<'_>) {
        self.handle_frame(frame);
    }

    fn on_stop(&mut self) {
        self.reassembler.reset();
        let c = self.counters.snapshot();
        log::info!(
            "[Sniffer] Stopped: {} frames, {} segments, {} messages, {} events, {} unknown, {} corrupt, {} resyncs, {} dropped",
            c.frames,
            c.segments,
            c.messages,
            c.events,
            c.unknown_opcodes,
            c.decode_errors,
            c.resyncs,
            c.queue_drops
        );
    }
}

fn enqueue(tx: &Sender<TimedEvent>, counters: &PipelineCounters, timed: TimedEvent) {
    match tx.try_send(timed) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            let dropped = counters.queue_drops.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                log::warn!("[Sniffer] Event queue full, {} events dropped so far", dropped);
            }
        }
        Err(TrySendError::Disconnected(_)) => {
            log::trace!("[Sniffer] Event queue closed, dropping event");
        }
    }
}
