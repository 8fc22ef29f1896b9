// src/capture.rs

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use etherparse::{NetHeaders, PacketHeaders, TransportHeader};
use pcap::{Active, Capture, Device, Linktype};
use serde::Serialize;

use crate::config::AppConfig;
use crate::error::CaptureError;
use crate::stream::{FlowKey, Segment};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub description: Option<String>,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Auto,
    Named(String),
}

impl FromStr for DeviceSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            Ok(DeviceSelector::Auto)
        } else {
            Ok(DeviceSelector::Named(s.to_string()))
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Auto => f.write_str("auto"),
            DeviceSelector::Named(name) => f.write_str(name),
        }
    }
}

/// Link-layer framing of a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    RawIp,
    /// BSD loopback: 4 byte address family header.
    Loopback,
    /// Linux "any" device: 16 byte cooked header.
    LinuxSll,
    Unsupported(i32),
}

impl From<Linktype> for LinkKind {
    fn from(linktype: Linktype) -> Self {
        match linktype.0 {
            1 => LinkKind::Ethernet,
            12 | 14 | 101 | 228 | 229 => LinkKind::RawIp,
            0 | 108 => LinkKind::Loopback,
            113 => LinkKind::LinuxSll,
            other => LinkKind::Unsupported(other),
        }
    }
}

/// One captured link-layer frame, borrowed from the capture handle.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub link: LinkKind,
    pub data: &'a [u8],
    pub ts_ms: u64,
}

impl<'a> Frame<'a> {
    /// Extracts the TCP segment carried by this frame, if any.
    pub fn tcp_segment(&self) -> Option<Segment<'a>> {
        let headers = match self.link {
            LinkKind::Ethernet => PacketHeaders::from_ethernet_slice(self.data).ok()?,
            LinkKind::RawIp => PacketHeaders::from_ip_slice(self.data).ok()?,
            LinkKind::Loopback => PacketHeaders::from_ip_slice(self.data.get(4..)?).ok()?,
            LinkKind::LinuxSll => PacketHeaders::from_ip_slice(self.data.get(16..)?).ok()?,
            LinkKind::Unsupported(_) => return None,
        };

        let (src_ip, dst_ip) = match &headers.net {
            Some(NetHeaders::Ipv4(ip, _)) => {
                (IpAddr::V4(Ipv4Addr::from(ip.source)), IpAddr::V4(Ipv4Addr::from(ip.destination)))
            }
            Some(NetHeaders::Ipv6(ip, _)) => {
                (IpAddr::V6(Ipv6Addr::from(ip.source)), IpAddr::V6(Ipv6Addr::from(ip.destination)))
            }
            _ => return None,
        };
        let Some(TransportHeader::Tcp(tcp)) = &headers.transport else {
            return None;
        };

        Some(Segment {
            flow: FlowKey { src_ip, src_port: tcp.source_port, dst_ip, dst_port: tcp.destination_port },
            seq: tcp.sequence_number,
            syn: tcp.syn,
            fin: tcp.fin,
            rst: tcp.rst,
            payload: headers.payload.slice(),
            ts_ms: self.ts_ms,
        })
    }
}

/// Receives frames on the capture thread. Implementations must not block.
pub trait FrameSink: Send + 'static {
    fn on_frame(&mut self, frame: &Frame<'_>);

    /// Called once on the capture thread after the last frame was delivered.
    fn on_stop(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub server_ports: Vec<u16>,
    pub probe_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl From<&AppConfig> for CaptureSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            server_ports: config.server_ports.clone(),
            probe_timeout_ms: config.probe_timeout_ms,
            read_timeout_ms: config.read_timeout_ms,
        }
    }
}

impl CaptureSettings {
    pub fn bpf_filter(&self) -> String {
        let ports: Vec<String> = self.server_ports.iter().map(|port| format!("port {}", port)).collect();
        format!("tcp and ({})", ports.join(" or "))
    }

    fn is_game_segment(&self, segment: &Segment<'_>) -> bool {
        !segment.payload.is_empty() && self.server_ports.contains(&segment.flow.src_port)
    }
}

struct Worker {
    device: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns at most one live capture thread.
pub struct CaptureSource {
    settings: CaptureSettings,
    // Held for the whole of start() and stop(), which makes them mutually exclusive.
    worker: Mutex<Option<Worker>>,
}

impl CaptureSource {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings, worker: Mutex::new(None) }
    }

    pub fn list_devices() -> Result<Vec<DeviceInfo>, CaptureError> {
        let devices = Device::list()?;
        Ok(devices
            .into_iter()
            .map(|d| DeviceInfo {
                addresses: d.addresses.iter().map(|a| a.addr.to_string()).collect(),
                name: d.name,
                description: d.desc,
            })
            .collect())
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().is_some()
    }

    pub fn current_device(&self) -> Option<String> {
        self.lock_worker().as_ref().map(|w| w.device.clone())
    }

    /// Opens the selected device and starts delivering frames to `sink` on a
    /// dedicated thread. Returns the name of the device that was opened.
    pub fn start<S: FrameSink>(&self, selector: &DeviceSelector, mut sink: S) -> Result<String, CaptureError> {
        let mut worker = self.lock_worker();
        if let Some(running) = worker.as_ref() {
            return Err(CaptureError::AlreadyRunning(running.device.clone()));
        }

        let device = match selector {
            DeviceSelector::Auto => self.probe_devices()?,
            DeviceSelector::Named(name) => {
                let known = Device::list()?.into_iter().any(|d| &d.name == name);
                if !known {
                    return Err(CaptureError::DeviceNotFound(name.clone()));
                }
                name.clone()
            }
        };

        let mut cap = open_capture(&device, &self.settings)?;
        let link = LinkKind::from(cap.get_datalink());
        if let LinkKind::Unsupported(code) = link {
            log::warn!("[Capture] {} uses unsupported link type {}; frames will be ignored", device, code);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread_device = device.clone();
        let handle = thread::spawn(move || {
            log::info!("[Capture] Listening on {} ({:?})", thread_device, link);
            while !stop_flag.load(Ordering::SeqCst) {
                match cap.next_packet() {
                    Ok(packet) => {
                        let ts_ms = packet_ts_ms(packet.header);
                        sink.on_frame(&Frame { link, data: packet.data, ts_ms });
                    }
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        log::error!("[Capture] Read error on {}: {}", thread_device, e);
                        break;
                    }
                }
            }
            sink.on_stop();
            drop(cap); // Release the OS handle before stop() returns
            log::info!("[Capture] Capture thread for {} terminated", thread_device);
        });

        *worker = Some(Worker { device: device.clone(), stop, handle });
        Ok(device)
    }

    /// Stops delivery and waits for the capture thread to exit. No frame is
    /// delivered after this returns.
    pub fn stop(&self) {
        let mut worker = self.lock_worker();
        if let Some(running) = worker.take() {
            running.stop.store(true, Ordering::SeqCst);
            if running.handle.join().is_err() {
                log::error!("[Capture] Capture thread for {} panicked", running.device);
            }
        }
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Listens on every adapter at once and returns the first one that carries
    // game server traffic before the probe deadline.
    fn probe_devices(&self) -> Result<String, CaptureError> {
        let devices = Device::list()?;
        let timeout_ms = self.settings.probe_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let found = AtomicBool::new(false);
        let (tx, rx) = crossbeam_channel::bounded::<String>(devices.len().max(1));

        log::info!("[Capture] Probing {} adapters for game traffic ({} ms)", devices.len(), timeout_ms);
        thread::scope(|scope| {
            for device in devices {
                let tx = tx.clone();
                let found = &found;
                let settings = &self.settings;
                scope.spawn(move || {
                    if let Some(name) = probe_one(&device.name, settings, deadline, found) {
                        found.store(true, Ordering::SeqCst);
                        let _ = tx.send(name);
                    }
                });
            }
        });
        drop(tx);

        match rx.try_recv() {
            Ok(name) => {
                log::info!("[Capture] Auto-selected {}", name);
                Ok(name)
            }
            Err(_) => Err(CaptureError::NoDeviceFound { timeout_ms }),
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_capture(device: &str, settings: &CaptureSettings) -> Result<Capture<Active>, CaptureError> {
    let mut cap = Capture::from_device(device)
        .map_err(|e| CaptureError::from_open(device, e))?
        .promisc(true)
        .snaplen(65535)
        .immediate_mode(true)
        .timeout(settings.read_timeout_ms.min(i32::MAX as u64) as i32)
        .open()
        .map_err(|e| CaptureError::from_open(device, e))?;
    cap.filter(&settings.bpf_filter(), true)?;
    Ok(cap)
}

fn probe_one(device: &str, settings: &CaptureSettings, deadline: Instant, found: &AtomicBool) -> Option<String> {
    let mut cap = match open_capture(device, settings) {
        Ok(cap) => cap,
        Err(e) => {
            log::debug!("[Capture] Skipping {} during probe: {}", device, e);
            return None;
        }
    };
    let link = LinkKind::from(cap.get_datalink());

    while Instant::now() < deadline && !found.load(Ordering::SeqCst) {
        match cap.next_packet() {
            Ok(packet) => {
                let ts_ms = packet_ts_ms(packet.header);
                let frame = Frame { link, data: packet.data, ts_ms };
                if frame.tcp_segment().is_some_and(|seg| settings.is_game_segment(&seg)) {
                    return Some(device.to_string());
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                log::debug!("[Capture] Probe read on {} failed: {}", device, e);
                return None;
            }
        }
    }
    None
}

fn packet_ts_ms(header: &pcap::PacketHeader) -> u64 {
    timeval_ms(header.ts.tv_sec as i64, header.ts.tv_usec as i64)
}

fn timeval_ms(tv_sec: i64, tv_usec: i64) -> u64 {
    (tv_sec.max(0) as u64) * 1000 + (tv_usec.max(0) as u64) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn settings() -> CaptureSettings {
        CaptureSettings { server_ports: vec![5003, 5004], probe_timeout_ms: 3000, read_timeout_ms: 100 }
    }

    #[test]
    fn selector_parses_auto_and_names() {
        assert_eq!("auto".parse::<DeviceSelector>().unwrap(), DeviceSelector::Auto);
        assert_eq!("AUTO".parse::<DeviceSelector>().unwrap(), DeviceSelector::Auto);
        assert_eq!("eth0".parse::<DeviceSelector>().unwrap(), DeviceSelector::Named("eth0".into()));
        assert_eq!(DeviceSelector::Named("en0".into()).to_string(), "en0");
    }

    #[test]
    fn filter_covers_every_server_port() {
        assert_eq!(settings().bpf_filter(), "tcp and (port 5003 or port 5004)");
    }

    #[test]
    fn linktype_mapping() {
        assert_eq!(LinkKind::from(Linktype(1)), LinkKind::Ethernet);
        assert_eq!(LinkKind::from(Linktype(101)), LinkKind::RawIp);
        assert_eq!(LinkKind::from(Linktype(0)), LinkKind::Loopback);
        assert_eq!(LinkKind::from(Linktype(113)), LinkKind::LinuxSll);
        assert_eq!(LinkKind::from(Linktype(127)), LinkKind::Unsupported(127));
    }

    #[test]
    fn extracts_segment_from_ethernet_frame() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4([172, 65, 10, 1], [192, 168, 1, 2], 64)
            .tcp(5003, 50000, 123_456, 1024)
            .psh();
        let payload = b"game bytes";
        let mut bytes = Vec::new();
        builder.write(&mut bytes, payload).unwrap();

        let frame = Frame { link: LinkKind::Ethernet, data: &bytes, ts_ms: 42 };
        let seg = frame.tcp_segment().unwrap();

        assert_eq!(seg.flow.src_ip, IpAddr::V4(Ipv4Addr::new(172, 65, 10, 1)));
        assert_eq!(seg.flow.src_port, 5003);
        assert_eq!(seg.flow.dst_port, 50000);
        assert_eq!(seg.seq, 123_456);
        assert_eq!(seg.payload, payload);
        assert_eq!(seg.ts_ms, 42);
        assert!(!seg.syn && !seg.fin && !seg.rst);
        assert!(settings().is_game_segment(&seg));
    }

    #[test]
    fn extracts_segment_from_raw_and_loopback_frames() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).tcp(5004, 40000, 9, 512).syn();
        let mut raw = Vec::new();
        builder.write(&mut raw, &[]).unwrap();

        let seg = Frame { link: LinkKind::RawIp, data: &raw, ts_ms: 0 }.tcp_segment().unwrap();
        assert!(seg.syn);
        assert!(!settings().is_game_segment(&seg)); // no payload

        let mut looped = vec![2, 0, 0, 0];
        looped.extend_from_slice(&raw);
        let seg = Frame { link: LinkKind::Loopback, data: &looped, ts_ms: 0 }.tcp_segment().unwrap();
        assert_eq!(seg.flow.src_port, 5004);
    }

    #[test]
    fn client_to_server_traffic_is_not_game_traffic() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([192, 168, 1, 2], [172, 65, 10, 1], 64)
            .tcp(50000, 5003, 1, 1024);
        let mut bytes = Vec::new();
        builder.write(&mut bytes, b"login").unwrap();

        let seg = Frame { link: LinkKind::Ethernet, data: &bytes, ts_ms: 0 }.tcp_segment().unwrap();
        assert!(!settings().is_game_segment(&seg));
    }

    #[test]
    fn non_tcp_frames_are_ignored() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([1, 1, 1, 1], [2, 2, 2, 2], 64)
            .udp(5003, 5003);
        let mut bytes = Vec::new();
        builder.write(&mut bytes, b"dns?").unwrap();

        assert!(Frame { link: LinkKind::Ethernet, data: &bytes, ts_ms: 0 }.tcp_segment().is_none());
        assert!(Frame { link: LinkKind::Unsupported(127), data: &bytes, ts_ms: 0 }.tcp_segment().is_none());
    }
}
