// src/sniff.rs
use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::ClassifierConfig;
use crate::counters::{CategoryCounters, Dimension, Dimensions};
use crate::detection::Classifier;
use crate::models::domain::CounterPair;
use crate::parser;

/// One captured frame as handed over by the capture reader.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    /// Bytes actually captured; may be less than `data.len()`.
    pub captured_len: u32,
    /// Length on the wire.
    pub wire_len: u32,
    pub timestamp: f64,
}

impl Frame {
    /// A frame captured in full.
    pub fn whole(data: Vec<u8>, timestamp: f64) -> Self {
        let len = data.len() as u32;
        Self {
            data,
            captured_len: len,
            wire_len: len,
            timestamp,
        }
    }
}

/// Classifies and counts the frames of one capture file at a time.
pub struct CaptureAnalyzer {
    classifier: Classifier,
    counters: CategoryCounters,
    frames_seen: u64,
}

impl CaptureAnalyzer {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            classifier: Classifier::new(config),
            counters: CategoryCounters::new(),
            frames_seen: 0,
        }
    }

    pub fn process_frame(&mut self, frame: &Frame) {
        let captured = (frame.captured_len as usize).min(frame.data.len());
        let raw = &frame.data[..captured];
        let decoded = parser::decode(raw, captured);
        let category = self.classifier.classify(&decoded, raw, frame.wire_len);
        self.counters
            .record(&category, &Dimensions::from(&decoded), u64::from(frame.wire_len));
        self.frames_seen += 1;
    }

    pub fn process_frames<I>(&mut self, frames: I) -> u64
    where
        I: IntoIterator<Item = Frame>,
    {
        let before = self.frames_seen;
        for frame in frames {
            self.process_frame(&frame);
        }
        let processed = self.frames_seen - before;
        debug!(frames = processed, categories = self.counters.len(), "capture pass complete");
        processed
    }

    pub fn counters(&self) -> &CategoryCounters {
        &self.counters
    }

    /// Finish the current file, handing over its category totals.
    pub fn finish(&mut self) -> HashMap<String, CounterPair> {
        self.frames_seen = 0;
        self.counters.drain()
    }

    /// Start a new file: no counts leak from the previous one.
    pub fn reset(&mut self) {
        self.counters.reset();
        self.frames_seen = 0;
    }

    /// Log the busiest values per dimension of the `n` largest categories.
    pub fn report_detail(&self, n: usize) {
        let mut categories: Vec<_> = self.counters.iter().collect();
        categories.sort_by(|a, b| b.1.total.packets.cmp(&a.1.total.packets));
        for (name, stats) in categories.into_iter().take(n) {
            info!(
                category = %name,
                packets = stats.total.packets,
                kbytes = stats.total.bytes / 1000,
                "category totals"
            );
            for dimension in [
                Dimension::SrcIp,
                Dimension::DstIp,
                Dimension::SrcPort,
                Dimension::DstPort,
                Dimension::ProtoDstPort,
                Dimension::Protocol,
            ] {
                for (value, pair) in stats.top(dimension, 10) {
                    info!(
                        category = %name,
                        ?dimension,
                        %value,
                        packets = pair.packets,
                        kbytes = pair.bytes / 1000,
                        "top value"
                    );
                }
            }
        }
    }
}

#[cfg(feature = "capture")]
pub use reader::{read_capture, spawn_reader};

#[cfg(feature = "capture")]
mod reader {
    use std::path::{Path, PathBuf};
    use std::thread::{self, JoinHandle};

    use crossbeam_channel::{bounded, Receiver, Sender};
    use pcap::{Capture, Offline};
    use tracing::warn;

    use super::Frame;
    use crate::error::Result;

    const CHANNEL_DEPTH: usize = 4096;

    /// Read every frame of a capture file into `sender`.
    pub fn read_capture(path: &Path, sender: Sender<Frame>) -> Result<()> {
        let mut cap = open_capture(path)?;
        loop {
            match cap.next_packet() {
                Ok(packet) => {
                    let frame = Frame {
                        data: packet.data.to_vec(),
                        captured_len: packet.header.caplen,
                        wire_len: packet.header.len,
                        timestamp: packet.header.ts.tv_sec as f64
                            + packet.header.ts.tv_usec as f64 / 1e6,
                    };
                    if sender.send(frame).is_err() {
                        // receiver hung up, nothing left to do
                        return Ok(());
                    }
                }
                Err(pcap::Error::NoMorePackets) => return Ok(()),
                Err(e) => {
                    warn!(path = %path.display(), "stopping at unreadable frame: {}", e);
                    return Ok(());
                }
            }
        }
    }

    fn open_capture(path: &Path) -> Result<Capture<Offline>> {
        Ok(Capture::from_file(path)?)
    }

    /// Read `path` on its own thread; frames arrive in capture order.
    pub fn spawn_reader(path: PathBuf) -> (JoinHandle<Result<()>>, Receiver<Frame>) {
        let (tx, rx) = bounded(CHANNEL_DEPTH);
        let handle = thread::spawn(move || read_capture(&path, tx));
        (handle, rx)
    }
}
