//! Scripted inquiry driver for tests.

use std::collections::VecDeque;

use tokio::sync::mpsc::UnboundedSender;

use super::{InquiryDriver, InquiryEvent};

/// Replays one list of addresses per cycle.
///
/// Each `start` emits `Started`, one `Discovered` per address and `Complete`.
/// Once the script is exhausted, `start` emits nothing and the probe idles.
#[derive(Debug, Default)]
pub struct ScriptedInquirer {
    cycles: VecDeque<Vec<String>>,
}

impl ScriptedInquirer {
    /// Create a driver from per-cycle address lists.
    pub fn new(cycles: Vec<Vec<String>>) -> Self {
        Self {
            cycles: cycles.into(),
        }
    }

    /// Cycles left to replay.
    pub fn remaining(&self) -> usize {
        self.cycles.len()
    }
}

impl InquiryDriver for ScriptedInquirer {
    fn start(&mut self, events: UnboundedSender<InquiryEvent>) {
        let Some(addresses) = self.cycles.pop_front() else {
            return;
        };
        let _ = events.send(InquiryEvent::Started);
        for address in addresses {
            let _ = events.send(InquiryEvent::Discovered {
                address,
                name: None,
            });
        }
        let _ = events.send(InquiryEvent::Complete);
    }
}
