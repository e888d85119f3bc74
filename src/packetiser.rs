//! Bus state tracking and packet grouping.
//!
//! The packetiser consumes framer records and maintains the analyzer's
//! view of the bus: VBus level, device connection, chirp handshake
//! progress and the current speed. Data records are collected into a
//! packet between a rising and a falling RxActive edge; SE0 intervals
//! are timed and classified into reset/EOP events.

use std::convert::TryFrom;
use std::fmt;
use std::mem;

use num_enum::TryFromPrimitive;

use crate::time::tics_to_ns;
use crate::{Message, Packet, Record, RecordKind, Tic};

/// A bus event byte, as emitted by the analyzer front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum BusEvent {
    LsDeviceConnection = 0x0b,
    FsDeviceConnection = 0x0f,
    DeviceChirp = 0x15,
    HostChirp = 0x18,
    HsIdle = 0x24,
    OtgSessionRequest = 0x62,
    OtgHnp = 0x69,
    CapturePaused = 0xd0,
    CaptureResumed = 0xd1,
    CaptureStarted = 0xe0,
    CaptureStoppedFifo = 0xf0,
    CaptureStoppedUser = 0xf1,
}

impl fmt::Display for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusEvent::LsDeviceConnection => "LS device connection",
            BusEvent::FsDeviceConnection => "FS device connection",
            BusEvent::DeviceChirp => "Device chirp",
            BusEvent::HostChirp => "Host chirp",
            BusEvent::HsIdle => "HS idle",
            BusEvent::OtgSessionRequest => "OTG Session request",
            BusEvent::OtgHnp => "OTG HNP (Host-role changed)",
            BusEvent::CapturePaused => "Capture paused",
            BusEvent::CaptureResumed => "Capture resumed",
            BusEvent::CaptureStarted => "Capture started",
            BusEvent::CaptureStoppedFifo => "Capture stopped (fifo)",
            BusEvent::CaptureStoppedUser => "Capture stopped (user)",
        })
    }
}

/// The caption an event byte surfaces as.
pub fn describe_event(byte: u8) -> String {
    match BusEvent::try_from(byte) {
        Ok(event) => event.to_string(),
        Err(_) => format!("(unknown event {:#04x})", byte),
    }
}

/// The D+/D- line state reported in RxCmd bits 0-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LineState {
    Se0,
    J,
    K,
    Se1,
}

/// One ULPI RxCmd status byte. See the ISP1505 datasheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RxCmd(pub u8);

impl RxCmd {
    pub fn line_state(self) -> LineState {
        match self.0 & 0x3 {
            0x0 => LineState::Se0,
            0x1 => LineState::J,
            0x2 => LineState::K,
            _ => LineState::Se1,
        }
    }

    /// The raw 2-bit VBus comparator field (bits 2-3).
    pub fn vbus(self) -> u8 {
        self.0 & 0x0c
    }

    pub fn rx_active(self) -> bool {
        self.0 & 0x10 != 0
    }

    /// RxEvent encoding `10`: the PHY saw the device go away.
    pub fn host_disconnect(self) -> bool {
        self.0 & 0x30 == 0x20
    }

    /// RxEvent encoding `11`: receive error, RxActive still asserted.
    pub fn rx_error(self) -> bool {
        self.0 & 0x30 == 0x30
    }

    /// OTG-level caption for the VBus comparator state.
    pub fn vbus_label(self) -> &'static str {
        match self.vbus() {
            0x00 => "OTG VBus off",
            0x04 => "OTG Session end",
            0x08 => "OTG Session start",
            _ => "OTG VBus on",
        }
    }

    /// Long-form caption, the raw dump tool's rendering.
    pub fn describe(self) -> String {
        let mut parts: Vec<&'static str> = Vec::new();
        if self.0 & 0x01 != 0 {
            parts.push("DATA0");
        }
        if self.0 & 0x02 != 0 {
            parts.push("DATA1");
        }
        parts.push(match self.vbus() {
            0x00 => "VBUS < VB_SESS_END",
            0x04 => "VB_SESS_END <= VBUS < VB_SESS_VLD",
            0x08 => "VB_SESS_VLD <= VBUS < VA_VBUS_VLD",
            _ => "VA_VBUS_VLD <= VBUS",
        });
        match self.0 & 0x30 {
            0x10 => parts.push("RxActive"),
            0x20 => parts.push("HostDisconnect"),
            0x30 => parts.push("RxError RxActive"),
            _ => {}
        }
        parts.join(" ")
    }
}

/// The capture reported its own end; the pipeline is done.
///
/// Not an error: the driver is expected to catch this and propagate
/// `stop` through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureDone;

/// What the packetiser hands back for each record batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Surface to the observer.
    Message(Tic, Message),

    /// Push down the packet pipeline.
    Packet(Packet),
}

// SE0 classification thresholds, in nanoseconds.
const FS_TO_CHIRP_NS: u64 = 3_000_000;
const RESET_NS: u64 = 10_000_000;
const QUICK_RESET_NS: u64 = 2_500;
const LS_EOP_NS: u64 = 670;
const FS_EOP_NS: u64 = 82;

#[derive(Debug, Clone, Copy)]
struct ResetWindow {
    start: Tic,
    was_high_speed: bool,
}

/// Bus state machine. See the module documentation.
#[derive(Debug, Default)]
pub struct Packetiser {
    rx_active: bool,
    vbus: Option<u8>,
    connected: bool,
    full_speed_device: bool,
    device_chirped: bool,
    high_speed_device: bool,
    high_speed: bool,
    reset_window: Option<ResetWindow>,
    packet: Packet,
    deferred: Vec<(Tic, Message)>,
}

impl Packetiser {
    pub fn new() -> Packetiser {
        Packetiser::default()
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn high_speed(&self) -> bool {
        self.high_speed
    }

    /// Feeds one record, appending packets and observer messages to
    /// `out`. `Err(CaptureDone)` reports a terminal capture-stopped
    /// event; everything already appended remains valid.
    pub fn push(&mut self, record: Record, out: &mut Vec<Output>) -> Result<(), CaptureDone> {
        self.maybe_close_se0(record, out);
        match record.kind {
            RecordKind::Event => self.event(record.tic, record.payload, out),
            RecordKind::Data => {
                self.data(record.tic, record.payload);
                Ok(())
            }
            RecordKind::RxCmd => {
                self.rxcmd(record.tic, RxCmd(record.payload), out);
                Ok(())
            }
        }
    }

    /// Flushes a partially received packet and any messages held back
    /// by an open SE0 window.
    pub fn stop(&mut self, out: &mut Vec<Output>) {
        self.reset_window = None;
        for (tic, message) in self.deferred.drain(..) {
            out.push(Output::Message(tic, message));
        }
        if !self.packet.is_empty() {
            out.push(Output::Packet(mem::take(&mut self.packet)));
        }
    }

    /// Emits directly, or defers while an SE0 window is open so the
    /// window's classification can be reported first.
    fn surface(&mut self, tic: Tic, message: Message, out: &mut Vec<Output>) {
        if self.reset_window.is_some() {
            self.deferred.push((tic, message));
        } else {
            out.push(Output::Message(tic, message));
        }
    }

    /// An SE0 window closes on the first record that is neither an
    /// event nor an RxCmd still reporting SE0.
    fn maybe_close_se0(&mut self, record: Record, out: &mut Vec<Output>) {
        let window = match self.reset_window {
            Some(window) => window,
            None => return,
        };
        if record.kind == RecordKind::Event {
            return;
        }
        if record.kind == RecordKind::RxCmd
            && RxCmd(record.payload).line_state() == LineState::Se0
        {
            return;
        }
        self.reset_window = None;
        let duration = record.tic.saturating_sub(window.start);
        if let Some(message) = self.classify_se0(window, duration) {
            out.push(Output::Message(window.start, message));
        }
        for (tic, message) in self.deferred.drain(..) {
            out.push(Output::Message(tic, message));
        }
    }

    fn classify_se0(&self, window: ResetWindow, duration: Tic) -> Option<Message> {
        let ns = tics_to_ns(duration);
        if ns >= FS_TO_CHIRP_NS && self.full_speed_device {
            Some(Message::FsToChirp { duration })
        } else if ns >= RESET_NS || (ns >= QUICK_RESET_NS && !self.high_speed_device) {
            if window.was_high_speed && self.high_speed {
                // Indistinguishable from a normal HS idle entry.
                None
            } else {
                Some(Message::Reset { duration })
            }
        } else if ns >= LS_EOP_NS {
            Some(Message::LsEop { duration })
        } else if ns >= FS_EOP_NS {
            Some(Message::FsEop { duration })
        } else {
            None
        }
    }

    fn event(&mut self, tic: Tic, payload: u8, out: &mut Vec<Output>) -> Result<(), CaptureDone> {
        self.surface(tic, Message::Raw(describe_event(payload)), out);
        match BusEvent::try_from(payload) {
            Ok(BusEvent::LsDeviceConnection) => self.connected = true,
            Ok(BusEvent::FsDeviceConnection) => {
                self.connected = true;
                self.full_speed_device = true;
            }
            Ok(BusEvent::DeviceChirp) => self.device_chirped = true,
            Ok(BusEvent::HostChirp) => {
                if self.device_chirped {
                    self.high_speed_device = true;
                    self.high_speed = true;
                }
            }
            Ok(BusEvent::HsIdle) => self.high_speed = false,
            Ok(BusEvent::CaptureStoppedFifo) | Ok(BusEvent::CaptureStoppedUser) => {
                return Err(CaptureDone);
            }
            _ => {}
        }
        Ok(())
    }

    fn data(&mut self, tic: Tic, byte: u8) {
        debug_assert!(self.rx_active, "data byte outside RxActive");
        self.packet.push(tic, byte);
    }

    fn rxcmd(&mut self, tic: Tic, rxcmd: RxCmd, out: &mut Vec<Output>) {
        let rx_active = rxcmd.rx_active();
        if rx_active != self.rx_active {
            if rx_active {
                debug_assert!(self.packet.is_empty(), "packet spans RxActive gap");
            } else if !self.packet.is_empty() {
                out.push(Output::Packet(mem::take(&mut self.packet)));
            }
            self.rx_active = rx_active;
        }
        if rxcmd.host_disconnect() && self.connected {
            self.connected = false;
            self.full_speed_device = false;
            self.device_chirped = false;
            self.high_speed_device = false;
            self.high_speed = false;
            self.surface(tic, Message::Raw("Device disconnected".to_string()), out);
            return;
        }
        if self.reset_window.is_none()
            && !rx_active
            && rxcmd.line_state() == LineState::Se0
        {
            self.reset_window = Some(ResetWindow {
                start: tic,
                was_high_speed: self.high_speed,
            });
        }
        let vbus = rxcmd.vbus();
        if self.vbus != Some(vbus) {
            self.vbus = Some(vbus);
            self.surface(tic, Message::Raw(rxcmd.vbus_label().to_string()), out);
        }
    }
}
