use crate::{
    Connector, DeviceClient, DeviceEvent, Endpoint, EventSink, PinMode, Pull, RawCommand,
    ReportKind, Result, TransportError,
};
use async_trait::async_trait;
use serialport::SerialPort;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const BAUD_RATE: u32 = 57_600;

const DIGITAL_MESSAGE: u8 = 0x90;
const ANALOG_MESSAGE: u8 = 0xE0;
const REPORT_ANALOG: u8 = 0xC0;
const REPORT_DIGITAL: u8 = 0xD0;
const SET_PIN_MODE: u8 = 0xF4;
const SET_DIGITAL_PIN_VALUE: u8 = 0xF5;
const REPORT_VERSION: u8 = 0xF9;
const START_SYSEX: u8 = 0xF0;
const END_SYSEX: u8 = 0xF7;
const STRING_DATA: u8 = 0x71;
const REPORT_FIRMWARE: u8 = 0x79;
const EXTENDED_ANALOG: u8 = 0x6F;

/// StandardFirmata treats analog writes below this as degrees.
const SERVO_MIN_PULSE_US: u32 = 544;

/// A decoded message from the board.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Digital { port: u8, mask: u8 },
    Analog { channel: u8, value: u16 },
    Version { major: u8, minor: u8 },
    Firmware { major: u8, minor: u8, name: String },
    Text(String),
    Sysex { command: u8, body: Vec<u8> },
}

/// Incremental decoder for the Firmata byte stream.
#[derive(Debug, Default)]
pub struct FirmataParser {
    command: Option<u8>,
    data: Vec<u8>,
    in_sysex: bool,
}

impl FirmataParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(frame) = self.push(b) {
                out.push(frame);
            }
        }
        out
    }

    fn push(&mut self, b: u8) -> Option<Frame> {
        if self.in_sysex {
            if b == END_SYSEX {
                self.in_sysex = false;
                let body = std::mem::take(&mut self.data);
                return decode_sysex(body);
            }
            self.data.push(b);
            return None;
        }
        if b == START_SYSEX {
            self.in_sysex = true;
            self.command = None;
            self.data.clear();
            return None;
        }
        if b & 0x80 != 0 {
            // Only the three-byte messages the board sends unprompted are tracked.
            self.command = match b & 0xF0 {
                DIGITAL_MESSAGE | ANALOG_MESSAGE => Some(b),
                _ if b == REPORT_VERSION => Some(b),
                _ => None,
            };
            self.data.clear();
            return None;
        }
        let command = self.command?;
        self.data.push(b);
        if self.data.len() < 2 {
            return None;
        }
        let (lsb, msb) = (self.data[0], self.data[1]);
        self.data.clear();
        self.command = None;
        match command & 0xF0 {
            DIGITAL_MESSAGE => Some(Frame::Digital {
                port: command & 0x0F,
                mask: lsb | ((msb & 0x01) << 7),
            }),
            ANALOG_MESSAGE => Some(Frame::Analog {
                channel: command & 0x0F,
                value: u16::from(lsb) | (u16::from(msb) << 7),
            }),
            _ => Some(Frame::Version {
                major: lsb,
                minor: msb,
            }),
        }
    }
}

fn decode_sysex(body: Vec<u8>) -> Option<Frame> {
    let (&command, rest) = body.split_first()?;
    match command {
        REPORT_FIRMWARE if rest.len() >= 2 => Some(Frame::Firmware {
            major: rest[0],
            minor: rest[1],
            name: decode_7bit_text(&rest[2..]),
        }),
        STRING_DATA => Some(Frame::Text(decode_7bit_text(rest))),
        _ => Some(Frame::Sysex {
            command,
            body: rest.to_vec(),
        }),
    }
}

fn decode_7bit_text(pairs: &[u8]) -> String {
    pairs
        .chunks(2)
        .map(|c| {
            let lsb = c[0] & 0x7F;
            let msb = c.get(1).copied().unwrap_or(0) & 0x7F;
            char::from(lsb | (msb << 7))
        })
        .collect()
}

fn encode_7bit_text(text: &str, out: &mut Vec<u8>) {
    for b in text.bytes() {
        out.push(b & 0x7F);
        out.push((b >> 7) & 0x7F);
    }
}

fn mode_code(mode: PinMode) -> u8 {
    match mode {
        PinMode::Input => 0x00,
        PinMode::Output => 0x01,
        PinMode::Analog => 0x02,
        PinMode::Pwm => 0x03,
        PinMode::Servo => 0x04,
        PinMode::InputPullUp => 0x0B,
    }
}

fn pin_byte(pin: u32) -> Result<u8> {
    if pin < 128 {
        Ok(pin as u8)
    } else {
        Err(TransportError::Protocol(format!("pin {pin} out of range")))
    }
}

pub fn encode_set_mode(pin: u32, mode: PinMode) -> Result<Vec<u8>> {
    Ok(vec![SET_PIN_MODE, pin_byte(pin)?, mode_code(mode)])
}

pub fn encode_digital_write(pin: u32, high: bool) -> Result<Vec<u8>> {
    Ok(vec![SET_DIGITAL_PIN_VALUE, pin_byte(pin)?, u8::from(high)])
}

/// Analog (PWM/servo) write; pins above 15 or values above 14 bits use
/// the extended sysex form.
pub fn encode_analog_write(pin: u32, value: u32) -> Result<Vec<u8>> {
    let pin = pin_byte(pin)?;
    if value >= 1 << 21 {
        return Err(TransportError::Protocol(format!("value {value} too large")));
    }
    let (b0, b1, b2) = (
        (value & 0x7F) as u8,
        ((value >> 7) & 0x7F) as u8,
        ((value >> 14) & 0x7F) as u8,
    );
    if pin < 16 && value < 1 << 14 {
        Ok(vec![ANALOG_MESSAGE | pin, b0, b1])
    } else {
        Ok(vec![START_SYSEX, EXTENDED_ANALOG, pin, b0, b1, b2, END_SYSEX])
    }
}

pub fn encode_string(text: &str) -> Vec<u8> {
    let mut out = vec![START_SYSEX, STRING_DATA];
    encode_7bit_text(text, &mut out);
    out.push(END_SYSEX);
    out
}

pub fn encode_sysex(body: &[u8]) -> Result<Vec<u8>> {
    if body.is_empty() {
        return Err(TransportError::Protocol("empty sysex".into()));
    }
    if body.iter().any(|b| b & 0x80 != 0) {
        return Err(TransportError::Protocol("sysex bytes must be 7-bit".into()));
    }
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(START_SYSEX);
    out.extend_from_slice(body);
    out.push(END_SYSEX);
    Ok(out)
}

#[derive(Default)]
struct Board {
    ports: [u8; 16],
    analog: HashMap<u32, u32>,
    digital_subs: HashSet<u32>,
    analog_subs: HashSet<u32>,
    ready: bool,
}

struct Shared {
    board: Mutex<Board>,
    closing: AtomicBool,
}

impl Shared {
    fn board(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, frame: Frame, events: &EventSink) {
        match frame {
            Frame::Firmware { major, minor, name } => {
                let mut board = self.board();
                if !board.ready {
                    board.ready = true;
                    debug!(firmware = %name, major, minor, "firmata board ready");
                    let _ = events.send(DeviceEvent::Ready);
                }
            }
            Frame::Digital { port, mask } => {
                let mut board = self.board();
                let idx = usize::from(port);
                if idx < board.ports.len() {
                    board.ports[idx] = mask;
                }
                for bit in 0..8u32 {
                    let pin = u32::from(port) * 8 + bit;
                    if board.digital_subs.contains(&pin) {
                        let level = u32::from((mask >> bit) & 1);
                        let _ = events.send(DeviceEvent::Level { pin, level });
                    }
                }
            }
            Frame::Analog { channel, value } => {
                let pin = u32::from(channel);
                let mut board = self.board();
                board.analog.insert(pin, u32::from(value));
                if board.analog_subs.contains(&pin) {
                    let _ = events.send(DeviceEvent::Analog {
                        pin,
                        value: u32::from(value),
                    });
                }
            }
            Frame::Text(text) => {
                let _ = events.send(DeviceEvent::Text(text));
            }
            Frame::Version { major, minor } => {
                debug!(major, minor, "firmata protocol version");
            }
            Frame::Sysex { command, .. } => {
                debug!(command, "ignoring sysex reply");
            }
        }
    }
}

/// Opens Firmata boards on serial ports.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirmataConnector;

#[async_trait]
impl Connector for FirmataConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        events: EventSink,
    ) -> Result<Arc<dyn DeviceClient>> {
        let path = match endpoint {
            Endpoint::Serial { path } => path.clone(),
            other => {
                return Err(TransportError::Protocol(format!(
                    "firmata needs a serial endpoint, got {other}"
                )))
            }
        };
        let open_path = path.clone();
        let port = tokio::task::spawn_blocking(move || open_port(&open_path))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))??;
        let reader = port
            .try_clone()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let shared = Arc::new(Shared {
            board: Mutex::new(Board::default()),
            closing: AtomicBool::new(false),
        });
        spawn_reader(reader, shared.clone(), events);

        // Dropping the client on the error path below stops the reader.
        let client = FirmataClient {
            endpoint: endpoint.clone(),
            writer: Arc::new(Mutex::new(port)),
            _reader: ReaderGuard(shared.clone()),
            shared,
        };
        client
            .send(vec![START_SYSEX, REPORT_FIRMWARE, END_SYSEX])
            .await?;
        Ok(Arc::new(client))
    }
}

fn open_port(path: &str) -> Result<Box<dyn SerialPort>> {
    serialport::new(path, BAUD_RATE)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => {
                TransportError::NotFound(format!("cannot open {path}: {e}"))
            }
            serialport::ErrorKind::Io(kind) => {
                TransportError::from_open(&format!("cannot open {path}"), &kind.into())
            }
            _ => TransportError::Io(format!("cannot open {path}: {e}")),
        })
}

fn spawn_reader(mut port: Box<dyn SerialPort>, shared: Arc<Shared>, events: EventSink) {
    thread::spawn(move || {
        let mut parser = FirmataParser::new();
        let mut buf = [0u8; 256];
        loop {
            if shared.closing.load(Ordering::SeqCst) {
                break;
            }
            match port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    for frame in parser.feed(&buf[..n]) {
                        shared.handle(frame, &events);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    if !shared.closing.load(Ordering::SeqCst) {
                        warn!(error = %e, "serial read failed");
                        let _ = events.send(DeviceEvent::Disconnected);
                    }
                    break;
                }
            }
        }
    });
}

/// Shorter pulses are raised to the floor.
fn servo_pulse(pulse_us: u32) -> u32 {
    pulse_us.max(SERVO_MIN_PULSE_US)
}

/// Ends the reader thread when the client that owns it goes away.
struct ReaderGuard(Arc<Shared>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.closing.store(true, Ordering::SeqCst);
    }
}

/// A Firmata board on one serial port.
pub struct FirmataClient {
    endpoint: Endpoint,
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    shared: Arc<Shared>,
    _reader: ReaderGuard,
}

impl FirmataClient {
    async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut port = writer.lock().unwrap_or_else(PoisonError::into_inner);
            port.write_all(&bytes)?;
            port.flush()
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
        .map_err(TransportError::from)
    }
}

#[async_trait]
impl DeviceClient for FirmataClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn set_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        if mode == PinMode::Analog {
            // Analog channels are in analog mode after reset; the pin number is the channel.
            return Ok(());
        }
        self.send(encode_set_mode(pin, mode)?).await
    }

    async fn set_pull(&self, pin: u32, pull: Pull) -> Result<()> {
        match pull {
            Pull::Off => Ok(()),
            Pull::Up => self.set_mode(pin, PinMode::InputPullUp).await,
            Pull::Down => Err(TransportError::Unsupported("pull-down on firmata")),
        }
    }

    async fn read(&self, pin: u32) -> Result<u32> {
        let board = self.shared.board();
        if board.analog_subs.contains(&pin) {
            return board
                .analog
                .get(&pin)
                .copied()
                .ok_or_else(|| TransportError::Protocol(format!("no report for A{pin} yet")));
        }
        let port = (pin / 8) as usize;
        match board.ports.get(port) {
            Some(mask) => Ok(u32::from((mask >> (pin % 8)) & 1)),
            None => Err(TransportError::Protocol(format!("pin {pin} out of range"))),
        }
    }

    async fn subscribe(&self, pin: u32, kind: ReportKind) -> Result<()> {
        let msg = match kind {
            ReportKind::Digital => {
                self.shared.board().digital_subs.insert(pin);
                vec![REPORT_DIGITAL | ((pin / 8) as u8 & 0x0F), 1]
            }
            ReportKind::Analog => {
                self.shared.board().analog_subs.insert(pin);
                vec![REPORT_ANALOG | (pin as u8 & 0x0F), 1]
            }
        };
        self.send(msg).await
    }

    async fn unsubscribe(&self, pin: u32) -> Result<()> {
        let msg = {
            let mut board = self.shared.board();
            board.digital_subs.remove(&pin);
            if board.analog_subs.remove(&pin) {
                Some(vec![REPORT_ANALOG | (pin as u8 & 0x0F), 0])
            } else {
                // Other pins on the same port may still be reporting.
                None
            }
        };
        match msg {
            Some(bytes) => self.send(bytes).await,
            None => Ok(()),
        }
    }

    async fn write(&self, pin: u32, high: bool) -> Result<()> {
        self.send(encode_digital_write(pin, high)?).await
    }

    async fn write_pwm(&self, pin: u32, duty: u8) -> Result<()> {
        self.send(encode_analog_write(pin, u32::from(duty))?).await
    }

    async fn write_servo(&self, pin: u32, pulse_us: u32) -> Result<()> {
        self.send(encode_analog_write(pin, servo_pulse(pulse_us))?).await
    }

    async fn send_raw(&self, cmd: RawCommand) -> Result<()> {
        let bytes = match cmd {
            RawCommand::Text(text) => encode_string(&text),
            RawCommand::Sysex(body) => encode_sysex(&body)?,
        };
        self.send(bytes).await
    }

    async fn close(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn parses_digital_and_analog_reports() {
        let mut p = FirmataParser::new();
        let frames = p.feed(&[0x91, 0x05, 0x01, 0xE2, 0x7F, 0x07]);
        assert_eq!(
            frames,
            vec![
                Frame::Digital {
                    port: 1,
                    mask: 0x85
                },
                Frame::Analog {
                    channel: 2,
                    value: 1023
                },
            ]
        );
    }

    #[test]
    fn parses_split_firmware_report() {
        let mut p = FirmataParser::new();
        let mut bytes = vec![START_SYSEX, REPORT_FIRMWARE, 2, 5];
        encode_7bit_text("Std.ino", &mut bytes);
        bytes.push(END_SYSEX);
        let (a, b) = bytes.split_at(5);
        assert!(p.feed(a).is_empty());
        assert_eq!(
            p.feed(b),
            vec![Frame::Firmware {
                major: 2,
                minor: 5,
                name: "Std.ino".into()
            }]
        );
    }

    #[test]
    fn string_round_trips_through_sysex() {
        let mut p = FirmataParser::new();
        assert_eq!(p.feed(&encode_string("hi")), vec![Frame::Text("hi".into())]);
    }

    #[test]
    fn analog_write_switches_to_extended_form() {
        assert_eq!(encode_analog_write(3, 128).unwrap(), vec![0xE3, 0x00, 0x01]);
        assert_eq!(
            encode_analog_write(20, 1500).unwrap(),
            vec![START_SYSEX, EXTENDED_ANALOG, 20, 0x5C, 0x0B, 0x00, END_SYSEX]
        );
    }

    #[test]
    fn sysex_rejects_high_bytes() {
        assert!(encode_sysex(&[0x01, 0x80]).is_err());
        assert_eq!(encode_sysex(&[0x01]).unwrap(), vec![0xF0, 0x01, 0xF7]);
    }

    #[test]
    fn data_bytes_without_command_are_dropped() {
        let mut p = FirmataParser::new();
        assert!(p.feed(&[0x01, 0x02, 0xFF, 0x03]).is_empty());
    }

    #[test]
    fn digital_frame_fans_out_to_subscribed_pins() {
        let shared = Shared {
            board: Mutex::new(Board::default()),
            closing: AtomicBool::new(false),
        };
        shared.board().digital_subs.insert(9);
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.handle(Frame::Digital { port: 1, mask: 0x02 }, &tx);
        assert_eq!(rx.try_recv().unwrap(), DeviceEvent::Level { pin: 9, level: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn servo_pulses_never_read_as_degrees() {
        assert_eq!(servo_pulse(500), 544);
        assert_eq!(servo_pulse(1500), 1500);
        assert_eq!(servo_pulse(2500), 2500);
    }

    #[test]
    fn dropped_client_stops_reader() {
        let shared = Arc::new(Shared {
            board: Mutex::new(Board::default()),
            closing: AtomicBool::new(false),
        });
        let guard = ReaderGuard(shared.clone());
        assert!(!shared.closing.load(Ordering::SeqCst));
        drop(guard);
        assert!(shared.closing.load(Ordering::SeqCst));
    }
}
