//! Client for the pigpio daemon's socket interface.
//!
//! Commands travel on one TCP connection as four little-endian `u32`s
//! (`cmd, p1, p2, p3`); the daemon echoes the header with the result in
//! the last word. Level changes arrive on a second connection switched to
//! notification mode, as 12-byte reports (`seqno u16, flags u16, tick u32,
//! levels u32`).

use crate::{
    Connector, DeviceClient, DeviceEvent, Endpoint, EventSink, PinMode, Pull, ReportKind, Result,
    TransportError,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CMD_MODES: u32 = 0;
const CMD_PUD: u32 = 2;
const CMD_READ: u32 = 3;
const CMD_WRITE: u32 = 4;
const CMD_PWM: u32 = 5;
const CMD_PFS: u32 = 7;
const CMD_SERVO: u32 = 8;
const CMD_BR1: u32 = 10;
const CMD_NB: u32 = 19;
const CMD_NC: u32 = 21;
const CMD_FG: u32 = 97;
const CMD_NOIB: u32 = 99;

const MODE_INPUT: u32 = 0;
const MODE_OUTPUT: u32 = 1;

const NTFY_FLAGS_EVENT: u16 = 1 << 7;
const NTFY_FLAGS_ALIVE: u16 = 1 << 6;
const NTFY_FLAGS_WDOG: u16 = 1 << 5;

/// Highest user GPIO on bank 1.
const MAX_GPIO: u32 = 31;

pub fn encode_command(cmd: u32, p1: u32, p2: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&cmd.to_le_bytes());
    buf[4..8].copy_from_slice(&p1.to_le_bytes());
    buf[8..12].copy_from_slice(&p2.to_le_bytes());
    buf
}

/// Result word of a response; negative values are pigpio error codes.
pub fn decode_response(cmd: u32, buf: &[u8; 16]) -> Result<u32> {
    let echoed = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if echoed != cmd {
        return Err(TransportError::Protocol(format!(
            "response for command {echoed}, expected {cmd}"
        )));
    }
    let res = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    if res < 0 {
        return Err(TransportError::Rejected {
            code: res,
            reason: error_text(res),
        });
    }
    Ok(res as u32)
}

fn error_text(code: i32) -> &'static str {
    match code {
        -2 => "bad user gpio",
        -3 => "bad gpio",
        -4 => "bad mode",
        -5 => "bad level",
        -6 => "bad pull",
        -7 => "bad pulsewidth",
        -8 => "bad dutycycle",
        -41 => "not permitted",
        -125 => "bad filter",
        _ => "pigpio error",
    }
}

/// One notification report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Report {
    pub seqno: u16,
    pub flags: u16,
    pub tick: u32,
    pub levels: u32,
}

impl Report {
    pub fn decode(buf: &[u8; 12]) -> Self {
        Self {
            seqno: u16::from_le_bytes([buf[0], buf[1]]),
            flags: u16::from_le_bytes([buf[2], buf[3]]),
            tick: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            levels: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    /// Keep-alive, watchdog and event reports carry no level change.
    pub fn is_level_change(&self) -> bool {
        self.flags & (NTFY_FLAGS_EVENT | NTFY_FLAGS_ALIVE | NTFY_FLAGS_WDOG) == 0
    }
}

/// Pins in `mask` whose level differs between `before` and `after`.
pub fn changed_pins(before: u32, after: u32, mask: u32) -> impl Iterator<Item = (u32, u32)> {
    let diff = (before ^ after) & mask;
    (0..=MAX_GPIO)
        .filter(move |pin| diff & (1 << pin) != 0)
        .map(move |pin| (pin, (after >> pin) & 1))
}

fn gpio(pin: u32) -> Result<u32> {
    if pin <= MAX_GPIO {
        Ok(pin)
    } else {
        Err(TransportError::Rejected {
            code: -3,
            reason: error_text(-3),
        })
    }
}

/// Opens connections to a pigpio daemon.
#[derive(Clone, Copy, Debug, Default)]
pub struct PigpiodConnector;

#[async_trait]
impl Connector for PigpiodConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        events: EventSink,
    ) -> Result<Arc<dyn DeviceClient>> {
        let (host, port) = match endpoint {
            Endpoint::GpioDaemon { host, port } => (host.clone(), *port),
            other => {
                return Err(TransportError::Protocol(format!(
                    "pigpiod needs a host:port endpoint, got {other}"
                )))
            }
        };
        let addr = format!("{host}:{port}");
        let command = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::from_open(&addr, &e))?;
        command.set_nodelay(true).ok();
        let mut notify = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::from_open(&addr, &e))?;

        let handle = request(&mut notify, CMD_NOIB, 0, 0).await?;
        let (notify_rx, notify_tx) = notify.into_split();

        let client = Arc::new(PigpiodClient {
            endpoint: endpoint.clone(),
            command: Mutex::new(command),
            notify_tx: Mutex::new(Some(notify_tx)),
            handle,
            mask: AtomicU32::new(0),
            closing: Arc::new(AtomicBool::new(false)),
        });
        let levels = client.command(CMD_BR1, 0, 0).await?;
        spawn_listener(notify_rx, client.clone(), levels, events.clone());

        debug!(%addr, handle, "pigpiod connected");
        let _ = events.send(DeviceEvent::Ready);
        Ok(client)
    }
}

async fn request(stream: &mut TcpStream, cmd: u32, p1: u32, p2: u32) -> Result<u32> {
    stream.write_all(&encode_command(cmd, p1, p2)).await?;
    let mut buf = [0u8; 16];
    stream.read_exact(&mut buf).await?;
    decode_response(cmd, &buf)
}

fn spawn_listener(
    mut rx: OwnedReadHalf,
    client: Arc<PigpiodClient>,
    mut last: u32,
    events: EventSink,
) {
    let closing = client.closing.clone();
    let weak = Arc::downgrade(&client);
    drop(client);
    tokio::spawn(async move {
        let mut buf = [0u8; 12];
        loop {
            if let Err(e) = rx.read_exact(&mut buf).await {
                if !closing.load(Ordering::SeqCst) {
                    warn!(error = %e, "pigpiod notification stream ended");
                    let _ = events.send(DeviceEvent::Disconnected);
                }
                break;
            }
            let report = Report::decode(&buf);
            if !report.is_level_change() {
                continue;
            }
            let mask = match weak.upgrade() {
                Some(client) => client.mask.load(Ordering::SeqCst),
                None => break,
            };
            for (pin, level) in changed_pins(last, report.levels, mask) {
                let _ = events.send(DeviceEvent::Level { pin, level });
            }
            last = report.levels;
        }
    });
}

/// A pigpio daemon connection.
pub struct PigpiodClient {
    endpoint: Endpoint,
    command: Mutex<TcpStream>,
    notify_tx: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    handle: u32,
    mask: AtomicU32,
    closing: Arc<AtomicBool>,
}

impl PigpiodClient {
    async fn command(&self, cmd: u32, p1: u32, p2: u32) -> Result<u32> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut stream = self.command.lock().await;
        request(&mut stream, cmd, p1, p2).await
    }
}

#[async_trait]
impl DeviceClient for PigpiodClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn set_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        let code = match mode {
            PinMode::Input => MODE_INPUT,
            PinMode::InputPullUp => {
                self.command(CMD_MODES, gpio(pin)?, MODE_INPUT).await?;
                return self.set_pull(pin, Pull::Up).await;
            }
            PinMode::Output | PinMode::Pwm | PinMode::Servo => MODE_OUTPUT,
            PinMode::Analog => return Err(TransportError::Unsupported("analog input on pigpio")),
        };
        self.command(CMD_MODES, gpio(pin)?, code).await.map(|_| ())
    }

    async fn set_pull(&self, pin: u32, pull: Pull) -> Result<()> {
        let code = match pull {
            Pull::Off => 0,
            Pull::Down => 1,
            Pull::Up => 2,
        };
        self.command(CMD_PUD, gpio(pin)?, code).await.map(|_| ())
    }

    async fn set_glitch_filter(&self, pin: u32, micros: u32) -> Result<()> {
        self.command(CMD_FG, gpio(pin)?, micros).await.map(|_| ())
    }

    async fn set_pwm_frequency(&self, pin: u32, hz: u32) -> Result<u32> {
        self.command(CMD_PFS, gpio(pin)?, hz).await
    }

    async fn read(&self, pin: u32) -> Result<u32> {
        self.command(CMD_READ, gpio(pin)?, 0).await
    }

    async fn subscribe(&self, pin: u32, kind: ReportKind) -> Result<()> {
        if kind == ReportKind::Analog {
            return Err(TransportError::Unsupported("analog input on pigpio"));
        }
        let mask = self.mask.fetch_or(1 << gpio(pin)?, Ordering::SeqCst) | (1 << pin);
        self.command(CMD_NB, self.handle, mask).await.map(|_| ())
    }

    async fn unsubscribe(&self, pin: u32) -> Result<()> {
        let mask = self.mask.fetch_and(!(1 << gpio(pin)?), Ordering::SeqCst) & !(1 << pin);
        self.command(CMD_NB, self.handle, mask).await.map(|_| ())
    }

    async fn write(&self, pin: u32, high: bool) -> Result<()> {
        self.command(CMD_WRITE, gpio(pin)?, u32::from(high))
            .await
            .map(|_| ())
    }

    async fn write_pwm(&self, pin: u32, duty: u8) -> Result<()> {
        self.command(CMD_PWM, gpio(pin)?, u32::from(duty))
            .await
            .map(|_| ())
    }

    async fn write_servo(&self, pin: u32, pulse_us: u32) -> Result<()> {
        self.command(CMD_SERVO, gpio(pin)?, pulse_us)
            .await
            .map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut stream = self.command.lock().await;
            let _ = request(&mut stream, CMD_NC, self.handle, 0).await;
            let _ = stream.shutdown().await;
        }
        if let Some(mut tx) = self.notify_tx.lock().await.take() {
            let _ = tx.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn response(cmd: u32, res: i32) -> [u8; 16] {
        let mut buf = encode_command(cmd, 0, 0);
        buf[12..16].copy_from_slice(&res.to_le_bytes());
        buf
    }

    #[test]
    fn negative_result_is_rejection() {
        let err = decode_response(CMD_PWM, &response(CMD_PWM, -8)).unwrap_err();
        assert_eq!(
            err,
            TransportError::Rejected {
                code: -8,
                reason: "bad dutycycle"
            }
        );
        assert_eq!(decode_response(CMD_PFS, &response(CMD_PFS, 800)).unwrap(), 800);
        assert!(decode_response(CMD_PFS, &response(CMD_PWM, 0)).is_err());
    }

    #[test]
    fn only_masked_changes_are_reported() {
        let before = 0b0000_0000;
        let after = 0b1000_0110;
        let mask = (1 << 2) | (1 << 7);
        let changed: Vec<_> = changed_pins(before, after, mask).collect();
        assert_eq!(changed, vec![(2, 1), (7, 1)]);
    }

    #[test]
    fn keepalive_reports_are_skipped() {
        let mut buf = [0u8; 12];
        buf[2..4].copy_from_slice(&NTFY_FLAGS_ALIVE.to_le_bytes());
        assert!(!Report::decode(&buf).is_level_change());
        assert!(Report::decode(&[0u8; 12]).is_level_change());
    }

    #[tokio::test]
    async fn refused_connection_is_benign() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = PigpiodConnector
            .connect(&Endpoint::gpio_daemon("127.0.0.1", port), tx)
            .await
            .err()
            .unwrap();
        assert!(err.is_benign(), "{err}");
    }

    #[tokio::test]
    async fn talks_to_a_fake_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let daemon = tokio::spawn(async move {
            let (mut cmd, _) = listener.accept().await.unwrap();
            let (mut notify, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            notify.read_exact(&mut buf).await.unwrap();
            notify.write_all(&response(CMD_NOIB, 0)).await.unwrap();
            let mut seen = Vec::new();
            loop {
                if cmd.read_exact(&mut buf).await.is_err() {
                    break;
                }
                let op = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                seen.push(op);
                cmd.write_all(&response(op, 0)).await.unwrap();
                if op == CMD_NB {
                    let mut report = [0u8; 12];
                    report[8..12].copy_from_slice(&(1u32 << 17).to_le_bytes());
                    notify.write_all(&report).await.unwrap();
                }
                if op == CMD_NC {
                    break;
                }
            }
            seen
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = PigpiodConnector
            .connect(&Endpoint::gpio_daemon("127.0.0.1", port), tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(DeviceEvent::Ready));
        client.set_mode(17, PinMode::Input).await.unwrap();
        client.subscribe(17, ReportKind::Digital).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(DeviceEvent::Level { pin: 17, level: 1 })
        );
        client.close().await.unwrap();
        client.close().await.unwrap();

        let seen = daemon.await.unwrap();
        assert_eq!(seen, vec![CMD_BR1, CMD_MODES, CMD_NB, CMD_NC]);
    }
}
